use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryFilter, TransactionTrait,
};
use serde::Deserialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::order::{
        ActiveModel as OrderActiveModel, Entity as OrderEntity, Model as OrderModel, OrderStatus,
    },
    entities::order_item::{self, Entity as OrderItemEntity},
    errors::ServiceError,
    events::{Event, EventSender},
    services::inventory,
};

/// Validates if a status transition is allowed
pub fn is_valid_transition(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;

    matches!(
        (from, to),
        (Pending, Confirmed)
            | (Confirmed, Shipped)
            | (Shipped, Delivered)
            | (Pending, Cancelled)
            | (Confirmed, Cancelled)
    )
}

pub fn ensure_transition(from: OrderStatus, to: OrderStatus) -> Result<(), ServiceError> {
    if is_valid_transition(from, to) {
        Ok(())
    } else {
        Err(ServiceError::invalid_transition(from, to))
    }
}

/// Requested status change plus the optional data that goes with it
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub status: OrderStatus,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub tracking_number: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl StatusUpdate {
    pub fn to(status: OrderStatus) -> Self {
        Self {
            status,
            note: None,
            tracking_number: None,
            reason: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Result of a transition, with the events to publish once committed
#[derive(Debug)]
pub struct TransitionOutcome {
    pub order: OrderModel,
    pub previous: OrderStatus,
    pub events: Vec<Event>,
}

/// Moves an order to a new status inside the caller's transaction.
///
/// Confirming takes stock for every line (once); cancelling an order whose
/// stock was taken gives it back. Stock moves run in a savepoint so a
/// shortage leaves the order and the products untouched.
pub async fn transition_in_txn(
    txn: &DatabaseTransaction,
    order: OrderModel,
    update: StatusUpdate,
) -> Result<TransitionOutcome, ServiceError> {
    let previous = order.status;
    let target = update.status;
    ensure_transition(previous, target)?;

    let mut events = Vec::new();
    let mut stock_deducted = order.stock_deducted;

    let stock_delta_sign = match target {
        OrderStatus::Confirmed if !order.stock_deducted => Some(-1),
        OrderStatus::Cancelled if order.stock_deducted => Some(1),
        _ => None,
    };

    if let Some(sign) = stock_delta_sign {
        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .all(txn)
            .await?;

        let savepoint = txn.begin().await?;
        let moved = if sign < 0 {
            inventory::deduct_for_items(&savepoint, &items).await
        } else {
            inventory::restore_for_items(&savepoint, &items).await
        };
        match moved {
            Ok(()) => savepoint.commit().await?,
            Err(e) => {
                savepoint.rollback().await?;
                return Err(e);
            }
        }

        stock_deducted = sign < 0;
        events.extend(items.iter().map(|item| Event::StockAdjusted {
            product_id: item.product_id,
            size: item.size.clone(),
            delta: sign * item.quantity,
        }));
    }

    let now = Utc::now();
    let note = update.note.clone().or_else(|| update.reason.clone());
    let history = order.status_history.appended(target, now, note);
    let order_id = order.id;
    let version = order.version;

    let mut active: OrderActiveModel = order.into();
    active.status = Set(target);
    active.status_history = Set(history);
    active.stock_deducted = Set(stock_deducted);
    active.updated_at = Set(now);
    active.version = Set(version + 1);

    match target {
        OrderStatus::Shipped => {
            if let Some(tracking) = update.tracking_number.filter(|t| !t.trim().is_empty()) {
                active.tracking_number = Set(Some(tracking));
            }
        }
        OrderStatus::Delivered => active.delivered_at = Set(Some(now)),
        OrderStatus::Cancelled => {
            active.cancelled_at = Set(Some(now));
            events.push(Event::OrderCancelled {
                order_id,
                reason: update.reason.clone(),
            });
            active.cancel_reason = Set(update.reason);
        }
        _ => {}
    }

    let updated = active.update(txn).await?;
    events.push(Event::OrderStatusChanged {
        order_id,
        old_status: previous.to_string(),
        new_status: target.to_string(),
    });

    Ok(TransitionOutcome {
        order: updated,
        previous,
        events,
    })
}

/// Admin-driven fulfilment transitions
#[derive(Clone)]
pub struct OrderStatusService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl OrderStatusService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Updates the status of an order with validation
    #[instrument(skip(self, update), fields(order_id = %order_id, new_status = %update.status))]
    pub async fn update_status(
        &self,
        order_id: Uuid,
        update: StatusUpdate,
    ) -> Result<OrderModel, ServiceError> {
        let txn = self.db.begin().await.map_err(|e| {
            error!("Failed to begin transaction: {}", e);
            ServiceError::DatabaseError(e)
        })?;

        let order = OrderEntity::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let outcome = transition_in_txn(&txn, order, update).await.map_err(|e| {
            warn!("Status update for order {} rejected: {}", order_id, e);
            e
        })?;

        txn.commit().await.map_err(|e| {
            error!("Failed to commit transaction for order {}: {}", order_id, e);
            ServiceError::DatabaseError(e)
        })?;

        info!(
            "Order {} status updated from '{}' to '{}'",
            order_id, outcome.previous, outcome.order.status
        );

        for event in outcome.events {
            self.event_sender.send_or_log(event).await;
        }

        Ok(outcome.order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use OrderStatus::*;

    #[rstest]
    #[case(Pending, Confirmed)]
    #[case(Confirmed, Shipped)]
    #[case(Shipped, Delivered)]
    #[case(Pending, Cancelled)]
    #[case(Confirmed, Cancelled)]
    fn allowed_transitions(#[case] from: OrderStatus, #[case] to: OrderStatus) {
        assert!(is_valid_transition(from, to));
        assert!(ensure_transition(from, to).is_ok());
    }

    #[rstest]
    #[case(Shipped, Cancelled)]
    #[case(Delivered, Cancelled)]
    #[case(Cancelled, Confirmed)]
    #[case(Pending, Shipped)]
    #[case(Pending, Delivered)]
    #[case(Delivered, Shipped)]
    #[case(Pending, Pending)]
    fn rejected_transitions(#[case] from: OrderStatus, #[case] to: OrderStatus) {
        assert!(!is_valid_transition(from, to));
        assert!(matches!(
            ensure_transition(from, to),
            Err(ServiceError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for to in [Pending, Confirmed, Shipped, Delivered, Cancelled] {
            assert!(!is_valid_transition(Delivered, to));
            assert!(!is_valid_transition(Cancelled, to));
        }
    }

    #[test]
    fn status_update_parses_camel_case() {
        let update: StatusUpdate = serde_json::from_value(serde_json::json!({
            "status": "shipped",
            "trackingNumber": "GH123"
        }))
        .unwrap();
        assert_eq!(update.status, Shipped);
        assert_eq!(update.tracking_number.as_deref(), Some("GH123"));
    }
}
