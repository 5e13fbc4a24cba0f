use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Handle used by services to publish domain events.
///
/// Delivery is best-effort: the order pipeline never fails because the
/// event channel is full or closed.
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is gone
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("{}", e);
        }
    }
}

// Domain events emitted by the checkout pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Event {
    CartUpdated(Uuid),
    CartCleared(Uuid),

    OrderCreated {
        order_id: Uuid,
        order_number: String,
        user_id: String,
        total_amount: Decimal,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },
    OrderCancelled {
        order_id: Uuid,
        reason: Option<String>,
    },

    PaymentInitialized {
        order_id: Uuid,
        reference: String,
    },
    PaymentSucceeded {
        order_id: Uuid,
        reference: String,
        amount: Decimal,
    },
    PaymentFailed {
        order_id: Uuid,
        reference: String,
        reason: String,
    },

    StockAdjusted {
        product_id: Uuid,
        size: Option<String>,
        delta: i32,
    },
    CouponRedeemed {
        coupon_id: Uuid,
        order_id: Uuid,
    },
}

impl Event {
    /// Stable name used for logs and metrics labels
    pub fn name(&self) -> &'static str {
        match self {
            Event::CartUpdated(_) => "cart_updated",
            Event::CartCleared(_) => "cart_cleared",
            Event::OrderCreated { .. } => "order_created",
            Event::OrderStatusChanged { .. } => "order_status_changed",
            Event::OrderCancelled { .. } => "order_cancelled",
            Event::PaymentInitialized { .. } => "payment_initialized",
            Event::PaymentSucceeded { .. } => "payment_succeeded",
            Event::PaymentFailed { .. } => "payment_failed",
            Event::StockAdjusted { .. } => "stock_adjusted",
            Event::CouponRedeemed { .. } => "coupon_redeemed",
        }
    }

    /// Events that customers get a notification for
    pub fn is_customer_facing(&self) -> bool {
        matches!(
            self,
            Event::OrderCreated { .. }
                | Event::OrderStatusChanged { .. }
                | Event::OrderCancelled { .. }
                | Event::PaymentSucceeded { .. }
        )
    }
}

/// Drains the event channel. Notification delivery (email) lives outside
/// this service; the consumer records what would be sent.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        metrics::counter!("storefront.events", 1, "event" => event.name());

        match &event {
            Event::OrderCreated {
                order_id,
                order_number,
                user_id,
                total_amount,
            } => {
                info!(
                    %order_id,
                    %order_number,
                    %user_id,
                    %total_amount,
                    "order created; queueing confirmation notification"
                );
            }
            Event::PaymentFailed {
                order_id,
                reference,
                reason,
            } => {
                warn!(%order_id, %reference, %reason, "payment failed");
            }
            other if other.is_customer_facing() => {
                info!(event = other.name(), payload = ?other, "queueing customer notification");
            }
            other => {
                info!(event = other.name(), payload = ?other, "event processed");
            }
        }
    }

    info!("Event channel closed; stopping event processing loop");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_or_log_tolerates_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);
        sender.send_or_log(Event::CartCleared(Uuid::new_v4())).await;
        assert!(sender.send(Event::CartCleared(Uuid::new_v4())).await.is_err());
    }

    #[tokio::test]
    async fn events_reach_the_receiver() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        let order_id = Uuid::new_v4();
        sender
            .send_or_log(Event::OrderCancelled {
                order_id,
                reason: None,
            })
            .await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.name(), "order_cancelled");
        assert!(received.is_customer_facing());
    }
}
