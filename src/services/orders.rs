use crate::{
    auth::AuthUser,
    config::OrderConfig,
    entities::{
        order::{
            self, Entity as OrderEntity, Model as OrderModel, OrderStatus, PaymentMethod,
            PaymentStatus, ShippingAddress, ShippingDetails, StatusHistory,
        },
        order_item::{self, Entity as OrderItemEntity, Model as OrderItemModel},
        product::Entity as ProductEntity,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        carts::{self, cart_subtotal},
        coupons::{coupon_discount, CouponService},
        order_status::{transition_in_txn, StatusUpdate},
        payments::{PaymentHandoff, PaymentService},
    },
};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\+?[0-9][0-9 -]{5,18}[0-9]$").expect("valid regex")
});

fn validate_phone(phone: &str) -> Result<(), ValidationError> {
    if PHONE_RE.is_match(phone.trim()) {
        Ok(())
    } else {
        Err(ValidationError::new("phone"))
    }
}

/// Delivery contact captured at checkout
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ShippingAddressInput {
    #[validate(length(min = 1, max = 200, message = "Name is required"))]
    pub name: String,
    #[validate(email(message = "A valid email is required"))]
    pub email: String,
    #[validate(
        length(min = 7, max = 20, message = "A valid phone number is required"),
        custom = "validate_phone"
    )]
    pub phone: String,
    #[validate(length(min = 1, max = 500, message = "Address is required"))]
    pub address: String,
    #[validate(length(min = 1, max = 100, message = "City is required"))]
    pub city: String,
    #[serde(default)]
    pub postal_code: Option<String>,
}

impl From<ShippingAddressInput> for ShippingAddress {
    fn from(input: ShippingAddressInput) -> Self {
        Self {
            name: input.name.trim().to_string(),
            email: input.email.trim().to_lowercase(),
            phone: input.phone.trim().to_string(),
            address: input.address.trim().to_string(),
            city: input.city.trim().to_string(),
            postal_code: input
                .postal_code
                .map(|code| code.trim().to_string())
                .filter(|code| !code.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderInput {
    #[validate]
    pub shipping_address: ShippingAddressInput,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub coupon_id: Option<Uuid>,
    #[serde(default)]
    pub discount: Option<Decimal>,
    #[serde(default)]
    pub shipping_details: Option<ShippingDetails>,
}

/// Who placed an order, as shown alongside it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerSummary {
    pub id: String,
    pub name: String,
    pub email: String,
}

impl From<&OrderModel> for CustomerSummary {
    fn from(order: &OrderModel) -> Self {
        Self {
            id: order.user_id.clone(),
            name: order.shipping_address.name.clone(),
            email: order.shipping_address.email.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDetails {
    pub order: OrderModel,
    pub items: Vec<OrderItemModel>,
    pub customer: CustomerSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentHandoff>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderTracking {
    pub order_number: String,
    pub status: OrderStatus,
    pub status_history: StatusHistory,
    pub tracking_number: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OrderPage {
    pub orders: Vec<OrderModel>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
}

/// Money columns of a new order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub shipping_fee: Decimal,
    pub total_amount: Decimal,
}

impl OrderTotals {
    pub fn new(subtotal: Decimal, discount: Decimal, shipping_fee: Decimal) -> Self {
        Self {
            subtotal,
            discount,
            shipping_fee,
            total_amount: subtotal - discount + shipping_fee,
        }
    }
}

/// Shipping fee used when checkout did not carry a quote
pub fn default_shipping_fee(subtotal: Decimal, config: &OrderConfig) -> Decimal {
    if subtotal >= config.free_shipping_threshold {
        Decimal::ZERO
    } else {
        config.default_shipping_fee
    }
}

/// `ORD-<base36 millis>-<4 hex>`, uppercase
pub fn generate_order_number(now: DateTime<Utc>) -> String {
    let suffix: u16 = rand::thread_rng().gen();
    format!(
        "ORD-{}-{:04X}",
        to_base36(now.timestamp_millis().max(0) as u64),
        suffix
    )
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Looks an order up by UUID or by order number
pub async fn find_order<C: ConnectionTrait>(
    conn: &C,
    key: &str,
) -> Result<Option<OrderModel>, ServiceError> {
    let key = key.trim();
    let query = match Uuid::parse_str(key) {
        Ok(id) => OrderEntity::find_by_id(id),
        Err(_) => OrderEntity::find().filter(order::Column::OrderNumber.eq(key.to_uppercase())),
    };
    Ok(query.one(conn).await?)
}

/// Checkout and order history for customers
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    coupons: CouponService,
    payments: PaymentService,
    config: OrderConfig,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: EventSender,
        coupons: CouponService,
        payments: PaymentService,
        config: OrderConfig,
    ) -> Self {
        Self {
            db,
            event_sender,
            coupons,
            payments,
            config,
        }
    }

    /// Converts the user's cart into an order.
    ///
    /// Everything from the order insert to emptying the cart happens in one
    /// transaction. Stock is taken later, when payment is confirmed.
    #[instrument(skip(self, user, input), fields(user_id = %user.user_id))]
    pub async fn create_order(
        &self,
        user: &AuthUser,
        input: CreateOrderInput,
    ) -> Result<OrderDetails, ServiceError> {
        input.validate()?;

        let requested_discount = input.discount.unwrap_or(Decimal::ZERO);
        if requested_discount < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Discount cannot be negative".to_string(),
            ));
        }
        if let Some(details) = &input.shipping_details {
            if details.shipping_fee.is_some_and(|fee| fee < Decimal::ZERO) {
                return Err(ServiceError::ValidationError(
                    "Shipping fee cannot be negative".to_string(),
                ));
            }
        } else if self.config.require_shipping_quote {
            return Err(ServiceError::ValidationError(
                "A shipping quote is required to place an order".to_string(),
            ));
        }

        let txn = self.db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for order creation");
            ServiceError::DatabaseError(e)
        })?;

        let cart = carts::find_cart(&txn, &user.user_id)
            .await?
            .ok_or(ServiceError::EmptyCart)?;
        let cart_items = carts::load_items(&txn, cart.id).await?;
        if cart_items.is_empty() {
            return Err(ServiceError::EmptyCart);
        }

        let subtotal = cart_subtotal(&cart_items);
        if requested_discount > subtotal {
            return Err(ServiceError::ValidationError(
                "Discount cannot exceed the order subtotal".to_string(),
            ));
        }

        // only a coupon that still evaluates is attached to the order
        let (discount, applied_coupon) = match input.coupon_id {
            Some(coupon_id) => match coupon_discount(&txn, coupon_id, subtotal).await {
                Ok(allowed) if requested_discount > allowed => {
                    warn!(%coupon_id, %requested_discount, %allowed, "discount capped to coupon value");
                    (allowed, Some(coupon_id))
                }
                Ok(_) => (requested_discount, Some(coupon_id)),
                Err(e) => {
                    warn!(%coupon_id, "coupon re-evaluation failed, no discount applied: {}", e);
                    (Decimal::ZERO, None)
                }
            },
            None => (requested_discount, None),
        };

        let shipping_fee = input
            .shipping_details
            .as_ref()
            .and_then(|details| details.shipping_fee)
            .unwrap_or_else(|| default_shipping_fee(subtotal, &self.config));
        let shipping_details = input.shipping_details.map(|mut details| {
            details.shipping_fee = Some(shipping_fee);
            details
        });
        let totals = OrderTotals::new(subtotal, discount, shipping_fee);
        let total_items: i32 = cart_items.iter().map(|item| item.quantity).sum();

        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(generate_order_number(now)),
            user_id: Set(user.user_id.clone()),
            shipping_address: Set(input.shipping_address.into()),
            payment_method: Set(input.payment_method),
            payment_status: Set(PaymentStatus::Pending),
            payment_reference: Set(None),
            paid_at: Set(None),
            subtotal: Set(totals.subtotal),
            shipping_fee: Set(totals.shipping_fee),
            shipping_details: Set(shipping_details),
            discount: Set(totals.discount),
            coupon_id: Set(applied_coupon),
            total_amount: Set(totals.total_amount),
            total_items: Set(total_items),
            status: Set(OrderStatus::Pending),
            status_history: Set(StatusHistory::starting_at(OrderStatus::Pending, now)),
            tracking_number: Set(None),
            cancel_reason: Set(None),
            cancelled_at: Set(None),
            delivered_at: Set(None),
            stock_deducted: Set(false),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            error!(error = %e, %order_id, "Failed to create order in database");
            ServiceError::DatabaseError(e)
        })?;

        let mut items = Vec::with_capacity(cart_items.len());
        for cart_item in &cart_items {
            let product = ProductEntity::find_by_id(cart_item.product_id)
                .one(&txn)
                .await?;
            let (product_name, product_image) = match &product {
                Some(product) => (product.name.clone(), product.primary_image()),
                None => (cart_item.product_id.to_string(), None),
            };

            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(cart_item.product_id),
                product_name: Set(product_name),
                product_image: Set(product_image),
                size: Set(cart_item.size.clone()),
                color: Set(cart_item.color.clone()),
                price: Set(cart_item.price),
                quantity: Set(cart_item.quantity),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
            items.push(item);
        }

        carts::clear_in_txn(&txn, cart).await?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, %order_id, "Failed to commit order creation transaction");
            ServiceError::DatabaseError(e)
        })?;

        metrics::counter!("storefront.orders.created", 1, "payment_method" => order.payment_method.to_string());
        info!(%order_id, order_number = %order.order_number, total = %order.total_amount, "Order created successfully");

        self.event_sender
            .send_or_log(Event::OrderCreated {
                order_id,
                order_number: order.order_number.clone(),
                user_id: order.user_id.clone(),
                total_amount: order.total_amount,
            })
            .await;

        if let Some(coupon_id) = order.coupon_id {
            self.coupons
                .record_usage_in_background(coupon_id, order_id, order.user_id.clone());
        }

        let payment = self.payments.handoff(&order).await;
        // the handoff may have stored the payment reference
        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .unwrap_or(order);

        Ok(OrderDetails {
            customer: CustomerSummary::from(&order),
            order,
            items,
            payment: Some(payment),
        })
    }

    /// Lists the user's orders, newest first
    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    pub async fn list_orders(
        &self,
        user: &AuthUser,
        page: u64,
        limit: u64,
        status: Option<OrderStatus>,
    ) -> Result<OrderPage, ServiceError> {
        let page = page.max(1);
        let limit = limit.max(1);

        let mut query = OrderEntity::find().filter(order::Column::UserId.eq(user.user_id.clone()));
        if let Some(status) = status {
            query = query.filter(order::Column::Status.eq(status));
        }

        let paginator = query
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, limit);

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page - 1).await?;

        Ok(OrderPage {
            orders,
            total,
            page,
            limit,
        })
    }

    /// Fetches an order with its items; owner or admin only
    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    pub async fn get_order(&self, user: &AuthUser, key: &str) -> Result<OrderDetails, ServiceError> {
        let order = self.accessible_order(user, key).await?;
        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        Ok(OrderDetails {
            customer: CustomerSummary::from(&order),
            order,
            items,
            payment: None,
        })
    }

    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    pub async fn track_order(&self, user: &AuthUser, key: &str) -> Result<OrderTracking, ServiceError> {
        let order = self.accessible_order(user, key).await?;
        Ok(OrderTracking {
            order_number: order.order_number,
            status: order.status,
            status_history: order.status_history,
            tracking_number: order.tracking_number,
            created_at: order.created_at,
        })
    }

    /// Cancels the user's own order while it is pending or confirmed.
    ///
    /// Stock taken at confirmation is returned in the same transaction.
    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    pub async fn cancel_order(
        &self,
        user: &AuthUser,
        key: &str,
        reason: Option<String>,
    ) -> Result<OrderModel, ServiceError> {
        let txn = self.db.begin().await?;

        let order = find_order(&txn, key)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", key)))?;
        if order.user_id != user.user_id {
            return Err(ServiceError::Forbidden(
                "You can only cancel your own orders".to_string(),
            ));
        }

        let update = StatusUpdate {
            status: OrderStatus::Cancelled,
            note: None,
            tracking_number: None,
            reason: reason
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty()),
        };
        let outcome = transition_in_txn(&txn, order, update).await?;
        txn.commit().await?;

        info!(order_id = %outcome.order.id, "Order cancelled by customer");
        for event in outcome.events {
            self.event_sender.send_or_log(event).await;
        }
        Ok(outcome.order)
    }

    async fn accessible_order(&self, user: &AuthUser, key: &str) -> Result<OrderModel, ServiceError> {
        let order = find_order(&*self.db, key)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", key)))?;
        if !user.can_access(&order.user_id) {
            return Err(ServiceError::Forbidden(
                "You do not have access to this order".to_string(),
            ));
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use regex::Regex;
    use rust_decimal_macros::dec;

    #[test]
    fn order_numbers_have_the_expected_shape() {
        let pattern = Regex::new(r"^ORD-[A-Z0-9]+-[A-F0-9]{4}$").unwrap();
        for _ in 0..50 {
            let number = generate_order_number(Utc::now());
            assert!(pattern.is_match(&number), "{}", number);
        }
    }

    #[test]
    fn base36_encoding() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "Z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1_295), "ZZ");
    }

    #[test]
    fn checkout_totals_for_the_reference_cart() {
        // 1 × 500 + 2 × 200, discount 100, shipping 50
        let totals = OrderTotals::new(dec!(900), dec!(100), dec!(50));
        assert_eq!(totals.total_amount, dec!(850));
    }

    #[test]
    fn shipping_is_free_from_the_threshold() {
        let config = OrderConfig::default();
        assert_eq!(default_shipping_fee(dec!(499.99), &config), dec!(50));
        assert_eq!(default_shipping_fee(dec!(500), &config), Decimal::ZERO);
    }

    #[test]
    fn shipping_address_is_validated() {
        let input: CreateOrderInput = serde_json::from_value(serde_json::json!({
            "shippingAddress": {
                "name": "Ama Mensah",
                "email": "not-an-email",
                "phone": "0241234567",
                "address": "12 Oxford St",
                "city": "Accra"
            },
            "paymentMethod": "cod"
        }))
        .unwrap();
        assert!(input.validate().is_err());
    }

    #[test]
    fn phone_numbers() {
        for ok in ["0241234567", "+233 24 123 4567", "024-123-4567"] {
            assert!(validate_phone(ok).is_ok(), "{}", ok);
        }
        for bad in ["call me", "024123456x", "+", "12345"] {
            assert!(validate_phone(bad).is_err(), "{}", bad);
        }
    }

    proptest! {
        #[test]
        fn total_is_subtotal_minus_discount_plus_shipping(
            subtotal in 0i64..1_000_000,
            discount_pct in 0i64..=100,
            shipping in 0i64..10_000,
        ) {
            let subtotal = Decimal::new(subtotal, 2);
            let discount = (subtotal * Decimal::new(discount_pct, 2)).round_dp(2);
            let shipping = Decimal::new(shipping, 2);
            let totals = OrderTotals::new(subtotal, discount, shipping);
            prop_assert_eq!(totals.total_amount + totals.discount, subtotal + shipping);
            prop_assert!(totals.total_amount >= shipping);
        }
    }
}
