use crate::{
    entities::{
        cart::{self, Entity as CartEntity},
        cart_item::{self, Entity as CartItemEntity, ItemColor},
        product::Entity as ProductEntity,
    },
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

/// Shopping cart service, one cart per user.
///
/// The cart row is created on the first add-to-cart. `total_amount` is a
/// cache that every item mutation recomputes inside the same transaction.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AddToCartInput {
    pub product_id: Uuid,
    #[validate(range(min = 1, max = 100))]
    pub quantity: i32,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub color: Option<ItemColor>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateCartItemInput {
    #[validate(range(max = 100))]
    pub quantity: i32,
}

/// Cart as returned to its owner
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartView {
    pub id: Option<Uuid>,
    pub items: Vec<cart_item::Model>,
    pub total_amount: Decimal,
    pub total_items: i32,
}

impl CartView {
    fn empty() -> Self {
        Self {
            id: None,
            items: Vec::new(),
            total_amount: Decimal::ZERO,
            total_items: 0,
        }
    }

    fn from_parts(cart: cart::Model, items: Vec<cart_item::Model>) -> Self {
        let total_items = items.iter().map(|item| item.quantity).sum();
        Self {
            id: Some(cart.id),
            total_amount: cart.total_amount,
            total_items,
            items,
        }
    }
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Returns the user's cart, or an empty view when none exists yet
    #[instrument(skip(self))]
    pub async fn get_cart(&self, user_id: &str) -> Result<CartView, ServiceError> {
        let Some(cart) = find_cart(&*self.db, user_id).await? else {
            return Ok(CartView::empty());
        };
        let items = load_items(&*self.db, cart.id).await?;
        Ok(CartView::from_parts(cart, items))
    }

    /// Adds a product to the cart, merging with an identical line if present.
    ///
    /// The unit price is captured from the product at this moment.
    #[instrument(skip(self, input), fields(product_id = %input.product_id))]
    pub async fn add_item(
        &self,
        user_id: &str,
        input: AddToCartInput,
    ) -> Result<CartView, ServiceError> {
        input.validate()?;
        let txn = self.db.begin().await?;

        let product = ProductEntity::find_by_id(input.product_id)
            .one(&txn)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", input.product_id))
            })?;

        let size = input
            .size
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        if !product.sizes.0.is_empty() {
            let chosen = size.as_deref().ok_or_else(|| {
                ServiceError::ValidationError(format!("A size is required for {}", product.name))
            })?;
            if !product
                .sizes
                .0
                .iter()
                .any(|entry| entry.size.eq_ignore_ascii_case(chosen))
            {
                return Err(ServiceError::ValidationError(format!(
                    "Size {} is not available for {}",
                    chosen, product.name
                )));
            }
        }

        let now = Utc::now();
        let cart = match find_cart(&txn, user_id).await? {
            Some(cart) => cart,
            None => {
                cart::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    user_id: Set(user_id.to_string()),
                    total_amount: Set(Decimal::ZERO),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&txn)
                .await?
            }
        };

        let existing = load_items(&txn, cart.id)
            .await?
            .into_iter()
            .find(|item| {
                item.product_id == product.id && item.size == size && item.color == input.color
            });

        match existing {
            Some(item) => {
                let quantity = item.quantity + input.quantity;
                let mut item: cart_item::ActiveModel = item.into();
                item.quantity = Set(quantity);
                item.updated_at = Set(now);
                item.update(&txn).await?;
            }
            None => {
                cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart.id),
                    product_id: Set(product.id),
                    quantity: Set(input.quantity),
                    size: Set(size),
                    color: Set(input.color),
                    price: Set(product.price),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&txn)
                .await?;
            }
        }

        let view = recalculate(&txn, cart).await?;
        txn.commit().await?;

        if let Some(cart_id) = view.id {
            self.event_sender
                .send_or_log(Event::CartUpdated(cart_id))
                .await;
        }
        info!(user_id, product_id = %product.id, quantity = input.quantity, "added item to cart");
        Ok(view)
    }

    /// Sets a line's quantity; anything below 1 removes the line
    #[instrument(skip(self))]
    pub async fn update_item(
        &self,
        user_id: &str,
        item_id: Uuid,
        input: UpdateCartItemInput,
    ) -> Result<CartView, ServiceError> {
        input.validate()?;
        let txn = self.db.begin().await?;
        let (cart, item) = owned_item(&txn, user_id, item_id).await?;

        if input.quantity < 1 {
            CartItemEntity::delete_by_id(item.id).exec(&txn).await?;
        } else {
            let mut item: cart_item::ActiveModel = item.into();
            item.quantity = Set(input.quantity);
            item.updated_at = Set(Utc::now());
            item.update(&txn).await?;
        }

        let cart_id = cart.id;
        let view = recalculate(&txn, cart).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartUpdated(cart_id))
            .await;
        Ok(view)
    }

    #[instrument(skip(self))]
    pub async fn remove_item(&self, user_id: &str, item_id: Uuid) -> Result<CartView, ServiceError> {
        let txn = self.db.begin().await?;
        let (cart, item) = owned_item(&txn, user_id, item_id).await?;

        CartItemEntity::delete_by_id(item.id).exec(&txn).await?;
        let view = recalculate(&txn, cart).await?;
        txn.commit().await?;

        if let Some(cart_id) = view.id {
            self.event_sender
                .send_or_log(Event::CartUpdated(cart_id))
                .await;
        }
        Ok(view)
    }

    /// Deletes every line and resets the cached total
    #[instrument(skip(self))]
    pub async fn clear_cart(&self, user_id: &str) -> Result<CartView, ServiceError> {
        let txn = self.db.begin().await?;
        let Some(cart) = find_cart(&txn, user_id).await? else {
            return Ok(CartView::empty());
        };

        let cart = clear_in_txn(&txn, cart).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartCleared(cart.id))
            .await;
        info!("Cleared cart: {}", cart.id);
        Ok(CartView::from_parts(cart, Vec::new()))
    }
}

pub(crate) async fn find_cart<C: ConnectionTrait>(
    conn: &C,
    user_id: &str,
) -> Result<Option<cart::Model>, ServiceError> {
    Ok(CartEntity::find()
        .filter(cart::Column::UserId.eq(user_id))
        .one(conn)
        .await?)
}

pub(crate) async fn load_items<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
) -> Result<Vec<cart_item::Model>, ServiceError> {
    Ok(CartItemEntity::find()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .order_by_asc(cart_item::Column::CreatedAt)
        .all(conn)
        .await?)
}

/// Deletes the cart's items and zeroes its total, used by checkout too
pub(crate) async fn clear_in_txn<C: ConnectionTrait>(
    conn: &C,
    cart: cart::Model,
) -> Result<cart::Model, ServiceError> {
    CartItemEntity::delete_many()
        .filter(cart_item::Column::CartId.eq(cart.id))
        .exec(conn)
        .await?;

    let mut cart: cart::ActiveModel = cart.into();
    cart.total_amount = Set(Decimal::ZERO);
    cart.updated_at = Set(Utc::now());
    Ok(cart.update(conn).await?)
}

/// Sum of price × quantity over the lines
pub fn cart_subtotal(items: &[cart_item::Model]) -> Decimal {
    items.iter().map(cart_item::Model::line_total).sum()
}

async fn owned_item<C: ConnectionTrait>(
    conn: &C,
    user_id: &str,
    item_id: Uuid,
) -> Result<(cart::Model, cart_item::Model), ServiceError> {
    let not_found = || ServiceError::NotFound(format!("Cart item {} not found", item_id));
    let cart = find_cart(conn, user_id).await?.ok_or_else(not_found)?;
    let item = CartItemEntity::find_by_id(item_id)
        .one(conn)
        .await?
        .filter(|item| item.cart_id == cart.id)
        .ok_or_else(not_found)?;
    Ok((cart, item))
}

async fn recalculate<C: ConnectionTrait>(
    conn: &C,
    cart: cart::Model,
) -> Result<CartView, ServiceError> {
    let items = load_items(conn, cart.id).await?;

    let mut active: cart::ActiveModel = cart.into();
    active.total_amount = Set(cart_subtotal(&items));
    active.updated_at = Set(Utc::now());
    let cart = active.update(conn).await?;

    Ok(CartView::from_parts(cart, items))
}
