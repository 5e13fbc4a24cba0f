//! SeaORM entities for the checkout pipeline.

pub mod cart;
pub mod cart_item;
pub mod coupon;
pub mod coupon_usage;
pub mod order;
pub mod order_item;
pub mod product;

pub use order::{OrderStatus, PaymentMethod, PaymentStatus};
