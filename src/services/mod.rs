// Checkout pipeline services
pub mod carts;
pub mod coupons;
pub mod inventory;
pub mod orders;
pub mod payments;
pub mod shipping;

// Status helpers shared by cancellation, payment and admin fulfilment
pub mod order_status;
