pub mod carts;
pub mod common;
pub mod coupons;
pub mod health;
pub mod orders;
pub mod payments;
pub mod shipping;

use crate::{
    config::AppConfig,
    errors::ServiceError,
    events::EventSender,
    services::{
        carts::CartService,
        coupons::CouponService,
        order_status::OrderStatusService,
        orders::OrderService,
        payments::{PaymentGateway, PaymentService, PaystackGateway},
        shipping::{
            carrier::{Carrier, YangoCarrier},
            geocoding::{Geocoder, NominatimGeocoder},
            ShippingQuoteService,
        },
    },
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Outbound HTTP integrations, swappable in tests
#[derive(Clone)]
pub struct Integrations {
    pub geocoder: Arc<dyn Geocoder>,
    pub carrier: Arc<dyn Carrier>,
    pub payment_gateway: Arc<dyn PaymentGateway>,
}

impl Integrations {
    /// Builds the Nominatim, Yango and Paystack clients from configuration
    pub fn from_config(config: &AppConfig) -> Result<Self, ServiceError> {
        let shipping = &config.shipping;
        Ok(Self {
            geocoder: Arc::new(NominatimGeocoder::new(
                shipping.geocoder_url.clone(),
                &shipping.geocoder_user_agent,
                shipping.geocoder_timeout(),
            )?),
            carrier: Arc::new(YangoCarrier::new(
                shipping.carrier_url.clone(),
                shipping.carrier_api_key.clone(),
                shipping.carrier_timeout(),
            )?),
            payment_gateway: Arc::new(PaystackGateway::from_config(&config.paystack)?),
        })
    }
}

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub shipping: Arc<ShippingQuoteService>,
    pub carts: Arc<CartService>,
    pub coupons: Arc<CouponService>,
    pub orders: Arc<OrderService>,
    pub order_status: Arc<OrderStatusService>,
    pub payments: Arc<PaymentService>,
}

impl AppServices {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: EventSender,
        config: &AppConfig,
        integrations: Integrations,
    ) -> Self {
        let shipping = Arc::new(ShippingQuoteService::new(
            integrations.geocoder,
            integrations.carrier,
            config.shipping.clone(),
        ));
        let coupons = CouponService::new(db.clone());
        let payments = PaymentService::new(
            db.clone(),
            integrations.payment_gateway,
            event_sender.clone(),
            config.default_currency.clone(),
            &config.paystack,
        );
        let orders = Arc::new(OrderService::new(
            db.clone(),
            event_sender.clone(),
            coupons.clone(),
            payments.clone(),
            config.orders.clone(),
        ));

        Self {
            shipping,
            carts: Arc::new(CartService::new(db.clone(), event_sender.clone())),
            coupons: Arc::new(coupons),
            orders,
            order_status: Arc::new(OrderStatusService::new(db, event_sender)),
            payments: Arc::new(payments),
        }
    }
}
