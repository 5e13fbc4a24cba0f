#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::Value;
use storefront_api::{
    auth::{AuthUser, Claims},
    config::AppConfig,
    db,
    entities::{coupon, order, product},
    errors::ServiceError,
    events::{self, EventSender},
    handlers::Integrations,
    services::{
        carts::AddToCartInput,
        payments::{PaymentGateway, PaymentSession, PaymentSessionRequest, PaymentVerification},
        shipping::{
            carrier::{Carrier, CarrierQuote, CarrierQuoteRequest},
            geocoding::Geocoder,
            pricing::Coordinates,
        },
    },
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str =
    "test_secret_key_for_storefront_integration_tests_only_padding_to_64_chars";
pub const PAYSTACK_SECRET: &str = "sk_test_storefront_webhook";

/// Store origin used by every test: Accra
pub const STORE: Coordinates = Coordinates {
    latitude: 5.6037,
    longitude: -0.1870,
};

/// A point `km` kilometres due north of the store
pub fn north_of_store(km: f64) -> Coordinates {
    Coordinates {
        latitude: STORE.latitude + km / 111.195,
        longitude: STORE.longitude,
    }
}

/// Geocoder answering from a fixed table keyed by city
#[derive(Default)]
pub struct StubGeocoder {
    pub places: HashMap<String, Coordinates>,
    pub unavailable: bool,
    pub queries: Mutex<Vec<String>>,
}

impl StubGeocoder {
    pub fn with_place(mut self, city: &str, at: Coordinates) -> Self {
        self.places.insert(city.to_lowercase(), at);
        self
    }
}

#[async_trait]
impl Geocoder for StubGeocoder {
    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, ServiceError> {
        self.queries.lock().unwrap().push(query.to_string());
        if self.unavailable {
            return Err(ServiceError::ExternalServiceError("geocoder down".into()));
        }
        let lowered = query.to_lowercase();
        Ok(self
            .places
            .iter()
            .find(|(city, _)| lowered.contains(city.as_str()))
            .map(|(_, at)| *at))
    }
}

pub enum CarrierBehaviour {
    Price(Decimal),
    NoOffer,
    Fail,
}

pub struct StubCarrier(pub CarrierBehaviour);

#[async_trait]
impl Carrier for StubCarrier {
    fn name(&self) -> &'static str {
        "Yango"
    }

    async fn quote(
        &self,
        _request: &CarrierQuoteRequest,
    ) -> Result<Option<CarrierQuote>, ServiceError> {
        match &self.0 {
            CarrierBehaviour::Price(price) => Ok(Some(CarrierQuote {
                price: *price,
                currency: Some("GHS".into()),
                service_type: "express".into(),
            })),
            CarrierBehaviour::NoOffer => Ok(None),
            CarrierBehaviour::Fail => Err(ServiceError::CarrierUnavailable("boom".into())),
        }
    }
}

/// In-memory stand-in for Paystack
#[derive(Default)]
pub struct StubGateway {
    pub fail_initialize: Mutex<bool>,
    pub sessions: Mutex<Vec<PaymentSessionRequest>>,
    /// reference -> (status, amount in minor units)
    pub outcomes: Mutex<HashMap<String, (String, i64)>>,
}

impl StubGateway {
    pub fn settle(&self, reference: &str, status: &str, amount: i64) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(reference.to_string(), (status.to_string(), amount));
    }

    pub fn set_failing(&self, failing: bool) {
        *self.fail_initialize.lock().unwrap() = failing;
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[async_trait]
impl PaymentGateway for StubGateway {
    async fn initialize(
        &self,
        request: &PaymentSessionRequest,
    ) -> Result<PaymentSession, ServiceError> {
        if *self.fail_initialize.lock().unwrap() {
            return Err(ServiceError::PaymentInitFailed("gateway offline".into()));
        }
        self.sessions.lock().unwrap().push(request.clone());
        Ok(PaymentSession {
            authorization_url: format!("https://checkout.test/{}", request.reference),
            access_code: Some("access".into()),
            reference: request.reference.clone(),
        })
    }

    async fn verify(&self, reference: &str) -> Result<PaymentVerification, ServiceError> {
        let outcomes = self.outcomes.lock().unwrap();
        let (status, amount) = outcomes
            .get(reference)
            .cloned()
            .unwrap_or_else(|| ("abandoned".to_string(), 0));
        Ok(PaymentVerification {
            reference: reference.to_string(),
            status,
            amount,
            paid_at: None,
            gateway_response: None,
        })
    }
}

/// Application backed by an in-memory SQLite database and stub integrations
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<StubGateway>,
    pub geocoder: Arc<StubGeocoder>,
    _event_task: tokio::task::JoinHandle<()>,
}

pub struct TestOptions {
    pub geocoder: StubGeocoder,
    pub carrier: CarrierBehaviour,
    pub configure: fn(&mut AppConfig),
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            geocoder: StubGeocoder::default().with_place("Accra", north_of_store(15.0)),
            carrier: CarrierBehaviour::NoOffer,
            configure: |_| {},
        }
    }
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_options(TestOptions::default()).await
    }

    pub async fn with_options(options: TestOptions) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            JWT_SECRET.to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.paystack.secret_key = Some(PAYSTACK_SECRET.to_string());
        cfg.shipping.store_latitude = STORE.latitude;
        cfg.shipping.store_longitude = STORE.longitude;
        cfg.shipping.base_fee = Decimal::new(15, 0);
        (options.configure)(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = Arc::new(StubGateway::default());
        let geocoder = Arc::new(options.geocoder);
        let integrations = Integrations {
            geocoder: geocoder.clone(),
            carrier: Arc::new(StubCarrier(options.carrier)),
            payment_gateway: gateway.clone(),
        };

        let state = AppState::new(Arc::new(pool), cfg, event_sender, integrations);
        let router = storefront_api::build_router(state.clone());

        Self {
            router,
            state,
            gateway,
            geocoder,
            _event_task: event_task,
        }
    }

    pub fn db(&self) -> &sea_orm::DatabaseConnection {
        &self.state.db
    }

    pub fn user(&self, id: &str) -> AuthUser {
        AuthUser {
            user_id: id.to_string(),
            name: Some(format!("User {}", id)),
            email: Some(format!("{}@example.com", id)),
            roles: vec![],
        }
    }

    pub fn admin(&self) -> AuthUser {
        AuthUser {
            user_id: "admin-1".to_string(),
            name: Some("Admin".into()),
            email: Some("admin@example.com".into()),
            roles: vec!["admin".into()],
        }
    }

    /// Bearer token for `user_id` with the given roles
    pub fn token_for(&self, user_id: &str, roles: &[&str]) -> String {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            name: Some(format!("User {}", user_id)),
            email: Some(format!("{}@example.com", user_id)),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            iat: now.timestamp(),
            exp: (now + chrono::Duration::hours(1)).timestamp(),
            iss: self.state.config.auth_issuer.clone(),
            aud: self.state.config.auth_audience.clone(),
        };
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(JWT_SECRET.as_bytes()),
        )
        .expect("encode access token")
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).expect("serialize request body"))
            }
            None => Body::empty(),
        };
        self.send(builder.body(body).expect("failed to build request"))
            .await
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Creates an active product; `sizes` empty means an unsized product with `stock` units
    pub async fn seed_product(
        &self,
        name: &str,
        price: Decimal,
        sizes: &[(&str, i32)],
        stock: i32,
    ) -> product::Model {
        let now = Utc::now();
        let total = if sizes.is_empty() {
            stock
        } else {
            sizes.iter().map(|(_, s)| s).sum()
        };
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            price: Set(price),
            images: Set(product::ProductImages(vec![format!(
                "https://cdn.test/{}.jpg",
                name.to_lowercase().replace(' ', "-")
            )])),
            sizes: Set(product::SizeStock(
                sizes
                    .iter()
                    .map(|(size, stock)| product::SizeStockEntry {
                        size: size.to_string(),
                        stock: *stock,
                    })
                    .collect(),
            )),
            total_stock: Set(total),
            sold_count: Set(0),
            remaining_stock: Set(total),
            is_active: Set(true),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("insert product")
    }

    pub async fn product(&self, id: Uuid) -> product::Model {
        product::Entity::find_by_id(id)
            .one(self.db())
            .await
            .expect("load product")
            .expect("product exists")
    }

    pub async fn order(&self, id: Uuid) -> order::Model {
        order::Entity::find_by_id(id)
            .one(self.db())
            .await
            .expect("load order")
            .expect("order exists")
    }

    pub async fn seed_coupon(
        &self,
        code: &str,
        discount_type: coupon::DiscountType,
        value: Decimal,
    ) -> coupon::Model {
        let now = Utc::now();
        coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.to_uppercase()),
            description: Set(None),
            discount_type: Set(discount_type),
            discount_value: Set(value),
            min_order_amount: Set(None),
            max_discount: Set(None),
            usage_limit: Set(None),
            used_count: Set(0),
            is_active: Set(true),
            starts_at: Set(None),
            expires_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("insert coupon")
    }

    pub async fn add_to_cart(
        &self,
        user_id: &str,
        product: &product::Model,
        quantity: i32,
        size: Option<&str>,
    ) {
        self.state
            .services
            .carts
            .add_item(
                user_id,
                AddToCartInput {
                    product_id: product.id,
                    quantity,
                    size: size.map(str::to_string),
                    color: None,
                },
            )
            .await
            .expect("add to cart");
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

pub fn shipping_address() -> Value {
    serde_json::json!({
        "name": "Ama Mensah",
        "email": "ama@example.com",
        "phone": "0241234567",
        "address": "12 Oxford Street",
        "city": "Accra"
    })
}

/// Reads a serialized decimal (string or number) from a JSON field
pub fn decimal(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.parse().expect("decimal string"),
        Value::Number(n) => n.to_string().parse().expect("decimal number"),
        other => panic!("expected a decimal, got {}", other),
    }
}
