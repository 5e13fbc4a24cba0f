use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{instrument, warn};

use super::pricing::Coordinates;
use crate::errors::ServiceError;

/// What the carrier needs to price a delivery
#[derive(Debug, Clone, PartialEq)]
pub struct CarrierQuoteRequest {
    pub origin: Coordinates,
    pub origin_address: String,
    pub destination: Coordinates,
    pub destination_address: String,
    pub recipient_phone: Option<String>,
    pub item_count: u32,
}

/// A priced carrier offer
#[derive(Debug, Clone, PartialEq)]
pub struct CarrierQuote {
    pub price: Decimal,
    pub currency: Option<String>,
    pub service_type: String,
}

/// Third-party delivery rate provider.
///
/// `Ok(None)` means the carrier answered without a priced offer. Failures
/// to reach it surface as `ServiceError::CarrierUnavailable`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Carrier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn quote(
        &self,
        request: &CarrierQuoteRequest,
    ) -> Result<Option<CarrierQuote>, ServiceError>;
}

const CHECK_PRICE_PATH: &str = "/b2b/cargo/integration/v2/check-price";
const DEFAULT_TARIFF: &str = "express";

/// Yango Delivery B2B client
#[derive(Clone)]
pub struct YangoCarrier {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct CheckPriceRequest {
    items: Vec<CheckPriceItem>,
    route_points: Vec<RoutePoint>,
    requirements: Requirements,
}

#[derive(Debug, Serialize)]
struct CheckPriceItem {
    quantity: u32,
    size: ItemSize,
    weight: f64,
}

#[derive(Debug, Serialize)]
struct ItemSize {
    length: f64,
    width: f64,
    height: f64,
}

#[derive(Debug, Serialize)]
struct RoutePoint {
    /// [longitude, latitude]
    coordinates: [f64; 2],
    fullname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Requirements {
    taxi_class: String,
}

#[derive(Debug, Deserialize)]
struct CheckPriceResponse {
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    currency_rules: Option<CurrencyRules>,
    #[serde(default)]
    requirements: Option<Requirements>,
}

#[derive(Debug, Deserialize)]
struct CurrencyRules {
    code: String,
}

impl YangoCarrier {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("carrier client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    fn build_request(request: &CarrierQuoteRequest) -> CheckPriceRequest {
        CheckPriceRequest {
            items: vec![CheckPriceItem {
                quantity: request.item_count.max(1),
                size: ItemSize {
                    length: 0.3,
                    width: 0.3,
                    height: 0.2,
                },
                weight: 1.0,
            }],
            route_points: vec![
                RoutePoint {
                    coordinates: [request.origin.longitude, request.origin.latitude],
                    fullname: request.origin_address.clone(),
                    phone: None,
                },
                RoutePoint {
                    coordinates: [request.destination.longitude, request.destination.latitude],
                    fullname: request.destination_address.clone(),
                    phone: request.recipient_phone.clone(),
                },
            ],
            requirements: Requirements {
                taxi_class: DEFAULT_TARIFF.to_string(),
            },
        }
    }
}

#[async_trait]
impl Carrier for YangoCarrier {
    fn name(&self) -> &'static str {
        "Yango"
    }

    #[instrument(skip(self, request))]
    async fn quote(
        &self,
        request: &CarrierQuoteRequest,
    ) -> Result<Option<CarrierQuote>, ServiceError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| ServiceError::CarrierUnavailable("missing credentials".to_string()))?;

        let response = self
            .client
            .post(format!("{}{}", self.base_url, CHECK_PRICE_PATH))
            .bearer_auth(api_key)
            .header("Accept-Language", "en")
            .json(&Self::build_request(request))
            .send()
            .await
            .map_err(|e| {
                warn!("Carrier request failed: {}", e);
                ServiceError::CarrierUnavailable(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(ServiceError::CarrierUnavailable(format!(
                "carrier returned status {}",
                response.status()
            )));
        }

        let body: CheckPriceResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::CarrierUnavailable(format!("invalid response: {}", e)))?;

        let price = body
            .price
            .as_deref()
            .and_then(|raw| raw.parse::<Decimal>().ok())
            .filter(|price| *price > Decimal::ZERO);

        Ok(price.map(|price| CarrierQuote {
            price,
            currency: body.currency_rules.map(|rules| rules.code),
            service_type: body
                .requirements
                .map(|r| r.taxi_class)
                .unwrap_or_else(|| DEFAULT_TARIFF.to_string()),
        }))
    }
}
