//! Shipping quotes.
//!
//! A quote is produced by walking an ordered list of strategies; the first
//! one that yields a price wins. Geocoding happens once up front, and a
//! destination the geocoder positively does not know is the only failure
//! surfaced to callers.

pub mod carrier;
pub mod geocoding;
pub mod pricing;

use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use validator::Validate;

use crate::config::ShippingConfig;
use crate::entities::order::ShippingDetails;
use crate::errors::ServiceError;
use carrier::{Carrier, CarrierQuoteRequest};
use geocoding::{locate_destination, Geocoder};
use pricing::{distance_fee, estimated_delivery_time, haversine_km, round_km, Coordinates};

pub const DISTANCE_CARRIER_LABEL: &str = "Standard Delivery";

/// Request to quote delivery of the current cart
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ShippingRequest {
    #[validate(length(min = 1, message = "Address is required"))]
    pub address: String,
    #[validate(length(min = 1, message = "City is required"))]
    pub city: String,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    /// Number of parcels declared to the carrier
    #[serde(default)]
    pub item_count: Option<u32>,
}

/// Priced delivery offer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingQuote {
    pub shipping_fee: Decimal,
    pub estimated_delivery_time: String,
    /// Kilometres, 2 dp; absent when the destination could not be located
    pub distance: Option<f64>,
    pub carrier: String,
    pub service_type: String,
    /// True when the price did not come from the carrier
    pub fallback: bool,
}

impl From<ShippingQuote> for ShippingDetails {
    fn from(quote: ShippingQuote) -> Self {
        ShippingDetails {
            shipping_fee: Some(quote.shipping_fee),
            carrier: Some(quote.carrier),
            distance: quote.distance,
            service_type: Some(quote.service_type),
            estimated_delivery_time: Some(quote.estimated_delivery_time),
            fallback: quote.fallback,
            extra: Default::default(),
        }
    }
}

/// One way of pricing a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteStrategy {
    /// Live rate from the carrier API
    Carrier,
    /// Banded tariff on the straight-line distance
    DistanceFormula,
    /// Flat fee when nothing is known about the destination
    FlatRate,
}

impl QuoteStrategy {
    fn label(&self) -> &'static str {
        match self {
            QuoteStrategy::Carrier => "carrier",
            QuoteStrategy::DistanceFormula => "distance_formula",
            QuoteStrategy::FlatRate => "flat_rate",
        }
    }
}

/// Strategy plus the time it is allowed to take
#[derive(Debug, Clone, Copy)]
pub struct StrategyStep {
    pub strategy: QuoteStrategy,
    pub timeout: Option<Duration>,
}

/// Where the destination ended up after geocoding
#[derive(Debug, Clone, Copy)]
enum Destination {
    Located(Coordinates),
    /// Geocoder failed; nothing is known about the address
    Unknown,
}

#[derive(Clone)]
pub struct ShippingQuoteService {
    geocoder: Arc<dyn Geocoder>,
    carrier: Arc<dyn Carrier>,
    config: ShippingConfig,
    steps: Vec<StrategyStep>,
}

impl ShippingQuoteService {
    /// Default chain: carrier, then distance formula, then flat rate.
    pub fn new(geocoder: Arc<dyn Geocoder>, carrier: Arc<dyn Carrier>, config: ShippingConfig) -> Self {
        let steps = vec![
            StrategyStep {
                strategy: QuoteStrategy::Carrier,
                timeout: Some(config.carrier_timeout()),
            },
            StrategyStep {
                strategy: QuoteStrategy::DistanceFormula,
                timeout: None,
            },
            StrategyStep {
                strategy: QuoteStrategy::FlatRate,
                timeout: None,
            },
        ];
        Self::with_steps(geocoder, carrier, config, steps)
    }

    pub fn with_steps(
        geocoder: Arc<dyn Geocoder>,
        carrier: Arc<dyn Carrier>,
        config: ShippingConfig,
        steps: Vec<StrategyStep>,
    ) -> Self {
        Self {
            geocoder,
            carrier,
            config,
            steps,
        }
    }

    fn origin(&self) -> Coordinates {
        Coordinates::new(self.config.store_latitude, self.config.store_longitude)
    }

    /// Quote delivery to the given address.
    ///
    /// # Errors
    /// `AddressNotResolved` when neither the full address nor the city is
    /// known to the geocoder. Every other failure degrades to a fallback quote.
    #[instrument(skip(self), fields(city = %request.city))]
    pub async fn calculate(&self, request: &ShippingRequest) -> Result<ShippingQuote, ServiceError> {
        request.validate()?;

        let destination = self.locate(request).await?;

        for step in &self.steps {
            match self.try_step(*step, destination, request).await {
                Some(quote) => {
                    counter!("shipping.quotes", 1, "strategy" => step.strategy.label());
                    if quote.fallback {
                        counter!("shipping.fallbacks", 1);
                    }
                    info!(
                        strategy = step.strategy.label(),
                        fee = %quote.shipping_fee,
                        fallback = quote.fallback,
                        "shipping quote computed"
                    );
                    return Ok(quote);
                }
                None => continue,
            }
        }

        Err(ServiceError::InternalError(
            "no shipping strategy produced a quote".to_string(),
        ))
    }

    async fn locate(&self, request: &ShippingRequest) -> Result<Destination, ServiceError> {
        let lookup = locate_destination(
            self.geocoder.as_ref(),
            &request.address,
            &request.city,
            &self.config.country,
        );

        match tokio::time::timeout(self.config.geocoder_timeout(), lookup).await {
            Ok(Ok(Some(coordinates))) => Ok(Destination::Located(coordinates)),
            Ok(Ok(None)) => Err(ServiceError::AddressNotResolved),
            Ok(Err(e)) => {
                warn!("Geocoding failed, quoting without a distance: {}", e);
                Ok(Destination::Unknown)
            }
            Err(_) => {
                warn!("Geocoding timed out, quoting without a distance");
                Ok(Destination::Unknown)
            }
        }
    }

    async fn try_step(
        &self,
        step: StrategyStep,
        destination: Destination,
        request: &ShippingRequest,
    ) -> Option<ShippingQuote> {
        match (step.strategy, destination) {
            (QuoteStrategy::Carrier, Destination::Located(coordinates)) => {
                self.carrier_quote(coordinates, request, step.timeout).await
            }
            (QuoteStrategy::DistanceFormula, Destination::Located(coordinates)) => {
                let distance = haversine_km(self.origin(), coordinates);
                Some(ShippingQuote {
                    shipping_fee: distance_fee(self.config.base_fee, distance),
                    estimated_delivery_time: estimated_delivery_time(distance).to_string(),
                    distance: Some(round_km(distance)),
                    carrier: DISTANCE_CARRIER_LABEL.to_string(),
                    service_type: "standard".to_string(),
                    fallback: true,
                })
            }
            (QuoteStrategy::FlatRate, _) => Some(ShippingQuote {
                shipping_fee: self.config.flat_fallback_fee,
                estimated_delivery_time: pricing::UNKNOWN_DISTANCE_ETA.to_string(),
                distance: None,
                carrier: DISTANCE_CARRIER_LABEL.to_string(),
                service_type: "flat_rate".to_string(),
                fallback: true,
            }),
            (_, Destination::Unknown) => None,
        }
    }

    async fn carrier_quote(
        &self,
        destination: Coordinates,
        request: &ShippingRequest,
        timeout: Option<Duration>,
    ) -> Option<ShippingQuote> {
        let quote_request = CarrierQuoteRequest {
            origin: self.origin(),
            origin_address: self.config.store_address.clone(),
            destination,
            destination_address: format!("{}, {}", request.address, request.city),
            recipient_phone: request.phone.clone(),
            item_count: request.item_count.unwrap_or(1),
        };

        let call = self.carrier.quote(&quote_request);
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(ServiceError::CarrierUnavailable("timed out".to_string())),
            },
            None => call.await,
        };

        match outcome {
            Ok(Some(offer)) => {
                let distance = haversine_km(self.origin(), destination);
                Some(ShippingQuote {
                    shipping_fee: offer.price,
                    estimated_delivery_time: estimated_delivery_time(distance).to_string(),
                    distance: Some(round_km(distance)),
                    carrier: self.carrier.name().to_string(),
                    service_type: offer.service_type,
                    fallback: false,
                })
            }
            Ok(None) => {
                info!("Carrier returned no priced offer");
                None
            }
            Err(e) => {
                warn!("Carrier quote failed, falling back: {}", e);
                None
            }
        }
    }
}
