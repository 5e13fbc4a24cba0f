use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::pricing::Coordinates;
use crate::errors::ServiceError;

/// Resolves free-form addresses to coordinates.
///
/// `Ok(None)` means the provider answered but found nothing; `Err` means
/// the provider could not be asked.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, ServiceError>;
}

/// Geocode a delivery address, retrying with the city alone when the full
/// address is unknown to the provider.
#[instrument(skip(geocoder))]
pub async fn locate_destination(
    geocoder: &dyn Geocoder,
    address: &str,
    city: &str,
    country: &str,
) -> Result<Option<Coordinates>, ServiceError> {
    let full_query = format!("{}, {}, {}", address.trim(), city.trim(), country);
    if let Some(found) = geocoder.geocode(&full_query).await? {
        return Ok(Some(found));
    }

    debug!("no match for full address, retrying with city only");
    let city_query = format!("{}, {}", city.trim(), country);
    geocoder.geocode(&city_query).await
}

/// Nominatim-compatible search client
#[derive(Clone)]
pub struct NominatimGeocoder {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
}

impl NominatimGeocoder {
    pub fn new(
        base_url: impl Into<String>,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("geocoder client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    #[instrument(skip(self))]
    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, ServiceError> {
        let response = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&[("q", query), ("format", "json"), ("limit", "1")])
            .send()
            .await
            .map_err(|e| {
                warn!("Geocoding request failed: {}", e);
                ServiceError::ExternalServiceError(format!("geocoder unreachable: {}", e))
            })?;

        if !response.status().is_success() {
            return Err(ServiceError::ExternalServiceError(format!(
                "geocoder returned status {}",
                response.status()
            )));
        }

        let places: Vec<NominatimPlace> = response.json().await.map_err(|e| {
            ServiceError::ExternalServiceError(format!("invalid geocoder response: {}", e))
        })?;

        let Some(place) = places.into_iter().next() else {
            return Ok(None);
        };

        match (place.lat.parse::<f64>(), place.lon.parse::<f64>()) {
            (Ok(latitude), Ok(longitude)) => Ok(Some(Coordinates::new(latitude, longitude))),
            _ => Err(ServiceError::ExternalServiceError(
                "geocoder returned non-numeric coordinates".to_string(),
            )),
        }
    }
}
