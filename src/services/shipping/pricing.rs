//! Distance maths and the distance-banded tariff.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// ETA used when the destination could not be located
pub const UNKNOWN_DISTANCE_ETA: &str = "2-5 business days";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Great-circle distance in kilometres
pub fn haversine_km(from: Coordinates, to: Coordinates) -> f64 {
    let d_lat = (to.latitude - from.latitude).to_radians();
    let d_lon = (to.longitude - from.longitude).to_radians();
    let lat1 = from.latitude.to_radians();
    let lat2 = to.latitude.to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// Distance as reported to clients (2 dp)
pub fn round_km(distance_km: f64) -> f64 {
    (distance_km * 100.0).round() / 100.0
}

/// Per-kilometre rate for a distance band; `None` inside the base radius
fn per_km_rate(distance_km: f64) -> Option<Decimal> {
    if distance_km <= 5.0 {
        None
    } else if distance_km <= 20.0 {
        Some(Decimal::new(2, 0))
    } else if distance_km <= 50.0 {
        Some(Decimal::new(18, 1))
    } else {
        Some(Decimal::new(15, 1))
    }
}

/// Banded tariff: `base` within 5 km, then `base + rate × d`, rounded to a whole unit.
pub fn distance_fee(base: Decimal, distance_km: f64) -> Decimal {
    let distance_km = distance_km.max(0.0);
    let fee = match per_km_rate(distance_km) {
        None => base,
        Some(rate) => {
            let distance = Decimal::from_f64(distance_km).unwrap_or(Decimal::ZERO);
            base + rate * distance
        }
    };
    fee.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}

pub fn estimated_delivery_time(distance_km: f64) -> &'static str {
    if distance_km <= 10.0 {
        "Same day - 1 business day"
    } else if distance_km <= 30.0 {
        "1-2 business days"
    } else if distance_km <= 100.0 {
        "2-3 business days"
    } else {
        "3-5 business days"
    }
}
