//! Shipping quotes over HTTP with stubbed geocoder and carrier.

mod common;

use axum::http::{Method, StatusCode};
use common::{
    decimal, north_of_store, response_json, CarrierBehaviour, StubGeocoder, TestApp, TestOptions,
};
use rstest::rstest;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

async fn quote_for(app: &TestApp, city: &str) -> axum::response::Response {
    app.request(
        Method::POST,
        "/api/v1/shipping/calculate",
        Some(json!({ "address": "14 Ring Road", "city": city })),
        None,
    )
    .await
}

#[rstest]
#[case(3.0, dec!(15), "Same day - 1 business day")]
#[case(15.0, dec!(45), "1-2 business days")]
#[case(35.0, dec!(78), "2-3 business days")]
#[case(80.0, dec!(135), "2-3 business days")]
#[tokio::test]
async fn distance_formula_prices_by_band(
    #[case] km: f64,
    #[case] expected_fee: Decimal,
    #[case] expected_eta: &str,
) {
    let app = TestApp::with_options(TestOptions {
        geocoder: StubGeocoder::default().with_place("Tema", north_of_store(km)),
        ..TestOptions::default()
    })
    .await;

    let response = quote_for(&app, "Tema").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    let quote = &body["data"];
    assert_eq!(decimal(&quote["shippingFee"]), expected_fee);
    assert_eq!(quote["estimatedDeliveryTime"], expected_eta);
    assert_eq!(quote["fallback"], true);
    assert_eq!(quote["carrier"], "Standard Delivery");
    let distance = quote["distance"].as_f64().unwrap();
    assert!((distance - km).abs() < 0.05, "distance {} for {} km", distance, km);
}

#[tokio::test]
async fn carrier_price_wins_when_offered() {
    let app = TestApp::with_options(TestOptions {
        carrier: CarrierBehaviour::Price(dec!(38.5)),
        ..TestOptions::default()
    })
    .await;

    let body = response_json(quote_for(&app, "Accra").await).await;
    assert_eq!(decimal(&body["data"]["shippingFee"]), dec!(38.5));
    assert_eq!(body["data"]["carrier"], "Yango");
    assert_eq!(body["data"]["fallback"], false);
}

#[tokio::test]
async fn carrier_failure_falls_back_to_distance() {
    let app = TestApp::with_options(TestOptions {
        carrier: CarrierBehaviour::Fail,
        ..TestOptions::default()
    })
    .await;

    let response = quote_for(&app, "Accra").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(decimal(&body["data"]["shippingFee"]), dec!(45));
    assert_eq!(body["data"]["fallback"], true);
}

#[tokio::test]
async fn geocoder_outage_gives_flat_rate() {
    let app = TestApp::with_options(TestOptions {
        geocoder: StubGeocoder {
            unavailable: true,
            ..StubGeocoder::default()
        },
        carrier: CarrierBehaviour::Price(dec!(20)),
        ..TestOptions::default()
    })
    .await;

    let response = quote_for(&app, "Accra").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    let quote = &body["data"];
    assert_eq!(decimal(&quote["shippingFee"]), app.state.config.shipping.flat_fallback_fee);
    assert!(quote["distance"].is_null());
    assert_eq!(quote["estimatedDeliveryTime"], "2-5 business days");
    assert_eq!(quote["fallback"], true);
}

#[tokio::test]
async fn unknown_address_is_unprocessable() {
    let app = TestApp::new().await;

    let response = quote_for(&app, "Atlantis").await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    // full address first, then the city alone
    let queries = app.geocoder.queries.lock().unwrap().clone();
    assert_eq!(queries.len(), 2);
    assert!(queries[0].contains("14 Ring Road"));
    assert!(!queries[1].contains("14 Ring Road"));
}

#[tokio::test]
async fn missing_city_is_rejected() {
    let app = TestApp::new().await;
    let response = app
        .request(
            Method::POST,
            "/api/v1/shipping/calculate",
            Some(json!({ "address": "14 Ring Road", "city": "" })),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
