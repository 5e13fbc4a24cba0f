use crate::{
    errors::ServiceError, handlers::common::success_response,
    services::shipping::ShippingRequest, AppState,
};
use axum::{
    extract::{Json, State},
    response::IntoResponse,
    routing::post,
    Router,
};

pub fn shipping_routes() -> Router<AppState> {
    Router::new().route("/calculate", post(calculate_shipping))
}

/// Quote delivery to an address. Carrier and geocoder outages degrade to
/// fallback prices; only an address nobody can find is an error.
async fn calculate_shipping(
    State(state): State<AppState>,
    Json(payload): Json<ShippingRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let quote = state.services.shipping.calculate(&payload).await?;
    Ok(success_response(quote))
}
