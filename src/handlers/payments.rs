use crate::{
    auth::AuthUser,
    errors::ServiceError,
    handlers::common::{message_response, success_response},
    services::payments::PAYSTACK_SIGNATURE_HEADER,
    AppState,
};
use axum::{
    body::Bytes,
    extract::{Json, Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use uuid::Uuid;

pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/initialize", post(initialize_payment))
        .route("/verify/:reference", get(verify_payment))
        // signature-verified, no bearer token
        .route("/webhook", post(payment_webhook))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializePaymentRequest {
    pub order_id: Uuid,
}

/// Start (or retry) a hosted checkout for an order
async fn initialize_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<InitializePaymentRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let session = state
        .services
        .payments
        .initialize(&user, payload.order_id)
        .await?;
    Ok(success_response(session))
}

async fn verify_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(reference): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.services.payments.verify(&user, &reference).await?;
    Ok(message_response(order, "Payment verified"))
}

// POST /api/v1/payment/webhook
async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    let signature = headers
        .get(PAYSTACK_SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    state
        .services
        .payments
        .handle_webhook(signature, &body)
        .await?;

    Ok((StatusCode::OK, "ok"))
}
