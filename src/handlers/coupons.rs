use crate::{
    auth::AuthUser, errors::ServiceError, handlers::common::message_response,
    services::orders::find_order, AppState,
};
use axum::{
    extract::{Json, State},
    response::IntoResponse,
    routing::post,
    Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

pub fn coupon_routes() -> Router<AppState> {
    Router::new()
        .route("/validate", post(validate_coupon))
        .route("/record-usage", post(record_usage))
}

#[derive(Debug, Deserialize, Validate)]
pub struct ValidateCouponRequest {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    pub subtotal: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct RecordUsageRequest {
    #[serde(alias = "couponId")]
    pub coupon_id: Uuid,
    #[serde(alias = "orderId")]
    pub order_id: Uuid,
}

/// Check a code against the current subtotal. Responds with
/// `{success, coupon, discount, message}` at the top level.
async fn validate_coupon(
    State(state): State<AppState>,
    _user: AuthUser,
    Json(payload): Json<ValidateCouponRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    payload.validate()?;
    let validation = state
        .services
        .coupons
        .validate(&payload.code, payload.subtotal)
        .await?;
    Ok(Json(validation))
}

/// Best-effort redemption record; checkout records usage on its own too
async fn record_usage(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<RecordUsageRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = find_order(&*state.db, &payload.order_id.to_string())
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", payload.order_id)))?;
    if !user.can_access(&order.user_id) {
        return Err(ServiceError::Forbidden(
            "You do not have access to this order".to_string(),
        ));
    }

    let recorded = state
        .services
        .coupons
        .record_usage(payload.coupon_id, order.id, &order.user_id)
        .await?;

    let message = if recorded {
        "Coupon usage recorded"
    } else {
        "Coupon usage already recorded"
    };
    Ok(message_response(json!({ "recorded": recorded }), message))
}
