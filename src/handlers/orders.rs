use crate::{
    auth::{AdminUser, AuthUser},
    entities::order::OrderStatus,
    errors::ServiceError,
    handlers::common::{created_response, message_response, success_response},
    services::{order_status::StatusUpdate, orders::CreateOrderInput},
    AppState, PaginatedResponse,
};
use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::{get, put},
    Router,
};
use serde::Deserialize;
use tracing::info;

/// Creates the router for order endpoints
pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_orders).post(create_order))
        .route("/:id", get(get_order))
        .route("/:id/cancel", put(cancel_order))
        .route("/:id/track", get(track_order))
        .route("/:id/status", put(update_order_status))
}

#[derive(Debug, Deserialize)]
pub struct OrderListQuery {
    pub page: Option<u64>,
    pub limit: Option<u64>,
    pub status: Option<OrderStatus>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelOrderRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Check out the caller's cart
async fn create_order(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CreateOrderInput>,
) -> Result<impl IntoResponse, ServiceError> {
    let details = state.services.orders.create_order(&user, payload).await?;
    Ok(created_response(details))
}

async fn list_orders(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<OrderListQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let limit = state.config.page_size(query.limit);
    let page = query.page.unwrap_or(1).max(1);

    let result = state
        .services
        .orders
        .list_orders(&user, page, limit, query.status)
        .await?;

    Ok(success_response(PaginatedResponse::new(
        result.orders,
        result.total,
        result.page,
        result.limit,
    )))
}

/// Get an order by id or order number
async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let details = state.services.orders.get_order(&user, &id).await?;
    Ok(success_response(details))
}

async fn cancel_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    payload: Option<Json<CancelOrderRequest>>,
) -> Result<impl IntoResponse, ServiceError> {
    let reason = payload.and_then(|Json(body)| body.reason);
    let order = state
        .services
        .orders
        .cancel_order(&user, &id, reason)
        .await?;
    Ok(message_response(order, "Order cancelled"))
}

async fn track_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let tracking = state.services.orders.track_order(&user, &id).await?;
    Ok(success_response(tracking))
}

/// Admin fulfilment: confirm, ship, deliver or cancel
async fn update_order_status(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
    Json(payload): Json<StatusUpdate>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = crate::services::orders::find_order(&*state.db, &id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", id)))?;

    info!(admin = %admin.user_id, order_id = %order.id, status = %payload.status, "admin status update");
    let updated = state
        .services
        .order_status
        .update_status(order.id, payload)
        .await?;
    Ok(success_response(updated))
}
