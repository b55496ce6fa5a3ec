use std::sync::Arc;

use axum::{
    extract::{FromRef, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use uuid::Uuid;

use crate::auth::{AuthenticatedUser, JwtVerifier, Role};
use crate::errors::ServiceError;
use crate::handlers::common::PaginationParams;
use crate::services::orders::{CreateOrderRequest, OrderService};

#[derive(Clone)]
pub struct OrderAppState {
    pub orders: Arc<OrderService>,
    pub verifier: Arc<JwtVerifier>,
}

impl FromRef<OrderAppState> for Arc<JwtVerifier> {
    fn from_ref(state: &OrderAppState) -> Self {
        state.verifier.clone()
    }
}

pub fn routes(state: OrderAppState) -> Router {
    Router::new()
        .route("/", post(create_order))
        .route("/me", get(list_my_orders))
        .route("/:id", get(get_order))
        .route("/:id/accept", patch(accept_order))
        .route("/:id/pickup", patch(pickup_order))
        .route("/:id/deliver", patch(deliver_order))
        .route("/:id/cancel", patch(cancel_order))
        .with_state(state)
}

async fn create_order(
    State(state): State<OrderAppState>,
    user: AuthenticatedUser,
    Json(request): Json<CreateOrderRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    user.require_role(Role::Customer)?;
    let order = state.orders.create_order(user.user_id, request).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

async fn list_my_orders(
    State(state): State<OrderAppState>,
    user: AuthenticatedUser,
    Query(pagination): Query<PaginationParams>,
) -> Result<impl IntoResponse, ServiceError> {
    let orders = state
        .orders
        .list_my_orders(user.user_id, pagination.page, pagination.per_page)
        .await?;
    Ok(Json(orders))
}

async fn get_order(
    State(state): State<OrderAppState>,
    user: AuthenticatedUser,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.orders.get_order(order_id, &user).await?;
    Ok(Json(order))
}

async fn accept_order(
    State(state): State<OrderAppState>,
    user: AuthenticatedUser,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let store_id = user.require_store()?;
    let order = state.orders.accept_order(order_id, store_id).await?;
    Ok(Json(order))
}

async fn pickup_order(
    State(state): State<OrderAppState>,
    user: AuthenticatedUser,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    user.require_role(Role::Courier)?;
    let order = state.orders.pickup_order(order_id, user.user_id).await?;
    Ok(Json(order))
}

async fn deliver_order(
    State(state): State<OrderAppState>,
    user: AuthenticatedUser,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    user.require_role(Role::Courier)?;
    let order = state.orders.deliver_order(order_id, user.user_id).await?;
    Ok(Json(order))
}

async fn cancel_order(
    State(state): State<OrderAppState>,
    user: AuthenticatedUser,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.orders.cancel_order(order_id, &user).await?;
    Ok(Json(order))
}
