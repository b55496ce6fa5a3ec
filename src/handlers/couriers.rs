use std::sync::Arc;

use axum::{
    extract::{FromRef, State},
    response::IntoResponse,
    routing::{get, patch},
    Json, Router,
};

use crate::auth::{AuthenticatedUser, JwtVerifier, Role};
use crate::errors::ServiceError;
use crate::services::couriers::{CourierService, UpdateLocationRequest, UpdateStatusRequest};

#[derive(Clone)]
pub struct CourierAppState {
    pub couriers: Arc<CourierService>,
    pub verifier: Arc<JwtVerifier>,
}

impl FromRef<CourierAppState> for Arc<JwtVerifier> {
    fn from_ref(state: &CourierAppState) -> Self {
        state.verifier.clone()
    }
}

pub fn routes(state: CourierAppState) -> Router {
    Router::new()
        .route("/me", get(get_me))
        .route("/me/status", patch(update_status))
        .route("/me/location", patch(update_location))
        .with_state(state)
}

async fn get_me(
    State(state): State<CourierAppState>,
    user: AuthenticatedUser,
) -> Result<impl IntoResponse, ServiceError> {
    user.require_role(Role::Courier)?;
    let courier = state.couriers.get_me(user.user_id).await?;
    Ok(Json(courier))
}

async fn update_status(
    State(state): State<CourierAppState>,
    user: AuthenticatedUser,
    Json(request): Json<UpdateStatusRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    user.require_role(Role::Courier)?;
    let courier = state
        .couriers
        .update_status(user.user_id, request.status)
        .await?;
    Ok(Json(courier))
}

async fn update_location(
    State(state): State<CourierAppState>,
    user: AuthenticatedUser,
    Json(request): Json<UpdateLocationRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    user.require_role(Role::Courier)?;
    let courier = state
        .couriers
        .update_location(user.user_id, request.lat, request.lng)
        .await?;
    Ok(Json(courier))
}
