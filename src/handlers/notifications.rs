use std::sync::Arc;

use axum::{
    extract::{FromRef, Path, Query, State},
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use uuid::Uuid;

use crate::auth::{AuthenticatedUser, JwtVerifier};
use crate::errors::ServiceError;
use crate::handlers::common::PaginationParams;
use crate::services::notifications::NotificationService;

#[derive(Clone)]
pub struct NotificationAppState {
    pub notifications: Arc<NotificationService>,
    pub verifier: Arc<JwtVerifier>,
}

impl FromRef<NotificationAppState> for Arc<JwtVerifier> {
    fn from_ref(state: &NotificationAppState) -> Self {
        state.verifier.clone()
    }
}

pub fn routes(state: NotificationAppState) -> Router {
    Router::new()
        .route("/unread", get(unread))
        .route("/history", get(history))
        .route("/:id/read", put(mark_read))
        .with_state(state)
}

async fn unread(
    State(state): State<NotificationAppState>,
    user: AuthenticatedUser,
) -> Result<impl IntoResponse, ServiceError> {
    let notifications = state.notifications.unread(user.user_id).await?;
    Ok(Json(notifications))
}

async fn history(
    State(state): State<NotificationAppState>,
    user: AuthenticatedUser,
    Query(pagination): Query<PaginationParams>,
) -> Result<impl IntoResponse, ServiceError> {
    let notifications = state
        .notifications
        .history(user.user_id, pagination.page, pagination.per_page)
        .await?;
    Ok(Json(notifications))
}

async fn mark_read(
    State(state): State<NotificationAppState>,
    user: AuthenticatedUser,
    Path(notification_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let notification = state
        .notifications
        .mark_read(user.user_id, notification_id)
        .await?;
    Ok(Json(notification))
}
