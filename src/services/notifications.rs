use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::entities::notification::{self, Entity as NotificationEntity};
use crate::errors::ServiceError;
use crate::events::router::EventHandler;
use crate::events::{
    idempotency, keys, OrderCancelled, OrderCreated, OrderPreparing, OrderProgress,
    StockReservationFailed,
};
use crate::message_queue::Delivery;

/// Frame pushed to a connected session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Subscribed {
        user_id: Uuid,
    },
    Notification {
        id: Uuid,
        kind: String,
        order_id: Uuid,
        message: String,
        created_at: DateTime<Utc>,
    },
    Error {
        code: String,
        message: String,
    },
}

/// Live session handle: the write half of the socket task's channel.
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: Uuid,
    sender: mpsc::UnboundedSender<ServerFrame>,
}

impl SessionHandle {
    pub fn new(session_id: Uuid, sender: mpsc::UnboundedSender<ServerFrame>) -> Self {
        Self { session_id, sender }
    }

    /// True if the session task accepted the frame.
    pub fn send(&self, frame: ServerFrame) -> bool {
        self.sender.send(frame).is_ok()
    }
}

/// Connected sessions per user. One encapsulated registry with typed
/// operations; a frame for user A can never reach a session registered under
/// user B because the principal is the map key.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, Vec<SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, user_id: Uuid, handle: SessionHandle) {
        self.sessions.entry(user_id).or_default().push(handle);
        info!(user_id = %user_id, "session registered");
    }

    pub fn unregister(&self, user_id: Uuid, session_id: Uuid) {
        if let Some(mut handles) = self.sessions.get_mut(&user_id) {
            handles.retain(|h| h.session_id != session_id);
        }
        self.sessions.remove_if(&user_id, |_, handles| handles.is_empty());
    }

    /// Delivers the frame to every live session of exactly this user.
    /// Returns how many sessions accepted it.
    pub fn push(&self, user_id: Uuid, frame: ServerFrame) -> usize {
        match self.sessions.get(&user_id) {
            Some(handles) => handles
                .iter()
                .filter(|handle| handle.send(frame.clone()))
                .count(),
            None => 0,
        }
    }

    pub fn session_count(&self, user_id: Uuid) -> usize {
        self.sessions.get(&user_id).map(|h| h.len()).unwrap_or(0)
    }
}

#[derive(Debug, Serialize)]
pub struct NotificationResponse {
    pub id: Uuid,
    pub kind: String,
    pub order_id: Uuid,
    pub store_id: Option<Uuid>,
    pub courier_id: Option<Uuid>,
    pub message: String,
    pub is_read: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<notification::Model> for NotificationResponse {
    fn from(m: notification::Model) -> Self {
        Self {
            id: m.id,
            kind: m.kind,
            order_id: m.order_id,
            store_id: m.store_id,
            courier_id: m.courier_id,
            message: m.message,
            is_read: m.is_read,
            delivered_at: m.delivered_at,
            created_at: m.created_at,
        }
    }
}

/// Persist-then-push dispatcher. Every inbound order event becomes a row
/// first; a live session turns it into a delivered push, otherwise the row
/// stays pending until the user reconnects and asks for a replay.
#[derive(Clone)]
pub struct NotificationService {
    db: Arc<DatabaseConnection>,
    registry: Arc<SessionRegistry>,
}

impl NotificationService {
    pub fn new(db: Arc<DatabaseConnection>, registry: Arc<SessionRegistry>) -> Self {
        Self { db, registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn db(&self) -> &DatabaseConnection {
        self.db.as_ref()
    }

    /// Records one business event as a notification and attempts the push.
    /// The idempotency claim shares the insert transaction, so a redelivered
    /// event cannot produce a second row.
    #[instrument(skip(self, raw_payload), fields(user_id = %user_id, order_id = %order_id, kind = %kind))]
    pub async fn record(
        &self,
        user_id: Uuid,
        kind: &str,
        order_id: Uuid,
        store_id: Option<Uuid>,
        courier_id: Option<Uuid>,
        message: String,
        raw_payload: &str,
    ) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        let key = idempotency::event_key(&format!("NOTIFY_{}", kind), order_id);
        if !idempotency::try_claim(&txn, &key).await? {
            info!("duplicate notification event dropped");
            return Ok(());
        }

        let row = notification::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            kind: Set(kind.to_string()),
            order_id: Set(order_id),
            store_id: Set(store_id),
            courier_id: Set(courier_id),
            message: Set(message),
            payload: Set(raw_payload.to_string()),
            is_read: Set(false),
            delivered_at: Set(None),
            created_at: Set(Utc::now()),
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;

        self.try_deliver(row).await
    }

    async fn try_deliver(&self, row: notification::Model) -> Result<(), ServiceError> {
        let frame = ServerFrame::Notification {
            id: row.id,
            kind: row.kind.clone(),
            order_id: row.order_id,
            message: row.message.clone(),
            created_at: row.created_at,
        };
        if self.registry.push(row.user_id, frame) == 0 {
            return Ok(());
        }

        let mut active: notification::ActiveModel = row.into();
        active.delivered_at = Set(Some(Utc::now()));
        active.update(self.db.as_ref()).await?;
        Ok(())
    }

    /// Replays every pending row for the user, oldest first, marking each
    /// delivered once a session accepts it.
    #[instrument(skip(self))]
    pub async fn replay_pending(&self, user_id: Uuid) -> Result<usize, ServiceError> {
        let pending = NotificationEntity::find()
            .filter(notification::Column::UserId.eq(user_id))
            .filter(notification::Column::DeliveredAt.is_null())
            .order_by_asc(notification::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?;

        let total = pending.len();
        for row in pending {
            self.try_deliver(row).await?;
        }
        info!(user_id = %user_id, replayed = total, "pending notifications replayed");
        Ok(total)
    }

    /// Unread notifications, newest first.
    #[instrument(skip(self))]
    pub async fn unread(&self, user_id: Uuid) -> Result<Vec<NotificationResponse>, ServiceError> {
        let rows = NotificationEntity::find()
            .filter(notification::Column::UserId.eq(user_id))
            .filter(notification::Column::IsRead.eq(false))
            .order_by_desc(notification::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Paged history, newest first. Page size is clamped to 100.
    #[instrument(skip(self))]
    pub async fn history(
        &self,
        user_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<Vec<NotificationResponse>, ServiceError> {
        if page == 0 {
            return Err(ServiceError::Validation("page starts at 1".into()));
        }
        let per_page = per_page.clamp(1, 100);

        let rows = NotificationEntity::find()
            .filter(notification::Column::UserId.eq(user_id))
            .order_by_desc(notification::Column::CreatedAt)
            .paginate(self.db.as_ref(), per_page)
            .fetch_page(page - 1)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Marks a notification read. Repeating the call is a no-op that still
    /// succeeds; touching someone else's notification is rejected as a bad
    /// request rather than revealing whether it exists.
    #[instrument(skip(self))]
    pub async fn mark_read(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
    ) -> Result<NotificationResponse, ServiceError> {
        let row = NotificationEntity::find_by_id(notification_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("notification {} not found", notification_id))
            })?;
        if row.user_id != user_id {
            return Err(ServiceError::Validation(
                "notification does not belong to you".into(),
            ));
        }
        if row.is_read {
            return Ok(row.into());
        }

        let mut active: notification::ActiveModel = row.into();
        active.is_read = Set(true);
        let updated = active.update(self.db.as_ref()).await?;
        Ok(updated.into())
    }
}

/// Consumer for the order event stream feeding user notifications. The
/// routing key selects both the payload type and the message template.
pub struct OrderNotificationHandler {
    pub notifications: Arc<NotificationService>,
}

#[async_trait]
impl EventHandler for OrderNotificationHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), ServiceError> {
        let svc = &self.notifications;
        match delivery.routing_key.as_str() {
            keys::ORDER_CREATED => {
                let e: OrderCreated = serde_json::from_str(&delivery.payload)?;
                svc.record(
                    e.user_id,
                    "ORDER_CREATED",
                    e.order_id,
                    Some(e.store_id),
                    None,
                    "Your order has been placed.".into(),
                    &delivery.payload,
                )
                .await
            }
            keys::ORDER_PREPARING => {
                let e: OrderPreparing = serde_json::from_str(&delivery.payload)?;
                svc.record(
                    e.user_id,
                    "ORDER_PREPARING",
                    e.order_id,
                    Some(e.store_id),
                    None,
                    "The store is preparing your order.".into(),
                    &delivery.payload,
                )
                .await
            }
            keys::ORDER_ON_THE_WAY => {
                let e: OrderProgress = serde_json::from_str(&delivery.payload)?;
                svc.record(
                    e.user_id,
                    "ORDER_ON_THE_WAY",
                    e.order_id,
                    Some(e.store_id),
                    Some(e.courier_id),
                    "Your order is on the way.".into(),
                    &delivery.payload,
                )
                .await
            }
            keys::ORDER_DELIVERED => {
                let e: OrderProgress = serde_json::from_str(&delivery.payload)?;
                svc.record(
                    e.user_id,
                    "ORDER_DELIVERED",
                    e.order_id,
                    Some(e.store_id),
                    Some(e.courier_id),
                    "Your order has been delivered. Enjoy!".into(),
                    &delivery.payload,
                )
                .await
            }
            keys::ORDER_CANCELLED => {
                let e: OrderCancelled = serde_json::from_str(&delivery.payload)?;
                svc.record(
                    e.user_id,
                    "ORDER_CANCELLED",
                    e.order_id,
                    Some(e.store_id),
                    e.courier_id,
                    "Your order was cancelled.".into(),
                    &delivery.payload,
                )
                .await
            }
            keys::ORDER_RESERVATION_FAILED => {
                let e: StockReservationFailed = serde_json::from_str(&delivery.payload)?;
                svc.record(
                    e.user_id,
                    "RESERVATION_FAILED",
                    e.order_id,
                    None,
                    None,
                    format!("Your order could not be accepted: {}", e.reason),
                    &delivery.payload,
                )
                .await
            }
            other => {
                warn!(routing_key = %other, "unexpected key for notifications");
                Ok(())
            }
        }
    }
}
