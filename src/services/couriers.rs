use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::entities::courier::{self, Entity as CourierEntity};
use crate::errors::ServiceError;
use crate::events::router::EventHandler;
use crate::events::{
    aggregates, idempotency, keys, outbox, CourierAssigned, OrderCancelled, OrderPreparing,
    OrderProgress,
};
use crate::message_queue::Delivery;

const ASSIGN_COURIER_OP: &str = "ASSIGN_COURIER";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CourierStatus {
    Available,
    Busy,
    Offline,
    OnBreak,
}

#[derive(Debug, Deserialize)]
pub struct UpdateLocationRequest {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: CourierStatus,
}

/// Courier roster and assignment. Selection policy is deliberately simple:
/// the least-recently-updated AVAILABLE courier wins, claimed with a
/// conditional update so two orders can never grab the same courier.
#[derive(Clone)]
pub struct CourierService {
    db: Arc<DatabaseConnection>,
}

impl CourierService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &DatabaseConnection {
        self.db.as_ref()
    }

    #[instrument(skip(self))]
    pub async fn get_me(&self, courier_id: Uuid) -> Result<courier::Model, ServiceError> {
        CourierEntity::find_by_id(courier_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("courier {} not found", courier_id)))
    }

    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        courier_id: Uuid,
        status: CourierStatus,
    ) -> Result<courier::Model, ServiceError> {
        let courier = self.get_me(courier_id).await?;
        let mut active: courier::ActiveModel = courier.into();
        active.status = Set(status.to_string());
        let updated = active.update(self.db.as_ref()).await?;
        info!(courier_id = %courier_id, status = %status, "courier status updated");
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn update_location(
        &self,
        courier_id: Uuid,
        lat: f64,
        lng: f64,
    ) -> Result<courier::Model, ServiceError> {
        let courier = self.get_me(courier_id).await?;
        let mut active: courier::ActiveModel = courier.into();
        active.lat = Set(Some(lat));
        active.lng = Set(Some(lng));
        active.location_updated_at = Set(Some(Utc::now()));
        Ok(active.update(self.db.as_ref()).await?)
    }

    /// Handles `order.preparing`: pick a courier, flip them BUSY, announce
    /// the binding. The per-order idempotency claim keeps a redelivered
    /// event from burning a second courier on an already-assigned order.
    /// With no courier free the claim is rolled back and the message nacked,
    /// so the broker retries and eventually parks it for the operator.
    #[instrument(skip(self, event), fields(order_id = %event.order_id))]
    pub async fn assign_for_order(&self, event: OrderPreparing) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        let key = idempotency::event_key(ASSIGN_COURIER_OP, event.order_id);
        if !idempotency::try_claim(&txn, &key).await? {
            info!(order_id = %event.order_id, "duplicate assignment request dropped");
            return Ok(());
        }

        let candidates: Vec<courier::Model> = CourierEntity::find()
            .filter(courier::Column::Status.eq(CourierStatus::Available.to_string()))
            .order_by_asc(courier::Column::LocationUpdatedAt)
            .limit(10)
            .all(&txn)
            .await?;

        for candidate in candidates {
            let claimed = CourierEntity::update_many()
                .col_expr(
                    courier::Column::Status,
                    Expr::value(CourierStatus::Busy.to_string()),
                )
                .filter(courier::Column::Id.eq(candidate.id))
                .filter(courier::Column::Status.eq(CourierStatus::Available.to_string()))
                .exec(&txn)
                .await?
                .rows_affected
                == 1;
            if !claimed {
                continue;
            }

            outbox::append(
                &txn,
                aggregates::ORDER,
                event.order_id,
                keys::COURIER_ASSIGNED,
                &CourierAssigned {
                    order_id: event.order_id,
                    courier_id: candidate.id,
                },
            )
            .await?;

            txn.commit().await?;
            info!(
                order_id = %event.order_id,
                courier_id = %candidate.id,
                "courier assigned"
            );
            return Ok(());
        }

        warn!(order_id = %event.order_id, "no courier available");
        Err(ServiceError::Conflict(format!(
            "no courier available for order {}",
            event.order_id
        )))
    }

    /// Frees the courier once the order is delivered or cancelled. The
    /// conditional update makes replays harmless.
    #[instrument(skip(self))]
    pub async fn release_courier(&self, courier_id: Uuid) -> Result<(), ServiceError> {
        let released = CourierEntity::update_many()
            .col_expr(
                courier::Column::Status,
                Expr::value(CourierStatus::Available.to_string()),
            )
            .filter(courier::Column::Id.eq(courier_id))
            .filter(courier::Column::Status.eq(CourierStatus::Busy.to_string()))
            .exec(self.db.as_ref())
            .await?
            .rows_affected
            == 1;
        if released {
            info!(courier_id = %courier_id, "courier released");
        }
        Ok(())
    }
}

/// `order.preparing` consumer.
pub struct OrderPreparingHandler {
    pub couriers: Arc<CourierService>,
}

#[async_trait]
impl EventHandler for OrderPreparingHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), ServiceError> {
        let event: OrderPreparing = serde_json::from_str(&delivery.payload)?;
        self.couriers.assign_for_order(event).await
    }
}

/// Consumer for `order.delivered` and `order.cancelled`: both free the
/// courier if one was attached. The routing key picks the payload shape.
pub struct OrderClosedHandler {
    pub couriers: Arc<CourierService>,
}

#[async_trait]
impl EventHandler for OrderClosedHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), ServiceError> {
        let courier_id = match delivery.routing_key.as_str() {
            keys::ORDER_DELIVERED => {
                let event: OrderProgress = serde_json::from_str(&delivery.payload)?;
                Some(event.courier_id)
            }
            keys::ORDER_CANCELLED => {
                let event: OrderCancelled = serde_json::from_str(&delivery.payload)?;
                event.courier_id
            }
            other => {
                warn!(routing_key = %other, "unexpected key for courier release");
                None
            }
        };
        if let Some(courier_id) = courier_id {
            self.couriers.release_courier(courier_id).await?;
        }
        Ok(())
    }
}
