//! Product snapshot cache, owned by the order service and fed by the
//! `product.*` stream. Writes are idempotent upserts keyed by product id, so
//! replays and out-of-order interleavings converge on the latest payload.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::entities::product_snapshot::{self, Entity as SnapshotEntity};
use crate::errors::ServiceError;
use crate::events::router::EventHandler;
use crate::events::{keys, ProductEvent};
use crate::message_queue::Delivery;

/// Read API used by order creation. Missing ids are simply absent from the
/// map; the caller decides how to fail.
pub async fn find_all<C: ConnectionTrait>(
    conn: &C,
    product_ids: &[Uuid],
) -> Result<HashMap<Uuid, product_snapshot::Model>, ServiceError> {
    if product_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let rows = SnapshotEntity::find()
        .filter(product_snapshot::Column::ProductId.is_in(product_ids.iter().copied()))
        .all(conn)
        .await?;
    Ok(rows.into_iter().map(|m| (m.product_id, m)).collect())
}

#[derive(Clone)]
pub struct SnapshotCache {
    db: Arc<DatabaseConnection>,
}

impl SnapshotCache {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[instrument(skip(self, event), fields(product_id = %event.product_id))]
    pub async fn upsert(&self, event: ProductEvent) -> Result<(), ServiceError> {
        let row = product_snapshot::ActiveModel {
            product_id: Set(event.product_id),
            store_id: Set(event.store_id),
            name: Set(event.name),
            price: Set(event.price),
            stock: Set(event.stock),
            available: Set(event.available),
            updated_at: Set(Utc::now()),
        };
        SnapshotEntity::insert(row)
            .on_conflict(
                OnConflict::column(product_snapshot::Column::ProductId)
                    .update_columns([
                        product_snapshot::Column::StoreId,
                        product_snapshot::Column::Name,
                        product_snapshot::Column::Price,
                        product_snapshot::Column::Stock,
                        product_snapshot::Column::Available,
                        product_snapshot::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(self.db.as_ref())
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn remove(&self, product_id: Uuid) -> Result<(), ServiceError> {
        SnapshotEntity::delete_by_id(product_id)
            .exec(self.db.as_ref())
            .await?;
        debug!(product_id = %product_id, "snapshot removed");
        Ok(())
    }
}

/// Consumer for the whole `product.*` family. The routing key decides the
/// interpretation: `product.deleted` carries a bare id, everything else the
/// full product body.
pub struct ProductEventHandler {
    pub cache: SnapshotCache,
}

#[async_trait]
impl EventHandler for ProductEventHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), ServiceError> {
        if delivery.routing_key == keys::PRODUCT_DELETED {
            let product_id: Uuid = serde_json::from_str(&delivery.payload)?;
            return self.cache.remove(product_id).await;
        }
        let event: ProductEvent = serde_json::from_str(&delivery.payload)?;
        self.cache.upsert(event).await
    }
}
