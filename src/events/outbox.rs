//! Outbox store. `append` runs on the caller's connection so the event row
//! commits or rolls back together with the business write; everything else is
//! driven by the publisher.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde::Serialize;
use uuid::Uuid;

use crate::entities::outbox_event::{self, Entity as OutboxEntity};
use crate::errors::ServiceError;

/// Appends a pending event. Must be called with the transaction of the
/// business write it belongs to; appending on a separate connection breaks
/// the at-least-once delivery guarantee.
pub async fn append<C, P>(
    conn: &C,
    aggregate_type: &str,
    aggregate_id: Uuid,
    event_type: &str,
    payload: &P,
) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
    P: Serialize,
{
    let row = outbox_event::ActiveModel {
        id: Set(Uuid::new_v4()),
        aggregate_type: Set(aggregate_type.to_string()),
        aggregate_id: Set(aggregate_id),
        event_type: Set(event_type.to_string()),
        payload: Set(serde_json::to_string(payload)?),
        created_at: Set(Utc::now()),
        processed: Set(false),
    };
    row.insert(conn).await?;
    Ok(())
}

/// Oldest pending rows, at most `limit`. Ordering is per-aggregate only so
/// far as created_at ordering provides it; consumers must not assume
/// cross-aggregate order.
pub async fn fetch_pending_batch<C: ConnectionTrait>(
    conn: &C,
    limit: u64,
) -> Result<Vec<outbox_event::Model>, ServiceError> {
    let rows = OutboxEntity::find()
        .filter(outbox_event::Column::Processed.eq(false))
        .order_by_asc(outbox_event::Column::CreatedAt)
        .limit(limit)
        .all(conn)
        .await?;
    Ok(rows)
}

pub async fn mark_processed<C: ConnectionTrait>(conn: &C, id: Uuid) -> Result<(), ServiceError> {
    OutboxEntity::update_many()
        .col_expr(outbox_event::Column::Processed, Expr::value(true))
        .filter(outbox_event::Column::Id.eq(id))
        .exec(conn)
        .await?;
    Ok(())
}

/// Deletes processed rows older than the cutoff, at most 1000 per call so a
/// cleanup pass never holds long locks.
pub async fn delete_processed_older_than<C: ConnectionTrait>(
    conn: &C,
    cutoff: DateTime<Utc>,
) -> Result<u64, ServiceError> {
    let ids: Vec<Uuid> = OutboxEntity::find()
        .select_only()
        .column(outbox_event::Column::Id)
        .filter(outbox_event::Column::Processed.eq(true))
        .filter(outbox_event::Column::CreatedAt.lt(cutoff))
        .limit(1000)
        .into_tuple()
        .all(conn)
        .await?;

    if ids.is_empty() {
        return Ok(0);
    }

    let result = OutboxEntity::delete_many()
        .filter(outbox_event::Column::Id.is_in(ids))
        .exec(conn)
        .await?;
    Ok(result.rows_affected)
}
