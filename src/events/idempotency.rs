//! Idempotency store. Claiming a key is an insert-or-ignore on the primary
//! key; under a concurrent race exactly one caller gets `true`. There is no
//! check-then-insert variant on purpose.

use sea_orm::sea_query::OnConflict;
use sea_orm::{ConnectionTrait, EntityTrait, Set};

use crate::entities::processed_event::{self, Entity as ProcessedEventEntity};
use crate::errors::ServiceError;

/// Builds the conventional `<OPERATION>:<aggregateId>` key.
pub fn event_key(operation: &str, aggregate_id: impl std::fmt::Display) -> String {
    format!("{}:{}", operation, aggregate_id)
}

/// Returns true iff this call inserted the key.
pub async fn try_claim<C: ConnectionTrait>(conn: &C, key: &str) -> Result<bool, ServiceError> {
    let row = processed_event::ActiveModel {
        event_key: Set(key.to_string()),
    };
    let inserted = ProcessedEventEntity::insert(row)
        .on_conflict(
            OnConflict::column(processed_event::Column::EventKey)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;
    Ok(inserted == 1)
}
