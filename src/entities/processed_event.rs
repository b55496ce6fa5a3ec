use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Idempotency ledger. The primary-key constraint on `event_key` is the
/// memory barrier: inserting is the only supported claim primitive.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "processed_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub event_key: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
