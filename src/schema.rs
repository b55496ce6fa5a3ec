//! Table bootstrap. Statements are generated from the entities so the DDL is
//! always correct for the connected backend (sqlite in development and tests,
//! postgres in deployment).

use sea_orm::{ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, Schema};

use crate::entities::{
    courier, notification, order, order_item, outbox_event, processed_event, product,
    product_snapshot, store,
};

async fn create_table<E: EntityTrait>(db: &DatabaseConnection, entity: E) -> Result<(), DbErr> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);
    let mut stmt = schema.create_table_from_entity(entity);
    stmt.if_not_exists();
    db.execute(backend.build(&stmt)).await?;
    Ok(())
}

async fn create_shared_tables(db: &DatabaseConnection) -> Result<(), DbErr> {
    create_table(db, outbox_event::Entity).await?;
    create_table(db, processed_event::Entity).await?;
    Ok(())
}

pub async fn create_order_tables(db: &DatabaseConnection) -> Result<(), DbErr> {
    create_table(db, order::Entity).await?;
    create_table(db, order_item::Entity).await?;
    create_table(db, product_snapshot::Entity).await?;
    create_shared_tables(db).await
}

pub async fn create_store_tables(db: &DatabaseConnection) -> Result<(), DbErr> {
    create_table(db, store::Entity).await?;
    create_table(db, product::Entity).await?;
    create_shared_tables(db).await
}

pub async fn create_courier_tables(db: &DatabaseConnection) -> Result<(), DbErr> {
    create_table(db, courier::Entity).await?;
    create_shared_tables(db).await
}

pub async fn create_notification_tables(db: &DatabaseConnection) -> Result<(), DbErr> {
    create_table(db, notification::Entity).await?;
    create_shared_tables(db).await
}
