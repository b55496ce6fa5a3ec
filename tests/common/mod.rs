//! Shared harness: an in-process platform over four in-memory databases and
//! the topic broker, plus seeding and polling helpers.

#![allow(dead_code)]

use std::collections::HashSet;
use std::future::Future;
use std::time::{Duration, Instant};

use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use serde_json::json;
use uuid::Uuid;

use platter::app::Platform;
use platter::auth::Role;
use platter::config::{AppConfig, BrokerConfig, JwtConfig, OutboxConfig};
use platter::entities::{courier, notification, order, outbox_event, product, product_snapshot, store};

pub const JWT_SECRET: &str = "integration-test-secret";

pub fn test_config() -> AppConfig {
    AppConfig {
        environment: "test".into(),
        host: "127.0.0.1".into(),
        port: 0,
        log_level: "warn".into(),
        log_json: false,
        order_db_url: "sqlite::memory:".into(),
        store_db_url: "sqlite::memory:".into(),
        courier_db_url: "sqlite::memory:".into(),
        notification_db_url: "sqlite::memory:".into(),
        db_max_connections: 1,
        auto_migrate: true,
        jwt: JwtConfig {
            algorithm: "HS256".into(),
            hmac_secret: Some(JWT_SECRET.into()),
            rsa_public_key_pem: None,
            client_id: "platter".into(),
        },
        outbox: OutboxConfig {
            drain_interval_ms: 25,
            drain_batch: 50,
            cleanup_interval_secs: 3600,
            processed_ttl_secs: 86_400,
        },
        broker: BrokerConfig {
            max_redeliveries: 5,
        },
    }
}

/// Platform with running outbox publishers: events flow end to end.
pub async fn running_platform() -> Platform {
    let platform = Platform::build(&test_config()).await.expect("platform");
    platform.spawn_publishers();
    platform
}

/// Platform without publishers: outbox rows stay pending, so transient
/// states (e.g. RESERVING_STOCK) can be observed deterministically.
pub async fn frozen_platform() -> Platform {
    Platform::build(&test_config()).await.expect("platform")
}

pub fn mint_token(user_id: Uuid, roles: &[Role], store_id: Option<Uuid>) -> String {
    let roles: Vec<String> = roles.iter().map(|r| r.to_string()).collect();
    let mut claims = json!({
        "sub": user_id.to_string(),
        "exp": Utc::now().timestamp() + 3600,
        "resource_access": { "platter": { "roles": roles } },
    });
    if let Some(store_id) = store_id {
        claims["store_id"] = json!(store_id.to_string());
    }
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("sign token")
}

pub async fn seed_store(db: &DatabaseConnection, owner_id: Uuid) -> store::Model {
    store::ActiveModel {
        id: Set(Uuid::new_v4()),
        owner_id: Set(owner_id),
        name: Set("Udon House".into()),
        address: Set("1 Pike Place".into()),
        open: Set(true),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("seed store")
}

pub async fn seed_product(
    db: &DatabaseConnection,
    store_id: Uuid,
    name: &str,
    price: Decimal,
    stock: i32,
) -> product::Model {
    product::ActiveModel {
        id: Set(Uuid::new_v4()),
        store_id: Set(store_id),
        category_id: Set(Uuid::new_v4()),
        name: Set(name.into()),
        price: Set(price),
        stock: Set(stock),
        available: Set(stock > 0),
        created_at: Set(Utc::now()),
        updated_at: Set(None),
    }
    .insert(db)
    .await
    .expect("seed product")
}

/// Seeds the order service's local snapshot for a product. Pass a different
/// `stock` than the store's row to model a stale cache.
pub async fn seed_snapshot(db: &DatabaseConnection, product: &product::Model, stock: i32) {
    product_snapshot::ActiveModel {
        product_id: Set(product.id),
        store_id: Set(product.store_id),
        name: Set(product.name.clone()),
        price: Set(product.price),
        stock: Set(stock),
        available: Set(stock > 0),
        updated_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("seed snapshot");
}

pub async fn seed_courier(db: &DatabaseConnection, courier_id: Uuid) -> courier::Model {
    courier::ActiveModel {
        id: Set(courier_id),
        status: Set("AVAILABLE".into()),
        lat: Set(None),
        lng: Set(None),
        location_updated_at: Set(None),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("seed courier")
}

pub async fn order_row(db: &DatabaseConnection, order_id: Uuid) -> order::Model {
    order::Entity::find_by_id(order_id)
        .one(db)
        .await
        .expect("query order")
        .expect("order exists")
}

pub async fn product_row(db: &DatabaseConnection, product_id: Uuid) -> product::Model {
    product::Entity::find_by_id(product_id)
        .one(db)
        .await
        .expect("query product")
        .expect("product exists")
}

pub async fn courier_row(db: &DatabaseConnection, courier_id: Uuid) -> courier::Model {
    courier::Entity::find_by_id(courier_id)
        .one(db)
        .await
        .expect("query courier")
        .expect("courier exists")
}

pub async fn notifications_for(db: &DatabaseConnection, user_id: Uuid) -> Vec<notification::Model> {
    notification::Entity::find()
        .filter(notification::Column::UserId.eq(user_id))
        .all(db)
        .await
        .expect("query notifications")
}

pub async fn notification_kinds(db: &DatabaseConnection, user_id: Uuid) -> HashSet<String> {
    notifications_for(db, user_id)
        .await
        .into_iter()
        .map(|n| n.kind)
        .collect()
}

pub async fn outbox_count(db: &DatabaseConnection, event_type: &str) -> u64 {
    use sea_orm::PaginatorTrait;
    outbox_event::Entity::find()
        .filter(outbox_event::Column::EventType.eq(event_type))
        .count(db)
        .await
        .expect("count outbox rows")
}

pub async fn claim_exists(db: &DatabaseConnection, key: &str) -> bool {
    use platter::entities::processed_event;
    processed_event::Entity::find_by_id(key.to_string())
        .one(db)
        .await
        .expect("query claim")
        .is_some()
}

/// Polls the condition until it holds or a 10s deadline passes.
pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if condition().await {
            return;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
