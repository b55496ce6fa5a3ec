mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, Set, TransactionTrait};
use serde_json::json;
use uuid::Uuid;

use platter::db;
use platter::entities::outbox_event;
use platter::events::outbox;
use platter::events::publisher::OutboxPublisher;
use platter::schema;
use platter::services::orders::{CreateOrderItemRequest, CreateOrderRequest};

use common::*;

#[tokio::test]
async fn a_key_is_claimed_exactly_once() {
    use platter::events::idempotency;

    let db = db::connect("sqlite::memory:", 1).await.expect("connect");
    schema::create_store_tables(&db).await.expect("schema");

    let key = idempotency::event_key("RESERVE_STOCK", Uuid::new_v4());
    assert!(idempotency::try_claim(&db, &key).await.expect("first claim"));
    assert!(!idempotency::try_claim(&db, &key).await.expect("second claim"));

    // Concurrent claimants on a fresh key: exactly one wins.
    let db = std::sync::Arc::new(db);
    let key = idempotency::event_key("CANCEL_ORDER", Uuid::new_v4());
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let db = db.clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            idempotency::try_claim(db.as_ref(), &key).await.expect("claim")
        }));
    }
    let mut winners = 0;
    for task in tasks {
        if task.await.expect("task") {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn rolled_back_transactions_leave_no_events() {
    let db = db::connect("sqlite::memory:", 1).await.expect("connect");
    schema::create_order_tables(&db).await.expect("schema");

    let txn = db.begin().await.expect("begin");
    outbox::append(
        &txn,
        "ORDER",
        Uuid::new_v4(),
        "order.created",
        &json!({ "probe": true }),
    )
    .await
    .expect("append");
    drop(txn); // rollback

    let pending = outbox::fetch_pending_batch(&db, 10).await.expect("fetch");
    assert!(pending.is_empty(), "no orphan events after rollback");
}

#[tokio::test]
async fn drain_publishes_once_and_keeps_failed_rows_pending() {
    let platform = frozen_platform().await;
    let customer = Uuid::new_v4();

    let store = seed_store(&platform.store_db, Uuid::new_v4()).await;
    let udon = seed_product(&platform.store_db, store.id, "Udon", dec!(12.99), 5).await;
    seed_snapshot(&platform.order_db, &udon, 5).await;

    platform
        .orders
        .create_order(
            customer,
            CreateOrderRequest {
                store_id: store.id,
                shipping_address: "12 Harbor Rd".into(),
                items: vec![CreateOrderItemRequest {
                    product_id: udon.id,
                    quantity: 1,
                }],
            },
        )
        .await
        .expect("create order");

    let publisher = OutboxPublisher::new(
        "order",
        platform.order_db.clone(),
        platform.broker.clone(),
        test_config().outbox,
    );

    assert_eq!(publisher.drain_once().await.expect("drain"), 1);
    assert_eq!(publisher.drain_once().await.expect("drain"), 0, "row is processed");

    // Kill every consumer: the queues close and publishing starts failing.
    platform.abort_consumers();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    platform
        .orders
        .create_order(
            customer,
            CreateOrderRequest {
                store_id: store.id,
                shipping_address: "12 Harbor Rd".into(),
                items: vec![CreateOrderItemRequest {
                    product_id: udon.id,
                    quantity: 1,
                }],
            },
        )
        .await
        .expect("create order");

    assert_eq!(
        publisher.drain_once().await.expect("drain survives broker failure"),
        0
    );
    let pending = outbox::fetch_pending_batch(platform.order_db.as_ref(), 10)
        .await
        .expect("fetch");
    assert_eq!(pending.len(), 1, "failed row stays pending for the next tick");
}

#[tokio::test]
async fn cleanup_evicts_only_old_processed_rows() {
    let platform = frozen_platform().await;

    let old = outbox_event::ActiveModel {
        id: Set(Uuid::new_v4()),
        aggregate_type: Set("ORDER".into()),
        aggregate_id: Set(Uuid::new_v4()),
        event_type: Set("order.created".into()),
        payload: Set("{}".into()),
        created_at: Set(Utc::now() - Duration::days(2)),
        processed: Set(true),
    };
    old.insert(platform.order_db.as_ref()).await.expect("seed old row");

    let fresh = outbox_event::ActiveModel {
        id: Set(Uuid::new_v4()),
        aggregate_type: Set("ORDER".into()),
        aggregate_id: Set(Uuid::new_v4()),
        event_type: Set("order.created".into()),
        payload: Set("{}".into()),
        created_at: Set(Utc::now()),
        processed: Set(true),
    };
    fresh.insert(platform.order_db.as_ref()).await.expect("seed fresh row");

    let pending_forever = outbox_event::ActiveModel {
        id: Set(Uuid::new_v4()),
        aggregate_type: Set("ORDER".into()),
        aggregate_id: Set(Uuid::new_v4()),
        event_type: Set("order.created".into()),
        payload: Set("{}".into()),
        created_at: Set(Utc::now() - Duration::days(2)),
        processed: Set(false),
    };
    pending_forever
        .insert(platform.order_db.as_ref())
        .await
        .expect("seed pending row");

    let publisher = Arc::new(OutboxPublisher::new(
        "order",
        platform.order_db.clone(),
        platform.broker.clone(),
        test_config().outbox,
    ));

    assert_eq!(publisher.cleanup_once().await.expect("cleanup"), 1);

    // The unprocessed row survives regardless of age.
    let remaining = outbox::fetch_pending_batch(platform.order_db.as_ref(), 10)
        .await
        .expect("fetch");
    assert_eq!(remaining.len(), 1);
}
