mod common;

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use platter::db;
use platter::schema;
use platter::services::notifications::{
    NotificationService, ServerFrame, SessionHandle, SessionRegistry,
};

use common::*;

async fn setup() -> (Arc<sea_orm::DatabaseConnection>, Arc<SessionRegistry>, NotificationService) {
    let db = Arc::new(db::connect("sqlite::memory:", 1).await.expect("connect"));
    schema::create_notification_tables(&db).await.expect("schema");
    let registry = Arc::new(SessionRegistry::new());
    let service = NotificationService::new(db.clone(), registry.clone());
    (db, registry, service)
}

fn session(registry: &SessionRegistry, user: Uuid) -> mpsc::UnboundedReceiver<ServerFrame> {
    let (tx, rx) = mpsc::unbounded_channel();
    registry.register(user, SessionHandle::new(Uuid::new_v4(), tx));
    rx
}

#[tokio::test]
async fn offline_notifications_queue_and_replay_on_reconnect() {
    let (db, registry, service) = setup().await;
    let user = Uuid::new_v4();
    let order_a = Uuid::new_v4();
    let order_b = Uuid::new_v4();

    // Nobody connected: both rows stay pending.
    service
        .record(user, "ORDER_CREATED", order_a, None, None, "placed".into(), "{}")
        .await
        .unwrap();
    service
        .record(user, "ORDER_PREPARING", order_b, None, None, "preparing".into(), "{}")
        .await
        .unwrap();
    let rows = notifications_for(&db, user).await;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|n| n.delivered_at.is_none()));

    // Reconnect and replay: both frames arrive, oldest first, and the rows
    // flip to delivered.
    let mut rx = session(&registry, user);
    let replayed = service.replay_pending(user).await.unwrap();
    assert_eq!(replayed, 2);

    let first = rx.try_recv().expect("first frame");
    let second = rx.try_recv().expect("second frame");
    match (first, second) {
        (
            ServerFrame::Notification { order_id: a, .. },
            ServerFrame::Notification { order_id: b, .. },
        ) => {
            assert_eq!(a, order_a);
            assert_eq!(b, order_b);
        }
        other => panic!("unexpected frames: {:?}", other),
    }

    let rows = notifications_for(&db, user).await;
    assert!(rows.iter().all(|n| n.delivered_at.is_some()));
}

#[tokio::test]
async fn pushes_reach_only_the_notified_user() {
    let (db, registry, service) = setup().await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let mut alice_rx = session(&registry, alice);
    let mut bob_rx = session(&registry, bob);

    service
        .record(alice, "ORDER_CREATED", Uuid::new_v4(), None, None, "placed".into(), "{}")
        .await
        .unwrap();

    assert!(alice_rx.try_recv().is_ok());
    assert!(bob_rx.try_recv().is_err(), "cross-user leak");

    let rows = notifications_for(&db, alice).await;
    assert!(rows[0].delivered_at.is_some(), "live push marks delivered");
}

#[tokio::test]
async fn duplicate_business_events_produce_one_row() {
    let (db, _registry, service) = setup().await;
    let user = Uuid::new_v4();
    let order = Uuid::new_v4();

    for _ in 0..3 {
        service
            .record(user, "ORDER_CREATED", order, None, None, "placed".into(), "{}")
            .await
            .unwrap();
    }
    assert_eq!(notifications_for(&db, user).await.len(), 1);
}

#[tokio::test]
async fn mark_read_is_owner_gated_and_idempotent() {
    let (_db, _registry, service) = setup().await;
    let user = Uuid::new_v4();
    let order = Uuid::new_v4();

    service
        .record(user, "ORDER_CREATED", order, None, None, "placed".into(), "{}")
        .await
        .unwrap();
    let row = service.unread(user).await.unwrap().remove(0);

    let first = service.mark_read(user, row.id).await.unwrap();
    assert!(first.is_read);
    let second = service.mark_read(user, row.id).await.unwrap();
    assert!(second.is_read, "second call still succeeds");

    let err = service.mark_read(Uuid::new_v4(), row.id).await.unwrap_err();
    assert!(matches!(err, platter::ServiceError::Validation(_)));

    assert!(service.unread(user).await.unwrap().is_empty());
}

#[tokio::test]
async fn history_pagination_boundaries() {
    let (_db, _registry, service) = setup().await;
    let user = Uuid::new_v4();

    for _ in 0..3 {
        service
            .record(user, "ORDER_CREATED", Uuid::new_v4(), None, None, "placed".into(), "{}")
            .await
            .unwrap();
    }

    let err = service.history(user, 0, 20).await.unwrap_err();
    assert!(matches!(err, platter::ServiceError::Validation(_)));

    // Oversized page size is clamped, not an error.
    let page = service.history(user, 1, 5_000).await.unwrap();
    assert_eq!(page.len(), 3);

    let second_page = service.history(user, 2, 2).await.unwrap();
    assert_eq!(second_page.len(), 1);
}
