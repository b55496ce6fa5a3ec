mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chrono::Utc;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, Set};
use serde_json::json;
use tower::ServiceExt;
use uuid::Uuid;

use platter::auth::{JwtVerifier, Role};
use platter::entities::notification;

use common::*;

async fn api() -> (platter::app::Platform, axum::Router) {
    let platform = frozen_platform().await;
    let verifier = Arc::new(JwtVerifier::hmac(JWT_SECRET, "platter"));
    let router = platform.router(verifier);
    (platform, router)
}

#[tokio::test]
async fn requests_without_a_token_are_unauthorized() {
    let (_platform, router) = api().await;

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/orders")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({ "store_id": Uuid::new_v4(), "shipping_address": "x", "items": [] })
                        .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn empty_item_list_is_a_bad_request() {
    let (_platform, router) = api().await;
    let token = mint_token(Uuid::new_v4(), &[Role::Customer], None);

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/orders")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::from(
                    json!({ "store_id": Uuid::new_v4(), "shipping_address": "12 Harbor Rd", "items": [] })
                        .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_order_is_not_found() {
    let (_platform, router) = api().await;
    let token = mint_token(Uuid::new_v4(), &[Role::Customer], None);

    let response = router
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/api/v1/orders/{}", Uuid::new_v4()))
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn accepting_without_a_store_claim_is_forbidden() {
    let (platform, router) = api().await;

    let customer = Uuid::new_v4();
    let store = seed_store(&platform.store_db, Uuid::new_v4()).await;
    let udon = seed_product(&platform.store_db, store.id, "Udon", dec!(12.99), 5).await;
    seed_snapshot(&platform.order_db, &udon, 5).await;

    let order = platform
        .orders
        .create_order(
            customer,
            platter::services::orders::CreateOrderRequest {
                store_id: store.id,
                shipping_address: "12 Harbor Rd".into(),
                items: vec![platter::services::orders::CreateOrderItemRequest {
                    product_id: udon.id,
                    quantity: 1,
                }],
            },
        )
        .await
        .expect("create order");

    let token = mint_token(customer, &[Role::Customer], None);
    let response = router
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri(format!("/api/v1/orders/{}/accept", order.id))
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn courier_self_service_updates_status_and_location() {
    let (platform, router) = api().await;

    let courier = Uuid::new_v4();
    seed_courier(&platform.courier_db, courier).await;
    let token = mint_token(courier, &[Role::Courier], None);

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri("/api/v1/couriers/me/status")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::from(json!({ "status": "ON_BREAK" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri("/api/v1/couriers/me/location")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::from(json!({ "lat": 47.6062, "lng": -122.3321 }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let row = courier_row(&platform.courier_db, courier).await;
    assert_eq!(row.status, "ON_BREAK");
    assert_eq!(row.lat, Some(47.6062));
    assert!(row.location_updated_at.is_some());

    // A customer token has no business on the courier surface.
    let customer = mint_token(Uuid::new_v4(), &[Role::Customer], None);
    let response = router
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/api/v1/couriers/me")
                .header(header::AUTHORIZATION, format!("Bearer {}", customer))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn foreign_notifications_cannot_be_marked_read() {
    let (platform, router) = api().await;

    let owner_of_notification = Uuid::new_v4();
    let row = notification::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(owner_of_notification),
        kind: Set("ORDER_CREATED".into()),
        order_id: Set(Uuid::new_v4()),
        store_id: Set(None),
        courier_id: Set(None),
        message: Set("placed".into()),
        payload: Set("{}".into()),
        is_read: Set(false),
        delivered_at: Set(None),
        created_at: Set(Utc::now()),
    }
    .insert(platform.notification_db.as_ref())
    .await
    .expect("seed notification");

    let intruder = mint_token(Uuid::new_v4(), &[Role::Customer], None);
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/api/v1/notifications/{}/read", row.id))
                .header(header::AUTHORIZATION, format!("Bearer {}", intruder))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // The owner can, and repeating the call still succeeds.
    let owner_token = mint_token(owner_of_notification, &[Role::Customer], None);
    for _ in 0..2 {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri(format!("/api/v1/notifications/{}/read", row.id))
                    .header(header::AUTHORIZATION, format!("Bearer {}", owner_token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
