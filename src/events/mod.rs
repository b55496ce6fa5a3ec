//! Event definitions shared by all services: routing keys on the topic
//! exchange and the typed JSON payload carried under each key. Consumers
//! always pick the payload type by routing key, never by body shape.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod idempotency;
pub mod outbox;
pub mod publisher;
pub mod router;

/// Routing keys.
pub mod keys {
    pub const ORDER_CREATED: &str = "order.created";
    pub const ORDER_RESERVATION_REQUESTED: &str = "order.stock_reservation.requested";
    pub const ORDER_STOCK_RESERVED: &str = "order.stock_reserved";
    pub const ORDER_RESERVATION_FAILED: &str = "order.stock_reservation_failed";
    pub const ORDER_PREPARING: &str = "order.preparing";
    pub const ORDER_ASSIGNED: &str = "order.assigned";
    pub const ORDER_ON_THE_WAY: &str = "order.on_the_way";
    pub const ORDER_DELIVERED: &str = "order.delivered";
    pub const ORDER_CANCELLED: &str = "order.cancelled";

    /// Courier service → order service, carries the binding decision.
    pub const COURIER_ASSIGNED: &str = "courier.assigned";

    pub const PRODUCT_CREATED: &str = "product.created";
    pub const PRODUCT_UPDATED: &str = "product.updated";
    pub const PRODUCT_STOCK_UPDATED: &str = "product.stock.updated";
    pub const PRODUCT_STOCK_RESERVED: &str = "product.stock.reserved";
    pub const PRODUCT_STOCK_RESTORED: &str = "product.stock.restored";
    pub const PRODUCT_AVAILABILITY_UPDATED: &str = "product.availability.updated";
    pub const PRODUCT_DELETED: &str = "product.deleted";
}

/// Outbox aggregate discriminators.
pub mod aggregates {
    pub const ORDER: &str = "ORDER";
    pub const PRODUCT: &str = "PRODUCT";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub store_id: Uuid,
    pub status: String,
    pub total_price: Decimal,
    pub shipping_address: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReservationRequest {
    pub order_id: Uuid,
    pub store_id: Uuid,
    pub user_id: Uuid,
    pub items: Vec<LineItem>,
    pub shipping_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReserved {
    pub order_id: Uuid,
    pub store_id: Uuid,
    pub user_id: Uuid,
    pub pickup_address: String,
    pub items: Vec<LineItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReservationFailed {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPreparing {
    pub order_id: Uuid,
    pub store_id: Uuid,
    pub user_id: Uuid,
    pub pickup_address: String,
    pub shipping_address: String,
}

/// Internal courier-service → order-service binding message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourierAssigned {
    pub order_id: Uuid,
    pub courier_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAssigned {
    pub order_id: Uuid,
    pub store_id: Uuid,
    pub courier_id: Uuid,
    pub user_id: Uuid,
    pub pickup_address: String,
    pub shipping_address: String,
}

/// `order.on_the_way` / `order.delivered` envelope: the creation envelope
/// plus the courier working the order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderProgress {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub store_id: Uuid,
    pub status: String,
    pub total_price: Decimal,
    pub shipping_address: String,
    pub created_at: DateTime<Utc>,
    pub courier_id: Uuid,
}

/// Carries `old_status` so the compensator can decide whether stock was ever
/// deducted for this order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCancelled {
    pub order_id: Uuid,
    pub store_id: Uuid,
    pub user_id: Uuid,
    pub courier_id: Option<Uuid>,
    pub old_status: String,
    pub items: Vec<LineItem>,
}

/// Shared body for the `product.*` family (except `product.deleted`, which
/// carries the bare product id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductEvent {
    pub product_id: Uuid,
    pub store_id: Uuid,
    pub name: String,
    pub price: Decimal,
    pub stock: i32,
    pub available: bool,
}
