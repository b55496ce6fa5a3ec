//! sea-orm entities. Each service owns a disjoint subset of these tables in
//! its own database; the only tables every service carries are
//! `outbox_events` and `processed_events`.

pub mod courier;
pub mod notification;
pub mod order;
pub mod order_item;
pub mod outbox_event;
pub mod processed_event;
pub mod product;
pub mod product_snapshot;
pub mod store;
