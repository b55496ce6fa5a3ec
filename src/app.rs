//! Process composition. Wires the four services — each with its own private
//! database — onto one topic broker: queue declarations, consumer routers and
//! outbox publishers. `main` and the integration harness build the same
//! platform from a config.

use std::sync::Arc;

use sea_orm::DatabaseConnection;
use tokio::task::JoinHandle;
use tracing::info;

use crate::auth::JwtVerifier;
use crate::config::AppConfig;
use crate::db;
use crate::errors::ServiceError;
use crate::events::publisher::OutboxPublisher;
use crate::events::router::EventRouter;
use crate::events::keys;
use crate::handlers;
use crate::message_queue::{TopicBroker, EXCHANGE};
use crate::schema;
use crate::services::couriers::{CourierService, OrderClosedHandler, OrderPreparingHandler};
use crate::services::notifications::{
    NotificationService, OrderNotificationHandler, SessionRegistry,
};
use crate::services::orders::{
    CourierAssignedHandler, OrderService, ReservationFailedHandler, StockReservedHandler,
};
use crate::services::snapshot::{ProductEventHandler, SnapshotCache};
use crate::services::stock::{OrderCancelledHandler, ReservationRequestHandler, StockService};

/// One queue per (consumer service, purpose).
pub mod queues {
    pub const ORDER_SAGA_REPLIES: &str = "order.saga.replies";
    pub const ORDER_COURIER_ASSIGNMENTS: &str = "order.courier.assignments";
    pub const ORDER_PRODUCT_SNAPSHOTS: &str = "order.product.snapshots";
    pub const STORE_RESERVATION_REQUESTS: &str = "store.reservation.requests";
    pub const STORE_CANCELLATIONS: &str = "store.cancellations";
    pub const COURIER_ORDER_EVENTS: &str = "courier.order.events";
    pub const NOTIFICATION_ORDER_EVENTS: &str = "notification.order.events";
}

pub struct Platform {
    pub broker: Arc<TopicBroker>,
    pub order_db: Arc<DatabaseConnection>,
    pub store_db: Arc<DatabaseConnection>,
    pub courier_db: Arc<DatabaseConnection>,
    pub notification_db: Arc<DatabaseConnection>,
    pub orders: Arc<OrderService>,
    pub stock: Arc<StockService>,
    pub couriers: Arc<CourierService>,
    pub notifications: Arc<NotificationService>,
    pub snapshots: SnapshotCache,
    pub registry: Arc<SessionRegistry>,
    publishers: Vec<Arc<OutboxPublisher>>,
    consumers: Vec<JoinHandle<()>>,
}

impl Platform {
    /// Connects the databases, declares the broker topology and attaches all
    /// consumers. Publishers are created but not started; call
    /// [`Platform::spawn_publishers`] (or tick them by hand in tests).
    pub async fn build(config: &AppConfig) -> Result<Self, ServiceError> {
        let order_db = Arc::new(db::connect(&config.order_db_url, config.db_max_connections).await?);
        let store_db = Arc::new(db::connect(&config.store_db_url, config.db_max_connections).await?);
        let courier_db =
            Arc::new(db::connect(&config.courier_db_url, config.db_max_connections).await?);
        let notification_db =
            Arc::new(db::connect(&config.notification_db_url, config.db_max_connections).await?);

        if config.auto_migrate {
            schema::create_order_tables(&order_db).await?;
            schema::create_store_tables(&store_db).await?;
            schema::create_courier_tables(&courier_db).await?;
            schema::create_notification_tables(&notification_db).await?;
        }

        let broker = Arc::new(TopicBroker::new());
        let max = config.broker.max_redeliveries;

        broker.declare_queue(
            queues::ORDER_SAGA_REPLIES,
            &[keys::ORDER_STOCK_RESERVED, keys::ORDER_RESERVATION_FAILED],
            max,
        );
        broker.declare_queue(queues::ORDER_COURIER_ASSIGNMENTS, &[keys::COURIER_ASSIGNED], max);
        broker.declare_queue(queues::ORDER_PRODUCT_SNAPSHOTS, &["product.#"], max);
        broker.declare_queue(
            queues::STORE_RESERVATION_REQUESTS,
            &[keys::ORDER_RESERVATION_REQUESTED],
            max,
        );
        broker.declare_queue(queues::STORE_CANCELLATIONS, &[keys::ORDER_CANCELLED], max);
        broker.declare_queue(
            queues::COURIER_ORDER_EVENTS,
            &[keys::ORDER_PREPARING, keys::ORDER_DELIVERED, keys::ORDER_CANCELLED],
            max,
        );
        broker.declare_queue(
            queues::NOTIFICATION_ORDER_EVENTS,
            &[
                keys::ORDER_CREATED,
                keys::ORDER_PREPARING,
                keys::ORDER_ON_THE_WAY,
                keys::ORDER_DELIVERED,
                keys::ORDER_CANCELLED,
                keys::ORDER_RESERVATION_FAILED,
            ],
            max,
        );

        let orders = Arc::new(OrderService::new(order_db.clone()));
        let snapshots = SnapshotCache::new(order_db.clone());
        let stock = Arc::new(StockService::new(store_db.clone()));
        let couriers = Arc::new(CourierService::new(courier_db.clone()));
        let registry = Arc::new(SessionRegistry::new());
        let notifications = Arc::new(NotificationService::new(
            notification_db.clone(),
            registry.clone(),
        ));

        let mut consumers = Vec::new();

        consumers.push(broker.consume(
            queues::ORDER_SAGA_REPLIES,
            Arc::new(
                EventRouter::new()
                    .on(
                        keys::ORDER_STOCK_RESERVED,
                        Arc::new(StockReservedHandler { orders: orders.clone() }),
                    )
                    .on(
                        keys::ORDER_RESERVATION_FAILED,
                        Arc::new(ReservationFailedHandler { orders: orders.clone() }),
                    ),
            ),
        )?);

        consumers.push(broker.consume(
            queues::ORDER_COURIER_ASSIGNMENTS,
            Arc::new(EventRouter::new().on(
                keys::COURIER_ASSIGNED,
                Arc::new(CourierAssignedHandler { orders: orders.clone() }),
            )),
        )?);

        let product_handler = Arc::new(ProductEventHandler {
            cache: snapshots.clone(),
        });
        let mut snapshot_router = EventRouter::new();
        for key in [
            keys::PRODUCT_CREATED,
            keys::PRODUCT_UPDATED,
            keys::PRODUCT_STOCK_UPDATED,
            keys::PRODUCT_STOCK_RESERVED,
            keys::PRODUCT_STOCK_RESTORED,
            keys::PRODUCT_AVAILABILITY_UPDATED,
            keys::PRODUCT_DELETED,
        ] {
            snapshot_router = snapshot_router.on(key, product_handler.clone());
        }
        consumers.push(broker.consume(queues::ORDER_PRODUCT_SNAPSHOTS, Arc::new(snapshot_router))?);

        consumers.push(broker.consume(
            queues::STORE_RESERVATION_REQUESTS,
            Arc::new(EventRouter::new().on(
                keys::ORDER_RESERVATION_REQUESTED,
                Arc::new(ReservationRequestHandler { stock: stock.clone() }),
            )),
        )?);

        consumers.push(broker.consume(
            queues::STORE_CANCELLATIONS,
            Arc::new(EventRouter::new().on(
                keys::ORDER_CANCELLED,
                Arc::new(OrderCancelledHandler { stock: stock.clone() }),
            )),
        )?);

        let closed_handler = Arc::new(OrderClosedHandler {
            couriers: couriers.clone(),
        });
        consumers.push(broker.consume(
            queues::COURIER_ORDER_EVENTS,
            Arc::new(
                EventRouter::new()
                    .on(
                        keys::ORDER_PREPARING,
                        Arc::new(OrderPreparingHandler { couriers: couriers.clone() }),
                    )
                    .on(keys::ORDER_DELIVERED, closed_handler.clone())
                    .on(keys::ORDER_CANCELLED, closed_handler),
            ),
        )?);

        let notification_handler = Arc::new(OrderNotificationHandler {
            notifications: notifications.clone(),
        });
        let mut notification_router = EventRouter::new();
        for key in [
            keys::ORDER_CREATED,
            keys::ORDER_PREPARING,
            keys::ORDER_ON_THE_WAY,
            keys::ORDER_DELIVERED,
            keys::ORDER_CANCELLED,
            keys::ORDER_RESERVATION_FAILED,
        ] {
            notification_router = notification_router.on(key, notification_handler.clone());
        }
        consumers.push(broker.consume(
            queues::NOTIFICATION_ORDER_EVENTS,
            Arc::new(notification_router),
        )?);

        let publishers = vec![
            Arc::new(OutboxPublisher::new(
                "order",
                order_db.clone(),
                broker.clone(),
                config.outbox.clone(),
            )),
            Arc::new(OutboxPublisher::new(
                "store",
                store_db.clone(),
                broker.clone(),
                config.outbox.clone(),
            )),
            Arc::new(OutboxPublisher::new(
                "courier",
                courier_db.clone(),
                broker.clone(),
                config.outbox.clone(),
            )),
            Arc::new(OutboxPublisher::new(
                "notification",
                notification_db.clone(),
                broker.clone(),
                config.outbox.clone(),
            )),
        ];

        info!(exchange = EXCHANGE, "platform wired");

        Ok(Self {
            broker,
            order_db,
            store_db,
            courier_db,
            notification_db,
            orders,
            stock,
            couriers,
            notifications,
            snapshots,
            registry,
            publishers,
            consumers,
        })
    }

    /// Starts the drain and cleanup loops of every service's publisher.
    pub fn spawn_publishers(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for publisher in &self.publishers {
            let (drain, cleanup) = publisher.clone().spawn();
            handles.push(drain);
            handles.push(cleanup);
        }
        handles
    }

    /// Full HTTP surface: the per-service routers plus the websocket.
    pub fn router(&self, verifier: Arc<JwtVerifier>) -> axum::Router {
        let order_state = handlers::orders::OrderAppState {
            orders: self.orders.clone(),
            verifier: verifier.clone(),
        };
        let courier_state = handlers::couriers::CourierAppState {
            couriers: self.couriers.clone(),
            verifier: verifier.clone(),
        };
        let notification_state = handlers::notifications::NotificationAppState {
            notifications: self.notifications.clone(),
            verifier,
        };

        axum::Router::new()
            .nest("/api/v1/orders", handlers::orders::routes(order_state))
            .nest("/api/v1/couriers", handlers::couriers::routes(courier_state))
            .nest(
                "/api/v1/notifications",
                handlers::notifications::routes(notification_state.clone()),
            )
            .merge(handlers::ws::routes(notification_state))
    }

    pub fn abort_consumers(&self) {
        for handle in &self.consumers {
            handle.abort();
        }
    }
}
