use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, TransactionTrait,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::entities::product::{self, Entity as ProductEntity};
use crate::entities::store::{self, Entity as StoreEntity};
use crate::errors::ServiceError;
use crate::events::router::EventHandler;
use crate::events::{
    aggregates, idempotency, keys, outbox, LineItem, OrderCancelled, ProductEvent,
    StockReservationFailed, StockReservationRequest, StockReserved,
};
use crate::message_queue::Delivery;
use crate::services::order_state::OrderStatus;

const RESERVE_STOCK_OP: &str = "RESERVE_STOCK";
const CANCEL_ORDER_OP: &str = "CANCEL_ORDER";

/// Conditional decrement: `stock := stock - qty` only where `stock >= qty`,
/// flipping `available` off when the row hits zero. Returns rows affected;
/// 0 means insufficient stock and the caller must fail its transaction.
pub async fn decrease_stock<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    quantity: i32,
) -> Result<u64, ServiceError> {
    let result = ProductEntity::update_many()
        .col_expr(
            product::Column::Stock,
            Expr::col(product::Column::Stock).sub(quantity),
        )
        .col_expr(
            product::Column::Available,
            Expr::case(
                Expr::expr(Expr::col(product::Column::Stock).sub(quantity)).lte(0),
                Expr::value(false),
            )
            .finally(Expr::col(product::Column::Available))
            .into(),
        )
        .filter(product::Column::Id.eq(product_id))
        .filter(product::Column::Stock.gte(quantity))
        .exec(conn)
        .await?;
    Ok(result.rows_affected)
}

/// Unconditional increment; re-enables `available` only on the 0 -> positive
/// crossing, so a manually disabled product stays disabled.
pub async fn restore_stock<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    quantity: i32,
) -> Result<(), ServiceError> {
    let result = ProductEntity::update_many()
        .col_expr(
            product::Column::Stock,
            Expr::col(product::Column::Stock).add(quantity),
        )
        .col_expr(
            product::Column::Available,
            Expr::case(Expr::col(product::Column::Stock).eq(0), Expr::value(true))
                .finally(Expr::col(product::Column::Available))
                .into(),
        )
        .filter(product::Column::Id.eq(product_id))
        .exec(conn)
        .await?;
    if result.rows_affected == 0 {
        return Err(ServiceError::ProductNotFound(product_id));
    }
    Ok(())
}

/// Reserves every item or none: the first failure aborts the caller's
/// transaction, so partial reservations cannot survive.
pub async fn batch_reserve<C: ConnectionTrait>(
    conn: &C,
    store_id: Uuid,
    items: &[LineItem],
) -> Result<(), ServiceError> {
    for item in items {
        if item.quantity <= 0 {
            return Err(ServiceError::Validation(format!(
                "quantity for product {} must be positive",
                item.product_id
            )));
        }
        let product = ProductEntity::find_by_id(item.product_id)
            .one(conn)
            .await?
            .ok_or(ServiceError::ProductNotFound(item.product_id))?;
        if product.store_id != store_id {
            return Err(ServiceError::StoreMismatch(item.product_id));
        }
        if !product.available {
            return Err(ServiceError::InvalidState("Product not available".into()));
        }
        if decrease_stock(conn, item.product_id, item.quantity).await? == 0 {
            return Err(ServiceError::InsufficientStock(item.product_id));
        }
    }
    Ok(())
}

pub async fn batch_restore<C: ConnectionTrait>(
    conn: &C,
    items: &[LineItem],
) -> Result<(), ServiceError> {
    for item in items {
        restore_stock(conn, item.product_id, item.quantity).await?;
    }
    Ok(())
}

/// Store-side resource manager for the reservation saga plus the
/// cancellation compensator.
#[derive(Clone)]
pub struct StockService {
    db: Arc<DatabaseConnection>,
}

impl StockService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &DatabaseConnection {
        self.db.as_ref()
    }

    /// Handles `order.stock_reservation.requested`.
    ///
    /// The idempotency key is claimed before any work so a broker redelivery
    /// of an already-settled request is dropped without touching stock. On a
    /// domain failure the business transaction rolls back and the failure
    /// reply is appended in a fresh transaction, committing independently.
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn process_reservation(
        &self,
        request: StockReservationRequest,
    ) -> Result<(), ServiceError> {
        let key = idempotency::event_key(RESERVE_STOCK_OP, request.order_id);
        if !idempotency::try_claim(self.db.as_ref(), &key).await? {
            info!(order_id = %request.order_id, "duplicate reservation request dropped");
            return Ok(());
        }

        match self.reserve_and_reply(&request).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_domain() => {
                warn!(
                    order_id = %request.order_id,
                    reason = %e,
                    "reservation rejected, replying with failure"
                );
                self.append_failure_reply(&request, &e).await
            }
            Err(e) => Err(e),
        }
    }

    async fn reserve_and_reply(
        &self,
        request: &StockReservationRequest,
    ) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        batch_reserve(&txn, request.store_id, &request.items).await?;

        let store = StoreEntity::find_by_id(request.store_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::InvalidState(format!("store {} is not registered", request.store_id))
            })?;
        if !store.open {
            return Err(ServiceError::InvalidState(format!(
                "store {} is closed",
                store.name
            )));
        }

        for item in &request.items {
            let product = ProductEntity::find_by_id(item.product_id)
                .one(&txn)
                .await?
                .ok_or(ServiceError::ProductNotFound(item.product_id))?;
            outbox::append(
                &txn,
                aggregates::PRODUCT,
                product.id,
                keys::PRODUCT_STOCK_RESERVED,
                &product_event(&product),
            )
            .await?;
        }

        outbox::append(
            &txn,
            aggregates::ORDER,
            request.order_id,
            keys::ORDER_STOCK_RESERVED,
            &StockReserved {
                order_id: request.order_id,
                store_id: request.store_id,
                user_id: request.user_id,
                pickup_address: store.address,
                items: request.items.clone(),
            },
        )
        .await?;

        txn.commit().await?;

        info!(order_id = %request.order_id, "stock reserved");
        Ok(())
    }

    async fn append_failure_reply(
        &self,
        request: &StockReservationRequest,
        cause: &ServiceError,
    ) -> Result<(), ServiceError> {
        outbox::append(
            self.db.as_ref(),
            aggregates::ORDER,
            request.order_id,
            keys::ORDER_RESERVATION_FAILED,
            &StockReservationFailed {
                order_id: request.order_id,
                user_id: request.user_id,
                reason: failure_reason(cause),
            },
        )
        .await
    }

    /// Handles `order.cancelled`. Stock is restored only when the order's
    /// last pre-cancellation status implies it was deducted; restoring in any
    /// other case would mint ghost inventory. The key is claimed inside the
    /// transaction so replays are absorbed in both paths.
    #[instrument(skip(self, event), fields(order_id = %event.order_id, old_status = %event.old_status))]
    pub async fn compensate_cancellation(&self, event: OrderCancelled) -> Result<(), ServiceError> {
        let old_status = event
            .old_status
            .parse::<OrderStatus>()
            .map_err(|_| ServiceError::Internal(format!("corrupt old status {:?}", event.old_status)))?;

        let txn = self.db.begin().await?;

        let key = idempotency::event_key(CANCEL_ORDER_OP, event.order_id);
        if !idempotency::try_claim(&txn, &key).await? {
            info!(order_id = %event.order_id, "duplicate cancellation event dropped");
            return Ok(());
        }

        if old_status.stock_deducted() {
            batch_restore(&txn, &event.items).await?;
            for item in &event.items {
                let product = ProductEntity::find_by_id(item.product_id)
                    .one(&txn)
                    .await?
                    .ok_or(ServiceError::ProductNotFound(item.product_id))?;
                outbox::append(
                    &txn,
                    aggregates::PRODUCT,
                    product.id,
                    keys::PRODUCT_STOCK_RESTORED,
                    &product_event(&product),
                )
                .await?;
            }
            info!(order_id = %event.order_id, "stock restored after cancellation");
        } else {
            info!(
                order_id = %event.order_id,
                "cancelled before stock deduction, nothing to restore"
            );
        }

        txn.commit().await?;
        Ok(())
    }
}

fn product_event(product: &product::Model) -> ProductEvent {
    ProductEvent {
        product_id: product.id,
        store_id: product.store_id,
        name: product.name.clone(),
        price: product.price,
        stock: product.stock,
        available: product.available,
    }
}

fn failure_reason(cause: &ServiceError) -> String {
    match cause {
        ServiceError::InsufficientStock(_) | ServiceError::ProductNotFound(_) => {
            "Product not available".to_string()
        }
        ServiceError::InvalidState(msg) | ServiceError::Validation(msg) => msg.clone(),
        other => other.to_string(),
    }
}

/// `order.stock_reservation.requested` consumer.
pub struct ReservationRequestHandler {
    pub stock: Arc<StockService>,
}

#[async_trait]
impl EventHandler for ReservationRequestHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), ServiceError> {
        let request: StockReservationRequest = serde_json::from_str(&delivery.payload)?;
        self.stock.process_reservation(request).await
    }
}

/// `order.cancelled` consumer (compensator).
pub struct OrderCancelledHandler {
    pub stock: Arc<StockService>,
}

#[async_trait]
impl EventHandler for OrderCancelledHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), ServiceError> {
        let event: OrderCancelled = serde_json::from_str(&delivery.payload)?;
        self.stock.compensate_cancellation(event).await
    }
}
