use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::auth::{AuthenticatedUser, Role};
use crate::entities::order::{self, Entity as OrderEntity};
use crate::entities::order_item::{self, Entity as OrderItemEntity};
use crate::errors::ServiceError;
use crate::events::router::EventHandler;
use crate::events::{
    aggregates, keys, CourierAssigned, LineItem, OrderAssigned, OrderCancelled, OrderCreated,
    OrderPreparing, OrderProgress, StockReservationRequest, StockReserved,
    StockReservationFailed,
};
use crate::events::outbox;
use crate::message_queue::Delivery;
use crate::services::order_state::{authorize_transition, Actor, OrderFacts, OrderStatus};
use crate::services::snapshot;

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    pub store_id: Uuid,
    #[validate(length(min = 1, max = 255))]
    pub shipping_address: String,
    #[validate]
    pub items: Vec<CreateOrderItemRequest>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateOrderItemRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1, message = "quantity must be positive"))]
    pub quantity: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderItemResponse {
    pub product_id: Uuid,
    pub product_name: String,
    pub price: Decimal,
    pub quantity: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderResponse {
    pub id: Uuid,
    pub user_id: Uuid,
    pub store_id: Uuid,
    pub courier_id: Option<Uuid>,
    pub status: OrderStatus,
    pub total_price: Decimal,
    pub shipping_address: String,
    pub pickup_address: Option<String>,
    pub items: Vec<OrderItemResponse>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct OrderListResponse {
    pub orders: Vec<OrderResponse>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

fn parse_status(raw: &str) -> Result<OrderStatus, ServiceError> {
    raw.parse::<OrderStatus>()
        .map_err(|_| ServiceError::Internal(format!("corrupt order status {:?}", raw)))
}

async fn load_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<order::Model, ServiceError> {
    OrderEntity::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("order {} not found", order_id)))
}

async fn load_items<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<Vec<order_item::Model>, ServiceError> {
    let items = OrderItemEntity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .all(conn)
        .await?;
    Ok(items)
}

fn line_items(items: &[order_item::Model]) -> Vec<LineItem> {
    items
        .iter()
        .map(|i| LineItem {
            product_id: i.product_id,
            quantity: i.quantity,
        })
        .collect()
}

fn facts(order: &order::Model) -> Result<OrderFacts, ServiceError> {
    Ok(OrderFacts {
        user_id: order.user_id,
        store_id: order.store_id,
        courier_id: order.courier_id,
        status: parse_status(&order.status)?,
    })
}

/// Order service. Every transition is read-validate-write inside a single
/// transaction, with the outbox append sharing that transaction.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &DatabaseConnection {
        self.db.as_ref()
    }

    /// Creates a PENDING order. Item names and prices are snapshotted from
    /// the local catalog copy; the authoritative stock check happens later,
    /// in the reservation saga.
    #[instrument(skip(self, request), fields(user_id = %user_id, store_id = %request.store_id))]
    pub async fn create_order(
        &self,
        user_id: Uuid,
        request: CreateOrderRequest,
    ) -> Result<OrderResponse, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::Validation(e.to_string()))?;
        if request.items.is_empty() {
            return Err(ServiceError::Validation(
                "order must contain at least one item".into(),
            ));
        }

        let product_ids: Vec<Uuid> = request.items.iter().map(|i| i.product_id).collect();
        let snapshots = snapshot::find_all(self.db.as_ref(), &product_ids).await?;

        let mut total = Decimal::ZERO;
        let mut items = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let snap = snapshots
                .get(&item.product_id)
                .ok_or(ServiceError::ProductNotFound(item.product_id))?;
            if snap.store_id != request.store_id {
                return Err(ServiceError::StoreMismatch(item.product_id));
            }
            if !snap.available {
                return Err(ServiceError::InvalidState(format!(
                    "product {} is not available",
                    snap.name
                )));
            }
            if snap.stock < item.quantity {
                return Err(ServiceError::InsufficientStock(item.product_id));
            }
            total += snap.price * Decimal::from(item.quantity);
            items.push((item.product_id, snap.name.clone(), snap.price, item.quantity));
        }

        let order_id = Uuid::new_v4();
        let now = Utc::now();

        let txn = self.db.begin().await?;

        order::ActiveModel {
            id: Set(order_id),
            user_id: Set(user_id),
            store_id: Set(request.store_id),
            courier_id: Set(None),
            status: Set(OrderStatus::Pending.to_string()),
            total_price: Set(total),
            shipping_address: Set(request.shipping_address.clone()),
            pickup_address: Set(None),
            created_at: Set(now),
            updated_at: Set(None),
        }
        .insert(&txn)
        .await?;

        for (product_id, name, price, quantity) in &items {
            order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(*product_id),
                product_name: Set(name.clone()),
                price: Set(*price),
                quantity: Set(*quantity),
            }
            .insert(&txn)
            .await?;
        }

        outbox::append(
            &txn,
            aggregates::ORDER,
            order_id,
            keys::ORDER_CREATED,
            &OrderCreated {
                order_id,
                user_id,
                store_id: request.store_id,
                status: OrderStatus::Pending.to_string(),
                total_price: total,
                shipping_address: request.shipping_address.clone(),
                created_at: now,
            },
        )
        .await?;

        txn.commit().await?;

        info!(order_id = %order_id, total = %total, "order created");
        self.get_order_unchecked(order_id).await
    }

    /// Store owner accepts: PENDING -> RESERVING_STOCK, and the reservation
    /// request goes out through the outbox.
    #[instrument(skip(self), fields(order_id = %order_id, store_id = %store_id))]
    pub async fn accept_order(
        &self,
        order_id: Uuid,
        store_id: Uuid,
    ) -> Result<OrderResponse, ServiceError> {
        let txn = self.db.begin().await?;

        let order = load_order(&txn, order_id).await?;
        authorize_transition(
            &facts(&order)?,
            OrderStatus::ReservingStock,
            &Actor::StoreOwner { store_id },
        )?;
        let items = load_items(&txn, order_id).await?;

        let request = StockReservationRequest {
            order_id,
            store_id: order.store_id,
            user_id: order.user_id,
            items: line_items(&items),
            shipping_address: order.shipping_address.clone(),
        };

        let mut active: order::ActiveModel = order.into();
        active.status = Set(OrderStatus::ReservingStock.to_string());
        active.updated_at = Set(Some(Utc::now()));
        active.update(&txn).await?;

        outbox::append(
            &txn,
            aggregates::ORDER,
            order_id,
            keys::ORDER_RESERVATION_REQUESTED,
            &request,
        )
        .await?;

        txn.commit().await?;

        info!(order_id = %order_id, "order accepted, stock reservation requested");
        self.get_order_unchecked(order_id).await
    }

    /// Assigned courier picks the order up: PREPARING -> ON_THE_WAY.
    #[instrument(skip(self), fields(order_id = %order_id, courier_id = %courier_id))]
    pub async fn pickup_order(
        &self,
        order_id: Uuid,
        courier_id: Uuid,
    ) -> Result<OrderResponse, ServiceError> {
        self.courier_progress(order_id, courier_id, OrderStatus::OnTheWay, keys::ORDER_ON_THE_WAY)
            .await
    }

    /// Assigned courier delivers: ON_THE_WAY -> DELIVERED.
    #[instrument(skip(self), fields(order_id = %order_id, courier_id = %courier_id))]
    pub async fn deliver_order(
        &self,
        order_id: Uuid,
        courier_id: Uuid,
    ) -> Result<OrderResponse, ServiceError> {
        self.courier_progress(order_id, courier_id, OrderStatus::Delivered, keys::ORDER_DELIVERED)
            .await
    }

    async fn courier_progress(
        &self,
        order_id: Uuid,
        courier_id: Uuid,
        to: OrderStatus,
        routing_key: &str,
    ) -> Result<OrderResponse, ServiceError> {
        let txn = self.db.begin().await?;

        let order = load_order(&txn, order_id).await?;
        authorize_transition(&facts(&order)?, to, &Actor::Courier { courier_id })?;

        let event = OrderProgress {
            order_id,
            user_id: order.user_id,
            store_id: order.store_id,
            status: to.to_string(),
            total_price: order.total_price,
            shipping_address: order.shipping_address.clone(),
            created_at: order.created_at,
            courier_id,
        };

        let mut active: order::ActiveModel = order.into();
        active.status = Set(to.to_string());
        active.updated_at = Set(Some(Utc::now()));
        active.update(&txn).await?;

        outbox::append(&txn, aggregates::ORDER, order_id, routing_key, &event).await?;

        txn.commit().await?;

        info!(order_id = %order_id, status = %to, "order moved by courier");
        self.get_order_unchecked(order_id).await
    }

    /// Cancels the order. Customers may cancel their own PENDING orders;
    /// store owners may cancel PENDING or PREPARING orders of their store.
    /// State is re-read and re-validated inside the transaction, so a
    /// concurrent transition loses cleanly.
    #[instrument(skip(self, user), fields(order_id = %order_id, user_id = %user.user_id))]
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        user: &AuthenticatedUser,
    ) -> Result<OrderResponse, ServiceError> {
        let txn = self.db.begin().await?;

        let order = load_order(&txn, order_id).await?;
        let old_status = parse_status(&order.status)?;

        let actor = if user.has_role(Role::StoreOwner) && user.store_id == Some(order.store_id) {
            Actor::StoreOwner {
                store_id: order.store_id,
            }
        } else {
            Actor::Customer {
                user_id: user.user_id,
            }
        };
        authorize_transition(&facts(&order)?, OrderStatus::Cancelled, &actor)?;

        let items = load_items(&txn, order_id).await?;
        let event = OrderCancelled {
            order_id,
            store_id: order.store_id,
            user_id: order.user_id,
            courier_id: order.courier_id,
            old_status: old_status.to_string(),
            items: line_items(&items),
        };

        let mut active: order::ActiveModel = order.into();
        active.status = Set(OrderStatus::Cancelled.to_string());
        active.updated_at = Set(Some(Utc::now()));
        active.update(&txn).await?;

        outbox::append(&txn, aggregates::ORDER, order_id, keys::ORDER_CANCELLED, &event).await?;

        txn.commit().await?;

        info!(order_id = %order_id, old_status = %old_status, "order cancelled");
        self.get_order_unchecked(order_id).await
    }

    /// Saga success reply: RESERVING_STOCK -> PREPARING with the pickup
    /// address from the store. A reply for an order no longer reserving is
    /// logged and absorbed.
    #[instrument(skip(self, reply), fields(order_id = %reply.order_id))]
    pub async fn promote_to_preparing(&self, reply: StockReserved) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        let order = match OrderEntity::find_by_id(reply.order_id).one(&txn).await? {
            Some(order) => order,
            None => {
                warn!(order_id = %reply.order_id, "reservation reply for unknown order");
                return Ok(());
            }
        };
        if parse_status(&order.status)? != OrderStatus::ReservingStock {
            warn!(
                order_id = %reply.order_id,
                status = %order.status,
                "late reservation reply ignored"
            );
            return Ok(());
        }
        authorize_transition(&facts(&order)?, OrderStatus::Preparing, &Actor::Saga)?;

        let event = OrderPreparing {
            order_id: reply.order_id,
            store_id: order.store_id,
            user_id: order.user_id,
            pickup_address: reply.pickup_address.clone(),
            shipping_address: order.shipping_address.clone(),
        };

        let mut active: order::ActiveModel = order.into();
        active.status = Set(OrderStatus::Preparing.to_string());
        active.pickup_address = Set(Some(reply.pickup_address));
        active.updated_at = Set(Some(Utc::now()));
        active.update(&txn).await?;

        outbox::append(
            &txn,
            aggregates::ORDER,
            reply.order_id,
            keys::ORDER_PREPARING,
            &event,
        )
        .await?;

        txn.commit().await?;

        info!(order_id = %reply.order_id, "stock reserved, order preparing");
        Ok(())
    }

    /// Saga failure reply: RESERVING_STOCK -> PENDING. Items and total are
    /// untouched; the customer may retry or cancel.
    #[instrument(skip(self, reply), fields(order_id = %reply.order_id))]
    pub async fn revert_to_pending(
        &self,
        reply: StockReservationFailed,
    ) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        let order = match OrderEntity::find_by_id(reply.order_id).one(&txn).await? {
            Some(order) => order,
            None => {
                warn!(order_id = %reply.order_id, "reservation failure for unknown order");
                return Ok(());
            }
        };
        if parse_status(&order.status)? != OrderStatus::ReservingStock {
            warn!(
                order_id = %reply.order_id,
                status = %order.status,
                "late reservation failure ignored"
            );
            return Ok(());
        }
        authorize_transition(&facts(&order)?, OrderStatus::Pending, &Actor::Saga)?;

        let mut active: order::ActiveModel = order.into();
        active.status = Set(OrderStatus::Pending.to_string());
        active.updated_at = Set(Some(Utc::now()));
        active.update(&txn).await?;

        txn.commit().await?;

        warn!(
            order_id = %reply.order_id,
            reason = %reply.reason,
            "stock reservation failed, order back to pending"
        );
        Ok(())
    }

    /// Courier service decision: bind the courier to a PREPARING order and
    /// announce the assignment. Replays of the same binding are absorbed.
    #[instrument(skip(self, assignment), fields(order_id = %assignment.order_id))]
    pub async fn apply_courier_assignment(
        &self,
        assignment: CourierAssigned,
    ) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        let order = match OrderEntity::find_by_id(assignment.order_id).one(&txn).await? {
            Some(order) => order,
            None => {
                warn!(order_id = %assignment.order_id, "assignment for unknown order");
                return Ok(());
            }
        };
        if parse_status(&order.status)? != OrderStatus::Preparing {
            warn!(
                order_id = %assignment.order_id,
                status = %order.status,
                "assignment for order not preparing, ignored"
            );
            return Ok(());
        }
        match order.courier_id {
            Some(existing) if existing == assignment.courier_id => return Ok(()),
            Some(existing) => {
                warn!(
                    order_id = %assignment.order_id,
                    courier_id = %existing,
                    "order already assigned, ignoring second courier"
                );
                return Ok(());
            }
            None => {}
        }

        let event = OrderAssigned {
            order_id: assignment.order_id,
            store_id: order.store_id,
            courier_id: assignment.courier_id,
            user_id: order.user_id,
            pickup_address: order.pickup_address.clone().unwrap_or_default(),
            shipping_address: order.shipping_address.clone(),
        };

        let mut active: order::ActiveModel = order.into();
        active.courier_id = Set(Some(assignment.courier_id));
        active.updated_at = Set(Some(Utc::now()));
        active.update(&txn).await?;

        outbox::append(
            &txn,
            aggregates::ORDER,
            assignment.order_id,
            keys::ORDER_ASSIGNED,
            &event,
        )
        .await?;

        txn.commit().await?;

        info!(
            order_id = %assignment.order_id,
            courier_id = %assignment.courier_id,
            "courier bound to order"
        );
        Ok(())
    }

    /// Fetches an order for its customer, the store's owner, or the assigned
    /// courier.
    #[instrument(skip(self, user), fields(order_id = %order_id))]
    pub async fn get_order(
        &self,
        order_id: Uuid,
        user: &AuthenticatedUser,
    ) -> Result<OrderResponse, ServiceError> {
        let order = load_order(self.db.as_ref(), order_id).await?;

        let is_customer = order.user_id == user.user_id;
        let is_store_owner =
            user.has_role(Role::StoreOwner) && user.store_id == Some(order.store_id);
        let is_courier = order.courier_id == Some(user.user_id);
        if !(is_customer || is_store_owner || is_courier) {
            return Err(ServiceError::Forbidden("order is not visible to you".into()));
        }

        let items = load_items(self.db.as_ref(), order_id).await?;
        Ok(to_response(order, items))
    }

    /// Customer's own orders, newest first.
    #[instrument(skip(self))]
    pub async fn list_my_orders(
        &self,
        user_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<OrderListResponse, ServiceError> {
        if page == 0 {
            return Err(ServiceError::Validation("page starts at 1".into()));
        }
        let per_page = per_page.clamp(1, 100);

        let paginator = OrderEntity::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .paginate(self.db.as_ref(), per_page);

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page - 1).await?;

        let mut responses = Vec::with_capacity(orders.len());
        for order in orders {
            let items = load_items(self.db.as_ref(), order.id).await?;
            responses.push(to_response(order, items));
        }

        Ok(OrderListResponse {
            orders: responses,
            total,
            page,
            per_page,
        })
    }

    async fn get_order_unchecked(&self, order_id: Uuid) -> Result<OrderResponse, ServiceError> {
        let order = load_order(self.db.as_ref(), order_id).await?;
        let items = load_items(self.db.as_ref(), order_id).await?;
        Ok(to_response(order, items))
    }
}

fn to_response(order: order::Model, items: Vec<order_item::Model>) -> OrderResponse {
    let status = order
        .status
        .parse::<OrderStatus>()
        .unwrap_or(OrderStatus::Pending);
    OrderResponse {
        id: order.id,
        user_id: order.user_id,
        store_id: order.store_id,
        courier_id: order.courier_id,
        status,
        total_price: order.total_price,
        shipping_address: order.shipping_address,
        pickup_address: order.pickup_address,
        items: items
            .into_iter()
            .map(|i| OrderItemResponse {
                product_id: i.product_id,
                product_name: i.product_name,
                price: i.price,
                quantity: i.quantity,
            })
            .collect(),
        created_at: order.created_at,
    }
}

/// `order.stock_reserved` consumer.
pub struct StockReservedHandler {
    pub orders: Arc<OrderService>,
}

#[async_trait]
impl EventHandler for StockReservedHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), ServiceError> {
        let reply: StockReserved = serde_json::from_str(&delivery.payload)?;
        self.orders.promote_to_preparing(reply).await
    }
}

/// `order.stock_reservation_failed` consumer.
pub struct ReservationFailedHandler {
    pub orders: Arc<OrderService>,
}

#[async_trait]
impl EventHandler for ReservationFailedHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), ServiceError> {
        let reply: StockReservationFailed = serde_json::from_str(&delivery.payload)?;
        self.orders.revert_to_pending(reply).await
    }
}

/// `courier.assigned` consumer.
pub struct CourierAssignedHandler {
    pub orders: Arc<OrderService>,
}

#[async_trait]
impl EventHandler for CourierAssignedHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), ServiceError> {
        let assignment: CourierAssigned = serde_json::from_str(&delivery.payload)?;
        self.orders.apply_courier_assignment(assignment).await
    }
}
