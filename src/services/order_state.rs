//! Order lifecycle state machine. Transition legality and actor gating are
//! decided here, on plain values, so the rules are testable without a
//! database; the order service re-runs this check inside each transaction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    ReservingStock,
    Preparing,
    OnTheWay,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    /// Statuses in which stock has already been deducted. Cancellation from
    /// anywhere else must not restore stock (ghost-inventory prevention).
    pub fn stock_deducted(self) -> bool {
        matches!(self, OrderStatus::Preparing | OrderStatus::OnTheWay)
    }
}

/// Who is requesting the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Customer { user_id: Uuid },
    StoreOwner { store_id: Uuid },
    Courier { courier_id: Uuid },
    /// Reservation saga replies from the store service.
    Saga,
}

/// The slice of an order the state machine needs.
#[derive(Debug, Clone, Copy)]
pub struct OrderFacts {
    pub user_id: Uuid,
    pub store_id: Uuid,
    pub courier_id: Option<Uuid>,
    pub status: OrderStatus,
}

/// Validates `facts.status -> to` for the given actor.
///
/// Structural illegality (no actor may make this move) is `InvalidState`;
/// a move that exists but not for this actor or owner is `Forbidden`.
pub fn authorize_transition(
    facts: &OrderFacts,
    to: OrderStatus,
    actor: &Actor,
) -> Result<(), ServiceError> {
    use OrderStatus::*;

    let from = facts.status;

    if from.is_terminal() {
        return Err(ServiceError::InvalidState(format!(
            "order is {} and cannot change",
            from
        )));
    }

    match (from, to) {
        (Pending, ReservingStock) => match actor {
            Actor::StoreOwner { store_id } if *store_id == facts.store_id => Ok(()),
            Actor::StoreOwner { .. } => {
                Err(ServiceError::Forbidden("order belongs to another store".into()))
            }
            _ => Err(ServiceError::Forbidden(
                "only the store owner may accept an order".into(),
            )),
        },

        (ReservingStock, Preparing) | (ReservingStock, Pending) => match actor {
            Actor::Saga => Ok(()),
            _ => Err(ServiceError::Forbidden(
                "reservation outcomes are applied by the saga only".into(),
            )),
        },

        (Preparing, OnTheWay) | (OnTheWay, Delivered) => match actor {
            Actor::Courier { courier_id } if facts.courier_id == Some(*courier_id) => Ok(()),
            Actor::Courier { .. } => Err(ServiceError::Forbidden(
                "order is assigned to another courier".into(),
            )),
            _ => Err(ServiceError::Forbidden(
                "only the assigned courier may move the order".into(),
            )),
        },

        (Pending, Cancelled) => match actor {
            Actor::Customer { user_id } if *user_id == facts.user_id => Ok(()),
            Actor::Customer { .. } => {
                Err(ServiceError::Forbidden("order belongs to another customer".into()))
            }
            Actor::StoreOwner { store_id } if *store_id == facts.store_id => Ok(()),
            Actor::StoreOwner { .. } => {
                Err(ServiceError::Forbidden("order belongs to another store".into()))
            }
            _ => Err(ServiceError::Forbidden("cancellation not permitted".into())),
        },

        (Preparing, Cancelled) => match actor {
            Actor::StoreOwner { store_id } if *store_id == facts.store_id => Ok(()),
            Actor::StoreOwner { .. } => {
                Err(ServiceError::Forbidden("order belongs to another store".into()))
            }
            _ => Err(ServiceError::Forbidden(
                "only the store owner may cancel a preparing order".into(),
            )),
        },

        (ReservingStock, Cancelled) => Err(ServiceError::InvalidState(
            "stock reservation is in flight; retry when it settles".into(),
        )),

        (OnTheWay, Cancelled) => Err(ServiceError::InvalidState(
            "an order on the way cannot be cancelled".into(),
        )),

        (from, to) => Err(ServiceError::InvalidState(format!(
            "no transition from {} to {}",
            from, to
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use test_case::test_case;

    fn facts(status: OrderStatus) -> OrderFacts {
        OrderFacts {
            user_id: Uuid::from_u128(1),
            store_id: Uuid::from_u128(2),
            courier_id: Some(Uuid::from_u128(3)),
            status,
        }
    }

    fn owner() -> Actor {
        Actor::Customer {
            user_id: Uuid::from_u128(1),
        }
    }

    fn store_owner() -> Actor {
        Actor::StoreOwner {
            store_id: Uuid::from_u128(2),
        }
    }

    fn assigned_courier() -> Actor {
        Actor::Courier {
            courier_id: Uuid::from_u128(3),
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::ReservingStock,
            OrderStatus::Preparing,
            OrderStatus::OnTheWay,
            OrderStatus::Delivered,
            OrderStatus::Cancelled,
        ] {
            let rendered = status.to_string();
            assert_eq!(rendered.parse::<OrderStatus>().unwrap(), status);
        }
        assert_eq!(OrderStatus::ReservingStock.to_string(), "RESERVING_STOCK");
        assert_eq!(OrderStatus::OnTheWay.to_string(), "ON_THE_WAY");
    }

    #[test]
    fn accept_requires_the_owning_store() {
        let facts = facts(OrderStatus::Pending);
        assert!(authorize_transition(&facts, OrderStatus::ReservingStock, &store_owner()).is_ok());

        let other_store = Actor::StoreOwner {
            store_id: Uuid::from_u128(99),
        };
        assert_matches!(
            authorize_transition(&facts, OrderStatus::ReservingStock, &other_store),
            Err(ServiceError::Forbidden(_))
        );
        assert_matches!(
            authorize_transition(&facts, OrderStatus::ReservingStock, &owner()),
            Err(ServiceError::Forbidden(_))
        );
    }

    #[test]
    fn saga_outcomes_are_saga_only() {
        let facts = facts(OrderStatus::ReservingStock);
        assert!(authorize_transition(&facts, OrderStatus::Preparing, &Actor::Saga).is_ok());
        assert!(authorize_transition(&facts, OrderStatus::Pending, &Actor::Saga).is_ok());
        assert_matches!(
            authorize_transition(&facts, OrderStatus::Preparing, &store_owner()),
            Err(ServiceError::Forbidden(_))
        );
    }

    #[test]
    fn courier_moves_are_gated_on_the_assigned_courier() {
        let preparing = facts(OrderStatus::Preparing);
        assert!(authorize_transition(&preparing, OrderStatus::OnTheWay, &assigned_courier()).is_ok());

        let stranger = Actor::Courier {
            courier_id: Uuid::from_u128(77),
        };
        assert_matches!(
            authorize_transition(&preparing, OrderStatus::OnTheWay, &stranger),
            Err(ServiceError::Forbidden(_))
        );

        let on_the_way = facts(OrderStatus::OnTheWay);
        assert!(authorize_transition(&on_the_way, OrderStatus::Delivered, &assigned_courier()).is_ok());
    }

    #[test]
    fn cancellation_rules() {
        let pending = facts(OrderStatus::Pending);
        assert!(authorize_transition(&pending, OrderStatus::Cancelled, &owner()).is_ok());
        assert!(authorize_transition(&pending, OrderStatus::Cancelled, &store_owner()).is_ok());

        let preparing = facts(OrderStatus::Preparing);
        assert!(authorize_transition(&preparing, OrderStatus::Cancelled, &store_owner()).is_ok());
        assert_matches!(
            authorize_transition(&preparing, OrderStatus::Cancelled, &owner()),
            Err(ServiceError::Forbidden(_))
        );
    }

    #[test_case(OrderStatus::ReservingStock; "reserving stock is transient")]
    #[test_case(OrderStatus::OnTheWay; "on the way is too late")]
    fn cancellation_forbidden_states(status: OrderStatus) {
        let facts = facts(status);
        assert_matches!(
            authorize_transition(&facts, OrderStatus::Cancelled, &store_owner()),
            Err(ServiceError::InvalidState(_))
        );
    }

    #[test_case(OrderStatus::Delivered)]
    #[test_case(OrderStatus::Cancelled)]
    fn terminal_states_reject_everything(status: OrderStatus) {
        let facts = facts(status);
        for to in [
            OrderStatus::Pending,
            OrderStatus::ReservingStock,
            OrderStatus::Preparing,
            OrderStatus::OnTheWay,
            OrderStatus::Delivered,
            OrderStatus::Cancelled,
        ] {
            assert_matches!(
                authorize_transition(&facts, to, &Actor::Saga),
                Err(ServiceError::InvalidState(_))
            );
        }
    }

    #[test]
    fn undeclared_pairs_are_invalid_state() {
        let pending = facts(OrderStatus::Pending);
        assert_matches!(
            authorize_transition(&pending, OrderStatus::Preparing, &Actor::Saga),
            Err(ServiceError::InvalidState(_))
        );
        assert_matches!(
            authorize_transition(&pending, OrderStatus::Delivered, &assigned_courier()),
            Err(ServiceError::InvalidState(_))
        );
    }

    #[test]
    fn stock_deducted_tracks_the_compensation_rule() {
        assert!(!OrderStatus::Pending.stock_deducted());
        assert!(!OrderStatus::ReservingStock.stock_deducted());
        assert!(OrderStatus::Preparing.stock_deducted());
        assert!(OrderStatus::OnTheWay.stock_deducted());
        assert!(!OrderStatus::Delivered.stock_deducted());
    }
}
