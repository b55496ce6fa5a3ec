use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::errors::ServiceError;
use crate::message_queue::Delivery;

/// A typed consumer for one routing key. Implementations deserialize the
/// payload into the type that key is documented to carry.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<(), ServiceError>;
}

/// Dispatches inbound deliveries to handlers by exact routing key. A key
/// without a handler is logged and acknowledged; returning an error here
/// would only spin the redelivery loop on a message nobody wants.
#[derive(Default)]
pub struct EventRouter {
    routes: HashMap<String, Arc<dyn EventHandler>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, routing_key: &str, handler: Arc<dyn EventHandler>) -> Self {
        self.routes.insert(routing_key.to_string(), handler);
        self
    }

    pub async fn dispatch(&self, delivery: &Delivery) -> Result<(), ServiceError> {
        match self.routes.get(&delivery.routing_key) {
            Some(handler) => handler.handle(delivery).await,
            None => {
                warn!(routing_key = %delivery.routing_key, "no handler bound, acknowledging");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    #[async_trait]
    impl EventHandler for Counter {
        async fn handle(&self, _delivery: &Delivery) -> Result<(), ServiceError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn delivery(key: &str) -> Delivery {
        Delivery {
            routing_key: key.to_string(),
            payload: "{}".to_string(),
            redeliveries: 0,
        }
    }

    #[tokio::test]
    async fn dispatches_by_routing_key() {
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let router = EventRouter::new().on("order.created", counter.clone());

        router.dispatch(&delivery("order.created")).await.unwrap();
        router.dispatch(&delivery("order.cancelled")).await.unwrap();

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
