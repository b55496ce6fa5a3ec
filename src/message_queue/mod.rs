//! In-process topic broker.
//!
//! Semantics mirror a durable topic exchange: queues bind with AMQP-style
//! patterns (`*` matches one word, `#` zero or more), delivery is FIFO per
//! queue, a failed handler causes redelivery up to the queue's limit, and
//! exhausted messages are parked in a per-queue dead-letter store for
//! operator inspection. Messages matching no binding are dropped.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::errors::ServiceError;
use crate::events::router::EventRouter;

pub const EXCHANGE: &str = "order_events_exchange";

#[derive(Debug, Clone)]
pub struct Delivery {
    pub routing_key: String,
    /// JSON body, opaque to the broker.
    pub payload: String,
    pub redeliveries: u32,
}

struct Queue {
    bindings: Vec<String>,
    max_redeliveries: u32,
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    dead_letters: Mutex<Vec<Delivery>>,
}

#[derive(Default)]
pub struct TopicBroker {
    queues: DashMap<String, Arc<Queue>>,
}

impl TopicBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a queue bound to the exchange under the given patterns.
    /// Re-declaring an existing queue is a no-op (idempotent, like broker
    /// topology declarations).
    pub fn declare_queue(&self, name: &str, patterns: &[&str], max_redeliveries: u32) {
        self.queues.entry(name.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(Queue {
                bindings: patterns.iter().map(|p| p.to_string()).collect(),
                max_redeliveries,
                tx,
                rx: Mutex::new(Some(rx)),
                dead_letters: Mutex::new(Vec::new()),
            })
        });
    }

    /// Fans the message out to every queue with a matching binding.
    pub fn publish(&self, routing_key: &str, payload: &str) -> Result<(), ServiceError> {
        let mut matched = 0usize;
        for entry in self.queues.iter() {
            let queue = entry.value();
            if queue.bindings.iter().any(|p| topic_matches(p, routing_key)) {
                queue
                    .tx
                    .send(Delivery {
                        routing_key: routing_key.to_string(),
                        payload: payload.to_string(),
                        redeliveries: 0,
                    })
                    .map_err(|_| {
                        ServiceError::Broker(format!("queue {} is closed", entry.key()))
                    })?;
                matched += 1;
            }
        }
        if matched == 0 {
            debug!(routing_key, "unroutable message dropped");
        }
        Ok(())
    }

    /// Attaches the consumer loop for a queue. Each delivery is dispatched
    /// through the router; a handler error is a nack and the message is
    /// redelivered until the limit, then dead-lettered.
    pub fn consume(
        &self,
        queue_name: &str,
        router: Arc<EventRouter>,
    ) -> Result<JoinHandle<()>, ServiceError> {
        let queue = self
            .queues
            .get(queue_name)
            .map(|q| q.clone())
            .ok_or_else(|| ServiceError::Broker(format!("unknown queue {}", queue_name)))?;
        let mut rx = queue
            .rx
            .lock()
            .expect("queue receiver lock")
            .take()
            .ok_or_else(|| {
                ServiceError::Conflict(format!("queue {} already has a consumer", queue_name))
            })?;

        let name = queue_name.to_string();
        Ok(tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                match router.dispatch(&delivery).await {
                    Ok(()) => {}
                    Err(e) if delivery.redeliveries < queue.max_redeliveries => {
                        warn!(
                            queue = %name,
                            routing_key = %delivery.routing_key,
                            redeliveries = delivery.redeliveries,
                            error = %e,
                            "handler failed, redelivering"
                        );
                        let _ = queue.tx.send(Delivery {
                            redeliveries: delivery.redeliveries + 1,
                            ..delivery
                        });
                    }
                    Err(e) => {
                        error!(
                            queue = %name,
                            routing_key = %delivery.routing_key,
                            error = %e,
                            "redelivery limit reached, parking in dead-letter store"
                        );
                        queue
                            .dead_letters
                            .lock()
                            .expect("dead-letter lock")
                            .push(delivery);
                    }
                }
            }
        }))
    }

    /// Dead-lettered messages for a queue, oldest first.
    pub fn dead_letters(&self, queue_name: &str) -> Vec<Delivery> {
        self.queues
            .get(queue_name)
            .map(|q| q.dead_letters.lock().expect("dead-letter lock").clone())
            .unwrap_or_default()
    }
}

/// AMQP topic matching: `*` matches exactly one dot-separated word, `#`
/// matches zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(&word), Some(&actual)) if word == actual => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}
