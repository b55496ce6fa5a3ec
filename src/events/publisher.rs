//! Background outbox publisher: a drain loop that moves pending rows to the
//! broker and a cleanup loop that evicts old processed rows. One publisher
//! runs per service process.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use sea_orm::DatabaseConnection;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::config::OutboxConfig;
use crate::errors::ServiceError;
use crate::events::outbox;
use crate::message_queue::TopicBroker;

pub struct OutboxPublisher {
    service: String,
    db: Arc<DatabaseConnection>,
    broker: Arc<TopicBroker>,
    config: OutboxConfig,
}

impl OutboxPublisher {
    pub fn new(
        service: impl Into<String>,
        db: Arc<DatabaseConnection>,
        broker: Arc<TopicBroker>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            service: service.into(),
            db,
            broker,
            config,
        }
    }

    /// Starts the drain and cleanup loops.
    pub fn spawn(self: Arc<Self>) -> (JoinHandle<()>, JoinHandle<()>) {
        let drain = {
            let publisher = self.clone();
            tokio::spawn(async move {
                let interval = Duration::from_millis(publisher.config.drain_interval_ms);
                loop {
                    if let Err(e) = publisher.drain_once().await {
                        error!(service = %publisher.service, error = %e, "outbox drain failed");
                    }
                    sleep(interval).await;
                }
            })
        };

        let cleanup = {
            let publisher = self;
            tokio::spawn(async move {
                let interval = Duration::from_secs(publisher.config.cleanup_interval_secs);
                loop {
                    sleep(interval).await;
                    match publisher.cleanup_once().await {
                        Ok(0) => {}
                        Ok(deleted) => {
                            info!(service = %publisher.service, deleted, "outbox cleanup pass")
                        }
                        Err(e) => {
                            error!(service = %publisher.service, error = %e, "outbox cleanup failed")
                        }
                    }
                }
            })
        };

        (drain, cleanup)
    }

    /// One drain tick: publish a batch of pending rows in createdAt order.
    /// A broker failure leaves the row pending for the next tick and never
    /// blocks the remaining rows.
    pub async fn drain_once(&self) -> Result<usize, ServiceError> {
        let batch = outbox::fetch_pending_batch(self.db.as_ref(), self.config.drain_batch).await?;
        let mut published = 0usize;

        for row in batch {
            match self.broker.publish(&row.event_type, &row.payload) {
                Ok(()) => {
                    if let Err(e) = outbox::mark_processed(self.db.as_ref(), row.id).await {
                        warn!(
                            service = %self.service,
                            outbox_id = %row.id,
                            error = %e,
                            "published but could not mark processed; consumers must absorb the replay"
                        );
                    } else {
                        published += 1;
                    }
                }
                Err(e) => {
                    warn!(
                        service = %self.service,
                        outbox_id = %row.id,
                        event_type = %row.event_type,
                        error = %e,
                        "publish failed, row stays pending"
                    );
                }
            }
        }

        if published > 0 {
            debug!(service = %self.service, published, "outbox drained");
        }
        Ok(published)
    }

    /// One cleanup tick: evict processed rows past the TTL in a bounded batch.
    pub async fn cleanup_once(&self) -> Result<u64, ServiceError> {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.config.processed_ttl_secs);
        outbox::delete_processed_older_than(self.db.as_ref(), cutoff).await
    }
}
