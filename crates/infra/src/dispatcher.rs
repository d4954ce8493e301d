//! Outbox dispatcher.
//!
//! Long-running loop: claim due `PENDING` rows, publish each to the topic
//! exchange with the row's routing key and `message_id = event_id`, and
//! record the outcome. Publish-then-mark gives at-least-once: a crash
//! between broker ack and `mark_published` republishes the same envelope on
//! restart, which consumers absorb through their `event_id` guard.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use warebus_events::OutboxStore;

use crate::broker::{MessageBroker, Publication};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

pub struct OutboxDispatcher {
    outbox: Arc<dyn OutboxStore>,
    broker: Arc<dyn MessageBroker>,
    config: DispatcherConfig,
}

impl OutboxDispatcher {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        broker: Arc<dyn MessageBroker>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            outbox,
            broker,
            config,
        }
    }

    /// Run until shutdown; the in-flight batch is flushed before exit.
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "outbox dispatcher started"
        );
        let mut tick = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    self.drain_once().await;
                    break;
                }
                _ = tick.tick() => {
                    self.drain_once().await;
                }
            }
        }

        info!("outbox dispatcher stopped");
    }

    /// One claim-publish-mark pass. Returns the number of rows published.
    pub async fn drain_once(&self) -> usize {
        let batch = match self.outbox.claim_pending(self.config.batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "outbox claim failed");
                return 0;
            }
        };
        if batch.is_empty() {
            return 0;
        }

        let mut published = 0usize;
        for entry in batch {
            let id = entry.id;
            let publication = match Publication::for_outbox_entry(&entry) {
                Ok(publication) => publication,
                Err(e) => {
                    warn!(outbox_id = %id, error = %e, "unencodable outbox row");
                    if let Err(e) = self.outbox.mark_failed(id, &e.to_string()).await {
                        error!(outbox_id = %id, error = %e, "mark_failed failed");
                    }
                    continue;
                }
            };

            match self.broker.publish(publication).await {
                Ok(()) => {
                    // Broker ack observed; only now is the row terminal.
                    if let Err(e) = self.outbox.mark_published(id).await {
                        error!(outbox_id = %id, error = %e, "mark_published failed; row will republish");
                    } else {
                        published += 1;
                    }
                }
                Err(e) => {
                    warn!(outbox_id = %id, error = %e, "publish failed; scheduling retry");
                    if let Err(e) = self.outbox.mark_failed(id, &e.to_string()).await {
                        error!(outbox_id = %id, error = %e, "mark_failed failed");
                    }
                }
            }
        }

        if let Ok(queue_size) = self.outbox.queue_size().await {
            debug!(outbox_queue_size = queue_size, published, "dispatcher pass complete");
        }
        published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{
        BrokerError, Consumer, InMemoryBroker, MessageBroker, AGENT_QUEUE,
    };
    use crate::state_store::InMemoryStateStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use warebus_core::TenantId;
    use warebus_events::{
        catalog, Actor, EnvelopeContext, EventEnvelope, EventType, OutboxEntry, OutboxStatus,
    };
    use warebus_inventory::StateStore;

    async fn enqueue(store: &InMemoryStateStore, envelope: &EventEnvelope) {
        let mut tx = store.begin().await.unwrap();
        tx.enqueue_outbox(OutboxEntry::pending(envelope.clone(), envelope.routing_key()))
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    fn envelope() -> EventEnvelope {
        let ctx = EnvelopeContext::root(TenantId::new(), None, Actor::system("test"));
        EventEnvelope::record(
            EventType::known(catalog::MOVEMENT_RECORDED),
            json!({"quantity": 1}),
            &ctx,
        )
    }

    #[tokio::test]
    async fn publishes_pending_rows_with_identity_headers() {
        let store = Arc::new(InMemoryStateStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        broker.declare_topology().await.unwrap();
        let mut consumer = broker.consume(AGENT_QUEUE).await.unwrap();

        let env = envelope();
        enqueue(&store, &env).await;

        let dispatcher = OutboxDispatcher::new(
            store.clone(),
            broker.clone(),
            DispatcherConfig::default(),
        );
        assert_eq!(dispatcher.drain_once().await, 1);

        let delivery = consumer.next().await.unwrap();
        assert_eq!(delivery.message_id, env.event_id().to_string());
        assert_eq!(delivery.routing_key, "inventory.movement.recorded");
        assert_eq!(
            delivery.headers.event_type.as_deref(),
            Some(catalog::MOVEMENT_RECORDED)
        );
        assert_eq!(
            delivery.headers.tenant_id.as_deref(),
            Some(env.tenant_id().to_string().as_str())
        );
        delivery.ack().await.unwrap();

        let entries = store.outbox_entries().await;
        assert_eq!(entries[0].status, OutboxStatus::Published);
        assert!(entries[0].published_at.is_some());
    }

    struct FlakyBroker {
        inner: InMemoryBroker,
        healthy: AtomicBool,
    }

    #[async_trait]
    impl MessageBroker for FlakyBroker {
        async fn declare_topology(&self) -> Result<(), BrokerError> {
            self.inner.declare_topology().await
        }

        async fn publish(&self, publication: crate::broker::Publication) -> Result<(), BrokerError> {
            if self.healthy.load(Ordering::SeqCst) {
                self.inner.publish(publication).await
            } else {
                Err(BrokerError::Connection("broker unreachable".into()))
            }
        }

        async fn consume(&self, queue: &str) -> Result<Consumer, BrokerError> {
            self.inner.consume(queue).await
        }
    }

    #[tokio::test]
    async fn broker_failure_schedules_backoff_then_recovers() {
        let store = Arc::new(InMemoryStateStore::new());
        let broker = Arc::new(FlakyBroker {
            inner: InMemoryBroker::new(),
            healthy: AtomicBool::new(false),
        });
        broker.declare_topology().await.unwrap();

        let env = envelope();
        enqueue(&store, &env).await;

        let dispatcher = OutboxDispatcher::new(store.clone(), broker.clone(), DispatcherConfig::default());
        assert_eq!(dispatcher.drain_once().await, 0);

        let entries = store.outbox_entries().await;
        assert_eq!(entries[0].status, OutboxStatus::Pending);
        assert_eq!(entries[0].retry_count, 1);
        assert!(entries[0].last_error.is_some());
        // Backed off: not due, so the next pass claims nothing.
        assert_eq!(dispatcher.drain_once().await, 0);

        // After recovery an operator requeue publishes immediately.
        broker.healthy.store(true, Ordering::SeqCst);
        store.requeue(env.event_id()).await.unwrap();
        assert_eq!(dispatcher.drain_once().await, 1);
        assert_eq!(store.outbox_entries().await[0].status, OutboxStatus::Published);
    }

    #[tokio::test]
    async fn retry_exhaustion_parks_the_row_as_failed() {
        let store = Arc::new(InMemoryStateStore::new());
        let broker = Arc::new(FlakyBroker {
            inner: InMemoryBroker::new(),
            healthy: AtomicBool::new(false),
        });
        broker.declare_topology().await.unwrap();

        let env = envelope();
        enqueue(&store, &env).await;

        let dispatcher = OutboxDispatcher::new(store.clone(), broker.clone(), DispatcherConfig::default());
        for _ in 0..warebus_events::DEFAULT_MAX_RETRIES {
            dispatcher.drain_once().await;
            // Force the row due again to walk the whole budget quickly.
            store.force_due(env.event_id()).await;
        }

        let entries = store.outbox_entries().await;
        assert_eq!(entries[0].status, OutboxStatus::Failed);
    }

    #[tokio::test]
    async fn crash_between_ack_and_mark_republishes_same_message_id() {
        let store = Arc::new(InMemoryStateStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        broker.declare_topology().await.unwrap();
        let mut consumer = broker.consume(AGENT_QUEUE).await.unwrap();

        let env = envelope();
        enqueue(&store, &env).await;

        let dispatcher = OutboxDispatcher::new(store.clone(), broker.clone(), DispatcherConfig::default());
        dispatcher.drain_once().await;
        consumer.next().await.unwrap().ack().await.unwrap();

        // Simulate the crash window: the broker acked but mark_published was
        // lost. On restart the row is PENDING again and republishes.
        store.requeue(env.event_id()).await.unwrap();
        dispatcher.drain_once().await;

        let duplicate = consumer.next().await.unwrap();
        assert_eq!(duplicate.message_id, env.event_id().to_string());
        duplicate.ack().await.unwrap();
    }
}
