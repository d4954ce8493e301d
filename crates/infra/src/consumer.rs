//! Event consumer.
//!
//! Subscribes to the fan-in queue, runs the agent runtime for each inbound
//! envelope, persists every derived envelope (event-log append + outbox
//! enqueue, one transaction, together with the inbox marker), and settles
//! the delivery:
//!
//! ```text
//! RECEIVED → PARSING → DISPATCHING → [PERSISTING-DERIVED]* → ACK
//!                                  ↘ FAIL ──(retry < max)──→ durable DELAY → RECEIVED
//!                                         ↘─(retry ≥ max)──→ DEAD-LETTER
//! ```
//!
//! Prefetch is the backpressure knob: at most `prefetch_count` deliveries
//! are unsettled at any time; beyond that, messages wait at the broker.
//! The redelivery guard is the durable consumer inbox keyed on `event_id`,
//! committed atomically with the derived envelopes — replaying a processed
//! message is a pure ack.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use warebus_agents::AgentRuntime;
use warebus_events::{decode, EventEnvelope, OutboxEntry};
use warebus_inventory::{StateStore, StoreError};

use crate::broker::{Delivery, MessageBroker, AGENT_QUEUE};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub prefetch_count: usize,
    pub max_retries: u32,
    /// Base of the exponential redelivery delay (`base · 2^retry`).
    pub retry_delay_base: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 10,
            max_retries: 3,
            retry_delay_base: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("envelope decode failed: {0}")]
    Decode(String),

    #[error("agent infrastructure failure: {0}")]
    Agents(String),

    #[error("store failure: {0}")]
    Store(String),
}

impl From<StoreError> for ConsumeError {
    fn from(value: StoreError) -> Self {
        ConsumeError::Store(value.to_string())
    }
}

pub struct EventConsumer {
    broker: Arc<dyn MessageBroker>,
    store: Arc<dyn StateStore>,
    runtime: Arc<AgentRuntime>,
    config: ConsumerConfig,
}

impl EventConsumer {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        store: Arc<dyn StateStore>,
        runtime: Arc<AgentRuntime>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            broker,
            store,
            runtime,
            config,
        }
    }

    /// Run until shutdown. On shutdown the subscription stops first, then
    /// in-flight invocations drain before the task exits.
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            prefetch = self.config.prefetch_count,
            max_retries = self.config.max_retries,
            "event consumer started"
        );

        let consumer = Arc::new(self);
        let prefetch = consumer.config.prefetch_count.max(1);
        let inflight = Arc::new(Semaphore::new(prefetch));

        'subscribe: loop {
            let mut deliveries = match consumer.broker.consume(AGENT_QUEUE).await {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    error!(error = %e, "subscribe failed; retrying");
                    tokio::select! {
                        _ = shutdown.recv() => break 'subscribe,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => continue 'subscribe,
                    }
                }
            };

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break 'subscribe,
                    delivery = deliveries.next() => {
                        let Some(delivery) = delivery else {
                            warn!("delivery stream ended; resubscribing");
                            continue 'subscribe;
                        };
                        let permit = match Arc::clone(&inflight).acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => break 'subscribe,
                        };
                        let consumer = Arc::clone(&consumer);
                        tokio::spawn(async move {
                            consumer.process(delivery).await;
                            drop(permit);
                        });
                    }
                }
            }
        }

        // Drain: wait for every unsettled delivery to finish.
        let _ = inflight.acquire_many(prefetch as u32).await;
        info!("event consumer stopped");
    }

    /// Process and settle one delivery.
    pub async fn process(&self, delivery: Delivery) {
        let message_id = delivery.message_id.clone();
        let retry_count = delivery.retry_count();

        match self.handle(&delivery).await {
            Ok(()) => {
                if let Err(e) = delivery.ack().await {
                    error!(message_id = %message_id, error = %e, "ack failed");
                }
            }
            Err(e) if retry_count < self.config.max_retries => {
                // Durable delayed redelivery, base · 2^retry.
                let delay = self.config.retry_delay_base * 2u32.pow(retry_count.min(30));
                warn!(
                    message_id = %message_id,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "processing failed; requeueing with delay"
                );
                if let Err(e) = delivery.nack_requeue(delay).await {
                    error!(message_id = %message_id, error = %e, "nack failed");
                }
            }
            Err(e) => {
                warn!(
                    message_id = %message_id,
                    retry_count,
                    error = %e,
                    "retry budget exhausted; dead-lettering"
                );
                if let Err(e) = delivery.dead_letter().await {
                    error!(message_id = %message_id, error = %e, "dead-letter failed");
                }
            }
        }
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), ConsumeError> {
        let envelope = decode(&delivery.body).map_err(|e| ConsumeError::Decode(e.to_string()))?;

        if self.store.inbox_contains(envelope.event_id()).await? {
            debug!(event_id = %envelope.event_id(), "duplicate delivery; already processed");
            return Ok(());
        }

        let outcome = self.runtime.dispatch(&envelope).await;
        if outcome.has_infrastructure_failures() {
            let agents: Vec<&str> = outcome
                .infrastructure_failures
                .iter()
                .map(|f| f.agent.as_str())
                .collect();
            return Err(ConsumeError::Agents(format!(
                "agents {agents:?} failed retriably"
            )));
        }

        debug!(
            event_id = %envelope.event_id(),
            event_type = %envelope.event_type(),
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            derived = outcome.envelopes.len(),
            duration_ms = outcome.duration.as_millis() as u64,
            "dispatch complete"
        );

        self.persist_derived(&envelope, outcome.envelopes).await?;
        Ok(())
    }

    /// One transaction: inbox marker + every derived envelope into the
    /// event log and the outbox.
    async fn persist_derived(
        &self,
        inbound: &EventEnvelope,
        derived: Vec<EventEnvelope>,
    ) -> Result<(), ConsumeError> {
        let mut tx = self.store.begin().await?;
        tx.mark_inbox_processed(inbound.event_id()).await?;
        for envelope in derived {
            let routing_key = envelope.routing_key();
            tx.append_event(envelope.clone()).await?;
            tx.enqueue_outbox(OutboxEntry::pending(envelope, routing_key)).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
