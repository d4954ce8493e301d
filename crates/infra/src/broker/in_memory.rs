//! In-memory topic broker for tests and single-process development.
//!
//! Full topic semantics: pattern bindings, per-queue dead-lettering, and
//! delayed redelivery through an internal delay queue drained by a broker
//! task (the in-memory stand-in for a TTL'd delay exchange — never a timer
//! in the consumer).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::{
    routing_key_matches, Acker, BrokerError, Consumer, Delivery, MessageBroker, MessageHeaders,
    Publication, AGENT_QUEUE, DEAD_LETTER_KEY, DEAD_LETTER_QUEUE, MATCH_ALL,
};

#[derive(Clone)]
struct StoredMessage {
    message_id: String,
    routing_key: String,
    headers: MessageHeaders,
    body: Vec<u8>,
}

struct QueueState {
    bindings: Vec<String>,
    sender: mpsc::Sender<Delivery>,
    receiver: Option<mpsc::Receiver<Delivery>>,
    /// Messages that dead-letter from this queue go to the DLQ; the DLQ
    /// itself dead-letters nowhere.
    dead_letters_to: Option<String>,
}

#[derive(Default)]
struct BrokerInner {
    queues: HashMap<String, QueueState>,
    delayed: Vec<(DateTime<Utc>, String, StoredMessage)>,
    pump_running: bool,
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn deliver_to_queue(queue: &str, state: &QueueState, message: StoredMessage, inner: &Arc<Mutex<BrokerInner>>) {
        let delivery = Delivery {
            message_id: message.message_id.clone(),
            routing_key: message.routing_key.clone(),
            headers: message.headers.clone(),
            body: message.body.clone(),
            acker: Box::new(InMemoryAcker {
                inner: Arc::clone(inner),
                queue: queue.to_string(),
                message,
            }),
        };
        // Unbounded growth is acceptable here; backpressure is the
        // consumer's prefetch, not the queue depth.
        if state.sender.try_send(delivery).is_err() {
            warn!(queue, "in-memory queue full or closed; message dropped");
        }
    }

    async fn route(&self, message: StoredMessage) {
        let inner_arc = Arc::clone(&self.inner);
        let inner = self.inner.lock().await;
        for (name, state) in &inner.queues {
            if state.bindings.iter().any(|p| routing_key_matches(p, &message.routing_key)) {
                Self::deliver_to_queue(name, state, message.clone(), &inner_arc);
            }
        }
    }

    /// Drain due delayed messages back onto their queues.
    async fn pump_delayed(inner_arc: &Arc<Mutex<BrokerInner>>) {
        let now = Utc::now();
        let mut inner = inner_arc.lock().await;
        let mut due = Vec::new();
        inner.delayed.retain(|(at, queue, message)| {
            if *at <= now {
                due.push((queue.clone(), message.clone()));
                false
            } else {
                true
            }
        });
        for (queue, message) in due {
            if let Some(state) = inner.queues.get(&queue) {
                debug!(queue = %queue, message_id = %message.message_id, "redelivering delayed message");
                Self::deliver_to_queue(&queue, state, message, inner_arc);
            }
        }
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn declare_topology(&self) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;

        for (name, bindings, dead_letters_to) in [
            (AGENT_QUEUE, vec![MATCH_ALL.to_string()], Some(DEAD_LETTER_QUEUE.to_string())),
            (DEAD_LETTER_QUEUE, vec![DEAD_LETTER_KEY.to_string()], None),
        ] {
            inner.queues.entry(name.to_string()).or_insert_with(|| {
                let (sender, receiver) = mpsc::channel(1024);
                QueueState {
                    bindings,
                    sender,
                    receiver: Some(receiver),
                    dead_letters_to,
                }
            });
        }

        if !inner.pump_running {
            inner.pump_running = true;
            let inner_arc = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_millis(20));
                loop {
                    tick.tick().await;
                    InMemoryBroker::pump_delayed(&inner_arc).await;
                }
            });
        }

        Ok(())
    }

    async fn publish(&self, publication: Publication) -> Result<(), BrokerError> {
        self.route(StoredMessage {
            message_id: publication.message_id,
            routing_key: publication.routing_key,
            headers: publication.headers,
            body: publication.body,
        })
        .await;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Consumer, BrokerError> {
        let mut inner = self.inner.lock().await;
        let state = inner
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        let receiver = state
            .receiver
            .take()
            .ok_or_else(|| BrokerError::Command(format!("queue '{queue}' already consumed")))?;
        Ok(Consumer { receiver })
    }
}

struct InMemoryAcker {
    inner: Arc<Mutex<BrokerInner>>,
    queue: String,
    message: StoredMessage,
}

#[async_trait]
impl Acker for InMemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn nack_requeue(self: Box<Self>, delay: Duration) -> Result<(), BrokerError> {
        let mut message = self.message;
        message.headers.retry_count += 1;
        let due = Utc::now()
            + chrono::Duration::from_std(delay)
                .map_err(|e| BrokerError::Command(format!("bad delay: {e}")))?;
        let mut inner = self.inner.lock().await;
        inner.delayed.push((due, self.queue, message));
        Ok(())
    }

    async fn dead_letter(self: Box<Self>) -> Result<(), BrokerError> {
        let mut message = self.message;
        message.routing_key = DEAD_LETTER_KEY.to_string();

        let inner_arc = Arc::clone(&self.inner);
        let inner = self.inner.lock().await;
        let target = inner
            .queues
            .get(&self.queue)
            .and_then(|q| q.dead_letters_to.clone())
            .ok_or_else(|| BrokerError::Command(format!("queue '{}' has no dead-letter target", self.queue)))?;
        let state = inner
            .queues
            .get(&target)
            .ok_or_else(|| BrokerError::UnknownQueue(target.clone()))?;
        InMemoryBroker::deliver_to_queue(&target, state, message, &inner_arc);
        Ok(())
    }
}
