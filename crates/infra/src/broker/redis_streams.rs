//! Redis Streams-backed topic broker (durable, at-least-once delivery).
//!
//! Emulates the standard topology on streams:
//! - `warebus:events` — the fan-in stream (one consumer group per queue)
//! - `warebus:events:dlq` — dead-letter stream
//! - `warebus:events:delayed` — ZSET delay queue scored by due time;
//!   promotion back onto the main stream happens on every consumer poll, so
//!   a retry delay survives process restarts.
//!
//! XADD acknowledges a publish (confirm semantics); XACK settles a
//! delivery. Consumers are named within their group so pending entries can
//! be claimed after a crash (XAUTOCLAIM).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, warn};

use super::{
    Acker, BrokerError, Consumer, Delivery, MessageBroker, MessageHeaders, Publication,
    AGENT_QUEUE, DEAD_LETTER_KEY, DEAD_LETTER_QUEUE,
};

const STREAM_KEY: &str = "warebus:events";
const DLQ_KEY: &str = "warebus:events:dlq";
const DELAY_KEY: &str = "warebus:events:delayed";

/// Pending entries idle longer than this are reclaimed from dead consumers.
const PENDING_TIMEOUT_MS: u64 = 60_000;
const READ_COUNT: usize = 10;
const BLOCK_MS: u64 = 100;

#[derive(Clone)]
pub struct RedisStreamsBroker {
    client: Arc<redis::Client>,
    consumer_name: String,
}

/// Wire form of a message parked in the delay ZSET.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct DelayedMessage {
    message_id: String,
    routing_key: String,
    tenant_id: Option<String>,
    event_type: Option<String>,
    correlation_id: Option<String>,
    causation_id: Option<String>,
    retry_count: u32,
    body: String,
}

fn connection_error(e: redis::RedisError) -> BrokerError {
    BrokerError::Connection(e.to_string())
}

fn command_error(op: &str, e: redis::RedisError) -> BrokerError {
    BrokerError::Command(format!("{op}: {e}"))
}

impl RedisStreamsBroker {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(connection_error)?;
        Ok(Self {
            client: Arc::new(client),
            consumer_name: format!("consumer-{}", uuid::Uuid::now_v7()),
        })
    }

    fn stream_for_queue(queue: &str) -> Result<&'static str, BrokerError> {
        match queue {
            AGENT_QUEUE => Ok(STREAM_KEY),
            DEAD_LETTER_QUEUE => Ok(DLQ_KEY),
            other => Err(BrokerError::UnknownQueue(other.to_string())),
        }
    }

    fn ensure_consumer_group(conn: &mut redis::Connection, stream: &str, group: &str) {
        // MKSTREAM creates the stream on first use; an existing group is not
        // an error worth surfacing.
        let _: Result<String, _> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query(conn);
    }

    fn publish_sync(&self, publication: &Publication) -> Result<(), BrokerError> {
        let mut conn = self.client.get_connection().map_err(connection_error)?;
        let body = String::from_utf8_lossy(&publication.body).into_owned();

        let mut cmd = redis::cmd("XADD");
        cmd.arg(STREAM_KEY)
            .arg("*")
            .arg("message_id")
            .arg(&publication.message_id)
            .arg("routing_key")
            .arg(&publication.routing_key)
            .arg("retry_count")
            .arg(publication.headers.retry_count.to_string())
            .arg("body")
            .arg(body);
        for (field, value) in [
            ("tenant_id", &publication.headers.tenant_id),
            ("event_type", &publication.headers.event_type),
            ("correlation_id", &publication.headers.correlation_id),
            ("causation_id", &publication.headers.causation_id),
        ] {
            if let Some(value) = value {
                cmd.arg(field).arg(value);
            }
        }

        let _: String = cmd
            .query(&mut conn)
            .map_err(|e| command_error("XADD", e))?;
        Ok(())
    }

    /// Move due delayed messages back onto the main stream.
    fn promote_due_sync(conn: &mut redis::Connection) -> Result<(), BrokerError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(DELAY_KEY)
            .arg("-inf")
            .arg(now_ms)
            .query(conn)
            .map_err(|e| command_error("ZRANGEBYSCORE", e))?;

        for member in due {
            let message: DelayedMessage = match serde_json::from_str(&member) {
                Ok(m) => m,
                Err(e) => {
                    error!(error = %e, "unparseable delayed message; dropping");
                    let _: Result<u64, _> =
                        redis::cmd("ZREM").arg(DELAY_KEY).arg(&member).query(conn);
                    continue;
                }
            };

            let mut cmd = redis::cmd("XADD");
            cmd.arg(STREAM_KEY)
                .arg("*")
                .arg("message_id")
                .arg(&message.message_id)
                .arg("routing_key")
                .arg(&message.routing_key)
                .arg("retry_count")
                .arg(message.retry_count.to_string())
                .arg("body")
                .arg(&message.body);
            for (field, value) in [
                ("tenant_id", &message.tenant_id),
                ("event_type", &message.event_type),
                ("correlation_id", &message.correlation_id),
                ("causation_id", &message.causation_id),
            ] {
                if let Some(value) = value {
                    cmd.arg(field).arg(value);
                }
            }
            let added: Result<String, _> = cmd.query(conn);
            if let Err(e) = added {
                return Err(command_error("XADD (promote)", e));
            }
            let _: u64 = redis::cmd("ZREM")
                .arg(DELAY_KEY)
                .arg(&member)
                .query(conn)
                .map_err(|e| command_error("ZREM", e))?;
        }
        Ok(())
    }

    fn read_group_sync(
        &self,
        conn: &mut redis::Connection,
        stream: &str,
        group: &str,
    ) -> Result<Vec<(String, HashMap<String, String>)>, BrokerError> {
        // Reclaim entries stuck with dead consumers before reading new ones.
        let reclaimed: Result<redis::Value, _> = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(&self.consumer_name)
            .arg(PENDING_TIMEOUT_MS)
            .arg("0-0")
            .arg("COUNT")
            .arg(READ_COUNT)
            .query(conn);
        let mut entries = match reclaimed {
            Ok(redis::Value::Bulk(parts)) if parts.len() >= 2 => parse_entries(&parts[1]),
            _ => Vec::new(),
        };

        if entries.is_empty() {
            let response: redis::RedisResult<redis::Value> = redis::cmd("XREADGROUP")
                .arg("GROUP")
                .arg(group)
                .arg(&self.consumer_name)
                .arg("COUNT")
                .arg(READ_COUNT)
                .arg("BLOCK")
                .arg(BLOCK_MS)
                .arg("STREAMS")
                .arg(stream)
                .arg(">")
                .query(conn);

            entries = match response {
                Ok(redis::Value::Bulk(streams)) => streams
                    .iter()
                    .filter_map(|stream_entry| match stream_entry {
                        redis::Value::Bulk(parts) if parts.len() >= 2 => Some(parse_entries(&parts[1])),
                        _ => None,
                    })
                    .flatten()
                    .collect(),
                Ok(redis::Value::Nil) => Vec::new(),
                Ok(_) => Vec::new(),
                Err(e) => return Err(command_error("XREADGROUP", e)),
            };
        }

        Ok(entries)
    }
}

/// Parse an XREADGROUP/XAUTOCLAIM entry list into (id, fields) pairs.
fn parse_entries(value: &redis::Value) -> Vec<(String, HashMap<String, String>)> {
    let redis::Value::Bulk(entries) = value else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let redis::Value::Bulk(parts) = entry else {
                return None;
            };
            let [id, fields] = parts.as_slice() else {
                return None;
            };
            let redis::Value::Data(id) = id else {
                return None;
            };
            let redis::Value::Bulk(pairs) = fields else {
                return None;
            };

            let mut map = HashMap::new();
            for chunk in pairs.chunks(2) {
                if let [redis::Value::Data(key), redis::Value::Data(value)] = chunk {
                    map.insert(
                        String::from_utf8_lossy(key).into_owned(),
                        String::from_utf8_lossy(value).into_owned(),
                    );
                }
            }
            Some((String::from_utf8_lossy(id).into_owned(), map))
        })
        .collect()
}

fn delivery_from_fields(
    stream: &'static str,
    group: String,
    client: Arc<redis::Client>,
    redis_id: String,
    fields: HashMap<String, String>,
) -> Option<Delivery> {
    let message_id = fields.get("message_id")?.clone();
    let routing_key = fields.get("routing_key")?.clone();
    let body = fields.get("body")?.clone().into_bytes();
    let headers = MessageHeaders {
        tenant_id: fields.get("tenant_id").cloned(),
        event_type: fields.get("event_type").cloned(),
        correlation_id: fields.get("correlation_id").cloned(),
        causation_id: fields.get("causation_id").cloned(),
        retry_count: fields.get("retry_count").and_then(|s| s.parse().ok()).unwrap_or(0),
    };

    Some(Delivery {
        message_id,
        routing_key,
        headers,
        body,
        acker: Box::new(RedisAcker {
            client,
            stream,
            group,
            redis_id,
        }),
    })
}

#[async_trait]
impl MessageBroker for RedisStreamsBroker {
    async fn declare_topology(&self) -> Result<(), BrokerError> {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || {
            let mut conn = client.get_connection().map_err(connection_error)?;
            RedisStreamsBroker::ensure_consumer_group(&mut conn, STREAM_KEY, AGENT_QUEUE);
            RedisStreamsBroker::ensure_consumer_group(&mut conn, DLQ_KEY, DEAD_LETTER_QUEUE);
            Ok(())
        })
        .await
        .map_err(|e| BrokerError::Command(format!("join: {e}")))?
    }

    async fn publish(&self, publication: Publication) -> Result<(), BrokerError> {
        let broker = self.clone();
        tokio::task::spawn_blocking(move || broker.publish_sync(&publication))
            .await
            .map_err(|e| BrokerError::Command(format!("join: {e}")))?
    }

    async fn consume(&self, queue: &str) -> Result<Consumer, BrokerError> {
        let stream = Self::stream_for_queue(queue)?;
        let group = queue.to_string();
        let broker = self.clone();
        let (sender, receiver) = mpsc::channel(256);

        // Dedicated polling thread: sync redis reads bridged into the
        // async world over a channel.
        std::thread::Builder::new()
            .name(format!("redis-consumer-{queue}"))
            .spawn(move || {
                let mut conn = match broker.client.get_connection() {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "redis consumer failed to connect");
                        return;
                    }
                };
                RedisStreamsBroker::ensure_consumer_group(&mut conn, stream, &group);

                loop {
                    if sender.is_closed() {
                        return;
                    }

                    if stream == STREAM_KEY {
                        if let Err(e) = RedisStreamsBroker::promote_due_sync(&mut conn) {
                            warn!(error = %e, "delay promotion failed");
                        }
                    }

                    match broker.read_group_sync(&mut conn, stream, &group) {
                        Ok(entries) => {
                            for (redis_id, fields) in entries {
                                let Some(delivery) = delivery_from_fields(
                                    stream,
                                    group.clone(),
                                    Arc::clone(&broker.client),
                                    redis_id.clone(),
                                    fields,
                                ) else {
                                    warn!(redis_id = %redis_id, "malformed stream entry; acking away");
                                    let _: Result<u64, _> = redis::cmd("XACK")
                                        .arg(stream)
                                        .arg(&group)
                                        .arg(&redis_id)
                                        .query(&mut conn);
                                    continue;
                                };
                                if sender.blocking_send(delivery).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "redis read failed; backing off");
                            std::thread::sleep(Duration::from_secs(1));
                        }
                    }
                }
            })
            .map_err(|e| BrokerError::Command(format!("spawn: {e}")))?;

        Ok(Consumer { receiver })
    }
}

struct RedisAcker {
    client: Arc<redis::Client>,
    stream: &'static str,
    group: String,
    redis_id: String,
}

impl RedisAcker {
    fn ack_sync(&self, conn: &mut redis::Connection) -> Result<(), BrokerError> {
        let _: u64 = redis::cmd("XACK")
            .arg(self.stream)
            .arg(&self.group)
            .arg(&self.redis_id)
            .query(conn)
            .map_err(|e| command_error("XACK", e))?;
        Ok(())
    }
}

#[async_trait]
impl Acker for RedisAcker {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        tokio::task::spawn_blocking(move || {
            let mut conn = self.client.get_connection().map_err(connection_error)?;
            self.ack_sync(&mut conn)
        })
        .await
        .map_err(|e| BrokerError::Command(format!("join: {e}")))?
    }

    async fn nack_requeue(self: Box<Self>, delay: Duration) -> Result<(), BrokerError> {
        tokio::task::spawn_blocking(move || {
            let mut conn = self.client.get_connection().map_err(connection_error)?;

            // Read the entry back so the delayed copy carries its fields.
            let response: redis::Value = redis::cmd("XRANGE")
                .arg(self.stream)
                .arg(&self.redis_id)
                .arg(&self.redis_id)
                .query(&mut conn)
                .map_err(|e| command_error("XRANGE", e))?;
            let entries = parse_entries(&response);
            let Some((_, fields)) = entries.into_iter().next() else {
                // Entry trimmed away; nothing left to requeue.
                return self.ack_sync(&mut conn);
            };

            let message = DelayedMessage {
                message_id: fields.get("message_id").cloned().unwrap_or_default(),
                routing_key: fields.get("routing_key").cloned().unwrap_or_default(),
                tenant_id: fields.get("tenant_id").cloned(),
                event_type: fields.get("event_type").cloned(),
                correlation_id: fields.get("correlation_id").cloned(),
                causation_id: fields.get("causation_id").cloned(),
                retry_count: fields
                    .get("retry_count")
                    .and_then(|s| s.parse::<u32>().ok())
                    .unwrap_or(0)
                    + 1,
                body: fields.get("body").cloned().unwrap_or_default(),
            };
            let member = serde_json::to_string(&message)
                .map_err(|e| BrokerError::Encoding(e.to_string()))?;
            let due_ms = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;

            let _: u64 = redis::cmd("ZADD")
                .arg(DELAY_KEY)
                .arg(due_ms)
                .arg(member)
                .query(&mut conn)
                .map_err(|e| command_error("ZADD", e))?;

            self.ack_sync(&mut conn)
        })
        .await
        .map_err(|e| BrokerError::Command(format!("join: {e}")))?
    }

    async fn dead_letter(self: Box<Self>) -> Result<(), BrokerError> {
        tokio::task::spawn_blocking(move || {
            let mut conn = self.client.get_connection().map_err(connection_error)?;

            let response: redis::Value = redis::cmd("XRANGE")
                .arg(self.stream)
                .arg(&self.redis_id)
                .arg(&self.redis_id)
                .query(&mut conn)
                .map_err(|e| command_error("XRANGE", e))?;
            let entries = parse_entries(&response);

            if let Some((_, fields)) = entries.into_iter().next() {
                let mut cmd = redis::cmd("XADD");
                cmd.arg(DLQ_KEY)
                    .arg("*")
                    .arg("routing_key")
                    .arg(DEAD_LETTER_KEY)
                    .arg("failed_at")
                    .arg(chrono::Utc::now().to_rfc3339());
                for (key, value) in &fields {
                    if key != "routing_key" {
                        cmd.arg(key).arg(value);
                    }
                }
                let _: String = cmd.query(&mut conn).map_err(|e| command_error("XADD (dlq)", e))?;
            }

            self.ack_sync(&mut conn)
        })
        .await
        .map_err(|e| BrokerError::Command(format!("join: {e}")))?
    }
}
