//! `warebus-infra` — storage, broker, and the three long-running roles of
//! the event backbone: outbox dispatcher, event consumer, and scheduler,
//! plus the command services that feed it.

pub mod broker;
pub mod commands;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod scheduler;
pub mod state_store;

pub use broker::{
    routing_key_matches, BrokerError, Consumer, Delivery, InMemoryBroker, MessageBroker,
    MessageHeaders, Publication, RedisStreamsBroker, AGENT_QUEUE, DEAD_LETTER_EXCHANGE,
    DEAD_LETTER_KEY, DEAD_LETTER_QUEUE, EVENTS_EXCHANGE, MATCH_ALL,
};
pub use commands::{
    CommandContext, CommandError, CommandService, GoodsReceiptCommand, MovementCommand,
};
pub use config::WarebusConfig;
pub use consumer::{ConsumeError, ConsumerConfig, EventConsumer};
pub use dispatcher::{DispatcherConfig, OutboxDispatcher};
pub use scheduler::{
    default_jobs, scheduled_routing_key, InternalJob, JobAction, Scheduler, SchedulerJob,
};
pub use state_store::{InMemoryStateStore, PostgresStateStore};
