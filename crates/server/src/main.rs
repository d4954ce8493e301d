//! Composition root.
//!
//! Wires the store, broker, agent registry, and the three long-running
//! roles (dispatcher, consumer, scheduler), then waits for SIGINT/SIGTERM
//! and shuts everything down gracefully: consumer stops accepting, in-flight
//! agent invocations drain, the dispatcher flushes its batch, and the tasks
//! join.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use warebus_agents::builtin::{
    AbcXyzClassifierAgent, AuditTrailAgent, DemandForecastAgent, FefoReservationAgent,
    LotExpiryAgent, SafetyStockAgent, SlottingSuggestionAgent, StockThresholdAgent,
};
use warebus_agents::{AgentRegistry, AgentRuntime};
use warebus_infra::{
    default_jobs, ConsumerConfig, DispatcherConfig, EventConsumer, InMemoryBroker,
    InMemoryStateStore, MessageBroker, OutboxDispatcher, PostgresStateStore, RedisStreamsBroker,
    Scheduler, WarebusConfig,
};
use warebus_inventory::StateStore;

#[tokio::main]
async fn main() {
    warebus_observability::init();

    let config = WarebusConfig::from_env();
    tracing::info!(?config, "warebus starting");

    // Store: Postgres when configured, in-memory for local development.
    let (store, outbox): (
        Arc<dyn StateStore>,
        Arc<dyn warebus_events::OutboxStore>,
    ) = match &config.database_url {
        Some(url) => {
            let pool = match sqlx::postgres::PgPoolOptions::new()
                .max_connections(16)
                .connect(url)
                .await
            {
                Ok(pool) => pool,
                Err(e) => {
                    tracing::error!(error = %e, "database connection failed");
                    std::process::exit(1);
                }
            };
            let store = Arc::new(PostgresStateStore::new(pool));
            (store.clone(), store)
        }
        None => {
            tracing::warn!("WAREBUS_DATABASE_URL not set; using in-memory store");
            let store = Arc::new(InMemoryStateStore::new());
            (store.clone(), store)
        }
    };

    // Broker: Redis Streams when configured, in-memory otherwise.
    let broker: Arc<dyn MessageBroker> = match &config.redis_url {
        Some(url) => match RedisStreamsBroker::new(url) {
            Ok(broker) => Arc::new(broker),
            Err(e) => {
                tracing::error!(error = %e, "broker setup failed");
                std::process::exit(1);
            }
        },
        None => {
            tracing::warn!("WAREBUS_REDIS_URL not set; using in-memory broker");
            Arc::new(InMemoryBroker::new())
        }
    };
    if let Err(e) = broker.declare_topology().await {
        tracing::error!(error = %e, "topology declaration failed");
        std::process::exit(1);
    }

    // The registry is assembled once here and read-only afterwards.
    let registry = Arc::new(AgentRegistry::new());
    registry.register(Arc::new(AuditTrailAgent::new()));
    registry.register(Arc::new(SlottingSuggestionAgent::new(store.clone())));
    registry.register(Arc::new(
        FefoReservationAgent::new(store.clone())
            .with_min_days_to_expiration(config.min_days_to_expiration),
    ));
    registry.register(Arc::new(StockThresholdAgent::new(store.clone())));
    registry.register(Arc::new(LotExpiryAgent::new(store.clone())));
    registry.register(Arc::new(AbcXyzClassifierAgent::new(store.clone())));
    registry.register(Arc::new(
        SafetyStockAgent::new(store.clone()).with_service_level_z(config.service_level_z),
    ));
    registry.register(Arc::new(
        DemandForecastAgent::new(store.clone()).with_horizon_days(config.forecast_horizon_days),
    ));
    tracing::info!(agents = registry.len(), "agent registry initialized");

    let runtime = Arc::new(AgentRuntime::new(registry, config.runtime_config()));

    let (shutdown_tx, _) = broadcast::channel(1);

    let dispatcher = OutboxDispatcher::new(
        outbox.clone(),
        broker.clone(),
        DispatcherConfig {
            poll_interval: config.poll_interval(),
            batch_size: config.batch_size,
        },
    )
    .spawn(shutdown_tx.subscribe());

    let consumer = EventConsumer::new(
        broker.clone(),
        store.clone(),
        runtime,
        ConsumerConfig {
            prefetch_count: config.prefetch_count,
            max_retries: config.max_retries_consumer,
            retry_delay_base: Duration::from_secs(1),
        },
    )
    .spawn(shutdown_tx.subscribe());

    let scheduler = Scheduler::new(
        store.clone(),
        outbox.clone(),
        default_jobs(),
        config.outbox_gc_days,
    )
    .spawn(shutdown_tx.subscribe());

    tracing::info!("warebus running");
    wait_for_signal().await;
    tracing::info!("shutdown signal received; draining");

    let _ = shutdown_tx.send(());
    for (name, handle) in [
        ("consumer", consumer),
        ("dispatcher", dispatcher),
        ("scheduler", scheduler),
    ] {
        if let Err(e) = handle.await {
            tracing::error!(task = name, error = %e, "task join failed");
        }
    }

    tracing::info!("warebus stopped");
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed; relying on ctrl-c");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
