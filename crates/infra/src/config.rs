//! Process configuration.
//!
//! Read once at startup from `WAREBUS_`-prefixed environment variables;
//! every knob has the documented default. Malformed values fall back to the
//! default with a warning rather than aborting the process.

use std::time::Duration;

use tracing::warn;

use warebus_agents::RuntimeConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct WarebusConfig {
    /// Dispatcher poll interval.
    pub poll_interval_ms: u64,
    /// Dispatcher claim batch size.
    pub batch_size: usize,
    /// Consumer prefetch (max unsettled deliveries in flight).
    pub prefetch_count: usize,
    /// Consumer redelivery budget before dead-lettering.
    pub max_retries_consumer: u32,
    /// Outbox publish attempts before a row parks as FAILED.
    pub max_retries_outbox: u32,
    /// Per-agent deadline.
    pub agent_timeout_ms: u64,
    /// Agent batch size per inbound envelope.
    pub agent_concurrency: usize,
    /// Whether one failing agent blocks the remaining batches.
    pub continue_on_error: bool,
    /// Age at which PUBLISHED outbox rows are garbage-collected.
    pub outbox_gc_days: i64,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    /// Service-level z-score for the safety-stock agent.
    pub service_level_z: f64,
    /// FEFO freshness floor for the reservation agent.
    pub min_days_to_expiration: i64,
    /// Forecast horizon for the demand-forecast agent.
    pub forecast_horizon_days: usize,
}

impl Default for WarebusConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            batch_size: 100,
            prefetch_count: 10,
            max_retries_consumer: 3,
            max_retries_outbox: 5,
            agent_timeout_ms: 30_000,
            agent_concurrency: 10,
            continue_on_error: true,
            outbox_gc_days: 7,
            database_url: None,
            redis_url: None,
            service_level_z: 1.65,
            min_days_to_expiration: 0,
            forecast_horizon_days: 30,
        }
    }
}

impl WarebusConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            poll_interval_ms: parse(&lookup, "WAREBUS_POLL_INTERVAL_MS", defaults.poll_interval_ms),
            batch_size: parse(&lookup, "WAREBUS_BATCH_SIZE", defaults.batch_size),
            prefetch_count: parse(&lookup, "WAREBUS_PREFETCH_COUNT", defaults.prefetch_count),
            max_retries_consumer: parse(
                &lookup,
                "WAREBUS_MAX_RETRIES_CONSUMER",
                defaults.max_retries_consumer,
            ),
            max_retries_outbox: parse(
                &lookup,
                "WAREBUS_MAX_RETRIES_OUTBOX",
                defaults.max_retries_outbox,
            ),
            agent_timeout_ms: parse(&lookup, "WAREBUS_AGENT_TIMEOUT_MS", defaults.agent_timeout_ms),
            agent_concurrency: parse(
                &lookup,
                "WAREBUS_AGENT_CONCURRENCY",
                defaults.agent_concurrency,
            ),
            continue_on_error: parse(
                &lookup,
                "WAREBUS_CONTINUE_ON_ERROR",
                defaults.continue_on_error,
            ),
            outbox_gc_days: parse(&lookup, "WAREBUS_OUTBOX_GC_DAYS", defaults.outbox_gc_days),
            database_url: lookup("WAREBUS_DATABASE_URL"),
            redis_url: lookup("WAREBUS_REDIS_URL"),
            service_level_z: parse(&lookup, "WAREBUS_SERVICE_LEVEL_Z", defaults.service_level_z),
            min_days_to_expiration: parse(
                &lookup,
                "WAREBUS_MIN_DAYS_TO_EXPIRATION",
                defaults.min_days_to_expiration,
            ),
            forecast_horizon_days: parse(
                &lookup,
                "WAREBUS_FORECAST_HORIZON_DAYS",
                defaults.forecast_horizon_days,
            ),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }

    /// The agent-runtime slice of this configuration.
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            concurrency: self.agent_concurrency,
            agent_timeout: self.agent_timeout(),
            continue_on_error: self.continue_on_error,
        }
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "unparseable configuration value; using default");
            default
        }),
    }
}
