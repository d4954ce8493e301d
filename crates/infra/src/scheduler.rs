//! Cron scheduler.
//!
//! Owns a static job table. On each tick a synthetic event is fabricated
//! per (active tenant × active warehouse) and enters the backbone like any
//! other envelope: event-log append + outbox enqueue in one transaction.
//! Jobs whose event type carries the `internal:` prefix run in-process and
//! produce no envelope (today: outbox GC).

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use warebus_events::{
    catalog, Actor, EnvelopeContext, EventEnvelope, EventType, OutboxEntry, OutboxStore,
};
use warebus_inventory::StateStore;

/// What a job does when it fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobAction {
    /// Fabricate one envelope per (tenant, warehouse).
    Synthetic { event_type: &'static str },
    /// Run in-process, no envelope.
    Internal(InternalJob),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalJob {
    OutboxCleanup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerJob {
    pub name: &'static str,
    /// Five-field cron expression, UTC.
    pub cron: &'static str,
    pub action: JobAction,
}

/// The standard job set. Names are part of the operational contract.
pub fn default_jobs() -> Vec<SchedulerJob> {
    vec![
        SchedulerJob {
            name: "lot-expiry-check",
            cron: "0 0 * * *",
            action: JobAction::Synthetic {
                event_type: catalog::SCHEDULED_EXPIRY_CHECK,
            },
        },
        SchedulerJob {
            name: "abc-xyz-analysis",
            cron: "0 2 1 * *",
            action: JobAction::Synthetic {
                event_type: catalog::SCHEDULED_ABC_XYZ_ANALYSIS,
            },
        },
        SchedulerJob {
            name: "safety-stock-recalc",
            cron: "0 3 * * SUN",
            action: JobAction::Synthetic {
                event_type: catalog::SCHEDULED_SAFETY_STOCK_RECALC,
            },
        },
        SchedulerJob {
            name: "demand-forecast",
            cron: "0 4 * * SUN",
            action: JobAction::Synthetic {
                event_type: catalog::SCHEDULED_DEMAND_FORECAST,
            },
        },
        SchedulerJob {
            name: "outbox-cleanup",
            cron: "0 5 * * *",
            action: JobAction::Internal(InternalJob::OutboxCleanup),
        },
    ]
}

/// Routing key for a scheduled job: `scheduled.<job-name-dot-separated>`.
pub fn scheduled_routing_key(job_name: &str) -> String {
    format!("scheduled.{}", job_name.replace('-', "."))
}

pub struct Scheduler {
    store: Arc<dyn StateStore>,
    outbox: Arc<dyn OutboxStore>,
    jobs: Vec<SchedulerJob>,
    outbox_gc_days: i64,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn StateStore>,
        outbox: Arc<dyn OutboxStore>,
        jobs: Vec<SchedulerJob>,
        outbox_gc_days: i64,
    ) -> Self {
        Self {
            store,
            outbox,
            jobs,
            outbox_gc_days,
        }
    }

    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut schedules = Vec::with_capacity(self.jobs.len());
        for job in &self.jobs {
            match parse_cron(job.cron) {
                Ok(schedule) => schedules.push((job.clone(), schedule)),
                Err(e) => error!(job = job.name, error = %e, "unparseable cron; job disabled"),
            }
        }
        info!(jobs = schedules.len(), "scheduler started");

        loop {
            let now = Utc::now();
            let Some((job, fire_at)) = schedules
                .iter()
                .filter_map(|(job, schedule)| {
                    schedule.after(&now).next().map(|at| (job.clone(), at))
                })
                .min_by_key(|(_, at)| *at)
            else {
                warn!("no schedulable jobs; scheduler idle");
                let _ = shutdown.recv().await;
                break;
            };

            let sleep = (fire_at - now).to_std().unwrap_or_default();
            debug!(job = job.name, fire_at = %fire_at, "next scheduler tick");

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(sleep) => {
                    self.fire(&job, fire_at).await;
                }
            }
        }

        info!("scheduler stopped");
    }

    /// Execute one job tick.
    pub async fn fire(&self, job: &SchedulerJob, fired_at: DateTime<Utc>) {
        info!(job = job.name, fired_at = %fired_at, "scheduler tick");
        match &job.action {
            JobAction::Internal(InternalJob::OutboxCleanup) => {
                let cutoff = Utc::now() - ChronoDuration::days(self.outbox_gc_days);
                match self.outbox.gc(cutoff).await {
                    Ok(removed) => info!(job = job.name, removed, "outbox gc complete"),
                    Err(e) => error!(job = job.name, error = %e, "outbox gc failed"),
                }
            }
            JobAction::Synthetic { event_type } => {
                if let Err(e) = self.fan_out(job, event_type).await {
                    error!(job = job.name, error = %e, "synthetic fan-out failed");
                }
            }
        }
    }

    /// Fabricate and enqueue one envelope per (tenant, warehouse).
    async fn fan_out(&self, job: &SchedulerJob, event_type: &str) -> Result<(), String> {
        let event_type = EventType::parse(event_type).map_err(|e| e.to_string())?;
        let routing_key = scheduled_routing_key(job.name);

        let tenants = self.store.tenants().await.map_err(|e| e.to_string())?;
        for tenant_id in tenants {
            let warehouses = self
                .store
                .warehouses(tenant_id)
                .await
                .map_err(|e| e.to_string())?;
            for warehouse_id in warehouses {
                let ctx = EnvelopeContext::root(
                    tenant_id,
                    Some(warehouse_id),
                    Actor::system("scheduler"),
                );
                let payload = json!({
                    "job_name": job.name,
                    "triggered_by": "scheduler",
                    "warehouse_id": warehouse_id,
                });
                let envelope = EventEnvelope::record(event_type.clone(), payload, &ctx);

                let mut tx = self.store.begin().await.map_err(|e| e.to_string())?;
                tx.append_event(envelope.clone()).await.map_err(|e| e.to_string())?;
                tx.enqueue_outbox(OutboxEntry::pending(envelope, routing_key.clone()))
                    .await
                    .map_err(|e| e.to_string())?;
                tx.commit().await.map_err(|e| e.to_string())?;

                debug!(
                    job = job.name,
                    tenant_id = %tenant_id,
                    warehouse_id = %warehouse_id,
                    "synthetic event enqueued"
                );
            }
        }
        Ok(())
    }
}

/// Parse a five-field cron expression (the `cron` crate wants seconds).
fn parse_cron(expression: &str) -> Result<Schedule, cron::error::Error> {
    Schedule::from_str(&format!("0 {expression}"))
}
