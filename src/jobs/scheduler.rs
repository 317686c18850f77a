//! Periodic maintenance scheduler
//!
//! Runs one tokio task per sweep. Every tick first takes the sweep's leader
//! lease (TTL = interval) so that only one instance does the work.

use super::config::JobsConfig;
use super::leader::LeaderLock;
use super::sweeps::{AuditRetentionSweep, Sweep, VerificationTokenSweep, WebhookEventSweep};
use super::tokens::VerificationTokenStore;
use crate::audit::AuditLog;
use crate::billing::BillingStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// What one tick of a sweep did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The sweep ran and removed this many rows.
    Ran(u64),
    /// Another instance holds the lease.
    Skipped,
    Failed,
}

struct ScheduledSweep {
    sweep: Arc<dyn Sweep>,
    interval: Duration,
}

/// Schedules maintenance sweeps behind a [`LeaderLock`].
pub struct MaintenanceScheduler {
    leader: Arc<dyn LeaderLock>,
    instance_id: String,
    sweeps: Vec<ScheduledSweep>,
}

impl MaintenanceScheduler {
    /// Create a scheduler with no sweeps.
    ///
    /// `instance_id` identifies this process as a lease holder.
    #[must_use]
    pub fn new(leader: Arc<dyn LeaderLock>, instance_id: impl Into<String>) -> Self {
        Self {
            leader,
            instance_id: instance_id.into(),
            sweeps: Vec::new(),
        }
    }

    /// The three standard sweeps at the intervals from `config`.
    #[must_use]
    pub fn standard(
        leader: Arc<dyn LeaderLock>,
        instance_id: impl Into<String>,
        config: &JobsConfig,
        audit: AuditLog,
        billing: Arc<dyn BillingStore>,
        tokens: Arc<dyn VerificationTokenStore>,
    ) -> Self {
        Self::new(leader, instance_id)
            .with_sweep(Arc::new(AuditRetentionSweep::new(audit)), config.audit_interval())
            .with_sweep(Arc::new(WebhookEventSweep::new(billing)), config.webhook_interval())
            .with_sweep(Arc::new(VerificationTokenSweep::new(tokens)), config.token_interval())
    }

    #[must_use]
    pub fn with_sweep(mut self, sweep: Arc<dyn Sweep>, interval: Duration) -> Self {
        self.sweeps.push(ScheduledSweep { sweep, interval });
        self
    }

    /// Names of the registered sweeps.
    pub fn sweep_names(&self) -> Vec<&'static str> {
        self.sweeps.iter().map(|s| s.sweep.name()).collect()
    }

    /// Spawn one task per sweep. The first tick fires immediately.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = self
            .sweeps
            .into_iter()
            .map(|scheduled| {
                let leader = self.leader.clone();
                let instance_id = self.instance_id.clone();
                let mut shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(scheduled.interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    tracing::info!(
                        target: "tollgate::jobs",
                        sweep = scheduled.sweep.name(),
                        interval_secs = scheduled.interval.as_secs(),
                        "Sweep scheduled"
                    );
                    loop {
                        tokio::select! {
                            _ = shutdown_rx.changed() => break,
                            _ = ticker.tick() => {
                                run_tick(
                                    leader.as_ref(),
                                    &instance_id,
                                    scheduled.sweep.as_ref(),
                                    scheduled.interval,
                                )
                                .await;
                            }
                        }
                    }
                    tracing::info!(target: "tollgate::jobs", sweep = scheduled.sweep.name(), "Sweep stopped");
                })
            })
            .collect();

        SchedulerHandle { shutdown_tx, tasks }
    }
}

/// Run one tick of `sweep` if this instance gets the lease.
pub async fn run_tick(
    leader: &dyn LeaderLock,
    instance_id: &str,
    sweep: &dyn Sweep,
    interval: Duration,
) -> TickOutcome {
    match leader.try_acquire(sweep.name(), instance_id, interval).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(
                target: "tollgate::jobs",
                sweep = sweep.name(),
                instance_id,
                "Lease held elsewhere, skipping tick"
            );
            return TickOutcome::Skipped;
        }
        Err(e) => {
            tracing::warn!(target: "tollgate::jobs", sweep = sweep.name(), error = %e, "Failed to acquire lease");
            return TickOutcome::Failed;
        }
    }

    match sweep.run(Utc::now()).await {
        Ok(removed) => {
            tracing::info!(target: "tollgate::jobs", sweep = sweep.name(), removed, "Sweep finished");
            TickOutcome::Ran(removed)
        }
        Err(e) => {
            tracing::error!(target: "tollgate::jobs", sweep = sweep.name(), error = %e, "Sweep failed");
            TickOutcome::Failed
        }
    }
}

/// Running sweeps. Dropping the handle leaves them running.
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Signal every sweep to stop and wait for the tasks to finish.
    pub async fn shutdown(self) {
        tracing::info!(target: "tollgate::jobs", "Shutting down maintenance scheduler");
        let _ = self.shutdown_tx.send(true);
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                tracing::warn!(target: "tollgate::jobs", error = %e, "Sweep task ended abnormally");
            }
        }
    }
}
