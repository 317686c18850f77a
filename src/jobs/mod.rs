//! Background maintenance
//!
//! Periodic sweeps that remove expired audit entries, webhook dedup records
//! and verification tokens. Sweeps are guarded by a [`LeaderLock`] so that
//! several instances can run the scheduler side by side.

mod config;
mod leader;
mod scheduler;
mod sweeps;
pub mod tokens;


pub use config::JobsConfig;
pub use leader::{InMemoryLeaderLock, LeaderLock};
pub use scheduler::{MaintenanceScheduler, SchedulerHandle, TickOutcome, run_tick};
pub use sweeps::{AuditRetentionSweep, Sweep, VerificationTokenSweep, WebhookEventSweep};
pub use tokens::VerificationTokenStore;

#[cfg(any(test, feature = "test-billing"))]
pub use tokens::test::InMemoryVerificationTokenStore;
