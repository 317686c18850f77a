//! Audit trail.
//!
//! Append-only records of security, billing and organization events with a
//! retention sweep. Writes from the billing engines go through
//! [`AuditLog::record`], which never fails the caller.

mod service;
pub mod storage;
mod types;

pub use service::{AuditLog, DEFAULT_QUERY_LIMIT, DEFAULT_RETENTION_DAYS, MAX_QUERY_LIMIT};
pub use storage::AuditStore;
pub use types::{
    AuditActor, AuditAmount, AuditEntry, AuditEventType, AuditFilter, AuditPage, AuditSeverity,
    AuditStatus, AuditTarget, NewAuditEntry,
};

#[cfg(any(test, feature = "test-billing"))]
pub use storage::test::InMemoryAuditStore;
