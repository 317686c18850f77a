//! Leader election for periodic sweeps.
//!
//! Each sweep tick first acquires a named lease. When several instances run
//! the scheduler, only the lease holder does the work; the others skip the
//! tick.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// A named lease with a time-to-live.
#[async_trait]
pub trait LeaderLock: Send + Sync {
    /// Acquire or renew `name` for `holder`.
    ///
    /// Returns `false` when another holder owns an unexpired lease.
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Give up a lease. Releasing a lease held by someone else is a no-op.
    async fn release(&self, name: &str, holder: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

/// Process-local [`LeaderLock`].
///
/// Suitable for single-instance deployments and tests. Every scheduler that
/// shares one instance competes for the same leases.
#[derive(Clone, Default)]
pub struct InMemoryLeaderLock {
    leases: Arc<Mutex<HashMap<String, Lease>>>,
}

impl InMemoryLeaderLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `name`, if the lease has not expired.
    pub async fn holder(&self, name: &str) -> Option<String> {
        let leases = self.leases.lock().await;
        leases
            .get(name)
            .filter(|l| l.expires_at > Utc::now())
            .map(|l| l.holder.clone())
    }
}

#[async_trait]
impl LeaderLock for InMemoryLeaderLock {
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let mut leases = self.leases.lock().await;

        if let Some(lease) = leases.get(name) {
            if lease.holder != holder && lease.expires_at > now {
                return Ok(false);
            }
        }
        leases.insert(
            name.to_string(),
            Lease {
                holder: holder.to_string(),
                expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            },
        );
        Ok(true)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<()> {
        let mut leases = self.leases.lock().await;
        if leases.get(name).is_some_and(|l| l.holder == holder) {
            leases.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_holder_is_refused() {
        let lock = InMemoryLeaderLock::new();
        let ttl = Duration::from_secs(60);

        assert!(lock.try_acquire("audit", "a", ttl).await.unwrap());
        assert!(!lock.try_acquire("audit", "b", ttl).await.unwrap());
        // Renewal by the holder succeeds
        assert!(lock.try_acquire("audit", "a", ttl).await.unwrap());
        // Other names are independent
        assert!(lock.try_acquire("webhooks", "b", ttl).await.unwrap());
        assert_eq!(lock.holder("audit").await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken() {
        let lock = InMemoryLeaderLock::new();
        assert!(lock.try_acquire("audit", "a", Duration::ZERO).await.unwrap());
        assert!(lock.try_acquire("audit", "b", Duration::from_secs(60)).await.unwrap());
        assert_eq!(lock.holder("audit").await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let lock = InMemoryLeaderLock::new();
        let ttl = Duration::from_secs(60);
        lock.try_acquire("audit", "a", ttl).await.unwrap();

        lock.release("audit", "b").await.unwrap();
        assert_eq!(lock.holder("audit").await.as_deref(), Some("a"));

        lock.release("audit", "a").await.unwrap();
        assert!(lock.holder("audit").await.is_none());
    }
}
