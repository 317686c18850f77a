//! Storage port for e-mail verification tokens.
//!
//! Tokens are issued by the surrounding application; the maintenance sweep
//! only needs to remove the expired ones.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait VerificationTokenStore: Send + Sync {
    /// Delete tokens whose expiry is at or before `now`. Returns how many were removed.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// In-memory implementation for tests.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    #[derive(Debug, Clone)]
    pub struct VerificationToken {
        pub user_id: String,
        pub expires_at: DateTime<Utc>,
    }

    #[derive(Clone, Default)]
    pub struct InMemoryVerificationTokenStore {
        tokens: Arc<RwLock<HashMap<String, VerificationToken>>>,
    }

    impl InMemoryVerificationTokenStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn insert(&self, token: &str, user_id: &str, expires_at: DateTime<Utc>) {
            self.tokens.write().await.insert(
                token.to_string(),
                VerificationToken {
                    user_id: user_id.to_string(),
                    expires_at,
                },
            );
        }

        pub async fn len(&self) -> usize {
            self.tokens.read().await.len()
        }

        pub async fn is_empty(&self) -> bool {
            self.tokens.read().await.is_empty()
        }
    }

    #[async_trait]
    impl VerificationTokenStore for InMemoryVerificationTokenStore {
        async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
            let mut tokens = self.tokens.write().await;
            let before = tokens.len();
            tokens.retain(|_, t| t.expires_at > now);
            Ok((before - tokens.len()) as u64)
        }
    }
}
