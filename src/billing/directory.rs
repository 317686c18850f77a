//! Identity provider port.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::BillingResult;

/// Role that bypasses organization membership checks.
pub const ADMIN_ROLE: &str = "administrator";

/// A user as known to the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub id: String,
    pub email: String,
    pub name: String,
    pub email_verified: bool,
    pub roles: Vec<String>,
}

impl DirectoryUser {
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Lookups and role changes against the identity provider.
///
/// `get_user` returns `Ok(None)` for an unknown user and
/// `Err(DirectoryUnavailable)` when the provider cannot be reached.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn get_user(&self, user_id: &str) -> BillingResult<Option<DirectoryUser>>;

    async fn assign_role(&self, user_id: &str, role: &str) -> BillingResult<()>;

    async fn revoke_role(&self, user_id: &str, role: &str) -> BillingResult<()>;
}

/// In-memory directory for tests.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use crate::billing::error::BillingError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, RwLock};

    #[derive(Default, Clone)]
    pub struct MockDirectory {
        inner: Arc<MockDirectoryInner>,
    }

    #[derive(Default)]
    struct MockDirectoryInner {
        users: RwLock<HashMap<String, DirectoryUser>>,
        unavailable: AtomicBool,
    }

    impl MockDirectory {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Add a verified user with the given roles.
        pub fn add_user(&self, id: &str, roles: &[&str]) -> DirectoryUser {
            let user = DirectoryUser {
                id: id.to_string(),
                email: format!("{}@example.com", id),
                name: id.to_string(),
                email_verified: true,
                roles: roles.iter().map(|r| r.to_string()).collect(),
            };
            self.insert(user.clone());
            user
        }

        pub fn insert(&self, user: DirectoryUser) {
            self.inner.users.write().unwrap().insert(user.id.clone(), user);
        }

        /// Make every call fail with `DirectoryUnavailable`.
        pub fn set_unavailable(&self, unavailable: bool) {
            self.inner.unavailable.store(unavailable, Ordering::SeqCst);
        }

        pub fn roles(&self, user_id: &str) -> Vec<String> {
            self.inner
                .users
                .read()
                .unwrap()
                .get(user_id)
                .map(|u| u.roles.clone())
                .unwrap_or_default()
        }

        fn check_available(&self) -> BillingResult<()> {
            if self.inner.unavailable.load(Ordering::SeqCst) {
                return Err(BillingError::DirectoryUnavailable {
                    message: "directory offline".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Directory for MockDirectory {
        async fn get_user(&self, user_id: &str) -> BillingResult<Option<DirectoryUser>> {
            self.check_available()?;
            Ok(self.inner.users.read().unwrap().get(user_id).cloned())
        }

        async fn assign_role(&self, user_id: &str, role: &str) -> BillingResult<()> {
            self.check_available()?;
            let mut users = self.inner.users.write().unwrap();
            let user = users
                .get_mut(user_id)
                .ok_or_else(|| BillingError::UserNotFound {
                    user_id: user_id.to_string(),
                })?;
            if !user.has_role(role) {
                user.roles.push(role.to_string());
            }
            Ok(())
        }

        async fn revoke_role(&self, user_id: &str, role: &str) -> BillingResult<()> {
            self.check_available()?;
            if let Some(user) = self.inner.users.write().unwrap().get_mut(user_id) {
                user.roles.retain(|r| r != role);
            }
            Ok(())
        }
    }
}
