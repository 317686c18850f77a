//! Organization access policy.
//!
//! A caller reaches an organization's billing either through an active
//! membership or through the global administrator role.

use std::sync::Arc;
use uuid::Uuid;

use super::storage::MembershipStore;
use super::types::Membership;
use crate::auth::Principal;
use crate::billing::error::{BillingError, BillingResult};

/// How a caller was admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrganizationAccess {
    Member(Membership),
    /// Global administrator without (or regardless of) membership.
    Administrator,
}

impl OrganizationAccess {
    #[must_use]
    pub fn is_administrator(&self) -> bool {
        matches!(self, Self::Administrator)
    }
}

/// Checks principals against organization memberships.
#[derive(Clone)]
pub struct OrganizationPolicy {
    memberships: Arc<dyn MembershipStore>,
}

impl OrganizationPolicy {
    #[must_use]
    pub fn new(memberships: Arc<dyn MembershipStore>) -> Self {
        Self { memberships }
    }

    async fn ensure_exists(&self, organization_id: Uuid) -> BillingResult<()> {
        match self.memberships.get_organization(organization_id).await? {
            Some(org) if org.is_active => Ok(()),
            _ => Err(BillingError::OrganizationNotFound {
                id: organization_id.to_string(),
            }),
        }
    }

    /// Admit active members and administrators.
    pub async fn require_member(
        &self,
        principal: &Principal,
        organization_id: Uuid,
    ) -> BillingResult<OrganizationAccess> {
        self.ensure_exists(organization_id).await?;
        if principal.is_admin() {
            return Ok(OrganizationAccess::Administrator);
        }
        self.memberships
            .active_membership(organization_id, &principal.user_id)
            .await?
            .map(OrganizationAccess::Member)
            .ok_or_else(|| BillingError::access_denied("You are not a member of this organization"))
    }

    /// Admit owners, managers and administrators.
    pub async fn require_manager(
        &self,
        principal: &Principal,
        organization_id: Uuid,
    ) -> BillingResult<OrganizationAccess> {
        match self.require_member(principal, organization_id).await? {
            OrganizationAccess::Member(m) if !m.role.can_manage_billing() => Err(BillingError::access_denied(
                "Only organization owners and managers can manage subscriptions",
            )),
            access => Ok(access),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::directory::ADMIN_ROLE;
    use crate::organizations::test::InMemoryMembershipStore;
    use crate::organizations::types::OrgRole;

    #[tokio::test]
    async fn test_member_and_admin_paths() {
        let store = InMemoryMembershipStore::new();
        let org = store.seed_organization("Acme", "owner");
        store.seed_member(org.id, "member", OrgRole::Member);
        let policy = OrganizationPolicy::new(Arc::new(store));

        let owner = Principal::new("owner");
        assert!(matches!(
            policy.require_manager(&owner, org.id).await.unwrap(),
            OrganizationAccess::Member(_)
        ));

        let member = Principal::new("member");
        assert!(policy.require_member(&member, org.id).await.is_ok());
        assert!(matches!(
            policy.require_manager(&member, org.id).await.unwrap_err(),
            BillingError::AccessDenied { .. }
        ));

        let stranger = Principal::new("stranger");
        assert!(policy.require_member(&stranger, org.id).await.is_err());

        let admin = Principal::new("root").with_roles([ADMIN_ROLE]);
        assert!(policy
            .require_manager(&admin, org.id)
            .await
            .unwrap()
            .is_administrator());
    }

    #[tokio::test]
    async fn test_unknown_organization() {
        let policy = OrganizationPolicy::new(Arc::new(InMemoryMembershipStore::new()));
        let admin = Principal::new("root").with_roles([ADMIN_ROLE]);
        assert!(matches!(
            policy.require_member(&admin, Uuid::new_v4()).await.unwrap_err(),
            BillingError::OrganizationNotFound { .. }
        ));
    }
}
