//! Membership storage trait.

use crate::error::Result;
use crate::organizations::types::{Group, GroupMember, GroupRole, Membership, Organization};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Organizations, their members, and groups.
///
/// The billing engines only read memberships and add group members; the rest
/// of organization management lives with the application.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    // === Organizations ===

    async fn insert_organization(&self, organization: &Organization) -> Result<()>;

    async fn get_organization(&self, organization_id: Uuid) -> Result<Option<Organization>>;

    // === Memberships ===

    /// Insert or replace the membership for `(organization_id, user_id)`.
    async fn upsert_membership(&self, membership: &Membership) -> Result<()>;

    async fn get_membership(&self, organization_id: Uuid, user_id: &str) -> Result<Option<Membership>>;

    /// Active memberships of a user.
    async fn list_user_memberships(&self, user_id: &str) -> Result<Vec<Membership>>;

    /// Active members of an organization.
    async fn list_members(&self, organization_id: Uuid) -> Result<Vec<Membership>>;

    // === Groups ===

    async fn insert_group(&self, group: &Group) -> Result<()>;

    async fn get_group(&self, group_id: Uuid) -> Result<Option<Group>>;

    async fn get_group_member(&self, group_id: Uuid, user_id: &str) -> Result<Option<GroupMember>>;

    /// Add `user_id` to the group, reactivating an inactive membership.
    ///
    /// Returns `false` when the user already is an active member; the
    /// existing row is left untouched.
    async fn add_group_member(
        &self,
        group_id: Uuid,
        user_id: &str,
        role: GroupRole,
        invited_by: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn list_group_members(&self, group_id: Uuid) -> Result<Vec<GroupMember>>;

    // === Provided helpers ===

    /// Active membership of the user in the organization, if any.
    async fn active_membership(&self, organization_id: Uuid, user_id: &str) -> Result<Option<Membership>> {
        Ok(self
            .get_membership(organization_id, user_id)
            .await?
            .filter(|m| m.is_active))
    }
}
