//! Organizations, memberships and groups as seen by billing.
//!
//! Organization subscriptions are granted to every active member, and
//! license batches may auto-enroll assignees into a group. This module holds
//! the storage trait for that data and the access policy for org-scoped
//! billing operations.
//!
//! # Features
//!
//! - `test-billing` - In-memory [`MembershipStore`] for testing

mod policy;
pub mod storage;
mod types;


pub use policy::{OrganizationAccess, OrganizationPolicy};
pub use storage::MembershipStore;
pub use types::{Group, GroupMember, GroupRole, Membership, OrgRole, Organization, ParseRoleError};

#[cfg(any(test, feature = "test-billing"))]
pub use test::InMemoryMembershipStore;
