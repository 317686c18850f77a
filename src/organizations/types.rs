//! Organization, membership and group types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Role of a member within an organization.
///
/// ```rust
/// use tollgate::organizations::OrgRole;
///
/// assert!(OrgRole::Manager.can_manage_billing());
/// assert!(!OrgRole::Member.can_manage_billing());
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrgRole {
    /// Creator of the organization; owns billing.
    Owner,
    /// Manages groups, members and subscriptions.
    Manager,
    #[default]
    Member,
}

impl OrgRole {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Manager => "manager",
            Self::Member => "member",
        }
    }

    /// Higher means more permissions.
    #[must_use]
    pub fn priority(&self) -> u8 {
        match self {
            Self::Owner => 100,
            Self::Manager => 50,
            Self::Member => 10,
        }
    }

    #[must_use]
    pub fn is_owner(&self) -> bool {
        matches!(self, Self::Owner)
    }

    /// Owners and managers.
    #[must_use]
    pub fn is_manager(&self) -> bool {
        matches!(self, Self::Owner | Self::Manager)
    }

    #[must_use]
    pub fn can_manage_billing(&self) -> bool {
        self.is_manager()
    }
}

/// Error returned when parsing a role string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseRoleError {
    invalid_value: String,
}

impl fmt::Display for ParseRoleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid role: '{}' (expected: owner, manager, or member)", self.invalid_value)
    }
}

impl std::error::Error for ParseRoleError {}

impl FromStr for OrgRole {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "owner" => Ok(Self::Owner),
            "manager" => Ok(Self::Manager),
            "member" => Ok(Self::Member),
            _ => Err(ParseRoleError {
                invalid_value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for OrgRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub owner_user_id: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Organization {
    #[must_use]
    pub fn new(name: impl Into<String>, owner_user_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            owner_user_id: owner_user_id.into(),
            is_active: true,
            created_at: Utc::now(),
        }
    }
}

/// A user's membership in an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub organization_id: Uuid,
    pub user_id: String,
    pub role: OrgRole,
    pub is_active: bool,
    pub joined_at: DateTime<Utc>,
}

impl Membership {
    #[must_use]
    pub fn new(organization_id: Uuid, user_id: impl Into<String>, role: OrgRole) -> Self {
        Self {
            organization_id,
            user_id: user_id.into(),
            role,
            is_active: true,
            joined_at: Utc::now(),
        }
    }
}

/// Role of a member within a group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupRole {
    Owner,
    Admin,
    Assistant,
    #[default]
    Member,
}

impl GroupRole {
    /// Owners and admins.
    #[must_use]
    pub fn can_manage(&self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }
}

/// A class or team, optionally inside an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub organization_id: Option<Uuid>,
    pub owner_user_id: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Group {
    #[must_use]
    pub fn new(name: impl Into<String>, owner_user_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            organization_id: None,
            owner_user_id: owner_user_id.into(),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn in_organization(mut self, organization_id: Uuid) -> Self {
        self.organization_id = Some(organization_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub group_id: Uuid,
    pub user_id: String,
    pub role: GroupRole,
    /// Who added the member, e.g. the purchaser of an assigned license.
    pub invited_by: Option<String>,
    pub is_active: bool,
    pub joined_at: DateTime<Utc>,
}
