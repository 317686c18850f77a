//! Audit entry types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Audit event types, serialized as dotted codes such as `billing.license.assigned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum AuditEventType {
    // Authentication
    Login,
    LoginFailed,
    Logout,
    PasswordChange,
    PasswordReset,
    TokenRevoke,

    // User management
    UserCreated,
    UserUpdated,
    UserDeleted,
    UserSuspended,
    UserReactivated,
    UserRoleAssigned,
    UserRoleRevoked,

    // Billing
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionCanceled,
    SubscriptionRenewed,
    PaymentSucceeded,
    PaymentFailed,
    BulkPurchase,
    LicenseAssigned,
    LicenseRevoked,
    WebhookProcessed,

    // Organizations and groups
    OrganizationCreated,
    OrganizationUpdated,
    OrganizationDeleted,
    MemberAdded,
    MemberRemoved,
    MemberRoleChanged,
    GroupCreated,
    GroupUpdated,
    GroupDeleted,
    GroupMemberAdded,
    GroupMemberRemoved,

    // Security
    PermissionGranted,
    PermissionRevoked,
    AccessDenied,
    SuspiciousActivity,

    // System
    ConfigurationChanged,
    MaintenanceStarted,
    MaintenanceEnded,
}

impl AuditEventType {
    const ALL: [AuditEventType; 41] = [
        Self::Login,
        Self::LoginFailed,
        Self::Logout,
        Self::PasswordChange,
        Self::PasswordReset,
        Self::TokenRevoke,
        Self::UserCreated,
        Self::UserUpdated,
        Self::UserDeleted,
        Self::UserSuspended,
        Self::UserReactivated,
        Self::UserRoleAssigned,
        Self::UserRoleRevoked,
        Self::SubscriptionCreated,
        Self::SubscriptionUpdated,
        Self::SubscriptionCanceled,
        Self::SubscriptionRenewed,
        Self::PaymentSucceeded,
        Self::PaymentFailed,
        Self::BulkPurchase,
        Self::LicenseAssigned,
        Self::LicenseRevoked,
        Self::WebhookProcessed,
        Self::OrganizationCreated,
        Self::OrganizationUpdated,
        Self::OrganizationDeleted,
        Self::MemberAdded,
        Self::MemberRemoved,
        Self::MemberRoleChanged,
        Self::GroupCreated,
        Self::GroupUpdated,
        Self::GroupDeleted,
        Self::GroupMemberAdded,
        Self::GroupMemberRemoved,
        Self::PermissionGranted,
        Self::PermissionRevoked,
        Self::AccessDenied,
        Self::SuspiciousActivity,
        Self::ConfigurationChanged,
        Self::MaintenanceStarted,
        Self::MaintenanceEnded,
    ];

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Login => "auth.login",
            Self::LoginFailed => "auth.login.failed",
            Self::Logout => "auth.logout",
            Self::PasswordChange => "auth.password.change",
            Self::PasswordReset => "auth.password.reset",
            Self::TokenRevoke => "auth.token.revoke",
            Self::UserCreated => "user.created",
            Self::UserUpdated => "user.updated",
            Self::UserDeleted => "user.deleted",
            Self::UserSuspended => "user.suspended",
            Self::UserReactivated => "user.reactivated",
            Self::UserRoleAssigned => "user.role.assigned",
            Self::UserRoleRevoked => "user.role.revoked",
            Self::SubscriptionCreated => "billing.subscription.created",
            Self::SubscriptionUpdated => "billing.subscription.updated",
            Self::SubscriptionCanceled => "billing.subscription.canceled",
            Self::SubscriptionRenewed => "billing.subscription.renewed",
            Self::PaymentSucceeded => "billing.payment.succeeded",
            Self::PaymentFailed => "billing.payment.failed",
            Self::BulkPurchase => "billing.bulk.purchase",
            Self::LicenseAssigned => "billing.license.assigned",
            Self::LicenseRevoked => "billing.license.revoked",
            Self::WebhookProcessed => "billing.webhook.processed",
            Self::OrganizationCreated => "organization.created",
            Self::OrganizationUpdated => "organization.updated",
            Self::OrganizationDeleted => "organization.deleted",
            Self::MemberAdded => "organization.member.added",
            Self::MemberRemoved => "organization.member.removed",
            Self::MemberRoleChanged => "organization.member.role.changed",
            Self::GroupCreated => "group.created",
            Self::GroupUpdated => "group.updated",
            Self::GroupDeleted => "group.deleted",
            Self::GroupMemberAdded => "group.member.added",
            Self::GroupMemberRemoved => "group.member.removed",
            Self::PermissionGranted => "security.permission.granted",
            Self::PermissionRevoked => "security.permission.revoked",
            Self::AccessDenied => "security.access.denied",
            Self::SuspiciousActivity => "security.suspicious.activity",
            Self::ConfigurationChanged => "system.configuration.changed",
            Self::MaintenanceStarted => "system.maintenance.started",
            Self::MaintenanceEnded => "system.maintenance.ended",
        }
    }

    /// Severity used when the caller does not pick one.
    #[must_use]
    pub fn default_severity(&self) -> AuditSeverity {
        match self {
            Self::LoginFailed
            | Self::PaymentFailed
            | Self::UserDeleted
            | Self::UserSuspended
            | Self::AccessDenied => AuditSeverity::Warning,
            Self::SuspiciousActivity => AuditSeverity::Critical,
            _ => AuditSeverity::Info,
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for AuditEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|e| e.code() == s)
            .copied()
            .ok_or_else(|| format!("unknown audit event type '{}'", s))
    }
}

impl From<AuditEventType> for String {
    fn from(event: AuditEventType) -> Self {
        event.code().to_string()
    }
}

impl TryFrom<String> for AuditEventType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Importance of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AuditSeverity {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for AuditSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

impl fmt::Display for AuditSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Failed,
    Pending,
}

impl AuditStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Pending => "pending",
        }
    }
}

impl FromStr for AuditStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "pending" => Ok(Self::Pending),
            other => Err(format!("unknown audit status '{}'", other)),
        }
    }
}

/// Who performed the action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditActor {
    /// `None` for system events.
    pub id: Option<String>,
    pub email: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// What was affected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditTarget {
    pub id: Option<String>,
    /// e.g. `subscription`, `license`, `organization`.
    pub kind: Option<String>,
    pub name: Option<String>,
}

/// Monetary amount attached to billing events, in minor units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditAmount {
    pub amount: i64,
    pub currency: String,
}

/// An immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub actor: AuditActor,
    pub target: AuditTarget,
    pub organization_id: Option<Uuid>,
    pub action: String,
    pub status: AuditStatus,
    pub error_message: Option<String>,
    /// Always a JSON object.
    pub metadata: serde_json::Value,
    pub amount: Option<AuditAmount>,
    pub request_id: Option<String>,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// An entry before it is appended. Timestamps are set by the audit log.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    pub event_type: AuditEventType,
    pub severity: Option<AuditSeverity>,
    pub actor: AuditActor,
    pub target: AuditTarget,
    pub organization_id: Option<Uuid>,
    pub action: String,
    pub status: AuditStatus,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
    pub amount: Option<AuditAmount>,
    pub request_id: Option<String>,
    pub session_id: Option<String>,
}

impl NewAuditEntry {
    #[must_use]
    pub fn new(event_type: AuditEventType, action: impl Into<String>) -> Self {
        Self {
            event_type,
            severity: None,
            actor: AuditActor::default(),
            target: AuditTarget::default(),
            organization_id: None,
            action: action.into(),
            status: AuditStatus::Success,
            error_message: None,
            metadata: serde_json::Value::Null,
            amount: None,
            request_id: None,
            session_id: None,
        }
    }

    #[must_use]
    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor.id = Some(actor_id.into());
        self
    }

    #[must_use]
    pub fn actor_details(mut self, actor: AuditActor) -> Self {
        self.actor = actor;
        self
    }

    #[must_use]
    pub fn target(mut self, kind: &str, id: impl ToString) -> Self {
        self.target.kind = Some(kind.to_string());
        self.target.id = Some(id.to_string());
        self
    }

    #[must_use]
    pub fn target_name(mut self, name: impl Into<String>) -> Self {
        self.target.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn organization(mut self, organization_id: Uuid) -> Self {
        self.organization_id = Some(organization_id);
        self
    }

    #[must_use]
    pub fn severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Mark the entry failed. Severity is raised to at least `warning`.
    #[must_use]
    pub fn failed(mut self, error: impl fmt::Display) -> Self {
        self.status = AuditStatus::Failed;
        self.error_message = Some(error.to_string());
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn amount(mut self, amount: i64, currency: impl Into<String>) -> Self {
        self.amount = Some(AuditAmount {
            amount,
            currency: currency.into(),
        });
        self
    }

    #[must_use]
    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// The severity the entry is stored with.
    #[must_use]
    pub fn effective_severity(&self) -> AuditSeverity {
        let base = self
            .severity
            .unwrap_or_else(|| self.event_type.default_severity());
        if self.status == AuditStatus::Failed {
            base.max(AuditSeverity::Warning)
        } else {
            base
        }
    }
}

/// Filter for audit queries. Every set field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFilter {
    pub actor_id: Option<String>,
    pub target_id: Option<String>,
    pub organization_id: Option<Uuid>,
    pub event_type: Option<AuditEventType>,
    pub severity: Option<AuditSeverity>,
    pub status: Option<AuditStatus>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl AuditFilter {
    /// Whether `entry` satisfies every predicate except paging.
    #[must_use]
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.actor_id
            .as_ref()
            .is_none_or(|id| entry.actor.id.as_ref() == Some(id))
            && self
                .target_id
                .as_ref()
                .is_none_or(|id| entry.target.id.as_ref() == Some(id))
            && self
                .organization_id
                .is_none_or(|id| entry.organization_id == Some(id))
            && self.event_type.is_none_or(|t| entry.event_type == t)
            && self.severity.is_none_or(|s| entry.severity == s)
            && self.status.is_none_or(|s| entry.status == s)
            && self.start_date.is_none_or(|d| entry.created_at >= d)
            && self.end_date.is_none_or(|d| entry.created_at <= d)
    }
}

/// A page of audit entries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditPage {
    pub entries: Vec<AuditEntry>,
    /// Matches before paging.
    pub total: u64,
    pub limit: i64,
    pub offset: i64,
}
