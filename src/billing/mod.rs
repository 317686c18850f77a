//! Billing and entitlements.
//!
//! Plans, personal subscriptions, bulk license batches and organization
//! subscriptions, kept in step with an external payment gateway through
//! webhooks and reconciliation sweeps.
//!
//! Every engine is built from a [`BillingContext`] holding the ports it talks
//! to: a [`BillingStore`], a [`PaymentGateway`], a user [`Directory`] and a
//! [`MembershipStore`](crate::organizations::MembershipStore).
//!
//! # Features
//!
//! - `live-gateway` - [`LiveGateway`], an HTTP client for the payment gateway
//! - `database` - [`SeaOrmBillingStore`] for Postgres
//! - `test-billing` - In-memory store, mock gateway and mock directory
//!
//! # Example
//!
//! ```rust,ignore
//! use tollgate::billing::{BillingContext, BulkLicenseEngine, SubscriptionEngine};
//!
//! let ctx = BillingContext::new(store, gateway, directory, memberships, audit)
//!     .with_config(&config);
//!
//! let subscriptions = SubscriptionEngine::new(ctx.clone());
//! let sub = subscriptions.create_subscription("user-1", plan_id).await?;
//!
//! let bulk = BulkLicenseEngine::new(ctx);
//! let batch = bulk.create_batch("trainer-1", plan_id, 20, None).await?;
//! bulk.assign_license(batch.id, &principal, "user-42").await?;
//! ```

pub mod analytics;
pub mod bulk;
pub mod catalog;
pub mod context;
pub mod directory;
pub mod error;
pub mod fixtures;
pub mod gateway;
pub mod invariants;
#[cfg(feature = "live-gateway")]
pub mod live_client;
pub mod organization;
pub mod plans;
pub mod pricing;
pub mod reconcile;
#[cfg(feature = "database")]
pub mod sea_orm_store;
pub mod signature;
pub mod storage;
pub mod subscription;
pub mod types;
pub mod usage;
pub mod webhook;

pub use analytics::{SubscriptionAnalytics, subscription_analytics};
pub use bulk::{BulkLicenseEngine, MAX_BATCH_QUANTITY};
pub use catalog::{FeatureCatalog, default_features};
pub use context::{BillingContext, DEFAULT_WEBHOOK_RETENTION_DAYS};
pub use directory::{ADMIN_ROLE, Directory, DirectoryUser};
pub use error::{BillingError, BillingResult};
pub use fixtures::{sample_plans, seed_sample_plans};
pub use gateway::{
    CheckoutSession, CreateSubscriptionRequest, GatewayInvoice, GatewayMetadata,
    GatewaySubscription, PaymentGateway, ProrationBehavior, WebhookEvent,
};
pub use invariants::{BatchReport, check_batch, inconsistent_batches};
#[cfg(feature = "live-gateway")]
pub use live_client::{InvalidApiKeyError, LiveGateway};
pub use organization::{
    EffectiveFeatures, OrganizationEngine, OrganizationEntitlement, OrganizationFeatures,
    OrganizationSubscriptionRequest,
};
pub use plans::PlanManager;
pub use pricing::{PriceQuote, TierBreakdown, compute_price};
pub use reconcile::{ReconcileFailure, ReconcileResult, Reconciler};
#[cfg(feature = "database")]
pub use sea_orm_store::SeaOrmBillingStore;
pub use signature::WebhookSignature;
pub use storage::{BillingStore, LockKey, StoreLock};
pub use subscription::{ActiveSubscription, AdminAssignment, MAX_ASSIGNMENT_DAYS, SubscriptionEngine};
pub use types::{
    BatchStatus, BillingInterval, FeatureCategory, FeatureDefinition, FeatureValueType, Invoice,
    LicenseBatch, MetricType, ParkedSubscription, Plan, PlanBuilder, PricingTier, Subscription,
    SubscriptionScope, SubscriptionStatus, SubscriptionType, UNLIMITED, UsageMetric,
    WebhookEventRecord, WebhookEventStatus,
};
pub use usage::{UsageCheck, UsageTracker};
pub use webhook::{SIGNATURE_HEADER, WebhookHeaders, WebhookOutcome, WebhookReconciler};

// Test exports
#[cfg(any(test, feature = "test-billing"))]
pub use context::test::TestBilling;
#[cfg(any(test, feature = "test-billing"))]
pub use directory::test::MockDirectory;
#[cfg(any(test, feature = "test-billing"))]
pub use gateway::test::MockGateway;
#[cfg(any(test, feature = "test-billing"))]
pub use storage::test::InMemoryBillingStore;
