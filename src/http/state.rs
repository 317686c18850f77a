use crate::billing::{
    BillingContext, BulkLicenseEngine, FeatureCatalog, OrganizationEngine, PlanManager, Reconciler,
    SubscriptionEngine, WebhookReconciler,
};
use crate::config::{Config, Environment};

/// Shared state of every handler.
///
/// Engines are built once from a [`BillingContext`]; cloning the state is
/// cheap.
#[derive(Clone)]
pub struct AppState {
    pub billing: BillingContext,
    pub environment: Environment,
    pub plans: PlanManager,
    pub catalog: FeatureCatalog,
    pub subscriptions: SubscriptionEngine,
    pub bulk: BulkLicenseEngine,
    pub organizations: OrganizationEngine,
    pub webhooks: WebhookReconciler,
    pub reconciler: Reconciler,
}

impl AppState {
    /// State with default webhook limits, for development and tests.
    #[must_use]
    pub fn new(billing: BillingContext) -> Self {
        Self {
            environment: Environment::default(),
            plans: PlanManager::new(billing.store.clone()),
            catalog: FeatureCatalog::new(billing.store.clone()),
            subscriptions: SubscriptionEngine::new(billing.clone()),
            bulk: BulkLicenseEngine::new(billing.clone()),
            organizations: OrganizationEngine::new(billing.clone()),
            webhooks: WebhookReconciler::new(billing.clone()),
            reconciler: Reconciler::new(billing.clone()),
            billing,
        }
    }

    /// State configured from `config`: usage toggles, webhook limits and
    /// retention, and the deployment environment.
    #[must_use]
    pub fn from_config(billing: BillingContext, config: &Config) -> Self {
        let billing = billing.with_config(config);
        let mut state = Self::new(billing);
        state.environment = config.environment;
        state.webhooks = state.webhooks.with_config(&config.webhook);
        state
    }
}
