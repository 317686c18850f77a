//! Feature catalog.
//!
//! The authoritative list of feature keys plans may reference. Seeding is
//! idempotent: existing keys are never duplicated or overwritten.

use std::sync::Arc;

use super::error::{BillingError, BillingResult};
use super::storage::BillingStore;
use super::types::{FeatureCategory, FeatureDefinition, FeatureValueType, Plan};

/// Seeds and validates feature keys.
#[derive(Clone)]
pub struct FeatureCatalog {
    store: Arc<dyn BillingStore>,
}

impl FeatureCatalog {
    #[must_use]
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Insert the default definitions. Returns how many rows were written.
    pub async fn seed(&self) -> BillingResult<usize> {
        let mut inserted = 0;
        for feature in default_features() {
            if self.store.insert_feature_if_absent(&feature).await? {
                inserted += 1;
            }
        }
        tracing::info!(
            target: "tollgate::billing::catalog",
            inserted,
            "Feature catalog seeded"
        );
        Ok(inserted)
    }

    /// Fail with `UnknownFeature` unless every key exists and is active.
    pub async fn validate_keys<'a, I>(&self, keys: I) -> BillingResult<()>
    where
        I: IntoIterator<Item = &'a String>,
    {
        for key in keys {
            match self.store.get_feature(key).await? {
                Some(feature) if feature.is_active => {}
                _ => return Err(BillingError::UnknownFeature { key: key.clone() }),
            }
        }
        Ok(())
    }

    /// Validate everything a plan references.
    pub async fn validate_plan(&self, plan: &Plan) -> BillingResult<()> {
        self.validate_keys(plan.referenced_features()).await
    }

    pub async fn list(&self) -> BillingResult<Vec<FeatureDefinition>> {
        self.store.list_features().await
    }
}

fn feature(
    key: &str,
    en: &str,
    fr: &str,
    category: FeatureCategory,
    value_type: FeatureValueType,
    unit: Option<&str>,
    default_value: &str,
) -> FeatureDefinition {
    FeatureDefinition {
        key: key.to_string(),
        display_name_en: en.to_string(),
        display_name_fr: fr.to_string(),
        description: String::new(),
        category,
        value_type,
        unit: unit.map(str::to_string),
        default_value: default_value.to_string(),
        is_active: true,
    }
}

/// Built-in feature definitions.
#[must_use]
pub fn default_features() -> Vec<FeatureDefinition> {
    use FeatureCategory::*;
    use FeatureValueType::{Boolean, Number};

    vec![
        feature("unlimited_courses", "Unlimited Courses", "Cours illimités", Capabilities, Boolean, None, "false"),
        feature("advanced_labs", "Advanced Labs", "Laboratoires avancés", Capabilities, Boolean, None, "false"),
        feature("export", "Course Export", "Export de cours", Capabilities, Boolean, None, "false"),
        feature("custom_themes", "Custom Themes", "Thèmes personnalisés", Capabilities, Boolean, None, "false"),
        feature("bulk_purchase", "Bulk License Purchase", "Achat de licences en gros", Capabilities, Boolean, None, "false"),
        feature("group_management", "Group Management", "Gestion des groupes", Capabilities, Boolean, None, "false"),
        feature("api_access", "API Access", "Accès API", Capabilities, Boolean, None, "false"),
        feature("analytics", "Analytics Dashboard", "Tableau de bord analytique", Capabilities, Boolean, None, "false"),
        feature("priority_support", "Priority Support", "Support prioritaire", Capabilities, Boolean, None, "false"),
        feature("machine_size_xs", "XS Machine (0.5 CPU, 256MB)", "Machine XS (0.5 CPU, 256Mo)", MachineSizes, Boolean, None, "false"),
        feature("machine_size_s", "S Machine (1 CPU, 512MB)", "Machine S (1 CPU, 512Mo)", MachineSizes, Boolean, None, "false"),
        feature("machine_size_m", "M Machine (2 CPU, 1GB)", "Machine M (2 CPU, 1Go)", MachineSizes, Boolean, None, "false"),
        feature("machine_size_l", "L Machine (4 CPU, 4GB)", "Machine L (4 CPU, 4Go)", MachineSizes, Boolean, None, "false"),
        feature("machine_size_xl", "XL Machine (8 CPU, 8GB)", "Machine XL (8 CPU, 8Go)", MachineSizes, Boolean, None, "false"),
        feature("network_access", "External Network Access", "Accès réseau externe", TerminalLimits, Boolean, None, "false"),
        feature("data_persistence", "Persistent Storage", "Stockage persistant", TerminalLimits, Boolean, None, "false"),
        feature("data_persistence_gb", "Storage Quota", "Quota de stockage", TerminalLimits, Number, Some("GB"), "0"),
        feature("command_history", "Command History Recording", "Enregistrement historique", TerminalLimits, Boolean, None, "false"),
        feature("command_history_retention_days", "History Retention", "Rétention de l'historique", TerminalLimits, Number, Some("days"), "0"),
        feature("max_session_duration_minutes", "Max Session Duration", "Durée max de session", TerminalLimits, Number, Some("minutes"), "60"),
        feature("max_concurrent_terminals", "Max Concurrent Terminals", "Terminaux simultanés max", TerminalLimits, Number, Some("count"), "1"),
        feature("max_courses", "Max Courses (-1 = unlimited)", "Cours max (-1 = illimité)", CourseLimits, Number, Some("count"), "-1"),
        feature("max_concurrent_users", "Max Concurrent Users", "Utilisateurs simultanés max", CourseLimits, Number, Some("count"), "1"),
    ]
}
