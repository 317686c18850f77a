//! SeaORM-backed billing storage.
//!
//! Persists every billing aggregate in Postgres. Rows keep the columns the
//! store filters, orders or constrains on, plus a `data` JSONB document with
//! the full record. The schema lives in `migrations/001_billing.sql`.
//!
//! Locks are Postgres advisory locks held by an open transaction, so they
//! serialize across every instance sharing the database.
//!
//! # Example
//!
//! ```rust,ignore
//! use tollgate::billing::{BillingContext, SeaOrmBillingStore};
//!
//! let db = sea_orm::Database::connect(std::env::var("DATABASE_URL")?).await?;
//! let store = Arc::new(SeaOrmBillingStore::new(db));
//! let ctx = BillingContext::new(store, gateway, directory, memberships, audit);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbBackend, DbErr,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set, SqlErr, Statement, TransactionTrait,
    entity::prelude::DateTimeWithTimeZone,
    sea_query::{Expr, OnConflict},
};
use serde::{Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::error::{BillingError, BillingResult};
use super::storage::{BillingStore, LockKey, StoreLock, customer_owner};
use super::types::{
    BatchStatus, FeatureDefinition, Invoice, LicenseBatch, MetricType, ParkedSubscription, Plan,
    Subscription, SubscriptionScope, SubscriptionStatus, UsageMetric, WebhookEventRecord,
    WebhookEventStatus,
};
use super::usage::monthly_period;

// =============================================================================
// SeaORM Entities
// =============================================================================

mod entity {
    // -------------------------------------------------------------------------
    // Plan Entity
    // -------------------------------------------------------------------------
    pub mod billing_plan {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "billing_plans")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: Uuid,
            pub name: String,
            pub priority: i32,
            pub is_active: bool,
            pub upstream_product_id: Option<String>,
            pub upstream_price_id: Option<String>,
            #[sea_orm(column_type = "JsonBinary")]
            pub data: Json,
            pub created_at: DateTimeWithTimeZone,
            pub updated_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    // -------------------------------------------------------------------------
    // Feature Catalog Entity
    // -------------------------------------------------------------------------
    pub mod billing_feature {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "billing_features")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub key: String,
            #[sea_orm(column_type = "JsonBinary")]
            pub data: Json,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    // -------------------------------------------------------------------------
    // Customer Entity
    // -------------------------------------------------------------------------
    pub mod billing_customer {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "billing_customers")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub owner_id: String,
            pub upstream_customer_id: String,
            pub created_at: DateTimeWithTimeZone,
            pub updated_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    // -------------------------------------------------------------------------
    // Subscription Entity (personal, assigned, license and organization rows)
    // -------------------------------------------------------------------------
    pub mod billing_subscription {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "billing_subscriptions")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: Uuid,
            pub plan_id: Uuid,
            pub scope: String,
            /// Key the upstream customer belongs to.
            pub owner_id: String,
            pub user_id: Option<String>,
            pub batch_id: Option<Uuid>,
            pub organization_id: Option<Uuid>,
            pub status: String,
            pub upstream_subscription_id: Option<String>,
            pub upstream_customer_id: Option<String>,
            #[sea_orm(column_type = "JsonBinary")]
            pub data: Json,
            pub created_at: DateTimeWithTimeZone,
            pub updated_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    // -------------------------------------------------------------------------
    // License Batch Entity
    // -------------------------------------------------------------------------
    pub mod billing_license_batch {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "billing_license_batches")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: Uuid,
            pub purchaser_user_id: String,
            pub plan_id: Uuid,
            pub status: String,
            pub upstream_subscription_id: Option<String>,
            pub total_quantity: i32,
            pub assigned_quantity: i32,
            #[sea_orm(column_type = "JsonBinary")]
            pub data: Json,
            pub created_at: DateTimeWithTimeZone,
            pub updated_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    // -------------------------------------------------------------------------
    // Usage Metric Entity
    // -------------------------------------------------------------------------
    pub mod billing_usage_metric {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "billing_usage_metrics")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub user_id: String,
            #[sea_orm(primary_key, auto_increment = false)]
            pub metric_type: String,
            #[sea_orm(column_type = "JsonBinary")]
            pub data: Json,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    // -------------------------------------------------------------------------
    // Webhook Event Entity (dedup records)
    // -------------------------------------------------------------------------
    pub mod billing_webhook_event {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "billing_webhook_events")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub event_id: String,
            pub event_type: String,
            pub status: String,
            pub processed_at: DateTimeWithTimeZone,
            pub expires_at: DateTimeWithTimeZone,
            #[sea_orm(column_type = "JsonBinary", nullable)]
            pub payload: Option<Json>,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    // -------------------------------------------------------------------------
    // Parked Subscription Entity
    // -------------------------------------------------------------------------
    pub mod billing_parked_subscription {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "billing_parked_subscriptions")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub upstream_subscription_id: String,
            pub parked_at: DateTimeWithTimeZone,
            #[sea_orm(column_type = "JsonBinary")]
            pub data: Json,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    // -------------------------------------------------------------------------
    // Invoice Entity
    // -------------------------------------------------------------------------
    pub mod billing_invoice {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "billing_invoices")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub upstream_invoice_id: String,
            pub created_at: DateTimeWithTimeZone,
            #[sea_orm(column_type = "JsonBinary")]
            pub data: Json,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }
}

use entity::{
    billing_customer, billing_feature, billing_invoice, billing_license_batch, billing_parked_subscription,
    billing_plan, billing_subscription, billing_usage_metric, billing_webhook_event,
};

// =============================================================================
// Helper Functions
// =============================================================================

fn encode<T: Serialize>(value: &T) -> BillingResult<serde_json::Value> {
    serde_json::to_value(value).map_err(BillingError::store)
}

fn decode<T: DeserializeOwned>(data: serde_json::Value) -> BillingResult<T> {
    serde_json::from_value(data).map_err(BillingError::store)
}

#[inline]
fn tz(at: DateTime<Utc>) -> DateTimeWithTimeZone {
    at.fixed_offset()
}

/// Map a write failure, turning unique violations into `DuplicateUpstreamId`.
///
/// `keys` lists the constrained columns of the row; the one named by the
/// violated index is reported, falling back to the first.
fn write_err(err: DbErr, keys: &[(&str, Option<&str>)]) -> BillingError {
    if let Some(SqlErr::UniqueConstraintViolation(message)) = err.sql_err() {
        let hit = keys
            .iter()
            .find(|(field, _)| message.contains(field))
            .or_else(|| keys.first());
        return match hit {
            Some((field, value)) => BillingError::DuplicateUpstreamId {
                field: (*field).to_string(),
                value: value.unwrap_or_default().to_string(),
            },
            None => BillingError::DuplicateUpstreamId {
                field: "key".to_string(),
                value: message,
            },
        };
    }
    BillingError::store(err)
}

/// 64-bit advisory lock key derived from the lock's display form.
fn advisory_key(key: &LockKey) -> i64 {
    let digest = Sha256::digest(key.to_string().as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

fn plan_to_active_model(plan: &Plan) -> BillingResult<billing_plan::ActiveModel> {
    Ok(billing_plan::ActiveModel {
        id: Set(plan.id),
        name: Set(plan.name.clone()),
        priority: Set(plan.priority),
        is_active: Set(plan.is_active),
        upstream_product_id: Set(plan.upstream_product_id.clone()),
        upstream_price_id: Set(plan.upstream_price_id.clone()),
        data: Set(encode(plan)?),
        created_at: Set(tz(plan.created_at)),
        updated_at: Set(tz(plan.updated_at)),
    })
}

fn plan_keys(plan: &Plan) -> [(&'static str, Option<&str>); 2] {
    [
        ("upstream_product_id", plan.upstream_product_id.as_deref()),
        ("upstream_price_id", plan.upstream_price_id.as_deref()),
    ]
}

fn scope_name(scope: &SubscriptionScope) -> &'static str {
    match scope {
        SubscriptionScope::User { .. } => "user",
        SubscriptionScope::License { .. } => "license",
        SubscriptionScope::Organization { .. } => "organization",
    }
}

fn subscription_to_active_model(sub: &Subscription) -> BillingResult<billing_subscription::ActiveModel> {
    Ok(billing_subscription::ActiveModel {
        id: Set(sub.id),
        plan_id: Set(sub.plan_id),
        scope: Set(scope_name(&sub.scope).to_string()),
        owner_id: Set(customer_owner(sub)),
        user_id: Set(sub.user_id().map(str::to_string)),
        batch_id: Set(sub.batch_id()),
        organization_id: Set(sub.organization_id()),
        status: Set(sub.status.as_str().to_string()),
        upstream_subscription_id: Set(sub.upstream_subscription_id.clone()),
        upstream_customer_id: Set(sub.upstream_customer_id.clone()),
        data: Set(encode(sub)?),
        created_at: Set(tz(sub.created_at)),
        updated_at: Set(tz(sub.updated_at)),
    })
}

fn subscription_keys(sub: &Subscription) -> [(&'static str, Option<&str>); 1] {
    [("upstream_subscription_id", sub.upstream_subscription_id.as_deref())]
}

fn batch_to_active_model(batch: &LicenseBatch) -> BillingResult<billing_license_batch::ActiveModel> {
    Ok(billing_license_batch::ActiveModel {
        id: Set(batch.id),
        purchaser_user_id: Set(batch.purchaser_user_id.clone()),
        plan_id: Set(batch.plan_id),
        status: Set(batch.status.as_str().to_string()),
        upstream_subscription_id: Set(batch.upstream_subscription_id.clone()),
        total_quantity: Set(batch.total_quantity),
        assigned_quantity: Set(batch.assigned_quantity),
        data: Set(encode(batch)?),
        created_at: Set(tz(batch.created_at)),
        updated_at: Set(tz(batch.updated_at)),
    })
}

fn batch_keys(batch: &LicenseBatch) -> [(&'static str, Option<&str>); 1] {
    [("upstream_subscription_id", batch.upstream_subscription_id.as_deref())]
}

fn usage_to_active_model(metric: &UsageMetric) -> BillingResult<billing_usage_metric::ActiveModel> {
    Ok(billing_usage_metric::ActiveModel {
        user_id: Set(metric.user_id.clone()),
        metric_type: Set(metric.metric_type.as_str().to_string()),
        data: Set(encode(metric)?),
    })
}

fn decode_all<T: DeserializeOwned>(rows: impl IntoIterator<Item = serde_json::Value>) -> BillingResult<Vec<T>> {
    rows.into_iter().map(decode).collect()
}

/// Reject a customer ID already linked to a different owner.
async fn check_customer_owner<C: ConnectionTrait>(conn: &C, sub: &Subscription) -> BillingResult<()> {
    let Some(customer) = sub.upstream_customer_id.as_deref() else {
        return Ok(());
    };
    let clash = billing_subscription::Entity::find()
        .filter(billing_subscription::Column::UpstreamCustomerId.eq(customer))
        .filter(billing_subscription::Column::OwnerId.ne(customer_owner(sub)))
        .filter(billing_subscription::Column::Id.ne(sub.id))
        .one(conn)
        .await
        .map_err(BillingError::store)?;
    if clash.is_some() {
        return Err(BillingError::DuplicateUpstreamId {
            field: "upstream_customer_id".to_string(),
            value: customer.to_string(),
        });
    }
    Ok(())
}

async fn insert_subscription_row<C: ConnectionTrait>(conn: &C, sub: &Subscription) -> BillingResult<()> {
    check_customer_owner(conn, sub).await?;
    subscription_to_active_model(sub)?
        .insert(conn)
        .await
        .map_err(|e| write_err(e, &subscription_keys(sub)))?;
    Ok(())
}

async fn save_subscription_row<C: ConnectionTrait>(conn: &C, sub: &Subscription) -> BillingResult<()> {
    check_customer_owner(conn, sub).await?;
    match subscription_to_active_model(sub)?.update(conn).await {
        Ok(_) => Ok(()),
        Err(DbErr::RecordNotUpdated) => Err(BillingError::SubscriptionNotFound {
            id: sub.id.to_string(),
        }),
        Err(e) => Err(write_err(e, &subscription_keys(sub))),
    }
}

async fn save_batch_row<C: ConnectionTrait>(conn: &C, batch: &LicenseBatch) -> BillingResult<()> {
    match batch_to_active_model(batch)?.update(conn).await {
        Ok(_) => Ok(()),
        Err(DbErr::RecordNotUpdated) => Err(BillingError::BatchNotFound {
            id: batch.id.to_string(),
        }),
        Err(e) => Err(write_err(e, &batch_keys(batch))),
    }
}

/// Load a batch row for update inside a transaction.
async fn lock_batch<C: ConnectionTrait>(conn: &C, batch_id: Uuid) -> BillingResult<LicenseBatch> {
    let row = billing_license_batch::Entity::find_by_id(batch_id)
        .lock_exclusive()
        .one(conn)
        .await
        .map_err(BillingError::store)?
        .ok_or_else(|| BillingError::BatchNotFound {
            id: batch_id.to_string(),
        })?;
    decode(row.data)
}

async fn batch_licenses<C: ConnectionTrait>(conn: &C, batch_id: Uuid) -> BillingResult<Vec<Subscription>> {
    let rows = billing_subscription::Entity::find()
        .filter(billing_subscription::Column::BatchId.eq(batch_id))
        .order_by_asc(billing_subscription::Column::CreatedAt)
        .order_by_asc(billing_subscription::Column::Id)
        .all(conn)
        .await
        .map_err(BillingError::store)?;
    decode_all(rows.into_iter().map(|r| r.data))
}

// =============================================================================
// SeaOrmBillingStore
// =============================================================================

/// Postgres billing store built on SeaORM.
///
/// Composite operations run in one transaction each. Uniqueness of upstream
/// identifiers is enforced by partial unique indexes, so `NULL` never
/// conflicts.
#[derive(Clone, Debug)]
pub struct SeaOrmBillingStore {
    db: DatabaseConnection,
}

impl SeaOrmBillingStore {
    #[must_use]
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Get a reference to the underlying database connection.
    #[must_use]
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn find_subscriptions(
        &self,
        filter: sea_orm::Condition,
    ) -> BillingResult<Vec<Subscription>> {
        let rows = billing_subscription::Entity::find()
            .filter(filter)
            .order_by_desc(billing_subscription::Column::CreatedAt)
            .all(&self.db)
            .await
            .map_err(BillingError::store)?;
        decode_all(rows.into_iter().map(|r| r.data))
    }
}

#[async_trait]
impl BillingStore for SeaOrmBillingStore {
    // -------------------------------------------------------------------------
    // Locking
    // -------------------------------------------------------------------------

    async fn lock(&self, key: LockKey) -> BillingResult<StoreLock> {
        let txn = self.db.begin().await.map_err(BillingError::store)?;
        txn.execute(Statement::from_sql_and_values(
            DbBackend::Postgres,
            "SELECT pg_advisory_xact_lock($1)",
            [advisory_key(&key).into()],
        ))
        .await
        .map_err(BillingError::store)?;

        tracing::debug!(key = %key, "acquired advisory lock");
        // Dropping the transaction rolls back and releases the lock
        Ok(StoreLock::new(txn))
    }

    // -------------------------------------------------------------------------
    // Plans and Catalog
    // -------------------------------------------------------------------------

    async fn insert_plan(&self, plan: &Plan) -> BillingResult<()> {
        tracing::debug!(plan_id = %plan.id, name = %plan.name, "inserting plan");

        plan_to_active_model(plan)?
            .insert(&self.db)
            .await
            .map_err(|e| write_err(e, &plan_keys(plan)))?;
        Ok(())
    }

    async fn update_plan(&self, plan: &Plan) -> BillingResult<()> {
        tracing::debug!(plan_id = %plan.id, "updating plan");

        match plan_to_active_model(plan)?.update(&self.db).await {
            Ok(_) => Ok(()),
            Err(DbErr::RecordNotUpdated) => Err(BillingError::PlanNotFound {
                id: plan.id.to_string(),
            }),
            Err(e) => Err(write_err(e, &plan_keys(plan))),
        }
    }

    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        billing_plan::Entity::find_by_id(plan_id)
            .one(&self.db)
            .await
            .map_err(BillingError::store)?
            .map(|row| decode(row.data))
            .transpose()
    }

    async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        let rows = billing_plan::Entity::find()
            .order_by_asc(billing_plan::Column::Priority)
            .order_by_asc(billing_plan::Column::Name)
            .all(&self.db)
            .await
            .map_err(BillingError::store)?;
        decode_all(rows.into_iter().map(|r| r.data))
    }

    async fn find_plan_by_upstream_price(&self, price_id: &str) -> BillingResult<Option<Plan>> {
        billing_plan::Entity::find()
            .filter(billing_plan::Column::UpstreamPriceId.eq(price_id))
            .one(&self.db)
            .await
            .map_err(BillingError::store)?
            .map(|row| decode(row.data))
            .transpose()
    }

    async fn insert_feature_if_absent(&self, feature: &FeatureDefinition) -> BillingResult<bool> {
        let model = billing_feature::ActiveModel {
            key: Set(feature.key.clone()),
            data: Set(encode(feature)?),
        };

        let inserted = billing_feature::Entity::insert(model)
            .on_conflict(
                OnConflict::column(billing_feature::Column::Key)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .map_err(BillingError::store)?;
        Ok(inserted > 0)
    }

    async fn get_feature(&self, key: &str) -> BillingResult<Option<FeatureDefinition>> {
        billing_feature::Entity::find_by_id(key)
            .one(&self.db)
            .await
            .map_err(BillingError::store)?
            .map(|row| decode(row.data))
            .transpose()
    }

    async fn list_features(&self) -> BillingResult<Vec<FeatureDefinition>> {
        let rows = billing_feature::Entity::find()
            .order_by_asc(billing_feature::Column::Key)
            .all(&self.db)
            .await
            .map_err(BillingError::store)?;
        decode_all(rows.into_iter().map(|r| r.data))
    }

    // -------------------------------------------------------------------------
    // Customers
    // -------------------------------------------------------------------------

    async fn get_upstream_customer_id(&self, owner_id: &str) -> BillingResult<Option<String>> {
        tracing::debug!(owner_id = %owner_id, "fetching upstream customer id");

        let customer = billing_customer::Entity::find_by_id(owner_id)
            .one(&self.db)
            .await
            .map_err(BillingError::store)?;
        Ok(customer.map(|c| c.upstream_customer_id))
    }

    async fn set_upstream_customer_id(&self, owner_id: &str, customer_id: &str) -> BillingResult<()> {
        tracing::debug!(owner_id = %owner_id, customer_id = %customer_id, "setting upstream customer id");

        let now = tz(Utc::now());
        let customer = billing_customer::ActiveModel {
            owner_id: Set(owner_id.to_string()),
            upstream_customer_id: Set(customer_id.to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        billing_customer::Entity::insert(customer)
            .on_conflict(
                OnConflict::column(billing_customer::Column::OwnerId)
                    .update_columns([
                        billing_customer::Column::UpstreamCustomerId,
                        billing_customer::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(|e| write_err(e, &[("upstream_customer_id", Some(customer_id))]))?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        tracing::debug!(
            subscription_id = %subscription.id,
            status = %subscription.status,
            "inserting subscription"
        );
        insert_subscription_row(&self.db, subscription).await
    }

    async fn update_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        tracing::debug!(
            subscription_id = %subscription.id,
            status = %subscription.status,
            "updating subscription"
        );
        save_subscription_row(&self.db, subscription).await
    }

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        billing_subscription::Entity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(BillingError::store)?
            .map(|row| decode(row.data))
            .transpose()
    }

    async fn find_subscription_by_upstream_id(
        &self,
        upstream_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        billing_subscription::Entity::find()
            .filter(billing_subscription::Column::UpstreamSubscriptionId.eq(upstream_subscription_id))
            .one(&self.db)
            .await
            .map_err(BillingError::store)?
            .map(|row| decode(row.data))
            .transpose()
    }

    async fn list_user_subscriptions(&self, user_id: &str) -> BillingResult<Vec<Subscription>> {
        self.find_subscriptions(
            sea_orm::Condition::all().add(billing_subscription::Column::UserId.eq(user_id)),
        )
        .await
    }

    async fn list_organization_subscriptions(
        &self,
        organization_id: Uuid,
    ) -> BillingResult<Vec<Subscription>> {
        self.find_subscriptions(
            sea_orm::Condition::all()
                .add(billing_subscription::Column::OrganizationId.eq(organization_id)),
        )
        .await
    }

    async fn list_subscriptions(&self) -> BillingResult<Vec<Subscription>> {
        self.find_subscriptions(sea_orm::Condition::all()).await
    }

    async fn replace_user_subscriptions(
        &self,
        user_id: &str,
        replacement: &Subscription,
        now: DateTime<Utc>,
    ) -> BillingResult<Vec<Subscription>> {
        let txn = self.db.begin().await.map_err(BillingError::store)?;

        let entitled = [
            SubscriptionStatus::Active,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::Assigned,
        ]
        .map(|s| s.as_str());
        let rows = billing_subscription::Entity::find()
            .filter(billing_subscription::Column::Scope.eq("user"))
            .filter(billing_subscription::Column::UserId.eq(user_id))
            .filter(billing_subscription::Column::Status.is_in(entitled))
            .lock_exclusive()
            .all(&txn)
            .await
            .map_err(BillingError::store)?;

        let mut replaced = Vec::with_capacity(rows.len());
        for row in rows {
            let mut sub: Subscription = decode(row.data)?;
            sub.mark_replaced(now);
            save_subscription_row(&txn, &sub).await?;
            replaced.push(sub);
        }
        insert_subscription_row(&txn, replacement).await?;

        txn.commit().await.map_err(BillingError::store)?;

        tracing::debug!(
            user_id = %user_id,
            replaced = replaced.len(),
            subscription_id = %replacement.id,
            "replaced user subscriptions"
        );
        Ok(replaced)
    }

    // -------------------------------------------------------------------------
    // License Batches
    // -------------------------------------------------------------------------

    async fn insert_batch_with_licenses(
        &self,
        batch: &LicenseBatch,
        licenses: &[Subscription],
    ) -> BillingResult<()> {
        let txn = self.db.begin().await.map_err(BillingError::store)?;

        batch_to_active_model(batch)?
            .insert(&txn)
            .await
            .map_err(|e| write_err(e, &batch_keys(batch)))?;
        for license in licenses {
            insert_subscription_row(&txn, license).await?;
        }

        txn.commit().await.map_err(BillingError::store)?;

        tracing::debug!(batch_id = %batch.id, licenses = licenses.len(), "inserted license batch");
        Ok(())
    }

    async fn get_batch(&self, batch_id: Uuid) -> BillingResult<Option<LicenseBatch>> {
        billing_license_batch::Entity::find_by_id(batch_id)
            .one(&self.db)
            .await
            .map_err(BillingError::store)?
            .map(|row| decode(row.data))
            .transpose()
    }

    async fn update_batch(&self, batch: &LicenseBatch) -> BillingResult<()> {
        tracing::debug!(batch_id = %batch.id, status = %batch.status, "updating batch");
        save_batch_row(&self.db, batch).await
    }

    async fn find_batch_by_upstream_id(
        &self,
        upstream_subscription_id: &str,
    ) -> BillingResult<Option<LicenseBatch>> {
        billing_license_batch::Entity::find()
            .filter(billing_license_batch::Column::UpstreamSubscriptionId.eq(upstream_subscription_id))
            .one(&self.db)
            .await
            .map_err(BillingError::store)?
            .map(|row| decode(row.data))
            .transpose()
    }

    async fn list_batches(&self) -> BillingResult<Vec<LicenseBatch>> {
        let rows = billing_license_batch::Entity::find()
            .order_by_desc(billing_license_batch::Column::CreatedAt)
            .all(&self.db)
            .await
            .map_err(BillingError::store)?;
        decode_all(rows.into_iter().map(|r| r.data))
    }

    async fn list_batches_by_purchaser(&self, purchaser_user_id: &str) -> BillingResult<Vec<LicenseBatch>> {
        let rows = billing_license_batch::Entity::find()
            .filter(billing_license_batch::Column::PurchaserUserId.eq(purchaser_user_id))
            .order_by_desc(billing_license_batch::Column::CreatedAt)
            .all(&self.db)
            .await
            .map_err(BillingError::store)?;
        decode_all(rows.into_iter().map(|r| r.data))
    }

    async fn list_batch_licenses(&self, batch_id: Uuid) -> BillingResult<Vec<Subscription>> {
        batch_licenses(&self.db, batch_id).await
    }

    async fn claim_unassigned_license(
        &self,
        batch_id: Uuid,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        let txn = self.db.begin().await.map_err(BillingError::store)?;
        let mut batch = lock_batch(&txn, batch_id).await?;

        let row = billing_subscription::Entity::find()
            .filter(billing_subscription::Column::BatchId.eq(batch_id))
            .filter(billing_subscription::Column::Status.eq(SubscriptionStatus::Unassigned.as_str()))
            .filter(billing_subscription::Column::UserId.is_null())
            .order_by_asc(billing_subscription::Column::CreatedAt)
            .order_by_asc(billing_subscription::Column::Id)
            .lock_exclusive()
            .one(&txn)
            .await
            .map_err(BillingError::store)?
            .ok_or_else(|| BillingError::NoAvailableLicenses {
                batch_id: batch_id.to_string(),
            })?;

        let mut license: Subscription = decode(row.data)?;
        if let SubscriptionScope::License { user_id: slot, .. } = &mut license.scope {
            *slot = Some(user_id.to_string());
        }
        license.status = SubscriptionStatus::Active;
        license.updated_at = now;
        save_subscription_row(&txn, &license).await?;

        batch.assigned_quantity += 1;
        batch.updated_at = now;
        save_batch_row(&txn, &batch).await?;

        txn.commit().await.map_err(BillingError::store)?;

        tracing::debug!(batch_id = %batch_id, license_id = %license.id, user_id = %user_id, "claimed license");
        Ok(license)
    }

    async fn release_license(&self, license_id: Uuid, now: DateTime<Utc>) -> BillingResult<Subscription> {
        let txn = self.db.begin().await.map_err(BillingError::store)?;

        let row = billing_subscription::Entity::find_by_id(license_id)
            .filter(billing_subscription::Column::BatchId.is_not_null())
            .lock_exclusive()
            .one(&txn)
            .await
            .map_err(BillingError::store)?
            .ok_or_else(|| BillingError::LicenseNotFound {
                id: license_id.to_string(),
            })?;
        let mut license: Subscription = decode(row.data)?;
        if license.status != SubscriptionStatus::Active {
            return Err(BillingError::invalid_transition(
                license.status,
                SubscriptionStatus::Unassigned,
            ));
        }

        let batch_id = match &mut license.scope {
            SubscriptionScope::License {
                batch_id,
                user_id: slot @ Some(_),
                ..
            } => {
                *slot = None;
                *batch_id
            }
            _ => {
                return Err(BillingError::invalid_transition(
                    license.status,
                    SubscriptionStatus::Unassigned,
                ));
            }
        };

        let mut batch = lock_batch(&txn, batch_id).await?;
        if batch.status != BatchStatus::Active {
            return Err(BillingError::invalid_transition(
                SubscriptionStatus::Active,
                SubscriptionStatus::Unassigned,
            ));
        }
        license.status = SubscriptionStatus::Unassigned;
        license.updated_at = now;
        save_subscription_row(&txn, &license).await?;

        batch.assigned_quantity = (batch.assigned_quantity - 1).max(0);
        batch.updated_at = now;
        save_batch_row(&txn, &batch).await?;

        txn.commit().await.map_err(BillingError::store)?;

        tracing::debug!(batch_id = %batch_id, license_id = %license_id, "released license");
        Ok(license)
    }

    async fn resize_batch(
        &self,
        batch_id: Uuid,
        new_quantity: i32,
        now: DateTime<Utc>,
    ) -> BillingResult<LicenseBatch> {
        let txn = self.db.begin().await.map_err(BillingError::store)?;
        let mut batch = lock_batch(&txn, batch_id).await?;

        if new_quantity < batch.assigned_quantity {
            return Err(BillingError::QuantityBelowAssigned {
                requested: new_quantity,
                assigned: batch.assigned_quantity,
            });
        }

        let licenses = batch_licenses(&txn, batch_id).await?;
        let current = i32::try_from(licenses.len()).unwrap_or(i32::MAX);
        if new_quantity > current {
            let status = if batch.status == BatchStatus::Active {
                SubscriptionStatus::Unassigned
            } else {
                SubscriptionStatus::PendingPayment
            };
            for _ in current..new_quantity {
                let mut license = Subscription::new(
                    batch.plan_id,
                    SubscriptionScope::License {
                        batch_id,
                        purchaser_user_id: batch.purchaser_user_id.clone(),
                        user_id: None,
                    },
                    status,
                    batch.current_period_start,
                    batch.current_period_end,
                );
                license.created_at = now;
                license.updated_at = now;
                insert_subscription_row(&txn, &license).await?;
            }
        } else if new_quantity < current {
            let surplus = usize::try_from(current - new_quantity).unwrap_or(0);
            let removable: Vec<Uuid> = licenses
                .iter()
                .rev()
                .filter(|l| l.user_id().is_none())
                .take(surplus)
                .map(|l| l.id)
                .collect();
            billing_subscription::Entity::delete_many()
                .filter(billing_subscription::Column::Id.is_in(removable))
                .exec(&txn)
                .await
                .map_err(BillingError::store)?;
        }

        batch.total_quantity = new_quantity;
        batch.updated_at = now;
        save_batch_row(&txn, &batch).await?;

        txn.commit().await.map_err(BillingError::store)?;

        tracing::debug!(batch_id = %batch_id, from = current, to = new_quantity, "resized batch");
        Ok(batch)
    }

    async fn set_batch_status(
        &self,
        batch_id: Uuid,
        status: BatchStatus,
        now: DateTime<Utc>,
    ) -> BillingResult<LicenseBatch> {
        let txn = self.db.begin().await.map_err(BillingError::store)?;
        let mut batch = lock_batch(&txn, batch_id).await?;

        for mut license in batch_licenses(&txn, batch_id).await? {
            match status {
                BatchStatus::Active if license.status == SubscriptionStatus::PendingPayment => {
                    license.status = SubscriptionStatus::Unassigned;
                    license.updated_at = now;
                }
                BatchStatus::Cancelled | BatchStatus::Expired => license.mark_cancelled(now),
                _ => continue,
            }
            save_subscription_row(&txn, &license).await?;
        }

        batch.status = status;
        batch.updated_at = now;
        if matches!(status, BatchStatus::Cancelled | BatchStatus::Expired) {
            batch.assigned_quantity = 0;
            batch.cancelled_at.get_or_insert(now);
        }
        save_batch_row(&txn, &batch).await?;

        txn.commit().await.map_err(BillingError::store)?;

        tracing::debug!(batch_id = %batch_id, status = %status, "set batch status");
        Ok(batch)
    }

    async fn delete_batch(&self, batch_id: Uuid) -> BillingResult<()> {
        let txn = self.db.begin().await.map_err(BillingError::store)?;

        billing_subscription::Entity::delete_many()
            .filter(billing_subscription::Column::BatchId.eq(batch_id))
            .exec(&txn)
            .await
            .map_err(BillingError::store)?;
        let deleted = billing_license_batch::Entity::delete_by_id(batch_id)
            .exec(&txn)
            .await
            .map_err(BillingError::store)?;
        if deleted.rows_affected == 0 {
            return Err(BillingError::BatchNotFound {
                id: batch_id.to_string(),
            });
        }

        txn.commit().await.map_err(BillingError::store)?;
        tracing::debug!(batch_id = %batch_id, "deleted batch");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Usage
    // -------------------------------------------------------------------------

    async fn upsert_usage_metric(&self, metric: &UsageMetric) -> BillingResult<()> {
        billing_usage_metric::Entity::insert(usage_to_active_model(metric)?)
            .on_conflict(
                OnConflict::columns([
                    billing_usage_metric::Column::UserId,
                    billing_usage_metric::Column::MetricType,
                ])
                .update_column(billing_usage_metric::Column::Data)
                .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(BillingError::store)?;
        Ok(())
    }

    async fn insert_usage_metric_if_absent(&self, metric: &UsageMetric) -> BillingResult<bool> {
        let inserted = billing_usage_metric::Entity::insert(usage_to_active_model(metric)?)
            .on_conflict(
                OnConflict::columns([
                    billing_usage_metric::Column::UserId,
                    billing_usage_metric::Column::MetricType,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .map_err(BillingError::store)?;
        Ok(inserted > 0)
    }

    async fn get_usage_metric(
        &self,
        user_id: &str,
        metric_type: MetricType,
    ) -> BillingResult<Option<UsageMetric>> {
        billing_usage_metric::Entity::find_by_id((user_id.to_string(), metric_type.as_str().to_string()))
            .one(&self.db)
            .await
            .map_err(BillingError::store)?
            .map(|row| decode(row.data))
            .transpose()
    }

    async fn list_usage_metrics(&self, user_id: &str) -> BillingResult<Vec<UsageMetric>> {
        let rows = billing_usage_metric::Entity::find()
            .filter(billing_usage_metric::Column::UserId.eq(user_id))
            .all(&self.db)
            .await
            .map_err(BillingError::store)?;
        let mut metrics: Vec<UsageMetric> = decode_all(rows.into_iter().map(|r| r.data))?;
        metrics.sort_by_key(|m| m.metric_type);
        Ok(metrics)
    }

    async fn increment_usage(
        &self,
        user_id: &str,
        metric_type: MetricType,
        delta: i64,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<UsageMetric>> {
        let txn = self.db.begin().await.map_err(BillingError::store)?;

        let Some(row) = billing_usage_metric::Entity::find_by_id((
            user_id.to_string(),
            metric_type.as_str().to_string(),
        ))
        .lock_exclusive()
        .one(&txn)
        .await
        .map_err(BillingError::store)?
        else {
            return Ok(None);
        };

        let mut metric: UsageMetric = decode(row.data)?;
        if now >= metric.period_end {
            let (start, end) = monthly_period(now);
            metric.current_value = 0;
            metric.period_start = start;
            metric.period_end = end;
        }
        metric.current_value += delta;
        metric.last_updated = now;

        usage_to_active_model(&metric)?
            .update(&txn)
            .await
            .map_err(BillingError::store)?;
        txn.commit().await.map_err(BillingError::store)?;
        Ok(Some(metric))
    }

    // -------------------------------------------------------------------------
    // Webhooks
    // -------------------------------------------------------------------------

    async fn get_webhook_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        let row = billing_webhook_event::Entity::find_by_id(event_id)
            .one(&self.db)
            .await
            .map_err(BillingError::store)?;
        row.map(|r| {
            Ok(WebhookEventRecord {
                status: r.status.parse().map_err(BillingError::store)?,
                event_id: r.event_id,
                event_type: r.event_type,
                processed_at: r.processed_at.with_timezone(&Utc),
                expires_at: r.expires_at.with_timezone(&Utc),
                payload: r.payload,
            })
        })
        .transpose()
    }

    async fn claim_webhook_event(&self, record: &WebhookEventRecord) -> BillingResult<bool> {
        let model = billing_webhook_event::ActiveModel {
            event_id: Set(record.event_id.clone()),
            event_type: Set(record.event_type.clone()),
            status: Set(record.status.as_str().to_string()),
            processed_at: Set(tz(record.processed_at)),
            expires_at: Set(tz(record.expires_at)),
            payload: Set(record.payload.clone()),
        };
        let inserted = billing_webhook_event::Entity::insert(model)
            .on_conflict(
                OnConflict::column(billing_webhook_event::Column::EventId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .map_err(BillingError::store)?;

        tracing::debug!(event_id = %record.event_id, claimed = inserted > 0, "claiming webhook event");
        Ok(inserted > 0)
    }

    async fn complete_webhook_event(&self, event_id: &str, at: DateTime<Utc>) -> BillingResult<()> {
        billing_webhook_event::Entity::update_many()
            .col_expr(
                billing_webhook_event::Column::Status,
                Expr::value(WebhookEventStatus::Processed.as_str()),
            )
            .col_expr(billing_webhook_event::Column::ProcessedAt, Expr::value(tz(at)))
            .filter(billing_webhook_event::Column::EventId.eq(event_id))
            .exec(&self.db)
            .await
            .map_err(BillingError::store)?;
        Ok(())
    }

    async fn release_webhook_event(&self, event_id: &str) -> BillingResult<()> {
        billing_webhook_event::Entity::delete_many()
            .filter(billing_webhook_event::Column::EventId.eq(event_id))
            .filter(billing_webhook_event::Column::Status.eq(WebhookEventStatus::Processing.as_str()))
            .exec(&self.db)
            .await
            .map_err(BillingError::store)?;
        Ok(())
    }

    async fn delete_expired_webhook_events(&self, now: DateTime<Utc>) -> BillingResult<u64> {
        let result = billing_webhook_event::Entity::delete_many()
            .filter(billing_webhook_event::Column::ExpiresAt.lt(tz(now)))
            .exec(&self.db)
            .await
            .map_err(BillingError::store)?;

        tracing::debug!(deleted = result.rows_affected, "deleted expired webhook events");
        Ok(result.rows_affected)
    }

    async fn park_subscription(&self, parked: &ParkedSubscription) -> BillingResult<()> {
        let model = billing_parked_subscription::ActiveModel {
            upstream_subscription_id: Set(parked.upstream_subscription_id.clone()),
            parked_at: Set(tz(parked.parked_at)),
            data: Set(encode(parked)?),
        };

        billing_parked_subscription::Entity::insert(model)
            .on_conflict(
                OnConflict::column(billing_parked_subscription::Column::UpstreamSubscriptionId)
                    .update_columns([
                        billing_parked_subscription::Column::ParkedAt,
                        billing_parked_subscription::Column::Data,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(BillingError::store)?;
        Ok(())
    }

    async fn list_parked_subscriptions(&self) -> BillingResult<Vec<ParkedSubscription>> {
        let rows = billing_parked_subscription::Entity::find()
            .order_by_asc(billing_parked_subscription::Column::ParkedAt)
            .all(&self.db)
            .await
            .map_err(BillingError::store)?;
        decode_all(rows.into_iter().map(|r| r.data))
    }

    async fn remove_parked_subscription(&self, upstream_subscription_id: &str) -> BillingResult<()> {
        billing_parked_subscription::Entity::delete_by_id(upstream_subscription_id)
            .exec(&self.db)
            .await
            .map_err(BillingError::store)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Invoices
    // -------------------------------------------------------------------------

    async fn upsert_invoice(&self, invoice: &Invoice) -> BillingResult<()> {
        let model = billing_invoice::ActiveModel {
            upstream_invoice_id: Set(invoice.upstream_invoice_id.clone()),
            created_at: Set(tz(invoice.created_at)),
            data: Set(encode(invoice)?),
        };

        billing_invoice::Entity::insert(model)
            .on_conflict(
                OnConflict::column(billing_invoice::Column::UpstreamInvoiceId)
                    .update_column(billing_invoice::Column::Data)
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(BillingError::store)?;
        Ok(())
    }

    async fn get_invoice_by_upstream_id(&self, upstream_invoice_id: &str) -> BillingResult<Option<Invoice>> {
        billing_invoice::Entity::find_by_id(upstream_invoice_id)
            .one(&self.db)
            .await
            .map_err(BillingError::store)?
            .map(|row| decode(row.data))
            .transpose()
    }

    async fn list_invoices(&self) -> BillingResult<Vec<Invoice>> {
        let rows = billing_invoice::Entity::find()
            .order_by_asc(billing_invoice::Column::CreatedAt)
            .all(&self.db)
            .await
            .map_err(BillingError::store)?;
        decode_all(rows.into_iter().map(|r| r.data))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::types::SubscriptionType;
    use sea_orm::ActiveValue;

    fn license(batch_id: Uuid, user_id: Option<&str>) -> Subscription {
        let now = Utc::now();
        Subscription::new(
            Uuid::new_v4(),
            SubscriptionScope::License {
                batch_id,
                purchaser_user_id: "trainer".to_string(),
                user_id: user_id.map(str::to_string),
            },
            SubscriptionStatus::Unassigned,
            now,
            now + chrono::Duration::days(30),
        )
    }

    #[test]
    fn test_subscription_to_active_model_indexes_scope() {
        let batch_id = Uuid::new_v4();
        let model = subscription_to_active_model(&license(batch_id, Some("student"))).unwrap();

        assert_eq!(model.scope, ActiveValue::Set("license".to_string()));
        assert_eq!(model.owner_id, ActiveValue::Set("trainer".to_string()));
        assert_eq!(model.user_id, ActiveValue::Set(Some("student".to_string())));
        assert_eq!(model.batch_id, ActiveValue::Set(Some(batch_id)));
        assert_eq!(model.organization_id, ActiveValue::Set(None));
        assert_eq!(model.status, ActiveValue::Set("unassigned".to_string()));
    }

    #[test]
    fn test_subscription_data_round_trips() {
        let now = Utc::now();
        let sub = Subscription::new(
            Uuid::new_v4(),
            SubscriptionScope::User {
                user_id: "u1".to_string(),
                kind: SubscriptionType::Assigned,
            },
            SubscriptionStatus::Active,
            now,
            now + chrono::Duration::days(30),
        );
        let model = subscription_to_active_model(&sub).unwrap();
        let ActiveValue::Set(data) = model.data else {
            panic!("data not set");
        };

        let decoded: Subscription = decode(data).unwrap();
        assert_eq!(decoded, sub);
    }

    #[test]
    fn test_advisory_key_is_stable_per_lock() {
        let batch = Uuid::new_v4();
        assert_eq!(
            advisory_key(&LockKey::Batch(batch)),
            advisory_key(&LockKey::Batch(batch))
        );
        assert_ne!(
            advisory_key(&LockKey::User("u1".to_string())),
            advisory_key(&LockKey::User("u2".to_string()))
        );
    }

    #[test]
    fn test_store_errors_are_not_duplicates() {
        let err = write_err(DbErr::Custom("boom".to_string()), &[("event_id", Some("evt_1"))]);
        assert!(matches!(err, BillingError::Store { .. }));
    }
}
