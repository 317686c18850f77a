//! Route modules of the billing service.

mod admin;
mod licenses;
mod organizations;
mod plans;
mod subscriptions;
mod webhooks;

pub use admin::{AdminModule, AuditQuery};
pub use licenses::LicensesModule;
pub use organizations::OrganizationsModule;
pub use plans::{PlanRequest, PlansModule};
pub use subscriptions::SubscriptionsModule;
pub use webhooks::{WebhookAck, WebhooksModule, webhook_headers};
