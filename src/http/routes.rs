use axum::Router;

use super::state::AppState;

/// Trait for composable route modules
///
/// Each module registers its own routes and is merged into the service
/// router by [`router`](super::router).
///
/// # Example
///
/// ```ignore
/// struct PlansModule;
///
/// impl RouteModule for PlansModule {
///     fn routes(&self) -> Router<AppState> {
///         Router::new()
///             .route("/plans", get(list_plans))
///             .route("/plans/{id}", get(get_plan))
///     }
/// }
/// ```
pub trait RouteModule {
    /// Returns a router with all routes for this module
    ///
    /// State is applied once, after every module has been merged.
    fn routes(&self) -> Router<AppState>;

    /// Optional: specify a path prefix for all routes in this module
    fn prefix(&self) -> Option<&str> {
        None
    }

    /// Registers this module's routes into the application router
    fn register(self, router: Router<AppState>) -> Router<AppState>
    where
        Self: Sized,
    {
        let routes = self.routes();

        if let Some(prefix) = self.prefix() {
            router.nest(prefix, routes)
        } else {
            router.merge(routes)
        }
    }
}
