//! HTTP surfaces: the proxied data plane and the admin API.

mod admin;
mod cors;
mod gateway;
mod proxy;
mod server;
mod state;
mod tokens;

use axum::middleware;
use axum::routing::{get, patch, post};
use axum::Router;

pub use admin::ADMIN_PREFIX;
pub use gateway::{
    client_ip, RATELIMIT_DELAY_HEADER, RATELIMIT_QUEUED_HEADER, RATELIMIT_REMAINING_HEADER,
};
pub use proxy::{upstream_url, Forward, ProxyDispatcher};
pub use server::HttpServer;
pub use state::AppState;

/// Token endpoints plus the catch-all proxied routes.
pub fn gateway_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/tokens/form",
            get(tokens::form_token).options(tokens::preflight),
        )
        .route(
            "/api/tokens/challenge",
            get(tokens::challenge).options(tokens::preflight),
        )
        .fallback(gateway::proxy_request)
        .layer(middleware::from_fn(cors::echo_origin))
        .with_state(state)
}

/// Rule management, runtime settings and analytics.
pub fn admin_router(state: AppState) -> Router {
    let rules = Router::new()
        .route("/rules", get(admin::list_rules).post(admin::create_rule))
        .route("/rules/active", get(admin::list_active_rules))
        .route("/rules/refresh", post(admin::refresh_rules))
        .route(
            "/rules/:id",
            get(admin::get_rule)
                .put(admin::update_rule)
                .delete(admin::delete_rule),
        )
        .route("/rules/:id/queue", patch(admin::patch_queue))
        .route("/rules/:id/body-limit", patch(admin::patch_body_limit))
        .route("/config", get(admin::list_config))
        .route(
            "/config/:key",
            post(admin::set_config).delete(admin::reset_config),
        );

    Router::new()
        .nest(ADMIN_PREFIX, rules)
        .route("/api/analytics/summary", get(admin::analytics_summary))
        .route("/api/analytics/traffic", get(admin::analytics_traffic))
        .with_state(state)
}
