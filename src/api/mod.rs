//! Route assembly for the three HTTP-facing surfaces (spec §6).

use crate::auth::{self, AuthState};
use crate::lifecycle::AppState;
use crate::rate_limit::{self, RateLimitConfig};
use crate::{bot_gateway, client_gateway};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn build_router(
    state: Arc<AppState>,
    auth_state: Arc<AuthState>,
    rate_limit_config: Arc<RateLimitConfig>,
    allowed_origins: &[String],
) -> Router {
    let bot_routes = Router::new()
        .route("/server_ping", get(bot_gateway::server_ping))
        .route("/bot_code", get(bot_gateway::bot_code_redirect))
        .route("/bot_code/:version", get(bot_gateway::bot_code_get))
        .route("/handshake", post(bot_gateway::handshake))
        .route("/poll", post(bot_gateway::poll))
        .route("/event", post(bot_gateway::event))
        .route("/oauth_token", post(bot_gateway::oauth_token))
        .route("/id_token", post(bot_gateway::oauth_token))
        .route("/task_update", post(bot_gateway::task_update))
        .route("/task_error", post(bot_gateway::task_error))
        .route_layer(middleware::from_fn_with_state(
            rate_limit_config.clone(),
            rate_limit::bot_rate_limit_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(
            auth_state.clone(),
            auth::auth_middleware,
        ))
        .with_state(state.clone());

    let client_routes = Router::new()
        .route("/tasks/new", post(client_gateway::tasks_new))
        .route("/tasks/count", get(client_gateway::tasks_count))
        .route("/tasks/list", get(client_gateway::tasks_list))
        .route("/tasks/requests", get(client_gateway::tasks_requests))
        .route("/task/:id/cancel", post(client_gateway::task_cancel))
        .route("/task/:id/request", get(client_gateway::task_get_request))
        .route("/task/:id/result", get(client_gateway::task_get_result))
        .route("/task/:id/stdout", get(client_gateway::task_get_stdout))
        .route("/bots/count", get(client_gateway::bots_count))
        .route("/bots/list", get(client_gateway::bots_list))
        .route("/bots/dimensions", get(client_gateway::bots_dimensions))
        .route("/bot/:id/get", get(client_gateway::bot_get))
        .route("/bot/:id/events", get(client_gateway::bot_events))
        .route("/bot/:id/tasks", get(client_gateway::bot_tasks))
        .route("/bot/:id/delete", post(client_gateway::bot_delete))
        .route("/bot/:id/terminate", post(client_gateway::bot_terminate))
        .route_layer(middleware::from_fn_with_state(
            rate_limit_config,
            rate_limit::client_rate_limit_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(auth_state, auth::auth_middleware))
        .with_state(state);

    let cors = if allowed_origins.is_empty() {
        CorsLayer::new()
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    };

    Router::new()
        .nest("/swarming/api/v1/bot", bot_routes)
        .nest("/_ah/api/swarming/v1", client_routes)
        .route("/", get(static_index))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// The UI static bundle is out of scope (spec §1); this returns a minimal
/// placeholder so the route exists and Lifecycle's router is complete.
async fn static_index() -> &'static str {
    "mess server"
}
