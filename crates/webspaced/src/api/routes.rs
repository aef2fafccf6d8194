//! API route definitions.

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::auth::identity_middleware;
use super::handlers;
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    // Everything under /v1 acts on the caller's (or impersonated user's) webspace
    let protected_routes = Router::new()
        .route(
            "/v1/webspace",
            get(handlers::get_webspace)
                .post(handlers::create_webspace)
                .delete(handlers::delete_webspace),
        )
        .route(
            "/v1/webspace/config",
            get(handlers::get_config).patch(handlers::update_config),
        )
        .route(
            "/v1/webspace/state",
            get(handlers::get_state)
                .post(handlers::boot)
                .put(handlers::reboot)
                .delete(handlers::shutdown),
        )
        .route(
            "/v1/webspace/ensure-started",
            post(handlers::ensure_started),
        )
        .route("/v1/webspace/log", get(handlers::get_log))
        .route("/v1/webspace/exec", post(handlers::exec))
        .route(
            "/v1/webspace/exec/interactive",
            get(handlers::exec_interactive),
        )
        .route("/v1/webspace/domains", get(handlers::get_domains))
        .route(
            "/v1/webspace/domains/{domain}",
            post(handlers::add_domain).delete(handlers::remove_domain),
        )
        .route("/v1/webspace/ports", get(handlers::get_ports))
        .route(
            "/v1/webspace/ports/{port}",
            post(handlers::add_random_port).delete(handlers::remove_port),
        )
        .route(
            "/v1/webspace/ports/{port}/{internal}",
            post(handlers::add_port),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            identity_middleware,
        ));

    let public_routes = Router::new().route("/health", get(handlers::health));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(trace_layer)
        .with_state(state)
}
