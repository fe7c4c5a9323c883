//! API route definitions.

use axum::http::{HeaderValue, Method, header};
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::ws::ws_handler;

use super::handlers;
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let api = Router::new()
        .route(
            "/demo/sessions",
            get(handlers::list_sessions).post(handlers::start_session),
        )
        .route(
            "/demo/sessions/{session_id}",
            get(handlers::get_session).delete(handlers::terminate_session),
        )
        .route(
            "/demo/sessions/{session_id}/switch",
            post(handlers::switch_user),
        )
        .route(
            "/demo/sessions/{session_id}/activity",
            post(handlers::touch_activity),
        )
        .route(
            "/demo/sessions/{session_id}/freeze",
            post(handlers::freeze_session),
        )
        .route(
            "/demo/sessions/{session_id}/unfreeze",
            post(handlers::unfreeze_session),
        )
        .route(
            "/demo/sessions/{session_id}/stats",
            get(handlers::session_stats),
        )
        .route(
            "/demo/sessions/{session_id}/history",
            get(handlers::session_history),
        )
        .route("/demo/stats", get(handlers::aggregate_stats))
        .route("/demo/sweep", post(handlers::sweep))
        .route("/ws", get(ws_handler));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api)
        .with_state(state)
        .layer(cors)
        .layer(trace_layer)
}

/// Build the CORS layer from the configured origins. Empty allows any origin.
fn build_cors_layer(state: &AppState) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];
    let headers = [header::CONTENT_TYPE, header::ACCEPT, header::ORIGIN];

    if state.allowed_origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(headers);
    }

    let origins: Vec<HeaderValue> = state
        .allowed_origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("CORS: Invalid origin in config: {}", origin);
                None
            })
        })
        .collect();

    tracing::info!("CORS: Allowing {} origin(s)", origins.len());
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers(headers)
}
