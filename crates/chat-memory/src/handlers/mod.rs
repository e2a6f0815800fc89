pub mod chats;
pub mod health;

use axum::{
    routing::{delete, get},
    Router,
};
use tower_http::{
    cors::CorsLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use std::time::Duration;

use crate::state::AppState;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn build_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health::health_check))
        .route("/health/ready", get(health::readiness_check));

    let admin_routes = Router::new()
        .route("/api/chats", get(chats::list_chats_handler))
        .route("/api/chats/{id}/stats", get(chats::chat_stats_handler))
        .route("/api/chats/{id}", delete(chats::delete_chat_handler));

    Router::new()
        .merge(public_routes)
        .merge(admin_routes)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false)),
        )
}
