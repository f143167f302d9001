//! HTTP surface (§6.2): one flat router over the session, generation,
//! iteration, node/health, preference, dashboard, WebSocket, and metrics
//! endpoints, each implemented in its own sibling module.
pub(crate) mod dashboard;
pub(crate) mod generate;
pub(crate) mod iterate;
pub(crate) mod metrics;
pub(crate) mod nodes;
pub(crate) mod preferences;
pub(crate) mod sessions;
pub(crate) mod ws;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::app::AppState;

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/sessions", post(sessions::create))
        .route("/sessions/{id}", get(sessions::get).delete(sessions::delete))
        .route("/sessions/{id}/generations", get(sessions::generations))
        .route("/generate", post(generate::generate))
        .route("/generate/batch", post(generate::generate_batch))
        .route("/generate/{id}", get(generate::get_generation))
        .route("/iterate", post(iterate::iterate))
        .route("/iterate/reject-all", post(iterate::reject_all))
        .route("/nodes", get(nodes::list))
        .route("/health", get(nodes::health))
        .route("/preferences/stats", get(preferences::stats))
        .route("/preferences/recommend/model", get(preferences::recommend_model))
        .route("/preferences/export", get(preferences::export))
        .route("/preferences/import", post(preferences::import))
        .route("/ws/session/{id}", get(ws::session_stream))
        .route("/dashboard/overview", get(dashboard::overview))
        .route("/dashboard/jobs", get(dashboard::jobs))
        .route("/metrics", get(metrics::exporter))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
