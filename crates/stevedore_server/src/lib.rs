//! Thin HTTP boundary.
//!
//! Validates requests, maps them onto core calls and renders the error
//! envelope. No business logic lives here: a handler that grows a
//! decision belongs one crate down.

mod auth;
mod error;
mod routes;

pub use error::ApiError;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use stevedore_engine::EngineProbe;
use stevedore_events::EventHub;
use stevedore_protocol::config::Settings;
use stevedore_scheduler::JobManager;
use stevedore_store::Store;
use stevedore_uploads::UploadManager;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub hub: Arc<EventHub>,
    pub jobs: JobManager,
    pub uploads: UploadManager,
    pub probe: Arc<EngineProbe>,
    pub settings: Arc<Settings>,
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/meta", get(routes::meta::get_meta))
        .route("/profiles", get(routes::profiles::list).post(routes::profiles::create))
        .route(
            "/profiles/:id",
            get(routes::profiles::get_one)
                .put(routes::profiles::update)
                .delete(routes::profiles::delete),
        )
        .route("/jobs", get(routes::jobs::list).post(routes::jobs::submit))
        .route("/jobs/:id", get(routes::jobs::get_one).delete(routes::jobs::delete))
        .route("/jobs/:id/cancel", post(routes::jobs::cancel))
        .route("/jobs/:id/log", get(routes::jobs::get_log))
        .route("/jobs/:id/artifact", get(routes::jobs::get_artifact))
        .route("/uploads", post(routes::uploads::create))
        .route(
            "/uploads/:id",
            get(routes::uploads::get_one).delete(routes::uploads::delete),
        )
        .route("/uploads/:id/files", post(routes::uploads::upload_files))
        .route("/uploads/:id/presign", post(routes::uploads::presign))
        .route("/uploads/:id/commit", post(routes::uploads::commit))
        .route(
            "/favorites",
            get(routes::favorites::list).post(routes::favorites::create),
        )
        .route("/favorites/:id", delete(routes::favorites::delete))
        .route("/events/ws", get(routes::events::ws_handler))
        .route("/events/sse", get(routes::events::sse_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::guard,
        ));

    Router::new()
        .nest("/api", api)
        .route("/metrics", get(routes::meta::get_metrics))
        .route("/healthz", get(routes::meta::get_health))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
