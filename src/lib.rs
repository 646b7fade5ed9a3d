//! Builds yt-dlp invocations from download settings and runs them one at a
//! time, reporting progress on a single status line.

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::{Arc, RwLock};
use tower_http::cors::{Any, CorsLayer};

use crate::config::{Config, SettingsStore};
use crate::runner::JobRunner;
use crate::status::StatusLine;

// --- Modules ---
pub mod config;
pub mod daemon;
pub mod error;
pub mod handlers;
pub mod models;
pub mod resolver;
pub mod runner;
pub mod status;

// --- State Type Aliases ---
pub type ConfigState = Arc<RwLock<Config>>;

/// Everything the HTTP surface needs, built once in `main`.
#[derive(Clone)]
pub struct AppState {
    pub config: ConfigState,
    pub store: SettingsStore,
    pub runner: Arc<JobRunner>,
    pub status: StatusLine,
}

impl AppState {
    pub fn new(config: Config, store: SettingsStore, runner: Arc<JobRunner>) -> Self {
        AppState {
            config: Arc::new(RwLock::new(config)),
            store,
            runner,
            status: StatusLine::new(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/options", get(handlers::get_options))
        .route("/download", post(handlers::start_download))
        .route("/cancel", post(handlers::cancel_download))
        .route("/status", get(handlers::get_status))
        .route("/config", get(handlers::get_config).post(handlers::update_config))
        .layer(CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any))
        .with_state(state)
}
