use crate::{
    config::Config,
    error::{AppError, StartError},
    models::{CancelResponse, DownloadPayload, DownloadResponse, OptionCatalog, StatusResponse},
    resolver,
    status::{self, IDLE_AFTER},
    AppState,
};
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

// ===================================================================
//                          CONFIG HANDLERS
// ===================================================================

/// # GET /config - Returns the current application configuration.
pub async fn get_config(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let config = state.config.read().unwrap().clone();
    Ok((StatusCode::OK, Json(config)))
}

/// # POST /config - Replaces the configuration and saves it to disk.
pub async fn update_config(
    State(state): State<AppState>,
    Json(payload): Json<Config>,
) -> Result<impl IntoResponse, AppError> {
    state.store.save(&payload).await?;
    *state.config.write().unwrap() = payload.clone();
    tracing::info!("Configuration updated and saved.");
    Ok((StatusCode::OK, Json(payload)))
}

/// # GET /options - The choices offered for each download setting.
pub async fn get_options() -> impl IntoResponse {
    Json(OptionCatalog::new())
}

// ===================================================================
//                          DOWNLOAD HANDLERS
// ===================================================================

/// # POST /download - Resolves the request and starts yt-dlp in the background.
pub async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadPayload>,
) -> Result<impl IntoResponse, AppError> {
    if state.runner.is_busy() {
        return Err(AppError::from_start(StartError::AlreadyRunning));
    }

    // Settings are read once here; the job never sees later changes.
    let (request, tools) = {
        let config = state.config.read().unwrap();
        let settings = config.download.with_overrides(&payload.overrides);
        let request = settings.request_for(&payload.url).map_err(AppError::from_request)?;
        (request, config.tools.clone())
    };
    tracing::info!("Download requested for {} ({:?})", request.url(), request.mode());

    let command = match resolver::resolve(&request, &tools) {
        Ok(command) => command,
        Err(e) => {
            tracing::warn!("Could not resolve download for {}: {}", request.url(), e);
            state.status.set(e.status_text());
            return Err(AppError::Unprocessable(e.to_string()));
        }
    };
    let (job, events) = match state.runner.start(command) {
        Ok(started) => started,
        Err(StartError::AlreadyRunning) => {
            return Err(AppError::from_start(StartError::AlreadyRunning));
        }
        Err(e) => {
            state.status.set(format!("Error: {}", e));
            return Err(AppError::from_start(e));
        }
    };

    state.status.begin(job.id());
    tokio::spawn(status::follow(state.status.clone(), job.id(), events, IDLE_AFTER));

    Ok((
        StatusCode::ACCEPTED,
        Json(DownloadResponse {
            message: "Download started successfully".to_string(),
            job_id: job.id(),
            command: job.command().shell_line(),
        }),
    ))
}

/// # POST /cancel - Stops the running download, if any.
pub async fn cancel_download(State(state): State<AppState>) -> impl IntoResponse {
    let cancelled = state.runner.cancel();
    if !cancelled {
        tracing::info!("Cancel requested but no download is running.");
    }
    Json(CancelResponse { cancelled })
}

/// # GET /status - Returns the status line and the state of the last job.
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(state.status.snapshot())
}
