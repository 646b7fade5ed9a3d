use crate::models::{DownloadMode, Tool};
use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde_json::json;
use std::path::PathBuf;
use thiserror::Error;

/// A download request that cannot be built from the given selections.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("URL cannot be empty")]
    EmptyUrl,
    #[error("invalid resolution '{0}'")]
    InvalidResolution(String),
    #[error("invalid audio quality '{0}', expected 'source' or a bitrate like '128k'")]
    InvalidAudioQuality(String),
    #[error("video settings must be given exactly when the mode is not audio-only (mode: {0:?})")]
    VideoSpecMismatch(DownloadMode),
    #[error("audio settings must be given exactly when the mode is not video-only (mode: {0:?})")]
    AudioSpecMismatch(DownloadMode),
}

/// Raised by the option resolver before any command is built.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("destination folder not found: {}", .0.display())]
    DestinationMissing(PathBuf),
    #[error("{} not found at {}", .0, .1.display())]
    ToolMissing(Tool, PathBuf),
}

impl ResolutionError {
    /// The short text shown on the status line.
    pub fn status_text(&self) -> String {
        match self {
            ResolutionError::DestinationMissing(_) => "Destination folder not found.".to_string(),
            ResolutionError::ToolMissing(Tool::YtDlp, _) => {
                "yt-dlp not found. Check tool paths.".to_string()
            }
            ResolutionError::ToolMissing(_, _) => {
                "ffmpeg / ffprobe not found. Check tool paths.".to_string()
            }
        }
    }
}

/// The process could not be created. No job handle exists.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("executable not found: {}", .0.display())]
    ExecutableMissing(PathBuf),
    #[error("not an executable file: {}", .0.display())]
    NotExecutable(PathBuf),
    #[error("working directory not found: {}", .0.display())]
    WorkingDirectoryMissing(PathBuf),
    #[error("failed to start process: {0}")]
    Os(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("a download is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

// Define our custom error type
pub enum AppError {
    Internal(anyhow::Error),
    BadRequest(String),
    Conflict(String),
    Unprocessable(String),
}

// This implementation allows us to convert our AppError into a valid HTTP response.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Internal(e) => {
                // Log the full error for debugging
                tracing::error!("Internal server error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal server error occurred".to_string(),
                )
            }
            AppError::BadRequest(e) => (StatusCode::BAD_REQUEST, e),
            AppError::Conflict(e) => (StatusCode::CONFLICT, e),
            AppError::Unprocessable(e) => (StatusCode::UNPROCESSABLE_ENTITY, e),
        };

        let body = Json(json!({ "error": error_message }));
        (status, body).into_response()
    }
}

// Lets handlers use `?` on anything anyhow understands.
impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Internal(err.into())
    }
}

impl AppError {
    pub fn from_request(err: RequestError) -> Self {
        AppError::BadRequest(err.to_string())
    }

    pub fn from_start(err: StartError) -> Self {
        match err {
            StartError::AlreadyRunning => AppError::Conflict(err.to_string()),
            StartError::Spawn(e) => AppError::Unprocessable(e.to_string()),
        }
    }
}
