//! HTTP clients for the speech and language worker services.
//!
//! The gateway treats the workers as request/response black boxes behind
//! small JSON contracts: `POST /v1/asr` (base64 WAV in, transcript out),
//! `POST /v1/chat` (message list in, text out), `POST /v1/tts` (text in,
//! base64 PCM out). Each worker also exposes `GET /healthz`.

pub mod asr;
pub mod chat;
pub mod tts;

use thiserror::Error;

pub use asr::AsrClient;
pub use chat::{ChatClient, ChatMessage};
pub use tts::TtsClient;

/// Errors from a worker call.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Transport-level failure reaching the worker
    #[error("worker request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Worker answered with a non-success status
    #[error("worker returned status {status}: {body}")]
    Status {
        status: http::StatusCode,
        body: String,
    },

    /// Worker response could not be decoded
    #[error("worker response invalid: {0}")]
    Decode(String),

    /// Input rejected before the request was made
    #[error("invalid worker input: {0}")]
    InvalidInput(String),
}

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Read a worker response body, converting non-success statuses into
/// [`WorkerError::Status`].
pub(crate) async fn check_status(response: reqwest::Response) -> WorkerResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(WorkerError::Status { status, body })
}
