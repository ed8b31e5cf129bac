//! Chat completion worker client.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::{WorkerError, WorkerResult, check_status};

/// Default end-to-end timeout for one completion request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// One message in the conversation history sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    messages: &'a [ChatMessage],
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    text: String,
}

/// Client for the LLM chat worker (`POST /v1/chat`).
#[derive(Debug, Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    base: Url,
}

impl ChatClient {
    pub fn new(base: Url) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client must build");
        Self { http, base }
    }

    /// Run one completion over the given message history.
    pub async fn complete(&self, messages: &[ChatMessage]) -> WorkerResult<String> {
        if messages.is_empty() {
            return Err(WorkerError::InvalidInput("empty message list".to_string()));
        }
        debug!(messages = messages.len(), "requesting chat completion");

        let url = self
            .base
            .join("/v1/chat")
            .map_err(|e| WorkerError::InvalidInput(e.to_string()))?;
        let response = self
            .http
            .post(url)
            .json(&ChatRequest { messages })
            .send()
            .await?;

        let body: ChatResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| WorkerError::Decode(e.to_string()))?;

        Ok(body.text)
    }

    /// Probe the worker's health endpoint.
    pub async fn healthy(&self) -> bool {
        let Ok(url) = self.base.join("/healthz") else {
            return false;
        };
        matches!(self.http.get(url).send().await, Ok(r) if r.status().is_success())
    }
}
