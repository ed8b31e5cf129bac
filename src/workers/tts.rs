//! Text-to-speech worker client.
//!
//! Text is sanitized (markdown stripped, whitespace collapsed) and split
//! into sentence-aware chunks before synthesis; long inputs are hard-capped.
//! Synthesis requests are single-flight: the worker holds one model and
//! interleaved requests only slow each other down.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use url::Url;

use crate::audio::{BYTES_PER_SAMPLE, DOWNLINK_SAMPLE_RATE};
use crate::protocol::decode_audio;

use super::{WorkerError, WorkerResult, check_status};

/// Default end-to-end timeout for one synthesis request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Hard cap on input text length.
pub const MAX_TEXT_LENGTH: usize = 4000;

/// Sentence-aware chunk limit per synthesis request.
pub const MAX_CHUNK_CHARS: usize = 500;

static MARKDOWN_EMPHASIS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*{1,3}([^*]+)\*{1,3}").expect("regex must compile"));
static MARKDOWN_LITERALS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[`_~]").expect("regex must compile"));
static NEWLINE_RUNS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*\n+\s*").expect("regex must compile"));
static WHITESPACE_RUNS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("regex must compile"));
static SENTENCE_BOUNDARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)(.*?[.!?])\s+").expect("regex must compile"));

#[derive(Debug, Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct TtsResponse {
    audio_pcm_b64: String,
    sample_rate: u32,
    channels: u16,
}

/// Client for the TTS worker (`POST /v1/tts`).
#[derive(Debug, Clone)]
pub struct TtsClient {
    http: reqwest::Client,
    base: Url,
    synth_slot: Arc<Semaphore>,
}

impl TtsClient {
    pub fn new(base: Url) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client must build");
        Self {
            http,
            base,
            synth_slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// Synthesize text into PCM16LE mono 24 kHz audio.
    pub async fn synthesize(&self, text: &str) -> WorkerResult<Bytes> {
        let cleaned = sanitize_text(text);
        if cleaned.is_empty() {
            return Err(WorkerError::InvalidInput("text must not be empty".to_string()));
        }
        if cleaned.len() > MAX_TEXT_LENGTH {
            return Err(WorkerError::InvalidInput(format!(
                "text exceeds maximum length ({} > {})",
                cleaned.len(),
                MAX_TEXT_LENGTH
            )));
        }

        let _permit = self
            .synth_slot
            .acquire()
            .await
            .map_err(|e| WorkerError::InvalidInput(e.to_string()))?;

        let mut pcm = Vec::new();
        for chunk in split_for_synthesis(&cleaned, MAX_CHUNK_CHARS) {
            let part = self.synthesize_chunk(&chunk).await?;
            pcm.extend_from_slice(&part);
        }
        debug!(text_len = cleaned.len(), pcm_bytes = pcm.len(), "synthesis complete");
        Ok(Bytes::from(pcm))
    }

    async fn synthesize_chunk(&self, text: &str) -> WorkerResult<Vec<u8>> {
        let url = self
            .base
            .join("/v1/tts")
            .map_err(|e| WorkerError::InvalidInput(e.to_string()))?;
        let response = self.http.post(url).json(&TtsRequest { text }).send().await?;

        let body: TtsResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| WorkerError::Decode(e.to_string()))?;

        if body.sample_rate != DOWNLINK_SAMPLE_RATE || body.channels != 1 {
            warn!(
                sample_rate = body.sample_rate,
                channels = body.channels,
                "TTS worker returned unexpected audio format"
            );
            return Err(WorkerError::Decode(format!(
                "expected {} Hz mono, got {} Hz {} ch",
                DOWNLINK_SAMPLE_RATE, body.sample_rate, body.channels
            )));
        }

        decode_audio(&body.audio_pcm_b64).map_err(|e| WorkerError::Decode(e.to_string()))
    }

    /// Probe the worker's health endpoint.
    pub async fn healthy(&self) -> bool {
        let Ok(url) = self.base.join("/healthz") else {
            return false;
        };
        matches!(self.http.get(url).send().await, Ok(r) if r.status().is_success())
    }
}

/// Generate `duration_ms` of PCM16LE silence at the downlink sample rate.
/// Used as the configurable fallback when synthesis fails.
pub fn silence(duration_ms: u64) -> Bytes {
    let samples = (DOWNLINK_SAMPLE_RATE as u64 * duration_ms) / 1000;
    Bytes::from(vec![0u8; samples as usize * BYTES_PER_SAMPLE])
}

/// Remove markdown and TTS-hostile characters while preserving meaning.
pub fn sanitize_text(text: &str) -> String {
    let cleaned = MARKDOWN_EMPHASIS.replace_all(text, "$1");
    let cleaned = MARKDOWN_LITERALS.replace_all(&cleaned, "");
    let cleaned = NEWLINE_RUNS.replace_all(&cleaned, " ");
    let cleaned = WHITESPACE_RUNS.replace_all(&cleaned, " ");
    cleaned.trim().to_string()
}

/// Split sanitized text into sentence-aware chunks within `max_chars`.
/// Sentences longer than the limit are hard-split.
pub fn split_for_synthesis(text: &str, max_chars: usize) -> Vec<String> {
    if text.len() <= max_chars {
        return vec![text.to_string()];
    }

    let mut sentences: Vec<&str> = Vec::new();
    let mut last_end = 0;
    for captures in SENTENCE_BOUNDARY.captures_iter(text) {
        let matched = captures.get(1).expect("group 1 always present");
        sentences.push(matched.as_str());
        last_end = captures.get(0).expect("group 0 always present").end();
    }
    if last_end < text.len() {
        sentences.push(&text[last_end..]);
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    for sentence in sentences {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }

        if sentence.len() > max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            let bytes = sentence.as_bytes();
            let mut start = 0;
            while start < bytes.len() {
                let mut end = (start + max_chars).min(bytes.len());
                // Back off to a char boundary.
                while end < bytes.len() && !sentence.is_char_boundary(end) {
                    end -= 1;
                }
                let part = sentence[start..end].trim();
                if !part.is_empty() {
                    chunks.push(part.to_string());
                }
                start = end;
            }
            continue;
        }

        if current.is_empty() {
            current = sentence.to_string();
        } else if current.len() + 1 + sentence.len() <= max_chars {
            current.push(' ');
            current.push_str(sentence);
        } else {
            chunks.push(std::mem::take(&mut current));
            current = sentence.to_string();
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::protocol::encode_audio;

    use super::*;

    #[test]
    fn test_sanitize_strips_markdown() {
        assert_eq!(sanitize_text("**bold** and *italic*"), "bold and italic");
        assert_eq!(sanitize_text("some `code` _under_ ~strike~"), "some code under strike");
        assert_eq!(sanitize_text("line one\n\n  line two"), "line one line two");
        assert_eq!(sanitize_text("  spaced   out  "), "spaced out");
    }

    #[test]
    fn test_short_text_is_single_chunk() {
        assert_eq!(split_for_synthesis("Hello there.", 500), vec!["Hello there."]);
    }

    #[test]
    fn test_split_respects_sentence_boundaries() {
        let text = "First sentence here. Second sentence follows! Third one? Fourth ends it.";
        let chunks = split_for_synthesis(text, 45);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.len() <= 45, "chunk too long: {chunk}");
        }
        assert!(chunks[0].starts_with("First sentence"));
        // Nothing is lost.
        let rejoined = chunks.join(" ");
        assert!(rejoined.contains("Fourth ends it."));
    }

    #[test]
    fn test_very_long_sentence_hard_split() {
        let text = "a".repeat(1200);
        let chunks = split_for_synthesis(&text, 500);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 500));
    }

    #[test]
    fn test_silence_duration() {
        // 2 s at 24 kHz mono PCM16 = 96000 bytes.
        assert_eq!(silence(2000).len(), 96_000);
        assert!(silence(2000).iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_synthesize_decodes_pcm() {
        let server = MockServer::start().await;
        let pcm = vec![7u8; 960];
        Mock::given(method("POST"))
            .and(path("/v1/tts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "audio_pcm_b64": encode_audio(&pcm),
                "sample_rate": 24000,
                "channels": 1
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = TtsClient::new(server.uri().parse().unwrap());
        let audio = client.synthesize("Say this.").await.unwrap();
        assert_eq!(audio.as_ref(), pcm.as_slice());
    }

    #[tokio::test]
    async fn test_unexpected_format_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/tts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "audio_pcm_b64": "",
                "sample_rate": 22050,
                "channels": 1
            })))
            .mount(&server)
            .await;

        let client = TtsClient::new(server.uri().parse().unwrap());
        assert!(matches!(
            client.synthesize("Say this.").await.unwrap_err(),
            WorkerError::Decode(_)
        ));
    }

    #[tokio::test]
    async fn test_empty_text_rejected() {
        let client = TtsClient::new("http://localhost:1".parse().unwrap());
        assert!(matches!(
            client.synthesize("  \n ").await.unwrap_err(),
            WorkerError::InvalidInput(_)
        ));
    }
}
