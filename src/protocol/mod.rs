//! Wire protocol for the duplex voice session.
//!
//! Every text frame carries one JSON envelope `{type, seq, payload}`. The
//! `seq` field is a per-connection monotonically increasing integer assigned
//! by the sender; `seq == 0` is reserved for unordered diagnostic events that
//! bypass the ordering guard. Raw audio may alternatively travel as binary
//! frames (no envelope) when `binary_audio` is negotiated in the hello.
//!
//! Malformed frames never crash a receive loop: decoding returns a
//! [`ProtocolError`] which callers convert into a synthetic local error event
//! via [`ServerEvent::synthetic_error`].

pub mod sequence;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

pub use sequence::SequenceGuard;

/// Maximum allowed size for a text turn (50 KB)
pub const MAX_TEXT_SIZE: usize = 50 * 1024;

/// Maximum allowed size for hello instructions (100 KB)
pub const MAX_INSTRUCTIONS_SIZE: usize = 100 * 1024;

/// Maximum allowed size for a base64 audio chunk (1 MB)
pub const MAX_AUDIO_CHUNK_SIZE: usize = 1024 * 1024;

// =============================================================================
// Error Types
// =============================================================================

/// Errors produced at the codec boundary.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame was not valid JSON or did not match any known event shape
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Frame decoded but a field exceeded its size limit
    #[error("{0}")]
    Oversized(String),

    /// Base64 audio payload could not be decoded
    #[error("invalid audio payload: {0}")]
    InvalidAudio(String),
}

/// Result type for codec operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// =============================================================================
// Envelope
// =============================================================================

/// Wire envelope wrapping a typed event with its sequence number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope<E> {
    /// Sender-assigned sequence number; 0 means unordered.
    #[serde(default)]
    pub seq: u64,

    /// The typed event, tagged by `type` with its fields under `payload`.
    #[serde(flatten)]
    pub event: E,
}

impl<E> Envelope<E> {
    /// Wrap an event with an ordered sequence number.
    pub fn new(seq: u64, event: E) -> Self {
        Self { seq, event }
    }

    /// Wrap an event as unordered (`seq == 0`).
    pub fn unordered(event: E) -> Self {
        Self { seq: 0, event }
    }
}

/// Monotonic per-connection sequence allocator. The first ordered event is 1.
#[derive(Debug, Default)]
pub struct Sequencer {
    next: AtomicU64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    /// Allocate the next ordered sequence number.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Restart numbering, used after a reconnect handshake.
    pub fn reset(&self) {
        self.next.store(0, Ordering::SeqCst);
    }
}

// =============================================================================
// Client Events (client -> server)
// =============================================================================

/// Session options carried in the hello handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionOptions {
    /// Negotiate raw binary frames for audio instead of base64 JSON chunks.
    #[serde(default)]
    pub binary_audio: bool,

    /// System instructions for the assistant.
    #[serde(default)]
    pub instructions: Option<String>,

    /// Assistant tone preset (explicit session field, no ambient state).
    #[serde(default)]
    pub tone: Option<String>,
}

/// Events sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum ClientEvent {
    /// Handshake carrying the credential and session options.
    #[serde(rename = "client.hello")]
    Hello {
        credential: String,
        #[serde(default)]
        session_config: SessionOptions,
    },

    /// One captured audio frame, base64 PCM16LE mono 16 kHz.
    #[serde(rename = "client.audio.chunk")]
    AudioChunk { data: String },

    /// End of utterance.
    #[serde(rename = "client.audio.turnComplete")]
    TurnComplete {
        #[serde(default)]
        transcribe_only: bool,
    },

    /// Alternate non-audio turn.
    #[serde(rename = "client.text.turn")]
    TextTurn { text: String },

    /// Graceful session teardown.
    #[serde(rename = "client.session.stop")]
    SessionStop,

    /// Liveness probe; answered with an unordered pong.
    #[serde(rename = "client.ping")]
    Ping,
}

impl ClientEvent {
    /// Validate field sizes so a hostile client cannot exhaust memory.
    pub fn validate_size(&self) -> ProtocolResult<()> {
        match self {
            ClientEvent::Hello { session_config, .. } => {
                if let Some(instructions) = &session_config.instructions
                    && instructions.len() > MAX_INSTRUCTIONS_SIZE
                {
                    return Err(ProtocolError::Oversized(format!(
                        "instructions too large: {} bytes (max: {})",
                        instructions.len(),
                        MAX_INSTRUCTIONS_SIZE
                    )));
                }
            }
            ClientEvent::AudioChunk { data } => {
                if data.len() > MAX_AUDIO_CHUNK_SIZE {
                    return Err(ProtocolError::Oversized(format!(
                        "audio chunk too large: {} bytes (max: {})",
                        data.len(),
                        MAX_AUDIO_CHUNK_SIZE
                    )));
                }
            }
            ClientEvent::TextTurn { text } => {
                if text.len() > MAX_TEXT_SIZE {
                    return Err(ProtocolError::Oversized(format!(
                        "text too large: {} bytes (max: {})",
                        text.len(),
                        MAX_TEXT_SIZE
                    )));
                }
            }
            ClientEvent::TurnComplete { .. }
            | ClientEvent::SessionStop
            | ClientEvent::Ping => {}
        }
        Ok(())
    }
}

// =============================================================================
// Server Events (server -> client)
// =============================================================================

/// Server-reported conversational state names.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WireSessionState {
    Ready,
    Listening,
    Thinking,
    Speaking,
    Stopped,
}

/// Transcript fragment payload shared by user and assistant transcripts.
///
/// The canonical emotion key is `emotion`; `mood` and `affect` are accepted
/// as deprecated aliases from older backends and never emitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TranscriptPayload {
    pub text: String,

    /// Idempotency anchor for this utterance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utterance_id: Option<String>,

    #[serde(
        default,
        alias = "mood",
        alias = "affect",
        skip_serializing_if = "Option::is_none"
    )]
    pub emotion: Option<String>,
}

/// Events sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEvent {
    /// Conversational state announcement.
    #[serde(rename = "server.session.state")]
    SessionState { state: WireSessionState },

    /// Partial transcript of the user's speech.
    #[serde(rename = "server.user.transcript.partial")]
    UserTranscriptPartial(TranscriptPayload),

    /// Final transcript of the user's speech.
    #[serde(rename = "server.user.transcript.final")]
    UserTranscriptFinal(TranscriptPayload),

    /// Partial assistant transcript.
    #[serde(rename = "server.transcript.partial")]
    AssistantTranscriptPartial(TranscriptPayload),

    /// Final assistant transcript.
    #[serde(rename = "server.transcript.final")]
    AssistantTranscriptFinal(TranscriptPayload),

    /// One synthesized audio frame, base64 PCM16LE mono 24 kHz.
    #[serde(rename = "server.audio.out")]
    AudioOut { data: String },

    /// Immediate playback interrupt (barge-in or server-side cancel).
    #[serde(rename = "server.audio.stop")]
    AudioStop { reason: String },

    /// Safety guardrail triage signal.
    #[serde(rename = "server.triage.emergency")]
    TriageEmergency {
        severity: String,
        banner: String,
        #[serde(default)]
        interrupt: bool,
        /// Utterance that tripped the scanner, for cross-source dedup.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        utterance_id: Option<String>,
    },

    /// Partial update to the session's draft report.
    #[serde(rename = "server.report.patch")]
    ReportPatch { patch: serde_json::Value },

    /// Backend or protocol error surfaced to the client.
    #[serde(rename = "server.error")]
    Error { message: String },

    /// Answer to a client ping; always unordered.
    #[serde(rename = "server.pong")]
    Pong,
}

impl ServerEvent {
    /// Convert a codec failure into a local event so the receive loop keeps
    /// running on malformed input.
    pub fn synthetic_error(err: &ProtocolError) -> Self {
        ServerEvent::Error {
            message: err.to_string(),
        }
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Serialize an envelope to a JSON text frame.
pub fn encode<E: Serialize>(envelope: &Envelope<E>) -> ProtocolResult<String> {
    serde_json::to_string(envelope).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Decode a JSON text frame into a typed envelope.
pub fn decode<E: DeserializeOwned>(text: &str) -> ProtocolResult<Envelope<E>> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Decode a base64 audio payload into raw PCM bytes.
pub fn decode_audio(data: &str) -> ProtocolResult<Vec<u8>> {
    use base64::prelude::*;
    BASE64_STANDARD
        .decode(data)
        .map_err(|e| ProtocolError::InvalidAudio(e.to_string()))
}

/// Encode raw PCM bytes as a base64 audio payload.
pub fn encode_audio(pcm: &[u8]) -> String {
    use base64::prelude::*;
    BASE64_STANDARD.encode(pcm)
}
