//! Client-side duplex voice session.
//!
//! [`VoiceSession`] is the orchestrator the caller talks to: it owns the
//! uplink queue, the downlink jitter buffer, the wire codec, the safety
//! scanner tap, and the reconnection controller. The caller observes session
//! health exclusively through the registered event callback.

pub mod client;
pub mod reconnect;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audio::vad::VadConfig;
use crate::guardrail::EmergencyEvent;
use crate::transcript::Role;

pub use client::VoiceSession;
pub use reconnect::ReconnectConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors surfaced by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The backend would reject an empty credential, so the session refuses
    /// to dial at all
    #[error("credential must not be empty")]
    EmptyCredential,

    /// Endpoint was not a valid WebSocket URL
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Transport could not be opened within the bounded timeout
    #[error("connect timed out after {0} ms")]
    ConnectTimeout(u64),

    /// Transport-level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// At most one turn may be in flight per session
    #[error("a turn is already in flight")]
    TurnInFlight,

    /// Operation requires an open connection
    #[error("not connected")]
    NotConnected,
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

// =============================================================================
// Session State
// =============================================================================

/// Lifecycle state of a voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Not started
    Idle,
    /// Transport dialing / handshake pending
    Connecting,
    /// Server ready for uplink audio
    Listening,
    /// Server processing a turn
    Thinking,
    /// Assistant audio is playing
    Speaking,
    /// Transport lost, backoff retries in progress
    Reconnecting,
    /// Explicitly stopped by the caller
    Stopped,
    /// Fatal: reconnect attempts exhausted or start failed
    Error,
}

impl SessionState {
    /// Whether a session in this state holds live resources.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting
                | SessionState::Listening
                | SessionState::Thinking
                | SessionState::Speaking
                | SessionState::Reconnecting
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Listening => write!(f, "listening"),
            SessionState::Thinking => write!(f, "thinking"),
            SessionState::Speaking => write!(f, "speaking"),
            SessionState::Reconnecting => write!(f, "reconnecting"),
            SessionState::Stopped => write!(f, "stopped"),
            SessionState::Error => write!(f, "error"),
        }
    }
}

// =============================================================================
// Caller-Facing Events
// =============================================================================

/// Notifications delivered to the caller's event callback.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session transitioned to a new state.
    StateChanged(SessionState),
    /// A transcript fragment arrived.
    Transcript {
        role: Role,
        text: String,
        is_final: bool,
    },
    /// The safety scanner or the server flagged an emergency.
    Emergency(EmergencyEvent),
    /// A draft report patch was merged.
    ReportPatch(serde_json::Value),
    /// A recoverable error was surfaced.
    Error { message: String },
    /// Automatic reconnection gave up; a manual retry is available.
    ReconnectExhausted { attempts: u32 },
}

/// Callback type for session events.
pub type SessionEventCallback =
    Arc<dyn Fn(SessionEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

// =============================================================================
// Tunables
// =============================================================================

/// Timing and capacity knobs for one session.
#[derive(Debug, Clone)]
pub struct SessionTunables {
    /// Nominal audio frame duration, also the drain timer period.
    pub frame_ms: u64,
    /// Maximum buffered uplink duration before drop-oldest kicks in.
    pub uplink_max_ms: u64,
    /// Consecutive send failures before the uplink queue is dropped.
    pub send_error_threshold: u32,
    /// Downlink audio accumulated before playout starts.
    pub prebuffer_ms: u64,
    /// Maximum buffered downlink duration before drop-oldest kicks in.
    pub downlink_max_ms: u64,
    /// Downlink silence window that finalizes playback.
    pub silence_finalize_ms: u64,
    /// Bound on transport dial time.
    pub connect_timeout_ms: u64,
    /// Reconnection backoff policy.
    pub reconnect: ReconnectConfig,
    /// Local voice activity detection.
    pub vad: VadConfig,
}

impl Default for SessionTunables {
    fn default() -> Self {
        Self {
            frame_ms: crate::audio::FRAME_MS,
            uplink_max_ms: crate::audio::uplink::DEFAULT_MAX_BUFFERED_MS,
            send_error_threshold: 5,
            prebuffer_ms: crate::audio::jitter::DEFAULT_PREBUFFER_MS,
            downlink_max_ms: crate::audio::jitter::DEFAULT_MAX_BUFFERED_MS,
            silence_finalize_ms: 2000,
            connect_timeout_ms: 5000,
            reconnect: ReconnectConfig::default(),
            vad: VadConfig::default(),
        }
    }
}
