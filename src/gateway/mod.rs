//! Server-side WebSocket gateway.
//!
//! Speaks the same wire protocol as the client session and drives the
//! per-turn ASR → LLM → TTS pipeline against the worker services.

pub mod handler;
pub mod turn;

pub use handler::session_handler;
