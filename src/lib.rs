pub mod audio;
pub mod config;
pub mod draft;
pub mod gateway;
pub mod guardrail;
pub mod protocol;
pub mod routes;
pub mod session;
pub mod state;
pub mod transcript;
pub mod workers;

// Re-export commonly used items for convenience
pub use config::ServerConfig;
pub use draft::{DraftCriteria, DraftReport};
pub use guardrail::{EmergencyEvent, EmergencySeverity};
pub use session::{SessionError, SessionEvent, SessionState, SessionTunables, VoiceSession};
pub use state::AppState;
