//! Server configuration.
//!
//! Configuration is loaded from environment variables or a YAML file.
//! Priority: YAML file (when given) > environment variables > defaults.
//!
//! # Example
//! ```rust,no_run
//! use parley_gateway::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ServerConfig::from_env()?;
//!
//! // Load from a YAML file
//! let config = ServerConfig::from_file(&PathBuf::from("config.yaml"))?;
//!
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8089
}

fn default_asr_url() -> String {
    "http://127.0.0.1:8001".to_string()
}

fn default_chat_url() -> String {
    "http://127.0.0.1:8002".to_string()
}

fn default_tts_url() -> String {
    "http://127.0.0.1:8003".to_string()
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the WebSocket server.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Expected client credential. When unset, any non-empty credential is
    /// accepted (useful behind a trusted proxy).
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Base URL of the ASR worker.
    #[serde(default = "default_asr_url")]
    pub asr_url: String,

    /// Base URL of the chat completion worker.
    #[serde(default = "default_chat_url")]
    pub chat_url: String,

    /// Base URL of the TTS worker.
    #[serde(default = "default_tts_url")]
    pub tts_url: String,

    /// When set, a failed synthesis yields this much silence instead of
    /// failing the turn.
    #[serde(default)]
    pub tts_fallback_silence_ms: Option<u64>,

    /// Generate and log a conversation summary when a session closes.
    #[serde(default)]
    pub summarize_on_close: bool,

    /// Comma-separated CORS origins, or "*" for any. Unset means
    /// same-origin only.
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auth_token: None,
            asr_url: default_asr_url(),
            chat_url: default_chat_url(),
            tts_url: default_tts_url(),
            tts_fallback_silence_ms: None,
            summarize_on_close: false,
            cors_allowed_origins: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("PARLEY_HOST") {
            config.host = host;
        }
        if let Ok(port) = std::env::var("PARLEY_PORT") {
            config.port = port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("invalid PARLEY_PORT: {port}")))?;
        }
        if let Ok(token) = std::env::var("PARLEY_AUTH_TOKEN") {
            config.auth_token = Some(token);
        }
        if let Ok(url) = std::env::var("ASR_WORKER_URL") {
            config.asr_url = url;
        }
        if let Ok(url) = std::env::var("CHAT_WORKER_URL") {
            config.chat_url = url;
        }
        if let Ok(url) = std::env::var("TTS_WORKER_URL") {
            config.tts_url = url;
        }
        if let Ok(ms) = std::env::var("TTS_FALLBACK_SILENCE_MS") {
            config.tts_fallback_silence_ms = Some(ms.parse().map_err(|_| {
                ConfigError::Invalid(format!("invalid TTS_FALLBACK_SILENCE_MS: {ms}"))
            })?);
        }
        if let Ok(value) = std::env::var("SUMMARIZE_ON_CLOSE") {
            config.summarize_on_close = matches!(value.as_str(), "1" | "true" | "yes");
        }
        if let Ok(origins) = std::env::var("CORS_ALLOWED_ORIGINS") {
            config.cors_allowed_origins = Some(origins);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Bind address in `host:port` form.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("asr_url", &self.asr_url),
            ("chat_url", &self.chat_url),
            ("tts_url", &self.tts_url),
        ] {
            url::Url::parse(value)
                .map_err(|e| ConfigError::Invalid(format!("{name} `{value}`: {e}")))?;
        }
        if let Some(token) = &self.auth_token
            && token.is_empty()
        {
            return Err(ConfigError::Invalid(
                "auth_token must not be empty when set".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.address(), "0.0.0.0:8089");
        assert!(config.auth_token.is_none());
        assert!(config.tts_fallback_silence_ms.is_none());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        // Env-var tests are serialized: the process environment is global.
        unsafe {
            std::env::set_var("PARLEY_HOST", "127.0.0.1");
            std::env::set_var("PARLEY_PORT", "9000");
            std::env::set_var("TTS_FALLBACK_SILENCE_MS", "1500");
        }

        let config = ServerConfig::from_env().expect("should load");
        assert_eq!(config.address(), "127.0.0.1:9000");
        assert_eq!(config.tts_fallback_silence_ms, Some(1500));

        unsafe {
            std::env::remove_var("PARLEY_HOST");
            std::env::remove_var("PARLEY_PORT");
            std::env::remove_var("TTS_FALLBACK_SILENCE_MS");
        }
    }

    #[test]
    #[serial]
    fn test_invalid_port_rejected() {
        unsafe {
            std::env::set_var("PARLEY_PORT", "not-a-port");
        }
        let result = ServerConfig::from_env();
        unsafe {
            std::env::remove_var("PARLEY_PORT");
        }
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    #[serial]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "host: 10.0.0.1\nport: 9999\nauth_token: secret\nasr_url: http://asr:8001"
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).expect("should load");
        assert_eq!(config.address(), "10.0.0.1:9999");
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.asr_url, "http://asr:8001");
        // Unspecified fields keep their defaults.
        assert_eq!(config.chat_url, default_chat_url());
    }

    #[test]
    #[serial]
    fn test_invalid_worker_url_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "asr_url: ':not a url'").unwrap();
        assert!(matches!(
            ServerConfig::from_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }
}
