//! Shared application state for the gateway server.

use anyhow::Context;
use url::Url;

use crate::config::ServerConfig;
use crate::workers::{AsrClient, ChatClient, TtsClient};

/// State shared by every connection: configuration plus the worker clients.
pub struct AppState {
    pub config: ServerConfig,
    pub asr: AsrClient,
    pub chat: ChatClient,
    pub tts: TtsClient,
}

impl AppState {
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        let asr_url: Url = config.asr_url.parse().context("invalid asr_url")?;
        let chat_url: Url = config.chat_url.parse().context("invalid chat_url")?;
        let tts_url: Url = config.tts_url.parse().context("invalid tts_url")?;

        Ok(Self {
            asr: AsrClient::new(asr_url),
            chat: ChatClient::new(chat_url),
            tts: TtsClient::new(tts_url),
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_default_config() {
        let state = AppState::new(ServerConfig::default()).expect("should build");
        assert_eq!(state.config.port, 8089);
    }
}
