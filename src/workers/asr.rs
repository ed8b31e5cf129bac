//! Speech-recognition worker client.

use std::io::Cursor;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::audio::UPLINK_SAMPLE_RATE;
use crate::protocol::encode_audio;

use super::{WorkerError, WorkerResult, check_status};

/// Default end-to-end timeout for one transcription request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
struct AsrRequest {
    audio_b64: String,
}

#[derive(Debug, Deserialize)]
struct AsrResponse {
    transcript: String,
}

/// Client for the ASR worker (`POST /v1/asr`).
#[derive(Debug, Clone)]
pub struct AsrClient {
    http: reqwest::Client,
    base: Url,
}

impl AsrClient {
    pub fn new(base: Url) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client must build");
        Self { http, base }
    }

    /// Transcribe a buffer of PCM16LE mono 16 kHz audio.
    ///
    /// The worker consumes WAV, so the PCM is wrapped in an in-memory WAV
    /// container before upload.
    pub async fn transcribe_pcm(&self, pcm: &[u8]) -> WorkerResult<String> {
        if pcm.is_empty() {
            return Err(WorkerError::InvalidInput("empty audio buffer".to_string()));
        }

        let wav = encode_wav(pcm, UPLINK_SAMPLE_RATE)?;
        debug!(pcm_bytes = pcm.len(), wav_bytes = wav.len(), "sending audio to ASR worker");

        let url = self
            .base
            .join("/v1/asr")
            .map_err(|e| WorkerError::InvalidInput(e.to_string()))?;
        let response = self
            .http
            .post(url)
            .json(&AsrRequest {
                audio_b64: encode_audio(&wav),
            })
            .send()
            .await?;

        let body: AsrResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| WorkerError::Decode(e.to_string()))?;

        Ok(body.transcript.trim().to_string())
    }

    /// Probe the worker's health endpoint.
    pub async fn healthy(&self) -> bool {
        let Ok(url) = self.base.join("/healthz") else {
            return false;
        };
        matches!(self.http.get(url).send().await, Ok(r) if r.status().is_success())
    }
}

/// Wrap raw PCM16LE mono samples in a WAV container.
fn encode_wav(pcm: &[u8], sample_rate: u32) -> WorkerResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| WorkerError::Decode(e.to_string()))?;
        for chunk in pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            writer
                .write_sample(sample)
                .map_err(|e| WorkerError::Decode(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| WorkerError::Decode(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
