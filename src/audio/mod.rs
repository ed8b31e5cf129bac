//! Audio plumbing for the duplex session.
//!
//! All audio is PCM 16-bit signed little-endian mono. The uplink (microphone)
//! side runs at 16 kHz, the downlink (synthesis) side at 24 kHz, both sliced
//! into nominal 20 ms frames.

pub mod jitter;
pub mod uplink;
pub mod vad;

use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;

pub use jitter::JitterBuffer;
pub use uplink::UplinkQueue;
pub use vad::{EnergyVad, VadConfig, VadResult};

/// Uplink (capture) sample rate in Hz.
pub const UPLINK_SAMPLE_RATE: u32 = 16_000;

/// Downlink (synthesis) sample rate in Hz.
pub const DOWNLINK_SAMPLE_RATE: u32 = 24_000;

/// Nominal frame duration in milliseconds.
pub const FRAME_MS: u64 = 20;

/// Bytes per PCM16 sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Size in bytes of one frame at the given sample rate.
pub const fn frame_bytes(sample_rate: u32) -> usize {
    (sample_rate as usize / 1000) * FRAME_MS as usize * BYTES_PER_SAMPLE
}

/// One immutable slice of audio with its capture/receive timestamp.
///
/// Frames are produced by capture or the codec and consumed exactly once by
/// the drain loop that sends or plays them.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub data: Bytes,
    pub timestamp: Instant,
}

impl AudioFrame {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            timestamp: Instant::now(),
        }
    }

    /// Duration of this frame at the given sample rate.
    pub fn duration_ms(&self, sample_rate: u32) -> u64 {
        let samples = self.data.len() / BYTES_PER_SAMPLE;
        (samples as u64 * 1000) / sample_rate as u64
    }
}

/// Output device seam for downlink playback.
///
/// `write` is invoked fire-and-forget by the drain timer so a slow audio
/// backend cannot stall it; failures are logged by the caller, not awaited
/// inline. `stop` is the barge-in path and is awaited.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Feed one frame of PCM to the output device.
    async fn write(&self, frame: Bytes) -> anyhow::Result<()>;

    /// Halt playback and discard anything the device still holds.
    async fn stop(&self) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_bytes() {
        // 20 ms at 16 kHz mono PCM16 = 320 samples = 640 bytes.
        assert_eq!(frame_bytes(UPLINK_SAMPLE_RATE), 640);
        // 20 ms at 24 kHz mono PCM16 = 480 samples = 960 bytes.
        assert_eq!(frame_bytes(DOWNLINK_SAMPLE_RATE), 960);
    }

    #[test]
    fn test_frame_duration() {
        let frame = AudioFrame::new(Bytes::from(vec![0u8; frame_bytes(UPLINK_SAMPLE_RATE)]));
        assert_eq!(frame.duration_ms(UPLINK_SAMPLE_RATE), FRAME_MS);

        let frame = AudioFrame::new(Bytes::from(vec![0u8; frame_bytes(DOWNLINK_SAMPLE_RATE)]));
        assert_eq!(frame.duration_ms(DOWNLINK_SAMPLE_RATE), FRAME_MS);
    }
}
