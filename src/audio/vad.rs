//! Energy-based voice activity detection.
//!
//! A lightweight RMS detector with hysteresis: transitions between silence
//! and speech are only confirmed after a minimum duration on the other side
//! of the threshold, so single noisy frames do not flap the state.

use tracing::debug;

use super::BYTES_PER_SAMPLE;

/// Configuration for the energy detector.
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Normalized RMS activation threshold (0.0 to 1.0).
    pub threshold: f32,
    /// Speech must persist this long before `speech_start` fires.
    pub min_speech_ms: u64,
    /// Silence must persist this long before `speech_end` fires.
    pub min_silence_ms: u64,
    /// Duration of one analyzed frame.
    pub frame_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.015,
            min_speech_ms: 120,
            min_silence_ms: 600,
            frame_ms: super::FRAME_MS,
        }
    }
}

/// Result of analyzing a single audio frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct VadResult {
    /// Whether the detector currently considers the stream to be speech.
    pub is_speech: bool,
    /// Transition from silence to confirmed speech happened on this frame.
    pub speech_start: bool,
    /// Transition from speech to confirmed silence happened on this frame.
    pub speech_end: bool,
    /// Normalized RMS energy of this frame (0.0 to 1.0).
    pub rms: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VadState {
    Silence,
    PotentialSpeech,
    Speech,
    PotentialSilence,
}

/// RMS energy detector over PCM16LE frames.
pub struct EnergyVad {
    config: VadConfig,
    state: VadState,
    speech_frames: u32,
    silence_frames: u32,
    min_speech_frames: u32,
    min_silence_frames: u32,
}

impl EnergyVad {
    pub fn new(config: VadConfig) -> Self {
        let min_speech_frames =
            (config.min_speech_ms as f32 / config.frame_ms as f32).ceil() as u32;
        let min_silence_frames =
            (config.min_silence_ms as f32 / config.frame_ms as f32).ceil() as u32;
        Self {
            config,
            state: VadState::Silence,
            speech_frames: 0,
            silence_frames: 0,
            min_speech_frames: min_speech_frames.max(1),
            min_silence_frames: min_silence_frames.max(1),
        }
    }

    /// Analyze one PCM16LE frame.
    pub fn process_frame(&mut self, pcm: &[u8]) -> VadResult {
        let rms = Self::rms(pcm);
        let is_speech_frame = rms >= self.config.threshold;

        if is_speech_frame {
            self.speech_frames += 1;
            self.silence_frames = 0;
        } else {
            self.silence_frames += 1;
            self.speech_frames = 0;
        }

        let (new_state, speech_start, speech_end) = self.transition(is_speech_frame);
        self.state = new_state;

        VadResult {
            is_speech: matches!(self.state, VadState::Speech | VadState::PotentialSilence),
            speech_start,
            speech_end,
            rms,
        }
    }

    /// Reset internal state, e.g. when a new audio stream starts.
    pub fn reset(&mut self) {
        self.state = VadState::Silence;
        self.speech_frames = 0;
        self.silence_frames = 0;
    }

    pub fn is_speaking(&self) -> bool {
        matches!(self.state, VadState::Speech | VadState::PotentialSilence)
    }

    fn transition(&self, is_speech_frame: bool) -> (VadState, bool, bool) {
        let mut speech_start = false;
        let mut speech_end = false;

        let new_state = match self.state {
            VadState::Silence => {
                if is_speech_frame {
                    if self.speech_frames >= self.min_speech_frames {
                        speech_start = true;
                        debug!(frames = self.speech_frames, "speech confirmed");
                        VadState::Speech
                    } else {
                        VadState::PotentialSpeech
                    }
                } else {
                    VadState::Silence
                }
            }
            VadState::PotentialSpeech => {
                if is_speech_frame {
                    if self.speech_frames >= self.min_speech_frames {
                        speech_start = true;
                        debug!(frames = self.speech_frames, "speech confirmed");
                        VadState::Speech
                    } else {
                        VadState::PotentialSpeech
                    }
                } else {
                    VadState::Silence
                }
            }
            VadState::Speech => {
                if is_speech_frame {
                    VadState::Speech
                } else {
                    VadState::PotentialSilence
                }
            }
            VadState::PotentialSilence => {
                if is_speech_frame {
                    VadState::Speech
                } else if self.silence_frames >= self.min_silence_frames {
                    speech_end = true;
                    debug!(frames = self.silence_frames, "silence confirmed");
                    VadState::Silence
                } else {
                    VadState::PotentialSilence
                }
            }
        };

        (new_state, speech_start, speech_end)
    }

    /// Normalized RMS of a PCM16LE buffer.
    fn rms(pcm: &[u8]) -> f32 {
        if pcm.len() < BYTES_PER_SAMPLE {
            return 0.0;
        }
        let mut sum = 0.0f64;
        let mut count = 0usize;
        for chunk in pcm.chunks_exact(BYTES_PER_SAMPLE) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]) as f64 / i16::MAX as f64;
            sum += sample * sample;
            count += 1;
        }
        ((sum / count as f64).sqrt()) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud_frame() -> Vec<u8> {
        // Alternating +/- 8000: RMS well above any sensible threshold.
        let mut pcm = Vec::with_capacity(640);
        for i in 0..320 {
            let sample: i16 = if i % 2 == 0 { 8000 } else { -8000 };
            pcm.extend_from_slice(&sample.to_le_bytes());
        }
        pcm
    }

    fn quiet_frame() -> Vec<u8> {
        vec![0u8; 640]
    }

    fn vad() -> EnergyVad {
        EnergyVad::new(VadConfig {
            threshold: 0.05,
            min_speech_ms: 40,
            min_silence_ms: 60,
            frame_ms: 20,
        })
    }

    #[test]
    fn test_silence_stays_silent() {
        let mut vad = vad();
        for _ in 0..10 {
            let result = vad.process_frame(&quiet_frame());
            assert!(!result.is_speech);
            assert!(!result.speech_start);
        }
    }

    #[test]
    fn test_speech_start_requires_confirmation() {
        let mut vad = vad();
        // min_speech_ms 40 / frame 20 = 2 frames to confirm.
        let first = vad.process_frame(&loud_frame());
        assert!(!first.speech_start);

        let second = vad.process_frame(&loud_frame());
        assert!(second.speech_start);
        assert!(second.is_speech);
        assert!(vad.is_speaking());
    }

    #[test]
    fn test_single_noisy_frame_does_not_flap() {
        let mut vad = vad();
        vad.process_frame(&loud_frame());
        let result = vad.process_frame(&quiet_frame());
        assert!(!result.is_speech);
        assert!(!result.speech_end);
    }

    #[test]
    fn test_speech_end_after_confirmed_silence() {
        let mut vad = vad();
        vad.process_frame(&loud_frame());
        vad.process_frame(&loud_frame());
        assert!(vad.is_speaking());

        // min_silence_ms 60 / frame 20 = 3 frames to confirm.
        assert!(!vad.process_frame(&quiet_frame()).speech_end);
        assert!(!vad.process_frame(&quiet_frame()).speech_end);
        let ended = vad.process_frame(&quiet_frame());
        assert!(ended.speech_end);
        assert!(!vad.is_speaking());
    }

    #[test]
    fn test_reset_clears_state() {
        let mut vad = vad();
        vad.process_frame(&loud_frame());
        vad.process_frame(&loud_frame());
        vad.reset();
        assert!(!vad.is_speaking());
        // Needs full confirmation again.
        assert!(!vad.process_frame(&loud_frame()).speech_start);
    }

    #[test]
    fn test_rms_of_silence_is_zero() {
        let mut vad = vad();
        let result = vad.process_frame(&quiet_frame());
        assert_eq!(result.rms, 0.0);
    }
}
