//! Jitter buffer for synthesized speech arriving in bursts.
//!
//! Two phases: nothing is emitted until a minimum buffered duration has
//! accumulated (prebuffer), then a steady drain pops one frame per tick.
//! Overflow mirrors the uplink queue: drop-oldest beyond the maximum
//! buffered duration, because a growing backlog here means the assistant
//! sounds like it is lagging. Correctness favors recency.

use std::collections::VecDeque;

use tracing::{debug, trace};

use super::AudioFrame;

/// Default prebuffer depth in milliseconds before playout starts.
pub const DEFAULT_PREBUFFER_MS: u64 = 120;

/// Default maximum buffered duration in milliseconds.
pub const DEFAULT_MAX_BUFFERED_MS: u64 = 800;

/// Bounded drop-oldest buffer with a prebuffer phase.
#[derive(Debug)]
pub struct JitterBuffer {
    frames: VecDeque<AudioFrame>,
    max_frames: usize,
    prebuffer_frames: usize,
    prebuffering: bool,
    dropped: u64,
}

impl JitterBuffer {
    pub fn new(max_frames: usize, prebuffer_frames: usize) -> Self {
        assert!(max_frames > 0, "jitter buffer capacity must be positive");
        Self {
            frames: VecDeque::with_capacity(max_frames),
            max_frames,
            prebuffer_frames: prebuffer_frames.min(max_frames),
            prebuffering: true,
            dropped: 0,
        }
    }

    /// Size the buffer from durations: `max_buffered_ms` capacity and
    /// `prebuffer_ms` playout threshold at `frame_ms` per frame.
    pub fn with_duration(max_buffered_ms: u64, prebuffer_ms: u64, frame_ms: u64) -> Self {
        Self::new(
            (max_buffered_ms / frame_ms).max(1) as usize,
            (prebuffer_ms / frame_ms).max(1) as usize,
        )
    }

    /// Enqueue a received frame, evicting the oldest beyond capacity.
    ///
    /// Returns `false` when an eviction happened.
    pub fn push(&mut self, frame: AudioFrame) -> bool {
        let mut admitted_cleanly = true;
        if self.frames.len() == self.max_frames {
            self.frames.pop_front();
            self.dropped += 1;
            admitted_cleanly = false;
            trace!(dropped = self.dropped, "jitter buffer full, dropped oldest frame");
        }
        self.frames.push_back(frame);

        if self.prebuffering && self.frames.len() >= self.prebuffer_frames {
            debug!(buffered = self.frames.len(), "prebuffer satisfied, starting playout");
            self.prebuffering = false;
        }
        admitted_cleanly
    }

    /// Pop the next frame for playout. Returns `None` while prebuffering or
    /// when empty.
    pub fn pop(&mut self) -> Option<AudioFrame> {
        if self.prebuffering {
            return None;
        }
        self.frames.pop_front()
    }

    /// Drop everything and re-enter the prebuffer phase. This is the
    /// barge-in / finalization path and must be cheap and synchronous.
    pub fn clear(&mut self) {
        self.frames.clear();
        self.prebuffering = true;
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Whether playout has not started yet for the current cycle.
    pub fn is_prebuffering(&self) -> bool {
        self.prebuffering
    }

    /// Total frames evicted since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
