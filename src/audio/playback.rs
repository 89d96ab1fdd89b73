//! Gapless, interruptible playback of the agent's streamed audio
//!
//! Inbound chunks are scheduled back-to-back on the output device clock:
//!
//! ```text
//! start_at  = max(next_start, device.current_time())
//! next_start = start_at + chunk.duration
//! ```
//!
//! Chunks that arrive in a burst queue up behind each other; a chunk that
//! arrives after the queue has drained starts immediately. Barge-in stops
//! every buffer that has not finished yet and rewinds the cursor to "now".
//!
//! Ordering is the channel's job. Chunks are played in the order they are
//! enqueued.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::chunk::AudioChunk;
use super::pcm::i16_to_f32;

/// Identity of one scheduled buffer on the output device
pub type BufferId = u64;

/// Decoded mono samples ready to be handed to the output device
#[derive(Debug, Clone)]
pub struct PlaybackBuffer {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
}

impl PlaybackBuffer {
    /// Convert a PCM16 chunk into float samples
    pub fn from_chunk(chunk: &AudioChunk) -> Self {
        let samples: Vec<f32> = chunk.samples.iter().map(|&s| i16_to_f32(s)).collect();
        Self {
            samples: samples.into(),
            sample_rate: chunk.sample_rate,
        }
    }

    /// Duration in seconds of the output clock
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }
}

/// Audio sink with a monotonic clock
///
/// Implemented by the cpal output stream and by test fakes.
pub trait OutputDevice: Send {
    /// Current time of the output clock in seconds
    fn current_time(&self) -> f64;

    /// Start `buffer` at `start_at` seconds on the output clock
    fn schedule(&mut self, id: BufferId, buffer: PlaybackBuffer, start_at: f64);

    /// Stop a scheduled buffer. Stopping a finished buffer does nothing.
    fn stop(&mut self, id: BufferId);
}

/// Bookkeeping for a buffer that has been scheduled but not finished
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub start_at: f64,
    pub duration: f64,
}

/// Schedules inbound audio for gapless playback
pub struct PlaybackScheduler {
    device: Box<dyn OutputDevice>,
    next_start: f64,
    in_flight: BTreeMap<BufferId, ScheduledBuffer>,
    next_id: BufferId,
    /// Count of buffers scheduled (for logging)
    buffers_scheduled: u64,
}

impl PlaybackScheduler {
    pub fn new(device: Box<dyn OutputDevice>) -> Self {
        let next_start = device.current_time();
        Self {
            device,
            next_start,
            in_flight: BTreeMap::new(),
            next_id: 0,
            buffers_scheduled: 0,
        }
    }

    /// Align the cursor with the output clock (session just opened)
    pub fn start_clock(&mut self) {
        self.next_start = self.device.current_time();
        log::debug!("PlaybackScheduler: clock started at {:.3}s", self.next_start);
    }

    /// Schedule a chunk right after everything already queued
    ///
    /// Returns the output-clock time at which the chunk starts.
    pub fn enqueue(&mut self, chunk: &AudioChunk) -> f64 {
        let buffer = PlaybackBuffer::from_chunk(chunk);
        let duration = buffer.duration_secs();

        let start_at = self.next_start.max(self.device.current_time());
        let id = self.next_id;
        self.next_id += 1;

        self.device.schedule(id, buffer, start_at);
        self.next_start = start_at + duration;
        self.in_flight
            .insert(id, ScheduledBuffer { start_at, duration });

        self.buffers_scheduled += 1;
        if self.buffers_scheduled % 50 == 0 {
            log::debug!(
                "PlaybackScheduler: {} buffers scheduled, {} in flight, queued until {:.3}s",
                self.buffers_scheduled,
                self.in_flight.len(),
                self.next_start
            );
        }

        start_at
    }

    /// A buffer played to its end
    pub fn on_buffer_ended(&mut self, id: BufferId) {
        self.in_flight.remove(&id);
    }

    /// Stop all pending audio immediately (barge-in)
    pub fn interrupt(&mut self) {
        let pending = std::mem::take(&mut self.in_flight);
        for id in pending.keys() {
            self.device.stop(*id);
        }
        self.next_start = self.device.current_time();

        if !pending.is_empty() {
            log::info!(
                "PlaybackScheduler: interrupted, stopped {} buffer(s)",
                pending.len()
            );
        }
    }

    /// Drop every scheduled buffer before the session goes away
    pub fn reset(&mut self) {
        self.interrupt();
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }
}
