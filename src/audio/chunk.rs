//! Immutable unit of PCM audio passed between pipeline stages

use std::time::Duration;

/// A chunk of PCM16 samples with its format
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Interleaved PCM16 samples (mono for both directions)
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count
    pub channels: u16,
    /// Sequence number for ordering (monotonically increasing per direction)
    pub sequence: u64,
}

impl AudioChunk {
    /// Create a mono chunk
    pub fn mono(samples: Vec<i16>, sample_rate: u32, sequence: u64) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
            sequence,
        }
    }

    /// Number of frames (samples per channel)
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }

    /// Playback duration in seconds
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / f64::from(self.sample_rate)
    }

    /// Playback duration
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs())
    }
}
