//! Loudness metering for the input and output visualizers
//!
//! Each direction owns an [`AnalyserTap`] that the audio callback feeds with
//! the most recent samples. On every render tick the controller asks each
//! [`LevelMeter`] for the mean of the tap's frequency bins and smooths the
//! resulting [`VolumeSample`] with an EMA. While no session is active the
//! meters report a resting level instead of zero.

use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

/// Samples analysed per snapshot
pub const FFT_SIZE: usize = 32;

/// Magnitude bins per snapshot (half the transform size)
pub const BIN_COUNT: usize = FFT_SIZE / 2;

/// Level reported while the session is inactive
pub const DEFAULT_RESTING_LEVEL: f32 = 4.0;

/// Decibel range mapped onto 0..=255
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

/// EMA smoothing factor (0.3 = 30% new value, 70% previous)
const EMA_ALPHA: f32 = 0.3;

/// Analysis tap shared between an audio callback and the meter
pub type SharedTap = Arc<Mutex<AnalyserTap>>;

/// Pair of levels published on every render tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VolumeSample {
    pub input: f32,
    pub output: f32,
}

impl VolumeSample {
    pub fn resting(level: f32) -> Self {
        Self {
            input: level,
            output: level,
        }
    }
}

impl Default for VolumeSample {
    fn default() -> Self {
        Self::resting(DEFAULT_RESTING_LEVEL)
    }
}

/// Sliding window over the latest samples of one audio direction
#[derive(Debug)]
pub struct AnalyserTap {
    samples: VecDeque<f32>,
}

impl AnalyserTap {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::from(vec![0.0; FFT_SIZE]),
        }
    }

    /// Create a tap ready to be shared with an audio callback
    pub fn shared() -> SharedTap {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Append samples, keeping only the newest `FFT_SIZE`
    pub fn push_samples(&mut self, samples: &[f32]) {
        let len = samples.len();
        if len >= FFT_SIZE {
            self.samples.clear();
            self.samples.extend(&samples[len - FFT_SIZE..]);
            return;
        }

        self.samples.drain(0..len);
        self.samples.extend(samples);
    }

    /// Forget everything heard so far
    pub fn clear(&mut self) {
        self.samples.iter_mut().for_each(|s| *s = 0.0);
    }

    /// Byte magnitude spectrum of the current window
    ///
    /// Blackman-windowed DFT, magnitudes in dB scaled so that
    /// `MIN_DECIBELS` maps to 0 and `MAX_DECIBELS` maps to 255.
    pub fn frequency_bins(&self) -> [u8; BIN_COUNT] {
        let n = FFT_SIZE as f32;
        let windowed: Vec<f32> = self
            .samples
            .iter()
            .enumerate()
            .map(|(i, &s)| {
                let x = i as f32 / n;
                let w = 0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos();
                s * w
            })
            .collect();

        let mut bins = [0u8; BIN_COUNT];
        for (k, bin) in bins.iter_mut().enumerate() {
            let (mut re, mut im) = (0.0f32, 0.0f32);
            for (i, &s) in windowed.iter().enumerate() {
                let angle = 2.0 * PI * k as f32 * i as f32 / n;
                re += s * angle.cos();
                im -= s * angle.sin();
            }

            let magnitude = (re * re + im * im).sqrt() / n;
            if magnitude <= 0.0 {
                continue;
            }

            let db = 20.0 * magnitude.log10();
            let scaled = 255.0 * (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS);
            *bin = scaled.clamp(0.0, 255.0) as u8;
        }

        bins
    }
}

impl Default for AnalyserTap {
    fn default() -> Self {
        Self::new()
    }
}

/// Instantaneous level of one direction
#[derive(Debug, Clone)]
pub struct LevelMeter {
    tap: SharedTap,
}

impl LevelMeter {
    pub fn new(tap: SharedTap) -> Self {
        Self { tap }
    }

    /// Arithmetic mean of the tap's frequency bins
    pub fn level(&self) -> f32 {
        let bins = match self.tap.lock() {
            Ok(tap) => tap.frequency_bins(),
            Err(_) => return 0.0,
        };
        bins.iter().map(|&b| b as f32).sum::<f32>() / BIN_COUNT as f32
    }

    pub fn tap(&self) -> &SharedTap {
        &self.tap
    }
}

/// Smooths successive volume pairs so the visualizer never jumps
#[derive(Debug, Clone)]
pub struct VolumeSmoother {
    resting_level: f32,
    current: Option<VolumeSample>,
}

impl VolumeSmoother {
    pub fn new(resting_level: f32) -> Self {
        Self {
            resting_level,
            current: None,
        }
    }

    /// Blend the target sample into the running value.
    ///
    /// `target` of `None` means the session is inactive and the meter
    /// decays toward the resting level.
    pub fn apply(&mut self, target: Option<VolumeSample>) -> VolumeSample {
        let target = target.unwrap_or_else(|| VolumeSample::resting(self.resting_level));

        let next = match self.current {
            None => target,
            Some(prev) => VolumeSample {
                input: EMA_ALPHA * target.input + (1.0 - EMA_ALPHA) * prev.input,
                output: EMA_ALPHA * target.output + (1.0 - EMA_ALPHA) * prev.output,
            },
        };

        self.current = Some(next);
        next
    }
}

/// Interval between render ticks for the given frame rate
pub fn frame_interval(fps: u32) -> Duration {
    Duration::from_micros(1_000_000 / u64::from(fps.max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| (i as f32 * 2.0 * PI * 4.0 / FFT_SIZE as f32).sin() * amplitude)
            .collect()
    }

    #[test]
    fn test_silence_reads_zero() {
        let meter = LevelMeter::new(AnalyserTap::shared());
        assert_eq!(meter.level(), 0.0);
    }

    #[test]
    fn test_tone_raises_level() {
        let tap = AnalyserTap::shared();
        tap.lock().unwrap().push_samples(&tone(256, 0.8));

        let meter = LevelMeter::new(tap.clone());
        let loud = meter.level();
        assert!(loud > 0.0, "expected non-zero level for a tone");
        assert!(loud <= 255.0);

        tap.lock().unwrap().push_samples(&tone(256, 0.01));
        assert!(meter.level() < loud);
    }

    #[test]
    fn test_tap_keeps_latest_window() {
        let mut tap = AnalyserTap::new();
        tap.push_samples(&[0.5; 10]);
        assert_eq!(tap.samples.len(), FFT_SIZE);
        assert_eq!(tap.samples.back(), Some(&0.5));
        assert_eq!(tap.samples.front(), Some(&0.0));

        tap.push_samples(&[0.25; 100]);
        assert_eq!(tap.samples.len(), FFT_SIZE);
        assert!(tap.samples.iter().all(|&s| s == 0.25));

        tap.clear();
        assert!(tap.frequency_bins().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_meters_are_independent() {
        let input = LevelMeter::new(AnalyserTap::shared());
        let output = LevelMeter::new(AnalyserTap::shared());
        output.tap().lock().unwrap().push_samples(&tone(64, 0.9));

        assert_eq!(input.level(), 0.0);
        assert!(output.level() > 0.0);
    }

    #[test]
    fn test_inactive_decays_to_resting() {
        let mut smoother = VolumeSmoother::new(DEFAULT_RESTING_LEVEL);

        let first = smoother.apply(Some(VolumeSample {
            input: 100.0,
            output: 50.0,
        }));
        assert_eq!(first.input, 100.0, "first frame should be unchanged");

        let mut sample = first;
        for _ in 0..100 {
            sample = smoother.apply(None);
        }
        assert!((sample.input - DEFAULT_RESTING_LEVEL).abs() < 0.01);
        assert!((sample.output - DEFAULT_RESTING_LEVEL).abs() < 0.01);
        assert!(sample.input > 0.0);
    }

    #[test]
    fn test_ema_blend() {
        let mut smoother = VolumeSmoother::new(0.0);
        smoother.apply(Some(VolumeSample::resting(10.0)));
        let next = smoother.apply(Some(VolumeSample::resting(20.0)));

        let expected = EMA_ALPHA * 20.0 + (1.0 - EMA_ALPHA) * 10.0;
        assert!((next.input - expected).abs() < 0.001);
    }

    #[test]
    fn test_frame_interval() {
        assert_eq!(frame_interval(60), Duration::from_micros(16_666));
        assert_eq!(frame_interval(0), Duration::from_secs(1));
    }
}
