//! Microphone capture and the outbound encoding pipeline
//!
//! Bridges the CPAL audio callback (sync) to the session controller (async).
//!
//! ```text
//! Audio Thread (sync)               Controller (async)
//! ┌──────────────────┐              ┌──────────────────────────┐
//! │ CPAL Callback    │──channel──▶  │ CaptureEncoder::push()   │
//! │ mono f32 + tap   │              │   ├─ resample to 16kHz   │
//! │ try_send(frame)  │              │   ├─ chunk (256ms)       │
//! │                  │◀──recycle──  │   └─ PCM16 → base64 → WS │
//! └──────────────────┘              └──────────────────────────┘
//! ```
//!
//! Spent frame buffers come back on the recycle channel so the callback
//! stops allocating once the pool is warm.
//!
//! `cpal::Stream` is not `Send`, so the stream lives on a dedicated thread
//! for as long as the [`CaptureHandle`] exists.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::level::SharedTap;
use super::pcm::OUTBOUND_SAMPLE_RATE;
use super::{AudioError, CaptureStream};

/// Sender half used by the capture callback
pub type FrameSender = mpsc::Sender<Vec<f32>>;

/// Spent frame buffers on their way back to the capture callback
pub type SpentFrames = mpsc::Receiver<Vec<f32>>;

/// Handle to a running microphone stream.
/// When dropped, the stream is stopped and the device released.
pub struct CaptureHandle {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    sample_rate: u32,
}

impl CaptureHandle {
    /// Open the default input device and start streaming mono frames
    ///
    /// Blocks until the stream is playing or has failed to start.
    pub fn start(
        frames: FrameSender,
        spent: SpentFrames,
        tap: SharedTap,
        faults: mpsc::UnboundedSender<String>,
    ) -> Result<Self, AudioError> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32, AudioError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                let stream = match open_input_stream(frames, spent, tap, faults) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Park until the handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
                log::info!("Capture: stream stopped");
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        let sample_rate = match ready_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(AudioError::StreamCreationFailed(
                    "capture thread exited during startup".to_string(),
                ));
            }
        };

        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
            sample_rate,
        })
    }
}

impl CaptureStream for CaptureHandle {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Capture: audio thread panicked");
            }
        }
    }
}

fn open_input_stream(
    frames: FrameSender,
    spent: SpentFrames,
    tap: SharedTap,
    faults: mpsc::UnboundedSender<String>,
) -> Result<(Stream, u32), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(AudioError::NoInputDevice)?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported_config = device
        .default_input_config()
        .map_err(|_| AudioError::NoSupportedConfig)?;

    log::info!(
        "Capture config: {} Hz, {} channels, {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();
    let sample_rate = config.sample_rate.0;

    let err_fn = move |err: cpal::StreamError| {
        log::error!("Capture stream error: {}", err);
        let _ = faults.send(err.to_string());
    };

    let stream = match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, frames, spent, tap, err_fn),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, frames, spent, tap, err_fn),
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, frames, spent, tap, err_fn),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    stream
        .play()
        .map_err(|e| AudioError::StreamPlayFailed(e.to_string()))?;

    log::info!("Capture: started at {} Hz", sample_rate);
    Ok((stream, sample_rate))
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    frames: FrameSender,
    mut spent: SpentFrames,
    tap: SharedTap,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<Stream, AudioError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));
    let mut dropped: u64 = 0;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mut mono = spent.try_recv().unwrap_or_default();
                fold_to_mono(data, channels, &mut mono);

                if let Ok(mut tap) = tap.lock() {
                    tap.push_samples(&mono);
                }

                // Never block the audio thread
                match frames.try_send(mono) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        dropped += 1;
                        if dropped % 50 == 1 {
                            log::warn!("Capture: queue full, {} frame(s) dropped", dropped);
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}

/// Average interleaved frames down to one channel, replacing `out`
fn fold_to_mono<T>(data: &[T], channels: usize, out: &mut Vec<f32>)
where
    T: cpal::Sample,
    f32: cpal::FromSample<T>,
{
    out.clear();
    if channels <= 1 {
        out.extend(data.iter().map(|&s| sample_to_f32(s)));
        return;
    }
    out.extend(
        data.chunks(channels)
            .map(|frame| frame.iter().map(|&s| sample_to_f32(s)).sum::<f32>() / frame.len() as f32),
    );
}

/// Convert any sample type to f32 in [-1, 1].
fn sample_to_f32<T>(sample: T) -> f32
where
    T: cpal::Sample,
    f32: cpal::FromSample<T>,
{
    let f32_sample = <f32 as cpal::Sample>::from_sample(sample);
    f32_sample.clamp(-1.0, 1.0)
}

/// Streaming linear-interpolation resampler
///
/// Keeps the last input sample between calls so interpolation is
/// continuous across frame boundaries.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    source_rate: u32,
    target_rate: u32,
    /// Input samples advanced per output sample
    step: f64,
    /// Read position relative to `last` (index 0)
    position: f64,
    last: Option<f32>,
}

impl LinearResampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Self {
        let step = if source_rate == 0 || target_rate == 0 {
            log::warn!(
                "Invalid sample rate (source: {}, target: {}), passing through",
                source_rate,
                target_rate
            );
            1.0
        } else {
            f64::from(source_rate) / f64::from(target_rate)
        };
        Self {
            source_rate,
            target_rate,
            step,
            position: 0.0,
            last: None,
        }
    }

    fn is_passthrough(&self) -> bool {
        self.source_rate == self.target_rate || self.source_rate == 0 || self.target_rate == 0
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.is_passthrough() {
            return input.to_vec();
        }

        let mut buf = Vec::with_capacity(input.len() + 1);
        if let Some(last) = self.last {
            buf.push(last);
        }
        buf.extend_from_slice(input);

        let Some(&tail) = buf.last() else {
            return Vec::new();
        };

        let end = (buf.len() - 1) as f64;
        let mut out = Vec::with_capacity((input.len() as f64 / self.step) as usize + 1);
        while self.position < end {
            let index = self.position as usize;
            let frac = (self.position - index as f64) as f32;
            out.push(buf[index] * (1.0 - frac) + buf[index + 1] * frac);
            self.position += self.step;
        }

        // Re-anchor on the last sample for the next call
        self.position -= end;
        self.last = Some(tail);
        out
    }

}

/// Configuration for the capture encoder
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Sample rate from CPAL (typically 44100 or 48000)
    pub source_sample_rate: u32,
    /// Rate expected by the live endpoint (16000)
    pub target_sample_rate: u32,
    /// Chunk duration in milliseconds
    pub chunk_duration_ms: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            source_sample_rate: 48000,
            target_sample_rate: OUTBOUND_SAMPLE_RATE,
            chunk_duration_ms: 256,
        }
    }
}

impl EncoderConfig {
    /// Calculate samples per chunk at target sample rate
    pub fn samples_per_chunk(&self) -> usize {
        let samples = u64::from(self.target_sample_rate) * u64::from(self.chunk_duration_ms) / 1000;
        (samples as usize).max(1)
    }
}

/// Turns captured microphone frames into fixed-size 16 kHz chunks
///
/// Chunks come out in capture order.
pub struct CaptureEncoder {
    resampler: LinearResampler,
    /// Accumulator for building chunks
    buffer: Vec<f32>,
    samples_per_chunk: usize,
    /// Count of chunks produced (for logging)
    chunks_encoded: u64,
}

impl CaptureEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        let samples_per_chunk = config.samples_per_chunk();
        log::info!(
            "CaptureEncoder: initialized ({}Hz → {}Hz, {}ms chunks = {} samples)",
            config.source_sample_rate,
            config.target_sample_rate,
            config.chunk_duration_ms,
            samples_per_chunk
        );

        Self {
            resampler: LinearResampler::new(config.source_sample_rate, config.target_sample_rate),
            buffer: Vec::with_capacity(samples_per_chunk * 2),
            samples_per_chunk,
            chunks_encoded: 0,
        }
    }

    /// Add one captured frame, returning every chunk it completed
    pub fn push(&mut self, frame: &[f32]) -> Vec<Vec<f32>> {
        let resampled = self.resampler.process(frame);
        self.buffer.extend(resampled);

        let mut chunks = Vec::new();
        while self.buffer.len() >= self.samples_per_chunk {
            let chunk: Vec<f32> = self.buffer.drain(..self.samples_per_chunk).collect();
            chunks.push(chunk);
            self.chunks_encoded += 1;

            // Periodic logging (every 50 chunks)
            if self.chunks_encoded % 50 == 0 {
                log::debug!("CaptureEncoder: {} chunks encoded", self.chunks_encoded);
            }
        }
        chunks
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn samples_per_chunk(&self) -> usize {
        self.samples_per_chunk
    }

    pub fn chunks_encoded(&self) -> u64 {
        self.chunks_encoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_to_f32() {
        assert_eq!(sample_to_f32(0.0f32), 0.0);
        assert_eq!(sample_to_f32(2.0f32), 1.0);
        assert_eq!(sample_to_f32(-2.0f32), -1.0);
        assert!((sample_to_f32(i16::MAX) - 1.0).abs() < 1e-4);
        assert!(sample_to_f32(0u16) <= -0.99);
    }

    #[test]
    fn test_fold_to_mono() {
        let stereo = [0.5f32, -0.5, 1.0, 0.0];
        let mut out = Vec::new();
        fold_to_mono(&stereo, 2, &mut out);
        assert_eq!(out, vec![0.0, 0.5]);
        fold_to_mono(&stereo, 1, &mut out);
        assert_eq!(out, stereo.to_vec());
    }

    #[test]
    fn test_fold_to_mono_reuses_buffer() {
        let mut out = Vec::with_capacity(512);
        let ptr = out.as_ptr();
        fold_to_mono(&[0.25f32; 1024], 2, &mut out);
        assert_eq!(out.len(), 512);
        assert_eq!(out.as_ptr(), ptr);

        fold_to_mono(&[0.5f32; 256], 1, &mut out);
        assert_eq!(out.len(), 256);
        assert_eq!(out.as_ptr(), ptr);
    }

    #[test]
    fn test_samples_per_chunk() {
        let config = EncoderConfig::default();
        assert_eq!(config.samples_per_chunk(), 4096);

        let config = EncoderConfig {
            chunk_duration_ms: 100,
            ..Default::default()
        };
        assert_eq!(config.samples_per_chunk(), 1600);
    }

    #[test]
    fn test_resampler_passthrough() {
        let mut resampler = LinearResampler::new(16000, 16000);
        assert_eq!(resampler.process(&[0.1, 0.2, 0.3]), vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_resampler_ratio() {
        let mut resampler = LinearResampler::new(48000, 16000);
        let out = resampler.process(&vec![0.25; 4800]);
        assert_eq!(out.len(), 1600);
        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_resampler_is_continuous_across_calls() {
        let ramp: Vec<f32> = (0..960).map(|i| i as f32 / 960.0).collect();

        let mut whole = LinearResampler::new(44100, 16000);
        let expected = whole.process(&ramp);

        let mut split = LinearResampler::new(44100, 16000);
        let mut actual = Vec::new();
        for part in ramp.chunks(97) {
            actual.extend(split.process(part));
        }

        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(&expected) {
            assert!((a - e).abs() < 1e-5);
        }
    }

    #[test]
    fn test_encoder_emits_fixed_chunks_in_order() {
        let mut encoder = CaptureEncoder::new(EncoderConfig {
            source_sample_rate: 16000,
            target_sample_rate: 16000,
            chunk_duration_ms: 256,
        });

        // 4096 samples of 0.0, then 4096 of 0.5, delivered in odd-sized frames
        let mut signal = vec![0.0f32; 4096];
        signal.extend(vec![0.5f32; 4096]);
        signal.extend(vec![0.9f32; 100]);

        let mut chunks = Vec::new();
        for frame in signal.chunks(1000) {
            chunks.extend(encoder.push(frame));
        }

        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == 4096));
        assert!(chunks[0].iter().all(|&s| s == 0.0));
        assert!(chunks[1].iter().all(|&s| s == 0.5));
        assert_eq!(encoder.buffered(), 100);
        assert_eq!(encoder.chunks_encoded(), 2);
    }

    #[test]
    fn test_encoder_resamples_to_target_rate() {
        let mut encoder = CaptureEncoder::new(EncoderConfig::default());
        let mut chunks = Vec::new();
        // One second at 48kHz
        for _ in 0..10 {
            chunks.extend(encoder.push(&[0.1f32; 4800]));
        }
        // 16000 samples = 3 full chunks of 4096 + remainder
        assert_eq!(chunks.len(), 3);
        assert_eq!(encoder.buffered(), 16000 - 3 * 4096);
    }

    #[test]
    #[ignore] // Requires microphone hardware
    fn test_capture_handle_start_stop() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let (frames_tx, _frames_rx) = mpsc::channel(8);
        let (_spent_tx, spent_rx) = mpsc::channel(8);
        let (faults_tx, _faults_rx) = mpsc::unbounded_channel();
        let handle = CaptureHandle::start(
            frames_tx,
            spent_rx,
            crate::audio::level::AnalyserTap::shared(),
            faults_tx,
        )
        .unwrap();
        assert!(handle.sample_rate() > 0);
        drop(handle);
    }
}
