//! Speaker output with a sample-accurate clock
//!
//! The output stream pulls from a [`Mixer`] that holds every scheduled
//! buffer with its start frame. The device clock is the number of frames
//! rendered so far divided by the device rate, so scheduling decisions made
//! by the controller line up exactly with what the speaker plays.
//!
//! Like capture, the `cpal::Stream` lives on a dedicated thread.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::level::SharedTap;
use super::playback::{BufferId, OutputDevice, PlaybackBuffer};
use super::AudioError;

/// One scheduled buffer inside the mixer
struct Voice {
    id: BufferId,
    start_frame: u64,
    samples: Arc<[f32]>,
    /// Source samples advanced per device frame
    step: f64,
    position: f64,
}

impl Voice {
    /// Next resampled value, or None once the buffer is exhausted
    fn next_sample(&mut self) -> Option<f32> {
        let index = self.position as usize;
        let current = *self.samples.get(index)?;
        let next = self.samples.get(index + 1).copied().unwrap_or(current);
        let frac = (self.position - index as f64) as f32;
        self.position += self.step;
        Some(current * (1.0 - frac) + next * frac)
    }
}

/// Mixes scheduled buffers into the device stream
pub struct Mixer {
    device_rate: u32,
    frames_rendered: u64,
    voices: Vec<Voice>,
    ended_tx: mpsc::UnboundedSender<BufferId>,
    /// Render scratch, reused across device callbacks
    mix: Vec<f32>,
    finished: Vec<BufferId>,
}

impl Mixer {
    pub fn new(device_rate: u32, ended_tx: mpsc::UnboundedSender<BufferId>) -> Self {
        Self {
            device_rate: device_rate.max(1),
            frames_rendered: 0,
            voices: Vec::new(),
            ended_tx,
            mix: Vec::new(),
            finished: Vec::new(),
        }
    }

    /// Seconds of audio rendered so far
    pub fn current_time(&self) -> f64 {
        self.frames_rendered as f64 / f64::from(self.device_rate)
    }

    pub fn schedule(&mut self, id: BufferId, buffer: PlaybackBuffer, start_at: f64) {
        let start_frame = (start_at.max(0.0) * f64::from(self.device_rate)).round() as u64;
        let step = f64::from(buffer.sample_rate) / f64::from(self.device_rate);
        self.voices.push(Voice {
            id,
            start_frame,
            samples: buffer.samples,
            step,
            position: 0.0,
        });
    }

    /// Remove a voice. Unknown ids are ignored.
    pub fn stop(&mut self, id: BufferId) {
        self.voices.retain(|v| v.id != id);
    }

    /// Render `frames` mono frames and advance the clock
    ///
    /// Buffers that play to their end are reported on the ended channel.
    /// The returned slice is only valid until the next call.
    pub fn render(&mut self, frames: usize) -> &[f32] {
        let first = self.frames_rendered;
        let mix = &mut self.mix;
        let finished = &mut self.finished;
        mix.clear();
        mix.resize(frames, 0.0);
        finished.clear();

        for voice in &mut self.voices {
            let offset = voice.start_frame.saturating_sub(first);
            if offset >= frames as u64 {
                continue;
            }
            let mut done = false;
            for slot in mix.iter_mut().skip(offset as usize) {
                match voice.next_sample() {
                    Some(v) => *slot += v,
                    None => {
                        done = true;
                        break;
                    }
                }
            }
            if done || voice.position as usize >= voice.samples.len() {
                finished.push(voice.id);
            }
        }

        if !finished.is_empty() {
            self.voices.retain(|v| !finished.contains(&v.id));
            for &id in finished.iter() {
                let _ = self.ended_tx.send(id);
            }
        }

        self.frames_rendered += frames as u64;
        for sample in mix.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
        mix
    }
}

type SharedMixer = Arc<Mutex<Mixer>>;

/// Default speaker output, implements [`OutputDevice`]
pub struct CpalOutput {
    mixer: SharedMixer,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalOutput {
    /// Open the default output device and start the clock
    ///
    /// Blocks until the stream is playing or has failed to start.
    pub fn start(
        tap: SharedTap,
        ended_tx: mpsc::UnboundedSender<BufferId>,
        faults: mpsc::UnboundedSender<String>,
    ) -> Result<Self, AudioError> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<SharedMixer, AudioError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || {
                let (stream, mixer) = match open_output_stream(tap, ended_tx, faults) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(mixer));

                let _ = stop_rx.recv();
                drop(stream);
                log::info!("Output: stream stopped");
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        let mixer = match ready_rx.recv() {
            Ok(Ok(mixer)) => mixer,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(AudioError::StreamCreationFailed(
                    "output thread exited during startup".to_string(),
                ));
            }
        };

        Ok(Self {
            mixer,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

impl OutputDevice for CpalOutput {
    fn current_time(&self) -> f64 {
        match self.mixer.lock() {
            Ok(mixer) => mixer.current_time(),
            Err(_) => 0.0,
        }
    }

    fn schedule(&mut self, id: BufferId, buffer: PlaybackBuffer, start_at: f64) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.schedule(id, buffer, start_at);
        }
    }

    fn stop(&mut self, id: BufferId) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.stop(id);
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Output: audio thread panicked");
            }
        }
    }
}

fn open_output_stream(
    tap: SharedTap,
    ended_tx: mpsc::UnboundedSender<BufferId>,
    faults: mpsc::UnboundedSender<String>,
) -> Result<(Stream, SharedMixer), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(AudioError::NoOutputDevice)?;

    log::info!("Using audio output device: {:?}", device.name());

    let supported_config = device
        .default_output_config()
        .map_err(|_| AudioError::NoSupportedConfig)?;

    log::info!(
        "Output config: {} Hz, {} channels, {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();
    let mixer = Arc::new(Mutex::new(Mixer::new(config.sample_rate.0, ended_tx)));

    let err_fn = move |err: cpal::StreamError| {
        log::error!("Output stream error: {}", err);
        let _ = faults.send(err.to_string());
    };

    let stream = match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, mixer.clone(), tap, err_fn),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, mixer.clone(), tap, err_fn),
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, mixer.clone(), tap, err_fn),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    stream
        .play()
        .map_err(|e| AudioError::StreamPlayFailed(e.to_string()))?;

    Ok((stream, mixer))
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mixer: SharedMixer,
    tap: SharedTap,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<Stream, AudioError>
where
    T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let channels = usize::from(config.channels.max(1));

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                let Ok(mut mixer) = mixer.lock() else {
                    data.fill(T::from_sample(0.0f32));
                    return;
                };
                let mix = mixer.render(frames);

                if let Ok(mut tap) = tap.lock() {
                    tap.push_samples(mix);
                }

                for (frame, &value) in data.chunks_mut(channels).zip(mix) {
                    for slot in frame {
                        *slot = T::from_sample(value);
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(samples: Vec<f32>, sample_rate: u32) -> PlaybackBuffer {
        PlaybackBuffer {
            samples: samples.into(),
            sample_rate,
        }
    }

    #[test]
    fn test_clock_advances_with_rendered_frames() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(48000, tx);
        assert_eq!(mixer.current_time(), 0.0);
        mixer.render(24000);
        assert!((mixer.current_time() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_buffer_starts_at_scheduled_frame() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(10, tx);
        mixer.schedule(0, buffer(vec![0.5; 4], 10), 0.3);

        let out = mixer.render(10);
        assert_eq!(&out[..3], &[0.0, 0.0, 0.0]);
        assert_eq!(&out[3..7], &[0.5, 0.5, 0.5, 0.5]);
        assert_eq!(&out[7..], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_finished_buffer_is_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(48000, tx);
        mixer.schedule(7, buffer(vec![0.1; 240], 24000), 0.0);

        mixer.render(256);
        assert!(rx.try_recv().is_err());

        mixer.render(256);
        assert_eq!(rx.try_recv().unwrap(), 7);

        mixer.render(256);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_render_reuses_its_buffer() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(48000, tx);
        mixer.schedule(0, buffer(vec![0.3; 100], 48000), 0.0);

        let first = mixer.render(512).as_ptr();
        let second = mixer.render(256);
        assert_eq!(second.len(), 256);
        assert!(second.iter().all(|&s| s == 0.0));
        assert_eq!(second.as_ptr(), first);
        assert_eq!(mixer.render(512).as_ptr(), first);
    }

    #[test]
    fn test_upsampling_doubles_length() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(48000, tx);
        mixer.schedule(0, buffer(vec![0.2; 100], 24000), 0.0);

        let out = mixer.render(300);
        let audible = out.iter().filter(|&&s| s != 0.0).count();
        assert_eq!(audible, 200);
    }

    #[test]
    fn test_back_to_back_buffers_have_no_gap() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(100, tx);
        mixer.schedule(0, buffer(vec![0.25; 10], 100), 0.0);
        mixer.schedule(1, buffer(vec![0.5; 10], 100), 0.1);

        let out = mixer.render(20);
        assert!(out[..10].iter().all(|&s| s == 0.25));
        assert!(out[10..].iter().all(|&s| s == 0.5));
    }

    #[test]
    fn test_stop_silences_and_does_not_report() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(100, tx);
        mixer.schedule(3, buffer(vec![0.5; 50], 100), 0.0);
        mixer.render(10);

        mixer.stop(3);
        mixer.stop(3);
        let out = mixer.render(10);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_mix_is_clamped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(100, tx);
        mixer.schedule(0, buffer(vec![0.8; 5], 100), 0.0);
        mixer.schedule(1, buffer(vec![0.8; 5], 100), 0.0);
        let out = mixer.render(5);
        assert!(out.iter().all(|&s| s == 1.0));
    }
}
