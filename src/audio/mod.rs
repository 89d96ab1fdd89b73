//! Audio pipeline for live conversations
//!
//! This module handles microphone capture, speaker output, PCM conversion,
//! playback scheduling and level metering. Uses CPAL for device I/O.

pub mod capture;
pub mod chunk;
pub mod level;
pub mod output;
pub mod pcm;
pub mod playback;

use tokio::sync::mpsc;

use crate::error::SessionError;
use capture::CaptureHandle;
use level::SharedTap;
use output::CpalOutput;
use playback::{BufferId, OutputDevice};

/// Captured frames buffered between the audio thread and the controller
const FRAME_QUEUE: usize = 64;

/// Errors that can occur while acquiring audio devices.
#[derive(Debug, Clone)]
pub enum AudioError {
    NoInputDevice,
    NoOutputDevice,
    NoSupportedConfig,
    StreamCreationFailed(String),
    StreamPlayFailed(String),
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoInputDevice => write!(f, "No audio input device found"),
            AudioError::NoOutputDevice => write!(f, "No audio output device found"),
            AudioError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            AudioError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
            AudioError::StreamPlayFailed(e) => write!(f, "Failed to start audio stream: {}", e),
        }
    }
}

impl std::error::Error for AudioError {}

impl From<AudioError> for SessionError {
    fn from(err: AudioError) -> Self {
        SessionError::Permission(err.to_string())
    }
}

/// A running microphone stream. Dropping it releases the device.
pub trait CaptureStream: Send {
    /// Native rate of the frames delivered on [`AudioStreams::frames`]
    fn sample_rate(&self) -> u32;
}

/// Everything a session holds while its audio devices are open
pub struct AudioStreams {
    pub capture: Box<dyn CaptureStream>,
    pub output: Box<dyn OutputDevice>,
    /// Mono f32 frames from the microphone, in capture order
    pub frames: mpsc::Receiver<Vec<f32>>,
    /// Hands spent frame buffers back to the capture callback, if it pools them
    pub recycle: Option<mpsc::Sender<Vec<f32>>>,
    /// Buffers that finished playing naturally
    pub ended: mpsc::UnboundedReceiver<BufferId>,
    /// Stream errors reported after start (device unplugged, etc.)
    pub faults: mpsc::UnboundedReceiver<String>,
}

/// Acquires microphone and speaker for one session
///
/// Implemented by [`CpalBackend`] and by test fakes.
pub trait AudioBackend: Send {
    fn acquire(
        &mut self,
        input_tap: SharedTap,
        output_tap: SharedTap,
    ) -> Result<AudioStreams, AudioError>;
}

/// Default host devices via CPAL
#[derive(Debug, Clone, Default)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn acquire(
        &mut self,
        input_tap: SharedTap,
        output_tap: SharedTap,
    ) -> Result<AudioStreams, AudioError> {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE);
        let (recycle_tx, recycle_rx) = mpsc::channel(FRAME_QUEUE);
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();

        let capture = CaptureHandle::start(frames_tx, recycle_rx, input_tap, faults_tx.clone())?;

        // An output failure drops `capture` on return, releasing the microphone
        let output = CpalOutput::start(output_tap, ended_tx, faults_tx)?;

        Ok(AudioStreams {
            capture: Box::new(capture),
            output: Box::new(output),
            frames: frames_rx,
            recycle: Some(recycle_tx),
            ended: ended_rx,
            faults: faults_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_error_maps_to_permission() {
        let err: SessionError = AudioError::NoInputDevice.into();
        assert!(matches!(err, SessionError::Permission(ref m) if m.contains("input device")));
    }
}
