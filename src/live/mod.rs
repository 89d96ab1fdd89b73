//! Live conversation channel to the remote voice agent
//!
//! This module provides the WebSocket client for the bidirectional live
//! endpoint: microphone audio goes out, agent audio and transcripts come in.
//!
//! # Architecture
//!
//! ```text
//! SessionController ──send_audio()──▶ outbound queue ──▶ writer ─┐
//!                                                               │ WebSocket
//! SessionController ◀──ChannelEvent── events queue ◀── reader ◀─┘
//! ```
//!
//! # Failure Strategy
//!
//! - Initial connection retries 3 times with exponential backoff
//! - Mid-session failures are reported and followed by `Closed`; no reconnection
//! - Sends never block; a full or closed queue drops the frame

mod client;
mod protocol;

pub use client::{ChannelConnector, LiveConnector, LiveSession, LiveTransport, OpenRequest};
pub use protocol::{ClientMessage, ServerMessage, SetupConfig, LIVE_API_URL};

/// Content of one inbound `message` event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundContent {
    /// Base64 PCM16 24kHz mono payloads, in arrival order
    pub audio: Vec<String>,
    /// The learner started speaking over the agent
    pub interrupted: bool,
    /// Partial speech-to-text of the learner
    pub input_text: Option<String>,
    /// Partial speech-to-text of the agent
    pub output_text: Option<String>,
    /// The agent finished its turn
    pub turn_complete: bool,
}

/// Events delivered by the remote channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Setup acknowledged; the session is live
    Opened,
    /// Server content (audio, transcripts, turn signals)
    Message(InboundContent),
    /// The connection ended; emitted exactly once per channel
    Closed { reason: Option<String> },
    /// Something went wrong; a `Closed` may still follow
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_content_default_is_empty() {
        let content = InboundContent::default();
        assert!(content.audio.is_empty());
        assert!(!content.interrupted);
        assert!(!content.turn_complete);
        assert!(content.input_text.is_none());
        assert!(content.output_text.is_none());
    }
}
