//! Error taxonomy for a live conversation session
//!
//! Acquisition failures (`Configuration`, `Permission`) abort `connect()` and
//! roll back whatever was acquired. Steady-state failures (`Decode`,
//! `Transmit`) are isolated to a single frame. `Channel` errors are surfaced
//! to the user but never tear the session down on their own.

/// Errors that can occur while running a live session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Missing or unusable credential / open parameters
    Configuration(String),
    /// Microphone or output device could not be acquired
    Permission(String),
    /// The remote channel reported an error
    Channel(String),
    /// An inbound audio payload could not be decoded
    Decode(String),
    /// An outbound frame could not be handed to the channel
    Transmit(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Configuration(e) => write!(f, "Configuration error: {}", e),
            SessionError::Permission(e) => write!(f, "Microphone or speaker unavailable: {}", e),
            SessionError::Channel(e) => write!(f, "Connection error: {}", e),
            SessionError::Decode(e) => write!(f, "Failed to decode audio: {}", e),
            SessionError::Transmit(e) => write!(f, "Failed to send audio: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_display() {
        let err = SessionError::Configuration("API key missing".to_string());
        assert!(err.to_string().contains("API key missing"));

        let err = SessionError::Transmit("channel closed".to_string());
        assert!(err.to_string().contains("channel closed"));
    }
}
