//! Session lifecycle state machine
//!
//! This module implements the lifecycle using a single-writer pattern.
//! All transitions go through the `reduce()` function, which returns
//! a new state and a list of effects for the controller to execute.
//!
//! ```text
//! Idle ──connect──▶ Connecting ──opened──▶ Active ──closed──▶ Closed
//!   │                   │                    │
//!   └─(no credential)───┴──(acquire failed)──┴──(device lost)──▶ Errored
//!
//! any non-Idle ──disconnect──▶ Idle
//! ```

use uuid::Uuid;

use serde::Serialize;

/// Internal state of the session lifecycle.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone)]
pub enum State {
    Idle,
    Connecting {
        session_id: Uuid,
    },
    Active {
        session_id: Uuid,
    },
    Closed {
        session_id: Uuid,
        reason: Option<String>,
    },
    Errored {
        message: String,
    },
}

impl Default for State {
    fn default() -> Self {
        State::Idle
    }
}

impl State {
    /// Session this state belongs to, if one is live
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            State::Connecting { session_id } | State::Active { session_id, .. } => {
                Some(*session_id)
            }
            _ => None,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        match self {
            State::Idle => ConnectionStatus::Idle,
            State::Connecting { .. } => ConnectionStatus::Connecting,
            State::Active { .. } => ConnectionStatus::Active,
            State::Closed { .. } => ConnectionStatus::Closed,
            State::Errored { .. } => ConnectionStatus::Errored,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, State::Active { .. })
    }
}

/// Connection status exposed to consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Active,
    Closed,
    Errored,
}

/// Events that can trigger state transitions.
/// These are sent from the consumer, the audio hardware and the live channel.
#[derive(Debug, Clone)]
pub enum Event {
    /// Consumer asked to start a conversation
    Connect { has_credential: bool },
    /// Consumer asked to end the conversation
    Disconnect,

    // Acquisition
    /// Microphone and output device are ready
    AudioReady { id: Uuid },
    /// Hardware or channel acquisition failed; everything must be rolled back
    AcquireFailed { id: Uuid, err: String },
    /// Capture or output stream died mid-session
    DeviceLost { id: Uuid, err: String },

    // Live channel
    ChannelOpened { id: Uuid },
    ChannelError { id: Uuid, message: String },
    ChannelClosed { id: Uuid, reason: Option<String> },
}

/// Effects to be executed after a state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Open microphone capture and the output device
    AcquireAudio { id: Uuid },
    /// Open the live channel with the configured persona and voice
    OpenChannel { id: Uuid },
    /// Align the playback cursor with the output clock
    StartPlaybackClock,
    /// Ask the remote side to close the channel
    CloseChannel,
    /// Stop all scheduled playback
    ResetPlayback,
    /// Release capture, output and channel handles (idempotent)
    ReleaseResources,
    /// Clear the committed transcript and partial turns
    ClearTranscript,
    /// Replace the latest user-visible error
    RecordError { message: String },
    /// Forget the latest user-visible error
    ClearError,
    /// Publish a new snapshot to consumers
    EmitUi,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale session IDs
/// - Always emit EmitUi after state changes
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    let current_id = state.session_id();

    // Helper: check if event's ID is stale (doesn't match the live session)
    let is_stale = |eid: Uuid| current_id != Some(eid);

    match (state, event) {
        // -----------------
        // Idle
        // -----------------
        (Idle, Connect { has_credential: false }) => {
            let message = "API key is missing. Set GEMINI_API_KEY or store a key in the keyring."
                .to_string();
            (
                Errored {
                    message: message.clone(),
                },
                vec![RecordError { message }, EmitUi],
            )
        }
        (Idle, Connect { has_credential: true }) => {
            let id = Uuid::new_v4();
            (
                Connecting { session_id: id },
                vec![ClearError, AcquireAudio { id }, EmitUi],
            )
        }
        (Idle, Disconnect) => (Idle, vec![]),

        // -----------------
        // Connect outside Idle: ignored
        // -----------------
        (_, Connect { .. }) => {
            log::warn!("Connect ignored in state {:?}", state.status());
            (state.clone(), vec![])
        }

        // -----------------
        // Disconnect from any non-Idle state
        // -----------------
        (_, Disconnect) => (
            Idle,
            vec![
                CloseChannel,
                ResetPlayback,
                ReleaseResources,
                ClearTranscript,
                EmitUi,
            ],
        ),

        // -----------------
        // Stale events (drop silently)
        // -----------------
        (_, AudioReady { id })
        | (_, AcquireFailed { id, .. })
        | (_, DeviceLost { id, .. })
        | (_, ChannelOpened { id })
        | (_, ChannelError { id, .. })
        | (_, ChannelClosed { id, .. })
            if is_stale(id) =>
        {
            (state.clone(), vec![])
        }

        // -----------------
        // Connecting
        // -----------------
        (Connecting { session_id }, AudioReady { .. }) => (
            state.clone(),
            vec![OpenChannel { id: *session_id }],
        ),
        (Connecting { session_id }, ChannelOpened { .. }) => (
            Active {
                session_id: *session_id,
            },
            vec![StartPlaybackClock, EmitUi],
        ),
        (Connecting { .. }, AcquireFailed { err, .. }) => (
            Errored {
                message: err.clone(),
            },
            vec![
                RecordError { message: err },
                CloseChannel,
                ReleaseResources,
                EmitUi,
            ],
        ),

        // -----------------
        // Connecting / Active
        // -----------------
        (Connecting { .. } | Active { .. }, ChannelError { message, .. }) => {
            // The remote side may still close cleanly; teardown waits for ChannelClosed
            (state.clone(), vec![RecordError { message }, EmitUi])
        }
        (Connecting { session_id } | Active { session_id, .. }, ChannelClosed { reason, .. }) => (
            Closed {
                session_id: *session_id,
                reason,
            },
            vec![ResetPlayback, ReleaseResources, EmitUi],
        ),
        (Connecting { .. } | Active { .. }, DeviceLost { err, .. }) => (
            Errored {
                message: err.clone(),
            },
            vec![
                RecordError { message: err },
                CloseChannel,
                ResetPlayback,
                ReleaseResources,
                EmitUi,
            ],
        ),

        // -----------------
        // Unhandled: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}
