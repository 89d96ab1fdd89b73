//! Turn-based transcript assembly
//!
//! The live channel streams partial transcription text for both directions:
//! what the learner said (input) and what the agent said (output). Fragments
//! are appended as they arrive and committed as finalized [`Message`]s when
//! the agent signals the end of a turn.
//!
//! # Commit Rules
//!
//! - Text is trimmed only at commit; an empty trimmed buffer commits nothing
//! - Within one turn the user's message is always logged before the model's
//! - An interruption discards the agent's partial text, never the user's

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Which party produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

/// A finalized utterance of one party for one turn
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message with a fresh direction-qualified identity
    fn new(role: Role, text: String) -> Self {
        Self {
            id: format!("{}-{}", role.as_str(), Uuid::new_v4()),
            role,
            text,
            timestamp: Utc::now(),
        }
    }
}

/// Accumulates partial text per direction and commits whole turns
#[derive(Debug, Clone, Default)]
pub struct TranscriptAssembler {
    /// Partial learner text for the current turn
    input: String,
    /// Partial agent text for the current turn
    output: String,
    /// Committed messages, append-only
    log: Vec<Message>,
    /// Count of fragments processed (for logging)
    fragment_count: u64,
}

impl TranscriptAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment of the learner's speech-to-text
    pub fn append_input(&mut self, text: &str) {
        self.input.push_str(text);
        self.count_fragment();
    }

    /// Append a fragment of the agent's speech-to-text
    pub fn append_output(&mut self, text: &str) {
        self.output.push_str(text);
        self.count_fragment();
    }

    fn count_fragment(&mut self) {
        self.fragment_count += 1;
        if self.fragment_count % 25 == 0 {
            log::debug!(
                "TranscriptAssembler: {} fragments, {} input chars, {} output chars pending",
                self.fragment_count,
                self.input.len(),
                self.output.len()
            );
        }
    }

    /// Commit the current turn
    ///
    /// Returns the messages added to the log (zero, one or two, user first).
    pub fn on_turn_complete(&mut self) -> &[Message] {
        let before = self.log.len();

        let input = std::mem::take(&mut self.input);
        let output = std::mem::take(&mut self.output);

        for (role, text) in [(Role::User, input), (Role::Model, output)] {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                self.log.push(Message::new(role, trimmed.to_string()));
            }
        }

        let added = &self.log[before..];
        if !added.is_empty() {
            log::info!(
                "TranscriptAssembler: turn complete, committed {} message(s), {} total",
                added.len(),
                self.log.len()
            );
        }
        added
    }

    /// Discard the agent's partial text after barge-in
    pub fn on_interruption(&mut self) {
        if !self.output.is_empty() {
            log::debug!(
                "TranscriptAssembler: discarding {} chars of interrupted output",
                self.output.len()
            );
        }
        self.output.clear();
    }

    /// Committed transcript, oldest first
    pub fn messages(&self) -> &[Message] {
        &self.log
    }

    pub fn pending_input(&self) -> &str {
        &self.input
    }

    pub fn pending_output(&self) -> &str {
        &self.output
    }

    /// Clear the log and both partial buffers
    pub fn reset(&mut self) {
        self.input.clear();
        self.output.clear();
        self.log.clear();
        self.fragment_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_assembler_is_empty() {
        let asm = TranscriptAssembler::new();
        assert!(asm.messages().is_empty());
        assert_eq!(asm.pending_input(), "");
        assert_eq!(asm.pending_output(), "");
    }

    #[test]
    fn test_turn_commits_user_then_model() {
        let mut asm = TranscriptAssembler::new();
        asm.append_input("Hola");
        asm.append_output("¡Hola!");

        let added = asm.on_turn_complete().to_vec();
        assert_eq!(added.len(), 2);
        assert_eq!(added[0].role, Role::User);
        assert_eq!(added[0].text, "Hola");
        assert_eq!(added[1].role, Role::Model);
        assert_eq!(added[1].text, "¡Hola!");
        assert_ne!(added[0].id, added[1].id);

        // Nothing new was said
        assert!(asm.on_turn_complete().is_empty());
        assert_eq!(asm.messages().len(), 2);
    }

    #[test]
    fn test_order_ignores_arrival_order() {
        let mut asm = TranscriptAssembler::new();
        asm.append_output("Muy bien.");
        asm.append_output(" ¿Y tú?");
        asm.append_input("Estoy bien");

        let added = asm.on_turn_complete();
        assert_eq!(added[0].role, Role::User);
        assert_eq!(added[1].text, "Muy bien. ¿Y tú?");
    }

    #[test]
    fn test_fragments_are_concatenated_and_trimmed_at_commit() {
        let mut asm = TranscriptAssembler::new();
        asm.append_input("  Me ");
        asm.append_input("llamo ");
        asm.append_input("Ana  ");
        assert_eq!(asm.pending_input(), "  Me llamo Ana  ");

        let added = asm.on_turn_complete();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].text, "Me llamo Ana");
    }

    #[test]
    fn test_whitespace_only_commits_nothing() {
        let mut asm = TranscriptAssembler::new();
        asm.append_input("   ");
        asm.append_output("\n\t");
        assert!(asm.on_turn_complete().is_empty());
        assert_eq!(asm.pending_input(), "");
        assert_eq!(asm.pending_output(), "");
    }

    #[test]
    fn test_interruption_discards_output_only() {
        let mut asm = TranscriptAssembler::new();
        asm.append_input("Perdón, una pregunta");
        asm.append_output("¡Ho");

        asm.on_interruption();
        assert_eq!(asm.pending_output(), "");
        assert_eq!(asm.pending_input(), "Perdón, una pregunta");
        assert!(asm.messages().is_empty());

        let added = asm.on_turn_complete();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].role, Role::User);
    }

    #[test]
    fn test_log_is_append_only() {
        let mut asm = TranscriptAssembler::new();
        asm.append_input("uno");
        asm.on_turn_complete();
        let first = asm.messages()[0].clone();

        asm.append_output("dos");
        asm.on_turn_complete();

        assert_eq!(asm.messages().len(), 2);
        assert_eq!(asm.messages()[0], first);
        assert_eq!(asm.messages()[1].role, Role::Model);
    }

    #[test]
    fn test_ids_are_direction_qualified() {
        let mut asm = TranscriptAssembler::new();
        asm.append_input("a");
        asm.append_output("b");
        let added = asm.on_turn_complete();
        assert!(added[0].id.starts_with("user-"));
        assert!(added[1].id.starts_with("model-"));
    }

    #[test]
    fn test_reset() {
        let mut asm = TranscriptAssembler::new();
        asm.append_input("hola");
        asm.on_turn_complete();
        asm.append_output("pendiente");

        asm.reset();
        assert!(asm.messages().is_empty());
        assert_eq!(asm.pending_output(), "");
    }

    #[test]
    fn test_role_serialization() {
        let json = serde_json::to_string(&Role::Model).unwrap();
        assert_eq!(json, "\"model\"");
    }
}
