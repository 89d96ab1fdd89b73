//! Tutor persona for the live agent
//!
//! Turns the learner's practice choices (target language, proficiency
//! level, conversation topic) into the system instructions sent with the
//! open request.

use serde::{Deserialize, Serialize};

/// Learner proficiency, controls how the tutor speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProficiencyLevel {
    /// Short sentences, common vocabulary, frequent recasts
    #[default]
    Beginner,

    /// Everyday pace, gentle corrections
    Intermediate,

    /// Natural native pace, idioms, nuanced feedback
    Advanced,
}

impl ProficiencyLevel {
    pub fn label(&self) -> &'static str {
        match self {
            ProficiencyLevel::Beginner => "Beginner",
            ProficiencyLevel::Intermediate => "Intermediate",
            ProficiencyLevel::Advanced => "Advanced",
        }
    }

    /// How the tutor should adapt to this level
    pub fn guideline(&self) -> &'static str {
        match self {
            ProficiencyLevel::Beginner => {
                "Speak slowly using short, simple sentences and very common vocabulary. \
                 When the learner makes a mistake, repeat their sentence back correctly \
                 and keep going."
            }
            ProficiencyLevel::Intermediate => {
                "Speak at a relaxed everyday pace. Introduce some new vocabulary and \
                 briefly point out important mistakes without interrupting the flow."
            }
            ProficiencyLevel::Advanced => {
                "Speak naturally at native pace, using idioms and varied structures. \
                 Give nuanced feedback on word choice and register."
            }
        }
    }
}

/// Build the system instructions for a practice conversation
pub fn system_instruction(language: &str, level: ProficiencyLevel, topic: &str) -> String {
    let topic = topic.trim();
    let topic_line = if topic.is_empty() {
        "Let the learner choose what to talk about.".to_string()
    } else {
        format!("The conversation topic is: {}.", topic)
    };

    format!(
        "You are a friendly, patient {language} conversation partner helping a learner \
         practice speaking. The learner's level is {level}.\n\
         {guideline}\n\
         {topic_line}\n\
         Always reply in {language}. Keep each reply to a few sentences and end with a \
         question or prompt that invites the learner to keep talking. If the learner \
         switches to another language, gently steer them back to {language}.",
        language = language.trim(),
        level = level.label().to_lowercase(),
        guideline = level.guideline(),
        topic_line = topic_line,
    )
}
