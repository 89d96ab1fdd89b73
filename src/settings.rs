use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::audio::level::DEFAULT_RESTING_LEVEL;
use crate::persona::{self, ProficiencyLevel};

const SETTINGS_FILE_NAME: &str = "settings.json";
const APP_DIR_NAME: &str = "lingua-live";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Live model used for the conversation.
    pub model: String,

    /// Prebuilt voice the agent speaks with.
    pub voice: String,

    /// Language the learner is practicing.
    pub language: String,

    /// Learner proficiency; shapes the tutor persona.
    pub level: ProficiencyLevel,

    /// Free-form conversation topic. Empty lets the learner choose.
    pub topic: String,

    /// Duration of each outbound microphone chunk. 256ms is 4096 samples at 16kHz.
    pub capture_chunk_ms: u32,

    /// Level reported by both meters while no session is active.
    pub resting_level: f32,

    /// Render ticks per second for the volume meters.
    pub meter_fps: u32,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            voice: "Puck".to_string(),
            language: "Spanish".to_string(),
            level: ProficiencyLevel::Beginner,
            topic: String::new(),
            capture_chunk_ms: 256,
            resting_level: DEFAULT_RESTING_LEVEL,
            meter_fps: 60,
        }
    }
}

impl AppSettings {
    /// Persona instructions for the configured language, level and topic
    pub fn system_instruction(&self) -> String {
        persona::system_instruction(&self.language, self.level, &self.topic)
    }
}

/// ~/.config/lingua-live/settings.json (platform equivalent elsewhere)
pub fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir()
        .ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings() -> AppSettings {
    match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            AppSettings::default()
        }
    }
}

pub fn load_settings_from(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // First run: write the defaults so there is a file to edit
            let settings = AppSettings::default();
            match save_settings_to(path, &settings) {
                Ok(()) => log::info!("Settings: wrote defaults to {:?}", path),
                Err(e) => log::warn!("Settings: {}", e),
            }
            settings
        }
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings_to(path: &Path, settings: &AppSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a temp file in the same directory, then rename over the original.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // rename fails on Windows when the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(|e| {
        format!(
            "Rename temp settings {:?} to {:?}: {}",
            tmp_path, path, e
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_yields_and_writes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let settings = load_settings_from(&path);
        assert_eq!(settings, AppSettings::default());

        assert!(path.exists());
        assert_eq!(load_settings_from(&path), AppSettings::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);

        let settings = AppSettings {
            language: "Italian".to_string(),
            level: ProficiencyLevel::Advanced,
            topic: "travel".to_string(),
            voice: "Kore".to_string(),
            ..Default::default()
        };
        save_settings_to(&path, &settings).unwrap();

        assert_eq!(load_settings_from(&path), settings);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{"language": "German", "level": "intermediate"}"#).unwrap();

        let settings = load_settings_from(&path);
        assert_eq!(settings.language, "German");
        assert_eq!(settings.level, ProficiencyLevel::Intermediate);
        assert_eq!(settings.voice, "Puck");
        assert_eq!(settings.capture_chunk_ms, 256);
    }

    #[test]
    fn test_corrupt_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "{not json").unwrap();

        assert_eq!(load_settings_from(&path), AppSettings::default());
    }

    #[test]
    fn test_system_instruction_uses_settings() {
        let settings = AppSettings {
            language: "Japanese".to_string(),
            topic: "hobbies".to_string(),
            ..Default::default()
        };
        let text = settings.system_instruction();
        assert!(text.contains("Japanese"));
        assert!(text.contains("hobbies"));
    }
}
