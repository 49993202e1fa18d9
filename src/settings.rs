use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::analyzer::DEFAULT_BAR_COUNT;

const SETTINGS_FILE_NAME: &str = "settings.json";
const SETTINGS_DIR_NAME: &str = "audio-recorder";

pub const MIN_RECORDING_MINUTES: u32 = 1;
pub const MAX_RECORDING_MINUTES: u32 = 300;

/// Encoding of the delivered payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// The capture's own container, duration-repaired.
    #[default]
    Webm,
    /// 16-bit PCM WAV transcoded from the capture.
    Wav,
}

impl OutputFormat {
    pub fn label(&self) -> &'static str {
        match self {
            OutputFormat::Webm => "WebM",
            OutputFormat::Wav => "WAV",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Webm => "audio/webm",
            OutputFormat::Wav => "audio/wav",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "webm" => Ok(OutputFormat::Webm),
            "wav" => Ok(OutputFormat::Wav),
            other => Err(format!("unknown output format '{}' (expected webm or wav)", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecorderSettings {
    /// Recording ceiling in minutes. Clamped to 1..=300 when used.
    pub max_recording_minutes: u32,

    pub output_format: OutputFormat,

    /// Status line shown before the first recording.
    pub ready_text: String,
    pub recording_text: String,
    pub processing_text: String,
    /// Status line shown after a successful delivery.
    pub completed_text: String,

    pub gradient_start_color: String,
    pub gradient_end_color: String,
    pub waveform_color: String,

    /// Number of level bars produced per analysis frame.
    pub bar_count: usize,

    /// How often the capture device emits a chunk.
    pub chunk_interval_ms: u64,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            max_recording_minutes: 5,
            output_format: OutputFormat::Webm,
            ready_text: "Press record to start".to_string(),
            recording_text: "Recording...".to_string(),
            processing_text: "Processing audio...".to_string(),
            completed_text: "Recording completed".to_string(),
            gradient_start_color: "#667eea".to_string(),
            gradient_end_color: "#764ba2".to_string(),
            waveform_color: "#4facfe".to_string(),
            bar_count: DEFAULT_BAR_COUNT,
            chunk_interval_ms: 1000,
        }
    }
}

impl RecorderSettings {
    /// Ceiling in minutes after clamping into the supported range.
    pub fn effective_max_minutes(&self) -> u32 {
        self.max_recording_minutes
            .clamp(MIN_RECORDING_MINUTES, MAX_RECORDING_MINUTES)
    }

    pub fn max_recording_secs(&self) -> u32 {
        self.effective_max_minutes() * 60
    }

    /// Human-readable configuration problems. Clamping still applies, so
    /// these are warnings for whoever wrote the file.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if !(MIN_RECORDING_MINUTES..=MAX_RECORDING_MINUTES).contains(&self.max_recording_minutes)
        {
            problems.push(format!(
                "Maximum recording time must be between {} and {} minutes.",
                MIN_RECORDING_MINUTES, MAX_RECORDING_MINUTES
            ));
        }

        for (name, value) in [
            ("gradientStartColor", &self.gradient_start_color),
            ("gradientEndColor", &self.gradient_end_color),
            ("waveformColor", &self.waveform_color),
        ] {
            if !is_hex_color(value) {
                problems.push(format!(
                    "{} must be a valid hex color (e.g., #4facfe), got '{}'.",
                    name, value
                ));
            }
        }

        if self.bar_count == 0 {
            problems.push("barCount must be at least 1.".to_string());
        }

        problems
    }
}

fn is_hex_color(value: &str) -> bool {
    value.len() == 7
        && value.starts_with('#')
        && value[1..].chars().all(|c| c.is_ascii_hexdigit())
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("could not determine config directory")]
    NoConfigDir,
    #[error("{action} {path:?}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub fn default_settings_path() -> Result<PathBuf, SettingsError> {
    let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings(path: &Path) -> RecorderSettings {
    let settings = match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<RecorderSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                RecorderSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => RecorderSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            RecorderSettings::default()
        }
    };

    for problem in settings.validate() {
        log::warn!("Settings: {}", problem);
    }

    settings
}

pub fn save_settings(path: &Path, settings: &RecorderSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| SettingsError::Io {
            action: "create config directory",
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let contents = serde_json::to_string_pretty(settings)?;

    // Write to a sibling temp file, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents).map_err(|source| SettingsError::Io {
        action: "write temp settings",
        path: tmp_path.clone(),
        source,
    })?;

    // Windows rename fails when the destination exists.
    if cfg!(windows) && path.exists() {
        if let Err(source) = std::fs::remove_file(path) {
            if source.kind() != std::io::ErrorKind::NotFound {
                return Err(SettingsError::Io {
                    action: "remove existing settings",
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(|source| SettingsError::Io {
        action: "rename temp settings",
        path: tmp_path.clone(),
        source,
    })?;
    Ok(())
}
