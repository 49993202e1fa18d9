use serde::Serialize;

use crate::governor::format_elapsed;
use crate::settings::RecorderSettings;
use crate::state_machine::{DeviceReadiness, State};

/// Coarse session phase shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    Idle,
    Recording,
    Finalizing,
    Delivering,
}

/// Snapshot published to the UI after every transition.
/// Serializes as `{ "phase": "recording", "statusText": "...", "elapsed": "00:05", ... }`.
/// Colors are passed through from settings for the renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    pub phase: SessionPhase,
    pub status_text: String,
    pub elapsed: String,
    pub elapsed_secs: u32,
    pub can_start: bool,
    pub can_stop: bool,
    pub gradient_start_color: String,
    pub gradient_end_color: String,
    pub waveform_color: String,
}

impl Default for UiState {
    fn default() -> Self {
        state_to_ui(&State::default(), &RecorderSettings::default())
    }
}

/// Convert internal State to the UI snapshot
pub fn state_to_ui(state: &State, settings: &RecorderSettings) -> UiState {
    let elapsed_secs = state.elapsed_secs();
    let (phase, status_text, can_start, can_stop) = match state {
        State::Idle {
            last_elapsed_secs: None,
        } => (SessionPhase::Idle, &settings.ready_text, true, false),
        State::Idle {
            last_elapsed_secs: Some(_),
        } => (SessionPhase::Idle, &settings.completed_text, true, false),
        State::Recording { device, .. } => (
            SessionPhase::Recording,
            &settings.recording_text,
            false,
            *device == DeviceReadiness::Active,
        ),
        State::Finalizing { .. } => (
            SessionPhase::Finalizing,
            &settings.processing_text,
            false,
            false,
        ),
        State::Delivering { .. } => (
            SessionPhase::Delivering,
            &settings.processing_text,
            false,
            false,
        ),
    };

    UiState {
        phase,
        status_text: status_text.clone(),
        elapsed: format_elapsed(elapsed_secs),
        elapsed_secs,
        can_start,
        can_stop,
        gradient_start_color: settings.gradient_start_color.clone(),
        gradient_end_color: settings.gradient_end_color.clone(),
        waveform_color: settings.waveform_color.clone(),
    }
}
