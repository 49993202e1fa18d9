pub mod analyzer;
pub mod delivery;
pub mod device;
pub mod ebml;
pub mod effects;
pub mod error;
pub mod governor;
pub mod postprocess;
pub mod settings;
pub mod state_machine;
pub mod ui;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use effects::EffectRunner;
use settings::RecorderSettings;
use state_machine::{reduce, Effect, Event, State};
use ui::{state_to_ui, SessionPhase, UiState};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Session loop handle - holds the event sender for dispatching events
pub struct SessionHandle {
    tx: mpsc::Sender<Event>,
    ui: watch::Receiver<UiState>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Send an event to the state machine
    pub async fn send(&self, event: Event) -> Result<(), mpsc::error::SendError<Event>> {
        self.tx.send(event).await
    }

    pub async fn start(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(Event::StartRequested).await
    }

    pub async fn stop(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(Event::StopRequested).await
    }

    /// Request a start and wait until the device is live or the attempt
    /// falls back to idle. Returns whether recording is under way.
    pub async fn start_and_wait_live(&self) -> bool {
        let mut ui = self.ui.clone();
        if self.start().await.is_err() {
            return false;
        }
        // The snapshot shows the previous Idle until the start is reduced
        if ui
            .wait_for(|s| s.phase != SessionPhase::Idle)
            .await
            .is_err()
        {
            return false;
        }
        ui.wait_for(|s| s.can_stop || s.phase == SessionPhase::Idle)
            .await
            .map(|s| s.can_stop)
            .unwrap_or(false)
    }

    pub fn subscribe_ui(&self) -> watch::Receiver<UiState> {
        self.ui.clone()
    }

    /// Latest published UI snapshot
    pub fn ui(&self) -> UiState {
        self.ui.borrow().clone()
    }

    /// Stop the loop and wait for it to finish.
    pub async fn shutdown(self) {
        if self.tx.send(Event::Exit).await.is_err() {
            log::debug!("Session loop already stopped");
        }
        if let Err(e) = self.task.await {
            log::warn!("Session loop task failed: {}", e);
        }
    }
}

/// Spawn the session loop on the current runtime.
pub fn spawn_session(settings: RecorderSettings, runner: Arc<dyn EffectRunner>) -> SessionHandle {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (ui_tx, ui_rx) = watch::channel(state_to_ui(&State::default(), &settings));

    let task = tokio::spawn(run_session_loop(settings, rx, tx.downgrade(), runner, ui_tx));

    SessionHandle {
        tx,
        ui: ui_rx,
        task,
    }
}

/// Publish a UI snapshot
fn emit_ui_state(ui: &watch::Sender<UiState>, state: &State, settings: &RecorderSettings) {
    let ui_state = state_to_ui(state, settings);
    log::debug!("Emitting UI state: {:?}", serde_json::to_string(&ui_state));
    ui.send_replace(ui_state);
}

/// Run the main session loop
///
/// Only a weak sender is kept here so the loop ends once every handle and
/// effect task has let go of the channel.
pub async fn run_session_loop(
    settings: RecorderSettings,
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::WeakSender<Event>,
    effect_runner: Arc<dyn EffectRunner>,
    ui: watch::Sender<UiState>,
) {
    let mut state = State::default();

    // Emit initial state
    emit_ui_state(&ui, &state, &settings);
    log::info!("Session loop started");

    while let Some(event) = rx.recv().await {
        log::debug!("Received event: {:?}", event);

        // Handle Exit at the edge
        if matches!(event, Event::Exit) {
            log::info!("Exit requested, shutting down session loop");
            break;
        }

        let old_discriminant = std::mem::discriminant(&state);
        let (next, effects) = reduce(&state, event, &settings);
        let new_discriminant = std::mem::discriminant(&next);

        // Log state transitions
        if old_discriminant != new_discriminant {
            log::info!("State transition: {:?} -> {:?}", state, next);
        }

        state = next;

        // Execute effects
        for eff in effects {
            match eff {
                Effect::EmitUi => emit_ui_state(&ui, &state, &settings),
                other => match tx.upgrade() {
                    Some(tx) => effect_runner.spawn(other, tx),
                    None => log::warn!("Dropping effect, event channel closed: {:?}", other),
                },
            }
        }
    }

    log::info!("Session loop ended");
}
