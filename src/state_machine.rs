//! Recording session state machine
//!
//! This module implements the session controller using a single-writer pattern.
//! All state transitions go through the `reduce()` function, which returns
//! a new state and a list of effects to execute.

use uuid::Uuid;

use crate::device::{CapturedAudio, DeviceError};
use crate::error::SessionError;
use crate::governor;
use crate::settings::{OutputFormat, RecorderSettings};

/// Why a recording left the `Recording` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Manual,
    DurationLimit,
    /// The capture stream ended without a stop request.
    DeviceEnded,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Manual => "manual",
            StopReason::DurationLimit => "duration-limit",
            StopReason::DeviceEnded => "device-ended",
        }
    }
}

/// Device progress within `Recording`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceReadiness {
    Acquiring,
    Active,
}

/// Internal state of the recording workflow.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Idle {
        /// Elapsed time of the last delivered session, kept for display.
        last_elapsed_secs: Option<u32>,
    },
    Recording {
        session_id: Uuid,
        device: DeviceReadiness,
        elapsed_secs: u32,
        limit_secs: u32,
        limit_minutes: u32,
        output_format: OutputFormat,
    },
    Finalizing {
        session_id: Uuid,
        elapsed_secs: u32,
        output_format: OutputFormat,
        reason: StopReason,
    },
    Delivering {
        session_id: Uuid,
        elapsed_secs: u32,
    },
}

impl Default for State {
    fn default() -> Self {
        State::Idle {
            last_elapsed_secs: None,
        }
    }
}

impl State {
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            State::Idle { .. } => None,
            State::Recording { session_id, .. }
            | State::Finalizing { session_id, .. }
            | State::Delivering { session_id, .. } => Some(*session_id),
        }
    }

    pub fn elapsed_secs(&self) -> u32 {
        match self {
            State::Idle { last_elapsed_secs } => last_elapsed_secs.unwrap_or(0),
            State::Recording { elapsed_secs, .. }
            | State::Finalizing { elapsed_secs, .. }
            | State::Delivering { elapsed_secs, .. } => *elapsed_secs,
        }
    }
}

/// Operator-facing notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Advisory(String),
    Error(String),
}

/// Events that can trigger state transitions.
/// These are sent from the host controls and from effect tasks.
#[derive(Debug, Clone)]
pub enum Event {
    /// Record control pressed
    StartRequested,
    /// Stop control pressed
    StopRequested,

    // Device events
    DeviceAcquired {
        id: Uuid,
    },
    DeviceFailed {
        id: Uuid,
        err: DeviceError,
    },
    /// Final flush observed; carries every chunk captured
    CaptureFlushed {
        id: Uuid,
        audio: CapturedAudio,
    },

    /// One second of recording elapsed (includes id to prevent stale ticks)
    Tick {
        id: Uuid,
    },

    // Delivery events
    Delivered {
        id: Uuid,
    },
    DeliveryFailed {
        id: Uuid,
        err: SessionError,
    },

    /// Shut down the session loop (handled at the edge, not by the reducer)
    Exit,
}

/// Effects to be executed after a state transition.
/// The effect runner handles these asynchronously.
#[derive(Debug, Clone)]
pub enum Effect {
    StartCapture {
        id: Uuid,
    },
    /// Request the final flush; the device is released once it arrives
    StopCapture {
        id: Uuid,
    },
    /// Release the device without waiting for a flush
    ReleaseCapture {
        id: Uuid,
    },
    StartAnalyzer {
        id: Uuid,
    },
    /// Start sending Tick events every second while recording
    StartGovernor {
        id: Uuid,
    },
    Deliver {
        id: Uuid,
        audio: CapturedAudio,
        output_format: OutputFormat,
    },
    Notify(Notice),
    /// Signal to publish the UI snapshot
    EmitUi,
}

fn finalize_capture(
    session_id: Uuid,
    elapsed_secs: u32,
    output_format: OutputFormat,
    audio: CapturedAudio,
) -> (State, Vec<Effect>) {
    use Effect::*;

    if audio.is_empty() {
        log::warn!("Session {} captured no audio", session_id);
        return (
            State::Idle {
                last_elapsed_secs: None,
            },
            vec![
                Notify(Notice::Error(SessionError::EmptyCapture.to_string())),
                EmitUi,
            ],
        );
    }

    log::info!(
        "Session {} finalized at {}: {} chunks, {} bytes",
        session_id,
        governor::format_elapsed(elapsed_secs),
        audio.chunks.len(),
        audio.total_bytes()
    );

    (
        State::Delivering {
            session_id,
            elapsed_secs,
        },
        vec![
            Deliver {
                id: session_id,
                audio,
                output_format,
            },
            EmitUi,
        ],
    )
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale session IDs
/// - A late device acquisition is always released
/// - Always emit EmitUi after state changes
pub fn reduce(state: &State, event: Event, settings: &RecorderSettings) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    match (state, event) {
        // -----------------
        // Idle
        // -----------------
        (Idle { .. }, StartRequested) => {
            let id = Uuid::new_v4();
            (
                Recording {
                    session_id: id,
                    device: DeviceReadiness::Acquiring,
                    elapsed_secs: 0,
                    limit_secs: settings.max_recording_secs(),
                    limit_minutes: settings.effective_max_minutes(),
                    output_format: settings.output_format,
                },
                vec![StartCapture { id }, EmitUi],
            )
        }

        // -----------------
        // Recording (acquiring)
        // -----------------
        (
            Recording {
                session_id,
                device: DeviceReadiness::Acquiring,
                elapsed_secs,
                limit_secs,
                limit_minutes,
                output_format,
            },
            DeviceAcquired { id },
        ) if *session_id == id => (
            Recording {
                session_id: *session_id,
                device: DeviceReadiness::Active,
                elapsed_secs: *elapsed_secs,
                limit_secs: *limit_secs,
                limit_minutes: *limit_minutes,
                output_format: *output_format,
            },
            vec![StartAnalyzer { id }, StartGovernor { id }, EmitUi],
        ),
        (
            Recording {
                session_id,
                device: DeviceReadiness::Acquiring,
                ..
            },
            DeviceFailed { id, err },
        ) if *session_id == id => (
            Idle {
                last_elapsed_secs: None,
            },
            vec![
                Notify(Notice::Error(SessionError::Device(err).to_string())),
                EmitUi,
            ],
        ),
        // Stop before the device answered abandons the session
        (
            Recording {
                session_id,
                device: DeviceReadiness::Acquiring,
                ..
            },
            StopRequested,
        ) => (
            Idle {
                last_elapsed_secs: None,
            },
            vec![ReleaseCapture { id: *session_id }, EmitUi],
        ),

        // -----------------
        // Recording (active)
        // -----------------
        (
            Recording {
                session_id,
                device: DeviceReadiness::Active,
                elapsed_secs,
                output_format,
                ..
            },
            StopRequested,
        ) => (
            Finalizing {
                session_id: *session_id,
                elapsed_secs: *elapsed_secs,
                output_format: *output_format,
                reason: StopReason::Manual,
            },
            vec![StopCapture { id: *session_id }, EmitUi],
        ),
        // Tick during recording - advance the clock and enforce the ceiling
        (
            Recording {
                session_id,
                device: DeviceReadiness::Active,
                elapsed_secs,
                limit_secs,
                limit_minutes,
                output_format,
            },
            Tick { id },
        ) if *session_id == id => {
            let elapsed = elapsed_secs.saturating_add(1);

            if governor::limit_reached(elapsed, *limit_secs) {
                log::warn!(
                    "Session {} auto-stopped after {}s (max duration reached)",
                    session_id,
                    elapsed
                );
                (
                    Finalizing {
                        session_id: *session_id,
                        elapsed_secs: elapsed,
                        output_format: *output_format,
                        reason: StopReason::DurationLimit,
                    },
                    vec![
                        StopCapture { id: *session_id },
                        Notify(Notice::Advisory(governor::limit_advisory(*limit_minutes))),
                        EmitUi,
                    ],
                )
            } else {
                (
                    Recording {
                        session_id: *session_id,
                        device: DeviceReadiness::Active,
                        elapsed_secs: elapsed,
                        limit_secs: *limit_secs,
                        limit_minutes: *limit_minutes,
                        output_format: *output_format,
                    },
                    vec![EmitUi],
                )
            }
        }
        // Stream ended without a stop request (device lost). The flush can
        // overtake DeviceAcquired, so either readiness finalizes.
        (
            Recording {
                session_id,
                elapsed_secs,
                output_format,
                ..
            },
            CaptureFlushed { id, audio },
        ) if *session_id == id => {
            log::warn!(
                "Session {} capture ended without a stop request ({})",
                session_id,
                StopReason::DeviceEnded.as_str()
            );
            finalize_capture(*session_id, *elapsed_secs, *output_format, audio)
        }

        // -----------------
        // Finalizing
        // -----------------
        (
            Finalizing {
                session_id,
                elapsed_secs,
                output_format,
                reason,
            },
            CaptureFlushed { id, audio },
        ) if *session_id == id => {
            log::debug!("Session {} flushed after {} stop", id, reason.as_str());
            finalize_capture(*session_id, *elapsed_secs, *output_format, audio)
        }

        // -----------------
        // Delivering
        // -----------------
        (
            Delivering {
                session_id,
                elapsed_secs,
            },
            Delivered { id },
        ) if *session_id == id => (
            Idle {
                last_elapsed_secs: Some(*elapsed_secs),
            },
            vec![EmitUi],
        ),
        (Delivering { session_id, .. }, DeliveryFailed { id, err }) if *session_id == id => (
            Idle {
                last_elapsed_secs: None,
            },
            vec![Notify(Notice::Error(err.to_string())), EmitUi],
        ),

        // -----------------
        // Re-entrant controls (no-op)
        // -----------------
        (Finalizing { .. } | Delivering { .. }, StopRequested) => {
            log::debug!("Stop ignored: session already finalizing");
            (state.clone(), vec![])
        }
        (Recording { .. } | Finalizing { .. } | Delivering { .. }, StartRequested) => {
            log::debug!("Start ignored: a session is already in progress");
            (state.clone(), vec![])
        }

        // -----------------
        // Stale device acquisition: nobody owns it, release it
        // -----------------
        (_, DeviceAcquired { id }) if state.session_id() != Some(id) => {
            log::debug!("Releasing stale device acquisition {}", id);
            (state.clone(), vec![ReleaseCapture { id }])
        }

        // -----------------
        // Unhandled or stale: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings(minutes: u32, output_format: OutputFormat) -> RecorderSettings {
        RecorderSettings {
            max_recording_minutes: minutes,
            output_format,
            ..RecorderSettings::default()
        }
    }

    fn active(id: Uuid, minutes: u32) -> State {
        State::Recording {
            session_id: id,
            device: DeviceReadiness::Active,
            elapsed_secs: 0,
            limit_secs: minutes * 60,
            limit_minutes: minutes,
            output_format: OutputFormat::Webm,
        }
    }

    fn audio(sizes: &[usize]) -> CapturedAudio {
        CapturedAudio {
            chunks: sizes.iter().map(|&n| vec![0x42; n]).collect(),
            captured: Duration::from_secs(10),
            mime_type: "audio/webm".to_string(),
        }
    }

    #[test]
    fn idle_start_transitions_to_acquiring() {
        let (next, effects) = reduce(
            &State::default(),
            Event::StartRequested,
            &settings(3, OutputFormat::Wav),
        );
        match next {
            State::Recording {
                device,
                elapsed_secs,
                limit_secs,
                output_format,
                ..
            } => {
                assert_eq!(device, DeviceReadiness::Acquiring);
                assert_eq!(elapsed_secs, 0);
                assert_eq!(limit_secs, 180);
                assert_eq!(output_format, OutputFormat::Wav);
            }
            other => panic!("expected Recording, got {:?}", other),
        }
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StartCapture { .. })));
        // Analyzer and governor wait for the device
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::StartGovernor { .. } | Effect::StartAnalyzer { .. })));
    }

    #[test]
    fn device_acquired_starts_analyzer_and_governor() {
        let id = Uuid::new_v4();
        let mut state = active(id, 5);
        if let State::Recording { device, .. } = &mut state {
            *device = DeviceReadiness::Acquiring;
        }
        let (next, effects) = reduce(
            &state,
            Event::DeviceAcquired { id },
            &RecorderSettings::default(),
        );
        assert_eq!(next, active(id, 5));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StartAnalyzer { .. })));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StartGovernor { .. })));
    }

    #[test]
    fn device_failure_returns_to_idle_with_one_error() {
        let (state, _) = reduce(
            &State::default(),
            Event::StartRequested,
            &RecorderSettings::default(),
        );
        let id = state.session_id().unwrap();
        let (next, effects) = reduce(
            &state,
            Event::DeviceFailed {
                id,
                err: DeviceError::PermissionDenied,
            },
            &RecorderSettings::default(),
        );
        assert_eq!(next, State::default());
        let errors: Vec<_> = effects
            .iter()
            .filter(|e| matches!(e, Effect::Notify(Notice::Error(_))))
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(!effects.iter().any(|e| matches!(
            e,
            Effect::StartGovernor { .. } | Effect::StartAnalyzer { .. }
        )));
    }

    #[test]
    fn stop_while_acquiring_abandons_and_releases() {
        let (state, _) = reduce(
            &State::default(),
            Event::StartRequested,
            &RecorderSettings::default(),
        );
        let id = state.session_id().unwrap();
        let (next, effects) = reduce(&state, Event::StopRequested, &RecorderSettings::default());
        assert_eq!(next, State::default());
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::ReleaseCapture { id: rid } if *rid == id)));
    }

    #[test]
    fn late_acquisition_is_released() {
        let stale = Uuid::new_v4();
        let (next, effects) = reduce(
            &State::default(),
            Event::DeviceAcquired { id: stale },
            &RecorderSettings::default(),
        );
        assert_eq!(next, State::default());
        assert!(matches!(
            effects.as_slice(),
            [Effect::ReleaseCapture { id }] if *id == stale
        ));
    }

    #[test]
    fn manual_stop_snapshots_elapsed_time() {
        let id = Uuid::new_v4();
        let mut state = active(id, 5);
        for _ in 0..10 {
            state = reduce(&state, Event::Tick { id }, &RecorderSettings::default()).0;
        }
        let (next, effects) = reduce(&state, Event::StopRequested, &RecorderSettings::default());
        assert!(matches!(
            next,
            State::Finalizing {
                elapsed_secs: 10,
                reason: StopReason::Manual,
                ..
            }
        ));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StopCapture { .. })));
    }

    #[test]
    fn forced_stop_happens_exactly_at_the_ceiling() {
        for minutes in 1..=300u32 {
            let id = Uuid::new_v4();
            let mut state = active(id, minutes);
            let limit = minutes * 60;

            for tick in 1..limit {
                let (next, effects) =
                    reduce(&state, Event::Tick { id }, &RecorderSettings::default());
                assert!(
                    matches!(next, State::Recording { elapsed_secs, .. } if elapsed_secs == tick),
                    "m={} stopped early at tick {}",
                    minutes,
                    tick
                );
                assert!(!effects
                    .iter()
                    .any(|e| matches!(e, Effect::StopCapture { .. })));
                state = next;
            }

            let (next, effects) = reduce(&state, Event::Tick { id }, &RecorderSettings::default());
            assert!(
                matches!(
                    next,
                    State::Finalizing {
                        elapsed_secs,
                        reason: StopReason::DurationLimit,
                        ..
                    } if elapsed_secs == limit
                ),
                "m={} did not stop at {}",
                minutes,
                limit
            );
            let advisories = effects
                .iter()
                .filter(|e| matches!(e, Effect::Notify(Notice::Advisory(_))))
                .count();
            assert_eq!(advisories, 1);
        }
    }

    #[test]
    fn stop_after_forced_stop_is_ignored() {
        let id = Uuid::new_v4();
        let state = State::Finalizing {
            session_id: id,
            elapsed_secs: 60,
            output_format: OutputFormat::Webm,
            reason: StopReason::DurationLimit,
        };
        let (next, effects) = reduce(&state, Event::StopRequested, &RecorderSettings::default());
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn ticks_after_stop_do_not_count() {
        let id = Uuid::new_v4();
        let state = State::Finalizing {
            session_id: id,
            elapsed_secs: 7,
            output_format: OutputFormat::Webm,
            reason: StopReason::Manual,
        };
        let (next, effects) = reduce(&state, Event::Tick { id }, &RecorderSettings::default());
        assert_eq!(next.elapsed_secs(), 7);
        assert!(effects.is_empty());
    }

    #[test]
    fn stale_tick_is_ignored() {
        let id = Uuid::new_v4();
        let state = active(id, 5);
        let (next, effects) = reduce(
            &state,
            Event::Tick { id: Uuid::new_v4() },
            &RecorderSettings::default(),
        );
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn empty_capture_is_a_terminal_error_without_delivery() {
        let id = Uuid::new_v4();
        let state = State::Finalizing {
            session_id: id,
            elapsed_secs: 3,
            output_format: OutputFormat::Webm,
            reason: StopReason::Manual,
        };
        let (next, effects) = reduce(
            &state,
            Event::CaptureFlushed {
                id,
                audio: audio(&[]),
            },
            &RecorderSettings::default(),
        );
        assert_eq!(next, State::default());
        assert!(!effects.iter().any(|e| matches!(e, Effect::Deliver { .. })));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Notify(Notice::Error(msg)) if msg == "No audio captured"
        )));
    }

    #[test]
    fn captured_audio_moves_to_delivering() {
        let id = Uuid::new_v4();
        let state = State::Finalizing {
            session_id: id,
            elapsed_secs: 10,
            output_format: OutputFormat::Wav,
            reason: StopReason::Manual,
        };
        let (next, effects) = reduce(
            &state,
            Event::CaptureFlushed {
                id,
                audio: audio(&[1000, 1000, 500]),
            },
            &RecorderSettings::default(),
        );
        assert_eq!(
            next,
            State::Delivering {
                session_id: id,
                elapsed_secs: 10
            }
        );
        match effects.first() {
            Some(Effect::Deliver {
                audio,
                output_format,
                ..
            }) => {
                assert_eq!(audio.total_bytes(), 2500);
                assert_eq!(*output_format, OutputFormat::Wav);
            }
            other => panic!("expected Deliver, got {:?}", other),
        }
    }

    #[test]
    fn device_loss_during_recording_still_delivers() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &active(id, 5),
            Event::CaptureFlushed {
                id,
                audio: audio(&[10]),
            },
            &RecorderSettings::default(),
        );
        assert!(matches!(next, State::Delivering { .. }));
        assert!(effects.iter().any(|e| matches!(e, Effect::Deliver { .. })));
    }

    #[test]
    fn flush_overtaking_acquisition_finalizes() {
        let (state, _) = reduce(
            &State::default(),
            Event::StartRequested,
            &RecorderSettings::default(),
        );
        let id = state.session_id().unwrap();
        let (next, effects) = reduce(
            &state,
            Event::CaptureFlushed {
                id,
                audio: audio(&[10]),
            },
            &RecorderSettings::default(),
        );
        assert!(matches!(next, State::Delivering { session_id, .. } if session_id == id));
        assert!(effects.iter().any(|e| matches!(e, Effect::Deliver { .. })));

        // The acquisition arriving afterwards no longer owns a session
        let (after, effects) = reduce(
            &next,
            Event::DeviceAcquired { id },
            &RecorderSettings::default(),
        );
        assert_eq!(after, next);
        assert!(!effects.iter().any(|e| matches!(
            e,
            Effect::StartGovernor { .. } | Effect::StartAnalyzer { .. }
        )));
    }

    #[test]
    fn empty_flush_before_acquisition_returns_to_idle() {
        let (state, _) = reduce(
            &State::default(),
            Event::StartRequested,
            &RecorderSettings::default(),
        );
        let id = state.session_id().unwrap();
        let (next, effects) = reduce(
            &state,
            Event::CaptureFlushed {
                id,
                audio: audio(&[]),
            },
            &RecorderSettings::default(),
        );
        assert_eq!(next, State::default());
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Notify(Notice::Error(_)))));
    }

    #[test]
    fn delivery_success_keeps_elapsed_for_display() {
        let id = Uuid::new_v4();
        let state = State::Delivering {
            session_id: id,
            elapsed_secs: 10,
        };
        let (next, _) = reduce(&state, Event::Delivered { id }, &RecorderSettings::default());
        assert_eq!(
            next,
            State::Idle {
                last_elapsed_secs: Some(10)
            }
        );

        // A new session starts from zero
        let (next, _) = reduce(&next, Event::StartRequested, &RecorderSettings::default());
        assert_eq!(next.elapsed_secs(), 0);
    }

    #[test]
    fn delivery_failure_reports_and_discards() {
        let id = Uuid::new_v4();
        let state = State::Delivering {
            session_id: id,
            elapsed_secs: 10,
        };
        let (next, effects) = reduce(
            &state,
            Event::DeliveryFailed {
                id,
                err: SessionError::Encoding("boom".to_string()),
            },
            &RecorderSettings::default(),
        );
        assert_eq!(next, State::default());
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Notify(Notice::Error(_)))));
    }

    #[test]
    fn start_is_ignored_while_busy() {
        let id = Uuid::new_v4();
        let state = State::Delivering {
            session_id: id,
            elapsed_secs: 1,
        };
        let (next, effects) = reduce(&state, Event::StartRequested, &RecorderSettings::default());
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }
}
