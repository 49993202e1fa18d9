//! Duration governor: one-second recording ticks and the time ceiling
//!
//! The tick loop only produces `Tick` events; counting and the forced stop
//! decision live in the reducer so manual and automatic stops share one path.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::DevicePhase;
use crate::state_machine::Event;

const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Whether `elapsed_secs` has reached the ceiling.
pub fn limit_reached(elapsed_secs: u32, limit_secs: u32) -> bool {
    elapsed_secs >= limit_secs
}

/// Advisory shown once when a recording is stopped by the ceiling.
pub fn limit_advisory(limit_minutes: u32) -> String {
    let unit = if limit_minutes == 1 { "minute" } else { "minutes" };
    format!(
        "Recording stopped automatically after reaching the {} {} limit.",
        limit_minutes, unit
    )
}

/// Elapsed time as `MM:SS`; minutes keep growing past 59.
pub fn format_elapsed(secs: u32) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

/// Send `Tick` every second while the device stays active.
pub async fn run_recording_tick(
    session_id: Uuid,
    phase: watch::Receiver<DevicePhase>,
    tx: mpsc::Sender<Event>,
    shutdown: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + TICK_PERIOD, TICK_PERIOD);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if *phase.borrow() != DevicePhase::Active {
            log::debug!(
                "Recording tick stopping - session {} no longer active",
                session_id
            );
            break;
        }

        if tx.send(Event::Tick { id: session_id }).await.is_err() {
            log::debug!("Recording tick stopping - channel closed");
            break;
        }
    }
}
