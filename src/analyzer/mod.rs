//! Level analyzer for live visualization
//!
//! While a capture is active, samples the frequency probe at roughly display
//! refresh rate, reduces the bins to a fixed number of bar heights and
//! publishes the newest frame on a watch channel. Slow readers miss frames
//! instead of queueing them.

pub mod spectrum;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::{DevicePhase, FrequencyProbe};

pub const DEFAULT_BAR_COUNT: usize = 30;
pub const MIN_BAR_HEIGHT: u32 = 4;
pub const MAX_BAR_HEIGHT: u32 = 40;

/// Nominal animation frame period (~60fps)
const FRAME_INTERVAL_MS: u64 = 16;

/// Newest set of bar heights for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelFrame {
    pub session_id: Option<Uuid>,
    pub bars: Vec<u32>,
}

pub type LevelSender = watch::Sender<LevelFrame>;
pub type LevelReceiver = watch::Receiver<LevelFrame>;

pub fn create_level_channel() -> (LevelSender, LevelReceiver) {
    watch::channel(LevelFrame::default())
}

/// Average contiguous bins into `bar_count` bars scaled into
/// `MIN_BAR_HEIGHT..=MAX_BAR_HEIGHT`.
pub fn reduce_to_bars(bins: &[u8], bar_count: usize) -> Vec<u32> {
    if bins.is_empty() {
        return vec![MIN_BAR_HEIGHT; bar_count];
    }

    let bins_per_bar = (bins.len() / bar_count.max(1)).max(1);

    (0..bar_count)
        .map(|bar| {
            let start = bar * bins_per_bar;
            if start >= bins.len() {
                return MIN_BAR_HEIGHT;
            }
            let end = (start + bins_per_bar).min(bins.len());
            let sum: u32 = bins[start..end].iter().map(|&b| b as u32).sum();
            let average = sum as f32 / (end - start) as f32;
            bar_height(average)
        })
        .collect()
}

fn bar_height(average: f32) -> u32 {
    let span = (MAX_BAR_HEIGHT - MIN_BAR_HEIGHT) as f32;
    let height = MIN_BAR_HEIGHT as f32 + (average / 255.0) * span;
    (height.round() as u32).clamp(MIN_BAR_HEIGHT, MAX_BAR_HEIGHT)
}

/// Run the sampling loop for one session.
///
/// Exits on its own as soon as the device leaves `Active`; the phase is
/// checked on every frame, the cancellation token only covers shutdown.
pub async fn run_level_analyzer(
    session_id: Uuid,
    probe: Arc<dyn FrequencyProbe>,
    phase: watch::Receiver<DevicePhase>,
    levels: Arc<LevelSender>,
    bar_count: usize,
    shutdown: CancellationToken,
) {
    let mut bins = vec![0u8; probe.bin_count()];
    let mut tick = interval(Duration::from_millis(FRAME_INTERVAL_MS));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    log::debug!("Level analyzer started for {}", session_id);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                log::debug!("Level analyzer received shutdown");
                break;
            }
            _ = tick.tick() => {}
        }

        if *phase.borrow() != DevicePhase::Active {
            break;
        }

        probe.byte_frequency_data(&mut bins);
        let bars = reduce_to_bars(&bins, bar_count);
        levels.send_replace(LevelFrame {
            session_id: Some(session_id),
            bars,
        });
    }

    // Discard this session's last frame, leave anyone else's alone
    levels.send_if_modified(|frame| {
        if frame.session_id == Some(session_id) {
            *frame = LevelFrame::default();
            true
        } else {
            false
        }
    });

    log::debug!("Level analyzer stopped for {}", session_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_bins_give_minimum_bars() {
        let bars = reduce_to_bars(&[0u8; 128], DEFAULT_BAR_COUNT);
        assert_eq!(bars.len(), DEFAULT_BAR_COUNT);
        assert!(bars.iter().all(|&h| h == MIN_BAR_HEIGHT));
    }

    #[test]
    fn saturated_bins_give_maximum_bars() {
        let bars = reduce_to_bars(&[255u8; 128], DEFAULT_BAR_COUNT);
        assert!(bars.iter().all(|&h| h == MAX_BAR_HEIGHT));
    }

    #[test]
    fn bars_average_contiguous_bins() {
        // 4 bins, 2 bars: [0, 255] and [255, 255]
        let bars = reduce_to_bars(&[0, 255, 255, 255], 2);
        assert_eq!(bars, vec![22, 40]);
    }

    #[test]
    fn more_bars_than_bins_pads_with_minimum() {
        let bars = reduce_to_bars(&[255, 255], 4);
        assert_eq!(bars, vec![40, 40, 4, 4]);
    }

    #[test]
    fn no_bins_gives_minimum_bars() {
        assert_eq!(reduce_to_bars(&[], 3), vec![4, 4, 4]);
        assert!(reduce_to_bars(&[10, 20], 0).is_empty());
    }

    struct ConstantProbe(u8);

    impl FrequencyProbe for ConstantProbe {
        fn bin_count(&self) -> usize {
            64
        }
        fn byte_frequency_data(&self, out: &mut [u8]) {
            out.fill(self.0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn analyzer_stops_when_device_leaves_active() {
        let id = Uuid::new_v4();
        let (phase_tx, phase_rx) = watch::channel(DevicePhase::Active);
        let (levels_tx, mut levels_rx) = create_level_channel();

        let task = tokio::spawn(run_level_analyzer(
            id,
            Arc::new(ConstantProbe(255)),
            phase_rx,
            Arc::new(levels_tx),
            DEFAULT_BAR_COUNT,
            CancellationToken::new(),
        ));

        levels_rx
            .wait_for(|frame| frame.bars.len() == DEFAULT_BAR_COUNT)
            .await
            .unwrap();
        assert!(levels_rx.borrow().bars.iter().all(|&h| h == MAX_BAR_HEIGHT));

        phase_tx.send(DevicePhase::Stopping).unwrap();
        task.await.unwrap();

        assert_eq!(*levels_rx.borrow(), LevelFrame::default());
    }
}
