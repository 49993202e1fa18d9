//! Effect runner for the recording session
//!
//! This module handles executing effects produced by the state machine.
//! Every effect runs as its own tokio task and reports back through the
//! event channel; nothing here decides what the session does next.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::analyzer::{self, LevelReceiver, LevelSender};
use crate::delivery::{self, DeliverySink, Notifier};
use crate::device::{CaptureEvent, CapturedAudio, DevicePhase, DeviceSession, Microphone};
use crate::governor;
use crate::postprocess::{self, AudioDecoder};
use crate::state_machine::{Effect, Event, Notice};

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);
}

/// Device held by a session between acquisition and flush.
struct ActiveCapture {
    device: DeviceSession,
}

type ActiveCaptures = Arc<Mutex<HashMap<Uuid, ActiveCapture>>>;

/// Capabilities the runner drives. Only the sink is optional.
pub struct Capabilities {
    pub microphone: Arc<dyn Microphone>,
    pub sink: Option<Arc<dyn DeliverySink>>,
    pub notifier: Arc<dyn Notifier>,
    pub decoder: Arc<dyn AudioDecoder>,
}

/// Real effect runner over injected capabilities.
pub struct CaptureEffectRunner {
    capabilities: Capabilities,
    active: ActiveCaptures,
    levels: Arc<LevelSender>,
    bar_count: usize,
    shutdown: CancellationToken,
}

impl CaptureEffectRunner {
    pub fn new(capabilities: Capabilities, bar_count: usize) -> Arc<Self> {
        let (levels, _) = analyzer::create_level_channel();
        Arc::new(Self {
            capabilities,
            active: Arc::new(Mutex::new(HashMap::new())),
            levels: Arc::new(levels),
            bar_count: bar_count.max(1),
            shutdown: CancellationToken::new(),
        })
    }

    /// Live bar heights for the visualization.
    pub fn subscribe_levels(&self) -> LevelReceiver {
        self.levels.subscribe()
    }

    /// Stop every loop and release any microphone still held.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut active = self.active.lock().await;
        for (id, mut capture) in active.drain() {
            log::info!("Releasing capture {} on shutdown", id);
            capture.device.release();
        }
    }
}

/// Collect chunks until the flush (or the stream closing), then release the
/// device and report everything captured.
async fn run_chunk_pump(
    id: Uuid,
    mut events: mpsc::UnboundedReceiver<CaptureEvent>,
    phase: watch::Receiver<DevicePhase>,
    mime_type: String,
    started_at: Instant,
    active: ActiveCaptures,
    tx: mpsc::Sender<Event>,
) {
    let mut chunks: Vec<Vec<u8>> = Vec::new();
    let mut released = phase.clone();

    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(CaptureEvent::Chunk(chunk)) => {
                    if !chunk.is_empty() {
                        chunks.push(chunk);
                    }
                }
                Some(CaptureEvent::Flushed) => break,
                None => {
                    if *phase.borrow() == DevicePhase::Released {
                        log::debug!("Capture {} released before flush", id);
                        return;
                    }
                    log::warn!("Capture stream for {} closed without a flush", id);
                    break;
                }
            },
            _ = released.wait_for(|p| *p == DevicePhase::Released) => {
                log::debug!("Capture {} released externally, discarding {} chunks", id, chunks.len());
                return;
            }
        }
    }

    let captured = started_at.elapsed();
    if let Some(mut capture) = active.lock().await.remove(&id) {
        capture.device.release();
    }

    let audio = CapturedAudio {
        chunks,
        captured,
        mime_type,
    };
    log::info!("Capture {} flushed: {:?}", id, audio);

    if tx.send(Event::CaptureFlushed { id, audio }).await.is_err() {
        log::warn!("Failed to send CaptureFlushed event - channel closed");
    }
}

impl EffectRunner for CaptureEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::StartCapture { id } => {
                let microphone = self.capabilities.microphone.clone();
                let active = self.active.clone();

                tokio::spawn(async move {
                    let mut device = DeviceSession::new();
                    let events = match device.start(microphone.as_ref()).await {
                        Ok(events) => events,
                        Err(err) => {
                            let _ = tx.send(Event::DeviceFailed { id, err }).await;
                            return;
                        }
                    };

                    let started_at = Instant::now();
                    let phase = device.subscribe();
                    let mime_type = device.mime_type().to_string();
                    log::info!("Capture {} started ({})", id, mime_type);

                    active.lock().await.insert(id, ActiveCapture { device });

                    // DeviceAcquired must be queued ahead of any CaptureFlushed
                    if tx.send(Event::DeviceAcquired { id }).await.is_err() {
                        log::warn!("Failed to send DeviceAcquired event - channel closed");
                    }

                    run_chunk_pump(id, events, phase, mime_type, started_at, active, tx).await;
                });
            }

            Effect::StopCapture { id } => {
                let active = self.active.clone();
                tokio::spawn(async move {
                    let mut guard = active.lock().await;
                    match guard.get_mut(&id) {
                        Some(capture) => {
                            if capture.device.stop() {
                                log::info!("Capture {} stopping", id);
                            }
                        }
                        None => log::debug!("StopCapture: no active capture for {}", id),
                    }
                });
            }

            Effect::ReleaseCapture { id } => {
                let active = self.active.clone();
                tokio::spawn(async move {
                    if let Some(mut capture) = active.lock().await.remove(&id) {
                        capture.device.release();
                    } else {
                        log::debug!("ReleaseCapture: {} not held", id);
                    }
                });
            }

            Effect::StartAnalyzer { id } => {
                let active = self.active.clone();
                let levels = self.levels.clone();
                let bar_count = self.bar_count;
                let shutdown = self.shutdown.child_token();

                tokio::spawn(async move {
                    let handles = {
                        let guard = active.lock().await;
                        guard
                            .get(&id)
                            .and_then(|c| c.device.probe().map(|p| (p, c.device.subscribe())))
                    };
                    let Some((probe, phase)) = handles else {
                        log::debug!("StartAnalyzer: capture {} already gone", id);
                        return;
                    };
                    analyzer::run_level_analyzer(id, probe, phase, levels, bar_count, shutdown)
                        .await;
                });
            }

            Effect::StartGovernor { id } => {
                let active = self.active.clone();
                let shutdown = self.shutdown.child_token();

                tokio::spawn(async move {
                    let phase = {
                        let guard = active.lock().await;
                        guard.get(&id).map(|c| c.device.subscribe())
                    };
                    let Some(phase) = phase else {
                        log::debug!("StartGovernor: capture {} already gone", id);
                        return;
                    };
                    governor::run_recording_tick(id, phase, tx, shutdown).await;
                });
            }

            Effect::Deliver {
                id,
                audio,
                output_format,
            } => {
                let decoder = self.capabilities.decoder.clone();
                let sink = self.capabilities.sink.clone();

                tokio::spawn(async move {
                    let processed = postprocess::process(&audio, output_format, decoder).await;
                    log::info!("Delivering {:?}", processed);

                    let event = match delivery::encode_and_deliver(processed, sink).await {
                        Ok(()) => Event::Delivered { id },
                        Err(err) => {
                            log::error!("Delivery failed for {}: {}", id, err);
                            Event::DeliveryFailed { id, err }
                        }
                    };
                    if tx.send(event).await.is_err() {
                        log::warn!("Failed to send delivery result - channel closed");
                    }
                });
            }

            Effect::Notify(notice) => match notice {
                Notice::Advisory(message) => self.capabilities.notifier.advise(&message),
                Notice::Error(message) => self.capabilities.notifier.error(&message),
            },

            Effect::EmitUi => {
                // Handled by the session loop
                log::warn!("EmitUi reached the effect runner, ignoring");
            }
        }
    }
}
