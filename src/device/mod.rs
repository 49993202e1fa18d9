//! Microphone capability and the per-recording device session
//!
//! The host provides microphone access through the `Microphone` trait. A
//! `DeviceSession` owns one acquired capture, tracks its lifecycle and
//! guarantees the hardware handle is released exactly once.

pub mod cpal_mic;
pub mod matroska;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

pub use cpal_mic::CpalMicrophone;

/// Errors that can occur while acquiring the microphone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("no audio input device found")]
    NoInputDevice,
    #[error("microphone is in use by another application")]
    Busy,
    #[error("no supported audio configuration")]
    NoSupportedConfig,
    #[error("failed to open capture stream: {0}")]
    StreamFailed(String),
}

/// Data delivered by an active capture, in capture order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    Chunk(Vec<u8>),
    /// Final event after a stop request; nothing follows it.
    Flushed,
}

/// Everything a finished capture produced, in capture order.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CapturedAudio {
    pub chunks: Vec<Vec<u8>>,
    /// Wall time between acquisition and flush.
    pub captured: std::time::Duration,
    pub mime_type: String,
}

impl CapturedAudio {
    pub fn total_bytes(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_bytes() == 0
    }

    /// Concatenate the chunks into one container.
    pub fn concat(&self) -> Vec<u8> {
        self.chunks.concat()
    }
}

// Chunk payloads are large; log their shape only.
impl std::fmt::Debug for CapturedAudio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedAudio")
            .field("chunks", &self.chunks.len())
            .field("bytes", &self.total_bytes())
            .field("captured", &self.captured)
            .field("mime_type", &self.mime_type)
            .finish()
    }
}

/// Control side of an acquired capture.
pub trait CaptureControl: Send {
    /// Ask the device to emit what it still holds, then `Flushed`.
    fn request_stop(&mut self);
    /// Turn the microphone off. Called once per capture.
    fn release(&mut self);
}

/// Frequency-domain view of the live signal, one byte (0..=255) per bin.
pub trait FrequencyProbe: Send + Sync {
    fn bin_count(&self) -> usize;
    fn byte_frequency_data(&self, out: &mut [u8]);
}

/// Everything handed back by a successful acquisition.
pub struct Capture {
    pub events: mpsc::UnboundedReceiver<CaptureEvent>,
    pub control: Box<dyn CaptureControl>,
    pub probe: Arc<dyn FrequencyProbe>,
    /// Container type of the emitted chunks.
    pub mime_type: String,
}

#[async_trait]
pub trait Microphone: Send + Sync + 'static {
    async fn acquire(&self) -> Result<Capture, DeviceError>;
}

/// Lifecycle of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePhase {
    Uninitialized,
    Acquiring,
    Active,
    Stopping,
    Released,
}

pub struct DeviceSession {
    control: Option<Box<dyn CaptureControl>>,
    probe: Option<Arc<dyn FrequencyProbe>>,
    mime_type: String,
    phase: watch::Sender<DevicePhase>,
}

impl DeviceSession {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(DevicePhase::Uninitialized);
        Self {
            control: None,
            probe: None,
            mime_type: String::new(),
            phase,
        }
    }

    /// Acquire the microphone. On success the session is `Active` and the
    /// returned receiver yields the capture's chunks; on failure it goes
    /// straight to `Released`.
    pub async fn start(
        &mut self,
        microphone: &dyn Microphone,
    ) -> Result<mpsc::UnboundedReceiver<CaptureEvent>, DeviceError> {
        if self.phase() != DevicePhase::Uninitialized {
            return Err(DeviceError::StreamFailed(
                "device session already used".to_string(),
            ));
        }

        self.set_phase(DevicePhase::Acquiring);
        match microphone.acquire().await {
            Ok(capture) => {
                self.control = Some(capture.control);
                self.probe = Some(capture.probe);
                self.mime_type = capture.mime_type;
                self.set_phase(DevicePhase::Active);
                Ok(capture.events)
            }
            Err(err) => {
                log::warn!("Microphone acquisition failed: {}", err);
                self.set_phase(DevicePhase::Released);
                Err(err)
            }
        }
    }

    pub fn phase(&self) -> DevicePhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DevicePhase> {
        self.phase.subscribe()
    }

    pub fn probe(&self) -> Option<Arc<dyn FrequencyProbe>> {
        self.probe.clone()
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Request termination. Only the first call on an active session does
    /// anything; returns whether a stop was issued.
    pub fn stop(&mut self) -> bool {
        if self.phase() != DevicePhase::Active {
            log::debug!("Device stop ignored in phase {:?}", self.phase());
            return false;
        }
        if let Some(control) = self.control.as_mut() {
            control.request_stop();
        }
        self.set_phase(DevicePhase::Stopping);
        true
    }

    /// Release the hardware handle. Safe to call any number of times.
    pub fn release(&mut self) {
        if let Some(mut control) = self.control.take() {
            control.release();
            log::info!("Microphone released");
        }
        self.probe = None;
        self.set_phase(DevicePhase::Released);
    }

    fn set_phase(&self, next: DevicePhase) {
        self.phase.send_if_modified(|phase| {
            if *phase == next {
                false
            } else {
                *phase = next;
                true
            }
        });
    }
}

impl Default for DeviceSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if self.control.is_some() {
            log::warn!("Device session dropped while holding the microphone, releasing");
        }
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingControl {
        stops: Arc<AtomicUsize>,
        releases: Arc<AtomicUsize>,
    }

    impl CaptureControl for CountingControl {
        fn request_stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        fn release(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct SilentProbe;

    impl FrequencyProbe for SilentProbe {
        fn bin_count(&self) -> usize {
            8
        }
        fn byte_frequency_data(&self, out: &mut [u8]) {
            out.fill(0);
        }
    }

    struct TestMicrophone {
        fail: Option<DeviceError>,
        stops: Arc<AtomicUsize>,
        releases: Arc<AtomicUsize>,
    }

    impl TestMicrophone {
        fn new(fail: Option<DeviceError>) -> Self {
            Self {
                fail,
                stops: Arc::new(AtomicUsize::new(0)),
                releases: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Microphone for TestMicrophone {
        async fn acquire(&self) -> Result<Capture, DeviceError> {
            if let Some(err) = &self.fail {
                return Err(err.clone());
            }
            let (_tx, events) = mpsc::unbounded_channel();
            Ok(Capture {
                events,
                control: Box::new(CountingControl {
                    stops: self.stops.clone(),
                    releases: self.releases.clone(),
                }),
                probe: Arc::new(SilentProbe),
                mime_type: "audio/webm".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn start_moves_to_active() {
        let mic = TestMicrophone::new(None);
        let mut session = DeviceSession::new();
        assert_eq!(session.phase(), DevicePhase::Uninitialized);

        session.start(&mic).await.unwrap();
        assert_eq!(session.phase(), DevicePhase::Active);
        assert!(session.probe().is_some());
        assert_eq!(session.mime_type(), "audio/webm");
    }

    #[tokio::test]
    async fn acquisition_failure_goes_straight_to_released() {
        let mic = TestMicrophone::new(Some(DeviceError::PermissionDenied));
        let mut session = DeviceSession::new();

        let err = session.start(&mic).await.unwrap_err();
        assert_eq!(err, DeviceError::PermissionDenied);
        assert_eq!(session.phase(), DevicePhase::Released);
        drop(session);
        assert_eq!(mic.releases.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn double_stop_and_release_touch_hardware_once() {
        let mic = TestMicrophone::new(None);
        let mut session = DeviceSession::new();
        session.start(&mic).await.unwrap();

        assert!(session.stop());
        assert!(!session.stop());
        assert_eq!(session.phase(), DevicePhase::Stopping);

        session.release();
        session.release();
        drop(session);

        assert_eq!(mic.stops.load(Ordering::SeqCst), 1);
        assert_eq!(mic.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drop_releases_held_microphone() {
        let mic = TestMicrophone::new(None);
        let mut session = DeviceSession::new();
        session.start(&mic).await.unwrap();
        drop(session);
        assert_eq!(mic.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscribers_observe_phase_changes() {
        let mic = TestMicrophone::new(None);
        let mut session = DeviceSession::new();
        let phase = session.subscribe();
        session.start(&mic).await.unwrap();
        assert_eq!(*phase.borrow(), DevicePhase::Active);
        session.stop();
        assert_eq!(*phase.borrow(), DevicePhase::Stopping);
    }
}
