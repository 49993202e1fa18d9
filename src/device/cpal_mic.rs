//! Microphone backed by CPAL
//!
//! The cpal stream lives on a dedicated capture thread (streams are not
//! `Send` on every platform). The thread converts samples to i16, feeds the
//! frequency probe and emits one Matroska chunk per chunk interval. Control
//! calls reach it over a std channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, Stream, StreamConfig};
use tokio::sync::{mpsc, oneshot};

use super::matroska::{PcmClusterWriter, CAPTURE_MIME_TYPE};
use super::{Capture, CaptureControl, CaptureEvent, DeviceError, FrequencyProbe, Microphone};
use crate::analyzer::spectrum::SampleProbe;

enum Command {
    Stop,
    Release,
}

/// Default input device, opened fresh for every acquisition.
#[derive(Debug, Clone)]
pub struct CpalMicrophone {
    chunk_interval: Duration,
}

impl CpalMicrophone {
    pub fn new(chunk_interval: Duration) -> Self {
        Self {
            chunk_interval: chunk_interval.max(Duration::from_millis(50)),
        }
    }
}

impl Default for CpalMicrophone {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

struct CpalCaptureControl {
    commands: std_mpsc::Sender<Command>,
}

impl CaptureControl for CpalCaptureControl {
    fn request_stop(&mut self) {
        if self.commands.send(Command::Stop).is_err() {
            log::debug!("Capture thread already gone on stop");
        }
    }

    fn release(&mut self) {
        if self.commands.send(Command::Release).is_err() {
            log::debug!("Capture thread already gone on release");
        }
    }
}

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn acquire(&self) -> Result<Capture, DeviceError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (command_tx, command_rx) = std_mpsc::channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let chunk_interval = self.chunk_interval;

        std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || run_capture_thread(chunk_interval, ready_tx, command_rx, events_tx))
            .map_err(|e| DeviceError::StreamFailed(format!("spawn capture thread: {}", e)))?;

        let probe = ready_rx
            .await
            .map_err(|_| DeviceError::StreamFailed("capture thread exited".to_string()))??;

        Ok(Capture {
            events,
            control: Box::new(CpalCaptureControl {
                commands: command_tx,
            }),
            probe,
            mime_type: CAPTURE_MIME_TYPE.to_string(),
        })
    }
}

/// Samples captured since the last chunk, shared with the stream callback.
struct Pending {
    samples: Mutex<Vec<i16>>,
    capturing: AtomicBool,
    device_lost: AtomicBool,
}

impl Pending {
    fn take(&self) -> Vec<i16> {
        self.samples
            .lock()
            .map(|mut samples| std::mem::take(&mut *samples))
            .unwrap_or_default()
    }

    /// Buffer samples unless capture has stopped. The flag is read under the
    /// lock so nothing lands after `stop_and_take` has drained the buffer.
    fn push(&self, converted: &[i16]) -> bool {
        let Ok(mut samples) = self.samples.lock() else {
            return false;
        };
        if !self.capturing.load(Ordering::SeqCst) {
            return false;
        }
        samples.extend_from_slice(converted);
        true
    }

    fn stop_and_take(&self) -> Vec<i16> {
        self.capturing.store(false, Ordering::SeqCst);
        self.take()
    }
}

struct OpenStream {
    stream: Stream,
    sample_rate: u32,
    channels: u16,
}

fn open_stream(probe: Arc<SampleProbe>, pending: Arc<Pending>) -> Result<OpenStream, DeviceError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(DeviceError::NoInputDevice)?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported_config = device
        .default_input_config()
        .map_err(|_| DeviceError::NoSupportedConfig)?;

    log::info!(
        "Audio config: {} Hz, {} channels, {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();

    let stream = match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, probe, pending),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, probe, pending),
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, probe, pending),
        _ => Err(DeviceError::NoSupportedConfig),
    }?;

    stream.play().map_err(|e| match e {
        cpal::PlayStreamError::DeviceNotAvailable => DeviceError::NoInputDevice,
        other => DeviceError::StreamFailed(format!("Failed to start stream: {}", other)),
    })?;

    Ok(OpenStream {
        stream,
        sample_rate: config.sample_rate.0,
        channels: config.channels,
    })
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    probe: Arc<SampleProbe>,
    pending: Arc<Pending>,
) -> Result<Stream, DeviceError>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = config.channels;
    let lost = pending.clone();
    let err_fn = move |err: cpal::StreamError| {
        log::error!("Audio stream error: {}", err);
        if matches!(err, cpal::StreamError::DeviceNotAvailable) {
            lost.device_lost.store(true, Ordering::SeqCst);
        }
    };

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !pending.capturing.load(Ordering::SeqCst) {
                    return;
                }
                let converted: Vec<i16> = data.iter().map(|&s| sample_to_i16(s)).collect();
                if pending.push(&converted) {
                    probe.push_interleaved(&converted, channels);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => DeviceError::Busy,
            cpal::BuildStreamError::StreamConfigNotSupported => DeviceError::NoSupportedConfig,
            other => DeviceError::StreamFailed(other.to_string()),
        })
}

fn run_capture_thread(
    chunk_interval: Duration,
    ready: oneshot::Sender<Result<Arc<dyn FrequencyProbe>, DeviceError>>,
    commands: std_mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<CaptureEvent>,
) {
    let probe = Arc::new(SampleProbe::new());
    let pending = Arc::new(Pending {
        samples: Mutex::new(Vec::new()),
        capturing: AtomicBool::new(true),
        device_lost: AtomicBool::new(false),
    });

    let open = match open_stream(probe.clone(), pending.clone()) {
        Ok(open) => open,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let shared: Arc<dyn FrequencyProbe> = probe;
    if ready.send(Ok(shared)).is_err() {
        log::debug!("Acquirer went away before the stream was handed over");
        return;
    }

    let mut writer = PcmClusterWriter::new(open.sample_rate, open.channels);
    let mut emit = |samples: Vec<i16>| {
        let chunk = writer.next_chunk(&samples);
        if !chunk.is_empty() {
            let _ = events.send(CaptureEvent::Chunk(chunk));
        }
    };

    loop {
        match commands.recv_timeout(chunk_interval) {
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                emit(pending.take());
                if pending.device_lost.load(Ordering::SeqCst) {
                    log::warn!("Input device lost, ending capture");
                    break;
                }
            }
            Ok(Command::Stop) => {
                let tail = pending.stop_and_take();
                if let Err(e) = open.stream.pause() {
                    log::debug!("Pausing stream failed: {}", e);
                }
                emit(tail);
                let _ = events.send(CaptureEvent::Flushed);
            }
            Ok(Command::Release) | Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    drop(open);
    log::debug!("Capture thread exiting");
}

/// Convert any sample type to i16.
fn sample_to_i16<T>(sample: T) -> i16
where
    T: cpal::Sample,
    f32: FromSample<T>,
{
    let f32_sample = <f32 as FromSample<T>>::from_sample_(sample);
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}
