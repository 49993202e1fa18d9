//! Base64 encoding and hand-off to the host's delivery sink
//!
//! The payload is built as a data URL and then stripped at the first comma,
//! so the sink always receives bare base64 text.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

use crate::error::SessionError;
use crate::postprocess::ProcessedAudio;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("no delivery sink configured")]
    SinkUnavailable,
    #[error("sink rejected value: {0}")]
    SetValue(String),
    #[error("sink action failed: {0}")]
    Action(String),
}

/// Executable action attached to a sink, fired after the value is committed.
pub trait SinkAction: Send + Sync {
    fn can_execute(&self) -> bool;
    fn execute(&self) -> Result<(), String>;
}

/// Host-side receiver of the finished payload.
pub trait DeliverySink: Send + Sync {
    fn set_value(&self, content: String) -> Result<(), DeliveryError>;
    fn action(&self) -> Option<Arc<dyn SinkAction>>;
}

/// Fire-and-forget operator notifications.
pub trait Notifier: Send + Sync {
    fn advise(&self, message: &str);
    fn error(&self, message: &str);
}

/// Notifier that writes to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn advise(&self, message: &str) {
        log::info!("Advisory: {}", message);
    }

    fn error(&self, message: &str) {
        log::error!("Error: {}", message);
    }
}

pub fn encode_data_url(bytes: &[u8], mime_type: &str) -> String {
    format!("data:{};base64,{}", mime_type, STANDARD.encode(bytes))
}

/// Everything after the first comma of a data URL.
pub fn strip_data_url_prefix(data_url: &str) -> Option<&str> {
    data_url.split_once(',').map(|(_, payload)| payload)
}

/// Encode on a blocking thread and return bare base64 text.
pub async fn encode_base64(bytes: Vec<u8>, mime_type: String) -> Result<String, SessionError> {
    let data_url = tokio::task::spawn_blocking(move || encode_data_url(&bytes, &mime_type))
        .await
        .map_err(|e| SessionError::Encoding(e.to_string()))?;

    strip_data_url_prefix(&data_url)
        .map(str::to_owned)
        .ok_or_else(|| SessionError::Encoding("data URL has no payload separator".to_string()))
}

/// Commit `content` to the sink, then fire its action if it can run.
pub fn deliver(sink: Option<&dyn DeliverySink>, content: String) -> Result<(), DeliveryError> {
    let sink = sink.ok_or(DeliveryError::SinkUnavailable)?;

    let length = content.len();
    sink.set_value(content)?;
    log::info!("Stored {} characters of base64 audio", length);

    match sink.action() {
        Some(action) if action.can_execute() => {
            action.execute().map_err(DeliveryError::Action)?;
            log::debug!("Sink action executed");
        }
        Some(_) => log::info!("Sink action cannot execute, skipping notification"),
        None => log::info!("No sink action configured, skipping notification"),
    }

    Ok(())
}

/// Encode a processed payload and deliver it.
pub async fn encode_and_deliver(
    audio: ProcessedAudio,
    sink: Option<Arc<dyn DeliverySink>>,
) -> Result<(), SessionError> {
    let ProcessedAudio {
        bytes, mime_type, ..
    } = audio;
    let content = encode_base64(bytes, mime_type).await?;
    deliver(sink.as_deref(), content)?;
    Ok(())
}
