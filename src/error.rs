//! Session-level error taxonomy
//!
//! Errors here end a session and are shown to the operator. Recoverable
//! degradations (metadata repair, transcode) live with the post-processor
//! and never reach this type.

use thiserror::Error;

use crate::delivery::DeliveryError;
use crate::device::DeviceError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Microphone access denied or not available: {0}")]
    Device(#[from] DeviceError),
    #[error("No audio captured")]
    EmptyCapture,
    #[error("Failed to convert audio to base64: {0}")]
    Encoding(String),
    #[error("Failed to store audio content: {0}")]
    Delivery(#[from] DeliveryError),
}
