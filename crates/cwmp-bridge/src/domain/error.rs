//! Bridge error types.
//!
//! `DispatchError` is what a caller of `submit` sees. None of its kinds is
//! fatal to the bridge: one device failing never affects another.

use crate::domain::device::DeviceId;
use std::fmt;
use std::time::Duration;

/// Why a pending request was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller went away (HTTP client disconnected, future dropped).
    CallerGone,
    /// The bridge is shutting down.
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CallerGone => f.write_str("caller gone"),
            Self::Shutdown => f.write_str("shutting down"),
        }
    }
}

/// Outcome of a `submit` that did not produce a device payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The device already has a command in flight and the request could not
    /// be queued (queue full, queueing disabled, or queue wait exceeded).
    #[error("device {device_id} is busy")]
    DeviceBusy { device_id: DeviceId },

    /// No reply before the deadline.
    #[error("device {device_id} did not answer within {}s", .timeout.as_secs_f64())]
    DeviceAnswerTimeout {
        device_id: DeviceId,
        timeout: Duration,
    },

    /// The bus refused the command; nothing was sent to the device.
    #[error("failed to publish command: {0}")]
    PublishFailure(String),

    /// The request was withdrawn before an answer arrived.
    #[error("request cancelled: {reason}")]
    Cancelled { reason: CancelReason },

    /// Keep-alive says the device session expired; failed fast instead of
    /// waiting out the answer timeout.
    #[error("device {device_id} is offline")]
    DeviceOffline { device_id: DeviceId },

    /// The device answered with a CWMP fault.
    #[error("device fault {code}: {message}")]
    DeviceFault { code: u32, message: String },
}

impl DispatchError {
    /// Short machine-readable name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeviceBusy { .. } => "device_busy",
            Self::DeviceAnswerTimeout { .. } => "device_answer_timeout",
            Self::PublishFailure(_) => "publish_failure",
            Self::Cancelled { .. } => "cancelled",
            Self::DeviceOffline { .. } => "device_offline",
            Self::DeviceFault { .. } => "device_fault",
        }
    }

    /// Whether an immediate retry by the caller can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DeviceBusy { .. } | Self::PublishFailure(_))
    }
}

/// Result type for dispatch operations
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Bridge-level errors (construction and lifecycle, not per-request).
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::domain::config::ConfigError),

    #[error("bridge already started")]
    AlreadyStarted,

    #[error("bridge shut down")]
    ShutDown,
}
