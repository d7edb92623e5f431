//! Command envelope published to the bus.

use crate::domain::correlation::CorrelationId;
use crate::domain::device::DeviceId;
use crate::domain::methods::Mtp;
use cwmp_bus::BusMessage;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// A device command as built by the dispatcher. Immutable once published.
#[derive(Debug, Clone)]
pub struct CommandEnvelope {
    device_id: DeviceId,
    correlation_id: CorrelationId,
    method: String,
    payload: serde_json::Value,
    created_at: Instant,
    created_at_ms: u64,
    mtp: Option<Mtp>,
}

impl CommandEnvelope {
    /// Build an envelope with a fresh correlation ID.
    pub fn new(device_id: DeviceId, method: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            device_id,
            correlation_id: CorrelationId::new(),
            method: method.into(),
            payload,
            created_at: Instant::now(),
            created_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            mtp: None,
        }
    }

    /// Address the command to a USP agent over `mtp`.
    pub fn over_mtp(mut self, mtp: Mtp) -> Self {
        self.mtp = Some(mtp);
        self
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Transfer protocol for USP commands; `None` for CWMP.
    pub fn mtp(&self) -> Option<Mtp> {
        self.mtp
    }

    /// Monotonic creation time (when `submit` was called).
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Wire form.
    pub fn to_message(&self) -> BusMessage {
        BusMessage::DeviceCommand {
            correlation_id: self.correlation_id.to_string(),
            device_id: self.device_id.to_string(),
            method: self.method.clone(),
            payload: self.payload.clone(),
            created_at_ms: self.created_at_ms,
            mtp: self.mtp.map(|mtp| mtp.as_str().to_string()),
        }
    }
}
