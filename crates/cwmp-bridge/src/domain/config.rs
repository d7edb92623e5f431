//! Bridge configuration with validation.
//!
//! Loading (flags, environment) is the embedding process's job; the bridge
//! only consumes durations and limits.

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use std::time::Duration;

/// Longest accepted timeout, interval or per-call answer timeout.
pub const MAX_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// What to do with a command for a device that already has one in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Wait in a bounded FIFO queue for the device slot.
    #[default]
    Queue,
    /// Fail immediately with `DeviceBusy`.
    Reject,
}

/// Where a queued command's answer deadline is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadlineOrigin {
    /// From the moment the command is admitted to the device slot.
    #[default]
    Admission,
    /// From the moment `submit` was called (bounds total latency).
    Enqueue,
}

/// Device Command Bridge configuration
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// How long to wait for a device to answer one command
    #[serde_as(as = "DurationSeconds<u64>")]
    pub device_answer_timeout: Duration,
    /// How long a device session stays alive after its last activity
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keep_alive_interval: Duration,
    /// Timeout reaper sweep period
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub sweep_interval: Duration,
    /// How long a resolved entry may linger before the reaper purges it
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reply_grace: Duration,
    /// Busy-device handling
    pub busy_policy: BusyPolicy,
    /// Max callers waiting behind the occupant of one device slot
    pub max_queue_depth: usize,
    /// Deadline origin for queued commands
    pub deadline_origin: DeadlineOrigin,
    /// Upper bound on time spent queued when deadlines start at admission
    #[serde_as(as = "DurationSeconds<u64>")]
    pub max_queue_wait: Duration,
    /// Capacity of the channel between the bus subscriber and the reply listener
    pub reply_channel_capacity: usize,
    /// Fail fast with `DeviceOffline` for devices whose session expired
    pub fail_fast_offline: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device_answer_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(300),
            sweep_interval: Duration::from_millis(500),
            reply_grace: Duration::from_secs(5),
            busy_policy: BusyPolicy::Queue,
            max_queue_depth: 16,
            deadline_origin: DeadlineOrigin::Admission,
            max_queue_wait: Duration::from_secs(30),
            reply_channel_capacity: 1024,
            fail_fast_offline: true,
        }
    }
}

impl BridgeConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_answer_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "device_answer_timeout cannot be 0".into(),
            ));
        }
        if self.keep_alive_interval.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "keep_alive_interval cannot be 0".into(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "sweep_interval cannot be 0".into(),
            ));
        }
        for (name, value) in [
            ("device_answer_timeout", self.device_answer_timeout),
            ("keep_alive_interval", self.keep_alive_interval),
            ("sweep_interval", self.sweep_interval),
            ("reply_grace", self.reply_grace),
            ("max_queue_wait", self.max_queue_wait),
        ] {
            if value > MAX_DURATION {
                return Err(ConfigError::InvalidTimeout(format!(
                    "{name} cannot exceed {}s",
                    MAX_DURATION.as_secs()
                )));
            }
        }
        if self.busy_policy == BusyPolicy::Queue {
            if self.max_queue_depth == 0 {
                return Err(ConfigError::InvalidLimit(
                    "max_queue_depth cannot be 0 with queue policy".into(),
                ));
            }
            if self.deadline_origin == DeadlineOrigin::Admission && self.max_queue_wait.is_zero()
            {
                return Err(ConfigError::InvalidTimeout(
                    "max_queue_wait cannot be 0 with queue policy".into(),
                ));
            }
        }
        if self.reply_channel_capacity == 0 {
            return Err(ConfigError::InvalidLimit(
                "reply_channel_capacity cannot be 0".into(),
            ));
        }
        Ok(())
    }

    /// Configuration with short timeouts for tests.
    pub fn for_testing() -> Self {
        Self {
            device_answer_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(60),
            sweep_interval: Duration::from_millis(100),
            reply_grace: Duration::from_millis(500),
            max_queue_depth: 4,
            max_queue_wait: Duration::from_secs(30),
            reply_channel_capacity: 64,
            ..Self::default()
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),

    #[error("invalid limit: {0}")]
    InvalidLimit(String),
}
