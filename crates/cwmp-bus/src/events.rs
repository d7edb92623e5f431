//! # Bus Messages
//!
//! Every message that crosses the bus between the controller and the ACS.
//! Identifiers travel as plain strings; typed identifiers belong to the
//! crates on either end.

use serde::{Deserialize, Serialize};

/// All messages that can be published to the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BusMessage {
    /// Command for a single device.
    /// Source: controller | Target: whichever ACS instance holds the session
    DeviceCommand {
        /// Unique correlation ID to match command and reply.
        correlation_id: String,
        /// Serial number (or equivalent) of the target CPE.
        device_id: String,
        /// CWMP RPC name (e.g. "GetParameterValues") or USP message name
        /// (e.g. "GetSupportedDM").
        method: String,
        /// Opaque RPC arguments.
        payload: serde_json::Value,
        /// Milliseconds since the Unix epoch when the command was built.
        created_at_ms: u64,
        /// USP message transfer protocol ("mqtt", "stomp", "ws"); absent
        /// for CWMP commands.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mtp: Option<String>,
    },

    /// Device answer to a previously published command.
    /// Source: ACS | Target: controller
    DeviceReply {
        /// Correlation ID copied from the originating command.
        correlation_id: String,
        /// Device that answered.
        device_id: String,
        /// RPC response, or the CWMP fault the device returned.
        result: Result<serde_json::Value, DeviceFault>,
    },

    /// Any traffic observed from a device (Inform, periodic keep-alive,
    /// an answer to some other command).
    /// Source: ACS | Target: controller
    DeviceActivity {
        /// Device that was seen.
        device_id: String,
    },
}

/// CWMP fault returned by a device instead of an RPC response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFault {
    /// CWMP fault code (e.g. 9005 "Invalid parameter name").
    pub code: u32,
    /// Fault string reported by the device.
    pub message: String,
}

impl BusMessage {
    /// Get the topic for this message (for filtering).
    #[must_use]
    pub fn topic(&self) -> BusTopic {
        match self {
            Self::DeviceCommand { .. } => BusTopic::DeviceCommands,
            Self::DeviceReply { .. } => BusTopic::DeviceReplies,
            Self::DeviceActivity { .. } => BusTopic::DeviceActivity,
        }
    }

    /// Device this message concerns.
    #[must_use]
    pub fn device_id(&self) -> &str {
        match self {
            Self::DeviceCommand { device_id, .. }
            | Self::DeviceReply { device_id, .. }
            | Self::DeviceActivity { device_id } => device_id,
        }
    }

    /// Broker subject this message is addressed to.
    #[must_use]
    pub fn subject(&self) -> String {
        match self {
            Self::DeviceCommand {
                device_id,
                mtp: None,
                ..
            } => crate::command_subject(device_id),
            Self::DeviceCommand {
                device_id,
                mtp: Some(mtp),
                ..
            } => crate::usp_command_subject(device_id, mtp),
            Self::DeviceReply { .. } => crate::reply_subject(),
            Self::DeviceActivity { device_id } => crate::activity_subject(device_id),
        }
    }
}

/// Topics for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusTopic {
    /// Commands addressed to devices.
    DeviceCommands,
    /// Device answers addressed to the controller.
    DeviceReplies,
    /// Device liveness signals.
    DeviceActivity,
    /// All messages (no filtering).
    All,
}

/// Filter for subscribing to specific messages.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Topics to include. Empty means all topics.
    pub topics: Vec<BusTopic>,
    /// Devices to include. Empty means all devices.
    pub devices: Vec<String>,
}

impl EventFilter {
    /// Create a filter that accepts all messages.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Create a filter for specific topics.
    #[must_use]
    pub fn topics(topics: Vec<BusTopic>) -> Self {
        Self {
            topics,
            devices: Vec::new(),
        }
    }

    /// Restrict the filter to the given devices.
    #[must_use]
    pub fn for_devices(mut self, devices: Vec<String>) -> Self {
        self.devices = devices;
        self
    }

    /// Check if a message matches this filter.
    #[must_use]
    pub fn matches(&self, message: &BusMessage) -> bool {
        let topic_match = self.topics.is_empty()
            || self.topics.contains(&BusTopic::All)
            || self.topics.contains(&message.topic());

        let device_match =
            self.devices.is_empty() || self.devices.iter().any(|d| d == message.device_id());

        topic_match && device_match
    }
}
