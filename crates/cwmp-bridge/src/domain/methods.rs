//! Device commands the controller may issue: CWMP RPCs, and USP messages
//! together with the message transfer protocol they travel over.
//!
//! The bridge itself treats the method as an opaque name; these tables are
//! what the REST layer accepts and how route segments map to wire names.

use serde::{Deserialize, Serialize};
use std::fmt;

/// ACS-to-CPE RPC methods (TR-069 Annex A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CwmpMethod {
    GetParameterNames,
    GetParameterValues,
    GetParameterAttributes,
    SetParameterValues,
    AddObject,
    DeleteObject,
}

impl CwmpMethod {
    /// All methods exposed over REST.
    pub const ALL: [CwmpMethod; 6] = [
        Self::GetParameterNames,
        Self::GetParameterValues,
        Self::GetParameterAttributes,
        Self::SetParameterValues,
        Self::AddObject,
        Self::DeleteObject,
    ];

    /// RPC name as it appears in the SOAP body.
    pub fn rpc_name(self) -> &'static str {
        match self {
            Self::GetParameterNames => "GetParameterNames",
            Self::GetParameterValues => "GetParameterValues",
            Self::GetParameterAttributes => "GetParameterAttributes",
            Self::SetParameterValues => "SetParameterValues",
            Self::AddObject => "AddObject",
            Self::DeleteObject => "DeleteObject",
        }
    }

    /// Path segment used by the REST API (`/api/device/cwmp/{sn}/{route}`).
    pub fn route(self) -> &'static str {
        match self {
            Self::GetParameterNames => "getParameterNames",
            Self::GetParameterValues => "getParameterValues",
            Self::GetParameterAttributes => "getParameterAttributes",
            Self::SetParameterValues => "setParameterValues",
            Self::AddObject => "addObject",
            Self::DeleteObject => "deleteObject",
        }
    }

    /// Look up a method by its REST path segment.
    pub fn from_route(route: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.route() == route)
    }

    /// Whether the RPC changes device state.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Self::SetParameterValues | Self::AddObject | Self::DeleteObject
        )
    }
}

impl fmt::Display for CwmpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rpc_name())
    }
}

/// USP messages a controller sends to an agent (TR-369).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UspMessage {
    Get,
    Add,
    Delete,
    Set,
    Notify,
    GetSupportedDM,
    GetInstances,
    Operate,
}

impl UspMessage {
    pub const ALL: [UspMessage; 8] = [
        Self::Get,
        Self::Add,
        Self::Delete,
        Self::Set,
        Self::Notify,
        Self::GetSupportedDM,
        Self::GetInstances,
        Self::Operate,
    ];

    /// Message name as carried in the USP record.
    pub fn message_name(self) -> &'static str {
        match self {
            Self::Get => "Get",
            Self::Add => "Add",
            Self::Delete => "Delete",
            Self::Set => "Set",
            Self::Notify => "Notify",
            Self::GetSupportedDM => "GetSupportedDM",
            Self::GetInstances => "GetInstances",
            Self::Operate => "Operate",
        }
    }

    /// Path segment used by the REST API (`/api/device/{sn}/{mtp}/{route}`).
    pub fn route(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Add => "add",
            Self::Delete => "del",
            Self::Set => "set",
            Self::Notify => "notify",
            Self::GetSupportedDM => "parameters",
            Self::GetInstances => "instances",
            Self::Operate => "operate",
        }
    }

    pub fn from_route(route: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.route() == route)
    }
}

impl fmt::Display for UspMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message_name())
    }
}

/// Message transfer protocol between the USP controller tier and an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mtp {
    Mqtt,
    Stomp,
    #[serde(rename = "ws")]
    WebSocket,
}

impl Mtp {
    /// Name used in REST paths and bus subjects.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mqtt => "mqtt",
            Self::Stomp => "stomp",
            Self::WebSocket => "ws",
        }
    }

    pub fn from_route(route: &str) -> Option<Self> {
        match route {
            "mqtt" => Some(Self::Mqtt),
            "stomp" => Some(Self::Stomp),
            "ws" | "websockets" => Some(Self::WebSocket),
            _ => None,
        }
    }
}

impl fmt::Display for Mtp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_lookup() {
        assert_eq!(
            CwmpMethod::from_route("getParameterValues"),
            Some(CwmpMethod::GetParameterValues)
        );
        assert_eq!(CwmpMethod::from_route("reboot"), None);
    }

    #[test]
    fn test_every_route_round_trips() {
        for method in CwmpMethod::ALL {
            assert_eq!(CwmpMethod::from_route(method.route()), Some(method));
        }
    }

    #[test]
    fn test_write_methods() {
        assert!(CwmpMethod::SetParameterValues.is_write());
        assert!(!CwmpMethod::GetParameterNames.is_write());
    }

    #[test]
    fn test_usp_routes() {
        assert_eq!(UspMessage::from_route("del"), Some(UspMessage::Delete));
        assert_eq!(
            UspMessage::from_route("parameters"),
            Some(UspMessage::GetSupportedDM)
        );
        assert_eq!(UspMessage::from_route("fw_update"), None);
        for message in UspMessage::ALL {
            assert_eq!(UspMessage::from_route(message.route()), Some(message));
        }
    }

    #[test]
    fn test_mtp_routes() {
        assert_eq!(Mtp::from_route("mqtt"), Some(Mtp::Mqtt));
        assert_eq!(Mtp::from_route("websockets"), Some(Mtp::WebSocket));
        assert_eq!(Mtp::WebSocket.as_str(), "ws");
        assert_eq!(Mtp::from_route("coap"), None);
    }
}
