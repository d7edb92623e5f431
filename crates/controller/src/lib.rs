//! CWMP controller: REST API in front of the Device Command Bridge.
//!
//! Operators call `PUT /api/device/cwmp/{sn}/{method}`; the handler blocks on
//! [`cwmp_bridge::Bridge::submit`] until the CPE answers through the ACS.

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod api;
pub mod config;
pub mod error;

pub use api::{router, AppState};
pub use config::{load_config, ControllerConfig};
pub use error::ApiError;
