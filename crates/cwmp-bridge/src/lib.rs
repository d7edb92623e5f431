//! Device Command Bridge.
//!
//! Turns a blocking device command (a REST call, typically) into an
//! asynchronous exchange with a CPE over the message bus, and back again.
//!
//! # Architecture
//!
//! ```text
//!   submit(device, method, payload)
//!          │
//!   ┌──────┴──────────────┐      ┌──────────────────────┐
//!   │  Per-Device         │      │  Keep-Alive Monitor  │
//!   │  Serializer         │      │  (last seen/device)  │
//!   └──────┬──────────────┘      └──────────▲───────────┘
//!          │ slot admitted                  │ touch
//!   ┌──────┴──────────────┐      ┌──────────┴───────────┐
//!   │  Correlation Table  │◄─────┤  Reply Listener      │
//!   │  (CAS single-shot)  │      └──────────▲───────────┘
//!   └──────┬───────▲──────┘                 │
//!          │       │ time_out    ┌──────────┴───────────┐
//!          │  ┌────┴────────┐    │  Reply Router        │
//!          │  │ Reaper      │    │  (bus subscription)  │
//!          │  └─────────────┘    └──────────▲───────────┘
//!          ▼ publish                        │
//!      cwmp.v1.<device>.api  ── bus ──  replies / activity
//! ```
//!
//! # Guarantees
//!
//! - At most one command in flight per device; others queue (FIFO, bounded)
//!   or are rejected.
//! - Every request resolves exactly once: reply, timeout or cancellation.
//! - Every wait is bounded by a deadline; dropping the `submit` future
//!   cancels the request and frees the device.
//!
//! # Usage
//!
//! ```ignore
//! use cwmp_bridge::{Bridge, BridgeConfig};
//!
//! let bridge = Bridge::new(BridgeConfig::default(), bus)?;
//! bridge.start()?;
//! let values = bridge
//!     .submit("CPE-1", "GetParameterValues", params, None)
//!     .await?;
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod adapters;
pub mod domain;
pub mod ipc;
pub mod ports;
pub mod service;

pub use domain::config::{BridgeConfig, BusyPolicy, ConfigError, DeadlineOrigin};
pub use domain::correlation::CorrelationId;
pub use domain::device::DeviceId;
pub use domain::error::{BridgeError, CancelReason, DispatchError, DispatchResult};
pub use domain::keepalive::Liveness;
pub use domain::methods::{CwmpMethod, Mtp, UspMessage};
pub use domain::pending::StatsSnapshot;
pub use ports::{CommandPublisher, ReplySource};
pub use service::Bridge;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
