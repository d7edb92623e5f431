//! # CWMP Bus - Message Bus Between the ACS and the Controller
//!
//! The device-facing ACS and the REST controller are deployed and scaled
//! independently, so every device command and every device answer travels
//! over a publish/subscribe bus instead of a direct call.
//!
//! ```text
//! ┌──────────────┐   DeviceCommand (cwmp.v1.<sn>.api)    ┌──────────────┐
//! │  Controller  │ ────────────────────────────────────► │     ACS      │
//! │   (bridge)   │                                       │  (CWMP tier) │
//! │              │ ◄──────────────────────────────────── │              │
//! └──────────────┘   DeviceReply / DeviceActivity         └──────────────┘
//! ```
//!
//! USP commands take the same path but are addressed to
//! `usp.v1.<mtp>.<sn>.api`, where the adapter for that MTP picks them up.
//!
//! The broker transport (NATS in production) lives outside this crate;
//! [`InMemoryEventBus`] is the in-process implementation of [`EventPublisher`]
//! used for single-node deployments and tests.

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod events;
pub mod publisher;
pub mod subscriber;

pub use events::{BusMessage, BusTopic, DeviceFault, EventFilter};
pub use publisher::{EventPublisher, InMemoryEventBus, PublishError};
pub use subscriber::{EventStream, Subscription, SubscriptionError};

/// Maximum messages to buffer per subscriber before lagging.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Subject prefix for CWMP traffic.
pub const SUBJECT_PREFIX: &str = "cwmp.v1";

/// Subject prefix for USP traffic.
pub const USP_SUBJECT_PREFIX: &str = "usp.v1";

/// Subject a command for `device_id` is published on.
#[must_use]
pub fn command_subject(device_id: &str) -> String {
    format!("{SUBJECT_PREFIX}.{device_id}.api")
}

/// Subject a USP message for `device_id` is published on when it must
/// travel over `mtp`.
#[must_use]
pub fn usp_command_subject(device_id: &str, mtp: &str) -> String {
    format!("{USP_SUBJECT_PREFIX}.{mtp}.{device_id}.api")
}

/// Subject device answers are published on.
#[must_use]
pub fn reply_subject() -> String {
    format!("{SUBJECT_PREFIX}.controller.api")
}

/// Subject the ACS announces device activity (informs, keep-alives) on.
#[must_use]
pub fn activity_subject(device_id: &str) -> String {
    format!("{SUBJECT_PREFIX}.{device_id}.info")
}
