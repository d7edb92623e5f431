//! Domain types for the Device Command Bridge.
//!
//! Correlation table, per-device serializer and keep-alive state live here;
//! the bus-facing plumbing is in `ipc`, background tasks in `adapters`.

pub mod config;
pub mod correlation;
pub mod device;
pub mod envelope;
pub mod error;
pub mod keepalive;
pub mod methods;
pub mod pending;
pub mod slots;

pub use config::{BridgeConfig, BusyPolicy, ConfigError, DeadlineOrigin};
pub use correlation::CorrelationId;
pub use device::DeviceId;
pub use envelope::CommandEnvelope;
pub use error::{BridgeError, CancelReason, DispatchError, DispatchResult};
pub use keepalive::{KeepAliveMonitor, Liveness};
pub use methods::{CwmpMethod, Mtp, UspMessage};
pub use pending::{
    CorrelationTable, PendingHandle, PendingRequest, PendingState, PendingStats, Resolution,
    StatsSnapshot,
};
pub use slots::{AcquireError, DeviceSerializer, SlotPermit};
