//! Ports (hexagonal seams) for the bridge.

pub mod inbound;
pub mod outbound;

pub use inbound::ReplySource;
pub use outbound::{BusCommandPublisher, CommandPublisher};
