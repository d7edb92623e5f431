//! Bus-facing side of the bridge.
//!
//! Commands go out through the dispatcher; replies come back through the
//! router (bus subscription) and the listener (correlation).

pub mod bus_adapter;
pub mod handler;

pub use bus_adapter::{translate, InboundMessage, ReplyRouter};
pub use handler::{Dispatcher, ReplyListener};
