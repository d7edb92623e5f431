//! Inbound ports for the bridge.

use cwmp_bus::{BusTopic, EventFilter, EventStream, InMemoryEventBus};

/// Delivers device replies and activity to the bridge.
///
/// Implemented by the in-memory bus; a broker client implements it by
/// wrapping its subscription with [`EventStream::from_stream`].
pub trait ReplySource: Send + Sync {
    /// Subscribe to device replies and activity. Messages published after
    /// this returns must be delivered on the returned stream.
    fn reply_stream(&self) -> EventStream;
}

impl ReplySource for InMemoryEventBus {
    fn reply_stream(&self) -> EventStream {
        self.event_stream(EventFilter::topics(vec![
            BusTopic::DeviceReplies,
            BusTopic::DeviceActivity,
        ]))
    }
}
