//! Event bus adapter for the reply path.
//!
//! The router owns the bus subscription and translates bus messages into
//! [`InboundMessage`]s on a bounded channel, so a slow consumer applies
//! back-pressure to one subscriber instead of stalling the bus.

use crate::domain::correlation::CorrelationId;
use crate::domain::device::DeviceId;
use crate::ports::inbound::ReplySource;
use cwmp_bus::{BusMessage, DeviceFault, EventStream};
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Device traffic the bridge cares about, already parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Answer to a command we published.
    Reply {
        correlation_id: CorrelationId,
        device_id: DeviceId,
        result: Result<serde_json::Value, DeviceFault>,
    },
    /// Proof of life without a command attached.
    Activity { device_id: DeviceId },
}

/// Routes reply and activity messages from the bus into the listener.
pub struct ReplyRouter {
    stream: EventStream,
    inbound_tx: mpsc::Sender<InboundMessage>,
}

impl ReplyRouter {
    /// Subscribe to replies and activity from `source`.
    ///
    /// The subscription is taken here rather than in [`run`](Self::run), so
    /// replies published after construction are never missed.
    pub fn new<S: ReplySource + ?Sized>(
        source: &S,
        inbound_tx: mpsc::Sender<InboundMessage>,
    ) -> Self {
        Self {
            stream: source.reply_stream(),
            inbound_tx,
        }
    }

    /// Route messages until the bus closes, the listener goes away, or
    /// shutdown is signalled. Spawn as a background task.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("[ReplyRouter] Started listening for device replies");

        loop {
            let message = tokio::select! {
                message = self.stream.next() => message,
                _ = shutdown.changed() => {
                    debug!("[ReplyRouter] Shutdown signalled");
                    break;
                }
            };

            let Some(message) = message else {
                warn!("[ReplyRouter] Event stream ended, shutting down");
                break;
            };

            for inbound in translate(message) {
                if self.inbound_tx.send(inbound).await.is_err() {
                    warn!("Inbound channel closed, stopping router");
                    return;
                }
            }
        }
    }
}

/// Convert a bus message into zero or more inbound messages.
///
/// A reply whose correlation ID does not parse cannot be matched, but it
/// still proves the device is alive.
pub fn translate(message: BusMessage) -> Vec<InboundMessage> {
    match message {
        BusMessage::DeviceReply {
            correlation_id,
            device_id,
            result,
        } => {
            let device_id = DeviceId::from(device_id);
            match CorrelationId::parse(&correlation_id) {
                Ok(correlation_id) => vec![InboundMessage::Reply {
                    correlation_id,
                    device_id,
                    result,
                }],
                Err(e) => {
                    warn!(
                        correlation_id = %correlation_id,
                        device_id = %device_id,
                        error = %e,
                        "Dropping reply with malformed correlation ID"
                    );
                    vec![InboundMessage::Activity { device_id }]
                }
            }
        }
        BusMessage::DeviceActivity { device_id } => vec![InboundMessage::Activity {
            device_id: device_id.into(),
        }],
        BusMessage::DeviceCommand { .. } => Vec::new(),
    }
}
