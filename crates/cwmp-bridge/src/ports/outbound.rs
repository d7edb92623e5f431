//! Outbound ports for the bridge.

use crate::domain::envelope::CommandEnvelope;
use async_trait::async_trait;
use cwmp_bus::{EventPublisher, PublishError};
use std::sync::Arc;
use tracing::{debug, warn};

/// Hands command envelopes to the device-facing tier.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    /// Publish on the device's command subject. An error means the command
    /// was not sent.
    async fn publish_command(&self, envelope: &CommandEnvelope) -> Result<(), PublishError>;
}

/// Event bus adapter that implements [`CommandPublisher`].
pub struct BusCommandPublisher {
    bus: Arc<dyn EventPublisher>,
}

impl BusCommandPublisher {
    pub fn new(bus: Arc<dyn EventPublisher>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl CommandPublisher for BusCommandPublisher {
    async fn publish_command(&self, envelope: &CommandEnvelope) -> Result<(), PublishError> {
        let message = envelope.to_message();
        let subject = message.subject();

        let receivers = self.bus.publish(message).await?;

        if receivers == 0 {
            // Not an error: the device-facing tier may simply not be up yet,
            // in which case the request times out like any unanswered command.
            warn!(
                correlation_id = %envelope.correlation_id(),
                device_id = %envelope.device_id(),
                subject = %subject,
                "No subscribers for device command"
            );
        } else {
            debug!(
                correlation_id = %envelope.correlation_id(),
                device_id = %envelope.device_id(),
                method = %envelope.method(),
                subject = %subject,
                receivers,
                "Published device command"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::device::DeviceId;
    use cwmp_bus::{BusMessage, BusTopic, EventFilter, InMemoryEventBus};

    fn envelope() -> CommandEnvelope {
        CommandEnvelope::new(
            DeviceId::from("CPE-1"),
            "GetParameterNames",
            serde_json::json!({"path": "Device.", "nextLevel": true}),
        )
    }

    #[tokio::test]
    async fn test_publish_reaches_command_topic() {
        let bus = Arc::new(InMemoryEventBus::new());
        let mut sub = bus.subscribe(EventFilter::topics(vec![BusTopic::DeviceCommands]));
        let publisher = BusCommandPublisher::new(bus.clone());
        let envelope = envelope();

        publisher.publish_command(&envelope).await.unwrap();

        let message = sub.recv().await.unwrap();
        assert_eq!(message.subject(), "cwmp.v1.CPE-1.api");
        match message {
            BusMessage::DeviceCommand { correlation_id, .. } => {
                assert_eq!(correlation_id, envelope.correlation_id().to_string());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_on_closed_bus_fails() {
        let bus = Arc::new(InMemoryEventBus::new());
        bus.close();
        let publisher = BusCommandPublisher::new(bus);

        let result = publisher.publish_command(&envelope()).await;
        assert!(matches!(result, Err(PublishError::Closed)));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let publisher = BusCommandPublisher::new(Arc::new(InMemoryEventBus::new()));
        assert!(publisher.publish_command(&envelope()).await.is_ok());
    }
}
