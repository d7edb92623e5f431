//! Dispatcher and reply listener.
//!
//! The dispatcher is the synchronous face of the bridge: `submit` returns
//! once the device answered, the deadline passed, or the request was
//! cancelled. The listener is its asynchronous counterpart, feeding device
//! replies back into the correlation table.

use crate::domain::config::{BridgeConfig, DeadlineOrigin, MAX_DURATION};
use crate::domain::device::DeviceId;
use crate::domain::envelope::CommandEnvelope;
use crate::domain::error::{CancelReason, DispatchError, DispatchResult};
use crate::domain::keepalive::{KeepAliveMonitor, Liveness};
use crate::domain::pending::{CorrelationTable, Resolution};
use crate::domain::slots::{AcquireError, DeviceSerializer};
use crate::ipc::bus_adapter::InboundMessage;
use crate::ports::outbound::CommandPublisher;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Turns a device command into a correlated bus exchange and waits for it.
pub struct Dispatcher {
    config: BridgeConfig,
    table: Arc<CorrelationTable>,
    slots: Arc<DeviceSerializer>,
    keep_alive: Arc<KeepAliveMonitor>,
    publisher: Arc<dyn CommandPublisher>,
}

impl Dispatcher {
    pub fn new(
        config: BridgeConfig,
        table: Arc<CorrelationTable>,
        slots: Arc<DeviceSerializer>,
        keep_alive: Arc<KeepAliveMonitor>,
        publisher: Arc<dyn CommandPublisher>,
    ) -> Self {
        Self {
            config,
            table,
            slots,
            keep_alive,
            publisher,
        }
    }

    /// Send `method` to `device` and wait for its answer.
    ///
    /// `timeout` overrides the configured device answer timeout and is
    /// capped at [`MAX_DURATION`]. Dropping the returned future cancels the
    /// request and frees the device slot.
    pub async fn submit(
        &self,
        device: DeviceId,
        method: &str,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> DispatchResult<serde_json::Value> {
        self.submit_envelope(CommandEnvelope::new(device, method, payload), timeout)
            .await
    }

    /// Send a prepared envelope (CWMP, or USP over an MTP) and wait for
    /// its answer. Same semantics as [`submit`](Self::submit).
    #[instrument(skip_all, fields(
        device_id = %envelope.device_id(),
        method = %envelope.method(),
        mtp = ?envelope.mtp()
    ))]
    pub async fn submit_envelope(
        &self,
        envelope: CommandEnvelope,
        timeout: Option<Duration>,
    ) -> DispatchResult<serde_json::Value> {
        let timeout = timeout
            .unwrap_or(self.config.device_answer_timeout)
            .min(MAX_DURATION);
        let device = envelope.device_id().clone();

        if self.config.fail_fast_offline && self.keep_alive.liveness(&device) == Liveness::Expired
        {
            debug!("Device session expired, failing fast");
            return Err(DispatchError::DeviceOffline { device_id: device });
        }

        let correlation_id = envelope.correlation_id();
        let submitted_at = envelope.created_at();

        let wait_until = match self.config.deadline_origin {
            DeadlineOrigin::Admission => submitted_at + self.config.max_queue_wait,
            DeadlineOrigin::Enqueue => submitted_at + timeout,
        };

        let permit = match self
            .slots
            .acquire(&device, correlation_id, Some(wait_until))
            .await
        {
            Ok(permit) => permit,
            Err(AcquireError::Busy) => {
                debug!(correlation_id = %correlation_id, "Device busy");
                return Err(DispatchError::DeviceBusy { device_id: device });
            }
            Err(AcquireError::QueueTimeout) => {
                return Err(match self.config.deadline_origin {
                    DeadlineOrigin::Admission => DispatchError::DeviceBusy { device_id: device },
                    DeadlineOrigin::Enqueue => DispatchError::DeviceAnswerTimeout {
                        device_id: device,
                        timeout,
                    },
                });
            }
            Err(AcquireError::Closed) => {
                return Err(DispatchError::Cancelled {
                    reason: CancelReason::Shutdown,
                });
            }
        };

        let deadline = match self.config.deadline_origin {
            DeadlineOrigin::Admission => Instant::now() + timeout,
            DeadlineOrigin::Enqueue => submitted_at + timeout,
        };

        // Registered before publishing so that an early reply finds its entry
        let mut handle = self.table.register(&envelope, deadline, timeout)?;

        if let Err(e) = self.publisher.publish_command(&envelope).await {
            let message = e.to_string();
            handle.publish_failed(message.clone());
            drop(permit);
            return Err(DispatchError::PublishFailure(message));
        }

        let resolution = handle.wait().await;
        // Entry removed before the slot is handed to the next command
        drop(handle);
        drop(permit);

        match resolution {
            Resolution::Reply(Ok(value)) => Ok(value),
            Resolution::Reply(Err(fault)) => Err(DispatchError::DeviceFault {
                code: fault.code,
                message: fault.message,
            }),
            Resolution::TimedOut => Err(DispatchError::DeviceAnswerTimeout {
                device_id: device,
                timeout,
            }),
            Resolution::Cancelled(reason) => Err(DispatchError::Cancelled { reason }),
            Resolution::PublishFailed(message) => Err(DispatchError::PublishFailure(message)),
        }
    }

    /// Number of requests waiting for a device
    pub fn pending_count(&self) -> usize {
        self.table.waiting_count()
    }
}

/// Consumes inbound device traffic: touches keep-alive, resolves replies.
pub struct ReplyListener {
    table: Arc<CorrelationTable>,
    keep_alive: Arc<KeepAliveMonitor>,
    inbound_rx: mpsc::Receiver<InboundMessage>,
}

impl ReplyListener {
    pub fn new(
        table: Arc<CorrelationTable>,
        keep_alive: Arc<KeepAliveMonitor>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
    ) -> Self {
        Self {
            table,
            keep_alive,
            inbound_rx,
        }
    }

    /// Run the listener loop until the router drops its sender.
    pub async fn run(mut self) {
        info!("[ReplyListener] Started");
        while let Some(message) = self.inbound_rx.recv().await {
            self.handle(message);
        }
        debug!("[ReplyListener] Inbound channel closed, stopping");
    }

    /// Process one inbound message. Never blocks.
    ///
    /// Activity and replies touch the sender's keep-alive session, except a
    /// reply claiming a command that was sent to another device.
    pub fn handle(&self, message: InboundMessage) {
        let (correlation_id, device_id, result) = match message {
            InboundMessage::Activity { device_id } => {
                self.keep_alive.touch(&device_id);
                return;
            }
            InboundMessage::Reply {
                correlation_id,
                device_id,
                result,
            } => (correlation_id, device_id, result),
        };

        if let Some(request) = self.table.lookup(&correlation_id) {
            if request.device_id() != &device_id {
                warn!(
                    correlation_id = %correlation_id,
                    expected = %request.device_id(),
                    device_id = %device_id,
                    "Reply from a different device than the command was sent to"
                );
                self.table
                    .stats()
                    .total_unmatched_replies
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        self.keep_alive.touch(&device_id);
        if !self.table.resolve(correlation_id, result) {
            debug!(
                correlation_id = %correlation_id,
                device_id = %device_id,
                "Reply for unknown or expired correlation ID"
            );
        }
    }
}
