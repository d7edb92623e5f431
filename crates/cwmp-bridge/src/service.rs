//! Bridge service - owns the shared state and the background tasks.

use crate::adapters::reaper::TimeoutReaper;
use crate::domain::config::BridgeConfig;
use crate::domain::device::DeviceId;
use crate::domain::envelope::CommandEnvelope;
use crate::domain::error::{BridgeError, CancelReason, DispatchResult};
use crate::domain::keepalive::{KeepAliveMonitor, Liveness};
use crate::domain::methods::{Mtp, UspMessage};
use crate::domain::pending::{CorrelationTable, StatsSnapshot};
use crate::domain::slots::DeviceSerializer;
use crate::ipc::bus_adapter::ReplyRouter;
use crate::ipc::handler::{Dispatcher, ReplyListener};
use crate::ports::inbound::ReplySource;
use crate::ports::outbound::{BusCommandPublisher, CommandPublisher};
use cwmp_bus::InMemoryEventBus;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// The Device Command Bridge.
///
/// Construct with [`Bridge::new`], call [`Bridge::start`] once from inside a
/// Tokio runtime, then share it (behind an `Arc`) with whatever issues
/// device commands.
pub struct Bridge {
    config: BridgeConfig,
    replies: Arc<dyn ReplySource>,
    table: Arc<CorrelationTable>,
    slots: Arc<DeviceSerializer>,
    keep_alive: Arc<KeepAliveMonitor>,
    dispatcher: Dispatcher,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Bridge {
    /// Create a bridge publishing commands on `bus` and reading replies
    /// from it.
    pub fn new(config: BridgeConfig, bus: Arc<InMemoryEventBus>) -> Result<Self, BridgeError> {
        let publisher: Arc<dyn CommandPublisher> = Arc::new(BusCommandPublisher::new(bus.clone()));
        Self::with_ports(config, publisher, bus)
    }

    /// Create a bridge on custom transports, e.g. a broker client that
    /// implements both ports.
    pub fn with_ports(
        config: BridgeConfig,
        publisher: Arc<dyn CommandPublisher>,
        replies: Arc<dyn ReplySource>,
    ) -> Result<Self, BridgeError> {
        config.validate()?;

        let table = Arc::new(CorrelationTable::new());
        let slots = Arc::new(DeviceSerializer::new(
            config.busy_policy,
            config.max_queue_depth,
        ));
        let keep_alive = Arc::new(KeepAliveMonitor::new(config.keep_alive_interval));
        let dispatcher = Dispatcher::new(
            config.clone(),
            Arc::clone(&table),
            Arc::clone(&slots),
            Arc::clone(&keep_alive),
            publisher,
        );
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            replies,
            table,
            slots,
            keep_alive,
            dispatcher,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Subscribe to device replies and spawn the listener and the reaper.
    ///
    /// The reply subscription is in place when this returns.
    pub fn start(&self) -> Result<(), BridgeError> {
        if *self.shutdown_tx.borrow() {
            return Err(BridgeError::ShutDown);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(BridgeError::AlreadyStarted);
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.reply_channel_capacity);
        let router = ReplyRouter::new(self.replies.as_ref(), inbound_tx);
        let listener = ReplyListener::new(
            Arc::clone(&self.table),
            Arc::clone(&self.keep_alive),
            inbound_rx,
        );
        let reaper = TimeoutReaper::new(
            Arc::clone(&self.table),
            Arc::clone(&self.slots),
            Arc::clone(&self.keep_alive),
            self.config.sweep_interval,
            self.config.reply_grace,
        );

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(router.run(self.shutdown_tx.subscribe())));
        tasks.push(tokio::spawn(listener.run()));
        tasks.push(tokio::spawn(reaper.run(self.shutdown_tx.subscribe())));

        info!(
            answer_timeout_s = self.config.device_answer_timeout.as_secs(),
            keep_alive_s = self.config.keep_alive_interval.as_secs(),
            busy_policy = ?self.config.busy_policy,
            deadline_origin = ?self.config.deadline_origin,
            "Device command bridge started"
        );
        Ok(())
    }

    /// Send a command to a device and wait for its answer.
    pub async fn submit(
        &self,
        device: impl Into<DeviceId>,
        method: &str,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> DispatchResult<serde_json::Value> {
        self.dispatcher
            .submit(device.into(), method, payload, timeout)
            .await
    }

    /// Send a USP message to `device` over `mtp` and wait for its answer.
    ///
    /// Shares the device slot with CWMP commands: one command per device is
    /// in flight whatever protocol carries it.
    pub async fn submit_usp(
        &self,
        device: impl Into<DeviceId>,
        mtp: Mtp,
        message: UspMessage,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> DispatchResult<serde_json::Value> {
        let envelope =
            CommandEnvelope::new(device.into(), message.message_name(), payload).over_mtp(mtp);
        self.dispatcher.submit_envelope(envelope, timeout).await
    }

    /// Cancel every waiting request, wake queued callers, stop background
    /// tasks. Returns the number of requests cancelled.
    pub async fn shutdown(&self) -> usize {
        info!("Shutting down device command bridge");
        self.shutdown_tx.send_replace(true);

        let cancelled = self.table.drain(CancelReason::Shutdown);
        self.slots.close();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Bridge task failed");
            }
        }

        info!(cancelled, "Device command bridge stopped");
        cancelled
    }

    /// Liveness of a device according to the keep-alive monitor.
    pub fn liveness(&self, device: &DeviceId) -> Liveness {
        self.keep_alive.liveness(device)
    }

    pub fn is_alive(&self, device: &DeviceId) -> bool {
        self.keep_alive.is_alive(device)
    }

    pub fn keep_alive(&self) -> &Arc<KeepAliveMonitor> {
        &self.keep_alive
    }

    /// Requests currently waiting for a device.
    pub fn pending_count(&self) -> usize {
        self.dispatcher.pending_count()
    }

    /// Devices with a command in flight.
    pub fn busy_devices(&self) -> usize {
        self.slots.busy_devices()
    }

    /// Devices with a keep-alive session record.
    pub fn tracked_devices(&self) -> usize {
        self.keep_alive.tracked()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.table.stats().snapshot()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !*self.shutdown_tx.borrow()
    }
}
