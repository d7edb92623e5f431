//! Correlation Table - the async-to-sync bridge state.
//!
//! Maps correlation IDs to callers waiting for a device reply. Each entry
//! resolves exactly once: the reply listener, the timeout reaper, the
//! caller's own deadline timer and cancellation all race through one
//! compare-and-set on the entry's state, and only the winner writes the
//! result slot.
//!
//! Flow:
//! 1. Dispatcher calls `register()` (before publishing) and gets a handle
//! 2. Dispatcher publishes the command on the bus
//! 3. Reply listener calls `resolve()`, or the deadline passes and
//!    `time_out()` wins instead
//! 4. The caller's `PendingHandle::wait()` returns the single resolution
//! 5. Dropping the handle removes the entry (and cancels it if still waiting)

use crate::domain::correlation::CorrelationId;
use crate::domain::device::DeviceId;
use crate::domain::envelope::CommandEnvelope;
use crate::domain::error::{CancelReason, DispatchError};
use cwmp_bus::DeviceFault;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Lifecycle of a pending request. Every state but `Waiting` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PendingState {
    Waiting = 0,
    Resolved = 1,
    TimedOut = 2,
    Cancelled = 3,
}

impl PendingState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Waiting,
            1 => Self::Resolved,
            2 => Self::TimedOut,
            _ => Self::Cancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Self::Waiting
    }
}

/// The value written into a request's result slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The device answered (successfully or with a CWMP fault).
    Reply(Result<serde_json::Value, DeviceFault>),
    /// The deadline passed first.
    TimedOut,
    /// Withdrawn before an answer arrived.
    Cancelled(CancelReason),
    /// The command never reached the bus.
    PublishFailed(String),
}

/// A request waiting for a device reply.
pub struct PendingRequest {
    correlation_id: CorrelationId,
    device_id: DeviceId,
    method: String,
    registered_at: Instant,
    deadline: Instant,
    timeout: Duration,
    state: AtomicU8,
    /// Taken exactly once, by the winner of the state transition
    slot: Mutex<Option<oneshot::Sender<Resolution>>>,
    resolved_at: Mutex<Option<Instant>>,
}

impl PendingRequest {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// The answer timeout this request was registered with.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> PendingState {
        PendingState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_waiting(&self) -> bool {
        self.state() == PendingState::Waiting
    }

    fn resolved_at(&self) -> Option<Instant> {
        *self.resolved_at.lock()
    }

    /// Move `Waiting -> to` and deliver `resolution`. Returns false if some
    /// other party already resolved this request.
    fn try_transition(&self, to: PendingState, resolution: Resolution) -> bool {
        if self
            .state
            .compare_exchange(
                PendingState::Waiting as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        *self.resolved_at.lock() = Some(Instant::now());
        if let Some(sender) = self.slot.lock().take() {
            // Receiver gone means the caller already left; the transition
            // still happened.
            let _ = sender.send(resolution);
        }
        true
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("correlation_id", &self.correlation_id)
            .field("device_id", &self.device_id)
            .field("method", &self.method)
            .field("state", &self.state())
            .finish()
    }
}

/// Statistics for the correlation table
#[derive(Debug, Default)]
pub struct PendingStats {
    /// Total requests registered
    pub total_registered: AtomicU64,
    /// Total requests resolved by a device reply
    pub total_resolved: AtomicU64,
    /// Total requests timed out
    pub total_timeouts: AtomicU64,
    /// Total requests cancelled (caller gone or shutdown)
    pub total_cancelled: AtomicU64,
    /// Total requests that never made it onto the bus
    pub total_publish_failures: AtomicU64,
    /// Replies that matched no waiting request (late, duplicate, foreign)
    pub total_unmatched_replies: AtomicU64,
}

/// Point-in-time copy of [`PendingStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub registered: u64,
    pub resolved: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub publish_failures: u64,
    pub unmatched_replies: u64,
}

impl PendingStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            registered: self.total_registered.load(Ordering::Relaxed),
            resolved: self.total_resolved.load(Ordering::Relaxed),
            timeouts: self.total_timeouts.load(Ordering::Relaxed),
            cancelled: self.total_cancelled.load(Ordering::Relaxed),
            publish_failures: self.total_publish_failures.load(Ordering::Relaxed),
            unmatched_replies: self.total_unmatched_replies.load(Ordering::Relaxed),
        }
    }
}

/// Correlation table keyed by correlation ID.
///
/// Sharded map: operations on unrelated correlation IDs never contend on a
/// shared lock, and no lock is held while a result is delivered.
#[derive(Default)]
pub struct CorrelationTable {
    entries: DashMap<CorrelationId, Arc<PendingRequest>>,
    stats: PendingStats,
    /// Held shared across check-and-insert in `register`, exclusively by
    /// `drain` while closing, so no registration slips in behind a drain.
    closed: RwLock<bool>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request for `envelope`, answerable until
    /// `deadline`. Must happen before the envelope is published so that an
    /// early reply finds its entry.
    pub fn register(
        self: &Arc<Self>,
        envelope: &CommandEnvelope,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<PendingHandle, DispatchError> {
        let closed = self.closed.read();
        if *closed {
            return Err(DispatchError::Cancelled {
                reason: CancelReason::Shutdown,
            });
        }

        let correlation_id = envelope.correlation_id();
        let (tx, rx) = oneshot::channel();
        let request = Arc::new(PendingRequest {
            correlation_id,
            device_id: envelope.device_id().clone(),
            method: envelope.method().to_string(),
            registered_at: Instant::now(),
            deadline,
            timeout,
            state: AtomicU8::new(PendingState::Waiting as u8),
            slot: Mutex::new(Some(tx)),
            resolved_at: Mutex::new(None),
        });

        match self.entries.entry(correlation_id) {
            Entry::Occupied(_) => {
                warn!(correlation_id = %correlation_id, "Correlation ID already registered");
                return Err(DispatchError::PublishFailure(format!(
                    "correlation id {correlation_id} already in use"
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&request));
            }
        }
        drop(closed);
        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);

        debug!(
            correlation_id = %correlation_id,
            device_id = %request.device_id,
            method = %request.method,
            timeout_ms = timeout.as_millis() as u64,
            "Registered pending request"
        );

        Ok(PendingHandle {
            table: Arc::clone(self),
            request,
            receiver: rx,
        })
    }

    /// Resolve a request with a device reply.
    ///
    /// Returns true if this call performed the resolution; false if the ID
    /// is unknown or the request already reached a terminal state.
    pub fn resolve(
        &self,
        correlation_id: CorrelationId,
        result: Result<serde_json::Value, DeviceFault>,
    ) -> bool {
        let Some(request) = self.lookup(&correlation_id) else {
            self.stats
                .total_unmatched_replies
                .fetch_add(1, Ordering::Relaxed);
            return false;
        };

        if request.try_transition(PendingState::Resolved, Resolution::Reply(result)) {
            self.stats.total_resolved.fetch_add(1, Ordering::Relaxed);
            debug!(
                correlation_id = %correlation_id,
                device_id = %request.device_id,
                method = %request.method,
                response_time_ms = request.registered_at.elapsed().as_millis() as u64,
                "Resolved pending request"
            );
            true
        } else {
            self.stats
                .total_unmatched_replies
                .fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Cancel a waiting request. Returns true if this call performed it.
    pub fn cancel(&self, correlation_id: &CorrelationId, reason: CancelReason) -> bool {
        self.lookup(correlation_id)
            .is_some_and(|request| self.cancel_request(&request, reason))
    }

    /// Time out a waiting request. Returns true if this call performed it.
    pub fn time_out(&self, correlation_id: &CorrelationId) -> bool {
        self.lookup(correlation_id)
            .is_some_and(|request| self.time_out_request(&request))
    }

    pub(crate) fn cancel_request(&self, request: &PendingRequest, reason: CancelReason) -> bool {
        let won = request.try_transition(PendingState::Cancelled, Resolution::Cancelled(reason));
        if won {
            self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(
                correlation_id = %request.correlation_id,
                device_id = %request.device_id,
                reason = %reason,
                "Cancelled pending request"
            );
        }
        won
    }

    pub(crate) fn time_out_request(&self, request: &PendingRequest) -> bool {
        let won = request.try_transition(PendingState::TimedOut, Resolution::TimedOut);
        if won {
            self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
            warn!(
                correlation_id = %request.correlation_id,
                device_id = %request.device_id,
                method = %request.method,
                timeout_ms = request.timeout.as_millis() as u64,
                "Device did not answer in time"
            );
        }
        won
    }

    /// Look up a request (a shared reference; the table keeps ownership).
    pub fn lookup(&self, correlation_id: &CorrelationId) -> Option<Arc<PendingRequest>> {
        self.entries
            .get(correlation_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn remove(&self, correlation_id: &CorrelationId) {
        self.entries.remove(correlation_id);
    }

    /// Waiting requests whose deadline is at or before `now`.
    ///
    /// Shards are visited one at a time; the returned requests are acted
    /// upon after all map locks are released.
    pub fn expired(&self, now: Instant) -> Vec<Arc<PendingRequest>> {
        self.entries
            .iter()
            .filter(|entry| entry.is_waiting() && entry.deadline <= now)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Drop terminal entries that have lingered longer than `grace`.
    ///
    /// Normally the caller's handle removes its own entry; this catches
    /// entries whose caller is stuck or gone. Returns the number purged.
    pub fn purge_resolved(&self, now: Instant, grace: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, request| {
            request
                .resolved_at()
                .map_or(true, |at| now.saturating_duration_since(at) < grace)
        });
        before.saturating_sub(self.entries.len())
    }

    /// Refuse new registrations and cancel everything still waiting.
    /// Returns the number of requests cancelled.
    pub fn drain(&self, reason: CancelReason) -> usize {
        *self.closed.write() = true;
        let waiting: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| entry.is_waiting())
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        waiting
            .iter()
            .filter(|request| self.cancel_request(request, reason))
            .count()
    }

    /// Number of entries in the table (waiting or awaiting removal).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of requests still waiting for a device.
    pub fn waiting_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_waiting()).count()
    }

    pub fn stats(&self) -> &PendingStats {
        &self.stats
    }

    /// Whether a correlation ID is present
    pub fn contains(&self, correlation_id: &CorrelationId) -> bool {
        self.entries.contains_key(correlation_id)
    }
}

/// The caller's side of a registered request.
///
/// Dropping the handle (for example because the HTTP client disconnected
/// and its future was dropped) cancels the request if still waiting and
/// removes it from the table.
pub struct PendingHandle {
    table: Arc<CorrelationTable>,
    request: Arc<PendingRequest>,
    receiver: oneshot::Receiver<Resolution>,
}

impl PendingHandle {
    pub fn correlation_id(&self) -> CorrelationId {
        self.request.correlation_id
    }

    pub fn deadline(&self) -> Instant {
        self.request.deadline
    }

    pub fn request(&self) -> &Arc<PendingRequest> {
        &self.request
    }

    /// Wait for the single resolution, timing the request out at its
    /// deadline if nobody else resolved it first.
    pub async fn wait(&mut self) -> Resolution {
        tokio::select! {
            biased;
            resolution = &mut self.receiver => resolution.unwrap_or(Resolution::Cancelled(CancelReason::Shutdown)),
            () = tokio::time::sleep_until(self.request.deadline) => {
                self.table.time_out_request(&self.request);
                // Whoever won the transition has already sent, or is about to.
                (&mut self.receiver)
                    .await
                    .unwrap_or(Resolution::Cancelled(CancelReason::Shutdown))
            }
        }
    }

    /// Mark the request as never published and remove it.
    pub fn publish_failed(self, error: impl Into<String>) {
        let error = error.into();
        if self
            .request
            .try_transition(PendingState::Cancelled, Resolution::PublishFailed(error.clone()))
        {
            self.table
                .stats
                .total_publish_failures
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                correlation_id = %self.request.correlation_id,
                device_id = %self.request.device_id,
                error = %error,
                "Command could not be published"
            );
        }
        // Drop removes the entry
    }
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        self.table
            .cancel_request(&self.request, CancelReason::CallerGone);
        self.table.remove(&self.request.correlation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(device: &str) -> CommandEnvelope {
        CommandEnvelope::new(
            DeviceId::from(device),
            "GetParameterValues",
            serde_json::json!({"names": ["Device."]}),
        )
    }

    fn register(
        table: &Arc<CorrelationTable>,
        device: &str,
        timeout: Duration,
    ) -> PendingHandle {
        table
            .register(&envelope(device), Instant::now() + timeout, timeout)
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let table = Arc::new(CorrelationTable::new());
        let mut handle = register(&table, "CPE-1", Duration::from_secs(30));
        let id = handle.correlation_id();
        assert!(table.contains(&id));
        assert_eq!(table.waiting_count(), 1);

        assert!(table.resolve(id, Ok(serde_json::json!("1.2.3"))));

        assert_eq!(
            handle.wait().await,
            Resolution::Reply(Ok(serde_json::json!("1.2.3")))
        );
        drop(handle);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_second_resolution_is_noop() {
        let table = Arc::new(CorrelationTable::new());
        let mut handle = register(&table, "CPE-1", Duration::from_secs(30));
        let id = handle.correlation_id();

        assert!(table.resolve(id, Ok(serde_json::json!(1))));
        assert!(!table.resolve(id, Ok(serde_json::json!(2))));
        assert!(!table.time_out(&id));
        assert!(!table.cancel(&id, CancelReason::Shutdown));

        assert_eq!(handle.wait().await, Resolution::Reply(Ok(serde_json::json!(1))));
        assert_eq!(handle.request().state(), PendingState::Resolved);
        assert_eq!(table.stats().snapshot().unmatched_replies, 1);
    }

    #[tokio::test]
    async fn test_resolve_unknown_id() {
        let table = CorrelationTable::new();
        assert!(!table.resolve(CorrelationId::new(), Ok(serde_json::Value::Null)));
        assert_eq!(table.stats().snapshot().unmatched_replies, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_at_deadline() {
        let table = Arc::new(CorrelationTable::new());
        let start = Instant::now();
        let mut handle = register(&table, "CPE-1", Duration::from_secs(10));

        assert_eq!(handle.wait().await, Resolution::TimedOut);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert_eq!(handle.request().state(), PendingState::TimedOut);
        // A reply after the timeout is dropped
        assert!(!table.resolve(handle.correlation_id(), Ok(serde_json::Value::Null)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lists_only_waiting_past_deadline() {
        let table = Arc::new(CorrelationTable::new());
        let short = register(&table, "CPE-1", Duration::from_secs(1));
        let _long = register(&table, "CPE-2", Duration::from_secs(60));
        let answered = register(&table, "CPE-3", Duration::from_secs(1));
        table.resolve(answered.correlation_id(), Ok(serde_json::Value::Null));

        tokio::time::advance(Duration::from_secs(2)).await;

        let expired = table.expired(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].correlation_id(), short.correlation_id());
    }

    #[tokio::test]
    async fn test_drop_handle_cancels_and_removes() {
        let table = Arc::new(CorrelationTable::new());
        let handle = register(&table, "CPE-1", Duration::from_secs(30));
        let id = handle.correlation_id();
        let request = Arc::clone(handle.request());

        drop(handle);

        assert!(!table.contains(&id));
        assert_eq!(request.state(), PendingState::Cancelled);
        assert_eq!(table.stats().snapshot().cancelled, 1);
    }

    #[tokio::test]
    async fn test_publish_failed_leaves_no_entry() {
        let table = Arc::new(CorrelationTable::new());
        let handle = register(&table, "CPE-1", Duration::from_secs(30));
        let id = handle.correlation_id();

        handle.publish_failed("bus closed");

        assert!(!table.contains(&id));
        let stats = table.stats().snapshot();
        assert_eq!(stats.publish_failures, 1);
        assert_eq!(stats.cancelled, 0);
    }

    #[tokio::test]
    async fn test_drain_cancels_waiting_and_closes() {
        let table = Arc::new(CorrelationTable::new());
        let mut a = register(&table, "CPE-1", Duration::from_secs(30));
        let mut b = register(&table, "CPE-2", Duration::from_secs(30));

        assert_eq!(table.drain(CancelReason::Shutdown), 2);
        assert_eq!(a.wait().await, Resolution::Cancelled(CancelReason::Shutdown));
        assert_eq!(b.wait().await, Resolution::Cancelled(CancelReason::Shutdown));

        let refused = table.register(
            &envelope("CPE-3"),
            Instant::now() + Duration::from_secs(1),
            Duration::from_secs(1),
        );
        assert!(matches!(
            refused,
            Err(DispatchError::Cancelled {
                reason: CancelReason::Shutdown
            })
        ));
    }

    #[test]
    fn test_register_racing_drain_never_leaves_waiting_entry() {
        for _ in 0..2_000 {
            let table = Arc::new(CorrelationTable::new());
            let barrier = Arc::new(std::sync::Barrier::new(2));

            let registering = {
                let table = Arc::clone(&table);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    table
                        .register(
                            &envelope("CPE-1"),
                            Instant::now() + Duration::from_secs(30),
                            Duration::from_secs(30),
                        )
                        .ok()
                })
            };
            barrier.wait();
            table.drain(CancelReason::Shutdown);

            if let Some(handle) = registering.join().unwrap() {
                // Registered before the drain, so the drain must have cancelled it
                assert_eq!(handle.request().state(), PendingState::Cancelled);
            }
            assert_eq!(table.waiting_count(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_resolved_after_grace() {
        let table = Arc::new(CorrelationTable::new());
        let handle = register(&table, "CPE-1", Duration::from_secs(30));
        let id = handle.correlation_id();
        // Caller never consumes the result; keep the handle alive
        table.resolve(id, Ok(serde_json::Value::Null));

        assert_eq!(table.purge_resolved(Instant::now(), Duration::from_secs(5)), 0);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(table.purge_resolved(Instant::now(), Duration::from_secs(5)), 1);
        assert!(!table.contains(&id));
        drop(handle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_resolvers_exactly_one_wins() {
        for _ in 0..200 {
            let table = Arc::new(CorrelationTable::new());
            let mut handle = register(&table, "CPE-1", Duration::from_secs(30));
            let id = handle.correlation_id();

            let mut tasks = Vec::new();
            for i in 0..4 {
                let table = Arc::clone(&table);
                tasks.push(tokio::spawn(async move {
                    match i {
                        0 => table.resolve(id, Ok(serde_json::json!(i))),
                        1 => table.time_out(&id),
                        2 => table.cancel(&id, CancelReason::CallerGone),
                        _ => table.resolve(id, Ok(serde_json::json!(i))),
                    }
                }));
            }
            let mut winners = 0;
            for task in tasks {
                if task.await.unwrap() {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1);
            let resolution = handle.wait().await;
            assert!(handle.request().state().is_terminal());
            match handle.request().state() {
                PendingState::Resolved => assert!(matches!(resolution, Resolution::Reply(_))),
                PendingState::TimedOut => assert_eq!(resolution, Resolution::TimedOut),
                PendingState::Cancelled => {
                    assert!(matches!(resolution, Resolution::Cancelled(_)))
                }
                PendingState::Waiting => unreachable!(),
            }
        }
    }
}
