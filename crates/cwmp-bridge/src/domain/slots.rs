//! Per-device serializer.
//!
//! A CWMP session processes one RPC at a time, so each device has a single
//! slot. A command holds the slot from admission until its request reaches a
//! terminal state; other commands for the same device wait in a bounded FIFO
//! queue or are rejected, depending on the busy policy. Devices never share
//! a lock: the slot map is sharded and a slot is only locked for the
//! bookkeeping itself, never across an await.

use crate::domain::config::BusyPolicy;
use crate::domain::correlation::CorrelationId;
use crate::domain::device::DeviceId;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Why a slot could not be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    #[error("device slot busy")]
    Busy,
    #[error("gave up waiting for device slot")]
    QueueTimeout,
    #[error("serializer closed")]
    Closed,
}

struct Waiter {
    correlation_id: CorrelationId,
    wake: oneshot::Sender<()>,
}

#[derive(Default)]
struct DeviceSlot {
    occupant: Option<CorrelationId>,
    waiters: VecDeque<Waiter>,
}

impl DeviceSlot {
    fn is_idle(&self) -> bool {
        self.occupant.is_none() && self.waiters.is_empty()
    }

    /// Give the slot to the first waiter still listening.
    fn hand_off(&mut self) -> Option<CorrelationId> {
        self.occupant = None;
        while let Some(waiter) = self.waiters.pop_front() {
            self.occupant = Some(waiter.correlation_id);
            if waiter.wake.send(()).is_ok() {
                return self.occupant;
            }
            self.occupant = None;
        }
        None
    }
}

/// Serializes commands per device.
pub struct DeviceSerializer {
    slots: DashMap<DeviceId, DeviceSlot>,
    policy: BusyPolicy,
    max_queue_depth: usize,
    closed: AtomicBool,
}

impl DeviceSerializer {
    pub fn new(policy: BusyPolicy, max_queue_depth: usize) -> Self {
        Self {
            slots: DashMap::new(),
            policy,
            max_queue_depth,
            closed: AtomicBool::new(false),
        }
    }

    /// Acquire the slot for `device` on behalf of `correlation_id`.
    ///
    /// If the slot is taken and the policy allows queueing, waits (at most
    /// until `wait_until`, when given) for the current occupant to release.
    pub async fn acquire(
        self: &Arc<Self>,
        device: &DeviceId,
        correlation_id: CorrelationId,
        wait_until: Option<Instant>,
    ) -> Result<SlotPermit, AcquireError> {
        let wake = {
            if self.closed.load(Ordering::Acquire) {
                return Err(AcquireError::Closed);
            }
            let mut slot = self.slots.entry(device.clone()).or_default();
            let occupant = slot.occupant;
            match occupant {
                None => {
                    slot.occupant = Some(correlation_id);
                    trace!(device_id = %device, correlation_id = %correlation_id, "Slot acquired");
                    return Ok(self.permit(device, correlation_id));
                }
                Some(_) if self.policy == BusyPolicy::Reject => {
                    return Err(AcquireError::Busy);
                }
                Some(_) if slot.waiters.len() >= self.max_queue_depth => {
                    debug!(device_id = %device, depth = slot.waiters.len(), "Device queue full");
                    return Err(AcquireError::Busy);
                }
                Some(_) => {
                    let (tx, rx) = oneshot::channel();
                    slot.waiters.push_back(Waiter {
                        correlation_id,
                        wake: tx,
                    });
                    debug!(
                        device_id = %device,
                        correlation_id = %correlation_id,
                        position = slot.waiters.len(),
                        "Queued behind in-flight command"
                    );
                    rx
                }
            }
        };

        // Leaves the queue (or releases a slot handed over too late) unless
        // the wait ends in a permit.
        let mut guard = QueueGuard {
            serializer: self,
            device,
            correlation_id,
            armed: true,
        };

        let woken = match wait_until {
            Some(deadline) => match tokio::time::timeout_at(deadline, wake).await {
                Ok(result) => result,
                Err(_) => return Err(AcquireError::QueueTimeout),
            },
            None => wake.await,
        };

        match woken {
            Ok(()) => {
                guard.armed = false;
                Ok(self.permit(device, correlation_id))
            }
            Err(_) => Err(AcquireError::Closed),
        }
    }

    fn permit(self: &Arc<Self>, device: &DeviceId, correlation_id: CorrelationId) -> SlotPermit {
        SlotPermit {
            serializer: Arc::clone(self),
            device: device.clone(),
            correlation_id,
        }
    }

    /// Release the slot if `correlation_id` still occupies it, handing it to
    /// the next waiter. Also removes `correlation_id` from the queue. Calling
    /// this for a request that does not hold the slot is a no-op, so the
    /// reaper and the permit's drop may both call it.
    pub fn release_if(&self, device: &DeviceId, correlation_id: CorrelationId) {
        let Some(mut slot) = self.slots.get_mut(device) else {
            return;
        };
        slot.waiters
            .retain(|waiter| waiter.correlation_id != correlation_id);
        if slot.occupant == Some(correlation_id) {
            let next = slot.hand_off();
            trace!(
                device_id = %device,
                released = %correlation_id,
                next = ?next,
                "Slot released"
            );
        }
        let idle = slot.is_idle();
        drop(slot);
        if idle {
            self.slots.remove_if(device, |_, slot| slot.is_idle());
        }
    }

    /// Stop admitting commands and wake every queued waiter with `Closed`.
    /// Current occupants keep their slot until they release it.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for mut slot in self.slots.iter_mut() {
            slot.waiters.clear();
        }
    }

    /// Correlation ID currently holding `device`'s slot.
    pub fn occupant(&self, device: &DeviceId) -> Option<CorrelationId> {
        self.slots.get(device).and_then(|slot| slot.occupant)
    }

    /// Number of commands queued behind `device`'s occupant.
    pub fn queued(&self, device: &DeviceId) -> usize {
        self.slots.get(device).map_or(0, |slot| slot.waiters.len())
    }

    /// Number of devices with a command in flight.
    pub fn busy_devices(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.occupant.is_some())
            .count()
    }
}

struct QueueGuard<'a> {
    serializer: &'a DeviceSerializer,
    device: &'a DeviceId,
    correlation_id: CorrelationId,
    armed: bool,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.serializer
                .release_if(self.device, self.correlation_id);
        }
    }
}

/// Ownership of one device slot. Dropping it releases the slot.
#[must_use = "the device slot is released as soon as the permit is dropped"]
pub struct SlotPermit {
    serializer: Arc<DeviceSerializer>,
    device: DeviceId,
    correlation_id: CorrelationId,
}

impl SlotPermit {
    pub fn device_id(&self) -> &DeviceId {
        &self.device
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }
}

impl std::fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPermit")
            .field("device", &self.device)
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.serializer
            .release_if(&self.device, self.correlation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn serializer(policy: BusyPolicy, depth: usize) -> Arc<DeviceSerializer> {
        Arc::new(DeviceSerializer::new(policy, depth))
    }

    #[tokio::test]
    async fn test_free_slot_acquired_immediately() {
        let slots = serializer(BusyPolicy::Queue, 4);
        let device = DeviceId::from("CPE-1");
        let id = CorrelationId::new();

        let permit = slots.acquire(&device, id, None).await.unwrap();
        assert_eq!(slots.occupant(&device), Some(id));
        assert_eq!(slots.busy_devices(), 1);

        drop(permit);
        assert_eq!(slots.occupant(&device), None);
        assert_eq!(slots.busy_devices(), 0);
    }

    #[tokio::test]
    async fn test_reject_policy() {
        let slots = serializer(BusyPolicy::Reject, 0);
        let device = DeviceId::from("CPE-1");
        let _held = slots.acquire(&device, CorrelationId::new(), None).await.unwrap();

        let second = slots.acquire(&device, CorrelationId::new(), None).await;
        assert_eq!(second.unwrap_err(), AcquireError::Busy);
    }

    #[tokio::test]
    async fn test_distinct_devices_do_not_block() {
        let slots = serializer(BusyPolicy::Reject, 0);
        let _a = slots
            .acquire(&DeviceId::from("CPE-1"), CorrelationId::new(), None)
            .await
            .unwrap();
        let b = slots
            .acquire(&DeviceId::from("CPE-2"), CorrelationId::new(), None)
            .await;
        assert!(b.is_ok());
        assert_eq!(slots.busy_devices(), 2);
    }

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let slots = serializer(BusyPolicy::Queue, 4);
        let device = DeviceId::from("CPE-1");
        let first = slots.acquire(&device, CorrelationId::new(), None).await.unwrap();

        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut tasks = Vec::new();
        for n in 0..3 {
            let task_slots = Arc::clone(&slots);
            let task_device = device.clone();
            let order_tx = order_tx.clone();
            tasks.push(tokio::spawn(async move {
                let permit = task_slots
                    .acquire(&task_device, CorrelationId::new(), None)
                    .await
                    .unwrap();
                order_tx.send(n).unwrap();
                drop(permit);
            }));
            // Make sure each task is queued before spawning the next
            while slots.queued(&device) < n + 1 {
                tokio::task::yield_now().await;
            }
        }

        drop(first);
        for task in tasks {
            task.await.unwrap();
        }
        drop(order_tx);

        let mut order = Vec::new();
        while let Some(n) = order_rx.recv().await {
            order.push(n);
        }
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(slots.occupant(&device), None);
    }

    #[tokio::test]
    async fn test_full_queue_is_busy() {
        let slots = serializer(BusyPolicy::Queue, 1);
        let device = DeviceId::from("CPE-1");
        let _held = slots.acquire(&device, CorrelationId::new(), None).await.unwrap();

        let queued = {
            let slots = Arc::clone(&slots);
            let device = device.clone();
            tokio::spawn(async move { slots.acquire(&device, CorrelationId::new(), None).await })
        };
        while slots.queued(&device) < 1 {
            tokio::task::yield_now().await;
        }

        let overflow = slots.acquire(&device, CorrelationId::new(), None).await;
        assert_eq!(overflow.unwrap_err(), AcquireError::Busy);
        queued.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout_leaves_queue() {
        let slots = serializer(BusyPolicy::Queue, 4);
        let device = DeviceId::from("CPE-1");
        let held = slots.acquire(&device, CorrelationId::new(), None).await.unwrap();

        let waited = slots
            .acquire(
                &device,
                CorrelationId::new(),
                Some(Instant::now() + Duration::from_secs(3)),
            )
            .await;
        assert_eq!(waited.unwrap_err(), AcquireError::QueueTimeout);
        assert_eq!(slots.queued(&device), 0);

        drop(held);
        assert_eq!(slots.occupant(&device), None);
    }

    #[tokio::test]
    async fn test_release_by_stale_id_is_noop() {
        let slots = serializer(BusyPolicy::Queue, 4);
        let device = DeviceId::from("CPE-1");
        let id = CorrelationId::new();
        let _permit = slots.acquire(&device, id, None).await.unwrap();

        slots.release_if(&device, CorrelationId::new());
        assert_eq!(slots.occupant(&device), Some(id));
    }

    #[tokio::test]
    async fn test_early_release_then_permit_drop() {
        let slots = serializer(BusyPolicy::Queue, 4);
        let device = DeviceId::from("CPE-1");
        let first_id = CorrelationId::new();
        let first = slots.acquire(&device, first_id, None).await.unwrap();

        let second_id = CorrelationId::new();
        let second = {
            let slots = Arc::clone(&slots);
            let device = device.clone();
            tokio::spawn(async move { slots.acquire(&device, second_id, None).await })
        };
        while slots.queued(&device) < 1 {
            tokio::task::yield_now().await;
        }

        // Reaper releases on timeout; the late permit drop must not free
        // the slot now owned by the second command
        slots.release_if(&device, first_id);
        let second = second.await.unwrap().unwrap();
        drop(first);
        assert_eq!(slots.occupant(&device), Some(second_id));
        drop(second);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let slots = serializer(BusyPolicy::Queue, 4);
        let device = DeviceId::from("CPE-1");
        let _held = slots.acquire(&device, CorrelationId::new(), None).await.unwrap();

        let waiting = {
            let slots = Arc::clone(&slots);
            let device = device.clone();
            tokio::spawn(async move { slots.acquire(&device, CorrelationId::new(), None).await })
        };
        while slots.queued(&device) < 1 {
            tokio::task::yield_now().await;
        }

        slots.close();
        assert_eq!(waiting.await.unwrap().unwrap_err(), AcquireError::Closed);
        assert_eq!(
            slots
                .acquire(&DeviceId::from("CPE-2"), CorrelationId::new(), None)
                .await
                .unwrap_err(),
            AcquireError::Closed
        );
    }
}
