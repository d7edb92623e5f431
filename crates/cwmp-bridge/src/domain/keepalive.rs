//! Keep-alive monitor: last-seen activity per device.
//!
//! Advisory only. Liveness never resolves a pending request; it only lets
//! the dispatcher fail fast for devices whose session is known to be gone.

use crate::domain::device::DeviceId;
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Session state of a device as seen by the keep-alive monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    /// Activity within the keep-alive interval.
    Alive,
    /// Seen before, but not within the keep-alive interval.
    Expired,
    /// Never seen since this process started.
    Unknown,
}

#[derive(Debug, Clone, Copy)]
struct Session {
    last_seen: Instant,
    /// Set once the expiry has been reported
    expired: bool,
}

/// Expired sessions are dropped once unseen for this many keep-alive
/// intervals; after that the device reads as `Unknown` again.
pub const SESSION_RETENTION_INTERVALS: u32 = 12;

/// Tracks device sessions.
pub struct KeepAliveMonitor {
    sessions: DashMap<DeviceId, Session>,
    interval: Duration,
}

impl KeepAliveMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            interval,
        }
    }

    /// Record activity from `device`.
    pub fn touch(&self, device: &DeviceId) {
        let now = Instant::now();
        let mut session = self.sessions.entry(device.clone()).or_insert(Session {
            last_seen: now,
            expired: false,
        });
        if session.expired {
            info!(device_id = %device, "Device session resumed");
        }
        session.last_seen = now;
        session.expired = false;
    }

    /// Liveness of `device` at `now`.
    pub fn liveness_at(&self, device: &DeviceId, now: Instant) -> Liveness {
        match self.sessions.get(device) {
            None => Liveness::Unknown,
            Some(session) if now.saturating_duration_since(session.last_seen) <= self.interval => {
                Liveness::Alive
            }
            Some(_) => Liveness::Expired,
        }
    }

    pub fn liveness(&self, device: &DeviceId) -> Liveness {
        self.liveness_at(device, Instant::now())
    }

    /// Whether `device` had activity within the keep-alive interval.
    /// Unknown devices are not alive.
    pub fn is_alive(&self, device: &DeviceId) -> bool {
        self.liveness(device) == Liveness::Alive
    }

    /// Time since `device` was last seen.
    pub fn last_seen_ago(&self, device: &DeviceId) -> Option<Duration> {
        self.sessions
            .get(device)
            .map(|session| session.last_seen.elapsed())
    }

    /// Flag sessions that went stale since the last sweep and return them.
    pub fn expire_stale(&self, now: Instant) -> Vec<DeviceId> {
        let mut expired = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            let session = entry.value_mut();
            if !session.expired && now.saturating_duration_since(session.last_seen) > self.interval
            {
                session.expired = true;
                expired.push(entry.key().clone());
            }
        }
        for device in &expired {
            debug!(device_id = %device, "Device session expired");
        }
        expired
    }

    /// Drop sessions unseen for [`SESSION_RETENTION_INTERVALS`] intervals.
    /// Returns the number removed.
    pub fn prune(&self, now: Instant) -> usize {
        let retention = self.interval * SESSION_RETENTION_INTERVALS;
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| now.saturating_duration_since(session.last_seen) <= retention);
        before.saturating_sub(self.sessions.len())
    }

    /// Number of devices with a session record.
    pub fn tracked(&self) -> usize {
        self.sessions.len()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_touch_then_expire() {
        let monitor = KeepAliveMonitor::new(Duration::from_secs(300));
        let device = DeviceId::from("CPE-1");

        assert_eq!(monitor.liveness(&device), Liveness::Unknown);
        assert!(!monitor.is_alive(&device));

        monitor.touch(&device);
        assert!(monitor.is_alive(&device));

        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(monitor.is_alive(&device));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(monitor.liveness(&device), Liveness::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_stale_reports_once() {
        let monitor = KeepAliveMonitor::new(Duration::from_secs(10));
        let stale = DeviceId::from("CPE-1");
        let fresh = DeviceId::from("CPE-2");
        monitor.touch(&stale);
        tokio::time::advance(Duration::from_secs(8)).await;
        monitor.touch(&fresh);
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(monitor.expire_stale(Instant::now()), vec![stale.clone()]);
        assert!(monitor.expire_stale(Instant::now()).is_empty());
        // Still tracked as expired, not forgotten
        assert_eq!(monitor.liveness(&stale), Liveness::Expired);
        assert!(monitor.is_alive(&fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_revives_expired_session() {
        let monitor = KeepAliveMonitor::new(Duration::from_secs(10));
        let device = DeviceId::from("CPE-1");
        monitor.touch(&device);
        tokio::time::advance(Duration::from_secs(11)).await;
        monitor.expire_stale(Instant::now());

        monitor.touch(&device);
        assert_eq!(monitor.liveness(&device), Liveness::Alive);
        assert_eq!(monitor.last_seen_ago(&device), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_after_retention() {
        let monitor = KeepAliveMonitor::new(Duration::from_secs(10));
        let gone = DeviceId::from("CPE-1");
        let recent = DeviceId::from("CPE-2");
        monitor.touch(&gone);
        tokio::time::advance(Duration::from_secs(100)).await;
        monitor.touch(&recent);

        assert_eq!(monitor.prune(Instant::now()), 0);
        assert_eq!(monitor.liveness(&gone), Liveness::Expired);

        tokio::time::advance(Duration::from_secs(21)).await;
        assert_eq!(monitor.prune(Instant::now()), 1);
        assert_eq!(monitor.tracked(), 1);
        assert_eq!(monitor.liveness(&gone), Liveness::Unknown);
        assert_eq!(monitor.liveness(&recent), Liveness::Expired);
    }
}
