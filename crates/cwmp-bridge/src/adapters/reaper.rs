//! Timeout reaper.
//!
//! Backstop for the per-request deadline timer: resolves requests whose
//! caller is not polling (stuck or gone) and frees their device slot, purges
//! terminal entries nobody collected, and expires stale keep-alive sessions.

use crate::domain::keepalive::KeepAliveMonitor;
use crate::domain::pending::CorrelationTable;
use crate::domain::slots::DeviceSerializer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: usize,
    pub purged: usize,
    pub sessions_expired: usize,
    pub sessions_pruned: usize,
}

pub struct TimeoutReaper {
    table: Arc<CorrelationTable>,
    slots: Arc<DeviceSerializer>,
    keep_alive: Arc<KeepAliveMonitor>,
    interval: Duration,
    grace: Duration,
}

impl TimeoutReaper {
    pub fn new(
        table: Arc<CorrelationTable>,
        slots: Arc<DeviceSerializer>,
        keep_alive: Arc<KeepAliveMonitor>,
        interval: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            table,
            slots,
            keep_alive,
            interval,
            grace,
        }
    }

    /// One pass over the table and the keep-alive sessions.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        for request in self.table.expired(now) {
            if self.table.time_out_request(&request) {
                self.slots
                    .release_if(request.device_id(), request.correlation_id());
                report.timed_out += 1;
            }
        }

        report.purged = self.table.purge_resolved(now, self.grace);
        report.sessions_expired = self.keep_alive.expire_stale(now).len();
        report.sessions_pruned = self.keep_alive.prune(now);
        report
    }

    /// Sweep every `interval` until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_ms = self.interval.as_millis() as u64, "[TimeoutReaper] Started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep(Instant::now());
                    if report != SweepReport::default() {
                        debug!(
                            timed_out = report.timed_out,
                            purged = report.purged,
                            sessions_expired = report.sessions_expired,
                            sessions_pruned = report.sessions_pruned,
                            "Reaper sweep"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    debug!("[TimeoutReaper] Shutdown signalled");
                    break;
                }
            }
        }
    }
}
