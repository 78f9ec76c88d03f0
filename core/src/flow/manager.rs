//! Flow manager thread.
//!
//! Periodically walks the flow table and reclaims idle flows. Runs on the
//! management thread set; the engine clock it compares against is advanced
//! by the source stage, which keeps offline runs deterministic.

use crate::flow::FlowTable;
use crate::stats::{Counter, ThreadCounters};
use crate::utils::time::EngineClock;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{tick, RecvTimeoutError};

/// Interval between kill-flag polls while waiting on the ticker.
const POLL_QUANTUM_MS: u64 = 100;

pub struct FlowManager {
    table: Arc<FlowTable>,
    clock: Arc<EngineClock>,
    counters: Arc<ThreadCounters>,
    interval: Duration,
}

impl FlowManager {
    pub fn new(
        table: Arc<FlowTable>,
        clock: Arc<EngineClock>,
        counters: Arc<ThreadCounters>,
        interval: Duration,
    ) -> Self {
        FlowManager {
            table,
            clock,
            counters,
            interval,
        }
    }

    /// Runs until `kill` is raised. Intended for a dedicated thread.
    pub fn run(&self, kill: Arc<AtomicBool>) {
        log::info!("flow manager started, interval {:?}", self.interval);
        let ticker = tick(self.interval);
        while !kill.load(Ordering::Acquire) {
            match ticker.recv_timeout(Duration::from_millis(POLL_QUANTUM_MS)) {
                Ok(_) => self.sweep(),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        // Final sweep so idle flows are accounted before shutdown drain.
        self.sweep();
        log::info!("flow manager stopped, {} flows left", self.table.len());
    }

    /// One reclamation pass over the table.
    pub fn sweep(&self) {
        let now = self.clock.get();
        let removed = self.table.expire(now);
        if removed > 0 {
            self.counters.add(Counter::FlowTimeout, removed as u64);
            log::debug!("reclaimed {} idle flows, {} left", removed, self.table.len());
        }
        if self.table.in_emergency() {
            self.counters.incr(Counter::FlowEmergency);
        }
        self.counters
            .set_max(Counter::FlowTablePeak, self.table.len() as u64);
    }
}
