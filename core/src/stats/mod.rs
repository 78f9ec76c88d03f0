//! Performance counters.
//!
//! Every pipeline thread registers a private counter block and updates it
//! with plain atomic adds on the hot path. A wakeup thread merges all blocks
//! every few seconds into a global snapshot table that stats loggers
//! consume. Additive counters sum across threads; gauge-like counters take
//! the maximum.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{tick, RecvTimeoutError, Sender};

/// The closed set of engine counters.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(usize)]
pub enum Counter {
    DecoderPkts,
    DecoderBytes,
    DecoderInvalid,
    DecoderTcp,
    DecoderUdp,
    DecoderIcmp,
    FlowNew,
    FlowTimeout,
    FlowEmergency,
    FlowTablePeak,
    TcpSessions,
    TcpInvalidSeq,
    TcpInvalidRst,
    TcpReasmGaps,
    TcpReasmMemcap,
    StreamMsgs,
    DetectScans,
    DetectAlerts,
    VerdictAccept,
    VerdictDrop,
    VerdictReject,
    OutputLogged,
    OutputErrors,
    PoolDepleted,
}

impl Counter {
    pub const COUNT: usize = 24;

    pub fn name(&self) -> &'static str {
        match self {
            Counter::DecoderPkts => "decoder.pkts",
            Counter::DecoderBytes => "decoder.bytes",
            Counter::DecoderInvalid => "decoder.invalid",
            Counter::DecoderTcp => "decoder.tcp",
            Counter::DecoderUdp => "decoder.udp",
            Counter::DecoderIcmp => "decoder.icmp",
            Counter::FlowNew => "flow.new",
            Counter::FlowTimeout => "flow.timeout",
            Counter::FlowEmergency => "flow.emergency",
            Counter::FlowTablePeak => "flow.table_peak",
            Counter::TcpSessions => "tcp.sessions",
            Counter::TcpInvalidSeq => "tcp.invalid_seq",
            Counter::TcpInvalidRst => "tcp.invalid_rst",
            Counter::TcpReasmGaps => "tcp.reassembly_gaps",
            Counter::TcpReasmMemcap => "tcp.reassembly_memcap",
            Counter::StreamMsgs => "stream.msgs",
            Counter::DetectScans => "detect.scans",
            Counter::DetectAlerts => "detect.alerts",
            Counter::VerdictAccept => "verdict.accept",
            Counter::VerdictDrop => "verdict.drop",
            Counter::VerdictReject => "verdict.reject",
            Counter::OutputLogged => "output.logged",
            Counter::OutputErrors => "output.errors",
            Counter::PoolDepleted => "pool.depleted",
        }
    }

    /// Gauge-like counters merge by maximum instead of summation.
    fn is_max(&self) -> bool {
        matches!(self, Counter::FlowTablePeak)
    }

    const ALL: [Counter; Counter::COUNT] = [
        Counter::DecoderPkts,
        Counter::DecoderBytes,
        Counter::DecoderInvalid,
        Counter::DecoderTcp,
        Counter::DecoderUdp,
        Counter::DecoderIcmp,
        Counter::FlowNew,
        Counter::FlowTimeout,
        Counter::FlowEmergency,
        Counter::FlowTablePeak,
        Counter::TcpSessions,
        Counter::TcpInvalidSeq,
        Counter::TcpInvalidRst,
        Counter::TcpReasmGaps,
        Counter::TcpReasmMemcap,
        Counter::StreamMsgs,
        Counter::DetectScans,
        Counter::DetectAlerts,
        Counter::VerdictAccept,
        Counter::VerdictDrop,
        Counter::VerdictReject,
        Counter::OutputLogged,
        Counter::OutputErrors,
        Counter::PoolDepleted,
    ];

    fn all() -> impl Iterator<Item = Counter> {
        Self::ALL.into_iter()
    }
}

/// One thread's counter block.
#[derive(Debug)]
pub struct ThreadCounters {
    name: String,
    vals: Vec<AtomicU64>,
}

impl ThreadCounters {
    fn new(name: &str) -> Self {
        ThreadCounters {
            name: name.to_string(),
            vals: (0..Counter::COUNT).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    pub fn incr(&self, c: Counter) {
        self.add(c, 1);
    }

    #[inline]
    pub fn add(&self, c: Counter, n: u64) {
        self.vals[c as usize].fetch_add(n, Ordering::Relaxed);
    }

    /// Raises the counter to `v` if larger.
    #[inline]
    pub fn set_max(&self, c: Counter, v: u64) {
        self.vals[c as usize].fetch_max(v, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self, c: Counter) -> u64 {
        self.vals[c as usize].load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Read-only merged snapshot handed to stats loggers.
pub type StatsTable = BTreeMap<&'static str, u64>;

/// Engine-wide counter registry.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    threads: Mutex<Vec<Arc<ThreadCounters>>>,
    snapshot: Mutex<StatsTable>,
}

impl StatsRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(StatsRegistry::default())
    }

    pub fn register_thread(&self, name: &str) -> Arc<ThreadCounters> {
        let counters = Arc::new(ThreadCounters::new(name));
        self.threads.lock().unwrap().push(Arc::clone(&counters));
        counters
    }

    /// Merges all thread blocks into the global snapshot and returns it.
    pub fn aggregate(&self) -> StatsTable {
        let threads = self.threads.lock().unwrap();
        let mut table = StatsTable::new();
        for c in Counter::all() {
            let merged = if c.is_max() {
                threads.iter().map(|t| t.get(c)).max().unwrap_or(0)
            } else {
                threads.iter().map(|t| t.get(c)).sum()
            };
            table.insert(c.name(), merged);
        }
        let mut snapshot = self.snapshot.lock().unwrap();
        *snapshot = table.clone();
        table
    }

    /// Last merged snapshot.
    pub fn snapshot(&self) -> StatsTable {
        self.snapshot.lock().unwrap().clone()
    }
}

/// The wakeup thread body: merges every `interval` until `kill` is raised.
/// Each merged snapshot is also offered to `snapshots` (the output stage's
/// stats loggers) when a channel is given.
pub fn aggregator_loop(
    registry: Arc<StatsRegistry>,
    interval: Duration,
    kill: Arc<AtomicBool>,
    snapshots: Option<Sender<StatsTable>>,
) {
    log::info!("stats aggregator started, interval {:?}", interval);
    let ticker = tick(interval);
    while !kill.load(Ordering::Acquire) {
        match ticker.recv_timeout(Duration::from_millis(100)) {
            Ok(_) => {
                let table = registry.aggregate();
                if let Some(tx) = &snapshots {
                    let _ = tx.try_send(table);
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    registry.aggregate();
    log::info!("stats aggregator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn additive_counters_sum_across_threads() {
        let registry = StatsRegistry::new();
        let a = registry.register_thread("worker-0");
        let b = registry.register_thread("worker-1");
        a.add(Counter::DecoderPkts, 5);
        b.add(Counter::DecoderPkts, 7);
        let table = registry.aggregate();
        assert_eq!(table["decoder.pkts"], 12);
    }

    #[test]
    fn max_counters_take_the_peak() {
        let registry = StatsRegistry::new();
        let a = registry.register_thread("a");
        let b = registry.register_thread("b");
        a.set_max(Counter::FlowTablePeak, 10);
        a.set_max(Counter::FlowTablePeak, 4); // lower value is ignored
        b.set_max(Counter::FlowTablePeak, 8);
        let table = registry.aggregate();
        assert_eq!(table["flow.table_peak"], 10);
    }

    #[test]
    fn snapshot_reflects_last_aggregate() {
        let registry = StatsRegistry::new();
        let t = registry.register_thread("t");
        t.incr(Counter::DetectAlerts);
        registry.aggregate();
        assert_eq!(registry.snapshot()["detect.alerts"], 1);
    }

    #[test]
    fn every_counter_has_a_distinct_name() {
        let names: std::collections::HashSet<_> = Counter::all().map(|c| c.name()).collect();
        assert_eq!(names.len(), Counter::COUNT);
    }
}
