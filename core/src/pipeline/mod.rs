//! Pipeline stages and thread-variables.
//!
//! Each stage thread is a [`StageWorker`]: a named thread-variable with a
//! control-flag word, an input (a packet source or an inter-stage queue),
//! an ordered list of [`Slot`]s, and a sink (a queue handler toward the
//! next stage, or the output fan-out). A slot may spawn extra packets:
//! pre-queue packets (tunnel inners) are run through the remaining slots
//! before the current packet, post-queue packets after it.
//!
//! A failed slot marks the thread-variable failed, returns every in-flight
//! packet to the pool, and lets the controller initiate global shutdown.
//! Per-packet decode problems are not failures; they travel as packet
//! events.

pub mod queue;

pub use queue::{PacketQueue, QueueHandler};

use crate::decode;
use crate::detect::{DetectEngine, DetectThreadCtx};
use crate::flow::table::Attach;
use crate::flow::FlowTable;
use crate::memory::Pool;
use crate::output::OutputPlugin;
use crate::packet::{Packet, PacketAction, PacketFlags, Transport, TunnelRef, TunnelRoot};
use crate::respond::craft_response;
use crate::source::{PacketSource, PollStatus, VerdictSink};
use crate::stats::{Counter, StatsTable, ThreadCounters};
use crate::stream::StreamEngine;
use crate::utils::time::EngineClock;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::Receiver;
use thiserror::Error;

// Thread-variable control flags.
pub const THV_INIT_DONE: u32 = 0x01;
pub const THV_PAUSE: u32 = 0x02;
pub const THV_KILL: u32 = 0x04;
pub const THV_RUNNING_DONE: u32 = 0x08;
pub const THV_DEINIT_DONE: u32 = 0x10;
pub const THV_CLOSED: u32 = 0x20;
pub const THV_FAILED: u32 = 0x40;

/// Control-flag word of one pipeline thread.
#[derive(Debug, Default)]
pub struct TvFlags(AtomicU32);

impl TvFlags {
    pub fn set(&self, bits: u32) {
        self.0.fetch_or(bits, Ordering::AcqRel);
    }

    pub fn is_set(&self, bits: u32) -> bool {
        self.0.load(Ordering::Acquire) & bits != 0
    }
}

/// Identity and control state of one stage thread.
#[derive(Debug)]
pub struct ThreadVars {
    pub name: String,
    pub flags: Arc<TvFlags>,
}

impl ThreadVars {
    pub fn new(name: &str) -> Self {
        ThreadVars {
            name: name.to_string(),
            flags: Arc::new(TvFlags::default()),
        }
    }
}

#[derive(Error, Debug)]
pub enum SlotError {
    #[error("slot {0} failed: {1}")]
    Failed(&'static str, String),
}

/// The closed set of per-packet stage modules.
pub enum Slot {
    Decode(DecodeSlot),
    FlowAttach(FlowSlot),
    Stream(StreamSlot),
    Detect(DetectSlot),
    Respond(RespondSlot),
}

impl Slot {
    fn process(
        &mut self,
        pkt: &mut Packet,
        pre: &mut Vec<Packet>,
        _post: &mut Vec<Packet>,
    ) -> Result<(), SlotError> {
        match self {
            Slot::Decode(s) => s.process(pkt, pre),
            Slot::FlowAttach(s) => s.process(pkt),
            Slot::Stream(s) => s.process(pkt),
            Slot::Detect(s) => s.process(pkt),
            Slot::Respond(s) => s.process(pkt),
        }
    }
}

/// Decode stage: header parsing plus tunnel-inner extraction.
pub struct DecodeSlot {
    pub pool: Arc<Pool<Packet>>,
    pub counters: Arc<ThreadCounters>,
}

impl DecodeSlot {
    fn process(&mut self, pkt: &mut Packet, pre: &mut Vec<Packet>) -> Result<(), SlotError> {
        self.counters.incr(Counter::DecoderPkts);
        self.counters.add(Counter::DecoderBytes, pkt.data.len() as u64);

        let inner = decode::decode(pkt);
        if pkt.events != 0 {
            self.counters.incr(Counter::DecoderInvalid);
        }
        match pkt.transport {
            Some(Transport::Tcp(_)) => self.counters.incr(Counter::DecoderTcp),
            Some(Transport::Udp(_)) => self.counters.incr(Counter::DecoderUdp),
            Some(Transport::Icmp(_)) => self.counters.incr(Counter::DecoderIcmp),
            None => {}
        }

        if let Some(inner_ref) = inner {
            match self.pool.try_get() {
                Ok(mut ipkt) => {
                    ipkt.init(&pkt.data[inner_ref.offset..], inner_ref.datalink, pkt.ts);
                    ipkt.recursion_level = pkt.recursion_level + 1;
                    ipkt.flags |= PacketFlags::TunnelInner;
                    // Verdict of the wrapper waits for the inner sibling.
                    let root = Arc::new(TunnelRoot::new(1));
                    pkt.tunnel = Some(TunnelRef {
                        root: Arc::clone(&root),
                        is_root: true,
                    });
                    ipkt.tunnel = Some(TunnelRef {
                        root,
                        is_root: false,
                    });
                    // Decode the inner frame here; it skips this slot when
                    // re-inserted ahead of its wrapper.
                    decode::decode(&mut ipkt);
                    pre.push(ipkt);
                }
                Err(_) => {
                    self.counters.incr(Counter::PoolDepleted);
                    log::warn!("packet pool empty, tunnel inner frame not inspected");
                }
            }
        }
        Ok(())
    }
}

/// Flow lookup/creation stage.
pub struct FlowSlot {
    pub table: Arc<FlowTable>,
    pub clock: Arc<EngineClock>,
    pub counters: Arc<ThreadCounters>,
}

impl FlowSlot {
    fn process(&mut self, pkt: &mut Packet) -> Result<(), SlotError> {
        self.clock.set(pkt.ts);
        match self.table.handle_packet(pkt) {
            Some(Attach::Created) => self.counters.incr(Counter::FlowNew),
            Some(Attach::Existing) => {}
            None => {
                if self.table.in_emergency() {
                    self.counters.incr(Counter::FlowEmergency);
                }
            }
        }
        Ok(())
    }
}

/// TCP stream stage.
pub struct StreamSlot {
    pub engine: Arc<StreamEngine>,
}

impl StreamSlot {
    fn process(&mut self, pkt: &mut Packet) -> Result<(), SlotError> {
        self.engine.handle_packet(pkt);
        Ok(())
    }
}

/// Detection stage.
pub struct DetectSlot {
    pub engine: Arc<DetectEngine>,
    pub ctx: DetectThreadCtx,
    pub counters: Arc<ThreadCounters>,
}

impl DetectSlot {
    fn process(&mut self, pkt: &mut Packet) -> Result<(), SlotError> {
        self.counters.incr(Counter::DetectScans);
        let alerts = self.engine.match_packet(pkt, &mut self.ctx);
        if alerts > 0 {
            self.counters.add(Counter::DetectAlerts, alerts as u64);
        }
        Ok(())
    }
}

/// Verdict/response stage.
pub struct RespondSlot {
    /// Response frames awaiting injection by the source thread.
    pub rejects: Option<Arc<Mutex<Vec<Vec<u8>>>>>,
    /// Inline verdict target; `None` for passive captures.
    pub verdicts: Option<Arc<Mutex<dyn VerdictSink>>>,
    pub counters: Arc<ThreadCounters>,
}

impl RespondSlot {
    fn process(&mut self, pkt: &mut Packet) -> Result<(), SlotError> {
        // Tunnel bookkeeping: inners report to the root, the root applies
        // any inherited drop. Inners run ahead of their wrapper on the same
        // thread, so the root sees the final count here.
        if let Some(tunnel) = &pkt.tunnel {
            if !tunnel.is_root {
                tunnel.root.report(pkt.verdict_is_drop());
            } else if tunnel.root.should_drop() {
                pkt.action |= PacketAction::Drop;
            }
        }

        if pkt.action.contains(PacketAction::Reject) {
            self.counters.incr(Counter::VerdictReject);
            if let Some(rejects) = &self.rejects {
                if let Some(frame) = craft_response(pkt) {
                    rejects.lock().unwrap().push(frame);
                }
            }
        } else if pkt.verdict_is_drop() {
            self.counters.incr(Counter::VerdictDrop);
        } else {
            self.counters.incr(Counter::VerdictAccept);
        }

        // Tunnel inner packets never reach the wire themselves; the root's
        // verdict covers the whole wrapper.
        if let Some(sink) = &self.verdicts {
            if pkt.tunnel.as_ref().map_or(true, |t| t.is_root) {
                if let Err(e) = sink.lock().unwrap().verdict(pkt, pkt.verdict_is_drop()) {
                    log::warn!("verdict application failed: {}", e);
                }
            }
        }
        Ok(())
    }
}

/// Returns a finished packet's references and buffer to their pools.
pub fn release_packet(mut pkt: Packet, pool: &Pool<Packet>) {
    // Stream messages drop their flow references on drop.
    pkt.stream_msgs.clear();
    if let Some(flow) = pkt.flow.take() {
        flow.decr_use();
    }
    pool.put(pkt);
}

/// Terminal sink: fan out to loggers, then recycle the packet.
pub struct OutputSink {
    pub loggers: Vec<Box<dyn OutputPlugin>>,
    pub pool: Arc<Pool<Packet>>,
    pub counters: Arc<ThreadCounters>,
}

impl OutputSink {
    fn consume(&mut self, pkt: Packet) {
        for logger in self.loggers.iter_mut() {
            match logger.log(&pkt) {
                Ok(()) => self.counters.incr(Counter::OutputLogged),
                Err(e) => {
                    // Best-effort logging: count and continue.
                    self.counters.incr(Counter::OutputErrors);
                    log::warn!("output {} failed: {}", logger.name(), e);
                }
            }
        }
        release_packet(pkt, &self.pool);
    }

    fn log_stats(&mut self, stats: &StatsTable) {
        for logger in self.loggers.iter_mut() {
            if let Err(e) = logger.log_stats(stats) {
                self.counters.incr(Counter::OutputErrors);
                log::warn!("stats output {} failed: {}", logger.name(), e);
            }
        }
    }

    fn deinit(&mut self) {
        for logger in self.loggers.iter_mut() {
            if let Err(e) = logger.deinit() {
                log::warn!("output {} deinit failed: {}", logger.name(), e);
            }
        }
    }
}

/// Where a stage's processed packets go.
pub enum StageSink {
    Forward(QueueHandler),
    Output(OutputSink),
}

impl StageSink {
    fn consume(&mut self, pkt: Packet) {
        match self {
            StageSink::Forward(handler) => handler.dispatch(pkt),
            StageSink::Output(sink) => sink.consume(pkt),
        }
    }
}

/// Runs a packet through `slots[idx..]` and into the sink. Pre-queue
/// packets from a slot take the remaining slots ahead of the current
/// packet; post-queue packets follow it. On error, all in-flight packets
/// are parked in `spill` for the caller to release.
pub fn run_slots(
    slots: &mut [Slot],
    idx: usize,
    mut pkt: Packet,
    sink: &mut StageSink,
    spill: &mut Vec<Packet>,
) -> Result<(), SlotError> {
    if idx >= slots.len() {
        sink.consume(pkt);
        return Ok(());
    }
    let mut pre = Vec::new();
    let mut post = Vec::new();
    if let Err(e) = slots[idx].process(&mut pkt, &mut pre, &mut post) {
        spill.push(pkt);
        spill.extend(pre);
        spill.extend(post);
        return Err(e);
    }
    for p in pre {
        run_slots(slots, idx + 1, p, sink, spill)?;
    }
    run_slots(slots, idx + 1, pkt, sink, spill)?;
    for p in post {
        run_slots(slots, idx + 1, p, sink, spill)?;
    }
    Ok(())
}

/// Where a stage receives packets from.
pub enum StageInput {
    Source(Box<dyn PacketSource>),
    Queue(Arc<PacketQueue>),
}

enum Next {
    Pkt(Packet),
    Idle,
    Stop,
    Fail,
}

/// One pipeline stage thread.
pub struct StageWorker {
    pub tv: ThreadVars,
    pub slots: Vec<Slot>,
    pub input: StageInput,
    pub sink: StageSink,
    pub pool: Arc<Pool<Packet>>,
    pub kill: Arc<AtomicBool>,
    /// Set by the upstream stage when it has stopped producing.
    pub upstream_done: Option<Arc<AtomicBool>>,
    /// Raised by this worker when it stops.
    pub done: Arc<AtomicBool>,
    pub counters: Arc<ThreadCounters>,
    /// Frames from the respond stage awaiting source injection.
    pub rejects: Option<Arc<Mutex<Vec<Vec<u8>>>>>,
    /// Periodic stats snapshots for the output stage's stats loggers.
    pub stats_rx: Option<Receiver<StatsTable>>,
}

impl StageWorker {
    /// Thread body. Returns once the stage has drained and closed.
    pub fn run(&mut self) {
        log::info!("{} running", self.tv.name);
        self.tv.flags.set(THV_INIT_DONE);
        loop {
            if let (Some(rx), StageSink::Output(sink)) = (&self.stats_rx, &mut self.sink) {
                if let Ok(stats) = rx.try_recv() {
                    sink.log_stats(&stats);
                }
            }
            let next = self.next_packet();
            match next {
                Next::Pkt(pkt) => {
                    let mut spill = Vec::new();
                    if let Err(e) =
                        run_slots(&mut self.slots, 0, pkt, &mut self.sink, &mut spill)
                    {
                        log::error!("{}: {}", self.tv.name, e);
                        self.tv.flags.set(THV_FAILED);
                        for p in spill {
                            release_packet(p, &self.pool);
                        }
                        // An invariant violation takes the engine down.
                        self.kill.store(true, Ordering::Release);
                        break;
                    }
                }
                Next::Idle => continue,
                Next::Stop => break,
                Next::Fail => {
                    self.tv.flags.set(THV_FAILED);
                    break;
                }
            }
        }

        // Never leak queued packets on the way out.
        if let StageInput::Queue(q) = &self.input {
            for pkt in q.drain() {
                release_packet(pkt, &self.pool);
            }
        }
        self.tv.flags.set(THV_RUNNING_DONE);
        self.done.store(true, Ordering::Release);

        if let StageInput::Source(src) = &mut self.input {
            if let Err(e) = src.deinit() {
                log::warn!("{}: source deinit failed: {}", self.tv.name, e);
            }
        }
        if let StageSink::Output(sink) = &mut self.sink {
            sink.deinit();
        }
        self.tv.flags.set(THV_DEINIT_DONE);
        self.tv.flags.set(THV_CLOSED);
        log::info!("{} closed", self.tv.name);
    }

    fn next_packet(&mut self) -> Next {
        match &mut self.input {
            StageInput::Source(src) => {
                if let Some(rejects) = &self.rejects {
                    for frame in rejects.lock().unwrap().drain(..) {
                        if let Err(e) = src.inject(&frame) {
                            log::warn!("response injection failed: {}", e);
                        }
                    }
                }
                if self.kill.load(Ordering::Acquire) {
                    return Next::Stop;
                }
                let mut pkt = match self.pool.get_timeout(Duration::from_millis(100)) {
                    Ok(pkt) => pkt,
                    Err(_) => {
                        self.counters.incr(Counter::PoolDepleted);
                        return Next::Idle;
                    }
                };
                match src.poll(&mut pkt) {
                    Ok(PollStatus::Packet) => {
                        // Inline verdicts are applied by the respond stage
                        // downstream; the source only needs accept/drop for
                        // packets it owns, which pcap sources do not.
                        Next::Pkt(pkt)
                    }
                    Ok(PollStatus::Timeout) => {
                        self.pool.put(pkt);
                        Next::Idle
                    }
                    Ok(PollStatus::Eof) => {
                        self.pool.put(pkt);
                        Next::Stop
                    }
                    Err(e) => {
                        self.pool.put(pkt);
                        log::error!("{}: source error: {}", self.tv.name, e);
                        Next::Fail
                    }
                }
            }
            StageInput::Queue(q) => match q.pop_timeout(Duration::from_millis(100)) {
                Some(pkt) => Next::Pkt(pkt),
                None => {
                    let upstream_done = self
                        .upstream_done
                        .as_ref()
                        .map(|d| d.load(Ordering::Acquire))
                        .unwrap_or(false);
                    if (self.kill.load(Ordering::Acquire) || upstream_done) && q.is_empty() {
                        Next::Stop
                    } else {
                        Next::Idle
                    }
                }
            },
        }
    }
}
