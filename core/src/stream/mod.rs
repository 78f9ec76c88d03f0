//! TCP stream engine.
//!
//! Advances the per-flow TCP state machine, validates sequence numbers and
//! resets against the flow's OS policy, feeds payload-bearing segments into
//! the per-direction reassembler, and emits stream messages for the
//! detection engine and application-layer consumers.

pub mod reassembly;

pub use reassembly::{Chunk, InsertOutcome, StreamReassembly, TcpSegment};

use crate::config::StreamConfig;
use crate::flow::{Flow, FlowPhase, FLOW_CLOSED, FLOW_ESTABLISHED};
use crate::memory::MemBudget;
use crate::packet::{
    Direction, Packet, TcpMeta, EVENT_TCP_INVALID_RST, EVENT_TCP_INVALID_SEQ,
};
use crate::protocols::packet::tcp::{ACK, FIN, RST, SYN};
use crate::stats::{Counter, ThreadCounters};
use crate::utils::seq::{seq_eq, seq_geq, seq_gt, seq_leq, seq_lt};
use crate::utils::time::Timestamp;

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// Stream message flags.
pub const STREAM_START: u8 = 0x01;
pub const STREAM_EOF: u8 = 0x02;
pub const STREAM_TOSERVER: u8 = 0x04;
pub const STREAM_TOCLIENT: u8 = 0x08;
pub const STREAM_GAP: u8 = 0x10;

/// Upper bound on the data block carried by one stream message.
pub const STREAM_MSG_CAP: usize = 4096;

/// A reassembled byte run (or gap notification) handed downstream.
#[derive(Debug)]
pub struct StreamMsg {
    pub id: u64,
    pub flags: u8,
    /// Absolute sequence position of the first byte.
    pub seq: u32,
    pub data: Vec<u8>,
    pub gap_size: u32,
    flow: Option<Arc<Flow>>,
}

impl StreamMsg {
    #[inline]
    pub fn dir(&self) -> Direction {
        if self.flags & STREAM_TOSERVER != 0 {
            Direction::ToServer
        } else {
            Direction::ToClient
        }
    }

    /// Attaches the flow reference, bumping its use count.
    pub fn attach_flow(&mut self, flow: &Arc<Flow>) {
        flow.incr_use();
        self.flow = Some(Arc::clone(flow));
    }
}

impl Drop for StreamMsg {
    fn drop(&mut self) {
        if let Some(flow) = self.flow.take() {
            flow.decr_use();
        }
    }
}

/// TCP connection states.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum TcpState {
    #[default]
    None,
    SynSent,
    SynRecv,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    CloseWait,
    LastAck,
    TimeWait,
    Closed,
}

/// End-host TCP stack emulation profile. Drives reset validation and
/// overlap resolution.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OsPolicy {
    #[default]
    Bsd,
    First,
    Last,
    Linux,
    OldLinux,
    Solaris,
    Windows,
    Macos,
    Hpux10,
    Hpux11,
    Irix,
}

impl OsPolicy {
    /// Policies where newly arrived bytes replace previously held ones.
    #[inline]
    pub fn favors_new_data(&self) -> bool {
        matches!(self, OsPolicy::Last | OsPolicy::Linux | OsPolicy::OldLinux | OsPolicy::Solaris)
    }

    /// Reset acceptance class: exact next-seq match, at-or-after, or
    /// in-window.
    fn reset_rule(&self) -> ResetRule {
        match self {
            OsPolicy::Hpux11 => ResetRule::AtOrAfterNext,
            OsPolicy::Linux | OsPolicy::OldLinux | OsPolicy::Solaris => ResetRule::InWindow,
            _ => ResetRule::ExactNext,
        }
    }
}

impl FromStr for OsPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bsd" => Ok(OsPolicy::Bsd),
            "first" => Ok(OsPolicy::First),
            "last" => Ok(OsPolicy::Last),
            "linux" => Ok(OsPolicy::Linux),
            "old-linux" | "old_linux" => Ok(OsPolicy::OldLinux),
            "solaris" => Ok(OsPolicy::Solaris),
            "windows" => Ok(OsPolicy::Windows),
            "macos" => Ok(OsPolicy::Macos),
            "hpux10" => Ok(OsPolicy::Hpux10),
            "hpux11" => Ok(OsPolicy::Hpux11),
            "irix" => Ok(OsPolicy::Irix),
            other => Err(format!("unknown os policy {:?}", other)),
        }
    }
}

enum ResetRule {
    ExactNext,
    AtOrAfterNext,
    InWindow,
}

/// One direction of a TCP session.
#[derive(Debug)]
pub struct TcpStream {
    pub isn: u32,
    /// Next sequence number expected from this side.
    pub next_seq: u32,
    /// Highest acknowledgment of this side's data seen from the peer.
    pub last_ack: u32,
    /// This side's advertised receive window, scaled.
    pub window: u32,
    pub wscale: u8,
    pub os_policy: OsPolicy,
    pub reassembly: StreamReassembly,
    /// STREAM_START already emitted.
    started: bool,
    eof_sent: bool,
}

impl TcpStream {
    fn new(policy: OsPolicy, budget: Arc<MemBudget>) -> Self {
        TcpStream {
            isn: 0,
            next_seq: 0,
            last_ack: 0,
            window: 0,
            wscale: 0,
            os_policy: policy,
            reassembly: StreamReassembly::new(policy, budget),
            started: false,
            eof_sent: false,
        }
    }

    /// Anchors all sequence state on a learned ISN; the first payload byte
    /// is expected at `isn + 1`.
    fn anchor(&mut self, isn: u32) {
        self.isn = isn;
        self.next_seq = isn.wrapping_add(1);
        self.last_ack = isn.wrapping_add(1);
        self.reassembly.set_base(isn.wrapping_add(1));
    }

    /// Anchors on a midstream data packet: `seq` is the next byte. The
    /// window is unknown until this side speaks, so assume the maximum.
    fn anchor_midstream(&mut self, seq: u32) {
        self.isn = seq.wrapping_sub(1);
        self.next_seq = seq;
        self.last_ack = seq;
        self.window = u16::MAX as u32;
        self.reassembly.set_base(seq);
    }

    #[inline]
    fn note_ack(&mut self, ack: u32) {
        if seq_gt(ack, self.last_ack) {
            self.last_ack = ack;
        }
    }

    #[inline]
    fn set_window(&mut self, raw: u16) {
        self.window = (raw as u32) << self.wscale;
    }
}

/// Session-level flags.
const SSN_MIDSTREAM: u8 = 0x01;

/// Per-flow TCP state machine with client and server directions.
#[derive(Debug)]
pub struct TcpSession {
    pub state: TcpState,
    pub client: TcpStream,
    pub server: TcpStream,
    flags: u8,
    next_msg_id: u64,
}

/// Knobs the session needs per packet, derived from [`StreamConfig`].
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub midstream: bool,
    pub chunk_len_init: usize,
    pub chunk_len_steady: usize,
    pub gap_timeout: u64,
}

impl From<&StreamConfig> for SessionParams {
    fn from(cfg: &StreamConfig) -> Self {
        SessionParams {
            midstream: cfg.midstream,
            chunk_len_init: cfg.chunk_len_init,
            chunk_len_steady: cfg.chunk_len_steady,
            gap_timeout: cfg.gap_timeout,
        }
    }
}

/// What one packet did to the session.
#[derive(Debug, Default)]
pub struct SessionOutput {
    pub msgs: Vec<StreamMsg>,
    pub events: u32,
    /// Segments refused by the reassembly memory budget.
    pub memcap_drops: u32,
}

impl TcpSession {
    pub fn new(policy: OsPolicy, budget: Arc<MemBudget>) -> Self {
        TcpSession {
            state: TcpState::None,
            client: TcpStream::new(policy, Arc::clone(&budget)),
            server: TcpStream::new(policy, budget),
            flags: 0,
            next_msg_id: 0,
        }
    }

    #[inline]
    pub fn is_midstream(&self) -> bool {
        self.flags & SSN_MIDSTREAM != 0
    }

    /// Sender and receiver streams for a packet direction.
    fn streams(&mut self, dir: Direction) -> (&mut TcpStream, &mut TcpStream) {
        match dir {
            Direction::ToServer => (&mut self.client, &mut self.server),
            Direction::ToClient => (&mut self.server, &mut self.client),
        }
    }

    /// Advances the machine with one decoded segment.
    pub fn handle(
        &mut self,
        dir: Direction,
        tcp: &TcpMeta,
        payload: &[u8],
        ts: Timestamp,
        params: &SessionParams,
    ) -> SessionOutput {
        let mut out = SessionOutput::default();
        let flags = tcp.flags;

        if flags & RST != 0 {
            self.on_rst(dir, tcp, &mut out, params, ts);
            return out;
        }

        match self.state {
            TcpState::None => self.state_none(dir, tcp, payload, ts, params, &mut out),
            TcpState::SynSent => self.state_syn_sent(dir, tcp, &mut out),
            TcpState::SynRecv => self.state_syn_recv(dir, tcp, payload, ts, params, &mut out),
            TcpState::Established
            | TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::Closing
            | TcpState::CloseWait
            | TcpState::LastAck
            | TcpState::TimeWait => {
                if flags & FIN != 0 {
                    self.on_fin(dir, tcp, payload, ts, params, &mut out);
                } else if flags & ACK != 0 {
                    self.on_ack(dir, tcp, payload, ts, params, &mut out);
                }
            }
            TcpState::Closed => {}
        }
        out
    }

    fn state_none(
        &mut self,
        dir: Direction,
        tcp: &TcpMeta,
        payload: &[u8],
        ts: Timestamp,
        params: &SessionParams,
        out: &mut SessionOutput,
    ) {
        let flags = tcp.flags;
        if flags & SYN != 0 && flags & ACK == 0 {
            let (snd, _) = self.streams(dir);
            snd.anchor(tcp.seq);
            snd.wscale = tcp.wscale.unwrap_or(0);
            snd.window = tcp.window as u32;
            self.state = TcpState::SynSent;
            log::debug!("session state SYN_SENT, client isn {}", tcp.seq);
        } else if flags & SYN != 0 && flags & ACK != 0 {
            if !params.midstream {
                return;
            }
            // Midstream pickup from the SYN+ACK.
            self.flags |= SSN_MIDSTREAM;
            let (snd, rcv) = self.streams(dir);
            snd.anchor(tcp.seq);
            snd.wscale = tcp.wscale.unwrap_or(0);
            snd.window = tcp.window as u32;
            rcv.anchor_midstream(tcp.ack);
            self.state = TcpState::SynRecv;
            log::debug!("midstream pickup on SYN+ACK, state SYN_RECV");
        } else if flags & ACK != 0 {
            if !params.midstream {
                return;
            }
            // Midstream pickup from a bare data/ack packet: both anchors
            // are inferred from observed values.
            self.flags |= SSN_MIDSTREAM;
            let (snd, rcv) = self.streams(dir);
            snd.anchor_midstream(tcp.seq);
            snd.next_seq = tcp.seq.wrapping_add(payload.len() as u32);
            snd.wscale = tcp.wscale.unwrap_or(0);
            snd.window = tcp.window as u32;
            rcv.anchor_midstream(tcp.ack);
            self.state = TcpState::Established;
            log::debug!("midstream pickup, state ESTABLISHED");
            if !payload.is_empty() {
                self.ingest(dir, tcp.seq, payload, ts, params, out);
            }
        } else if flags & FIN != 0 {
            // No session to tear down.
            self.state = TcpState::Closed;
        }
    }

    fn state_syn_sent(&mut self, dir: Direction, tcp: &TcpMeta, _out: &mut SessionOutput) {
        let flags = tcp.flags;
        if flags & SYN != 0 && flags & ACK != 0 {
            if dir == Direction::ToServer {
                return; // unexpected direction for a SYN+ACK
            }
            let (snd, rcv) = self.streams(dir);
            snd.anchor(tcp.seq);
            snd.wscale = tcp.wscale.unwrap_or(0);
            snd.window = tcp.window as u32;
            rcv.note_ack(tcp.ack);
            self.state = TcpState::SynRecv;
            log::debug!("session state SYN_RECV, server isn {}", tcp.seq);
        }
        // A retransmitted SYN or stray ACK changes nothing.
    }

    fn state_syn_recv(
        &mut self,
        dir: Direction,
        tcp: &TcpMeta,
        payload: &[u8],
        ts: Timestamp,
        params: &SessionParams,
        out: &mut SessionOutput,
    ) {
        let flags = tcp.flags;
        if flags & SYN != 0 {
            return; // retransmission
        }
        if flags & FIN != 0 {
            self.on_fin(dir, tcp, payload, ts, params, out);
            return;
        }
        if flags & ACK != 0 {
            {
                let (snd, rcv) = self.streams(dir);
                if !seq_eq(tcp.seq, snd.next_seq) {
                    out.events |= EVENT_TCP_INVALID_SEQ;
                    return;
                }
                // The handshake ACK acknowledges the peer's SYN.
                rcv.note_ack(tcp.ack);
                snd.set_window(tcp.window);
            }
            self.state = TcpState::Established;
            log::debug!("session state ESTABLISHED");
            if !payload.is_empty() {
                let (snd, _) = self.streams(dir);
                if seq_eq(tcp.seq, snd.next_seq) {
                    snd.next_seq = tcp.seq.wrapping_add(payload.len() as u32);
                }
                self.ingest(dir, tcp.seq, payload, ts, params, out);
            }
        }
    }

    /// ACK-bearing (possibly payload-carrying) packet in an established or
    /// closing state.
    fn on_ack(
        &mut self,
        dir: Direction,
        tcp: &TcpMeta,
        payload: &[u8],
        ts: Timestamp,
        params: &SessionParams,
        out: &mut SessionOutput,
    ) {
        let plen = payload.len() as u32;
        let midstream = self.is_midstream();
        {
            let (snd, rcv) = self.streams(dir);
            if plen > 0 {
                // The validation envelope from the sender's acked edge. On
                // midstream pickups the anchors are inferred, so a segment
                // outside the envelope is not an anomaly; the reassembler
                // arbitrates what it contributes.
                let win = snd.window.max(1);
                if !(seq_geq(tcp.seq, snd.last_ack)
                    && seq_leq(tcp.seq.wrapping_add(plen), snd.last_ack.wrapping_add(win)))
                    && !midstream
                {
                    out.events |= EVENT_TCP_INVALID_SEQ;
                    return;
                }
            }
            if seq_eq(tcp.seq, snd.next_seq) {
                snd.next_seq = tcp.seq.wrapping_add(plen);
            }
            snd.set_window(tcp.window);
            rcv.note_ack(tcp.ack);
        }
        if plen > 0 {
            self.ingest(dir, tcp.seq, payload, ts, params, out);
        }

        // Flag-driven transitions while closing.
        let next = match self.state {
            TcpState::FinWait1 => Some(TcpState::FinWait2),
            TcpState::FinWait2 => Some(TcpState::TimeWait),
            TcpState::Closing => Some(TcpState::TimeWait),
            TcpState::LastAck => Some(TcpState::Closed),
            TcpState::TimeWait => Some(TcpState::Closed),
            _ => None,
        };
        if let Some(next) = next {
            log::debug!("session state {:?} -> {:?}", self.state, next);
            self.state = next;
            if next == TcpState::Closed {
                self.close(ts, params, out);
            }
        }
    }

    fn on_fin(
        &mut self,
        dir: Direction,
        tcp: &TcpMeta,
        payload: &[u8],
        ts: Timestamp,
        params: &SessionParams,
        out: &mut SessionOutput,
    ) {
        let plen = payload.len() as u32;
        {
            let (snd, rcv) = self.streams(dir);
            let win = snd.window.max(1);
            if !(seq_geq(tcp.seq, snd.last_ack)
                && seq_leq(tcp.seq, snd.last_ack.wrapping_add(win)))
            {
                out.events |= EVENT_TCP_INVALID_SEQ;
                return;
            }
            // FIN consumes one sequence number past any data it carries.
            snd.next_seq = tcp.seq.wrapping_add(plen).wrapping_add(1);
            rcv.note_ack(tcp.ack);
        }
        if plen > 0 {
            self.ingest(dir, tcp.seq, payload, ts, params, out);
        }

        let next = match (self.state, dir) {
            (TcpState::Established, Direction::ToServer) => TcpState::FinWait1,
            (TcpState::Established, Direction::ToClient) => TcpState::CloseWait,
            (TcpState::SynRecv, Direction::ToServer) => TcpState::FinWait1,
            (TcpState::SynRecv, Direction::ToClient) => TcpState::CloseWait,
            (TcpState::FinWait1, _) => TcpState::TimeWait,
            (TcpState::FinWait2, _) => TcpState::TimeWait,
            (TcpState::CloseWait, _) => TcpState::LastAck,
            (state, _) => state,
        };
        if next != self.state {
            log::debug!("session state {:?} -> {:?} on FIN", self.state, next);
            self.state = next;
        }
        // Flush what the FIN terminates for this direction.
        self.flush_dir(dir, ts, params, false, out);
    }

    fn on_rst(
        &mut self,
        dir: Direction,
        tcp: &TcpMeta,
        out: &mut SessionOutput,
        params: &SessionParams,
        ts: Timestamp,
    ) {
        if self.state == TcpState::None {
            self.state = TcpState::Closed;
            return;
        }
        if !self.valid_reset(dir, tcp) {
            out.events |= EVENT_TCP_INVALID_RST;
            return;
        }
        log::debug!("valid RST, session state {:?} -> CLOSED", self.state);
        let (_, rcv) = self.streams(dir);
        rcv.note_ack(tcp.ack);
        self.state = TcpState::Closed;
        self.close(ts, params, out);
    }

    /// Reset validity under the destination host's OS policy.
    fn valid_reset(&mut self, dir: Direction, tcp: &TcpMeta) -> bool {
        // The receiving end-host decides whether it honours the reset.
        let policy = match dir {
            Direction::ToServer => self.server.os_policy,
            Direction::ToClient => self.client.os_policy,
        };
        let (snd, _) = self.streams(dir);
        match policy.reset_rule() {
            ResetRule::ExactNext => seq_eq(tcp.seq, snd.next_seq),
            ResetRule::AtOrAfterNext => seq_geq(tcp.seq, snd.next_seq),
            ResetRule::InWindow => {
                seq_geq(tcp.seq, snd.last_ack)
                    && seq_lt(tcp.seq, snd.next_seq.wrapping_add(snd.window.max(1)))
            }
        }
    }

    /// Feeds payload into the sender-direction reassembler and drains any
    /// deliverable messages.
    fn ingest(
        &mut self,
        dir: Direction,
        seq: u32,
        payload: &[u8],
        ts: Timestamp,
        params: &SessionParams,
        out: &mut SessionOutput,
    ) {
        // A midstream pickup infers its delivery base, so a segment wholly
        // below it is not proof of old data; the bytes still surface, in
        // arrival order, without advancing sequence state.
        if self.is_midstream() {
            let below_base = {
                let (snd, _) = self.streams(dir);
                let end = seq.wrapping_add(payload.len() as u32);
                seq_leq(end, snd.reassembly.base())
            };
            if below_base {
                self.emit_raw(dir, seq, payload, out);
                return;
            }
        }
        {
            let (snd, _) = self.streams(dir);
            match snd.reassembly.insert(seq, payload) {
                InsertOutcome::Accepted => {}
                InsertOutcome::Retransmission | InsertOutcome::OldData => return,
                InsertOutcome::MemcapDrop => {
                    log::warn!("reassembly memcap hit, segment dropped");
                    out.memcap_drops += 1;
                    return;
                }
            }
        }
        self.flush_dir(dir, ts, params, false, out);
    }

    /// Emits one segment's bytes directly as a stream message, bypassing
    /// the reassembly list.
    fn emit_raw(&mut self, dir: Direction, seq: u32, payload: &[u8], out: &mut SessionOutput) {
        let dir_flag = match dir {
            Direction::ToServer => STREAM_TOSERVER,
            Direction::ToClient => STREAM_TOCLIENT,
        };
        let mut flags = dir_flag;
        {
            let (snd, _) = self.streams(dir);
            if !snd.started {
                snd.started = true;
                flags |= STREAM_START;
            }
        }
        let id = self.next_msg_id;
        self.next_msg_id += 1;
        out.msgs.push(StreamMsg {
            id,
            flags,
            seq,
            data: payload.to_vec(),
            gap_size: 0,
            flow: None,
        });
    }

    /// Drains deliverable chunks for one direction into stream messages.
    fn flush_dir(
        &mut self,
        dir: Direction,
        ts: Timestamp,
        params: &SessionParams,
        force: bool,
        out: &mut SessionOutput,
    ) {
        let dir_flag = match dir {
            Direction::ToServer => STREAM_TOSERVER,
            Direction::ToClient => STREAM_TOCLIENT,
        };
        let (started, chunks) = {
            let (snd, _) = self.streams(dir);
            let threshold = if snd.started {
                params.chunk_len_steady
            } else {
                params.chunk_len_init
            };
            let chunks = snd.reassembly.deliver(
                threshold.max(1),
                STREAM_MSG_CAP,
                ts,
                params.gap_timeout,
                force,
            );
            (snd.started, chunks)
        };
        let mut first = !started;
        for chunk in chunks {
            let mut flags = dir_flag;
            if first {
                flags |= STREAM_START;
                first = false;
                let (snd, _) = self.streams(dir);
                snd.started = true;
            }
            if chunk.gap_size.is_some() {
                flags |= STREAM_GAP;
            }
            let id = self.next_msg_id;
            self.next_msg_id += 1;
            out.msgs.push(StreamMsg {
                id,
                flags,
                seq: chunk.seq,
                gap_size: chunk.gap_size.unwrap_or(0),
                data: chunk.data,
                flow: None,
            });
        }
    }

    /// Final flush on close: drain both directions and emit EOF markers.
    fn close(&mut self, ts: Timestamp, params: &SessionParams, out: &mut SessionOutput) {
        for dir in [Direction::ToServer, Direction::ToClient] {
            self.flush_dir(dir, ts, params, true, out);
            let dir_flag = match dir {
                Direction::ToServer => STREAM_TOSERVER,
                Direction::ToClient => STREAM_TOCLIENT,
            };
            let (snd, _) = self.streams(dir);
            if snd.eof_sent || !snd.started {
                continue;
            }
            snd.eof_sent = true;
            let seq = snd.reassembly.base();
            let id = self.next_msg_id;
            self.next_msg_id += 1;
            out.msgs.push(StreamMsg {
                id,
                flags: dir_flag | STREAM_EOF,
                seq,
                data: Vec::new(),
                gap_size: 0,
                flow: None,
            });
        }
    }
}

/// The stream stage: owns the segment budget and session parameters.
pub struct StreamEngine {
    params: SessionParams,
    default_policy: OsPolicy,
    budget: Arc<MemBudget>,
    counters: Arc<ThreadCounters>,
}

impl StreamEngine {
    pub fn new(cfg: &StreamConfig, counters: Arc<ThreadCounters>) -> Self {
        StreamEngine {
            params: SessionParams::from(cfg),
            default_policy: cfg.os_policy,
            budget: Arc::new(MemBudget::new(cfg.reassembly_memcap)),
            counters,
        }
    }

    pub fn budget(&self) -> Arc<MemBudget> {
        Arc::clone(&self.budget)
    }

    /// Processes one packet: attaches/advances the flow's TCP session and
    /// parks emitted stream messages on the packet.
    pub fn handle_packet(&self, pkt: &mut Packet) {
        let Some(flow) = pkt.flow.clone() else {
            return;
        };
        let Some(tcp) = pkt.tcp().copied() else {
            return;
        };
        let payload = pkt.payload().to_vec();

        let mut output = {
            let mut guard = flow.state.lock().unwrap();
            let state: &mut crate::flow::FlowState = &mut guard;
            if state.tcp.is_none() {
                state.tcp = Some(TcpSession::new(self.default_policy, self.budget()));
                self.counters.incr(Counter::TcpSessions);
            }
            let (out, ssn_state) = {
                let session = state.tcp.as_mut().unwrap();
                let out = session.handle(pkt.direction, &tcp, &payload, pkt.ts, &self.params);
                (out, session.state)
            };

            // Mirror the session state onto the flow lifecycle phase.
            match ssn_state {
                TcpState::Established
                | TcpState::FinWait1
                | TcpState::FinWait2
                | TcpState::Closing
                | TcpState::CloseWait
                | TcpState::LastAck
                | TcpState::TimeWait => {
                    if state.phase == FlowPhase::New {
                        state.phase = FlowPhase::Established;
                        flow.set_flags(FLOW_ESTABLISHED);
                    }
                }
                TcpState::Closed => {
                    state.phase = FlowPhase::Closed;
                    flow.set_flags(FLOW_CLOSED);
                }
                _ => {}
            }
            out
        };

        if output.events & EVENT_TCP_INVALID_SEQ != 0 {
            self.counters.incr(Counter::TcpInvalidSeq);
        }
        if output.events & EVENT_TCP_INVALID_RST != 0 {
            self.counters.incr(Counter::TcpInvalidRst);
        }
        if output.memcap_drops > 0 {
            self.counters
                .add(Counter::TcpReasmMemcap, output.memcap_drops as u64);
        }
        pkt.events |= output.events;

        for mut msg in output.msgs.drain(..) {
            if msg.flags & STREAM_GAP != 0 {
                self.counters.incr(Counter::TcpReasmGaps);
            }
            self.counters.incr(Counter::StreamMsgs);
            msg.attach_flow(&flow);
            pkt.stream_msgs.push(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SessionParams {
        SessionParams {
            midstream: true,
            chunk_len_init: 1,
            chunk_len_steady: 1,
            gap_timeout: 60,
        }
    }

    fn session() -> TcpSession {
        TcpSession::new(OsPolicy::Bsd, Arc::new(MemBudget::new(1 << 20)))
    }

    fn meta(seq: u32, ack: u32, flags: u8) -> TcpMeta {
        TcpMeta {
            sport: 4000,
            dport: 80,
            seq,
            ack,
            flags,
            window: 0xffff,
            wscale: None,
            payload_offset: 0,
            payload_len: 0,
        }
    }

    fn drive(
        ssn: &mut TcpSession,
        dir: Direction,
        seq: u32,
        ack: u32,
        flags: u8,
        payload: &[u8],
    ) -> SessionOutput {
        let ts = Timestamp::new(10, 0);
        ssn.handle(dir, &meta(seq, ack, flags), payload, ts, &params())
    }

    fn collect_data(msgs: &[StreamMsg], dir_flag: u8) -> Vec<u8> {
        msgs.iter()
            .filter(|m| m.flags & dir_flag != 0)
            .flat_map(|m| m.data.clone())
            .collect()
    }

    #[test]
    fn three_way_handshake_then_data() {
        let mut ssn = session();
        let mut msgs = Vec::new();

        drive(&mut ssn, Direction::ToServer, 0, 0, SYN, b"");
        assert_eq!(ssn.state, TcpState::SynSent);
        drive(&mut ssn, Direction::ToClient, 0, 1, SYN | ACK, b"");
        assert_eq!(ssn.state, TcpState::SynRecv);
        drive(&mut ssn, Direction::ToServer, 1, 1, ACK, b"");
        assert_eq!(ssn.state, TcpState::Established);

        let out = drive(&mut ssn, Direction::ToServer, 1, 1, ACK | 0x08, b"AAA");
        msgs.extend(out.msgs);
        drive(&mut ssn, Direction::ToClient, 1, 4, ACK, b"");

        assert_eq!(ssn.state, TcpState::Established);
        assert_eq!(ssn.client.next_seq, 4);
        // The server's ack=4 acknowledges all three payload bytes.
        assert_eq!(ssn.client.last_ack, 4);

        let toserver = collect_data(&msgs, STREAM_TOSERVER);
        assert_eq!(toserver, b"AAA");
        assert!(msgs[0].flags & STREAM_START != 0);
    }

    #[test]
    fn midstream_pickup_with_payload() {
        let mut ssn = session();
        let mut msgs = Vec::new();

        let out = drive(&mut ssn, Direction::ToServer, 10, 20, ACK | 0x08, b"AAA");
        msgs.extend(out.msgs);
        assert_eq!(ssn.state, TcpState::Established);
        assert!(ssn.is_midstream());

        let out = drive(&mut ssn, Direction::ToClient, 20, 13, ACK | 0x08, b"BBB");
        msgs.extend(out.msgs);
        let out = drive(&mut ssn, Direction::ToServer, 13, 23, ACK | 0x08, b"CCC");
        msgs.extend(out.msgs);
        // Below the inferred anchor: the bytes still surface in arrival
        // order, but sequence state stays put.
        let out = drive(&mut ssn, Direction::ToClient, 19, 16, ACK | 0x08, b"DDD");
        msgs.extend(out.msgs);

        assert_eq!(ssn.client.next_seq, 16);
        assert_eq!(ssn.server.next_seq, 23);
        assert_eq!(collect_data(&msgs, STREAM_TOSERVER), b"AAACCC");
        assert_eq!(collect_data(&msgs, STREAM_TOCLIENT), b"BBBDDD");
    }

    #[test]
    fn midstream_disabled_ignores_unseen_flows() {
        let mut ssn = session();
        let mut p = params();
        p.midstream = false;
        let out = ssn.handle(
            Direction::ToServer,
            &meta(10, 20, ACK),
            b"AAA",
            Timestamp::new(0, 0),
            &p,
        );
        assert_eq!(ssn.state, TcpState::None);
        assert!(out.msgs.is_empty());
    }

    #[test]
    fn fin_teardown_sequence() {
        let mut ssn = session();
        // Establish midstream at client 100, server 200.
        drive(&mut ssn, Direction::ToServer, 100, 200, ACK, b"");
        assert_eq!(ssn.state, TcpState::Established);

        drive(&mut ssn, Direction::ToServer, 100, 200, FIN | ACK, b"");
        assert_eq!(ssn.state, TcpState::FinWait1);
        drive(&mut ssn, Direction::ToClient, 200, 101, ACK, b"");
        assert_eq!(ssn.state, TcpState::FinWait2);
        drive(&mut ssn, Direction::ToClient, 200, 101, FIN | ACK, b"");
        assert_eq!(ssn.state, TcpState::TimeWait);
        let out = drive(&mut ssn, Direction::ToServer, 101, 201, ACK, b"");
        assert_eq!(ssn.state, TcpState::Closed);
        let _ = out;
    }

    #[test]
    fn zero_length_segment_advances_state_by_flags() {
        let mut ssn = session();
        drive(&mut ssn, Direction::ToServer, 0, 0, SYN, b"");
        drive(&mut ssn, Direction::ToClient, 500, 1, SYN | ACK, b"");
        let out = drive(&mut ssn, Direction::ToServer, 1, 501, ACK, b"");
        assert_eq!(ssn.state, TcpState::Established);
        assert!(out.msgs.is_empty());
        assert_eq!(ssn.client.next_seq, 1);
    }

    #[test]
    fn invalid_sequence_flagged_not_used() {
        // Handshake-established session: the anchors are exact, so the
        // validation envelope applies strictly.
        let mut ssn = session();
        drive(&mut ssn, Direction::ToServer, 100, 0, SYN, b"");
        drive(&mut ssn, Direction::ToClient, 500, 101, SYN | ACK, b"");
        drive(&mut ssn, Direction::ToServer, 101, 501, ACK, b"");
        assert_eq!(ssn.state, TcpState::Established);

        // Way outside the envelope.
        let out = drive(
            &mut ssn,
            Direction::ToServer,
            100_000_000,
            501,
            ACK | 0x08,
            b"XX",
        );
        assert!(out.events & EVENT_TCP_INVALID_SEQ != 0);
        assert_eq!(ssn.client.next_seq, 101);
    }

    #[test]
    fn reset_exact_match_under_bsd() {
        let mut ssn = session();
        drive(&mut ssn, Direction::ToServer, 100, 200, ACK, b"");
        // RST toward the server: client's next_seq must match exactly.
        let out = drive(&mut ssn, Direction::ToServer, 101, 200, RST, b"");
        assert!(out.events & EVENT_TCP_INVALID_RST != 0);
        assert_ne!(ssn.state, TcpState::Closed);

        let out = drive(&mut ssn, Direction::ToServer, 100, 200, RST, b"");
        assert_eq!(out.events & EVENT_TCP_INVALID_RST, 0);
        assert_eq!(ssn.state, TcpState::Closed);
    }

    #[test]
    fn reset_in_window_under_linux() {
        let mut ssn = TcpSession::new(OsPolicy::Linux, Arc::new(MemBudget::new(1 << 20)));
        drive(&mut ssn, Direction::ToServer, 100, 200, ACK, b"");
        // In-window but not exact: accepted under the window rule.
        let out = drive(&mut ssn, Direction::ToServer, 140, 200, RST, b"");
        assert_eq!(out.events & EVENT_TCP_INVALID_RST, 0);
        assert_eq!(ssn.state, TcpState::Closed);
    }

    #[test]
    fn reset_out_of_window_under_linux() {
        let mut ssn = TcpSession::new(OsPolicy::Linux, Arc::new(MemBudget::new(1 << 20)));
        drive(&mut ssn, Direction::ToServer, 100, 200, ACK, b"");
        ssn.client.window = 50;
        let out = drive(&mut ssn, Direction::ToServer, 100 + 51 + 10, 200, RST, b"");
        assert!(out.events & EVENT_TCP_INVALID_RST != 0);
        assert_ne!(ssn.state, TcpState::Closed);
    }

    #[test]
    fn eof_emitted_after_close() {
        let mut ssn = session();
        drive(&mut ssn, Direction::ToServer, 100, 200, ACK | 0x08, b"data");
        drive(&mut ssn, Direction::ToServer, 104, 200, FIN | ACK, b"");
        drive(&mut ssn, Direction::ToClient, 200, 105, ACK, b"");
        drive(&mut ssn, Direction::ToClient, 200, 105, FIN | ACK, b"");
        let out = drive(&mut ssn, Direction::ToServer, 105, 201, ACK, b"");
        assert_eq!(ssn.state, TcpState::Closed);
        assert!(out
            .msgs
            .iter()
            .any(|m| m.flags & STREAM_EOF != 0 && m.flags & STREAM_TOSERVER != 0));
    }

    #[test]
    fn last_ack_and_next_seq_monotone() {
        let mut ssn = session();
        drive(&mut ssn, Direction::ToServer, 100, 200, ACK, b"");
        let mut prev_next = ssn.client.next_seq;
        let mut prev_ack = ssn.client.last_ack;
        for (i, chunk) in [b"aa", b"bb", b"cc"].iter().enumerate() {
            drive(
                &mut ssn,
                Direction::ToServer,
                100 + (i as u32) * 2,
                200,
                ACK | 0x08,
                *chunk,
            );
            drive(
                &mut ssn,
                Direction::ToClient,
                200,
                100 + (i as u32 + 1) * 2,
                ACK,
                b"",
            );
            assert!(seq_geq(ssn.client.next_seq, prev_next));
            assert!(seq_geq(ssn.client.last_ack, prev_ack));
            assert!(seq_leq(ssn.client.last_ack, ssn.client.next_seq));
            prev_next = ssn.client.next_seq;
            prev_ack = ssn.client.last_ack;
        }
    }
}
