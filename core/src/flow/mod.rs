//! Flow state management.
//!
//! A flow is one bidirectional conversation, keyed by the canonicalised
//! 5-tuple. Flows live in a fixed-bucket hash table guarded per bucket, are
//! reference-counted by the packets and stream messages that point at them,
//! and are reclaimed by the manager thread once idle past their per-protocol
//! timeout with no outstanding references.

pub mod manager;
pub mod table;

pub use table::FlowTable;

use crate::applayer::http::HttpState;
use crate::applayer::tls::TlsState;
use crate::config::FlowConfig;
use crate::packet::{Direction, Packet};
use crate::protocols::packet::ipv4::{PROTO_ICMP, PROTO_TCP, PROTO_UDP};
use crate::stream::TcpSession;
use crate::utils::time::Timestamp;

use std::cmp;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

// Flow flags.
pub const FLOW_IPV4: u32 = 0x01;
pub const FLOW_IPV6: u32 = 0x02;
/// Created while the table was in emergency mode.
pub const FLOW_EMERG: u32 = 0x04;
pub const FLOW_ESTABLISHED: u32 = 0x08;
pub const FLOW_CLOSED: u32 = 0x10;

/// Canonical flow identifier: the numerically smaller (address, port)
/// endpoint is stored first so both directions hash identically.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct FlowKey {
    lo: SocketAddr,
    hi: SocketAddr,
    proto: u8,
    recursion: u8,
}

impl FlowKey {
    pub fn new(src: SocketAddr, dst: SocketAddr, proto: u8, recursion: u8) -> Self {
        FlowKey {
            lo: cmp::min(src, dst),
            hi: cmp::max(src, dst),
            proto,
            recursion,
        }
    }

    /// Builds the key for a decoded packet, plus the packet's endpoints in
    /// (src, dst) order. Returns `None` for undecoded packets.
    pub fn from_packet(pkt: &Packet) -> Option<(FlowKey, SocketAddr, SocketAddr)> {
        let l3 = pkt.l3.as_ref()?;
        let src = SocketAddr::new(l3.src, pkt.src_port());
        let dst = SocketAddr::new(l3.dst, pkt.dst_port());
        Some((
            FlowKey::new(src, dst, l3.proto, pkt.recursion_level),
            src,
            dst,
        ))
    }

    #[inline]
    pub fn proto(&self) -> u8 {
        self.proto
    }
}

/// Lifecycle phase used for timeout selection.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum FlowPhase {
    #[default]
    New,
    Established,
    Closed,
}

/// Mutable per-flow state, guarded by the flow mutex.
#[derive(Debug, Default)]
pub struct FlowState {
    pub phase: FlowPhase,
    /// TCP session, attached on the first TCP packet.
    pub tcp: Option<TcpSession>,
    pub http: Option<HttpState>,
    pub tls: Option<TlsState>,
}

/// One tracked bidirectional conversation.
#[derive(Debug)]
pub struct Flow {
    key: FlowKey,
    /// Endpoint that sent the first observed packet.
    orig: SocketAddr,
    resp: SocketAddr,
    startts: Timestamp,
    lastts: AtomicU64,
    /// Packets and stream messages currently referencing this flow.
    use_cnt: AtomicU32,
    flags: AtomicU32,
    toserver_pkts: AtomicU64,
    toserver_bytes: AtomicU64,
    toclient_pkts: AtomicU64,
    toclient_bytes: AtomicU64,
    pub state: Mutex<FlowState>,
}

impl Flow {
    pub fn new(key: FlowKey, orig: SocketAddr, resp: SocketAddr, ts: Timestamp) -> Self {
        let flags = if orig.is_ipv4() { FLOW_IPV4 } else { FLOW_IPV6 };
        Flow {
            key,
            orig,
            resp,
            startts: ts,
            lastts: AtomicU64::new(ts.as_micros()),
            use_cnt: AtomicU32::new(0),
            flags: AtomicU32::new(flags),
            toserver_pkts: AtomicU64::new(0),
            toserver_bytes: AtomicU64::new(0),
            toclient_pkts: AtomicU64::new(0),
            toclient_bytes: AtomicU64::new(0),
            state: Mutex::new(FlowState::default()),
        }
    }

    #[inline]
    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    #[inline]
    pub fn orig(&self) -> SocketAddr {
        self.orig
    }

    #[inline]
    pub fn resp(&self) -> SocketAddr {
        self.resp
    }

    #[inline]
    pub fn start_ts(&self) -> Timestamp {
        self.startts
    }

    #[inline]
    pub fn last_ts(&self) -> Timestamp {
        Timestamp::from_micros(self.lastts.load(Ordering::Acquire))
    }

    #[inline]
    pub fn touch(&self, ts: Timestamp) {
        self.lastts.fetch_max(ts.as_micros(), Ordering::AcqRel);
    }

    #[inline]
    pub fn incr_use(&self) {
        self.use_cnt.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn decr_use(&self) {
        let prev = self.use_cnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "flow use_cnt underflow");
    }

    #[inline]
    pub fn use_cnt(&self) -> u32 {
        self.use_cnt.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_flags(&self, bits: u32) {
        self.flags.fetch_or(bits, Ordering::AcqRel);
    }

    #[inline]
    pub fn has_flags(&self, bits: u32) -> bool {
        self.flags.load(Ordering::Acquire) & bits != 0
    }

    /// Direction of a packet sent from `src`, relative to the originator.
    #[inline]
    pub fn direction_of(&self, src: SocketAddr) -> Direction {
        if src == self.orig {
            Direction::ToServer
        } else {
            Direction::ToClient
        }
    }

    pub fn account(&self, dir: Direction, bytes: u64) {
        match dir {
            Direction::ToServer => {
                self.toserver_pkts.fetch_add(1, Ordering::Relaxed);
                self.toserver_bytes.fetch_add(bytes, Ordering::Relaxed);
            }
            Direction::ToClient => {
                self.toclient_pkts.fetch_add(1, Ordering::Relaxed);
                self.toclient_bytes.fetch_add(bytes, Ordering::Relaxed);
            }
        }
    }

    pub fn pkt_counts(&self) -> (u64, u64) {
        (
            self.toserver_pkts.load(Ordering::Relaxed),
            self.toclient_pkts.load(Ordering::Relaxed),
        )
    }

    /// Current lifecycle phase without holding the state lock for long.
    pub fn phase(&self) -> FlowPhase {
        self.state.lock().unwrap().phase
    }
}

/// Decision-time timeout values for one protocol, in seconds.
#[derive(Debug, Clone, Copy)]
pub struct ProtoTimeouts {
    pub new: u64,
    pub established: u64,
    pub closed: u64,
    pub emerg_new: u64,
    pub emerg_established: u64,
    pub emerg_closed: u64,
}

impl ProtoTimeouts {
    pub fn pick(&self, phase: FlowPhase, emerg: bool) -> u64 {
        match (phase, emerg) {
            (FlowPhase::New, false) => self.new,
            (FlowPhase::Established, false) => self.established,
            (FlowPhase::Closed, false) => self.closed,
            (FlowPhase::New, true) => self.emerg_new,
            (FlowPhase::Established, true) => self.emerg_established,
            (FlowPhase::Closed, true) => self.emerg_closed,
        }
    }
}

/// Per-protocol timeout table.
#[derive(Debug, Clone, Copy)]
pub struct FlowTimeouts {
    pub tcp: ProtoTimeouts,
    pub udp: ProtoTimeouts,
    pub icmp: ProtoTimeouts,
    pub default: ProtoTimeouts,
}

impl FlowTimeouts {
    pub fn for_proto(&self, proto: u8) -> &ProtoTimeouts {
        match proto {
            PROTO_TCP => &self.tcp,
            PROTO_UDP => &self.udp,
            PROTO_ICMP => &self.icmp,
            _ => &self.default,
        }
    }
}

impl From<&FlowConfig> for FlowTimeouts {
    fn from(cfg: &FlowConfig) -> Self {
        FlowTimeouts {
            tcp: ProtoTimeouts {
                new: cfg.tcp_timeout_new,
                established: cfg.tcp_timeout_established,
                closed: cfg.tcp_timeout_closed,
                emerg_new: cfg.tcp_emerg_timeout_new,
                emerg_established: cfg.tcp_emerg_timeout_established,
                emerg_closed: cfg.tcp_emerg_timeout_closed,
            },
            udp: ProtoTimeouts {
                new: cfg.udp_timeout_new,
                established: cfg.udp_timeout_established,
                closed: cfg.udp_timeout_established,
                emerg_new: cfg.udp_emerg_timeout_new,
                emerg_established: cfg.udp_emerg_timeout_established,
                emerg_closed: cfg.udp_emerg_timeout_established,
            },
            icmp: ProtoTimeouts {
                new: cfg.icmp_timeout,
                established: cfg.icmp_timeout,
                closed: cfg.icmp_timeout,
                emerg_new: cfg.icmp_emerg_timeout,
                emerg_established: cfg.icmp_emerg_timeout,
                emerg_closed: cfg.icmp_emerg_timeout,
            },
            default: ProtoTimeouts {
                new: cfg.default_timeout,
                established: cfg.default_timeout,
                closed: cfg.default_timeout,
                emerg_new: cfg.default_emerg_timeout,
                emerg_established: cfg.default_emerg_timeout,
                emerg_closed: cfg.default_emerg_timeout,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn sock(a: [u8; 4], p: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::from(a)), p)
    }

    #[test]
    fn key_is_direction_independent() {
        let a = sock([10, 0, 0, 1], 4000);
        let b = sock([10, 0, 0, 2], 80);
        assert_eq!(FlowKey::new(a, b, 6, 0), FlowKey::new(b, a, 6, 0));
        assert_ne!(FlowKey::new(a, b, 6, 0), FlowKey::new(a, b, 17, 0));
        assert_ne!(FlowKey::new(a, b, 6, 0), FlowKey::new(a, b, 6, 1));
    }

    #[test]
    fn direction_follows_originator() {
        let a = sock([10, 0, 0, 1], 4000);
        let b = sock([10, 0, 0, 2], 80);
        let flow = Flow::new(FlowKey::new(a, b, 6, 0), a, b, Timestamp::new(1, 0));
        assert_eq!(flow.direction_of(a), Direction::ToServer);
        assert_eq!(flow.direction_of(b), Direction::ToClient);
    }

    #[test]
    fn use_count_tracks_references() {
        let a = sock([1, 1, 1, 1], 1);
        let b = sock([2, 2, 2, 2], 2);
        let flow = Flow::new(FlowKey::new(a, b, 6, 0), a, b, Timestamp::new(0, 0));
        flow.incr_use();
        flow.incr_use();
        assert_eq!(flow.use_cnt(), 2);
        flow.decr_use();
        assert_eq!(flow.use_cnt(), 1);
    }

    #[test]
    fn timeout_pick_uses_emergency_values() {
        let t = ProtoTimeouts {
            new: 30,
            established: 300,
            closed: 10,
            emerg_new: 5,
            emerg_established: 50,
            emerg_closed: 2,
        };
        assert_eq!(t.pick(FlowPhase::Established, false), 300);
        assert_eq!(t.pick(FlowPhase::Established, true), 50);
        assert_eq!(t.pick(FlowPhase::Closed, true), 2);
    }
}
