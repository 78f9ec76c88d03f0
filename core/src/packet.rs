//! The packet unit that moves through the pipeline.
//!
//! A [`Packet`] owns its raw frame bytes plus a decoded-header view filled in
//! by the decode stage, the flow reference attached by the flow stage, the
//! action bitfield consumed by the verdict stage, and the ordered alert list
//! appended to by the detection stage. Packets are created only from the
//! packet pool and returned to it after output fan-out.

use crate::flow::Flow;
use crate::stream::StreamMsg;
use crate::utils::time::Timestamp;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bitmask_enum::bitmask;

// Packet event flags, set by decode/stream and surfaced as counters.
pub const EVENT_PKT_TOO_SMALL: u32 = 0x0001;
pub const EVENT_IPV4_TRUNC: u32 = 0x0002;
pub const EVENT_IPV4_BAD_CSUM: u32 = 0x0004;
pub const EVENT_IPV6_TRUNC: u32 = 0x0008;
pub const EVENT_TCP_TRUNC: u32 = 0x0010;
pub const EVENT_TCP_BAD_CSUM: u32 = 0x0020;
pub const EVENT_UDP_TRUNC: u32 = 0x0040;
pub const EVENT_UDP_BAD_CSUM: u32 = 0x0080;
pub const EVENT_ICMP_TRUNC: u32 = 0x0100;
pub const EVENT_TCP_INVALID_SEQ: u32 = 0x0200;
pub const EVENT_TCP_INVALID_RST: u32 = 0x0400;
pub const EVENT_IPV4_BAD_VERSION: u32 = 0x0800;
pub const EVENT_TUNNEL_DEPTH: u32 = 0x1000;

/// Verdict bits accumulated on a packet. Drop outranks reject outranks
/// accept when the verdict stage translates them for the source.
#[bitmask(u8)]
pub enum PacketAction {
    Accept,
    Drop,
    Reject,
}

/// Per-packet processing flags.
#[bitmask(u8)]
pub enum PacketFlags {
    /// Flow was established before this packet.
    Established,
    /// Only stream-reassembly matches may fire on this packet.
    StreamOnly,
    /// Stream-reassembly matches must not fire on this packet.
    NoStream,
    /// Synthetic packet carrying a tunnel inner frame.
    TunnelInner,
}

/// Direction of a packet relative to its flow's originator.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    #[default]
    ToServer,
    ToClient,
}

impl Direction {
    #[inline]
    pub fn is_to_server(&self) -> bool {
        matches!(self, Direction::ToServer)
    }
}

/// Datalink type reported by the packet source.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum Datalink {
    #[default]
    Ethernet,
    LinuxSll,
    Ppp,
    /// Raw IPv4, no link header.
    Raw,
}

/// Decoded network-layer view.
#[derive(Debug, Clone)]
pub struct IpMeta {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub proto: u8,
    pub version: u8,
    /// Offset of the IP header from the start of the frame.
    pub hdr_offset: usize,
    pub hdr_len: usize,
    /// Length of everything after the IP header.
    pub payload_len: usize,
}

/// Decoded TCP view.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpMeta {
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    /// Window scale shift count from the SYN options, if present.
    pub wscale: Option<u8>,
    pub payload_offset: usize,
    pub payload_len: usize,
}

/// Decoded UDP view.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpMeta {
    pub sport: u16,
    pub dport: u16,
    pub payload_offset: usize,
    pub payload_len: usize,
}

/// Decoded ICMP view.
#[derive(Debug, Default, Clone, Copy)]
pub struct IcmpMeta {
    pub itype: u8,
    pub icode: u8,
}

/// Decoded transport-layer view.
#[derive(Debug, Clone, Copy)]
pub enum Transport {
    Tcp(TcpMeta),
    Udp(UdpMeta),
    Icmp(IcmpMeta),
}

impl Transport {
    #[inline]
    pub fn src_port(&self) -> u16 {
        match self {
            Transport::Tcp(t) => t.sport,
            Transport::Udp(u) => u.sport,
            Transport::Icmp(_) => 0,
        }
    }

    #[inline]
    pub fn dst_port(&self) -> u16 {
        match self {
            Transport::Tcp(t) => t.dport,
            Transport::Udp(u) => u.dport,
            Transport::Icmp(_) => 0,
        }
    }
}

/// One fired alert, in ascending internal signature order on the packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub gid: u32,
    pub sid: u32,
    pub rev: u32,
    pub class: u32,
    pub prio: u32,
    pub msg: String,
    /// Byte offset of the first confirming match, when one exists.
    pub match_offset: usize,
    /// Action the firing signature requested.
    pub action: PacketAction,
}

/// Shared verdict bookkeeping for a tunnel wrapper and its inner packets.
///
/// The root's verdict is applied only once every inner sibling has reported,
/// tracked by the outstanding counter.
#[derive(Debug, Default)]
pub struct TunnelRoot {
    outstanding: AtomicUsize,
    drop: AtomicBool,
}

impl TunnelRoot {
    pub fn new(inner_cnt: usize) -> Self {
        TunnelRoot {
            outstanding: AtomicUsize::new(inner_cnt),
            drop: AtomicBool::new(false),
        }
    }

    /// Record one inner packet's verdict; returns `true` when this was the
    /// last outstanding sibling.
    pub fn report(&self, drop: bool) -> bool {
        if drop {
            self.drop.store(true, Ordering::Release);
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn should_drop(&self) -> bool {
        self.drop.load(Ordering::Acquire)
    }
}

/// Tunnel membership of a packet.
#[derive(Debug, Clone)]
pub struct TunnelRef {
    pub root: Arc<TunnelRoot>,
    pub is_root: bool,
}

/// The unit that flows through the pipeline.
#[derive(Debug)]
pub struct Packet {
    /// Raw frame bytes, owned for the packet's pool lifetime.
    pub data: Vec<u8>,
    pub datalink: Datalink,
    pub ts: Timestamp,
    pub l3: Option<IpMeta>,
    pub transport: Option<Transport>,
    pub events: u32,
    pub action: PacketAction,
    pub flags: PacketFlags,
    pub flow: Option<Arc<Flow>>,
    pub direction: Direction,
    pub alerts: Vec<Alert>,
    /// Stream messages emitted by the reassembler while handling this packet.
    pub stream_msgs: Vec<StreamMsg>,
    pub tunnel: Option<TunnelRef>,
    pub recursion_level: u8,
}

impl Default for Packet {
    fn default() -> Self {
        Packet {
            data: Vec::new(),
            datalink: Datalink::default(),
            ts: Timestamp::default(),
            l3: None,
            transport: None,
            events: 0,
            action: PacketAction::none(),
            flags: PacketFlags::none(),
            flow: None,
            direction: Direction::default(),
            alerts: Vec::new(),
            stream_msgs: Vec::new(),
            tunnel: None,
            recursion_level: 0,
        }
    }
}

impl Packet {
    /// Prepares a recycled packet for a fresh frame.
    pub fn init(&mut self, frame: &[u8], datalink: Datalink, ts: Timestamp) {
        self.data.clear();
        self.data.extend_from_slice(frame);
        self.datalink = datalink;
        self.ts = ts;
        self.l3 = None;
        self.transport = None;
        self.events = 0;
        self.action = PacketAction::none();
        self.flags = PacketFlags::none();
        self.flow = None;
        self.direction = Direction::ToServer;
        self.alerts.clear();
        self.stream_msgs.clear();
        self.tunnel = None;
        self.recursion_level = 0;
    }

    #[inline]
    pub fn set_event(&mut self, ev: u32) {
        self.events |= ev;
    }

    #[inline]
    pub fn has_event(&self, ev: u32) -> bool {
        self.events & ev != 0
    }

    /// Transport payload bytes, empty when undecoded.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        match &self.transport {
            Some(Transport::Tcp(t)) => {
                &self.data[t.payload_offset..t.payload_offset + t.payload_len]
            }
            Some(Transport::Udp(u)) => {
                &self.data[u.payload_offset..u.payload_offset + u.payload_len]
            }
            _ => &[],
        }
    }

    #[inline]
    pub fn tcp(&self) -> Option<&TcpMeta> {
        match &self.transport {
            Some(Transport::Tcp(t)) => Some(t),
            _ => None,
        }
    }

    #[inline]
    pub fn src_addr(&self) -> Option<IpAddr> {
        self.l3.as_ref().map(|l3| l3.src)
    }

    #[inline]
    pub fn dst_addr(&self) -> Option<IpAddr> {
        self.l3.as_ref().map(|l3| l3.dst)
    }

    /// IPv4 source address as a host-order u32, for the unified formats.
    #[inline]
    pub fn ipv4_src(&self) -> Option<Ipv4Addr> {
        match self.src_addr() {
            Some(IpAddr::V4(a)) => Some(a),
            _ => None,
        }
    }

    #[inline]
    pub fn ipv4_dst(&self) -> Option<Ipv4Addr> {
        match self.dst_addr() {
            Some(IpAddr::V4(a)) => Some(a),
            _ => None,
        }
    }

    #[inline]
    pub fn ip_proto(&self) -> Option<u8> {
        self.l3.as_ref().map(|l3| l3.proto)
    }

    #[inline]
    pub fn src_port(&self) -> u16 {
        self.transport.as_ref().map_or(0, |t| t.src_port())
    }

    #[inline]
    pub fn dst_port(&self) -> u16 {
        self.transport.as_ref().map_or(0, |t| t.dst_port())
    }

    /// Final verdict for the source: drop wins over reject wins over accept.
    #[inline]
    pub fn verdict_is_drop(&self) -> bool {
        self.action.intersects(PacketAction::Drop | PacketAction::Reject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_precedence() {
        let mut p = Packet::default();
        assert!(!p.verdict_is_drop());
        p.action |= PacketAction::Accept;
        assert!(!p.verdict_is_drop());
        p.action |= PacketAction::Drop;
        assert!(p.verdict_is_drop());
    }

    #[test]
    fn tunnel_root_waits_for_all_siblings() {
        let root = TunnelRoot::new(2);
        assert!(!root.report(false));
        assert_eq!(root.outstanding(), 1);
        assert!(root.report(true));
        assert!(root.should_drop());
    }

    #[test]
    fn init_clears_previous_state() {
        let mut p = Packet::default();
        p.data.extend_from_slice(b"old");
        p.events = EVENT_TCP_BAD_CSUM;
        p.alerts.push(Alert {
            gid: 1,
            sid: 1,
            rev: 1,
            class: 0,
            prio: 3,
            msg: String::new(),
            match_offset: 0,
            action: PacketAction::Accept,
        });
        p.init(b"new frame", Datalink::Ethernet, Timestamp::new(1, 0));
        assert_eq!(&p.data, b"new frame");
        assert_eq!(p.events, 0);
        assert!(p.alerts.is_empty());
    }
}
