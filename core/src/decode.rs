//! Decode stage.
//!
//! Parses link, network, and transport headers into the packet's metadata,
//! validates checksums, and flags anomalies as packet events. Decode
//! failures are never fatal: a malformed packet keeps moving with its event
//! flags set so anomaly rules and counters can see it.
//!
//! Tunnelled payloads (IP-in-IP, GRE) are reported back to the pipeline,
//! which allocates a pooled inner packet processed ahead of its wrapper.

use crate::packet::{
    Datalink, IcmpMeta, IpMeta, Packet, TcpMeta, Transport, UdpMeta, EVENT_ICMP_TRUNC,
    EVENT_IPV4_BAD_CSUM, EVENT_IPV4_TRUNC, EVENT_IPV6_TRUNC, EVENT_PKT_TOO_SMALL,
    EVENT_TCP_BAD_CSUM, EVENT_TCP_TRUNC, EVENT_TUNNEL_DEPTH, EVENT_UDP_BAD_CSUM, EVENT_UDP_TRUNC,
};
use crate::protocols::packet::ethernet::{Ethernet, ETHERTYPE_IPV4, ETHERTYPE_IPV6};
use crate::protocols::packet::icmp::Icmp;
use crate::protocols::packet::ipv4::{Ipv4, PROTO_GRE, PROTO_ICMP, PROTO_IPIP, PROTO_TCP, PROTO_UDP};
use crate::protocols::packet::ipv6::Ipv6;
use crate::protocols::packet::ppp::{Ppp, PPP_PROTO_IPV4, PPP_PROTO_IPV6};
use crate::protocols::packet::sll::LinuxSll;
use crate::protocols::packet::{pseudo_header_v4, pseudo_header_v6};
use crate::protocols::packet::tcp::Tcp;
use crate::protocols::packet::udp::Udp;

use std::net::IpAddr;

/// Nested tunnels deeper than this are decoded no further.
const MAX_TUNNEL_DEPTH: u8 = 2;

/// An encapsulated frame discovered inside the current packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerFrame {
    /// Offset of the inner frame within the outer packet's bytes.
    pub offset: usize,
    pub datalink: Datalink,
}

/// Decodes `pkt` in place. Returns a discovered tunnel inner frame, if any.
pub fn decode(pkt: &mut Packet) -> Option<InnerFrame> {
    let ip_offset = match pkt.datalink {
        Datalink::Ethernet => match Ethernet::parse(&pkt.data) {
            Ok(eth) => match eth.ether_type() {
                ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => eth.header_len(),
                _ => return None,
            },
            Err(_) => {
                pkt.set_event(EVENT_PKT_TOO_SMALL);
                return None;
            }
        },
        Datalink::LinuxSll => match LinuxSll::parse(&pkt.data) {
            Ok(sll) => match sll.protocol() {
                ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => sll.header_len(),
                _ => return None,
            },
            Err(_) => {
                pkt.set_event(EVENT_PKT_TOO_SMALL);
                return None;
            }
        },
        Datalink::Ppp => match Ppp::parse(&pkt.data) {
            Ok(ppp) => match ppp.protocol() {
                PPP_PROTO_IPV4 | PPP_PROTO_IPV6 => ppp.header_len(),
                _ => return None,
            },
            Err(_) => {
                pkt.set_event(EVENT_PKT_TOO_SMALL);
                return None;
            }
        },
        Datalink::Raw => 0,
    };

    if pkt.data.len() <= ip_offset {
        pkt.set_event(EVENT_PKT_TOO_SMALL);
        return None;
    }
    decode_ip(pkt, ip_offset)
}

fn decode_ip(pkt: &mut Packet, offset: usize) -> Option<InnerFrame> {
    match pkt.data.get(offset).map(|b| b >> 4) {
        Some(4) => decode_ipv4(pkt, offset),
        Some(6) => decode_ipv6(pkt, offset),
        _ => {
            pkt.set_event(EVENT_IPV4_TRUNC);
            None
        }
    }
}

fn decode_ipv4(pkt: &mut Packet, offset: usize) -> Option<InnerFrame> {
    let (meta, proto, bad_csum) = match Ipv4::parse(&pkt.data[offset..]) {
        Ok(ip) => {
            let bad_csum = !ip.checksum_valid();
            (
                IpMeta {
                    src: IpAddr::V4(ip.src_addr()),
                    dst: IpAddr::V4(ip.dst_addr()),
                    proto: ip.protocol(),
                    version: 4,
                    hdr_offset: offset,
                    hdr_len: ip.header_len(),
                    payload_len: ip.payload_len(),
                },
                ip.protocol(),
                bad_csum,
            )
        }
        Err(_) => {
            pkt.set_event(EVENT_IPV4_TRUNC);
            return None;
        }
    };
    if bad_csum {
        pkt.set_event(EVENT_IPV4_BAD_CSUM);
    }
    let l4_offset = offset + meta.hdr_len;
    let l4_len = meta.payload_len;
    pkt.l3 = Some(meta);
    decode_transport(pkt, proto, l4_offset, l4_len)
}

fn decode_ipv6(pkt: &mut Packet, offset: usize) -> Option<InnerFrame> {
    let (meta, proto) = match Ipv6::parse(&pkt.data[offset..]) {
        Ok(ip) => (
            IpMeta {
                src: IpAddr::V6(ip.src_addr()),
                dst: IpAddr::V6(ip.dst_addr()),
                proto: ip.next_header(),
                version: 6,
                hdr_offset: offset,
                hdr_len: ip.header_len(),
                payload_len: ip.payload_len(),
            },
            ip.next_header(),
        ),
        Err(_) => {
            pkt.set_event(EVENT_IPV6_TRUNC);
            return None;
        }
    };
    let l4_offset = offset + meta.hdr_len;
    let l4_len = meta.payload_len;
    pkt.l3 = Some(meta);
    decode_transport(pkt, proto, l4_offset, l4_len)
}

fn decode_transport(
    pkt: &mut Packet,
    proto: u8,
    offset: usize,
    len: usize,
) -> Option<InnerFrame> {
    let end = (offset + len).min(pkt.data.len());
    match proto {
        PROTO_TCP => {
            let pseudo = l4_pseudo(pkt, proto, (end - offset) as u32);
            match Tcp::parse(&pkt.data[offset..end]) {
                Ok(tcp) => {
                    let bad_csum = !tcp.checksum_valid(pseudo);
                    let hdr_len = tcp.header_len();
                    pkt.transport = Some(Transport::Tcp(TcpMeta {
                        sport: tcp.src_port(),
                        dport: tcp.dst_port(),
                        seq: tcp.seq_no(),
                        ack: tcp.ack_no(),
                        flags: tcp.flags(),
                        window: tcp.window(),
                        wscale: tcp.wscale(),
                        payload_offset: offset + hdr_len,
                        payload_len: end - offset - hdr_len,
                    }));
                    if bad_csum {
                        pkt.set_event(EVENT_TCP_BAD_CSUM);
                    }
                }
                Err(_) => pkt.set_event(EVENT_TCP_TRUNC),
            }
            None
        }
        PROTO_UDP => {
            let pseudo = l4_pseudo(pkt, proto, (end - offset) as u32);
            match Udp::parse(&pkt.data[offset..end]) {
                Ok(udp) => {
                    let bad_csum = !udp.checksum_valid(pseudo);
                    let dgram_len = (udp.length() as usize).min(end - offset);
                    pkt.transport = Some(Transport::Udp(UdpMeta {
                        sport: udp.src_port(),
                        dport: udp.dst_port(),
                        payload_offset: offset + udp.header_len(),
                        payload_len: dgram_len.saturating_sub(udp.header_len()),
                    }));
                    if bad_csum {
                        pkt.set_event(EVENT_UDP_BAD_CSUM);
                    }
                }
                Err(_) => pkt.set_event(EVENT_UDP_TRUNC),
            }
            None
        }
        PROTO_ICMP => {
            match Icmp::parse(&pkt.data[offset..end]) {
                Ok(icmp) => {
                    pkt.transport = Some(Transport::Icmp(IcmpMeta {
                        itype: icmp.icmp_type(),
                        icode: icmp.icmp_code(),
                    }));
                }
                Err(_) => pkt.set_event(EVENT_ICMP_TRUNC),
            }
            None
        }
        PROTO_IPIP => tunnel_inner(pkt, offset),
        PROTO_GRE => {
            let inner_off = gre_payload_offset(&pkt.data[offset..end])?;
            tunnel_inner(pkt, offset + inner_off)
        }
        _ => None,
    }
}

fn tunnel_inner(pkt: &mut Packet, offset: usize) -> Option<InnerFrame> {
    if pkt.recursion_level >= MAX_TUNNEL_DEPTH {
        pkt.set_event(EVENT_TUNNEL_DEPTH);
        return None;
    }
    if offset >= pkt.data.len() {
        pkt.set_event(EVENT_PKT_TOO_SMALL);
        return None;
    }
    Some(InnerFrame {
        offset,
        datalink: Datalink::Raw,
    })
}

/// Offset of the encapsulated payload within a GRE v0 header, or `None`
/// when the header is malformed or a version we do not decode.
fn gre_payload_offset(data: &[u8]) -> Option<usize> {
    if data.len() < 4 {
        return None;
    }
    let flags = data[0];
    if data[1] & 0x07 != 0 {
        // version != 0
        return None;
    }
    let proto = u16::from_be_bytes([data[2], data[3]]);
    if proto != ETHERTYPE_IPV4 && proto != ETHERTYPE_IPV6 {
        return None;
    }
    if flags & 0x40 != 0 {
        // source-routed GRE is not decoded
        return None;
    }
    let mut off = 4;
    if flags & 0x80 != 0 {
        off += 4; // checksum + reserved
    }
    if flags & 0x20 != 0 {
        off += 4; // key
    }
    if flags & 0x10 != 0 {
        off += 4; // sequence
    }
    if off > data.len() {
        return None;
    }
    Some(off)
}

fn l4_pseudo(pkt: &Packet, proto: u8, l4_len: u32) -> u32 {
    match &pkt.l3 {
        Some(l3) => match (l3.src, l3.dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                pseudo_header_v4(s.octets(), d.octets(), proto, l4_len as u16)
            }
            (IpAddr::V6(s), IpAddr::V6(d)) => {
                pseudo_header_v6(s.octets(), d.octets(), proto, l4_len)
            }
            _ => 0,
        },
        None => 0,
    }
}
