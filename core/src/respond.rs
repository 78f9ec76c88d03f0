//! Active responses.
//!
//! For a REJECT verdict the engine synthesises a TCP reset (or an ICMP port
//! unreachable for UDP) aimed back at the sender of the offending packet
//! and hands it to the source for injection. Only IPv4 responses are
//! produced, matching the unified output formats.

use crate::packet::{Packet, Transport};
use crate::protocols::packet::ethernet::ETHERNET_HEADER_LEN;
use crate::protocols::packet::icmp::ICMP_DEST_UNREACH;
use crate::protocols::packet::ipv4::{PROTO_ICMP, PROTO_TCP};
use crate::protocols::packet::tcp::{ACK, RST, SYN};
use crate::protocols::packet::{internet_checksum, pseudo_header_v4};
use crate::packet::Datalink;

/// Builds a reset/unreachable response for `pkt`, or `None` when the packet
/// shape does not support one.
pub fn craft_response(pkt: &Packet) -> Option<Vec<u8>> {
    match pkt.transport {
        Some(Transport::Tcp(_)) => craft_tcp_reset(pkt),
        Some(Transport::Udp(_)) => craft_icmp_unreach(pkt),
        _ => None,
    }
}

/// A RST+ACK toward the offending packet's sender.
pub fn craft_tcp_reset(pkt: &Packet) -> Option<Vec<u8>> {
    let tcp = pkt.tcp()?;
    let src = pkt.ipv4_src()?;
    let dst = pkt.ipv4_dst()?;

    // Response travels the reverse path.
    let (r_src, r_dst) = (dst.octets(), src.octets());
    let seq = tcp.ack;
    let mut ack = tcp.seq.wrapping_add(tcp.payload_len as u32);
    if tcp.flags & SYN != 0 {
        ack = ack.wrapping_add(1);
    }

    let mut tcp_hdr = vec![0u8; 20];
    tcp_hdr[0..2].copy_from_slice(&tcp.dport.to_be_bytes());
    tcp_hdr[2..4].copy_from_slice(&tcp.sport.to_be_bytes());
    tcp_hdr[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp_hdr[8..12].copy_from_slice(&ack.to_be_bytes());
    tcp_hdr[12] = 5 << 4;
    tcp_hdr[13] = RST | ACK;
    let pseudo = pseudo_header_v4(r_src, r_dst, PROTO_TCP, 20);
    let sum = internet_checksum(&tcp_hdr, pseudo);
    tcp_hdr[16..18].copy_from_slice(&sum.to_be_bytes());

    Some(assemble(pkt, r_src, r_dst, PROTO_TCP, &tcp_hdr))
}

/// An ICMP port-unreachable carrying the offending IP header + 8 bytes.
pub fn craft_icmp_unreach(pkt: &Packet) -> Option<Vec<u8>> {
    let l3 = pkt.l3.as_ref()?;
    let src = pkt.ipv4_src()?;
    let dst = pkt.ipv4_dst()?;
    let (r_src, r_dst) = (dst.octets(), src.octets());

    let orig_start = l3.hdr_offset;
    let orig_end = (orig_start + l3.hdr_len + 8).min(pkt.data.len());
    let quoted = &pkt.data[orig_start..orig_end];

    let mut icmp = vec![0u8; 8];
    icmp[0] = ICMP_DEST_UNREACH;
    icmp[1] = 3; // port unreachable
    icmp.extend_from_slice(quoted);
    let sum = internet_checksum(&icmp, 0);
    icmp[2..4].copy_from_slice(&sum.to_be_bytes());

    Some(assemble(pkt, r_src, r_dst, PROTO_ICMP, &icmp))
}

/// Wraps an L4 payload in IPv4 (+ Ethernet when the original had one, with
/// MACs swapped).
fn assemble(pkt: &Packet, src: [u8; 4], dst: [u8; 4], proto: u8, l4: &[u8]) -> Vec<u8> {
    let total_len = 20 + l4.len();
    let mut ip = vec![0u8; 20];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    ip[8] = 64;
    ip[9] = proto;
    ip[12..16].copy_from_slice(&src);
    ip[16..20].copy_from_slice(&dst);
    let sum = internet_checksum(&ip, 0);
    ip[10..12].copy_from_slice(&sum.to_be_bytes());

    let mut frame = Vec::with_capacity(ETHERNET_HEADER_LEN + total_len);
    if pkt.datalink == Datalink::Ethernet && pkt.data.len() >= ETHERNET_HEADER_LEN {
        // Swap the original MACs.
        frame.extend_from_slice(&pkt.data[6..12]);
        frame.extend_from_slice(&pkt.data[0..6]);
        frame.extend_from_slice(&pkt.data[12..14]);
    }
    frame.extend_from_slice(&ip);
    frame.extend_from_slice(l4);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{decode, tests::tcp_frame};
    use crate::packet::Datalink;
    use crate::utils::time::Timestamp;

    fn decoded(frame: &[u8]) -> Packet {
        let mut pkt = Packet::default();
        pkt.init(frame, Datalink::Ethernet, Timestamp::new(0, 0));
        decode(&mut pkt);
        pkt
    }

    #[test]
    fn reset_reverses_tuple_and_acks_payload() {
        let frame = tcp_frame(
            [10, 0, 0, 1],
            [10, 0, 0, 2],
            4000,
            80,
            1000,
            2000,
            ACK | 0x08,
            b"abcdef",
        );
        let offending = decoded(&frame);
        let rst = craft_tcp_reset(&offending).unwrap();

        let response = decoded(&rst);
        assert_eq!(response.events, 0, "crafted frame must decode cleanly");
        let tcp = response.tcp().unwrap();
        assert_eq!(tcp.sport, 80);
        assert_eq!(tcp.dport, 4000);
        assert_eq!(tcp.flags, RST | ACK);
        assert_eq!(tcp.seq, 2000);
        assert_eq!(tcp.ack, 1006);
        assert_eq!(response.ipv4_src().unwrap().octets(), [10, 0, 0, 2]);
        assert_eq!(response.ipv4_dst().unwrap().octets(), [10, 0, 0, 1]);
    }

    #[test]
    fn reset_to_syn_acks_the_isn() {
        let frame = tcp_frame([1, 1, 1, 1], [2, 2, 2, 2], 5, 6, 700, 0, SYN, b"");
        let rst = craft_tcp_reset(&decoded(&frame)).unwrap();
        let response = decoded(&rst);
        assert_eq!(response.tcp().unwrap().ack, 701);
    }

    fn udp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
        use crate::protocols::packet::ipv4::PROTO_UDP;

        let udp_len = 8 + payload.len();
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&((20 + udp_len) as u16).to_be_bytes());
        ip[8] = 64;
        ip[9] = PROTO_UDP;
        ip[12..16].copy_from_slice(&src);
        ip[16..20].copy_from_slice(&dst);
        let sum = internet_checksum(&ip, 0);
        ip[10..12].copy_from_slice(&sum.to_be_bytes());

        let mut udp = vec![0u8; 8];
        udp[0..2].copy_from_slice(&sport.to_be_bytes());
        udp[2..4].copy_from_slice(&dport.to_be_bytes());
        udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());

        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&[0x08, 0x00]);
        frame.extend_from_slice(&ip);
        frame.extend_from_slice(&udp);
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn udp_packet_draws_port_unreachable() {
        use crate::packet::Transport;
        use crate::protocols::packet::ipv4::PROTO_ICMP;

        let frame = udp_frame([1, 1, 1, 1], [2, 2, 2, 2], 5353, 53, b"query");
        let offending = decoded(&frame);
        let resp = craft_response(&offending).unwrap();

        let parsed = decoded(&resp);
        assert_eq!(parsed.ip_proto(), Some(PROTO_ICMP));
        match parsed.transport {
            Some(Transport::Icmp(icmp)) => {
                assert_eq!(icmp.itype, 3);
                assert_eq!(icmp.icode, 3);
            }
            other => panic!("expected icmp, got {:?}", other),
        }
        assert_eq!(parsed.ipv4_src().unwrap().octets(), [2, 2, 2, 2]);
        assert_eq!(parsed.ipv4_dst().unwrap().octets(), [1, 1, 1, 1]);
    }
}
