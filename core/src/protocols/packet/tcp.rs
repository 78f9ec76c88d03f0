//! TCP header.

use crate::protocols::packet::{internet_checksum, PacketParseError};

pub const TCP_MIN_HEADER_LEN: usize = 20;

// TCP flags.
pub const CWR: u8 = 0b1000_0000;
pub const ECE: u8 = 0b0100_0000;
pub const URG: u8 = 0b0010_0000;
pub const ACK: u8 = 0b0001_0000;
pub const PSH: u8 = 0b0000_1000;
pub const RST: u8 = 0b0000_0100;
pub const SYN: u8 = 0b0000_0010;
pub const FIN: u8 = 0b0000_0001;

const TCPOPT_EOL: u8 = 0;
const TCPOPT_NOP: u8 = 1;
const TCPOPT_WSCALE: u8 = 3;

/// A TCP header view, including the options area.
#[derive(Debug)]
pub struct Tcp<'a> {
    data: &'a [u8],
    hdr_len: usize,
}

impl<'a> Tcp<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, PacketParseError> {
        if data.len() < TCP_MIN_HEADER_LEN {
            return Err(PacketParseError::TooShort);
        }
        let hdr_len = ((data[12] >> 4) as usize) * 4;
        if hdr_len < TCP_MIN_HEADER_LEN || data.len() < hdr_len {
            return Err(PacketParseError::TooShort);
        }
        Ok(Tcp { data, hdr_len })
    }

    #[inline]
    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    #[inline]
    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    #[inline]
    pub fn seq_no(&self) -> u32 {
        u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    #[inline]
    pub fn ack_no(&self) -> u32 {
        u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]])
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.data[13]
    }

    #[inline]
    pub fn window(&self) -> u16 {
        u16::from_be_bytes([self.data[14], self.data[15]])
    }

    #[inline]
    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.data[16], self.data[17]])
    }

    #[inline]
    pub fn header_len(&self) -> usize {
        self.hdr_len
    }

    /// Window scale shift from the options, when advertised.
    pub fn wscale(&self) -> Option<u8> {
        let mut opts = &self.data[TCP_MIN_HEADER_LEN..self.hdr_len];
        while let Some(&kind) = opts.first() {
            match kind {
                TCPOPT_EOL => break,
                TCPOPT_NOP => opts = &opts[1..],
                _ => {
                    let len = *opts.get(1)? as usize;
                    if len < 2 || len > opts.len() {
                        break;
                    }
                    if kind == TCPOPT_WSCALE && len == 3 {
                        // Shift counts above 14 are capped per RFC 1323.
                        return Some(opts[2].min(14));
                    }
                    opts = &opts[len..];
                }
            }
        }
        None
    }

    /// Verifies the TCP checksum given the pseudo-header seed. A stored zero
    /// checksum is accepted (transmit offload).
    pub fn checksum_valid(&self, pseudo: u32) -> bool {
        if self.checksum() == 0 {
            return true;
        }
        internet_checksum(self.data, pseudo) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(flags: u8, doff_words: u8) -> Vec<u8> {
        let mut h = vec![0u8; (doff_words as usize) * 4];
        h[0] = 0x30; // sport 12345
        h[1] = 0x39;
        h[2] = 0x00; // dport 80
        h[3] = 0x50;
        h[4..8].copy_from_slice(&100u32.to_be_bytes());
        h[8..12].copy_from_slice(&200u32.to_be_bytes());
        h[12] = doff_words << 4;
        h[13] = flags;
        h[14] = 0xff;
        h[15] = 0xff;
        h
    }

    #[test]
    fn parses_fields() {
        let buf = header(SYN | ACK, 5);
        let tcp = Tcp::parse(&buf).unwrap();
        assert_eq!(tcp.src_port(), 12345);
        assert_eq!(tcp.dst_port(), 80);
        assert_eq!(tcp.seq_no(), 100);
        assert_eq!(tcp.ack_no(), 200);
        assert_eq!(tcp.flags(), SYN | ACK);
        assert_eq!(tcp.window(), 0xffff);
        assert!(tcp.wscale().is_none());
    }

    #[test]
    fn parses_wscale_option() {
        let mut buf = header(SYN, 6);
        buf[20] = 1; // nop
        buf[21] = 3; // wscale
        buf[22] = 3; // len
        buf[23] = 7; // shift
        let tcp = Tcp::parse(&buf).unwrap();
        assert_eq!(tcp.wscale(), Some(7));
    }

    #[test]
    fn wscale_shift_capped() {
        let mut buf = header(SYN, 6);
        buf[20] = 3;
        buf[21] = 3;
        buf[22] = 15;
        let tcp = Tcp::parse(&buf).unwrap();
        assert_eq!(tcp.wscale(), Some(14));
    }

    #[test]
    fn rejects_truncated_options() {
        let buf = header(SYN, 5);
        // Claim a 32-byte header in a 20-byte buffer.
        let mut short = buf.clone();
        short[12] = 8 << 4;
        assert_eq!(
            Tcp::parse(&short).unwrap_err(),
            PacketParseError::TooShort
        );
    }
}
