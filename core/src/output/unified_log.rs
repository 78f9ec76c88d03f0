//! Unified packet-log output.
//!
//! Snort unified1 "log" format: each alerting packet is stored with its
//! alert header and full layer-2 frame. Sources without an Ethernet header
//! get a synthetic one so spool readers can treat every record uniformly.

use crate::config::UnifiedFileConfig;
use crate::output::{OutputPlugin, RotatingFile};
use crate::packet::{Datalink, Packet};
use crate::protocols::packet::ethernet::{ETHERNET_HEADER_LEN, ETHERTYPE_IPV4};
use crate::utils::time::EngineClock;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use byteorder::{LittleEndian, WriteBytesExt};

pub const LOG_MAGIC: u32 = 0xDEAD_1080;
pub const LOG_VER_MAJOR: u16 = 1;
pub const LOG_VER_MINOR: u16 = 2;
/// magic + version + timezone + sigfigs + snaplen + linktype.
pub const FILE_HEADER_LEN: u64 = 24;
/// Alert header + packet header, before the frame bytes.
pub const RECORD_HEADER_LEN: u64 = 56;

/// Ethernet, in the unified linktype table.
const LINKTYPE_ETHERNET: u32 = 1;

pub struct UnifiedLogLogger {
    file: RotatingFile,
    snaplen: u32,
}

impl UnifiedLogLogger {
    pub fn new(dir: &Path, cfg: &UnifiedFileConfig, clock: Arc<EngineClock>) -> Result<Self> {
        let file = RotatingFile::open(dir, &cfg.filename, cfg.size_limit, clock)?;
        let mut logger = UnifiedLogLogger {
            file,
            snaplen: 65535,
        };
        logger.write_file_header()?;
        Ok(logger)
    }

    fn write_file_header(&mut self) -> Result<()> {
        let mut hdr = Vec::with_capacity(FILE_HEADER_LEN as usize);
        hdr.write_u32::<LittleEndian>(LOG_MAGIC)?;
        hdr.write_u16::<LittleEndian>(LOG_VER_MAJOR)?;
        hdr.write_u16::<LittleEndian>(LOG_VER_MINOR)?;
        hdr.write_u32::<LittleEndian>(0)?; // timezone
        hdr.write_u32::<LittleEndian>(0)?; // sigfigs
        hdr.write_u32::<LittleEndian>(self.snaplen)?;
        hdr.write_u32::<LittleEndian>(LINKTYPE_ETHERNET)?;
        self.file.write_record(&hdr)
    }
}

impl OutputPlugin for UnifiedLogLogger {
    fn name(&self) -> &'static str {
        "unified-log"
    }

    fn log(&mut self, pkt: &Packet) -> Result<()> {
        // unified1 only supports IPv4 alerts.
        if pkt.ipv4_src().is_none() {
            return Ok(());
        }
        let Some(alert) = pkt.alerts.last() else {
            return Ok(());
        };

        // Synthesise an Ethernet header when the source had none.
        let needs_eth = pkt.datalink != Datalink::Ethernet;
        let eth_extra = if needs_eth { ETHERNET_HEADER_LEN } else { 0 };
        let frame_len = (pkt.data.len() + eth_extra) as u32;

        if self
            .file
            .would_exceed(RECORD_HEADER_LEN + frame_len as u64)
        {
            self.file.rotate()?;
            self.write_file_header()?;
        }

        let mut rec =
            Vec::with_capacity(RECORD_HEADER_LEN as usize + frame_len as usize);
        rec.write_u32::<LittleEndian>(alert.gid)?;
        rec.write_u32::<LittleEndian>(alert.sid)?;
        rec.write_u32::<LittleEndian>(alert.rev)?;
        rec.write_u32::<LittleEndian>(alert.class)?;
        rec.write_u32::<LittleEndian>(alert.prio)?;
        rec.write_u32::<LittleEndian>(0)?; // event_id
        rec.write_u32::<LittleEndian>(0)?; // event_reference
        rec.write_u32::<LittleEndian>(pkt.ts.secs as u32)?;
        rec.write_u32::<LittleEndian>(pkt.ts.micros)?;
        rec.write_u32::<LittleEndian>(0)?; // pktflags
        rec.write_u32::<LittleEndian>(pkt.ts.secs as u32)?;
        rec.write_u32::<LittleEndian>(pkt.ts.micros)?;
        rec.write_u32::<LittleEndian>(frame_len)?; // caplen
        rec.write_u32::<LittleEndian>(frame_len)?; // pktlen
        if needs_eth {
            let mut eth = [0u8; ETHERNET_HEADER_LEN];
            eth[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
            rec.extend_from_slice(&eth);
        }
        rec.extend_from_slice(&pkt.data);
        self.file.write_record(&rec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UnifiedFileConfig;
    use crate::flow::table::tests::meta_packet;
    use crate::output::tests::TempDir;
    use crate::packet::{Alert, PacketAction};
    use crate::utils::time::Timestamp;

    #[test]
    fn record_carries_frame_bytes() {
        let tmp = TempDir::new("ul");
        let clock = Arc::new(EngineClock::new());
        clock.set(Timestamp::new(100, 0));
        let cfg = UnifiedFileConfig {
            filename: "unified.log".into(),
            size_limit: 1 << 20,
        };
        let mut logger = UnifiedLogLogger::new(&tmp.0, &cfg, clock).unwrap();

        let mut pkt = meta_packet([1, 2, 3, 4], [5, 6, 7, 8], 1, 2, Timestamp::new(100, 5));
        pkt.alerts.push(Alert {
            gid: 1,
            sid: 7,
            rev: 0,
            class: 0,
            prio: 3,
            msg: String::new(),
            match_offset: 0,
            action: PacketAction::Accept,
        });
        logger.log(&pkt).unwrap();

        let bytes = std::fs::read(logger.file.path()).unwrap();
        assert_eq!(
            bytes.len() as u64,
            FILE_HEADER_LEN + RECORD_HEADER_LEN + pkt.data.len() as u64
        );
        // Frame bytes end the record verbatim.
        assert_eq!(&bytes[bytes.len() - pkt.data.len()..], &pkt.data[..]);
        // Magic in place.
        assert_eq!(&bytes[0..4], &LOG_MAGIC.to_le_bytes());
    }

    #[test]
    fn raw_datalink_gets_synthetic_ethernet() {
        let tmp = TempDir::new("ul-raw");
        let clock = Arc::new(EngineClock::new());
        clock.set(Timestamp::new(100, 0));
        let cfg = UnifiedFileConfig {
            filename: "unified.log".into(),
            size_limit: 1 << 20,
        };
        let mut logger = UnifiedLogLogger::new(&tmp.0, &cfg, clock).unwrap();

        let mut pkt = meta_packet([1, 2, 3, 4], [5, 6, 7, 8], 1, 2, Timestamp::new(1, 0));
        pkt.datalink = Datalink::Raw;
        pkt.alerts.push(Alert {
            gid: 1,
            sid: 7,
            rev: 0,
            class: 0,
            prio: 3,
            msg: String::new(),
            match_offset: 0,
            action: PacketAction::Accept,
        });
        logger.log(&pkt).unwrap();

        let bytes = std::fs::read(logger.file.path()).unwrap();
        let rec_start = FILE_HEADER_LEN as usize;
        let caplen = u32::from_le_bytes(
            bytes[rec_start + 48..rec_start + 52].try_into().unwrap(),
        );
        assert_eq!(caplen as usize, pkt.data.len() + ETHERNET_HEADER_LEN);
        // Synthetic header advertises IPv4.
        let eth = &bytes[rec_start + 56..rec_start + 56 + 14];
        assert_eq!(&eth[12..14], &[0x08, 0x00]);
    }
}
