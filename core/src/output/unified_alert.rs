//! Unified alert output.
//!
//! Binary alert records compatible with Snort's unified1 alert format, so
//! downstream spool readers can consume them. IPv4 only; one record per
//! packet carrying the packet's last alert. Records are written then
//! flushed so readers never see a partial record.

use crate::config::UnifiedFileConfig;
use crate::output::{OutputPlugin, RotatingFile};
use crate::packet::Packet;
use crate::utils::time::EngineClock;

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

pub const ALERT_MAGIC: u32 = 0xDEAD_4137;
pub const ALERT_VER_MAJOR: u32 = 1;
pub const ALERT_VER_MINOR: u32 = 81;
/// File header: magic, major, minor, timezone.
pub const FILE_HEADER_LEN: u64 = 16;
/// Fixed record size: fifteen 32-bit fields plus the two 16-bit ports.
pub const RECORD_LEN: u64 = 64;

/// One decoded alert record, as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertRecord {
    pub sig_gen: u32,
    pub sig_sid: u32,
    pub sig_rev: u32,
    pub sig_class: u32,
    pub sig_prio: u32,
    pub ts_sec: u32,
    pub ts_usec: u32,
    pub src_ip: [u8; 4],
    pub dst_ip: [u8; 4],
    pub sp: u16,
    pub dp: u16,
    pub proto: u32,
    pub flags: u32,
}

pub struct UnifiedAlertLogger {
    file: RotatingFile,
}

impl UnifiedAlertLogger {
    pub fn new(dir: &Path, cfg: &UnifiedFileConfig, clock: Arc<EngineClock>) -> Result<Self> {
        let file = RotatingFile::open(dir, &cfg.filename, cfg.size_limit, clock)?;
        let mut logger = UnifiedAlertLogger { file };
        logger.write_file_header()?;
        Ok(logger)
    }

    fn write_file_header(&mut self) -> Result<()> {
        let mut hdr = Vec::with_capacity(FILE_HEADER_LEN as usize);
        hdr.write_u32::<LittleEndian>(ALERT_MAGIC)?;
        hdr.write_u32::<LittleEndian>(ALERT_VER_MAJOR)?;
        hdr.write_u32::<LittleEndian>(ALERT_VER_MINOR)?;
        hdr.write_u32::<LittleEndian>(0)?; // timezone
        self.file.write_record(&hdr)
    }
}

impl OutputPlugin for UnifiedAlertLogger {
    fn name(&self) -> &'static str {
        "unified-alert"
    }

    fn log(&mut self, pkt: &Packet) -> Result<()> {
        // The unified1 format only supports IPv4.
        let (Some(src), Some(dst)) = (pkt.ipv4_src(), pkt.ipv4_dst()) else {
            return Ok(());
        };
        let Some(alert) = pkt.alerts.last() else {
            return Ok(());
        };

        if self.file.would_exceed(RECORD_LEN) {
            self.file.rotate()?;
            self.write_file_header()?;
        }

        let mut rec = Vec::with_capacity(RECORD_LEN as usize);
        rec.write_u32::<LittleEndian>(alert.gid)?;
        rec.write_u32::<LittleEndian>(alert.sid)?;
        rec.write_u32::<LittleEndian>(alert.rev)?;
        rec.write_u32::<LittleEndian>(alert.class)?;
        rec.write_u32::<LittleEndian>(alert.prio)?;
        rec.write_u32::<LittleEndian>(0)?; // event_id
        rec.write_u32::<LittleEndian>(0)?; // event_reference
        rec.write_u32::<LittleEndian>(pkt.ts.secs as u32)?;
        rec.write_u32::<LittleEndian>(pkt.ts.micros)?;
        rec.write_u32::<LittleEndian>(pkt.ts.secs as u32)?;
        rec.write_u32::<LittleEndian>(pkt.ts.micros)?;
        // Addresses keep network byte order on disk.
        rec.extend_from_slice(&src.octets());
        rec.extend_from_slice(&dst.octets());
        rec.write_u16::<LittleEndian>(pkt.src_port())?;
        rec.write_u16::<LittleEndian>(pkt.dst_port())?;
        rec.write_u32::<LittleEndian>(pkt.ip_proto().unwrap_or(0) as u32)?;
        rec.write_u32::<LittleEndian>(0)?; // flags
        debug_assert_eq!(rec.len() as u64, RECORD_LEN);
        self.file.write_record(&rec)
    }
}

/// Reads a unified alert file back; validates the header. Used by spool
/// tooling and tests.
pub fn read_alert_file(path: &Path) -> Result<Vec<AlertRecord>> {
    let mut f = std::fs::File::open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let magic = f.read_u32::<LittleEndian>()?;
    if magic != ALERT_MAGIC {
        bail!("bad unified alert magic {:#x}", magic);
    }
    let major = f.read_u32::<LittleEndian>()?;
    let minor = f.read_u32::<LittleEndian>()?;
    if (major, minor) != (ALERT_VER_MAJOR, ALERT_VER_MINOR) {
        bail!("unsupported unified alert version {}.{}", major, minor);
    }
    let _timezone = f.read_u32::<LittleEndian>()?;

    let mut records = Vec::new();
    loop {
        let sig_gen = match f.read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        let sig_sid = f.read_u32::<LittleEndian>()?;
        let sig_rev = f.read_u32::<LittleEndian>()?;
        let sig_class = f.read_u32::<LittleEndian>()?;
        let sig_prio = f.read_u32::<LittleEndian>()?;
        let _event_id = f.read_u32::<LittleEndian>()?;
        let _event_ref = f.read_u32::<LittleEndian>()?;
        let ts_sec = f.read_u32::<LittleEndian>()?;
        let ts_usec = f.read_u32::<LittleEndian>()?;
        let _ts_sec2 = f.read_u32::<LittleEndian>()?;
        let _ts_usec2 = f.read_u32::<LittleEndian>()?;
        let mut src_ip = [0u8; 4];
        f.read_exact(&mut src_ip)?;
        let mut dst_ip = [0u8; 4];
        f.read_exact(&mut dst_ip)?;
        let sp = f.read_u16::<LittleEndian>()?;
        let dp = f.read_u16::<LittleEndian>()?;
        let proto = f.read_u32::<LittleEndian>()?;
        let flags = f.read_u32::<LittleEndian>()?;
        records.push(AlertRecord {
            sig_gen,
            sig_sid,
            sig_rev,
            sig_class,
            sig_prio,
            ts_sec,
            ts_usec,
            src_ip,
            dst_ip,
            sp,
            dp,
            proto,
            flags,
        });
    }
    Ok(records)
}
