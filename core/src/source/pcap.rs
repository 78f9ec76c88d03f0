//! pcap sources: offline capture files and live interfaces.

use crate::config::SourceConfig;
use crate::packet::{Datalink, Packet};
use crate::source::{PacketSource, PollStatus};
use crate::utils::time::Timestamp;

use anyhow::{Context, Result};
use pcap::{Active, Capture, Offline};

/// Read timeout for live captures, milliseconds.
const LIVE_TIMEOUT_MS: i32 = 100;

fn map_linktype(raw: i32) -> Datalink {
    match raw {
        1 => Datalink::Ethernet,
        9 => Datalink::Ppp,
        12 | 101 => Datalink::Raw,
        113 => Datalink::LinuxSll,
        other => {
            log::warn!("unhandled datalink {}, treating as ethernet", other);
            Datalink::Ethernet
        }
    }
}

/// Offline source over a capture file.
pub struct PcapFileSource {
    cap: Capture<Offline>,
    datalink: Datalink,
    path: String,
}

impl PcapFileSource {
    pub fn open(path: &str) -> Result<Self> {
        let cap = Capture::from_file(path)
            .with_context(|| format!("opening capture file {}", path))?;
        let datalink = map_linktype(cap.get_datalink().0);
        log::info!("reading capture file {} ({:?})", path, datalink);
        Ok(PcapFileSource {
            cap,
            datalink,
            path: path.to_string(),
        })
    }
}

impl PacketSource for PcapFileSource {
    fn datalink(&self) -> Datalink {
        self.datalink
    }

    fn poll(&mut self, pkt: &mut Packet) -> Result<PollStatus> {
        match self.cap.next() {
            Ok(frame) => {
                let ts = Timestamp::new(
                    frame.header.ts.tv_sec.max(0) as u64,
                    frame.header.ts.tv_usec.max(0) as u32,
                );
                pkt.init(frame.data, self.datalink, ts);
                Ok(PollStatus::Packet)
            }
            Err(pcap::Error::NoMorePackets) => {
                log::info!("capture file {} exhausted", self.path);
                Ok(PollStatus::Eof)
            }
            Err(e) => Err(e).context("reading capture file"),
        }
    }
}

/// Live source sniffing an interface.
pub struct PcapLiveSource {
    cap: Capture<Active>,
    datalink: Datalink,
}

impl PcapLiveSource {
    pub fn open(cfg: &SourceConfig) -> Result<Self> {
        let iface = cfg
            .interface
            .as_deref()
            .context("no capture interface configured")?;
        let cap = Capture::from_device(iface)
            .with_context(|| format!("opening device {}", iface))?
            .promisc(cfg.promisc)
            .snaplen(cfg.snaplen)
            .timeout(LIVE_TIMEOUT_MS)
            .open()
            .with_context(|| format!("activating capture on {}", iface))?;
        let datalink = map_linktype(cap.get_datalink().0);
        log::info!("listening on {} ({:?})", iface, datalink);
        Ok(PcapLiveSource { cap, datalink })
    }
}

impl PacketSource for PcapLiveSource {
    fn datalink(&self) -> Datalink {
        self.datalink
    }

    fn poll(&mut self, pkt: &mut Packet) -> Result<PollStatus> {
        match self.cap.next() {
            Ok(frame) => {
                let ts = Timestamp::new(
                    frame.header.ts.tv_sec.max(0) as u64,
                    frame.header.ts.tv_usec.max(0) as u32,
                );
                pkt.init(frame.data, self.datalink, ts);
                Ok(PollStatus::Packet)
            }
            Err(pcap::Error::TimeoutExpired) => Ok(PollStatus::Timeout),
            Err(e) => Err(e).context("reading live capture"),
        }
    }

    fn inject(&mut self, frame: &[u8]) -> Result<()> {
        self.cap
            .sendpacket(frame)
            .context("injecting response frame")
    }
}
