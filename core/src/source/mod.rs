//! Packet sources.
//!
//! A source feeds raw frames into the pipeline and applies verdicts for
//! inline deployments. Sources are pluggable behind [`PacketSource`]; pcap
//! live and file implementations are built in, NFQ-style inline sources
//! plug in externally.

pub mod pcap;

use crate::packet::{Datalink, Packet};
use crate::utils::time::Timestamp;

use anyhow::Result;

/// Outcome of one poll.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PollStatus {
    /// A frame was written into the packet.
    Packet,
    /// Nothing available right now (live sources).
    Timeout,
    /// The source is exhausted (offline sources).
    Eof,
}

/// A packet source plug-in.
///
/// `poll` fills the pooled packet with the next frame and stamps its
/// timestamp and datalink; `verdict` applies accept/drop for inline
/// sources; `inject` transmits a synthesised response frame.
pub trait PacketSource: Send {
    fn datalink(&self) -> Datalink;

    fn poll(&mut self, pkt: &mut Packet) -> Result<PollStatus>;

    fn verdict(&mut self, _pkt: &Packet, _drop: bool) -> Result<()> {
        Ok(())
    }

    fn inject(&mut self, _frame: &[u8]) -> Result<()> {
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Inline verdict application.
///
/// Implemented by sources that hold packets until a verdict is returned
/// (NFQ-style inline deployments). Passive captures have no sink; the
/// verdict stage then only accounts the decision.
pub trait VerdictSink: Send {
    fn verdict(&mut self, pkt: &Packet, drop: bool) -> Result<()>;
}

/// An in-memory source over pre-built frames. Used by tests and the
/// offline replay path.
pub struct VecSource {
    frames: Vec<(Vec<u8>, Timestamp)>,
    datalink: Datalink,
    next: usize,
}

impl VecSource {
    pub fn new(frames: Vec<(Vec<u8>, Timestamp)>, datalink: Datalink) -> Self {
        VecSource {
            frames,
            datalink,
            next: 0,
        }
    }
}

impl PacketSource for VecSource {
    fn datalink(&self) -> Datalink {
        self.datalink
    }

    fn poll(&mut self, pkt: &mut Packet) -> Result<PollStatus> {
        match self.frames.get(self.next) {
            Some((frame, ts)) => {
                pkt.init(frame, self.datalink, *ts);
                self.next += 1;
                Ok(PollStatus::Packet)
            }
            None => Ok(PollStatus::Eof),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_source_replays_then_eofs() {
        let mut src = VecSource::new(
            vec![
                (vec![1, 2, 3], Timestamp::new(1, 0)),
                (vec![4, 5], Timestamp::new(2, 0)),
            ],
            Datalink::Ethernet,
        );
        let mut pkt = Packet::default();
        assert_eq!(src.poll(&mut pkt).unwrap(), PollStatus::Packet);
        assert_eq!(pkt.data, vec![1, 2, 3]);
        assert_eq!(src.poll(&mut pkt).unwrap(), PollStatus::Packet);
        assert_eq!(pkt.ts, Timestamp::new(2, 0));
        assert_eq!(src.poll(&mut pkt).unwrap(), PollStatus::Eof);
    }
}
