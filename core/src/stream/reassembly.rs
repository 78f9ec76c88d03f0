//! TCP segment reassembly.
//!
//! One [`StreamReassembly`] per direction holds the segment list, sorted by
//! sequence number and kept non-overlapping at insert time according to the
//! flow's OS policy. Contiguous bytes starting at the delivery base are
//! packaged into chunks once the configured threshold is met; a gap that
//! stays unfilled past the gap timeout is skipped with a gap chunk so the
//! stream can continue.

use crate::memory::MemBudget;
use crate::stream::OsPolicy;
use crate::utils::seq::{seq_geq, seq_gt, seq_leq, seq_lt};
use crate::utils::time::Timestamp;

use std::sync::Arc;

/// One received payload run awaiting delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub seq: u32,
    pub data: Vec<u8>,
}

impl TcpSegment {
    #[inline]
    fn end(&self) -> u32 {
        self.seq.wrapping_add(self.data.len() as u32)
    }
}

/// Outcome of a segment insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Accepted,
    /// Identical seq + length + payload already held or delivered.
    Retransmission,
    /// Every byte lies at or below the delivery base.
    OldData,
    /// The reassembly memory budget refused the bytes.
    MemcapDrop,
}

/// A delivered run of stream bytes, or a gap notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub seq: u32,
    pub data: Vec<u8>,
    /// Set when this chunk records skipped bytes instead of data.
    pub gap_size: Option<u32>,
}

/// Per-direction reassembly state.
#[derive(Debug)]
pub struct StreamReassembly {
    /// Next byte position to deliver.
    base_seq: u32,
    /// Sorted, non-overlapping pending segments.
    segments: Vec<TcpSegment>,
    policy: OsPolicy,
    budget: Arc<MemBudget>,
    /// Bytes currently accounted against the budget.
    reserved: u64,
    /// When the delivery base first hit a hole, for gap timeout decisions.
    blocked_since: Option<Timestamp>,
}

impl StreamReassembly {
    pub fn new(policy: OsPolicy, budget: Arc<MemBudget>) -> Self {
        StreamReassembly {
            base_seq: 0,
            segments: Vec::new(),
            policy,
            budget,
            reserved: 0,
            blocked_since: None,
        }
    }

    /// Anchors the delivery base; called when the stream's ISN is learned.
    pub fn set_base(&mut self, seq: u32) {
        self.base_seq = seq;
    }

    #[inline]
    pub fn base(&self) -> u32 {
        self.base_seq
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        !self.segments.is_empty()
    }

    /// The segment list stays sorted by sequence number at all times.
    pub fn is_sorted(&self) -> bool {
        self.segments
            .windows(2)
            .all(|w| seq_lt(w[0].seq, w[1].seq))
    }

    pub fn insert(&mut self, seq: u32, data: &[u8]) -> InsertOutcome {
        if data.is_empty() {
            return InsertOutcome::OldData;
        }
        let mut seq = seq;
        let mut buf = data.to_vec();

        // Bytes at or below the base were already delivered.
        if seq_lt(seq, self.base_seq) {
            let skip = self.base_seq.wrapping_sub(seq) as usize;
            if skip >= buf.len() {
                return InsertOutcome::OldData;
            }
            buf.drain(..skip);
            seq = self.base_seq;
        }

        // Pure retransmissions are silently dropped.
        if let Some(existing) = self.segments.iter().find(|s| s.seq == seq) {
            if existing.data == buf {
                return InsertOutcome::Retransmission;
            }
        }

        let outcome = if self.policy.favors_new_data() {
            self.insert_keep_new(seq, buf)
        } else {
            self.insert_keep_old(seq, buf)
        };
        debug_assert!(self.is_sorted());
        outcome
    }

    /// Original bytes win: the new segment only fills holes.
    fn insert_keep_old(&mut self, seq: u32, buf: Vec<u8>) -> InsertOutcome {
        let mut pieces: Vec<TcpSegment> = vec![TcpSegment { seq, data: buf }];
        for seg in &self.segments {
            let mut next = Vec::new();
            for piece in pieces {
                next.extend(subtract(piece, seg.seq, seg.end()));
            }
            pieces = next;
            if pieces.is_empty() {
                break;
            }
        }
        if pieces.is_empty() {
            return InsertOutcome::OldData;
        }
        let mut any_dropped = false;
        for piece in pieces {
            if !self.reserve(piece.data.len()) {
                any_dropped = true;
                continue;
            }
            self.insert_sorted(piece);
        }
        if any_dropped {
            InsertOutcome::MemcapDrop
        } else {
            InsertOutcome::Accepted
        }
    }

    /// Newest bytes win: overlapped parts of held segments are evicted.
    fn insert_keep_new(&mut self, seq: u32, buf: Vec<u8>) -> InsertOutcome {
        let end = seq.wrapping_add(buf.len() as u32);
        let mut replacement: Vec<TcpSegment> = Vec::with_capacity(self.segments.len() + 1);
        let mut released = 0usize;
        for seg in self.segments.drain(..) {
            if seq_leq(seg.end(), seq) || seq_geq(seg.seq, end) {
                replacement.push(seg);
                continue;
            }
            // Keep the part of the old segment left of the new range.
            if seq_lt(seg.seq, seq) {
                let keep = seq.wrapping_sub(seg.seq) as usize;
                replacement.push(TcpSegment {
                    seq: seg.seq,
                    data: seg.data[..keep].to_vec(),
                });
                released += seg.data.len() - keep;
                // And the part right of it, if the old segment spans past.
                if seq_gt(seg.end(), end) {
                    let tail = seg.end().wrapping_sub(end) as usize;
                    let tail_data = seg.data[seg.data.len() - tail..].to_vec();
                    released -= tail;
                    replacement.push(TcpSegment {
                        seq: end,
                        data: tail_data,
                    });
                }
            } else if seq_gt(seg.end(), end) {
                let tail = seg.end().wrapping_sub(end) as usize;
                released += seg.data.len() - tail;
                replacement.push(TcpSegment {
                    seq: end,
                    data: seg.data[seg.data.len() - tail..].to_vec(),
                });
            } else {
                released += seg.data.len();
            }
        }
        self.segments = replacement;
        self.release(released);

        if !self.reserve(buf.len()) {
            return InsertOutcome::MemcapDrop;
        }
        self.insert_sorted(TcpSegment { seq, data: buf });
        InsertOutcome::Accepted
    }

    fn insert_sorted(&mut self, seg: TcpSegment) {
        let pos = self
            .segments
            .iter()
            .position(|s| seq_gt(s.seq, seg.seq))
            .unwrap_or(self.segments.len());
        self.segments.insert(pos, seg);
    }

    /// Packages deliverable bytes into chunks.
    ///
    /// Contiguous bytes from the base are emitted once at least `threshold`
    /// are available (always when `force` is set), in pieces of at most
    /// `msg_cap`. A hole older than `gap_timeout` seconds yields a gap chunk
    /// and delivery resumes past it.
    pub fn deliver(
        &mut self,
        threshold: usize,
        msg_cap: usize,
        now: Timestamp,
        gap_timeout: u64,
        force: bool,
    ) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        loop {
            let contiguous = self.contiguous_len();
            if contiguous > 0 && (force || contiguous >= threshold) {
                self.blocked_since = None;
                let take = contiguous.min(msg_cap);
                let seq = self.base_seq;
                let data = self.take_bytes(take);
                chunks.push(Chunk {
                    seq,
                    data,
                    gap_size: None,
                });
                continue;
            }
            // Blocked on a hole with future data pending?
            if contiguous == 0 && self.has_pending() {
                let first_seq = self.segments[0].seq;
                let gap = first_seq.wrapping_sub(self.base_seq);
                let expired = match self.blocked_since {
                    Some(since) => now.secs_since(since) >= gap_timeout,
                    None => {
                        self.blocked_since = Some(now);
                        false
                    }
                };
                if expired || force {
                    log::debug!("skipping {} byte reassembly gap", gap);
                    self.blocked_since = None;
                    self.base_seq = first_seq;
                    chunks.push(Chunk {
                        seq: first_seq,
                        data: Vec::new(),
                        gap_size: Some(gap),
                    });
                    continue;
                }
            }
            break;
        }
        chunks
    }

    /// Length of the contiguous byte run starting at the base.
    fn contiguous_len(&self) -> usize {
        let mut len = 0usize;
        let mut expect = self.base_seq;
        for seg in &self.segments {
            if seg.seq != expect {
                break;
            }
            len += seg.data.len();
            expect = seg.end();
        }
        len
    }

    /// Removes `take` contiguous bytes from the front of the list.
    fn take_bytes(&mut self, take: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(take);
        while out.len() < take {
            let needed = take - out.len();
            let seg = &mut self.segments[0];
            if seg.data.len() <= needed {
                out.extend_from_slice(&seg.data);
                self.base_seq = seg.end();
                let len = seg.data.len();
                self.segments.remove(0);
                self.release(len);
            } else {
                out.extend_from_slice(&seg.data[..needed]);
                seg.seq = seg.seq.wrapping_add(needed as u32);
                seg.data.drain(..needed);
                self.base_seq = seg.seq;
                self.release(needed);
            }
        }
        out
    }

    fn reserve(&mut self, bytes: usize) -> bool {
        if self.budget.try_reserve(bytes as u64) {
            self.reserved += bytes as u64;
            true
        } else {
            false
        }
    }

    fn release(&mut self, bytes: usize) {
        let bytes = bytes as u64;
        debug_assert!(self.reserved >= bytes);
        self.budget.release(bytes.min(self.reserved));
        self.reserved -= bytes.min(self.reserved);
    }
}

impl Drop for StreamReassembly {
    fn drop(&mut self) {
        if self.reserved > 0 {
            self.budget.release(self.reserved);
        }
    }
}

/// Subtracts the range `[from, to)` from a segment, returning the surviving
/// pieces in order.
fn subtract(piece: TcpSegment, from: u32, to: u32) -> Vec<TcpSegment> {
    let p_end = piece.end();
    // No overlap.
    if seq_leq(p_end, from) || seq_geq(piece.seq, to) {
        return vec![piece];
    }
    let mut out = Vec::new();
    if seq_lt(piece.seq, from) {
        let keep = from.wrapping_sub(piece.seq) as usize;
        out.push(TcpSegment {
            seq: piece.seq,
            data: piece.data[..keep].to_vec(),
        });
    }
    if seq_gt(p_end, to) {
        let tail = p_end.wrapping_sub(to) as usize;
        out.push(TcpSegment {
            seq: to,
            data: piece.data[piece.data.len() - tail..].to_vec(),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reasm(policy: OsPolicy) -> StreamReassembly {
        StreamReassembly::new(policy, Arc::new(MemBudget::new(1 << 20)))
    }

    fn flush(r: &mut StreamReassembly) -> Vec<u8> {
        r.deliver(1, 4096, Timestamp::new(0, 0), 60, true)
            .into_iter()
            .flat_map(|c| c.data)
            .collect()
    }

    #[test]
    fn in_order_delivery() {
        let mut r = reasm(OsPolicy::Bsd);
        r.set_base(1);
        assert_eq!(r.insert(1, b"abc"), InsertOutcome::Accepted);
        assert_eq!(r.insert(4, b"def"), InsertOutcome::Accepted);
        assert_eq!(flush(&mut r), b"abcdef");
    }

    #[test]
    fn out_of_order_delivery_is_seq_ordered() {
        let mut r = reasm(OsPolicy::Bsd);
        r.set_base(10);
        r.insert(13, b"def");
        assert!(r.is_sorted());
        r.insert(10, b"abc");
        assert!(r.is_sorted());
        assert_eq!(flush(&mut r), b"abcdef");
    }

    #[test]
    fn retransmission_dropped_silently() {
        let mut r = reasm(OsPolicy::Bsd);
        r.set_base(1);
        assert_eq!(r.insert(1, b"abc"), InsertOutcome::Accepted);
        assert_eq!(r.insert(1, b"abc"), InsertOutcome::Retransmission);
        assert_eq!(flush(&mut r), b"abc");
    }

    #[test]
    fn old_data_is_rejected() {
        let mut r = reasm(OsPolicy::Bsd);
        r.set_base(100);
        assert_eq!(r.insert(90, b"0123456789"), InsertOutcome::OldData);
        // Straddling the base: only the new part survives.
        assert_eq!(r.insert(95, b"0123456789"), InsertOutcome::Accepted);
        assert_eq!(flush(&mut r), b"56789");
    }

    #[test]
    fn first_policy_keeps_original_bytes() {
        let mut r = reasm(OsPolicy::First);
        r.set_base(1);
        r.insert(1, b"AAAA");
        // Overlapping rewrite loses; only the extension survives.
        r.insert(3, b"BBBB");
        assert_eq!(flush(&mut r), b"AAAABB");
    }

    #[test]
    fn last_policy_prefers_new_bytes() {
        let mut r = reasm(OsPolicy::Last);
        r.set_base(1);
        r.insert(1, b"AAAA");
        r.insert(3, b"BBBB");
        assert_eq!(flush(&mut r), b"AABBBB");
    }

    #[test]
    fn linux_policy_prefers_new_bytes() {
        let mut r = reasm(OsPolicy::Linux);
        r.set_base(1);
        r.insert(1, b"AAAAAA");
        // New segment inside the old one replaces the middle.
        r.insert(3, b"XX");
        assert_eq!(flush(&mut r), b"AAXXAA");
    }

    #[test]
    fn keep_old_fills_only_holes() {
        let mut r = reasm(OsPolicy::Bsd);
        r.set_base(1);
        r.insert(1, b"AA"); // 1..3
        r.insert(5, b"CC"); // 5..7
        // Covers 1..7; only the 3..5 hole should be taken.
        r.insert(1, b"XXXXXX");
        assert_eq!(flush(&mut r), b"AAXXCC");
    }

    #[test]
    fn gap_emitted_after_timeout() {
        let mut r = reasm(OsPolicy::Bsd);
        r.set_base(1);
        r.insert(11, b"late");

        // First blocked observation arms the timer; nothing emitted yet.
        let chunks = r.deliver(1, 4096, Timestamp::new(100, 0), 5, false);
        assert!(chunks.is_empty());
        // Before the timeout, still nothing.
        let chunks = r.deliver(1, 4096, Timestamp::new(103, 0), 5, false);
        assert!(chunks.is_empty());
        // Past the timeout the gap is skipped and data flows.
        let chunks = r.deliver(1, 4096, Timestamp::new(106, 0), 5, false);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].gap_size, Some(10));
        assert_eq!(chunks[1].data, b"late");
    }

    #[test]
    fn gap_filled_in_time_delivers_in_order() {
        let mut r = reasm(OsPolicy::Bsd);
        r.set_base(1);
        r.insert(4, b"def");
        assert!(r.deliver(1, 4096, Timestamp::new(100, 0), 60, false).is_empty());
        r.insert(1, b"abc");
        let chunks = r.deliver(1, 4096, Timestamp::new(101, 0), 60, false);
        let bytes: Vec<u8> = chunks.into_iter().flat_map(|c| c.data).collect();
        assert_eq!(bytes, b"abcdef");
    }

    #[test]
    fn threshold_defers_delivery() {
        let mut r = reasm(OsPolicy::Bsd);
        r.set_base(1);
        r.insert(1, b"ab");
        assert!(r.deliver(4, 4096, Timestamp::new(0, 0), 60, false).is_empty());
        r.insert(3, b"cd");
        let chunks = r.deliver(4, 4096, Timestamp::new(0, 0), 60, false);
        assert_eq!(chunks[0].data, b"abcd");
    }

    #[test]
    fn msg_cap_splits_chunks() {
        let mut r = reasm(OsPolicy::Bsd);
        r.set_base(0);
        r.insert(0, &[7u8; 10]);
        let chunks = r.deliver(1, 4, Timestamp::new(0, 0), 60, true);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].data.len(), 4);
        assert_eq!(chunks[2].data.len(), 2);
    }

    #[test]
    fn memcap_drops_segments() {
        let budget = Arc::new(MemBudget::new(8));
        let mut r = StreamReassembly::new(OsPolicy::Bsd, Arc::clone(&budget));
        r.set_base(0);
        assert_eq!(r.insert(0, b"12345678"), InsertOutcome::Accepted);
        assert_eq!(r.insert(8, b"x"), InsertOutcome::MemcapDrop);
        assert!(budget.in_emergency());
        // Delivery releases budget again.
        flush(&mut r);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn budget_released_on_drop() {
        let budget = Arc::new(MemBudget::new(100));
        {
            let mut r = StreamReassembly::new(OsPolicy::Bsd, Arc::clone(&budget));
            r.set_base(0);
            r.insert(0, b"hello");
            assert_eq!(budget.used(), 5);
        }
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn wraparound_sequence_delivery() {
        let mut r = reasm(OsPolicy::Bsd);
        let base = u32::MAX - 1;
        r.set_base(base);
        r.insert(base, b"ab"); // crosses the 2^32 boundary
        r.insert(0, b"cd");
        assert!(r.is_sorted());
        assert_eq!(flush(&mut r), b"abcd");
        assert_eq!(r.base(), 2);
    }
}
