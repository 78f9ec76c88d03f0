//! Bit-parallel q-gram matcher (BNDMq).
//!
//! The hot path slides a window of the group's minimum pattern length over
//! the buffer and shifts by the longest safe amount computed from a table
//! indexed by a 2-byte lowercased q-gram hash. A window that survives to
//! position zero is verified against the hash bucket's pattern chain, gated
//! by a per-bucket bloom filter over pattern prefixes.
//!
//! Length-1 patterns use a 256-entry byte table; when every pattern is at
//! most two bytes the window scan is skipped entirely in favour of a
//! 16-bit hash probe per position.

use crate::mpm::bloom::BloomFilter;
use crate::mpm::{Pattern, Pmq};

/// Hash table size for the shift and verify tables: fits every value of
/// `(a << 4) | b` over lowercased byte pairs.
const HASH_SIZE: usize = 4096;
const HASH_SHIFT: u32 = 4;
const Q: usize = 2;
/// Window length cap, bounded by the u32 shift-word width.
const MAX_M: usize = 31;
const BLOOM_BITS: u32 = 1024;
const BLOOM_ITERATIONS: u32 = 2;

#[inline]
fn hash16(a: u8, b: u8) -> usize {
    ((a.to_ascii_lowercase() as usize) << HASH_SHIFT) | (b.to_ascii_lowercase() as usize)
}

/// A compiled matcher context over one pattern set.
#[derive(Debug)]
pub struct B2g {
    patterns: Vec<Pattern>,
    /// Window length; zero when no pattern is long enough to window-scan.
    m: usize,
    /// Shift table: q-gram hash to bit-parallel position set.
    shift: Vec<u32>,
    /// Verify chains keyed by the window's trailing q-gram hash.
    buckets: Vec<Vec<u16>>,
    bloom: Vec<Option<BloomFilter>>,
    /// Minimum full pattern length per bucket, for bloom prefix tests.
    pminlen: Vec<u16>,
    /// Length-1 pattern chains indexed by lowercased byte.
    pat1: Vec<Vec<u16>>,
    /// Length-2 pattern chains, used only when the window scan is skipped.
    pat2: Vec<Vec<u16>>,
    /// Set when the whole context is a single case-sensitive byte.
    single_byte: Option<u16>,
    has_len1: bool,
}

impl B2g {
    pub fn new(patterns: Vec<Pattern>) -> Self {
        let max_len = patterns.iter().map(|p| p.len()).max().unwrap_or(0);
        let windowed = max_len > Q;
        let m = if windowed {
            patterns
                .iter()
                .filter(|p| p.len() >= Q)
                .map(|p| p.len())
                .min()
                .unwrap_or(0)
                .min(MAX_M)
        } else {
            0
        };

        let mut ctx = B2g {
            patterns,
            m,
            shift: if windowed { vec![0u32; HASH_SIZE] } else { Vec::new() },
            buckets: if windowed {
                vec![Vec::new(); HASH_SIZE]
            } else {
                Vec::new()
            },
            bloom: if windowed {
                (0..HASH_SIZE).map(|_| None).collect()
            } else {
                Vec::new()
            },
            pminlen: if windowed { vec![0u16; HASH_SIZE] } else { Vec::new() },
            pat1: vec![Vec::new(); 256],
            pat2: if windowed {
                Vec::new()
            } else {
                vec![Vec::new(); HASH_SIZE]
            },
            single_byte: None,
            has_len1: false,
        };
        ctx.prepare(windowed);
        ctx
    }

    fn prepare(&mut self, windowed: bool) {
        for (idx, p) in self.patterns.iter().enumerate() {
            let idx = idx as u16;
            match p.len() {
                0 => unreachable!("empty patterns are rejected at registration"),
                1 => {
                    self.pat1[p.ci[0] as usize].push(idx);
                    self.has_len1 = true;
                }
                2 if !windowed => {
                    self.pat2[hash16(p.ci[0], p.ci[1])].push(idx);
                }
                _ => {
                    // All multi-byte patterns join the window scan.
                    let m = self.m;
                    for j in 0..=(m - Q) {
                        let h = hash16(p.ci[j], p.ci[j + 1]);
                        self.shift[h] |= 1u32 << (m - j);
                    }
                    let hv = hash16(p.ci[m - 2], p.ci[m - 1]);
                    self.buckets[hv].push(idx);
                }
            }
        }

        // One case-sensitive single byte in total: memchr does the scan.
        let len1_total: usize = self.pat1.iter().map(|b| b.len()).sum();
        if len1_total == 1 && self.patterns.len() == 1 && !self.patterns[0].nocase {
            self.single_byte = Some(0);
        }

        // Bloom filters over each verify bucket's pattern prefixes.
        if !self.buckets.is_empty() {
            for h in 0..HASH_SIZE {
                if self.buckets[h].is_empty() {
                    continue;
                }
                let pminlen = self.buckets[h]
                    .iter()
                    .map(|&i| self.patterns[i as usize].len())
                    .min()
                    .unwrap()
                    .min(u16::MAX as usize) as u16;
                self.pminlen[h] = pminlen;
                let mut bf = BloomFilter::new(BLOOM_BITS, BLOOM_ITERATIONS);
                for &i in &self.buckets[h] {
                    bf.add(&self.patterns[i as usize].ci[..pminlen as usize]);
                }
                self.bloom[h] = Some(bf);
            }
        }
    }

    #[inline]
    pub fn pattern_cnt(&self) -> usize {
        self.patterns.len()
    }

    /// Scans `buf` and records confirmed matches in `pmq`. The queue is not
    /// cleared here: a packet's payload and stream messages pool candidates.
    pub fn scan(&self, buf: &[u8], pmq: &mut Pmq) -> usize {
        let mut matches = 0;
        if self.has_len1 {
            matches += self.scan_len1(buf, pmq);
        }
        if self.m == 0 {
            if !self.pat2.is_empty() {
                matches += self.scan_len2(buf, pmq);
            }
            return matches;
        }
        if buf.len() >= self.m {
            matches += self.scan_bndmq(buf, pmq);
        }
        matches
    }

    fn scan_len1(&self, buf: &[u8], pmq: &mut Pmq) -> usize {
        let mut matches = 0;
        if let Some(idx) = self.single_byte {
            let p = &self.patterns[idx as usize];
            for off in memchr::memchr_iter(p.cs[0], buf) {
                pmq.register(p.id, off);
                matches += 1;
            }
            return matches;
        }
        for (off, &byte) in buf.iter().enumerate() {
            for &idx in &self.pat1[byte.to_ascii_lowercase() as usize] {
                let p = &self.patterns[idx as usize];
                if p.matches_at(&buf[off..]) {
                    pmq.register(p.id, off);
                    matches += 1;
                }
            }
        }
        matches
    }

    fn scan_len2(&self, buf: &[u8], pmq: &mut Pmq) -> usize {
        let mut matches = 0;
        if buf.len() < 2 {
            return 0;
        }
        for off in 0..buf.len() - 1 {
            for &idx in &self.pat2[hash16(buf[off], buf[off + 1])] {
                let p = &self.patterns[idx as usize];
                if p.matches_at(&buf[off..]) {
                    pmq.register(p.id, off);
                    matches += 1;
                }
            }
        }
        matches
    }

    fn scan_bndmq(&self, buf: &[u8], pmq: &mut Pmq) -> usize {
        let m = self.m;
        let mut matches = 0;
        let mut pos = m - 1;
        let last = buf.len() - 1;
        while pos <= last {
            let mut d = self.shift[hash16(buf[pos - 1], buf[pos])];
            if d != 0 {
                let mut j = pos;
                let first = pos - (m - 1);
                loop {
                    j -= 1;
                    if d >= 1u32 << (m - 1) {
                        if j > first {
                            pos = j;
                        } else {
                            matches += self.verify_window(buf, j, pmq);
                        }
                    }
                    if j == 0 {
                        break;
                    }
                    d = (d << 1) & self.shift[hash16(buf[j - 1], buf[j])];
                    if d == 0 {
                        break;
                    }
                }
            }
            pos += m - 1;
        }
        matches
    }

    /// Verifies all patterns hanging off the window ending q-gram.
    #[inline]
    fn verify_window(&self, buf: &[u8], j: usize, pmq: &mut Pmq) -> usize {
        let hv = hash16(buf[j + self.m - 2], buf[j + self.m - 1]);
        if let Some(bloom) = &self.bloom[hv] {
            let pminlen = self.pminlen[hv] as usize;
            if buf.len() - j < pminlen || !bloom.test(&buf[j..j + pminlen]) {
                return 0;
            }
        } else {
            return 0;
        }
        let mut matches = 0;
        for &idx in &self.buckets[hv] {
            let p = &self.patterns[idx as usize];
            if p.matches_at(&buf[j..]) {
                pmq.register(p.id, j);
                matches += 1;
            }
        }
        matches
    }
}
