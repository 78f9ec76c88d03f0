//! Multi-pattern matching.
//!
//! The first-pass filter of the detection engine: all content patterns of a
//! signature group are compiled into one matcher context scanned once per
//! buffer. Surviving candidates are confirmed per signature afterwards.
//!
//! Matcher implementations are a closed set selected at build time.

pub mod b2g;
pub mod bloom;

pub use b2g::B2g;

use thiserror::Error;

pub type PatternId = u32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MpmError {
    #[error("empty pattern")]
    EmptyPattern,
    #[error("unknown matcher {0:?}")]
    UnknownMatcher(String),
}

/// One registered content needle.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub id: PatternId,
    /// Case-sensitive bytes as written.
    pub cs: Vec<u8>,
    /// Lowercased bytes for case-insensitive comparison.
    pub ci: Vec<u8>,
    pub nocase: bool,
    /// Internal ids of signatures that reference this pattern.
    pub sids: Vec<u32>,
}

impl Pattern {
    #[inline]
    pub fn len(&self) -> usize {
        self.cs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cs.is_empty()
    }

    /// Case-aware comparison against `hay` at offset 0.
    #[inline]
    pub fn matches_at(&self, hay: &[u8]) -> bool {
        if hay.len() < self.len() {
            return false;
        }
        if self.nocase {
            self.ci
                .iter()
                .zip(hay)
                .all(|(p, h)| *p == h.to_ascii_lowercase())
        } else {
            &hay[..self.len()] == self.cs.as_slice()
        }
    }
}

/// Collects patterns for one matcher context, de-duplicating identical
/// needles and assigning stable pattern ids.
#[derive(Debug, Default)]
pub struct PatternSet {
    patterns: Vec<Pattern>,
}

impl PatternSet {
    pub fn new() -> Self {
        PatternSet::default()
    }

    /// Adds a needle for signature `sid`. Identical needles share one
    /// pattern id, assigned sequentially within this set.
    pub fn add(&mut self, bytes: &[u8], nocase: bool, sid: u32) -> Result<PatternId, MpmError> {
        let id = self.patterns.len() as PatternId;
        self.add_with_id(id, bytes, nocase, sid)
    }

    /// Adds a needle carrying an engine-global pattern id. Matches are
    /// reported under that id, which lets de-duplicated matcher contexts be
    /// shared across signature groups.
    pub fn add_with_id(
        &mut self,
        id: PatternId,
        bytes: &[u8],
        nocase: bool,
        sid: u32,
    ) -> Result<PatternId, MpmError> {
        if bytes.is_empty() {
            return Err(MpmError::EmptyPattern);
        }
        let ci: Vec<u8> = bytes.iter().map(|b| b.to_ascii_lowercase()).collect();
        if let Some(existing) = self
            .patterns
            .iter_mut()
            .find(|p| p.cs == bytes && p.nocase == nocase)
        {
            if !existing.sids.contains(&sid) {
                existing.sids.push(sid);
            }
            return Ok(existing.id);
        }
        self.patterns.push(Pattern {
            id,
            cs: bytes.to_vec(),
            ci,
            nocase,
            sids: vec![sid],
        });
        Ok(id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    /// Sorted pattern-id membership, used to de-duplicate identical
    /// matcher contexts across signature groups.
    pub fn id_signature(&self) -> Vec<PatternId> {
        let mut ids: Vec<PatternId> = self.patterns.iter().map(|p| p.id).collect();
        ids.sort_unstable();
        ids
    }

    pub fn into_patterns(self) -> Vec<Pattern> {
        self.patterns
    }
}

/// One match found during a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpmMatch {
    pub pattern: PatternId,
    pub offset: usize,
}

/// Per-thread match accumulator, reused across scans.
#[derive(Debug, Default)]
pub struct Pmq {
    pub matches: Vec<MpmMatch>,
    hit: Vec<bool>,
    matched: Vec<PatternId>,
}

impl Pmq {
    pub fn new() -> Self {
        Pmq::default()
    }

    /// Clears accumulated matches; call once per packet, not per buffer, so
    /// payload and stream-message scans pool their candidates.
    pub fn reset(&mut self) {
        self.matches.clear();
        for id in self.matched.drain(..) {
            if let Some(slot) = self.hit.get_mut(id as usize) {
                *slot = false;
            }
        }
    }

    /// Records a confirmed match. Duplicate (pattern, offset) pairs from
    /// re-scanned window positions are dropped.
    pub fn register(&mut self, pattern: PatternId, offset: usize) {
        if self
            .matches
            .iter()
            .any(|m| m.pattern == pattern && m.offset == offset)
        {
            return;
        }
        self.matches.push(MpmMatch { pattern, offset });
        let idx = pattern as usize;
        if idx >= self.hit.len() {
            self.hit.resize(idx + 1, false);
        }
        if !self.hit[idx] {
            self.hit[idx] = true;
            self.matched.push(pattern);
        }
    }

    /// Pattern ids with at least one match this scan.
    pub fn matched_patterns(&self) -> &[PatternId] {
        &self.matched
    }

    /// Whether a pattern id matched at least once this scan.
    #[inline]
    pub fn hit(&self, pattern: PatternId) -> bool {
        self.hit.get(pattern as usize).copied().unwrap_or(false)
    }

    /// Match offsets for one pattern, ascending.
    pub fn offsets_of(&self, pattern: PatternId) -> Vec<usize> {
        let mut offs: Vec<usize> = self
            .matches
            .iter()
            .filter(|m| m.pattern == pattern)
            .map(|m| m.offset)
            .collect();
        offs.sort_unstable();
        offs
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

/// The closed set of matcher implementations.
#[derive(Debug)]
pub enum Matcher {
    B2g(B2g),
}

impl Matcher {
    /// Builds the matcher named by `algo` (the config's `detect.mpm`).
    pub fn build(algo: &str, set: PatternSet) -> Result<Matcher, MpmError> {
        match algo {
            "b2g" => Ok(Matcher::B2g(B2g::new(set.into_patterns()))),
            other => Err(MpmError::UnknownMatcher(other.to_string())),
        }
    }

    /// Scans `buf`, appending matches to `pmq`. Returns the match count.
    #[inline]
    pub fn scan(&self, buf: &[u8], pmq: &mut Pmq) -> usize {
        match self {
            Matcher::B2g(b2g) => b2g.scan(buf, pmq),
        }
    }

    #[inline]
    pub fn pattern_cnt(&self) -> usize {
        match self {
            Matcher::B2g(b2g) => b2g.pattern_cnt(),
        }
    }
}
