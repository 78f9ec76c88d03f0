//! Signature groups.
//!
//! A [`SigGroupHead`] is the set of signatures applying to one cell of the
//! detection lookup tree, together with its compiled scan and search
//! matcher contexts. Cells across the tree frequently end up with identical
//! memberships, so groups are de-duplicated by signature bitmap and matcher
//! contexts by pattern-id membership; shared instances are reference
//! counted rather than copy-flagged.

use crate::detect::signature::{BufferKind, MatchElem, SigBitset, SigIntId, Signature};
use crate::mpm::{Matcher, MpmError, PatternId, PatternSet};

use std::collections::HashMap;
use std::sync::Arc;

/// The signatures and matcher contexts of one lookup cell.
#[derive(Debug)]
pub struct SigGroupHead {
    pub sigs: SigBitset,
    /// Member internal ids, ascending; drives alert ordering.
    pub match_array: Vec<SigIntId>,
    /// First-pass matcher over each signature's scan pattern.
    pub scan_mpm: Option<Arc<Matcher>>,
    /// Matcher over the remaining payload patterns, used to prune
    /// candidates before per-signature confirmation.
    pub search_mpm: Option<Arc<Matcher>>,
    /// Sorted scan pattern ids (the de-duplication key material).
    pub scan_content_ids: Vec<PatternId>,
    pub search_content_ids: Vec<PatternId>,
}

/// Builds and de-duplicates signature groups.
pub struct SghBuilder {
    algo: String,
    groups: HashMap<SigBitset, Arc<SigGroupHead>>,
    scan_ctxs: HashMap<Vec<PatternId>, Arc<Matcher>>,
    search_ctxs: HashMap<Vec<PatternId>, Arc<Matcher>>,
    nsigs: usize,
}

impl SghBuilder {
    pub fn new(algo: &str, nsigs: usize) -> Self {
        SghBuilder {
            algo: algo.to_string(),
            groups: HashMap::new(),
            scan_ctxs: HashMap::new(),
            search_ctxs: HashMap::new(),
            nsigs,
        }
    }

    /// Number of distinct groups built so far.
    pub fn unique_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn unique_scan_ctxs(&self) -> usize {
        self.scan_ctxs.len()
    }

    /// Returns the group for `member_ids`, building it on first sight.
    pub fn build(
        &mut self,
        member_ids: &[SigIntId],
        sigs: &[Signature],
    ) -> Result<Arc<SigGroupHead>, MpmError> {
        let mut bitset = SigBitset::new(self.nsigs);
        for &id in member_ids {
            bitset.set(id);
        }
        if let Some(existing) = self.groups.get(&bitset) {
            return Ok(Arc::clone(existing));
        }

        let match_array: Vec<SigIntId> = bitset.iter().collect();

        // Scan context: one pattern per signature, its chosen scan content.
        let mut scan_set = PatternSet::new();
        for &id in &match_array {
            let sig = &sigs[id as usize];
            if let Some(c) = sig.scan_pattern() {
                scan_set.add_with_id(c.pattern_id, &c.pattern, c.nocase, sig.sid)?;
            }
        }

        // Search context: the remaining payload-buffer patterns.
        let mut search_set = PatternSet::new();
        for &id in &match_array {
            let sig = &sigs[id as usize];
            for (i, elem) in sig.matches.iter().enumerate() {
                if Some(i) == sig.scan_content {
                    continue;
                }
                if let MatchElem::Content(c) = elem {
                    if c.buffer == BufferKind::Payload {
                        search_set.add_with_id(c.pattern_id, &c.pattern, c.nocase, sig.sid)?;
                    }
                }
            }
        }

        let scan_content_ids = scan_set.id_signature();
        let search_content_ids = search_set.id_signature();
        let scan_mpm = self.intern_ctx(true, scan_set)?;
        let search_mpm = self.intern_ctx(false, search_set)?;

        let sgh = Arc::new(SigGroupHead {
            sigs: bitset.clone(),
            match_array,
            scan_mpm,
            search_mpm,
            scan_content_ids,
            search_content_ids,
        });
        self.groups.insert(bitset, Arc::clone(&sgh));
        Ok(sgh)
    }

    fn intern_ctx(
        &mut self,
        scan: bool,
        set: PatternSet,
    ) -> Result<Option<Arc<Matcher>>, MpmError> {
        if set.is_empty() {
            return Ok(None);
        }
        let key = set.id_signature();
        let cache = if scan {
            &mut self.scan_ctxs
        } else {
            &mut self.search_ctxs
        };
        if let Some(ctx) = cache.get(&key) {
            return Ok(Some(Arc::clone(ctx)));
        }
        let ctx = Arc::new(Matcher::build(&self.algo, set)?);
        let cache = if scan {
            &mut self.scan_ctxs
        } else {
            &mut self.search_ctxs
        };
        cache.insert(key, Arc::clone(&ctx));
        Ok(Some(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::parse::parse_rule;
    use crate::detect::signature::Signature;

    fn sigs_from(rules: &[&str]) -> Vec<Signature> {
        let mut sigs: Vec<Signature> = rules
            .iter()
            .map(|r| parse_rule(r).unwrap())
            .collect();
        let mut next_pid = 0u32;
        for (idx, sig) in sigs.iter_mut().enumerate() {
            sig.idx = idx as SigIntId;
            for elem in sig.matches.iter_mut() {
                if let MatchElem::Content(c) = elem {
                    c.pattern_id = next_pid;
                    next_pid += 1;
                }
            }
            sig.pick_scan_content();
        }
        sigs
    }

    #[test]
    fn identical_member_sets_share_one_group() {
        let sigs = sigs_from(&[
            r#"alert tcp any any -> any 80 (content:"abc"; sid:1;)"#,
            r#"alert tcp any any -> any 80 (content:"def"; sid:2;)"#,
        ]);
        let mut builder = SghBuilder::new("b2g", sigs.len());
        let a = builder.build(&[0, 1], &sigs).unwrap();
        let b = builder.build(&[1, 0], &sigs).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(builder.unique_groups(), 1);
        assert_eq!(a.match_array, vec![0, 1]);
    }

    #[test]
    fn same_patterns_share_matcher_context() {
        // Different signature sets with byte-identical patterns: distinct
        // groups, one shared scan context.
        let sigs = sigs_from(&[
            r#"alert tcp any any -> any 80 (content:"abc"; sid:1;)"#,
            r#"alert tcp any any -> any 81 (content:"abc"; sid:2;)"#,
        ]);
        // Force a shared pattern id, as the engine's global registry would.
        let mut sigs = sigs;
        for sig in sigs.iter_mut() {
            for elem in sig.matches.iter_mut() {
                if let MatchElem::Content(c) = elem {
                    c.pattern_id = 7;
                }
            }
        }
        let mut builder = SghBuilder::new("b2g", sigs.len());
        let a = builder.build(&[0], &sigs).unwrap();
        let b = builder.build(&[1], &sigs).unwrap();
        assert_eq!(builder.unique_groups(), 2);
        assert_eq!(builder.unique_scan_ctxs(), 1);
        let (Some(ma), Some(mb)) = (&a.scan_mpm, &b.scan_mpm) else {
            panic!("scan contexts missing");
        };
        assert!(Arc::ptr_eq(ma, mb));
    }

    #[test]
    fn group_without_content_has_no_mpm() {
        let sigs = sigs_from(&[r#"alert tcp any any -> any 80 (flow:established; sid:1;)"#]);
        let mut builder = SghBuilder::new("b2g", 1);
        let sgh = builder.build(&[0], &sigs).unwrap();
        assert!(sgh.scan_mpm.is_none());
        assert!(sgh.search_mpm.is_none());
    }
}
