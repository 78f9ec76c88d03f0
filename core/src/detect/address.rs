//! Address and port range trees.
//!
//! The detection lookup is a chain of non-overlapping range maps: proto,
//! then source address, destination address, source port, destination port.
//! Construction uses range arithmetic: overlapping input ranges are cut at
//! every boundary so that leaf ranges never overlap, and each leaf carries
//! the union of the signature sets of all inputs covering it. IPv6 runs the
//! same algorithm with 128-bit endpoints.

use crate::detect::signature::num_ops::StepOps;
use crate::detect::signature::SigIntId;

/// A sorted, non-overlapping range map from inclusive `[start, end]` keys
/// to a payload.
#[derive(Debug)]
pub struct RangeMap<K, V> {
    entries: Vec<(K, K, V)>,
}

impl<K: Copy + Ord, V> RangeMap<K, V> {
    pub fn new(entries: Vec<(K, K, V)>) -> Self {
        debug_assert!(entries.windows(2).all(|w| w[0].1 < w[1].0));
        RangeMap { entries }
    }

    pub fn empty() -> Self {
        RangeMap {
            entries: Vec::new(),
        }
    }

    /// Binary search for the leaf covering `key`.
    pub fn lookup(&self, key: K) -> Option<&V> {
        let mut lo = 0usize;
        let mut hi = self.entries.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let (start, end, ref v) = self.entries[mid];
            if key < start {
                hi = mid;
            } else if key > end {
                lo = mid + 1;
            } else {
                return Some(v);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(K, K, V)> {
        self.entries.iter()
    }
}

/// Cuts overlapping input ranges into non-overlapping leaves.
///
/// Input: `(start, end, sig)` triples, any order, overlaps allowed.
/// Output: sorted leaves, each with the ascending list of signatures whose
/// input range covers it.
pub fn cut_ranges<K>(inputs: &[(K, K, SigIntId)]) -> Vec<(K, K, Vec<SigIntId>)>
where
    K: Copy + Ord + StepOps,
{
    if inputs.is_empty() {
        return Vec::new();
    }

    // Boundary points: every range start, and every position just past an
    // end. Leaves span between consecutive boundaries.
    let mut points: Vec<K> = Vec::with_capacity(inputs.len() * 2);
    for (s, e, _) in inputs {
        points.push(*s);
        if *e < e.succ() {
            points.push(e.succ());
        }
    }
    points.sort_unstable();
    points.dedup();

    let max_end = inputs.iter().map(|(_, e, _)| *e).max().unwrap();
    let mut leaves = Vec::new();
    for (i, start) in points.iter().enumerate() {
        let end = match points.get(i + 1) {
            Some(next) => next.pred(),
            None => max_end,
        };
        if end < *start {
            continue;
        }
        let mut sigs: Vec<SigIntId> = inputs
            .iter()
            .filter(|(s, e, _)| *s <= *start && *start <= *e)
            .map(|(_, _, sig)| *sig)
            .collect();
        if sigs.is_empty() {
            continue;
        }
        sigs.sort_unstable();
        sigs.dedup();
        leaves.push((*start, end, sigs));
    }
    leaves
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjoint_ranges_stay_intact() {
        let leaves = cut_ranges(&[(0u32, 9, 1), (20, 29, 2)]);
        assert_eq!(leaves, vec![(0, 9, vec![1]), (20, 29, vec![2])]);
    }

    #[test]
    fn overlap_splits_into_three_leaves() {
        let leaves = cut_ranges(&[(0u32, 20, 1), (10, 30, 2)]);
        assert_eq!(
            leaves,
            vec![(0, 9, vec![1]), (10, 20, vec![1, 2]), (21, 30, vec![2])]
        );
    }

    #[test]
    fn contained_range_splits_outer() {
        let leaves = cut_ranges(&[(0u32, 100, 1), (40, 60, 2)]);
        assert_eq!(
            leaves,
            vec![
                (0, 39, vec![1]),
                (40, 60, vec![1, 2]),
                (61, 100, vec![1]),
            ]
        );
    }

    #[test]
    fn identical_ranges_merge_signature_sets() {
        let leaves = cut_ranges(&[(5u32, 10, 3), (5, 10, 1)]);
        assert_eq!(leaves, vec![(5, 10, vec![1, 3])]);
    }

    #[test]
    fn full_space_range_reaches_max() {
        let leaves = cut_ranges(&[(0u32, u32::MAX, 1), (10, 20, 2)]);
        assert_eq!(
            leaves,
            vec![
                (0, 9, vec![1]),
                (10, 20, vec![1, 2]),
                (21, u32::MAX, vec![1]),
            ]
        );
    }

    #[test]
    fn v6_width_endpoints() {
        let leaves = cut_ranges(&[(0u128, u128::MAX, 7)]);
        assert_eq!(leaves, vec![(0, u128::MAX, vec![7])]);
    }

    #[test]
    fn range_map_lookup() {
        let map = RangeMap::new(vec![(0u16, 9, "low"), (10, 19, "mid"), (30, 40, "high")]);
        assert_eq!(map.lookup(0), Some(&"low"));
        assert_eq!(map.lookup(15), Some(&"mid"));
        assert_eq!(map.lookup(25), None);
        assert_eq!(map.lookup(40), Some(&"high"));
        assert_eq!(map.lookup(41), None);
    }
}
