//! Signature data model.
//!
//! A signature couples a tuple scope (protocol bitmap, address sets, port
//! sets) with an ordered list of match elements evaluated at confirmation
//! time. Internal ids are assigned at engine build and drive deterministic
//! alert ordering.

use crate::mpm::PatternId;
use crate::packet::PacketAction;

use std::collections::HashMap;
use std::net::IpAddr;

use regex::bytes::Regex;

pub type SigIntId = u32;

/// Action requested by a firing signature.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SigAction {
    Alert,
    Drop,
    Reject,
    Pass,
}

impl SigAction {
    pub fn packet_action(&self) -> PacketAction {
        match self {
            SigAction::Alert => PacketAction::Accept,
            SigAction::Drop => PacketAction::Drop,
            SigAction::Reject => PacketAction::Reject,
            SigAction::Pass => PacketAction::Accept,
        }
    }
}

/// 256-bit IP-protocol membership bitmap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtoBitmap([u64; 4]);

impl ProtoBitmap {
    pub fn none() -> Self {
        ProtoBitmap::default()
    }

    pub fn all() -> Self {
        ProtoBitmap([u64::MAX; 4])
    }

    pub fn single(proto: u8) -> Self {
        let mut bm = ProtoBitmap::default();
        bm.set(proto);
        bm
    }

    #[inline]
    pub fn set(&mut self, proto: u8) {
        self.0[(proto >> 6) as usize] |= 1u64 << (proto & 63);
    }

    #[inline]
    pub fn test(&self, proto: u8) -> bool {
        self.0[(proto >> 6) as usize] & (1u64 << (proto & 63)) != 0
    }

    /// Protocol numbers with the bit set.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0u16..256).filter(|p| self.test(*p as u8)).map(|p| p as u8)
    }
}

/// An address range in one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrRange {
    V4(u32, u32),
    V6(u128, u128),
}

/// Source or destination address constraint.
#[derive(Debug, Clone, Default)]
pub struct AddressSpec {
    pub any: bool,
    pub negate: bool,
    pub ranges: Vec<AddrRange>,
}

impl AddressSpec {
    pub fn any() -> Self {
        AddressSpec {
            any: true,
            ..Default::default()
        }
    }

    /// Concrete IPv4 coverage: the matched (start, end) ranges, inclusive.
    pub fn v4_ranges(&self) -> Vec<(u32, u32)> {
        if self.any {
            return vec![(0, u32::MAX)];
        }
        let mut ranges: Vec<(u32, u32)> = self
            .ranges
            .iter()
            .filter_map(|r| match r {
                AddrRange::V4(s, e) => Some((*s, *e)),
                AddrRange::V6(..) => None,
            })
            .collect();
        ranges.sort_unstable();
        if !self.negate {
            return ranges;
        }
        complement(ranges, u32::MAX)
    }

    /// Concrete IPv6 coverage.
    pub fn v6_ranges(&self) -> Vec<(u128, u128)> {
        if self.any {
            return vec![(0, u128::MAX)];
        }
        let mut ranges: Vec<(u128, u128)> = self
            .ranges
            .iter()
            .filter_map(|r| match r {
                AddrRange::V6(s, e) => Some((*s, *e)),
                AddrRange::V4(..) => None,
            })
            .collect();
        ranges.sort_unstable();
        if !self.negate {
            return ranges;
        }
        complement(ranges, u128::MAX)
    }

    pub fn matches(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(a) => {
                let v = u32::from(a);
                self.v4_ranges().iter().any(|(s, e)| *s <= v && v <= *e)
            }
            IpAddr::V6(a) => {
                let v = u128::from(a);
                self.v6_ranges().iter().any(|(s, e)| *s <= v && v <= *e)
            }
        }
    }
}

/// Complement of a sorted range list over `[0, max]`.
fn complement<T>(ranges: Vec<(T, T)>, max: T) -> Vec<(T, T)>
where
    T: Copy + Ord + num_ops::StepOps,
{
    // Merge overlapping/adjacent ranges first.
    let mut merged: Vec<(T, T)> = Vec::new();
    for (s, e) in ranges {
        match merged.last_mut() {
            Some(last) if s <= last.1.succ() => {
                if e > last.1 {
                    last.1 = e;
                }
            }
            _ => merged.push((s, e)),
        }
    }

    let mut out = Vec::new();
    let mut cursor = T::zero();
    for (s, e) in merged {
        if cursor < s {
            out.push((cursor, s.pred()));
        }
        if e == max {
            return out;
        }
        cursor = e.succ();
    }
    out.push((cursor, max));
    out
}

/// Minimal integer stepping used by the range arithmetic.
pub(crate) mod num_ops {
    pub trait StepOps: Sized {
        fn zero() -> Self;
        fn succ(self) -> Self;
        fn pred(self) -> Self;
    }

    macro_rules! impl_step {
        ($t:ty) => {
            impl StepOps for $t {
                fn zero() -> Self {
                    0
                }
                fn succ(self) -> Self {
                    self.saturating_add(1)
                }
                fn pred(self) -> Self {
                    self.saturating_sub(1)
                }
            }
        };
    }

    impl_step!(u16);
    impl_step!(u32);
    impl_step!(u128);
}

/// Source or destination port constraint.
#[derive(Debug, Clone, Default)]
pub struct PortSpec {
    pub any: bool,
    pub negate: bool,
    pub ranges: Vec<(u16, u16)>,
}

impl PortSpec {
    pub fn any() -> Self {
        PortSpec {
            any: true,
            ..Default::default()
        }
    }

    pub fn single(port: u16) -> Self {
        PortSpec {
            any: false,
            negate: false,
            ranges: vec![(port, port)],
        }
    }

    /// Concrete coverage as inclusive ranges.
    pub fn resolved(&self) -> Vec<(u16, u16)> {
        if self.any {
            return vec![(0, u16::MAX)];
        }
        let mut ranges = self.ranges.clone();
        ranges.sort_unstable();
        if !self.negate {
            return ranges;
        }
        complement(ranges, u16::MAX)
    }

    pub fn matches(&self, port: u16) -> bool {
        self.resolved().iter().any(|(s, e)| *s <= port && port <= *e)
    }
}

/// Buffer a content pattern inspects.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BufferKind {
    Payload,
    HttpUri,
    HttpRawHeader,
}

/// One content pattern with its placement constraints.
#[derive(Debug, Clone)]
pub struct ContentMatch {
    pub pattern: Vec<u8>,
    pub nocase: bool,
    pub offset: Option<usize>,
    pub depth: Option<usize>,
    /// Minimum gap to the previous pattern's end. Presence makes the
    /// element relative.
    pub distance: Option<i64>,
    /// Maximum start slack past the previous pattern's end + distance.
    pub within: Option<usize>,
    pub buffer: BufferKind,
    /// Engine-global pattern id, assigned at build.
    pub pattern_id: PatternId,
}

impl ContentMatch {
    pub fn new(pattern: Vec<u8>) -> Self {
        ContentMatch {
            pattern,
            nocase: false,
            offset: None,
            depth: None,
            distance: None,
            within: None,
            buffer: BufferKind::Payload,
            pattern_id: 0,
        }
    }

    #[inline]
    pub fn is_relative(&self) -> bool {
        self.distance.is_some() || self.within.is_some()
    }
}

/// Comparison operator for `ip_proto`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Lt,
}

#[derive(Debug, Clone)]
pub struct IpProtoMatch {
    pub op: CmpOp,
    pub proto: u8,
}

impl IpProtoMatch {
    pub fn matches(&self, proto: u8) -> bool {
        match self.op {
            CmpOp::Eq => proto == self.proto,
            CmpOp::Ne => proto != self.proto,
            CmpOp::Gt => proto > self.proto,
            CmpOp::Lt => proto < self.proto,
        }
    }
}

/// Flow-state predicate.
#[derive(Debug, Clone, Default)]
pub struct FlowMatch {
    pub established: bool,
    pub stateless: bool,
    pub to_server: bool,
    pub to_client: bool,
    /// Match only on reassembled stream data.
    pub only_stream: bool,
    /// Match only on raw packet payload.
    pub no_stream: bool,
}

/// Compiled pcre-class predicate.
#[derive(Debug, Clone)]
pub struct PcreMatch {
    pub re: Regex,
    pub raw: String,
    /// `R`: anchor after the previous content match.
    pub relative: bool,
    /// `U`: evaluate against the normalized uri buffer.
    pub uri: bool,
}

/// Ordered match element of a signature.
#[derive(Debug, Clone)]
pub enum MatchElem {
    Content(ContentMatch),
    Pcre(PcreMatch),
    Flow(FlowMatch),
    IpProto(IpProtoMatch),
    TlsVersion(u16),
}

/// A parsed rule, before and after engine build.
#[derive(Debug, Clone)]
pub struct Signature {
    /// Internal index; assigned at engine build, drives alert ordering.
    pub idx: SigIntId,
    pub action: SigAction,
    pub sid: u32,
    pub gid: u32,
    pub rev: u32,
    pub msg: String,
    pub classtype: Option<String>,
    pub class_id: u32,
    pub prio: u32,
    pub proto: ProtoBitmap,
    pub src: AddressSpec,
    pub sp: PortSpec,
    pub dst: AddressSpec,
    pub dp: PortSpec,
    pub matches: Vec<MatchElem>,
    /// Index into `matches` of the content pattern used in the scan pass.
    pub scan_content: Option<usize>,
}

impl Signature {
    /// Picks the scan pattern: the longest payload-buffer content. Http
    /// buffers are assembled by the app-layer state and can straddle stream
    /// messages, so their patterns cannot gate the first pass; signatures
    /// with only http contents stay unconditional candidates.
    pub fn pick_scan_content(&mut self) {
        let mut best: Option<(usize, usize)> = None; // (idx, len)
        for (i, elem) in self.matches.iter().enumerate() {
            if let MatchElem::Content(c) = elem {
                if c.buffer != BufferKind::Payload {
                    continue;
                }
                if best.map_or(true, |(_, blen)| c.pattern.len() > blen) {
                    best = Some((i, c.pattern.len()));
                }
            }
        }
        self.scan_content = best.map(|(i, _)| i);
    }

    pub fn scan_pattern(&self) -> Option<&ContentMatch> {
        match self.scan_content.map(|i| &self.matches[i]) {
            Some(MatchElem::Content(c)) => Some(c),
            _ => None,
        }
    }
}

/// Fixed-width bitset over internal signature ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SigBitset {
    words: Vec<u64>,
}

impl SigBitset {
    pub fn new(nbits: usize) -> Self {
        SigBitset {
            words: vec![0; nbits.div_ceil(64).max(1)],
        }
    }

    #[inline]
    pub fn set(&mut self, idx: SigIntId) {
        let i = idx as usize;
        self.words[i / 64] |= 1u64 << (i % 64);
    }

    #[inline]
    pub fn test(&self, idx: SigIntId) -> bool {
        let i = idx as usize;
        self.words
            .get(i / 64)
            .is_some_and(|w| w & (1u64 << (i % 64)) != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Set members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = SigIntId> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, w)| {
            (0..64)
                .filter(move |b| w & (1u64 << b) != 0)
                .map(move |b| (wi * 64 + b) as SigIntId)
        })
    }
}

/// Classification registry: name to (id, default priority).
#[derive(Debug)]
pub struct ClassRegistry {
    map: HashMap<String, (u32, u32)>,
    next_id: u32,
}

impl Default for ClassRegistry {
    fn default() -> Self {
        let mut reg = ClassRegistry {
            map: HashMap::new(),
            next_id: 1,
        };
        // A few well-known classifications with conventional priorities.
        for (name, prio) in [
            ("not-suspicious", 3),
            ("misc-activity", 3),
            ("attempted-recon", 2),
            ("attempted-dos", 2),
            ("policy-violation", 1),
            ("trojan-activity", 1),
            ("web-application-attack", 1),
            ("attempted-admin", 1),
        ] {
            reg.intern(name, prio);
        }
        reg
    }
}

impl ClassRegistry {
    pub fn new() -> Self {
        ClassRegistry::default()
    }

    fn intern(&mut self, name: &str, prio: u32) -> (u32, u32) {
        if let Some(v) = self.map.get(name) {
            return *v;
        }
        let v = (self.next_id, prio);
        self.next_id += 1;
        self.map.insert(name.to_string(), v);
        v
    }

    /// Resolves a classtype name, registering unknown names with default
    /// priority 3.
    pub fn resolve(&mut self, name: &str) -> (u32, u32) {
        if let Some(v) = self.map.get(name) {
            return *v;
        }
        self.intern(name, 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn proto_bitmap_set_and_iter() {
        let mut bm = ProtoBitmap::none();
        bm.set(6);
        bm.set(17);
        bm.set(255);
        assert!(bm.test(6));
        assert!(!bm.test(7));
        assert_eq!(bm.iter().collect::<Vec<_>>(), vec![6, 17, 255]);
    }

    #[test]
    fn address_negation_complements() {
        let spec = AddressSpec {
            any: false,
            negate: true,
            ranges: vec![AddrRange::V4(
                u32::from(Ipv4Addr::new(10, 0, 0, 0)),
                u32::from(Ipv4Addr::new(10, 255, 255, 255)),
            )],
        };
        let ranges = spec.v4_ranges();
        assert_eq!(ranges.len(), 2);
        assert!(spec.matches(IpAddr::V4(Ipv4Addr::new(9, 255, 255, 255))));
        assert!(!spec.matches(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))));
        assert!(spec.matches(IpAddr::V4(Ipv4Addr::new(11, 0, 0, 0))));
    }

    #[test]
    fn port_negation_and_ranges() {
        let spec = PortSpec {
            any: false,
            negate: false,
            ranges: vec![(80, 80), (8000, 8080)],
        };
        assert!(spec.matches(80));
        assert!(spec.matches(8040));
        assert!(!spec.matches(443));

        let neg = PortSpec {
            negate: true,
            ..spec
        };
        assert!(!neg.matches(80));
        assert!(neg.matches(443));
        assert!(!neg.matches(8080));
        assert!(neg.matches(8081));
    }

    #[test]
    fn bitset_iterates_ascending() {
        let mut bs = SigBitset::new(130);
        bs.set(5);
        bs.set(64);
        bs.set(129);
        assert_eq!(bs.iter().collect::<Vec<_>>(), vec![5, 64, 129]);
        assert!(bs.test(64));
        assert!(!bs.test(63));
    }

    #[test]
    fn class_registry_interns_unknown_names() {
        let mut reg = ClassRegistry::new();
        let (id1, prio1) = reg.resolve("trojan-activity");
        assert_eq!(prio1, 1);
        let (id2, prio2) = reg.resolve("totally-custom");
        assert_eq!(prio2, 3);
        assert_ne!(id1, id2);
        assert_eq!(reg.resolve("totally-custom").0, id2);
    }

    #[test]
    fn scan_content_prefers_longest_payload() {
        let mut sig = Signature {
            idx: 0,
            action: SigAction::Alert,
            sid: 1,
            gid: 1,
            rev: 0,
            msg: String::new(),
            classtype: None,
            class_id: 0,
            prio: 3,
            proto: ProtoBitmap::single(6),
            src: AddressSpec::any(),
            sp: PortSpec::any(),
            dst: AddressSpec::any(),
            dp: PortSpec::any(),
            matches: vec![
                MatchElem::Content(ContentMatch {
                    buffer: BufferKind::HttpUri,
                    ..ContentMatch::new(b"averylonguripattern".to_vec())
                }),
                MatchElem::Content(ContentMatch::new(b"short".to_vec())),
                MatchElem::Content(ContentMatch::new(b"longerpayload".to_vec())),
            ],
            scan_content: None,
        };
        sig.pick_scan_content();
        assert_eq!(sig.scan_content, Some(2));
    }
}
