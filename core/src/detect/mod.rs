//! Detection engine.
//!
//! Offline, at engine init: rules are parsed, every content pattern gets an
//! engine-global id, and signatures are bucketed by protocol, then source
//! and destination address ranges, then port ranges, into a multi-level
//! lookup ending in de-duplicated [`SigGroupHead`]s with compiled matcher
//! contexts. The result is read-only at runtime.
//!
//! Online, per packet: resolve the group for the packet's tuple, run the
//! scan matcher over the payload and reassembled stream messages, then
//! confirm each surviving candidate's match list in ascending internal id
//! order so alert output is deterministic.

pub mod address;
pub mod parse;
pub mod siggroup;
pub mod signature;

pub use signature::{SigAction, Signature};

use crate::applayer::http::HttpRequest;
use crate::applayer::update_flow;
use crate::config::DetectConfig;
use crate::detect::address::{cut_ranges, RangeMap};
use crate::detect::siggroup::SigGroupHead;
use crate::detect::signature::{
    BufferKind, ClassRegistry, ContentMatch, MatchElem, SigIntId,
};
use crate::mpm::{PatternId, Pmq};
use crate::packet::{Alert, Packet, PacketFlags};
use crate::stream::STREAM_GAP;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{bail, Result};

type DpMap = RangeMap<u16, Arc<SigGroupHead>>;
type SpMap = RangeMap<u16, DpMap>;
type DstMap<K> = RangeMap<K, SpMap>;
type SrcMap<K> = RangeMap<K, DstMap<K>>;

/// Per-protocol lookup trees, one per address family.
struct ProtoGroup {
    v4: SrcMap<u32>,
    v6: SrcMap<u128>,
}

/// Per-thread scratch state for detection.
#[derive(Debug, Default)]
pub struct DetectThreadCtx {
    pmq: Pmq,
    pmq_search: Pmq,
}

impl DetectThreadCtx {
    pub fn new() -> Self {
        DetectThreadCtx::default()
    }
}

/// The compiled detection engine. Read-only after build.
pub struct DetectEngine {
    sigs: Vec<Signature>,
    groups: HashMap<u8, ProtoGroup>,
    /// Fallback trees for protocols without a dedicated group (rules with
    /// an `ip` scope match there).
    other: Option<ProtoGroup>,
}

impl DetectEngine {
    /// Parses rules and builds the full engine.
    pub fn from_rules(rules: &str, cfg: &DetectConfig) -> Result<DetectEngine> {
        let (mut sigs, errors) = parse::parse_rules(rules);
        for (line, err) in &errors {
            log::error!("rule parse failure on line {}: {}", line, err);
        }
        if !errors.is_empty() && cfg.init_errors_fatal {
            bail!("{} rule(s) failed to parse", errors.len());
        }
        log::info!("loaded {} signatures ({} failed)", sigs.len(), errors.len());
        Self::build(&mut sigs, cfg)
    }

    fn build(sigs: &mut Vec<Signature>, cfg: &DetectConfig) -> Result<DetectEngine> {
        let mut classes = ClassRegistry::new();
        let mut pattern_ids: HashMap<(Vec<u8>, bool), PatternId> = HashMap::new();
        let mut next_pid: PatternId = 0;

        for (idx, sig) in sigs.iter_mut().enumerate() {
            sig.idx = idx as SigIntId;
            if let Some(name) = sig.classtype.clone() {
                let (class_id, class_prio) = classes.resolve(&name);
                sig.class_id = class_id;
                if sig.prio == 3 {
                    sig.prio = class_prio;
                }
            }
            for elem in sig.matches.iter_mut() {
                if let MatchElem::Content(c) = elem {
                    let key = (c.pattern.clone(), c.nocase);
                    let pid = *pattern_ids.entry(key).or_insert_with(|| {
                        let pid = next_pid;
                        next_pid += 1;
                        pid
                    });
                    c.pattern_id = pid;
                }
            }
            sig.pick_scan_content();
        }

        let mut builder = siggroup::SghBuilder::new(&cfg.mpm, sigs.len());

        // Dedicated groups for every explicitly used protocol (the common
        // transports always get one), plus a fallback for the rest.
        let mut protos: Vec<u8> = vec![
            crate::protocols::packet::ipv4::PROTO_TCP,
            crate::protocols::packet::ipv4::PROTO_UDP,
            crate::protocols::packet::ipv4::PROTO_ICMP,
        ];
        for sig in sigs.iter() {
            let members: Vec<u8> = sig.proto.iter().take(8).collect();
            if members.len() <= 4 {
                protos.extend(members);
            }
        }
        protos.sort_unstable();
        protos.dedup();

        let mut groups = HashMap::new();
        for proto in protos {
            let ids: Vec<SigIntId> = sigs
                .iter()
                .filter(|s| s.proto.test(proto))
                .map(|s| s.idx)
                .collect();
            if ids.is_empty() {
                continue;
            }
            groups.insert(proto, build_proto_group(&ids, sigs, &mut builder)?);
        }

        // Wildcard-protocol rules cover everything else.
        let wild: Vec<SigIntId> = sigs
            .iter()
            .filter(|s| s.proto.iter().count() > 8)
            .map(|s| s.idx)
            .collect();
        let other = if wild.is_empty() {
            None
        } else {
            Some(build_proto_group(&wild, sigs, &mut builder)?)
        };

        log::info!(
            "detection tree built: {} groups, {} scan contexts",
            builder.unique_groups(),
            builder.unique_scan_ctxs()
        );
        Ok(DetectEngine {
            sigs: std::mem::take(sigs),
            groups,
            other,
        })
    }

    pub fn sig_count(&self) -> usize {
        self.sigs.len()
    }

    /// Resolves the signature group for a decoded packet's tuple.
    fn resolve(&self, pkt: &Packet) -> Option<&Arc<SigGroupHead>> {
        let l3 = pkt.l3.as_ref()?;
        let group = self.groups.get(&l3.proto).or(self.other.as_ref())?;
        let (sp, dp) = (pkt.src_port(), pkt.dst_port());
        match (l3.src, l3.dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => group
                .v4
                .lookup(u32::from(s))?
                .lookup(u32::from(d))?
                .lookup(sp)?
                .lookup(dp),
            (IpAddr::V6(s), IpAddr::V6(d)) => group
                .v6
                .lookup(u128::from(s))?
                .lookup(u128::from(d))?
                .lookup(sp)?
                .lookup(dp),
            _ => None,
        }
    }

    /// Runs detection on one packet, appending fired alerts in ascending
    /// internal signature order. Returns the number of alerts.
    pub fn match_packet(&self, pkt: &mut Packet, ctx: &mut DetectThreadCtx) -> usize {
        let Some(sgh) = self.resolve(pkt) else {
            return 0;
        };

        // Advance app-layer state and snapshot what predicates read.
        let (http_req, tls_version) = match &pkt.flow {
            Some(flow) => {
                let mut state = flow.state.lock().unwrap();
                for msg in &pkt.stream_msgs {
                    update_flow(&mut state, msg);
                }
                (
                    state.http.as_ref().and_then(|h| h.last_request().cloned()),
                    state.tls.as_ref().and_then(|t| t.effective_version()),
                )
            }
            None => (None, None),
        };

        // Gather inspectable buffers with their stream provenance.
        let mut bufs: Vec<(&[u8], bool)> = Vec::new();
        if !pkt.flags.contains(PacketFlags::StreamOnly) && !pkt.payload().is_empty() {
            bufs.push((pkt.payload(), false));
        }
        if !pkt.flags.contains(PacketFlags::NoStream) {
            for msg in &pkt.stream_msgs {
                if msg.dir() == pkt.direction && msg.flags & STREAM_GAP == 0 && !msg.data.is_empty()
                {
                    bufs.push((&msg.data, true));
                }
            }
        }

        ctx.pmq.reset();
        ctx.pmq_search.reset();
        if let Some(scan) = &sgh.scan_mpm {
            for (buf, _) in &bufs {
                scan.scan(buf, &mut ctx.pmq);
            }
        }
        if let Some(search) = &sgh.search_mpm {
            for (buf, _) in &bufs {
                search.scan(buf, &mut ctx.pmq_search);
            }
        }

        let mut fired: Vec<Alert> = Vec::new();
        for &sid in &sgh.match_array {
            let sig = &self.sigs[sid as usize];

            // First-pass gate: the scan pattern must have matched.
            if let Some(c) = sig.scan_pattern() {
                if !ctx.pmq.hit(c.pattern_id) {
                    continue;
                }
            }
            // Second gate: every other payload pattern must appear in at
            // least one inspected buffer.
            if !self.search_gate(sig, &ctx.pmq_search) {
                continue;
            }

            if let Some(offset) =
                self.eval_sig(sig, &bufs, http_req.as_ref(), tls_version, pkt)
            {
                if sig.action == SigAction::Pass {
                    // A pass rule exempts the packet from the rest of the set.
                    break;
                }
                fired.push(Alert {
                    gid: sig.gid,
                    sid: sig.sid,
                    rev: sig.rev,
                    class: sig.class_id,
                    prio: sig.prio,
                    msg: sig.msg.clone(),
                    match_offset: offset,
                    action: sig.action.packet_action(),
                });
            }
        }
        let n = fired.len();
        for alert in fired {
            pkt.action |= alert.action;
            pkt.alerts.push(alert);
        }
        n
    }

    /// Checks that each non-scan payload content of `sig` matched somewhere
    /// during the search pass. A pattern absent from every buffer cannot be
    /// confirmed, so the signature is pruned early.
    fn search_gate(&self, sig: &Signature, pmq_search: &Pmq) -> bool {
        for (i, elem) in sig.matches.iter().enumerate() {
            if Some(i) == sig.scan_content {
                continue;
            }
            if let MatchElem::Content(c) = elem {
                if c.buffer == BufferKind::Payload && !pmq_search.hit(c.pattern_id) {
                    return false;
                }
            }
        }
        true
    }

    /// Confirms a candidate signature against the inspectable buffers.
    /// Returns the first payload match offset on success.
    fn eval_sig(
        &self,
        sig: &Signature,
        bufs: &[(&[u8], bool)],
        http: Option<&HttpRequest>,
        tls: Option<u16>,
        pkt: &Packet,
    ) -> Option<usize> {
        // Stream scoping requested by the signature itself.
        let (mut only_stream, mut no_stream) = (false, false);
        for elem in &sig.matches {
            if let MatchElem::Flow(f) = elem {
                only_stream |= f.only_stream;
                no_stream |= f.no_stream;
            }
        }

        let needs_payload = sig.matches.iter().any(|m| match m {
            MatchElem::Content(c) => c.buffer == BufferKind::Payload,
            MatchElem::Pcre(p) => !p.uri,
            _ => false,
        });

        let empty: &[u8] = &[];
        let candidates: Vec<&[u8]> = if needs_payload {
            bufs.iter()
                .filter(|(_, is_stream)| {
                    (!only_stream || *is_stream) && (!no_stream || !*is_stream)
                })
                .map(|(b, _)| *b)
                .collect()
        } else {
            vec![empty]
        };

        for buf in candidates {
            if let Some(state) =
                self.eval_elems(&sig.matches, buf, http, tls, pkt, EvalPos::default())
            {
                return Some(state.first_off.unwrap_or(0));
            }
        }
        None
    }

    /// Recursive match-list evaluation with backtracking over content
    /// occurrences; a failed within/distance chain fails atomically.
    fn eval_elems(
        &self,
        elems: &[MatchElem],
        buf: &[u8],
        http: Option<&HttpRequest>,
        tls: Option<u16>,
        pkt: &Packet,
        state: EvalPos,
    ) -> Option<EvalPos> {
        let Some(elem) = elems.first() else {
            return Some(state);
        };
        let rest = &elems[1..];
        match elem {
            MatchElem::Content(c) => {
                let hay: &[u8] = match c.buffer {
                    BufferKind::Payload => buf,
                    BufferKind::HttpUri => http?.uri.as_bytes(),
                    BufferKind::HttpRawHeader => &http?.raw_headers,
                };
                for start in content_occurrences(c, hay, state.pos_of(c.buffer)) {
                    let mut next = state;
                    next.set_pos(c.buffer, start + c.pattern.len());
                    if next.first_off.is_none() && c.buffer == BufferKind::Payload {
                        next.first_off = Some(start);
                    }
                    if let Some(done) = self.eval_elems(rest, buf, http, tls, pkt, next) {
                        return Some(done);
                    }
                }
                None
            }
            MatchElem::Pcre(p) => {
                let hay: &[u8] = if p.uri { http?.uri.as_bytes() } else { buf };
                let from = if p.relative {
                    state
                        .pos_of(if p.uri {
                            BufferKind::HttpUri
                        } else {
                            BufferKind::Payload
                        })
                        .unwrap_or(0)
                } else {
                    0
                };
                if from > hay.len() {
                    return None;
                }
                let m = p.re.find(&hay[from..])?;
                let mut next = state;
                next.set_pos(
                    if p.uri {
                        BufferKind::HttpUri
                    } else {
                        BufferKind::Payload
                    },
                    from + m.end(),
                );
                self.eval_elems(rest, buf, http, tls, pkt, next)
            }
            MatchElem::Flow(f) => {
                if f.established && !pkt.flags.contains(PacketFlags::Established) {
                    return None;
                }
                if f.to_server && !pkt.direction.is_to_server() {
                    return None;
                }
                if f.to_client && pkt.direction.is_to_server() {
                    return None;
                }
                self.eval_elems(rest, buf, http, tls, pkt, state)
            }
            MatchElem::IpProto(ipp) => {
                let proto = pkt.ip_proto()?;
                if !ipp.matches(proto) {
                    return None;
                }
                self.eval_elems(rest, buf, http, tls, pkt, state)
            }
            MatchElem::TlsVersion(v) => {
                if tls != Some(*v) {
                    return None;
                }
                self.eval_elems(rest, buf, http, tls, pkt, state)
            }
        }
    }
}

/// Cursor state threaded through match-list evaluation.
#[derive(Debug, Default, Copy, Clone)]
struct EvalPos {
    payload: Option<usize>,
    uri: Option<usize>,
    hdr: Option<usize>,
    /// First payload content match, reported on the alert.
    first_off: Option<usize>,
}

impl EvalPos {
    fn pos_of(&self, buffer: BufferKind) -> Option<usize> {
        match buffer {
            BufferKind::Payload => self.payload,
            BufferKind::HttpUri => self.uri,
            BufferKind::HttpRawHeader => self.hdr,
        }
    }

    fn set_pos(&mut self, buffer: BufferKind, pos: usize) {
        match buffer {
            BufferKind::Payload => self.payload = Some(pos),
            BufferKind::HttpUri => self.uri = Some(pos),
            BufferKind::HttpRawHeader => self.hdr = Some(pos),
        }
    }
}

/// Start offsets at which `c` matches `hay`, honouring offset/depth and
/// distance/within constraints relative to `anchor` (the previous chain
/// element's end). Never reads past the buffer.
fn content_occurrences(c: &ContentMatch, hay: &[u8], anchor: Option<usize>) -> Vec<usize> {
    let plen = c.pattern.len();
    if plen == 0 || plen > hay.len() {
        return Vec::new();
    }
    let mut lo = 0usize;
    let mut hi = hay.len() - plen;
    let mut end_limit = hay.len();

    if c.is_relative() {
        let base = anchor.unwrap_or(0) as i64 + c.distance.unwrap_or(0);
        lo = base.max(0) as usize;
        if let Some(within) = c.within {
            let max_start = base + within as i64;
            if max_start < 0 {
                return Vec::new();
            }
            hi = hi.min(max_start as usize);
        }
    }
    if let Some(offset) = c.offset {
        lo = lo.max(offset);
    }
    if let Some(depth) = c.depth {
        end_limit = end_limit.min(c.offset.unwrap_or(0).saturating_add(depth));
    }
    if lo > hi {
        return Vec::new();
    }

    let mut out = Vec::new();
    for start in lo..=hi {
        if start + plen > end_limit {
            break;
        }
        if c.nocase {
            let window = &hay[start..start + plen];
            if window
                .iter()
                .zip(&c.pattern)
                .all(|(h, p)| h.to_ascii_lowercase() == p.to_ascii_lowercase())
            {
                out.push(start);
            }
        } else if &hay[start..start + plen] == c.pattern.as_slice() {
            out.push(start);
        }
    }
    out
}

/// Builds the nested src/dst/port trees for one protocol's signatures.
fn build_proto_group(
    ids: &[SigIntId],
    sigs: &[Signature],
    builder: &mut siggroup::SghBuilder,
) -> Result<ProtoGroup> {
    let v4 = build_src_map(ids, sigs, builder, |s| s.src.v4_ranges(), |s| {
        s.dst.v4_ranges()
    })?;
    let v6 = build_src_map(ids, sigs, builder, |s| s.src.v6_ranges(), |s| {
        s.dst.v6_ranges()
    })?;
    Ok(ProtoGroup { v4, v6 })
}

fn build_src_map<K, FS, FD>(
    ids: &[SigIntId],
    sigs: &[Signature],
    builder: &mut siggroup::SghBuilder,
    src_ranges: FS,
    dst_ranges: FD,
) -> Result<SrcMap<K>>
where
    K: Copy + Ord + signature::num_ops::StepOps,
    FS: Fn(&Signature) -> Vec<(K, K)>,
    FD: Fn(&Signature) -> Vec<(K, K)> + Copy,
{
    let inputs: Vec<(K, K, SigIntId)> = ids
        .iter()
        .flat_map(|&id| {
            src_ranges(&sigs[id as usize])
                .into_iter()
                .map(move |(s, e)| (s, e, id))
        })
        .collect();
    let mut entries = Vec::new();
    for (start, end, leaf_ids) in cut_ranges(&inputs) {
        let dst = build_dst_map(&leaf_ids, sigs, builder, dst_ranges)?;
        if !dst.is_empty() {
            entries.push((start, end, dst));
        }
    }
    Ok(RangeMap::new(entries))
}

fn build_dst_map<K, FD>(
    ids: &[SigIntId],
    sigs: &[Signature],
    builder: &mut siggroup::SghBuilder,
    dst_ranges: FD,
) -> Result<DstMap<K>>
where
    K: Copy + Ord + signature::num_ops::StepOps,
    FD: Fn(&Signature) -> Vec<(K, K)>,
{
    let inputs: Vec<(K, K, SigIntId)> = ids
        .iter()
        .flat_map(|&id| {
            dst_ranges(&sigs[id as usize])
                .into_iter()
                .map(move |(s, e)| (s, e, id))
        })
        .collect();
    let mut entries = Vec::new();
    for (start, end, leaf_ids) in cut_ranges(&inputs) {
        let sp = build_sp_map(&leaf_ids, sigs, builder)?;
        if !sp.is_empty() {
            entries.push((start, end, sp));
        }
    }
    Ok(RangeMap::new(entries))
}

fn build_sp_map(
    ids: &[SigIntId],
    sigs: &[Signature],
    builder: &mut siggroup::SghBuilder,
) -> Result<SpMap> {
    let inputs: Vec<(u16, u16, SigIntId)> = ids
        .iter()
        .flat_map(|&id| {
            sigs[id as usize]
                .sp
                .resolved()
                .into_iter()
                .map(move |(s, e)| (s, e, id))
        })
        .collect();
    let mut entries = Vec::new();
    for (start, end, leaf_ids) in cut_ranges(&inputs) {
        let dp = build_dp_map(&leaf_ids, sigs, builder)?;
        if !dp.is_empty() {
            entries.push((start, end, dp));
        }
    }
    Ok(RangeMap::new(entries))
}

fn build_dp_map(
    ids: &[SigIntId],
    sigs: &[Signature],
    builder: &mut siggroup::SghBuilder,
) -> Result<DpMap> {
    let inputs: Vec<(u16, u16, SigIntId)> = ids
        .iter()
        .flat_map(|&id| {
            sigs[id as usize]
                .dp
                .resolved()
                .into_iter()
                .map(move |(s, e)| (s, e, id))
        })
        .collect();
    let mut entries = Vec::new();
    for (start, end, leaf_ids) in cut_ranges(&inputs) {
        let sgh = builder
            .build(&leaf_ids, sigs)
            .map_err(|e| anyhow::anyhow!("mpm build failure: {}", e))?;
        entries.push((start, end, sgh));
    }
    Ok(RangeMap::new(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectConfig;
    use crate::flow::table::tests::meta_packet;
    use crate::flow::FlowTable;
    use crate::utils::time::Timestamp;

    fn engine(rules: &str) -> DetectEngine {
        DetectEngine::from_rules(rules, &DetectConfig::default()).unwrap()
    }

    /// A decoded TCP packet carrying `payload` toward port 80.
    fn packet_with_payload(payload: &[u8]) -> Packet {
        let mut pkt = meta_packet([10, 0, 0, 1], [10, 0, 0, 2], 4000, 80, Timestamp::new(1, 0));
        let off = pkt.data.len();
        pkt.data.extend_from_slice(payload);
        if let Some(crate::packet::Transport::Tcp(tcp)) = &mut pkt.transport {
            tcp.payload_offset = off;
            tcp.payload_len = payload.len();
        }
        pkt
    }

    fn sids(pkt: &Packet) -> Vec<u32> {
        pkt.alerts.iter().map(|a| a.sid).collect()
    }

    #[test]
    fn scan_hits_fire_in_sid_order() {
        let eng = engine(
            r#"
alert tcp any any -> any 80 (msg:"a"; content:"abcd"; sid:1;)
alert tcp any any -> any 80 (msg:"b"; content:"bcde"; sid:2;)
alert tcp any any -> any 80 (msg:"c"; content:"fghj"; sid:3;)
"#,
        );
        let mut ctx = DetectThreadCtx::new();
        let mut pkt = packet_with_payload(b"abcdefghjiklmnopqrstuvwxyz");
        assert_eq!(eng.match_packet(&mut pkt, &mut ctx), 3);
        assert_eq!(sids(&pkt), vec![1, 2, 3]);
        assert_eq!(pkt.alerts[0].match_offset, 0);
        assert_eq!(pkt.alerts[1].match_offset, 1);
        assert_eq!(pkt.alerts[2].match_offset, 5);
    }

    #[test]
    fn port_and_address_scoping() {
        let eng = engine(
            r#"
alert tcp any any -> any 80 (content:"hit"; sid:1;)
alert tcp any any -> any 443 (content:"hit"; sid:2;)
alert tcp 192.168.0.0/16 any -> any 80 (content:"hit"; sid:3;)
"#,
        );
        let mut ctx = DetectThreadCtx::new();
        let mut pkt = packet_with_payload(b"a hit b");
        eng.match_packet(&mut pkt, &mut ctx);
        // Packet is 10.0.0.1 -> 10.0.0.2:80, so only sid 1 applies.
        assert_eq!(sids(&pkt), vec![1]);
    }

    #[test]
    fn offset_depth_bounds_respected() {
        let eng = engine(
            r#"
alert tcp any any -> any 80 (content:"abc"; offset:4; depth:5; sid:1;)
alert tcp any any -> any 80 (content:"abc"; offset:100; sid:2;)
"#,
        );
        let mut ctx = DetectThreadCtx::new();
        // "abc" at offset 4; fits in offset 4 + depth 5 window.
        let mut pkt = packet_with_payload(b"xxxxabcyy");
        eng.match_packet(&mut pkt, &mut ctx);
        assert_eq!(sids(&pkt), vec![1]);

        // Same pattern but at offset 0: outside both windows.
        let mut pkt = packet_with_payload(b"abcxxxxxx");
        let mut ctx = DetectThreadCtx::new();
        eng.match_packet(&mut pkt, &mut ctx);
        assert!(sids(&pkt).is_empty());
    }

    #[test]
    fn within_distance_chain() {
        let eng = engine(
            r#"alert tcp any any -> any 80 (content:"user"; content:"pass"; distance:1; within:6; sid:1;)"#,
        );
        let mut ctx = DetectThreadCtx::new();
        let mut pkt = packet_with_payload(b"user=x&pass=y");
        eng.match_packet(&mut pkt, &mut ctx);
        // "user" ends at 4; "pass" starts at 7; 4+1 <= 7 <= 4+1+6.
        assert_eq!(sids(&pkt), vec![1]);

        let mut pkt = packet_with_payload(b"user=xxxxxxxxxxxx&pass=y");
        let mut ctx = DetectThreadCtx::new();
        eng.match_packet(&mut pkt, &mut ctx);
        assert!(sids(&pkt).is_empty());
    }

    #[test]
    fn chain_backtracks_over_occurrences() {
        // First "ab" occurrence fails the chain; the second succeeds.
        let eng = engine(
            r#"alert tcp any any -> any 80 (content:"ab"; content:"cd"; distance:0; within:2; sid:1;)"#,
        );
        let mut ctx = DetectThreadCtx::new();
        let mut pkt = packet_with_payload(b"ab......ab cd");
        eng.match_packet(&mut pkt, &mut ctx);
        assert_eq!(sids(&pkt), vec![1]);
    }

    #[test]
    fn flow_established_gate() {
        let eng = engine(
            r#"alert tcp any any -> any 80 (flow:established,to_server; content:"x"; sid:1;)"#,
        );
        let mut ctx = DetectThreadCtx::new();
        let mut pkt = packet_with_payload(b"x");
        eng.match_packet(&mut pkt, &mut ctx);
        assert!(sids(&pkt).is_empty());

        let mut pkt = packet_with_payload(b"x");
        pkt.flags |= PacketFlags::Established;
        let mut ctx = DetectThreadCtx::new();
        eng.match_packet(&mut pkt, &mut ctx);
        assert_eq!(sids(&pkt), vec![1]);
    }

    #[test]
    fn ip_proto_predicate() {
        let eng = engine(r#"alert ip any any -> any any (ip_proto:!tcp; sid:1;)"#);
        let mut ctx = DetectThreadCtx::new();
        let mut pkt = packet_with_payload(b"anything");
        eng.match_packet(&mut pkt, &mut ctx);
        // Packet is TCP; negated predicate fails.
        assert!(sids(&pkt).is_empty());
    }

    #[test]
    fn deterministic_across_runs() {
        let rules = r#"
alert tcp any any -> any 80 (content:"aaa"; sid:30;)
alert tcp any any -> any 80 (content:"aa"; sid:10;)
alert tcp any any -> any 80 (content:"a"; sid:20;)
"#;
        let run = || {
            let eng = engine(rules);
            let mut ctx = DetectThreadCtx::new();
            let mut pkt = packet_with_payload(b"aaa");
            eng.match_packet(&mut pkt, &mut ctx);
            sids(&pkt)
        };
        let first = run();
        assert_eq!(first, run());
        // Ascending internal id == rule file order.
        assert_eq!(first, vec![30, 10, 20]);
    }

    #[test]
    fn drop_action_sets_packet_action() {
        let eng = engine(r#"drop tcp any any -> any 80 (content:"evil"; sid:1;)"#);
        let mut ctx = DetectThreadCtx::new();
        let mut pkt = packet_with_payload(b"evil bytes");
        eng.match_packet(&mut pkt, &mut ctx);
        assert!(pkt.verdict_is_drop());
    }

    #[test]
    fn stream_message_buffers_are_scanned() {
        use crate::memory::MemBudget;
        use crate::stream::{OsPolicy, TcpSession, SessionParams};

        let eng = engine(r#"alert tcp any any -> any 80 (content:"hello stream"; sid:1;)"#);

        // Build a packet whose stream message carries the pattern while the
        // raw payload does not.
        let table = FlowTable::new(&crate::config::FlowConfig::default());
        let mut pkt = packet_with_payload(b"");
        table.handle_packet(&mut pkt);
        let flow = pkt.flow.clone().unwrap();

        let mut ssn = TcpSession::new(
            OsPolicy::Bsd,
            std::sync::Arc::new(MemBudget::new(1 << 20)),
        );
        let params = SessionParams {
            midstream: true,
            chunk_len_init: 1,
            chunk_len_steady: 1,
            gap_timeout: 60,
        };
        let meta = crate::packet::TcpMeta {
            seq: 100,
            ack: 200,
            flags: crate::protocols::packet::tcp::ACK,
            window: 0xffff,
            ..Default::default()
        };
        let out = ssn.handle(
            crate::packet::Direction::ToServer,
            &meta,
            b"hello stream data",
            Timestamp::new(1, 0),
            &params,
        );
        for mut msg in out.msgs {
            msg.attach_flow(&flow);
            pkt.stream_msgs.push(msg);
        }

        let mut ctx = DetectThreadCtx::new();
        eng.match_packet(&mut pkt, &mut ctx);
        assert_eq!(sids(&pkt), vec![1]);

        pkt.stream_msgs.clear();
        pkt.flow.take().unwrap().decr_use();
    }
}
