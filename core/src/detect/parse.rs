//! Rule parsing.
//!
//! Parses the classic signature syntax:
//!
//! ```text
//! alert tcp $HOME any -> any 80 (msg:"..."; content:"..."; sid:1; rev:2;)
//! ```
//!
//! The header (action, protocol, addresses, ports, direction) is parsed
//! with nom combinators; option values keep their own micro-grammars
//! (quoted strings with `|0D 0A|` hex runs, pcre with trailing flags).

use crate::detect::signature::{
    AddrRange, AddressSpec, CmpOp, ContentMatch, FlowMatch, IpProtoMatch, MatchElem, PcreMatch,
    PortSpec, ProtoBitmap, SigAction, Signature,
};
use crate::protocols::packet::ipv4::{PROTO_ICMP, PROTO_TCP, PROTO_UDP};

use std::collections::HashMap;
use std::net::IpAddr;

use ipnet::IpNet;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{multispace0, multispace1};
use nom::combinator::map;
use nom::IResult;
use regex::bytes::RegexBuilder;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RuleParseError {
    #[error("malformed rule header: {0}")]
    Header(String),
    #[error("malformed address spec {0:?}")]
    Address(String),
    #[error("malformed port spec {0:?}")]
    Port(String),
    #[error("malformed option {0:?}")]
    Option(String),
    #[error("bad content pattern: {0}")]
    Content(String),
    #[error("bad pcre: {0}")]
    Pcre(String),
    #[error("{0:?} must follow a content pattern")]
    DanglingModifier(String),
    #[error("missing sid")]
    MissingSid,
}

/// Parses a full rule file; comment lines (`#`) and blanks are skipped.
/// Returns the parsed signatures and the (line, error) pairs encountered.
pub fn parse_rules(input: &str) -> (Vec<Signature>, Vec<(usize, RuleParseError)>) {
    let mut sigs = Vec::new();
    let mut errors = Vec::new();
    for (lineno, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_rule(line) {
            Ok(sig) => sigs.push(sig),
            Err(e) => errors.push((lineno + 1, e)),
        }
    }
    (sigs, errors)
}

/// Parses one rule line.
pub fn parse_rule(input: &str) -> Result<Signature, RuleParseError> {
    let (rest, (action, proto, src, sp, dst, dp)) =
        rule_header(input).map_err(|e| RuleParseError::Header(e.to_string()))?;

    let rest = rest.trim();
    if !rest.starts_with('(') || !rest.ends_with(')') {
        return Err(RuleParseError::Header("missing option block".into()));
    }
    let opts = &rest[1..rest.len() - 1];

    let mut sig = Signature {
        idx: 0,
        action,
        sid: 0,
        gid: 1,
        rev: 0,
        msg: String::new(),
        classtype: None,
        class_id: 0,
        prio: 3,
        proto,
        src,
        sp,
        dst,
        dp,
        matches: Vec::new(),
        scan_content: None,
    };

    for raw_opt in split_options(opts) {
        let raw_opt = raw_opt.trim();
        if raw_opt.is_empty() {
            continue;
        }
        let (name, value) = match raw_opt.split_once(':') {
            Some((n, v)) => (n.trim(), Some(v.trim())),
            None => (raw_opt, None),
        };
        apply_option(&mut sig, name, value)?;
    }

    if sig.sid == 0 {
        return Err(RuleParseError::MissingSid);
    }
    Ok(sig)
}

type Header = (
    SigAction,
    ProtoBitmap,
    AddressSpec,
    PortSpec,
    AddressSpec,
    PortSpec,
);

fn rule_header(input: &str) -> IResult<&str, Header> {
    let (input, _) = multispace0(input)?;
    let (input, action) = alt((
        map(tag("alert"), |_| SigAction::Alert),
        map(tag("drop"), |_| SigAction::Drop),
        map(tag("reject"), |_| SigAction::Reject),
        map(tag("pass"), |_| SigAction::Pass),
    ))(input)?;
    let (input, _) = multispace1(input)?;
    let (input, proto) = alt((
        map(tag("tcp"), |_| ProtoBitmap::single(PROTO_TCP)),
        map(tag("udp"), |_| ProtoBitmap::single(PROTO_UDP)),
        map(tag("icmp"), |_| ProtoBitmap::single(PROTO_ICMP)),
        map(tag("ip"), |_| ProtoBitmap::all()),
    ))(input)?;
    let (input, _) = multispace1(input)?;
    let (input, src_str) = spec_token(input)?;
    let (input, _) = multispace1(input)?;
    let (input, sp_str) = spec_token(input)?;
    let (input, _) = multispace1(input)?;
    let (input, _) = tag("->")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, dst_str) = spec_token(input)?;
    let (input, _) = multispace1(input)?;
    let (input, dp_str) = spec_token(input)?;
    let (input, _) = multispace0(input)?;

    let src = parse_address_spec(src_str)
        .map_err(|_| nom_failure(input))?;
    let dst = parse_address_spec(dst_str)
        .map_err(|_| nom_failure(input))?;
    let sp = parse_port_spec(sp_str).map_err(|_| nom_failure(input))?;
    let dp = parse_port_spec(dp_str).map_err(|_| nom_failure(input))?;

    Ok((input, (action, proto, src, sp, dst, dp)))
}

fn nom_failure(input: &str) -> nom::Err<nom::error::Error<&str>> {
    nom::Err::Failure(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Verify,
    ))
}

/// One whitespace-delimited header token, allowing bracketed lists.
fn spec_token(input: &str) -> IResult<&str, &str> {
    if input.starts_with('[') || input.starts_with("![") {
        let open = input.find('[').unwrap();
        match input[open..].find(']') {
            Some(close) => {
                let end = open + close + 1;
                Ok((&input[end..], &input[..end]))
            }
            None => Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::TakeUntil,
            ))),
        }
    } else {
        take_while1(|c: char| !c.is_whitespace())(input)
    }
}

/// Address grammar: `any`, ip, cidr, `!spec`, `[a,b,...]`.
pub fn parse_address_spec(s: &str) -> Result<AddressSpec, RuleParseError> {
    let s = s.trim();
    let (negate, body) = match s.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if body == "any" {
        if negate {
            return Err(RuleParseError::Address(s.into()));
        }
        return Ok(AddressSpec::any());
    }
    let items: Vec<&str> = if body.starts_with('[') && body.ends_with(']') {
        body[1..body.len() - 1].split(',').collect()
    } else {
        vec![body]
    };
    let mut ranges = Vec::new();
    for item in items {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        ranges.push(parse_addr_item(item)?);
    }
    if ranges.is_empty() {
        return Err(RuleParseError::Address(s.into()));
    }
    Ok(AddressSpec {
        any: false,
        negate,
        ranges,
    })
}

fn parse_addr_item(item: &str) -> Result<AddrRange, RuleParseError> {
    if item.contains('/') {
        let net: IpNet = item
            .parse()
            .map_err(|_| RuleParseError::Address(item.into()))?;
        return Ok(match net {
            IpNet::V4(n) => AddrRange::V4(u32::from(n.network()), u32::from(n.broadcast())),
            IpNet::V6(n) => AddrRange::V6(u128::from(n.network()), u128::from(n.broadcast())),
        });
    }
    let addr: IpAddr = item
        .parse()
        .map_err(|_| RuleParseError::Address(item.into()))?;
    Ok(match addr {
        IpAddr::V4(a) => {
            let v = u32::from(a);
            AddrRange::V4(v, v)
        }
        IpAddr::V6(a) => {
            let v = u128::from(a);
            AddrRange::V6(v, v)
        }
    })
}

/// Port grammar: `any`, `N`, `N:`, `:N`, `N:M`, `!spec`, `[a,b,...]`.
pub fn parse_port_spec(s: &str) -> Result<PortSpec, RuleParseError> {
    let s = s.trim();
    let (negate, body) = match s.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if body == "any" {
        if negate {
            return Err(RuleParseError::Port(s.into()));
        }
        return Ok(PortSpec::any());
    }
    let items: Vec<&str> = if body.starts_with('[') && body.ends_with(']') {
        body[1..body.len() - 1].split(',').collect()
    } else {
        vec![body]
    };
    let mut ranges = Vec::new();
    for item in items {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        ranges.push(parse_port_item(item)?);
    }
    if ranges.is_empty() {
        return Err(RuleParseError::Port(s.into()));
    }
    Ok(PortSpec {
        any: false,
        negate,
        ranges,
    })
}

fn parse_port_item(item: &str) -> Result<(u16, u16), RuleParseError> {
    let err = || RuleParseError::Port(item.into());
    if let Some((lo, hi)) = item.split_once(':') {
        let lo = if lo.is_empty() {
            0
        } else {
            lo.parse().map_err(|_| err())?
        };
        let hi = if hi.is_empty() {
            u16::MAX
        } else {
            hi.parse().map_err(|_| err())?
        };
        if lo > hi {
            return Err(err());
        }
        Ok((lo, hi))
    } else {
        let p: u16 = item.parse().map_err(|_| err())?;
        Ok((p, p))
    }
}

/// Splits the option block on `;`, honouring quoted strings and escapes.
fn split_options(opts: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_quote = false;
    let mut escaped = false;
    for c in opts.chars() {
        if escaped {
            cur.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => {
                cur.push(c);
                escaped = true;
            }
            '"' => {
                cur.push(c);
                in_quote = !in_quote;
            }
            ';' if !in_quote => {
                out.push(std::mem::take(&mut cur));
            }
            _ => cur.push(c),
        }
    }
    if !cur.trim().is_empty() {
        out.push(cur);
    }
    out
}

fn apply_option(
    sig: &mut Signature,
    name: &str,
    value: Option<&str>,
) -> Result<(), RuleParseError> {
    match name {
        "msg" => sig.msg = unquote(value.unwrap_or("")).unwrap_or_default(),
        "sid" => sig.sid = parse_num(name, value)?,
        "rev" => sig.rev = parse_num(name, value)?,
        "gid" => sig.gid = parse_num(name, value)?,
        "priority" => sig.prio = parse_num(name, value)?,
        "classtype" => sig.classtype = value.map(|v| v.to_string()),
        "content" => {
            let raw = value.ok_or_else(|| RuleParseError::Option(name.into()))?;
            let quoted =
                unquote(raw).ok_or_else(|| RuleParseError::Content(raw.to_string()))?;
            let bytes = decode_content(&quoted)?;
            sig.matches.push(MatchElem::Content(ContentMatch::new(bytes)));
        }
        "uricontent" => {
            let raw = value.ok_or_else(|| RuleParseError::Option(name.into()))?;
            let quoted =
                unquote(raw).ok_or_else(|| RuleParseError::Content(raw.to_string()))?;
            let bytes = decode_content(&quoted)?;
            let mut c = ContentMatch::new(bytes);
            c.buffer = crate::detect::signature::BufferKind::HttpUri;
            sig.matches.push(MatchElem::Content(c));
        }
        "nocase" => last_content(sig, name)?.nocase = true,
        "offset" => last_content(sig, name)?.offset = Some(parse_num::<usize>(name, value)?),
        "depth" => last_content(sig, name)?.depth = Some(parse_num::<usize>(name, value)?),
        "distance" => last_content(sig, name)?.distance = Some(parse_num::<i64>(name, value)?),
        "within" => last_content(sig, name)?.within = Some(parse_num::<usize>(name, value)?),
        "http_uri" => last_content(sig, name)?.buffer = crate::detect::signature::BufferKind::HttpUri,
        "http_raw_header" => {
            last_content(sig, name)?.buffer = crate::detect::signature::BufferKind::HttpRawHeader
        }
        "pcre" => {
            let raw = value.ok_or_else(|| RuleParseError::Option(name.into()))?;
            sig.matches.push(MatchElem::Pcre(parse_pcre(raw)?));
        }
        "flow" => {
            let raw = value.ok_or_else(|| RuleParseError::Option(name.into()))?;
            sig.matches.push(MatchElem::Flow(parse_flow(raw)?));
        }
        "ip_proto" => {
            let raw = value.ok_or_else(|| RuleParseError::Option(name.into()))?;
            sig.matches.push(MatchElem::IpProto(parse_ip_proto(raw)?));
        }
        "tls.version" => {
            let raw = value.ok_or_else(|| RuleParseError::Option(name.into()))?;
            let version = match raw.trim() {
                "1.0" => 0x0301,
                "1.1" => 0x0302,
                "1.2" => 0x0303,
                _ => return Err(RuleParseError::Option(format!("tls.version:{}", raw))),
            };
            sig.matches.push(MatchElem::TlsVersion(version));
        }
        // Accepted and ignored for rule-file compatibility.
        "metadata" | "reference" | "threshold" => {}
        other => return Err(RuleParseError::Option(other.to_string())),
    }
    Ok(())
}

fn last_content<'a>(
    sig: &'a mut Signature,
    modifier: &str,
) -> Result<&'a mut ContentMatch, RuleParseError> {
    match sig.matches.iter_mut().next_back() {
        Some(MatchElem::Content(c)) => Ok(c),
        _ => Err(RuleParseError::DanglingModifier(modifier.to_string())),
    }
}

fn parse_num<T: std::str::FromStr>(
    name: &str,
    value: Option<&str>,
) -> Result<T, RuleParseError> {
    value
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| RuleParseError::Option(name.to_string()))
}

/// Strips surrounding quotes and resolves `\"`, `\\`, `\;` escapes.
fn unquote(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.len() < 2 || !raw.starts_with('"') || !raw.ends_with('"') {
        return None;
    }
    let inner = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut escaped = false;
    for c in inner.chars() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// Decodes a content body: literal bytes with `|0D 0A|` hex runs.
pub fn decode_content(s: &str) -> Result<Vec<u8>, RuleParseError> {
    let mut out = Vec::with_capacity(s.len());
    let mut in_hex = false;
    let mut hex_acc = String::new();
    for c in s.chars() {
        if in_hex {
            if c == '|' {
                for pair in hex_acc.split_whitespace() {
                    let byte = u8::from_str_radix(pair, 16)
                        .map_err(|_| RuleParseError::Content(s.to_string()))?;
                    out.push(byte);
                }
                hex_acc.clear();
                in_hex = false;
            } else {
                hex_acc.push(c);
            }
        } else if c == '|' {
            in_hex = true;
        } else {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        }
    }
    if in_hex {
        return Err(RuleParseError::Content(s.to_string()));
    }
    Ok(out)
}

/// Parses `"/regex/flags"` into a compiled pcre-class matcher.
fn parse_pcre(raw: &str) -> Result<PcreMatch, RuleParseError> {
    let err = || RuleParseError::Pcre(raw.to_string());
    let body = unquote(raw).ok_or_else(err)?;
    if !body.starts_with('/') {
        return Err(err());
    }
    let close = body.rfind('/').ok_or_else(err)?;
    if close == 0 {
        return Err(err());
    }
    let pattern = &body[1..close];
    let flags = &body[close + 1..];

    let mut builder = RegexBuilder::new(pattern);
    let mut relative = false;
    let mut uri = false;
    for f in flags.chars() {
        match f {
            'i' => {
                builder.case_insensitive(true);
            }
            's' => {
                builder.dot_matches_new_line(true);
            }
            'm' => {
                builder.multi_line(true);
            }
            'x' => {
                builder.ignore_whitespace(true);
            }
            'R' => relative = true,
            'U' => uri = true,
            // Raw-buffer flag: all buffers here are raw already.
            'B' => {}
            _ => return Err(err()),
        }
    }
    let re = builder.build().map_err(|_| err())?;
    Ok(PcreMatch {
        re,
        raw: body,
        relative,
        uri,
    })
}

fn parse_flow(raw: &str) -> Result<FlowMatch, RuleParseError> {
    let mut flow = FlowMatch::default();
    for part in raw.split(',') {
        match part.trim() {
            "established" => flow.established = true,
            "stateless" => flow.stateless = true,
            "to_server" | "from_client" => flow.to_server = true,
            "to_client" | "from_server" => flow.to_client = true,
            "only_stream" => flow.only_stream = true,
            "no_stream" => flow.no_stream = true,
            other => return Err(RuleParseError::Option(format!("flow:{}", other))),
        }
    }
    Ok(flow)
}

lazy_static! {
    /// IP protocol names accepted by `ip_proto`.
    static ref IP_PROTO_NAMES: HashMap<&'static str, u8> = {
        let mut m = HashMap::new();
        m.insert("icmp", PROTO_ICMP);
        m.insert("igmp", 2);
        m.insert("ipip", 4);
        m.insert("tcp", PROTO_TCP);
        m.insert("udp", PROTO_UDP);
        m.insert("gre", 47);
        m.insert("esp", 50);
        m.insert("ah", 51);
        m.insert("ipv6-icmp", 58);
        m.insert("sctp", 132);
        m
    };
}

/// Parses `[!<>]?<name-or-number>`.
fn parse_ip_proto(raw: &str) -> Result<IpProtoMatch, RuleParseError> {
    let raw = raw.trim();
    let err = || RuleParseError::Option(format!("ip_proto:{}", raw));
    let (op, body) = match raw.chars().next() {
        Some('!') => (CmpOp::Ne, &raw[1..]),
        Some('>') => (CmpOp::Gt, &raw[1..]),
        Some('<') => (CmpOp::Lt, &raw[1..]),
        Some(_) => (CmpOp::Eq, raw),
        None => return Err(err()),
    };
    let body = body.trim();
    let proto = match IP_PROTO_NAMES.get(body) {
        Some(&p) => p,
        None => body.parse().map_err(|_| err())?,
    };
    Ok(IpProtoMatch { op, proto })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::signature::BufferKind;

    #[test]
    fn parses_minimal_rule() {
        let sig = parse_rule(
            r#"alert tcp any any -> any 80 (msg:"hello"; content:"evil"; sid:1; rev:2;)"#,
        )
        .unwrap();
        assert_eq!(sig.action, SigAction::Alert);
        assert!(sig.proto.test(PROTO_TCP));
        assert!(!sig.proto.test(PROTO_UDP));
        assert_eq!(sig.sid, 1);
        assert_eq!(sig.rev, 2);
        assert_eq!(sig.msg, "hello");
        assert_eq!(sig.dp.resolved(), vec![(80, 80)]);
        match &sig.matches[0] {
            MatchElem::Content(c) => assert_eq!(c.pattern, b"evil"),
            other => panic!("unexpected elem {:?}", other),
        }
    }

    #[test]
    fn hex_runs_in_content() {
        let sig = parse_rule(
            r#"alert tcp any any -> any any (content:"firefox/3.5.7|0D 0A|content"; nocase; sid:9;)"#,
        )
        .unwrap();
        match &sig.matches[0] {
            MatchElem::Content(c) => {
                assert!(c.nocase);
                assert_eq!(c.pattern, b"firefox/3.5.7\r\ncontent");
            }
            other => panic!("unexpected elem {:?}", other),
        }
    }

    #[test]
    fn modifiers_bind_to_last_content() {
        let sig = parse_rule(
            r#"alert tcp any any -> any any (content:"a"; offset:4; depth:10; content:"b"; distance:2; within:6; sid:3;)"#,
        )
        .unwrap();
        let contents: Vec<&ContentMatch> = sig
            .matches
            .iter()
            .filter_map(|m| match m {
                MatchElem::Content(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(contents[0].offset, Some(4));
        assert_eq!(contents[0].depth, Some(10));
        assert!(contents[0].distance.is_none());
        assert_eq!(contents[1].distance, Some(2));
        assert_eq!(contents[1].within, Some(6));
        assert!(contents[1].is_relative());
    }

    #[test]
    fn dangling_modifier_rejected() {
        let e = parse_rule(r#"alert tcp any any -> any any (nocase; sid:1;)"#).unwrap_err();
        assert_eq!(e, RuleParseError::DanglingModifier("nocase".into()));
    }

    #[test]
    fn address_lists_and_negation() {
        let sig = parse_rule(
            r#"alert tcp [10.0.0.0/8,192.168.1.1] any -> !172.16.0.0/12 any (sid:2;)"#,
        )
        .unwrap();
        assert_eq!(sig.src.ranges.len(), 2);
        assert!(sig.dst.negate);
        assert!(sig
            .dst
            .matches("8.8.8.8".parse().unwrap()));
        assert!(!sig
            .dst
            .matches("172.16.5.5".parse().unwrap()));
    }

    #[test]
    fn port_ranges() {
        let sig =
            parse_rule(r#"alert tcp any [80,8000:8080] -> any !25 (sid:4;)"#).unwrap();
        assert!(sig.sp.matches(8040));
        assert!(sig.sp.matches(80));
        assert!(!sig.sp.matches(79));
        assert!(!sig.dp.matches(25));
        assert!(sig.dp.matches(26));
    }

    #[test]
    fn pcre_flags() {
        let sig = parse_rule(
            r#"alert tcp any any -> any any (pcre:"/evil.payload/iR"; sid:5;)"#,
        )
        .unwrap();
        match &sig.matches[0] {
            MatchElem::Pcre(p) => {
                assert!(p.relative);
                assert!(p.re.is_match(b"EVILxPAYLOAD"));
            }
            other => panic!("unexpected elem {:?}", other),
        }
    }

    #[test]
    fn flow_and_ip_proto_and_tls() {
        let sig = parse_rule(
            r#"alert ip any any -> any any (flow:established,to_server; ip_proto:!udp; tls.version:1.2; sid:6;)"#,
        )
        .unwrap();
        assert_eq!(sig.matches.len(), 3);
        match &sig.matches[1] {
            MatchElem::IpProto(p) => {
                assert_eq!(p.op, CmpOp::Ne);
                assert_eq!(p.proto, PROTO_UDP);
            }
            other => panic!("unexpected elem {:?}", other),
        }
        match &sig.matches[2] {
            MatchElem::TlsVersion(v) => assert_eq!(*v, 0x0303),
            other => panic!("unexpected elem {:?}", other),
        }
    }

    #[test]
    fn uricontent_sets_buffer() {
        let sig = parse_rule(
            r#"alert tcp any any -> any 80 (uricontent:"/admin"; content:"header"; http_raw_header; sid:7;)"#,
        )
        .unwrap();
        match &sig.matches[0] {
            MatchElem::Content(c) => assert_eq!(c.buffer, BufferKind::HttpUri),
            other => panic!("unexpected elem {:?}", other),
        }
        match &sig.matches[1] {
            MatchElem::Content(c) => assert_eq!(c.buffer, BufferKind::HttpRawHeader),
            other => panic!("unexpected elem {:?}", other),
        }
    }

    #[test]
    fn missing_sid_is_an_error() {
        let e = parse_rule(r#"alert tcp any any -> any any (msg:"x";)"#).unwrap_err();
        assert_eq!(e, RuleParseError::MissingSid);
    }

    #[test]
    fn rule_file_collects_errors() {
        let input = r#"
# comment
alert tcp any any -> any 80 (content:"ok"; sid:1;)

bogus nonsense here
alert udp any any -> any 53 (sid:2;)
"#;
        let (sigs, errors) = parse_rules(input);
        assert_eq!(sigs.len(), 2);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, 5);
    }

    #[test]
    fn escaped_semicolon_in_content() {
        let sig =
            parse_rule(r#"alert tcp any any -> any any (content:"a\;b"; sid:8;)"#).unwrap();
        match &sig.matches[0] {
            MatchElem::Content(c) => assert_eq!(c.pattern, b"a;b"),
            other => panic!("unexpected elem {:?}", other),
        }
    }
}
