//! `dns` check: a minimal hand-rolled DNS client over `UdpSocket`.
//!
//! No DNS resolver crate appears anywhere in the corpus this daemon is
//! built from, so this follows the corpus's existing taste for raw
//! sockets and small wire-format parsers rather than pulling one in.
//! Only what's needed to validate A, AAAA and PTR answers is implemented;
//! there is no caching, retries, or support for recursion-desired
//! semantics beyond the single flag bit.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};

use super::{is_enabled, read_timeout, require_str, Check, CheckContext, CheckResult, Descriptor, MetricDef};
use crate::errors::{CheckError, RegistryError};
use crate::registry::Registry;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const RESULT_KEY: &str = "resolve_us";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordType {
    A,
    Aaaa,
    Ptr,
}

impl RecordType {
    fn qtype(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Aaaa => 28,
            RecordType::Ptr => 12,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Some(RecordType::A),
            "AAAA" => Some(RecordType::Aaaa),
            "PTR" => Some(RecordType::Ptr),
            _ => None,
        }
    }
}

/// Encode `name` (e.g. `"example.com"` or a reverse-lookup label) as DNS
/// wire-format labels terminated by a zero-length root label.
fn encode_name(name: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() {
            continue;
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out
}

/// Build a single-question query message with a random-ish transaction id.
fn build_query(id: u16, name: &str, qtype: RecordType) -> Vec<u8> {
    let mut msg = Vec::with_capacity(32);
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(&0x0100u16.to_be_bytes()); // RD=1
    msg.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    msg.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    msg.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    msg.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT
    msg.extend_from_slice(&encode_name(name));
    msg.extend_from_slice(&qtype.qtype().to_be_bytes());
    msg.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN
    msg
}

/// Skip a (possibly compressed) name starting at `offset`, returning the
/// offset just past it.
fn skip_name(buf: &[u8], mut offset: usize) -> Result<usize, CheckError> {
    loop {
        let len = *buf
            .get(offset)
            .ok_or_else(|| CheckError::Parse("truncated name".into()))?;
        if len == 0 {
            return Ok(offset + 1);
        }
        if len & 0xC0 == 0xC0 {
            return Ok(offset + 2);
        }
        offset += 1 + len as usize;
    }
}

/// Parse the response header and confirm it answers `expected_id` with
/// RCODE 0 ("no error") and at least one answer record.
fn validate_response(buf: &[u8], expected_id: u16) -> Result<u16, CheckError> {
    if buf.len() < 12 {
        return Err(CheckError::Dns("response shorter than a DNS header".into()));
    }
    let id = u16::from_be_bytes([buf[0], buf[1]]);
    if id != expected_id {
        return Err(CheckError::Dns("transaction id mismatch".into()));
    }
    let flags = u16::from_be_bytes([buf[2], buf[3]]);
    let rcode = flags & 0x000F;
    if rcode != 0 {
        return Err(CheckError::Dns(format!("response code {rcode}")));
    }
    let ancount = u16::from_be_bytes([buf[6], buf[7]]);
    if ancount == 0 {
        return Err(CheckError::Dns("no answer records".into()));
    }
    Ok(ancount)
}

/// Walk past the echoed question section to the start of the answer section.
fn skip_question(buf: &[u8]) -> Result<usize, CheckError> {
    let after_name = skip_name(buf, 12)?;
    let after_q = after_name + 4; // QTYPE + QCLASS
    if after_q > buf.len() {
        return Err(CheckError::Parse("truncated question section".into()));
    }
    Ok(after_q)
}

/// Render an A/AAAA record's RDATA as the textual address it encodes.
fn format_address(rdata: &[u8]) -> String {
    match rdata.len() {
        4 => std::net::Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]).to_string(),
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(rdata);
            std::net::Ipv6Addr::from(octets).to_string()
        }
        _ => rdata.iter().map(|b| format!("{b:02x}")).collect(),
    }
}

/// Decode a (possibly compressed) DNS name starting at `offset`, following
/// at most one compression pointer (sufficient for the PTR answers this
/// check parses, which point back into the echoed question).
fn decode_name(buf: &[u8], mut offset: usize) -> Result<String, CheckError> {
    let mut labels = Vec::new();
    let mut jumps = 0;
    loop {
        let len = *buf
            .get(offset)
            .ok_or_else(|| CheckError::Parse("truncated name".into()))?;
        if len == 0 {
            break;
        }
        if len & 0xC0 == 0xC0 {
            jumps += 1;
            if jumps > 5 {
                return Err(CheckError::Parse("too many compression pointers".into()));
            }
            let lo = *buf
                .get(offset + 1)
                .ok_or_else(|| CheckError::Parse("truncated compression pointer".into()))?;
            offset = (((len & 0x3F) as usize) << 8) | lo as usize;
            continue;
        }
        let label = buf
            .get(offset + 1..offset + 1 + len as usize)
            .ok_or_else(|| CheckError::Parse("truncated name label".into()))?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        offset += 1 + len as usize;
    }
    Ok(labels.join("."))
}

/// Check that at least one answer record matches `qtype` and carries
/// `expected` as its decoded value ("validating the answer
/// matches an expected value").
fn validate_answers(
    buf: &[u8],
    mut offset: usize,
    count: u16,
    qtype: RecordType,
    expected: &str,
) -> Result<(), CheckError> {
    let mut mismatches = Vec::new();
    for _ in 0..count {
        offset = skip_name(buf, offset)?;
        let rr_header = buf
            .get(offset..offset + 10)
            .ok_or_else(|| CheckError::Parse("truncated resource record".into()))?;
        let rtype = u16::from_be_bytes([rr_header[0], rr_header[1]]);
        let rdlength = u16::from_be_bytes([rr_header[8], rr_header[9]]) as usize;
        offset += 10;
        if rtype == qtype.qtype() {
            let rdata = buf
                .get(offset..offset + rdlength)
                .ok_or_else(|| CheckError::Parse("truncated rdata".into()))?;
            let actual = match qtype {
                RecordType::A | RecordType::Aaaa => format_address(rdata),
                RecordType::Ptr => decode_name(buf, offset)?,
            };
            if actual.trim_end_matches('.').eq_ignore_ascii_case(expected.trim_end_matches('.')) {
                return Ok(());
            }
            mismatches.push(actual);
        }
        offset += rdlength;
    }
    if mismatches.is_empty() {
        Err(CheckError::Dns(format!(
            "no answer of the requested type ({:?})",
            qtype
        )))
    } else {
        Err(CheckError::Dns(format!(
            "expected '{expected}', got {}",
            mismatches.join(", ")
        )))
    }
}

/// A `dns` check bound to one resolver and one query, validating that the
/// answer matches an `expected` value.
pub struct DnsCheck {
    resolver: SocketAddr,
    name: String,
    record_type: RecordType,
    expected: String,
    timeout: Duration,
}

impl DnsCheck {
    fn resolve(&self) -> Result<(), CheckError> {
        let socket = UdpSocket::bind((
            if self.resolver.is_ipv6() {
                "[::]:0"
            } else {
                "0.0.0.0:0"
            }
        ))?;
        socket.set_read_timeout(Some(self.timeout))?;
        socket.connect(self.resolver)?;

        let id = (std::process::id() as u16) ^ (self.name.len() as u16).rotate_left(7);
        let query = build_query(id, &self.name, self.record_type);
        socket.send(&query)?;

        let mut buf = [0u8; 1500];
        let n = socket.recv(&mut buf)?;
        let ancount = validate_response(&buf[..n], id)?;
        let answer_offset = skip_question(&buf[..n])?;
        validate_answers(&buf[..n], answer_offset, ancount, self.record_type, &self.expected)
    }
}

impl Check for DnsCheck {
    fn type_name(&self) -> &'static str {
        "dns"
    }

    fn describe(&self) -> Descriptor {
        Descriptor {
            metrics: vec![MetricDef::scaled(RESULT_KEY, "resolve_us", "Resolve time", "ms", 1000)],
            style: super::GraphStyle::Line,
            label: None,
        }
    }

    fn run(&self, ctx: &CheckContext) -> CheckResult {
        let mut result = CheckResult::started(Utc::now());
        if ctx.is_cancelled() {
            result.error = Some(CheckError::Cancelled.to_string());
            result.record_missing(RESULT_KEY);
            return result;
        }
        let start = std::time::Instant::now();
        match self.resolve() {
            Ok(()) => {
                result.success = true;
                result.record(RESULT_KEY, start.elapsed().as_micros() as i64);
            }
            Err(err) => {
                result.error = Some(err.to_string());
                result.record_missing(RESULT_KEY);
            }
        }
        result
    }
}

/// Register the `dns` check type factory with `registry`.
pub fn register(registry: &Registry) {
    let factory = Arc::new(|cfg: &Map<String, Value>| -> Result<Box<dyn Check>, RegistryError> {
        if !is_enabled(cfg) {
            return Err(RegistryError::InvalidConfig {
                check_type: "dns".into(),
                reason: "disabled".into(),
            });
        }
        let resolver_str = require_str(cfg, "resolver", "dns").map_err(|e| RegistryError::InvalidConfig {
            check_type: "dns".into(),
            reason: e.to_string(),
        })?;
        let resolver: SocketAddr = resolver_str
            .parse()
            .or_else(|_| format!("{resolver_str}:53").parse())
            .map_err(|_| RegistryError::InvalidConfig {
                check_type: "dns".into(),
                reason: format!("could not parse resolver address '{resolver_str}'"),
            })?;
        let name = require_str(cfg, "name", "dns")
            .map_err(|e| RegistryError::InvalidConfig {
                check_type: "dns".into(),
                reason: e.to_string(),
            })?
            .to_string();
        let record_type_str = cfg
            .get("record_type")
            .and_then(|v| v.as_str())
            .unwrap_or("A");
        let record_type = RecordType::parse(record_type_str).ok_or_else(|| RegistryError::InvalidConfig {
            check_type: "dns".into(),
            reason: format!("unsupported record_type '{record_type_str}'"),
        })?;
        let expected = require_str(cfg, "expected", "dns")
            .map_err(|e| RegistryError::InvalidConfig {
                check_type: "dns".into(),
                reason: e.to_string(),
            })?
            .to_string();
        let timeout = read_timeout(cfg, DEFAULT_TIMEOUT);
        Ok(Box::new(DnsCheck {
            resolver,
            name,
            record_type,
            expected,
            timeout,
        }))
    });
    registry
        .register(
            "dns",
            factory,
            Descriptor {
                metrics: vec![MetricDef::scaled(RESULT_KEY, "resolve_us", "Resolve time", "ms", 1000)],
                style: super::GraphStyle::Line,
                label: None,
            },
        )
        .expect("dns registered twice");
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_name_splits_and_terminates_labels() {
        let encoded = encode_name("example.com");
        assert_eq!(
            encoded,
            vec![7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 3, b'c', b'o', b'm', 0]
        );
    }

    #[test]
    fn build_query_roundtrips_header_fields() {
        let query = build_query(0xABCD, "example.com", RecordType::A);
        assert_eq!(&query[0..2], &[0xAB, 0xCD]);
        assert_eq!(u16::from_be_bytes([query[4], query[5]]), 1); // QDCOUNT
    }

    #[test]
    fn record_type_parses_case_insensitively() {
        assert_eq!(RecordType::parse("aaaa"), Some(RecordType::Aaaa));
        assert_eq!(RecordType::parse("PTR"), Some(RecordType::Ptr));
        assert_eq!(RecordType::parse("mx"), None);
    }

    #[test]
    fn formats_v4_and_v6_addresses() {
        assert_eq!(format_address(&[192, 168, 168, 1]), "192.168.168.1");
        assert_eq!(
            format_address(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]),
            "::1"
        );
    }

    /// Build a minimal response: header + echoed question + one A answer
    /// with RDATA `addr`.
    fn build_a_response(id: u16, name: &str, addr: [u8; 4]) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(&id.to_be_bytes());
        msg.extend_from_slice(&0x8180u16.to_be_bytes()); // QR=1, RA=1, RCODE=0
        msg.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
        msg.extend_from_slice(&1u16.to_be_bytes()); // ANCOUNT
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(&encode_name(name));
        msg.extend_from_slice(&1u16.to_be_bytes()); // QTYPE A
        msg.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN
        // answer: name (compressed pointer to offset 12), type, class, ttl, rdlength, rdata
        msg.extend_from_slice(&0xC00Cu16.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&60u32.to_be_bytes());
        msg.extend_from_slice(&4u16.to_be_bytes());
        msg.extend_from_slice(&addr);
        msg
    }

    #[test]
    fn validate_answers_accepts_matching_address() {
        let msg = build_a_response(1, "router.example.com", [192, 168, 168, 1]);
        let offset = skip_question(&msg).unwrap();
        validate_answers(&msg, offset, 1, RecordType::A, "192.168.168.1").unwrap();
    }

    #[test]
    fn validate_answers_rejects_mismatched_address() {
        let msg = build_a_response(1, "router.example.com", [10, 0, 0, 1]);
        let offset = skip_question(&msg).unwrap();
        let err = validate_answers(&msg, offset, 1, RecordType::A, "192.168.168.1").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("192.168.168.1"));
        assert!(msg.contains("10.0.0.1"));
    }

    #[test]
    fn factory_requires_expected_field() {
        use serde_json::json;
        let registry = Registry::new();
        register(&registry);
        let cfg = json!({"resolver": "127.0.0.1:53", "name": "router.example.com"})
            .as_object()
            .unwrap()
            .clone();
        let err = registry.create("dns", &cfg).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidConfig { .. }));
    }

    #[test]
    fn factory_builds_with_expected_field() {
        use serde_json::json;
        let registry = Registry::new();
        register(&registry);
        let cfg = json!({
            "resolver": "127.0.0.1:53",
            "name": "router.example.com",
            "expected": "192.168.168.1"
        })
        .as_object()
        .unwrap()
        .clone();
        let check = registry.create("dns", &cfg).unwrap();
        assert_eq!(check.describe().metrics.len(), 1);
    }
}
