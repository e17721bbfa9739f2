// utils.rs - Helper functions and utilities

use crate::{Headers, SipMethod, SipRequest, SipResponse};
use lazy_static::lazy_static;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use regex::Regex;
use std::net::SocketAddr;

lazy_static! {
    static ref TAG_REGEX: Regex = Regex::new(r"(?i);\s*tag=([^;,\s]+)").unwrap();
    static ref EXPIRES_PARAM_REGEX: Regex = Regex::new(r"(?i);\s*expires=(\d+)").unwrap();
}

fn random_alphanumeric(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generate a unique branch parameter for Via header
pub fn generate_branch() -> String {
    format!("z9hG4bK{}", random_alphanumeric(16))
}

/// Generate a unique tag
pub fn generate_tag() -> String {
    random_alphanumeric(8)
}

/// Generate a unique Call-ID
pub fn generate_call_id(domain: &str) -> String {
    format!("{}@{}", random_alphanumeric(16), domain)
}

/// Extract tag from From/To header
pub fn extract_tag(header: &str) -> Option<String> {
    TAG_REGEX
        .captures(header)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().to_string())
}

/// Extract the `expires` parameter from a Contact header
pub fn extract_expires_param(header: &str) -> Option<u32> {
    EXPIRES_PARAM_REGEX
        .captures(header)
        .and_then(|cap| cap.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Build a SIP response from a request.
///
/// Via (all of them, in order), From, To, Call-ID and CSeq are copied. A
/// To header without a tag gets `local_tag` (or a fresh one) on anything
/// but 100.
pub fn build_response_from_request(
    request: &SipRequest,
    status_code: u16,
    reason_phrase: &str,
    local_tag: Option<&str>,
) -> SipResponse {
    let mut response = SipResponse::new(status_code, reason_phrase);

    for via in request.headers.get_all("Via") {
        response.headers.push("Via", via);
    }

    if let Some(from) = request.headers.get("From") {
        response.headers.push("From", from);
    }

    if let Some(to) = request.headers.get("To") {
        if status_code != 100 && extract_tag(to).is_none() {
            let tag = local_tag
                .map(str::to_string)
                .unwrap_or_else(generate_tag);
            response.headers.push("To", format!("{};tag={}", to, tag));
        } else {
            response.headers.push("To", to);
        }
    }

    if let Some(call_id) = request.headers.get("Call-ID") {
        response.headers.push("Call-ID", call_id);
    }

    if let Some(cseq) = request.headers.get("CSeq") {
        response.headers.push("CSeq", cseq);
    }

    response
}

/// Parse a SIP URI from a header value (extracts URI from angle brackets if present)
pub fn parse_uri_from_header(header: &str) -> Option<&str> {
    if let Some(start) = header.find('<') {
        let end = header[start..].find('>')? + start;
        return Some(&header[start + 1..end]);
    }

    // bare addr-spec, parameters follow a ';'
    header
        .split(';')
        .next()
        .map(str::trim)
        .filter(|uri| !uri.is_empty())
}

/// User part of a SIP URI: `sip:alice@example.com` gives `alice`.
pub fn user_part(uri: &str) -> &str {
    let without_scheme = uri
        .strip_prefix("sip:")
        .or_else(|| uri.strip_prefix("sips:"))
        .unwrap_or(uri);
    without_scheme
        .split('@')
        .next()
        .unwrap_or(without_scheme)
}

/// Prefixes `sip:` to a bare `user@host` name.
pub fn normalize_sip_uri(name: &str) -> String {
    let name = name.trim();
    if name.starts_with("sip:") || name.starts_with("sips:") {
        name.to_string()
    } else {
        format!("sip:{}", name)
    }
}

/// Case-insensitive membership test on a comma separated header list,
/// ignoring any `;param` suffix of each item.
pub fn list_contains(value: &str, item: &str) -> bool {
    value.split(',').any(|entry| {
        entry
            .split(';')
            .next()
            .map(str::trim)
            .is_some_and(|entry| entry.eq_ignore_ascii_case(item))
    })
}

/// Format a socket address for use in Via header
pub fn format_via_address(addr: &SocketAddr, transport: &str, branch: &str) -> String {
    format!(
        "SIP/2.0/{} {};branch={}",
        transport,
        format_host_port(addr),
        branch
    )
}

pub fn format_host_port(addr: &SocketAddr) -> String {
    match addr {
        SocketAddr::V4(v4) => format!("{}:{}", v4.ip(), v4.port()),
        SocketAddr::V6(v6) => format!("[{}]:{}", v6.ip(), v6.port()),
    }
}

/// Parse CSeq header value
pub fn parse_cseq(cseq: &str) -> Option<(u32, SipMethod)> {
    let mut parts = cseq.split_whitespace();
    let seq = parts.next()?.parse::<u32>().ok()?;
    let method = parts.next()?.parse::<SipMethod>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((seq, method))
}

/// Helper to create request headers in wire order
#[derive(Default)]
pub struct HeaderBuilder {
    headers: Headers,
}

impl HeaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn via(mut self, value: &str) -> Self {
        self.headers.push("Via", value);
        self
    }

    pub fn from(mut self, uri: &str, tag: &str, epid: Option<&str>) -> Self {
        let value = match epid {
            Some(epid) => format!("<{}>;tag={};epid={}", uri, tag, epid),
            None => format!("<{}>;tag={}", uri, tag),
        };
        self.headers.push("From", value);
        self
    }

    pub fn to(mut self, uri: &str, tag: Option<&str>) -> Self {
        let value = match tag {
            Some(tag) => format!("<{}>;tag={}", uri, tag),
            None => format!("<{}>", uri),
        };
        self.headers.push("To", value);
        self
    }

    pub fn call_id(mut self, call_id: &str) -> Self {
        self.headers.push("Call-ID", call_id);
        self
    }

    pub fn cseq(mut self, seq: u32, method: &SipMethod) -> Self {
        self.headers.push("CSeq", format!("{} {}", seq, method));
        self
    }

    pub fn max_forwards(mut self, max_forwards: u32) -> Self {
        self.headers.push("Max-Forwards", max_forwards.to_string());
        self
    }

    pub fn user_agent(mut self, user_agent: &str) -> Self {
        self.headers.push("User-Agent", user_agent);
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push(name, value);
        self
    }

    pub fn headers(mut self, extra: &Headers) -> Self {
        for (name, value) in extra.iter() {
            self.headers.push(name, value);
        }
        self
    }

    pub fn build(self) -> Headers {
        self.headers
    }
}
