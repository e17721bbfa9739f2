// lib.rs - SIP/SIMPLE client core: message model, wire parser and error taxonomy

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    bytes::complete::{tag, take_while1, take_while_m_n},
    character::complete::{char, digit1, space0, space1},
    combinator::{all_consuming, map_res, opt, recognize, rest},
    sequence::{preceded, separated_pair, terminated, tuple},
    IResult,
};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod auth;
pub mod client;
pub mod codec;
pub mod config;
pub mod ntlm;
pub mod presence;
pub mod registry;
pub mod resolver;
pub mod security;
pub mod session;
pub mod transaction;
pub mod transport;
pub mod utils;

pub use client::{login, ClientCommand, ClientHandle};
pub use config::AccountConfig;
pub use session::{AccountDirectory, AccountEvent, SessionState, SipSession, StaticDirectory};
pub use transport::{Transport, TransportProtocol};

// Limits applied to every inbound message before it reaches the session
pub const MAX_HEADER_LENGTH: usize = 8192;
pub const MAX_HEADERS: usize = 256;
pub const MAX_BODY_LENGTH: usize = 262_144; // roaming contact lists can be large
pub const MAX_VIA_HEADERS: usize = 70;

pub const SIP_VERSION: &str = "SIP/2.0";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SipParseError {
    #[error("Incomplete message: waiting for more data")]
    Incomplete,

    #[error("Header too long: {0} bytes (max: {1})")]
    HeaderTooLong(usize, usize),

    #[error("Too many headers: {0} (max: {1})")]
    TooManyHeaders(usize, usize),

    #[error("Body too long: {0} bytes (max: {1})")]
    BodyTooLong(usize, usize),

    #[error("Invalid SIP version: {0}")]
    InvalidVersion(String),

    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Security violation: {0}")]
    SecurityViolation(String),
}

/// Errors surfaced by the session core.
///
/// `MalformedMessage`, `UnsupportedContentType` and `Timeout` are handled
/// locally and never end a session. `AuthenticationFailed` and
/// `ConnectionError` are fatal and reported to the account layer once.
#[derive(Error, Debug)]
pub enum SipError {
    #[error("Malformed message: {0}")]
    MalformedMessage(#[from] SipParseError),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Unsupported media type: {0}")]
    UnsupportedContentType(String),

    #[error("Transaction timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl SipError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SipError::AuthenticationFailed(_) | SipError::ConnectionError(_)
        )
    }
}

impl From<std::io::Error> for SipError {
    fn from(err: std::io::Error) -> Self {
        SipError::ConnectionError(err.to_string())
    }
}

pub type SipResult<T> = std::result::Result<T, SipError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Info,
    Subscribe,
    Notify,
    Refer,
    Message,
    Publish,
    Other(String),
}

impl FromStr for SipMethod {
    type Err = SipParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 32 {
            return Err(SipParseError::InvalidMethod(s.to_string()));
        }

        if !s.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(SipParseError::InvalidMethod(s.to_string()));
        }

        Ok(match s.to_uppercase().as_str() {
            "REGISTER" => SipMethod::Register,
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "BYE" => SipMethod::Bye,
            "CANCEL" => SipMethod::Cancel,
            "OPTIONS" => SipMethod::Options,
            "INFO" => SipMethod::Info,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            "REFER" => SipMethod::Refer,
            "MESSAGE" => SipMethod::Message,
            "PUBLISH" => SipMethod::Publish,
            method => SipMethod::Other(method.to_string()),
        })
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipMethod::Register => write!(f, "REGISTER"),
            SipMethod::Invite => write!(f, "INVITE"),
            SipMethod::Ack => write!(f, "ACK"),
            SipMethod::Bye => write!(f, "BYE"),
            SipMethod::Cancel => write!(f, "CANCEL"),
            SipMethod::Options => write!(f, "OPTIONS"),
            SipMethod::Info => write!(f, "INFO"),
            SipMethod::Subscribe => write!(f, "SUBSCRIBE"),
            SipMethod::Notify => write!(f, "NOTIFY"),
            SipMethod::Refer => write!(f, "REFER"),
            SipMethod::Message => write!(f, "MESSAGE"),
            SipMethod::Publish => write!(f, "PUBLISH"),
            SipMethod::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Expands RFC 3261 compact header names to their long form.
fn expand_compact(name: &str) -> &str {
    if name.len() != 1 {
        return name;
    }
    match name.as_bytes()[0].to_ascii_lowercase() {
        b'i' => "Call-ID",
        b'f' => "From",
        b't' => "To",
        b'v' => "Via",
        b'm' => "Contact",
        b'l' => "Content-Length",
        b'c' => "Content-Type",
        b'e' => "Content-Encoding",
        b'o' => "Event",
        b'u' => "Allow-Events",
        b'k' => "Supported",
        b's' => "Subject",
        _ => name,
    }
}

pub fn header_names_match(a: &str, b: &str) -> bool {
    expand_compact(a).eq_ignore_ascii_case(expand_compact(b))
}

/// Ordered header list. Duplicates are kept and lookups are
/// case-insensitive, returning the first match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| header_names_match(n, name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| header_names_match(n, name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replaces the first occurrence in place and drops the rest, or appends.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter()
            .position(|(n, _)| header_names_match(n, &name))
        {
            Some(pos) => {
                self.entries[pos].1 = value;
                let mut index = 0;
                self.entries.retain(|(n, _)| {
                    let keep = index <= pos || !header_names_match(n, &name);
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !header_names_match(n, name));
        before != self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Declared body length. The first `Content-Length` is authoritative.
    pub fn content_length(&self) -> Result<Option<usize>, SipParseError> {
        match self.get("Content-Length") {
            Some(value) => value
                .trim()
                .parse::<usize>()
                .map(Some)
                .map_err(|_| SipParseError::MalformedHeader(format!("Content-Length: {}", value))),
            None => Ok(None),
        }
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipResponse {
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl SipResponse {
    pub fn new(status_code: u16, reason_phrase: impl Into<String>) -> Self {
        Self {
            status_code,
            reason_phrase: reason_phrase.into(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(req) => &req.headers,
            SipMessage::Response(resp) => &resp.headers,
        }
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            SipMessage::Request(req) => &mut req.headers,
            SipMessage::Response(resp) => &mut resp.headers,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers().get(name)
    }

    pub fn body(&self) -> &Bytes {
        match self {
            SipMessage::Request(req) => &req.body,
            SipMessage::Response(resp) => &resp.body,
        }
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        match self {
            SipMessage::Request(req) => req.body = body.into(),
            SipMessage::Response(resp) => resp.body = body.into(),
        }
    }

    /// Sequence number and method from the CSeq header.
    pub fn cseq(&self) -> Option<(u32, SipMethod)> {
        self.header("CSeq").and_then(utils::parse_cseq)
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    /// Structural checks run on inbound traffic.
    pub fn validate(&self) -> Result<(), SipParseError> {
        if self.headers().len() > MAX_HEADERS {
            return Err(SipParseError::TooManyHeaders(
                self.headers().len(),
                MAX_HEADERS,
            ));
        }

        for header in ["From", "To", "Call-ID", "CSeq"] {
            if !self.headers().contains(header) {
                return Err(SipParseError::MalformedHeader(format!(
                    "Missing required header: {}",
                    header
                )));
            }
        }

        let via_count = self.headers().get_all("Via").count();
        if via_count > MAX_VIA_HEADERS {
            return Err(SipParseError::SecurityViolation(format!(
                "Too many Via headers: {} (max: {})",
                via_count, MAX_VIA_HEADERS
            )));
        }

        if self.cseq().is_none() {
            return Err(SipParseError::MalformedHeader(format!(
                "CSeq: {}",
                self.header("CSeq").unwrap_or_default()
            )));
        }

        Ok(())
    }

    /// Writes the wire form. `Content-Length` always reflects the body
    /// actually written: the first occurrence is rewritten in place, later
    /// ones are dropped, and one is appended if none exists.
    pub fn write_to(&self, dst: &mut BytesMut) {
        match self {
            SipMessage::Request(req) => {
                dst.put_slice(req.method.to_string().as_bytes());
                dst.put_u8(b' ');
                dst.put_slice(req.uri.as_bytes());
                dst.put_u8(b' ');
                dst.put_slice(SIP_VERSION.as_bytes());
            }
            SipMessage::Response(resp) => {
                dst.put_slice(SIP_VERSION.as_bytes());
                dst.put_slice(format!(" {} {}", resp.status_code, resp.reason_phrase).as_bytes());
            }
        }
        dst.put_slice(b"\r\n");

        let body = self.body();
        let mut length_written = false;
        for (name, value) in self.headers().iter() {
            if header_names_match(name, "Content-Length") {
                if !length_written {
                    put_header(dst, "Content-Length", &body.len().to_string());
                    length_written = true;
                }
                continue;
            }
            put_header(dst, name, value);
        }
        if !length_written {
            put_header(dst, "Content-Length", &body.len().to_string());
        }

        dst.put_slice(b"\r\n");
        dst.put_slice(body);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(512 + self.body().len());
        self.write_to(&mut dst);
        dst.freeze()
    }
}

fn put_header(dst: &mut BytesMut, name: &str, value: &str) {
    dst.put_slice(name.as_bytes());
    dst.put_slice(b": ");
    dst.put_slice(value.as_bytes());
    dst.put_slice(b"\r\n");
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipMessage::Request(req) => write!(f, "{} {}", req.method, req.uri),
            SipMessage::Response(resp) => write!(f, "{} {}", resp.status_code, resp.reason_phrase),
        }
    }
}

// Parser functions using nom
fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-.!%*_+`'~".contains(c)
}

fn parse_token(input: &str) -> IResult<&str, &str> {
    take_while1(is_token_char)(input)
}

fn parse_method(input: &str) -> IResult<&str, SipMethod> {
    map_res(parse_token, SipMethod::from_str)(input)
}

fn parse_sip_version(input: &str) -> IResult<&str, &str> {
    recognize(tuple((tag("SIP"), char('/'), digit1, char('.'), digit1)))(input)
}

fn parse_request_uri(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_ascii_whitespace())(input)
}

fn parse_request_line(input: &str) -> IResult<&str, (SipMethod, &str, &str)> {
    all_consuming(tuple((
        terminated(parse_method, space1),
        terminated(parse_request_uri, space1),
        parse_sip_version,
    )))(input)
}

fn parse_status_line(input: &str) -> IResult<&str, (&str, u16, &str)> {
    let (input, version) = terminated(parse_sip_version, space1)(input)?;
    let (input, status_code) = map_res(
        take_while_m_n(3, 3, |c: char| c.is_ascii_digit()),
        str::parse,
    )(input)?;
    let (input, reason) = all_consuming(opt(preceded(space1, rest)))(input)?;
    Ok((input, (version, status_code, reason.unwrap_or(""))))
}

fn parse_header_name(input: &str) -> IResult<&str, &str> {
    take_while1(is_token_char)(input)
}

fn parse_header_line(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(parse_header_name, tuple((space0, char(':'), space0)), rest)(input)
}

/// Locates the blank line ending the header block.
/// Returns (header text length, bytes consumed including the terminator).
pub fn find_headers_end(buf: &[u8]) -> Option<(usize, usize)> {
    for i in 0..buf.len() {
        if buf[i..].starts_with(b"\r\n\r\n") {
            return Some((i, i + 4));
        }
        if buf[i..].starts_with(b"\n\n") {
            return Some((i, i + 2));
        }
    }
    None
}

/// A parsed start line and header block, waiting for its body.
#[derive(Debug, Clone)]
pub struct MessageHead {
    pub message: SipMessage,
    /// Bytes consumed by the start line, headers and blank line.
    pub header_len: usize,
    /// First `Content-Length` value, if the header was present.
    pub content_length: Option<usize>,
}

impl MessageHead {
    pub fn body_length(&self) -> usize {
        self.content_length.unwrap_or(0)
    }
}

/// Parses the start line and headers. Fails with `Incomplete` until the
/// blank line terminating the header block has been buffered.
pub fn parse_header(input: &[u8]) -> Result<MessageHead, SipParseError> {
    let (text_len, header_len) = match find_headers_end(input) {
        Some(found) => found,
        None if input.len() > MAX_HEADER_LENGTH => {
            return Err(SipParseError::HeaderTooLong(input.len(), MAX_HEADER_LENGTH));
        }
        None => return Err(SipParseError::Incomplete),
    };

    if text_len > MAX_HEADER_LENGTH {
        return Err(SipParseError::HeaderTooLong(text_len, MAX_HEADER_LENGTH));
    }

    let text = std::str::from_utf8(&input[..text_len])
        .map_err(|_| SipParseError::ParseError("Invalid UTF-8 in header block".to_string()))?;

    let mut lines = text.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line));
    let start_line = lines
        .next()
        .ok_or_else(|| SipParseError::ParseError("Empty message".to_string()))?;

    let mut message = parse_start_line(start_line)?;

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in lines {
        if line.starts_with(' ') || line.starts_with('\t') {
            // folded continuation of the previous header
            match headers.last_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                None => {
                    return Err(SipParseError::MalformedHeader(line.to_string()));
                }
            }
            continue;
        }

        let (_, (name, value)) = parse_header_line(line)
            .map_err(|_| SipParseError::MalformedHeader(line.to_string()))?;
        headers.push((name.to_string(), value.trim().to_string()));

        if headers.len() > MAX_HEADERS {
            return Err(SipParseError::TooManyHeaders(headers.len(), MAX_HEADERS));
        }
    }

    *message.headers_mut() = headers.into_iter().collect();
    let content_length = message.headers().content_length()?;
    if let Some(length) = content_length {
        if length > MAX_BODY_LENGTH {
            return Err(SipParseError::BodyTooLong(length, MAX_BODY_LENGTH));
        }
    }

    Ok(MessageHead {
        message,
        header_len,
        content_length,
    })
}

fn parse_start_line(line: &str) -> Result<SipMessage, SipParseError> {
    if line.starts_with("SIP/") {
        let (_, (version, status_code, reason)) = parse_status_line(line)
            .map_err(|_| SipParseError::ParseError(format!("Bad status line: {}", line)))?;
        if version != SIP_VERSION {
            return Err(SipParseError::InvalidVersion(version.to_string()));
        }
        return Ok(SipMessage::Response(SipResponse::new(status_code, reason)));
    }

    let (_, (method, uri, version)) = parse_request_line(line)
        .map_err(|_| SipParseError::ParseError(format!("Bad request line: {}", line)))?;
    if version != SIP_VERSION {
        return Err(SipParseError::InvalidVersion(version.to_string()));
    }
    Ok(SipMessage::Request(SipRequest::new(method, uri)))
}

/// Attaches exactly `length` bytes of `input` as the message body.
pub fn parse_body(
    mut message: SipMessage,
    input: &[u8],
    length: usize,
) -> Result<SipMessage, SipParseError> {
    if length > MAX_BODY_LENGTH {
        return Err(SipParseError::BodyTooLong(length, MAX_BODY_LENGTH));
    }
    if input.len() < length {
        return Err(SipParseError::Incomplete);
    }
    message.set_body(Bytes::copy_from_slice(&input[..length]));
    Ok(message)
}

/// Parses one complete message, as delivered in a single datagram.
/// Without a `Content-Length` the rest of the input is the body.
pub fn parse_sip_message(input: &[u8]) -> Result<SipMessage, SipParseError> {
    if input.len() > MAX_HEADER_LENGTH + MAX_BODY_LENGTH {
        return Err(SipParseError::SecurityViolation(
            "Message too large".to_string(),
        ));
    }

    let skip = input
        .iter()
        .take_while(|b| **b == b'\r' || **b == b'\n')
        .count();
    let input = &input[skip..];

    let head = parse_header(input)?;
    let remaining = &input[head.header_len..];
    let length = head.content_length.unwrap_or(remaining.len());
    parse_body(head.message, remaining, length)
}
