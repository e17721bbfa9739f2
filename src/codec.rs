// codec.rs - Tokio codec for SIP message framing on stream transports

use crate::{
    parse_body, parse_header, SipError, SipMessage, SipParseError, MAX_BODY_LENGTH,
    MAX_HEADER_LENGTH,
};
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

const INPUT_CHUNK: usize = 4096;

/// SIP codec for framing messages over TCP.
/// Message boundaries come from the blank line and `Content-Length`.
pub struct SipCodec {
    max_message_size: usize,
    state: CodecState,
}

#[derive(Debug)]
enum CodecState {
    Headers,
    /// Headers consumed, waiting for `length` body bytes.
    Body { message: SipMessage, length: usize },
}

impl Default for SipCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl SipCodec {
    pub fn new() -> Self {
        Self::with_max_message_size(MAX_HEADER_LENGTH + MAX_BODY_LENGTH)
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            state: CodecState::Headers,
        }
    }

    pub fn reset(&mut self) {
        self.state = CodecState::Headers;
    }
}

impl Decoder for SipCodec {
    type Item = SipMessage;
    type Error = SipError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match std::mem::replace(&mut self.state, CodecState::Headers) {
                CodecState::Headers => {
                    // CRLF between messages is keepalive noise
                    let skip = buf
                        .iter()
                        .take_while(|b| **b == b'\r' || **b == b'\n')
                        .count();
                    buf.advance(skip);
                    if buf.is_empty() {
                        return Ok(None);
                    }

                    let head = match parse_header(&buf[..]) {
                        Ok(head) => head,
                        Err(SipParseError::Incomplete) => return Ok(None),
                        Err(e) => return Err(e.into()),
                    };

                    let length = head.body_length();
                    let total_len = head.header_len + length;
                    if total_len > self.max_message_size {
                        return Err(SipParseError::SecurityViolation(format!(
                            "Message too large: {} bytes",
                            total_len
                        ))
                        .into());
                    }

                    buf.advance(head.header_len);
                    self.state = CodecState::Body {
                        message: head.message,
                        length,
                    };
                }

                CodecState::Body { message, length } => {
                    if buf.len() < length {
                        buf.reserve(length - buf.len());
                        self.state = CodecState::Body { message, length };
                        return Ok(None);
                    }

                    let message = parse_body(message, &buf[..], length)?;
                    buf.advance(length);
                    debug!("Decoded {} with {} byte body", message, length);
                    return Ok(Some(message));
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(message) => Ok(Some(message)),
            None if buf.is_empty() && matches!(self.state, CodecState::Headers) => Ok(None),
            None => Err(SipError::ConnectionError(
                "Incomplete SIP message at EOF".to_string(),
            )),
        }
    }
}

impl Encoder<SipMessage> for SipCodec {
    type Error = SipError;

    fn encode(&mut self, message: SipMessage, buf: &mut BytesMut) -> Result<(), Self::Error> {
        buf.reserve(512 + message.body().len());
        message.write_to(buf);
        Ok(())
    }
}

/// Per-connection accumulation buffer feeding the codec.
pub struct InputBuffer {
    buf: BytesMut,
    codec: SipCodec,
}

impl Default for InputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl InputBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INPUT_CHUNK),
            codec: SipCodec::new(),
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Spare capacity for a direct socket read.
    pub fn read_buf(&mut self) -> &mut BytesMut {
        if self.buf.capacity() - self.buf.len() < INPUT_CHUNK {
            self.buf.reserve(INPUT_CHUNK);
        }
        &mut self.buf
    }

    /// Next complete message. A framing error discards everything buffered,
    /// since the stream cannot be resynchronised.
    pub fn next_message(&mut self) -> Result<Option<SipMessage>, SipError> {
        match self.codec.decode(&mut self.buf) {
            Ok(message) => Ok(message),
            Err(e) => {
                warn!("Dropping {} buffered bytes: {}", self.buf.len(), e);
                self.buf.clear();
                self.codec.reset();
                Err(e)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
