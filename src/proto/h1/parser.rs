//! Incremental HTTP/1.1 response parsing.
//!
//! The connection feeds raw bytes into [`Parser::advance`] and pulls typed
//! events out: one `Headers`, zero or more `Data`, one `Complete` per
//! message, with `Informational` and `Upgrade` as the special heads. The
//! parser never reads past the current message, so pipelined responses
//! stay cleanly separated in the input buffer, and an upgrade leaves the
//! first bytes of the new protocol untouched for the handler.

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{StatusCode, Version};
use tracing::trace;

use crate::error::{Error, Parse, Result};

const MAX_HEADERS: usize = 128;
const MAX_CHUNK_SIZE_LINE: usize = 128;

/// Per-message facts the connection knows and the parser does not.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct MessageContext {
    /// The request was `HEAD`; the response has a head but no body.
    pub(crate) head_request: bool,
    /// The request asked for an upgrade, so `101` is acceptable.
    pub(crate) request_upgrade: bool,
}

/// A parsed response head.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) keep_alive: bool,
    /// Server-advertised `Keep-Alive: timeout=N`, in seconds.
    pub(crate) keep_alive_timeout: Option<Duration>,
    /// Lowercased names from the `Trailer` header.
    pub(crate) trailers_advertised: Vec<String>,
}

#[derive(Debug)]
pub(crate) enum Event {
    /// A 1xx (other than 101) head; skipped, the headers timer re-arms.
    Informational(StatusCode),
    /// The message head. Body events follow.
    Headers(ResponseHead),
    /// One chunk of body data.
    Data(Bytes),
    /// The message finished. Trailers are empty unless the body was chunked
    /// and the server sent some.
    Complete { trailers: HeaderMap },
    /// `101 Switching Protocols` for an upgrade request. The parser stops;
    /// whatever remains in the input buffer belongs to the new protocol.
    Upgrade(ResponseHead),
}

enum State {
    Head,
    Body(Decoder),
    Upgraded,
}

enum Decoder {
    /// Identity framing with `remaining` bytes to go.
    Length(u64),
    /// Chunked framing.
    Chunked(ChunkState),
    /// Everything until EOF is body.
    Eof,
}

enum ChunkState {
    Size,
    Data(u64),
    DataCrlf,
    Trailers,
}

pub(crate) struct Parser {
    state: State,
    max_header_size: usize,
}

impl Parser {
    pub(crate) fn new(max_header_size: usize) -> Parser {
        Parser {
            state: State::Head,
            max_header_size,
        }
    }

    /// True when the parser sits between messages.
    pub(crate) fn is_idle(&self) -> bool {
        matches!(self.state, State::Head)
    }

    /// True when the current message is EOF-delimited.
    pub(crate) fn is_eof_body(&self) -> bool {
        matches!(self.state, State::Body(Decoder::Eof))
    }

    /// Pull the next event out of `buf`. `Ok(None)` means more input is
    /// needed. `eof` marks that the peer half-closed; it completes an
    /// EOF-delimited body and is otherwise ignored (the connection decides
    /// what a premature EOF means for the in-flight request).
    pub(crate) fn advance(
        &mut self,
        buf: &mut BytesMut,
        eof: bool,
        ctx: MessageContext,
    ) -> Result<Option<Event>> {
        match self.state {
            State::Head => self.parse_head(buf, ctx),
            State::Body(ref mut decoder) => match decoder {
                Decoder::Length(remaining) => {
                    if *remaining == 0 {
                        self.state = State::Head;
                        return Ok(Some(Event::Complete {
                            trailers: HeaderMap::new(),
                        }));
                    }
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let take = std::cmp::min(buf.len() as u64, *remaining) as usize;
                    *remaining -= take as u64;
                    let chunk = buf.split_to(take).freeze();
                    Ok(Some(Event::Data(chunk)))
                }
                Decoder::Chunked(_) => self.parse_chunked(buf),
                Decoder::Eof => {
                    if !buf.is_empty() {
                        let chunk = buf.split_to(buf.len()).freeze();
                        return Ok(Some(Event::Data(chunk)));
                    }
                    if eof {
                        self.state = State::Head;
                        return Ok(Some(Event::Complete {
                            trailers: HeaderMap::new(),
                        }));
                    }
                    Ok(None)
                }
            },
            State::Upgraded => Ok(None),
        }
    }

    fn parse_head(&mut self, buf: &mut BytesMut, ctx: MessageContext) -> Result<Option<Event>> {
        if buf.is_empty() {
            return Ok(None);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut headers);

        let head_len = match res.parse(buf.as_ref()) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                if buf.len() > self.max_header_size {
                    return Err(Error::new_headers_overflow());
                }
                return Ok(None);
            }
            Err(e) => return Err(Error::new_parse(e.into())),
        };

        if head_len > self.max_header_size {
            return Err(Error::new_headers_overflow());
        }

        let code = res.code.ok_or(Parse::Status)?;
        let status = StatusCode::from_u16(code).map_err(|_| Parse::Status)?;
        let version = match res.version {
            Some(0) => Version::HTTP_10,
            Some(1) => Version::HTTP_11,
            _ => return Err(Error::new_parse(Parse::Version)),
        };

        let mut map = HeaderMap::with_capacity(res.headers.len());
        for header in res.headers.iter() {
            let name =
                HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| Parse::Token)?;
            let value = HeaderValue::from_bytes(header.value).map_err(|_| Parse::Token)?;
            map.append(name, value);
        }

        buf.advance(head_len);
        trace!(status = code, "parsed response head");

        if status.is_informational() {
            if status == StatusCode::SWITCHING_PROTOCOLS {
                if !ctx.request_upgrade {
                    return Err(Error::new_parse(Parse::UnexpectedUpgrade));
                }
                let head = Self::finish_head(status, version, map);
                self.state = State::Upgraded;
                return Ok(Some(Event::Upgrade(head)));
            }
            // Informational heads carry no body; stay in the head state for
            // the real response.
            return Ok(Some(Event::Informational(status)));
        }

        let head = Self::finish_head(status, version, map);

        let decoder = if ctx.head_request
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            Decoder::Length(0)
        } else if is_chunked(&head.headers) {
            Decoder::Chunked(ChunkState::Size)
        } else if let Some(len) = content_length(&head.headers)? {
            Decoder::Length(len)
        } else {
            Decoder::Eof
        };

        let mut head = head;
        if matches!(decoder, Decoder::Eof) {
            // No framing at all: the close delimits the message.
            head.keep_alive = false;
        }

        self.state = State::Body(decoder);
        Ok(Some(Event::Headers(head)))
    }

    fn finish_head(status: StatusCode, version: Version, headers: HeaderMap) -> ResponseHead {
        let keep_alive = if version == Version::HTTP_11 {
            !connection_has(&headers, "close")
        } else {
            connection_has(&headers, "keep-alive")
        };
        let keep_alive_timeout = keep_alive_timeout(&headers);
        let trailers_advertised = headers
            .get_all(http::header::TRAILER)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|name| name.trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .collect();

        ResponseHead {
            status,
            version,
            headers,
            keep_alive,
            keep_alive_timeout,
            trailers_advertised,
        }
    }

    fn parse_chunked(&mut self, buf: &mut BytesMut) -> Result<Option<Event>> {
        loop {
            let chunk_state = match self.state {
                State::Body(Decoder::Chunked(ref mut state)) => state,
                _ => unreachable!("parse_chunked outside chunked body"),
            };
            match chunk_state {
                ChunkState::Size => {
                    let line_end = match find_crlf(buf) {
                        Some(pos) => pos,
                        None => {
                            if buf.len() > MAX_CHUNK_SIZE_LINE {
                                return Err(Error::new_parse(Parse::ChunkSize));
                            }
                            return Ok(None);
                        }
                    };
                    let size = {
                        let line = &buf[..line_end];
                        let text =
                            std::str::from_utf8(line).map_err(|_| Parse::ChunkSize)?;
                        // Chunk extensions are tolerated and discarded.
                        let hex = text.split(';').next().unwrap_or("").trim();
                        u64::from_str_radix(hex, 16).map_err(|_| Parse::ChunkSize)?
                    };
                    buf.advance(line_end + 2);
                    if size == 0 {
                        *chunk_state = ChunkState::Trailers;
                    } else {
                        *chunk_state = ChunkState::Data(size);
                    }
                }
                ChunkState::Data(remaining) => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let take = std::cmp::min(buf.len() as u64, *remaining) as usize;
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        *chunk_state = ChunkState::DataCrlf;
                    }
                    let chunk = buf.split_to(take).freeze();
                    return Ok(Some(Event::Data(chunk)));
                }
                ChunkState::DataCrlf => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(Error::new_parse(Parse::ChunkSize));
                    }
                    buf.advance(2);
                    *chunk_state = ChunkState::Size;
                }
                ChunkState::Trailers => {
                    // The trailer section ends with an empty line, which may
                    // come immediately.
                    if buf.len() >= 2 && &buf[..2] == b"\r\n" {
                        buf.advance(2);
                        self.state = State::Head;
                        return Ok(Some(Event::Complete {
                            trailers: HeaderMap::new(),
                        }));
                    }
                    let end = match find_double_crlf(buf) {
                        Some(pos) => pos,
                        None => {
                            if buf.len() > self.max_header_size {
                                return Err(Error::new_headers_overflow());
                            }
                            return Ok(None);
                        }
                    };
                    let trailers = parse_trailers(&buf[..end + 4])?;
                    buf.advance(end + 4);
                    self.state = State::Head;
                    return Ok(Some(Event::Complete { trailers }));
                }
            }
        }
    }
}

fn connection_has(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn is_chunked(headers: &HeaderMap) -> bool {
    // The last transfer-encoding must be chunked for the body to be
    // chunk-delimited.
    headers
        .get_all(http::header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .last()
        .map(|t| t.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
    let mut length: Option<u64> = None;
    for value in headers.get_all(http::header::CONTENT_LENGTH).iter() {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or(Parse::ContentLengthInvalid)?;
        if let Some(prev) = length {
            if prev != parsed {
                return Err(Error::new_parse(Parse::ContentLengthInvalid));
            }
        }
        length = Some(parsed);
    }
    Ok(length)
}

fn keep_alive_timeout(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get("keep-alive")?.to_str().ok()?;
    for part in value.split(',') {
        let mut kv = part.splitn(2, '=');
        let key = kv.next()?.trim();
        if key.eq_ignore_ascii_case("timeout") {
            let secs = kv.next()?.trim().parse::<u64>().ok()?;
            return Some(Duration::from_secs(secs));
        }
    }
    None
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_trailers(raw: &[u8]) -> Result<HeaderMap> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let (_, parsed) = match httparse::parse_headers(raw, &mut headers) {
        Ok(httparse::Status::Complete(done)) => done,
        Ok(httparse::Status::Partial) => return Err(Error::new_parse(Parse::Internal)),
        Err(e) => return Err(Error::new_parse(e.into())),
    };
    let mut map = HeaderMap::with_capacity(parsed.len());
    for header in parsed {
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| Parse::Token)?;
        let value = HeaderValue::from_bytes(header.value).map_err(|_| Parse::Token)?;
        map.append(name, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> Parser {
        Parser::new(16 * 1024)
    }

    fn advance_all(parser: &mut Parser, input: &[u8], ctx: MessageContext) -> Vec<Event> {
        let mut buf = BytesMut::from(input);
        let mut events = Vec::new();
        while let Some(event) = parser.advance(&mut buf, false, ctx).unwrap() {
            events.push(event);
        }
        events
    }

    #[test]
    fn simple_content_length_response() {
        let mut parser = parser();
        let events = advance_all(
            &mut parser,
            b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello",
            MessageContext::default(),
        );
        assert_eq!(events.len(), 3);
        match &events[0] {
            Event::Headers(head) => {
                assert_eq!(head.status, StatusCode::OK);
                assert!(head.keep_alive);
            }
            other => panic!("expected headers, got {:?}", other),
        }
        match &events[1] {
            Event::Data(chunk) => assert_eq!(&chunk[..], b"hello"),
            other => panic!("expected data, got {:?}", other),
        }
        assert!(matches!(events[2], Event::Complete { .. }));
        assert!(parser.is_idle());
    }

    #[test]
    fn head_arrives_in_pieces() {
        let mut parser = parser();
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\ncontent-"[..]);
        assert!(parser
            .advance(&mut buf, false, MessageContext::default())
            .unwrap()
            .is_none());
        buf.extend_from_slice(b"length: 0\r\n\r\n");
        let event = parser
            .advance(&mut buf, false, MessageContext::default())
            .unwrap()
            .unwrap();
        assert!(matches!(event, Event::Headers(_)));
        let event = parser
            .advance(&mut buf, false, MessageContext::default())
            .unwrap()
            .unwrap();
        assert!(matches!(event, Event::Complete { .. }));
    }

    #[test]
    fn chunked_with_trailers() {
        let mut parser = parser();
        let events = advance_all(
            &mut parser,
            b"HTTP/1.1 200 OK\r\ntrailer: x-checksum\r\ntransfer-encoding: chunked\r\n\r\n\
              5\r\nhello\r\n0\r\nx-checksum: abc\r\n\r\n",
            MessageContext::default(),
        );
        assert_eq!(events.len(), 3);
        match &events[0] {
            Event::Headers(head) => {
                assert_eq!(head.trailers_advertised, vec!["x-checksum".to_string()]);
            }
            other => panic!("expected headers, got {:?}", other),
        }
        match &events[2] {
            Event::Complete { trailers } => {
                assert_eq!(trailers.get("x-checksum").unwrap(), "abc");
            }
            other => panic!("expected complete, got {:?}", other),
        }
    }

    #[test]
    fn chunked_without_trailers() {
        let mut parser = parser();
        let events = advance_all(
            &mut parser,
            b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n",
            MessageContext::default(),
        );
        assert_eq!(events.len(), 3);
        match &events[1] {
            Event::Data(chunk) => assert_eq!(&chunk[..], b"abc"),
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[test]
    fn pipelined_responses_stay_separate() {
        let mut parser = parser();
        let mut buf = BytesMut::from(
            &b"HTTP/1.1 200 OK\r\ncontent-length: 1\r\n\r\naHTTP/1.1 204 No Content\r\n\r\n"[..],
        );
        let ctx = MessageContext::default();

        assert!(matches!(
            parser.advance(&mut buf, false, ctx).unwrap().unwrap(),
            Event::Headers(_)
        ));
        assert!(matches!(
            parser.advance(&mut buf, false, ctx).unwrap().unwrap(),
            Event::Data(_)
        ));
        assert!(matches!(
            parser.advance(&mut buf, false, ctx).unwrap().unwrap(),
            Event::Complete { .. }
        ));
        match parser.advance(&mut buf, false, ctx).unwrap().unwrap() {
            Event::Headers(head) => assert_eq!(head.status, StatusCode::NO_CONTENT),
            other => panic!("expected headers, got {:?}", other),
        }
        assert!(matches!(
            parser.advance(&mut buf, false, ctx).unwrap().unwrap(),
            Event::Complete { .. }
        ));
    }

    #[test]
    fn head_request_skips_body() {
        let mut parser = parser();
        let ctx = MessageContext {
            head_request: true,
            ..Default::default()
        };
        let events = advance_all(
            &mut parser,
            b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\n",
            ctx,
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Event::Complete { .. }));
    }

    #[test]
    fn eof_delimited_body() {
        let mut parser = parser();
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\n\r\nsome data"[..]);
        let ctx = MessageContext::default();

        match parser.advance(&mut buf, false, ctx).unwrap().unwrap() {
            Event::Headers(head) => assert!(!head.keep_alive),
            other => panic!("expected headers, got {:?}", other),
        }
        assert!(matches!(
            parser.advance(&mut buf, false, ctx).unwrap().unwrap(),
            Event::Data(_)
        ));
        assert!(parser.advance(&mut buf, false, ctx).unwrap().is_none());
        assert!(matches!(
            parser.advance(&mut buf, true, ctx).unwrap().unwrap(),
            Event::Complete { .. }
        ));
    }

    #[test]
    fn informational_then_final() {
        let mut parser = parser();
        let events = advance_all(
            &mut parser,
            b"HTTP/1.1 102 Processing\r\n\r\nHTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n",
            MessageContext::default(),
        );
        assert!(matches!(events[0], Event::Informational(_)));
        assert!(matches!(events[1], Event::Headers(_)));
        assert!(matches!(events[2], Event::Complete { .. }));
    }

    #[test]
    fn unrequested_101_is_fatal() {
        let mut parser = parser();
        let mut buf = BytesMut::from(&b"HTTP/1.1 101 Switching Protocols\r\n\r\n"[..]);
        let err = parser
            .advance(&mut buf, false, MessageContext::default())
            .unwrap_err();
        assert_eq!(err.code(), "HPE_UNEXPECTED_UPGRADE");
    }

    #[test]
    fn requested_101_leaves_tail_bytes() {
        let mut parser = parser();
        let ctx = MessageContext {
            request_upgrade: true,
            ..Default::default()
        };
        let mut buf =
            BytesMut::from(&b"HTTP/1.1 101 Switching Protocols\r\nupgrade: x\r\n\r\nfirst!"[..]);
        match parser.advance(&mut buf, false, ctx).unwrap().unwrap() {
            Event::Upgrade(head) => assert_eq!(head.status, StatusCode::SWITCHING_PROTOCOLS),
            other => panic!("expected upgrade, got {:?}", other),
        }
        assert_eq!(&buf[..], b"first!");
        assert!(parser.advance(&mut buf, false, ctx).unwrap().is_none());
    }

    #[test]
    fn header_overflow() {
        let mut parser = Parser::new(64);
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\n"[..]);
        buf.extend_from_slice(b"x-padding: ");
        buf.extend_from_slice(&[b'a'; 128]);
        let err = parser
            .advance(&mut buf, false, MessageContext::default())
            .unwrap_err();
        assert_eq!(err.code(), "UND_ERR_HEADERS_OVERFLOW");
    }

    #[test]
    fn bad_chunk_size() {
        let mut parser = parser();
        let mut buf = BytesMut::from(
            &b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\nzz\r\n"[..],
        );
        let ctx = MessageContext::default();
        parser.advance(&mut buf, false, ctx).unwrap();
        let err = parser.advance(&mut buf, false, ctx).unwrap_err();
        assert_eq!(err.code(), "HPE_INVALID_CHUNK_SIZE");
    }

    #[test]
    fn conflicting_content_lengths() {
        let mut parser = parser();
        let mut buf = BytesMut::from(
            &b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\ncontent-length: 6\r\n\r\n"[..],
        );
        let err = parser
            .advance(&mut buf, false, MessageContext::default())
            .unwrap_err();
        assert_eq!(err.code(), "HPE_INVALID_CONTENT_LENGTH");
    }

    #[test]
    fn keep_alive_timeout_parsed() {
        let mut parser = parser();
        let events = advance_all(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nkeep-alive: timeout=5, max=100\r\ncontent-length: 0\r\n\r\n",
            MessageContext::default(),
        );
        match &events[0] {
            Event::Headers(head) => {
                assert_eq!(head.keep_alive_timeout, Some(Duration::from_secs(5)));
            }
            other => panic!("expected headers, got {:?}", other),
        }
    }

    #[test]
    fn http_10_defaults_to_close() {
        let mut parser = parser();
        let events = advance_all(
            &mut parser,
            b"HTTP/1.0 200 OK\r\ncontent-length: 0\r\n\r\n",
            MessageContext::default(),
        );
        match &events[0] {
            Event::Headers(head) => assert!(!head.keep_alive),
            other => panic!("expected headers, got {:?}", other),
        }
    }
}
