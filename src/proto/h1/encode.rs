//! Request serialization.
//!
//! The head is serialized in one shot; the final blank line is deliberately
//! left off so the body framing can supply it. The chunked framing writes
//! each chunk prefix as `\r\n<hex>\r\n`, so the first prefix doubles as the
//! head terminator, and the message ends with `\r\n0\r\n\r\n`.

use bytes::{BufMut, BytesMut};

use crate::request::QueuedRequest;

/// Terminates a chunked request body.
pub(crate) const CHUNKED_TERMINATOR: &[u8] = b"\r\n0\r\n\r\n";

/// Serialize the request line and header section, without the terminating
/// blank line.
pub(crate) fn encode_head(
    dst: &mut BytesMut,
    req: &QueuedRequest,
    pipelining: usize,
    host: &str,
) {
    dst.reserve(256);
    dst.put_slice(req.method.as_str().as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(req.path.as_bytes());
    dst.put_slice(b" HTTP/1.1\r\n");

    if let Some(ref proto) = req.upgrade {
        dst.put_slice(b"connection: upgrade\r\nupgrade: ");
        dst.put_slice(proto.as_bytes());
        dst.put_slice(b"\r\n");
    } else if pipelining > 0 {
        dst.put_slice(b"connection: keep-alive\r\n");
    } else {
        dst.put_slice(b"connection: close\r\n");
    }

    let headers = req.headers.as_ref();

    let has_host = headers.map(|h| h.contains_key(http::header::HOST)).unwrap_or(false);
    if !has_host {
        dst.put_slice(b"host: ");
        dst.put_slice(host.as_bytes());
        dst.put_slice(b"\r\n");
    }

    if let Some(headers) = headers {
        for (name, value) in headers.iter() {
            dst.put_slice(name.as_str().as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(b"\r\n");
        }
    }
}

/// Terminate the head of a request with no body.
///
/// A payload-bearing method gets an explicit zero content-length; anything
/// else gets the bare blank line.
pub(crate) fn encode_no_body(dst: &mut BytesMut, expects_payload: bool) {
    if expects_payload {
        dst.put_slice(b"content-length: 0\r\n\r\n\r\n");
    } else {
        dst.put_slice(b"\r\n");
    }
}

/// Emit `content-length: N` plus the blank line that ends the head.
pub(crate) fn encode_content_length(dst: &mut BytesMut, len: u64) {
    dst.put_slice(b"content-length: ");
    dst.put_slice(len.to_string().as_bytes());
    dst.put_slice(b"\r\n\r\n");
}

/// Announce chunked transfer encoding. The head stays unterminated; the
/// first chunk frame closes it.
pub(crate) fn encode_chunked_start(dst: &mut BytesMut) {
    dst.put_slice(b"transfer-encoding: chunked\r\n");
}

/// Frame one chunk of a chunked body.
pub(crate) fn encode_chunk_frame(dst: &mut BytesMut, len: usize) {
    dst.put_slice(b"\r\n");
    let mut hex = [0u8; 16];
    let mut i = hex.len();
    let mut n = len;
    loop {
        i -= 1;
        hex[i] = b"0123456789abcdef"[n & 0xf];
        n >>= 4;
        if n == 0 {
            break;
        }
    }
    dst.put_slice(&hex[i..]);
    dst.put_slice(b"\r\n");
}
