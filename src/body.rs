//! Request bodies.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;

type BoxStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'static>>;

/// A request body.
///
/// Bodies come in three shapes: none at all, a single buffer written under
/// one cork, or a lazy stream of chunks with back-pressure. Streams are
/// finite and non-restartable; a request carrying one is never pipelined
/// alongside others and never retried after a connection loss.
pub struct Body {
    kind: Kind,
}

enum Kind {
    Empty,
    Full(Bytes),
    Stream {
        /// Declared length, if the caller knows it. `None` selects chunked
        /// transfer encoding.
        length: Option<u64>,
        stream: BoxStream,
    },
}

impl Body {
    /// An empty body.
    pub fn empty() -> Body {
        Body { kind: Kind::Empty }
    }

    /// A body from a single buffer, written with a known `content-length`.
    pub fn full(data: impl Into<Bytes>) -> Body {
        let data = data.into();
        if data.is_empty() {
            return Body::empty();
        }
        Body {
            kind: Kind::Full(data),
        }
    }

    /// A streaming body.
    ///
    /// If `length` is known the chunks are written under a fixed
    /// `content-length`; in strict mode any deviation fails the request.
    /// With no length the body is sent chunked.
    pub fn stream<S>(length: Option<u64>, stream: S) -> Body
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Body {
            kind: Kind::Stream {
                length,
                stream: Box::pin(stream),
            },
        }
    }

    /// Returns true if no bytes will be produced.
    pub fn is_empty(&self) -> bool {
        match self.kind {
            Kind::Empty => true,
            Kind::Full(ref b) => b.is_empty(),
            Kind::Stream { length, .. } => length == Some(0),
        }
    }

    /// Returns true for the streaming variant.
    pub fn is_stream(&self) -> bool {
        matches!(self.kind, Kind::Stream { .. })
    }

    /// The number of bytes this body will write, when known up front.
    pub fn length(&self) -> Option<u64> {
        match self.kind {
            Kind::Empty => Some(0),
            Kind::Full(ref b) => Some(b.len() as u64),
            Kind::Stream { length, .. } => length,
        }
    }

    pub(crate) fn into_kind(self) -> BodyKind {
        match self.kind {
            Kind::Empty => BodyKind::Empty,
            Kind::Full(b) => BodyKind::Full(b),
            Kind::Stream { length, stream } => BodyKind::Stream(StreamBody {
                length,
                stream,
                done: false,
            }),
        }
    }

    pub(crate) fn try_clone(&self) -> Option<Body> {
        match self.kind {
            Kind::Empty => Some(Body::empty()),
            Kind::Full(ref b) => Some(Body {
                kind: Kind::Full(b.clone()),
            }),
            Kind::Stream { .. } => None,
        }
    }
}

impl Default for Body {
    fn default() -> Body {
        Body::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Kind::Empty => f.debug_struct("Body").field("kind", &"empty").finish(),
            Kind::Full(ref b) => f
                .debug_struct("Body")
                .field("kind", &"full")
                .field("len", &b.len())
                .finish(),
            Kind::Stream { length, .. } => f
                .debug_struct("Body")
                .field("kind", &"stream")
                .field("length", &length)
                .finish(),
        }
    }
}

impl From<Bytes> for Body {
    fn from(data: Bytes) -> Body {
        Body::full(data)
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Body {
        Body::full(Bytes::from(data))
    }
}

impl From<&'static [u8]> for Body {
    fn from(data: &'static [u8]) -> Body {
        Body::full(Bytes::from_static(data))
    }
}

impl From<&'static str> for Body {
    fn from(data: &'static str) -> Body {
        Body::full(Bytes::from_static(data.as_bytes()))
    }
}

impl From<String> for Body {
    fn from(data: String) -> Body {
        Body::full(Bytes::from(data))
    }
}

// ===== internal forms used by the connection =====

pub(crate) enum BodyKind {
    Empty,
    Full(Bytes),
    Stream(StreamBody),
}

pub(crate) struct StreamBody {
    pub(crate) length: Option<u64>,
    stream: BoxStream,
    done: bool,
}

impl StreamBody {
    pub(crate) fn poll_chunk(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<io::Result<Bytes>>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.stream.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}
