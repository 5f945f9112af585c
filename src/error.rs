use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can fail with `elva::Error`.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while dispatching requests.
///
/// Every error carries a stable machine-readable identifier, available via
/// [`Error::code`]. The `Display` output is human oriented and may change
/// between releases; the code will not.
///
/// # Source
///
/// An `Error` may be caused by another error. To aid debugging, those are
/// exposed in `Error::source()` as erased types. Do not depend on their
/// exact types.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
    message: Option<String>,
}

#[derive(Clone, Debug)]
pub(crate) enum Kind {
    /// Invalid request options, URL, or headers.
    InvalidArg,
    /// The client was closed before or while this request was queued.
    Closed,
    /// The client was destroyed before or while this request was queued.
    Destroyed,
    /// The request was aborted by its abort signal.
    Aborted,
    /// A socket-level failure: connect refused, reset mid-flight, EOF.
    Socket,
    /// A non-error teardown reason surfaced as an error value, e.g. the
    /// connection was handed off after an upgrade.
    Informational,
    /// No response byte arrived within the headers timeout.
    HeadersTimeout,
    /// No body chunk arrived within the body timeout.
    BodyTimeout,
    /// The socket or TLS handshake did not complete in time.
    ConnectTimeout,
    /// The keep-alive idle deadline elapsed.
    Timeout,
    /// The response header section exceeded `max_header_size`.
    HeadersOverflow,
    /// Trailing headers did not match the advertised `Trailer` names.
    TrailerMismatch,
    /// The body diverged from the declared `content-length`.
    ContentLengthMismatch,
    /// A request feature this client does not implement (e.g. `CONNECT`).
    NotSupported,
    /// The response bytes violated HTTP/1.1 framing.
    Parse(Parse),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Parse {
    Status,
    Version,
    Token,
    TooManyHeaders,
    ChunkSize,
    ContentLengthInvalid,
    UnexpectedUpgrade,
    Internal,
}

// ===== impl Error =====

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl {
                kind,
                cause: None,
                message: None,
            }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn message<S: Into<String>>(mut self, message: S) -> Error {
        self.inner.message = Some(message.into());
        self
    }

    /// Returns the stable identifier for this error.
    ///
    /// These strings are part of the public contract and will not change.
    pub fn code(&self) -> &'static str {
        match self.inner.kind {
            Kind::InvalidArg => "UND_ERR_INVALID_ARG",
            Kind::Closed => "UND_ERR_CLOSED",
            Kind::Destroyed => "UND_ERR_DESTROYED",
            Kind::Aborted => "UND_ERR_ABORTED",
            Kind::Socket => "UND_ERR_SOCKET",
            Kind::Informational => "UND_ERR_INFO",
            Kind::HeadersTimeout => "UND_ERR_HEADERS_TIMEOUT",
            Kind::BodyTimeout => "UND_ERR_BODY_TIMEOUT",
            Kind::ConnectTimeout => "UND_ERR_CONNECT_TIMEOUT",
            Kind::Timeout => "UND_ERR_TIMEOUT",
            Kind::HeadersOverflow => "UND_ERR_HEADERS_OVERFLOW",
            Kind::TrailerMismatch => "UND_ERR_TRAILER_MISMATCH",
            Kind::ContentLengthMismatch => "UND_ERR_CONTENT_LENGTH_MISMATCH",
            Kind::NotSupported => "UND_ERR_NOT_SUPPORTED",
            Kind::Parse(parse) => match parse {
                Parse::Status => "HPE_INVALID_STATUS",
                Parse::Version => "HPE_INVALID_VERSION",
                Parse::Token => "HPE_INVALID_HEADER_TOKEN",
                Parse::TooManyHeaders => "HPE_HEADER_OVERFLOW",
                Parse::ChunkSize => "HPE_INVALID_CHUNK_SIZE",
                Parse::ContentLengthInvalid => "HPE_INVALID_CONTENT_LENGTH",
                Parse::UnexpectedUpgrade => "HPE_UNEXPECTED_UPGRADE",
                Parse::Internal => "HPE_INTERNAL",
            },
        }
    }

    /// Returns true if this was caused by invalid request arguments.
    pub fn is_invalid_arg(&self) -> bool {
        matches!(self.inner.kind, Kind::InvalidArg)
    }

    /// Returns true if the request was rejected because the client closed.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::Closed)
    }

    /// Returns true if the request was rejected because the client was
    /// destroyed.
    pub fn is_destroyed(&self) -> bool {
        matches!(self.inner.kind, Kind::Destroyed)
    }

    /// Returns true if the request was aborted by its signal.
    pub fn is_aborted(&self) -> bool {
        matches!(self.inner.kind, Kind::Aborted)
    }

    /// Returns true if this is a socket-level error.
    pub fn is_socket(&self) -> bool {
        matches!(self.inner.kind, Kind::Socket)
    }

    /// Returns true if this error was caused by any of the per-phase
    /// timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::HeadersTimeout | Kind::BodyTimeout | Kind::ConnectTimeout | Kind::Timeout
        )
    }

    /// Returns true if the response violated HTTP/1.1 framing.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if the written body did not match its declared length.
    pub fn is_content_length_mismatch(&self) -> bool {
        matches!(self.inner.kind, Kind::ContentLengthMismatch)
    }

    pub(crate) fn new_invalid_arg(msg: &str) -> Error {
        Error::new(Kind::InvalidArg).message(msg)
    }

    pub(crate) fn new_closed() -> Error {
        Error::new(Kind::Closed)
    }

    pub(crate) fn new_destroyed() -> Error {
        Error::new(Kind::Destroyed)
    }

    pub(crate) fn new_aborted() -> Error {
        Error::new(Kind::Aborted)
    }

    pub(crate) fn new_socket(msg: &str) -> Error {
        Error::new(Kind::Socket).message(msg)
    }

    pub(crate) fn new_socket_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Socket).with(cause)
    }

    pub(crate) fn new_info(msg: &str) -> Error {
        Error::new(Kind::Informational).message(msg)
    }

    pub(crate) fn new_headers_timeout() -> Error {
        Error::new(Kind::HeadersTimeout)
    }

    pub(crate) fn new_body_timeout() -> Error {
        Error::new(Kind::BodyTimeout)
    }

    pub(crate) fn new_connect_timeout() -> Error {
        Error::new(Kind::ConnectTimeout)
    }

    pub(crate) fn new_idle_timeout() -> Error {
        Error::new(Kind::Timeout)
    }

    pub(crate) fn new_headers_overflow() -> Error {
        Error::new(Kind::HeadersOverflow)
    }

    pub(crate) fn new_trailer_mismatch() -> Error {
        Error::new(Kind::TrailerMismatch)
    }

    pub(crate) fn new_content_length_mismatch() -> Error {
        Error::new(Kind::ContentLengthMismatch)
    }

    pub(crate) fn new_not_supported(msg: &str) -> Error {
        Error::new(Kind::NotSupported).message(msg)
    }

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    /// A same-kind copy for fanning one failure out to several handlers.
    /// The cause chain stays with the original; copies keep the rendered
    /// message.
    pub(crate) fn clone_shallow(&self) -> Error {
        Error::new(self.inner.kind.clone()).message(self.description())
    }

    pub(crate) fn find_source<E: StdError + 'static>(&self) -> Option<&E> {
        let mut cause = self.source();
        while let Some(err) = cause {
            if let Some(typed) = err.downcast_ref() {
                return Some(typed);
            }
            cause = err.source();
        }

        None
    }

    fn description(&self) -> &str {
        if let Some(ref msg) = self.inner.message {
            return msg;
        }
        match self.inner.kind {
            Kind::InvalidArg => "invalid argument",
            Kind::Closed => "the client is closed",
            Kind::Destroyed => "the client is destroyed",
            Kind::Aborted => "request aborted",
            Kind::Socket => "socket error",
            Kind::Informational => "request reset",
            Kind::HeadersTimeout => "headers timeout",
            Kind::BodyTimeout => "body timeout",
            Kind::ConnectTimeout => "connect timeout",
            Kind::Timeout => "socket idle timeout",
            Kind::HeadersOverflow => "header section exceeds maximum size",
            Kind::TrailerMismatch => "trailers did not match Trailer header",
            Kind::ContentLengthMismatch => "request body length did not match content-length",
            Kind::NotSupported => "not supported",
            Kind::Parse(Parse::Status) => "invalid HTTP status-code parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Token) => "invalid HTTP header parsed",
            Kind::Parse(Parse::TooManyHeaders) => "message header is too large",
            Kind::Parse(Parse::ChunkSize) => "invalid chunk size parsed",
            Kind::Parse(Parse::ContentLengthInvalid) => "invalid content-length parsed",
            Kind::Parse(Parse::UnexpectedUpgrade) => "received unexpected upgrade response",
            Kind::Parse(Parse::Internal) => "internal parser error, please report",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("elva::Error");
        f.field(&self.inner.kind);
        if let Some(ref msg) = self.inner.message {
            f.field(msg);
        }
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<httparse::Error> for Parse {
    fn from(err: httparse::Error) -> Parse {
        match err {
            httparse::Error::HeaderName
            | httparse::Error::HeaderValue
            | httparse::Error::NewLine
            | httparse::Error::Token => Parse::Token,
            httparse::Error::Status => Parse::Status,
            httparse::Error::TooManyHeaders => Parse::TooManyHeaders,
            httparse::Error::Version => Parse::Version,
        }
    }
}

impl From<Parse> for Error {
    fn from(parse: Parse) -> Error {
        Error::new_parse(parse)
    }
}
