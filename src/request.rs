//! Request construction and validation.

use std::fmt;
use std::time::Duration;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;
use tokio_util::sync::CancellationToken;

use crate::body::{Body, BodyKind};
use crate::error::{Error, Result};

/// Header names the caller may not set; the client owns connection
/// management and framing.
const FORBIDDEN_HEADERS: &[&str] = &[
    "transfer-encoding",
    "connection",
    "keep-alive",
    "upgrade",
    "expect",
];

/// A request to dispatch.
///
/// Built with the method shortcuts ([`Request::get`] and friends) and the
/// chained setters. Validation happens at dispatch: an invalid request is
/// delivered to its handler as `on_error` with code `UND_ERR_INVALID_ARG`.
///
/// # Example
///
/// ```no_run
/// use elva::Request;
///
/// let req = Request::post("/upload")
///     .header("content-type", "application/octet-stream")
///     .body("hello");
/// ```
pub struct Request {
    inner: Result<Parts>,
}

struct Parts {
    method: Method,
    path: String,
    headers: HeaderMap,
    body: Body,
    idempotent: Option<bool>,
    upgrade: Option<String>,
    servername: Option<String>,
    headers_timeout: Option<Duration>,
    body_timeout: Option<Duration>,
    signal: Option<CancellationToken>,
}

impl Request {
    /// Start building a request with an arbitrary method.
    pub fn new(method: Method, path: impl Into<String>) -> Request {
        Request {
            inner: Ok(Parts {
                method,
                path: path.into(),
                headers: HeaderMap::new(),
                body: Body::empty(),
                idempotent: None,
                upgrade: None,
                servername: None,
                headers_timeout: None,
                body_timeout: None,
                signal: None,
            }),
        }
    }

    /// A `GET` request.
    pub fn get(path: impl Into<String>) -> Request {
        Request::new(Method::GET, path)
    }

    /// A `HEAD` request.
    pub fn head(path: impl Into<String>) -> Request {
        Request::new(Method::HEAD, path)
    }

    /// A `POST` request.
    pub fn post(path: impl Into<String>) -> Request {
        Request::new(Method::POST, path)
    }

    /// A `PUT` request.
    pub fn put(path: impl Into<String>) -> Request {
        Request::new(Method::PUT, path)
    }

    /// A `DELETE` request.
    pub fn delete(path: impl Into<String>) -> Request {
        Request::new(Method::DELETE, path)
    }

    /// Append a header.
    pub fn header<K, V>(mut self, name: K, value: V) -> Request
    where
        K: TryInto<HeaderName>,
        V: TryInto<HeaderValue>,
    {
        if let Ok(ref mut parts) = self.inner {
            match (name.try_into(), value.try_into()) {
                (Ok(name), Ok(value)) => {
                    parts.headers.append(name, value);
                }
                _ => {
                    self.inner = Err(Error::new_invalid_arg("invalid header"));
                }
            }
        }
        self
    }

    /// Set the request body.
    pub fn body(mut self, body: impl Into<Body>) -> Request {
        if let Ok(ref mut parts) = self.inner {
            parts.body = body.into();
        }
        self
    }

    /// Override idempotence. Defaults to true for `GET` and `HEAD`.
    ///
    /// Only idempotent requests are retried after a connection drops
    /// mid-pipeline, and only idempotent requests share a pipeline.
    pub fn idempotent(mut self, idempotent: bool) -> Request {
        if let Ok(ref mut parts) = self.inner {
            parts.idempotent = Some(idempotent);
        }
        self
    }

    /// Request a protocol upgrade; `proto` becomes the `upgrade` header.
    pub fn upgrade(mut self, proto: impl Into<String>) -> Request {
        if let Ok(ref mut parts) = self.inner {
            parts.upgrade = Some(proto.into());
        }
        self
    }

    /// Override the TLS servername for this request.
    pub fn servername(mut self, servername: impl Into<String>) -> Request {
        if let Ok(ref mut parts) = self.inner {
            parts.servername = Some(servername.into());
        }
        self
    }

    /// Override the client's headers timeout for this request.
    pub fn headers_timeout(mut self, timeout: Duration) -> Request {
        if let Ok(ref mut parts) = self.inner {
            parts.headers_timeout = Some(timeout);
        }
        self
    }

    /// Override the client's body timeout for this request.
    pub fn body_timeout(mut self, timeout: Duration) -> Request {
        if let Ok(ref mut parts) = self.inner {
            parts.body_timeout = Some(timeout);
        }
        self
    }

    /// Attach an abort signal. Cancelling the token aborts the request.
    pub fn signal(mut self, token: CancellationToken) -> Request {
        if let Ok(ref mut parts) = self.inner {
            parts.signal = Some(token);
        }
        self
    }

    /// A re-dispatchable copy of this request, used when following
    /// redirects. `None` for invalid requests, upgrades, and streaming
    /// bodies (which cannot be replayed).
    pub(crate) fn try_snapshot(&self) -> Option<Snapshot> {
        let parts = self.inner.as_ref().ok()?;
        if parts.upgrade.is_some() {
            return None;
        }
        let body = parts.body.try_clone()?;
        Some(Snapshot {
            method: parts.method.clone(),
            path: parts.path.clone(),
            headers: parts.headers.clone(),
            body,
            idempotent: parts.idempotent,
            signal: parts.signal.clone(),
            headers_timeout: parts.headers_timeout,
            body_timeout: parts.body_timeout,
        })
    }

    /// Validate into the normalized form the client queues.
    pub(crate) fn validate(self) -> Result<ValidRequest> {
        let parts = self.inner?;

        if parts.method == Method::CONNECT {
            // Tunnelled body semantics are undefined; see the design notes.
            return Err(Error::new_not_supported("CONNECT is not supported"));
        }
        if !parts.path.starts_with('/') {
            return Err(Error::new_invalid_arg("path must be absolute"));
        }

        let mut headers = parts.headers;
        for name in FORBIDDEN_HEADERS {
            if headers.contains_key(*name) {
                return Err(Error::new_invalid_arg("invalid header"));
            }
        }

        // The writer emits its own content-length; a caller-provided one is
        // captured numerically and checked against the body.
        let declared_length = match headers.remove(http::header::CONTENT_LENGTH) {
            Some(value) => {
                let parsed = value
                    .to_str()
                    .ok()
                    .and_then(|v| v.trim().parse::<u64>().ok());
                match parsed {
                    Some(n) => Some(n),
                    None => return Err(Error::new_invalid_arg("invalid content-length header")),
                }
            }
            None => None,
        };

        if let (Some(declared), Some(actual)) = (declared_length, parts.body.length()) {
            if declared != actual && !(declared == 0 && parts.body.is_empty()) {
                return Err(Error::new_invalid_arg(
                    "content-length header does not match body",
                ));
            }
        }

        let idempotent = parts
            .idempotent
            .unwrap_or(parts.method == Method::GET || parts.method == Method::HEAD);

        let expects_payload = parts.method == Method::PUT
            || parts.method == Method::POST
            || parts.method == Method::PATCH;

        Ok(ValidRequest {
            method: parts.method,
            path: parts.path,
            headers,
            body: parts.body,
            content_length: declared_length,
            idempotent,
            expects_payload,
            upgrade: parts.upgrade,
            servername: parts.servername,
            headers_timeout: parts.headers_timeout,
            body_timeout: parts.body_timeout,
            signal: parts.signal,
        })
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner {
            Ok(ref parts) => f
                .debug_struct("Request")
                .field("method", &parts.method)
                .field("path", &parts.path)
                .finish(),
            Err(ref err) => f.debug_struct("Request").field("error", err).finish(),
        }
    }
}

/// A replayable copy of a request's parts, carried across redirect hops.
pub(crate) struct Snapshot {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Body,
    pub(crate) idempotent: Option<bool>,
    pub(crate) signal: Option<CancellationToken>,
    pub(crate) headers_timeout: Option<Duration>,
    pub(crate) body_timeout: Option<Duration>,
}

impl Snapshot {
    pub(crate) fn duplicate(&self) -> Snapshot {
        Snapshot {
            method: self.method.clone(),
            path: self.path.clone(),
            headers: self.headers.clone(),
            body: self
                .body
                .try_clone()
                .expect("snapshot bodies are always replayable"),
            idempotent: self.idempotent,
            signal: self.signal.clone(),
            headers_timeout: self.headers_timeout,
            body_timeout: self.body_timeout,
        }
    }

    pub(crate) fn into_request(self) -> Request {
        Request {
            inner: Ok(Parts {
                method: self.method,
                path: self.path,
                headers: self.headers,
                body: self.body,
                idempotent: self.idempotent,
                upgrade: None,
                servername: None,
                headers_timeout: self.headers_timeout,
                body_timeout: self.body_timeout,
                signal: self.signal,
            }),
        }
    }
}

/// The validated, normalized form of a request.
#[derive(Debug)]
pub(crate) struct ValidRequest {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Body,
    pub(crate) content_length: Option<u64>,
    pub(crate) idempotent: bool,
    pub(crate) expects_payload: bool,
    pub(crate) upgrade: Option<String>,
    pub(crate) servername: Option<String>,
    pub(crate) headers_timeout: Option<Duration>,
    pub(crate) body_timeout: Option<Duration>,
    pub(crate) signal: Option<CancellationToken>,
}

/// One queue slot's request state, after the client assigned identity,
/// default timeouts, and an abort token.
pub(crate) struct QueuedRequest {
    pub(crate) id: u64,
    pub(crate) method: Method,
    pub(crate) path: String,
    /// Kept until completion; a retried request re-serializes from here.
    pub(crate) headers: Option<HeaderMap>,
    /// `None` only while a non-replayable stream body is being written.
    pub(crate) body: Option<BodyKind>,
    pub(crate) content_length: Option<u64>,
    pub(crate) body_is_stream: bool,
    pub(crate) idempotent: bool,
    pub(crate) expects_payload: bool,
    pub(crate) upgrade: Option<String>,
    pub(crate) servername: Option<String>,
    pub(crate) headers_timeout: Duration,
    pub(crate) body_timeout: Duration,
    pub(crate) token: CancellationToken,
    /// Cancelled when the slot leaves the queue, reaping its abort watcher.
    pub(crate) done: CancellationToken,
    /// Monotonic: set once, never cleared.
    pub(crate) aborted: bool,
}

impl QueuedRequest {
    pub(crate) fn abort_handle(&self) -> crate::handler::AbortHandle {
        crate::handler::AbortHandle::new(self.token.clone())
    }
}

impl Drop for QueuedRequest {
    fn drop(&mut self) {
        self.done.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_is_idempotent_by_default() {
        let req = Request::get("/").validate().unwrap();
        assert!(req.idempotent);
        let req = Request::head("/").validate().unwrap();
        assert!(req.idempotent);
        let req = Request::post("/").validate().unwrap();
        assert!(!req.idempotent);
    }

    #[test]
    fn idempotence_can_be_overridden() {
        let req = Request::post("/").idempotent(true).validate().unwrap();
        assert!(req.idempotent);
    }

    #[test]
    fn rejects_relative_paths() {
        let err = Request::get("foo").validate().unwrap_err();
        assert_eq!(err.code(), "UND_ERR_INVALID_ARG");
    }

    #[test]
    fn rejects_connect() {
        let err = Request::new(Method::CONNECT, "/").validate().unwrap_err();
        assert_eq!(err.code(), "UND_ERR_NOT_SUPPORTED");
    }

    #[test]
    fn rejects_forbidden_headers() {
        for name in super::FORBIDDEN_HEADERS {
            let err = Request::get("/")
                .header(*name, "x")
                .validate()
                .unwrap_err();
            assert_eq!(err.code(), "UND_ERR_INVALID_ARG", "header {}", name);
        }
    }

    #[test]
    fn captures_content_length_numerically() {
        let req = Request::post("/")
            .header("content-length", "5")
            .body("hello")
            .validate()
            .unwrap();
        assert_eq!(req.content_length, Some(5));
        assert!(!req.headers.contains_key("content-length"));
    }

    #[test]
    fn rejects_malformed_content_length() {
        let err = Request::post("/")
            .header("content-length", "five")
            .validate()
            .unwrap_err();
        assert_eq!(err.code(), "UND_ERR_INVALID_ARG");
    }

    #[test]
    fn rejects_mismatched_content_length() {
        let err = Request::post("/")
            .header("content-length", "4")
            .body("hello")
            .validate()
            .unwrap_err();
        assert_eq!(err.code(), "UND_ERR_INVALID_ARG");
    }

    #[test]
    fn invalid_header_is_deferred_to_validation() {
        let err = Request::get("/")
            .header("bad header", "x")
            .validate()
            .unwrap_err();
        assert_eq!(err.code(), "UND_ERR_INVALID_ARG");
    }

    #[test]
    fn expects_payload_tracks_method() {
        assert!(Request::post("/").validate().unwrap().expects_payload);
        assert!(Request::put("/").validate().unwrap().expects_payload);
        assert!(!Request::get("/").validate().unwrap().expects_payload);
        assert!(!Request::delete("/").validate().unwrap().expects_payload);
    }
}
