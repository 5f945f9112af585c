//! Redirect following.
//!
//! [`RedirectAgent`] wraps an [`Agent`]: each dispatched handler is
//! interposed by a `RedirectHandler` that watches for 3xx responses with a
//! `Location` header, silently consumes their bodies, and re-dispatches the
//! request against the new target once the 3xx completes. The wrapped
//! handler only ever observes the final response.
//!
//! Streaming request bodies cannot be replayed and are dispatched through
//! unmodified.

use http::header::{HeaderMap, HeaderName};
use http::{Method, StatusCode, Uri};
use tracing::{debug, trace};

use crate::agent::Agent;
use crate::error::{Error, Result};
use crate::handler::{AbortHandle, FlowControl, Handler};
use crate::origin::{IntoOrigin, Origin};
use crate::request::{Request, Snapshot};
use crate::upgrade::Upgraded;

/// Default maximum redirect hops, matching common client behavior.
const DEFAULT_MAX_REDIRECTIONS: usize = 10;

/// Response codes that trigger a redirect when `Location` is present.
fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 300 | 301 | 302 | 303 | 307 | 308)
}

/// An [`Agent`] that follows 3xx redirects across origins.
#[derive(Clone, Debug)]
pub struct RedirectAgent {
    agent: Agent,
    max_redirections: usize,
}

impl RedirectAgent {
    /// Wrap `agent`, following up to ten redirects per request.
    pub fn new(agent: Agent) -> RedirectAgent {
        RedirectAgent::with_max(agent, DEFAULT_MAX_REDIRECTIONS)
    }

    /// Wrap `agent` with an explicit redirect budget. Zero disables
    /// following entirely.
    pub fn with_max(agent: Agent, max_redirections: usize) -> RedirectAgent {
        RedirectAgent {
            agent,
            max_redirections,
        }
    }

    /// The wrapped agent.
    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Queue a request; 3xx responses are followed transparently.
    ///
    /// Same contract as [`crate::Client::dispatch`].
    pub fn dispatch(&self, origin: impl IntoOrigin, req: Request, handler: impl Handler) -> bool {
        self.dispatch_boxed(origin, req, Box::new(handler))
    }

    pub(crate) fn dispatch_boxed(
        &self,
        origin: impl IntoOrigin,
        req: Request,
        mut handler: Box<dyn Handler>,
    ) -> bool {
        let origin = match origin.into_origin() {
            Ok(origin) => origin,
            Err(err) => {
                handler.on_error(err);
                return true;
            }
        };

        let snapshot = if self.max_redirections > 0 {
            req.try_snapshot()
        } else {
            None
        };
        let snapshot = match snapshot {
            Some(snapshot) => snapshot,
            // Invalid, streaming, or upgrade requests pass straight through.
            None => return self.agent.dispatch_boxed(origin, req, handler),
        };

        let wrapped = RedirectHandler {
            agent: self.agent.clone(),
            origin: origin.clone(),
            snapshot,
            remaining: self.max_redirections,
            history: Vec::new(),
            target: None,
            inner: Some(handler),
        };
        self.agent.dispatch_boxed(origin, req, Box::new(wrapped))
    }

    /// Close the wrapped agent.
    pub async fn close(&self) {
        self.agent.close().await;
    }

    /// Destroy the wrapped agent.
    pub async fn destroy(&self, err: Option<Error>) {
        self.agent.destroy(err).await;
    }
}

struct RedirectHandler {
    agent: Agent,
    origin: Origin,
    snapshot: Snapshot,
    remaining: usize,
    /// `origin + path` of every hop already taken, for loop detection.
    history: Vec<String>,
    /// Set while a 3xx body is being discarded: the next hop and the
    /// status that selected it.
    target: Option<(Origin, String, StatusCode)>,
    inner: Option<Box<dyn Handler>>,
}

impl RedirectHandler {
    fn follow(&mut self) {
        let (origin, path, status) = self.target.take().expect("follow without target");

        let here = format!("{}{}", self.origin, self.snapshot.path);
        let next = format!("{}{}", origin, path);
        if self.history.iter().any(|past| *past == next) {
            if let Some(handler) = self.inner.as_mut() {
                handler.on_error(Error::new_invalid_arg("circular redirect"));
            }
            self.inner = None;
            return;
        }
        self.history.push(here);

        let cross_origin = origin != self.origin;
        let mut snapshot = self.snapshot.duplicate();
        snapshot.path = path;
        clean_headers(&mut snapshot.headers, status, cross_origin);
        if status == StatusCode::SEE_OTHER && snapshot.method != Method::HEAD {
            snapshot.method = Method::GET;
            snapshot.body = crate::body::Body::empty();
        }

        debug!(status = status.as_u16(), location = %next, "following redirect");

        let next_hop = RedirectHandler {
            agent: self.agent.clone(),
            origin: origin.clone(),
            snapshot: snapshot.duplicate(),
            remaining: self.remaining - 1,
            history: std::mem::take(&mut self.history),
            target: None,
            inner: self.inner.take(),
        };
        self.agent
            .dispatch_boxed(origin, snapshot.into_request(), Box::new(next_hop));
    }
}

impl Handler for RedirectHandler {
    fn on_connect(&mut self, abort: &AbortHandle) {
        if let Some(handler) = self.inner.as_mut() {
            handler.on_connect(abort);
        }
    }

    fn on_headers(
        &mut self,
        status: StatusCode,
        headers: &HeaderMap,
        flow: &FlowControl,
    ) -> bool {
        if self.remaining > 0 && is_redirect(status) {
            if let Some(location) = headers.get(http::header::LOCATION) {
                match resolve_location(&self.origin, &self.snapshot.path, location.as_bytes()) {
                    Ok((target, path)) => {
                        trace!(status = status.as_u16(), "redirect response intercepted");
                        self.target = Some((target, path, status));
                        // Consume and discard the 3xx body.
                        return true;
                    }
                    Err(_) => {
                        // An unusable Location is delivered as a final
                        // response rather than guessed at.
                    }
                }
            }
        }
        match self.inner.as_mut() {
            Some(handler) => handler.on_headers(status, headers, flow),
            None => true,
        }
    }

    fn on_data(&mut self, chunk: bytes::Bytes) -> bool {
        if self.target.is_some() {
            return true;
        }
        match self.inner.as_mut() {
            Some(handler) => handler.on_data(chunk),
            None => true,
        }
    }

    fn on_complete(&mut self, trailers: &HeaderMap) {
        if self.target.is_some() {
            self.follow();
            return;
        }
        if let Some(handler) = self.inner.as_mut() {
            handler.on_complete(trailers);
        }
    }

    fn on_upgrade(&mut self, status: StatusCode, headers: HeaderMap, io: Upgraded) {
        if let Some(handler) = self.inner.as_mut() {
            handler.on_upgrade(status, headers, io);
        }
    }

    fn on_error(&mut self, err: Error) {
        if let Some(handler) = self.inner.as_mut() {
            handler.on_error(err);
        }
        self.inner = None;
    }
}

/// Strip the headers that must not cross a redirect hop: `host` always,
/// `content-*` on a 303 method rewrite, and credentials when the hop
/// changes origin.
fn clean_headers(headers: &mut HeaderMap, status: StatusCode, cross_origin: bool) {
    headers.remove(http::header::HOST);
    if status == StatusCode::SEE_OTHER {
        let content_names: Vec<HeaderName> = headers
            .keys()
            .filter(|name| name.as_str().starts_with("content-"))
            .cloned()
            .collect();
        for name in content_names {
            headers.remove(name);
        }
    }
    if cross_origin {
        headers.remove(http::header::AUTHORIZATION);
        headers.remove(http::header::COOKIE);
        headers.remove(http::header::PROXY_AUTHORIZATION);
    }
}

/// Resolve a `Location` header against the request that produced it.
fn resolve_location(origin: &Origin, base_path: &str, location: &[u8]) -> Result<(Origin, String)> {
    let location =
        std::str::from_utf8(location).map_err(|_| Error::new_invalid_arg("invalid location"))?;

    if location.starts_with("http://") || location.starts_with("https://") {
        let uri = location
            .parse::<Uri>()
            .map_err(|e| Error::new_invalid_arg("invalid location").with(e))?;
        let target = Origin::authority_of(&uri)?;
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        return Ok((target, path));
    }

    if location.starts_with('/') {
        return Ok((origin.clone(), location.to_string()));
    }

    // Relative reference: resolve against the base path's directory.
    let dir = match base_path.rfind('/') {
        Some(idx) => &base_path[..idx + 1],
        None => "/",
    };
    Ok((origin.clone(), format!("{}{}", dir, location)))
}
