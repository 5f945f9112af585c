//! Buffered conveniences over the dispatch contract.
//!
//! The core interface is callback-driven; these helpers adapt it to
//! futures for the common cases: a fully buffered request/response
//! exchange, and an upgrade handshake.

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use tokio::sync::oneshot;

use crate::agent::Agent;
use crate::client::Client;
use crate::error::{Error, Result};
use crate::handler::{FlowControl, Handler};
use crate::origin::IntoOrigin;
use crate::pool::Pool;
use crate::redirect::RedirectAgent;
use crate::request::Request;
use crate::upgrade::Upgraded;

/// Anything that can accept a dispatched request: [`Client`] and [`Pool`].
pub trait Dispatch {
    /// Queue a request with its handler; see [`Client::dispatch`].
    fn dispatch_boxed(&self, req: Request, handler: Box<dyn Handler>) -> bool;
}

impl Dispatch for Client {
    fn dispatch_boxed(&self, req: Request, handler: Box<dyn Handler>) -> bool {
        Client::dispatch_boxed(self, req, handler)
    }
}

impl Dispatch for Pool {
    fn dispatch_boxed(&self, req: Request, handler: Box<dyn Handler>) -> bool {
        Pool::dispatch_boxed(self, req, handler)
    }
}

/// A fully buffered response.
#[derive(Debug)]
pub struct Response {
    /// The response status.
    pub status: StatusCode,
    /// The response headers.
    pub headers: HeaderMap,
    /// The complete body.
    pub body: Bytes,
    /// Trailing headers, if the response carried any.
    pub trailers: HeaderMap,
}

/// A completed upgrade handshake.
#[derive(Debug)]
pub struct UpgradeResponse {
    /// The status the server answered with (101 for HTTP upgrades).
    pub status: StatusCode,
    /// The response headers.
    pub headers: HeaderMap,
    /// The raw byte stream, now owned by the caller.
    pub io: Upgraded,
}

/// Dispatch `req` and buffer the entire response.
pub async fn request(dispatcher: &impl Dispatch, req: Request) -> Result<Response> {
    let (tx, rx) = oneshot::channel();
    dispatcher.dispatch_boxed(req, Box::new(BufferedHandler::new(tx)));
    await_response(rx).await
}

/// Dispatch an upgrade request and wait for the switched-protocol stream.
pub async fn upgrade(
    dispatcher: &impl Dispatch,
    req: Request,
    protocol: impl Into<String>,
) -> Result<UpgradeResponse> {
    let (tx, rx) = oneshot::channel();
    dispatcher.dispatch_boxed(
        req.upgrade(protocol.into()),
        Box::new(UpgradeHandler { tx: Some(tx) }),
    );
    await_response(rx).await
}

impl Agent {
    /// Dispatch against `origin` and buffer the entire response.
    pub async fn request(&self, origin: impl IntoOrigin, req: Request) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        self.dispatch_boxed(origin, req, Box::new(BufferedHandler::new(tx)));
        await_response(rx).await
    }
}

impl RedirectAgent {
    /// Dispatch against `origin`, follow redirects, and buffer the final
    /// response.
    pub async fn request(&self, origin: impl IntoOrigin, req: Request) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        self.dispatch_boxed(origin, req, Box::new(BufferedHandler::new(tx)));
        await_response(rx).await
    }
}

async fn await_response<T>(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    match rx.await {
        Ok(result) => result,
        Err(_) => Err(Error::new_socket("client task terminated")),
    }
}

struct BufferedHandler {
    tx: Option<oneshot::Sender<Result<Response>>>,
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
}

impl BufferedHandler {
    fn new(tx: oneshot::Sender<Result<Response>>) -> BufferedHandler {
        BufferedHandler {
            tx: Some(tx),
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: BytesMut::new(),
        }
    }
}

impl Handler for BufferedHandler {
    fn on_headers(
        &mut self,
        status: StatusCode,
        headers: &HeaderMap,
        _flow: &FlowControl,
    ) -> bool {
        self.status = status;
        self.headers = headers.clone();
        true
    }

    fn on_data(&mut self, chunk: Bytes) -> bool {
        self.body.extend_from_slice(&chunk);
        true
    }

    fn on_complete(&mut self, trailers: &HeaderMap) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Ok(Response {
                status: self.status,
                headers: std::mem::take(&mut self.headers),
                body: self.body.split().freeze(),
                trailers: trailers.clone(),
            }));
        }
    }

    fn on_error(&mut self, err: Error) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(err));
        }
    }
}

struct UpgradeHandler {
    tx: Option<oneshot::Sender<Result<UpgradeResponse>>>,
}

impl Handler for UpgradeHandler {
    fn on_complete(&mut self, _trailers: &HeaderMap) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(Error::new_socket(
                "server answered without switching protocols",
            )));
        }
    }

    fn on_upgrade(&mut self, status: StatusCode, headers: HeaderMap, io: Upgraded) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Ok(UpgradeResponse {
                status,
                headers,
                io,
            }));
        }
    }

    fn on_error(&mut self, err: Error) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(err));
        }
    }
}
