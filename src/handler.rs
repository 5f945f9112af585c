//! The streaming handler contract.
//!
//! Every dispatched request is bound to a [`Handler`]. The client drives the
//! handler through a fixed callback sequence:
//!
//! `on_connect`, `on_headers`, zero or more `on_data`, `on_complete`
//!
//! with `on_error` possibly replacing any suffix of that sequence, and
//! `on_upgrade` replacing `on_headers` onward for upgrade requests. A handler
//! sees at most one `on_error`, and nothing after it.
//!
//! `on_headers` and `on_data` return a `bool`: returning `false` asks the
//! client to stop reading from the socket until [`FlowControl::resume`] is
//! called.

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::Op;
use crate::error::Error;
use crate::upgrade::Upgraded;

/// Receives the lifecycle callbacks for one dispatched request.
///
/// Implementations must be `Send`: callbacks run on the client's driver
/// task, not on the caller's.
pub trait Handler: Send + 'static {
    /// The request is about to be written to a connection.
    ///
    /// The handle aborts this request when triggered; it may be kept for
    /// the lifetime of the request.
    fn on_connect(&mut self, _abort: &AbortHandle) {}

    /// The complete response head arrived.
    ///
    /// Return `false` to pause delivery until `flow.resume()` is called.
    fn on_headers(
        &mut self,
        _status: StatusCode,
        _headers: &HeaderMap,
        _flow: &FlowControl,
    ) -> bool {
        true
    }

    /// A chunk of the response body arrived.
    ///
    /// Return `false` to pause delivery until the flow control handed to
    /// `on_headers` is resumed.
    fn on_data(&mut self, _chunk: Bytes) -> bool {
        true
    }

    /// The response finished cleanly. `trailers` is empty unless the
    /// response was chunked and carried trailing headers.
    fn on_complete(&mut self, trailers: &HeaderMap);

    /// The server accepted a protocol upgrade; the socket now belongs to
    /// this handler. No further callbacks fire after this one.
    fn on_upgrade(&mut self, _status: StatusCode, _headers: HeaderMap, _io: Upgraded) {}

    /// The request failed. Terminal: nothing is delivered afterwards.
    fn on_error(&mut self, err: Error);
}

/// Resumes a paused response.
///
/// Handed to [`Handler::on_headers`]; cheap to clone and safe to trigger
/// from any thread. Resuming a client that is not paused is a no-op.
///
/// Holds only a weak sender: handlers live inside the client's own queue,
/// and a strong one would keep the op channel open after the last
/// [`Client`](crate::Client) handle is gone.
#[derive(Clone, Debug)]
pub struct FlowControl {
    ops: mpsc::WeakUnboundedSender<Op>,
}

impl FlowControl {
    pub(crate) fn new(ops: mpsc::WeakUnboundedSender<Op>) -> FlowControl {
        FlowControl { ops }
    }

    /// Un-pause the response and flush any buffered bytes.
    pub fn resume(&self) {
        // A dead driver has nothing paused anymore.
        if let Some(ops) = self.ops.upgrade() {
            let _ = ops.send(Op::ResumeReading);
        }
    }
}

/// Aborts one in-flight request.
///
/// Pending requests are spliced out of the queue; a running request tears
/// down its connection. Either way the handler observes
/// `on_error` with code `UND_ERR_ABORTED`.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    pub(crate) fn new(token: CancellationToken) -> AbortHandle {
        AbortHandle { token }
    }

    /// Trigger the abort. Idempotent.
    pub fn abort(&self) {
        self.token.cancel();
    }

    /// Returns true if the abort was already triggered.
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}
