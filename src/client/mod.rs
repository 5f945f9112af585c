//! The pipelined single-connection client.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::connect::{Connector, TlsOptions};
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::origin::{IntoOrigin, Origin};
use crate::request::{Request, ValidRequest};

pub(crate) mod conn;
pub(crate) mod queue;

/// Lifecycle notifications observable via [`Client::subscribe`].
#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// A connection to the origin was established.
    Connect,
    /// The connection went away; carries the stable error code and message.
    Disconnect {
        /// The stable code of the error that tore the connection down.
        code: &'static str,
        /// Human-readable detail.
        message: String,
    },
    /// A connection attempt failed.
    ConnectionError {
        /// The stable code of the failure.
        code: &'static str,
        /// Human-readable detail.
        message: String,
    },
    /// The client went from busy back to accepting work.
    Drain,
}

/// Messages from the public handles to the driver task.
pub(crate) enum Op {
    Dispatch(ValidRequest, Box<dyn Handler>),
    ResumeReading,
    Close(oneshot::Sender<()>),
    Destroy(Option<Error>, oneshot::Sender<()>),
}

/// State shared between the handles and the driver, readable without
/// touching the driver task.
pub(crate) struct Shared {
    pub(crate) origin: Origin,
    pub(crate) pipelining: usize,
    pub(crate) size: Arc<AtomicUsize>,
    pub(crate) pending: AtomicUsize,
    pub(crate) running: AtomicUsize,
    pub(crate) connected: AtomicBool,
    pub(crate) writing: AtomicBool,
    pub(crate) reset: AtomicBool,
    pub(crate) closed: AtomicBool,
    pub(crate) destroyed: AtomicBool,
    /// 0 = idle, 1 = busy observed, 2 = a dispatch returned false and a
    /// drain event is promised.
    pub(crate) need_drain: AtomicU8,
    pub(crate) events: broadcast::Sender<ClientEvent>,
}

impl Shared {
    pub(crate) fn pipeline_cap(&self) -> usize {
        self.pipelining.max(1)
    }

    /// The queue is at pipeline capacity.
    pub(crate) fn full(&self) -> bool {
        self.size.load(Ordering::SeqCst) >= self.pipeline_cap()
    }

    /// Full, or transiently unable to write (tainted connection, a stream
    /// body still draining). `full` is the strict subset of this that is
    /// about queue length alone.
    pub(crate) fn busy(&self) -> bool {
        self.reset.load(Ordering::SeqCst) || self.writing.load(Ordering::SeqCst) || self.full()
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

/// Configuration for a [`Client`], with the builder methods to set it.
///
/// Defaults follow the table in the crate documentation; all durations are
/// per phase, not per request lifetime.
#[derive(Clone, Debug)]
pub struct Builder {
    pipelining: usize,
    max_header_size: usize,
    headers_timeout: Duration,
    body_timeout: Duration,
    connect_timeout: Duration,
    keep_alive_timeout: Duration,
    keep_alive_max_timeout: Duration,
    keep_alive_timeout_threshold: Duration,
    socket_path: Option<PathBuf>,
    tls: TlsOptions,
    strict_content_length: bool,
    max_aborted_payload: usize,
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

impl Builder {
    /// A builder with the default options.
    pub fn new() -> Builder {
        Builder {
            pipelining: 1,
            max_header_size: 16 * 1024,
            headers_timeout: Duration::from_secs(30),
            body_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            keep_alive_timeout: Duration::from_secs(4),
            keep_alive_max_timeout: Duration::from_secs(600),
            keep_alive_timeout_threshold: Duration::from_secs(1),
            socket_path: None,
            tls: TlsOptions::default(),
            strict_content_length: true,
            max_aborted_payload: 1024 * 1024,
        }
    }

    /// Maximum number of in-flight requests on the connection. Default 1.
    ///
    /// `0` disables keep-alive entirely: every request closes the
    /// connection.
    pub fn pipelining(&mut self, amount: usize) -> &mut Builder {
        self.pipelining = amount;
        self
    }

    /// Byte cap on a response header section. Default 16 KiB.
    pub fn max_header_size(&mut self, size: usize) -> &mut Builder {
        self.max_header_size = size;
        self
    }

    /// Time allowed between writing a request and its first response byte.
    /// Default 30s.
    pub fn headers_timeout(&mut self, timeout: Duration) -> &mut Builder {
        self.headers_timeout = timeout;
        self
    }

    /// Time allowed between body chunks. Default 30s.
    pub fn body_timeout(&mut self, timeout: Duration) -> &mut Builder {
        self.body_timeout = timeout;
        self
    }

    /// Time allowed for the socket (and TLS) handshake. Default 10s.
    pub fn connect_timeout(&mut self, timeout: Duration) -> &mut Builder {
        self.connect_timeout = timeout;
        self
    }

    /// Idle timeout when the server does not advertise one. Default 4s.
    pub fn keep_alive_timeout(&mut self, timeout: Duration) -> &mut Builder {
        self.keep_alive_timeout = timeout;
        self
    }

    /// Upper clamp on a server-advertised idle timeout. Default 10 min.
    pub fn keep_alive_max_timeout(&mut self, timeout: Duration) -> &mut Builder {
        self.keep_alive_max_timeout = timeout;
        self
    }

    /// Safety margin subtracted from a server-advertised idle timeout.
    /// Default 1s.
    pub fn keep_alive_timeout_threshold(&mut self, threshold: Duration) -> &mut Builder {
        self.keep_alive_timeout_threshold = threshold;
        self
    }

    /// Connect over a named local socket instead of TCP.
    pub fn socket_path(&mut self, path: impl Into<PathBuf>) -> &mut Builder {
        self.socket_path = Some(path.into());
        self
    }

    /// TLS settings used for `https` origins.
    pub fn tls(&mut self, tls: TlsOptions) -> &mut Builder {
        self.tls = tls;
        self
    }

    /// Whether a body diverging from its declared length is an error
    /// (true, default) or only a warning.
    pub fn strict_content_length(&mut self, strict: bool) -> &mut Builder {
        self.strict_content_length = strict;
        self
    }

    /// Bytes of response body the client will read and discard after an
    /// abort before giving up on salvaging the connection. Default 1 MiB.
    pub fn max_aborted_payload(&mut self, bytes: usize) -> &mut Builder {
        self.max_aborted_payload = bytes;
        self
    }

    /// Build a client for `origin` and spawn its driver task.
    ///
    /// Must be called within a tokio runtime.
    pub fn build(&self, origin: impl IntoOrigin) -> Result<Client> {
        let origin = origin.into_origin()?;
        let opts = Arc::new(Options {
            pipelining: self.pipelining,
            max_header_size: self.max_header_size,
            headers_timeout: self.headers_timeout,
            body_timeout: self.body_timeout,
            connect_timeout: self.connect_timeout,
            keep_alive_timeout: self.keep_alive_timeout,
            keep_alive_max_timeout: self.keep_alive_max_timeout,
            keep_alive_timeout_threshold: self.keep_alive_timeout_threshold,
            strict_content_length: self.strict_content_length,
            max_aborted_payload: self.max_aborted_payload,
        });
        let connector = Arc::new(Connector::new(
            &origin,
            self.connect_timeout,
            self.socket_path.clone(),
            self.tls.clone(),
        ));
        let default_servername = self
            .tls
            .default_servername()
            .map(str::to_owned)
            .or_else(|| origin.default_servername());

        let (events, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            origin,
            pipelining: self.pipelining,
            size: Arc::new(AtomicUsize::new(0)),
            pending: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
            writing: AtomicBool::new(false),
            reset: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            need_drain: AtomicU8::new(0),
            events,
        });

        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let driver = conn::ConnDriver::new(
            shared.clone(),
            opts,
            connector,
            default_servername,
            ops_rx,
            // The driver may only hold a weak sender: the channel closing
            // is how it learns the last handle was dropped.
            ops_tx.downgrade(),
        );
        tokio::spawn(driver);

        Ok(Client {
            shared,
            ops: ops_tx,
        })
    }
}

/// Resolved client options the driver works from.
pub(crate) struct Options {
    pub(crate) pipelining: usize,
    pub(crate) max_header_size: usize,
    pub(crate) headers_timeout: Duration,
    pub(crate) body_timeout: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) keep_alive_timeout: Duration,
    pub(crate) keep_alive_max_timeout: Duration,
    pub(crate) keep_alive_timeout_threshold: Duration,
    pub(crate) strict_content_length: bool,
    pub(crate) max_aborted_payload: usize,
}

/// A client for one origin over one connection.
///
/// Owns a single TCP (or TLS, or unix) byte stream and pipelines queued
/// requests onto it. Cheap to clone; all clones share the connection and
/// its queue. See the crate docs for the dispatch contract.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
    ops: mpsc::UnboundedSender<Op>,
}

impl Client {
    /// Connect a client with default options.
    pub fn new(origin: impl IntoOrigin) -> Result<Client> {
        Builder::new().build(origin)
    }

    /// Start configuring a client.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// The origin this client dispatches to.
    pub fn origin(&self) -> &Origin {
        &self.shared.origin
    }

    /// Queue a request.
    ///
    /// Returns `false` iff the client now needs to drain: the caller should
    /// stop dispatching until a [`ClientEvent::Drain`] arrives. Invalid
    /// requests and closed/destroyed clients fail synchronously through the
    /// handler's `on_error`.
    pub fn dispatch(&self, req: Request, handler: impl Handler) -> bool {
        self.dispatch_boxed(req, Box::new(handler))
    }

    pub(crate) fn dispatch_boxed(&self, req: Request, mut handler: Box<dyn Handler>) -> bool {
        let not_draining = self.shared.need_drain.load(Ordering::SeqCst) != 2;

        if self.shared.destroyed.load(Ordering::SeqCst) {
            handler.on_error(Error::new_destroyed());
            return not_draining;
        }
        if self.shared.closed.load(Ordering::SeqCst) {
            handler.on_error(Error::new_closed());
            return not_draining;
        }

        let valid = match req.validate() {
            Ok(valid) => valid,
            Err(err) => {
                handler.on_error(err);
                return not_draining;
            }
        };

        self.shared.size.fetch_add(1, Ordering::SeqCst);
        if let Err(send_err) = self.ops.send(Op::Dispatch(valid, handler)) {
            self.shared.size.fetch_sub(1, Ordering::SeqCst);
            if let Op::Dispatch(_, mut handler) = send_err.0 {
                handler.on_error(Error::new_destroyed());
            }
            return not_draining;
        }

        if self.shared.busy() {
            self.shared.need_drain.store(2, Ordering::SeqCst);
            false
        } else {
            true
        }
    }

    /// Close gracefully: queued requests complete, new dispatches are
    /// rejected with `UND_ERR_CLOSED`. Resolves once the client is fully
    /// torn down.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        if self.ops.send(Op::Close(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Destroy immediately: every queued request is aborted with `err`
    /// (default `UND_ERR_DESTROYED`) and the socket is torn down.
    pub async fn destroy(&self, err: Option<Error>) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.destroyed.store(true, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        if self.ops.send(Op::Destroy(err, tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Requests queued but not yet written.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Requests written and awaiting a response.
    pub fn running(&self) -> usize {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// All live requests.
    pub fn size(&self) -> usize {
        self.shared.size.load(Ordering::SeqCst)
    }

    /// Whether a connection is currently established.
    pub fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Whether the client would prefer not to take more work right now.
    pub fn busy(&self) -> bool {
        self.shared.busy()
    }

    /// Whether the queue already holds `pipelining` requests.
    ///
    /// Narrower than [`Client::busy`]: a client mid-way through a
    /// streaming body or on a tainted connection is busy but may still
    /// have queue room.
    pub fn full(&self) -> bool {
        self.shared.full()
    }

    /// Whether a dispatch was refused and a drain event is promised.
    pub fn needs_drain(&self) -> bool {
        self.shared.need_drain.load(Ordering::SeqCst) == 2
    }

    /// Whether [`Client::close`] or [`Client::destroy`] was called.
    pub fn closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Whether the client was destroyed.
    pub fn destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("origin", &self.shared.origin)
            .field("pending", &self.pending())
            .field("running", &self.running())
            .field("connected", &self.connected())
            .finish()
    }
}
