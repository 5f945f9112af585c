//! The connection driver.
//!
//! One spawned task per client owns the socket, the parser, the queue, and
//! the timers, and is the only code that touches them. Every public handle
//! talks to it over the op channel, so the scheduler can never race itself.
//!
//! The `poll` loop pumps each source (ops, abort signals, the connect
//! future, the socket in both directions, the timers) and then runs
//! the scheduler (`resume`) until nothing changes. Suspension points are
//! exactly the ones the dispatch model allows: socket readiness, body
//! back-pressure, a handler returning `false`, and timer deadlines.

use std::cmp;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use http::Method;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Sleep};
use tokio_util::io::poll_read_buf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::body::BodyKind;
use crate::client::queue::{Queue, Slot, Zone};
use crate::client::{ClientEvent, Op, Options, Shared};
use crate::connect::{is_cert_altname_error, BoxIo, Connector};
use crate::error::Error;
use crate::handler::{FlowControl, Handler};
use crate::proto::h1::encode;
use crate::proto::h1::parser::{Event, MessageContext, Parser, ResponseHead};
use crate::request::{QueuedRequest, ValidRequest};
use crate::upgrade::Upgraded;

type ConnectFuture = Pin<Box<dyn Future<Output = crate::Result<BoxIo>> + Send>>;
type AbortWatch = Pin<Box<dyn Future<Output = Option<u64>> + Send>>;

enum SocketState {
    None,
    Connecting(ConnectFuture),
    Connected(BoxIo),
}

/// Read-side state of the in-flight response, from headers to completion.
struct MessageState {
    keep_alive: bool,
    trailers_advertised: Vec<String>,
}

/// Write-side state of a streaming request body.
struct WritingBody {
    body: crate::body::StreamBody,
    declared: Option<u64>,
    sent: u64,
    /// Framing header emitted (happens lazily, on the first chunk).
    started: bool,
    expects_payload: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TimerPhase {
    Off,
    Headers,
    Body,
    Idle,
}

pub(crate) struct ConnDriver {
    shared: Arc<Shared>,
    opts: Arc<Options>,
    connector: Arc<Connector>,
    ops: mpsc::UnboundedReceiver<Op>,
    /// Weak: only `Client` handles hold the channel open, so dropping the
    /// last one is observable as `poll_recv` returning `None`.
    ops_tx: mpsc::WeakUnboundedSender<Op>,
    ops_closed: bool,

    queue: Queue,
    next_id: u64,
    aborts: FuturesUnordered<AbortWatch>,

    socket: SocketState,
    parser: Parser,
    read_buf: BytesMut,
    write_buf: BytesMut,
    saw_eof: bool,
    /// Handler asked for back-pressure; reading stops until resumed.
    paused: bool,
    /// The connection is tainted: no further requests may be written.
    reset: bool,
    writing: Option<WritingBody>,
    msg: Option<MessageState>,
    /// Bytes of body left to silently discard for an aborted head request
    /// before giving up on the connection.
    discard: Option<usize>,

    default_servername: Option<String>,
    servername: Option<String>,

    idle_timeout: Duration,
    timer: Option<Pin<Box<Sleep>>>,
    timer_phase: TimerPhase,
    timer_duration: Duration,
    timer_refresh: bool,

    retry_delay: Duration,
    retry_timer: Option<Pin<Box<Sleep>>>,

    closed: bool,
    destroyed: bool,
    on_destroyed: Vec<oneshot::Sender<()>>,
}

impl ConnDriver {
    pub(crate) fn new(
        shared: Arc<Shared>,
        opts: Arc<Options>,
        connector: Arc<Connector>,
        default_servername: Option<String>,
        ops: mpsc::UnboundedReceiver<Op>,
        ops_tx: mpsc::WeakUnboundedSender<Op>,
    ) -> ConnDriver {
        let idle_timeout = opts.keep_alive_timeout;
        let max_header_size = opts.max_header_size;
        ConnDriver {
            shared,
            opts,
            connector,
            ops,
            ops_tx,
            ops_closed: false,
            queue: Queue::new(),
            next_id: 1,
            aborts: FuturesUnordered::new(),
            socket: SocketState::None,
            parser: Parser::new(max_header_size),
            read_buf: BytesMut::with_capacity(8 * 1024),
            write_buf: BytesMut::with_capacity(8 * 1024),
            saw_eof: false,
            paused: false,
            reset: false,
            writing: None,
            msg: None,
            discard: None,
            servername: default_servername.clone(),
            default_servername,
            idle_timeout,
            timer: None,
            timer_phase: TimerPhase::Off,
            timer_duration: Duration::ZERO,
            timer_refresh: false,
            retry_delay: Duration::ZERO,
            retry_timer: None,
            closed: false,
            destroyed: false,
            on_destroyed: Vec::new(),
        }
    }

    fn cap(&self) -> usize {
        self.opts.pipelining.max(1)
    }

    // ===== op intake =====

    fn poll_ops(&mut self, cx: &mut Context<'_>) -> bool {
        let mut progress = false;
        loop {
            match self.ops.poll_recv(cx) {
                Poll::Pending => break,
                Poll::Ready(Some(op)) => {
                    progress = true;
                    self.handle_op(op);
                }
                Poll::Ready(None) => {
                    if !self.ops_closed {
                        // Every handle is gone; finish what is queued and
                        // tear down.
                        self.ops_closed = true;
                        self.closed = true;
                        self.shared.closed.store(true, Ordering::SeqCst);
                        progress = true;
                    }
                    break;
                }
            }
        }
        progress
    }

    fn handle_op(&mut self, op: Op) {
        match op {
            Op::Dispatch(valid, handler) => self.handle_dispatch(valid, handler),
            Op::ResumeReading => {
                self.paused = false;
            }
            Op::Close(ack) => {
                self.closed = true;
                self.on_destroyed.push(ack);
            }
            Op::Destroy(err, ack) => {
                self.on_destroyed.push(ack);
                self.begin_destroy(err);
            }
        }
    }

    fn handle_dispatch(&mut self, valid: ValidRequest, handler: Box<dyn Handler>) {
        let id = self.next_id;
        self.next_id += 1;

        let token = valid
            .signal
            .as_ref()
            .map(|s| s.child_token())
            .unwrap_or_default();
        let done = CancellationToken::new();

        let req = QueuedRequest {
            id,
            body_is_stream: valid.body.is_stream(),
            content_length: valid.content_length,
            method: valid.method,
            path: valid.path,
            headers: Some(valid.headers),
            body: Some(valid.body.into_kind()),
            idempotent: valid.idempotent,
            expects_payload: valid.expects_payload,
            upgrade: valid.upgrade,
            servername: valid.servername,
            headers_timeout: valid.headers_timeout.unwrap_or(self.opts.headers_timeout),
            body_timeout: valid.body_timeout.unwrap_or(self.opts.body_timeout),
            token: token.clone(),
            done: done.clone(),
            aborted: false,
        };
        let mut slot = Slot::new(req, handler, self.shared.size.clone());

        if self.destroyed {
            slot.deliver_error(Error::new_destroyed());
            return;
        }
        if self.closed {
            slot.deliver_error(Error::new_closed());
            return;
        }

        self.aborts.push(Box::pin(async move {
            tokio::select! {
                _ = token.cancelled_owned() => Some(id),
                _ = done.cancelled_owned() => None,
            }
        }));
        self.queue.push(slot);
        trace!(id, "request queued");
    }

    // ===== aborts =====

    fn poll_aborts(&mut self, cx: &mut Context<'_>) -> bool {
        let mut progress = false;
        while let Poll::Ready(Some(fired)) = self.aborts.poll_next_unpin(cx) {
            progress = true;
            if let Some(id) = fired {
                self.handle_abort(id);
            }
        }
        progress
    }

    fn handle_abort(&mut self, id: u64) {
        match self.queue.zone_of(id) {
            None => {}
            Some(Zone::Pending) => {
                let mut slot = self
                    .queue
                    .remove_pending_by_id(id)
                    .expect("pending slot vanished");
                slot.req.aborted = true;
                slot.deliver_error(Error::new_aborted());
            }
            Some(Zone::RunningHead) => {
                let response_started = self.msg.is_some();
                let budget = self.opts.max_aborted_payload;
                if let Some(slot) = self.queue.head_running_mut() {
                    slot.req.aborted = true;
                    slot.deliver_error(Error::new_aborted());
                }
                if response_started && budget > 0 {
                    // Drain the rest of the response quietly; the socket
                    // survives if the message ends within budget.
                    self.discard = Some(budget);
                    debug!(id, budget, "aborted head request, discarding body");
                } else {
                    self.destroy_socket(Error::new_aborted());
                }
            }
            Some(Zone::RunningTail) => {
                if let Some(slot) = self.queue.slot_by_id_mut(id) {
                    slot.req.aborted = true;
                    slot.deliver_error(Error::new_aborted());
                }
                // Its bytes are on the wire; the connection cannot be
                // salvaged without parsing a response nobody wants.
                self.destroy_socket(Error::new_socket("socket reset by aborted request"));
            }
        }
    }

    // ===== connecting =====

    fn start_connect(&mut self) {
        let connector = self.connector.clone();
        let origin = self.shared.origin.clone();
        let servername = self.servername.clone();
        debug!(origin = %origin, "connecting");
        self.socket = SocketState::Connecting(Box::pin(async move {
            connector.connect(&origin, servername.as_deref()).await
        }));
    }

    fn poll_connect(&mut self, cx: &mut Context<'_>) -> bool {
        let fut = match self.socket {
            SocketState::Connecting(ref mut fut) => fut,
            _ => return false,
        };
        match fut.as_mut().poll(cx) {
            Poll::Pending => false,
            Poll::Ready(Ok(io)) => {
                self.socket = SocketState::Connected(io);
                self.parser = Parser::new(self.opts.max_header_size);
                self.read_buf.clear();
                self.saw_eof = false;
                self.paused = false;
                self.reset = false;
                self.retry_delay = Duration::ZERO;
                self.idle_timeout = self.opts.keep_alive_timeout;
                debug!("connected");
                self.shared.connected.store(true, Ordering::SeqCst);
                self.shared.emit(ClientEvent::Connect);
                true
            }
            Poll::Ready(Err(err)) => {
                self.socket = SocketState::None;
                self.on_connect_error(err);
                true
            }
        }
    }

    fn on_connect_error(&mut self, err: Error) {
        debug!(code = err.code(), "connect failed: {}", err);
        self.shared.emit(ClientEvent::ConnectionError {
            code: err.code(),
            message: err.to_string(),
        });

        if is_cert_altname_error(&err) {
            // Only the requests pinned to this servername are doomed; any
            // queued for a different name will reconnect under it.
            let current = self.servername.clone();
            let mut keep = Vec::new();
            for mut slot in self.queue.take_pending() {
                let name = slot
                    .req
                    .servername
                    .clone()
                    .or_else(|| self.default_servername.clone());
                if name == current {
                    slot.deliver_error(err.clone_shallow());
                } else {
                    keep.push(slot);
                }
            }
            for slot in keep {
                self.queue.push(slot);
            }
        } else if !err.is_socket() {
            // Transient socket failures leave the queue alone and retry;
            // anything else (TLS, timeouts) fails every queued request.
            for mut slot in self.queue.take_all() {
                slot.deliver_error(err.clone_shallow());
            }
        }

        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        // A closing client still reconnects: pending requests are allowed
        // to finish. Only destruction stops the retry loop.
        if self.destroyed || self.queue.pending() == 0 {
            return;
        }
        if self.retry_delay > Duration::ZERO {
            debug!(delay_ms = self.retry_delay.as_millis() as u64, "reconnect scheduled");
            self.retry_timer = Some(Box::pin(tokio::time::sleep(self.retry_delay)));
            self.retry_delay = cmp::min(self.retry_delay * 2, self.opts.connect_timeout);
        } else {
            // First failure reconnects immediately; the next one backs off.
            self.retry_delay = Duration::from_secs(1);
        }
    }

    // ===== writing =====

    fn write_request(&mut self) {
        let host = self.shared.origin.host_header();
        let pipelining = self.opts.pipelining;
        let slot = self.queue.peek_pending_mut().expect("write without pending");

        let abort = slot.req.abort_handle();
        slot.handler.on_connect(&abort);
        if slot.req.token.is_cancelled() {
            // Aborted from inside on_connect; the scheduler splices it out.
            slot.req.aborted = true;
            return;
        }

        encode::encode_head(&mut self.write_buf, &slot.req, pipelining, &host);

        let body = slot.req.body.take().unwrap_or(BodyKind::Empty);
        let declared = slot.req.content_length;
        let expects_payload = slot.req.expects_payload;

        match body {
            BodyKind::Empty => {
                slot.req.body = Some(BodyKind::Empty);
                encode::encode_no_body(&mut self.write_buf, declared == Some(0) && expects_payload);
            }
            BodyKind::Full(bytes) => {
                encode::encode_content_length(&mut self.write_buf, bytes.len() as u64);
                self.write_buf.extend_from_slice(&bytes);
                self.write_buf.extend_from_slice(b"\r\n");
                // Refcounted clone kept in case the request is retried.
                slot.req.body = Some(BodyKind::Full(bytes));
                if !expects_payload {
                    self.reset = true;
                }
            }
            BodyKind::Stream(stream) => {
                // Streams are not replayable; the slot keeps no copy.
                let declared = declared.or(stream.length);
                self.writing = Some(WritingBody {
                    body: stream,
                    declared,
                    sent: 0,
                    started: false,
                    expects_payload,
                });
            }
        }

        trace!(id = slot.req.id, "request written");
        self.queue.mark_written();
    }

    fn poll_write(&mut self, cx: &mut Context<'_>) -> bool {
        let mut progress = false;
        loop {
            if self.write_buf.is_empty() && !self.pump_body(cx) && self.write_buf.is_empty() {
                break;
            }
            if self.write_buf.is_empty() {
                continue;
            }
            let io = match self.socket {
                SocketState::Connected(ref mut io) => io,
                _ => break,
            };
            match Pin::new(io).poll_write(cx, self.write_buf.chunk()) {
                Poll::Pending => break,
                Poll::Ready(Ok(0)) => {
                    self.destroy_socket(Error::new_socket("socket closed for writing"));
                    return true;
                }
                Poll::Ready(Ok(n)) => {
                    self.write_buf.advance(n);
                    progress = true;
                }
                Poll::Ready(Err(e)) => {
                    self.destroy_socket(Error::new_socket_io(e));
                    return true;
                }
            }
        }
        if let SocketState::Connected(ref mut io) = self.socket {
            // TLS layers buffer; a pending flush just means the waker is
            // registered.
            let _ = Pin::new(io).poll_flush(cx);
        }
        progress
    }

    /// Pull the next chunk of a streaming body into the write buffer.
    /// Returns true if the write state advanced.
    fn pump_body(&mut self, cx: &mut Context<'_>) -> bool {
        enum Step {
            Chunk(Bytes),
            End,
            Fail(Error),
        }

        if !matches!(self.socket, SocketState::Connected(_)) {
            return false;
        }
        let step = {
            let writing = match self.writing.as_mut() {
                Some(writing) => writing,
                None => return false,
            };
            match writing.body.poll_chunk(cx) {
                Poll::Pending => return false,
                Poll::Ready(Some(Ok(chunk))) => Step::Chunk(chunk),
                Poll::Ready(Some(Err(e))) => {
                    Step::Fail(Error::new_socket("request body failed").with(e))
                }
                Poll::Ready(None) => Step::End,
            }
        };

        match step {
            Step::Chunk(chunk) => {
                if chunk.is_empty() {
                    return true;
                }
                let writing = self.writing.as_mut().expect("writing state");
                if let Some(declared) = writing.declared {
                    if writing.sent + chunk.len() as u64 > declared {
                        if self.opts.strict_content_length {
                            self.fail_current_write(Error::new_content_length_mismatch());
                            return true;
                        }
                        warn!("request body exceeds declared content-length");
                    }
                }
                let writing = self.writing.as_mut().expect("writing state");
                if !writing.started {
                    writing.started = true;
                    match writing.declared {
                        Some(declared) => {
                            encode::encode_content_length(&mut self.write_buf, declared)
                        }
                        None => encode::encode_chunked_start(&mut self.write_buf),
                    }
                }
                if writing.declared.is_none() {
                    encode::encode_chunk_frame(&mut self.write_buf, chunk.len());
                }
                writing.sent += chunk.len() as u64;
                self.write_buf.extend_from_slice(&chunk);
                true
            }
            Step::End => {
                self.finish_writing();
                true
            }
            Step::Fail(err) => {
                self.fail_current_write(err);
                true
            }
        }
    }

    fn finish_writing(&mut self) {
        let writing = self.writing.take().expect("finish without writing");
        match writing.declared {
            Some(declared) => {
                if writing.sent != declared {
                    if self.opts.strict_content_length {
                        self.writing = None;
                        self.fail_current_write(Error::new_content_length_mismatch());
                        return;
                    }
                    warn!(
                        sent = writing.sent,
                        declared, "request body diverged from content-length"
                    );
                }
                if !writing.started {
                    encode::encode_content_length(&mut self.write_buf, writing.sent);
                }
                self.write_buf.extend_from_slice(b"\r\n");
            }
            None => {
                if !writing.started {
                    encode::encode_chunked_start(&mut self.write_buf);
                }
                self.write_buf.extend_from_slice(encode::CHUNKED_TERMINATOR);
            }
        }
        if !writing.expects_payload {
            self.reset = true;
        }
    }

    fn fail_current_write(&mut self, err: Error) {
        self.writing = None;
        if let Some(slot) = self.queue.head_running_mut() {
            slot.deliver_error(err.clone_shallow());
        }
        self.destroy_socket(err);
    }

    // ===== reading =====

    fn message_context(&self) -> MessageContext {
        match self.queue.head_running() {
            Some(slot) => MessageContext {
                head_request: slot.req.method == Method::HEAD,
                request_upgrade: slot.req.upgrade.is_some(),
            },
            None => MessageContext::default(),
        }
    }

    fn poll_read(&mut self, cx: &mut Context<'_>) -> bool {
        let mut progress = false;
        loop {
            if self.drain_parser_events() {
                progress = true;
            }
            if self.paused || self.saw_eof {
                break;
            }
            let io = match self.socket {
                SocketState::Connected(ref mut io) => io,
                _ => break,
            };
            match poll_read_buf(Pin::new(io), cx, &mut self.read_buf) {
                Poll::Pending => break,
                Poll::Ready(Ok(0)) => {
                    progress = true;
                    self.saw_eof = true;
                    // An EOF-delimited body completes here; anything else
                    // mid-flight is a peer close.
                    self.drain_parser_events();
                    if matches!(self.socket, SocketState::Connected(_)) {
                        self.destroy_socket(Error::new_socket("other side closed"));
                    }
                    break;
                }
                Poll::Ready(Ok(_n)) => {
                    progress = true;
                }
                Poll::Ready(Err(e)) => {
                    progress = true;
                    self.destroy_socket(Error::new_socket_io(e));
                    break;
                }
            }
        }
        progress
    }

    fn drain_parser_events(&mut self) -> bool {
        let mut progress = false;
        loop {
            if self.paused || !matches!(self.socket, SocketState::Connected(_)) {
                break;
            }
            if self.queue.running() == 0 && self.parser.is_idle() {
                if self.read_buf.is_empty() {
                    break;
                }
                progress = true;
                self.destroy_socket(Error::new_socket("unexpected data on connection"));
                break;
            }
            let ctx = self.message_context();
            match self.parser.advance(&mut self.read_buf, self.saw_eof, ctx) {
                Ok(None) => break,
                Ok(Some(event)) => {
                    progress = true;
                    self.on_event(event);
                }
                Err(err) => {
                    progress = true;
                    self.destroy_socket(err);
                    break;
                }
            }
        }
        progress
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Informational(status) => {
                trace!(status = status.as_u16(), "informational response skipped");
                self.timer_refresh = true;
            }
            Event::Headers(head) => self.on_headers(head),
            Event::Data(chunk) => self.on_data(chunk),
            Event::Complete { trailers } => self.on_complete(trailers),
            Event::Upgrade(head) => self.on_upgrade(head),
        }
    }

    fn on_headers(&mut self, head: ResponseHead) {
        self.apply_keep_alive(head.keep_alive_timeout);

        self.msg = Some(MessageState {
            keep_alive: head.keep_alive,
            trailers_advertised: head.trailers_advertised,
        });
        self.timer_refresh = true;

        let flow = FlowControl::new(self.ops_tx.clone());
        let slot = self.queue.head_running_mut().expect("headers without request");
        if slot.req.method == Method::HEAD {
            // The body framing of a HEAD response is unverifiable; never
            // reuse the connection after one.
            self.reset = true;
        }
        if slot.errored {
            return;
        }
        if !slot.handler.on_headers(head.status, &head.headers, &flow) {
            self.paused = true;
        }
    }

    fn apply_keep_alive(&mut self, hint: Option<Duration>) {
        match hint {
            Some(advertised) => {
                let capped = cmp::min(advertised, self.opts.keep_alive_max_timeout);
                if capped <= self.opts.keep_alive_timeout_threshold {
                    self.reset = true;
                } else {
                    self.idle_timeout = capped - self.opts.keep_alive_timeout_threshold;
                }
            }
            None => self.idle_timeout = self.opts.keep_alive_timeout,
        }
    }

    fn on_data(&mut self, chunk: Bytes) {
        self.timer_refresh = true;
        let errored = self
            .queue
            .head_running()
            .map(|slot| slot.errored)
            .unwrap_or(true);
        if errored {
            let budget = self.discard.get_or_insert(self.opts.max_aborted_payload);
            if chunk.len() > *budget {
                self.destroy_socket(Error::new_aborted());
                return;
            }
            *budget -= chunk.len();
            return;
        }
        let slot = self.queue.head_running_mut().expect("data without request");
        if !slot.handler.on_data(chunk) {
            self.paused = true;
        }
    }

    fn on_complete(&mut self, trailers: http::HeaderMap) {
        let msg = self.msg.take().expect("complete without headers");
        self.discard = None;

        let mismatch = msg
            .trailers_advertised
            .iter()
            .any(|name| !trailers.contains_key(name.as_str()));
        if mismatch {
            if let Some(slot) = self.queue.head_running_mut() {
                slot.deliver_error(Error::new_trailer_mismatch());
            }
            self.destroy_socket(Error::new_trailer_mismatch());
            return;
        }

        let mut slot = self.queue.complete_head().expect("complete without request");
        if !slot.errored {
            slot.handler.on_complete(&trailers);
        }
        drop(slot);

        if self.writing.is_some() {
            // The response finished before we finished writing its request.
            self.destroy_socket(Error::new_info("reset"));
        } else if !msg.keep_alive {
            self.destroy_socket(Error::new_info("reset"));
        } else if self.reset && self.queue.running() == 0 {
            self.destroy_socket(Error::new_info("reset"));
        }
    }

    fn on_upgrade(&mut self, head: ResponseHead) {
        let io = match std::mem::replace(&mut self.socket, SocketState::None) {
            SocketState::Connected(io) => io,
            _ => unreachable!("upgrade without socket"),
        };
        let head_bytes = self.read_buf.split().freeze();
        self.parser = Parser::new(self.opts.max_header_size);
        self.msg = None;
        self.discard = None;
        self.writing = None;
        self.paused = false;
        self.saw_eof = false;
        self.reset = false;

        let mut slot = self.queue.complete_head().expect("upgrade without request");
        if !slot.errored {
            debug!(status = head.status.as_u16(), "connection upgraded");
            slot.handler
                .on_upgrade(head.status, head.headers, Upgraded::from_boxed(io, head_bytes));
        }
        drop(slot);

        let info = Error::new_info("upgrade");
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.emit(ClientEvent::Disconnect {
            code: info.code(),
            message: info.to_string(),
        });
    }

    // ===== teardown =====

    fn destroy_socket(&mut self, err: Error) {
        let was_connected = matches!(self.socket, SocketState::Connected(_));
        self.socket = SocketState::None;
        self.parser = Parser::new(self.opts.max_header_size);
        self.read_buf.clear();
        self.write_buf.clear();
        self.saw_eof = false;
        self.paused = false;
        self.reset = false;
        self.msg = None;
        self.discard = None;
        self.writing = None;

        let code = err.code();
        let message = err.to_string();

        let (head, retried) = self.queue.teardown();
        if let Some(mut head) = head {
            head.deliver_error(err);
        }
        if retried > 0 {
            debug!(retried, "requeued idempotent requests after disconnect");
        }

        self.schedule_retry();

        if was_connected {
            self.shared.connected.store(false, Ordering::SeqCst);
            self.shared.emit(ClientEvent::Disconnect { code, message });
        }
    }

    fn begin_destroy(&mut self, err: Option<Error>) {
        self.closed = true;
        self.shared.closed.store(true, Ordering::SeqCst);
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.shared.destroyed.store(true, Ordering::SeqCst);
        debug!("client destroyed");

        let err = err.unwrap_or_else(Error::new_destroyed);
        for mut slot in self.queue.take_pending() {
            slot.deliver_error(err.clone_shallow());
        }
        if !matches!(self.socket, SocketState::None) || self.queue.running() > 0 {
            self.destroy_socket(err);
        }
        // Teardown re-enqueued any running tail; those drain as destroyed.
        for mut slot in self.queue.take_all() {
            slot.deliver_error(Error::new_destroyed());
        }
    }

    // ===== timers =====

    fn poll_timers(&mut self, cx: &mut Context<'_>) -> bool {
        let mut progress = false;
        if let Some(timer) = self.retry_timer.as_mut() {
            if timer.as_mut().poll(cx).is_ready() {
                self.retry_timer = None;
                progress = true;
            }
        }
        if let Some(timer) = self.timer.as_mut() {
            if timer.as_mut().poll(cx).is_ready() {
                let phase = self.timer_phase;
                self.timer = None;
                self.timer_phase = TimerPhase::Off;
                progress = true;
                self.on_timer(phase);
            }
        }
        progress
    }

    fn on_timer(&mut self, phase: TimerPhase) {
        match phase {
            TimerPhase::Off => {}
            TimerPhase::Headers => {
                debug!("headers timeout");
                self.destroy_socket(Error::new_headers_timeout());
            }
            TimerPhase::Body => {
                debug!("body timeout");
                self.destroy_socket(Error::new_body_timeout());
            }
            TimerPhase::Idle => {
                if self.queue.is_empty() && matches!(self.socket, SocketState::Connected(_)) {
                    debug!("keep-alive expired");
                    self.destroy_socket(Error::new_idle_timeout());
                }
            }
        }
    }

    fn update_timer(&mut self) {
        let connected = matches!(self.socket, SocketState::Connected(_));
        let desired = if self.destroyed || !connected {
            None
        } else if self.queue.running() > 0 {
            let slot = self.queue.head_running().expect("running without head");
            if self.msg.is_some() {
                Some((TimerPhase::Body, slot.req.body_timeout))
            } else {
                Some((TimerPhase::Headers, slot.req.headers_timeout))
            }
        } else if self.queue.is_empty() {
            Some((TimerPhase::Idle, self.idle_timeout))
        } else {
            None
        };

        // Zero disables the phase entirely.
        let desired = desired.filter(|(_, dur)| *dur > Duration::ZERO);

        match desired {
            None => {
                self.timer = None;
                self.timer_phase = TimerPhase::Off;
                self.timer_duration = Duration::ZERO;
            }
            Some((phase, duration)) => {
                let rearm = self.timer_refresh
                    || phase != self.timer_phase
                    || duration != self.timer_duration;
                if rearm || self.timer.is_none() {
                    let deadline = Instant::now() + duration;
                    match self.timer.as_mut() {
                        Some(timer) => timer.as_mut().reset(deadline),
                        None => self.timer = Some(Box::pin(tokio::time::sleep_until(deadline))),
                    }
                    self.timer_phase = phase;
                    self.timer_duration = duration;
                }
            }
        }
        self.timer_refresh = false;
    }

    // ===== the scheduler =====

    /// One pass of the dispatch loop. Returns true if anything changed;
    /// the caller keeps polling the pumps while it does.
    fn resume(&mut self) -> bool {
        let mut changed = false;
        loop {
            if self.destroyed {
                let slots = self.queue.take_all();
                if slots.is_empty() {
                    return changed;
                }
                for mut slot in slots {
                    slot.deliver_error(Error::new_destroyed());
                }
                changed = true;
                continue;
            }

            if self.queue.is_empty() {
                if self.closed {
                    self.begin_destroy(None);
                    changed = true;
                    continue;
                }
                self.queue.reset_if_empty();
                return changed;
            }

            if self.queue.running() >= self.cap() {
                return changed;
            }
            if self.queue.pending() == 0 {
                return changed;
            }

            {
                let slot = self.queue.peek_pending().expect("pending head");
                if slot.req.aborted || slot.req.token.is_cancelled() {
                    let mut slot = self.queue.remove_pending_head().expect("pending head");
                    slot.req.aborted = true;
                    slot.deliver_error(Error::new_aborted());
                    changed = true;
                    continue;
                }
            }

            let want_name = {
                let slot = self.queue.peek_pending().expect("pending head");
                slot.req
                    .servername
                    .clone()
                    .or_else(|| self.default_servername.clone())
            };
            if want_name != self.servername {
                if self.queue.running() > 0 {
                    // Drain the pipeline before switching SNI.
                    return changed;
                }
                self.servername = want_name;
                if !matches!(self.socket, SocketState::None) {
                    self.destroy_socket(Error::new_info("servername changed"));
                    changed = true;
                }
                return changed;
            }

            match self.socket {
                SocketState::None => {
                    if self.retry_timer.is_none() {
                        self.start_connect();
                        changed = true;
                    }
                    return changed;
                }
                SocketState::Connecting(_) => return changed,
                SocketState::Connected(_) => {}
            }

            if self.reset || self.writing.is_some() {
                return changed;
            }

            {
                let slot = self.queue.peek_pending().expect("pending head");
                let req = &slot.req;
                let exclusive = !req.idempotent || req.body_is_stream || req.upgrade.is_some();
                if self.queue.running() > 0 && exclusive {
                    return changed;
                }
            }

            {
                // A stream that promises zero bytes is just an empty body.
                let slot = self.queue.peek_pending_mut().expect("pending head");
                if slot.req.body_is_stream {
                    let zero = match slot.req.body {
                        Some(BodyKind::Stream(ref s)) => {
                            s.length == Some(0) || slot.req.content_length == Some(0)
                        }
                        _ => false,
                    };
                    if zero {
                        slot.req.body = Some(BodyKind::Empty);
                        slot.req.body_is_stream = false;
                    }
                }
            }

            self.write_request();
            changed = true;
        }
    }

    // ===== bookkeeping =====

    fn sync_state(&mut self) {
        self.update_timer();
        let shared = &self.shared;
        shared.pending.store(self.queue.pending(), Ordering::SeqCst);
        shared.running.store(self.queue.running(), Ordering::SeqCst);
        shared
            .connected
            .store(matches!(self.socket, SocketState::Connected(_)), Ordering::SeqCst);
        shared
            .writing
            .store(self.writing.is_some(), Ordering::SeqCst);
        shared.reset.store(self.reset, Ordering::SeqCst);

        if shared.busy() {
            let _ = shared
                .need_drain
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst);
        } else if shared.need_drain.swap(0, Ordering::SeqCst) != 0 {
            shared.emit(ClientEvent::Drain);
        }
    }

    fn finished(&mut self) -> bool {
        if self.destroyed && matches!(self.socket, SocketState::None) {
            for ack in self.on_destroyed.drain(..) {
                let _ = ack.send(());
            }
            if self.ops_closed {
                return true;
            }
        }
        false
    }
}

impl Future for ConnDriver {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        loop {
            let mut progress = false;
            progress |= this.poll_ops(cx);
            progress |= this.poll_aborts(cx);
            progress |= this.poll_connect(cx);
            progress |= this.poll_timers(cx);
            progress |= this.poll_write(cx);
            progress |= this.poll_read(cx);
            progress |= this.resume();
            this.sync_state();
            if this.finished() {
                return Poll::Ready(());
            }
            if !progress {
                return Poll::Pending;
            }
        }
    }
}
