#![allow(dead_code)]

pub mod server;

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use elva::{Error, FlowControl, Handler};
use http::{HeaderMap, StatusCode};
use tokio::sync::mpsc;

/// What finally happened to a dispatched request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Complete,
    Error(String),
}

#[derive(Debug, Default)]
pub struct State {
    pub statuses: Vec<u16>,
    pub body: Vec<u8>,
    pub completed: usize,
    pub errors: Vec<String>,
}

/// A handler that records everything it sees and reports terminal events
/// over a channel.
pub struct Recorder {
    state: Arc<Mutex<State>>,
    log: Option<(&'static str, Arc<Mutex<Vec<String>>>)>,
    tx: mpsc::UnboundedSender<Terminal>,
}

pub struct Probe {
    state: Arc<Mutex<State>>,
    rx: mpsc::UnboundedReceiver<Terminal>,
}

pub fn recorder() -> (Recorder, Probe) {
    let state = Arc::new(Mutex::new(State::default()));
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Recorder {
            state: state.clone(),
            log: None,
            tx,
        },
        Probe { state, rx },
    )
}

/// A recorder that also appends `label:event` lines to a shared log, for
/// cross-request ordering assertions.
pub fn recorder_with_log(
    label: &'static str,
    log: Arc<Mutex<Vec<String>>>,
) -> (Recorder, Probe) {
    let (mut rec, probe) = recorder();
    rec.log = Some((label, log));
    (rec, probe)
}

impl Recorder {
    fn log(&self, event: &str) {
        if let Some((label, ref log)) = self.log {
            log.lock().unwrap().push(format!("{}:{}", label, event));
        }
    }
}

impl Handler for Recorder {
    fn on_headers(&mut self, status: StatusCode, _headers: &HeaderMap, _flow: &FlowControl) -> bool {
        self.log("headers");
        self.state.lock().unwrap().statuses.push(status.as_u16());
        true
    }

    fn on_data(&mut self, chunk: Bytes) -> bool {
        self.state.lock().unwrap().body.extend_from_slice(&chunk);
        true
    }

    fn on_complete(&mut self, _trailers: &HeaderMap) {
        self.log("complete");
        self.state.lock().unwrap().completed += 1;
        let _ = self.tx.send(Terminal::Complete);
    }

    fn on_error(&mut self, err: Error) {
        self.log("error");
        self.state
            .lock()
            .unwrap()
            .errors
            .push(err.code().to_string());
        let _ = self.tx.send(Terminal::Error(err.code().to_string()));
    }
}

impl Probe {
    /// Wait for the request to finish one way or the other.
    pub async fn terminal(&mut self) -> Terminal {
        self.rx.recv().await.expect("request never finished")
    }

    pub async fn expect_complete(&mut self) {
        assert_eq!(self.terminal().await, Terminal::Complete);
    }

    pub async fn expect_error(&mut self, code: &str) {
        match self.terminal().await {
            Terminal::Error(got) => assert_eq!(got, code),
            Terminal::Complete => panic!("expected {} but request completed", code),
        }
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

/// Collect every event currently waiting in a broadcast receiver.
pub fn drain_events(
    rx: &mut tokio::sync::broadcast::Receiver<elva::ClientEvent>,
) -> Vec<elva::ClientEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn count_connects(events: &[elva::ClientEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, elva::ClientEvent::Connect))
        .count()
}

pub fn count_disconnects(events: &[elva::ClientEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, elva::ClientEvent::Disconnect { .. }))
        .count()
}

pub fn count_drains(events: &[elva::ClientEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, elva::ClientEvent::Drain))
        .count()
}
