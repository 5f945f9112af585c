//! The request queue.
//!
//! One `Vec` of slots, partitioned by two indices:
//!
//! ```text
//! [0, run_idx)        completed, nulled
//! [run_idx, pend_idx) running: written, awaiting a response
//! [pend_idx, len)     pending: not yet written
//! ```
//!
//! Completed slots are cleared in place and the prefix is only compacted
//! once `run_idx` passes a threshold, keeping per-request cost amortized
//! O(1). The parser always works on the slot at `run_idx`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::handler::Handler;
use crate::request::QueuedRequest;

/// Compact the completed prefix once it grows past this many slots.
const COMPACT_THRESHOLD: usize = 256;

pub(crate) struct Slot {
    pub(crate) req: QueuedRequest,
    pub(crate) handler: Box<dyn Handler>,
    /// Set once `on_error` fired; no further callbacks may be delivered.
    pub(crate) errored: bool,
    size: Arc<AtomicUsize>,
}

impl Slot {
    pub(crate) fn new(
        req: QueuedRequest,
        handler: Box<dyn Handler>,
        size: Arc<AtomicUsize>,
    ) -> Slot {
        Slot {
            req,
            handler,
            errored: false,
            size,
        }
    }

    pub(crate) fn deliver_error(&mut self, err: crate::error::Error) {
        if !self.errored {
            self.errored = true;
            self.handler.on_error(err);
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.size.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct Queue {
    slots: Vec<Option<Slot>>,
    run_idx: usize,
    pend_idx: usize,
}

impl Queue {
    pub(crate) fn new() -> Queue {
        Queue {
            slots: Vec::new(),
            run_idx: 0,
            pend_idx: 0,
        }
    }

    pub(crate) fn push(&mut self, slot: Slot) {
        self.slots.push(Some(slot));
        self.check();
    }

    /// Requests written but not yet answered.
    pub(crate) fn running(&self) -> usize {
        self.pend_idx - self.run_idx
    }

    /// Requests not yet written.
    pub(crate) fn pending(&self) -> usize {
        self.slots.len() - self.pend_idx
    }

    /// All live requests.
    pub(crate) fn size(&self) -> usize {
        self.slots.len() - self.run_idx
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub(crate) fn peek_pending(&self) -> Option<&Slot> {
        self.slots.get(self.pend_idx).map(|s| {
            s.as_ref()
                .expect("pending region must not contain nulled slots")
        })
    }

    pub(crate) fn peek_pending_mut(&mut self) -> Option<&mut Slot> {
        self.slots.get_mut(self.pend_idx).map(|s| {
            s.as_mut()
                .expect("pending region must not contain nulled slots")
        })
    }

    /// Splice the head pending slot out of the queue.
    pub(crate) fn remove_pending_head(&mut self) -> Option<Slot> {
        if self.pending() == 0 {
            return None;
        }
        let slot = self.slots.remove(self.pend_idx);
        self.check();
        slot
    }

    /// The head pending slot was written; it is now running.
    pub(crate) fn mark_written(&mut self) {
        debug_assert!(self.pend_idx < self.slots.len());
        self.pend_idx += 1;
        self.check();
    }

    pub(crate) fn head_running(&self) -> Option<&Slot> {
        if self.running() == 0 {
            return None;
        }
        self.slots[self.run_idx].as_ref()
    }

    pub(crate) fn head_running_mut(&mut self) -> Option<&mut Slot> {
        if self.running() == 0 {
            return None;
        }
        self.slots[self.run_idx].as_mut()
    }

    /// The head running request finished; null its slot and advance.
    pub(crate) fn complete_head(&mut self) -> Option<Slot> {
        if self.running() == 0 {
            return None;
        }
        let slot = self.slots[self.run_idx].take();
        self.run_idx += 1;
        self.maybe_compact();
        self.check();
        slot
    }

    /// Drop the completed prefix once it is long enough to matter.
    fn maybe_compact(&mut self) {
        if self.run_idx > COMPACT_THRESHOLD {
            self.slots.drain(..self.run_idx);
            self.pend_idx -= self.run_idx;
            self.run_idx = 0;
        }
    }

    /// Reset indices when nothing is queued.
    pub(crate) fn reset_if_empty(&mut self) {
        if self.is_empty() {
            self.slots.clear();
            self.run_idx = 0;
            self.pend_idx = 0;
        }
    }

    /// Find a live slot by request id. Returns its zone.
    pub(crate) fn zone_of(&self, id: u64) -> Option<Zone> {
        for (i, slot) in self.slots.iter().enumerate().skip(self.run_idx) {
            let slot = match slot {
                Some(slot) => slot,
                None => continue,
            };
            if slot.req.id == id {
                return Some(if i == self.run_idx && self.running() > 0 {
                    Zone::RunningHead
                } else if i < self.pend_idx {
                    Zone::RunningTail
                } else {
                    Zone::Pending
                });
            }
        }
        None
    }

    /// A mutable reference to any live slot by id.
    pub(crate) fn slot_by_id_mut(&mut self, id: u64) -> Option<&mut Slot> {
        self.slots
            .iter_mut()
            .skip(self.run_idx)
            .flatten()
            .find(|slot| slot.req.id == id)
    }

    /// Remove a pending slot by id.
    pub(crate) fn remove_pending_by_id(&mut self, id: u64) -> Option<Slot> {
        let pos = (self.pend_idx..self.slots.len()).find(|&i| {
            self.slots[i]
                .as_ref()
                .map(|s| s.req.id == id)
                .unwrap_or(false)
        })?;
        let slot = self.slots.remove(pos);
        self.check();
        slot
    }

    /// Tear down after a socket loss: the head running request is returned
    /// for its error, the remaining running slots are re-enqueued at the
    /// front of the pending region to be rewritten on the next connection.
    pub(crate) fn teardown(&mut self) -> (Option<Slot>, usize) {
        let head = if self.running() > 0 {
            self.slots[self.run_idx].take()
        } else {
            None
        };

        let start = if head.is_some() {
            self.run_idx + 1
        } else {
            self.run_idx
        };
        let retried = self.pend_idx.saturating_sub(start);
        let mut rest: Vec<Option<Slot>> = self.slots.drain(start..).collect();
        debug_assert!(rest.iter().all(|s| s.is_some()));
        self.slots.clear();
        self.slots.append(&mut rest);
        self.run_idx = 0;
        self.pend_idx = 0;
        self.check();
        (head, retried)
    }

    /// Take every pending slot, leaving running ones in place.
    pub(crate) fn take_pending(&mut self) -> Vec<Slot> {
        self.slots
            .drain(self.pend_idx..)
            .map(|s| s.expect("pending region must not contain nulled slots"))
            .collect()
    }

    /// Take every live slot, running and pending.
    pub(crate) fn take_all(&mut self) -> Vec<Slot> {
        let taken = self.slots.drain(self.run_idx..).flatten().collect();
        self.run_idx = 0;
        self.pend_idx = 0;
        self.slots.clear();
        taken
    }

    fn check(&self) {
        debug_assert!(self.run_idx <= self.pend_idx);
        debug_assert!(self.pend_idx <= self.slots.len());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Zone {
    RunningHead,
    RunningTail,
    Pending,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::request::Request;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct NoopHandler {
        errors: Arc<AtomicUsize>,
    }

    impl Handler for NoopHandler {
        fn on_headers(
            &mut self,
            _status: StatusCode,
            _headers: &HeaderMap,
            _flow: &crate::FlowControl,
        ) -> bool {
            true
        }

        fn on_data(&mut self, _chunk: Bytes) -> bool {
            true
        }

        fn on_complete(&mut self, _trailers: &HeaderMap) {}

        fn on_error(&mut self, _err: Error) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn slot(id: u64, errors: &Arc<AtomicUsize>) -> Slot {
        let valid = Request::get("/").validate().unwrap();
        let req = QueuedRequest {
            id,
            body_is_stream: false,
            content_length: None,
            method: valid.method,
            path: valid.path,
            headers: Some(valid.headers),
            body: Some(valid.body.into_kind()),
            idempotent: valid.idempotent,
            expects_payload: valid.expects_payload,
            upgrade: None,
            servername: None,
            headers_timeout: std::time::Duration::from_secs(30),
            body_timeout: std::time::Duration::from_secs(30),
            token: Default::default(),
            done: Default::default(),
            aborted: false,
        };
        Slot::new(
            req,
            Box::new(NoopHandler {
                errors: errors.clone(),
            }),
            Arc::new(AtomicUsize::new(0)),
        )
    }

    #[test]
    fn partitions_track_writes_and_completions() {
        let errors = Arc::new(AtomicUsize::new(0));
        let mut queue = Queue::new();
        for id in 0..3 {
            queue.push(slot(id, &errors));
        }
        assert_eq!((queue.running(), queue.pending(), queue.size()), (0, 3, 3));

        queue.mark_written();
        queue.mark_written();
        assert_eq!((queue.running(), queue.pending(), queue.size()), (2, 1, 3));

        let done = queue.complete_head().unwrap();
        assert_eq!(done.req.id, 0);
        assert_eq!((queue.running(), queue.pending(), queue.size()), (1, 1, 2));
    }

    #[test]
    fn compaction_resets_indices() {
        let errors = Arc::new(AtomicUsize::new(0));
        let mut queue = Queue::new();
        for id in 0..(COMPACT_THRESHOLD as u64 + 2) {
            queue.push(slot(id, &errors));
        }
        for _ in 0..(COMPACT_THRESHOLD + 1) {
            queue.mark_written();
            queue.complete_head().unwrap();
        }
        // The completed prefix was dropped; the survivor is still pending.
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.peek_pending().unwrap().req.id, COMPACT_THRESHOLD as u64 + 1);
    }

    #[test]
    fn teardown_errors_head_and_requeues_tail() {
        let errors = Arc::new(AtomicUsize::new(0));
        let mut queue = Queue::new();
        for id in 0..4 {
            queue.push(slot(id, &errors));
        }
        queue.mark_written();
        queue.mark_written();
        queue.mark_written();

        let (head, retried) = queue.teardown();
        assert_eq!(head.unwrap().req.id, 0);
        assert_eq!(retried, 2);
        assert_eq!(queue.running(), 0);
        assert_eq!(queue.pending(), 3);
        // Original order is preserved.
        assert_eq!(queue.peek_pending().unwrap().req.id, 1);
    }

    #[test]
    fn remove_pending_by_id_splices() {
        let errors = Arc::new(AtomicUsize::new(0));
        let mut queue = Queue::new();
        for id in 0..3 {
            queue.push(slot(id, &errors));
        }
        queue.mark_written();

        assert_eq!(queue.zone_of(0), Some(Zone::RunningHead));
        assert_eq!(queue.zone_of(1), Some(Zone::Pending));

        let removed = queue.remove_pending_by_id(1).unwrap();
        assert_eq!(removed.req.id, 1);
        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.peek_pending().unwrap().req.id, 2);
        assert!(queue.remove_pending_by_id(0).is_none());
    }

    #[test]
    fn deliver_error_fires_once() {
        let errors = Arc::new(AtomicUsize::new(0));
        let mut s = slot(7, &errors);
        s.deliver_error(Error::new_aborted());
        s.deliver_error(Error::new_socket("again"));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reset_if_empty_clears_indices() {
        let errors = Arc::new(AtomicUsize::new(0));
        let mut queue = Queue::new();
        queue.push(slot(0, &errors));
        queue.mark_written();
        queue.complete_head().unwrap();
        queue.reset_if_empty();
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.running(), 0);
        assert_eq!(queue.pending(), 0);
    }
}
