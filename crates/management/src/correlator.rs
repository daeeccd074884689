//! Pending-request table keyed by correlation id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use qdmetrics_amqp::{Message, Value};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::query::ManagementReply;
use crate::{ManagementError, ManagementResult};

/// Receives the outcome of one request.
pub type ReplyReceiver = oneshot::Receiver<ManagementResult<ManagementReply>>;

#[derive(Debug)]
struct PendingRequest {
    tx: oneshot::Sender<ManagementResult<ManagementReply>>,
    created: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    pending: HashMap<u64, PendingRequest>,
}

/// Matches replies to outstanding requests.
///
/// Every entry is removed exactly once: by its reply, by cancellation or by
/// [`Correlator::fail_all`].
#[derive(Debug, Clone, Default)]
pub struct Correlator {
    inner: Arc<Mutex<Inner>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an id that is not currently pending and registers it.
    pub fn allocate(&self) -> (u64, ReplyReceiver) {
        let mut inner = self.inner.lock();
        let mut id = inner.next_id;
        while inner.pending.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        inner.next_id = id.wrapping_add(1);

        let (tx, rx) = oneshot::channel();
        inner.pending.insert(
            id,
            PendingRequest {
                tx,
                created: Instant::now(),
            },
        );
        trace!(id, depth = inner.pending.len(), "registered request");
        (id, rx)
    }

    /// Registers a caller-chosen id. Fails if the id is already pending.
    pub fn register(&self, id: u64) -> ManagementResult<ReplyReceiver> {
        let mut inner = self.inner.lock();
        if inner.pending.contains_key(&id) {
            return Err(ManagementError::protocol(format!(
                "correlation id {id} is already pending"
            )));
        }
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(
            id,
            PendingRequest {
                tx,
                created: Instant::now(),
            },
        );
        Ok(rx)
    }

    /// Completes the request the message answers. Returns false for
    /// messages that match nothing pending.
    pub fn resolve(&self, message: Message) -> bool {
        let Some(id) = message.correlation_id().and_then(correlation_key) else {
            debug!("ignoring message without a usable correlation id");
            return false;
        };

        let Some(entry) = self.inner.lock().pending.remove(&id) else {
            debug!(id, "ignoring reply for unknown correlation id");
            return false;
        };

        trace!(id, elapsed_ms = entry.created.elapsed().as_millis() as u64, "reply matched");
        // The caller may have stopped waiting; the entry is gone either way.
        let _ = entry.tx.send(ManagementReply::from_message(message));
        true
    }

    /// Removes a pending entry without completing it.
    pub fn cancel(&self, id: u64) -> bool {
        self.inner.lock().pending.remove(&id).is_some()
    }

    /// Fails every pending request. Returns how many were failed.
    pub fn fail_all<F>(&self, make_error: F) -> usize
    where
        F: Fn() -> ManagementError,
    {
        let drained: Vec<_> = self.inner.lock().pending.drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.tx.send(Err(make_error()));
        }
        count
    }

    /// Number of requests awaiting a reply.
    pub fn depth(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Age of the oldest pending request.
    pub fn oldest_pending(&self) -> Option<Duration> {
        self.inner
            .lock()
            .pending
            .values()
            .map(|entry| entry.created.elapsed())
            .max()
    }

    /// Cancels `id` when the guard is dropped unless it was disarmed.
    pub fn guard(&self, id: u64) -> PendingGuard {
        PendingGuard {
            correlator: self.clone(),
            id,
            armed: true,
        }
    }
}

/// Removes a pending entry if its waiter goes away early.
#[derive(Debug)]
pub struct PendingGuard {
    correlator: Correlator,
    id: u64,
    armed: bool,
}

impl PendingGuard {
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed {
            self.correlator.cancel(self.id);
        }
    }
}

fn correlation_key(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) | Value::Symbol(s) => s.parse().ok(),
        other => other.as_u64(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(id: Value) -> Message {
        Message::new()
            .with_correlation_id(id)
            .with_application_property("statusCode", Value::Int(200))
            .with_body(Value::List(vec![]))
    }

    #[tokio::test]
    async fn test_resolve_returns_depth_to_baseline() {
        let correlator = Correlator::new();
        assert_eq!(correlator.depth(), 0);

        let (a, rx_a) = correlator.allocate();
        let (b, rx_b) = correlator.allocate();
        assert_ne!(a, b);
        assert_eq!(correlator.depth(), 2);

        assert!(correlator.resolve(reply(Value::Ulong(b))));
        assert!(correlator.resolve(reply(Value::Ulong(a))));
        assert_eq!(correlator.depth(), 0);

        assert_eq!(rx_a.await.unwrap().unwrap().status_code, 200);
        assert_eq!(rx_b.await.unwrap().unwrap().status_code, 200);
    }

    #[test]
    fn test_unmatched_reply_is_ignored() {
        let correlator = Correlator::new();
        let (_id, _rx) = correlator.allocate();
        assert!(!correlator.resolve(reply(Value::Ulong(999))));
        assert!(!correlator.resolve(Message::new()));
        assert_eq!(correlator.depth(), 1);
    }

    #[tokio::test]
    async fn test_resolved_only_once() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.allocate();
        assert!(correlator.resolve(reply(Value::Ulong(id))));
        assert!(!correlator.resolve(reply(Value::Ulong(id))));
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_string_and_uint_correlation_ids() {
        let correlator = Correlator::new();
        let (first, rx_first) = correlator.allocate();
        let (second, rx_second) = correlator.allocate();
        assert!(correlator.resolve(reply(Value::String(first.to_string()))));
        assert!(correlator.resolve(reply(Value::Uint(second as u32))));
        assert!(rx_first.await.unwrap().is_ok());
        assert!(rx_second.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_fail_all_rejects_every_entry() {
        let correlator = Correlator::new();
        let receivers: Vec<_> = (0..5).map(|_| correlator.allocate().1).collect();

        let failed = correlator.fail_all(|| ManagementError::disconnected("link lost"));
        assert_eq!(failed, 5);
        assert_eq!(correlator.depth(), 0);

        for rx in receivers {
            match rx.await.unwrap() {
                Err(ManagementError::Disconnected { reason }) => assert_eq!(reason, "link lost"),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_error_status_fails_request() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.allocate();
        let message = Message::new()
            .with_correlation_id(Value::Ulong(id))
            .with_application_property("statusCode", Value::Int(500));
        assert!(correlator.resolve(message));
        assert!(matches!(
            rx.await.unwrap(),
            Err(ManagementError::Remote { status_code: 500, .. })
        ));
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let correlator = Correlator::new();
        let _rx = correlator.register(7).unwrap();
        assert!(correlator.register(7).is_err());
        assert_eq!(correlator.depth(), 1);
    }

    #[test]
    fn test_allocation_skips_pending_ids() {
        let correlator = Correlator::new();
        let _held = correlator.register(0).unwrap();
        let _held_next = correlator.register(1).unwrap();
        let (id, _rx) = correlator.allocate();
        assert_eq!(id, 2);
    }

    #[test]
    fn test_allocation_wraps_without_collision() {
        let correlator = Correlator::new();
        correlator.inner.lock().next_id = u64::MAX;
        let _held = correlator.register(0).unwrap();
        let (last, _rx_last) = correlator.allocate();
        let (wrapped, _rx_wrapped) = correlator.allocate();
        assert_eq!(last, u64::MAX);
        assert_eq!(wrapped, 1);
    }

    #[test]
    fn test_oldest_pending_tracks_earliest_entry() {
        let correlator = Correlator::new();
        assert_eq!(correlator.oldest_pending(), None);

        let (first, _rx_first) = correlator.allocate();
        std::thread::sleep(Duration::from_millis(20));
        let (_second, _rx_second) = correlator.allocate();
        let oldest = correlator.oldest_pending().unwrap();
        assert!(oldest >= Duration::from_millis(20));

        drop(correlator.guard(first));
        assert_eq!(correlator.depth(), 1);
        assert!(correlator.oldest_pending().unwrap() < oldest);
    }

    #[test]
    fn test_guard_cancels_on_drop() {
        let correlator = Correlator::new();
        let (id, _rx) = correlator.allocate();
        drop(correlator.guard(id));
        assert_eq!(correlator.depth(), 0);

        let (id, _rx) = correlator.allocate();
        correlator.guard(id).disarm();
        assert_eq!(correlator.depth(), 1);
    }
}
