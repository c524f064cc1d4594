//! Pending-request table
//!
//! Correlates asynchronously arriving CALLRESULT / CALLERROR frames with the
//! CALL that caused them and enforces the per-request deadline.
//!
//! The map sits behind a single mutex that is held only to insert, resolve or
//! remove an entry. Each entry owns a oneshot channel, so a waiter suspends on
//! its own receiver and never on the lock.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::envelope::{ErrorCode, Payload};
use crate::error::{AwaitError, PendingError};
use crate::ids::RequestId;

#[derive(Debug)]
enum Resolution {
    Result(Payload),
    Error {
        code: ErrorCode,
        description: String,
        details: Payload,
    },
    Closed,
}

struct Entry {
    action: String,
    sent_at: DateTime<Utc>,
    deadline: Instant,
    // Taken by the first resolver; `None` means the slot is settled.
    resolve_tx: Option<oneshot::Sender<Resolution>>,
    // Taken by the (single) waiter.
    result_rx: Option<oneshot::Receiver<Resolution>>,
}

/// Diagnostic view of one in-flight request
#[derive(Debug, Clone, PartialEq)]
pub struct PendingInfo {
    pub request_id: RequestId,
    pub action: String,
    pub sent_at: DateTime<Utc>,
    pub deadline: Instant,
    pub resolved: bool,
}

#[derive(Default)]
struct Table {
    entries: HashMap<RequestId, Entry>,
    closed: bool,
}

/// In-flight requests of one connection, keyed by request id
#[derive(Default)]
pub struct PendingRequests {
    table: Mutex<Table>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a CALL that is about to be sent. The deadline is `timeout` from now.
    pub fn register(
        &self,
        request_id: RequestId,
        action: impl Into<String>,
        sent_at: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<(), PendingError> {
        let mut table = self.table.lock();
        if table.closed {
            return Err(PendingError::Closed);
        }
        if table.entries.contains_key(&request_id) {
            return Err(PendingError::DuplicateRequestId(request_id));
        }

        let (resolve_tx, result_rx) = oneshot::channel();
        table.entries.insert(
            request_id,
            Entry {
                action: action.into(),
                sent_at,
                deadline: deadline_after(timeout),
                resolve_tx: Some(resolve_tx),
                result_rx: Some(result_rx),
            },
        );
        Ok(())
    }

    /// Settle a request with a CALLRESULT payload.
    ///
    /// Returns `false` when the id is unknown or already settled; the caller
    /// logs and drops such a response.
    pub fn resolve(&self, request_id: &RequestId, payload: Payload) -> bool {
        self.settle(request_id, Resolution::Result(payload))
    }

    /// Settle a request with a CALLERROR
    pub fn resolve_error(
        &self,
        request_id: &RequestId,
        code: ErrorCode,
        description: impl Into<String>,
        details: Payload,
    ) -> bool {
        self.settle(
            request_id,
            Resolution::Error {
                code,
                description: description.into(),
                details,
            },
        )
    }

    fn settle(&self, request_id: &RequestId, resolution: Resolution) -> bool {
        let mut table = self.table.lock();
        let Some(tx) = table
            .entries
            .get_mut(request_id)
            .and_then(|entry| entry.resolve_tx.take())
        else {
            return false;
        };
        // A waiter that already timed out has dropped its receiver.
        let _ = tx.send(resolution);
        true
    }

    /// Wait until `request_id` is settled or its deadline passes.
    ///
    /// The entry is removed on every exit path, including when the returned
    /// future is dropped before completion.
    pub async fn await_result(&self, request_id: &RequestId) -> Result<Payload, AwaitError> {
        let (rx, deadline) = {
            let mut table = self.table.lock();
            let entry = table
                .entries
                .get_mut(request_id)
                .ok_or_else(|| AwaitError::NotPending(request_id.clone()))?;
            let rx = entry
                .result_rx
                .take()
                .ok_or_else(|| AwaitError::NotPending(request_id.clone()))?;
            (rx, entry.deadline)
        };

        let _remove = RemoveOnDrop {
            table: self,
            request_id,
        };

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(Resolution::Result(payload))) => Ok(payload),
            Ok(Ok(Resolution::Error {
                code,
                description,
                details,
            })) => Err(AwaitError::CallError {
                code,
                description,
                details,
            }),
            Ok(Ok(Resolution::Closed)) | Ok(Err(_)) => Err(AwaitError::Disconnected),
            Err(_) => {
                debug!(request_id = %request_id, "Pending request timed out");
                Err(AwaitError::Timeout)
            }
        }
    }

    /// Fail every entry that is past its deadline and has no waiter.
    ///
    /// Entries with an active waiter are left to the waiter's own timeout.
    pub fn sweep_expired(&self) -> Vec<RequestId> {
        let now = Instant::now();
        let mut table = self.table.lock();
        let expired: Vec<RequestId> = table
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now && entry.result_rx.is_some())
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(entry) = table.entries.remove(id) {
                warn!(request_id = %id, action = %entry.action, "Dropping expired request that was never awaited");
            }
        }
        expired
    }

    /// Resolve every entry as failed and refuse new registrations.
    ///
    /// Called on connection teardown so no waiter blocks until its deadline.
    pub fn close(&self) -> usize {
        let drained: Vec<(RequestId, Entry)> = {
            let mut table = self.table.lock();
            table.closed = true;
            table.entries.drain().collect()
        };

        let count = drained.len();
        for (id, mut entry) in drained {
            if let Some(tx) = entry.resolve_tx.take() {
                debug!(request_id = %id, action = %entry.action, "Failing pending request on close");
                let _ = tx.send(Resolution::Closed);
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().entries.is_empty()
    }

    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.table.lock().entries.contains_key(request_id)
    }

    pub fn is_closed(&self) -> bool {
        self.table.lock().closed
    }

    /// Action name of an in-flight request
    pub fn action_of(&self, request_id: &RequestId) -> Option<String> {
        self.table
            .lock()
            .entries
            .get(request_id)
            .map(|entry| entry.action.clone())
    }

    pub fn snapshot(&self) -> Vec<PendingInfo> {
        self.table
            .lock()
            .entries
            .iter()
            .map(|(id, entry)| PendingInfo {
                request_id: id.clone(),
                action: entry.action.clone(),
                sent_at: entry.sent_at,
                deadline: entry.deadline,
                resolved: entry.resolve_tx.is_none(),
            })
            .collect()
    }

    fn remove(&self, request_id: &RequestId) {
        self.table.lock().entries.remove(request_id);
    }
}

impl std::fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequests")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// `now + timeout`, clamped to roughly thirty years for huge timeouts
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86400 * 365 * 30))
}

struct RemoveOnDrop<'a> {
    table: &'a PendingRequests,
    request_id: &'a RequestId,
}

impl Drop for RemoveOnDrop<'_> {
    fn drop(&mut self) {
        self.table.remove(self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready};

    fn payload(value: serde_json::Value) -> Payload {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("Expected object"),
        }
    }

    fn register(table: &PendingRequests, id: &str, timeout: Duration) {
        table
            .register(RequestId::new(id), "Heartbeat", Utc::now(), timeout)
            .unwrap();
    }

    #[test]
    fn test_duplicate_request_id_rejected() {
        let table = PendingRequests::new();
        register(&table, "r1", Duration::from_secs(10));

        let err = table
            .register(RequestId::new("r1"), "Heartbeat", Utc::now(), Duration::from_secs(10))
            .unwrap_err();
        assert_eq!(err, PendingError::DuplicateRequestId(RequestId::new("r1")));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_resolve_unknown_is_noop() {
        let table = PendingRequests::new();
        assert!(!table.resolve(&RequestId::new("ghost"), Payload::new()));
        assert!(!table.resolve_error(
            &RequestId::new("ghost"),
            ErrorCode::GenericError,
            "late",
            Payload::new()
        ));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_wakes_waiter_once() {
        let table = PendingRequests::new();
        let id = RequestId::new("r1");
        register(&table, "r1", Duration::from_secs(10));

        assert!(table.resolve(&id, payload(json!({"currentTime": "2026-01-20T12:00:00Z"}))));
        assert!(!table.resolve(&id, payload(json!({"currentTime": "later"}))));
        assert!(table.snapshot()[0].resolved);

        let result = table.await_result(&id).await.unwrap();
        assert_eq!(result["currentTime"], "2026-01-20T12:00:00Z");
        assert!(!table.contains(&id));

        // The entry is gone, so a second wait has nothing to observe.
        assert_eq!(
            table.await_result(&id).await,
            Err(AwaitError::NotPending(id.clone()))
        );
    }

    #[tokio::test]
    async fn test_waiter_suspends_without_holding_lock() {
        let table = PendingRequests::new();
        let id = RequestId::new("r1");
        register(&table, "r1", Duration::from_secs(10));

        let mut waiter = tokio_test::task::spawn(table.await_result(&id));
        assert_pending!(waiter.poll());

        // Table stays usable while the waiter is parked.
        register(&table, "r2", Duration::from_secs(10));
        assert_eq!(table.len(), 2);

        assert!(table.resolve(&id, payload(json!({"ok": true}))));
        assert!(waiter.is_woken());
        let result = assert_ready!(waiter.poll());
        assert_eq!(result.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn test_call_error_surfaces_to_waiter() {
        let table = PendingRequests::new();
        let id = RequestId::new("r1");
        register(&table, "r1", Duration::from_secs(10));

        assert!(table.resolve_error(
            &id,
            ErrorCode::NotSupported,
            "no",
            payload(json!({"reason": "x"}))
        ));

        match table.await_result(&id).await {
            Err(AwaitError::CallError {
                code,
                description,
                details,
            }) => {
                assert_eq!(code, ErrorCode::NotSupported);
                assert_eq!(description, "no");
                assert_eq!(details["reason"], "x");
            }
            other => panic!("Expected CallError, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry() {
        let table = PendingRequests::new();
        let id = RequestId::new("r1");
        register(&table, "r1", Duration::from_millis(100));

        let started = Instant::now();
        assert_eq!(table.await_result(&id).await, Err(AwaitError::Timeout));
        assert!(started.elapsed() <= Duration::from_millis(100));
        assert!(table.is_empty());

        // A late response is now an orphan.
        assert!(!table.resolve(&id, Payload::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadlines_are_independent() {
        let table = Arc::new(PendingRequests::new());
        register(&table, "slow", Duration::from_secs(5));
        register(&table, "fast", Duration::from_millis(50));

        let slow = {
            let table = table.clone();
            tokio::spawn(async move { table.await_result(&RequestId::new("slow")).await })
        };
        let fast = {
            let table = table.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let result = table.await_result(&RequestId::new("fast")).await;
                (result, started.elapsed())
            })
        };

        let (fast_result, elapsed) = fast.await.unwrap();
        assert_eq!(fast_result, Err(AwaitError::Timeout));
        assert!(elapsed < Duration::from_secs(1));

        assert!(table.resolve(&RequestId::new("slow"), payload(json!({"n": 1}))));
        assert_eq!(slow.await.unwrap().unwrap()["n"], 1);
    }

    #[tokio::test]
    async fn test_close_fails_waiters_and_refuses_new() {
        let table = Arc::new(PendingRequests::new());
        register(&table, "r1", Duration::from_secs(60));

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.await_result(&RequestId::new("r1")).await })
        };
        tokio::task::yield_now().await;

        assert_eq!(table.close(), 1);
        assert_eq!(waiter.await.unwrap(), Err(AwaitError::Disconnected));
        assert!(table.is_closed());
        assert_eq!(
            table.register(RequestId::new("r2"), "Heartbeat", Utc::now(), Duration::from_secs(1)),
            Err(PendingError::Closed)
        );
    }

    #[tokio::test]
    async fn test_unbounded_timeout_still_resolves() {
        let table = PendingRequests::new();
        let id = RequestId::new("r1");
        register(&table, "r1", Duration::MAX);

        assert!(table.snapshot()[0].deadline > Instant::now() + Duration::from_secs(86400));

        let mut waiter = tokio_test::task::spawn(table.await_result(&id));
        assert_pending!(waiter.poll());
        assert!(table.resolve(&id, payload(json!({"ok": true}))));
        let result = assert_ready!(waiter.poll());
        assert_eq!(result.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn test_dropped_waiter_removes_entry() {
        let table = PendingRequests::new();
        let id = RequestId::new("r1");
        register(&table, "r1", Duration::from_secs(60));

        {
            let mut waiter = tokio_test::task::spawn(table.await_result(&id));
            assert_pending!(waiter.poll());
        }

        assert!(!table.contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expired_skips_awaited_entries() {
        let table = PendingRequests::new();
        register(&table, "orphan", Duration::from_millis(10));
        register(&table, "awaited", Duration::from_millis(10));
        register(&table, "fresh", Duration::from_secs(60));

        let awaited = RequestId::new("awaited");
        let mut waiter = tokio_test::task::spawn(table.await_result(&awaited));
        assert_pending!(waiter.poll());

        tokio::time::advance(Duration::from_millis(20)).await;

        assert_eq!(table.sweep_expired(), vec![RequestId::new("orphan")]);
        assert!(table.contains(&awaited));
        assert!(table.contains(&RequestId::new("fresh")));
        assert_eq!(table.action_of(&RequestId::new("fresh")).as_deref(), Some("Heartbeat"));
    }
}
