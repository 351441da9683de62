use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::burrow::tunnel::protocol::{CorrelationId, ResponseFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PendingError {
    #[error("timed out waiting for tunnel response")]
    TimedOut,
    #[error("tunnel connection lost")]
    ConnectionLost,
}

type Slot = oneshot::Sender<Result<ResponseFrame, PendingError>>;

#[derive(Debug)]
struct Inner {
    next_id: AtomicU64,
    closed: AtomicBool,
    entries: DashMap<CorrelationId, Slot>,
}

/// Outstanding requests of one session, keyed by correlation id.
///
/// Ids come from a per-table counter and are never reused. The map is sharded,
/// so requests with different ids do not contend with each other.
#[derive(Debug, Clone)]
pub struct PendingTable {
    inner: Arc<Inner>,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                entries: DashMap::new(),
            }),
        }
    }

    /// Creates an entry under a fresh id.
    ///
    /// After [`PendingTable::fail_all`] the returned waiter resolves as
    /// `ConnectionLost` immediately.
    pub fn register(&self) -> Waiter {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.entries.insert(id, tx);
        if self.inner.closed.load(Ordering::Acquire) {
            // Dropping the sender makes the waiter observe ConnectionLost.
            self.inner.entries.remove(&id);
        }
        Waiter {
            id,
            rx,
            table: self.inner.clone(),
        }
    }

    /// Resolves the waiter for `id`. Returns false for unknown, expired or
    /// already-resolved ids.
    pub fn complete(&self, id: CorrelationId, response: ResponseFrame) -> bool {
        match self.inner.entries.remove(&id) {
            Some((_, tx)) => tx.send(Ok(response)).is_ok(),
            None => false,
        }
    }

    /// Resolves every live entry as `ConnectionLost` and refuses new ones.
    pub fn fail_all(&self) -> usize {
        self.inner.closed.store(true, Ordering::Release);
        let ids: Vec<CorrelationId> = self.inner.entries.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, tx)) = self.inner.entries.remove(&id) {
                let _ = tx.send(Err(PendingError::ConnectionLost));
                failed += 1;
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }
}

/// Completion handle for one outstanding request.
#[derive(Debug)]
pub struct Waiter {
    id: CorrelationId,
    rx: oneshot::Receiver<Result<ResponseFrame, PendingError>>,
    table: Arc<Inner>,
}

impl Waiter {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Waits for the matching response. On timeout the entry is removed so a
    /// late response for this id is dropped by [`PendingTable::complete`].
    pub async fn wait(mut self, deadline: Duration) -> Result<ResponseFrame, PendingError> {
        match tokio::time::timeout(deadline, &mut self.rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(PendingError::ConnectionLost),
            Err(_) => {
                self.table.entries.remove(&self.id);
                Err(PendingError::TimedOut)
            }
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        // Covers callers that were cancelled mid-wait.
        self.table.entries.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn resp(id: CorrelationId, body: &str) -> ResponseFrame {
        ResponseFrame {
            id,
            status: 200,
            headers: vec![],
            body: Bytes::from(body.to_string()),
        }
    }

    #[tokio::test]
    async fn complete_resolves_matching_waiter_once() {
        let t = PendingTable::new();
        let w = t.register();
        let id = w.id();
        assert_eq!(t.len(), 1);

        assert!(t.complete(id, resp(id, "one")));
        assert!(!t.complete(id, resp(id, "dup")));

        let got = w.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.body, Bytes::from_static(b"one"));
        assert_eq!(t.len(), 0);
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let t = PendingTable::new();
        let a = t.register();
        let b = t.register();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_entry_and_drops_late_response() {
        let t = PendingTable::new();
        let w = t.register();
        let id = w.id();

        let err = w.wait(Duration::from_secs(30)).await.unwrap_err();
        assert_eq!(err, PendingError::TimedOut);
        assert_eq!(t.len(), 0);
        assert!(!t.complete(id, resp(id, "late")));
    }

    #[tokio::test]
    async fn fail_all_resolves_connection_lost() {
        let t = PendingTable::new();
        let w1 = t.register();
        let w2 = t.register();

        assert_eq!(t.fail_all(), 2);
        assert_eq!(
            w1.wait(Duration::from_secs(1)).await.unwrap_err(),
            PendingError::ConnectionLost
        );
        assert_eq!(
            w2.wait(Duration::from_secs(1)).await.unwrap_err(),
            PendingError::ConnectionLost
        );

        let late = t.register();
        assert_eq!(t.len(), 0);
        assert_eq!(
            late.wait(Duration::from_secs(1)).await.unwrap_err(),
            PendingError::ConnectionLost
        );
    }

    #[tokio::test]
    async fn dropped_waiter_cleans_up() {
        let t = PendingTable::new();
        let w = t.register();
        drop(w);
        assert_eq!(t.len(), 0);
    }

    #[tokio::test]
    async fn concurrent_waiters_get_their_own_response() {
        let t = PendingTable::new();
        let mut waiters = Vec::new();
        for _ in 0..32 {
            waiters.push(t.register());
        }
        let ids: Vec<CorrelationId> = waiters.iter().map(|w| w.id()).collect();

        let handles: Vec<_> = waiters
            .into_iter()
            .map(|w| tokio::spawn(async move { (w.id(), w.wait(Duration::from_secs(5)).await) }))
            .collect();

        for id in ids.iter().rev() {
            assert!(t.complete(*id, resp(*id, &id.to_string())));
        }

        for h in handles {
            let (id, res) = h.await.unwrap();
            let got = res.unwrap();
            assert_eq!(got.id, id);
            assert_eq!(got.body, Bytes::from(id.to_string()));
        }
    }
}
