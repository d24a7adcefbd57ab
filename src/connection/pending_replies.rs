use std::net::SocketAddr;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::{oneshot, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::messaging::message::{ExchangeKey, Message};
use crate::metrics::{MetricsSink, PENDING_REPLIES, REQUESTS_TIMED_OUT};

struct PendingReply {
    remote: Option<SocketAddr>,
    created_at: Instant,
    deadline: Instant,
    result_slot: oneshot::Sender<Result<Message, TransportError>>,
}

#[derive(Default)]
struct Entries {
    closed: bool,
    by_key: FxHashMap<ExchangeKey, PendingReply>,
}

/// Outstanding exchanges, waiting for their reply. Every entry is resolved exactly once: by a
///  matching reply, by an explicit failure, by the deadline passing, or by the table being closed.
///  Resolving removes the entry, so a second resolution for the same key finds nothing.
pub struct PendingReplyTable {
    entries: RwLock<Entries>,
    metrics: Arc<dyn MetricsSink>,
}

/// The caller's end of a pending exchange
#[derive(Debug)]
pub struct ReplyHandle {
    key: ExchangeKey,
    result: oneshot::Receiver<Result<Message, TransportError>>,
}

impl ReplyHandle {
    pub fn key(&self) -> ExchangeKey {
        self.key
    }

    /// Dropping this future is fine: the entry stays in the table until it is resolved or swept,
    ///  and its result is discarded.
    pub async fn wait(self) -> Result<Message, TransportError> {
        self.result.await
            .unwrap_or(Err(TransportError::ConnectionClosed))
    }
}

impl PendingReplyTable {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> PendingReplyTable {
        PendingReplyTable {
            entries: Default::default(),
            metrics,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.by_key.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn register(&self, key: ExchangeKey, deadline: Instant, remote: Option<SocketAddr>) -> Result<ReplyHandle, TransportError> {
        let mut entries = self.entries.write().await;
        if entries.closed {
            return Err(TransportError::ConnectionClosed);
        }
        if entries.by_key.contains_key(&key) {
            return Err(TransportError::ProtocolError(format!("exchange {:?} is already pending", key)));
        }

        let (result_slot, result) = oneshot::channel();
        entries.by_key.insert(key, PendingReply {
            remote,
            created_at: Instant::now(),
            deadline,
            result_slot,
        });
        self.metrics.set_gauge(PENDING_REPLIES, entries.by_key.len() as u64);
        trace!(?key, "registered pending reply");

        Ok(ReplyHandle { key, result })
    }

    /// Returns `true` if the reply was handed to a waiting caller. A reply for a key that is not
    ///  (or no longer) pending is a normal occurrence, e.g. if it arrives after the timeout.
    pub async fn resolve(&self, key: &ExchangeKey, reply: Message) -> bool {
        let Some(entry) = self.remove(key).await else {
            return false;
        };
        entry.result_slot.send(Ok(reply)).is_ok()
    }

    pub async fn fail(&self, key: &ExchangeKey, error: TransportError) -> bool {
        let Some(entry) = self.remove(key).await else {
            return false;
        };
        entry.result_slot.send(Err(error)).is_ok()
    }

    /// Drops an entry without resolving it, e.g. because the request could not be sent
    pub async fn forget(&self, key: &ExchangeKey) -> bool {
        self.remove(key).await.is_some()
    }

    async fn remove(&self, key: &ExchangeKey) -> Option<PendingReply> {
        let mut entries = self.entries.write().await;
        let result = entries.by_key.remove(key);
        self.metrics.set_gauge(PENDING_REPLIES, entries.by_key.len() as u64);
        result
    }

    /// Fails every entry whose deadline passed with a timeout, and removes entries whose caller
    ///  is gone. Returns the number of timed out entries.
    pub async fn sweep(&self, now: Instant) -> usize {
        {
            let entries = self.entries.read().await;
            if !entries.by_key.values().any(|e| e.deadline <= now || e.result_slot.is_closed()) {
                return 0;
            }
        }

        let mut entries = self.entries.write().await;
        let expired = entries.by_key.iter()
            .filter(|(_, e)| e.deadline <= now || e.result_slot.is_closed())
            .map(|(k, _)| *k)
            .collect::<Vec<_>>();

        let mut num_timed_out = 0;
        for key in expired {
            let Some(entry) = entries.by_key.remove(&key) else {
                continue;
            };
            if entry.result_slot.is_closed() {
                trace!(?key, "removing pending reply whose caller is gone");
                continue;
            }
            debug!(?key, remote = ?entry.remote, "no reply before deadline");
            num_timed_out += 1;
            entry.result_slot.send(Err(TransportError::Timeout {
                remote: entry.remote,
                timeout: entry.deadline.saturating_duration_since(entry.created_at),
            })).ok();
        }

        self.metrics.set_gauge(PENDING_REPLIES, entries.by_key.len() as u64);
        self.metrics.inc_counter(REQUESTS_TIMED_OUT, num_timed_out as u64);
        num_timed_out
    }

    /// Fails every pending entry with [TransportError::ConnectionClosed], and rejects all further
    ///  registrations.
    pub async fn close(&self) {
        let mut entries = self.entries.write().await;
        entries.closed = true;
        let num_pending = entries.by_key.len();
        for (_, entry) in entries.by_key.drain() {
            entry.result_slot.send(Err(TransportError::ConnectionClosed)).ok();
        }
        self.metrics.set_gauge(PENDING_REPLIES, 0);
        debug!("closed pending reply table, failed {} pending exchanges", num_pending);
    }
}
