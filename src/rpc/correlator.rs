use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    sync::oneshot,
    time::{timeout_at, Instant},
};
use tracing::{debug, trace};

use super::envelope::CommandResult;
use crate::{config::deadline_after, error::LnError};

type Reply = Result<CommandResult, LnError>;

struct PendingCall {
    method: String,
    issued_at: Instant,
    deadline: Instant,
    reply: oneshot::Sender<Reply>,
}

/// Matches responses to outstanding calls by id and enforces per-call deadlines.
///
/// The pending table is only ever touched through these methods, so every call is resolved
/// exactly once: by a response, by [`Correlator::sweep`], or by [`Correlator::reject_all`].
pub struct Correlator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingCall>>,
    default_timeout: Duration,
}

/// Caller's handle on one registered call.
pub struct PendingReply {
    id: u64,
    deadline: Instant,
    budget: Duration,
    rx: oneshot::Receiver<Reply>,
    correlator: Arc<Correlator>,
}

impl Correlator {
    #[must_use]
    pub fn new(default_timeout: Duration) -> Arc<Self> {
        // Random start so ids from separate sessions are unlikely to line up.
        Self::with_first_id(default_timeout, rand::random::<u64>() >> 1)
    }

    pub(crate) fn with_first_id(default_timeout: Duration, first: u64) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(first),
            pending: Mutex::new(HashMap::new()),
            default_timeout,
        })
    }

    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Register a call and allocate its id. The deadline is `now + timeout`, falling back to
    /// the default timeout. Timeouts past [`crate::config::MAX_TIMEOUT`] are clamped.
    pub fn register(
        self: &Arc<Self>,
        method: &str,
        timeout: Option<Duration>,
    ) -> (u64, PendingReply) {
        let issued_at = Instant::now();
        let deadline = deadline_after(issued_at, timeout.unwrap_or(self.default_timeout));
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock();
        let id = loop {
            let candidate = self.next_id.fetch_add(1, Ordering::Relaxed);
            if !pending.contains_key(&candidate) {
                break candidate;
            }
        };
        pending.insert(
            id,
            PendingCall {
                method: method.to_string(),
                issued_at,
                deadline,
                reply: tx,
            },
        );
        drop(pending);
        trace!(target: "cln_rs::rpc", id, method, "registered call");
        (
            id,
            PendingReply {
                id,
                deadline,
                budget: deadline.saturating_duration_since(issued_at),
                rx,
                correlator: Arc::clone(self),
            },
        )
    }

    /// Deliver the outcome for `id`. Returns `false` for unknown ids, which covers late replies
    /// to calls that already timed out.
    pub fn resolve(&self, id: u64, result: Reply) -> bool {
        let Some(call) = self.pending.lock().remove(&id) else {
            debug!(target: "cln_rs::rpc", id, "discarding reply for unknown call");
            return false;
        };
        trace!(
            target: "cln_rs::rpc",
            id,
            method = %call.method,
            elapsed_ms = call.issued_at.elapsed().as_millis() as u64,
            "resolved call"
        );
        let _ = call.reply.send(result);
        true
    }

    /// Remove a call without resolving it, e.g. when its request could not be sent.
    pub fn cancel(&self, id: u64) -> bool {
        self.pending.lock().remove(&id).is_some()
    }

    /// Fail every call whose deadline is at or before `now` with [`LnError::Timeout`].
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<(u64, PendingCall)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, call)| call.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|call| (id, call)))
                .collect()
        };
        let count = expired.len();
        for (id, call) in expired {
            let after = call.deadline.saturating_duration_since(call.issued_at);
            debug!(target: "cln_rs::rpc", id, method = %call.method, ?after, "call timed out");
            let _ = call.reply.send(Err(LnError::Timeout {
                method: call.method,
                after,
            }));
        }
        count
    }

    /// Fail every outstanding call with the error built by `reason`.
    pub fn reject_all(&self, reason: impl Fn() -> LnError) -> usize {
        let drained: Vec<PendingCall> = self.pending.lock().drain().map(|(_, c)| c).collect();
        let count = drained.len();
        for call in drained {
            let _ = call.reply.send(Err(reason()));
        }
        if count > 0 {
            debug!(target: "cln_rs::rpc", count, "rejected outstanding calls");
        }
        count
    }

    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        self.pending.lock().contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl PendingReply {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time the call was given, from registration to its deadline.
    #[must_use]
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Wait for the outcome. Never outlives the deadline: if the background sweep has not run
    /// yet when it passes, the wait sweeps itself.
    ///
    /// # Errors
    /// Returns the error the call was resolved with, [`LnError::Timeout`] at the deadline, or
    /// [`LnError::ConnectionClosed`] if the correlator went away.
    pub async fn wait(mut self) -> Result<CommandResult, LnError> {
        match timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LnError::ConnectionClosed),
            Err(_) => {
                self.correlator.sweep(Instant::now());
                self.rx.await.unwrap_or(Err(LnError::ConnectionClosed))
            }
        }
    }
}
