//! Relay sessions anchored to a Listening Client.
//!
//! A session is created when a `ForwardRequest` is accepted and stays pending
//! until the target's Listening Client presents a data connection with
//! `Join{session_id}`. It then stays in the table, relaying, until the
//! requester handler discards it. Every session is indexed by the listener
//! name it is anchored to, so a dropped control connection cancels exactly
//! its own, pending or relaying.

use crate::broker::BoxedStream;
use natter_core::messages::{CloseReason, SessionId};
use natter_core::{NatterError, NatterResult};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

/// Delivered to the requester handler waiting on a pending session.
pub enum SessionEvent {
    /// The listener's data connection arrived.
    Joined {
        stream: BoxedStream,
        /// Fires if the session is cancelled while relaying.
        cancel: oneshot::Receiver<CloseReason>,
    },
    /// The listener could not serve the session.
    Failed {
        reason: CloseReason,
        detail: Option<String>,
    },
}

enum State {
    /// Waiting for `Join`; the sender wakes the requester handler.
    Pending(oneshot::Sender<SessionEvent>),
    /// Both sides connected; the sender stops the pump.
    Relaying(oneshot::Sender<CloseReason>),
}

struct Tracked {
    owner: String,
    created: Instant,
    state: State,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Tracked>,
    by_owner: HashMap<String, HashSet<SessionId>>,
}

impl Inner {
    fn take(&mut self, id: &SessionId) -> Option<Tracked> {
        let t = self.sessions.remove(id)?;
        if let Some(ids) = self.by_owner.get_mut(&t.owner) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_owner.remove(&t.owner);
            }
        }
        Some(t)
    }
}

/// Table of sessions plus a count of live (pending or relaying) ones.
pub struct SessionTable {
    inner: Mutex<Inner>,
    max_sessions: usize,
    live: Arc<AtomicUsize>,
}

impl SessionTable {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_sessions,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a pending session anchored to `owner`.
    ///
    /// # Arguments
    ///
    /// * `owner` - registered name of the Listening Client that must join.
    ///
    /// # Returns
    ///
    /// The new session id, the receiver the requester handler waits on, and
    /// a [`SessionSlot`] that counts against `max_sessions` until dropped.
    /// The requester handler holds the slot for the session's lifetime.
    ///
    /// # Errors
    ///
    /// `ForwardRejected{Busy}` when `max_sessions` sessions are already live.
    pub async fn open(
        &self,
        owner: &str,
    ) -> NatterResult<(SessionId, oneshot::Receiver<SessionEvent>, SessionSlot)> {
        let acquired = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_sessions).then_some(n + 1)
            });
        if let Err(current) = acquired {
            return Err(NatterError::ForwardRejected {
                reason: CloseReason::Busy,
                detail: format!("session limit reached ({current}/{})", self.max_sessions),
            });
        }
        let slot = SessionSlot {
            counter: self.live.clone(),
        };

        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().await;
        let mut id = SessionId::random();
        while inner.sessions.contains_key(&id) {
            id = SessionId::random();
        }
        inner.sessions.insert(
            id,
            Tracked {
                owner: owner.to_string(),
                created: Instant::now(),
                state: State::Pending(tx),
            },
        );
        inner.by_owner.entry(owner.to_string()).or_default().insert(id);
        Ok((id, rx, slot))
    }

    /// Claim a pending session for its data connection. Single use.
    ///
    /// The session moves to relaying and stays anchored to its owner. Returns
    /// the requester's wake-up sender and the cancel receiver to hand over
    /// with the joined stream.
    pub async fn claim(
        &self,
        id: &SessionId,
    ) -> Option<(oneshot::Sender<SessionEvent>, oneshot::Receiver<CloseReason>)> {
        let mut inner = self.inner.lock().await;
        let tracked = inner.sessions.get_mut(id)?;
        if !matches!(tracked.state, State::Pending(_)) {
            return None;
        }
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let State::Pending(tx) = std::mem::replace(&mut tracked.state, State::Relaying(cancel_tx))
        else {
            return None;
        };
        debug!(session = %id.short(), owner = %tracked.owner, waited_ms = tracked.created.elapsed().as_millis() as u64, "session claimed");
        Some((tx, cancel_rx))
    }

    /// Fail a pending session owned by `owner`, waking its requester.
    ///
    /// Returns `false` if the session is unknown, already relaying, or
    /// anchored to someone else.
    pub async fn fail(
        &self,
        id: &SessionId,
        owner: &str,
        reason: CloseReason,
        detail: Option<String>,
    ) -> bool {
        let tracked = {
            let mut inner = self.inner.lock().await;
            let owned = inner
                .sessions
                .get(id)
                .is_some_and(|t| t.owner == owner && matches!(t.state, State::Pending(_)));
            if owned {
                inner.take(id)
            } else {
                None
            }
        };
        match tracked.map(|t| t.state) {
            Some(State::Pending(tx)) => {
                let _ = tx.send(SessionEvent::Failed { reason, detail });
                true
            }
            _ => false,
        }
    }

    /// Forget a session, pending or relaying, without notifying anyone.
    pub async fn discard(&self, id: &SessionId) -> bool {
        self.inner.lock().await.take(id).is_some()
    }

    /// Cancel every session anchored to `owner`.
    ///
    /// Pending requesters are woken with `Failed{reason}`; relaying pumps are
    /// told to stop. Returns the number of sessions cancelled.
    pub async fn cancel_owner(&self, owner: &str, reason: CloseReason) -> usize {
        let cancelled: Vec<Tracked> = {
            let mut inner = self.inner.lock().await;
            let ids = inner.by_owner.remove(owner).unwrap_or_default();
            ids.iter().filter_map(|id| inner.sessions.remove(id)).collect()
        };
        let n = cancelled.len();
        for t in cancelled {
            match t.state {
                State::Pending(tx) => {
                    let _ = tx.send(SessionEvent::Failed {
                        reason,
                        detail: Some(format!("{owner} disconnected")),
                    });
                }
                State::Relaying(cancel) => {
                    let _ = cancel.send(reason);
                }
            }
        }
        if n > 0 {
            debug!(owner = %owner, count = n, "cancelled sessions");
        }
        n
    }

    pub async fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .sessions
            .values()
            .filter(|t| matches!(t.state, State::Pending(_)))
            .count()
    }

    /// Sessions currently relaying.
    pub async fn relaying_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .sessions
            .values()
            .filter(|t| matches!(t.state, State::Relaying(_)))
            .count()
    }

    /// Pending plus relaying sessions.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

/// RAII guard for one live session; decrements the live count on drop.
pub struct SessionSlot {
    counter: Arc<AtomicUsize>,
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
