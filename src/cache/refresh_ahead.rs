//! Refresh-ahead connection info cache.
//!
//! Rotates credentials on a timer before the current certificate expires.
//! Two refresh operations exist at any time: `current`, which serves
//! readers, and `next`, which is scheduled to replace it. On success the
//! completed operation is promoted to `current` and a new `next` is
//! scheduled per the policy in [`refresh_delay`](super::refresh_delay); on
//! failure an immediate retry is scheduled while `current` keeps serving the
//! previous record for as long as it remains valid.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Notify};

use crate::error::{Error, Result};
use crate::instance::InstanceUri;
use crate::refresh::ConnectionInfo;

use super::{refresh_delay, ConnectionInfoCache, Refresh};

// Operation phases. `Cancelled` and `InFlight` are both reachable only from
// `Scheduled`; the compare-and-swap decides the winner of the cancellation
// race.
const SCHEDULED: u8 = 0;
const IN_FLIGHT: u8 = 1;
const CANCELLED: u8 = 2;

/// A scheduled or completed refresh attempt.
///
/// Completion is observed through a watch channel; the result is written
/// exactly once. Waiters hold an `Arc` to the operation, so the channel
/// sender outlives every waiter.
struct RefreshOperation {
    phase: AtomicU8,
    cancelled: Notify,
    done: watch::Sender<bool>,
    result: OnceLock<Result<ConnectionInfo>>,
}

impl RefreshOperation {
    fn new() -> Arc<Self> {
        let (done, _) = watch::channel(false);
        Arc::new(RefreshOperation {
            phase: AtomicU8::new(SCHEDULED),
            cancelled: Notify::new(),
            done,
            result: OnceLock::new(),
        })
    }

    /// Prevent the operation from starting. Returns true only if this call
    /// stopped a still-scheduled timer; an operation that already started
    /// (or was already cancelled) is left alone.
    fn cancel(&self, instance: &InstanceUri) -> bool {
        let won = self
            .phase
            .compare_exchange(SCHEDULED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            // Complete deterministically so a reader pinned to this slot can
            // never hang on an operation that will not run.
            let _ = self.result.set(Err(Error::cancelled(instance.to_string())));
            let _ = self.done.send(true);
            // notify_one stores a permit, so the timer task wakes even if it
            // has not registered yet.
            self.cancelled.notify_one();
        }
        won
    }

    /// Transition Scheduled -> InFlight. Fails if cancellation won.
    fn start(&self) -> bool {
        self.phase
            .compare_exchange(SCHEDULED, IN_FLIGHT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn complete(&self, res: Result<ConnectionInfo>) {
        let _ = self.result.set(res);
        let _ = self.done.send(true);
    }

    /// Complete, successful, and unexpired.
    fn is_valid(&self) -> bool {
        if !*self.done.borrow() {
            return false;
        }
        matches!(self.result.get(), Some(Ok(info)) if Utc::now() < info.expiration)
    }

    /// Block until the attempt completes and return its result.
    async fn wait(&self) -> Result<ConnectionInfo> {
        let mut rx = self.done.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        match self.result.get() {
            Some(res) => res.clone(),
            None => Err(Error::Closed),
        }
    }
}

struct State {
    /// Serves readers. When no completed operation is available yet (first
    /// refresh, forced refresh), `current` and `next` are the same
    /// operation and readers block on it.
    current: Arc<RefreshOperation>,
    /// The scheduled or in-flight replacement.
    next: Arc<RefreshOperation>,
    closed: bool,
}

struct Inner {
    uri: InstanceUri,
    refresher: Arc<dyn Refresh>,
    state: Mutex<State>,
    /// Closing flips this to true, aborting in-flight refreshes promptly.
    closed_tx: watch::Sender<bool>,
}

/// Cache that refreshes connection info ahead of certificate expiration.
///
/// Assumes a running tokio runtime: each cache keeps one lightweight timer
/// task per scheduling slot.
pub struct RefreshAheadCache {
    inner: Arc<Inner>,
}

impl RefreshAheadCache {
    pub(crate) fn new(uri: InstanceUri, refresher: Arc<dyn Refresh>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            uri,
            refresher,
            state: Mutex::new(State {
                current: RefreshOperation::new(),
                next: RefreshOperation::new(),
                closed: false,
            }),
            closed_tx,
        });
        // Replace the placeholders with the initial refresh while holding
        // the lock, so the operation's completion bookkeeping cannot run
        // first. current = next makes the first readers block on the first
        // result.
        {
            let mut state = inner.state.lock().expect("cache state poisoned");
            let initial = schedule(&inner, Duration::ZERO);
            state.current = Arc::clone(&initial);
            state.next = initial;
        }
        RefreshAheadCache { inner }
    }
}

/// Schedule a refresh attempt after `delay`, returning the operation handle.
fn schedule(inner: &Arc<Inner>, delay: Duration) -> Arc<RefreshOperation> {
    let op = RefreshOperation::new();
    let task_op = Arc::clone(&op);
    let task_inner = Arc::clone(inner);
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = task_op.cancelled.notified() => return,
        }
        if !task_op.start() {
            return;
        }

        let mut closed_rx = task_inner.closed_tx.subscribe();
        let res = tokio::select! {
            res = task_inner.refresher.refresh(&task_inner.uri) => res,
            _ = closed_rx.wait_for(|closed| *closed) => {
                Err(Error::cancelled(task_inner.uri.to_string()))
            }
        };
        task_op.complete(res.clone());

        let mut state = task_inner.state.lock().expect("cache state poisoned");
        if state.closed {
            return;
        }
        match res {
            Ok(info) => {
                state.current = Arc::clone(&task_op);
                let delay = refresh_delay(Utc::now(), info.expiration);
                debug!(
                    instance = %task_inner.uri,
                    next_refresh_in = ?delay,
                    "connection info replaced"
                );
                state.next = schedule(&task_inner, delay);
            }
            Err(err) => {
                // Retry immediately, but keep serving the previous record
                // while it is still valid. Only a cache with nothing valid
                // left exposes the failure to readers.
                warn!(instance = %task_inner.uri, error = %err, "refresh failed, retrying");
                state.next = schedule(&task_inner, Duration::ZERO);
                if !state.current.is_valid() {
                    state.current = task_op;
                }
            }
        }
    });
    op
}

#[async_trait]
impl ConnectionInfoCache for RefreshAheadCache {
    async fn connection_info(&self) -> Result<ConnectionInfo> {
        let op = {
            let state = self.inner.state.lock().expect("cache state poisoned");
            if state.closed {
                return Err(Error::Closed);
            }
            // Snapshot under the lock, await outside it.
            Arc::clone(&state.current)
        };
        op.wait().await
    }

    fn force_refresh(&self) {
        let mut state = self.inner.state.lock().expect("cache state poisoned");
        if state.closed {
            return;
        }
        // If the pending operation has not started, replace it with an
        // immediate one. Either way, pin readers onto the upcoming result so
        // they observe a refresh started no earlier than this call.
        if state.next.cancel(&self.inner.uri) {
            state.next = schedule(&self.inner, Duration::ZERO);
        }
        state.current = Arc::clone(&state.next);
        debug!(instance = %self.inner.uri, "refresh forced");
    }

    fn close(&self) {
        let mut state = self.inner.state.lock().expect("cache state poisoned");
        if state.closed {
            return;
        }
        state.closed = true;
        state.current.cancel(&self.inner.uri);
        state.next.cancel(&self.inner.uri);
        let _ = self.inner.closed_tx.send(true);
    }
}

impl Drop for RefreshAheadCache {
    fn drop(&mut self) {
        self.close();
    }
}
