//! Single-flight token refresh.
//!
//! One [`RefreshGate`] belongs to one request client. At most one refresh is
//! in flight; callers that hit a 401 meanwhile park on a oneshot and are
//! released together when the leader settles. Every settled refresh bumps
//! the gate epoch, so a caller whose request was sent before that refresh
//! finished picks up the outcome instead of starting another one. The
//! terminal session expiry is claimed once per epoch the same way.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    Failed(String),
}

enum RefreshState {
    Idle,
    Refreshing {
        queue: Vec<oneshot::Sender<RefreshOutcome>>,
    },
}

struct GateInner {
    state: RefreshState,
    epoch: u64,
    last_outcome: RefreshOutcome,
    expired_at: Option<u64>,
}

pub struct RefreshGate {
    inner: Mutex<GateInner>,
}

/// What a caller that just received a 401 should do next.
pub enum RefreshTicket<'a> {
    /// Perform the refresh, then settle the lease.
    Lead(RefreshLease<'a>),
    /// Another caller is refreshing; await its outcome.
    Wait(oneshot::Receiver<RefreshOutcome>),
    /// A refresh finished after this caller's request went out.
    Settled(RefreshOutcome),
}

impl Default for RefreshGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshGate {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GateInner {
                state: RefreshState::Idle,
                epoch: 0,
                last_outcome: RefreshOutcome::Refreshed,
                expired_at: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Epoch to record before sending a request.
    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(self.lock().state, RefreshState::Refreshing { .. })
    }

    pub fn parked(&self) -> usize {
        match &self.lock().state {
            RefreshState::Idle => 0,
            RefreshState::Refreshing { queue } => queue.len(),
        }
    }

    pub fn begin_or_enqueue(&self, seen_epoch: u64) -> RefreshTicket<'_> {
        let mut inner = self.lock();
        if let RefreshState::Refreshing { queue } = &mut inner.state {
            let (tx, rx) = oneshot::channel();
            queue.push(tx);
            debug!(parked = queue.len(), "refresh: parked request behind in-flight refresh");
            return RefreshTicket::Wait(rx);
        }
        if seen_epoch < inner.epoch {
            return RefreshTicket::Settled(inner.last_outcome.clone());
        }
        inner.state = RefreshState::Refreshing { queue: Vec::new() };
        RefreshTicket::Lead(RefreshLease {
            gate: self,
            settled: false,
        })
    }

    /// Claims the session-expiry flow for a request sent at `seen_epoch`.
    /// `false` when that session was already expired by another caller.
    pub fn claim_expiry(&self, seen_epoch: u64) -> bool {
        let mut inner = self.lock();
        if inner.expired_at.is_some_and(|at| at >= seen_epoch) {
            return false;
        }
        inner.expired_at = Some(inner.epoch);
        true
    }

    /// A fresh credential arrived outside the refresh flow (login).
    pub fn note_new_credential(&self) {
        let mut inner = self.lock();
        inner.epoch += 1;
        inner.last_outcome = RefreshOutcome::Refreshed;
    }

    fn settle(&self, outcome: RefreshOutcome) -> usize {
        let queue = {
            let mut inner = self.lock();
            inner.epoch += 1;
            inner.last_outcome = outcome.clone();
            match std::mem::replace(&mut inner.state, RefreshState::Idle) {
                RefreshState::Idle => Vec::new(),
                RefreshState::Refreshing { queue } => queue,
            }
        };
        let released = queue.len();
        for waiter in queue {
            let _ = waiter.send(outcome.clone());
        }
        released
    }

    pub fn flush_success(&self) -> usize {
        self.settle(RefreshOutcome::Refreshed)
    }

    pub fn flush_failure(&self, reason: impl Into<String>) -> usize {
        self.settle(RefreshOutcome::Failed(reason.into()))
    }
}

/// Held by the one caller performing the refresh. Dropping it unsettled
/// fails the parked callers instead of stranding them.
pub struct RefreshLease<'a> {
    gate: &'a RefreshGate,
    settled: bool,
}

impl RefreshLease<'_> {
    pub fn succeed(mut self) -> usize {
        self.settled = true;
        self.gate.flush_success()
    }

    pub fn fail(mut self, reason: impl Into<String>) -> usize {
        self.settled = true;
        self.gate.flush_failure(reason)
    }
}

impl Drop for RefreshLease<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.gate.flush_failure("refresh abandoned");
        }
    }
}

/// Awaits a parked ticket; a dropped sender counts as failure.
pub async fn wait_outcome(rx: oneshot::Receiver<RefreshOutcome>) -> RefreshOutcome {
    rx.await
        .unwrap_or_else(|_| RefreshOutcome::Failed("refresh abandoned".into()))
}

#[cfg(test)]
#[path = "tests/refresh_tests.rs"]
mod tests;
