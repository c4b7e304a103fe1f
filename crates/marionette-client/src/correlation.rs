//! Pending-call bookkeeping and completion slots.
//!
//! Every in-flight request owns one [`CompletionSlot`]: the caller blocks on
//! it while the reader loop, a timeout, or a disconnect fulfils it. A slot is
//! fulfilled at most once; whichever path gets there first wins and the
//! others become no-ops.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::ClientError;

/// Log target for correlation-table operations.
pub(crate) const CORRELATION_TARGET: &str = "marionette_client::correlation";

/// Outcome delivered to a waiting caller.
pub(crate) type CallOutcome = Result<Value, ClientError>;

/// Acquires a mutex guard, recovering from poisoning.
///
/// The protected state carries no cross-field invariants; after a panic the
/// worst outcome is one abandoned pending call, which teardown drains.
fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

enum SlotState {
    Waiting,
    Done(CallOutcome),
    Taken,
}

/// Single-assignment slot a caller blocks on until its response arrives.
pub(crate) struct CompletionSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl CompletionSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Waiting),
            ready: Condvar::new(),
        }
    }

    /// Fulfils the slot exactly once.
    ///
    /// Returns `false` when the slot was already fulfilled; the supplied
    /// outcome is discarded in that case.
    pub(crate) fn fulfil(&self, outcome: CallOutcome) -> bool {
        let mut state = lock_ignore_poison(&self.state);
        if !matches!(*state, SlotState::Waiting) {
            return false;
        }
        *state = SlotState::Done(outcome);
        self.ready.notify_all();
        true
    }

    /// Blocks until the slot is fulfilled and takes the outcome.
    pub(crate) fn wait(&self) -> CallOutcome {
        let mut state = lock_ignore_poison(&self.state);
        loop {
            if let Some(outcome) = Self::take_outcome(&mut state) {
                return outcome;
            }
            state = match self.ready.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Blocks until the slot is fulfilled or `deadline` passes.
    ///
    /// Returns `None` when the deadline elapsed with the slot still waiting.
    pub(crate) fn wait_deadline(&self, deadline: Instant) -> Option<CallOutcome> {
        let mut state = lock_ignore_poison(&self.state);
        loop {
            if let Some(outcome) = Self::take_outcome(&mut state) {
                return Some(outcome);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = match self.ready.wait_timeout(state, deadline - now) {
                Ok((guard, _timed_out)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn take_outcome(state: &mut SlotState) -> Option<CallOutcome> {
        match std::mem::replace(state, SlotState::Taken) {
            SlotState::Done(outcome) => Some(outcome),
            other => {
                *state = other;
                None
            }
        }
    }
}

struct PendingCall {
    slot: Arc<CompletionSlot>,
    registered_at: Instant,
}

/// Maps in-flight request ids to the callers waiting on them.
pub(crate) struct CorrelationTable {
    pending: Mutex<HashMap<i64, PendingCall>>,
}

impl CorrelationTable {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates a pending call for `id`.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::DuplicateId` when a call with `id` is already
    /// pending. The id generator makes this unreachable in practice, but a
    /// collision must never silently overwrite a waiting caller.
    pub(crate) fn register(&self, id: i64) -> Result<Arc<CompletionSlot>, ClientError> {
        let mut pending = lock_ignore_poison(&self.pending);
        if pending.contains_key(&id) {
            return Err(ClientError::DuplicateId { id });
        }
        let slot = Arc::new(CompletionSlot::new());
        pending.insert(
            id,
            PendingCall {
                slot: Arc::clone(&slot),
                registered_at: Instant::now(),
            },
        );
        Ok(slot)
    }

    /// Completes the pending call for `id` with `outcome`.
    ///
    /// Returns `false` on a lookup miss (a late, duplicate, or expired
    /// response), which the caller logs and discards.
    pub(crate) fn complete(&self, id: i64, outcome: CallOutcome) -> bool {
        let entry = {
            let mut pending = lock_ignore_poison(&self.pending);
            pending.remove(&id)
        };
        match entry {
            Some(entry) => {
                entry.slot.fulfil(outcome);
                true
            }
            None => false,
        }
    }

    /// Removes a pending call without fulfilling its slot.
    ///
    /// Used when the send path fails before the request reaches the wire.
    pub(crate) fn discard(&self, id: i64) {
        let mut pending = lock_ignore_poison(&self.pending);
        pending.remove(&id);
    }

    /// Expires a still-pending call, failing it with a timeout.
    ///
    /// A call that completed in the meantime is left with its original
    /// outcome; the expiry becomes a no-op.
    pub(crate) fn expire(&self, id: i64, timeout: Duration) {
        let entry = {
            let mut pending = lock_ignore_poison(&self.pending);
            pending.remove(&id)
        };
        let Some(entry) = entry else {
            debug!(
                target: CORRELATION_TARGET,
                id,
                "call completed before expiry"
            );
            return;
        };
        if entry.slot.fulfil(Err(ClientError::Timeout { timeout })) {
            debug!(
                target: CORRELATION_TARGET,
                id,
                elapsed = ?entry.registered_at.elapsed(),
                "expired pending call"
            );
        }
    }

    /// Drains every pending call, failing each with `ConnectionLost`.
    ///
    /// The drain happens under one lock acquisition, so no caller observes a
    /// partially emptied table.
    pub(crate) fn cancel_all(&self, reason: &str) {
        let drained: Vec<(i64, PendingCall)> = {
            let mut pending = lock_ignore_poison(&self.pending);
            pending.drain().collect()
        };
        if drained.is_empty() {
            return;
        }
        warn!(
            target: CORRELATION_TARGET,
            count = drained.len(),
            reason,
            "cancelling pending calls"
        );
        for (id, entry) in drained {
            let cancelled = entry.slot.fulfil(Err(ClientError::ConnectionLost {
                reason: reason.to_string(),
            }));
            if cancelled {
                debug!(target: CORRELATION_TARGET, id, "cancelled pending call");
            }
        }
    }

    /// Number of calls currently pending.
    pub(crate) fn pending_count(&self) -> usize {
        lock_ignore_poison(&self.pending).len()
    }
}
