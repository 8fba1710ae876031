// Per-publish bookkeeping of subscriber callback outcomes.
use ahash::RandomState;
use futures::future::{BoxFuture, join_all};
use hashbrown::HashMap;
use herald_storage::CallId;
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use crate::error::{CallbackError, HubError, Result};

/// Result of one subscriber callback for one delivered message.
#[derive(Debug, Clone)]
pub enum Outcome {
    Value(Value),
    Failed(Arc<CallbackError>),
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Outcome::Value(value) => Some(value),
            Outcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&Arc<CallbackError>> {
        match self {
            Outcome::Value(_) => None,
            Outcome::Failed(err) => Some(err),
        }
    }
}

/// A callback outcome that is either known now or still settling.
pub(crate) enum Slot {
    Ready(Outcome),
    Pending(BoxFuture<'static, Outcome>),
}

/// Progress of one in-flight publish call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    pub total: usize,
    pub settled: usize,
}

#[derive(Debug, Default)]
struct TrackedCall {
    // Invocation order; `None` until a pending reply settles.
    slots: Vec<Option<Outcome>>,
}

#[derive(Debug, Default)]
pub(crate) struct CompletionTracker {
    next_call: AtomicU64,
    calls: Mutex<HashMap<CallId, TrackedCall, RandomState>>,
}

impl CompletionTracker {
    // Ids are never reused, so two in-flight calls can never share an entry.
    pub(crate) fn next_call(&self) -> CallId {
        CallId::new(self.next_call.fetch_add(1, Ordering::Relaxed))
    }

    /// Make `call` visible with no slots yet.
    pub(crate) fn open(&self, call: CallId) {
        self.calls.lock().entry(call).or_default();
    }

    /// Record a slot for `call`, creating the entry on first use. Returns the slot index.
    pub(crate) fn record(&self, call: CallId, outcome: Option<Outcome>) -> usize {
        let mut calls = self.calls.lock();
        let entry = calls.entry(call).or_default();
        entry.slots.push(outcome);
        entry.slots.len() - 1
    }

    fn settle(&self, call: CallId, slot: usize, outcome: Outcome) -> Result<()> {
        let mut calls = self.calls.lock();
        let entry = calls
            .get_mut(&call)
            .ok_or(HubError::TrackerEntryMissing(call))?;
        let target = entry
            .slots
            .get_mut(slot)
            .ok_or(HubError::UnsettledSlot { call, slot })?;
        *target = Some(outcome);
        Ok(())
    }

    fn collect(&self, call: CallId, expected: usize) -> Result<Vec<Outcome>> {
        if expected == 0 {
            return Ok(Vec::new());
        }
        let calls = self.calls.lock();
        let entry = calls.get(&call).ok_or(HubError::TrackerEntryMissing(call))?;
        entry
            .slots
            .iter()
            .enumerate()
            .map(|(slot, outcome)| {
                outcome
                    .clone()
                    .ok_or(HubError::UnsettledSlot { call, slot })
            })
            .collect()
    }

    pub(crate) fn in_flight(&self, call: CallId) -> Option<InFlight> {
        let calls = self.calls.lock();
        calls.get(&call).map(|entry| InFlight {
            total: entry.slots.len(),
            settled: entry.slots.iter().filter(|slot| slot.is_some()).count(),
        })
    }

    pub(crate) fn active_calls(&self) -> usize {
        self.calls.lock().len()
    }

    fn discard(&self, call: CallId) {
        self.calls.lock().remove(&call);
    }
}

// Removes the tracker entry however the publication ends: settled, failed, or dropped.
struct TrackerGuard {
    tracker: Arc<CompletionTracker>,
    call: CallId,
}

impl Drop for TrackerGuard {
    fn drop(&mut self) {
        self.tracker.discard(self.call);
    }
}

/// Future returned by `Hub::publish`; resolves to every callback outcome in invocation order.
///
/// Dispatch has already happened by the time this value exists. Awaiting it only
/// waits for pending replies to settle.
#[must_use = "pending subscriber replies only settle when the publication is awaited"]
pub struct Publication {
    call: CallId,
    inner: BoxFuture<'static, Result<Vec<Outcome>>>,
}

impl Publication {
    pub(crate) fn new(
        tracker: Arc<CompletionTracker>,
        call: CallId,
        recorded: usize,
        pending: Vec<(usize, BoxFuture<'static, Outcome>)>,
    ) -> Self {
        let guard = TrackerGuard {
            tracker: Arc::clone(&tracker),
            call,
        };
        let inner = Box::pin(async move {
            let _guard = guard;
            let settled = join_all(
                pending
                    .into_iter()
                    .map(|(slot, future)| async move { (slot, future.await) }),
            )
            .await;
            for (slot, outcome) in settled {
                tracker.settle(call, slot, outcome)?;
            }
            // Collect while the entry is still visible; the guard drops it afterwards.
            tracker.collect(call, recorded)
        });
        Self { call, inner }
    }

    pub fn call(&self) -> CallId {
        self.call
    }
}

impl Future for Publication {
    type Output = Result<Vec<Outcome>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}
