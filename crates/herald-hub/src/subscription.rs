// Subscriber registry, callback contract and unsubscribe handles.
use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use herald_router::Route;
use herald_storage::Message;
use parking_lot::Mutex;
use serde_json::Value;
use slab::Slab;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;

use crate::error::BoxError;

/// What a subscriber callback hands back to the publisher.
pub enum Reply {
    Ready(Value),
    Pending(BoxFuture<'static, Result<Value, BoxError>>),
}

impl Reply {
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        Reply::Pending(Box::pin(future))
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Ready(value)
    }
}

impl From<()> for Reply {
    fn from(_: ()) -> Self {
        Reply::Ready(Value::Null)
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Reply::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

pub type CallbackResult = Result<Reply, BoxError>;

/// Subscriber callback: payload, the delivered message, and the subscription's own handle.
pub type Callback = Arc<dyn Fn(&Value, &Message, &Unsubscribe) -> CallbackResult + Send + Sync>;

/// How much history a new subscription replays before live delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backlog {
    #[default]
    None,
    Last(usize),
    All,
}

impl From<usize> for Backlog {
    fn from(value: usize) -> Self {
        if value == 0 {
            Backlog::None
        } else {
            Backlog::Last(value)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub backlog: Backlog,
    // Shows up in logs and in callback failure events.
    pub label: Option<String>,
}

impl SubscribeOptions {
    pub fn backlog(backlog: impl Into<Backlog>) -> Self {
        Self {
            backlog: backlog.into(),
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Handle that ends a subscription. Cloneable and safe to call any number of times.
#[derive(Clone)]
pub struct Unsubscribe {
    inner: Arc<UnsubscribeInner>,
}

struct UnsubscribeInner {
    key: usize,
    token: CancellationToken,
    removed: AtomicBool,
    registry: Weak<SubscriberRegistry>,
}

impl Unsubscribe {
    fn new(key: usize, registry: Weak<SubscriberRegistry>) -> Self {
        Self {
            inner: Arc::new(UnsubscribeInner {
                key,
                token: CancellationToken::new(),
                removed: AtomicBool::new(false),
                registry,
            }),
        }
    }

    pub fn unsubscribe(&self) {
        self.cancel(None);
    }

    pub fn unsubscribe_with_reason(&self, reason: impl fmt::Display) {
        self.cancel(Some(reason.to_string()));
    }

    fn cancel(&self, reason: Option<String>) {
        // Cancel first so any delivery still in this pass sees it.
        self.inner.token.cancel();
        if self.inner.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.remove(self.inner.key);
        }
        tracing::debug!(
            subscriber = self.inner.key,
            reason = reason.as_deref().unwrap_or("none"),
            "subscription cancelled"
        );
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once the subscription has been cancelled.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    /// Turn the handle into a guard that unsubscribes on drop.
    pub fn into_guard(self) -> SubscriptionGuard {
        SubscriptionGuard { handle: self }
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("key", &self.inner.key)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// RAII handle that unsubscribes on drop.
#[derive(Debug)]
pub struct SubscriptionGuard {
    handle: Unsubscribe,
}

impl SubscriptionGuard {
    pub fn handle(&self) -> &Unsubscribe {
        &self.handle
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.handle.unsubscribe();
    }
}

pub(crate) struct Subscriber {
    // Registration order; slab keys are reused so they cannot order the snapshot.
    order: u64,
    pub(crate) route: Route,
    pub(crate) callback: Callback,
    pub(crate) handle: Unsubscribe,
    pub(crate) label: Option<String>,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("order", &self.order)
            .field("route", &self.route)
            .field("label", &self.label)
            .finish()
    }
}

#[derive(Debug, Default)]
pub(crate) struct SubscriberRegistry {
    // Snapshot used by dispatch: a pass iterates the list as it was when the pass began.
    snapshot: ArcSwap<Vec<Arc<Subscriber>>>,
    // Inner registry mutated only on subscribe/unsubscribe paths.
    entries: Mutex<Slab<Arc<Subscriber>>>,
    next_order: AtomicU64,
}

impl SubscriberRegistry {
    pub(crate) fn register(
        self: &Arc<Self>,
        route: Route,
        callback: Callback,
        label: Option<String>,
    ) -> Arc<Subscriber> {
        let mut entries = self.entries.lock();
        let entry = entries.vacant_entry();
        let handle = Unsubscribe::new(entry.key(), Arc::downgrade(self));
        let subscriber = Arc::new(Subscriber {
            order: self.next_order.fetch_add(1, Ordering::Relaxed),
            route,
            callback,
            handle,
            label,
        });
        entry.insert(Arc::clone(&subscriber));
        self.rebuild_snapshot(&entries);
        subscriber
    }

    fn remove(&self, key: usize) {
        let mut entries = self.entries.lock();
        if entries.contains(key) {
            entries.remove(key);
            self.rebuild_snapshot(&entries);
        }
    }

    #[inline]
    pub(crate) fn snapshot(&self) -> Arc<Vec<Arc<Subscriber>>> {
        self.snapshot.load_full()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn rebuild_snapshot(&self, entries: &Slab<Arc<Subscriber>>) {
        let mut snapshot: Vec<Arc<Subscriber>> = entries.iter().map(|(_, s)| Arc::clone(s)).collect();
        snapshot.sort_by_key(|subscriber| subscriber.order);
        self.snapshot.store(Arc::new(snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Callback {
        Arc::new(|_: &Value, _: &Message, _: &Unsubscribe| -> CallbackResult { Ok(Reply::from(())) })
    }

    #[test]
    fn snapshot_keeps_registration_order_after_key_reuse() {
        let registry = Arc::new(SubscriberRegistry::default());
        let first = registry.register(Route::from("a"), noop(), Some("first".into()));
        let second = registry.register(Route::from("a"), noop(), Some("second".into()));
        first.handle.unsubscribe();
        // The third registration reuses the first slab slot.
        let _third = registry.register(Route::from("a"), noop(), Some("third".into()));
        let labels: Vec<Option<String>> = registry
            .snapshot()
            .iter()
            .map(|s| s.label.clone())
            .collect();
        assert_eq!(labels, vec![Some("second".into()), Some("third".into())]);
        assert!(!second.handle.is_cancelled());
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let registry = Arc::new(SubscriberRegistry::default());
        let sub = registry.register(Route::from("a"), noop(), None);
        let other = registry.register(Route::from("a"), noop(), None);
        sub.handle.unsubscribe();
        sub.handle.unsubscribe_with_reason("again");
        assert!(sub.handle.is_cancelled());
        assert_eq!(registry.len(), 1);
        assert!(!other.handle.is_cancelled());
    }

    #[test]
    fn guard_unsubscribes_on_drop() {
        let registry = Arc::new(SubscriberRegistry::default());
        let sub = registry.register(Route::from("a"), noop(), None);
        {
            let _guard = sub.handle.clone().into_guard();
        }
        assert!(sub.handle.is_cancelled());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn backlog_from_count() {
        assert_eq!(Backlog::from(0usize), Backlog::None);
        assert_eq!(Backlog::from(3usize), Backlog::Last(3));
        assert_eq!(SubscribeOptions::default().backlog, Backlog::None);
    }
}
