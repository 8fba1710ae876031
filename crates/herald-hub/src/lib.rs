// In-process publish/subscribe hub with per-channel message history.
// Channels are created on first literal publish (or explicitly) and never removed;
// every dispatched message stays in its channel log for replay and queries.
use ahash::RandomState;
use futures::FutureExt;
use futures::future::BoxFuture;
use hashbrown::{HashMap, HashSet};
use herald_common::ids::HubId;
use herald_common::{HubConfig, Sequencer};
use herald_storage::{ChannelLog, sort_by_sequence};
use parking_lot::{ReentrantMutex, RwLock};
use serde_json::Value;
use smallvec::SmallVec;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::broadcast;

pub mod error;
mod events;
pub mod query;
pub mod subscription;
pub mod tracker;

pub use error::{BoxError, CallbackError, HubError, PanicError, Result};
pub use events::HubEvent;
pub use herald_router::{Route, RouteError};
pub use herald_storage::{CallId, Limit, Message, Order};
pub use query::Query;
pub use subscription::{
    Backlog, Callback, CallbackResult, Reply, SubscribeOptions, SubscriptionGuard, Unsubscribe,
};
pub use tracker::{InFlight, Outcome, Publication};

use events::report_failure;
use subscription::{Subscriber, SubscriberRegistry};
use tracker::{CompletionTracker, Slot};

// Most publishes and queries touch a single channel.
type Targets = SmallVec<[Arc<ChannelLog>; 4]>;

#[derive(Debug, Default)]
struct ChannelRegistry {
    // Name -> position in `logs`.
    index: HashMap<Arc<str>, usize, RandomState>,
    // Creation order; wildcard resolution walks channels in this order.
    logs: Vec<Arc<ChannelLog>>,
}

/// In-process publish/subscribe hub.
///
/// ```
/// use herald_hub::{Hub, Query, Reply};
/// use serde_json::json;
///
/// let hub = Hub::new();
/// hub.subscribe("greetings", 0, |payload, _message, _unsubscribe| {
///     Ok(Reply::from(json!(format!("seen {payload}"))))
/// });
/// let rt = tokio::runtime::Builder::new_current_thread().build().expect("rt");
/// let outcomes = rt.block_on(hub.publish("greetings", "hello")).expect("publish");
/// assert_eq!(outcomes[0].value(), Some(&json!("seen \"hello\"")));
/// let history = hub.query(&Query::new("greetings"));
/// assert_eq!(history[0].payload(), &json!("hello"));
/// ```
#[derive(Debug)]
pub struct Hub {
    id: HubId,
    config: HubConfig,
    // Sequence source for every message on every channel of this hub.
    sequencer: Arc<Sequencer>,
    channels: RwLock<ChannelRegistry>,
    subscribers: Arc<SubscriberRegistry>,
    tracker: Arc<CompletionTracker>,
    events: broadcast::Sender<HubEvent>,
    // Held across append + dispatch and across subscribe + backlog replay, so every
    // subscriber sees messages in sequence order and the backlog cut-off is exact.
    // Reentrant because callbacks may publish or subscribe.
    delivery: ReentrantMutex<()>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self::build(HubConfig::default(), Arc::new(Sequencer::new()))
    }

    pub fn with_config(config: HubConfig) -> Result<Self> {
        Self::with_sequencer(config, Arc::new(Sequencer::new()))
    }

    /// Build a hub that draws sequence numbers from a shared sequencer.
    pub fn with_sequencer(config: HubConfig, sequencer: Arc<Sequencer>) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, sequencer))
    }

    fn build(config: HubConfig, sequencer: Arc<Sequencer>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        let hub = Self {
            id: HubId::new(),
            config,
            sequencer,
            channels: RwLock::new(ChannelRegistry::default()),
            subscribers: Arc::new(SubscriberRegistry::default()),
            tracker: Arc::new(CompletionTracker::default()),
            events,
            delivery: ReentrantMutex::new(()),
        };
        tracing::debug!(hub = %hub.id, "hub created");
        hub
    }

    pub fn id(&self) -> HubId {
        self.id
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Create `name` if missing and return the stored name. Names may not contain `*`.
    pub fn create_channel(&self, name: &str) -> Result<Arc<str>> {
        if name.contains('*') {
            return Err(HubError::InvalidChannelName(name.to_string()));
        }
        Ok(Arc::clone(self.channel_log(name).name()))
    }

    pub fn has_channel(&self, name: &str) -> bool {
        self.channels.read().index.contains_key(name)
    }

    // Channel names in creation order.
    pub fn channels(&self) -> Vec<Arc<str>> {
        self.channels
            .read()
            .logs
            .iter()
            .map(|log| Arc::clone(log.name()))
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Receiver for hub notifications such as subscriber callback failures.
    pub fn watch_events(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    /// Progress of a publish call that has not finished settling yet.
    ///
    /// The entry exists from the moment dispatch starts, so a callback asking about
    /// its own call sees the slots recorded before it.
    pub fn in_flight(&self, call: CallId) -> Option<InFlight> {
        self.tracker.in_flight(call)
    }

    /// Subscribe `callback` to every channel matching `route`, replaying up to
    /// `backlog` stored messages first. `usize::MAX` replays the whole history.
    pub fn subscribe<R, F>(&self, route: R, backlog: usize, callback: F) -> Unsubscribe
    where
        R: Into<Route>,
        F: Fn(&Value, &Message, &Unsubscribe) -> CallbackResult + Send + Sync + 'static,
    {
        self.subscribe_with(route, SubscribeOptions::backlog(backlog), callback)
    }

    pub fn subscribe_with<R, F>(
        &self,
        route: R,
        options: SubscribeOptions,
        callback: F,
    ) -> Unsubscribe
    where
        R: Into<Route>,
        F: Fn(&Value, &Message, &Unsubscribe) -> CallbackResult + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        let _delivery = self.delivery.lock();
        let subscriber = self
            .subscribers
            .register(route.into(), callback, options.label);
        let handle = subscriber.handle.clone();
        tracing::debug!(
            hub = %self.id,
            route = %subscriber.route,
            backlog = ?options.backlog,
            "subscribed"
        );

        let limit = match options.backlog {
            Backlog::None => return handle,
            Backlog::Last(count) => Limit::Count(count),
            Backlog::All => Limit::Unbounded,
        };
        // Newest first, exactly as a DESC query would return them.
        let history = self.history(&subscriber.route, Order::Desc, limit);
        for message in &history {
            // Checked per message: the callback itself may unsubscribe mid-replay.
            if handle.is_cancelled() {
                break;
            }
            match self.invoke(&subscriber, message) {
                Slot::Ready(_) => {}
                Slot::Pending(future) => detach(future),
            }
        }
        handle
    }

    /// Append `payload` to every channel selected by `routes` and dispatch it.
    ///
    /// Dispatch runs before this returns; the returned future resolves once every
    /// pending reply has settled, with outcomes in invocation order. Publishes from
    /// different threads are delivered one at a time, in sequence order.
    pub fn publish(&self, routes: impl Into<Route>, payload: impl Into<Value>) -> Publication {
        let routes = routes.into();
        let payload = payload.into();
        let call = self.tracker.next_call();
        let targets = self.resolve(&routes, true);
        metrics::counter!("herald_publish_total").increment(1);
        self.tracker.open(call);

        let _delivery = self.delivery.lock();
        let mut recorded = 0usize;
        let mut pending = Vec::new();
        for log in targets {
            // Sequence is drawn under the log's write lock to keep insertion order.
            let message = log.append_with(|name| {
                Message::new(Arc::clone(name), payload.clone(), self.sequencer.next(), call)
            });
            tracing::trace!(
                channel = %message.channel(),
                sequence = message.sequence(),
                call = %call,
                "message appended"
            );
            self.dispatch(&message, |slot| {
                recorded += 1;
                match slot {
                    Slot::Ready(outcome) => {
                        self.tracker.record(call, Some(outcome));
                    }
                    Slot::Pending(future) => {
                        let index = self.tracker.record(call, None);
                        pending.push((index, future));
                    }
                }
            });
        }
        Publication::new(Arc::clone(&self.tracker), call, recorded, pending)
    }

    pub fn query(&self, query: &Query) -> Vec<Arc<Message>> {
        // Unset route is a defined, empty result rather than an error.
        let Some(route) = &query.cid else {
            return Vec::new();
        };
        let limit = query
            .limit
            .unwrap_or(Limit::Count(self.config.default_query_limit));
        self.history(route, query.order, limit)
    }

    pub fn messages(
        &self,
        route: impl Into<Route>,
        order: Order,
        limit: impl Into<Limit>,
    ) -> Vec<Arc<Message>> {
        self.history(&route.into(), order, limit.into())
    }

    fn history(&self, route: &Route, order: Order, limit: Limit) -> Vec<Arc<Message>> {
        if limit.is_zero() {
            return Vec::new();
        }
        let logs = self.resolve(route, false);
        let merged: Vec<Arc<Message>> = match order {
            // The newest `limit` overall are among each log's newest `limit`.
            Order::Desc => logs.iter().flat_map(|log| log.latest(limit)).collect(),
            Order::Asc => logs.iter().flat_map(|log| log.snapshot()).collect(),
        };
        let mut sorted = sort_by_sequence(merged, order);
        sorted.truncate(limit.cap(sorted.len()));
        sorted
    }

    // Target channels for `route`, deduplicated, in route order then creation order.
    fn resolve(&self, route: &Route, create: bool) -> Targets {
        let mut seen: HashSet<Arc<str>, RandomState> = HashSet::with_hasher(RandomState::new());
        let mut targets = Targets::new();
        for leaf in route.leaves() {
            if let Route::Literal(name) = leaf
                && leaf.is_literal()
            {
                let log = if create {
                    Some(self.channel_log(name))
                } else {
                    self.existing_log(name)
                };
                if let Some(log) = log
                    && seen.insert(Arc::clone(log.name()))
                {
                    targets.push(log);
                }
                continue;
            }
            // A wildcard or pattern never names a new channel.
            let channels = self.channels.read();
            for log in channels.logs.iter().filter(|log| leaf.is_match(log.name())) {
                if seen.insert(Arc::clone(log.name())) {
                    targets.push(Arc::clone(log));
                }
            }
        }
        targets
    }

    fn existing_log(&self, name: &str) -> Option<Arc<ChannelLog>> {
        let channels = self.channels.read();
        channels
            .index
            .get(name)
            .map(|idx| Arc::clone(&channels.logs[*idx]))
    }

    fn channel_log(&self, name: &str) -> Arc<ChannelLog> {
        if let Some(log) = self.existing_log(name) {
            return log;
        }
        let mut channels = self.channels.write();
        // Another caller may have created it between the read and write lock.
        if let Some(idx) = channels.index.get(name).copied() {
            return Arc::clone(&channels.logs[idx]);
        }
        let log = Arc::new(ChannelLog::new(name));
        let idx = channels.logs.len();
        channels.logs.push(Arc::clone(&log));
        channels.index.insert(Arc::clone(log.name()), idx);
        metrics::counter!("herald_channels_created_total").increment(1);
        tracing::debug!(hub = %self.id, channel = name, "channel created");
        log
    }

    fn dispatch(&self, message: &Arc<Message>, mut sink: impl FnMut(Slot)) {
        // Subscriptions added during this pass are not in the snapshot.
        let subscribers = self.subscribers.snapshot();
        for subscriber in subscribers.iter() {
            if subscriber.handle.is_cancelled() || !subscriber.route.is_match(message.channel()) {
                continue;
            }
            sink(self.invoke(subscriber, message));
        }
    }

    fn invoke(&self, subscriber: &Subscriber, message: &Arc<Message>) -> Slot {
        metrics::counter!("herald_deliveries_total").increment(1);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            (subscriber.callback)(message.payload(), message.as_ref(), &subscriber.handle)
        }));
        match result {
            Ok(Ok(Reply::Ready(value))) => Slot::Ready(Outcome::Value(value)),
            Ok(Ok(Reply::Pending(future))) => {
                let events = self.events.clone();
                let message = Arc::clone(message);
                let label = subscriber.label.clone();
                Slot::Pending(Box::pin(async move {
                    match AssertUnwindSafe(future).catch_unwind().await {
                        Ok(Ok(value)) => Outcome::Value(value),
                        Ok(Err(source)) => report_failure(&events, &message, label, source),
                        Err(payload) => report_failure(
                            &events,
                            &message,
                            label,
                            Box::new(PanicError::from_payload(payload)),
                        ),
                    }
                }))
            }
            Ok(Err(source)) => Slot::Ready(report_failure(
                &self.events,
                message,
                subscriber.label.clone(),
                source,
            )),
            Err(payload) => Slot::Ready(report_failure(
                &self.events,
                message,
                subscriber.label.clone(),
                Box::new(PanicError::from_payload(payload)),
            )),
        }
    }
}

// Backlog replies have no publish call waiting on them; settle them on the runtime if there is one.
fn detach(future: BoxFuture<'static, Outcome>) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(future);
        }
        Err(_) => tracing::debug!("no runtime to settle a pending backlog reply; dropping it"),
    }
}

#[cfg(test)]
mod tests;
