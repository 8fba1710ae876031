// Subscription helpers expressed purely through `Hub::subscribe`.
use herald_hub::{CallbackResult, Hub, Message, Reply, Route, Unsubscribe};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("timed out waiting for a message")]
    Timeout,
    #[error("subscription closed before a message arrived")]
    Closed,
}

/// Deliver at most one message, then unsubscribe.
pub fn once<R, F>(hub: &Hub, route: R, callback: F) -> Unsubscribe
where
    R: Into<Route>,
    F: Fn(&Value, &Message, &Unsubscribe) -> CallbackResult + Send + Sync + 'static,
{
    let fired = AtomicBool::new(false);
    hub.subscribe(route, 0, move |payload, message, unsubscribe| {
        // Concurrent publishers may both reach us before the unsubscribe lands.
        if fired.swap(true, Ordering::AcqRel) {
            return Ok(Reply::from(()));
        }
        unsubscribe.unsubscribe();
        callback(payload, message, unsubscribe)
    })
}

/// Deliver only messages whose payload satisfies `predicate`.
pub fn only<R, P, F>(hub: &Hub, route: R, predicate: P, callback: F) -> Unsubscribe
where
    R: Into<Route>,
    P: Fn(&Value) -> bool + Send + Sync + 'static,
    F: Fn(&Value, &Message, &Unsubscribe) -> CallbackResult + Send + Sync + 'static,
{
    hub.subscribe(route, 0, move |payload, message, unsubscribe| {
        if predicate(payload) {
            callback(payload, message, unsubscribe)
        } else {
            Ok(Reply::from(()))
        }
    })
}

/// Deliver messages until one satisfies `predicate`; that one is delivered last.
pub fn until<R, P, F>(hub: &Hub, route: R, predicate: P, callback: F) -> Unsubscribe
where
    R: Into<Route>,
    P: Fn(&Value) -> bool + Send + Sync + 'static,
    F: Fn(&Value, &Message, &Unsubscribe) -> CallbackResult + Send + Sync + 'static,
{
    hub.subscribe(route, 0, move |payload, message, unsubscribe| {
        if predicate(payload) {
            unsubscribe.unsubscribe();
        }
        callback(payload, message, unsubscribe)
    })
}

/// Wait for the next message on `route` that satisfies `predicate`.
///
/// ```
/// use herald_bridge::{WaitError, first};
/// use herald_hub::Hub;
/// use std::time::Duration;
///
/// # tokio::runtime::Builder::new_current_thread().enable_time().build().expect("rt").block_on(async {
/// let hub = Hub::new();
/// let waited = first(&hub, "orders", |_| true, Some(Duration::from_millis(10))).await;
/// assert_eq!(waited.err(), Some(WaitError::Timeout));
/// # });
/// ```
pub async fn first<R, P>(
    hub: &Hub,
    route: R,
    predicate: P,
    timeout: Option<Duration>,
) -> Result<Message, WaitError>
where
    R: Into<Route>,
    P: Fn(&Value) -> bool + Send + Sync + 'static,
{
    wait_for(hub, route.into(), 0, predicate, timeout).await
}

/// The newest stored message on `route`, or the next one published if there is none yet.
pub async fn latest<R>(hub: &Hub, route: R, timeout: Option<Duration>) -> Result<Message, WaitError>
where
    R: Into<Route>,
{
    // A backlog of one replays the newest stored message during subscribe, so
    // nothing published in between can be missed.
    wait_for(hub, route.into(), 1, |_: &Value| true, timeout).await
}

async fn wait_for<P>(
    hub: &Hub,
    route: Route,
    backlog: usize,
    predicate: P,
    timeout: Option<Duration>,
) -> Result<Message, WaitError>
where
    P: Fn(&Value) -> bool + Send + Sync + 'static,
{
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    let handle = hub.subscribe(route, backlog, move |payload, message, unsubscribe| {
        if predicate(payload)
            && let Some(tx) = tx.lock().take()
        {
            unsubscribe.unsubscribe();
            let _ = tx.send(message.clone());
        }
        Ok(Reply::from(()))
    });
    let _guard = handle.into_guard();
    let received = match timeout {
        Some(limit) => tokio::time::timeout(limit, rx)
            .await
            .map_err(|_| WaitError::Timeout)?,
        None => rx.await,
    };
    received.map_err(|_| WaitError::Closed)
}
