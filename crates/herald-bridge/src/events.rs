// Forwards events from a foreign source into one hub channel.
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use herald_hub::{Hub, HubError};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A foreign event feed. `None` means the source is exhausted.
pub trait EventSource: Send + 'static {
    type Event: Send + 'static;

    fn next_event(&mut self) -> BoxFuture<'_, Option<Self::Event>>;
}

impl<E: Send + 'static> EventSource for mpsc::Receiver<E> {
    type Event = E;

    fn next_event(&mut self) -> BoxFuture<'_, Option<E>> {
        self.recv().boxed()
    }
}

impl<E: Clone + Send + 'static> EventSource for broadcast::Receiver<E> {
    type Event = E;

    fn next_event(&mut self) -> BoxFuture<'_, Option<E>> {
        async move {
            loop {
                match self.recv().await {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "bridge source lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }
        .boxed()
    }
}

/// Adapts any `Stream` into an [`EventSource`].
pub struct StreamSource<S>(pub S);

impl<S> EventSource for StreamSource<S>
where
    S: Stream + Send + Unpin + 'static,
    S::Item: Send + 'static,
{
    type Event = S::Item;

    fn next_event(&mut self) -> BoxFuture<'_, Option<S::Item>> {
        self.0.next().boxed()
    }
}

/// Handle returned by [`bridge`]; stops forwarding when told to or when dropped.
#[derive(Debug)]
pub struct StopWatching {
    token: CancellationToken,
    task: Option<JoinHandle<usize>>,
}

impl StopWatching {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop and wait for the forwarding task. Returns how many events were forwarded.
    pub async fn join(self) -> usize {
        self.token.cancel();
        self.closed().await
    }

    /// Wait for the source to run dry without stopping the bridge early.
    pub async fn closed(mut self) -> usize {
        match self.task.take() {
            Some(task) => task.await.unwrap_or_else(|err| {
                tracing::warn!(error = %err, "bridge task ended abnormally");
                0
            }),
            None => 0,
        }
    }
}

impl Drop for StopWatching {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Forward every event from `source` into `channel`, mapped through `processor`.
///
/// Events the processor maps to `None` are ignored. Must be called inside a tokio runtime.
pub fn bridge<S, P>(
    hub: Arc<Hub>,
    channel: &str,
    mut source: S,
    processor: P,
) -> Result<StopWatching, HubError>
where
    S: EventSource,
    P: Fn(S::Event) -> Option<Value> + Send + 'static,
{
    let channel = hub.create_channel(channel)?;
    let token = CancellationToken::new();
    let stop = token.clone();
    let task = tokio::spawn(async move {
        let mut forwarded = 0usize;
        loop {
            let event = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                event = source.next_event() => event,
            };
            let Some(event) = event else {
                tracing::debug!(channel = %channel, "bridge source closed");
                break;
            };
            let Some(payload) = processor(event) else {
                continue;
            };
            if stop.is_cancelled() {
                break;
            }
            match hub.publish(&*channel, payload).await {
                Ok(_) => forwarded += 1,
                Err(err) => tracing::warn!(channel = %channel, error = %err, "bridged publish failed"),
            }
        }
        tracing::debug!(channel = %channel, forwarded, "bridge stopped");
        forwarded
    });
    Ok(StopWatching {
        token,
        task: Some(task),
    })
}

/// [`bridge`] with events passed through unchanged.
pub fn bridge_events<S>(hub: Arc<Hub>, channel: &str, source: S) -> Result<StopWatching, HubError>
where
    S: EventSource,
    S::Event: Into<Value>,
{
    bridge(hub, channel, source, |event: S::Event| Some(event.into()))
}
