use herald_storage::Message;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::{BoxError, CallbackError};
use crate::tracker::Outcome;

/// Notifications raised by the hub, observable through `Hub::watch_events`.
#[derive(Debug, Clone)]
pub enum HubEvent {
    CallbackFailed(Arc<CallbackError>),
}

// Wrap a callback failure, broadcast it once, and hand back the result-list entry.
pub(crate) fn report_failure(
    events: &broadcast::Sender<HubEvent>,
    message: &Message,
    label: Option<String>,
    source: BoxError,
) -> Outcome {
    let error = Arc::new(CallbackError::new(
        Arc::clone(message.channel_name()),
        message.sequence(),
        label,
        source,
    ));
    tracing::warn!(
        channel = %error.channel(),
        sequence = error.sequence(),
        subscriber = error.subscriber().unwrap_or("-"),
        error = %error.cause(),
        "subscriber callback failed"
    );
    metrics::counter!("herald_callback_failures_total").increment(1);
    // No receivers is fine: delivery must not depend on anyone watching.
    let _ = events.send(HubEvent::CallbackFailed(Arc::clone(&error)));
    Outcome::Failed(error)
}
