// Hub error types and the wrappers for failed or panicking subscriber callbacks.
use herald_storage::CallId;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, HubError>;

#[derive(thiserror::Error, Debug)]
pub enum HubError {
    #[error("invalid channel name (wildcards are not allowed): {0}")]
    InvalidChannelName(String),
    #[error("completion tracker lost entry for {0}")]
    TrackerEntryMissing(CallId),
    #[error("completion tracker slot {slot} never settled for {call}")]
    UnsettledSlot { call: CallId, slot: usize },
    #[error(transparent)]
    Config(#[from] herald_common::Error),
}

/// Failure raised by a subscriber callback, synchronously or from its pending reply.
#[derive(thiserror::Error, Debug)]
#[error("subscriber callback failed on channel {channel} (sequence {sequence})")]
pub struct CallbackError {
    channel: Arc<str>,
    sequence: u64,
    subscriber: Option<String>,
    #[source]
    source: BoxError,
}

impl CallbackError {
    pub fn new(
        channel: Arc<str>,
        sequence: u64,
        subscriber: Option<String>,
        source: BoxError,
    ) -> Self {
        Self {
            channel,
            sequence,
            subscriber,
            source,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    // Label given at subscribe time, if any.
    pub fn subscriber(&self) -> Option<&str> {
        self.subscriber.as_deref()
    }

    pub fn cause(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.source.as_ref()
    }

    /// The panic wrapper when the callback panicked instead of returning an error.
    pub fn panic(&self) -> Option<&PanicError> {
        self.source.downcast_ref::<PanicError>()
    }
}

/// Error-shaped wrapper around a panic payload.
///
/// The raw payload stays reachable through [`PanicError::take_payload`].
#[derive(thiserror::Error, Debug)]
#[error("callback panicked: {message}")]
pub struct PanicError {
    message: String,
    payload: Mutex<Option<Box<dyn Any + Send>>>,
}

impl PanicError {
    pub fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&'static str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self {
            message,
            payload: Mutex::new(Some(payload)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    // The payload can be taken once; later calls return None.
    pub fn take_payload(&self) -> Option<Box<dyn Any + Send>> {
        self.payload.lock().take()
    }
}
