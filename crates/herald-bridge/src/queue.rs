// Replays work buffered before a hub existed.
use herald_hub::Hub;
use serde_json::Value;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue entry must be a [channel, payload] array")]
    NotATuple,
    #[error("queue entry has {0} elements, expected 2")]
    WrongArity(usize),
    #[error("queue entry channel must be a string")]
    ChannelNotString,
}

/// One buffered unit of work.
pub enum QueueEntry {
    Publish { channel: String, payload: Value },
    Command(Box<dyn FnOnce(&Hub) + Send>),
}

impl QueueEntry {
    pub fn publish(channel: impl Into<String>, payload: impl Into<Value>) -> Self {
        QueueEntry::Publish {
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    pub fn command<F>(command: F) -> Self
    where
        F: FnOnce(&Hub) + Send + 'static,
    {
        QueueEntry::Command(Box::new(command))
    }

    /// Parse a `[channel, payload]` JSON tuple.
    ///
    /// ```
    /// use herald_bridge::{QueueEntry, QueueError};
    /// use serde_json::json;
    ///
    /// assert!(QueueEntry::from_value(json!(["orders", {"id": 1}])).is_ok());
    /// assert_eq!(
    ///     QueueEntry::from_value(json!({"channel": "orders"})).err(),
    ///     Some(QueueError::NotATuple)
    /// );
    /// ```
    pub fn from_value(value: Value) -> Result<Self, QueueError> {
        let Value::Array(items) = value else {
            return Err(QueueError::NotATuple);
        };
        if items.len() != 2 {
            return Err(QueueError::WrongArity(items.len()));
        }
        let mut items = items.into_iter();
        let (Some(channel), Some(payload)) = (items.next(), items.next()) else {
            return Err(QueueError::NotATuple);
        };
        let Value::String(channel) = channel else {
            return Err(QueueError::ChannelNotString);
        };
        Ok(QueueEntry::Publish { channel, payload })
    }
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueEntry::Publish { channel, payload } => f
                .debug_struct("Publish")
                .field("channel", channel)
                .field("payload", payload)
                .finish(),
            QueueEntry::Command(_) => f.write_str("Command(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub published: usize,
    pub executed: usize,
    pub skipped: usize,
}

/// Run every entry once, in order. Failures are logged and counted, never returned.
pub async fn drain<I>(hub: &Hub, entries: I) -> DrainReport
where
    I: IntoIterator<Item = QueueEntry>,
{
    let mut report = DrainReport::default();
    for (index, entry) in entries.into_iter().enumerate() {
        match entry {
            QueueEntry::Publish { channel, payload } => {
                if let Err(err) = hub.create_channel(&channel) {
                    tracing::warn!(index, channel = %channel, error = %err, "skipping queued publish");
                    report.skipped += 1;
                    continue;
                }
                match hub.publish(channel.as_str(), payload).await {
                    Ok(outcomes) => {
                        tracing::trace!(index, channel = %channel, deliveries = outcomes.len(), "queued publish replayed");
                        report.published += 1;
                    }
                    Err(err) => {
                        tracing::warn!(index, channel = %channel, error = %err, "queued publish failed");
                        report.skipped += 1;
                    }
                }
            }
            QueueEntry::Command(command) => {
                if panic::catch_unwind(AssertUnwindSafe(|| command(hub))).is_ok() {
                    report.executed += 1;
                } else {
                    tracing::warn!(index, "queued command panicked");
                    report.skipped += 1;
                }
            }
        }
    }
    tracing::debug!(
        published = report.published,
        executed = report.executed,
        skipped = report.skipped,
        "queue drained"
    );
    report
}

/// Parse raw `[channel, payload]` values and drain the well-formed ones.
pub async fn drain_values<I>(hub: &Hub, values: I) -> DrainReport
where
    I: IntoIterator<Item = Value>,
{
    let mut malformed = 0usize;
    let entries: Vec<QueueEntry> = values
        .into_iter()
        .enumerate()
        .filter_map(|(index, value)| match QueueEntry::from_value(value) {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::warn!(index, error = %err, "skipping malformed queue entry");
                malformed += 1;
                None
            }
        })
        .collect();
    let mut report = drain(hub, entries).await;
    report.skipped += malformed;
    report
}
