// Message records and the per-channel append-only log that stores them.
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

pub mod order;

pub use order::{Limit, Order, Sequenced, sort_by_sequence};

/// Identity of a single publish call.
///
/// Every message produced by one call carries the same id, and two calls with
/// equal payloads always get different ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(u64);

impl CallId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// Immutable record of one payload dispatched on one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    channel: Arc<str>,
    payload: Value,
    sequence: u64,
    call: CallId,
}

impl Message {
    pub fn new(channel: Arc<str>, payload: Value, sequence: u64, call: CallId) -> Self {
        Self {
            channel,
            payload,
            sequence,
            call,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn channel_name(&self) -> &Arc<str> {
        &self.channel
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn call(&self) -> CallId {
        self.call
    }
}

/// Append-only, sequence-ordered log for one channel.
///
/// ```
/// use herald_storage::{CallId, ChannelLog, Message};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// let log = ChannelLog::new("orders");
/// let name = log.name().clone();
/// let idx = log.append(Arc::new(Message::new(name, json!("a"), 0, CallId::new(0))));
/// assert_eq!(idx, 0);
/// assert_eq!(log.len(), 1);
/// ```
#[derive(Debug)]
pub struct ChannelLog {
    name: Arc<str>,
    // Insertion order equals sequence order; enforced on append in debug builds.
    entries: RwLock<Vec<Arc<Message>>>,
}

impl ChannelLog {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Append a message and return its index. Appending never dispatches.
    pub fn append(&self, message: Arc<Message>) -> usize {
        let mut entries = self.entries.write();
        debug_assert_eq!(message.channel(), &*self.name);
        #[cfg(debug_assertions)]
        {
            if let Some(last) = entries.last() {
                debug_assert!(last.sequence < message.sequence);
            }
        }
        entries.push(message);
        entries.len() - 1
    }

    /// Build and append under the write lock, so a sequence drawn inside `build`
    /// can never land behind a later one from a concurrent writer.
    pub fn append_with<F>(&self, build: F) -> Arc<Message>
    where
        F: FnOnce(&Arc<str>) -> Message,
    {
        let mut entries = self.entries.write();
        let message = Arc::new(build(&self.name));
        debug_assert!(
            entries
                .last()
                .is_none_or(|last| last.sequence < message.sequence)
        );
        entries.push(Arc::clone(&message));
        message
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Arc<Message>> {
        self.entries.read().get(index).cloned()
    }

    pub fn tail_sequence(&self) -> Option<u64> {
        self.entries.read().last().map(|entry| entry.sequence)
    }

    // Copy of the whole log, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<Message>> {
        self.entries.read().clone()
    }

    /// Up to `limit` most recent messages, newest first.
    pub fn latest(&self, limit: Limit) -> Vec<Arc<Message>> {
        let entries = self.entries.read();
        let take = limit.cap(entries.len());
        entries.iter().rev().take(take).cloned().collect()
    }
}
