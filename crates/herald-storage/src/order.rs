// Ordering and truncation helpers for merged history reads.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Order {
    #[serde(rename = "ASC", alias = "asc")]
    Asc,
    #[default]
    #[serde(rename = "DESC", alias = "desc")]
    Desc,
}

/// Maximum number of entries a read may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Count(usize),
    Unbounded,
}

impl Limit {
    pub fn is_zero(&self) -> bool {
        matches!(self, Limit::Count(0))
    }

    // How many of `available` entries this limit lets through.
    pub fn cap(&self, available: usize) -> usize {
        match self {
            Limit::Count(count) => available.min(*count),
            Limit::Unbounded => available,
        }
    }
}

impl From<usize> for Limit {
    fn from(value: usize) -> Self {
        Limit::Count(value)
    }
}

/// Anything that can be placed on the global sequence line.
pub trait Sequenced {
    /// `None` when the item has no usable numeric ordering key.
    fn sequence_key(&self) -> Option<u64>;
}

impl Sequenced for Message {
    fn sequence_key(&self) -> Option<u64> {
        Some(self.sequence())
    }
}

impl<T: Sequenced + ?Sized> Sequenced for Arc<T> {
    fn sequence_key(&self) -> Option<u64> {
        (**self).sequence_key()
    }
}

// Externally supplied records (seed files, bridged events) may lack the field.
impl Sequenced for Value {
    fn sequence_key(&self) -> Option<u64> {
        self.get("sequence").and_then(Value::as_u64)
    }
}

/// Sort by sequence; items without a numeric key are dropped, not misplaced.
///
/// ```
/// use herald_storage::{Order, sort_by_sequence};
/// use serde_json::json;
///
/// let items = vec![json!({"sequence": 2}), json!({"sequence": "x"}), json!({"sequence": 1})];
/// let sorted = sort_by_sequence(items, Order::Asc);
/// assert_eq!(sorted, vec![json!({"sequence": 1}), json!({"sequence": 2})]);
/// ```
pub fn sort_by_sequence<T: Sequenced>(items: impl IntoIterator<Item = T>, order: Order) -> Vec<T> {
    let mut keyed: Vec<(u64, T)> = items
        .into_iter()
        .filter_map(|item| item.sequence_key().map(|key| (key, item)))
        .collect();
    match order {
        Order::Asc => keyed.sort_by(|a, b| a.0.cmp(&b.0)),
        Order::Desc => keyed.sort_by(|a, b| b.0.cmp(&a.0)),
    }
    keyed.into_iter().map(|(_, item)| item).collect()
}
