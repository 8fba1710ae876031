// Shared data types and small helpers used across the herald crates.
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("config error: {0}")]
    Config(String),
}

pub mod ids {
    // Strongly typed IDs so hub and subscriber identities never mix.
    use super::{Error, Result};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::str::FromStr;
    use uuid::Uuid;

    macro_rules! id_type {
        ($name:ident) => {
            #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
            pub struct $name(Uuid);

            impl $name {
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }

                pub fn from_uuid(uuid: Uuid) -> Self {
                    Self(uuid)
                }

                pub fn as_uuid(&self) -> Uuid {
                    self.0
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl FromStr for $name {
                type Err = Error;

                fn from_str(input: &str) -> Result<Self> {
                    // Preserve the original input for clearer error messages.
                    let uuid =
                        Uuid::parse_str(input).map_err(|_| Error::InvalidId(input.into()))?;
                    Ok(Self(uuid))
                }
            }
        };
    }

    id_type!(HubId);
}

/// Monotonic sequence source shared by every channel of a hub.
///
/// Sequence numbers only order messages; they are never wall-clock time.
///
/// ```
/// use herald_common::Sequencer;
///
/// let sequencer = Sequencer::new();
/// let first = sequencer.next();
/// let second = sequencer.next();
/// assert!(second > first);
/// ```
#[derive(Debug, Default)]
pub struct Sequencer {
    next: AtomicU64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    // Start from a known value, mostly useful for tests.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next(&self) -> u64 {
        let value = self.next.fetch_add(1, Ordering::Relaxed);
        debug_assert!(value < u64::MAX, "sequence overflow");
        value
    }

    /// Next value that will be handed out, without consuming it.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

pub const DEFAULT_EVENT_CAPACITY: usize = 256;
pub const DEFAULT_QUERY_LIMIT: usize = 1;

/// Tunables for a hub instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    // Capacity of the broadcast channel carrying hub events (callback failures).
    pub event_capacity: usize,
    // Limit applied when a query does not set one.
    pub default_query_limit: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            default_query_limit: DEFAULT_QUERY_LIMIT,
        }
    }
}

impl HubConfig {
    pub fn validate(&self) -> Result<()> {
        // tokio broadcast channels panic on zero capacity.
        if self.event_capacity == 0 {
            return Err(Error::Config("event_capacity must be > 0".into()));
        }
        Ok(())
    }
}
