// Glue around a hub: replaying buffered work, forwarding foreign events, and
// subscription helpers built only on `subscribe`/`publish`.
pub mod events;
pub mod helpers;
pub mod queue;

pub use events::{EventSource, StopWatching, StreamSource, bridge, bridge_events};
pub use helpers::{WaitError, first, latest, once, only, until};
pub use queue::{DrainReport, QueueEntry, QueueError, drain, drain_values};
