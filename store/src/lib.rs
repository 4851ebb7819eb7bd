//! Durable storage scoped to one actor instance.
//!
//! Each actor owns one SQLite file. Three tables back the offloaded-fetch
//! machinery:
//!
//! ```text
//! ActorStore
//! ├── fetch_queue   ordering_key → (req_id, state, not_before, FetchRequest)
//! ├── wakeups       req_id → (fires_at, continuation + pre-built timeout)
//! └── queue_alarm   single slot: when the queue wants its next processing pass
//! ```
//!
//! Every mutation is a single statement or a transaction, so a crash leaves each
//! row either before or after a transition, never between.

mod actor_store;
mod queue;
mod sqlite_util;
mod wakeup;

pub use actor_store::ActorStore;
pub use queue::{CorruptEntry, EnqueueError, EntryState, QueueEntry, QueueStats, StoredEntry};
pub use sqlite_util::epoch_ms;
pub use wakeup::{ScheduledWakeup, WakeupPayload};
