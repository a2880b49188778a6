//! Durable offline write queue and the reconciler that replays it.
//!
//! Mutations that could not reach the network are appended to the durable
//! store by the host. An external trigger later runs a reconciliation pass,
//! which replays every due mutation in enqueue order and deletes the ones
//! that succeed.

mod reconciler;
mod storage;
mod types;

pub use reconciler::{RetryPolicy, WriteQueue};
pub use storage::{MutationQueueRepository, NotificationQueueRepository, SqliteDurableStore};
pub use types::{NewMutation, QueuedMutation, SyncReport};
