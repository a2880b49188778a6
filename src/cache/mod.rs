//! Versioned cache namespaces and their lifecycle.
//!
//! Two namespaces are current at any time, `static` (filled at install from a
//! fixed manifest) and `dynamic` (filled by write-through). Every other
//! namespace is a stale generation and is deleted on activation.

mod manager;
mod storage;
mod traits;

pub use manager::CacheStoreManager;
pub use storage::{CacheRepository, SqliteCacheStorage};
pub use traits::ResponseSource;
#[cfg(test)]
pub use storage::CacheWrite;
#[cfg(test)]
pub use traits::{CacheNamespace, CachedResponse, NamespaceKind};
