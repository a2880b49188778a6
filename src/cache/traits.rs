//! Core types for the cache namespaces.

use chrono::{DateTime, Utc};

use crate::http::Response;

/// Which of the two namespaces a generation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceKind {
  /// Populated once at install from the asset manifest
  Static,
  /// Filled by write-through at request time
  Dynamic,
}

impl NamespaceKind {
  fn as_str(self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Dynamic => "dynamic",
    }
  }
}

/// A named, versioned cache collection.
///
/// The version is part of the name, so superseding a generation means
/// writing to a new name and deleting the old one on activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNamespace {
  pub name: String,
  pub version: u32,
}

impl CacheNamespace {
  pub fn new(prefix: &str, kind: NamespaceKind, version: u32) -> Self {
    Self {
      name: format!("{}-{}-v{}", prefix, kind.as_str(), version),
      version,
    }
  }
}

/// A stored response snapshot.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// Absolute URL of the request that produced it
  pub url: String,
  /// When the entry was last written
  pub stored_at: DateTime<Utc>,
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh data from network
  Network,
  /// A stored snapshot, returned because the strategy looks at cache first
  Cache,
  /// A stored snapshot, returned because the network was unreachable
  Offline,
  /// Built locally: offline JSON or image placeholder
  Synthesized,
}
