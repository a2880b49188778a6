//! Cache store manager that owns the namespace generations.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::storage::{CacheRepository, CacheWrite};
use super::traits::{CacheNamespace, CachedResponse, NamespaceKind};
use crate::config::CacheConfig;
use crate::http::{CacheKey, Request, Response};
use crate::net::Network;

/// Owns the `static` and `dynamic` namespaces and the install/activate
/// lifecycle. No other component writes to the cache repository.
#[derive(Clone)]
pub struct CacheStoreManager {
  repo: Arc<dyn CacheRepository>,
  static_ns: CacheNamespace,
  dynamic_ns: CacheNamespace,
  relevant_headers: Vec<String>,
}

impl CacheStoreManager {
  pub fn new(repo: Arc<dyn CacheRepository>, config: &CacheConfig) -> Self {
    Self {
      repo,
      static_ns: CacheNamespace::new(&config.prefix, NamespaceKind::Static, config.version),
      dynamic_ns: CacheNamespace::new(&config.prefix, NamespaceKind::Dynamic, config.version),
      relevant_headers: config.relevant_headers.clone(),
    }
  }

  pub fn key_for(&self, request: &Request) -> CacheKey {
    CacheKey::for_request(request, &self.relevant_headers)
  }

  /// The allow-list: the only namespace names that survive activation.
  pub fn current_names(&self) -> [&str; 2] {
    [self.static_ns.name.as_str(), self.dynamic_ns.name.as_str()]
  }

  /// Populate the static namespace from the asset manifest.
  ///
  /// All manifest entries are fetched before anything is written; a single
  /// failed or non-2xx fetch fails the whole step and leaves the cache
  /// untouched.
  pub async fn install(&self, network: &dyn Network, manifest: &[Url]) -> Result<usize> {
    let requests: Vec<Request> = manifest.iter().cloned().map(Request::get).collect();

    let results = join_all(requests.iter().map(|request| network.fetch(request))).await;

    let mut writes = Vec::with_capacity(requests.len());
    for (request, result) in requests.iter().zip(results) {
      let response =
        result.map_err(|e| eyre!("Failed to fetch manifest entry {}: {}", request.url, e))?;
      if !response.is_success() {
        return Err(eyre!(
          "Manifest entry {} returned status {}",
          request.url,
          response.status
        ));
      }
      writes.push(CacheWrite {
        key: self.key_for(request),
        url: request.url.to_string(),
        response,
      });
    }

    self.repo.put_all(&self.static_ns, &writes)?;
    info!(
      namespace = %self.static_ns.name,
      entries = writes.len(),
      "Cached static manifest"
    );

    Ok(writes.len())
  }

  /// Delete every namespace not on the allow-list. Returns the deleted names.
  pub fn activate(&self) -> Result<Vec<String>> {
    let keep = self.current_names();
    let mut deleted = Vec::new();

    for name in self.repo.namespaces()? {
      if keep.contains(&name.as_str()) {
        continue;
      }
      info!(namespace = %name, "Deleting stale cache namespace");
      if self.repo.delete_namespace(&name)? {
        deleted.push(name);
      }
    }

    Ok(deleted)
  }

  /// Look the request up in every existing namespace.
  pub fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>> {
    self.repo.match_any(&self.key_for(request))
  }

  /// Write-through into the current dynamic namespace. Non-2xx responses are
  /// never stored.
  pub fn put_dynamic(&self, request: &Request, response: &Response) -> Result<()> {
    if !response.is_success() {
      return Ok(());
    }

    self.repo.put(
      &self.dynamic_ns,
      &CacheWrite {
        key: self.key_for(request),
        url: request.url.to_string(),
        response: response.clone(),
      },
    )
  }

  /// Existing namespace names, oldest first.
  #[cfg(test)]
  pub fn namespaces(&self) -> Result<Vec<String>> {
    self.repo.namespaces()
  }

  /// Best-effort write-through: cache I/O failures are logged, never raised.
  pub fn store_best_effort(&self, request: &Request, response: &Response) {
    if let Err(e) = self.put_dynamic(request, response) {
      warn!(url = %request.url, "Cache write failed: {}", e);
    }
  }

  /// Best-effort lookup: a failing read counts as a miss.
  pub fn lookup_best_effort(&self, request: &Request) -> Option<CachedResponse> {
    match self.match_any(request) {
      Ok(Some(found)) => {
        debug!(url = %found.url, stored_at = %found.stored_at, "Cache hit");
        Some(found)
      }
      Ok(None) => None,
      Err(e) => {
        warn!(url = %request.url, "Cache read failed: {}", e);
        None
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteCacheStorage;
  use crate::testing::ScriptedNetwork;

  fn manager() -> (CacheStoreManager, Arc<SqliteCacheStorage>) {
    let repo = Arc::new(SqliteCacheStorage::open_in_memory().unwrap());
    let config = CacheConfig {
      prefix: "eco".to_string(),
      version: 2,
      ..CacheConfig::default()
    };
    (CacheStoreManager::new(repo.clone(), &config), repo)
  }

  fn url(path: &str) -> Url {
    Url::parse("http://localhost").unwrap().join(path).unwrap()
  }

  #[tokio::test]
  async fn test_install_caches_manifest() {
    let (manager, _) = manager();
    let network = ScriptedNetwork::new()
      .respond("/", Response::new(200, "root"))
      .respond("/offline.html", Response::new(200, "offline"));

    let count = manager
      .install(&network, &[url("/"), url("/offline.html")])
      .await
      .unwrap();

    assert_eq!(count, 2);
    assert_eq!(manager.namespaces().unwrap(), vec!["eco-static-v2"]);
    let cached = manager.match_any(&Request::get(url("/offline.html"))).unwrap();
    assert_eq!(cached.unwrap().response.body, b"offline");
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let (manager, _) = manager();
    let network = ScriptedNetwork::new()
      .respond("/", Response::new(200, "root"))
      .respond("/missing.css", Response::new(404, "nope"));

    let result = manager.install(&network, &[url("/"), url("/missing.css")]).await;

    assert!(result.is_err());
    assert!(manager.match_any(&Request::get(url("/"))).unwrap().is_none());
    assert!(manager.namespaces().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_install_fails_when_offline() {
    let (manager, _) = manager();
    let network = ScriptedNetwork::new().respond("/", Response::new(200, "root"));

    // "/app.js" is unscripted and therefore a network failure
    let result = manager.install(&network, &[url("/"), url("/app.js")]).await;

    assert!(result.is_err());
    assert!(manager.match_any(&Request::get(url("/"))).unwrap().is_none());
  }

  #[test]
  fn test_activate_keeps_only_current_generation() {
    let (manager, repo) = manager();
    for ns in [
      CacheNamespace::new("eco", NamespaceKind::Static, 1),
      CacheNamespace::new("eco", NamespaceKind::Dynamic, 1),
      CacheNamespace::new("eco", NamespaceKind::Static, 2),
      CacheNamespace::new("eco", NamespaceKind::Dynamic, 2),
      CacheNamespace {
        name: "ecotrack-v1.0.0".to_string(),
        version: 0,
      },
    ] {
      repo.open_namespace(&ns).unwrap();
    }

    let deleted = manager.activate().unwrap();

    assert_eq!(
      deleted,
      vec!["eco-static-v1", "eco-dynamic-v1", "ecotrack-v1.0.0"]
    );
    let mut names = manager.namespaces().unwrap();
    names.sort();
    assert_eq!(names, vec!["eco-dynamic-v2", "eco-static-v2"]);
  }

  #[test]
  fn test_put_dynamic_skips_error_responses() {
    let (manager, _) = manager();
    let request = Request::get(url("/api/v1/activities/"));

    manager
      .put_dynamic(&request, &Response::new(500, "boom"))
      .unwrap();
    assert!(manager.match_any(&request).unwrap().is_none());

    manager.put_dynamic(&request, &Response::new(200, "[]")).unwrap();
    assert_eq!(manager.namespaces().unwrap(), vec!["eco-dynamic-v2"]);
  }
}
