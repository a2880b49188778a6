//! Cache strategies, one per request class.
//!
//! Each strategy makes at most one network attempt. Cache reads and writes
//! are best-effort: a failing cache is logged and treated as a miss.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::cache::{CacheStoreManager, ResponseSource};
use crate::http::{Destination, Request, Response};
use crate::net::Network;
use crate::router::RequestClass;

/// Result of intercepting one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
  /// Serve this response to the host
  Respond {
    response: Response,
    source: ResponseSource,
  },
  /// Not handled; the host performs the request itself
  Passthrough,
}

impl FetchOutcome {
  fn respond(response: Response, source: ResponseSource) -> Self {
    Self::Respond { response, source }
  }
}

/// Executes the strategy assigned to a request class.
#[derive(Clone)]
pub struct StrategyExecutor {
  cache: CacheStoreManager,
  network: Arc<dyn Network>,
  /// Absolute URL of the offline fallback document
  offline_page: Url,
}

impl StrategyExecutor {
  pub fn new(cache: CacheStoreManager, network: Arc<dyn Network>, offline_page: Url) -> Self {
    Self {
      cache,
      network,
      offline_page,
    }
  }

  pub async fn execute(&self, class: RequestClass, request: &Request) -> Result<FetchOutcome> {
    match class {
      RequestClass::ApiCacheable => Ok(self.network_first(request, true).await),
      RequestClass::ApiUncached => Ok(self.network_first(request, false).await),
      RequestClass::Navigation => self.navigation(request).await,
      RequestClass::StaticAsset => self.cache_first(request).await,
      RequestClass::ApiMutating | RequestClass::Ignored => Ok(FetchOutcome::Passthrough),
    }
  }

  /// Network first; on failure serve the cached copy or a 503 JSON body.
  async fn network_first(&self, request: &Request, write_through: bool) -> FetchOutcome {
    match self.network.fetch(request).await {
      Ok(response) => {
        if write_through {
          self.cache.store_best_effort(request, &response);
        }
        FetchOutcome::respond(response, ResponseSource::Network)
      }
      Err(e) => {
        debug!(url = %request.url, "Network failed, trying cache: {}", e);
        match self.cache.lookup_best_effort(request) {
          Some(cached) => FetchOutcome::respond(cached.response, ResponseSource::Offline),
          None => FetchOutcome::respond(Response::offline_json(), ResponseSource::Synthesized),
        }
      }
    }
  }

  /// Network first; on failure serve the cached page or the offline document.
  async fn navigation(&self, request: &Request) -> Result<FetchOutcome> {
    let error = match self.network.fetch(request).await {
      Ok(response) => return Ok(FetchOutcome::respond(response, ResponseSource::Network)),
      Err(e) => e,
    };

    debug!(url = %request.url, "Navigation failed, trying cache: {}", error);
    if let Some(cached) = self.cache.lookup_best_effort(request) {
      return Ok(FetchOutcome::respond(cached.response, ResponseSource::Offline));
    }

    let fallback = Request::get(self.offline_page.clone()).navigation();
    match self.cache.lookup_best_effort(&fallback) {
      Some(cached) => Ok(FetchOutcome::respond(cached.response, ResponseSource::Offline)),
      None => Err(eyre!(
        "Navigation to {} failed and no offline page is cached: {}",
        request.url,
        error
      )),
    }
  }

  /// Cache first. A hit never touches the network.
  async fn cache_first(&self, request: &Request) -> Result<FetchOutcome> {
    if let Some(cached) = self.cache.lookup_best_effort(request) {
      return Ok(FetchOutcome::respond(cached.response, ResponseSource::Cache));
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        self.cache.store_best_effort(request, &response);
        Ok(FetchOutcome::respond(response, ResponseSource::Network))
      }
      Err(_) if request.destination == Destination::Image => Ok(FetchOutcome::respond(
        Response::image_placeholder(),
        ResponseSource::Synthesized,
      )),
      Err(e) => Err(e),
    }
  }
}
