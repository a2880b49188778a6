//! Fakes shared by the unit tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

use crate::cache::{CacheNamespace, CacheRepository, CacheWrite, CachedResponse};
use crate::http::{CacheKey, Request, Response};
use crate::net::Network;
use crate::push::{ClientWindows, Notification, NotificationSink, WindowClient};

/// Network fake answering from a path table.
///
/// Unscripted paths, bodies marked as failing, and everything after
/// `go_offline` fail like a lost connection. Every attempt is recorded.
#[derive(Default)]
pub struct ScriptedNetwork {
  responses: HashMap<String, Response>,
  failing_bodies: Vec<String>,
  body_delays: Vec<(String, Duration)>,
  offline: AtomicBool,
  calls: Mutex<Vec<Request>>,
}

impl ScriptedNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  /// Answer requests for `path` (path plus optional query) with `response`.
  pub fn respond(mut self, path: &str, response: Response) -> Self {
    self.responses.insert(path.to_string(), response);
    self
  }

  /// Fail requests whose body contains `marker`.
  pub fn fail_body(mut self, marker: &str) -> Self {
    self.failing_bodies.push(marker.to_string());
    self
  }

  /// Delay requests whose body contains `marker`.
  pub fn delay_body(mut self, marker: &str, delay: Duration) -> Self {
    self.body_delays.push((marker.to_string(), delay));
    self
  }

  pub fn go_offline(&self) {
    self.offline.store(true, Ordering::SeqCst);
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn calls(&self) -> Vec<Request> {
    self.calls.lock().unwrap().clone()
  }

  fn path_of(url: &Url) -> String {
    match url.query() {
      Some(query) => format!("{}?{}", url.path(), query),
      None => url.path().to_string(),
    }
  }
}

#[async_trait]
impl Network for ScriptedNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    self.calls.lock().unwrap().push(request.clone());

    let body = request
      .body
      .as_deref()
      .map(String::from_utf8_lossy)
      .unwrap_or_default();

    for (marker, delay) in &self.body_delays {
      if body.contains(marker.as_str()) {
        tokio::time::sleep(*delay).await;
      }
    }

    if self.offline.load(Ordering::SeqCst)
      || self.failing_bodies.iter().any(|m| body.contains(m.as_str()))
    {
      return Err(eyre!("connection refused: {}", request.url));
    }

    self
      .responses
      .get(&Self::path_of(&request.url))
      .cloned()
      .ok_or_else(|| eyre!("connection refused: {}", request.url))
  }
}

/// Cache repository whose every call fails, like a corrupt or locked database.
pub struct FailingCacheRepository;

impl FailingCacheRepository {
  fn fail<T>() -> Result<T> {
    Err(eyre!("database disk image is malformed"))
  }
}

impl CacheRepository for FailingCacheRepository {
  fn namespaces(&self) -> Result<Vec<String>> {
    Self::fail()
  }

  fn open_namespace(&self, _namespace: &CacheNamespace) -> Result<()> {
    Self::fail()
  }

  fn delete_namespace(&self, _name: &str) -> Result<bool> {
    Self::fail()
  }

  fn get(&self, _namespace: &str, _key: &CacheKey) -> Result<Option<CachedResponse>> {
    Self::fail()
  }

  fn match_any(&self, _key: &CacheKey) -> Result<Option<CachedResponse>> {
    Self::fail()
  }

  fn put(&self, _namespace: &CacheNamespace, _write: &CacheWrite) -> Result<()> {
    Self::fail()
  }

  fn put_all(&self, _namespace: &CacheNamespace, _writes: &[CacheWrite]) -> Result<()> {
    Self::fail()
  }
}

/// Records shown and closed notifications.
#[derive(Default)]
pub struct RecordingSink {
  pub shown: Mutex<Vec<Notification>>,
  pub closed: Mutex<Vec<String>>,
}

impl NotificationSink for RecordingSink {
  fn show(&self, notification: &Notification) -> Result<()> {
    self.shown.lock().unwrap().push(notification.clone());
    Ok(())
  }

  fn close(&self, tag: &str) -> Result<()> {
    self.closed.lock().unwrap().push(tag.to_string());
    Ok(())
  }
}

/// A fixed set of open windows that records what was done to them.
#[derive(Default)]
pub struct RecordingWindows {
  pub clients: Vec<WindowClient>,
  pub focused: Mutex<Vec<String>>,
  pub opened: Mutex<Vec<Url>>,
  pub claimed: AtomicBool,
}

impl RecordingWindows {
  pub fn with_client(mut self, id: &str, url: &str) -> Self {
    self.clients.push(WindowClient {
      id: id.to_string(),
      url: url.to_string(),
    });
    self
  }
}

#[async_trait]
impl ClientWindows for RecordingWindows {
  async fn match_all(&self) -> Result<Vec<WindowClient>> {
    Ok(self.clients.clone())
  }

  async fn focus(&self, id: &str) -> Result<()> {
    self.focused.lock().unwrap().push(id.to_string());
    Ok(())
  }

  async fn open_window(&self, url: &Url) -> Result<()> {
    self.opened.lock().unwrap().push(url.clone());
    Ok(())
  }

  async fn claim(&self) -> Result<()> {
    self.claimed.store(true, Ordering::SeqCst);
    Ok(())
  }
}
