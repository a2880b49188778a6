//! Replays queued mutations against the network.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use super::storage::MutationQueueRepository;
use super::types::{MutationStatus, NewMutation, QueuedMutation, SyncReport};
use crate::config::{RetryConfig, MAX_BACKOFF_SECS};
use crate::http::Request;
use crate::net::Network;

/// Cap used when backoff is enabled without an explicit maximum.
const DEFAULT_BACKOFF_MAX_SECS: u64 = 24 * 60 * 60;

/// When a failed mutation may be replayed again, and when it is given up.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
  max_attempts: Option<u32>,
  backoff_base_secs: Option<u64>,
  backoff_max_secs: Option<u64>,
}

impl RetryPolicy {
  pub fn from_config(config: &RetryConfig) -> Self {
    Self {
      max_attempts: config.max_attempts,
      backoff_base_secs: config.backoff_base_secs,
      backoff_max_secs: config.backoff_max_secs,
    }
  }

  /// Status after the `attempts`-th failed replay.
  fn status_after(&self, attempts: u32) -> MutationStatus {
    match self.max_attempts {
      Some(max) if attempts >= max => MutationStatus::Abandoned,
      _ => MutationStatus::Pending,
    }
  }

  /// Earliest next replay after the `attempts`-th failure: `base * 2^(attempts-1)`.
  fn next_attempt_at(&self, attempts: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let base = self.backoff_base_secs?;
    let max = self.backoff_max_secs.unwrap_or(DEFAULT_BACKOFF_MAX_SECS);

    let factor = 2u64.saturating_pow(attempts.saturating_sub(1));
    let delay = base.saturating_mul(factor).min(max).min(MAX_BACKOFF_SECS);

    now.checked_add_signed(Duration::seconds(i64::try_from(delay).ok()?))
  }
}

/// The offline write queue: capture on failure, replay on trigger.
#[derive(Clone)]
pub struct WriteQueue {
  store: Arc<dyn MutationQueueRepository>,
  network: Arc<dyn Network>,
  origin: Url,
  policy: RetryPolicy,
}

impl WriteQueue {
  pub fn new(
    store: Arc<dyn MutationQueueRepository>,
    network: Arc<dyn Network>,
    origin: Url,
    policy: RetryPolicy,
  ) -> Self {
    Self {
      store,
      network,
      origin,
      policy,
    }
  }

  /// Append a mutation whose request failed for lack of connectivity.
  pub fn enqueue(&self, mutation: &NewMutation, now: DateTime<Utc>) -> Result<i64> {
    serde_json::from_str::<serde_json::Value>(&mutation.payload)
      .map_err(|e| eyre!("Mutation payload is not valid JSON: {}", e))?;
    self.resolve(&mutation.endpoint)?;

    let id = self.store.enqueue(mutation, now)?;
    info!(id, endpoint = %mutation.endpoint, "Queued mutation for replay");
    Ok(id)
  }

  /// Every stored mutation, oldest first.
  pub fn list(&self) -> Result<Vec<QueuedMutation>> {
    self.store.all()
  }

  /// Replay every due mutation in enqueue order.
  ///
  /// Each mutation gets exactly one attempt. A failure is recorded on that
  /// mutation and the pass moves on; only a failure to read the queue itself
  /// is returned as an error.
  pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<SyncReport> {
    let mut report = SyncReport::default();

    for mutation in self.store.pending()? {
      if !mutation.is_due(now) {
        report.deferred += 1;
        continue;
      }
      report.attempted += 1;

      match self.replay(&mutation).await {
        Ok(()) => {
          report.synced += 1;
          if let Err(e) = self.store.remove(mutation.id) {
            // The server has it; it will be replayed once more next pass
            warn!(id = mutation.id, "Failed to remove synced mutation: {}", e);
          } else {
            info!(id = mutation.id, "Synced offline mutation");
          }
        }
        Err(e) => {
          let attempts = mutation.attempts + 1;
          let status = self.policy.status_after(attempts);
          let next_attempt_at = self.policy.next_attempt_at(attempts, now);

          warn!(id = mutation.id, attempts, "Failed to sync mutation: {}", e);
          if let Err(e) = self
            .store
            .record_failure(mutation.id, next_attempt_at, status)
          {
            warn!(id = mutation.id, "Failed to record replay failure: {}", e);
          }

          match status {
            MutationStatus::Abandoned => {
              warn!(id = mutation.id, attempts, "Abandoning mutation");
              report.abandoned += 1;
            }
            MutationStatus::Pending => report.failed += 1,
          }
        }
      }
    }

    Ok(report)
  }

  async fn replay(&self, mutation: &QueuedMutation) -> Result<()> {
    let mut request = Request::new("POST", self.resolve(&mutation.endpoint)?)
      .with_header("Content-Type", "application/json")
      .with_body(mutation.payload.clone().into_bytes());
    if let Some(token) = &mutation.credential {
      request = request.with_header("Authorization", &format!("Bearer {}", token));
    }

    let response = self.network.fetch(&request).await?;
    if !response.is_success() {
      return Err(eyre!("Server returned status {}", response.status));
    }
    Ok(())
  }

  /// Fire one refresh call for the periodic trigger. Failures are logged and
  /// swallowed. Returns whether the call succeeded.
  pub async fn refresh(&self, endpoint: &str) -> bool {
    let url = match self.resolve(endpoint) {
      Ok(url) => url,
      Err(e) => {
        warn!("Periodic sync failed: {}", e);
        return false;
      }
    };

    match self.network.fetch(&Request::new("POST", url)).await {
      Ok(response) if response.is_success() => {
        info!(endpoint, "Periodic sync completed");
        true
      }
      Ok(response) => {
        warn!(endpoint, status = response.status, "Periodic sync rejected");
        false
      }
      Err(e) => {
        warn!(endpoint, "Periodic sync failed: {}", e);
        false
      }
    }
  }

  fn resolve(&self, endpoint: &str) -> Result<Url> {
    self
      .origin
      .join(endpoint)
      .map_err(|e| eyre!("Invalid endpoint '{}': {}", endpoint, e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Response;
  use crate::queue::SqliteDurableStore;
  use crate::testing::ScriptedNetwork;

  const ENDPOINT: &str = "/api/v1/activities/";

  fn queue(network: Arc<ScriptedNetwork>, policy: RetryPolicy) -> WriteQueue {
    let store = Arc::new(SqliteDurableStore::open_in_memory().unwrap());
    WriteQueue::new(
      store,
      network,
      Url::parse("http://localhost").unwrap(),
      policy,
    )
  }

  fn mutation(marker: &str) -> NewMutation {
    NewMutation {
      endpoint: ENDPOINT.to_string(),
      payload: format!(r#"{{"marker":"{}"}}"#, marker),
      credential: Some("secret".to_string()),
    }
  }

  fn marker_of(payload: &[u8]) -> String {
    let v: serde_json::Value = serde_json::from_slice(payload).unwrap();
    v["marker"].as_str().unwrap().to_string()
  }

  fn markers(mutations: &[QueuedMutation]) -> Vec<String> {
    mutations
      .iter()
      .map(|m| marker_of(m.payload.as_bytes()))
      .collect()
  }

  #[tokio::test]
  async fn test_replays_in_enqueue_order_regardless_of_latency() {
    let network = Arc::new(
      ScriptedNetwork::new()
        .respond(ENDPOINT, Response::new(201, "{}"))
        .delay_body("m1", std::time::Duration::from_millis(40))
        .delay_body("m2", std::time::Duration::from_millis(20)),
    );
    let queue = queue(network.clone(), RetryPolicy::default());
    let t1 = Utc::now();

    // Enqueued out of timestamp order on purpose
    queue.enqueue(&mutation("m3"), t1 + Duration::seconds(2)).unwrap();
    queue.enqueue(&mutation("m1"), t1).unwrap();
    queue.enqueue(&mutation("m2"), t1 + Duration::seconds(1)).unwrap();

    let report = queue.reconcile(Utc::now()).await.unwrap();

    assert_eq!(report.synced, 3);
    let replayed: Vec<String> = network
      .calls()
      .iter()
      .map(|call| marker_of(call.body.as_deref().unwrap()))
      .collect();
    assert_eq!(replayed, vec!["m1", "m2", "m3"]);
    assert!(queue.list().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_partial_failure_keeps_only_failed() {
    let network = Arc::new(
      ScriptedNetwork::new()
        .respond(ENDPOINT, Response::new(201, "{}"))
        .fail_body("m2"),
    );
    let queue = queue(network.clone(), RetryPolicy::default());
    let t1 = Utc::now();
    for (i, marker) in ["m1", "m2", "m3"].iter().enumerate() {
      queue
        .enqueue(&mutation(marker), t1 + Duration::seconds(i as i64))
        .unwrap();
    }

    let report = queue.reconcile(Utc::now()).await.unwrap();

    assert_eq!(
      report,
      SyncReport {
        attempted: 3,
        synced: 2,
        failed: 1,
        ..SyncReport::default()
      }
    );
    let left = queue.list().unwrap();
    assert_eq!(markers(&left), vec!["m2"]);
    assert_eq!(left[0].attempts, 1);
    assert_eq!(left[0].status, MutationStatus::Pending);
  }

  #[tokio::test]
  async fn test_error_status_counts_as_failure() {
    let network =
      Arc::new(ScriptedNetwork::new().respond(ENDPOINT, Response::new(400, "bad request")));
    let queue = queue(network, RetryPolicy::default());
    queue.enqueue(&mutation("m1"), Utc::now()).unwrap();

    let report = queue.reconcile(Utc::now()).await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(queue.list().unwrap()[0].attempts, 1);
  }

  #[tokio::test]
  async fn test_unbounded_retry_by_default() {
    let network = Arc::new(ScriptedNetwork::new());
    network.go_offline();
    let queue = queue(network, RetryPolicy::default());
    queue.enqueue(&mutation("m1"), Utc::now()).unwrap();

    for _ in 0..10 {
      queue.reconcile(Utc::now()).await.unwrap();
    }

    let left = queue.list().unwrap();
    assert_eq!(left[0].attempts, 10);
    assert_eq!(left[0].status, MutationStatus::Pending);
  }

  #[tokio::test]
  async fn test_replay_carries_credential_and_payload() {
    let network = Arc::new(ScriptedNetwork::new().respond(ENDPOINT, Response::new(201, "{}")));
    let queue = queue(network.clone(), RetryPolicy::default());
    queue.enqueue(&mutation("m1"), Utc::now()).unwrap();

    queue.reconcile(Utc::now()).await.unwrap();

    let calls = network.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].method, "POST");
    assert_eq!(calls[0].url.as_str(), "http://localhost/api/v1/activities/");
    assert_eq!(calls[0].header("authorization"), Some("Bearer secret"));
    assert_eq!(calls[0].header("content-type"), Some("application/json"));
    assert_eq!(
      calls[0].body.as_deref(),
      Some(br#"{"marker":"m1"}"#.as_slice())
    );
  }

  #[tokio::test]
  async fn test_capped_attempts_abandon() {
    let network = Arc::new(ScriptedNetwork::new());
    network.go_offline();
    let policy = RetryPolicy::from_config(&RetryConfig {
      max_attempts: Some(2),
      ..RetryConfig::default()
    });
    let queue = queue(network.clone(), policy);
    queue.enqueue(&mutation("m1"), Utc::now()).unwrap();

    let first = queue.reconcile(Utc::now()).await.unwrap();
    let second = queue.reconcile(Utc::now()).await.unwrap();
    let third = queue.reconcile(Utc::now()).await.unwrap();

    assert_eq!(first.failed, 1);
    assert_eq!(second.abandoned, 1);
    assert_eq!(third.attempted, 0);
    assert_eq!(network.call_count(), 2);
    assert_eq!(queue.list().unwrap()[0].status, MutationStatus::Abandoned);
  }

  #[tokio::test]
  async fn test_backoff_defers_until_due() {
    let network = Arc::new(ScriptedNetwork::new());
    network.go_offline();
    let policy = RetryPolicy::from_config(&RetryConfig {
      backoff_base_secs: Some(60),
      ..RetryConfig::default()
    });
    let queue = queue(network.clone(), policy);
    let now = Utc::now();
    queue.enqueue(&mutation("m1"), now).unwrap();

    queue.reconcile(now).await.unwrap();
    let early = queue.reconcile(now + Duration::seconds(30)).await.unwrap();
    let late = queue.reconcile(now + Duration::seconds(61)).await.unwrap();

    assert_eq!(early.deferred, 1);
    assert_eq!(early.attempted, 0);
    assert_eq!(late.attempted, 1);
    assert_eq!(network.call_count(), 2);
  }

  #[test]
  fn test_backoff_doubles_and_caps() {
    let policy = RetryPolicy::from_config(&RetryConfig {
      backoff_base_secs: Some(10),
      backoff_max_secs: Some(100),
      ..RetryConfig::default()
    });
    let now = Utc::now();

    assert_eq!(policy.next_attempt_at(1, now), Some(now + Duration::seconds(10)));
    assert_eq!(policy.next_attempt_at(3, now), Some(now + Duration::seconds(40)));
    assert_eq!(policy.next_attempt_at(10, now), Some(now + Duration::seconds(100)));
    assert_eq!(RetryPolicy::default().next_attempt_at(3, now), None);
  }

  #[test]
  fn test_backoff_never_exceeds_ceiling() {
    let policy = RetryPolicy::from_config(&RetryConfig {
      backoff_base_secs: Some(1),
      backoff_max_secs: Some(10_000_000_000_000),
      ..RetryConfig::default()
    });
    let now = Utc::now();
    let ceiling = Duration::seconds(MAX_BACKOFF_SECS as i64);

    assert_eq!(policy.next_attempt_at(60, now), Some(now + ceiling));
    assert_eq!(policy.next_attempt_at(u32::MAX, now), Some(now + ceiling));
  }

  #[test]
  fn test_enqueue_rejects_invalid_json() {
    let queue = queue(Arc::new(ScriptedNetwork::new()), RetryPolicy::default());
    let bad = NewMutation {
      payload: "not json".to_string(),
      ..mutation("x")
    };
    assert!(queue.enqueue(&bad, Utc::now()).is_err());
    assert!(queue.list().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_refresh_swallows_failures() {
    let network = Arc::new(ScriptedNetwork::new());
    network.go_offline();
    let queue = queue(network.clone(), RetryPolicy::default());

    assert!(!queue.refresh("/api/v1/social/refresh/").await);
    assert_eq!(network.call_count(), 1);
  }

  #[tokio::test]
  async fn test_refresh_posts_once() {
    let network = Arc::new(
      ScriptedNetwork::new().respond("/api/v1/social/refresh/", Response::new(200, "{}")),
    );
    let queue = queue(network.clone(), RetryPolicy::default());

    assert!(queue.refresh("/api/v1/social/refresh/").await);
    let calls = network.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].method, "POST");
  }
}
