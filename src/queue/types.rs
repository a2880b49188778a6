use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Report, Result};
use serde::Serialize;
use std::str::FromStr;

/// Lifecycle of a queued mutation. A mutation that replays successfully is
/// deleted, so there is no synced state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
  /// Waiting for the next reconciliation pass
  Pending,
  /// Exceeded the configured attempt ceiling; skipped by every later pass
  Abandoned,
}

impl MutationStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Abandoned => "abandoned",
    }
  }
}

impl FromStr for MutationStatus {
  type Err = Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "pending" => Ok(Self::Pending),
      "abandoned" => Ok(Self::Abandoned),
      other => Err(eyre!("Unknown mutation status '{}'", other)),
    }
  }
}

/// A mutation as captured by the host when its request failed.
#[derive(Debug, Clone)]
pub struct NewMutation {
  /// Replay target, relative to the origin or absolute
  pub endpoint: String,
  /// Serialized JSON request body
  pub payload: String,
  /// Bearer token in effect when the mutation was captured
  pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedMutation {
  pub id: i64,
  pub endpoint: String,
  pub payload: String,
  #[serde(skip)]
  pub credential: Option<String>,
  pub enqueued_at: DateTime<Utc>,
  pub attempts: u32,
  pub status: MutationStatus,
  pub next_attempt_at: Option<DateTime<Utc>>,
}

impl QueuedMutation {
  /// Whether a pass running at `now` should replay this mutation.
  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.status == MutationStatus::Pending && self.next_attempt_at.map_or(true, |at| at <= now)
  }
}

#[derive(Debug, Clone)]
pub struct QueuedNotification {
  pub id: i64,
  /// Raw push payload, rendered when the notification sync runs
  pub payload: String,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  pub attempted: usize,
  pub synced: usize,
  pub failed: usize,
  pub abandoned: usize,
  /// Pending but not yet due because of backoff
  pub deferred: usize,
}
