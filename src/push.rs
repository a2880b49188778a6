//! Push payload rendering and notification click routing.

use async_trait::async_trait;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

const ICON: &str = "/icons/icon-192x192.png";
const BADGE: &str = "/icons/badge-72x72.png";
const VIBRATE: [u32; 3] = [200, 100, 200];

pub const ACTION_OPEN: &str = "open";
pub const ACTION_DISMISS: &str = "dismiss";

/// The fields a push payload may carry. Anything else is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  pub tag: Option<String>,
  pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  pub icon: String,
}

/// A notification ready to display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub actions: Vec<NotificationAction>,
  pub data: Value,
  /// Notifications sharing a tag replace each other
  pub tag: String,
}

/// Displays and closes notifications on the host.
pub trait NotificationSink: Send + Sync {
  fn show(&self, notification: &Notification) -> Result<()>;
  fn close(&self, tag: &str) -> Result<()>;
}

/// An open window-scoped client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowClient {
  pub id: String,
  pub url: String,
}

/// The host's open windows.
#[async_trait]
pub trait ClientWindows: Send + Sync {
  async fn match_all(&self) -> Result<Vec<WindowClient>>;
  async fn focus(&self, id: &str) -> Result<()>;
  async fn open_window(&self, url: &Url) -> Result<()>;
  /// Take control of every open client.
  async fn claim(&self) -> Result<()>;
}

/// What a notification click should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickRoute {
  Focus(String),
  OpenWindow(Url),
  /// Dismissed, or an action with no handler
  Nothing,
}

#[derive(Debug, Clone)]
pub struct PushRouter {
  app_name: String,
  scope: Url,
}

impl PushRouter {
  /// `scope` is the registered scope; new windows open at its root.
  pub fn new(app_name: &str, scope: Url) -> Self {
    Self {
      app_name: app_name.to_string(),
      scope,
    }
  }

  /// Render a push payload. Empty or malformed payloads yield nothing.
  pub fn render(&self, bytes: &[u8]) -> Option<Notification> {
    if bytes.is_empty() {
      debug!("Push without payload, ignoring");
      return None;
    }

    let payload: NotificationPayload = match std::str::from_utf8(bytes)
      .ok()
      .and_then(|text| serde_json::from_str(text).ok())
    {
      Some(payload) => payload,
      None => {
        debug!("Malformed push payload, ignoring");
        return None;
      }
    };

    Some(Notification {
      title: non_empty(payload.title).unwrap_or_else(|| self.app_name.clone()),
      body: non_empty(payload.body)
        .unwrap_or_else(|| format!("New notification from {}", self.app_name)),
      icon: ICON.to_string(),
      badge: BADGE.to_string(),
      vibrate: VIBRATE.to_vec(),
      actions: vec![
        NotificationAction {
          action: ACTION_OPEN.to_string(),
          title: "Open App".to_string(),
          icon: "/icons/open.png".to_string(),
        },
        NotificationAction {
          action: ACTION_DISMISS.to_string(),
          title: "Dismiss".to_string(),
          icon: "/icons/dismiss.png".to_string(),
        },
      ],
      data: payload
        .data
        .unwrap_or_else(|| Value::Object(Default::default())),
      tag: non_empty(payload.tag)
        .unwrap_or_else(|| format!("{}-notification", self.app_name.to_lowercase())),
    })
  }

  /// Decide what a click does given the currently open windows.
  pub fn route_click(&self, action: Option<&str>, clients: &[WindowClient]) -> ClickRoute {
    match action {
      None | Some("") | Some(ACTION_OPEN) => {}
      Some(_) => return ClickRoute::Nothing,
    }

    if let Some(client) = clients.iter().find(|c| c.url == self.scope.as_str()) {
      return ClickRoute::Focus(client.id.clone());
    }

    let mut root = self.scope.clone();
    root.set_path("/");
    root.set_query(None);
    ClickRoute::OpenWindow(root)
  }
}

/// Empty strings count as missing.
fn non_empty(field: Option<String>) -> Option<String> {
  field.filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn router() -> PushRouter {
    PushRouter::new("EcoTrack", Url::parse("http://localhost:8000/").unwrap())
  }

  fn client(id: &str, url: &str) -> WindowClient {
    WindowClient {
      id: id.to_string(),
      url: url.to_string(),
    }
  }

  #[test]
  fn test_render_title_and_body() {
    let n = router().render(br#"{"title":"T","body":"B"}"#).unwrap();
    assert_eq!(n.title, "T");
    assert_eq!(n.body, "B");
    let actions: Vec<&str> = n.actions.iter().map(|a| a.action.as_str()).collect();
    assert_eq!(actions, vec![ACTION_OPEN, ACTION_DISMISS]);
  }

  #[test]
  fn test_render_defaults() {
    let n = router().render(b"{}").unwrap();
    assert_eq!(n.title, "EcoTrack");
    assert_eq!(n.body, "New notification from EcoTrack");
    assert_eq!(n.tag, "ecotrack-notification");
    assert_eq!(n.icon, ICON);
    assert_eq!(n.vibrate, vec![200, 100, 200]);
    assert_eq!(n.data, serde_json::json!({}));
  }

  #[test]
  fn test_render_empty_strings_get_defaults() {
    let n = router()
      .render(br#"{"title":"","body":"","tag":""}"#)
      .unwrap();
    assert_eq!(n.title, "EcoTrack");
    assert_eq!(n.body, "New notification from EcoTrack");
    assert_eq!(n.tag, "ecotrack-notification");
  }

  #[test]
  fn test_render_keeps_tag_and_data() {
    let n = router()
      .render(br#"{"tag":"goal-42","data":{"goal":42},"actions":[{"action":"x"}]}"#)
      .unwrap();
    assert_eq!(n.tag, "goal-42");
    assert_eq!(n.data["goal"], 42);
    assert_eq!(n.actions.len(), 2);
  }

  #[test]
  fn test_render_rejects_bad_payloads() {
    let router = router();
    assert!(router.render(b"").is_none());
    assert!(router.render(b"not json").is_none());
    assert!(router.render(b"[1,2]").is_none());
    assert!(router.render(&[0xff, 0xfe]).is_none());
  }

  #[test]
  fn test_click_focuses_scope_client() {
    let clients = vec![
      client("a", "http://localhost:8000/settings"),
      client("b", "http://localhost:8000/"),
    ];
    assert_eq!(
      router().route_click(Some(ACTION_OPEN), &clients),
      ClickRoute::Focus("b".to_string())
    );
    assert_eq!(
      router().route_click(None, &clients),
      ClickRoute::Focus("b".to_string())
    );
  }

  #[test]
  fn test_click_opens_root_without_scope_client() {
    let clients = vec![client("a", "http://localhost:8000/settings")];
    assert_eq!(
      router().route_click(Some(ACTION_OPEN), &clients),
      ClickRoute::OpenWindow(Url::parse("http://localhost:8000/").unwrap())
    );
  }

  #[test]
  fn test_dismiss_does_nothing() {
    let clients = vec![client("b", "http://localhost:8000/")];
    assert_eq!(
      router().route_click(Some(ACTION_DISMISS), &clients),
      ClickRoute::Nothing
    );
  }
}
