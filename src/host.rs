//! Host-side adapters used by the command line: notifications are printed
//! and the open windows are whatever the caller passed in.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use tracing::info;
use url::Url;

use crate::push::{ClientWindows, Notification, NotificationSink, WindowClient};

/// Prints notifications to stdout as JSON lines.
pub struct StdoutSink;

impl NotificationSink for StdoutSink {
  fn show(&self, notification: &Notification) -> Result<()> {
    let json = serde_json::to_string(notification)
      .map_err(|e| eyre!("Failed to serialize notification: {}", e))?;
    println!("{}", json);
    Ok(())
  }

  fn close(&self, tag: &str) -> Result<()> {
    info!(tag, "Closed notification");
    Ok(())
  }
}

/// Windows named on the command line, `client-0`, `client-1`, ...
pub struct ListedWindows {
  clients: Vec<WindowClient>,
}

impl ListedWindows {
  pub fn new(urls: &[String]) -> Self {
    let clients = urls
      .iter()
      .enumerate()
      .map(|(i, url)| WindowClient {
        id: format!("client-{}", i),
        url: url.clone(),
      })
      .collect();

    Self { clients }
  }
}

#[async_trait]
impl ClientWindows for ListedWindows {
  async fn match_all(&self) -> Result<Vec<WindowClient>> {
    Ok(self.clients.clone())
  }

  async fn focus(&self, id: &str) -> Result<()> {
    let client = self
      .clients
      .iter()
      .find(|c| c.id == id)
      .ok_or_else(|| eyre!("No open client {}", id))?;
    println!("focus {} {}", client.id, client.url);
    Ok(())
  }

  async fn open_window(&self, url: &Url) -> Result<()> {
    println!("open {}", url);
    Ok(())
  }

  async fn claim(&self) -> Result<()> {
    info!(clients = self.clients.len(), "Claiming open clients");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_listed_windows_ids() {
    let windows = ListedWindows::new(&[
      "http://localhost:8000/".to_string(),
      "http://localhost:8000/goals".to_string(),
    ]);

    let clients = windows.match_all().await.unwrap();
    assert_eq!(clients[1].id, "client-1");
    assert!(windows.focus("client-0").await.is_ok());
    assert!(windows.focus("client-9").await.is_err());
  }
}
