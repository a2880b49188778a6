//! Event dispatch.
//!
//! Every lifecycle event is handled on its own: the worker holds only
//! configuration and repository handles, and all state that must outlive one
//! event lives in the cache database or the durable store.

use chrono::Utc;
use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheRepository, CacheStoreManager};
use crate::config::{ClaimMode, Config};
use crate::http::Request;
use crate::net::Network;
use crate::push::{ClickRoute, ClientWindows, Notification, NotificationSink, PushRouter};
use crate::queue::{
  MutationQueueRepository, NewMutation, NotificationQueueRepository, QueuedMutation, RetryPolicy,
  SyncReport, WriteQueue,
};
use crate::router::Router;
use crate::strategy::{FetchOutcome, StrategyExecutor};

/// One-shot trigger that drains the mutation queue.
pub const TAG_ACTIVITY_SYNC: &str = "activity-sync";
/// One-shot trigger that renders queued notifications.
pub const TAG_NOTIFICATION_SYNC: &str = "notification-sync";
/// Periodic trigger that refreshes social data.
pub const TAG_DATA_SYNC: &str = "data-sync";

#[derive(Debug, Clone)]
pub enum Event {
  Install,
  Activate,
  Fetch(Request),
  /// Host captured a mutation that failed for lack of connectivity
  Enqueue(NewMutation),
  /// Host stored a push payload for later display
  QueueNotification(String),
  Sync(String),
  PeriodicSync(String),
  Push(Vec<u8>),
  NotificationClick {
    tag: String,
    action: Option<String>,
  },
}

#[derive(Debug, Clone)]
pub enum EventOutcome {
  /// Number of manifest entries cached, `None` if population failed
  Installed(Option<usize>),
  Activated {
    deleted: Vec<String>,
    claimed: bool,
  },
  Fetched(FetchOutcome),
  Queued(i64),
  Synced(SyncReport),
  NotificationsSynced(usize),
  Refreshed(bool),
  /// Trigger tag nobody handles
  Ignored,
  Notified(Option<Notification>),
  Clicked(ClickRoute),
}

/// Collaborators injected into the worker.
pub struct WorkerDeps {
  pub network: Arc<dyn Network>,
  pub cache: Arc<dyn CacheRepository>,
  pub mutations: Arc<dyn MutationQueueRepository>,
  pub notifications: Arc<dyn NotificationQueueRepository>,
  pub sink: Arc<dyn NotificationSink>,
  pub windows: Arc<dyn ClientWindows>,
}

pub struct Worker {
  router: Router,
  cache: CacheStoreManager,
  executor: StrategyExecutor,
  queue: WriteQueue,
  notifications: Arc<dyn NotificationQueueRepository>,
  push: PushRouter,
  sink: Arc<dyn NotificationSink>,
  windows: Arc<dyn ClientWindows>,
  network: Arc<dyn Network>,
  manifest: Vec<Url>,
  claim: ClaimMode,
  refresh_endpoint: String,
}

impl Worker {
  pub fn new(config: &Config, deps: WorkerDeps) -> Result<Self> {
    let origin = config.origin_url()?;
    let cache = CacheStoreManager::new(deps.cache, &config.cache);
    let executor = StrategyExecutor::new(
      cache.clone(),
      deps.network.clone(),
      config.resolve(&config.cache.offline_page)?,
    );
    let queue = WriteQueue::new(
      deps.mutations,
      deps.network.clone(),
      origin,
      RetryPolicy::from_config(&config.retry),
    );
    let manifest = config
      .cache
      .static_manifest
      .iter()
      .map(|path| config.resolve(path))
      .collect::<Result<Vec<_>>>()?;

    Ok(Self {
      router: Router::from_config(&config.routes),
      cache,
      executor,
      queue,
      notifications: deps.notifications,
      push: PushRouter::new(&config.app_name, config.scope()?),
      sink: deps.sink,
      windows: deps.windows,
      network: deps.network,
      manifest,
      claim: config.claim,
      refresh_endpoint: config.sync.refresh_endpoint.clone(),
    })
  }

  pub async fn handle(&self, event: Event) -> Result<EventOutcome> {
    match event {
      Event::Install => Ok(self.install().await),
      Event::Activate => self.activate().await,
      Event::Fetch(request) => self.fetch(&request).await.map(EventOutcome::Fetched),
      Event::Enqueue(mutation) => self
        .queue
        .enqueue(&mutation, Utc::now())
        .map(EventOutcome::Queued),
      Event::QueueNotification(payload) => self
        .notifications
        .queue_notification(&payload)
        .map(EventOutcome::Queued),
      Event::Sync(tag) => Ok(self.sync(&tag).await),
      Event::PeriodicSync(tag) => Ok(self.periodic_sync(&tag).await),
      Event::Push(bytes) => Ok(EventOutcome::Notified(self.show_push(&bytes))),
      Event::NotificationClick { tag, action } => self
        .click(&tag, action.as_deref())
        .await
        .map(EventOutcome::Clicked),
    }
  }

  /// Stored mutations, oldest first.
  pub fn queued(&self) -> Result<Vec<QueuedMutation>> {
    self.queue.list()
  }

  async fn install(&self) -> EventOutcome {
    info!("Installing");
    match self.cache.install(self.network.as_ref(), &self.manifest).await {
      Ok(count) => EventOutcome::Installed(Some(count)),
      Err(e) => {
        // Activation still proceeds without a populated static namespace
        error!("Failed to cache static files: {}", e);
        EventOutcome::Installed(None)
      }
    }
  }

  async fn activate(&self) -> Result<EventOutcome> {
    info!("Activating");
    let deleted = self.cache.activate()?;

    let claimed = match self.claim {
      ClaimMode::Immediate => {
        self.windows.claim().await?;
        info!("Claimed all open clients");
        true
      }
      ClaimMode::Staged => false,
    };

    Ok(EventOutcome::Activated { deleted, claimed })
  }

  async fn fetch(&self, request: &Request) -> Result<FetchOutcome> {
    let class = self.router.classify(request);
    debug!(method = %request.method, url = %request.url, ?class, "Intercepted request");
    self.executor.execute(class, request).await
  }

  async fn sync(&self, tag: &str) -> EventOutcome {
    info!(tag, "Background sync");
    match tag {
      TAG_ACTIVITY_SYNC => match self.queue.reconcile(Utc::now()).await {
        Ok(report) => {
          info!(?report, "Activity sync finished");
          EventOutcome::Synced(report)
        }
        Err(e) => {
          error!("Background sync failed: {}", e);
          EventOutcome::Synced(SyncReport::default())
        }
      },
      TAG_NOTIFICATION_SYNC => EventOutcome::NotificationsSynced(self.sync_notifications()),
      _ => {
        warn!(tag, "Unknown sync tag");
        EventOutcome::Ignored
      }
    }
  }

  /// Show every queued notification and drop it from the store.
  fn sync_notifications(&self) -> usize {
    let queued = match self.notifications.notifications() {
      Ok(queued) => queued,
      Err(e) => {
        error!("Notification sync failed: {}", e);
        return 0;
      }
    };

    let mut shown = 0;
    for item in queued {
      if let Some(notification) = self.push.render(item.payload.as_bytes()) {
        if let Err(e) = self.sink.show(&notification) {
          warn!(id = item.id, "Failed to show queued notification: {}", e);
          continue;
        }
        shown += 1;
      }
      if let Err(e) = self.notifications.remove_notification(item.id) {
        warn!(id = item.id, "Failed to remove queued notification: {}", e);
      }
    }
    shown
  }

  async fn periodic_sync(&self, tag: &str) -> EventOutcome {
    match tag {
      TAG_DATA_SYNC => {
        info!("Performing periodic sync");
        EventOutcome::Refreshed(self.queue.refresh(&self.refresh_endpoint).await)
      }
      _ => {
        warn!(tag, "Unknown periodic sync tag");
        EventOutcome::Ignored
      }
    }
  }

  fn show_push(&self, bytes: &[u8]) -> Option<Notification> {
    info!("Push message received");
    let notification = self.push.render(bytes)?;
    if let Err(e) = self.sink.show(&notification) {
      warn!("Failed to show notification: {}", e);
      return None;
    }
    Some(notification)
  }

  async fn click(&self, tag: &str, action: Option<&str>) -> Result<ClickRoute> {
    info!(tag, action = action.unwrap_or(""), "Notification click");
    if let Err(e) = self.sink.close(tag) {
      warn!(tag, "Failed to close notification: {}", e);
    }

    let clients = self.windows.match_all().await?;
    let route = self.push.route_click(action, &clients);

    match &route {
      ClickRoute::Focus(id) => self.windows.focus(id).await?,
      ClickRoute::OpenWindow(url) => self.windows.open_window(url).await?,
      ClickRoute::Nothing => {}
    }

    Ok(route)
  }
}
