mod cache;
mod config;
mod host;
mod http;
mod net;
mod push;
mod queue;
mod router;
mod strategy;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cache::SqliteCacheStorage;
use crate::http::{Destination, Request, Response};
use crate::net::{HttpNetwork, Network};
use crate::queue::{NewMutation, SqliteDurableStore};
use crate::strategy::FetchOutcome;
use crate::worker::{Event, EventOutcome, Worker, WorkerDeps};

#[derive(Parser, Debug)]
#[command(name = "offline-worker")]
#[command(about = "Offline-resilience engine: cache strategies and a durable write queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-worker/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Populate the static cache from the asset manifest
  Install,
  /// Delete stale cache generations and claim open clients
  Activate,
  /// Intercept one request and print the response
  Fetch {
    /// Absolute URL, or a path resolved against the origin
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Treat the request as a top-level navigation
    #[arg(long)]
    navigate: bool,
    #[arg(long, value_enum, default_value = "other")]
    destination: Destination,
    /// Request header as "Name: value"
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Request body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Queue a mutation that failed for lack of connectivity
  Enqueue {
    /// JSON request body
    payload: String,
    /// Replay target (default: sync.activity_endpoint)
    #[arg(long)]
    endpoint: Option<String>,
    /// Bearer token to replay with (default: $OFFLINE_WORKER_TOKEN)
    #[arg(long)]
    token: Option<String>,
  },
  /// List queued mutations
  Queue,
  /// Deliver a one-shot sync trigger (activity-sync, notification-sync)
  Sync { tag: String },
  /// Deliver a periodic sync trigger (data-sync)
  PeriodicSync { tag: String },
  /// Deliver a push payload; "-" reads it from stdin
  Push { payload: String },
  /// Store a push payload for the next notification-sync
  QueueNotification { payload: String },
  /// Deliver a notification click
  Click {
    #[arg(long, default_value = "")]
    tag: String,
    /// open, dismiss, or nothing for a plain click
    #[arg(long)]
    action: Option<String>,
    /// URL of an open window; repeat for several
    #[arg(long = "client")]
    clients: Vec<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = config::Config::load(args.config.as_deref())?;
  let data_dir = config.data_dir()?;
  let _guard = init_logging(&data_dir.join("logs"), args.verbose)?;

  let network: Arc<dyn Network> = Arc::new(HttpNetwork::new(&config.network)?);
  let store = Arc::new(SqliteDurableStore::open(&data_dir.join("offline.db"))?);
  let clients = match &args.command {
    Command::Click { clients, .. } => clients.clone(),
    _ => Vec::new(),
  };

  let worker = Worker::new(
    &config,
    WorkerDeps {
      network: network.clone(),
      cache: Arc::new(SqliteCacheStorage::open(&data_dir.join("cache.db"))?),
      mutations: store.clone(),
      notifications: store,
      sink: Arc::new(host::StdoutSink),
      windows: Arc::new(host::ListedWindows::new(&clients)),
    },
  )?;

  let event = match args.command {
    Command::Install => Event::Install,
    Command::Activate => Event::Activate,
    Command::Fetch {
      url,
      method,
      navigate,
      destination,
      headers,
      data,
    } => {
      let mut request = Request::new(&method, config.resolve(&url)?).with_destination(destination);
      if navigate {
        request = request.navigation();
      }
      for header in &headers {
        let (name, value) = header
          .split_once(':')
          .ok_or_else(|| eyre!("Invalid header '{}', expected 'Name: value'", header))?;
        request = request.with_header(name.trim(), value.trim());
      }
      if let Some(data) = data {
        request = request.with_body(data.into_bytes());
      }

      return fetch(&worker, network.as_ref(), request).await;
    }
    Command::Enqueue {
      payload,
      endpoint,
      token,
    } => Event::Enqueue(NewMutation {
      endpoint: endpoint.unwrap_or_else(|| config.sync.activity_endpoint.clone()),
      payload,
      credential: token.or_else(config::Config::get_token),
    }),
    Command::Queue => {
      let queued = worker.queued()?;
      let json = serde_json::to_string_pretty(&queued)
        .map_err(|e| eyre!("Failed to serialize queue: {}", e))?;
      println!("{}", json);
      return Ok(());
    }
    Command::Sync { tag } => Event::Sync(tag),
    Command::PeriodicSync { tag } => Event::PeriodicSync(tag),
    Command::Push { payload } => Event::Push(read_payload(payload)?),
    Command::QueueNotification { payload } => Event::QueueNotification(payload),
    Command::Click { tag, action, .. } => Event::NotificationClick { tag, action },
  };

  let outcome = worker.handle(event).await?;
  report(&outcome)
}

/// Intercept a request; passthrough requests go straight to the network.
async fn fetch(worker: &Worker, network: &dyn Network, request: Request) -> Result<()> {
  let response = match worker.handle(Event::Fetch(request.clone())).await? {
    EventOutcome::Fetched(FetchOutcome::Respond { response, source }) => {
      eprintln!("source: {:?}", source);
      response
    }
    EventOutcome::Fetched(FetchOutcome::Passthrough) => {
      eprintln!("source: passthrough");
      network.fetch(&request).await?
    }
    other => return Err(eyre!("Unexpected outcome for fetch: {:?}", other)),
  };

  print_response(&response);
  Ok(())
}

fn print_response(response: &Response) {
  println!("HTTP {}", response.status);
  for (name, value) in &response.headers {
    println!("{}: {}", name, value);
  }
  println!();
  println!("{}", String::from_utf8_lossy(&response.body));
}

fn report(outcome: &EventOutcome) -> Result<()> {
  match outcome {
    EventOutcome::Installed(Some(count)) => println!("cached {} static files", count),
    EventOutcome::Installed(None) => println!("static cache population failed, see log"),
    EventOutcome::Activated { deleted, claimed } => {
      for name in deleted {
        println!("deleted {}", name);
      }
      println!("claimed clients: {}", claimed);
    }
    EventOutcome::Queued(id) => println!("queued {}", id),
    EventOutcome::Synced(report) => {
      let json = serde_json::to_string(report)
        .map_err(|e| eyre!("Failed to serialize sync report: {}", e))?;
      println!("{}", json);
    }
    EventOutcome::NotificationsSynced(count) => println!("shown {} queued notifications", count),
    EventOutcome::Refreshed(ok) => println!("refreshed: {}", ok),
    EventOutcome::Ignored => println!("ignored"),
    EventOutcome::Notified(None) => println!("no notification"),
    // StdoutSink already printed it
    EventOutcome::Notified(Some(_)) => {}
    EventOutcome::Clicked(route) => tracing::debug!(?route, "Click handled"),
    EventOutcome::Fetched(outcome) => tracing::debug!(?outcome, "Fetch handled"),
  }
  Ok(())
}

fn read_payload(payload: String) -> Result<Vec<u8>> {
  if payload != "-" {
    return Ok(payload.into_bytes());
  }

  let mut bytes = Vec::new();
  std::io::stdin()
    .read_to_end(&mut bytes)
    .map_err(|e| eyre!("Failed to read payload from stdin: {}", e))?;
  Ok(bytes)
}

fn init_logging(log_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "offline-worker.log"));

  let stderr_layer = verbose.then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

  tracing_subscriber::registry()
    .with(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| "offline_worker=info".into()),
    )
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .with(stderr_layer)
    .init();

  Ok(guard)
}
