mod cache;
mod config;
mod event;
mod host;
mod origin;
mod push;
mod queue;
mod router;
mod strategy;
mod sync;
mod worker;

#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use futures::StreamExt;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cache::SqliteStorage;
use event::{EventHandler, Incoming};
use host::ConsoleHost;
use origin::{Network, OriginClient, ResponseSummary};
use strategy::FetchOutcome;
use worker::{Event, Outcome, Worker};

type Agent = Worker<SqliteStorage, OriginClient>;

#[derive(Parser, Debug)]
#[command(name = "echodeed-sw")]
#[command(about = "Offline caching, background sync and push agent for EchoDeed")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/echodeed-sw/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin server URL, overrides config and ECHODEED_ORIGIN
  #[arg(short, long)]
  origin: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-cache the manifest for the configured version
  Install,
  /// Make the installed version current and delete stale partitions
  Activate,
  /// Route a request through the agent
  Fetch {
    url: String,
    #[arg(short = 'X', long)]
    method: Option<String>,
    /// Treat as a page navigation
    #[arg(long)]
    navigate: bool,
    /// Accept header
    #[arg(long)]
    accept: Option<String>,
    /// JSON request body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Replay the offline queue
  Sync {
    #[arg(long)]
    tag: Option<String>,
  },
  /// Deliver a push message (JSON or plain text)
  Push { payload: Option<String> },
  /// Click a notification
  Click {
    #[arg(long, default_value = "echodeed")]
    tag: String,
    /// `explore`, `close`, or omit for a body click
    #[arg(long)]
    action: Option<String>,
  },
  /// Inspect or fill the offline queue
  Queue {
    #[command(subcommand)]
    command: QueueCommand,
  },
  /// List cache partitions and their entries
  Caches,
  /// Read JSON-line events from stdin until it closes
  Run {
    /// Events handled at the same time
    #[arg(long, default_value_t = 8)]
    concurrency: usize,
  },
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// Queue a kindness post for the next sync
  Add { body: String },
  /// Show pending and dead-lettered entries
  List,
  /// Show one entry with its attempt count and last error
  Show { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging()?;

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;
  if let Some(origin) = args.origin {
    config.origin = origin;
  }

  let storage = Arc::new(SqliteStorage::open(&config.database_path()?)?);
  let network = Arc::new(OriginClient::new()?);
  let worker = Worker::new(config, storage, network)?;
  let host = ConsoleHost;

  match args.command {
    Command::Install => print(&handle_event(&worker, &host, Event::Install).await?),
    Command::Activate => print(&handle_event(&worker, &host, Event::Activate).await?),
    Command::Fetch {
      url,
      method,
      navigate,
      accept,
      data,
    } => {
      let request = event::build_request(
        worker.origin(),
        &url,
        method.as_deref(),
        navigate,
        accept.as_deref(),
        data,
      )?;
      print(&handle_event(&worker, &host, Event::Fetch(request)).await?);
    }
    Command::Sync { tag } => {
      let tag = tag.unwrap_or_else(|| worker.config().sync.tag.clone());
      print(&handle_event(&worker, &host, Event::Sync { tag }).await?);
    }
    Command::Push { payload } => {
      print(&handle_event(&worker, &host, Event::Push { data: payload }).await?)
    }
    Command::Click { tag, action } => {
      let event = Event::NotificationClick { tag, action };
      print(&handle_event(&worker, &host, event).await?);
    }
    Command::Queue { command } => match command {
      QueueCommand::Add { body } => {
        let id = worker.queue().enqueue_kindness(&body)?;
        print(&json!({ "queued": id }));
      }
      QueueCommand::List => print(&json!({
        "pending": worker.queue().entries()?,
        "dead": worker.queue().dead_letters()?,
      })),
      QueueCommand::Show { id } => match worker.queue().get(id)? {
        Some(entry) => print(&serde_json::to_value(&entry)?),
        None => return Err(eyre!("No queued mutation with id {}", id)),
      },
    },
    Command::Caches => {
      let partitions: Vec<Value> = worker
        .cache()
        .contents()?
        .into_iter()
        .map(|(name, keys)| json!({ "partition": name, "entries": keys }))
        .collect();
      print(&Value::Array(partitions));
    }
    Command::Run { concurrency } => run(&worker, &host, concurrency).await,
  }

  Ok(())
}

/// Log to a file in the data directory; stdout carries command output.
fn init_logging() -> Result<WorkerGuard> {
  let dir = config::data_dir()?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create data directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::never(&dir, "echodeed-sw.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(filter)
    .init();

  Ok(guard)
}

/// Run one event to completion. Requests the agent does not intercept are
/// sent to the origin directly, as a browser would.
async fn handle_event(worker: &Agent, host: &ConsoleHost, event: Event) -> Result<Value> {
  let passthrough = match &event {
    Event::Fetch(request) => Some(request.clone()),
    _ => None,
  };

  let handled = worker.run_event(host, event).await?;
  let mut value = serde_json::to_value(&handled)?;

  if let (
    Outcome::Fetched {
      result: FetchOutcome::Passthrough,
      ..
    },
    Some(request),
  ) = (&handled.outcome, passthrough)
  {
    let response = worker.network().fetch(&request).await?;
    value["network"] = serde_json::to_value(ResponseSummary::from(&response))?;
  }

  Ok(value)
}

async fn run(worker: &Agent, host: &ConsoleHost, concurrency: usize) {
  info!(concurrency, "event loop started");
  let events = EventHandler::new(worker.origin().clone(), worker.config().sync.tag.clone());

  futures::stream::unfold(events, |mut events| async move {
    events.next().await.map(|incoming| (incoming, events))
  })
  .for_each_concurrent(concurrency.max(1), |incoming| async move {
    let line = match incoming {
      Incoming::Event(event) => match handle_event(worker, host, event).await {
        Ok(value) => value,
        Err(e) => {
          warn!(error = %e, "event failed");
          json!({ "error": e.to_string() })
        }
      },
      Incoming::Malformed { line, error } => {
        warn!(%line, %error, "skipping malformed event");
        json!({ "error": error, "line": line })
      }
    };
    print(&line);
  })
  .await;

  info!("event loop finished");
}

fn print(value: &Value) {
  println!("{}", value);
}
