use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use edusync::config::Config;
use edusync::http::{Method, RequestOptions};
use edusync::outbox::DrainTrigger;
use edusync::{logging, DataLayer, MutationOutcome, MutationRequest};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "edusync")]
#[command(about = "Resilient client for the education platform API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/edusync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch a path and print the JSON response
  Get {
    path: String,
    /// Skip joining an identical in-flight request
    #[arg(long)]
    fresh: bool,
    /// Cache lifetime for this read (0 disables caching)
    #[arg(long)]
    ttl_ms: Option<u64>,
  },
  /// Send a mutation, queueing it for replay if the API is unreachable
  Send {
    /// POST, PUT or DELETE
    method: String,
    path: String,
    /// JSON request body
    #[arg(long)]
    body: Option<String>,
    /// Label shown when listing the queue
    #[arg(long)]
    title: Option<String>,
    /// Logical resource key (default: "<METHOD> <path>")
    #[arg(long)]
    dedupe_key: Option<String>,
  },
  /// List queued mutations
  Queue,
  /// Replay queued mutations now
  Drain,
  /// Remove a queued mutation without sending it
  Discard { id: String },
  /// Print data updates from this and other processes until interrupted
  Watch,
  /// Clear cached reads, queued mutations and update markers
  Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init()?;

  let layer = DataLayer::open(&config)?;
  let result = run(&layer, args.command).await;
  layer.shutdown().await;

  result
}

async fn run(layer: &DataLayer, command: Command) -> Result<()> {
  match command {
    Command::Get {
      path,
      fresh,
      ttl_ms,
    } => {
      let mut options = RequestOptions::default();
      if fresh {
        options = options.fresh();
      }
      if let Some(ms) = ttl_ms {
        options = options.cache_ttl(Duration::from_millis(ms));
      }

      let value = layer.client().get_value(&path, options).await?;
      println!("{}", serde_json::to_string_pretty(&value)?);
    }

    Command::Send {
      method,
      path,
      body,
      title,
      dedupe_key,
    } => {
      let method: Method = method.parse().map_err(|e: String| eyre!(e))?;
      if !method.is_mutation() {
        return Err(eyre!("Use `get` for reads"));
      }

      let body = body
        .map(|raw| serde_json::from_str::<Value>(&raw))
        .transpose()
        .map_err(|e| eyre!("Invalid JSON body: {}", e))?;

      let request = MutationRequest {
        title: title.unwrap_or_else(|| format!("{} {}", method, path)),
        dedupe_key: dedupe_key.unwrap_or_else(|| format!("{} {}", method, path)),
        method,
        path,
        body,
      };

      match layer.mutate::<Value>(request).await? {
        MutationOutcome::Delivered(value) => {
          println!("{}", serde_json::to_string_pretty(&value)?);
        }
        MutationOutcome::Queued(item) => {
          println!("Queued for retry: {} ({})", item.title, item.id);
        }
      }
    }

    Command::Queue => {
      let items = layer.outbox().items();
      if items.is_empty() {
        println!("Outbox is empty");
      }
      for item in items {
        println!(
          "{}  {} {}  [{}] attempts={}{}",
          item.id,
          item.method,
          item.path,
          item.title,
          item.attempts,
          item
            .last_error
            .map(|e| format!("  last error: {}", e))
            .unwrap_or_default()
        );
      }
    }

    Command::Drain => {
      // The worker drains on startup; wait for it rather than failing
      let report = loop {
        if let Some(report) = layer.drain().await {
          break report;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
      };

      println!(
        "delivered={} abandoned={} remaining={}",
        report.delivered.len(),
        report.abandoned.len(),
        report.remaining
      );
      if report.failed.is_some() {
        println!("Stopped at a recoverable failure; remaining items will be retried");
      }
    }

    Command::Discard { id } => match layer.outbox().discard(&id) {
      Some(item) => println!("Discarded: {}", item.title),
      None => return Err(eyre!("No queued mutation with id {}", id)),
    },

    Command::Watch => {
      let mut updates = layer.subscribe();
      layer.trigger_drain(DrainTrigger::Visible);

      loop {
        tokio::select! {
          _ = tokio::signal::ctrl_c() => break,
          update = updates.recv() => match update {
            Some(update) => println!(
              "{} {:?} {}",
              update.at_ms,
              update.origin,
              update.reasons.join(", ")
            ),
            None => break,
          },
        }
      }
    }

    Command::Reset => {
      layer.reset();
      println!("Cache, outbox and update markers cleared");
    }
  }

  Ok(())
}
