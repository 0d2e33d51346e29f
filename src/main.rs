use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;

use offline_sync::clock::SystemClock;
use offline_sync::config::Config;
use offline_sync::store::{DurableStore, SqliteStore};
use offline_sync::{logging, PendingActionQueue, ReadCache};

#[derive(Parser, Debug)]
#[command(name = "offline-sync")]
#[command(about = "Inspect and maintain an offline-sync store")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Store file to open, overriding the config
  #[arg(short, long)]
  store: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show pending, dead-letter and cache counts
  Status,
  /// List actions waiting for delivery, oldest first
  Pending,
  /// List actions that exhausted their attempts
  DeadLetters,
  /// Move every dead letter back into the live queue
  RetryDead,
  /// Remove every read-cache entry
  ClearCache,
  /// Remove cache entries stale for longer than the grace period
  Sweep {
    /// Grace period past each entry's TTL, in milliseconds
    #[arg(long, default_value_t = 24 * 60 * 60 * 1000)]
    grace_ms: i64,
  },
}

fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let _log_guard = match logging::default_log_dir() {
    Some(dir) => Some(logging::init(&dir)?),
    None => None,
  };

  let config = Config::load(args.config.as_deref())?;
  let path = match args.store.or(config.storage.path) {
    Some(path) => path,
    None => SqliteStore::default_path()?,
  };
  if !path.exists() {
    return Err(eyre!("No store found at {}", path.display()));
  }

  let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::open_at(&path)?);
  let clock = Arc::new(SystemClock);
  let queue = PendingActionQueue::open(store.clone(), clock.clone())?;
  let cache = ReadCache::open(store.clone(), clock)?;

  match args.command {
    Command::Status => {
      println!("store:         {}", path.display());
      println!("pending:       {}", queue.len());
      println!("dead letters:  {}", queue.dead_letter_count());
      println!("cache entries: {}", cache.len());
    }
    Command::Pending => {
      for action in queue.all() {
        println!(
          "{}  {}  {}  attempts={}  {}",
          action.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
          action.id,
          action.kind,
          action.attempts,
          action.last_error.as_deref().unwrap_or("-"),
        );
      }
    }
    Command::DeadLetters => {
      for letter in queue.dead_letters() {
        println!(
          "{}  {}  {}  attempts={}  {}",
          letter.dead_lettered_at.format("%Y-%m-%d %H:%M:%S"),
          letter.action.id,
          letter.action.kind,
          letter.action.attempts,
          letter.action.last_error.as_deref().unwrap_or("-"),
        );
      }
    }
    Command::RetryDead => {
      let count = queue.requeue_dead_letters()?;
      println!("requeued {} action(s)", count);
    }
    Command::ClearCache => {
      let count = cache.len();
      cache.clear()?;
      println!("removed {} entr(ies)", count);
    }
    Command::Sweep { grace_ms } => {
      let count = cache.sweep(chrono::Duration::milliseconds(grace_ms))?;
      println!("swept {} entr(ies)", count);
    }
  }

  store.flush()?;
  Ok(())
}
