use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;

use shelf_offline::cache::{CacheStorage, MemoryStorage, SqliteStorage};
use shelf_offline::config::Config;
use shelf_offline::controller::{prune_inactive, Registration};
use shelf_offline::filter_state::{FilterState, MemorySessionStore};
use shelf_offline::http::HttpFetcher;
use shelf_offline::{logging, proxy};

#[derive(Parser, Debug)]
#[command(name = "shelf-offline")]
#[command(about = "Offline-first caching proxy for the shelf media tracker")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shelf-offline/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the configured version and run the offline proxy
  Serve {
    /// Base URL of the shelf backend
    #[arg(long)]
    upstream: Option<String>,

    /// Address to listen on
    #[arg(long)]
    listen: Option<String>,

    /// Keep the cache in memory instead of on disk
    #[arg(long)]
    ephemeral: bool,
  },
  /// Install and activate the configured version, then exit
  Install,
  /// Show the active version and every partition
  Status,
  /// Delete partitions that do not belong to the active version
  Clear {
    /// Delete every partition, including the current version's
    #[arg(long)]
    all: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  match args.command {
    Command::Serve {
      upstream,
      listen,
      ephemeral,
    } => {
      // Command line overrides the config file
      if let Some(upstream) = upstream {
        config.upstream = upstream;
      }
      if let Some(listen) = listen {
        config.listen = listen;
      }

      if ephemeral {
        serve(config, Arc::new(MemoryStorage::new())).await
      } else {
        serve(config, Arc::new(SqliteStorage::open_default()?)).await
      }
    }
    Command::Install => {
      let registration = registration(&config, Arc::new(SqliteStorage::open_default()?))?;
      let controller = registration.register(&config.cache).await?;
      print!("{}", controller.status()?);
      Ok(())
    }
    Command::Status => print_status(&SqliteStorage::open_default()?),
    Command::Clear { all } => {
      let storage = SqliteStorage::open_default()?;
      let deleted = if all {
        let names = storage.partitions()?;
        for name in &names {
          storage.delete_partition(name)?;
        }
        names
      } else {
        prune_inactive(&storage, &config.cache)?
      };

      for name in &deleted {
        println!("deleted {}", name);
      }
      println!("{} partition(s) deleted", deleted.len());
      Ok(())
    }
  }
}

fn registration<S: CacheStorage + 'static>(
  config: &Config,
  storage: Arc<S>,
) -> Result<Registration<S, HttpFetcher>> {
  let fetcher = Arc::new(HttpFetcher::new(config.cache.timeout())?);
  Ok(Registration::new(storage, fetcher, config.upstream_url()?))
}

async fn serve<S: CacheStorage + 'static>(config: Config, storage: Arc<S>) -> Result<()> {
  let addr = config.listen_addr()?;
  let registration = Arc::new(registration(&config, storage)?);
  registration.register(&config.cache).await?;

  let state = proxy::ProxyState {
    registration,
    filters: Arc::new(FilterState::new(
      MemorySessionStore::new(),
      &config.filters,
    )),
  };

  proxy::serve(addr, proxy::router(state)).await
}

fn print_status(storage: &SqliteStorage) -> Result<()> {
  match storage.active_version()? {
    Some(version) => println!("active version: {}", version),
    None => println!("no active version"),
  }

  for name in storage.partitions()? {
    println!("  {:<28} {:>6} entries", name, storage.keys(&name)?.len());
  }
  Ok(())
}
