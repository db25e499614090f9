mod config;
mod docstore;
mod model;
mod net;
mod proxy;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use config::Config;
use docstore::{DocumentStore, ProxiedDocumentStore};
use model::UserDocument;
use net::HttpFetcher;
use proxy::{CacheStore, OfflineCacheProxy, PageRequest, ResponseSource, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "liftlog")]
#[command(about = "Offline-capable progress viewer for training logs")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/liftlog/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the app shell into a fresh cache generation and promote it
  Refresh,
  /// Fetch a URL through the offline cache proxy
  Fetch {
    /// URL to fetch
    url: String,
  },
  /// List cache generations present in the store
  Generations,
  /// Show a user's training log (clients, sessions, exercises, sets)
  Show {
    /// User id of the document to load
    user: String,

    /// Only show this client
    #[arg(long)]
    client: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("liftlog=info")),
    )
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  match args.command {
    Command::Refresh => {
      let mut proxy = build_proxy(&config)?;
      proxy.install().await?;
      proxy.activate().await?;
      println!("Generation {} installed and activated", proxy.generation());
    }

    Command::Generations => {
      let store = open_store(&config)?;
      let generations = store.list_generations()?;
      if generations.is_empty() {
        println!("No cache generations installed");
      }
      for generation in generations {
        println!("{}", generation);
      }
    }

    Command::Fetch { url } => {
      let mut proxy = build_proxy(&config)?;
      ready(&mut proxy).await?;

      let request = PageRequest::get(&url)?;
      let served = proxy.fetch_intercept(&request).await?;

      let source = match served.source {
        ResponseSource::Network => "network",
        ResponseSource::Cache => "cache",
      };
      println!(
        "{} {} ({} bytes, from {})",
        served.response.status,
        url,
        served.response.body.len(),
        source
      );
      if let Some(cached_at) = served.cached_at {
        println!("  cached at {}", cached_at.format("%Y-%m-%d %H:%M:%S UTC"));
      }

      proxy.settle_writes().await?;
    }

    Command::Show { user, client } => {
      let mut proxy = build_proxy(&config)?;
      ready(&mut proxy).await?;
      let proxy = Arc::new(proxy);

      let docs = ProxiedDocumentStore::new(Arc::clone(&proxy), config.docstore.base_url()?);
      let document = load_or_create(&docs, &config.docstore.collection, &user).await?;

      print_document(&document, client.as_deref())?;

      proxy.settle_writes().await?;
    }
  }

  Ok(())
}

fn open_store(config: &Config) -> Result<SqliteStore> {
  match &config.cache.db_path {
    Some(path) => SqliteStore::open_at(path),
    None => SqliteStore::open(),
  }
}

fn build_proxy(config: &Config) -> Result<OfflineCacheProxy<SqliteStore, HttpFetcher>> {
  Ok(OfflineCacheProxy::new(
    open_store(config)?,
    HttpFetcher::new()?,
    config.cache.version.clone(),
    config.cache.precache_urls()?,
  ))
}

/// Adopt the configured generation if a previous run installed it; otherwise
/// install and activate a fresh one (requires connectivity).
async fn ready(proxy: &mut OfflineCacheProxy<SqliteStore, HttpFetcher>) -> Result<()> {
  if proxy.resume().is_ok() {
    return Ok(());
  }

  proxy.install().await?;
  proxy.activate().await
}

/// Load the user's document, creating an empty one on first access.
async fn load_or_create<D: DocumentStore>(
  docs: &D,
  collection: &str,
  user: &str,
) -> Result<UserDocument> {
  match docs.get(collection, user).await? {
    Some(value) => serde_json::from_value(value)
      .map_err(|e| eyre!("Malformed training log for {}: {}", user, e)),
    None => {
      let document = UserDocument::default();
      let value = serde_json::to_value(&document)
        .map_err(|e| eyre!("Failed to serialize empty document: {}", e))?;
      docs.set(collection, user, &value).await?;
      println!("Created empty training log for {}", user);
      Ok(document)
    }
  }
}

/// Text drill-down: client -> session -> exercise -> sets.
fn print_document(document: &UserDocument, client_filter: Option<&str>) -> Result<()> {
  let clients: Vec<_> = match client_filter {
    Some(name) => {
      let client = document
        .client(name)
        .ok_or_else(|| eyre!("No client named {}", name))?;
      vec![client]
    }
    None => document.clients.iter().collect(),
  };

  if clients.is_empty() {
    println!("No clients recorded");
    return Ok(());
  }

  for client in clients {
    println!("{}", client.name);
    for session in &client.sessions {
      println!("  {}", session.date);
      for exercise in &session.exercises {
        match exercise.top_weight() {
          Some(top) => println!("    {} (top {})", exercise.name, top),
          None => println!("    {}", exercise.name),
        }
        for set in &exercise.sets {
          println!("      {} x {}", set.reps, set.weight);
        }
      }
    }
  }

  Ok(())
}
