mod cache;
mod cart;
mod client;
mod config;
mod http;
mod menu;
mod network;
mod platform;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cache::{CacheStorage, MemoryStorage, RegistrationStore, SqliteStorage};
use crate::cart::Cart;
use crate::client::{ClientPage, OrderOutcome, TerminalPrompt};
use crate::config::WorkerConfig;
use crate::http::{Method, Request, RequestIdentity};
use crate::network::{HttpNetwork, Network};
use crate::platform::{Registration, UpdateCheck};
use crate::worker::WorkerMessage;

#[derive(Parser, Debug)]
#[command(name = "aromatna")]
#[command(about = "Offline-first storefront worker for the Aromatna coffee shop")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/aromatna/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Path to the cache database (default: $XDG_DATA_HOME/aromatna/cache.db)
  #[arg(long)]
  db: Option<PathBuf>,

  /// Keep caches in memory for this run only
  #[arg(long, conflicts_with = "db")]
  ephemeral: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Register the configured worker build, installing it if needed
  Install,
  /// Install the configured build and make it active right away
  Activate,
  /// Issue a request through the active worker
  Fetch {
    /// Path or absolute URL
    path: String,
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// Send `Accept: text/html`
    #[arg(long)]
    html: bool,
  },
  /// List cache partitions
  Partitions {
    /// Show the entries of each partition
    #[arg(long)]
    entries: bool,
  },
  /// Remove a cached response from the current partitions
  Evict { path: String },
  /// Check for a new worker build
  Update {
    /// Switch to the new build without asking
    #[arg(short, long)]
    yes: bool,
  },
  /// Queue the demo order until connectivity returns
  Order,
  /// Signal restored connectivity and run pending deferred tasks
  Sync,
  /// Show the menu
  Menu,
  /// Manage the shopping cart
  Cart {
    #[command(subcommand)]
    action: CartAction,
  },
}

#[derive(Subcommand, Debug)]
enum CartAction {
  /// Add one unit of an item
  Add { id: String },
  /// Remove one unit of an item
  Dec { id: String },
  /// Drop an item from the cart
  Rm { id: String },
  Clear,
  Show,
  Checkout,
}

/// Initialize file logging in the data directory.
///
/// Level comes from `AROMATNA_LOG` (default `info`).
fn init_logging() -> Result<WorkerGuard> {
  let dir = config::data_dir()?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create data directory {}: {}", dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(
    &dir,
    "aromatna.log",
  ));
  let filter = EnvFilter::try_from_env("AROMATNA_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(filter)
    .init();

  Ok(guard)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging()?;
  tracing::debug!(?args, "Starting");

  let config = WorkerConfig::load(args.config.as_deref())?;
  let network = Arc::new(HttpNetwork::new()?);

  if args.ephemeral {
    return run(args.command, config, Arc::new(MemoryStorage::new()), network).await;
  }

  let path = match args.db {
    Some(path) => path,
    None => SqliteStorage::default_path()?,
  };
  run(args.command, config, Arc::new(SqliteStorage::open(&path)?), network).await
}

async fn run<S, N>(
  command: Command,
  config: WorkerConfig,
  storage: Arc<S>,
  network: Arc<N>,
) -> Result<()>
where
  S: CacheStorage + RegistrationStore + 'static,
  N: Network,
{
  let registration = Registration::new(config, storage, network);

  match command {
    Command::Install => {
      let worker = registration.register().await?;
      println!("{} ({})", worker.names().build_tag(), worker.state());
    }
    Command::Activate => {
      let worker = registration.install(Arc::clone(registration.config())).await?;
      registration.post_message(&worker, &WorkerMessage::SkipWaiting.to_value())?;
      println!("{} ({})", worker.names().build_tag(), worker.state());
    }
    Command::Fetch { path, method, html } => {
      registration.resume()?;
      let method: Method = method.parse()?;
      let mut request = Request::new(method, registration.config().resolve(&path)?);
      if html {
        request = request.with_header("accept", "text/html");
      }

      let result = registration.fetch(request).await?;
      println!("{} ({})", result.data.status, result.source);
      if let Some(content_type) = result.data.header("content-type") {
        println!("content-type: {}", content_type);
      }
      if let Some(cached_at) = result.cached_at {
        println!("cached at {}", cached_at.to_rfc3339());
      }
      println!("{}", result.data.text());

      if let Some(worker) = registration.active() {
        worker.settle().await?;
      }
    }
    Command::Partitions { entries } => {
      let storage = registration.storage();
      let names = registration.config().cache_names();
      for partition in storage.partition_names()? {
        let marker = if names.is_current(&partition) { "*" } else { " " };
        let contents = storage.entries(&partition)?;
        println!("{} {} ({} entries)", marker, partition, contents.len());

        if entries {
          for entry in contents {
            println!(
              "    {} {} {}",
              entry.response.status,
              entry.identity,
              entry.cached_at.to_rfc3339()
            );
          }
        }
      }
    }
    Command::Evict { path } => {
      let identity = RequestIdentity::new(Method::Get, &registration.config().resolve(&path)?);
      let names = registration.config().cache_names();
      for partition in [&names.static_name, &names.api_name] {
        if registration.storage().delete(partition, &identity)? {
          println!("Removed {} from {}", identity, partition);
        }
      }
    }
    Command::Update { yes } => {
      registration.resume()?;
      let mut page = ClientPage::open(&registration, TerminalPrompt);
      let config = Arc::clone(registration.config());

      let check = if yes {
        let check = registration.update(config).await?;
        if let UpdateCheck::Waiting(worker) = &check {
          registration.post_message(worker, &WorkerMessage::SkipWaiting.to_value())?;
        }
        check
      } else {
        page.check_for_update(&registration, config).await?
      };
      page.pump();
      if page.reloads() > 0 {
        println!("Page reloaded under the new worker");
      }

      match check {
        UpdateCheck::Unregistered => {}
        UpdateCheck::UpToDate => println!("Up to date"),
        UpdateCheck::Waiting(worker) | UpdateCheck::Activated(worker) => {
          println!("{} ({})", worker.names().build_tag(), worker.state());
        }
      }
    }
    Command::Order => {
      registration.resume()?;
      let page = ClientPage::open(&registration, TerminalPrompt);
      if page.place_order(&registration)? == OrderOutcome::Queued {
        if let Some(sync) = registration.sync() {
          println!("Pending: {}", sync.pending()?.join(", "));
        }
      }
    }
    Command::Sync => {
      registration.resume()?;
      let mut page = ClientPage::open(&registration, TerminalPrompt);
      let completed = registration.connectivity_restored().await?;
      page.pump();
      println!(
        "{} deferred task(s) completed, {} client(s) open",
        completed,
        registration.clients().match_all().len()
      );
    }
    Command::Menu => {
      registration.resume()?;
      let menu = menu::load_menu(&registration, &TerminalPrompt).await;
      for item in &menu {
        println!("{:<12} {:<20} {:>8}", item.id, item.name, menu::format_price(item.price));
        if let Some(desc) = &item.desc {
          println!("{:<12} {}", "", desc);
        }
      }
    }
    Command::Cart { action } => {
      let path = Cart::default_path()?;
      let mut cart = Cart::load(&path);

      match action {
        CartAction::Add { id } => {
          cart.add(&id);
          println!("Added to cart");
        }
        CartAction::Dec { id } => cart.change_qty(&id, -1),
        CartAction::Rm { id } => {
          cart.remove(&id);
        }
        CartAction::Clear => {
          cart.clear();
          println!("Cart cleared");
        }
        CartAction::Show => {
          registration.resume()?;
          let menu = menu::load_menu(&registration, &TerminalPrompt).await;
          if cart.is_empty() {
            println!("Cart is empty. Add something tasty.");
          }
          for line in cart.lines(&menu) {
            println!(
              "{:<20} {} x {}",
              line.item.name,
              menu::format_price(line.item.price),
              line.qty
            );
          }
          println!("Items: {}  Total: {}", cart.count(), menu::format_price(cart.total(&menu)));
        }
        CartAction::Checkout => {
          cart::checkout(&cart, &TerminalPrompt);
        }
      }

      cart.save(&path)?;
    }
  }

  Ok(())
}
