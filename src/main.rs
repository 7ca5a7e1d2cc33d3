use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;

use scentshelf::auth::{AuthContext, Session};
use scentshelf::cache_service::CacheService;
use scentshelf::clock::{Clock, SystemClock};
use scentshelf::config::Config;
use scentshelf::connectivity::ConnectivityMonitor;
use scentshelf::list::{ListSession, ListSnapshot};
use scentshelf::logging;
use scentshelf::model::{CatalogItem, Facet, PerfumeFilter, SortOption, UserStatus};
use scentshelf::remote::PostgrestClient;
use scentshelf::reviews::{ReviewDraft, ReviewService};
use scentshelf::store::LocalStore;
use scentshelf::sync::SyncService;

#[derive(Parser, Debug)]
#[command(name = "scentshelf")]
#[command(about = "Offline-first fragrance catalog with a personal shelf")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/scentshelf/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// User id to act as (overrides user_id from the config)
  #[arg(short, long)]
  user: Option<String>,

  /// Serve from the local cache only
  #[arg(long)]
  offline: bool,

  /// Mirror logs to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(clap::Args, Debug, Default)]
struct FilterArgs {
  #[arg(long)]
  brand: Option<String>,
  #[arg(long)]
  concentration: Option<String>,
  #[arg(long)]
  longevity: Option<String>,
  #[arg(long)]
  sillage: Option<String>,
  /// Repeatable; matches if any note is present
  #[arg(long = "note")]
  notes: Vec<String>,
  /// Repeatable; matches if any occasion is present
  #[arg(long = "occasion")]
  occasions: Vec<String>,
  #[arg(long)]
  min_rating: Option<f64>,
  #[arg(long)]
  max_rating: Option<f64>,
}

impl From<FilterArgs> for PerfumeFilter {
  fn from(args: FilterArgs) -> Self {
    PerfumeFilter {
      brand: args.brand,
      concentration: args.concentration,
      longevity: args.longevity,
      sillage: args.sillage,
      notes: args.notes,
      occasions: args.occasions,
      min_rating: args.min_rating,
      max_rating: args.max_rating,
    }
  }
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List the catalog, local first
  Browse {
    /// 1-based page number
    #[arg(short, long, default_value_t = 1)]
    page: usize,
    #[arg(short, long, default_value = "name-asc")]
    sort: SortOption,
    /// Ignore the cache age and fetch from the remote catalog
    #[arg(long)]
    refresh: bool,
    #[command(flatten)]
    filter: FilterArgs,
  },
  /// Search the catalog by name
  Search { text: String },
  /// Upload pending status changes, then download remote statuses
  Sync,
  /// Put an item on the shelf (wishlist, owned, consumed) or remove it (none)
  SetStatus { item_id: String, status: UserStatus },
  /// Attach personal notes to a shelved item
  Notes {
    item_id: String,
    /// Omit to clear the notes
    text: Option<String>,
  },
  /// Items on the remote shelf with the given status
  Shelf { status: UserStatus },
  /// Distinct values of a filterable column (brand, concentration)
  Facets { facet: Facet },
  /// Show reviews of an item
  Reviews { item_id: String },
  /// Publish or update your review of an item
  Review {
    item_id: String,
    #[arg(short, long)]
    rating: u8,
    #[arg(short, long, default_value = "")]
    title: String,
    #[arg(short, long, default_value = "")]
    body: String,
    /// Display name shown with the review
    #[arg(short, long, default_value = "anonymous")]
    author: String,
  },
}

struct Services {
  store: Arc<LocalStore>,
  auth: Arc<Session>,
  list: ListSession,
  sync: Arc<SyncService>,
  reviews: ReviewService,
}

fn build(config: &Config, args: &Args) -> Result<Services> {
  let db_path = match &config.cache.database {
    Some(p) => p.clone(),
    None => LocalStore::default_path()?,
  };
  let store = Arc::new(LocalStore::open(&db_path)?);
  tracing::debug!(path = %db_path.display(), "Opened local store");

  // An API key is not needed when nothing goes over the network
  let api_key = match Config::get_api_key() {
    Ok(key) => key,
    Err(_) if args.offline => String::new(),
    Err(e) => return Err(e),
  };
  let remote = Arc::new(PostgrestClient::new(&config.remote, &api_key)?);

  let clock: Arc<dyn Clock> = Arc::new(SystemClock);
  let connectivity = Arc::new(ConnectivityMonitor::new(!args.offline));
  let auth = Arc::new(Session::new(args.user.clone().or_else(|| config.user_id.clone())));

  let cache = Arc::new(
    CacheService::new(store.clone(), clock.clone())
      .with_stale_time(chrono::Duration::minutes(config.cache.stale_minutes)),
  );
  let list = ListSession::new(cache, remote.clone(), connectivity, config.cache.page_size);
  let sync = Arc::new(SyncService::new(
    store.clone(),
    remote.clone(),
    auth.clone(),
    clock.clone(),
  ));
  let reviews = ReviewService::new(remote, auth.clone(), clock);

  Ok(Services {
    store,
    auth,
    list,
    sync,
    reviews,
  })
}

fn print_item(item: &CatalogItem) {
  let brand = item.brand.as_ref().map(|b| b.name.as_str()).unwrap_or("-");
  let concentration = item.concentration.as_deref().unwrap_or("-");
  println!(
    "{:<38} {:<40} {:<24} {:<6} {:.1}",
    item.id, item.name, brand, concentration, item.performance
  );
}

fn print_snapshot(snapshot: &ListSnapshot, skip: usize) -> Result<()> {
  if let Some(error) = &snapshot.error {
    return Err(eyre!("{}", error));
  }
  for item in snapshot.items.iter().skip(skip) {
    print_item(item);
  }
  let total = snapshot
    .total_count
    .map(|t| format!(" of {}", t))
    .unwrap_or_default();
  let source = snapshot
    .source
    .map(|s| format!(" ({:?})", s))
    .unwrap_or_default();
  println!(
    "-- {} shown{}{}{}",
    snapshot.items.len().saturating_sub(skip),
    total,
    source,
    if snapshot.has_more { ", more available" } else { "" }
  );
  Ok(())
}

async fn run(args: Args, config: Config) -> Result<()> {
  let services = build(&config, &args)?;

  // Reconcile on start; a failed pass never blocks the command
  let startup_sync = !args.offline
    && !matches!(args.command, Command::Sync)
    && services.auth.current_user_id().is_ok();
  if startup_sync {
    match services.sync.sync_all().await {
      Ok(report) => tracing::info!(
        uploaded = report.uploaded,
        downloaded = report.downloaded,
        "Startup sync finished"
      ),
      Err(e) => tracing::warn!(error = %e, "Startup sync failed"),
    }
  }

  match args.command {
    Command::Browse {
      page,
      sort,
      refresh,
      filter,
    } => {
      let list = services
        .list
        .clone()
        .with_view(PerfumeFilter::from(filter), sort);
      let mut snapshot = list.load_data(refresh).await?;

      for _ in 1..page.max(1) {
        let Some(last) = snapshot.items.last().map(|i| i.id.clone()) else {
          break;
        };
        if !list.load_more_if_needed(&last).await? {
          break;
        }
        snapshot = list.snapshot();
      }
      let skip = (page.max(1) - 1) * config.cache.page_size;
      print_snapshot(&snapshot, skip)?;
    }
    Command::Search { text } => {
      services.list.set_search_text(text)?;
      services.list.settle().await;
      print_snapshot(&services.list.snapshot(), 0)?;
    }
    Command::Sync => {
      let report = services.sync.sync_all().await?;
      println!(
        "uploaded {}, downloaded {}, kept {} pending",
        report.uploaded, report.downloaded, report.skipped_pending
      );
      for (item_id, error) in &report.upload_failures {
        println!("  failed {}: {}", item_id, error);
      }
    }
    Command::SetStatus { item_id, status } => {
      let record = services.sync.toggle_status(&item_id, status)?;
      services.sync.flush().await;
      let user_id = services.auth.current_user_id()?;
      let pending = services
        .store
        .status(&user_id, &item_id)?
        .map(|r| r.pending)
        .unwrap_or(false);
      println!(
        "{} -> {}{}",
        record.item_id,
        record.status,
        if pending { " (pending upload)" } else { "" }
      );
    }
    Command::Notes { item_id, text } => {
      let user_id = services.auth.current_user_id()?;
      if !services
        .store
        .set_personal_notes(&user_id, &item_id, text.as_deref())?
      {
        return Err(eyre!("{} is not on your shelf", item_id));
      }
    }
    Command::Shelf { status } => {
      let mut ids: Vec<String> = services.sync.shelf(status).await?.into_iter().collect();
      ids.sort();
      for id in ids {
        match services.store.get_item(&id)? {
          Some(item) => print_item(&item),
          None => println!("{}", id),
        }
      }
    }
    Command::Facets { facet } => {
      for value in services.list.facet_values(facet).await? {
        println!("{}", value);
      }
    }
    Command::Reviews { item_id } => {
      let reviews = services.reviews.reviews(&item_id).await?;
      for review in &reviews {
        println!(
          "{}/5  {}  {}: {}",
          review.rating, review.author_name, review.title, review.body
        );
      }
      if let Some(avg) = ReviewService::average_rating(&reviews) {
        println!("-- {} reviews, average {:.1}", reviews.len(), avg);
      }
    }
    Command::Review {
      item_id,
      rating,
      title,
      body,
      author,
    } => {
      let review = services
        .reviews
        .submit(
          &item_id,
          ReviewDraft {
            author_name: author,
            title,
            body,
            rating,
          },
        )
        .await?;
      println!("saved review {}", review.id);
    }
  }

  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let log_dir = logging::default_log_dir().unwrap_or_else(|| PathBuf::from("logs"));
  let _guard = logging::init(&log_dir, args.verbose)?;

  let config = Config::load(args.config.as_deref())?;

  run(args, config).await
}
