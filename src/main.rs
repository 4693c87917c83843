mod app;
mod assets;
mod config;
mod context;
mod error;
mod event;
mod prefs;
mod queue;
mod reachability;
mod reference;
mod server;
mod store;
mod sync;
mod ui;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::assets::{AssetRequest, ClientMessage};
use crate::config::Config;
use crate::context::SessionContext;
use crate::prefs::Flag;
use crate::sync::SaveOutcome;

#[derive(Parser, Debug)]
#[command(name = "fieldsync")]
#[command(about = "Offline-first sync for event scouting data")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fieldsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Scouting server URL, overrides the config file
  #[arg(short, long)]
  server_url: Option<String>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Live dashboard (default)
  Dashboard,
  /// Probe the server and show local state
  Status,
  /// Save a submission read from a JSON file, or stdin with `-`
  Save { file: PathBuf },
  /// List submissions waiting to sync
  Pending,
  /// Deliver pending submissions now
  Sync,
  /// Fetch fresh teams, matches and scoring config
  Refresh,
  /// Drop synced submissions older than the retention window
  Prune,
  /// List cached teams, optionally only those playing in a match
  Teams {
    #[arg(short, long = "match")]
    match_id: Option<String>,
  },
  /// Discard cached reference data
  ClearCache,
  /// Show or change preference flags
  Prefs {
    #[arg(long)]
    background_precache: Option<Toggle>,
  },
  /// Manage the offline app shell
  Assets {
    #[command(subcommand)]
    command: AssetsCommand,
  },
}

#[derive(Subcommand, Debug)]
enum AssetsCommand {
  /// Precache the shell for the configured generation and activate it
  Install,
  /// Activate an installed generation, deleting every other one
  Activate,
  /// Answer a request the way an offline client would see it
  Fetch {
    url: String,
    /// Treat as a page navigation
    #[arg(long)]
    navigate: bool,
  },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Toggle {
  On,
  Off,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::resolve(args.config.as_deref(), args.server_url.as_deref())?;
  let command = args.command.unwrap_or(Command::Dashboard);

  // The dashboard owns the terminal, so its logs go to a file.
  let _guard = match command {
    Command::Dashboard => init_file_tracing(&config.data_dir()?.join("logs")),
    _ => {
      init_stderr_tracing();
      None
    }
  };

  let ctx = SessionContext::open(config)?;
  run(ctx, command).await
}

fn env_filter() -> EnvFilter {
  EnvFilter::try_from_env("FIELDSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_stderr_tracing() {
  tracing_subscriber::fmt()
    .with_env_filter(env_filter())
    .with_writer(std::io::stderr)
    .init();
}

fn init_file_tracing(dir: &Path) -> Option<WorkerGuard> {
  let appender = tracing_appender::rolling::daily(dir, "fieldsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  tracing_subscriber::fmt()
    .with_env_filter(env_filter())
    .with_writer(writer)
    .with_ansi(false)
    .init();
  Some(guard)
}

async fn run(ctx: SessionContext, command: Command) -> Result<()> {
  match command {
    Command::Dashboard => app::App::new(ctx).run().await,
    Command::Status => status(&ctx).await,
    Command::Save { file } => save(&ctx, &file).await,
    Command::Pending => {
      for entry in ctx.queue.list_pending()? {
        println!(
          "{}  {}  {}",
          entry.id,
          entry.created_at.to_rfc3339(),
          entry.payload
        );
      }
      Ok(())
    }
    Command::Sync => {
      ctx.monitor.refresh().await;
      let summary = ctx.sync.flush().await;
      println!("{}", summary.message());
      for error in &summary.errors {
        eprintln!("  {}", error);
      }
      Ok(())
    }
    Command::Refresh => {
      ctx.monitor.refresh().await;
      let outcome = ctx.sync.refresh_reference().await?;
      println!("{:?}", outcome);
      Ok(())
    }
    Command::Prune => {
      println!("pruned {} synced submission(s)", ctx.queue.prune()?);
      Ok(())
    }
    Command::Teams { match_id } => {
      if ctx.reference.get().is_none() {
        return Err(eyre!("No reference data cached. Run `fieldsync refresh` while online."));
      }
      for team in ctx.reference.filter_teams_for_match(match_id.as_deref()) {
        println!("{}", team.display_text);
      }
      Ok(())
    }
    Command::ClearCache => {
      ctx.reference.clear()?;
      println!("reference cache cleared");
      Ok(())
    }
    Command::Prefs {
      background_precache,
    } => {
      if let Some(toggle) = background_precache {
        ctx
          .prefs
          .set(Flag::BackgroundPrecache, matches!(toggle, Toggle::On))?;
      }
      println!(
        "background_precache: {}",
        ctx.prefs.get(Flag::BackgroundPrecache)
      );
      Ok(())
    }
    Command::Assets { command } => assets(&ctx, command).await,
  }
}

async fn status(ctx: &SessionContext) -> Result<()> {
  let state = ctx.monitor.refresh().await;
  let stats = ctx.queue.stats()?;

  println!("server:     {} ({})", ctx.config.server.url, state.label());
  println!("queue:      {} pending, {} synced", stats.pending, stats.synced);
  match ctx.reference.fetched_at() {
    Some(at) => println!(
      "reference:  fetched {}{}",
      at.to_rfc3339(),
      if ctx.reference.is_stale() { " (stale)" } else { "" }
    ),
    None => println!("reference:  not cached"),
  }
  let installed = ctx.assets.resume()?;
  println!(
    "app shell:  {}{}",
    ctx.assets.cache_name(),
    if installed { "" } else { " (not installed)" }
  );
  Ok(())
}

async fn save(ctx: &SessionContext, file: &Path) -> Result<()> {
  let raw = if file == Path::new("-") {
    let mut buf = String::new();
    std::io::stdin().read_to_string(&mut buf)?;
    buf
  } else {
    std::fs::read_to_string(file).map_err(|e| eyre!("Failed to read {}: {}", file.display(), e))?
  };
  let payload: serde_json::Value =
    serde_json::from_str(&raw).map_err(|e| eyre!("Submission is not valid JSON: {}", e))?;
  if !payload.is_object() {
    return Err(eyre!("Submission must be a JSON object"));
  }

  ctx.monitor.refresh().await;
  match ctx.sync.save(payload).await {
    Ok(SaveOutcome::Synced(entry)) => println!("saved to server ({})", entry.id),
    Ok(SaveOutcome::SavedLocally(entry)) => {
      println!("saved locally, will sync later ({})", entry.id)
    }
    Err(e) => {
      return Err(eyre!(
        "Could not store the submission locally: {}. Keep a copy of {} and retry.",
        e,
        file.display()
      ))
    }
  }
  Ok(())
}

async fn assets(ctx: &SessionContext, command: AssetsCommand) -> Result<()> {
  let worker = &ctx.assets;
  match command {
    AssetsCommand::Install => {
      worker.install().await?;
      worker.handle_message(ClientMessage::SkipWaiting).await?;
      println!("installed and activated {}", worker.cache_name());
    }
    AssetsCommand::Activate => {
      if !worker.resume()? {
        return Err(eyre!(
          "{} is not installed. Run `fieldsync assets install` first.",
          worker.cache_name()
        ));
      }
      for name in worker.activate().await? {
        println!("deleted {}", name);
      }
      println!("activated {}", worker.cache_name());
    }
    AssetsCommand::Fetch { url, navigate } => {
      if worker.resume()? {
        worker.activate().await?;
      }
      let request = if navigate {
        AssetRequest::navigate(&url)
      } else {
        AssetRequest::get(&url)
      };
      let served = worker.fetch(&request).await;
      eprintln!(
        "{} via {} ({:?})",
        served.response.status,
        served.strategy.label(),
        served.source
      );
      println!("{}", String::from_utf8_lossy(&served.response.body));
    }
  }
  Ok(())
}
