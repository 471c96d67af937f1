mod bridge;
mod cache;
mod config;
mod constants;
mod controller;
mod download;
mod error;
mod intercept;
mod page;
mod session;
mod subtitle;
mod ui;
mod youtube;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use bridge::PageWindow;
use cache::CacheManager;
use config::{FilePreferenceStore, StoredPreferences};
use controller::{
  Collaborators, ControllerEvent, GatePhase, SessionController, Snapshot, spawn_message_pump, spawn_navigation_watch,
};
use download::FileSaver;
use intercept::{InterceptionAgent, PageNetwork};
use page::{HostPage, HttpTransport};
use session::ButtonState;
use subtitle::OutputFormat;
use ui::ConsoleSurface;
use youtube::{HttpTrackFetcher, PlayerResponseTracks};

/// Upper bound on how long one page may take to settle, load or download.
const PAGE_TIMEOUT: Duration = Duration::from_secs(30);

// --- CLI ---

#[derive(Parser, Debug)]
#[command(author, version = env!("CARGO_PKG_VERSION"), about, long_about = None)]
struct Args {
  /// Watch URLs, loaded one after another in the same page
  #[arg(required = true)]
  urls: Vec<String>,

  /// Directory the subtitle files are written to
  #[arg(short, long, default_value = ".")]
  out: PathBuf,

  /// Preferred subtitle language (default: stored preference, then zh-Hans)
  #[arg(short, long)]
  lang: Option<String>,

  /// Output format
  #[arg(short, long, value_enum)]
  format: Option<OutputFormat>,

  /// Prepend the video description to the saved file
  #[arg(long)]
  include_description: bool,

  /// Merge entries separated by less than this many seconds
  #[arg(long, value_name = "SECONDS")]
  merge_gap: Option<f64>,

  /// Only intercept and report; never press download
  #[arg(long)]
  no_click: bool,

  /// Store --lang/--format/--include-description as the new defaults
  #[arg(long)]
  remember: bool,

  /// Log file (default: subtap.log in the data directory)
  #[arg(long)]
  log_file: Option<PathBuf>,
}

// --- Logging ---

fn default_log_path() -> PathBuf {
  ProjectDirs::from("", "", "subtap")
    .map(|dirs| dirs.data_dir().join("subtap.log"))
    .unwrap_or_else(|| PathBuf::from("subtap.log"))
}

fn init_logging(log_file: Option<&Path>) -> Result<WorkerGuard> {
  let path = log_file.map(Path::to_path_buf).unwrap_or_else(default_log_path);
  let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
  let file_name = path.file_name().ok_or_else(|| anyhow!("Log file path has no file name: {}", path.display()))?;
  std::fs::create_dir_all(dir).context("Failed to create log directory")?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "subtap=info".into()))
    .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
    .init();
  Ok(guard)
}

// --- Page driving ---

async fn watch_until(rx: &mut watch::Receiver<Snapshot>, pred: impl Fn(&Snapshot) -> bool) -> Result<Snapshot> {
  loop {
    {
      let current = rx.borrow_and_update();
      if pred(&*current) {
        return Ok((*current).clone());
      }
    }
    rx.changed().await.context("Session controller stopped")?;
  }
}

async fn until(rx: &mut watch::Receiver<Snapshot>, pred: impl Fn(&Snapshot) -> bool) -> Result<Snapshot> {
  tokio::time::timeout(PAGE_TIMEOUT, watch_until(rx, pred)).await.context("Timed out waiting for the page")?
}

/// Load one video, let the player fetch its captions, and press download once.
async fn process(
  page: &Arc<HostPage>,
  events: &mpsc::UnboundedSender<ControllerEvent>,
  snapshots: &mut watch::Receiver<Snapshot>,
  url: &str,
  no_click: bool,
) -> Result<()> {
  let state = page.navigate(url).await?;
  let video_id = state.video_id.ok_or_else(|| anyhow!("Not a video page: {}", url))?;

  // The player may only start once the previous video's cache has been flushed.
  until(snapshots, |s| s.video_id.as_deref() == Some(video_id.as_str())).await?;
  let player = {
    let page = Arc::clone(page);
    tokio::spawn(async move { page.play_captions().await })
  };

  let snap = until(snapshots, |s| s.video_id.as_deref() == Some(video_id.as_str()) && s.gate != GatePhase::Pending)
    .await?;
  if snap.gate == GatePhase::Suppressed {
    println!("[{}] no subtitles advertised, nothing to download", video_id);
    return Ok(());
  }
  if no_click {
    if let Ok(Err(e)) = player.await {
      error!(%video_id, err = %format!("{:#}", e), "subtap: player caption load failed");
    }
    return Ok(());
  }

  until(snapshots, |s| s.button == Some(ButtonState::Ready)).await?;
  events.send(ControllerEvent::Click).map_err(|_| anyhow!("Session controller stopped"))?;
  let snap = until(snapshots, |s| matches!(s.button, Some(ButtonState::Success | ButtonState::Error))).await?;
  let _ = player.await;

  match snap.button {
    Some(ButtonState::Success) => Ok(()),
    _ => Err(anyhow!(snap.message.unwrap_or_else(|| "Download failed".to_string()))),
  }
}

// --- Main ---

#[tokio::main]
async fn main() -> Result<()> {
  let args = Args::parse();
  let _guard = init_logging(args.log_file.as_deref())?;
  info!(version = env!("CARGO_PKG_VERSION"), urls = args.urls.len(), "subtap: starting");

  let overrides = StoredPreferences {
    preferred_language: args.lang.clone(),
    preferred_format: args.format,
    include_description: args.include_description.then_some(true),
    auto_download: None,
  };
  let preferences = FilePreferenceStore::new(overrides);
  if args.remember
    && let Err(e) = preferences.remember()
  {
    warn!(err = %format!("{:#}", e), "subtap: could not store preferences");
    eprintln!("warning: preferences not saved: {:#}", e);
  }

  // Page context
  let window = PageWindow::new();
  let transport = Arc::new(HttpTransport::default());
  let network = PageNetwork::new(transport.clone(), transport);
  let page = Arc::new(HostPage::new(network));
  let agent = InterceptionAgent::new(window.clone());
  agent.install(page.network());

  // Extension context. Its listener attaches after the first ready signal went
  // out; the delayed re-send is what it will see.
  let cache = CacheManager::default();
  let deps = Collaborators {
    page: page.clone(),
    tracks: Arc::new(PlayerResponseTracks),
    fetcher: Arc::new(HttpTrackFetcher::default()),
    downloads: Arc::new(FileSaver::new(&args.out)),
    preferences: Arc::new(preferences),
    surface: Arc::new(ConsoleSurface),
  };
  let (mut controller, rx) = SessionController::new(cache.clone(), deps);
  if let Some(gap) = args.merge_gap {
    controller = controller.with_merge_gap(gap);
  }
  let events = controller.events();
  let mut snapshots = controller.snapshots();
  spawn_message_pump(window.subscribe(), cache.clone(), events.clone());
  spawn_navigation_watch(page.watch_location(), events.clone());
  tokio::spawn(controller.run(rx));

  let mut failures = 0;
  for url in &args.urls {
    if let Err(e) = process(&page, &events, &mut snapshots, url, args.no_click).await {
      failures += 1;
      error!(url, err = %format!("{:#}", e), "subtap: video failed");
      eprintln!("{}: {:#}", url, e);
    }
  }

  info!(
    intercepted = agent.has_intercepted(),
    cached = cache.len(),
    pending = cache.pending_waiters(),
    failures,
    "subtap: done"
  );
  if failures > 0 {
    return Err(anyhow!("{} of {} videos failed", failures, args.urls.len()));
  }
  Ok(())
}
