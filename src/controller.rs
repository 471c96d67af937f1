//! Session controller: follows navigation, runs the decision gate, drives the
//! download button, and orchestrates downloads.
//!
//! The controller is a single task that owns the session. Everything that
//! suspends (settle delay, downloads, revert delays) runs in a spawned task and
//! reports back as a [`ControllerEvent`] tagged with the session generation
//! that scheduled it, so results for an abandoned session are dropped.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bridge::{InterceptedPayload, MessageListener, PageMessage};
use crate::cache::CacheManager;
use crate::config::PreferenceStore;
use crate::constants::constants;
use crate::download::{DownloadSink, suggest_filename};
use crate::error::SubsError;
use crate::intercept::extract_metadata;
use crate::page::PageView;
use crate::session::{ButtonEvent, ButtonState, GateDecision, Preferences, Session, decision_gate};
use crate::subtitle::{SubtitleEntry, merge_adjacent, normalize};
use crate::ui::ActionSurface;
use crate::youtube::{TrackFetcher, TrackSource, extract_video_id, select_track, with_event_format};

const DESCRIPTION_SEPARATOR: &str = "\n\n--- SUBTITLES ---\n\n";

#[derive(Debug)]
pub enum ControllerEvent {
  Navigated { url: String },
  ReadySignal,
  Captured { video_id: String, language: String },
  Settled { generation: u64 },
  Click,
  DownloadFinished { generation: u64, outcome: Result<DownloadReport, SubsError> },
  RevertElapsed { generation: u64 },
}

/// The external capabilities the controller works through.
pub struct Collaborators {
  pub page: Arc<dyn PageView>,
  pub tracks: Arc<dyn TrackSource>,
  pub fetcher: Arc<dyn TrackFetcher>,
  pub downloads: Arc<dyn DownloadSink>,
  pub preferences: Arc<dyn PreferenceStore>,
  pub surface: Arc<dyn ActionSurface>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatePhase {
  #[default]
  Pending,
  Suppressed,
  Exposed,
}

/// Observable controller state, published after every change.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
  pub video_id: Option<String>,
  pub generation: u64,
  pub gate: GatePhase,
  pub button: Option<ButtonState>,
  pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
  pub filename: String,
  pub language: String,
  pub is_auto_generated: bool,
  pub message: String,
}

pub fn success_message(language: &str, is_auto_generated: bool) -> String {
  let language_info = if language != "en" && language != "zh-Hans" { format!(" ({})", language) } else { String::new() };
  let auto_info = if is_auto_generated { " (Auto-generated)" } else { "" };
  format!("Subtitles downloaded successfully{}{}!", language_info, auto_info)
}

pub struct SessionController {
  cache: CacheManager,
  deps: Arc<Collaborators>,
  events: mpsc::UnboundedSender<ControllerEvent>,
  snapshot: watch::Sender<Snapshot>,
  ready_observed: bool,
  session: Option<Session>,
  message: Option<String>,
  next_generation: u64,
  merge_gap: Option<f64>,
}

impl SessionController {
  pub fn new(cache: CacheManager, deps: Collaborators) -> (Self, mpsc::UnboundedReceiver<ControllerEvent>) {
    let (events, rx) = mpsc::unbounded_channel();
    let (snapshot, _) = watch::channel(Snapshot::default());
    let controller = Self {
      cache,
      deps: Arc::new(deps),
      events,
      snapshot,
      ready_observed: false,
      session: None,
      message: None,
      next_generation: 1,
      merge_gap: None,
    };
    (controller, rx)
  }

  /// Fold adjacent entries closer than `gap` seconds before rendering.
  pub fn with_merge_gap(mut self, gap: f64) -> Self {
    self.merge_gap = Some(gap);
    self
  }

  pub fn events(&self) -> mpsc::UnboundedSender<ControllerEvent> {
    self.events.clone()
  }

  pub fn snapshots(&self) -> watch::Receiver<Snapshot> {
    self.snapshot.subscribe()
  }

  pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ControllerEvent>) {
    while let Some(event) = rx.recv().await {
      self.handle(event);
    }
  }

  fn current_generation(&self) -> Option<u64> {
    self.session.as_ref().map(|s| s.generation)
  }

  fn publish(&self, gate: GatePhase) {
    let snapshot = Snapshot {
      video_id: self.session.as_ref().map(|s| s.video_id.clone()),
      generation: self.current_generation().unwrap_or(0),
      gate,
      button: self.session.as_ref().and_then(|s| s.button),
      message: self.message.clone(),
    };
    self.snapshot.send_replace(snapshot);
  }

  fn gate(&self) -> GatePhase {
    self.snapshot.borrow().gate
  }

  fn send_later(&self, delay: std::time::Duration, event: ControllerEvent) {
    let events = self.events.clone();
    tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      let _ = events.send(event);
    });
  }

  pub fn handle(&mut self, event: ControllerEvent) {
    match event {
      ControllerEvent::Navigated { url } => self.on_navigated(&url),
      ControllerEvent::ReadySignal => self.on_ready(),
      ControllerEvent::Captured { video_id, language } => {
        if self.session.as_ref().is_some_and(|s| s.video_id == video_id) {
          debug!(%video_id, %language, "controller: capture for current video");
        } else {
          debug!(%video_id, %language, "controller: capture for another video");
        }
      }
      ControllerEvent::Settled { generation } => self.on_settled(generation),
      ControllerEvent::Click => self.on_click(),
      ControllerEvent::DownloadFinished { generation, outcome } => self.on_download_finished(generation, outcome),
      ControllerEvent::RevertElapsed { generation } => self.on_revert(generation),
    }
  }

  fn teardown(&mut self) {
    if let Some(old) = self.session.take() {
      if old.button.is_some() {
        self.deps.surface.remove();
      }
      debug!(video_id = %old.video_id, "controller: session closed");
    }
    self.message = None;
    self.cache.invalidate_all();
  }

  fn on_navigated(&mut self, url: &str) {
    let video_id = extract_video_id(url);
    let current = self.session.as_ref().map(|s| s.video_id.as_str());
    if video_id.as_deref() == current {
      return;
    }

    self.teardown();
    let Some(video_id) = video_id else {
      info!(url, "controller: left video pages");
      self.publish(GatePhase::Suppressed);
      return;
    };

    let generation = self.next_generation;
    self.next_generation += 1;
    info!(%video_id, generation, "controller: new session");
    self.session = Some(Session::new(video_id, generation));
    self.publish(GatePhase::Pending);
    self.send_later(constants().navigation_settle(), ControllerEvent::Settled { generation });
  }

  fn on_ready(&mut self) {
    if !self.ready_observed {
      info!("controller: interception layer ready");
    }
    self.ready_observed = true;
    if let Some(session) = self.session.as_mut()
      && let Some(state) = session.apply(ButtonEvent::ReadySignal)
    {
      self.deps.surface.render(state, None);
      self.publish(self.gate());
    }
  }

  fn on_settled(&mut self, generation: u64) {
    if self.current_generation() != Some(generation) {
      return;
    }
    let page = self.deps.page.current_state();
    let decision = decision_gate(self.deps.tracks.as_ref(), page.as_ref());
    let Some(session) = self.session.as_mut() else {
      return;
    };

    match decision {
      GateDecision::Suppress(reason) => {
        info!(video_id = %session.video_id, %reason, "controller: no action for this video");
        self.publish(GatePhase::Suppressed);
      }
      GateDecision::Expose { tracks } => {
        debug!(video_id = %session.video_id, tracks = tracks.len(), "controller: injecting action");
        session.button = Some(ButtonState::Disabled);
        self.deps.surface.inject(&session.video_id, ButtonState::Disabled);
        if self.ready_observed
          && let Some(state) = session.apply(ButtonEvent::ReadySignal)
        {
          self.deps.surface.render(state, None);
        }
        self.publish(GatePhase::Exposed);
      }
    }
  }

  fn on_click(&mut self) {
    let Some(session) = self.session.as_mut() else {
      return;
    };
    let Some(state) = session.apply(ButtonEvent::Click) else {
      debug!(button = ?session.button, "controller: click ignored");
      return;
    };
    self.message = None;
    self.deps.surface.render(state, None);

    let generation = session.generation;
    let video_id = session.video_id.clone();
    let deps = Arc::clone(&self.deps);
    let cache = self.cache.clone();
    let events = self.events.clone();
    let merge_gap = self.merge_gap;
    tokio::spawn(async move {
      let outcome = download_subtitles(&deps, &cache, &video_id, merge_gap).await;
      let _ = events.send(ControllerEvent::DownloadFinished { generation, outcome });
    });
    self.publish(self.gate());
  }

  fn on_download_finished(&mut self, generation: u64, outcome: Result<DownloadReport, SubsError>) {
    if self.current_generation() != Some(generation) {
      debug!(generation, "controller: dropping download result for a closed session");
      return;
    }
    let Some(session) = self.session.as_mut() else {
      return;
    };

    let (event, message) = match outcome {
      Ok(report) => {
        info!(video_id = %session.video_id, filename = %report.filename, "controller: download complete");
        (ButtonEvent::Succeeded, report.message)
      }
      Err(e) => {
        if e.is_loggable() {
          error!(video_id = %session.video_id, err = %e, "controller: download failed");
        } else {
          info!(video_id = %session.video_id, "controller: {}", e);
        }
        (ButtonEvent::Failed, e.user_message())
      }
    };

    if let Some(state) = session.apply(event) {
      self.deps.surface.render(state, Some(&message));
      self.message = Some(message);
      if let Some(delay) = state.revert_after() {
        self.send_later(delay, ControllerEvent::RevertElapsed { generation });
      }
      self.publish(self.gate());
    }
  }

  fn on_revert(&mut self, generation: u64) {
    if self.current_generation() != Some(generation) {
      return;
    }
    if let Some(session) = self.session.as_mut()
      && let Some(state) = session.apply(ButtonEvent::RevertElapsed)
    {
      self.message = None;
      self.deps.surface.render(state, None);
      self.publish(self.gate());
    }
  }
}

/// Normalized entries plus where they came from.
struct Acquired {
  entries: Vec<SubtitleEntry>,
  language: String,
  is_auto_generated: bool,
}

/// A capture counts only if it normalizes to at least one entry.
fn from_payload(payload: &InterceptedPayload) -> Option<Acquired> {
  let entries = normalize(&payload.encoding_format, &payload.raw_content);
  if entries.is_empty() {
    debug!(video_id = %payload.video_id, lang = %payload.language_code, "controller: capture held no entries");
    return None;
  }
  Some(Acquired {
    entries,
    language: payload.language_code.clone(),
    is_auto_generated: payload.source_url.contains("kind=asr"),
  })
}

/// Cache, then a short wait for an in-flight capture, then an on-demand fetch.
/// Captures that yield no entries are treated as misses.
async fn acquire(
  deps: &Collaborators,
  cache: &CacheManager,
  video_id: &str,
  prefs: &Preferences,
) -> Result<Acquired, SubsError> {
  if let Some(hit) = cache.lookup(video_id, Some(&prefs.preferred_language))
    && let Some(acquired) = from_payload(hit.as_ref())
  {
    debug!(%video_id, lang = %acquired.language, "controller: cache hit");
    return Ok(acquired);
  }

  match cache.wait_for(video_id, &prefs.preferred_language, constants().capture_wait()).await {
    Ok(hit) => {
      if let Some(acquired) = from_payload(hit.as_ref()) {
        debug!(%video_id, "controller: capture arrived while waiting");
        return Ok(acquired);
      }
    }
    Err(e) => debug!(%video_id, err = %e, "controller: nothing captured, fetching on demand"),
  }

  let page = deps.page.current_state().ok_or_else(|| SubsError::ExtractionFailed("page metadata unavailable".into()))?;
  let tracks =
    deps.tracks.extract_available_tracks(&page).map_err(|e| SubsError::ExtractionFailed(format!("{:#}", e)))?;
  if tracks.is_empty() {
    return Err(SubsError::NoSubtitlesAvailable);
  }
  let track = select_track(&tracks, &prefs.preferred_language, &constants().fallback_language)
    .ok_or(SubsError::NoSubtitlesAvailable)?;

  let content = deps.fetcher.fetch_track(track).await.map_err(|e| {
    warn!(lang = %track.language_code, err = %e, "controller: on-demand fetch failed");
    SubsError::ExtractionFailed(e.to_string())
  })?;
  let format = extract_metadata(&with_event_format(&track.fetch_url)).format;
  let entries = normalize(&format, &content);
  if entries.is_empty() {
    return Err(SubsError::ExtractionFailed("track held no subtitle entries".into()));
  }

  Ok(Acquired { entries, language: track.language_code.clone(), is_auto_generated: track.is_auto_generated })
}

/// The body of the `loading` state.
pub async fn download_subtitles(
  deps: &Collaborators,
  cache: &CacheManager,
  video_id: &str,
  merge_gap: Option<f64>,
) -> Result<DownloadReport, SubsError> {
  let prefs = Preferences::resolve(deps.preferences.get_preferences());
  if !prefs.auto_download {
    debug!("controller: auto_download is off, downloading with stored preferences");
  }

  let acquired = acquire(deps, cache, video_id, &prefs).await?;
  let entries = match merge_gap {
    Some(gap) => merge_adjacent(&acquired.entries, gap),
    None => acquired.entries,
  };

  let details = deps.page.current_state().map(|page| page.video_details()).unwrap_or_default();
  let mut content = prefs.preferred_format.render(&entries);
  if prefs.include_description
    && let Some(description) = &details.description
  {
    content = format!("{}{}{}", description, DESCRIPTION_SEPARATOR, content);
  }

  let title = details.title.unwrap_or_else(|| video_id.to_string());
  let filename = suggest_filename(&title, prefs.preferred_format, &acquired.language);
  deps.downloads.request_save(&filename, &content).await.map_err(|e| match e {
    SubsError::DownloadFailed(_) => e,
    other => SubsError::DownloadFailed(other.to_string()),
  })?;

  Ok(DownloadReport {
    message: success_message(&acquired.language, acquired.is_auto_generated),
    filename,
    language: acquired.language,
    is_auto_generated: acquired.is_auto_generated,
  })
}

/// Extension-side listener: captures go straight into the cache, everything
/// else is forwarded to the controller.
pub fn spawn_message_pump(
  mut listener: MessageListener,
  cache: CacheManager,
  events: mpsc::UnboundedSender<ControllerEvent>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    while let Some(message) = listener.next().await {
      match message {
        PageMessage::Ready => {
          let _ = events.send(ControllerEvent::ReadySignal);
        }
        PageMessage::Captured { payload } => {
          let video_id = payload.video_id.clone();
          let language = payload.language_code.clone();
          cache.record_capture(payload);
          let _ = events.send(ControllerEvent::Captured { video_id, language });
        }
        PageMessage::Status { active, intercepted } => {
          info!(active, intercepted, "controller: interception status");
        }
        PageMessage::StatusRequest | PageMessage::Unknown => {}
      }
    }
    debug!("controller: page window closed");
  })
}

/// Turn location changes into navigation events.
pub fn spawn_navigation_watch(
  mut location: watch::Receiver<String>,
  events: mpsc::UnboundedSender<ControllerEvent>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    while location.changed().await.is_ok() {
      let url = location.borrow_and_update().clone();
      if url.is_empty() {
        continue;
      }
      if events.send(ControllerEvent::Navigated { url }).is_err() {
        break;
      }
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bridge::PageWindow;
  use crate::config::StoredPreferences;
  use crate::download::MemorySink;
  use crate::subtitle::OutputFormat;
  use crate::youtube::{PageState, PlayerResponseTracks, TrackDescriptor};
  use chrono::Utc;
  use futures::future::BoxFuture;
  use parking_lot::{Mutex, RwLock};
  use serde_json::json;
  use std::time::Duration;

  const EVENTS: &str = r#"{"events":[{"tStartMs":0,"dDurationMs":1500,"segs":[{"utf8":"hello"}]}]}"#;

  #[derive(Default)]
  struct FakePage(RwLock<Option<PageState>>);

  impl FakePage {
    fn show(&self, video_id: &str, tracks: &[(&str, bool)]) {
      let caption_tracks: Vec<_> = tracks
        .iter()
        .map(|(lang, auto)| {
          let mut track = json!({
            "languageCode": lang,
            "baseUrl": format!("https://www.youtube.com/api/timedtext?v={}&lang={}", video_id, lang),
          });
          if *auto {
            track["kind"] = json!("asr");
          }
          track
        })
        .collect();
      let player_response = json!({
        "videoDetails": {"title": format!("Video {}", video_id), "shortDescription": "About this video"},
        "captions": {"playerCaptionsTracklistRenderer": {"captionTracks": caption_tracks}},
      });
      *self.0.write() = Some(PageState {
        url: format!("https://www.youtube.com/watch?v={}", video_id),
        video_id: Some(video_id.to_string()),
        player_response: Some(player_response),
      });
    }
  }

  impl PageView for FakePage {
    fn current_state(&self) -> Option<PageState> {
      self.0.read().clone()
    }
  }

  /// Delegates to the real reader until `hide` is called.
  #[derive(Default)]
  struct HidingTracks(Mutex<bool>);

  impl TrackSource for HidingTracks {
    fn extract_available_tracks(&self, page: &PageState) -> anyhow::Result<Vec<TrackDescriptor>> {
      if *self.0.lock() {
        return Ok(Vec::new());
      }
      PlayerResponseTracks.extract_available_tracks(page)
    }
  }

  #[derive(Default)]
  struct FakeFetcher {
    body: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
  }

  impl TrackFetcher for FakeFetcher {
    fn fetch_track<'a>(&'a self, track: &'a TrackDescriptor) -> BoxFuture<'a, Result<String, SubsError>> {
      self.calls.lock().push(track.language_code.clone());
      let result = self.body.lock().clone().ok_or_else(|| SubsError::Transport("HTTP 403".into()));
      Box::pin(async move { result })
    }
  }

  struct FixedPrefs(StoredPreferences);

  impl PreferenceStore for FixedPrefs {
    fn get_preferences(&self) -> StoredPreferences {
      self.0.clone()
    }
  }

  #[derive(Debug, Clone, PartialEq, Eq)]
  enum SurfaceCall {
    Inject(String, ButtonState),
    Render(ButtonState),
    Remove,
  }

  #[derive(Default)]
  struct RecordingSurface(Mutex<Vec<SurfaceCall>>);

  impl ActionSurface for RecordingSurface {
    fn inject(&self, video_id: &str, state: ButtonState) {
      self.0.lock().push(SurfaceCall::Inject(video_id.to_string(), state));
    }

    fn render(&self, state: ButtonState, _message: Option<&str>) {
      self.0.lock().push(SurfaceCall::Render(state));
    }

    fn remove(&self) {
      self.0.lock().push(SurfaceCall::Remove);
    }
  }

  struct Harness {
    cache: CacheManager,
    page: Arc<FakePage>,
    tracks: Arc<HidingTracks>,
    fetcher: Arc<FakeFetcher>,
    sink: Arc<MemorySink>,
    surface: Arc<RecordingSurface>,
    events: mpsc::UnboundedSender<ControllerEvent>,
    snapshots: watch::Receiver<Snapshot>,
  }

  impl Harness {
    fn start(prefs: StoredPreferences) -> Self {
      let cache = CacheManager::default();
      let page = Arc::new(FakePage::default());
      let tracks = Arc::new(HidingTracks::default());
      let fetcher = Arc::new(FakeFetcher::default());
      let sink = Arc::new(MemorySink::default());
      let surface = Arc::new(RecordingSurface::default());
      let deps = Collaborators {
        page: page.clone(),
        tracks: tracks.clone(),
        fetcher: fetcher.clone(),
        downloads: sink.clone(),
        preferences: Arc::new(FixedPrefs(prefs)),
        surface: surface.clone(),
      };
      let (controller, rx) = SessionController::new(cache.clone(), deps);
      let events = controller.events();
      let snapshots = controller.snapshots();
      tokio::spawn(controller.run(rx));
      Self { cache, page, tracks, fetcher, sink, surface, events, snapshots }
    }

    fn send(&self, event: ControllerEvent) {
      self.events.send(event).unwrap();
    }

    fn navigate(&self, video_id: &str, tracks: &[(&str, bool)]) {
      self.page.show(video_id, tracks);
      self.send(ControllerEvent::Navigated { url: format!("https://www.youtube.com/watch?v={}", video_id) });
    }

    async fn until(&mut self, pred: impl Fn(&Snapshot) -> bool) -> Snapshot {
      loop {
        {
          let current = self.snapshots.borrow_and_update();
          if pred(&*current) {
            return (*current).clone();
          }
        }
        self.snapshots.changed().await.unwrap();
      }
    }

    async fn until_button(&mut self, state: ButtonState) -> Snapshot {
      self.until(|s| s.button == Some(state)).await
    }
  }

  fn capture(video_id: &str, lang: &str, extra_query: &str) -> InterceptedPayload {
    InterceptedPayload {
      source_url: format!("https://www.youtube.com/api/timedtext?v={}&lang={}{}&fmt=json3", video_id, lang, extra_query),
      raw_content: EVENTS.to_string(),
      video_id: video_id.to_string(),
      language_code: lang.to_string(),
      encoding_format: "json3".to_string(),
      captured_at: Utc::now(),
    }
  }

  #[test]
  fn success_messages() {
    assert_eq!(success_message("en", false), "Subtitles downloaded successfully!");
    assert_eq!(success_message("zh-Hans", false), "Subtitles downloaded successfully!");
    assert_eq!(success_message("de", true), "Subtitles downloaded successfully (de) (Auto-generated)!");
  }

  #[tokio::test(start_paused = true)]
  async fn gate_suppresses_video_without_tracks() {
    let mut h = Harness::start(StoredPreferences::default());
    h.navigate("abc", &[]);
    let snap = h.until(|s| s.gate != GatePhase::Pending).await;
    assert_eq!(snap.gate, GatePhase::Suppressed);
    assert_eq!(snap.button, None);
    assert!(h.surface.0.lock().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn button_waits_for_ready_signal() {
    let mut h = Harness::start(StoredPreferences::default());
    h.navigate("abc", &[("en", false)]);
    let snap = h.until(|s| s.gate == GatePhase::Exposed).await;
    assert_eq!(snap.button, Some(ButtonState::Disabled));

    h.send(ControllerEvent::ReadySignal);
    h.until_button(ButtonState::Ready).await;
    h.send(ControllerEvent::ReadySignal);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
      *h.surface.0.lock(),
      vec![SurfaceCall::Inject("abc".into(), ButtonState::Disabled), SurfaceCall::Render(ButtonState::Ready)]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn earlier_ready_signal_enables_on_injection() {
    let mut h = Harness::start(StoredPreferences::default());
    h.send(ControllerEvent::ReadySignal);
    h.navigate("abc", &[("en", false)]);
    let snap = h.until(|s| s.gate == GatePhase::Exposed).await;
    assert_eq!(snap.button, Some(ButtonState::Ready));
  }

  #[tokio::test(start_paused = true)]
  async fn downloads_from_cache_then_reverts() {
    let mut h = Harness::start(StoredPreferences::default());
    h.send(ControllerEvent::ReadySignal);
    h.navigate("abc", &[("zh-Hans", false)]);
    h.until_button(ButtonState::Ready).await;
    h.cache.record_capture(capture("abc", "zh-Hans", ""));

    h.send(ControllerEvent::Click);
    let snap = h.until_button(ButtonState::Success).await;
    assert_eq!(snap.message.as_deref(), Some("Subtitles downloaded successfully!"));
    assert!(h.fetcher.calls.lock().is_empty());

    let saved = h.sink.saved();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].0, "Video_abc_subtitles_zh-Hans.srt");
    assert_eq!(saved[0].1, "1\n00:00:00,000 --> 00:00:01,500\nhello\n");

    let snap = h.until_button(ButtonState::Ready).await;
    assert_eq!(snap.message, None);
  }

  #[tokio::test(start_paused = true)]
  async fn capture_arriving_during_wait_is_used() {
    let mut h = Harness::start(StoredPreferences { preferred_language: Some("en".into()), ..Default::default() });
    h.send(ControllerEvent::ReadySignal);
    h.navigate("abc", &[("en", false)]);
    h.until_button(ButtonState::Ready).await;

    h.send(ControllerEvent::Click);
    h.until_button(ButtonState::Loading).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.cache.pending_waiters(), 1);
    h.cache.record_capture(capture("abc", "en", ""));

    h.until_button(ButtonState::Success).await;
    assert!(h.fetcher.calls.lock().is_empty());
    assert_eq!(h.sink.saved()[0].0, "Video_abc_subtitles.srt");
  }

  #[tokio::test(start_paused = true)]
  async fn falls_back_to_on_demand_fetch() {
    let mut h = Harness::start(StoredPreferences::default());
    *h.fetcher.body.lock() = Some(EVENTS.to_string());
    h.send(ControllerEvent::ReadySignal);
    h.navigate("abc", &[("de", false), ("en", true)]);
    h.until_button(ButtonState::Ready).await;

    h.send(ControllerEvent::Click);
    let snap = h.until_button(ButtonState::Success).await;
    assert_eq!(*h.fetcher.calls.lock(), vec!["en".to_string()]);
    assert_eq!(snap.message.as_deref(), Some("Subtitles downloaded successfully (Auto-generated)!"));
    assert_eq!(h.cache.pending_waiters(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn capture_without_entries_falls_through_to_fetch() {
    let mut h = Harness::start(StoredPreferences { preferred_language: Some("en".into()), ..Default::default() });
    *h.fetcher.body.lock() = Some(EVENTS.to_string());
    h.send(ControllerEvent::ReadySignal);
    h.navigate("abc", &[("en", false)]);
    h.until_button(ButtonState::Ready).await;
    h.cache.record_capture(InterceptedPayload { raw_content: "{}".to_string(), ..capture("abc", "en", "") });

    h.send(ControllerEvent::Click);
    let snap = h.until(|s| matches!(s.button, Some(ButtonState::Success | ButtonState::Error))).await;
    assert_eq!(snap.button, Some(ButtonState::Success));
    assert_eq!(*h.fetcher.calls.lock(), vec!["en".to_string()]);
    assert_eq!(h.sink.saved()[0].1, "1\n00:00:00,000 --> 00:00:01,500\nhello\n");
  }

  #[tokio::test(start_paused = true)]
  async fn fetch_failure_shows_error_and_reverts() {
    let mut h = Harness::start(StoredPreferences::default());
    h.send(ControllerEvent::ReadySignal);
    h.navigate("abc", &[("en", false)]);
    h.until_button(ButtonState::Ready).await;

    h.send(ControllerEvent::Click);
    let snap = h.until_button(ButtonState::Error).await;
    assert_eq!(snap.message.as_deref(), Some("Failed to download subtitles. Please try again."));
    assert!(h.sink.saved().is_empty());
    h.until_button(ButtonState::Ready).await;
  }

  #[tokio::test(start_paused = true)]
  async fn no_tracks_at_download_time() {
    let mut h = Harness::start(StoredPreferences::default());
    h.send(ControllerEvent::ReadySignal);
    h.navigate("abc", &[("en", false)]);
    h.until_button(ButtonState::Ready).await;
    *h.tracks.0.lock() = true;

    h.send(ControllerEvent::Click);
    let snap = h.until_button(ButtonState::Error).await;
    assert_eq!(snap.message, Some(SubsError::NoSubtitlesAvailable.user_message()));
    assert!(h.fetcher.calls.lock().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn clicks_while_loading_are_dropped() {
    let mut h = Harness::start(StoredPreferences::default());
    *h.fetcher.body.lock() = Some(EVENTS.to_string());
    h.send(ControllerEvent::ReadySignal);
    h.navigate("abc", &[("en", false)]);
    h.until_button(ButtonState::Ready).await;

    h.send(ControllerEvent::Click);
    h.send(ControllerEvent::Click);
    h.send(ControllerEvent::Click);
    h.until_button(ButtonState::Success).await;
    assert_eq!(h.fetcher.calls.lock().len(), 1);
    assert_eq!(h.sink.saved().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn preferences_shape_the_file() {
    let mut h = Harness::start(StoredPreferences {
      preferred_language: Some("de".into()),
      preferred_format: Some(OutputFormat::Txt),
      include_description: Some(true),
      auto_download: Some(false),
    });
    h.send(ControllerEvent::ReadySignal);
    h.navigate("abc", &[("de", true)]);
    h.until_button(ButtonState::Ready).await;
    h.cache.record_capture(capture("abc", "de", "&kind=asr"));

    h.send(ControllerEvent::Click);
    let snap = h.until_button(ButtonState::Success).await;
    assert_eq!(snap.message.as_deref(), Some("Subtitles downloaded successfully (de) (Auto-generated)!"));

    let saved = h.sink.saved();
    assert_eq!(saved[0].0, "Video_abc_subtitles_de.txt");
    assert_eq!(saved[0].1, "About this video\n\n--- SUBTITLES ---\n\nhello");
  }

  #[tokio::test(start_paused = true)]
  async fn navigation_flushes_cache_and_tears_down() {
    let mut h = Harness::start(StoredPreferences::default());
    h.send(ControllerEvent::ReadySignal);
    h.navigate("abc", &[("en", false)]);
    h.until_button(ButtonState::Ready).await;
    h.cache.record_capture(capture("abc", "en", ""));

    h.navigate("xyz", &[("en", false)]);
    let snap = h.until(|s| s.video_id.as_deref() == Some("xyz")).await;
    assert_eq!(snap.button, None);
    assert!(h.cache.lookup("abc", Some("en")).is_none());
    assert!(h.surface.0.lock().contains(&SurfaceCall::Remove));

    let snap = h.until(|s| s.gate == GatePhase::Exposed).await;
    assert_eq!(snap.button, Some(ButtonState::Ready));
  }

  #[tokio::test(start_paused = true)]
  async fn same_video_navigation_keeps_the_session() {
    let mut h = Harness::start(StoredPreferences::default());
    h.navigate("abc", &[("en", false)]);
    let first = h.until(|s| s.gate == GatePhase::Exposed).await;
    h.cache.record_capture(capture("abc", "en", ""));

    h.send(ControllerEvent::Navigated { url: "https://www.youtube.com/watch?v=abc&t=30".into() });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.until(|_| true).await.generation, first.generation);
    assert!(h.cache.lookup("abc", Some("en")).is_some());
  }

  #[tokio::test]
  async fn pump_feeds_cache_and_controller() {
    let window = PageWindow::new();
    let cache = CacheManager::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    spawn_message_pump(window.subscribe(), cache.clone(), tx);

    window.post(&PageMessage::Ready);
    window.post(&PageMessage::Captured { payload: capture("abc", "en", "") });

    assert!(matches!(rx.recv().await, Some(ControllerEvent::ReadySignal)));
    match rx.recv().await {
      Some(ControllerEvent::Captured { video_id, language }) => {
        assert_eq!((video_id.as_str(), language.as_str()), ("abc", "en"));
      }
      other => panic!("unexpected {:?}", other),
    }
    assert!(cache.lookup("abc", Some("en")).is_some());
  }

  #[tokio::test]
  async fn navigation_watch_forwards_urls() {
    let (location, watcher) = watch::channel(String::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    spawn_navigation_watch(watcher, tx);

    location.send_replace("https://www.youtube.com/watch?v=abc".to_string());
    match rx.recv().await {
      Some(ControllerEvent::Navigated { url }) => assert!(url.ends_with("v=abc")),
      other => panic!("unexpected {:?}", other),
    }
  }
}
