//! Per-video session state: the download button's state machine, the decision
//! gate, and resolved user preferences.
//!
//! Everything here is pure. Timers, UI and I/O live in the controller.

use std::time::Duration;
use tracing::{debug, info};

use crate::config::StoredPreferences;
use crate::constants::constants;
use crate::subtitle::OutputFormat;
use crate::youtube::{PageState, TrackDescriptor, TrackSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonState {
  Disabled,
  Ready,
  Loading,
  Success,
  Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEvent {
  /// The interception layer announced itself.
  ReadySignal,
  Click,
  Succeeded,
  Failed,
  /// A success/error display delay ran out.
  RevertElapsed,
}

/// The whole state machine. Any pair not listed leaves the state unchanged,
/// which is how clicks outside `Ready` and duplicate ready signals are ignored.
pub fn transition(state: ButtonState, event: ButtonEvent) -> ButtonState {
  use ButtonEvent as E;
  use ButtonState as S;
  match (state, event) {
    (S::Disabled, E::ReadySignal) => S::Ready,
    (S::Ready, E::Click) => S::Loading,
    (S::Loading, E::Succeeded) => S::Success,
    (S::Loading, E::Failed) => S::Error,
    (S::Success | S::Error, E::RevertElapsed) => S::Ready,
    (state, _) => state,
  }
}

impl ButtonState {
  /// How long this state is shown before reverting to `Ready`, if it reverts at all.
  pub fn revert_after(self) -> Option<Duration> {
    match self {
      ButtonState::Success => Some(constants().success_revert()),
      ButtonState::Error => Some(constants().error_revert()),
      _ => None,
    }
  }

  pub fn label(self) -> &'static str {
    match self {
      ButtonState::Disabled => "Waiting for player...",
      ButtonState::Ready => "Download subtitles",
      ButtonState::Loading => "Downloading...",
      ButtonState::Success => "Downloaded",
      ButtonState::Error => "Download failed",
    }
  }
}

/// One page-navigation's worth of state. Replaced, never reset, on navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
  pub video_id: String,
  /// `None` until the gate injects the button, and forever if it suppresses it.
  pub button: Option<ButtonState>,
  /// Distinguishes timers scheduled by this session from those of earlier ones.
  pub generation: u64,
}

impl Session {
  pub fn new(video_id: impl Into<String>, generation: u64) -> Self {
    Self { video_id: video_id.into(), button: None, generation }
  }

  /// Feed an event to the button, if there is one. Returns the new state when it changed.
  pub fn apply(&mut self, event: ButtonEvent) -> Option<ButtonState> {
    let current = self.button?;
    let next = transition(current, event);
    if next == current {
      debug!(video_id = %self.video_id, ?current, ?event, "session: event ignored");
      return None;
    }
    self.button = Some(next);
    Some(next)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
  Expose { tracks: Vec<TrackDescriptor> },
  Suppress(String),
}

/// Fail-closed check: only a page that demonstrably advertises a track gets a button.
pub fn decision_gate(source: &dyn TrackSource, page: Option<&PageState>) -> GateDecision {
  let Some(page) = page else {
    return GateDecision::Suppress("page metadata not available".to_string());
  };
  match source.extract_available_tracks(page) {
    Ok(tracks) if !tracks.is_empty() => {
      info!(video_id = ?page.video_id, tracks = tracks.len(), "session: gate open");
      GateDecision::Expose { tracks }
    }
    Ok(_) => GateDecision::Suppress("no subtitle tracks advertised".to_string()),
    Err(e) => GateDecision::Suppress(format!("track inspection failed: {:#}", e)),
  }
}

/// Preferences with every default filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preferences {
  pub preferred_language: String,
  pub preferred_format: OutputFormat,
  pub include_description: bool,
  pub auto_download: bool,
}

impl Preferences {
  pub fn resolve(stored: StoredPreferences) -> Self {
    Self {
      preferred_language: stored
        .preferred_language
        .filter(|lang| !lang.trim().is_empty())
        .unwrap_or_else(|| constants().default_preferred_language.clone()),
      preferred_format: stored.preferred_format.unwrap_or_default(),
      include_description: stored.include_description.unwrap_or(false),
      auto_download: stored.auto_download.unwrap_or(true),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use anyhow::anyhow;
  use serde_json::json;

  use ButtonEvent as E;
  use ButtonState as S;

  const ALL_STATES: [ButtonState; 5] = [S::Disabled, S::Ready, S::Loading, S::Success, S::Error];

  struct FixedTracks(anyhow::Result<Vec<TrackDescriptor>>);

  impl TrackSource for FixedTracks {
    fn extract_available_tracks(&self, _page: &PageState) -> anyhow::Result<Vec<TrackDescriptor>> {
      match &self.0 {
        Ok(tracks) => Ok(tracks.clone()),
        Err(e) => Err(anyhow!("{}", e)),
      }
    }
  }

  fn page() -> PageState {
    PageState {
      url: "https://www.youtube.com/watch?v=abc".into(),
      video_id: Some("abc".into()),
      player_response: Some(json!({})),
    }
  }

  fn en_track() -> TrackDescriptor {
    TrackDescriptor { language_code: "en".into(), is_auto_generated: false, fetch_url: "https://x.test/en".into() }
  }

  #[test]
  fn happy_path() {
    let mut state = S::Disabled;
    for (event, expected) in
      [(E::ReadySignal, S::Ready), (E::Click, S::Loading), (E::Succeeded, S::Success), (E::RevertElapsed, S::Ready)]
    {
      state = transition(state, event);
      assert_eq!(state, expected);
    }
  }

  #[test]
  fn failure_reverts_to_ready() {
    assert_eq!(transition(S::Loading, E::Failed), S::Error);
    assert_eq!(transition(S::Error, E::RevertElapsed), S::Ready);
  }

  #[test]
  fn clicks_outside_ready_are_ignored() {
    for state in ALL_STATES.into_iter().filter(|s| *s != S::Ready) {
      assert_eq!(transition(state, E::Click), state);
    }
  }

  #[test]
  fn ready_signal_is_idempotent() {
    for state in ALL_STATES.into_iter().filter(|s| *s != S::Disabled) {
      assert_eq!(transition(state, E::ReadySignal), state);
    }
  }

  #[test]
  fn revert_delays() {
    assert_eq!(S::Success.revert_after(), Some(Duration::from_secs(2)));
    assert_eq!(S::Error.revert_after(), Some(Duration::from_secs(3)));
    assert_eq!(S::Ready.revert_after(), None);
  }

  #[test]
  fn session_without_button_ignores_events() {
    let mut session = Session::new("abc", 1);
    assert_eq!(session.apply(E::ReadySignal), None);
    assert_eq!(session.button, None);

    session.button = Some(S::Disabled);
    assert_eq!(session.apply(E::ReadySignal), Some(S::Ready));
    assert_eq!(session.apply(E::ReadySignal), None);
  }

  #[test]
  fn gate_opens_with_one_track() {
    let decision = decision_gate(&FixedTracks(Ok(vec![en_track()])), Some(&page()));
    assert_eq!(decision, GateDecision::Expose { tracks: vec![en_track()] });
  }

  #[test]
  fn gate_fails_closed() {
    assert!(matches!(decision_gate(&FixedTracks(Ok(vec![])), Some(&page())), GateDecision::Suppress(_)));
    assert!(matches!(decision_gate(&FixedTracks(Err(anyhow!("boom"))), Some(&page())), GateDecision::Suppress(_)));
    assert!(matches!(decision_gate(&FixedTracks(Ok(vec![en_track()])), None), GateDecision::Suppress(_)));
  }

  #[test]
  fn preference_defaults() {
    let prefs = Preferences::resolve(StoredPreferences::default());
    assert_eq!(prefs.preferred_language, "zh-Hans");
    assert_eq!(prefs.preferred_format, OutputFormat::Srt);
    assert!(!prefs.include_description);
    assert!(prefs.auto_download);
  }

  #[test]
  fn stored_preferences_are_kept() {
    let prefs = Preferences::resolve(StoredPreferences {
      preferred_language: Some("de".into()),
      preferred_format: Some(OutputFormat::Txt),
      include_description: Some(true),
      auto_download: Some(false),
    });
    assert_eq!(prefs.preferred_language, "de");
    assert_eq!(prefs.preferred_format, OutputFormat::Txt);
    assert!(prefs.include_description);
    assert!(!prefs.auto_download);
  }
}
