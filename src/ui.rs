use std::io::Write;
use tracing::debug;

use crate::session::ButtonState;

/// Where the download action lives. Placement and styling belong to the
/// implementation; the controller only says what to show.
pub trait ActionSurface: Send + Sync {
  fn inject(&self, video_id: &str, state: ButtonState);
  fn render(&self, state: ButtonState, message: Option<&str>);
  fn remove(&self);
}

fn glyph(state: ButtonState) -> &'static str {
  match state {
    ButtonState::Disabled => "…",
    ButtonState::Ready => "↓",
    ButtonState::Loading => "⟳",
    ButtonState::Success => "✓",
    ButtonState::Error => "✗",
  }
}

/// Prints one status line per change.
#[derive(Debug, Default)]
pub struct ConsoleSurface;

impl ConsoleSurface {
  fn line(&self, text: &str) {
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{}", text);
    let _ = out.flush();
  }
}

impl ActionSurface for ConsoleSurface {
  fn inject(&self, video_id: &str, state: ButtonState) {
    debug!(video_id, ?state, "ui: inject");
    self.line(&format!("[{}] {} {}", video_id, glyph(state), state.label()));
  }

  fn render(&self, state: ButtonState, message: Option<&str>) {
    debug!(?state, "ui: render");
    match message {
      Some(message) => self.line(&format!("  {} {}: {}", glyph(state), state.label(), message)),
      None => self.line(&format!("  {} {}", glyph(state), state.label())),
    }
  }

  fn remove(&self) {
    debug!("ui: remove");
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn every_state_has_a_distinct_glyph() {
    let states = [ButtonState::Disabled, ButtonState::Ready, ButtonState::Loading, ButtonState::Success, ButtonState::Error];
    let mut glyphs: Vec<_> = states.iter().map(|s| glyph(*s)).collect();
    glyphs.sort();
    glyphs.dedup();
    assert_eq!(glyphs.len(), states.len());
  }
}
