//! Timing, language and filename tunables from `constants.ron`.
//!
//! The file is embedded with `include_str!` and parsed on first access.

use serde::Deserialize;
use std::sync::LazyLock;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct Constants {
  // Cache
  pub cache_ttl_secs: u64,
  pub capture_wait_ms: u64,

  // Readiness handshake
  pub ready_resend_delay_ms: u64,

  // Button state machine
  pub success_revert_ms: u64,
  pub error_revert_ms: u64,
  pub navigation_settle_ms: u64,

  // Languages
  pub default_language: String,
  pub fallback_language: String,
  pub default_preferred_language: String,

  // Filenames
  pub filename_max_len: usize,

  /// Closed allowlist of URL fragments that mark a subtitle-bearing request.
  pub subtitle_markers: Vec<String>,

  pub user_agent: String,
}

impl Constants {
  pub fn cache_ttl(&self) -> Duration {
    Duration::from_secs(self.cache_ttl_secs)
  }

  pub fn capture_wait(&self) -> Duration {
    Duration::from_millis(self.capture_wait_ms)
  }

  pub fn ready_resend_delay(&self) -> Duration {
    Duration::from_millis(self.ready_resend_delay_ms)
  }

  pub fn success_revert(&self) -> Duration {
    Duration::from_millis(self.success_revert_ms)
  }

  pub fn error_revert(&self) -> Duration {
    Duration::from_millis(self.error_revert_ms)
  }

  pub fn navigation_settle(&self) -> Duration {
    Duration::from_millis(self.navigation_settle_ms)
  }
}

static CONSTANTS: LazyLock<Constants> = LazyLock::new(|| {
  // Safety: embedded at build time and parsed by the test below.
  ron::from_str(include_str!("../constants.ron")).expect("embedded constants.ron must parse")
});

/// Returns a reference to the parsed constants.
pub fn constants() -> &'static Constants {
  &CONSTANTS
}
