use thiserror::Error;

/// Failure kinds that may cross a component boundary.
///
/// Raw transport and parse errors are converted into one of these before they
/// leave the component that saw them; nothing below this layer reaches the user.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubsError {
  /// Upstream payload could not be parsed. Recovered locally as an empty sequence.
  #[error("Malformed subtitle payload: {0}")]
  ParseFailure(String),

  /// The video has no subtitle track at all. Terminal, not retryable.
  #[error("No subtitles available for this video")]
  NoSubtitlesAvailable,

  /// A `wait_for` exceeded its deadline.
  #[error("Timed out waiting for subtitle capture: {key}")]
  Timeout { key: String },

  /// A pending wait was rejected because the cache was flushed (video navigation).
  #[error("Subtitle cache invalidated while waiting for {key}")]
  Invalidated { key: String },

  /// On-demand fetch or track selection failed after cache and wait both missed.
  #[error("Subtitle extraction failed: {0}")]
  ExtractionFailed(String),

  /// The save collaborator rejected the file.
  #[error("Download failed: {0}")]
  DownloadFailed(String),

  /// Network-level failure. Never shown to the user as-is.
  #[error("Transport error: {0}")]
  Transport(String),
}

impl SubsError {
  /// Short human-readable message for the action's `error` state.
  pub fn user_message(&self) -> String {
    match self {
      SubsError::NoSubtitlesAvailable => {
        "This video has no available subtitles (neither manual nor auto-generated).".to_string()
      }
      SubsError::DownloadFailed(msg) => format!("Download failed: {}", msg),
      SubsError::ExtractionFailed(_) | SubsError::ParseFailure(_) | SubsError::Transport(_) => {
        "Failed to download subtitles. Please try again.".to_string()
      }
      SubsError::Timeout { .. } | SubsError::Invalidated { .. } => {
        "Subtitles were not ready in time. Please try again.".to_string()
      }
    }
  }

  /// Whether this outcome should be logged as an error. `NoSubtitlesAvailable` is user-visible only.
  pub fn is_loggable(&self) -> bool {
    !matches!(self, SubsError::NoSubtitlesAvailable)
  }
}

impl From<reqwest::Error> for SubsError {
  fn from(e: reqwest::Error) -> Self {
    SubsError::Transport(e.to_string())
  }
}
