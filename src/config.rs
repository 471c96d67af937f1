use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::subtitle::OutputFormat;

/// What the preference store holds. Every field is optional; defaults are
/// resolved by the session layer, not here.
#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct StoredPreferences {
  pub preferred_language: Option<String>,
  pub preferred_format: Option<OutputFormat>,
  pub include_description: Option<bool>,
  pub auto_download: Option<bool>,
}

fn prefs_path() -> Option<PathBuf> {
  ProjectDirs::from("", "", "subtap").map(|dirs| dirs.config_dir().join("prefs.toml"))
}

impl StoredPreferences {
  pub fn load_from(path: &Path) -> Self {
    if let Ok(content) = std::fs::read_to_string(path) {
      match toml::from_str(&content) {
        Ok(prefs) => return prefs,
        Err(e) => warn!(path = %path.display(), err = %e, "config: ignoring unreadable prefs file"),
      }
    }
    Self::default()
  }

  pub fn save_to(&self, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
      std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let content = toml::to_string(self).context("Failed to encode preferences")?;
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    debug!(path = %path.display(), "config: preferences saved");
    Ok(())
  }

  /// Fields set in `other` win.
  pub fn overlay(self, other: &StoredPreferences) -> Self {
    Self {
      preferred_language: other.preferred_language.clone().or(self.preferred_language),
      preferred_format: other.preferred_format.or(self.preferred_format),
      include_description: other.include_description.or(self.include_description),
      auto_download: other.auto_download.or(self.auto_download),
    }
  }
}

/// Preference collaborator consumed by the session controller.
pub trait PreferenceStore: Send + Sync {
  fn get_preferences(&self) -> StoredPreferences;
}

/// Reads `prefs.toml` on every call, then applies command-line overrides.
#[derive(Debug, Clone, Default)]
pub struct FilePreferenceStore {
  path: Option<PathBuf>,
  overrides: StoredPreferences,
}

impl FilePreferenceStore {
  pub fn new(overrides: StoredPreferences) -> Self {
    Self { path: prefs_path(), overrides }
  }

  #[cfg(test)]
  pub fn at(path: PathBuf, overrides: StoredPreferences) -> Self {
    Self { path: Some(path), overrides }
  }

  /// Persist the overrides on top of what is already stored.
  pub fn remember(&self) -> Result<()> {
    let path = self.path.as_deref().ok_or_else(|| anyhow!("No config directory for preferences"))?;
    StoredPreferences::load_from(path).overlay(&self.overrides).save_to(path)
  }
}

impl PreferenceStore for FilePreferenceStore {
  fn get_preferences(&self) -> StoredPreferences {
    let stored = self.path.as_deref().map(StoredPreferences::load_from).unwrap_or_default();
    stored.overlay(&self.overrides)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn missing_file_is_all_unset() {
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(StoredPreferences::load_from(&dir.path().join("prefs.toml")), StoredPreferences::default());
  }

  #[test]
  fn save_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("prefs.toml");
    let prefs = StoredPreferences {
      preferred_language: Some("de".to_string()),
      preferred_format: Some(OutputFormat::Txt),
      include_description: Some(true),
      auto_download: None,
    };
    prefs.save_to(&path).unwrap();
    assert_eq!(StoredPreferences::load_from(&path), prefs);
  }

  #[test]
  fn garbage_file_falls_back_to_default() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("prefs.toml");
    std::fs::write(&path, "preferred_format = 42").unwrap();
    assert_eq!(StoredPreferences::load_from(&path), StoredPreferences::default());
  }

  #[test]
  fn overrides_win_over_stored_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("prefs.toml");
    std::fs::write(&path, "preferred_language = \"ja\"\ninclude_description = true\n").unwrap();

    let store = FilePreferenceStore::at(
      path.clone(),
      StoredPreferences { preferred_language: Some("fr".to_string()), ..Default::default() },
    );
    let prefs = store.get_preferences();
    assert_eq!(prefs.preferred_language.as_deref(), Some("fr"));
    assert_eq!(prefs.include_description, Some(true));
    assert_eq!(prefs.preferred_format, None);

    store.remember().unwrap();
    assert_eq!(StoredPreferences::load_from(&path).preferred_language.as_deref(), Some("fr"));
  }

  #[test]
  fn remember_reports_write_failures() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, "").unwrap();

    let store = FilePreferenceStore::at(blocker.join("prefs.toml"), StoredPreferences::default());
    assert!(store.remember().is_err());
  }
}
