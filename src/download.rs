use anyhow::{Context, Result};
use futures::future::BoxFuture;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::constants::constants;
use crate::error::SubsError;
use crate::subtitle::OutputFormat;

const UNSAFE_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Save collaborator: owns where and how the file lands.
pub trait DownloadSink: Send + Sync {
  fn request_save<'a>(&'a self, filename: &'a str, content: &'a str) -> BoxFuture<'a, Result<(), SubsError>>;
}

/// `{title}_subtitles{_lang}.{ext}`. Unsafe characters and whitespace runs become
/// `_`, the title is capped, and the suffix is left off for the default language.
pub fn suggest_filename(title: &str, format: OutputFormat, language: &str) -> String {
  let mut safe = String::with_capacity(title.len());
  let mut in_space = false;
  for c in title.trim().chars() {
    if c.is_whitespace() {
      if !in_space {
        safe.push('_');
      }
      in_space = true;
      continue;
    }
    in_space = false;
    safe.push(if UNSAFE_FILENAME_CHARS.contains(&c) || c.is_control() { '_' } else { c });
  }
  let mut safe: String = safe.chars().take(constants().filename_max_len).collect();
  if safe.is_empty() {
    safe.push_str("video");
  }

  let suffix =
    if language.is_empty() || language == constants().default_language { String::new() } else { format!("_{}", language) };
  format!("{}_subtitles{}.{}", safe, suffix, format.extension())
}

/// Writes into a directory: temp file first, then rename, so a partial file never
/// carries the final name.
#[derive(Debug, Clone)]
pub struct FileSaver {
  dir: PathBuf,
}

impl FileSaver {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }

  async fn write(&self, filename: &str, content: &str) -> Result<PathBuf> {
    tokio::fs::create_dir_all(&self.dir).await.context("Failed to create output directory")?;
    let path = self.dir.join(filename);
    let tmp_path = path.with_extension("part");

    let mut file = tokio::fs::File::create(&tmp_path).await.context("Failed to create subtitle file")?;
    file.write_all(content.as_bytes()).await.context("Error writing subtitle file")?;
    file.flush().await.context("Error flushing subtitle file")?;
    drop(file);

    tokio::fs::rename(&tmp_path, &path).await.context("Failed to finalize subtitle file")?;
    Ok(path)
  }
}

impl DownloadSink for FileSaver {
  fn request_save<'a>(&'a self, filename: &'a str, content: &'a str) -> BoxFuture<'a, Result<(), SubsError>> {
    Box::pin(async move {
      match self.write(filename, content).await {
        Ok(path) => {
          info!(path = %path.display(), bytes = content.len(), "download: saved");
          Ok(())
        }
        Err(e) => {
          warn!(err = %format!("{:#}", e), filename, "download: save failed");
          Err(SubsError::DownloadFailed(format!("{:#}", e)))
        }
      }
    })
  }
}

/// Keeps every save in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemorySink {
  saved: parking_lot::Mutex<Vec<(String, String)>>,
}

#[cfg(test)]
impl MemorySink {
  pub fn saved(&self) -> Vec<(String, String)> {
    self.saved.lock().clone()
  }
}

#[cfg(test)]
impl DownloadSink for MemorySink {
  fn request_save<'a>(&'a self, filename: &'a str, content: &'a str) -> BoxFuture<'a, Result<(), SubsError>> {
    self.saved.lock().push((filename.to_string(), content.to_string()));
    Box::pin(async { Ok(()) })
  }
}
