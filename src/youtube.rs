use anyhow::{Context, Result, anyhow};
use futures::future::BoxFuture;
use reqwest::Client;
use reqwest::header::{REFERER, USER_AGENT};
use serde_json::Value;
use tracing::debug;

use crate::constants::constants;
use crate::error::SubsError;

const PLAYER_RESPONSE_MARKER: &str = "ytInitialPlayerResponse";
const CAPTION_TRACKS_POINTER: &str = "/captions/playerCaptionsTracklistRenderer/captionTracks";

/// Extract the video ID from a watch URL (`?v=` / `&v=`) or a `youtu.be/<id>` short link.
pub fn extract_video_id(url: &str) -> Option<String> {
  let until_delim = |s: &str| -> String { s.split(['&', '#', '?', '/']).next().unwrap_or_default().to_string() };

  for marker in ["?v=", "&v="] {
    if let Some(idx) = url.find(marker) {
      let id = until_delim(&url[idx + marker.len()..]);
      if !id.is_empty() {
        return Some(id);
      }
    }
  }

  if let Some(idx) = url.find("youtu.be/") {
    let id = until_delim(&url[idx + "youtu.be/".len()..]);
    if !id.is_empty() {
      return Some(id);
    }
  }
  None
}

/// Locate `ytInitialPlayerResponse = {...}` in a watch page and parse the object.
///
/// Only the first JSON value after the assignment is read; whatever script
/// follows it is ignored.
pub fn extract_player_response(html: &str) -> Result<Value> {
  let start = html.find(PLAYER_RESPONSE_MARKER).ok_or_else(|| anyhow!("No ytInitialPlayerResponse in page"))?;
  let after = &html[start + PLAYER_RESPONSE_MARKER.len()..];
  let eq = after.find('=').ok_or_else(|| anyhow!("ytInitialPlayerResponse is not assigned"))?;
  let json = after[eq + 1..].trim_start();

  let mut values = serde_json::Deserializer::from_str(json).into_iter::<Value>();
  let value = values
    .next()
    .ok_or_else(|| anyhow!("ytInitialPlayerResponse assignment is empty"))?
    .context("Failed to parse ytInitialPlayerResponse JSON")?;
  if !value.is_object() {
    return Err(anyhow!("ytInitialPlayerResponse is not an object"));
  }
  Ok(value)
}

/// Title and description from `videoDetails`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoDetails {
  pub title: Option<String>,
  pub description: Option<String>,
}

/// What the page exposes about the current video without any network call.
#[derive(Debug, Clone)]
pub struct PageState {
  pub url: String,
  pub video_id: Option<String>,
  pub player_response: Option<Value>,
}

impl PageState {
  /// Build from the watch page HTML. A page without player data still yields a
  /// state; the gate treats the missing metadata as "no tracks".
  pub fn from_html(url: &str, html: &str) -> Self {
    let player_response = match extract_player_response(html) {
      Ok(value) => Some(value),
      Err(e) => {
        debug!(url, err = %e, "youtube: no usable player response");
        None
      }
    };
    Self { url: url.to_string(), video_id: extract_video_id(url), player_response }
  }

  pub fn video_details(&self) -> VideoDetails {
    let field = |name: &str| -> Option<String> {
      self
        .player_response
        .as_ref()
        .and_then(|pr| pr.pointer(&format!("/videoDetails/{}", name)))
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.trim().is_empty())
    };
    VideoDetails { title: field("title"), description: field("shortDescription").or_else(|| field("description")) }
  }
}

/// One caption track the page advertises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackDescriptor {
  pub language_code: String,
  pub is_auto_generated: bool,
  pub fetch_url: String,
}

/// Page-metadata collaborator: which tracks does this page offer?
pub trait TrackSource: Send + Sync {
  fn extract_available_tracks(&self, page: &PageState) -> Result<Vec<TrackDescriptor>>;
}

/// Reads `captionTracks` out of the embedded player response.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlayerResponseTracks;

impl TrackSource for PlayerResponseTracks {
  fn extract_available_tracks(&self, page: &PageState) -> Result<Vec<TrackDescriptor>> {
    let player_response = page.player_response.as_ref().ok_or_else(|| anyhow!("Page has no player response"))?;

    let Some(tracks) = player_response.pointer(CAPTION_TRACKS_POINTER) else {
      return Ok(Vec::new());
    };
    let tracks = tracks.as_array().ok_or_else(|| anyhow!("captionTracks is not an array"))?;

    Ok(
      tracks
        .iter()
        .filter_map(|track| {
          let language_code = track.get("languageCode")?.as_str()?.to_string();
          let fetch_url = track.get("baseUrl")?.as_str()?.to_string();
          let is_auto_generated = track.get("kind").and_then(Value::as_str) == Some("asr");
          Some(TrackDescriptor { language_code, is_auto_generated, fetch_url })
        })
        .collect(),
    )
  }
}

/// Priority: preferred language, then the fallback language, then anything.
/// Within a language a manual track beats an auto-generated one.
pub fn select_track<'a>(
  tracks: &'a [TrackDescriptor],
  preferred: &str,
  fallback: &str,
) -> Option<&'a TrackDescriptor> {
  let best_for = |lang: &str| -> Option<&'a TrackDescriptor> {
    let mut matching = tracks.iter().filter(|t| t.language_code == lang);
    let first = matching.clone().find(|t| !t.is_auto_generated);
    first.or_else(|| matching.next())
  };
  best_for(preferred)
    .or_else(|| best_for(fallback))
    .or_else(|| tracks.iter().find(|t| !t.is_auto_generated))
    .or_else(|| tracks.first())
}

/// Ensure the track URL asks for the event format.
pub fn with_event_format(fetch_url: &str) -> String {
  if fetch_url.contains("fmt=") {
    return fetch_url.to_string();
  }
  let joiner = if fetch_url.contains('?') { '&' } else { '?' };
  format!("{}{}fmt=json3", fetch_url, joiner)
}

/// On-demand track fetcher used when nothing was intercepted in time.
pub trait TrackFetcher: Send + Sync {
  fn fetch_track<'a>(&'a self, track: &'a TrackDescriptor) -> BoxFuture<'a, std::result::Result<String, SubsError>>;
}

/// Fetches tracks straight from the provider, outside the page.
#[derive(Clone)]
pub struct HttpTrackFetcher {
  client: Client,
}

impl Default for HttpTrackFetcher {
  fn default() -> Self {
    Self::new(Client::new())
  }
}

impl HttpTrackFetcher {
  pub fn new(client: Client) -> Self {
    Self { client }
  }
}

impl TrackFetcher for HttpTrackFetcher {
  fn fetch_track<'a>(&'a self, track: &'a TrackDescriptor) -> BoxFuture<'a, std::result::Result<String, SubsError>> {
    Box::pin(async move {
      let url = with_event_format(&track.fetch_url);
      debug!(lang = %track.language_code, %url, "youtube: fetching track on demand");
      let response = self
        .client
        .get(&url)
        .header(USER_AGENT, constants().user_agent.as_str())
        .header(REFERER, "https://www.youtube.com/")
        .send()
        .await?;
      if !response.status().is_success() {
        return Err(SubsError::Transport(format!("track fetch returned HTTP {}", response.status())));
      }
      Ok(response.text().await?)
    })
  }
}
