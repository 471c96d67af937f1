//! The host page: a single-page app that loads watch pages and caption tracks
//! through its own (patchable) network entry points.

use anyhow::{Context, Result, anyhow};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use reqwest::Client;
use reqwest::header::USER_AGENT;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::constants::constants;
use crate::error::SubsError;
use crate::intercept::{FetchApi, FetchInput, PageNetwork, PageRequest, PageResponse, RequestApi};
use crate::youtube::{PageState, PlayerResponseTracks, TrackSource, with_event_format};

/// Read-only view of the page for the session controller.
pub trait PageView: Send + Sync {
  fn current_state(&self) -> Option<PageState>;
}

/// The unpatched network: plain reqwest.
#[derive(Clone)]
pub struct HttpTransport {
  client: Client,
}

impl Default for HttpTransport {
  fn default() -> Self {
    Self::new(Client::new())
  }
}

impl HttpTransport {
  pub fn new(client: Client) -> Self {
    Self { client }
  }

  async fn execute(&self, request: PageRequest) -> Result<PageResponse, SubsError> {
    let mut builder =
      self.client.request(request.method, &request.url).header(USER_AGENT, constants().user_agent.as_str());
    if let Some(body) = request.body {
      builder = builder.body(body);
    }
    let response = builder.send().await?;
    let status = response.status().as_u16();
    let url = response.url().to_string();
    let body = response.bytes().await?;
    debug!(%url, status, len = body.len(), "page: response");
    Ok(PageResponse::new(url, status, body))
  }
}

impl FetchApi for HttpTransport {
  fn fetch(&self, input: FetchInput) -> BoxFuture<'_, Result<PageResponse, SubsError>> {
    let request = match input {
      FetchInput::Request(request) => request,
      other => PageRequest::get(other.url()),
    };
    Box::pin(self.execute(request))
  }
}

impl RequestApi for HttpTransport {
  fn send(&self, request: PageRequest) -> BoxFuture<'_, Result<PageResponse, SubsError>> {
    Box::pin(self.execute(request))
  }
}

pub struct HostPage {
  network: PageNetwork,
  state: RwLock<Option<PageState>>,
  location: watch::Sender<String>,
}

impl HostPage {
  pub fn new(network: PageNetwork) -> Self {
    let (location, _) = watch::channel(String::new());
    Self { network, state: RwLock::new(None), location }
  }

  pub fn network(&self) -> &PageNetwork {
    &self.network
  }

  /// Location changes, the way a navigation observer would see them.
  pub fn watch_location(&self) -> watch::Receiver<String> {
    self.location.subscribe()
  }

  /// Load a watch page in place: fetch its HTML, swap in its metadata, then
  /// move the location bar.
  pub async fn navigate(&self, url: &str) -> Result<PageState> {
    let response = self.network.fetch(url).await.with_context(|| format!("Failed to load {}", url))?;
    if !response.is_success() {
      return Err(anyhow!("Loading {} returned HTTP {}", url, response.status));
    }
    let page = PageState::from_html(url, &response.text());
    info!(url, video_id = ?page.video_id, "page: navigated");

    *self.state.write() = Some(page.clone());
    self.location.send_replace(url.to_string());
    Ok(page)
  }

  /// What the player does on its own once a video loads: request the first
  /// advertised caption track through the low-level request API.
  pub async fn play_captions(&self) -> Result<Option<PageResponse>> {
    let Some(page) = self.current_state() else {
      return Ok(None);
    };
    let tracks = match PlayerResponseTracks.extract_available_tracks(&page) {
      Ok(tracks) => tracks,
      Err(e) => {
        debug!(err = %e, "page: player has no caption data");
        return Ok(None);
      }
    };
    let Some(track) = tracks.first() else {
      return Ok(None);
    };

    let url = with_event_format(&track.fetch_url);
    debug!(lang = %track.language_code, "page: player loading captions");
    let response = self.network.send(PageRequest::get(url)).await.context("Caption request failed")?;
    Ok(Some(response))
  }
}

impl PageView for HostPage {
  fn current_state(&self) -> Option<PageState> {
    self.state.read().clone()
  }
}
