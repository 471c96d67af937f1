//! Page-context interception agent.
//!
//! The page reaches the network through two entry points held in a
//! [`PageNetwork`]: a fetch-style API and a lower-level request/response API.
//! [`InterceptionAgent::install`] swaps both for observing wrappers that call
//! through to the originals, hand the page its response untouched, and relay a
//! copy of every subtitle-bearing body across the [`PageWindow`].

use bytes::Bytes;
use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use reqwest::{Method, Url};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bridge::{InterceptedPayload, PageMessage, PageWindow};
use crate::constants::constants;
use crate::error::SubsError;

/// Sentinel for metadata that could not be read from a URL.
pub const UNKNOWN: &str = "unknown";

const RELATIVE_BASE: &str = "https://www.youtube.com/";

// --- Network primitives ---

/// A response as the page sees it. The body is reference-counted so a copy
/// can be read without consuming what the page receives.
#[derive(Debug, Clone)]
pub struct PageResponse {
  pub url: String,
  pub status: u16,
  body: Bytes,
}

impl PageResponse {
  pub fn new(url: impl Into<String>, status: u16, body: impl Into<Bytes>) -> Self {
    Self { url: url.into(), status, body: body.into() }
  }

  pub fn body(&self) -> &Bytes {
    &self.body
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// A request issued through the lower-level API: the URL is fixed when it is opened.
#[derive(Debug, Clone)]
pub struct PageRequest {
  pub method: Method,
  pub url: String,
  pub body: Option<Bytes>,
}

impl PageRequest {
  pub fn open(method: Method, url: impl Into<String>) -> Self {
    Self { method, url: url.into(), body: None }
  }

  pub fn get(url: impl Into<String>) -> Self {
    Self::open(Method::GET, url)
  }
}

/// The forms the fetch entry point accepts.
#[derive(Debug, Clone)]
pub enum FetchInput {
  Text(String),
  Parsed(Url),
  Request(PageRequest),
}

impl FetchInput {
  pub fn url(&self) -> String {
    match self {
      FetchInput::Text(s) => s.clone(),
      FetchInput::Parsed(u) => u.to_string(),
      FetchInput::Request(r) => r.url.clone(),
    }
  }
}

impl From<&str> for FetchInput {
  fn from(s: &str) -> Self {
    FetchInput::Text(s.to_string())
  }
}

impl From<String> for FetchInput {
  fn from(s: String) -> Self {
    FetchInput::Text(s)
  }
}

impl From<Url> for FetchInput {
  fn from(u: Url) -> Self {
    FetchInput::Parsed(u)
  }
}

impl From<PageRequest> for FetchInput {
  fn from(r: PageRequest) -> Self {
    FetchInput::Request(r)
  }
}

pub trait FetchApi: Send + Sync {
  fn fetch(&self, input: FetchInput) -> BoxFuture<'_, Result<PageResponse, SubsError>>;

  /// Marker checked before wrapping, so a second install never double-wraps.
  fn is_observed(&self) -> bool {
    false
  }
}

pub trait RequestApi: Send + Sync {
  fn send(&self, request: PageRequest) -> BoxFuture<'_, Result<PageResponse, SubsError>>;

  fn is_observed(&self) -> bool {
    false
  }
}

/// The page's replaceable network entry points.
#[derive(Clone)]
pub struct PageNetwork {
  fetch: Arc<RwLock<Arc<dyn FetchApi>>>,
  request: Arc<RwLock<Arc<dyn RequestApi>>>,
}

impl PageNetwork {
  pub fn new(fetch: Arc<dyn FetchApi>, request: Arc<dyn RequestApi>) -> Self {
    Self { fetch: Arc::new(RwLock::new(fetch)), request: Arc::new(RwLock::new(request)) }
  }

  pub fn fetch_api(&self) -> Arc<dyn FetchApi> {
    self.fetch.read().clone()
  }

  pub fn request_api(&self) -> Arc<dyn RequestApi> {
    self.request.read().clone()
  }

  pub async fn fetch(&self, input: impl Into<FetchInput>) -> Result<PageResponse, SubsError> {
    let api = self.fetch_api();
    api.fetch(input.into()).await
  }

  pub async fn send(&self, request: PageRequest) -> Result<PageResponse, SubsError> {
    let api = self.request_api();
    api.send(request).await
  }
}

// --- Recognition ---

/// True iff the URL contains any marker from the closed allowlist.
pub fn is_subtitle_bearing(url: &str) -> bool {
  constants().subtitle_markers.iter().any(|marker| url.contains(marker.as_str()))
}

/// Metadata read from a subtitle request's query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureMetadata {
  pub video_id: String,
  pub language: String,
  pub format: String,
}

impl Default for CaptureMetadata {
  fn default() -> Self {
    Self { video_id: UNKNOWN.to_string(), language: UNKNOWN.to_string(), format: UNKNOWN.to_string() }
  }
}

/// Read `v`, `lang`/`tlang` and `fmt`. Never fails: anything unreadable is [`UNKNOWN`].
/// Relative URLs are resolved against the site root, the way the page would.
pub fn extract_metadata(url: &str) -> CaptureMetadata {
  let parsed = Url::parse(url).or_else(|_| Url::parse(RELATIVE_BASE).and_then(|base| base.join(url)));
  let Ok(parsed) = parsed else {
    debug!(url, "intercept: unparseable URL, metadata unknown");
    return CaptureMetadata::default();
  };

  let param = |name: &str| -> Option<String> {
    parsed.query_pairs().find(|(k, v)| k == name && !v.is_empty()).map(|(_, v)| v.into_owned())
  };

  CaptureMetadata {
    video_id: param("v").unwrap_or_else(|| UNKNOWN.to_string()),
    language: param("lang").or_else(|| param("tlang")).unwrap_or_else(|| UNKNOWN.to_string()),
    format: param("fmt").unwrap_or_else(|| UNKNOWN.to_string()),
  }
}

// --- Relay ---

/// Shared by both wrappers: turns a recognized body into a `captured` message.
#[derive(Clone)]
struct CaptureRelay {
  window: PageWindow,
  intercepted: Arc<AtomicBool>,
}

impl CaptureRelay {
  fn relay(&self, url: &str, body: Bytes, via: &'static str) {
    let content = String::from_utf8_lossy(&body).into_owned();
    if content.is_empty() {
      info!(url, via, "intercept: subtitle response was empty, nothing to relay");
      return;
    }

    let meta = extract_metadata(url);
    info!(
      video_id = %meta.video_id,
      lang = %meta.language,
      fmt = %meta.format,
      len = content.len(),
      via,
      "intercept: captured subtitle response"
    );

    let payload = InterceptedPayload {
      source_url: url.to_string(),
      raw_content: content,
      video_id: meta.video_id,
      language_code: meta.language,
      encoding_format: meta.format,
      captured_at: Utc::now(),
    };
    self.window.post(&PageMessage::Captured { payload });
    self.intercepted.store(true, Ordering::Relaxed);
  }
}

struct ObservedFetch {
  inner: Arc<dyn FetchApi>,
  relay: CaptureRelay,
}

impl FetchApi for ObservedFetch {
  fn fetch(&self, input: FetchInput) -> BoxFuture<'_, Result<PageResponse, SubsError>> {
    Box::pin(async move {
      let url = input.url();
      let response = self.inner.fetch(input).await?;
      if is_subtitle_bearing(&url) {
        self.relay.relay(&url, response.body().clone(), "fetch");
      }
      Ok(response)
    })
  }

  fn is_observed(&self) -> bool {
    true
  }
}

struct ObservedRequest {
  inner: Arc<dyn RequestApi>,
  relay: CaptureRelay,
}

impl RequestApi for ObservedRequest {
  fn send(&self, request: PageRequest) -> BoxFuture<'_, Result<PageResponse, SubsError>> {
    Box::pin(async move {
      let url = request.url.clone();
      let watched = is_subtitle_bearing(&url);
      let response = self.inner.send(request).await?;
      // This API only reports on a completed 200 load.
      if watched && response.status == 200 {
        self.relay.relay(&url, response.body().clone(), "request");
      }
      Ok(response)
    })
  }

  fn is_observed(&self) -> bool {
    true
  }
}

// --- Agent ---

/// What an install call actually changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallOutcome {
  pub wrapped_fetch: bool,
  pub wrapped_requests: bool,
}

impl InstallOutcome {
  pub fn changed_anything(self) -> bool {
    self.wrapped_fetch || self.wrapped_requests
  }
}

pub struct InterceptionAgent {
  relay: CaptureRelay,
}

impl InterceptionAgent {
  pub fn new(window: PageWindow) -> Self {
    Self { relay: CaptureRelay { window, intercepted: Arc::new(AtomicBool::new(false)) } }
  }

  /// Whether any payload has been relayed so far.
  pub fn has_intercepted(&self) -> bool {
    self.relay.intercepted.load(Ordering::Relaxed)
  }

  /// Wrap `original` unless it is already an observing wrapper.
  pub fn observe_fetch(&self, original: Arc<dyn FetchApi>) -> Arc<dyn FetchApi> {
    if original.is_observed() {
      return original;
    }
    Arc::new(ObservedFetch { inner: original, relay: self.relay.clone() })
  }

  pub fn observe_requests(&self, original: Arc<dyn RequestApi>) -> Arc<dyn RequestApi> {
    if original.is_observed() {
      return original;
    }
    Arc::new(ObservedRequest { inner: original, relay: self.relay.clone() })
  }

  /// Patch both entry points, then announce readiness twice: once now and once
  /// after a short delay, for listeners that were not attached yet.
  pub fn install(&self, network: &PageNetwork) -> InstallOutcome {
    let wrapped_fetch = {
      let mut slot = network.fetch.write();
      let already = slot.is_observed();
      *slot = self.observe_fetch(slot.clone());
      !already
    };
    let wrapped_requests = {
      let mut slot = network.request.write();
      let already = slot.is_observed();
      *slot = self.observe_requests(slot.clone());
      !already
    };
    let outcome = InstallOutcome { wrapped_fetch, wrapped_requests };

    if outcome.changed_anything() {
      self.spawn_status_responder();
      info!(?outcome, "intercept: network entry points patched");
    } else {
      warn!("intercept: already installed on this page, not wrapping again");
    }

    self.announce_ready();
    outcome
  }

  fn announce_ready(&self) {
    let window = self.relay.window.clone();
    let listeners = window.post(&PageMessage::Ready);
    debug!(listeners, "intercept: ready signal sent");

    let delay = constants().ready_resend_delay();
    tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      let listeners = window.post(&PageMessage::Ready);
      debug!(listeners, "intercept: ready signal re-sent");
    });
  }

  /// Answer `status_request` posts for as long as the window lives. The task
  /// holds a weak handle, so it never keeps the window open by itself.
  fn spawn_status_responder(&self) -> JoinHandle<()> {
    let window = self.relay.window.downgrade();
    let intercepted = Arc::clone(&self.relay.intercepted);
    let mut listener = self.relay.window.subscribe();
    tokio::spawn(async move {
      while let Some(message) = listener.next().await {
        if message == PageMessage::StatusRequest
          && let Some(window) = window.upgrade()
        {
          let status = PageMessage::Status { active: true, intercepted: intercepted.load(Ordering::Relaxed) };
          window.post(&status);
        }
      }
      debug!("intercept: window closed, status responder stopped");
    })
  }
}
