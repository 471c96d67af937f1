//! Cross-context message channel between the page context and the extension context.
//!
//! Modeled on `window.postMessage`: every listener attached to the window sees
//! every post (its own included), a listener that subscribes after a post never
//! sees it, and nothing is acknowledged. Handlers on both sides must therefore be
//! idempotent and tolerate duplicates, gaps, and foreign traffic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Identity of the page (window) a message was posted from.
pub type PageId = Uuid;

const WINDOW_CAPACITY: usize = 256;

/// One recognized subtitle response, captured exactly once and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptedPayload {
  pub source_url: String,
  pub raw_content: String,
  pub video_id: String,
  pub language_code: String,
  pub encoding_format: String,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub captured_at: DateTime<Utc>,
}

/// Message body. Unknown `kind` values decode to [`PageMessage::Unknown`] and are dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageMessage {
  /// The interception layer finished installing.
  Ready,
  Captured {
    payload: InterceptedPayload,
  },
  StatusRequest,
  Status {
    active: bool,
    intercepted: bool,
  },
  #[serde(other)]
  Unknown,
}

/// What actually travels over the window: the sender's page id plus an untyped body.
#[derive(Debug, Clone)]
pub struct Envelope {
  pub source: PageId,
  pub data: serde_json::Value,
}

/// A page window that both contexts can post to and listen on.
#[derive(Clone)]
pub struct PageWindow {
  id: PageId,
  tx: broadcast::Sender<Envelope>,
}

impl Default for PageWindow {
  fn default() -> Self {
    Self::new()
  }
}

impl PageWindow {
  pub fn new() -> Self {
    let (tx, _) = broadcast::channel(WINDOW_CAPACITY);
    Self { id: Uuid::new_v4(), tx }
  }

  /// A handle that can still post but does not keep the window open.
  pub fn downgrade(&self) -> WeakPageWindow {
    WeakPageWindow { id: self.id, tx: self.tx.downgrade() }
  }

  /// Fire-and-forget post from this page. Returns how many listeners were attached.
  pub fn post(&self, message: &PageMessage) -> usize {
    match serde_json::to_value(message) {
      Ok(data) => self.post_raw(self.id, data),
      Err(e) => {
        warn!(err = %e, "bridge: failed to encode message, dropped");
        0
      }
    }
  }

  /// Post an arbitrary body claiming an arbitrary origin (frames, other extensions, tests).
  pub fn post_raw(&self, source: PageId, data: serde_json::Value) -> usize {
    // No attached listener is not an error: the post is simply lost.
    self.tx.send(Envelope { source, data }).unwrap_or(0)
  }

  /// Attach a listener. It only sees posts made after this call.
  pub fn subscribe(&self) -> MessageListener {
    MessageListener { page: self.id, rx: self.tx.subscribe() }
  }
}

pub struct WeakPageWindow {
  id: PageId,
  tx: broadcast::WeakSender<Envelope>,
}

impl WeakPageWindow {
  /// `None` once every strong handle is gone.
  pub fn upgrade(&self) -> Option<PageWindow> {
    self.tx.upgrade().map(|tx| PageWindow { id: self.id, tx })
  }
}

/// Decode an envelope for a listener on `page`.
///
/// Foreign origins, undecodable bodies, and unknown kinds all yield `None`.
pub fn accept(page: PageId, envelope: Envelope) -> Option<PageMessage> {
  if envelope.source != page {
    debug!(source = %envelope.source, "bridge: ignoring message from another origin");
    return None;
  }
  match serde_json::from_value::<PageMessage>(envelope.data) {
    Ok(PageMessage::Unknown) => None,
    Ok(message) => Some(message),
    Err(e) => {
      debug!(err = %e, "bridge: ignoring undecodable message");
      None
    }
  }
}

pub struct MessageListener {
  page: PageId,
  rx: broadcast::Receiver<Envelope>,
}

impl MessageListener {
  /// Next accepted message, or `None` once the window is gone.
  pub async fn next(&mut self) -> Option<PageMessage> {
    loop {
      match self.rx.recv().await {
        Ok(envelope) => {
          if let Some(message) = accept(self.page, envelope) {
            return Some(message);
          }
        }
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          warn!(skipped, "bridge: listener lagged, messages lost");
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }
}
