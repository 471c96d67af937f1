//! Receiver-side subtitle cache with TTL expiry and capture waiters.
//!
//! Entries are keyed `"{video_id}_{language}"` and timestamped on arrival with
//! the receiver's monotonic clock. A caller that needs a capture which has not
//! arrived yet registers a waiter; every waiter on a key is resolved by the next
//! capture for that key, rejected on invalidation, or drops itself on timeout.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::bridge::InterceptedPayload;
use crate::constants::constants;
use crate::error::SubsError;

pub fn cache_key(video_id: &str, language: &str) -> String {
  format!("{}_{}", video_id, language)
}

type WaitResult = Result<Arc<InterceptedPayload>, SubsError>;

struct CacheEntry {
  payload: Arc<InterceptedPayload>,
  stored_at: Instant,
}

struct PendingWaiter {
  registered_at: Instant,
  subscribers: Vec<(u64, oneshot::Sender<WaitResult>)>,
}

/// Single-owner cache state. Use [`CacheManager`] to share it.
pub struct SubtitleCache {
  ttl: Duration,
  entries: HashMap<String, CacheEntry>,
  waiters: HashMap<String, PendingWaiter>,
  next_subscriber: u64,
}

impl SubtitleCache {
  pub fn new(ttl: Duration) -> Self {
    Self { ttl, entries: HashMap::new(), waiters: HashMap::new(), next_subscriber: 0 }
  }

  /// Drop expired entries and waiters whose caller has gone away.
  fn sweep(&mut self) {
    let now = Instant::now();
    let ttl = self.ttl;
    let before = self.entries.len();
    self.entries.retain(|_, entry| now.duration_since(entry.stored_at) <= ttl);
    let purged = before - self.entries.len();
    if purged > 0 {
      debug!(purged, "cache: expired entries purged");
    }

    self.waiters.retain(|_, waiter| {
      waiter.subscribers.retain(|(_, tx)| !tx.is_closed());
      !waiter.subscribers.is_empty()
    });
  }

  /// Store a capture and resolve every waiter on its key.
  pub fn record_capture(&mut self, payload: InterceptedPayload) {
    self.sweep();
    let key = cache_key(&payload.video_id, &payload.language_code);
    let payload = Arc::new(payload);
    self.entries.insert(key.clone(), CacheEntry { payload: Arc::clone(&payload), stored_at: Instant::now() });

    if let Some(waiter) = self.waiters.remove(&key) {
      let waited = waiter.registered_at.elapsed();
      let count = waiter.subscribers.len();
      for (_, tx) in waiter.subscribers {
        let _ = tx.send(Ok(Arc::clone(&payload)));
      }
      debug!(%key, count, ?waited, "cache: resolved waiters");
    }
    info!(%key, entries = self.entries.len(), "cache: stored capture");
  }

  /// Exact key first, then any live entry for the video.
  ///
  /// Which entry wins the fallback when several languages are cached is not
  /// defined.
  pub fn lookup(&mut self, video_id: &str, language: Option<&str>) -> Option<Arc<InterceptedPayload>> {
    self.sweep();
    if let Some(lang) = language
      && let Some(entry) = self.entries.get(&cache_key(video_id, lang))
    {
      return Some(Arc::clone(&entry.payload));
    }
    self.entries.values().find(|entry| entry.payload.video_id == video_id).map(|entry| Arc::clone(&entry.payload))
  }

  /// Exact-key lookup only; used by waiters.
  fn get_exact(&mut self, key: &str) -> Option<Arc<InterceptedPayload>> {
    self.sweep();
    self.entries.get(key).map(|entry| Arc::clone(&entry.payload))
  }

  pub fn len(&mut self) -> usize {
    self.sweep();
    self.entries.len()
  }

  /// Number of callers currently waiting on any key.
  pub fn pending_waiters(&self) -> usize {
    self.waiters.values().map(|waiter| waiter.subscribers.len()).sum()
  }

  fn subscribe(&mut self, key: &str) -> (u64, oneshot::Receiver<WaitResult>) {
    let (tx, rx) = oneshot::channel();
    let id = self.next_subscriber;
    self.next_subscriber += 1;
    self
      .waiters
      .entry(key.to_string())
      .or_insert_with(|| PendingWaiter { registered_at: Instant::now(), subscribers: Vec::new() })
      .subscribers
      .push((id, tx));
    (id, rx)
  }

  fn unsubscribe(&mut self, key: &str, id: u64) {
    if let Some(waiter) = self.waiters.get_mut(key) {
      waiter.subscribers.retain(|(sub, _)| *sub != id);
      if waiter.subscribers.is_empty() {
        self.waiters.remove(key);
      }
    }
  }

  /// Flush every entry and reject every pending waiter.
  pub fn invalidate_all(&mut self) {
    let dropped = self.entries.len();
    self.entries.clear();
    let mut rejected = 0;
    for (key, waiter) in self.waiters.drain() {
      for (_, tx) in waiter.subscribers {
        let _ = tx.send(Err(SubsError::Invalidated { key: key.clone() }));
        rejected += 1;
      }
    }
    info!(dropped, rejected, "cache: invalidated");
  }
}

/// Shared handle to the cache. All mutation goes through one lock, so a capture
/// never races a waiter registration.
#[derive(Clone)]
pub struct CacheManager {
  inner: Arc<Mutex<SubtitleCache>>,
}

impl Default for CacheManager {
  fn default() -> Self {
    Self::new(constants().cache_ttl())
  }
}

impl CacheManager {
  pub fn new(ttl: Duration) -> Self {
    Self { inner: Arc::new(Mutex::new(SubtitleCache::new(ttl))) }
  }

  pub fn record_capture(&self, payload: InterceptedPayload) {
    self.inner.lock().record_capture(payload);
  }

  pub fn lookup(&self, video_id: &str, language: Option<&str>) -> Option<Arc<InterceptedPayload>> {
    self.inner.lock().lookup(video_id, language)
  }

  pub fn len(&self) -> usize {
    self.inner.lock().len()
  }

  pub fn pending_waiters(&self) -> usize {
    self.inner.lock().pending_waiters()
  }

  pub fn invalidate_all(&self) {
    self.inner.lock().invalidate_all();
  }

  /// Wait up to `timeout` for a capture with exactly this key.
  ///
  /// Returns at once on a hit. On timeout the waiter removes itself, so a
  /// later capture for the key resolves nothing.
  pub async fn wait_for(
    &self,
    video_id: &str,
    language: &str,
    timeout: Duration,
  ) -> Result<Arc<InterceptedPayload>, SubsError> {
    let key = cache_key(video_id, language);
    let (id, rx) = {
      let mut cache = self.inner.lock();
      if let Some(hit) = cache.get_exact(&key) {
        return Ok(hit);
      }
      cache.subscribe(&key)
    };
    debug!(%key, ?timeout, "cache: waiting for capture");

    match tokio::time::timeout(timeout, rx).await {
      Ok(Ok(result)) => result,
      Ok(Err(_)) => Err(SubsError::Invalidated { key }),
      Err(_) => {
        self.inner.lock().unsubscribe(&key, id);
        debug!(%key, "cache: wait timed out");
        Err(SubsError::Timeout { key })
      }
    }
  }
}
