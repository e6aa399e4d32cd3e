//! Transient cache for in-progress and final turn images.
//!
//! Images are large, late-arriving, and need a pull-based "current best
//! image" query for polling clients, so they live here rather than in the
//! stream registry. Each update replaces the stored bytes (frames are
//! refined full images, not diffs) and recomputes a short content hash
//! that drives client-side "did the preview change" polling. When a turn
//! completes, the registered persistence callback fires exactly once in
//! the background; on success the entry is evicted, on failure it stays
//! cached for inspection until the sweep reclaims it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use fabula_domain::MessageId;

/// Sweep interval for abandoned entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum entry age regardless of completion state.
const MAX_ENTRY_AGE: Duration = Duration::from_secs(300);

/// Exactly-once persistence hook, called with the final bytes from a
/// background task.
pub type PersistFn =
    Arc<dyn Fn(MessageId, Vec<u8>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Cheap snapshot for polling clients.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatus {
    pub hash: String,
    pub is_complete: bool,
    pub has_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

struct ImageEntry {
    bytes: Vec<u8>,
    hash: String,
    is_complete: bool,
    error: Option<(String, String)>,
    created_at: Instant,
    /// Taken on completion so the callback can only ever fire once.
    persist: Option<PersistFn>,
}

/// Process-wide image cache, constructed once and injected.
pub struct ImageCache {
    entries: RwLock<HashMap<MessageId, ImageEntry>>,
    max_age: Duration,
}

impl Default for ImageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageCache {
    pub fn new() -> Self {
        Self::with_max_age(MAX_ENTRY_AGE)
    }

    pub fn with_max_age(max_age: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_age,
        }
    }

    /// Register an entry for a turn whose image generation is starting.
    pub async fn create(&self, message_id: MessageId, persist: PersistFn) {
        let entry = ImageEntry {
            bytes: Vec::new(),
            hash: String::new(),
            is_complete: false,
            error: None,
            created_at: Instant::now(),
            persist: Some(persist),
        };
        self.entries.write().await.insert(message_id, entry);
    }

    /// Replace the stored bytes and recompute the content hash.
    ///
    /// Returns the new hash, or `None` for an unknown message ID. When
    /// `is_complete` is set, the persistence callback (if still present)
    /// is invoked asynchronously with the final bytes; successful
    /// persistence evicts the entry.
    pub async fn update(
        self: &Arc<Self>,
        message_id: MessageId,
        bytes: Vec<u8>,
        is_complete: bool,
    ) -> Option<String> {
        let (hash, persist) = {
            let mut entries = self.entries.write().await;
            let entry = entries.get_mut(&message_id)?;
            entry.hash = content_hash(&bytes);
            entry.bytes = bytes.clone();
            entry.is_complete = is_complete;
            let persist = if is_complete {
                entry.persist.take()
            } else {
                None
            };
            (entry.hash.clone(), persist)
        };

        if let Some(persist) = persist {
            let cache = Arc::clone(self);
            tokio::spawn(async move {
                match persist(message_id, bytes).await {
                    Ok(()) => {
                        cache.evict(message_id).await;
                    }
                    Err(err) => {
                        // Entry stays cached for inspection; the sweep
                        // reclaims it eventually.
                        tracing::warn!(
                            message_id = %message_id,
                            "image persistence failed: {err:#}"
                        );
                    }
                }
            });
        }

        Some(hash)
    }

    /// Mark an entry failed without evicting it, so the frontend can
    /// still read the error.
    pub async fn set_error(&self, message_id: MessageId, code: &str, message: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(&message_id) {
            entry.error = Some((code.to_string(), message.to_string()));
        }
    }

    pub async fn status(&self, message_id: MessageId) -> Option<ImageStatus> {
        let entries = self.entries.read().await;
        entries.get(&message_id).map(|entry| ImageStatus {
            hash: entry.hash.clone(),
            is_complete: entry.is_complete,
            has_error: entry.error.is_some(),
            error_code: entry.error.as_ref().map(|(code, _)| code.clone()),
        })
    }

    /// Pull the current best image bytes and their hash.
    pub async fn image(&self, message_id: MessageId) -> Option<(Vec<u8>, String)> {
        let entries = self.entries.read().await;
        entries
            .get(&message_id)
            .filter(|entry| !entry.bytes.is_empty())
            .map(|entry| (entry.bytes.clone(), entry.hash.clone()))
    }

    pub async fn evict(&self, message_id: MessageId) -> bool {
        self.entries.write().await.remove(&message_id).is_some()
    }

    /// Remove entries older than the maximum age regardless of state;
    /// bounds memory for abandoned or crashed turns.
    pub async fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let max_age = self.max_age;
        entries.retain(|_, entry| entry.created_at.elapsed() < max_age);
        before - entries.len()
    }

    /// Periodic sweep task; spawn once at startup.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = self.cleanup_expired().await;
            if removed > 0 {
                tracing::debug!(removed, "image cache sweep evicted stale entries");
            }
        }
    }

    #[cfg(test)]
    async fn backdate(&self, message_id: MessageId, age: Duration) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(&message_id) {
            entry.created_at = Instant::now() - age;
        }
    }
}

/// First 8 bytes of a SHA-256 digest, hex-encoded. Full cryptographic
/// strength is unnecessary: the hash only answers "did the preview
/// change", not integrity.
fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop_persist() -> PersistFn {
        Arc::new(|_, _| Box::pin(async { Ok(()) }))
    }

    fn counting_persist(count: Arc<AtomicUsize>) -> PersistFn {
        Arc::new(move |_, _| {
            let count = count.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    fn failing_persist() -> PersistFn {
        Arc::new(|_, _| Box::pin(async { Err(anyhow::anyhow!("db down")) }))
    }

    async fn settle() {
        // Let the spawned persistence task run.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn hash_tracks_latest_bytes_while_incomplete() {
        let cache = Arc::new(ImageCache::new());
        let id = MessageId::new();
        cache.create(id, noop_persist()).await;

        let first = cache.update(id, vec![1, 2, 3], false).await.expect("hash");
        let second = cache.update(id, vec![4, 5, 6], false).await.expect("hash");
        assert_ne!(first, second);
        assert_eq!(second, content_hash(&[4, 5, 6]));

        let status = cache.status(id).await.expect("status");
        assert!(!status.is_complete);
        assert!(!status.has_error);
        assert_eq!(status.hash, second);
    }

    #[tokio::test]
    async fn completion_persists_once_and_evicts() {
        let cache = Arc::new(ImageCache::new());
        let count = Arc::new(AtomicUsize::new(0));
        let id = MessageId::new();
        cache.create(id, counting_persist(count.clone())).await;

        cache.update(id, vec![1], false).await;
        cache.update(id, vec![1, 2], false).await;
        cache.update(id, vec![1, 2, 3], true).await;
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(cache.status(id).await.is_none());
    }

    #[tokio::test]
    async fn failed_persistence_keeps_the_entry() {
        let cache = Arc::new(ImageCache::new());
        let id = MessageId::new();
        cache.create(id, failing_persist()).await;

        cache.update(id, vec![9, 9], true).await;
        settle().await;

        let status = cache.status(id).await.expect("entry retained");
        assert!(status.is_complete);
        // The callback is consumed either way: a second complete update
        // cannot fire it again.
        cache.update(id, vec![9, 9], true).await;
        settle().await;
        assert!(cache.status(id).await.is_some());
    }

    #[tokio::test]
    async fn set_error_is_readable_and_does_not_evict() {
        let cache = Arc::new(ImageCache::new());
        let id = MessageId::new();
        cache.create(id, noop_persist()).await;
        cache.set_error(id, "content_filtered", "prompt rejected").await;

        let status = cache.status(id).await.expect("status");
        assert!(status.has_error);
        assert_eq!(status.error_code.as_deref(), Some("content_filtered"));
    }

    #[tokio::test]
    async fn sweep_evicts_old_entries_even_if_incomplete() {
        let cache = Arc::new(ImageCache::with_max_age(Duration::from_secs(60)));
        let id = MessageId::new();
        cache.create(id, noop_persist()).await;
        cache.update(id, vec![1], false).await;
        cache.backdate(id, Duration::from_secs(61)).await;

        assert_eq!(cache.cleanup_expired().await, 1);
        assert!(cache.status(id).await.is_none());
    }

    #[tokio::test]
    async fn image_pull_returns_current_best_bytes() {
        let cache = Arc::new(ImageCache::new());
        let id = MessageId::new();
        cache.create(id, noop_persist()).await;
        assert!(cache.image(id).await.is_none());

        cache.update(id, vec![7, 7, 7], false).await;
        let (bytes, hash) = cache.image(id).await.expect("image");
        assert_eq!(bytes, vec![7, 7, 7]);
        assert_eq!(hash, content_hash(&[7, 7, 7]));
    }

    #[tokio::test]
    async fn update_unknown_message_is_not_found() {
        let cache = Arc::new(ImageCache::new());
        assert!(cache.update(MessageId::new(), vec![1], false).await.is_none());
    }
}
