//! Per-turn chunk stream registry.
//!
//! Maps a message ID to a bounded, single-reader channel of [`Chunk`]s.
//! Multiple phase tasks write into the same handle; exactly one HTTP
//! consumer drains it. Sends never block: a full buffer drops the chunk,
//! favoring forward progress over guaranteed delivery of intermediate
//! fragments. Entries self-expire after a fixed ceiling so an abandoned
//! turn can never leak.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};

use fabula_domain::{Chunk, MessageId};

/// Buffered chunks per in-flight turn; sized to absorb a producer burst.
const STREAM_BUFFER_SIZE: usize = 100;

/// Ceiling on how long an entry may exist, read or not.
const STREAM_TIMEOUT: Duration = Duration::from_secs(300);

/// Producer-side handle for one turn's stream.
#[derive(Clone)]
pub struct StreamHandle {
    message_id: MessageId,
    tx: mpsc::Sender<Chunk>,
    dropped: Arc<AtomicU64>,
}

impl StreamHandle {
    /// Send a chunk without blocking. A full or closed channel drops the
    /// chunk; intermediate fragments are a progressive-rendering
    /// optimization, not authoritative state.
    pub fn send(&self, chunk: Chunk) {
        if let Err(err) = self.tx.try_send(chunk) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(
                message_id = %self.message_id,
                dropped_total = total,
                "dropped stream chunk: {err}"
            );
        }
    }
}

struct StreamEntry {
    tx: mpsc::Sender<Chunk>,
    /// Taken by the first (and only) consumer that attaches.
    rx: Option<mpsc::Receiver<Chunk>>,
    dropped: Arc<AtomicU64>,
    /// Ties the entry to its expiry task; a stale task whose entry was
    /// replaced must not delete the replacement.
    generation: u64,
}

/// Registry of in-flight turn streams. One live entry per message ID;
/// constructed once at startup and injected wherever needed.
pub struct StreamRegistry {
    entries: RwLock<HashMap<MessageId, StreamEntry>>,
    buffer_size: usize,
    timeout: Duration,
    generation: AtomicU64,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::with_config(STREAM_BUFFER_SIZE, STREAM_TIMEOUT)
    }

    /// Registry with custom buffering and expiry (tests only need this).
    pub fn with_config(buffer_size: usize, timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            buffer_size,
            timeout,
            generation: AtomicU64::new(0),
        }
    }

    /// Allocate the stream for a turn, replacing any stale entry for the
    /// same message ID, and schedule its unconditional expiry.
    pub async fn create(self: &Arc<Self>, message_id: MessageId) -> StreamHandle {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let dropped = Arc::new(AtomicU64::new(0));
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let entry = StreamEntry {
            tx: tx.clone(),
            rx: Some(rx),
            dropped: dropped.clone(),
            generation,
        };
        self.entries.write().await.insert(message_id, entry);

        let registry = Arc::clone(self);
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if registry.remove_expired(message_id, generation).await {
                tracing::debug!(message_id = %message_id, "stream entry expired");
            }
        });

        StreamHandle {
            message_id,
            tx,
            dropped,
        }
    }

    /// Producer-side lookup of an in-flight stream.
    pub async fn lookup(&self, message_id: MessageId) -> Option<StreamHandle> {
        let entries = self.entries.read().await;
        entries.get(&message_id).map(|entry| StreamHandle {
            message_id,
            tx: entry.tx.clone(),
            dropped: entry.dropped.clone(),
        })
    }

    /// Take the single consumer end of a turn's stream.
    ///
    /// `None` is a normal outcome: the turn already finished, never
    /// streamed, or another consumer is already attached.
    pub async fn attach(&self, message_id: MessageId) -> Option<mpsc::Receiver<Chunk>> {
        let mut entries = self.entries.write().await;
        entries.get_mut(&message_id).and_then(|entry| entry.rx.take())
    }

    /// Close and delete a turn's stream. Idempotent. An attached consumer
    /// observes end-of-stream once in-flight producers finish.
    pub async fn remove(&self, message_id: MessageId) -> bool {
        self.entries.write().await.remove(&message_id).is_some()
    }

    /// Expiry-task removal: only deletes the entry its timer was armed
    /// for, never a replacement created since.
    async fn remove_expired(&self, message_id: MessageId, generation: u64) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(&message_id) {
            Some(entry) if entry.generation == generation => {
                entries.remove(&message_id);
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(buffer: usize, timeout: Duration) -> Arc<StreamRegistry> {
        Arc::new(StreamRegistry::with_config(buffer, timeout))
    }

    #[tokio::test]
    async fn chunks_arrive_in_production_order() {
        let registry = registry(10, Duration::from_secs(60));
        let id = MessageId::new();
        let handle = registry.create(id).await;

        handle.send(Chunk::text("one"));
        handle.send(Chunk::text("two"));
        handle.send(Chunk::text_done());

        let mut rx = registry.attach(id).await.expect("receiver");
        assert_eq!(rx.recv().await, Some(Chunk::text("one")));
        assert_eq!(rx.recv().await, Some(Chunk::text("two")));
        assert_eq!(rx.recv().await, Some(Chunk::text_done()));
    }

    #[tokio::test]
    async fn full_buffer_drops_without_blocking() {
        let registry = registry(2, Duration::from_secs(60));
        let id = MessageId::new();
        let handle = registry.create(id).await;

        for i in 0..5 {
            handle.send(Chunk::text(format!("{i}")));
        }

        // A slow consumer observes a strict, in-order subset.
        let mut rx = registry.attach(id).await.expect("receiver");
        assert_eq!(rx.recv().await, Some(Chunk::text("0")));
        assert_eq!(rx.recv().await, Some(Chunk::text("1")));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn attach_is_single_consumer() {
        let registry = registry(10, Duration::from_secs(60));
        let id = MessageId::new();
        let _handle = registry.create(id).await;

        assert!(registry.attach(id).await.is_some());
        assert!(registry.attach(id).await.is_none());
    }

    #[tokio::test]
    async fn lookup_of_unknown_message_is_not_found() {
        let registry = registry(10, Duration::from_secs(60));
        assert!(registry.lookup(MessageId::new()).await.is_none());
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_closes_the_stream() {
        let registry = registry(10, Duration::from_secs(60));
        let id = MessageId::new();
        let handle = registry.create(id).await;
        let mut rx = registry.attach(id).await.expect("receiver");

        assert!(registry.remove(id).await);
        assert!(!registry.remove(id).await);

        // The producer's clone still holds the channel open; once it is
        // gone the consumer sees end-of-stream.
        drop(handle);
        assert_eq!(rx.recv().await, None);

        // Sending after removal is a silent drop, not a panic.
        let stale = registry.lookup(id).await;
        assert!(stale.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_the_timeout() {
        let registry = registry(10, Duration::from_millis(50));
        let id = MessageId::new();
        let _handle = registry.create(id).await;

        assert!(registry.lookup(id).await.is_some());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(registry.lookup(id).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn replacing_an_entry_rearms_its_expiry() {
        let registry = registry(10, Duration::from_millis(50));
        let id = MessageId::new();
        let _stale = registry.create(id).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        let _fresh = registry.create(id).await;

        // The stale entry's timer fires here; the replacement survives.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(registry.lookup(id).await.is_some());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(registry.lookup(id).await.is_none());
    }
}
