//! Pending conversations keyed by sender.

use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::command::UserContext;
use crate::config::UserContextConfig;

struct Entry {
    context: UserContext,
    created_at: Instant,
    ttl: Duration,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.ttl
    }
}

/// Maps a sender key to the continuation its next input goes to.
///
/// [`take`](Self::take) removes and returns in one step, so two inputs from the same
/// sender can never both obtain the same continuation.
pub struct UserContextStore {
    entries: DashMap<String, Entry>,
    // Serializes inserts so the capacity check and the insert happen as one step.
    insert_lock: Mutex<()>,
    ttl: Duration,
    max_entries: usize,
}

impl UserContextStore {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            insert_lock: Mutex::new(()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn from_config(config: &UserContextConfig) -> Self {
        Self::new(config.ttl(), config.max_entries)
    }

    /// Removes and returns the sender's continuation. Expired entries count as absent.
    pub fn take(&self, sender_key: &str) -> Option<UserContext> {
        let (_, entry) = self.entries.remove(sender_key)?;
        if entry.is_expired(Instant::now()) {
            debug!(sender = sender_key, "user context expired");
            return None;
        }
        Some(entry.context)
    }

    /// Stores `context` for the sender, replacing any previous one.
    ///
    /// When the store is full, expired entries are purged first, then the oldest entry
    /// is evicted. Concurrent inserts never push the store past `max_entries`.
    pub fn insert(&self, sender_key: impl Into<String>, context: UserContext) {
        let sender_key = sender_key.into();
        let ttl = context.ttl().unwrap_or(self.ttl);

        let _guard = self.insert_lock.lock();
        if !self.entries.contains_key(&sender_key) && self.entries.len() >= self.max_entries {
            self.purge_expired();
            if self.entries.len() >= self.max_entries {
                self.evict_oldest();
            }
        }

        self.entries.insert(
            sender_key,
            Entry {
                context,
                created_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Drops the sender's continuation. Returns whether one was stored.
    pub fn remove(&self, sender_key: &str) -> bool {
        self.entries.remove(sender_key).is_some()
    }

    /// Whether a live (unexpired) continuation is stored for the sender.
    pub fn contains(&self, sender_key: &str) -> bool {
        self.entries
            .get(sender_key)
            .is_some_and(|entry| !entry.is_expired(Instant::now()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every expired entry; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().created_at)
            .map(|entry| entry.key().clone());

        if let Some(key) = oldest {
            debug!(sender = %key, "user context store full, evicting oldest entry");
            self.entries.remove(&key);
        }
    }

    /// Periodically purges expired entries until `token` is cancelled.
    pub fn spawn_sweeper(
        self: std::sync::Arc<Self>,
        token: CancellationToken,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = self.purge_expired();
                        if purged > 0 {
                            debug!(purged, "swept expired user contexts");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::command::CommandResponse;

    fn noop() -> UserContext {
        UserContext::new(|_, _| async { Ok(CommandResponse::empty()) })
    }

    #[tokio::test]
    async fn take_removes_the_entry() {
        let store = UserContextStore::new(Duration::from_secs(60), 10);
        store.insert("slack:U1", noop());

        assert!(store.contains("slack:U1"));
        assert!(store.take("slack:U1").is_some());
        assert!(store.take("slack:U1").is_none());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_absent() {
        let store = UserContextStore::new(Duration::from_secs(10), 10);
        store.insert("slack:U1", noop());
        store.insert("slack:U2", noop().with_ttl(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(!store.contains("slack:U1"));
        assert!(store.take("slack:U1").is_none());
        assert!(store.take("slack:U2").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_inserts_respect_capacity() {
        let store = Arc::new(UserContextStore::new(Duration::from_secs(60), 8));

        let mut handles = Vec::new();
        for task in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..32 {
                    store.insert(format!("slack:U{task}-{i}"), noop());
                    assert!(store.len() <= 8);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.len(), 8);
    }

    #[tokio::test]
    async fn concurrent_takes_yield_one_continuation() {
        let store = Arc::new(UserContextStore::new(Duration::from_secs(60), 10));
        store.insert("slack:U1", noop());

        let hits = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let hits = hits.clone();
            handles.push(tokio::spawn(async move {
                if store.take("slack:U1").is_some() {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_store_evicts_expired_then_oldest() {
        let store = UserContextStore::new(Duration::from_secs(10), 2);
        store.insert("a", noop().with_ttl(Duration::from_secs(1)));
        tokio::time::advance(Duration::from_secs(2)).await;
        store.insert("b", noop());
        tokio::time::advance(Duration::from_secs(1)).await;

        // "a" is expired and goes first.
        store.insert("c", noop());
        assert_eq!(store.len(), 2);
        assert!(store.contains("b") && store.contains("c"));

        tokio::time::advance(Duration::from_secs(1)).await;
        store.insert("d", noop());
        assert_eq!(store.len(), 2);
        assert!(!store.contains("b"));
        assert!(store.contains("c") && store.contains("d"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_in_background() {
        let store = Arc::new(UserContextStore::new(Duration::from_secs(5), 10));
        store.insert("slack:U1", noop());

        let token = CancellationToken::new();
        let handle = store
            .clone()
            .spawn_sweeper(token.clone(), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(store.is_empty());

        token.cancel();
        handle.await.unwrap();
    }
}
