// Bounded image cache.
//
// Keyed by remote object key, accounted by byte cost, evicted
// least-recently-accessed first. Callers hold Arc clones of the bytes, so
// eviction never invalidates a checked-out reference. Misses go through a
// single-flight fetch: concurrent callers for one key share one remote fetch
// and all observe the same outcome.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::remote::{RemoteError, RemoteStore};

/// Default maximum number of cached images.
pub const DEFAULT_MAX_ENTRIES: usize = 50;

/// Default maximum aggregate cost in bytes (50 MiB).
pub const DEFAULT_MAX_BYTES: usize = 50 * 1024 * 1024;

struct CacheEntry {
    bytes: Arc<Vec<u8>>,
    cost: usize,
    last_access: u64,
}

type FetchResult = Result<Arc<Vec<u8>>, RemoteError>;

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
    total_bytes: usize,
    /// Monotonic access stamp; higher = more recent.
    access_counter: u64,
    /// Keys with a fetch in flight, mapped to their waiters. The leader (who
    /// inserted the key) is not in the list.
    inflight: HashMap<String, Vec<oneshot::Sender<FetchResult>>>,

    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Point-in-time cache statistics for the status line.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Bounded key -> image-bytes cache backed by the remote object store.
pub struct ImageCache {
    remote: Arc<dyn RemoteStore>,
    inner: Arc<Mutex<Inner>>,
    max_entries: usize,
    max_bytes: usize,
}

impl ImageCache {
    pub fn new(remote: Arc<dyn RemoteStore>, max_entries: usize, max_bytes: usize) -> Self {
        ImageCache {
            remote,
            inner: Arc::new(Mutex::new(Inner::default())),
            max_entries,
            max_bytes,
        }
    }

    /// Cache probe without fetching.
    pub async fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let mut inner = self.inner.lock().await;
        inner.access_counter += 1;
        let stamp = inner.access_counter;
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.last_access = stamp;
            let bytes = entry.bytes.clone();
            inner.hits += 1;
            Some(bytes)
        } else {
            inner.misses += 1;
            None
        }
    }

    /// Insert bytes, evicting least-recently-accessed entries until both the
    /// count bound and the byte bound hold with the new entry included.
    pub async fn put(&self, key: impl Into<String>, bytes: Vec<u8>) {
        let mut inner = self.inner.lock().await;
        insert_entry(&mut inner, self.max_entries, self.max_bytes, key.into(), Arc::new(bytes));
    }

    /// Cached bytes for `key`, fetching on a miss. Concurrent callers for a
    /// cold key share one underlying fetch; failures propagate to everyone
    /// and nothing is cached, so the next call retries.
    ///
    /// The underlying fetch runs on its own task, so a cancelled caller
    /// never strands the key: the inflight entry is always removed and the
    /// remaining waiters always get the result.
    pub async fn fetch(&self, key: &str) -> FetchResult {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            inner.access_counter += 1;
            let stamp = inner.access_counter;
            if let Some(entry) = inner.entries.get_mut(key) {
                entry.last_access = stamp;
                let bytes = entry.bytes.clone();
                inner.hits += 1;
                return Ok(bytes);
            }
            inner.misses += 1;

            if let Some(waiters) = inner.inflight.get_mut(key) {
                waiters.push(tx);
            } else {
                inner.inflight.insert(key.to_string(), vec![tx]);

                let remote = self.remote.clone();
                let shared = self.inner.clone();
                let key = key.to_string();
                let (max_entries, max_bytes) = (self.max_entries, self.max_bytes);
                tokio::spawn(async move {
                    let result = remote.fetch_image(&key).await.map(Arc::new);

                    let waiters = {
                        let mut inner = shared.lock().await;
                        let waiters = inner.inflight.remove(&key).unwrap_or_default();
                        if let Ok(bytes) = &result {
                            insert_entry(&mut inner, max_entries, max_bytes, key, bytes.clone());
                        }
                        waiters
                    };
                    for tx in waiters {
                        let _ = tx.send(result.clone());
                    }
                });
            }
        }

        // Recv only fails if the fetch task panicked.
        rx.await.map_err(|_| RemoteError::FetchFailed {
            key: key.to_string(),
            reason: "fetch abandoned".to_string(),
        })?
    }

    /// Clear everything. Invoked on the platform memory-pressure signal;
    /// full eviction, never partial. In-flight fetches still complete for
    /// their waiters.
    pub async fn evict_under_pressure(&self) {
        let mut inner = self.inner.lock().await;
        let dropped = inner.entries.len();
        let dropped_bytes = inner.total_bytes;
        inner.entries.clear();
        inner.total_bytes = 0;
        inner.evictions += dropped as u64;
        warn!(dropped, dropped_bytes, "image cache cleared under memory pressure");
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        CacheStats {
            entries: inner.entries.len(),
            total_bytes: inner.total_bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }

}

fn insert_entry(inner: &mut Inner, max_entries: usize, max_bytes: usize, key: String, bytes: Arc<Vec<u8>>) {
    let cost = bytes.len();
    if cost > max_bytes {
        // Flushing the whole cache for one oversized image would still
        // violate the bound; refuse instead.
        warn!(%key, cost, max = max_bytes, "image exceeds cache byte bound, not cached");
        return;
    }

    if let Some(old) = inner.entries.remove(&key) {
        inner.total_bytes -= old.cost;
    }

    // Evict-before-insert keeps both bounds intact at all times.
    while inner.entries.len() + 1 > max_entries || inner.total_bytes + cost > max_bytes {
        let lru = inner
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(k, _)| k.clone());
        match lru {
            Some(victim) => {
                if let Some(entry) = inner.entries.remove(&victim) {
                    inner.total_bytes -= entry.cost;
                    inner.evictions += 1;
                    debug!(key = %victim, cost = entry.cost, "evicted image");
                }
            }
            None => break,
        }
    }

    inner.access_counter += 1;
    let last_access = inner.access_counter;
    inner.total_bytes += cost;
    inner.entries.insert(key, CacheEntry { bytes, cost, last_access });

    debug_assert!(
        inner.entries.len() <= max_entries && inner.total_bytes <= max_bytes,
        "cache bounds violated after insert"
    );
}
