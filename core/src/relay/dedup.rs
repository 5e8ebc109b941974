// Deduplication cache: recently seen message ids with per-entry expiry
//
// The cheapest guard in the inbound path: it runs before signature
// verification so replayed frames cost one map lookup.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Default window matching the channel's realistic propagation time
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(60);

/// Hard cap on tracked ids; oldest are evicted first under replay floods
const MAX_SEEN_IDS: usize = 50_000;

#[derive(Default)]
struct SeenSet {
    /// id -> expiry
    expires: HashMap<String, Instant>,
    /// insertion order, for FIFO eviction and sweeping
    order: VecDeque<(String, Instant)>,
}

pub struct DedupCache {
    ttl: Duration,
    inner: Mutex<SeenSet>,
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(SeenSet::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Has `id` been marked within its window?
    pub fn seen(&self, id: &str) -> bool {
        let inner = self.inner.lock();
        matches!(inner.expires.get(id), Some(expiry) if *expiry > Instant::now())
    }

    /// Mark `id` as seen for the cache's TTL.
    pub fn mark_seen(&self, id: &str) {
        self.mark_seen_for(id, self.ttl);
    }

    pub fn mark_seen_for(&self, id: &str, ttl: Duration) {
        let mut inner = self.inner.lock();
        Self::insert(&mut inner, id, Instant::now() + ttl);
    }

    /// Atomically check and mark. Returns `true` only for the first caller
    /// within the window; concurrent arrivals of the same id see `false`.
    pub fn check_and_mark(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if matches!(inner.expires.get(id), Some(expiry) if *expiry > now) {
            return false;
        }
        Self::insert(&mut inner, id, now + self.ttl);
        true
    }

    /// Drop expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.expires.len();

        // `order` is sorted by insertion, not expiry, when custom TTLs are
        // mixed in, so sweep the whole queue.
        let SeenSet { expires, order } = &mut *inner;
        order.retain(|(id, expiry)| {
            if *expiry > now {
                return true;
            }
            // a re-mark after expiry leaves a newer entry in `expires`
            if expires.get(id) == Some(expiry) {
                expires.remove(id);
            }
            false
        });

        before - inner.expires.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expires.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodically purge expired ids until `shutdown` flips to `true`.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = self.purge_expired();
                        if purged > 0 {
                            debug!("Dedup sweep purged {} ids", purged);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Dedup sweeper stopped");
                            break;
                        }
                    }
                }
            }
        })
    }

    fn insert(inner: &mut SeenSet, id: &str, expiry: Instant) {
        inner.expires.insert(id.to_string(), expiry);
        inner.order.push_back((id.to_string(), expiry));

        while inner.expires.len() > MAX_SEEN_IDS {
            let Some((old_id, old_expiry)) = inner.order.pop_front() else {
                break;
            };
            if inner.expires.get(&old_id) == Some(&old_expiry) {
                inner.expires.remove(&old_id);
            }
        }
        // stale queue entries from re-marks are reclaimed by the sweeper
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_TTL)
    }
}
