//! Single-flight result cache
//!
//! Expensive actor lists (funnel, path) are memoized per normalized filter.
//! Concurrent callers with the same key share one computation: the first
//! caller runs it, the rest wait on the same cell.

use crate::error::{ResolverError, Result};
use crate::filter::Filter;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    computed_at: DateTime<Utc>,
    expires_at: Instant,
}

/// A cache read.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<V> {
    pub value: V,
    /// False only for the caller that ran the computation
    pub is_cached: bool,
    pub last_refresh: DateTime<Utc>,
}

pub struct SingleFlightCache<V> {
    slots: DashMap<String, Arc<OnceCell<Entry<V>>>>,
    ttl: Duration,
}

impl<V: Clone + Send + Sync + 'static> SingleFlightCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            ttl,
        }
    }

    /// Return the cached value for `key`, computing it at most once across
    /// concurrent callers. `refresh` discards any stored value first. A
    /// failed computation caches nothing and leaves no slot behind.
    pub async fn get_or_compute<F, Fut>(&self, key: &str, refresh: bool, compute: F) -> Result<Cached<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let cell = self.slot(key, refresh);
        let computed = AtomicBool::new(false);
        let flag = &computed;
        let ttl = self.ttl;

        let initialized = cell
            .get_or_try_init(|| async move {
                flag.store(true, Ordering::SeqCst);
                let value = compute().await?;
                Ok::<_, ResolverError>(Entry {
                    value,
                    computed_at: Utc::now(),
                    expires_at: Instant::now() + ttl,
                })
            })
            .await;
        let entry = match initialized {
            Ok(entry) => entry,
            Err(err) => {
                self.slots
                    .remove_if(key, |_, slot| Arc::ptr_eq(slot, &cell) && !slot.initialized());
                return Err(err);
            }
        };

        Ok(Cached {
            value: entry.value.clone(),
            is_cached: !computed.load(Ordering::SeqCst),
            last_refresh: entry.computed_at,
        })
    }

    fn slot(&self, key: &str, refresh: bool) -> Arc<OnceCell<Entry<V>>> {
        // New keys sweep out expired ones so the map tracks live filters only.
        if !self.slots.contains_key(key) {
            self.purge_expired();
        }
        let mut slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()));
        let stale = refresh
            || slot
                .get()
                .map(|entry| entry.expires_at <= Instant::now())
                .unwrap_or(false);
        if stale {
            *slot = Arc::new(OnceCell::new());
        }
        Arc::clone(&slot)
    }

    /// Drop expired entries. Cells still being computed are kept.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.slots
            .retain(|_, cell| cell.get().map(|entry| entry.expires_at > now).unwrap_or(true));
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Key over team, resolution mode and every result-affecting filter field.
pub fn cache_key(team_id: i64, mode: &str, filter: &Filter) -> Result<String> {
    let normalized = filter.to_normalized()?;
    Ok(format!("{}_{}_{}", mode, team_id, normalized))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{InsightKind, RequestParams};
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;

    fn trends_filter(date_from: &str) -> Filter {
        let params = RequestParams::new().with_query("date_from", date_from);
        let now = Utc.with_ymd_and_hms(2022, 3, 15, 12, 0, 0).unwrap();
        Filter::from_params(&params, 1, InsightKind::Trends, now).unwrap()
    }

    #[test]
    fn test_cache_key_carries_the_normalized_filter() {
        let week = cache_key(1, "funnel", &trends_filter("-7d")).unwrap();
        assert_eq!(week, cache_key(1, "funnel", &trends_filter("-7d")).unwrap());
        assert!(week.starts_with("funnel_1_{"));
        assert!(week.contains("-7d"));
        assert_ne!(week, cache_key(1, "funnel", &trends_filter("-14d")).unwrap());
        assert_ne!(week, cache_key(2, "funnel", &trends_filter("-7d")).unwrap());
    }

    #[tokio::test]
    async fn test_second_read_is_cached() {
        let cache = SingleFlightCache::new(Duration::from_secs(60));
        let first = cache.get_or_compute("k", false, || async { Ok(1) }).await.unwrap();
        let second = cache.get_or_compute("k", false, || async { Ok(2) }).await.unwrap();
        assert!(!first.is_cached);
        assert!(second.is_cached);
        assert_eq!(second.value, 1);
        assert_eq!(second.last_refresh, first.last_refresh);
    }

    #[tokio::test]
    async fn test_refresh_recomputes() {
        let cache = SingleFlightCache::new(Duration::from_secs(60));
        cache.get_or_compute("k", false, || async { Ok(1) }).await.unwrap();
        let fresh = cache.get_or_compute("k", true, || async { Ok(2) }).await.unwrap();
        assert!(!fresh.is_cached);
        assert_eq!(fresh.value, 2);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache: SingleFlightCache<i32> = SingleFlightCache::new(Duration::from_secs(60));
        let failed = cache
            .get_or_compute("k", false, || async {
                Err(ResolverError::Execution("boom".to_string()))
            })
            .await;
        assert!(failed.is_err());
        assert!(cache.is_empty());
        let ok = cache.get_or_compute("k", false, || async { Ok(3) }).await.unwrap();
        assert_eq!(ok.value, 3);
        assert!(!ok.is_cached);
    }

    #[tokio::test]
    async fn test_expired_entries_recompute() {
        let cache = SingleFlightCache::new(Duration::from_millis(0));
        cache.get_or_compute("k", false, || async { Ok(1) }).await.unwrap();
        let again = cache.get_or_compute("k", false, || async { Ok(2) }).await.unwrap();
        assert_eq!(again.value, 2);
        cache.purge_expired();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_expired_keys_do_not_accumulate() {
        let cache = SingleFlightCache::new(Duration::from_millis(0));
        for i in 0..1000 {
            let key = format!("funnel_1_{}", i);
            cache.get_or_compute(&key, false, || async move { Ok(i) }).await.unwrap();
        }
        assert!(cache.len() <= 1, "{} slots left", cache.len());
    }

    #[tokio::test]
    async fn test_live_entries_survive_new_keys() {
        let cache = SingleFlightCache::new(Duration::from_secs(60));
        cache.get_or_compute("a", false, || async { Ok(1) }).await.unwrap();
        cache.get_or_compute("b", false, || async { Ok(2) }).await.unwrap();
        assert_eq!(cache.len(), 2);
        let a = cache.get_or_compute("a", false, || async { Ok(9) }).await.unwrap();
        assert!(a.is_cached);
        assert_eq!(a.value, 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_computation() {
        let cache = Arc::new(SingleFlightCache::new(Duration::from_secs(60)));
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("k", false, || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(7)
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut fresh = 0;
        for handle in handles {
            let cached = handle.await.unwrap();
            assert_eq!(cached.value, 7);
            if !cached.is_cached {
                fresh += 1;
            }
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(fresh, 1);
    }
}
