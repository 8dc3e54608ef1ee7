//! Freshness-aware rowset cache.
//!
//! Keyed by `(tenant, source, table, canonical-filter-hash)` so that two
//! queries pushing the same filters in a different order share an entry, and
//! no tenant can ever observe another tenant's rows. Entries are served only
//! within the source's hard staleness cap; how fresh an entry must be for a
//! given query is the caller's contract (`max_staleness_ms`), checked at
//! lookup time.
//!
//! Concurrent misses for one key coalesce through a per-key flight guard:
//! the first task fetches while followers wait, then re-check the cache.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use weir_common::model::{PredicateOp, Rowset};

/// Canonical cache key. Filters are hashed order-independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub tenant: String,
    pub source: String,
    pub table: String,
    pub filter_hash: String,
}

impl CacheKey {
    pub fn new(
        tenant: &str,
        source: &str,
        table: &str,
        filters: &BTreeMap<String, (PredicateOp, Value)>,
    ) -> Self {
        Self {
            tenant: tenant.to_string(),
            source: source.to_string(),
            table: table.to_string(),
            filter_hash: canonical_filter_hash(filters),
        }
    }

    fn storage_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.tenant, self.source, self.table, self.filter_hash
        )
    }

    fn tenant_prefix(tenant: &str) -> String {
        format!("{}|", tenant)
    }
}

/// Stable hash of a pushed-filter map. The `BTreeMap` iterates in column
/// order, so `{status=merged, repo=x}` and `{repo=x, status=merged}` collide
/// by construction.
pub fn canonical_filter_hash(filters: &BTreeMap<String, (PredicateOp, Value)>) -> String {
    let mut hasher = Sha256::new();
    for (column, (op, value)) in filters {
        hasher.update(column.as_bytes());
        hasher.update(b" ");
        hasher.update(op.as_sql_str().as_bytes());
        hasher.update(b" ");
        hasher.update(value.to_string().as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    format!("{:x}", digest)[..16].to_string()
}

struct Entry {
    rowset: Arc<Rowset>,
    created_at: Instant,
    hard_cap: Duration,
    last_access: Instant,
    hit_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

pub struct FreshnessCache {
    entries: DashMap<String, Entry>,
    flights: DashMap<String, Arc<Mutex<()>>>,
    soft_cap_per_tenant: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FreshnessCache {
    pub fn new(soft_cap_per_tenant: usize) -> Self {
        Self {
            entries: DashMap::new(),
            flights: DashMap::new(),
            soft_cap_per_tenant: soft_cap_per_tenant.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Return the cached rowset and its age when one exists within both the
    /// caller's staleness budget and the source's hard cap.
    pub fn lookup(&self, key: &CacheKey, max_staleness_ms: u64) -> Option<(Arc<Rowset>, u64)> {
        if max_staleness_ms == 0 {
            // Live-only contract: no cache read at all.
            return None;
        }
        self.lookup_with_budget(key, Some(max_staleness_ms))
    }

    /// Return the cached rowset at any age up to the hard cap. Used only as
    /// the stale fallback when upstream is unavailable.
    pub fn lookup_any(&self, key: &CacheKey) -> Option<(Arc<Rowset>, u64)> {
        self.lookup_with_budget(key, None)
    }

    fn lookup_with_budget(
        &self,
        key: &CacheKey,
        budget_ms: Option<u64>,
    ) -> Option<(Arc<Rowset>, u64)> {
        let storage_key = key.storage_key();
        let mut found = None;
        let mut expired = false;

        if let Some(mut entry) = self.entries.get_mut(&storage_key) {
            let age = entry.created_at.elapsed();
            let within_budget = match budget_ms {
                None => true,
                Some(budget) => age.as_millis() as u64 <= budget,
            };
            if age > entry.hard_cap {
                expired = true;
            } else if within_budget {
                entry.last_access = Instant::now();
                entry.hit_count += 1;
                let mut rowset = (*entry.rowset).clone();
                rowset.age_ms = age.as_millis() as u64;
                found = Some((Arc::new(rowset), age.as_millis() as u64));
            }
        }

        if expired {
            self.entries.remove(&storage_key);
        }

        match found {
            Some(hit) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(hit)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a freshly fetched rowset, evicting the tenant's least recently
    /// used entry if the soft cap is exceeded.
    pub fn insert(&self, key: &CacheKey, rowset: Rowset, hard_cap_ms: u64) {
        self.evict_for_tenant(&key.tenant);
        self.entries.insert(
            key.storage_key(),
            Entry {
                rowset: Arc::new(rowset),
                created_at: Instant::now(),
                hard_cap: Duration::from_millis(hard_cap_ms),
                last_access: Instant::now(),
                hit_count: 0,
            },
        );
        debug!(
            target: "cache",
            tenant = %key.tenant,
            source = %key.source,
            table = %key.table,
            "cache write-back"
        );
    }

    fn evict_for_tenant(&self, tenant: &str) {
        let prefix = CacheKey::tenant_prefix(tenant);
        let tenant_keys: Vec<(String, Instant, u64)> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| (e.key().clone(), e.value().last_access, e.value().hit_count))
            .collect();

        if tenant_keys.len() < self.soft_cap_per_tenant {
            return;
        }
        // Least recently used; least hit breaks ties.
        if let Some((victim, _, _)) = tenant_keys
            .into_iter()
            .min_by_key(|(_, at, hits)| (*at, *hits))
        {
            debug!(target: "cache", key = %victim, "evicting LRU entry (tenant soft cap)");
            self.entries.remove(&victim);
        }
    }

    /// Per-key flight guard. Hold it across the miss-fetch-insert sequence;
    /// followers acquire it after the leader and re-check the cache first.
    pub async fn flight_guard(&self, key: &CacheKey) -> OwnedMutexGuard<()> {
        let lock = self
            .flights
            .entry(key.storage_key())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop entries past their hard cap and flight guards nobody holds.
    pub fn sweep(&self) {
        self.entries
            .retain(|_, entry| entry.created_at.elapsed() <= entry.hard_cap);
        self.flights.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weir_common::model::{ColumnDef, RowsetSchema, SemanticType};

    fn rowset(n: usize) -> Rowset {
        let schema = RowsetSchema::new(vec![ColumnDef::new("id", SemanticType::Int)]);
        let rows = (0..n).map(|i| vec![json!(i as i64)]).collect();
        Rowset::new(schema, rows)
    }

    fn key(tenant: &str, table: &str) -> CacheKey {
        CacheKey::new(tenant, "github", table, &BTreeMap::new())
    }

    #[test]
    fn filter_order_does_not_change_the_key() {
        let mut a = BTreeMap::new();
        a.insert("status".to_string(), (PredicateOp::Eq, json!("merged")));
        a.insert("repo".to_string(), (PredicateOp::Eq, json!("x")));

        let mut b = BTreeMap::new();
        b.insert("repo".to_string(), (PredicateOp::Eq, json!("x")));
        b.insert("status".to_string(), (PredicateOp::Eq, json!("merged")));

        assert_eq!(canonical_filter_hash(&a), canonical_filter_hash(&b));

        let mut c = BTreeMap::new();
        c.insert("status".to_string(), (PredicateOp::Eq, json!("open")));
        assert_ne!(canonical_filter_hash(&a), canonical_filter_hash(&c));
    }

    #[test]
    fn zero_staleness_never_reads() {
        let cache = FreshnessCache::new(16);
        let k = key("acme", "pull_requests");
        cache.insert(&k, rowset(3), 60_000);
        assert!(cache.lookup(&k, 0).is_none());
        assert!(cache.lookup(&k, 1000).is_some());
    }

    #[test]
    fn fresh_hit_reports_age() {
        let cache = FreshnessCache::new(16);
        let k = key("acme", "pull_requests");
        cache.insert(&k, rowset(2), 60_000);

        let (hit, age) = cache.lookup(&k, 5_000).unwrap();
        assert_eq!(hit.len(), 2);
        assert!(age <= 5_000);
        assert_eq!(hit.age_ms, age);
    }

    #[tokio::test]
    async fn entry_older_than_budget_misses_but_stale_lookup_serves() {
        let cache = FreshnessCache::new(16);
        let k = key("acme", "pull_requests");
        cache.insert(&k, rowset(1), 60_000);
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(cache.lookup(&k, 5).is_none());
        let (_, age) = cache.lookup_any(&k).unwrap();
        assert!(age >= 30);
    }

    #[tokio::test]
    async fn hard_cap_bounds_even_stale_serving() {
        let cache = FreshnessCache::new(16);
        let k = key("acme", "pull_requests");
        cache.insert(&k, rowset(1), 10);
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(cache.lookup_any(&k).is_none());
        assert!(cache.lookup(&k, 60_000).is_none());
    }

    #[test]
    fn tenants_do_not_share_entries() {
        let cache = FreshnessCache::new(16);
        cache.insert(&key("acme", "pull_requests"), rowset(1), 60_000);
        assert!(cache.lookup(&key("globex", "pull_requests"), 60_000).is_none());
    }

    #[test]
    fn soft_cap_evicts_lru_within_tenant() {
        let cache = FreshnessCache::new(2);
        let k1 = key("acme", "t1");
        let k2 = key("acme", "t2");
        let other = key("globex", "t1");

        cache.insert(&k1, rowset(1), 60_000);
        std::thread::sleep(Duration::from_millis(5));
        cache.insert(&other, rowset(1), 60_000);
        cache.insert(&k2, rowset(1), 60_000);
        // acme is at its cap; next insert evicts acme's LRU (k1)
        cache.insert(&key("acme", "t3"), rowset(1), 60_000);

        assert!(cache.lookup(&k1, 60_000).is_none());
        assert!(cache.lookup(&k2, 60_000).is_some());
        // another tenant's entries are untouched
        assert!(cache.lookup(&other, 60_000).is_some());
    }

    #[tokio::test]
    async fn sweep_removes_expired_entries() {
        let cache = FreshnessCache::new(16);
        cache.insert(&key("acme", "t1"), rowset(1), 10);
        cache.insert(&key("acme", "t2"), rowset(1), 60_000);
        tokio::time::sleep(Duration::from_millis(30)).await;

        cache.sweep();
        assert_eq!(cache.stats().entries, 1);
    }

    #[tokio::test]
    async fn flight_guard_serializes_same_key() {
        let cache = Arc::new(FreshnessCache::new(16));
        let k = key("acme", "pull_requests");

        let guard = cache.flight_guard(&k).await;
        let cache2 = cache.clone();
        let k2 = k.clone();
        let follower = tokio::spawn(async move {
            let _g = cache2.flight_guard(&k2).await;
        });
        // The follower cannot finish while the leader holds the guard.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!follower.is_finished());

        drop(guard);
        follower.await.unwrap();
    }

    #[test]
    fn stats_count_hits_and_misses() {
        let cache = FreshnessCache::new(16);
        let k = key("acme", "pull_requests");
        assert!(cache.lookup(&k, 1000).is_none());
        cache.insert(&k, rowset(1), 60_000);
        assert!(cache.lookup(&k, 1000).is_some());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }
}
