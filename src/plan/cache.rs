use crate::plan::{Plan, PlanKey};
use lru::LruCache;
use std::num::NonZeroUsize;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Entries dropped because their handle was invalidated elsewhere.
    pub purged: u64,
    pub len: usize,
    pub capacity: usize,
}

/// Strict LRU over prepared plans.
///
/// An entry leaves the cache only after its handle has been invalidated, so
/// the cache never holds a plan whose native memory is gone and never lets a
/// live plan fall out uncached. A pinned victim leaves retiring: it refuses
/// new pins and is released at its last unpin. Used from the privileged
/// thread only.
#[derive(Debug)]
pub struct PlanCache {
    entries: LruCache<PlanKey, Plan>,
    hits: u64,
    misses: u64,
    evictions: u64,
    purged: u64,
}

impl PlanCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
            hits: 0,
            misses: 0,
            evictions: 0,
            purged: 0,
        }
    }

    /// Returns the cached plan and promotes it. A plan found invalid or
    /// retiring (its scope ended) is purged and reported as a miss.
    pub fn lookup(&mut self, key: &PlanKey) -> Option<Plan> {
        let cached = self.entries.get(key).cloned();
        match cached {
            Some(plan) if plan.is_usable() => {
                self.hits += 1;
                Some(plan)
            }
            Some(_) => {
                self.entries.pop(key);
                self.purged += 1;
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Inserts `plan` as most recently used. Returns the evicted plans, each
    /// already invalidated or retiring.
    pub fn insert(&mut self, plan: Plan) -> Vec<Plan> {
        let mut evicted = Vec::new();
        if let Some(previous) = self.entries.peek(plan.key()) {
            if !previous.ptr_eq(&plan) {
                previous.handle().invalidate();
            }
        } else {
            while self.entries.len() >= self.entries.cap().get() {
                let Some((_, lru)) = self.entries.peek_lru() else {
                    break;
                };
                lru.handle().invalidate();
                let Some((key, lru)) = self.entries.pop_lru() else {
                    break;
                };
                self.evictions += 1;
                debug!(plan = %key, handle = %lru.handle().id(), "plan evicted");
                evicted.push(lru);
            }
        }
        self.entries.put(plan.key().clone(), plan);
        evicted
    }

    /// Explicit close: invalidates the plan and removes it when it is the
    /// cached entry for its key.
    pub fn close(&mut self, plan: &Plan) -> bool {
        let invalidated = plan.handle().invalidate();
        if self
            .entries
            .peek(plan.key())
            .is_some_and(|cached| cached.ptr_eq(plan))
        {
            self.entries.pop(plan.key());
        }
        invalidated
    }

    /// Drops every entry whose handle is invalid or retiring.
    pub fn purge_invalid(&mut self) -> usize {
        let stale: Vec<PlanKey> = self
            .entries
            .iter()
            .filter(|(_, plan)| !plan.is_usable())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            self.entries.pop(key);
        }
        self.purged += stale.len() as u64;
        stale.len()
    }

    /// Does not promote.
    pub fn contains(&self, key: &PlanKey) -> bool {
        self.entries.contains(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    pub fn stats(&self) -> PlanCacheStats {
        PlanCacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            purged: self.purged,
            len: self.entries.len(),
            capacity: self.capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::death_row::DeathRow;
    use crate::handle::registry::{ScopeId, ScopeKind, ScopeRegistry};
    use crate::handle::{Handle, HandleKind, NativeAddr};
    use crate::host::TypeOid;
    use proptest::prelude::*;
    use std::sync::Arc;

    struct Fixture {
        registry: ScopeRegistry,
        death_row: Arc<DeathRow>,
        scope: ScopeId,
        next_addr: u64,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = ScopeRegistry::new();
            let scope = registry
                .open_scope(None, ScopeKind::Session)
                .expect("scope");
            Self {
                registry,
                death_row: Arc::new(DeathRow::new()),
                scope,
                next_addr: 0,
            }
        }

        fn plan(&mut self, text: &str) -> Plan {
            self.next_addr += 0x10;
            let state = self
                .registry
                .register(self.scope, NativeAddr::new(self.next_addr), HandleKind::Plan)
                .expect("register");
            let handle = Handle::new(state, Arc::clone(&self.death_row));
            Plan::new(PlanKey::new(text, &[TypeOid::INT4]), handle)
        }
    }

    fn cap(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).expect("non-zero")
    }

    #[test]
    fn eviction_invalidates_least_recently_used() {
        let mut fx = Fixture::new();
        let mut cache = PlanCache::new(cap(2));
        let a = fx.plan("a");
        let b = fx.plan("b");
        assert!(cache.insert(a.clone()).is_empty());
        assert!(cache.insert(b.clone()).is_empty());
        assert!(cache.lookup(a.key()).is_some());

        let evicted = cache.insert(fx.plan("c"));
        assert_eq!(evicted.len(), 1);
        assert!(evicted[0].ptr_eq(&b));
        assert!(!b.is_valid());
        assert!(a.is_valid());
        assert!(!cache.contains(b.key()));
        assert_eq!(cache.len(), 2);
        assert_eq!(fx.death_row.len(), 1);
    }

    #[test]
    fn invalid_entries_are_purged_on_lookup() {
        let mut fx = Fixture::new();
        let mut cache = PlanCache::new(cap(4));
        let a = fx.plan("a");
        cache.insert(a.clone());
        a.handle().invalidate();
        assert!(cache.lookup(a.key()).is_none());
        assert!(!cache.contains(a.key()));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.purged), (0, 1, 1));
    }

    #[test]
    fn close_removes_only_the_cached_instance() {
        let mut fx = Fixture::new();
        let mut cache = PlanCache::new(cap(4));
        let cached = fx.plan("a");
        let other = fx.plan("a");
        cache.insert(cached.clone());
        assert!(cache.close(&other));
        assert!(cache.contains(cached.key()));
        assert!(cache.close(&cached));
        assert!(cache.is_empty());
        assert!(!cache.close(&cached));
    }

    #[test]
    fn pinned_victim_is_evicted_retiring_and_released_at_unpin() {
        let mut fx = Fixture::new();
        let mut cache = PlanCache::new(cap(1));
        let a = fx.plan("a");
        cache.insert(a.clone());
        let guard = a.handle().pin().expect("pin");

        let evicted = cache.insert(fx.plan("b"));
        assert_eq!(evicted.len(), 1);
        assert!(evicted[0].ptr_eq(&a));
        assert!(!cache.contains(a.key()));
        assert!(a.is_valid());
        assert!(!a.is_usable());
        assert!(a.handle().pin().is_err());
        assert!(fx.death_row.is_empty());

        drop(guard);
        assert!(!a.is_valid());
        assert_eq!(fx.death_row.len(), 1);
    }

    #[test]
    fn purge_drops_plans_of_ended_scopes() {
        let mut fx = Fixture::new();
        let mut cache = PlanCache::new(cap(4));
        let a = fx.plan("a");
        let b = fx.plan("b");
        cache.insert(a.clone());
        cache.insert(b);
        a.handle().invalidate();
        assert_eq!(cache.purge_invalid(), 1);
        assert_eq!(cache.len(), 1);
    }

    proptest! {
        #[test]
        fn cache_matches_lru_model(capacity in 1usize..6, ops in prop::collection::vec(0u8..10, 1..60)) {
            let mut fx = Fixture::new();
            let mut cache = PlanCache::new(cap(capacity));
            let mut model: Vec<u8> = Vec::new();
            for op in ops {
                let text = format!("select {op}");
                let key = PlanKey::new(text.as_str(), &[TypeOid::INT4]);
                let hit = cache.lookup(&key);
                let model_hit = model.iter().position(|k| *k == op);
                prop_assert_eq!(hit.is_some(), model_hit.is_some());
                match model_hit {
                    Some(pos) => {
                        let k = model.remove(pos);
                        model.push(k);
                    }
                    None => {
                        let evicted = cache.insert(fx.plan(&text));
                        if model.len() >= capacity {
                            model.remove(0);
                            prop_assert_eq!(evicted.len(), 1);
                        }
                        prop_assert!(evicted.iter().all(|p| !p.is_valid()));
                        model.push(op);
                    }
                }
                prop_assert!(cache.len() <= capacity);
                prop_assert_eq!(cache.len(), model.len());
            }
        }
    }
}
