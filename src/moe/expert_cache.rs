//! Per-`(layer, expert, out_dtype)` cache of MXFP4-dequantised expert
//! weights, with LRU eviction under a configurable entry cap (spec §4.4
//! step 5, §5 "dequantisation cache ... process-wide with LRU eviction
//! under a configurable entry cap").
//!
//! Grounded on `buffer_pool.rs`'s central-store shape (a lock-guarded map
//! keyed by a small `Copy` handle); recency tracking needs to mutate state
//! on a read hit too, so this uses a single `Mutex` rather than the pool's
//! `RwLock` split.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::tensor::{DType, Tensor};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ExpertCacheKey {
    pub layer: usize,
    pub expert: u32,
    pub out_dtype: DType,
}

/// Dequantised `gate_up`/`down` pair for one expert. Cached together since
/// every cache hit needs both (spec §4.4 step 5's "dequantise both
/// gate_up and down for this expert").
#[derive(Clone)]
pub struct DequantizedExpert {
    pub gate_up: Tensor,
    pub down: Tensor,
}

struct Entries {
    map: HashMap<ExpertCacheKey, DequantizedExpert>,
    /// Recency order, most-recently-used at the back.
    recency: Vec<ExpertCacheKey>,
}

/// LRU cache of dequantised expert weights, scoped to one MoE layer (see
/// `moe::mod`'s grounding note on why this isn't a single model-wide
/// instance). Invalidated wholesale when its owning `MoeWeights` drops,
/// i.e. on model unload, matching spec §5.
pub struct ExpertCache {
    capacity: usize,
    entries: Mutex<Entries>,
}

impl ExpertCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(Entries {
                map: HashMap::new(),
                recency: Vec::new(),
            }),
        }
    }

    /// Looks up `key`, marking it most-recently-used on a hit.
    pub fn get(&self, key: ExpertCacheKey) -> Option<DequantizedExpert> {
        let mut entries = self.entries.lock().unwrap();
        let hit = entries.map.get(&key).cloned()?;
        entries.recency.retain(|k| *k != key);
        entries.recency.push(key);
        Some(hit)
    }

    /// Inserts a freshly dequantised pair, evicting the least-recently-used
    /// entry first if this insert would exceed `capacity`. Evicted buffers
    /// are released back to `pool`.
    pub fn insert(&self, pool: &crate::buffer_pool::BufferPool, key: ExpertCacheKey, value: DequantizedExpert) {
        let mut entries = self.entries.lock().unwrap();
        if !entries.map.contains_key(&key) && entries.map.len() >= self.capacity && !entries.recency.is_empty() {
            let victim = entries.recency.remove(0);
            if let Some(evicted) = entries.map.remove(&victim) {
                pool.release(evicted.gate_up.buffer);
                pool.release(evicted.down.buffer);
                log::debug!(
                    "expert cache: evicted layer={} expert={} to admit layer={} expert={}",
                    victim.layer,
                    victim.expert,
                    key.layer,
                    key.expert
                );
            }
        }
        entries.recency.retain(|k| *k != key);
        entries.recency.push(key);
        entries.map.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `ExpertCache::insert` takes a live `&BufferPool` (needed on the
    // eviction path), which this crate's test suite has no fake for — see
    // the Design Notes on `Device`/`BufferPool` requiring a real `wgpu`
    // instance. Coverage here is limited to the pool-free `get` path and
    // key equality; `insert`/eviction are exercised by the integration
    // tests that stand up a real device.

    #[test]
    fn miss_on_empty_cache() {
        let cache = ExpertCache::new(2);
        let key = ExpertCacheKey { layer: 0, expert: 0, out_dtype: DType::F32 };
        assert!(cache.get(key).is_none());
    }

    #[test]
    fn distinct_dtypes_are_distinct_keys() {
        let a = ExpertCacheKey { layer: 0, expert: 0, out_dtype: DType::F32 };
        let b = ExpertCacheKey { layer: 0, expert: 0, out_dtype: DType::F16 };
        assert_ne!(a, b);
    }
}
