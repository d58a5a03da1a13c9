use std::hash::Hash;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;

/// A copy-on-write map that is optimized for frequent lock-free reads and rare updates: every
///  update clones the map, and readers see either the old or the new version in its entirety.
pub struct AtomicMap<K,V> {
    map: ArcSwap<FxHashMap<K,V>>,
}
impl <K: Hash+Eq+Clone+Sync+Send,V:Clone+Sync+Send> Default for AtomicMap<K,V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash+Eq+Clone+Sync+Send, V:Clone+Sync+Send> AtomicMap<K,V> {
    pub fn new() -> AtomicMap<K,V> {
        AtomicMap {
            map: ArcSwap::from_pointee(FxHashMap::default()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.map.load()
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.map.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// a consistent snapshot of all values at the time of the call
    pub fn values(&self) -> Vec<V> {
        self.map.load()
            .values()
            .cloned()
            .collect()
    }

    /// Applies `f` to a copy of the current map and publishes the result. If another update
    ///  was published concurrently, `f` is re-applied to the newer map, so it must not have
    ///  side effects beyond the map it is passed.
    pub fn update<R>(&self, f: impl Fn(&mut FxHashMap<K,V>) -> R) -> R {
        loop {
            let old = self.map.load_full();

            let mut map: FxHashMap<K,V> = (*old).clone();
            let result = f(&mut map);

            let prev = self.map.compare_and_swap(&old, Arc::new(map));
            if Arc::ptr_eq(&prev, &old) {
                return result;
            }
        }
    }
}
