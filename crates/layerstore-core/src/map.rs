//! Layered concurrent map (K → V).
//!
//! A Map owns its local entries behind a RwLock and may hold a read-only
//! handle to a shadow Map. Reads fall through to the shadow for keys that
//! were never written locally; writes only ever touch local storage.
//!
//! **Read path**: shared lock on local, released before the shadow is asked
//! **Write path**: exclusive lock on local for the whole operation, shadow
//! consulted through its own public API while held
//!
//! A shadow is fixed when the copy is created and there is no way to
//! reassign it, so a chain can never loop back on itself.

use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::iter::FromIterator;
use std::sync::Arc;

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use log::{debug, trace};
use parking_lot::RwLock;

use crate::config::Config;
use crate::error::{StoreError, StoreResult};

/// Concurrent map with optional shadow fallthrough.
///
/// This is a cheap handle: `clone()` returns another handle to the same
/// container, not a copy of it. Use [`Map::shadow_copy`] for an overlay.
pub struct Map<K, V> {
    inner: Arc<MapInner<K, V>>,
}

struct MapInner<K, V> {
    /// Entries written through this container
    local: RwLock<HashMap<K, V>>,
    /// Read-only fallback, shared with every other copy of it
    shadow: Option<Map<K, V>>,
    /// Number of shadows between this container and its root
    depth: usize,
    config: Config,
}

impl<K, V> Map<K, V> {
    /// Create an empty root map with the default config.
    pub fn new() -> Self {
        Self::build(Config::default(), None, 0)
    }

    /// Create an empty root map, validating `config` first.
    pub fn with_config(config: Config) -> StoreResult<Self> {
        Ok(Self::build(config.checked()?, None, 0))
    }

    fn build(config: Config, shadow: Option<Map<K, V>>, depth: usize) -> Self {
        Self {
            inner: Arc::new(MapInner {
                local: RwLock::new(HashMap::with_capacity(config.initial_capacity)),
                shadow,
                depth,
                config,
            }),
        }
    }

    /// Returns a new, empty map whose shadow is `self`.
    ///
    /// The copy inherits this map's config. `self` is never written through
    /// the copy. Lookups on the copy recurse once per shadow level, so each
    /// level of chain depth costs a stack frame on `get`, `contains` and
    /// `to_map`.
    pub fn shadow_copy(&self) -> Self {
        let depth = self.inner.depth + 1;
        trace!("map shadow copy created at depth {}", depth);
        Self::build(self.inner.config, Some(self.clone()), depth)
    }

    /// The shadow this map falls through to, if any.
    pub fn shadow(&self) -> Option<&Map<K, V>> {
        self.inner.shadow.as_ref()
    }

    /// 0 for a root map, shadow depth + 1 for a shadow copy.
    pub fn depth(&self) -> usize {
        self.inner.depth
    }

    /// Config this map was created with (inherited by shadow copies).
    pub fn config(&self) -> Config {
        self.inner.config
    }

    /// Number of entries written locally. Shadow entries are not counted.
    pub fn local_len(&self) -> usize {
        self.inner.local.read().len()
    }

    /// True if nothing has been written locally.
    pub fn is_local_empty(&self) -> bool {
        self.inner.local.read().is_empty()
    }
}

impl<K, V> Map<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Stores `val` under `key` unless `key` is already present locally.
    ///
    /// Only local storage is checked: a key that exists solely in the shadow
    /// can be added, which overrides the shadow's value for this map.
    pub fn add(&self, key: K, val: V) -> StoreResult<()> {
        let mut local = self.inner.local.write();
        match local.entry(key) {
            Entry::Occupied(_) => Err(StoreError::DuplicateKey),
            Entry::Vacant(slot) => {
                slot.insert(val);
                Ok(())
            }
        }
    }

    /// True if `key` is present locally or anywhere in the shadow chain.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let local_hit = self.inner.local.read().contains_key(key);
        if local_hit {
            return true;
        }
        self.inner.shadow.as_ref().map_or(false, |shadow| shadow.contains(key))
    }

    /// Removes `key` from local storage.
    ///
    /// Fails with `CannotDeleteFromShadow` if the key only exists further up
    /// the chain, and with `KeyNotFound` if it exists nowhere.
    pub fn delete<Q>(&self, key: &Q) -> StoreResult<()>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let mut local = self.inner.local.write();
        if local.remove(key).is_some() {
            return Ok(());
        }

        match &self.inner.shadow {
            Some(shadow) if shadow.contains(key) => {
                debug!("map delete rejected at depth {}: key lives in shadow", self.inner.depth);
                Err(StoreError::CannotDeleteFromShadow)
            }
            _ => Err(StoreError::KeyNotFound),
        }
    }

    /// Returns the local value for `key`, else the shadow chain's value.
    pub fn get<Q>(&self, key: &Q) -> StoreResult<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let found = self.inner.local.read().get(key).cloned();
        match (found, &self.inner.shadow) {
            (Some(val), _) => Ok(val),
            (None, Some(shadow)) => shadow.get(key),
            (None, None) => Err(StoreError::KeyNotFound),
        }
    }

    /// Like [`Map::get`], returning `def` when the key exists nowhere.
    pub fn get_or_default<Q>(&self, key: &Q, def: V) -> V
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let found = self.inner.local.read().get(key).cloned();
        match (found, &self.inner.shadow) {
            (Some(val), _) => val,
            (None, Some(shadow)) => shadow.get_or_default(key, def),
            (None, None) => def,
        }
    }

    /// Returns the visible value for `key`, storing `def` locally only when
    /// the key exists nowhere in the chain.
    ///
    /// A shadow hit is returned as-is and NOT copied into local storage.
    /// The whole check-then-insert runs under this map's write lock.
    pub fn get_or_set(&self, key: K, def: V) -> V {
        let mut local = self.inner.local.write();
        if let Some(val) = local.get(&key) {
            return val.clone();
        }

        if let Some(shadow) = &self.inner.shadow {
            if let Ok(val) = shadow.get(&key) {
                return val;
            }
        }

        local.insert(key, def.clone());
        def
    }

    /// Stores `val` under `key` locally, overwriting any local value.
    pub fn set(&self, key: K, val: V) -> StoreResult<()> {
        self.inner.local.write().insert(key, val);
        Ok(())
    }

    /// Flattens the chain into a plain map snapshot.
    ///
    /// Shadow entries form the base layer and local entries are applied on
    /// top, so a local value wins over any shadow value for the same key.
    pub fn to_map(&self) -> HashMap<K, V>
    where
        K: Clone,
    {
        let local = self.inner.local.read().clone();
        match &self.inner.shadow {
            None => local,
            Some(shadow) => {
                let mut merged = shadow.to_map();
                trace!(
                    "map flatten at depth {}: {} shadow entries, {} local",
                    self.inner.depth,
                    merged.len(),
                    local.len()
                );
                merged.extend(local);
                merged
            }
        }
    }
}

/// Releases the shadow chain one level at a time instead of recursively.
impl<K, V> Drop for MapInner<K, V> {
    fn drop(&mut self) {
        let mut next = self.shadow.take();
        while let Some(shadow) = next {
            match Arc::try_unwrap(shadow.inner) {
                Ok(mut inner) => next = inner.shadow.take(),
                // Still referenced elsewhere
                Err(_) => break,
            }
        }
    }
}

impl<K, V> Clone for Map<K, V> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<K, V> Default for Map<K, V> {
    fn default() -> Self { Self::new() }
}

impl<K, V> fmt::Debug for Map<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Map")
            .field("depth", &self.inner.depth)
            .field("local_len", &self.local_len())
            .finish()
    }
}

/// Builds a root map; later pairs overwrite earlier ones.
impl<K, V> FromIterator<(K, V)> for Map<K, V>
where
    K: Eq + Hash,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let map = Self::new();
        map.inner.local.write().extend(iter);
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn root_with_a() -> Map<String, i32> {
        let root = Map::new();
        root.set("a".to_string(), 1).unwrap();
        root
    }

    #[test]
    fn test_new_is_empty() {
        let map: Map<String, i32> = Map::new();
        assert!(map.is_local_empty());
        assert_eq!(map.depth(), 0);
        assert!(map.shadow().is_none());
        assert!(!map.contains("missing"));
        assert_eq!(map.get("missing"), Err(StoreError::KeyNotFound));
    }

    #[test]
    fn test_add_then_duplicate() {
        let map = Map::new();
        map.add("k", 1).unwrap();
        assert_eq!(map.add("k", 2), Err(StoreError::DuplicateKey));
        // Failed add leaves the first value in place
        assert_eq!(map.get("k"), Ok(1));
    }

    #[test]
    fn test_add_after_delete() {
        let map = Map::new();
        map.add("k", 1).unwrap();
        map.delete("k").unwrap();
        map.add("k", 2).unwrap();
        assert_eq!(map.get("k"), Ok(2));
    }

    #[test]
    fn test_set_overwrites() {
        let map = Map::new();
        map.set("k", 1).unwrap();
        map.set("k", 2).unwrap();
        assert_eq!(map.get("k"), Ok(2));
        assert_eq!(map.local_len(), 1);
    }

    #[test]
    fn test_delete_missing() {
        let map: Map<&str, i32> = Map::new();
        assert_eq!(map.delete("nope"), Err(StoreError::KeyNotFound));
    }

    #[test]
    fn test_get_or_default() {
        let root = root_with_a();
        let child = root.shadow_copy();
        assert_eq!(child.get_or_default("a", 0), 1);
        assert_eq!(child.get_or_default("z", 7), 7);
        child.set("a".to_string(), 5).unwrap();
        assert_eq!(child.get_or_default("a", 0), 5);
    }

    #[test]
    fn test_get_or_set_writes_once() {
        let map = Map::new();
        assert_eq!(map.get_or_set("k", 1), 1);
        assert_eq!(map.get_or_set("k", 2), 1);
        assert_eq!(map.get("k"), Ok(1));
    }

    #[test]
    fn test_get_or_set_reads_through_without_promoting() {
        let root = root_with_a();
        let child = root.shadow_copy();
        assert_eq!(child.get_or_set("a".to_string(), 9), 1);
        assert!(child.is_local_empty());
    }

    #[test]
    fn test_get_or_set_writes_when_absent_from_shadow() {
        let root = root_with_a();
        let child = root.shadow_copy();
        assert_eq!(child.get_or_set("b".to_string(), 2), 2);
        assert_eq!(child.local_len(), 1);
        assert!(!root.contains("b"));
    }

    #[test]
    fn test_shadow_example() {
        let root = root_with_a();
        let child = root.shadow_copy();
        child.set("b".to_string(), 2).unwrap();

        let flat = child.to_map();
        assert_eq!(flat.len(), 2);
        assert_eq!(flat.get("a"), Some(&1));
        assert_eq!(flat.get("b"), Some(&2));
        assert_eq!(root.to_map().len(), 1);

        assert_eq!(child.delete("a"), Err(StoreError::CannotDeleteFromShadow));
        child.add("a".to_string(), 9).unwrap();
        assert_eq!(child.get("a"), Ok(9));
        assert_eq!(root.get("a"), Ok(1));
    }

    #[test]
    fn test_delete_local_override_reveals_shadow() {
        let root = root_with_a();
        let child = root.shadow_copy();
        child.set("a".to_string(), 9).unwrap();
        child.delete("a").unwrap();
        assert_eq!(child.get("a"), Ok(1));
        assert_eq!(child.delete("a"), Err(StoreError::CannotDeleteFromShadow));
    }

    #[test]
    fn test_to_map_local_wins() {
        let root = root_with_a();
        let child = root.shadow_copy();
        child.set("a".to_string(), 2).unwrap();
        assert_eq!(child.to_map().get("a"), Some(&2));
        assert_eq!(root.to_map().get("a"), Some(&1));
    }

    #[test]
    fn test_clone_shares_container() {
        let map = Map::new();
        let handle = map.clone();
        handle.set("k", 1).unwrap();
        assert_eq!(map.get("k"), Ok(1));
    }

    #[test]
    fn test_depth_and_config_inherited() {
        let root: Map<u32, u32> = Map::with_config(Config::compact()).unwrap();
        let grandchild = root.shadow_copy().shadow_copy();
        assert_eq!(grandchild.depth(), 2);
        assert_eq!(grandchild.config(), Config::compact());
        assert_eq!(grandchild.shadow().map(Map::depth), Some(1));
    }

    #[test]
    fn test_with_config_rejects_invalid() {
        let mut config = Config::standard();
        config.initial_capacity = usize::MAX;
        assert!(matches!(
            Map::<u32, u32>::with_config(config),
            Err(StoreError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_from_iter() {
        let map: Map<&str, i32> = vec![("a", 1), ("b", 2), ("a", 3)].into_iter().collect();
        assert_eq!(map.local_len(), 2);
        assert_eq!(map.get("a"), Ok(3));
    }

    #[test]
    fn test_debug_output() {
        let map: Map<u8, u8> = Map::new().shadow_copy();
        let dbg = format!("{:?}", map);
        assert!(dbg.contains("depth: 1"));
        assert!(dbg.contains("local_len: 0"));
    }

    #[test]
    fn test_drop_deep_chain() {
        let root: Map<u32, u32> = Map::with_config(Config::compact()).unwrap();
        root.set(1, 1).unwrap();
        let mut leaf = root.clone();
        for _ in 0..100_000 {
            leaf = leaf.shadow_copy();
        }
        assert_eq!(leaf.depth(), 100_000);
        drop(leaf);
        assert_eq!(root.get(&1), Ok(1));

        // Without an outside handle the whole chain is released
        let mut leaf: Map<u32, u32> = Map::with_config(Config::compact()).unwrap();
        for _ in 0..100_000 {
            leaf = leaf.shadow_copy();
        }
        drop(leaf);
    }

    #[test]
    fn test_drop_middle_handle_keeps_chain() {
        let root: Map<u32, u32> = Map::new();
        root.set(1, 1).unwrap();
        let mid = root.shadow_copy();
        mid.set(2, 2).unwrap();
        let leaf = mid.shadow_copy();
        drop(mid);
        drop(root);
        assert_eq!(leaf.get(&1), Ok(1));
        assert_eq!(leaf.get(&2), Ok(2));
    }

    #[test]
    fn test_concurrent_get_or_set() {
        let map: Map<&str, usize> = Map::new();
        let mut handles = vec![];
        for i in 0..16 {
            let m = map.clone();
            handles.push(thread::spawn(move || m.get_or_set("shared", i)));
        }
        let results: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winner = map.get("shared").unwrap();
        assert!(results.iter().all(|&r| r == winner));
        assert_eq!(map.local_len(), 1);
    }
}
