//! Layered concurrent table (K1 → K2 → V).
//!
//! Same layering and locking rules as [`Map`](crate::Map), keyed on a pair.
//! Local storage is a map of rows: each K1 owns an inner map from K2 to V.
//! A row is created by the first write into it and dropped when a delete
//! leaves it empty, so an empty row is never observable.

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

/// Concurrent two-key table with optional shadow fallthrough.
///
/// Like [`Map`](crate::Map), a cheap handle: `clone()` shares the container.
pub struct Table<K1, K2, V> {
    inner: Arc<TableInner<K1, K2, V>>,
}

struct TableInner<K1, K2, V> {
    /// Rows written through this container
    local: RwLock<HashMap<K1, HashMap<K2, V>>>,
    /// Read-only fallback, shared with every other copy of it
    shadow: Option<Table<K1, K2, V>>,
    depth: usize,
    config: Config,
}

impl<K1, K2, V> Table<K1, K2, V> {
    /// Create an empty root table with the default config.
    pub fn new() -> Self {
        Self::build(Config::default(), None, 0)
    }

    /// Create an empty root table, validating `config` first.
    pub fn with_config(config: Config) -> StoreResult<Self> {
        Ok(Self::build(config.checked()?, None, 0))
    }

    fn build(config: Config, shadow: Option<Table<K1, K2, V>>, depth: usize) -> Self {
        Self {
            inner: Arc::new(TableInner {
                local: RwLock::new(HashMap::with_capacity(config.initial_capacity)),
                shadow,
                depth,
                config,
            }),
        }
    }

    /// Returns a new, empty table whose shadow is `self`.
    ///
    /// The copy inherits this table's config. Lookups on the copy recurse
    /// once per shadow level, so each level of chain depth costs a stack
    /// frame on `get`, `contains` and `to_map`.
    pub fn shadow_copy(&self) -> Self {
        let depth = self.inner.depth + 1;
        trace!("table shadow copy created at depth {}", depth);
        Self::build(self.inner.config, Some(self.clone()), depth)
    }

    /// The shadow this table falls through to, if any.
    pub fn shadow(&self) -> Option<&Table<K1, K2, V>> {
        self.inner.shadow.as_ref()
    }

    /// 0 for a root table, shadow depth + 1 for a shadow copy.
    pub fn depth(&self) -> usize {
        self.inner.depth
    }

    /// Config this table was created with (inherited by shadow copies).
    pub fn config(&self) -> Config {
        self.inner.config
    }

    /// Number of (k1, k2) pairs written locally.
    pub fn local_len(&self) -> usize {
        self.inner.local.read().values().map(HashMap::len).sum()
    }

    /// True if no row has been written locally.
    pub fn is_local_empty(&self) -> bool {
        self.inner.local.read().is_empty()
    }

    fn new_row(&self) -> HashMap<K2, V> {
        HashMap::with_capacity(self.inner.config.row_capacity)
    }
}

impl<K1, K2, V> Table<K1, K2, V>
where
    K1: Eq + Hash,
    K2: Eq + Hash,
    V: Clone,
{
    /// Stores `new_val` under (k1, k2) unless the pair is already present
    /// locally. The shadow is not consulted.
    pub fn add(&self, k1: K1, k2: K2, new_val: V) -> StoreResult<()> {
        let mut local = self.inner.local.write();
        let row = match local.entry(k1) {
            Entry::Occupied(row) => row.into_mut(),
            Entry::Vacant(slot) => slot.insert(self.new_row()),
        };
        match row.entry(k2) {
            Entry::Occupied(_) => Err(StoreError::DuplicateKey),
            Entry::Vacant(slot) => {
                slot.insert(new_val);
                Ok(())
            }
        }
    }

    /// True if (k1, k2) is present locally or anywhere in the shadow chain.
    pub fn contains<Q1, Q2>(&self, k1: &Q1, k2: &Q2) -> bool
    where
        K1: Borrow<Q1>,
        K2: Borrow<Q2>,
        Q1: ?Sized + Hash + Eq,
        Q2: ?Sized + Hash + Eq,
    {
        let local_hit = self
            .inner
            .local
            .read()
            .get(k1)
            .map_or(false, |row| row.contains_key(k2));
        if local_hit {
            return true;
        }
        self.inner.shadow.as_ref().map_or(false, |shadow| shadow.contains(k1, k2))
    }

    /// True if any (k1, _) pair is visible from this table.
    pub fn contains_row<Q1>(&self, k1: &Q1) -> bool
    where
        K1: Borrow<Q1>,
        Q1: ?Sized + Hash + Eq,
    {
        let local_hit = self.inner.local.read().contains_key(k1);
        if local_hit {
            return true;
        }
        self.inner.shadow.as_ref().map_or(false, |shadow| shadow.contains_row(k1))
    }

    /// Removes (k1, k2) from local storage, dropping the row if it empties.
    ///
    /// Fails with `CannotDeleteFromShadow` if the pair only exists further up
    /// the chain, and with `KeyNotFound` if it exists nowhere.
    pub fn delete<Q1, Q2>(&self, k1: &Q1, k2: &Q2) -> StoreResult<()>
    where
        K1: Borrow<Q1>,
        K2: Borrow<Q2>,
        Q1: ?Sized + Hash + Eq,
        Q2: ?Sized + Hash + Eq,
    {
        let mut local = self.inner.local.write();
        let (removed, row_empty) = match local.get_mut(k1) {
            Some(row) => (row.remove(k2).is_some(), row.is_empty()),
            None => (false, false),
        };
        if removed {
            if row_empty {
                local.remove(k1);
            }
            return Ok(());
        }

        match &self.inner.shadow {
            Some(shadow) if shadow.contains(k1, k2) => {
                debug!("table delete rejected at depth {}: pair lives in shadow", self.inner.depth);
                Err(StoreError::CannotDeleteFromShadow)
            }
            _ => Err(StoreError::KeyNotFound),
        }
    }

    /// Returns the local value for (k1, k2), else the shadow chain's value.
    pub fn get<Q1, Q2>(&self, k1: &Q1, k2: &Q2) -> StoreResult<V>
    where
        K1: Borrow<Q1>,
        K2: Borrow<Q2>,
        Q1: ?Sized + Hash + Eq,
        Q2: ?Sized + Hash + Eq,
    {
        let found = self.local_value(k1, k2);
        match (found, &self.inner.shadow) {
            (Some(val), _) => Ok(val),
            (None, Some(shadow)) => shadow.get(k1, k2),
            (None, None) => Err(StoreError::KeyNotFound),
        }
    }

    /// Like [`Table::get`], returning `def` when the pair exists nowhere.
    pub fn get_or_default<Q1, Q2>(&self, k1: &Q1, k2: &Q2, def: V) -> V
    where
        K1: Borrow<Q1>,
        K2: Borrow<Q2>,
        Q1: ?Sized + Hash + Eq,
        Q2: ?Sized + Hash + Eq,
    {
        let found = self.local_value(k1, k2);
        match (found, &self.inner.shadow) {
            (Some(val), _) => val,
            (None, Some(shadow)) => shadow.get_or_default(k1, k2, def),
            (None, None) => def,
        }
    }

    /// Returns the visible value for (k1, k2), storing `new_val` locally only
    /// when the pair exists nowhere in the chain.
    ///
    /// Runs entirely under this table's write lock:
    /// 1. row and pair local: return the local value
    /// 2. row local, pair in shadow: return the shadow value, no write
    /// 3. row local, pair nowhere: insert into the existing row
    /// 4. no local row: shadow value if any, else create the row and insert
    pub fn get_or_set(&self, k1: K1, k2: K2, new_val: V) -> V {
        let mut local = self.inner.local.write();
        match local.get_mut(&k1) {
            Some(row) => {
                if let Some(val) = row.get(&k2) {
                    return val.clone();
                }
                if let Some(val) = self.shadow_value(&k1, &k2) {
                    return val;
                }
                row.insert(k2, new_val.clone());
            }
            None => {
                if let Some(val) = self.shadow_value(&k1, &k2) {
                    return val;
                }
                let mut row = self.new_row();
                row.insert(k2, new_val.clone());
                local.insert(k1, row);
            }
        }
        new_val
    }

    /// Stores `new_val` under (k1, k2) locally, creating the row if needed.
    pub fn set(&self, k1: K1, k2: K2, new_val: V) -> StoreResult<()> {
        let mut local = self.inner.local.write();
        match local.entry(k1) {
            Entry::Occupied(row) => {
                row.into_mut().insert(k2, new_val);
            }
            Entry::Vacant(slot) => {
                slot.insert(self.new_row()).insert(k2, new_val);
            }
        }
        Ok(())
    }

    /// Flattens the chain into nested plain maps.
    ///
    /// Merging is per pair: a row present both locally and in the shadow
    /// keeps the shadow's other columns, with local values winning on each
    /// shared k2.
    pub fn to_map(&self) -> HashMap<K1, HashMap<K2, V>>
    where
        K1: Clone,
        K2: Clone,
    {
        let local = self.inner.local.read().clone();
        match &self.inner.shadow {
            None => local,
            Some(shadow) => {
                let mut merged = shadow.to_map();
                trace!(
                    "table flatten at depth {}: {} shadow rows, {} local",
                    self.inner.depth,
                    merged.len(),
                    local.len()
                );
                for (k1, row) in local {
                    merged.entry(k1).or_insert_with(|| self.new_row()).extend(row);
                }
                merged
            }
        }
    }

    fn local_value<Q1, Q2>(&self, k1: &Q1, k2: &Q2) -> Option<V>
    where
        K1: Borrow<Q1>,
        K2: Borrow<Q2>,
        Q1: ?Sized + Hash + Eq,
        Q2: ?Sized + Hash + Eq,
    {
        self.inner.local.read().get(k1).and_then(|row| row.get(k2)).cloned()
    }

    fn shadow_value(&self, k1: &K1, k2: &K2) -> Option<V> {
        self.inner.shadow.as_ref().and_then(|shadow| shadow.get(k1, k2).ok())
    }
}

/// Releases the shadow chain one level at a time instead of recursively.
impl<K1, K2, V> Drop for TableInner<K1, K2, V> {
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

impl<K1, K2, V> Clone for Table<K1, K2, V> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<K1, K2, V> Default for Table<K1, K2, V> {
    fn default() -> Self { Self::new() }
}

impl<K1, K2, V> fmt::Debug for Table<K1, K2, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("depth", &self.inner.depth)
            .field("local_len", &self.local_len())
            .finish()
    }
}

/// Builds a root table; later triples overwrite earlier ones.
impl<K1, K2, V> FromIterator<(K1, K2, V)> for Table<K1, K2, V>
where
    K1: Eq + Hash,
    K2: Eq + Hash,
{
    fn from_iter<I: IntoIterator<Item = (K1, K2, V)>>(iter: I) -> Self {
        let table = Self::new();
        {
            let mut local = table.inner.local.write();
            for (k1, k2, v) in iter {
                local.entry(k1).or_insert_with(|| table.new_row()).insert(k2, v);
            }
        }
        table
    }
}
