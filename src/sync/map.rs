//! Key/value sync map.

use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};

use crate::sync::{
    check_element_tag, read_element, write_element_delta, write_element_full, Replicable,
    SyncError, MARKER_CLEAN, MARKER_FULL, MARKER_SPARSE,
};
use crate::wire::value::{put_u32, put_u8, Value, WireReader};

/// An ordered map that diffs by key set.
///
/// Updating the value under an existing key travels as a sparse delta; any
/// change to the key set itself (insert of a new key, remove, clear) sends
/// the whole map on the next sync.
#[derive(Debug)]
pub struct SyncMap<K: Ord, V> {
    items: BTreeMap<K, V>,
    dirty: BTreeSet<K>,
    size_changed: bool,
}

impl<K, V> Default for SyncMap<K, V>
where
    K: Replicable + Ord + Clone,
    V: Replicable,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SyncMap<K, V>
where
    K: Replicable + Ord + Clone,
    V: Replicable,
{
    /// An empty map.
    pub fn new() -> Self {
        Self {
            items: BTreeMap::new(),
            dirty: BTreeSet::new(),
            size_changed: true,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when the map holds nothing.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// True when `key` has an entry.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.items.contains_key(key)
    }

    /// Borrow the value under `key`.
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.items.get(key)
    }

    /// Mutably borrow the value under `key`, marking the entry dirty.
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let owned = self.items.get_key_value(key).map(|(k, _)| k.clone());
        if let Some(k) = owned {
            self.dirty.insert(k);
        }
        self.items.get_mut(key)
    }

    /// Insert or overwrite an entry, returning the previous value.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if self.items.contains_key(&key) {
            self.dirty.insert(key.clone());
        } else {
            self.size_changed = true;
        }
        self.items.insert(key, value)
    }

    /// Remove an entry, returning its value.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let value = self.items.remove(key)?;
        self.dirty.remove(key);
        self.size_changed = true;
        Some(value)
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.items.clear();
        self.dirty.clear();
        self.size_changed = true;
    }

    /// Iterate over entries in key order.
    pub fn iter(&self) -> std::collections::btree_map::Iter<'_, K, V> {
        self.items.iter()
    }

    /// Iterate over keys in order.
    pub fn keys(&self) -> std::collections::btree_map::Keys<'_, K, V> {
        self.items.keys()
    }

    fn changed_keys(&self) -> Vec<&K> {
        self.items
            .iter()
            .filter(|(k, v)| self.dirty.contains(k) || v.is_dirty())
            .map(|(k, _)| k)
            .collect()
    }

    fn write_full_payload(&self, out: &mut Vec<u8>) -> Result<(), SyncError> {
        put_u8(out, MARKER_FULL);
        put_u32(out, self.items.len() as u32);
        for (key, value) in &self.items {
            write_element_full(key, out)?;
            write_element_full(value, out)?;
        }
        Ok(())
    }
}

impl<K, V> Replicable for SyncMap<K, V>
where
    K: Replicable + Ord + Clone,
    V: Replicable,
{
    const WIRE_TAG: u8 = Value::TAG_SYNC;

    fn is_dirty(&self) -> bool {
        self.size_changed || !self.changed_keys().is_empty()
    }

    fn mark_clean(&mut self) {
        self.size_changed = false;
        self.dirty.clear();
        self.items.values_mut().for_each(Replicable::mark_clean);
    }

    fn write_delta(&self, out: &mut Vec<u8>) -> Result<(), SyncError> {
        if self.size_changed {
            return self.write_full_payload(out);
        }
        let keys = self.changed_keys();
        if keys.is_empty() {
            put_u8(out, MARKER_CLEAN);
            return Ok(());
        }
        put_u8(out, MARKER_SPARSE);
        put_u32(out, keys.len() as u32);
        for key in keys {
            write_element_full(key, out)?;
            write_element_delta(&self.items[key], out)?;
        }
        Ok(())
    }

    fn write_full(&self, out: &mut Vec<u8>) -> Result<(), SyncError> {
        self.write_full_payload(out)
    }

    fn apply(&mut self, input: &mut WireReader<'_>) -> Result<(), SyncError> {
        match input.read_u8()? {
            MARKER_CLEAN => Ok(()),
            MARKER_SPARSE => {
                let count = input.read_u32()? as usize;
                for _ in 0..count {
                    let key = read_element::<K>(input)?;
                    check_element_tag::<V>(input)?;
                    match self.items.get_mut(&key) {
                        Some(value) => value.apply(input)?,
                        None => {
                            let mut value = V::default();
                            value.apply(input)?;
                            self.items.insert(key, value);
                        }
                    }
                }
                Ok(())
            }
            MARKER_FULL => {
                let count = input.read_u32()? as usize;
                let mut items = BTreeMap::new();
                for _ in 0..count {
                    let key = read_element::<K>(input)?;
                    let value = read_element::<V>(input)?;
                    items.insert(key, value);
                }
                self.items = items;
                self.dirty.clear();
                self.size_changed = false;
                Ok(())
            }
            other => Err(SyncError::UnknownMarker(other)),
        }
    }
}
