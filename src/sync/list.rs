//! Growable sync sequence.

use crate::sync::{
    check_element_tag, read_element, write_element_delta, write_element_full, Replicable,
    SyncError, MARKER_CLEAN, MARKER_FULL, MARKER_SPARSE,
};
use crate::wire::value::{put_u32, put_u8, Value, WireReader};

/// A growable sequence with per-slot change tracking.
///
/// In-place writes travel as sparse deltas; any length change (push, insert,
/// remove, clear) sends the whole list on the next sync. A fresh list starts
/// in the length-changed state so its first sync always carries everything.
#[derive(Debug)]
pub struct SyncList<T> {
    items: Vec<T>,
    dirty: Vec<bool>,
    size_changed: bool,
}

impl<T: Replicable> Default for SyncList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Replicable> SyncList<T> {
    /// An empty list.
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            dirty: Vec::new(),
            size_changed: true,
        }
    }

    /// A list seeded with `items`.
    pub fn from_values(items: Vec<T>) -> Self {
        let dirty = vec![false; items.len()];
        Self {
            items,
            dirty,
            size_changed: true,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when the list holds nothing.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Borrow an element.
    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    /// Mutably borrow an element, marking its slot dirty.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if index < self.items.len() {
            self.dirty[index] = true;
        }
        self.items.get_mut(index)
    }

    /// Overwrite an element in place. Panics when `index` is out of bounds.
    pub fn set(&mut self, index: usize, value: T) {
        self.items[index] = value;
        self.dirty[index] = true;
    }

    /// Append an element.
    pub fn push(&mut self, value: T) {
        self.items.push(value);
        self.dirty.push(true);
        self.size_changed = true;
    }

    /// Insert an element at `index`. Panics when `index > len`.
    pub fn insert(&mut self, index: usize, value: T) {
        self.items.insert(index, value);
        self.dirty.insert(index, true);
        self.size_changed = true;
    }

    /// Remove and return the last element.
    pub fn pop(&mut self) -> Option<T> {
        let value = self.items.pop()?;
        self.dirty.pop();
        self.size_changed = true;
        Some(value)
    }

    /// Remove and return the element at `index`. Panics when out of bounds.
    pub fn remove(&mut self, index: usize) -> T {
        let value = self.items.remove(index);
        self.dirty.remove(index);
        self.size_changed = true;
        value
    }

    /// Drop every element.
    pub fn clear(&mut self) {
        self.items.clear();
        self.dirty.clear();
        self.size_changed = true;
    }

    /// Iterate over the elements.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// The elements as a slice.
    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    fn dirty_slots(&self) -> Vec<usize> {
        (0..self.items.len())
            .filter(|&i| self.dirty[i] || self.items[i].is_dirty())
            .collect()
    }

    fn write_full_payload(&self, out: &mut Vec<u8>) -> Result<(), SyncError> {
        put_u8(out, MARKER_FULL);
        put_u32(out, self.items.len() as u32);
        for item in &self.items {
            write_element_full(item, out)?;
        }
        Ok(())
    }
}

impl<T: Replicable> Replicable for SyncList<T> {
    const WIRE_TAG: u8 = Value::TAG_SYNC;

    fn is_dirty(&self) -> bool {
        self.size_changed || !self.dirty_slots().is_empty()
    }

    fn mark_clean(&mut self) {
        self.size_changed = false;
        self.dirty.iter_mut().for_each(|d| *d = false);
        self.items.iter_mut().for_each(Replicable::mark_clean);
    }

    fn write_delta(&self, out: &mut Vec<u8>) -> Result<(), SyncError> {
        if self.size_changed {
            return self.write_full_payload(out);
        }
        let slots = self.dirty_slots();
        if slots.is_empty() {
            put_u8(out, MARKER_CLEAN);
            return Ok(());
        }
        put_u8(out, MARKER_SPARSE);
        put_u32(out, slots.len() as u32);
        for index in slots {
            put_u32(out, index as u32);
            write_element_delta(&self.items[index], out)?;
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
                    let index = input.read_u32()? as usize;
                    if index >= self.items.len() {
                        return Err(SyncError::SlotMismatch {
                            index,
                            len: self.items.len(),
                        });
                    }
                    check_element_tag::<T>(input)?;
                    self.items[index].apply(input)?;
                }
                Ok(())
            }
            MARKER_FULL => {
                let len = input.read_u32()? as usize;
                let mut items = Vec::with_capacity(len.min(4096));
                for _ in 0..len {
                    items.push(read_element::<T>(input)?);
                }
                self.items = items;
                self.dirty = vec![false; len];
                self.size_changed = false;
                Ok(())
            }
            other => Err(SyncError::UnknownMarker(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_into<T: Replicable>(from: &T, to: &mut T) {
        let mut buf = Vec::new();
        from.write_delta(&mut buf).unwrap();
        let mut reader = WireReader::new(&buf);
        to.apply(&mut reader).unwrap();
        assert!(reader.is_empty());
    }

    #[test]
    fn test_first_sync_is_full_even_when_empty() {
        let list: SyncList<i32> = SyncList::new();
        assert!(list.is_dirty());
        let mut buf = Vec::new();
        list.write_delta(&mut buf).unwrap();
        assert_eq!(buf, vec![MARKER_FULL, 0, 0, 0, 0]);
    }

    #[test]
    fn test_full_sync_reproduces_contents() {
        let mut hand = SyncList::from_values(vec![3i32, 7, 11]);
        let mut mirror: SyncList<i32> = SyncList::new();

        sync_into(&hand, &mut mirror);
        hand.mark_clean();
        assert_eq!(mirror.as_slice(), &[3, 7, 11]);
        assert!(!mirror.is_dirty());
        assert!(!hand.is_dirty());
    }

    #[test]
    fn test_in_place_write_travels_sparse() {
        let mut scores = SyncList::from_values(vec![0i32, 0, 0]);
        let mut mirror: SyncList<i32> = SyncList::new();
        sync_into(&scores, &mut mirror);
        scores.mark_clean();

        scores.set(1, 250);
        let mut buf = Vec::new();
        scores.write_delta(&mut buf).unwrap();
        assert_eq!(buf[0], MARKER_SPARSE);

        mirror.apply(&mut WireReader::new(&buf)).unwrap();
        assert_eq!(mirror.as_slice(), &[0, 250, 0]);
        assert!(!mirror.is_dirty());
    }

    #[test]
    fn test_clean_list_sends_one_byte() {
        let mut list = SyncList::from_values(vec![1i32]);
        list.mark_clean();
        assert!(!list.is_dirty());
        let mut buf = Vec::new();
        list.write_delta(&mut buf).unwrap();
        assert_eq!(buf, vec![MARKER_CLEAN]);
    }

    #[test]
    fn test_any_size_change_forces_full() {
        let mut list = SyncList::from_values(vec![1i32, 2]);
        list.mark_clean();

        list.push(3);
        let mut buf = Vec::new();
        list.write_delta(&mut buf).unwrap();
        assert_eq!(buf[0], MARKER_FULL);
        list.mark_clean();

        list.remove(0);
        let mut buf = Vec::new();
        list.write_delta(&mut buf).unwrap();
        assert_eq!(buf[0], MARKER_FULL);

        let mut mirror: SyncList<i32> = SyncList::new();
        mirror.apply(&mut WireReader::new(&buf)).unwrap();
        assert_eq!(mirror.as_slice(), &[2, 3]);
    }

    #[test]
    fn test_sparse_slot_past_end_is_rejected() {
        let mut long = SyncList::from_values(vec![1i32, 2, 3]);
        long.mark_clean();
        long.set(2, 9);

        let mut buf = Vec::new();
        long.write_delta(&mut buf).unwrap();

        let mut short = SyncList::from_values(vec![1i32]);
        let err = short.apply(&mut WireReader::new(&buf)).unwrap_err();
        assert!(matches!(err, SyncError::SlotMismatch { index: 2, len: 1 }));
    }

    #[test]
    fn test_nested_lists_compose_partial_updates() {
        let mut table: SyncList<SyncList<i32>> = SyncList::new();
        table.push(SyncList::from_values(vec![1, 2]));
        table.push(SyncList::from_values(vec![3, 4]));

        let mut mirror: SyncList<SyncList<i32>> = SyncList::new();
        sync_into(&table, &mut mirror);
        table.mark_clean();

        // Mutate one inner slot; only that inner delta should travel.
        table.get_mut(1).unwrap().set(0, 30);
        assert!(table.is_dirty());

        let mut buf = Vec::new();
        table.write_delta(&mut buf).unwrap();
        assert_eq!(buf[0], MARKER_SPARSE);

        mirror.apply(&mut WireReader::new(&buf)).unwrap();
        assert_eq!(mirror.get(0).unwrap().as_slice(), &[1, 2]);
        assert_eq!(mirror.get(1).unwrap().as_slice(), &[30, 4]);

        table.mark_clean();
        assert!(!table.is_dirty());
        assert!(!table.get(1).unwrap().is_dirty());
    }

    #[test]
    fn test_inner_growth_travels_inside_sparse_entry() {
        let mut table: SyncList<SyncList<i32>> = SyncList::new();
        table.push(SyncList::from_values(vec![1]));
        let mut mirror: SyncList<SyncList<i32>> = SyncList::new();
        sync_into(&table, &mut mirror);
        table.mark_clean();

        table.get_mut(0).unwrap().push(2);
        sync_into(&table, &mut mirror);
        assert_eq!(mirror.get(0).unwrap().as_slice(), &[1, 2]);
    }
}
