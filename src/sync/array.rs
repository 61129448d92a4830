//! Fixed-size sync array.

use crate::sync::{
    check_element_tag, read_element, write_element_delta, write_element_full, Replicable,
    SyncError, MARKER_CLEAN, MARKER_FULL, MARKER_SPARSE,
};
use crate::wire::value::{put_u32, put_u8, Value, WireReader};

/// A sequence whose length is fixed at construction.
///
/// Only in-place writes exist, so after the first sync everything travels as
/// sparse deltas. A mirror built by applying a full payload adopts the
/// sender's length.
#[derive(Debug)]
pub struct SyncArray<T> {
    items: Vec<T>,
    dirty: Vec<bool>,
    size_changed: bool,
}

impl<T: Replicable> Default for SyncArray<T> {
    fn default() -> Self {
        Self::new(0)
    }
}

impl<T: Replicable> SyncArray<T> {
    /// An array of `len` default values.
    pub fn new(len: usize) -> Self {
        let mut items = Vec::with_capacity(len);
        items.resize_with(len, T::default);
        Self {
            items,
            dirty: vec![false; len],
            size_changed: true,
        }
    }

    /// An array seeded with `items`; the length is theirs.
    pub fn from_values(items: Vec<T>) -> Self {
        let dirty = vec![false; items.len()];
        Self {
            items,
            dirty,
            size_changed: true,
        }
    }

    /// The fixed length.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True for a zero-length array.
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

impl<T: Replicable> Replicable for SyncArray<T> {
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

    #[test]
    fn test_new_array_holds_defaults_and_syncs_full() {
        let seats: SyncArray<i32> = SyncArray::new(4);
        assert_eq!(seats.as_slice(), &[0, 0, 0, 0]);
        assert!(seats.is_dirty());

        let mut buf = Vec::new();
        seats.write_delta(&mut buf).unwrap();
        assert_eq!(buf[0], MARKER_FULL);

        let mut mirror: SyncArray<i32> = SyncArray::default();
        mirror.apply(&mut WireReader::new(&buf)).unwrap();
        assert_eq!(mirror.len(), 4);
    }

    #[test]
    fn test_steady_state_is_sparse() {
        let mut tricks = SyncArray::from_values(vec![0i32, 0, 0, 0]);
        let mut mirror: SyncArray<i32> = SyncArray::default();

        let mut buf = Vec::new();
        tricks.write_delta(&mut buf).unwrap();
        mirror.apply(&mut WireReader::new(&buf)).unwrap();
        tricks.mark_clean();

        tricks.set(2, 5);
        tricks.set(0, 1);
        let mut buf = Vec::new();
        tricks.write_delta(&mut buf).unwrap();
        assert_eq!(buf[0], MARKER_SPARSE);

        mirror.apply(&mut WireReader::new(&buf)).unwrap();
        assert_eq!(mirror.as_slice(), &[1, 0, 5, 0]);
    }

    #[test]
    fn test_wrong_element_type_is_rejected() {
        let mut floats = SyncArray::from_values(vec![1.0f64, 2.0]);
        floats.mark_clean();
        floats.set(0, 9.0);

        let mut buf = Vec::new();
        floats.write_delta(&mut buf).unwrap();

        let mut ints = SyncArray::from_values(vec![0i32, 0]);
        assert!(matches!(
            ints.apply(&mut WireReader::new(&buf)).unwrap_err(),
            SyncError::TagMismatch { .. }
        ));
    }

    #[test]
    fn test_clean_array_sends_one_byte() {
        let mut arr = SyncArray::from_values(vec![false, true]);
        arr.mark_clean();
        let mut buf = Vec::new();
        arr.write_delta(&mut buf).unwrap();
        assert_eq!(buf, vec![MARKER_CLEAN]);
    }
}
