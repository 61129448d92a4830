//! Whole-object sync wrapper.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::sync::{Replicable, SyncError, MARKER_CLEAN, MARKER_FULL};
use crate::wire::value::{put_u32, put_u8, Value, WireReader};

/// Whole-object replication for any serde type.
///
/// One dirty flag covers the entire value: any mutation resends the full
/// bincode payload on the next sync. The right wrapper for small structs
/// whose fields change together; reach for the per-slot containers where
/// partial updates pay off.
#[derive(Debug)]
pub struct SyncObject<T> {
    value: T,
    dirty: bool,
}

impl<T> SyncObject<T> {
    /// Wrap a value; the first sync sends it whole.
    pub fn new(value: T) -> Self {
        Self { value, dirty: true }
    }

    /// Borrow the value.
    pub fn get(&self) -> &T {
        &self.value
    }

    /// Mutably borrow the value, marking it dirty.
    pub fn get_mut(&mut self) -> &mut T {
        self.dirty = true;
        &mut self.value
    }

    /// Replace the value, returning the previous one.
    pub fn replace(&mut self, value: T) -> T {
        self.dirty = true;
        std::mem::replace(&mut self.value, value)
    }
}

impl<T: Default> Default for SyncObject<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Replicable for SyncObject<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    const WIRE_TAG: u8 = Value::TAG_SYNC;

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn mark_clean(&mut self) {
        self.dirty = false;
    }

    fn write_delta(&self, out: &mut Vec<u8>) -> Result<(), SyncError> {
        if !self.dirty {
            put_u8(out, MARKER_CLEAN);
            return Ok(());
        }
        self.write_full(out)
    }

    fn write_full(&self, out: &mut Vec<u8>) -> Result<(), SyncError> {
        let payload = bincode::serialize(&self.value)?;
        put_u8(out, MARKER_FULL);
        put_u32(out, payload.len() as u32);
        out.extend_from_slice(&payload);
        Ok(())
    }

    fn apply(&mut self, input: &mut WireReader<'_>) -> Result<(), SyncError> {
        match input.read_u8()? {
            MARKER_CLEAN => Ok(()),
            MARKER_FULL => {
                let len = input.read_u32()? as usize;
                let payload = input.read_bytes(len)?;
                self.value = bincode::deserialize(payload)?;
                self.dirty = false;
                Ok(())
            }
            other => Err(SyncError::UnknownMarker(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Trick {
        leader: u8,
        cards: Vec<String>,
    }

    #[test]
    fn test_fresh_object_sends_full() {
        let trick = SyncObject::new(Trick {
            leader: 2,
            cards: vec!["AS".into(), "KD".into()],
        });
        assert!(trick.is_dirty());

        let mut buf = Vec::new();
        trick.write_delta(&mut buf).unwrap();
        assert_eq!(buf[0], MARKER_FULL);

        let mut mirror: SyncObject<Trick> = SyncObject::default();
        mirror.apply(&mut WireReader::new(&buf)).unwrap();
        assert_eq!(mirror.get(), trick.get());
        assert!(!mirror.is_dirty());
    }

    #[test]
    fn test_clean_object_sends_one_byte() {
        let mut trick = SyncObject::new(Trick::default());
        trick.mark_clean();
        let mut buf = Vec::new();
        trick.write_delta(&mut buf).unwrap();
        assert_eq!(buf, vec![MARKER_CLEAN]);
    }

    #[test]
    fn test_get_mut_dirties_the_object() {
        let mut trick = SyncObject::new(Trick::default());
        trick.mark_clean();
        trick.get_mut().cards.push("7H".into());
        assert!(trick.is_dirty());

        let mut buf = Vec::new();
        trick.write_delta(&mut buf).unwrap();

        let mut mirror: SyncObject<Trick> = SyncObject::default();
        mirror.apply(&mut WireReader::new(&buf)).unwrap();
        assert_eq!(mirror.get().cards, vec!["7H".to_string()]);
    }

    #[test]
    fn test_garbage_payload_is_rejected() {
        // Announce a bincode blob that is too short for the struct.
        let mut buf = Vec::new();
        put_u8(&mut buf, MARKER_FULL);
        put_u32(&mut buf, 2);
        buf.extend_from_slice(&[0xff, 0xff]);

        let mut mirror: SyncObject<Trick> = SyncObject::default();
        assert!(matches!(
            mirror.apply(&mut WireReader::new(&buf)).unwrap_err(),
            SyncError::Object(_)
        ));
    }
}
