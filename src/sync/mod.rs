//! Delta-Sync Structures
//!
//! Shared game state lives in sync containers that remember which slots
//! changed since the last send. Serializing a container emits only those
//! changes; the peer applies them to its mirror and both sides converge
//! without ever shipping the whole structure on every tick.
//!
//! Every serialized structure opens with a one-byte marker, integers
//! big-endian:
//!
//! * `0x00` CLEAN - nothing changed, nothing follows.
//! * `0x01` SPARSE - same size as last send: `u32 count`, then `count`
//!   entries in ascending slot order, each `u32 index | u8 tag | payload`
//!   (maps carry `key | value` instead of an index).
//! * `0x02` FULL - the size changed: `u32 size`, then every element. The
//!   receiver clears and rebuilds.
//!
//! Nested containers recurse: a SPARSE entry holding a container carries
//! that container's own delta, so partial updates compose all the way down.
//! Applying received bytes never raises local dirty flags; a structure is
//! dirty only through its own mutation API, and [`Replicable::mark_clean`]
//! resets the whole tree after a successful send.

mod array;
mod list;
mod map;
mod object;

pub use array::SyncArray;
pub use list::SyncList;
pub use map::SyncMap;
pub use object::SyncObject;

use thiserror::Error;

use crate::wire::value::{
    put_f32, put_f64, put_i32, put_i64, put_str, put_u8, Value, WireError, WireReader,
};

/// Marker for a structure with nothing to say.
pub const MARKER_CLEAN: u8 = 0;
/// Marker for a same-size, changed-slots-only payload.
pub const MARKER_SPARSE: u8 = 1;
/// Marker for a full clear-and-rebuild payload.
pub const MARKER_FULL: u8 = 2;

/// Errors raised while applying a received sync payload.
///
/// Any of these aborts the command carrying the payload; the connection
/// itself stays up.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The payload bytes themselves would not parse.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// A marker byte outside the known set.
    #[error("unknown sync marker {0:#04x}")]
    UnknownMarker(u8),

    /// A sparse entry pointing outside the local structure.
    #[error("slot {index} outside structure of {len} slots")]
    SlotMismatch {
        /// Index the sender named.
        index: usize,
        /// Local slot count.
        len: usize,
    },

    /// An element tagged as a different type than the local slot.
    #[error("expected element tag {expected:#04x}, found {found:#04x}")]
    TagMismatch {
        /// Tag the local structure stores.
        expected: u8,
        /// Tag that arrived.
        found: u8,
    },

    /// A composite object payload bincode refused.
    #[error("object payload rejected: {0}")]
    Object(#[from] bincode::Error),
}

// =============================================================================
// REPLICABLE
// =============================================================================

/// A value that can travel as sync payload: leaf primitives and the sync
/// containers themselves.
///
/// Containers hold anything `Replicable`, so structures nest freely;
/// dirtiness propagates upward through [`Replicable::is_dirty`] and
/// [`Replicable::mark_clean`] descends the whole tree.
pub trait Replicable: Default {
    /// Wire tag announcing this type inside container payloads. Leaves use
    /// their value tag; containers are always [`Value::TAG_SYNC`].
    const WIRE_TAG: u8;

    /// True when anything here or below changed since the last
    /// [`Replicable::mark_clean`].
    fn is_dirty(&self) -> bool;

    /// Reset all dirty state, recursively.
    fn mark_clean(&mut self);

    /// Serialize only what changed. Leaves write their whole payload;
    /// containers write a marker-led delta.
    fn write_delta(&self, out: &mut Vec<u8>) -> Result<(), SyncError>;

    /// Serialize complete state regardless of dirt.
    fn write_full(&self, out: &mut Vec<u8>) -> Result<(), SyncError>;

    /// Apply received bytes to the local value. Never raises local dirty
    /// flags.
    fn apply(&mut self, input: &mut WireReader<'_>) -> Result<(), SyncError>;
}

macro_rules! leaf_replicable {
    ($ty:ty, $tag:expr, $put:path, $read:ident) => {
        impl Replicable for $ty {
            const WIRE_TAG: u8 = $tag;

            fn is_dirty(&self) -> bool {
                false
            }

            fn mark_clean(&mut self) {}

            fn write_delta(&self, out: &mut Vec<u8>) -> Result<(), SyncError> {
                $put(out, *self);
                Ok(())
            }

            fn write_full(&self, out: &mut Vec<u8>) -> Result<(), SyncError> {
                $put(out, *self);
                Ok(())
            }

            fn apply(&mut self, input: &mut WireReader<'_>) -> Result<(), SyncError> {
                *self = input.$read()?;
                Ok(())
            }
        }
    };
}

leaf_replicable!(i32, Value::TAG_I32, put_i32, read_i32);
leaf_replicable!(i64, Value::TAG_I64, put_i64, read_i64);
leaf_replicable!(f32, Value::TAG_F32, put_f32, read_f32);
leaf_replicable!(f64, Value::TAG_F64, put_f64, read_f64);

impl Replicable for bool {
    const WIRE_TAG: u8 = Value::TAG_BOOL;

    fn is_dirty(&self) -> bool {
        false
    }

    fn mark_clean(&mut self) {}

    fn write_delta(&self, out: &mut Vec<u8>) -> Result<(), SyncError> {
        put_u8(out, u8::from(*self));
        Ok(())
    }

    fn write_full(&self, out: &mut Vec<u8>) -> Result<(), SyncError> {
        put_u8(out, u8::from(*self));
        Ok(())
    }

    fn apply(&mut self, input: &mut WireReader<'_>) -> Result<(), SyncError> {
        *self = input.read_u8()? != 0;
        Ok(())
    }
}

impl Replicable for String {
    const WIRE_TAG: u8 = Value::TAG_STR;

    fn is_dirty(&self) -> bool {
        false
    }

    fn mark_clean(&mut self) {}

    fn write_delta(&self, out: &mut Vec<u8>) -> Result<(), SyncError> {
        put_str(out, self)?;
        Ok(())
    }

    fn write_full(&self, out: &mut Vec<u8>) -> Result<(), SyncError> {
        put_str(out, self)?;
        Ok(())
    }

    fn apply(&mut self, input: &mut WireReader<'_>) -> Result<(), SyncError> {
        *self = input.read_str()?.to_string();
        Ok(())
    }
}

// =============================================================================
// ELEMENT HELPERS
// =============================================================================

// Shared by the containers: every element travels as `u8 tag | payload` so a
// desynced peer fails loudly instead of reading garbage.

pub(crate) fn write_element_full<T: Replicable>(
    value: &T,
    out: &mut Vec<u8>,
) -> Result<(), SyncError> {
    put_u8(out, T::WIRE_TAG);
    value.write_full(out)
}

pub(crate) fn write_element_delta<T: Replicable>(
    value: &T,
    out: &mut Vec<u8>,
) -> Result<(), SyncError> {
    put_u8(out, T::WIRE_TAG);
    value.write_delta(out)
}

pub(crate) fn check_element_tag<T: Replicable>(
    input: &mut WireReader<'_>,
) -> Result<(), SyncError> {
    let found = input.read_u8()?;
    if found != T::WIRE_TAG {
        return Err(SyncError::TagMismatch {
            expected: T::WIRE_TAG,
            found,
        });
    }
    Ok(())
}

pub(crate) fn read_element<T: Replicable>(input: &mut WireReader<'_>) -> Result<T, SyncError> {
    check_element_tag::<T>(input)?;
    let mut value = T::default();
    value.apply(input)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_roundtrip<T: Replicable + PartialEq + std::fmt::Debug>(value: T) {
        let mut buf = Vec::new();
        value.write_full(&mut buf).unwrap();
        let mut back = T::default();
        back.apply(&mut WireReader::new(&buf)).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_leaves_roundtrip() {
        leaf_roundtrip(true);
        leaf_roundtrip(-42i32);
        leaf_roundtrip(1_000_000_000_000i64);
        leaf_roundtrip(0.25f32);
        leaf_roundtrip(-12.75f64);
        leaf_roundtrip("ten of clubs".to_string());
    }

    #[test]
    fn test_leaves_are_never_dirty() {
        assert!(!5i32.is_dirty());
        assert!(!String::from("x").is_dirty());
        let mut v = 9i64;
        v.mark_clean();
        assert_eq!(v, 9);
    }

    #[test]
    fn test_element_tag_guard() {
        let mut buf = Vec::new();
        write_element_full(&7i32, &mut buf).unwrap();

        let mut reader = WireReader::new(&buf);
        assert_eq!(read_element::<i32>(&mut reader).unwrap(), 7);

        let mut reader = WireReader::new(&buf);
        assert!(matches!(
            read_element::<i64>(&mut reader),
            Err(SyncError::TagMismatch {
                expected: Value::TAG_I64,
                found: Value::TAG_I32,
            })
        ));
    }
}
