//! Wire Layer
//!
//! Binary command encoding plus the transport wrappers it rides on. Every
//! stream wears exactly one wrapper: the ChaCha20 cipher when a secret is
//! configured, the adaptive bit packer otherwise.

pub mod cipher;
pub mod codec;
pub mod command;
pub mod packing;
pub mod value;

pub use cipher::CipherStream;
pub use codec::{CodecError, CommandCodec, DEFAULT_MAX_FRAME};
pub use command::{Command, CommandSet};
pub use packing::PackedStream;
pub use value::{Value, WireError, WireReader};
