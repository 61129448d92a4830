//! Command Codec
//!
//! [`tokio_util::codec`] adapter that turns a byte stream into a stream of
//! [`Command`]s. Commands are self-delimiting, so decoding is an attempted
//! parse: a truncated parse means "not enough bytes yet", any other wire
//! error means the stream is corrupt and the connection must die.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::wire::command::{Command, CommandSet};
use crate::wire::value::{WireError, WireReader};

/// Default upper bound for one encoded command.
pub const DEFAULT_MAX_FRAME: usize = 1024 * 1024;

/// Errors produced while framing commands over a transport.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Encoding or decoding failed.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The underlying transport failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame codec carrying [`Command`]s.
#[derive(Debug, Clone)]
pub struct CommandCodec {
    set: Arc<CommandSet>,
    max_frame: usize,
}

impl CommandCodec {
    /// Codec validating against the given kind set.
    pub fn new(set: Arc<CommandSet>) -> Self {
        Self {
            set,
            max_frame: DEFAULT_MAX_FRAME,
        }
    }

    /// Override the per-command size limit.
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }
}

impl Decoder for CommandCodec {
    type Item = Command;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>, CodecError> {
        if src.is_empty() {
            return Ok(None);
        }
        let mut reader = WireReader::new(&src[..]);
        match Command::decode_from(&mut reader, &self.set) {
            Ok(command) => {
                let consumed = src.len() - reader.remaining();
                src.advance(consumed);
                Ok(Some(command))
            }
            Err(WireError::Truncated) => {
                // A command refusing to complete within the limit is an
                // attack or a desync, not patience.
                if src.len() > self.max_frame {
                    return Err(WireError::FrameTooLarge(src.len()).into());
                }
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Encoder<Command> for CommandCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), CodecError> {
        if !self.set.contains(item.kind()) {
            return Err(WireError::UnknownKind(item.kind().to_string()).into());
        }
        let bytes = item.encode()?;
        if bytes.len() > self.max_frame {
            return Err(WireError::FrameTooLarge(bytes.len()).into());
        }
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> CommandCodec {
        let mut set = CommandSet::new();
        set.register("deal");
        set.register("bid");
        CommandCodec::new(Arc::new(set))
    }

    #[test]
    fn test_incomplete_bytes_yield_none() {
        let mut codec = codec();
        let bytes = Command::new("deal").with("seat", 1).encode().unwrap();

        let mut buf = BytesMut::from(&bytes[..bytes.len() - 3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), bytes.len() - 3);

        buf.extend_from_slice(&bytes[bytes.len() - 3..]);
        let out = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(out.get_i32("seat"), Some(1));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_two_commands_in_one_read() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        codec
            .encode(Command::new("deal").with("seat", 0), &mut buf)
            .unwrap();
        codec
            .encode(Command::new("bid").with("amount", 40), &mut buf)
            .unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().kind(), "deal");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().kind(), "bid");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_unknown_kind_kills_the_stream() {
        let mut codec = codec();
        let bytes = Command::new("trump_everything").encode().unwrap();
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::Wire(WireError::UnknownKind(_)))
        ));
    }

    #[test]
    fn test_unknown_kind_refused_on_encode() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(Command::new("trump_everything"), &mut buf),
            Err(CodecError::Wire(WireError::UnknownKind(_)))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected_on_decode() {
        // A command announcing a large sync payload that never completes.
        let mut codec = CommandCodec::new(Arc::new(CommandSet::new())).with_max_frame(64);
        let big = Command::new(crate::wire::command::KIND_PROPERTY)
            .with("state", crate::wire::value::Value::Sync(vec![0; 200]));
        let bytes = big.encode().unwrap();

        let mut buf = BytesMut::from(&bytes[..128]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::Wire(WireError::FrameTooLarge(128)))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected_on_encode() {
        let mut codec = CommandCodec::new(Arc::new(CommandSet::new())).with_max_frame(64);
        let big = Command::new(crate::wire::command::KIND_PROPERTY)
            .with("state", crate::wire::value::Value::Sync(vec![0; 200]));
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(big, &mut buf),
            Err(CodecError::Wire(WireError::FrameTooLarge(_)))
        ));
    }
}
