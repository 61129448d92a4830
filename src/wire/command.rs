//! Wire Commands
//!
//! The unit of exchange between server and client: a command kind drawn from
//! a closed set, plus an ordered list of named, typed arguments. Commands are
//! written back to back on the stream with no outer framing; the layout is
//! self-delimiting.
//!
//! Layout per command, all integers big-endian:
//!
//! `UTF8(kind) | i32(arg_count) | arg_count x { UTF8(key) | u8(tag) | payload }`

use std::collections::BTreeSet;
use std::fmt;

use crate::wire::value::{put_i32, put_str, Value, WireError, WireReader};

/// Most arguments one command may carry.
pub const MAX_ARGS: i32 = 1024;

// =============================================================================
// PROTOCOL KINDS
// =============================================================================

// Kind names opening with "__" are reserved for the protocol itself and are
// handled inline by the connection layer, never forwarded to the application.

/// Client hello: name, version, attributes.
pub const KIND_CONNECT: &str = "__connect";
/// Server acceptance: assigned name, keep-alive interval.
pub const KIND_ACCEPT: &str = "__accept";
/// Server password challenge.
pub const KIND_CHALLENGE: &str = "__challenge";
/// Client password digest answer.
pub const KIND_PASSWORD: &str = "__password";
/// Orderly teardown with a reason, either direction.
pub const KIND_DISCONNECT: &str = "__disconnect";
/// Keep-alive ping, echoed back unmodified.
pub const KIND_PING: &str = "__ping";
/// Client connection speed report.
pub const KIND_SPEED: &str = "__speed";
/// Session property update.
pub const KIND_PROPERTY: &str = "__property";
/// Remote invocation request.
pub const KIND_INVOKE: &str = "__invoke";
/// Remote invocation response.
pub const KIND_REPLY: &str = "__reply";
/// Non-fatal application fault report.
pub const KIND_FAULT: &str = "__fault";

const PROTOCOL_KINDS: [&str; 11] = [
    KIND_CONNECT,
    KIND_ACCEPT,
    KIND_CHALLENGE,
    KIND_PASSWORD,
    KIND_DISCONNECT,
    KIND_PING,
    KIND_SPEED,
    KIND_PROPERTY,
    KIND_INVOKE,
    KIND_REPLY,
    KIND_FAULT,
];

// =============================================================================
// COMMAND SET
// =============================================================================

/// The closed set of command kinds both ends agree on.
///
/// Protocol kinds are always present. Embedding games register their own
/// kinds before binding or connecting; decoding a kind outside the set fails
/// instead of producing a command nobody asked for.
#[derive(Debug, Clone)]
pub struct CommandSet {
    kinds: BTreeSet<String>,
}

impl CommandSet {
    /// A set holding only the protocol kinds.
    pub fn new() -> Self {
        let kinds = PROTOCOL_KINDS.iter().map(|k| k.to_string()).collect();
        Self { kinds }
    }

    /// Add an application kind.
    pub fn register(&mut self, kind: impl Into<String>) {
        self.kinds.insert(kind.into());
    }

    /// True when `kind` may appear on the wire.
    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains(kind)
    }

    /// Number of registered kinds, protocol ones included.
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Never true; the protocol kinds are always present.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl Default for CommandSet {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// COMMAND
// =============================================================================

/// One typed key/value message.
///
/// Arguments keep their insertion order; assigning a key that already exists
/// overwrites the value in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    kind: String,
    args: Vec<(String, Value)>,
}

impl Command {
    /// An empty command of the given kind.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            args: Vec::new(),
        }
    }

    /// The command kind.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// True for protocol-internal kinds (`__` prefix).
    pub fn is_protocol(&self) -> bool {
        self.kind.starts_with("__")
    }

    /// Assign an argument, overwriting any existing value for the key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.args.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.args.push((key, value));
        }
    }

    /// Builder form of [`Command::set`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Look an argument up by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.args.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Boolean argument, if present with that type.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// i32 argument, if present with that type.
    pub fn get_i32(&self, key: &str) -> Option<i32> {
        self.get(key).and_then(Value::as_i32)
    }

    /// i64 argument, if present with that type.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    /// f64 argument, if present with that type.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    /// String argument, if present with that type.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Sync payload argument, if present with that type.
    pub fn get_sync(&self, key: &str) -> Option<&[u8]> {
        self.get(key).and_then(Value::as_sync)
    }

    /// Arguments in insertion order.
    pub fn args(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.args.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// True when the command carries no arguments.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(16 + self.args.len() * 16);
        put_str(&mut out, &self.kind)?;
        put_i32(&mut out, self.args.len() as i32);
        for (key, value) in &self.args {
            put_str(&mut out, key)?;
            value.write_tagged(&mut out)?;
        }
        Ok(out)
    }

    /// Parse one command from the reader, leaving the cursor just past it.
    ///
    /// [`WireError::Truncated`] means the reader ended mid-command, which on
    /// a live stream means "wait for more bytes"; every other error means the
    /// stream is corrupt.
    pub fn decode_from(input: &mut WireReader<'_>, set: &CommandSet) -> Result<Self, WireError> {
        let kind = input.read_str()?.to_string();
        if !set.contains(&kind) {
            return Err(WireError::UnknownKind(kind));
        }
        let count = input.read_i32()?;
        if !(0..=MAX_ARGS).contains(&count) {
            return Err(WireError::BadArgCount(count));
        }
        let mut command = Command::new(kind);
        for _ in 0..count {
            let key = input.read_str()?.to_string();
            let value = Value::read_tagged(input)?;
            command.set(key, value);
        }
        Ok(command)
    }

    /// Parse exactly one command occupying the whole buffer.
    pub fn decode(bytes: &[u8], set: &CommandSet) -> Result<Self, WireError> {
        let mut reader = WireReader::new(bytes);
        let command = Self::decode_from(&mut reader, set)?;
        if !reader.is_empty() {
            return Err(WireError::Trailing(reader.remaining()));
        }
        Ok(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.kind)?;
        for (i, (key, value)) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{key}={value}")?;
        }
        write!(f, ")")
    }
}
