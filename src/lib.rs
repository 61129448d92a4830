//! # Parlor Net
//!
//! Networking core for turn-based multiplayer tables: card and board
//! games where a handful of named players share one authoritative
//! server over plain TCP.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         PARLOR NET                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  wire/           - Commands on the wire                      │
//! │  ├── value.rs    - Tagged argument values                    │
//! │  ├── command.rs  - Key/value commands                        │
//! │  ├── codec.rs    - Command framing codec                     │
//! │  ├── cipher.rs   - Keyed stream encryption                   │
//! │  └── packing.rs  - Bit packing obfuscation                   │
//! │                                                              │
//! │  sync/           - Delta synchronization                     │
//! │  ├── list.rs     - Dirty-tracking list                       │
//! │  ├── array.rs    - Fixed-slot array                          │
//! │  ├── map.rs      - Keyed map                                 │
//! │  └── object.rs   - Whole-object serde wrapper                │
//! │                                                              │
//! │  net/            - Connections and sessions                  │
//! │  ├── server.rs   - Table server                              │
//! │  ├── client.rs   - Table client                              │
//! │  ├── session.rs  - Identity and reconnection                 │
//! │  ├── queue.rs    - Outbound command queues                   │
//! │  ├── remote.rs   - Method invocation                         │
//! │  └── transport.rs- Socket wrapping                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering Guarantee
//!
//! Everything a peer sends travels through one outbound queue drained
//! by one worker task, so commands arrive in the order they were
//! pushed. The wire format is self-delimiting and big-endian:
//! - No outer framing; each command announces its own extent
//! - No platform-dependent field widths
//! - Duplicate argument keys overwrite, last writer wins
//!
//! Given the same command sequence, every peer converges on the same
//! state regardless of architecture or timing.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod net;
pub mod sync;
pub mod wire;

// Re-export commonly used types
pub use net::{
    Client, ClientConfig, ClientEvent, ConnectionStatus, Server, ServerConfig, ServerEvent,
    SessionState,
};
pub use sync::{Replicable, SyncArray, SyncList, SyncMap, SyncObject};
pub use wire::{Command, Value};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Port servers bind when the configuration does not say otherwise
pub const DEFAULT_PORT: u16 = 7250;
