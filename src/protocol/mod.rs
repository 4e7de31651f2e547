//! PostgreSQL wire protocol implementation.
//!
//! This module provides low-level primitives for:
//! - Reading and writing protocol frames ([`framing`])
//! - Encoding frontend messages ([`frontend`])
//! - Decoding backend messages ([`backend`])
//! - Replication CopyData payloads ([`replication`])
//! - pgoutput logical-decoding messages ([`pgoutput`])
//!
//! # Wire Protocol Overview
//!
//! PostgreSQL uses a message-based protocol where each message consists of:
//! - 1 byte: message type tag
//! - 4 bytes: message length (including these 4 bytes)
//! - N bytes: message payload
//!
//! Exception: Startup and SSL request messages omit the type tag.
//!
//! # Replication Protocol
//!
//! During logical replication, the server sends CopyData messages containing
//! either `WalData` (pgoutput sections) or `PrimaryKeepAlive` (heartbeats).
//! The client responds with `StandbyStatusUpdate` messages reporting its
//! flushed position.

pub(crate) mod buffer;

pub mod backend;
pub mod framing;
pub mod frontend;
pub mod pgoutput;
pub mod replication;

pub use backend::{AttributeDef, AuthRequest, BackendMessage, CommandTag, TxStatus};
pub use framing::Frame;
pub use pgoutput::{
    DecodeContext, OldTupleKind, PgOutputMessage, RelationColumn, ReplicaIdentity, TupleData,
    TupleValue,
};
pub use replication::{
    encode_standby_status_update, parse_copy_data, pg_epoch_micros, pg_to_unix_micros,
    ReplicationCopyData, PG_EPOCH_MICROS,
};
