//! # kad-proto
//!
//! Wire format for the Kademlia DHT node: node identifiers, the bencode
//! codec, and the `ping`/`find_node` RPC message schema.
//!
//! This crate provides:
//!
//! - **GUIDs and node info** via [`guid`]
//! - **Bencode parsing and canonical encoding** via [`bencode`]
//! - **RPC message schema and compact node-info framing** via [`message`]
//!
//! ## Architecture
//!
//! ```text
//! RPC message / routing-state file (message.rs)
//!     |
//!     v
//! BencValue tree (bencode.rs)  -- parsed once, schema-bound on top
//!     |
//!     v
//! raw bytes on the wire / on disk
//! ```

pub mod bencode;
pub mod guid;
pub mod message;

/// Error types for wire protocol operations.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// The bencode buffer was malformed.
    #[error("bencode decode error: {0}")]
    Bencode(#[from] bencode::BencodeError),

    /// A decoded bencode value did not match the expected RPC/file schema.
    #[error("schema violation: {0}")]
    Schema(String),

    /// A query's `q` field named a method this node doesn't implement.
    /// Kept distinct from [`Self::Schema`] so callers can answer with
    /// `error_code::METHOD_UNKNOWN` instead of a generic protocol error.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// A compact node-info byte string had an unexpected length.
    #[error("invalid compact node info: {0}")]
    CompactNodeInfo(String),
}

/// Result type alias for wire protocol operations.
pub type Result<T> = std::result::Result<T, ProtoError>;
