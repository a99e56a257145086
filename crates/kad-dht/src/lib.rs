//! # kad-dht
//!
//! Kademlia routing table (with replacement cache) and the α-parallel
//! iterative `FIND_NODE` lookup engine.
//!
//! | Parameter | Canonical value |
//! |---|---|
//! | `k` (bucket size / lookup width) | 8 |
//! | `alpha` (lookup parallelism) | 3 |
//! | stale threshold | 5 consecutive failed probes |
//! | GUID width | 160 bits ([`kad_proto::guid::GUID_LEN`]) |

pub mod lookup;
pub mod routing;

/// Canonical Kademlia bucket size / lookup result width.
pub const K: usize = 8;

/// Lookup parallelism factor.
pub const ALPHA: usize = 3;

/// Number of consecutive unanswered probes after which a bucket entry is
/// considered stale and eligible for eviction on the next full-bucket
/// insert.
pub const STALE_THRESHOLD: u32 = 5;

/// Errors arising from routing table and lookup operations.
#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    /// Attempted to insert or look up `self_id` as a peer.
    #[error("refusing to operate on the local node's own id")]
    IsSelf,

    /// The persisted routing-state file or a bootstrap-nodes file could
    /// not be decoded.
    #[error("routing state file error: {0}")]
    FileFormat(#[from] kad_proto::ProtoError),

    /// A persisted routing-state file is missing its `"id"` field or the
    /// field isn't a well-formed GUID.
    #[error("routing state file has no valid \"id\" field")]
    MissingIdentity,

    /// I/O error reading or writing a persisted file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for this crate's operations.
pub type Result<T> = std::result::Result<T, DhtError>;
