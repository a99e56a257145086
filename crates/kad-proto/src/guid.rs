//! Fixed-width node identifiers and XOR distance.
//!
//! Node IDs are 160-bit (20-byte) identifiers, matching the canonical
//! Kademlia/BitTorrent-DHT width. A [`Guid`] carries an explicit `is_set`
//! flag so that an unset identifier (e.g. a query that omitted `id`) is
//! distinguishable from the all-zero identifier.
//!
//! Distance between two GUIDs is their bitwise XOR, interpreted as a
//! big-endian integer for comparison purposes only -- it is never
//! materialized as a numeric type, just compared byte-wise from the most
//! significant byte.

use std::cmp::Ordering;
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Width in bytes of a [`Guid`] (160 bits).
pub const GUID_LEN: usize = 20;

/// Width in bits of a [`Guid`], and the number of buckets `B` in a routing
/// table (one bucket per possible common-prefix length).
pub const GUID_BITS: usize = GUID_LEN * 8;

/// A 160-bit node/target identifier.
///
/// `Default` yields the unset GUID (zero bytes, `is_set = false`); use
/// [`Guid::from_bytes`] to construct a definite identifier.
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct Guid {
    bytes: [u8; GUID_LEN],
    is_set: bool,
}

impl Guid {
    /// Build a GUID from raw bytes, marking it as set.
    pub fn from_bytes(bytes: [u8; GUID_LEN]) -> Self {
        Self {
            bytes,
            is_set: true,
        }
    }

    /// The unset GUID: zero bytes, `is_set = false`.
    pub const fn unset() -> Self {
        Self {
            bytes: [0u8; GUID_LEN],
            is_set: false,
        }
    }

    /// Generate a random, set GUID.
    pub fn random() -> Self {
        let mut bytes = [0u8; GUID_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
        Self::from_bytes(bytes)
    }

    /// Whether this GUID carries a definite value.
    pub fn is_set(&self) -> bool {
        self.is_set
    }

    /// Raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; GUID_LEN] {
        &self.bytes
    }

    /// Bitwise XOR distance to another GUID.
    pub fn distance(&self, other: &Self) -> Distance {
        let mut out = [0u8; GUID_LEN];
        for i in 0..GUID_LEN {
            out[i] = self.bytes[i] ^ other.bytes[i];
        }
        Distance(out)
    }

    /// The bit-index of the most-significant differing bit between `self`
    /// and `other`, counting from the most-significant bit of byte 0 as
    /// index 0. Returns `None` when the two GUIDs are equal (no differing
    /// bit), matching the routing table's exclusion of `self_id`.
    pub fn common_prefix_len(&self, other: &Self) -> Option<usize> {
        self.distance(other).leading_zero_bits()
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_set {
            write!(f, "Guid({})", hex_encode(&self.bytes))
        } else {
            write!(f, "Guid(unset)")
        }
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex_encode(&self.bytes))
    }
}

impl PartialEq for Guid {
    fn eq(&self, other: &Self) -> bool {
        self.is_set == other.is_set && self.bytes == other.bytes
    }
}
impl Eq for Guid {}

impl PartialOrd for Guid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Guid {
    /// Tie-break by byte order of the identifier, used by heap comparators
    /// that need a total order once distances are equal.
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl std::hash::Hash for Guid {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

/// An XOR distance between two GUIDs, ordered most-significant-byte-first.
///
/// The derived byte-wise `Ord` on `[u8; GUID_LEN]` already compares from
/// index 0 onward, which is exactly the most-significant-byte-first
/// comparison distance requires -- no big-integer type is needed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Distance([u8; GUID_LEN]);

impl Distance {
    /// Number of leading zero bits, or `None` if the distance is zero
    /// (the two GUIDs it was computed from are identical).
    pub fn leading_zero_bits(&self) -> Option<usize> {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return Some(i * 8 + byte.leading_zeros() as usize);
            }
        }
        None
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Information about a peer: its identifier, network address, and a
/// pre-rendered printable form of that address (cheap to reuse in log
/// lines without reformatting on every call).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    /// The peer's GUID.
    pub id: Guid,
    /// The peer's network address (IPv4 or IPv6).
    pub addr: SocketAddr,
}

impl NodeInfo {
    /// Build a `NodeInfo`, deriving the printable address form.
    pub fn new(id: Guid, addr: SocketAddr) -> Self {
        Self { id, addr }
    }

    /// Printable form of the address, suitable for log lines.
    pub fn addr_str(&self) -> String {
        self.addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_guid_is_distinguishable_from_zero() {
        let unset = Guid::unset();
        let zero = Guid::from_bytes([0u8; GUID_LEN]);
        assert!(!unset.is_set());
        assert!(zero.is_set());
        assert_eq!(unset.as_bytes(), zero.as_bytes());
        assert_ne!(unset, zero);
    }

    #[test]
    fn distance_self_is_zero() {
        let a = Guid::from_bytes([0x42; GUID_LEN]);
        assert_eq!(a.common_prefix_len(&a), None);
    }

    #[test]
    fn distance_msb_differs() {
        let mut a_bytes = [0u8; GUID_LEN];
        let mut b_bytes = [0u8; GUID_LEN];
        a_bytes[0] = 0x00;
        b_bytes[0] = 0x80;
        let a = Guid::from_bytes(a_bytes);
        let b = Guid::from_bytes(b_bytes);
        assert_eq!(a.common_prefix_len(&b), Some(0));
    }

    #[test]
    fn distance_lsb_differs() {
        let mut a_bytes = [0u8; GUID_LEN];
        let mut b_bytes = [0u8; GUID_LEN];
        a_bytes[GUID_LEN - 1] = 0x00;
        b_bytes[GUID_LEN - 1] = 0x01;
        let a = Guid::from_bytes(a_bytes);
        let b = Guid::from_bytes(b_bytes);
        assert_eq!(a.common_prefix_len(&b), Some(GUID_BITS - 1));
    }

    #[test]
    fn distance_ordering_matches_closeness() {
        let target = Guid::from_bytes([0u8; GUID_LEN]);
        let mut near_bytes = [0u8; GUID_LEN];
        near_bytes[GUID_LEN - 1] = 0x01;
        let mut far_bytes = [0u8; GUID_LEN];
        far_bytes[0] = 0x01;
        let near = Guid::from_bytes(near_bytes);
        let far = Guid::from_bytes(far_bytes);
        assert!(target.distance(&near) < target.distance(&far));
    }
}
