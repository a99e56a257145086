//! RPC message schema and compact node-info framing.
//!
//! Schema-binds the generic [`BencValue`](crate::bencode::BencValue) tree
//! to the node's RPC vocabulary (`ping`, `find_node`) and to the two file
//! formats it persists to disk (routing state, bootstrap nodes).

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::bencode::{self, BencValue};
use crate::guid::{Guid, NodeInfo, GUID_LEN};
use crate::{ProtoError, Result};

/// Error codes advisory strings MUST NOT be parsed by clients (§4.3).
pub mod error_code {
    pub const GENERIC: i64 = 201;
    pub const SERVER: i64 = 202;
    pub const PROTOCOL: i64 = 203;
    pub const METHOD_UNKNOWN: i64 = 204;
}

/// A 2-byte transaction id correlating a query with its response.
pub type TxId = [u8; 2];

/// The RPC method named in a query's `q` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Ping,
    FindNode,
}

impl Method {
    fn as_str(self) -> &'static str {
        match self {
            Method::Ping => "ping",
            Method::FindNode => "find_node",
        }
    }

    fn from_str(s: &[u8]) -> Option<Self> {
        match s {
            b"ping" => Some(Method::Ping),
            b"find_node" => Some(Method::FindNode),
            _ => None,
        }
    }
}

/// A decoded RPC message: query, response, or error.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Query {
        tx_id: TxId,
        sender_id: Guid,
        method: Method,
        /// Present only for `find_node`.
        target: Option<Guid>,
    },
    Response {
        tx_id: TxId,
        sender_id: Guid,
        /// Present only when answering a `find_node` query.
        nodes: Option<Vec<NodeInfo>>,
    },
    Error {
        tx_id: TxId,
        code: i64,
        message: String,
    },
}

impl Message {
    pub fn tx_id(&self) -> TxId {
        match self {
            Message::Query { tx_id, .. } => *tx_id,
            Message::Response { tx_id, .. } => *tx_id,
            Message::Error { tx_id, .. } => *tx_id,
        }
    }

    /// The sender's GUID, if this message type carries one (queries and
    /// responses always do; errors never do).
    pub fn sender_id(&self) -> Option<Guid> {
        match self {
            Message::Query { sender_id, .. } => Some(*sender_id),
            Message::Response { sender_id, .. } => Some(*sender_id),
            Message::Error { .. } => None,
        }
    }

    /// Encode to canonical bencode bytes.
    pub fn encode(&self) -> Vec<u8> {
        bencode::encode(&self.to_benc())
    }

    fn to_benc(&self) -> BencValue {
        let mut top = BTreeMap::new();
        match self {
            Message::Query {
                tx_id,
                sender_id,
                method,
                target,
            } => {
                let mut args = BTreeMap::new();
                args.insert(b"id".to_vec(), BencValue::Bytes(sender_id.as_bytes().to_vec()));
                if let Some(target) = target {
                    args.insert(b"target".to_vec(), BencValue::Bytes(target.as_bytes().to_vec()));
                }
                top.insert(b"a".to_vec(), BencValue::Dict(args));
                top.insert(b"q".to_vec(), BencValue::str(method.as_str()));
                top.insert(b"t".to_vec(), BencValue::Bytes(tx_id.to_vec()));
                top.insert(b"y".to_vec(), BencValue::str("q"));
            }
            Message::Response {
                tx_id,
                sender_id,
                nodes,
            } => {
                let mut r = BTreeMap::new();
                r.insert(b"id".to_vec(), BencValue::Bytes(sender_id.as_bytes().to_vec()));
                if let Some(nodes) = nodes {
                    let list = nodes
                        .iter()
                        .map(|n| BencValue::Bytes(encode_compact_node(n)))
                        .collect();
                    r.insert(b"nodes".to_vec(), BencValue::List(list));
                }
                top.insert(b"r".to_vec(), BencValue::Dict(r));
                top.insert(b"t".to_vec(), BencValue::Bytes(tx_id.to_vec()));
                top.insert(b"y".to_vec(), BencValue::str("r"));
            }
            Message::Error { tx_id, code, message } => {
                let e = BencValue::List(vec![BencValue::Int(*code), BencValue::str(message)]);
                top.insert(b"e".to_vec(), e);
                top.insert(b"t".to_vec(), BencValue::Bytes(tx_id.to_vec()));
                top.insert(b"y".to_vec(), BencValue::str("e"));
            }
        }
        BencValue::Dict(top)
    }

    /// Decode a full RPC message from wire bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let value = bencode::decode(buf)?;
        Self::from_benc(&value)
    }

    fn from_benc(value: &BencValue) -> Result<Self> {
        let dict = value
            .as_dict()
            .ok_or_else(|| ProtoError::Schema("top-level value is not a dict".into()))?;

        let y = dict
            .get(b"y".as_slice())
            .and_then(BencValue::as_bytes)
            .ok_or_else(|| ProtoError::Schema("missing 'y'".into()))?;

        let tx_id = parse_tx_id(dict)?;

        match y {
            b"q" => {
                let method_bytes = dict
                    .get(b"q".as_slice())
                    .and_then(BencValue::as_bytes)
                    .ok_or_else(|| ProtoError::Schema("missing 'q'".into()))?;
                let method = Method::from_str(method_bytes).ok_or_else(|| {
                    ProtoError::UnknownMethod(String::from_utf8_lossy(method_bytes).into_owned())
                })?;
                let args = dict
                    .get(b"a".as_slice())
                    .and_then(BencValue::as_dict)
                    .ok_or_else(|| ProtoError::Schema("missing 'a'".into()))?;
                let sender_id = parse_guid_field(args, "id")?;
                let target = match method {
                    Method::FindNode => Some(parse_guid_field(args, "target")?),
                    Method::Ping => None,
                };
                Ok(Message::Query {
                    tx_id,
                    sender_id,
                    method,
                    target,
                })
            }
            b"r" => {
                let r = dict
                    .get(b"r".as_slice())
                    .and_then(BencValue::as_dict)
                    .ok_or_else(|| ProtoError::Schema("missing 'r'".into()))?;
                let sender_id = parse_guid_field(r, "id")?;
                let nodes = match r.get(b"nodes".as_slice()) {
                    Some(list_val) => Some(decode_compact_node_list(list_val)?),
                    None => None,
                };
                Ok(Message::Response {
                    tx_id,
                    sender_id,
                    nodes,
                })
            }
            b"e" => {
                let e = dict
                    .get(b"e".as_slice())
                    .and_then(BencValue::as_list)
                    .ok_or_else(|| ProtoError::Schema("missing 'e'".into()))?;
                if e.len() != 2 {
                    return Err(ProtoError::Schema("'e' must have 2 elements".into()));
                }
                let code = e[0]
                    .as_int()
                    .ok_or_else(|| ProtoError::Schema("error code not an int".into()))?;
                let message = e[1]
                    .as_bytes()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .ok_or_else(|| ProtoError::Schema("error message not a string".into()))?;
                Ok(Message::Error { tx_id, code, message })
            }
            _ => Err(ProtoError::Schema("unknown 'y' value".into())),
        }
    }
}

fn parse_tx_id(dict: &BTreeMap<Vec<u8>, BencValue>) -> Result<TxId> {
    let t = dict
        .get(b"t".as_slice())
        .and_then(BencValue::as_bytes)
        .ok_or_else(|| ProtoError::Schema("missing 't'".into()))?;
    if t.len() != 2 {
        return Err(ProtoError::Schema("'t' must be exactly 2 bytes".into()));
    }
    Ok([t[0], t[1]])
}

fn parse_guid_field(dict: &BTreeMap<Vec<u8>, BencValue>, key: &str) -> Result<Guid> {
    let bytes = dict
        .get(key.as_bytes())
        .and_then(BencValue::as_bytes)
        .ok_or_else(|| ProtoError::Schema(format!("missing '{key}'")))?;
    let arr: [u8; GUID_LEN] = bytes
        .try_into()
        .map_err(|_| ProtoError::Schema(format!("'{key}' has wrong length")))?;
    Ok(Guid::from_bytes(arr))
}

/// Peek a message's `t` field without fully schema-validating it, for use
/// when synthesising an error response to a message that otherwise failed
/// to decode.
pub fn peek_tx_id(buf: &[u8]) -> Option<TxId> {
    let value = bencode::decode(buf).ok()?;
    let dict = value.as_dict()?;
    let t = dict.get(b"t".as_slice())?.as_bytes()?;
    if t.len() == 2 {
        Some([t[0], t[1]])
    } else {
        None
    }
}

/// Generate a fresh random 2-byte transaction id.
pub fn generate_tx_id() -> TxId {
    let mut tx = [0u8; 2];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut tx);
    tx
}

/// Encode a [`NodeInfo`] in BitTorrent-DHT-compatible compact form:
/// `id ‖ address-bytes ‖ port-bytes` (26 bytes for IPv4, 38 for IPv6).
pub fn encode_compact_node(info: &NodeInfo) -> Vec<u8> {
    let mut out = Vec::with_capacity(GUID_LEN + 18);
    out.extend_from_slice(info.id.as_bytes());
    match info.addr {
        SocketAddr::V4(v4) => {
            out.extend_from_slice(&v4.ip().octets());
            out.extend_from_slice(&v4.port().to_be_bytes());
        }
        SocketAddr::V6(v6) => {
            out.extend_from_slice(&v6.ip().octets());
            out.extend_from_slice(&v6.port().to_be_bytes());
        }
    }
    out
}

/// Decode one compact node-info byte string. Length must be exactly
/// `GUID_LEN + 6` (IPv4) or `GUID_LEN + 18` (IPv6).
pub fn decode_compact_node(bytes: &[u8]) -> Result<NodeInfo> {
    let id_slice = bytes
        .get(..GUID_LEN)
        .ok_or_else(|| ProtoError::CompactNodeInfo("too short for id".into()))?;
    let mut id_bytes = [0u8; GUID_LEN];
    id_bytes.copy_from_slice(id_slice);
    let id = Guid::from_bytes(id_bytes);
    let rest = &bytes[GUID_LEN..];
    let addr = match rest.len() {
        6 => {
            let ip = Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
            let port = u16::from_be_bytes([rest[4], rest[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        }
        18 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&rest[..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([rest[16], rest[17]]);
            SocketAddr::new(IpAddr::V6(ip), port)
        }
        other => {
            return Err(ProtoError::CompactNodeInfo(format!(
                "unexpected compact node-info length {other}"
            )))
        }
    };
    Ok(NodeInfo::new(id, addr))
}

fn decode_compact_node_list(value: &BencValue) -> Result<Vec<NodeInfo>> {
    let list = value
        .as_list()
        .ok_or_else(|| ProtoError::Schema("'nodes' is not a list".into()))?;
    list.iter()
        .map(|v| {
            let bytes = v
                .as_bytes()
                .ok_or_else(|| ProtoError::Schema("'nodes' entry is not a byte string".into()))?;
            decode_compact_node(bytes)
        })
        .collect()
}
