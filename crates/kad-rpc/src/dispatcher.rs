//! Inbound datagram dispatch and outbound query composition, grounded on
//! the C reference's `kad_rpc_handle_query`/`kad_rpc_update_dht`/
//! `kad_rpc_handle_error` and `kad_query`.
//!
//! The dispatcher itself is stateless -- it carries only `self_id` -- and
//! takes the routing table and in-flight map as arguments, since both are
//! shared with the lookup engine and owned by the daemon.

use std::net::SocketAddr;

use kad_dht::routing::RoutingTable;
use kad_dht::K;
use kad_proto::guid::{Guid, NodeInfo};
use kad_proto::message::{self, error_code, Message, Method, TxId};
use kad_proto::ProtoError;

use crate::lru::{InFlightLru, QueryRecord};

/// What the caller should do after [`Dispatcher::handle`] runs.
#[derive(Debug, PartialEq)]
pub enum DispatchOutcome {
    /// Send this encoded message back to the source address.
    Reply(Vec<u8>),
    /// An inbound response matched an outstanding query; hand this to the
    /// lookup engine (or discard it if no lookup is active for `target`).
    Correlated(LookupNotification),
    /// Nothing further to do: an error was logged, or the datagram
    /// correlated with no outstanding query.
    Dropped,
}

/// A correlated response, carrying the query it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupNotification {
    PingReply {
        query: QueryRecord,
        responder: Guid,
    },
    FindNodeReply {
        query: QueryRecord,
        responder: Guid,
        nodes: Vec<NodeInfo>,
    },
}

/// Decodes inbound datagrams and answers queries for one node identity.
pub struct Dispatcher {
    self_id: Guid,
}

impl Dispatcher {
    pub fn new(self_id: Guid) -> Self {
        Self { self_id }
    }

    /// Handle one inbound datagram from `source_addr`.
    pub fn handle(
        &self,
        source_addr: SocketAddr,
        buf: &[u8],
        routing_table: &mut RoutingTable,
        in_flight: &mut InFlightLru,
        now: u64,
    ) -> DispatchOutcome {
        let decoded = match Message::decode(buf) {
            Ok(m) => m,
            Err(err) => {
                tracing::warn!(%source_addr, %err, "failed to decode RPC message");
                let tx_id = message::peek_tx_id(buf).unwrap_or_else(message::generate_tx_id);
                let (code, message) = match err {
                    ProtoError::UnknownMethod(method) => {
                        (error_code::METHOD_UNKNOWN, format!("unknown method '{method}'"))
                    }
                    _ => (error_code::PROTOCOL, "malformed message".to_string()),
                };
                let reply = Message::Error { tx_id, code, message };
                return DispatchOutcome::Reply(reply.encode());
            }
        };

        if let Some(sender_id) = decoded.sender_id() {
            if sender_id != self.self_id {
                let info = NodeInfo::new(sender_id, source_addr);
                // IsSelf can't happen here (just checked); any other upsert
                // outcome is fine to ignore at this layer.
                let _ = routing_table.upsert(info, now);
            }
        }

        match decoded {
            Message::Error { tx_id, code, message } => {
                tracing::warn!(%source_addr, tx = ?tx_id, code, %message, "peer reported an error");
                DispatchOutcome::Dropped
            }
            Message::Query {
                tx_id,
                sender_id,
                method,
                target,
            } => self.handle_query(tx_id, sender_id, method, target, routing_table),
            Message::Response { tx_id, sender_id, nodes } => {
                self.handle_response(tx_id, sender_id, nodes, in_flight)
            }
        }
    }

    fn handle_query(
        &self,
        tx_id: TxId,
        sender_id: Guid,
        method: Method,
        target: Option<Guid>,
        routing_table: &RoutingTable,
    ) -> DispatchOutcome {
        let reply = match method {
            Method::Ping => Message::Response {
                tx_id,
                sender_id: self.self_id,
                nodes: None,
            },
            Method::FindNode => {
                let target = target.unwrap_or(sender_id);
                let nodes = routing_table.find_closest(&target, K, Some(&sender_id));
                Message::Response {
                    tx_id,
                    sender_id: self.self_id,
                    nodes: Some(nodes),
                }
            }
        };
        DispatchOutcome::Reply(reply.encode())
    }

    fn handle_response(
        &self,
        tx_id: TxId,
        sender_id: Guid,
        nodes: Option<Vec<NodeInfo>>,
        in_flight: &mut InFlightLru,
    ) -> DispatchOutcome {
        let Some(query) = in_flight.remove(&tx_id) else {
            tracing::debug!(tx = ?tx_id, "response for unknown or expired transaction id");
            return DispatchOutcome::Dropped;
        };

        if query.dest_id != sender_id {
            tracing::warn!(
                tx = ?tx_id,
                expected = %query.dest_id,
                got = %sender_id,
                "response sender id doesn't match the queried node"
            );
        }

        let notification = match query.method {
            Method::Ping => LookupNotification::PingReply {
                query,
                responder: sender_id,
            },
            Method::FindNode => LookupNotification::FindNodeReply {
                nodes: nodes.unwrap_or_default(),
                query,
                responder: sender_id,
            },
        };
        DispatchOutcome::Correlated(notification)
    }

    /// Compose an outbound query, registering it in `in_flight`. Retries
    /// transaction-id generation a handful of times on collision; gives up
    /// and returns `None` if the map keeps rejecting (it is at capacity and
    /// every generated id happens to already be in flight -- astronomically
    /// unlikely at a 2-byte tx id space and 1024-entry capacity, but the
    /// fallible path is still honoured rather than looping forever).
    pub fn compose_query(
        &self,
        dest: &NodeInfo,
        method: Method,
        target: Option<Guid>,
        in_flight: &mut InFlightLru,
        now: u64,
    ) -> Option<(TxId, Vec<u8>)> {
        for _ in 0..8 {
            let tx_id = message::generate_tx_id();
            let query = Message::Query {
                tx_id,
                sender_id: self.self_id,
                method,
                target,
            };
            let record = QueryRecord {
                tx_id,
                dest_id: dest.id,
                dest_addr: dest.addr,
                method,
                target,
                created_at: now,
            };
            let (inserted, _evicted) = in_flight.put(record);
            if inserted {
                return Some((tx_id, query.encode()));
            }
        }
        tracing::error!("failed to allocate a free transaction id after 8 attempts");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kad_proto::guid::GUID_LEN;

    fn guid(byte: u8) -> Guid {
        Guid::from_bytes([byte; GUID_LEN])
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().expect("test fixture")
    }

    #[test]
    fn ping_query_gets_ping_reply_and_upserts_sender() {
        let self_id = guid(1);
        let dispatcher = Dispatcher::new(self_id);
        let mut table = RoutingTable::with_default_k(self_id);
        let mut in_flight = InFlightLru::new(4);

        let query = Message::Query {
            tx_id: *b"aa",
            sender_id: guid(2),
            method: Method::Ping,
            target: None,
        };
        let outcome = dispatcher.handle(addr(1), &query.encode(), &mut table, &mut in_flight, 0);
        match outcome {
            DispatchOutcome::Reply(bytes) => {
                let reply = Message::decode(&bytes).expect("test fixture");
                assert_eq!(
                    reply,
                    Message::Response {
                        tx_id: *b"aa",
                        sender_id: self_id,
                        nodes: None,
                    }
                );
            }
            other => panic!("expected Reply, got {other:?}"),
        }
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn find_node_excludes_sender_and_self() {
        let self_id = guid(1);
        let dispatcher = Dispatcher::new(self_id);
        let mut table = RoutingTable::with_default_k(self_id);
        let mut in_flight = InFlightLru::new(4);
        table
            .upsert(NodeInfo::new(guid(5), addr(5)), 0)
            .expect("test fixture");

        let query = Message::Query {
            tx_id: *b"bb",
            sender_id: guid(5),
            method: Method::FindNode,
            target: Some(guid(9)),
        };
        let outcome = dispatcher.handle(addr(5), &query.encode(), &mut table, &mut in_flight, 0);
        match outcome {
            DispatchOutcome::Reply(bytes) => {
                let reply = Message::decode(&bytes).expect("test fixture");
                match reply {
                    Message::Response { nodes: Some(nodes), .. } => {
                        assert!(nodes.iter().all(|n| n.id != guid(5)));
                    }
                    other => panic!("expected a nodes response, got {other:?}"),
                }
            }
            other => panic!("expected Reply, got {other:?}"),
        }
    }

    #[test]
    fn decode_failure_synthesises_protocol_error() {
        let dispatcher = Dispatcher::new(guid(1));
        let mut table = RoutingTable::with_default_k(guid(1));
        let mut in_flight = InFlightLru::new(4);

        let outcome = dispatcher.handle(addr(1), b"d", &mut table, &mut in_flight, 0);
        match outcome {
            DispatchOutcome::Reply(bytes) => {
                let reply = Message::decode(&bytes).expect("test fixture");
                match reply {
                    Message::Error { code, .. } => assert_eq!(code, error_code::PROTOCOL),
                    other => panic!("expected Error, got {other:?}"),
                }
            }
            other => panic!("expected Reply, got {other:?}"),
        }
        assert!(table.is_empty());
    }

    #[test]
    fn unknown_method_gets_method_unknown_error_code() {
        let dispatcher = Dispatcher::new(guid(1));
        let mut table = RoutingTable::with_default_k(guid(1));
        let mut in_flight = InFlightLru::new(4);

        let mut args = std::collections::BTreeMap::new();
        args.insert(b"id".to_vec(), kad_proto::bencode::BencValue::Bytes(guid(2).as_bytes().to_vec()));
        let mut top = std::collections::BTreeMap::new();
        top.insert(b"a".to_vec(), kad_proto::bencode::BencValue::Dict(args));
        top.insert(b"q".to_vec(), kad_proto::bencode::BencValue::str("get_peers"));
        top.insert(b"t".to_vec(), kad_proto::bencode::BencValue::Bytes(b"ff".to_vec()));
        top.insert(b"y".to_vec(), kad_proto::bencode::BencValue::str("q"));
        let buf = kad_proto::bencode::encode(&kad_proto::bencode::BencValue::Dict(top));

        let outcome = dispatcher.handle(addr(1), &buf, &mut table, &mut in_flight, 0);
        match outcome {
            DispatchOutcome::Reply(bytes) => {
                let reply = Message::decode(&bytes).expect("test fixture");
                match reply {
                    Message::Error { code, tx_id, .. } => {
                        assert_eq!(code, error_code::METHOD_UNKNOWN);
                        assert_eq!(tx_id, *b"ff");
                    }
                    other => panic!("expected Error, got {other:?}"),
                }
            }
            other => panic!("expected Reply, got {other:?}"),
        }
    }

    #[test]
    fn response_correlates_against_in_flight_query() {
        let self_id = guid(1);
        let dispatcher = Dispatcher::new(self_id);
        let mut table = RoutingTable::with_default_k(self_id);
        let mut in_flight = InFlightLru::new(4);

        let dest = NodeInfo::new(guid(2), addr(2));
        let (tx_id, bytes) = dispatcher
            .compose_query(&dest, Method::Ping, None, &mut in_flight, 0)
            .expect("test fixture");
        let sent = Message::decode(&bytes).expect("test fixture");
        assert_eq!(sent.tx_id(), tx_id);
        assert_eq!(in_flight.len(), 1);

        let response = Message::Response {
            tx_id,
            sender_id: guid(2),
            nodes: None,
        };
        let outcome = dispatcher.handle(addr(2), &response.encode(), &mut table, &mut in_flight, 1);
        match outcome {
            DispatchOutcome::Correlated(LookupNotification::PingReply { responder, .. }) => {
                assert_eq!(responder, guid(2));
            }
            other => panic!("expected Correlated(PingReply), got {other:?}"),
        }
        assert!(in_flight.is_empty());
    }

    #[test]
    fn response_with_unknown_tx_id_is_dropped() {
        let dispatcher = Dispatcher::new(guid(1));
        let mut table = RoutingTable::with_default_k(guid(1));
        let mut in_flight = InFlightLru::new(4);

        let response = Message::Response {
            tx_id: *b"zz",
            sender_id: guid(2),
            nodes: None,
        };
        let outcome = dispatcher.handle(addr(2), &response.encode(), &mut table, &mut in_flight, 0);
        assert_eq!(outcome, DispatchOutcome::Dropped);
    }
}
