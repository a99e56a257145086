//! # kad-rpc
//!
//! The RPC dispatcher: decodes inbound datagrams, updates the routing
//! table, answers queries, and correlates responses against outstanding
//! queries tracked in a fixed-capacity, FIFO-evicted in-flight map.

pub mod dispatcher;
pub mod lru;

pub use dispatcher::{DispatchOutcome, Dispatcher, LookupNotification};
pub use lru::{InFlightLru, QueryRecord};

/// Fixed capacity of the in-flight query map (spec'd at 1024).
pub const IN_FLIGHT_CAPACITY: usize = 1024;
