//! The α-parallel iterative `FIND_NODE` lookup engine.
//!
//! A lookup tracks three sets of candidate nodes relative to a fixed
//! `target`:
//!
//! - `par`: nodes a query is currently outstanding against (bounded by
//!   `alpha` concurrent queries at any time).
//! - `next`: nodes heard about but not yet queried, ordered nearest-first.
//! - `past`: nodes that have already answered, ordered nearest-first; once
//!   this holds `k` entries the lookup is done.
//!
//! [`LookupState::progress`] uses *loose* parallelism: it never waits for
//! a whole batch to finish. Called after every response or timeout, it
//! tops `par` back up to a target width -- `alpha` while the closest
//! candidate in `next` is nearer than the closest confirmed responder in
//! `past`, or the full `k` once that stops being true (the lookup has
//! stalled and widens its search, per the original paper).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use kad_proto::guid::{Distance, Guid, NodeInfo};

use crate::routing::RoutingTable;

#[derive(Clone, Debug)]
struct Candidate {
    distance: Distance,
    info: NodeInfo,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}
impl Eq for Candidate {}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.distance.cmp(&other.distance)
    }
}

/// State machine for one iterative `FIND_NODE` lookup toward `target`.
pub struct LookupState {
    target: Guid,
    self_id: Guid,
    alpha: usize,
    k: usize,
    round: u32,
    par: Vec<NodeInfo>,
    next: BinaryHeap<Reverse<Candidate>>,
    past: BinaryHeap<Reverse<Candidate>>,
    next_ids: HashSet<Guid>,
    past_ids: HashSet<Guid>,
}

impl LookupState {
    /// Start a fresh lookup, seeding `next` from the `k` nodes in
    /// `routing_table` closest to `target`.
    pub fn new(target: Guid, alpha: usize, k: usize, routing_table: &RoutingTable) -> Self {
        let seeds = routing_table.find_closest(&target, k, None);
        let mut state = Self {
            target,
            self_id: routing_table.self_id(),
            alpha,
            k,
            round: 0,
            par: Vec::new(),
            next: BinaryHeap::new(),
            past: BinaryHeap::new(),
            next_ids: HashSet::new(),
            past_ids: HashSet::new(),
        };
        for seed in seeds {
            state.offer(seed);
        }
        state
    }

    fn offer(&mut self, info: NodeInfo) {
        if info.id == self.target || self.next_ids.contains(&info.id) || self.past_ids.contains(&info.id) {
            return;
        }
        let distance = self.target.distance(&info.id);
        self.next_ids.insert(info.id);
        self.next.push(Reverse(Candidate { distance, info }));
    }

    /// Record a successful response from `responder`, carrying
    /// `new_candidates` learned from its `nodes` field. The responder is
    /// moved from `par` into `past`; unseen candidates are upserted into
    /// `routing_table` (as freshly-seen, unverified contacts) and queued in
    /// `next`.
    pub fn on_response(
        &mut self,
        responder: Guid,
        new_candidates: Vec<NodeInfo>,
        routing_table: &mut RoutingTable,
    ) {
        self.par.retain(|n| n.id != responder);

        let distance = self.target.distance(&responder);
        if !self.past_ids.contains(&responder) {
            self.past_ids.insert(responder);
            // The responder's own NodeInfo isn't tracked here; callers are
            // expected to have already upserted it into the routing table
            // via their own RPC-reply handling. We only need its id/distance
            // to evaluate the round-advance rule and completion.
            self.past.push(Reverse(Candidate {
                distance,
                info: NodeInfo::new(responder, "0.0.0.0:0".parse().expect("test fixture")),
            }));
        }

        for candidate in new_candidates {
            if candidate.id == self.self_id {
                continue;
            }
            let _ = routing_table.upsert(candidate.clone(), 0);
            self.offer(candidate);
        }
    }

    /// Record a timed-out query against `node_id`: it is removed from
    /// `par` and simply dropped (never re-queried by this lookup).
    pub fn on_timeout(&mut self, node_id: Guid) {
        self.par.retain(|n| n.id != node_id);
    }

    /// Top `par` back up to the current target width, returning the newly
    /// issued queries (already added to `par`). Safe to call after every
    /// single response or timeout -- it only fills the slots that are
    /// actually free, never waits for a whole batch to drain. Returns an
    /// empty vec once [`Self::is_done`] or no free-slot queries remain.
    pub fn progress(&mut self) -> Vec<NodeInfo> {
        if self.is_done() {
            return Vec::new();
        }

        let width = self.target_width();
        let mut issued = Vec::new();
        while self.par.len() < width {
            let Some(Reverse(candidate)) = self.next.pop() else {
                break;
            };
            self.next_ids.remove(&candidate.info.id);
            self.par.push(candidate.info.clone());
            issued.push(candidate.info);
        }

        if !issued.is_empty() {
            self.round += 1;
        }
        issued
    }

    /// `alpha` while the closest unqueried candidate is nearer than the
    /// closest confirmed responder so far; `k` once that stops holding
    /// (the lookup has stalled and widens its search to all unqueried
    /// nodes within `k`, per the original paper's termination-avoidance
    /// rule).
    fn target_width(&self) -> usize {
        let next_closest = self.next.peek().map(|Reverse(c)| c.distance);
        let past_closest = self.past.peek().map(|Reverse(c)| c.distance);
        let making_progress = match (next_closest, past_closest) {
            (Some(next), Some(past)) => next < past,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if making_progress { self.alpha } else { self.k }
    }

    /// Whether the lookup has converged: `k` nodes have answered, or there
    /// is nothing left outstanding or queued.
    pub fn is_done(&self) -> bool {
        self.past_ids.len() >= self.k || (self.next.is_empty() && self.par.is_empty())
    }

    /// Reset the lookup to start a fresh round from scratch against the
    /// current `next`/`past` sets (used when a caller wants to retry after
    /// a burst of timeouts without discarding progress).
    pub fn reset(&mut self) {
        self.par.clear();
    }

    /// The `k` closest responders seen so far, nearest first.
    pub fn results(&self) -> Vec<Guid> {
        let mut items: Vec<Candidate> = self.past.iter().map(|Reverse(c)| c.clone()).collect();
        items.sort();
        items.into_iter().map(|c| c.info.id).collect()
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    /// The id this lookup is converging toward.
    pub fn target(&self) -> Guid {
        self.target
    }
}
