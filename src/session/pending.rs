//! Outstanding requests awaiting a response or a timeout

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use tokio::time::{Duration, Instant};

use crate::types::{BlockNr, MsgId};

/// One request on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub msg_id: MsgId,
    pub peer: SocketAddr,
    pub sent_at: Instant,
    pub deadline: Instant,
    pub blocks: BTreeSet<BlockNr>,
    pub hashes: BTreeSet<BlockNr>,
}

/// Requests keyed by message id
#[derive(Debug)]
pub struct PendingRequests {
    requests: BTreeMap<MsgId, PendingRequest>,
    timeout: Duration,
}

impl PendingRequests {
    pub fn new(timeout: Duration) -> Self {
        Self {
            requests: BTreeMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record a request sent at `now`
    pub fn insert(
        &mut self,
        msg_id: MsgId,
        peer: SocketAddr,
        now: Instant,
        blocks: BTreeSet<BlockNr>,
        hashes: BTreeSet<BlockNr>,
    ) -> &PendingRequest {
        self.requests.entry(msg_id).or_insert(PendingRequest {
            msg_id,
            peer,
            sent_at: now,
            deadline: now + self.timeout,
            blocks,
            hashes,
        })
    }

    /// Take the request answered by `msg_id`; `None` for late or unknown ids
    pub fn resolve(&mut self, msg_id: MsgId) -> Option<PendingRequest> {
        self.requests.remove(&msg_id)
    }

    pub fn contains(&self, msg_id: MsgId) -> bool {
        self.requests.contains_key(&msg_id)
    }

    /// Remove and return every request whose deadline has passed
    pub fn expired(&mut self, now: Instant) -> Vec<PendingRequest> {
        let ids: Vec<MsgId> = self
            .requests
            .values()
            .filter(|req| req.deadline <= now)
            .map(|req| req.msg_id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.requests.remove(&id))
            .collect()
    }

    /// Remove every request
    pub fn drain(&mut self) -> Vec<PendingRequest> {
        std::mem::take(&mut self.requests).into_values().collect()
    }

    pub fn blocks_in_flight(&self) -> usize {
        self.requests.values().map(|req| req.blocks.len()).sum()
    }

    pub fn hashes_in_flight(&self) -> usize {
        self.requests.values().map(|req| req.hashes.len()).sum()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
