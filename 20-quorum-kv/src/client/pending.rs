//! Bookkeeping for messages the coordinator is still waiting on.

use thiserror::Error;

use crate::codec::{MessageId, Request};
use crate::workload::Transaction;

use super::backoff::Backoff;

/// Size of the 16-bit message ID space.
pub const ID_SPACE: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("node index {node_index} out of range for {num_nodes} nodes")]
    NodeIndexOutOfRange { node_index: usize, num_nodes: usize },
    #[error("{num_nodes} nodes do not fit in the 65536 message IDs")]
    TooManyNodes { num_nodes: usize },
    #[error("all {capacity} message IDs of node {node_index} are in use")]
    Exhausted { node_index: u32, capacity: u32 },
}

/// IDs available to each node of a cluster of `num_nodes`.
pub fn ids_per_node(num_nodes: usize) -> usize {
    if num_nodes == 0 { 0 } else { ID_SPACE / num_nodes }
}

/// Allocates message IDs from this node's residue class.
///
/// Node `i` of `n` uses `i, i + n, i + 2n, ...`. The sequence wraps at the
/// largest multiple of `n` that fits in 16 bits, so after wrapping a node
/// still only produces IDs of its own residue and never collides with a
/// concurrently running peer.
#[derive(Debug, Clone)]
pub struct MessageIds {
    node_index: u32,
    num_nodes: u32,
    modulus: u32,
    next: u32,
}

impl MessageIds {
    pub fn new(node_index: usize, num_nodes: usize) -> Result<Self, IdError> {
        if node_index >= num_nodes {
            return Err(IdError::NodeIndexOutOfRange {
                node_index,
                num_nodes,
            });
        }
        if num_nodes > ID_SPACE {
            return Err(IdError::TooManyNodes { num_nodes });
        }
        let space = ID_SPACE as u32;
        let num_nodes = num_nodes as u32;
        let node_index = node_index as u32;
        Ok(Self {
            node_index,
            num_nodes,
            modulus: space - space % num_nodes,
            next: node_index,
        })
    }

    /// IDs this node can hand out before wrapping.
    pub fn capacity(&self) -> u32 {
        self.modulus / self.num_nodes
    }

    /// Returns the next ID for which `in_use` is false, or
    /// [`IdError::Exhausted`] if every ID of this node's residue is taken.
    pub fn allocate(&mut self, in_use: impl Fn(MessageId) -> bool) -> Result<MessageId, IdError> {
        for _ in 0..self.capacity() {
            let candidate = self.next as MessageId;
            self.next = (self.next + self.num_nodes) % self.modulus;
            if !in_use(candidate) {
                return Ok(candidate);
            }
        }
        Err(IdError::Exhausted {
            node_index: self.node_index,
            capacity: self.capacity(),
        })
    }

    pub fn node_index(&self) -> u32 {
        self.node_index
    }
}

/// One outstanding GET or PUT.
///
/// `responded[i]` records whether server `i` has answered the current
/// message ID. `acks` counts PUT votes; `busy` counts EMPTY answers to a GET.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub transaction: Transaction,
    pub backoff: Backoff,
    pub acks: usize,
    pub busy: usize,
    pub responded: Vec<bool>,
}

impl PendingEntry {
    pub fn new(transaction: Transaction, num_servers: usize) -> Self {
        Self {
            transaction,
            backoff: Backoff::default(),
            acks: 0,
            busy: 0,
            responded: vec![false; num_servers],
        }
    }

    /// Same transaction, fresh votes, backoff state carried over.
    pub fn renewed(&self) -> Self {
        Self {
            transaction: self.transaction,
            backoff: self.backoff,
            acks: 0,
            busy: 0,
            responded: vec![false; self.responded.len()],
        }
    }

    pub fn request(&self, id: MessageId) -> Request {
        match self.transaction {
            Transaction::Get { key } => Request::get(id, key),
            Transaction::Put { key, value } => Request::put(id, key, value),
        }
    }

    /// Servers that have not answered yet.
    pub fn silent_servers(&self) -> Vec<usize> {
        self.responded
            .iter()
            .enumerate()
            .filter_map(|(server, responded)| (!responded).then_some(server))
            .collect()
    }
}

/// A PUT that was aborted before every server had voted on it.
#[derive(Debug, Clone)]
pub struct AbortedPut {
    pub key: u16,
    pub value: u16,
    pub awaiting: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn ids_follow_node_offset() {
        let mut ids = MessageIds::new(1, 3).expect("valid node");
        let drawn: Vec<_> = (0..4).map(|_| ids.allocate(|_| false).expect("free id")).collect();
        assert_eq!(drawn, vec![1, 4, 7, 10]);
        assert_eq!(ids.node_index(), 1);
    }

    #[test]
    fn ids_wrap_within_the_residue_class() {
        let mut ids = MessageIds::new(2, 3).expect("valid node");
        // 65536 % 3 == 1, so the last usable multiple of three is 65535 - 1.
        let per_node = 65_535 / 3;
        let mut seen = HashSet::new();
        for _ in 0..per_node {
            let id = ids.allocate(|_| false).expect("free id");
            assert_eq!(id % 3, 2);
            assert!(seen.insert(id), "no repeats within one lap");
        }
        assert_eq!(ids.allocate(|_| false), Ok(2));
    }

    #[test]
    fn single_node_uses_whole_space() {
        let mut ids = MessageIds::new(0, 1).expect("valid node");
        assert_eq!(ids.capacity(), 65_536);
        for expected in 0..=u16::MAX {
            assert_eq!(ids.allocate(|_| false), Ok(expected));
        }
        assert_eq!(ids.allocate(|_| false), Ok(0));
    }

    #[test]
    fn busy_ids_are_skipped() {
        let mut ids = MessageIds::new(0, 2).expect("valid node");
        assert_eq!(ids.allocate(|id| id == 0 || id == 2), Ok(4));
        assert_eq!(
            ids.allocate(|_| true),
            Err(IdError::Exhausted {
                node_index: 0,
                capacity: 32_768
            })
        );
    }

    #[test]
    fn rejects_clusters_that_do_not_fit_the_id_space() {
        assert_eq!(
            MessageIds::new(3, 3).err(),
            Some(IdError::NodeIndexOutOfRange {
                node_index: 3,
                num_nodes: 3
            })
        );
        assert_eq!(
            MessageIds::new(0, 70_000).err(),
            Some(IdError::TooManyNodes { num_nodes: 70_000 })
        );
        assert_eq!(ids_per_node(2), 32_768);
        assert_eq!(ids_per_node(3), 21_845);
        assert_eq!(MessageIds::new(0, 65_536).map(|ids| ids.capacity()), Ok(1));
    }

    #[test]
    fn renewed_entry_keeps_backoff_only() {
        let mut entry = PendingEntry::new(Transaction::Put { key: 1, value: 7 }, 3);
        entry.acks = 2;
        entry.responded = vec![true, true, false];
        entry.backoff.next_delay(&mut rand::thread_rng());

        let renewed = entry.renewed();
        assert_eq!(renewed.acks, 0);
        assert_eq!(renewed.responded, vec![false; 3]);
        assert_eq!(renewed.backoff, entry.backoff);
        assert_eq!(entry.silent_servers(), vec![2]);
        assert_eq!(renewed.request(9), Request::put(9, 1, 7));
    }
}
