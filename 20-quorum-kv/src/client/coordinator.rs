//! Pure coordinator state machine: no sockets, no timers.
//!
//! Every request is broadcast to every server. A GET resolves on the first
//! ACK and is retried once all servers have answered EMPTY. A PUT commits
//! only when every server has voted ACK; a single CANCEL aborts the attempt
//! everywhere else and the PUT is retried under a new message ID.
//!
//! The async shell in [`crate::client`] feeds responses and fired timers in
//! and carries out the returned [`Action`]s.

use std::collections::HashMap;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, warn};

use super::pending::{AbortedPut, IdError, MessageIds, PendingEntry};
use crate::codec::{MessageId, Request, Response, Status};
use crate::workload::Transaction;

/// Side effects requested by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Send to every server.
    Broadcast(Request),
    /// Send to one server.
    Send { server: usize, request: Request },
    /// Send to every server except `skip`.
    BroadcastExcept { skip: usize, request: Request },
    /// Call [`Coordinator::fire_retry`] for `id` after `delay`.
    ScheduleRetry { id: MessageId, delay: Duration },
}

/// Counters and results accumulated over a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub submitted: u64,
    pub gets: u64,
    pub commits: u64,
    pub cancels: u64,
    pub retries: u64,
    /// `(key, value)` for every completed GET, in completion order.
    pub reads: Vec<(u16, u16)>,
}

pub struct Coordinator {
    num_servers: usize,
    ids: MessageIds,
    pending: HashMap<MessageId, PendingEntry>,
    aborted: HashMap<MessageId, AbortedPut>,
    rng: StdRng,
    stats: RunStats,
}

impl Coordinator {
    pub fn new(
        node_index: usize,
        num_nodes: usize,
        num_servers: usize,
        seed: Option<u64>,
    ) -> Result<Self, IdError> {
        assert!(num_servers > 0, "coordinator needs at least one server");
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            num_servers,
            ids: MessageIds::new(node_index, num_nodes)?,
            pending: HashMap::new(),
            aborted: HashMap::new(),
            rng,
            stats: RunStats::default(),
        })
    }

    /// Entries that count against the backlog.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// True once nothing is pending and no aborted PUT still awaits votes.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.aborted.is_empty()
    }

    pub fn is_pending(&self, id: MessageId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn into_stats(self) -> RunStats {
        self.stats
    }

    /// Fails only when every ID of this node is pending or awaiting votes.
    fn allocate_id(&mut self) -> Result<MessageId, IdError> {
        let pending = &self.pending;
        let aborted = &self.aborted;
        self.ids
            .allocate(|id| pending.contains_key(&id) || aborted.contains_key(&id))
    }

    /// Registers a new transaction and returns the request to broadcast.
    pub fn submit(&mut self, transaction: Transaction) -> Result<Request, IdError> {
        let id = self.allocate_id()?;
        let entry = PendingEntry::new(transaction, self.num_servers);
        let request = entry.request(id);
        self.pending.insert(id, entry);
        self.stats.submitted += 1;
        Ok(request)
    }

    /// A retry timer fired. Returns the request to broadcast, or `None` if
    /// the message was resolved in the meantime.
    pub fn fire_retry(&mut self, id: MessageId) -> Option<Request> {
        let request = self.pending.get(&id).map(|entry| entry.request(id));
        if request.is_none() {
            debug!(id, "retry timer fired for a resolved message");
        }
        request
    }

    /// Moves `entry` to a fresh message ID and schedules it.
    fn reschedule(&mut self, entry: PendingEntry) -> Result<Action, IdError> {
        let id = self.allocate_id()?;
        let mut renewed = entry.renewed();
        let delay = renewed.backoff.next_delay(&mut self.rng);
        self.pending.insert(id, renewed);
        self.stats.retries += 1;
        Ok(Action::ScheduleRetry { id, delay })
    }

    pub fn on_response(
        &mut self,
        server: usize,
        response: Response,
    ) -> Result<Vec<Action>, IdError> {
        if server >= self.num_servers {
            warn!(server, "response from unknown server");
            return Ok(Vec::new());
        }
        if self.pending.contains_key(&response.id) {
            self.on_pending_response(server, response)
        } else if self.aborted.contains_key(&response.id) {
            Ok(self.on_late_vote(server, response))
        } else {
            debug!(id = response.id, server, "response for a message no longer pending");
            Ok(Vec::new())
        }
    }

    fn on_pending_response(
        &mut self,
        server: usize,
        response: Response,
    ) -> Result<Vec<Action>, IdError> {
        let id = response.id;
        let Some(entry) = self.pending.get_mut(&id) else {
            return Ok(Vec::new());
        };
        if entry.responded[server] {
            debug!(id, server, "duplicate response ignored");
            return Ok(Vec::new());
        }
        entry.responded[server] = true;

        match (entry.transaction, response.status) {
            (Transaction::Get { key }, Status::Ack) => {
                self.pending.remove(&id);
                self.stats.gets += 1;
                self.stats.reads.push((key, response.data));
                debug!(id, key, value = response.data, server, "GET answered");
                Ok(Vec::new())
            }
            (Transaction::Get { key }, status) => {
                if status == Status::Cancel {
                    warn!(id, server, "CANCEL in reply to a GET, treating as busy");
                }
                entry.busy += 1;
                if entry.busy < self.num_servers {
                    return Ok(Vec::new());
                }
                debug!(id, key, "every server busy, retrying GET");
                let Some(entry) = self.pending.remove(&id) else {
                    return Ok(Vec::new());
                };
                Ok(vec![self.reschedule(entry)?])
            }
            (Transaction::Put { key, value }, Status::Ack) => {
                entry.acks += 1;
                if entry.acks < self.num_servers {
                    return Ok(Vec::new());
                }
                self.pending.remove(&id);
                self.stats.commits += 1;
                debug!(id, key, value, "all servers voted ACK, committing");
                Ok(vec![Action::Broadcast(Request::commit(id, key, value))])
            }
            (Transaction::Put { key, value }, status) => {
                if status == Status::Empty {
                    warn!(id, server, "EMPTY in reply to a PUT, treating as CANCEL");
                }
                let Some(entry) = self.pending.remove(&id) else {
                    return Ok(Vec::new());
                };
                self.stats.cancels += 1;
                debug!(id, key, value, server, "PUT cancelled, aborting attempt");

                let awaiting = entry.silent_servers();
                if !awaiting.is_empty() {
                    self.aborted.insert(id, AbortedPut { key, value, awaiting });
                }
                let abort = Action::BroadcastExcept {
                    skip: server,
                    request: Request::abort(id, key, value),
                };
                Ok(vec![abort, self.reschedule(entry)?])
            }
        }
    }

    /// A vote for a PUT that was already aborted. If it is an ACK, the ABORT
    /// we sent may have overtaken the proposal on that server, so abort again.
    fn on_late_vote(&mut self, server: usize, response: Response) -> Vec<Action> {
        let id = response.id;
        let Some(aborted) = self.aborted.get_mut(&id) else {
            return Vec::new();
        };
        let Some(position) = aborted.awaiting.iter().position(|&s| s == server) else {
            debug!(id, server, "duplicate late vote ignored");
            return Vec::new();
        };
        aborted.awaiting.swap_remove(position);

        let mut actions = Vec::new();
        if response.status == Status::Ack {
            debug!(id, server, "late ACK for aborted PUT, aborting again");
            actions.push(Action::Send {
                server,
                request: Request::abort(id, aborted.key, aborted.value),
            });
        }
        if aborted.awaiting.is_empty() {
            self.aborted.remove(&id);
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(servers: usize) -> Coordinator {
        Coordinator::new(0, 1, servers, Some(11)).expect("valid node")
    }

    fn retry_id(actions: &[Action]) -> MessageId {
        actions
            .iter()
            .find_map(|action| match action {
                Action::ScheduleRetry { id, .. } => Some(*id),
                _ => None,
            })
            .expect("a retry was scheduled")
    }

    #[test]
    fn put_commits_only_after_every_ack() {
        let mut c = coordinator(3);
        let request = c.submit(Transaction::Put { key: 1, value: 42 }).expect("free id");
        assert_eq!(request, Request::put(0, 1, 42));

        assert!(c.on_response(0, Response::ack(0, 0)).expect("free id").is_empty());
        assert!(c.on_response(2, Response::ack(0, 0)).expect("free id").is_empty());
        assert_eq!(c.outstanding(), 1);

        let actions = c.on_response(1, Response::ack(0, 0)).expect("free id");
        assert_eq!(actions, vec![Action::Broadcast(Request::commit(0, 1, 42))]);
        assert!(c.is_idle());
        assert_eq!(c.stats().commits, 1);
    }

    #[test]
    fn duplicate_ack_does_not_count_twice() {
        let mut c = coordinator(2);
        c.submit(Transaction::Put { key: 1, value: 1 }).expect("free id");
        assert!(c.on_response(0, Response::ack(0, 0)).expect("free id").is_empty());
        assert!(c.on_response(0, Response::ack(0, 0)).expect("free id").is_empty());
        assert_eq!(c.outstanding(), 1);
    }

    #[test]
    fn cancel_aborts_others_and_retries_under_new_id() {
        let mut c = coordinator(2);
        c.submit(Transaction::Put { key: 1, value: 7 }).expect("free id");
        assert!(c.on_response(0, Response::ack(0, 0)).expect("free id").is_empty());

        let actions = c.on_response(1, Response::cancel(0)).expect("free id");
        assert_eq!(
            actions[0],
            Action::BroadcastExcept { skip: 1, request: Request::abort(0, 1, 7) }
        );
        let new_id = retry_id(&actions);
        assert_ne!(new_id, 0);
        assert!(!c.is_pending(0));
        assert!(c.is_pending(new_id));
        assert_eq!(c.stats().cancels, 1);

        // Both servers had voted, so nothing lingers for the old ID.
        assert!(c.on_response(0, Response::ack(0, 0)).expect("free id").is_empty());

        assert_eq!(c.fire_retry(new_id), Some(Request::put(new_id, 1, 7)));
        c.on_response(0, Response::ack(new_id, 0)).expect("free id");
        let actions = c.on_response(1, Response::ack(new_id, 0)).expect("free id");
        assert_eq!(actions, vec![Action::Broadcast(Request::commit(new_id, 1, 7))]);
        assert!(c.is_idle());
    }

    #[test]
    fn cancel_wins_over_acks_already_counted() {
        let mut c = coordinator(3);
        c.submit(Transaction::Put { key: 4, value: 9 }).expect("free id");
        c.on_response(0, Response::ack(0, 0)).expect("free id");
        c.on_response(1, Response::ack(0, 0)).expect("free id");
        let actions = c.on_response(2, Response::cancel(0)).expect("free id");
        assert!(matches!(actions[0], Action::BroadcastExcept { skip: 2, .. }));
        assert_eq!(c.stats().commits, 0);
    }

    #[test]
    fn late_ack_after_abort_is_aborted_again() {
        let mut c = coordinator(3);
        c.submit(Transaction::Put { key: 2, value: 5 }).expect("free id");
        let actions = c.on_response(0, Response::cancel(0)).expect("free id");
        assert_eq!(actions.len(), 2);
        let retry = retry_id(&actions);
        assert!(!c.is_idle(), "servers 1 and 2 have not voted yet");

        let actions = c.on_response(1, Response::ack(0, 0)).expect("free id");
        assert_eq!(
            actions,
            vec![Action::Send { server: 1, request: Request::abort(0, 2, 5) }]
        );
        assert!(c.on_response(2, Response::cancel(0)).expect("free id").is_empty());
        assert!(c.on_response(1, Response::ack(0, 0)).expect("free id").is_empty());

        assert!(c.is_pending(retry));
        assert!(!c.is_idle());
    }

    #[test]
    fn stale_retry_timer_is_a_no_op() {
        let mut c = coordinator(1);
        c.submit(Transaction::Put { key: 0, value: 3 }).expect("free id");
        let actions = c.on_response(0, Response::cancel(0)).expect("free id");
        let new_id = retry_id(&actions);

        assert!(c.fire_retry(new_id).is_some());
        c.on_response(0, Response::ack(new_id, 0)).expect("free id");
        assert!(c.is_idle());
        assert_eq!(c.fire_retry(new_id), None);
    }

    #[test]
    fn get_resolves_on_first_ack() {
        let mut c = coordinator(3);
        let request = c.submit(Transaction::Get { key: 1 }).expect("free id");
        assert_eq!(request, Request::get(0, 1));
        assert!(c.on_response(1, Response::empty(0)).expect("free id").is_empty());
        assert!(c.on_response(0, Response::ack(0, 42)).expect("free id").is_empty());
        assert!(c.is_idle());
        assert_eq!(c.stats().reads, vec![(1, 42)]);

        assert!(c.on_response(2, Response::ack(0, 41)).expect("free id").is_empty());
        assert_eq!(c.stats().gets, 1);
    }

    #[test]
    fn get_retries_once_every_server_is_busy() {
        let mut c = coordinator(2);
        c.submit(Transaction::Get { key: 3 }).expect("free id");
        assert!(c.on_response(0, Response::empty(0)).expect("free id").is_empty());
        let actions = c.on_response(1, Response::empty(0)).expect("free id");
        assert_eq!(actions.len(), 1);
        let new_id = retry_id(&actions);
        assert_eq!(c.fire_retry(new_id), Some(Request::get(new_id, 3)));
        assert_eq!(c.stats().retries, 1);
        assert_eq!(c.outstanding(), 1);
    }

    #[test]
    fn unknown_ids_and_servers_are_ignored() {
        let mut c = coordinator(2);
        assert!(c.on_response(0, Response::ack(99, 0)).expect("free id").is_empty());
        c.submit(Transaction::Get { key: 0 }).expect("free id");
        assert!(c.on_response(5, Response::ack(0, 0)).expect("free id").is_empty());
        assert_eq!(c.outstanding(), 1);
    }

    #[test]
    fn ids_are_not_reused_while_votes_are_outstanding() {
        let mut c = Coordinator::new(0, 1, 2, Some(3)).expect("valid node");
        c.submit(Transaction::Put { key: 1, value: 1 }).expect("free id");
        let actions = c.on_response(0, Response::cancel(0)).expect("free id");
        let retry = retry_id(&actions);
        assert_ne!(retry, 0);
        let next = c.submit(Transaction::Get { key: 1 }).expect("free id");
        assert_ne!(next.id, 0);
        assert_ne!(next.id, retry);
    }

    #[test]
    fn exhausted_id_space_is_an_error() {
        let mut c = Coordinator::new(0, 2, 1, Some(1)).expect("valid node");
        for _ in 0..32_768 {
            c.submit(Transaction::Get { key: 0 }).expect("free id");
        }
        assert_eq!(
            c.submit(Transaction::Get { key: 0 }),
            Err(IdError::Exhausted {
                node_index: 0,
                capacity: 32_768
            })
        );
        assert_eq!(c.outstanding(), 32_768);
        assert_eq!(c.stats().submitted, 32_768);
    }

    #[test]
    fn rejects_node_outside_the_cluster() {
        assert!(Coordinator::new(2, 2, 1, None).is_err());
        assert!(Coordinator::new(0, 70_000, 1, None).is_err());
    }
}
