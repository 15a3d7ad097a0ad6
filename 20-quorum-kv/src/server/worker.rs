//! Worker pool executing records against the shared table.
//!
//! Workers never wait on a slot. A PUT that finds its slot held is cancelled
//! on the spot and a GET that finds it held is answered EMPTY, so every job
//! finishes in bounded time and contention surfaces as a retry on the
//! coordinator instead of a queue on the server.

use std::sync::Arc;

use tokio::io::AsyncWrite;
use tracing::{debug, warn};

use super::ConnectionId;
use crate::codec::{OpCode, Request, Response};
use crate::table::Table;
use crate::transport::LockedWriter;

/// A decoded request tagged with the connection it arrived on.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Job {
    pub request: Request,
    pub conn: ConnectionId,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct WorkerStats {
    pub handled: u64,
    pub write_failures: u64,
}

pub(crate) struct Worker<W> {
    id: usize,
    table: Arc<Table>,
    connections: Arc<[LockedWriter<W>]>,
    jobs: flume::Receiver<Job>,
}

impl<W> Worker<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(
        id: usize,
        table: Arc<Table>,
        connections: Arc<[LockedWriter<W>]>,
        jobs: flume::Receiver<Job>,
    ) -> Self {
        Self {
            id,
            table,
            connections,
            jobs,
        }
    }

    /// Consumes jobs until every producer is gone and the queue is empty.
    pub async fn run(self) -> WorkerStats {
        let mut stats = WorkerStats::default();
        while let Ok(job) = self.jobs.recv_async().await {
            stats.handled += 1;
            let Some(response) = execute(&self.table, job.request) else {
                continue;
            };
            let Some(conn) = self.connections.get(job.conn.0) else {
                warn!(worker = self.id, conn = job.conn.0, "job for unknown connection");
                continue;
            };
            if let Err(err) = conn.send(&response.encode()).await {
                stats.write_failures += 1;
                warn!(
                    worker = self.id,
                    conn = conn.label(),
                    error = %err,
                    "failed to send response"
                );
            }
        }
        debug!(worker = self.id, handled = stats.handled, "worker exiting");
        stats
    }
}

/// Applies one request to the table, returning the reply if the operation
/// has one. COMMIT and ABORT are one-way.
pub(crate) fn execute(table: &Table, request: Request) -> Option<Response> {
    let Request { id, op, key, value } = request;
    match op {
        OpCode::Get => Some(match table.get(key) {
            Ok(current) => Response::ack(id, current as u16),
            Err(locked) => {
                debug!(id, key, holder = locked.holder, "GET refused, slot busy");
                Response::empty(id)
            }
        }),
        OpCode::Put => Some(if table.try_lock(key, id) {
            Response::ack(id, 0)
        } else {
            debug!(id, key, "PUT cancelled, slot busy");
            Response::cancel(id)
        }),
        OpCode::Commit => {
            if !table.commit(key, id, i32::from(value)) {
                warn!(id, key, value, "COMMIT without holding the slot, dropped");
            }
            None
        }
        OpCode::Abort => {
            if !table.unlock(key, id) {
                debug!(id, key, "ABORT for a slot this message does not hold");
            }
            None
        }
        OpCode::End => {
            warn!(id, "END reached a worker, ignoring");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::codec::{Record, Status};

    #[test]
    fn put_then_commit_writes_the_slot() {
        let table = Table::new(4);
        assert_eq!(execute(&table, Request::put(1, 1, 42)), Some(Response::ack(1, 0)));
        assert_eq!(execute(&table, Request::get(2, 1)), Some(Response::empty(2)));
        assert_eq!(execute(&table, Request::commit(1, 1, 42)), None);
        assert_eq!(execute(&table, Request::get(3, 1)), Some(Response::ack(3, 42)));
    }

    #[test]
    fn second_put_on_held_slot_is_cancelled() {
        let table = Table::new(4);
        assert_eq!(execute(&table, Request::put(1, 2, 5)).map(|r| r.status), Some(Status::Ack));
        assert_eq!(execute(&table, Request::put(3, 2, 6)), Some(Response::cancel(3)));
        assert_eq!(execute(&table, Request::put(5, 6, 6)), Some(Response::cancel(5)));

        // The loser's abort must not free the winner's lock.
        assert_eq!(execute(&table, Request::abort(3, 2, 6)), None);
        assert!(table.is_locked(2));

        assert_eq!(execute(&table, Request::abort(1, 2, 5)), None);
        assert!(!table.is_locked(2));
        assert_eq!(table.get(2), Ok(0));
    }

    #[test]
    fn stray_commit_is_not_applied() {
        let table = Table::new(4);
        assert_eq!(execute(&table, Request::commit(9, 1, 77)), None);
        assert_eq!(table.get(1), Ok(0));
        assert_eq!(execute(&table, Request::end()), None);
    }

    #[tokio::test]
    async fn pool_replies_on_the_originating_connection() {
        let table = Arc::new(Table::new(4));
        let (left, mut left_peer) = tokio::io::duplex(64);
        let (right, mut right_peer) = tokio::io::duplex(64);
        let connections: Arc<[LockedWriter<_>]> =
            vec![LockedWriter::new("left", left), LockedWriter::new("right", right)].into();

        let (jobs_tx, jobs_rx) = flume::unbounded();
        let workers: Vec<_> = (0..3)
            .map(|id| {
                let worker = Worker::new(
                    id,
                    Arc::clone(&table),
                    Arc::clone(&connections),
                    jobs_rx.clone(),
                );
                tokio::spawn(worker.run())
            })
            .collect();
        drop(jobs_rx);

        jobs_tx
            .send(Job { request: Request::put(10, 1, 7), conn: ConnectionId(0) })
            .expect("queue open");
        jobs_tx
            .send(Job { request: Request::get(11, 2), conn: ConnectionId(1) })
            .expect("queue open");
        drop(jobs_tx);

        let mut handled = 0;
        for worker in workers {
            handled += worker.await.expect("worker task").handled;
        }
        assert_eq!(handled, 2);

        let mut buf = [0u8; 5];
        left_peer.read_exact(&mut buf).await.expect("left reply");
        assert_eq!(Response::decode(&buf), Ok(Response::ack(10, 0)));
        right_peer.read_exact(&mut buf).await.expect("right reply");
        assert_eq!(Response::decode(&buf), Ok(Response::ack(11, 0)));
        assert!(table.is_locked(1));
    }
}
