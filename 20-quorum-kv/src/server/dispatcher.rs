//! Single task that owns every inbound connection.
//!
//! All read halves are polled together through a `FuturesUnordered`, so a
//! quiet peer never holds up one with data ready. Each completed read is split
//! into records; END records are counted here and everything else is pushed
//! onto the worker queue tagged with its connection.

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{info, trace, warn};

use super::ConnectionId;
use super::worker::Job;
use crate::codec::{Hex, OpCode, REQUEST_LEN, Request, decode_batch};
use crate::transport::REQUEST_READ_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Active,
    Ended,
    Disconnected,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct DispatchStats {
    pub ends_received: usize,
    pub disconnected: usize,
    pub records_routed: u64,
    pub records_dropped: u64,
}

struct ReadOutcome<R> {
    conn: ConnectionId,
    reader: R,
    buf: Vec<u8>,
    result: std::io::Result<usize>,
}

fn read_next<R>(
    conn: ConnectionId,
    mut reader: R,
    mut buf: Vec<u8>,
) -> BoxFuture<'static, ReadOutcome<R>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    Box::pin(async move {
        let result = reader.read(&mut buf).await;
        ReadOutcome {
            conn,
            reader,
            buf,
            result,
        }
    })
}

pub(crate) struct Dispatcher<R> {
    reads: FuturesUnordered<BoxFuture<'static, ReadOutcome<R>>>,
    peers: Vec<PeerState>,
    jobs: flume::Sender<Job>,
    stats: DispatchStats,
}

impl<R> Dispatcher<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(readers: Vec<R>, jobs: flume::Sender<Job>) -> Self {
        let peers = vec![PeerState::Active; readers.len()];
        let reads = readers
            .into_iter()
            .enumerate()
            .map(|(index, reader)| {
                read_next(ConnectionId(index), reader, vec![0; REQUEST_READ_SIZE])
            })
            .collect();
        Self {
            reads,
            peers,
            jobs,
            stats: DispatchStats::default(),
        }
    }

    fn all_finished(&self) -> bool {
        self.peers.iter().all(|state| *state != PeerState::Active)
    }

    /// Routes records until every peer has sent END or gone away.
    ///
    /// Dropping the returned dispatcher closes the worker queue.
    pub async fn run(mut self) -> DispatchStats {
        while !self.all_finished() {
            let Some(outcome) = self.reads.next().await else {
                break;
            };
            let ReadOutcome {
                conn,
                reader,
                buf,
                result,
            } = outcome;

            match result {
                Ok(0) => {
                    if self.peers[conn.0] == PeerState::Active {
                        warn!(conn = conn.0, "peer closed its connection before END");
                        self.disconnect(conn);
                    }
                }
                Ok(n) => {
                    if self.route(conn, &buf[..n]) {
                        self.reads.push(read_next(conn, reader, buf));
                    }
                }
                Err(err) => {
                    warn!(conn = conn.0, error = %err, "read failed, dropping connection");
                    self.disconnect(conn);
                }
            }
        }
        self.stats
    }

    fn disconnect(&mut self, conn: ConnectionId) {
        if self.peers[conn.0] == PeerState::Active {
            self.stats.disconnected += 1;
        }
        self.peers[conn.0] = PeerState::Disconnected;
    }

    /// Returns `false` when the connection must be dropped.
    fn route(&mut self, conn: ConnectionId, bytes: &[u8]) -> bool {
        let records = match decode_batch::<Request>(bytes) {
            Ok(records) => records,
            Err(err) => {
                warn!(conn = conn.0, error = %err, "malformed read, disconnecting peer");
                self.disconnect(conn);
                return false;
            }
        };

        for (index, record) in records.enumerate() {
            let start = index * REQUEST_LEN;
            trace!(conn = conn.0, "received {}", Hex(&bytes[start..start + REQUEST_LEN]));
            match record {
                Ok(request) if request.op == OpCode::End => {
                    self.stats.ends_received += 1;
                    info!(conn = conn.0, "received END #{}", self.stats.ends_received);
                    if self.peers[conn.0] == PeerState::Active {
                        self.peers[conn.0] = PeerState::Ended;
                    }
                }
                Ok(request) => {
                    if self.jobs.send(Job { request, conn }).is_err() {
                        warn!("worker queue closed, dropping request");
                        self.stats.records_dropped += 1;
                    } else {
                        self.stats.records_routed += 1;
                    }
                }
                Err(err) => {
                    warn!(conn = conn.0, error = %err, "dropping record");
                    self.stats.records_dropped += 1;
                }
            }
        }
        true
    }
}
