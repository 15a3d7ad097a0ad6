//! Client coordinator: broadcasts a transaction stream to every server and
//! resolves each message by quorum.
//!
//! [`coordinator::Coordinator`] holds all protocol state and decides what to
//! send. This module owns the sockets: one reader task per server feeds
//! responses into a single channel, the send loop applies them to the
//! coordinator, and retry timers run as independent tasks that share the
//! coordinator through a mutex.

pub mod backoff;
pub mod coordinator;
pub mod pending;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, ensure};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::codec::{Hex, Request, Response, decode_batch};
use crate::transport::{LockedWriter, RESPONSE_READ_SIZE, connect_with_retry};
use crate::workload::Transaction;
use coordinator::{Action, Coordinator};
use pending::ids_per_node;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Position of this node in the cluster; selects the message ID residue.
    pub node_index: usize,
    pub num_nodes: usize,
    /// `host:port` of every server, in cluster order.
    pub servers: Vec<String>,
    /// Unresolved messages allowed before the send loop waits.
    pub backlog: usize,
    pub max_retries: u32,
    pub connect_retry_delay: Duration,
    pub seed: Option<u64>,
}

/// Outcome of a finished client run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub transactions: u64,
    pub gets: u64,
    pub commits: u64,
    pub cancels: u64,
    pub retries: u64,
    /// `(key, value)` for every GET, in the order they were answered.
    pub reads: Vec<(u16, u16)>,
    pub elapsed: Duration,
}

impl RunReport {
    /// Transactions per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.transactions as f64 / secs
        } else {
            0.0
        }
    }
}

type ServerWriter = LockedWriter<OwnedWriteHalf>;

struct Session {
    coordinator: Mutex<Coordinator>,
    servers: Vec<ServerWriter>,
}

impl Session {
    fn outstanding(&self) -> usize {
        self.coordinator.lock().outstanding()
    }

    fn is_idle(&self) -> bool {
        self.coordinator.lock().is_idle()
    }

    async fn send_to(&self, server: usize, request: &Request) -> Result<()> {
        let writer = &self.servers[server];
        writer
            .send(&request.encode())
            .await
            .with_context(|| format!("failed to send to {}", writer.label()))
    }

    async fn broadcast(&self, request: &Request, skip: Option<usize>) -> Result<()> {
        for server in (0..self.servers.len()).filter(|server| Some(*server) != skip) {
            self.send_to(server, request).await?;
        }
        Ok(())
    }

    async fn handle(self: &Arc<Self>, server: usize, response: Response) -> Result<()> {
        let actions = self.coordinator.lock().on_response(server, response)?;
        self.perform(actions).await
    }

    async fn perform(self: &Arc<Self>, actions: Vec<Action>) -> Result<()> {
        for action in actions {
            match action {
                Action::Broadcast(request) => self.broadcast(&request, None).await?,
                Action::BroadcastExcept { skip, request } => {
                    self.broadcast(&request, Some(skip)).await?
                }
                Action::Send { server, request } => self.send_to(server, &request).await?,
                Action::ScheduleRetry { id, delay } => {
                    debug!(id, ?delay, "retry scheduled");
                    let session = Arc::clone(self);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let request = session.coordinator.lock().fire_retry(id);
                        if let Some(request) = request {
                            if let Err(err) = session.broadcast(&request, None).await {
                                warn!(id, error = %err, "retry broadcast failed");
                            }
                        }
                    });
                }
            }
        }
        Ok(())
    }
}

async fn read_responses(
    server: usize,
    mut reader: OwnedReadHalf,
    responses: mpsc::UnboundedSender<(usize, Response)>,
) {
    let mut buf = vec![0; RESPONSE_READ_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!(server, "server closed its connection");
                return;
            }
            Ok(n) => n,
            Err(err) => {
                warn!(server, error = %err, "read failed");
                return;
            }
        };
        let records = match decode_batch::<Response>(&buf[..n]) {
            Ok(records) => records,
            Err(err) => {
                warn!(server, error = %err, "malformed read, dropping connection");
                return;
            }
        };
        for record in records {
            match record {
                Ok(response) => {
                    trace!(server, "received {}", Hex(&response.encode()));
                    if responses.send((server, response)).is_err() {
                        return;
                    }
                }
                Err(err) => warn!(server, error = %err, "dropping response"),
            }
        }
    }
}

async fn connect_all(config: &ClientConfig) -> Result<(Vec<ServerWriter>, Vec<OwnedReadHalf>)> {
    let mut writers = Vec::with_capacity(config.servers.len());
    let mut readers = Vec::with_capacity(config.servers.len());
    for addr in &config.servers {
        let stream =
            connect_with_retry(addr.as_str(), config.max_retries, config.connect_retry_delay)
                .await?;
        info!(server = %addr, "connected");
        let (reader, writer) = stream.into_split();
        writers.push(ServerWriter::new(addr.clone(), writer));
        readers.push(reader);
    }
    Ok((writers, readers))
}

/// Connects to every server, runs `workload` to completion, then sends END.
pub async fn run<I>(config: ClientConfig, workload: I) -> Result<RunReport>
where
    I: IntoIterator<Item = Transaction>,
{
    ensure!(!config.servers.is_empty(), "client needs at least one server");
    let capacity = ids_per_node(config.num_nodes);
    ensure!(
        config.backlog < capacity,
        "backlog {} does not fit in the {capacity} message IDs of each of {} nodes",
        config.backlog,
        config.num_nodes
    );
    let coordinator = Coordinator::new(
        config.node_index,
        config.num_nodes,
        config.servers.len(),
        config.seed,
    )?;
    let (writers, readers) = connect_all(&config).await?;

    let session = Arc::new(Session {
        coordinator: Mutex::new(coordinator),
        servers: writers,
    });

    let (responses_tx, mut responses) = mpsc::unbounded_channel();
    let reader_tasks: Vec<JoinHandle<()>> = readers
        .into_iter()
        .enumerate()
        .map(|(server, reader)| {
            tokio::spawn(read_responses(server, reader, responses_tx.clone()))
        })
        .collect();
    drop(responses_tx);

    let started = Instant::now();
    for transaction in workload {
        let request = session.coordinator.lock().submit(transaction)?;
        session.broadcast(&request, None).await?;

        while let Ok((server, response)) = responses.try_recv() {
            session.handle(server, response).await?;
        }
        while session.outstanding() > config.backlog {
            let (server, response) = responses
                .recv()
                .await
                .context("every server closed its connection with work outstanding")?;
            session.handle(server, response).await?;
        }
    }

    while !session.is_idle() {
        let (server, response) = responses
            .recv()
            .await
            .context("every server closed its connection while draining")?;
        session.handle(server, response).await?;
    }
    let elapsed = started.elapsed();

    session.broadcast(&Request::end(), None).await?;
    info!(servers = session.servers.len(), "sent END to every server");
    for writer in &session.servers {
        if let Err(err) = writer.shutdown().await {
            debug!(server = writer.label(), error = %err, "shutdown failed");
        }
    }
    for task in reader_tasks {
        task.abort();
    }

    let stats = session.coordinator.lock().stats().clone();
    let report = RunReport {
        transactions: stats.submitted,
        gets: stats.gets,
        commits: stats.commits,
        cancels: stats.cancels,
        retries: stats.retries,
        reads: stats.reads,
        elapsed,
    };
    info!("messaging runtime: {:.3}s", elapsed.as_secs_f64());
    info!(
        commits = report.commits,
        gets = report.gets,
        retries = report.retries,
        "throughput: {:.1} transactions/s",
        report.throughput()
    );
    Ok(report)
}
