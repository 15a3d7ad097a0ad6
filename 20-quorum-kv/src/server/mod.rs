//! Replica server: accepts one connection per peer, then serves GET/PUT
//! proposals and COMMIT/ABORT decisions against its local [`Table`].
//!
//! The server moves through [`ServerPhase`] in order and never goes back:
//! once every configured peer has connected there is no reconnection, and
//! once every peer has sent END (or disconnected) no new work is accepted.

mod dispatcher;
mod worker;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use futures_util::future::join_all;
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedWriteHalf;
use tracing::{debug, info, warn};

use crate::table::Table;
use crate::transport::LockedWriter;
use dispatcher::Dispatcher;
use worker::Worker;

/// Index of a peer connection in the server's connection set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub usize);

/// Per-connection response channel, shared by every worker.
pub type ResponseWriter = LockedWriter<OwnedWriteHalf>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPhase {
    Listening,
    AwaitingQuorum,
    Serving,
    Draining,
    Stopped,
}

impl fmt::Display for ServerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerPhase::Listening => "LISTENING",
            ServerPhase::AwaitingQuorum => "AWAITING_QUORUM",
            ServerPhase::Serving => "SERVING",
            ServerPhase::Draining => "DRAINING",
            ServerPhase::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Connections to wait for before serving, one per node.
    pub peers: usize,
    pub workers: usize,
    pub table_size: usize,
}

/// What a stopped server saw and what its table ended up holding.
#[derive(Debug, Clone)]
pub struct ServerReport {
    pub connections: usize,
    pub ends_received: usize,
    pub disconnected: usize,
    pub records_routed: u64,
    pub records_dropped: u64,
    pub table: Vec<i32>,
    pub locked_slots: usize,
}

pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    table: Arc<Table>,
}

impl Server {
    /// Binds the listening socket. The server is in [`ServerPhase::Listening`]
    /// when this returns.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        ensure!(config.peers > 0, "server needs at least one peer");
        ensure!(config.workers > 0, "server needs at least one worker");
        ensure!(config.table_size > 0, "table_size must be positive");

        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        let table = Arc::new(Table::new(config.table_size));
        let server = Self {
            listener,
            config,
            table,
        };
        info!(addr = %server.local_addr()?, phase = %ServerPhase::Listening, "server bound");
        Ok(server)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared handle to the replica's table.
    pub fn table(&self) -> Arc<Table> {
        Arc::clone(&self.table)
    }

    /// Runs the server through every phase and returns once it is stopped.
    pub async fn run(self) -> Result<ServerReport> {
        let Server {
            listener,
            config,
            table,
        } = self;

        info!(phase = %ServerPhase::AwaitingQuorum, peers = config.peers, "waiting for peers");
        let mut readers = Vec::with_capacity(config.peers);
        let mut writers = Vec::with_capacity(config.peers);
        while readers.len() < config.peers {
            let (stream, peer) = listener.accept().await.context("accept failed")?;
            if let Err(err) = stream.set_nodelay(true) {
                warn!(%peer, error = %err, "failed to disable nagle");
            }
            info!(%peer, conn = readers.len(), "peer connected");
            let (reader, writer) = stream.into_split();
            writers.push(ResponseWriter::new(peer.to_string(), writer));
            readers.push(reader);
        }
        drop(listener);
        let connections: Arc<[ResponseWriter]> = writers.into();

        info!(phase = %ServerPhase::Serving, workers = config.workers, "quorum reached");
        let (jobs_tx, jobs_rx) = flume::unbounded();
        let workers: Vec<_> = (0..config.workers)
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

        let stats = Dispatcher::new(readers, jobs_tx).run().await;

        info!(
            phase = %ServerPhase::Draining,
            ends = stats.ends_received,
            disconnected = stats.disconnected,
            "all peers finished"
        );
        for (id, result) in join_all(workers).await.into_iter().enumerate() {
            match result {
                Ok(worker_stats) => debug!(
                    worker = id,
                    handled = worker_stats.handled,
                    write_failures = worker_stats.write_failures,
                    "worker joined"
                ),
                Err(err) => warn!(worker = id, error = %err, "worker task failed"),
            }
        }
        for conn in connections.iter() {
            if let Err(err) = conn.shutdown().await {
                debug!(conn = conn.label(), error = %err, "shutdown failed");
            }
        }

        let report = ServerReport {
            connections: connections.len(),
            ends_received: stats.ends_received,
            disconnected: stats.disconnected,
            records_routed: stats.records_routed,
            records_dropped: stats.records_dropped,
            table: table.snapshot(),
            locked_slots: table.locked_slots(),
        };
        info!(
            phase = %ServerPhase::Stopped,
            routed = report.records_routed,
            dropped = report.records_dropped,
            locked = report.locked_slots,
            "server stopped"
        );
        Ok(report)
    }
}
