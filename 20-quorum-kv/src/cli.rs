use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Replicated key-value store with quorum-committed writes",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run this node's server and client together.
    Node(NodeArgs),
    /// Run only the replica server.
    Server(ClusterArgs),
    /// Run only the client coordinator against every server.
    Client(NodeArgs),
}

/// Where the cluster is and which member this process is.
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Comma-separated `host[:port]` list, in node order.
    #[arg(long, conflicts_with = "hosts_file", required_unless_present = "hosts_file")]
    pub hosts: Option<String>,

    /// File with one `host[:port]` per line, in node order.
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub hosts_file: Option<PathBuf>,

    /// Position of this node in the host list.
    #[arg(long, default_value_t = 0)]
    pub node_index: usize,

    /// Settings file of `key value` lines.
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// Seed for the workload and backoff RNGs.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Log every record sent and received.
    #[arg(long, short)]
    pub verbose: bool,
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Replay transactions from this file instead of generating them.
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub script: Option<PathBuf>,
}
