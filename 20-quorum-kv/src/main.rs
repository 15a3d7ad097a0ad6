use anyhow::Result;
use clap::Parser;
use tracing::info;

use quorum_kv::cli::{Cli, Command};
use quorum_kv::node::{self, Cluster};

fn init_tracing(verbose: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let default = if verbose { "trace" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Node(args) => {
            let cluster = Cluster::load(&args.cluster)?;
            init_tracing(cluster.settings.verbose);
            let (server, client) = node::run_node(&cluster, &args).await?;
            info!(
                table_slots = server.table.len(),
                commits = client.commits,
                "node {} done",
                cluster.node_index
            );
        }
        Command::Server(args) => {
            let cluster = Cluster::load(&args)?;
            init_tracing(cluster.settings.verbose);
            node::run_server(&cluster).await?;
        }
        Command::Client(args) => {
            let cluster = Cluster::load(&args.cluster)?;
            init_tracing(cluster.settings.verbose);
            node::run_client(&cluster, &args).await?;
        }
    }

    Ok(())
}
