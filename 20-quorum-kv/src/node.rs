//! Wiring from command-line arguments to a running server and/or client.

use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::{ClusterArgs, NodeArgs};
use crate::client::{self, ClientConfig, RunReport};
use crate::config::Settings;
use crate::server::{Server, ServerConfig, ServerReport};
use crate::topology::ClusterTopology;
use crate::workload::{RandomWorkload, Transaction, parse_script};

/// Everything a node needs to know before it starts.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub settings: Settings,
    pub topology: ClusterTopology,
    pub node_index: usize,
    /// Settings keys that were not recognized.
    pub ignored_keys: Vec<String>,
}

impl Cluster {
    /// Reads the settings and hosts files named by `args`.
    pub fn load(args: &ClusterArgs) -> Result<Self> {
        let (mut settings, ignored_keys) = match &args.config {
            Some(path) => Settings::parse(&read(path)?)?,
            None => (Settings::default(), Vec::new()),
        };
        if args.verbose {
            settings.verbose = true;
        }
        if args.seed.is_some() {
            settings.seed = args.seed;
        }
        settings.validate()?;

        let topology = match (&args.hosts, &args.hosts_file) {
            (Some(list), _) => ClusterTopology::from_list(list, settings.port)?,
            (None, Some(path)) => ClusterTopology::from_hosts_file(&read(path)?, settings.port)?,
            (None, None) => anyhow::bail!("either --hosts or --hosts-file is required"),
        };
        topology.address(args.node_index)?;

        Ok(Self {
            settings,
            topology,
            node_index: args.node_index,
            ignored_keys,
        })
    }

    pub fn server_config(&self) -> Result<ServerConfig> {
        let port = self.topology.listen_port(self.node_index)?;
        Ok(ServerConfig {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            peers: self.topology.len(),
            workers: self.settings.server_threads,
            table_size: self.settings.table_size,
        })
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            node_index: self.node_index,
            num_nodes: self.topology.len(),
            servers: self.topology.addresses().to_vec(),
            backlog: self.settings.backlog,
            max_retries: self.settings.max_retries,
            connect_retry_delay: self.settings.connect_retry_delay(),
            seed: self.settings.seed,
        }
    }

    /// The replayed script if one was given, otherwise a random workload.
    pub fn workload(
        &self,
        script: Option<&Path>,
    ) -> Result<Box<dyn Iterator<Item = Transaction> + Send>> {
        match script {
            Some(path) => {
                let transactions = parse_script(&read(path)?)
                    .with_context(|| format!("invalid script {}", path.display()))?;
                info!(
                    path = %path.display(),
                    transactions = transactions.len(),
                    "replaying script"
                );
                Ok(Box::new(transactions.into_iter()))
            }
            None => {
                let workload =
                    RandomWorkload::new(self.settings.random_workload(), self.settings.seed)?;
                Ok(Box::new(workload))
            }
        }
    }

    fn log_ignored_keys(&self) {
        for key in &self.ignored_keys {
            warn!(key = %key, "ignoring unknown setting");
        }
    }
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn log_server_report(report: &ServerReport) {
    info!(
        connections = report.connections,
        ends = report.ends_received,
        routed = report.records_routed,
        locked = report.locked_slots,
        "server report"
    );
}

pub async fn run_server(cluster: &Cluster) -> Result<ServerReport> {
    cluster.log_ignored_keys();
    let server = Server::bind(cluster.server_config()?).await?;
    let report = server.run().await?;
    log_server_report(&report);
    Ok(report)
}

pub async fn run_client(cluster: &Cluster, args: &NodeArgs) -> Result<RunReport> {
    cluster.log_ignored_keys();
    let workload = cluster.workload(args.script.as_deref())?;
    client::run(cluster.client_config(), workload).await
}

/// Runs this node's server and client side by side. The server is bound
/// before the client starts connecting so peers never see it missing.
pub async fn run_node(cluster: &Cluster, args: &NodeArgs) -> Result<(ServerReport, RunReport)> {
    cluster.log_ignored_keys();
    info!(
        node = cluster.node_index,
        nodes = cluster.topology.len(),
        "starting node"
    );
    let server = Server::bind(cluster.server_config()?).await?;
    let workload = cluster.workload(args.script.as_deref())?;
    let (server_report, run_report) =
        tokio::try_join!(server.run(), client::run(cluster.client_config(), workload))?;
    log_server_report(&server_report);
    Ok((server_report, run_report))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(hosts: &str, node_index: usize) -> ClusterArgs {
        ClusterArgs {
            hosts: Some(hosts.to_string()),
            hosts_file: None,
            node_index,
            config: None,
            seed: Some(3),
            verbose: false,
        }
    }

    #[test]
    fn derives_server_and_client_configs() {
        let cluster = Cluster::load(&args("10.0.0.1,10.0.0.2:9100", 1)).expect("valid cluster");
        let server = cluster.server_config().expect("server config");
        assert_eq!(server.listen.port(), 9100);
        assert_eq!(server.peers, 2);

        let client = cluster.client_config();
        assert_eq!(client.node_index, 1);
        assert_eq!(client.num_nodes, 2);
        assert_eq!(client.servers, vec!["10.0.0.1:9000", "10.0.0.2:9100"]);
        assert_eq!(client.seed, Some(3));
    }

    #[test]
    fn rejects_node_index_outside_the_host_list() {
        assert!(Cluster::load(&args("10.0.0.1", 1)).is_err());
    }

    #[test]
    fn random_workload_is_the_default() {
        let cluster = Cluster::load(&args("127.0.0.1", 0)).expect("valid cluster");
        let count = cluster.workload(None).expect("workload").count();
        assert_eq!(count, cluster.settings.num_test_commands);
    }
}
