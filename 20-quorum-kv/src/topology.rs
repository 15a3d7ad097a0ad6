use anyhow::{Context, Result, ensure};

/// Ordered list of cluster members. Every node runs a server and a client,
/// and a node's position in the list is its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTopology {
    hosts: Vec<String>,
}

impl ClusterTopology {
    /// Entries without a port get `default_port`.
    pub fn new<S: AsRef<str>>(entries: &[S], default_port: u16) -> Result<Self> {
        let hosts: Vec<String> = entries
            .iter()
            .map(|entry| entry.as_ref().trim())
            .filter(|entry| !entry.is_empty())
            .map(|entry| with_port(entry, default_port))
            .collect::<Result<_>>()?;
        ensure!(!hosts.is_empty(), "topology requires at least one host");
        Ok(Self { hosts })
    }

    /// Parses a comma-separated `--hosts` value.
    pub fn from_list(list: &str, default_port: u16) -> Result<Self> {
        let entries: Vec<&str> = list.split(',').collect();
        Self::new(&entries, default_port)
    }

    /// Parses a hosts file: the first whitespace-separated field of each
    /// non-blank line is `host[:port]`. Lines starting with `#` are skipped.
    pub fn from_hosts_file(text: &str, default_port: u16) -> Result<Self> {
        let entries: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.starts_with('#'))
            .filter_map(|line| line.split_whitespace().next())
            .collect();
        Self::new(&entries, default_port)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// `host:port` of every member, in order.
    pub fn addresses(&self) -> &[String] {
        &self.hosts
    }

    pub fn address(&self, node_index: usize) -> Result<&str> {
        self.hosts
            .get(node_index)
            .map(String::as_str)
            .with_context(|| {
                format!(
                    "node index {node_index} out of range for {} hosts",
                    self.hosts.len()
                )
            })
    }

    /// Port the given node's server listens on.
    pub fn listen_port(&self, node_index: usize) -> Result<u16> {
        let address = self.address(node_index)?;
        let (_, port) = address
            .rsplit_once(':')
            .with_context(|| format!("address '{address}' has no port"))?;
        port.parse()
            .with_context(|| format!("invalid port in '{address}'"))
    }
}

fn with_port(entry: &str, default_port: u16) -> Result<String> {
    match entry.rsplit_once(':') {
        Some((host, port)) => {
            ensure!(!host.is_empty(), "missing host in '{entry}'");
            port.parse::<u16>()
                .with_context(|| format!("invalid port in '{entry}'"))?;
            Ok(entry.to_string())
        }
        None => Ok(format!("{entry}:{default_port}")),
    }
}
