use std::time::Duration;

use crate::error::{FlotillaError, Result};

/// Cluster infrastructure description, validated once up front.
///
/// `hosts` enumerates the worker nodes; the MVP assigns exactly one rank
/// per host, so the resulting group size is `1 + num_worker_nodes`.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub master_node: String,
    pub per_node_cores: u32,
    /// Threads per node; `None` disables intra-node threading. Advisory.
    pub per_node_threads: Option<u32>,
    pub num_worker_nodes: usize,
    pub hosts: Vec<String>,
    pub ssh_user: String,
    /// Worker binary name invoked on each remote node.
    pub python_executable: String,
    /// Shared project path present on every node.
    pub working_dir: String,
    pub time_job: bool,
    pub progress_to_terminal: bool,
    pub timeouts: Timeouts,
}

/// Runtime timeouts. These are tunable knobs, separate from the one-shot
/// infrastructure field set.
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Deadline for all workers to dial back and complete handshake.
    pub bootstrap: Duration,
    /// Deadline for a collective's blocking receives; `None` disables it.
    pub collective: Option<Duration>,
    /// Deadline for workers to report in after cancellation or shutdown.
    pub drain: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            bootstrap: Duration::from_secs(60),
            collective: None,
            drain: Duration::from_secs(15),
        }
    }
}

impl Timeouts {
    pub fn with_bootstrap(mut self, d: Duration) -> Self {
        self.bootstrap = d;
        self
    }

    pub fn with_collective(mut self, d: Duration) -> Self {
        self.collective = Some(d);
        self
    }

    pub fn with_drain(mut self, d: Duration) -> Self {
        self.drain = d;
        self
    }
}

impl ClusterConfig {
    /// Check the enumerated field set. Every rejection is `InvalidConfig`.
    pub fn validate(&self) -> Result<()> {
        if self.master_node.is_empty() {
            return Err(FlotillaError::InvalidConfig(
                "master_node cannot be empty".into(),
            ));
        }
        if self.per_node_cores == 0 {
            return Err(FlotillaError::InvalidConfig(
                "per_node_cores must be positive".into(),
            ));
        }
        if let Some(threads) = self.per_node_threads {
            if threads == 0 {
                return Err(FlotillaError::InvalidConfig(
                    "per_node_threads must be positive if set".into(),
                ));
            }
        }
        if self.num_worker_nodes == 0 {
            return Err(FlotillaError::InvalidConfig(
                "num_worker_nodes must be positive".into(),
            ));
        }
        if self.hosts.len() != self.num_worker_nodes {
            return Err(FlotillaError::InvalidConfig(format!(
                "num_worker_nodes ({}) must match number of hosts ({})",
                self.num_worker_nodes,
                self.hosts.len()
            )));
        }
        if self.hosts.iter().any(|h| h.is_empty()) {
            return Err(FlotillaError::InvalidConfig(
                "host addresses cannot be empty".into(),
            ));
        }
        if self.ssh_user.is_empty() {
            return Err(FlotillaError::InvalidConfig(
                "ssh_user cannot be empty".into(),
            ));
        }
        if self.python_executable.is_empty() {
            return Err(FlotillaError::InvalidConfig(
                "python_executable cannot be empty".into(),
            ));
        }
        if self.working_dir.is_empty() {
            return Err(FlotillaError::InvalidConfig(
                "working_dir cannot be empty".into(),
            ));
        }
        Ok(())
    }

    /// Group size for a job launched from this configuration: the master
    /// plus one rank per worker host.
    pub fn group_size(&self) -> usize {
        1 + self.num_worker_nodes
    }
}
