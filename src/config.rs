use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the two inbound servers (cluster-manager callback
/// server and coordinator action server).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum number of requests served concurrently per server
    pub handler_pool_size: usize,
    /// Requests taking longer than this are answered with 408
    pub client_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            handler_pool_size: 10,
            client_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Name this node reports to the cluster manager and to coordinators
    pub node_name: String,
    /// Host the inbound servers bind to; ports are always ephemeral
    pub bind_host: IpAddr,
    /// host:port of the cluster resource manager
    pub cluster_manager_addr: String,

    pub cluster_heartbeat_interval_ms: u64,
    pub cluster_retry_backoff_ms: u64,
    pub max_cluster_heartbeat_failures: u32,
    /// `is_alive` answers false once the last successful cluster heartbeat
    /// is older than this
    pub node_expiry_interval_ms: u64,

    pub coordinator_connect_timeout_ms: u64,
    /// Interval used by a job reporter until its coordinator assigns one
    pub default_job_heartbeat_interval_ms: u64,
    /// Idle jobs still heartbeat after this long to detect a dead coordinator
    pub slow_heartbeat_ceiling_ms: u64,
    pub counter_update_interval_ms: u64,
    pub version_check_enabled: bool,
    pub build_version: String,

    /// Stop accepting new tasks when free disk drops below this. 0 disables.
    pub min_free_disk_gb: u64,
    /// Directories whose health gates the disk-fault path of job reporters
    pub local_dirs: Vec<PathBuf>,

    pub network_capacity_mbps: u32,
    pub network_used_mbps: u32,

    pub server: ServerConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: "localhost".to_string(),
            bind_host: IpAddr::from([127, 0, 0, 1]),
            cluster_manager_addr: "127.0.0.1:8080".to_string(),
            cluster_heartbeat_interval_ms: 3_000,
            cluster_retry_backoff_ms: 10_000,
            max_cluster_heartbeat_failures: 10,
            node_expiry_interval_ms: 120_000,
            coordinator_connect_timeout_ms: 60_000,
            default_job_heartbeat_interval_ms: 3_000,
            slow_heartbeat_ceiling_ms: 180_000,
            counter_update_interval_ms: 60_000,
            version_check_enabled: true,
            build_version: env!("CARGO_PKG_VERSION").to_string(),
            min_free_disk_gb: 0,
            local_dirs: Vec::new(),
            network_capacity_mbps: 100,
            network_used_mbps: 10,
            server: ServerConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn new(node_name: impl Into<String>, cluster_manager_addr: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            cluster_manager_addr: cluster_manager_addr.into(),
            ..Default::default()
        }
    }

    pub fn with_cluster_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.cluster_heartbeat_interval_ms = ms;
        self
    }

    pub fn with_version_check(mut self, enabled: bool) -> Self {
        self.version_check_enabled = enabled;
        self
    }

    pub fn with_build_version(mut self, version: impl Into<String>) -> Self {
        self.build_version = version.into();
        self
    }

    pub fn with_local_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_dirs.push(dir.into());
        self
    }

    pub fn cluster_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cluster_heartbeat_interval_ms)
    }

    pub fn cluster_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.cluster_retry_backoff_ms)
    }

    pub fn node_expiry_interval(&self) -> Duration {
        Duration::from_millis(self.node_expiry_interval_ms)
    }

    pub fn coordinator_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.coordinator_connect_timeout_ms)
    }

    pub fn default_job_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.default_job_heartbeat_interval_ms)
    }

    pub fn slow_heartbeat_ceiling(&self) -> Duration {
        Duration::from_millis(self.slow_heartbeat_ceiling_ms)
    }

    pub fn counter_update_interval(&self) -> Duration {
        Duration::from_millis(self.counter_update_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_default() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.handler_pool_size, 10);
        assert_eq!(cfg.client_timeout_ms, 30_000);
    }

    #[test]
    fn agent_config_default() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.cluster_heartbeat_interval_ms, 3_000);
        assert_eq!(cfg.cluster_retry_backoff_ms, 10_000);
        assert_eq!(cfg.max_cluster_heartbeat_failures, 10);
        assert_eq!(cfg.coordinator_connect_timeout_ms, 60_000);
        assert_eq!(cfg.slow_heartbeat_ceiling_ms, 180_000);
        assert!(cfg.version_check_enabled);
        assert_eq!(cfg.build_version, env!("CARGO_PKG_VERSION"));
        assert!(cfg.local_dirs.is_empty());
    }

    #[test]
    fn agent_config_new() {
        let cfg = AgentConfig::new("worker-7", "10.0.0.1:9000");
        assert_eq!(cfg.node_name, "worker-7");
        assert_eq!(cfg.cluster_manager_addr, "10.0.0.1:9000");
        assert_eq!(cfg.cluster_heartbeat_interval_ms, 3_000);
    }

    #[test]
    fn agent_config_builders() {
        let cfg = AgentConfig::default()
            .with_cluster_heartbeat_interval_ms(500)
            .with_version_check(false)
            .with_build_version("2.0.0")
            .with_local_dir("/data/1")
            .with_local_dir("/data/2");
        assert_eq!(cfg.cluster_heartbeat_interval(), Duration::from_millis(500));
        assert!(!cfg.version_check_enabled);
        assert_eq!(cfg.build_version, "2.0.0");
        assert_eq!(cfg.local_dirs.len(), 2);
    }
}
