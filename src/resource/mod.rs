//! Node resources: what this machine has and what it is using.
//!
//! - [`ResourceProvider`]: port yielding a [`ResourceSnapshot`] on demand
//! - [`SystemResourceProvider`]: `sysinfo`-backed provider
//! - [`NodeIdentity`]: fixed per-process identity and capacity
//! - [`ResourceReport`]: what one cluster heartbeat carries

pub mod system;

use std::collections::BTreeMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use system::SystemResourceProvider;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Kinds of work this node can host. Each maps to an application endpoint
/// in the heartbeat so the cluster manager knows where to push actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Map,
    Reduce,
    Coordinator,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::Map,
        ResourceKind::Reduce,
        ResourceKind::Coordinator,
    ];
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Map => write!(f, "map"),
            ResourceKind::Reduce => write!(f, "reduce"),
            ResourceKind::Coordinator => write!(f, "coordinator"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeSpecs {
    pub num_cpus: u16,
    pub network_mbps: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
}

/// Point-in-time measurement. `None` means the figure is unavailable on
/// this platform.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceSnapshot {
    pub num_cpus: Option<u16>,
    /// 0..=100
    pub cpu_usage_percent: Option<f32>,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    pub disk_total_bytes: u64,
    pub disk_free_bytes: u64,
}

impl ResourceSnapshot {
    pub fn num_cpus_or_one(&self) -> u16 {
        self.num_cpus.filter(|n| *n > 0).unwrap_or(1)
    }

    pub fn disk_free_gb(&self) -> u64 {
        self.disk_free_bytes / GIB
    }
}

pub trait ResourceProvider: Send + Sync {
    fn snapshot(&self) -> ResourceSnapshot;

    /// Verify local working directories are usable. A failure here is a
    /// disk-level fault for any job reporting from this node.
    fn check_local_dirs(&self) -> Result<()> {
        Ok(())
    }
}

/// Created once at startup, after both inbound servers are bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub name: String,
    /// Where the cluster manager pushes callbacks
    pub callback_addr: SocketAddr,
    /// Where coordinators push task actions
    pub action_addr: SocketAddr,
    pub total: ComputeSpecs,
}

impl NodeIdentity {
    pub fn new(
        name: impl Into<String>,
        callback_addr: SocketAddr,
        action_addr: SocketAddr,
        snapshot: &ResourceSnapshot,
        network_capacity_mbps: u32,
    ) -> Self {
        Self {
            name: name.into(),
            callback_addr,
            action_addr,
            total: ComputeSpecs {
                num_cpus: snapshot.num_cpus_or_one(),
                network_mbps: network_capacity_mbps,
                memory_mb: snapshot.total_memory_bytes / MIB,
                disk_gb: snapshot.disk_total_bytes / GIB,
            },
        }
    }

    /// Endpoint advertised for every resource kind.
    pub fn app_info(&self) -> String {
        self.action_addr.to_string()
    }
}

/// Built fresh on every cluster heartbeat tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReport {
    pub total: ComputeSpecs,
    pub used: ComputeSpecs,
    pub cpu_usage_percent: f32,
    pub resource_infos: BTreeMap<ResourceKind, String>,
}

impl ResourceReport {
    pub fn build(identity: &NodeIdentity, snapshot: &ResourceSnapshot, network_used_mbps: u32) -> Self {
        let cpu_usage_percent = snapshot.cpu_usage_percent.unwrap_or(0.0).clamp(0.0, 100.0);
        let num_cpus = identity.total.num_cpus;
        let used = ComputeSpecs {
            num_cpus: (f32::from(num_cpus) * cpu_usage_percent / 100.0) as u16,
            network_mbps: network_used_mbps,
            memory_mb: snapshot
                .total_memory_bytes
                .saturating_sub(snapshot.available_memory_bytes)
                / MIB,
            disk_gb: snapshot.disk_total_bytes.saturating_sub(snapshot.disk_free_bytes) / GIB,
        };

        let app_info = identity.app_info();
        let resource_infos = ResourceKind::ALL
            .iter()
            .map(|kind| (*kind, app_info.clone()))
            .collect();

        Self {
            total: identity.total,
            used,
            cpu_usage_percent,
            resource_infos,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> ResourceSnapshot {
        ResourceSnapshot {
            num_cpus: Some(8),
            cpu_usage_percent: Some(50.0),
            total_memory_bytes: 16 * GIB,
            available_memory_bytes: 4 * GIB,
            disk_total_bytes: 500 * GIB,
            disk_free_bytes: 200 * GIB,
        }
    }

    fn identity(snapshot: &ResourceSnapshot) -> NodeIdentity {
        NodeIdentity::new(
            "node-1",
            "127.0.0.1:7001".parse().unwrap(),
            "127.0.0.1:7002".parse().unwrap(),
            snapshot,
            100,
        )
    }

    #[test]
    fn identity_totals_from_snapshot() {
        let snap = snapshot();
        let id = identity(&snap);
        assert_eq!(id.total.num_cpus, 8);
        assert_eq!(id.total.memory_mb, 16 * 1024);
        assert_eq!(id.total.disk_gb, 500);
        assert_eq!(id.total.network_mbps, 100);
        assert_eq!(id.app_info(), "127.0.0.1:7002");
    }

    #[test]
    fn unavailable_cpu_count_reports_one() {
        let snap = ResourceSnapshot {
            num_cpus: None,
            ..snapshot()
        };
        assert_eq!(identity(&snap).total.num_cpus, 1);
    }

    #[test]
    fn report_computes_usage() {
        let snap = snapshot();
        let report = ResourceReport::build(&identity(&snap), &snap, 10);
        assert_eq!(report.used.num_cpus, 4);
        assert_eq!(report.used.memory_mb, 12 * 1024);
        assert_eq!(report.used.disk_gb, 300);
        assert_eq!(report.used.network_mbps, 10);
        assert_eq!(report.resource_infos.len(), 3);
        assert_eq!(
            report.resource_infos.get(&ResourceKind::Coordinator).map(String::as_str),
            Some("127.0.0.1:7002")
        );
    }

    #[test]
    fn unavailable_cpu_usage_counts_as_idle() {
        let snap = ResourceSnapshot {
            cpu_usage_percent: None,
            ..snapshot()
        };
        let report = ResourceReport::build(&identity(&snap), &snap, 10);
        assert_eq!(report.used.num_cpus, 0);
        assert_eq!(report.cpu_usage_percent, 0.0);
    }
}
