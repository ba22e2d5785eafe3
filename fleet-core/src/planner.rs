//! Partition planning.
//!
//! Partitions are fully recomputed from the catalog on every pass. Given the same catalog and
//! criterion the plan is always identical, which keeps the composed document's fingerprint stable.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::catalog::{NodeCatalog, NodeRecord, RESOURCE_CORES_PER_SOCKET, RESOURCE_CPUS, RESOURCE_REAL_MEMORY};
use crate::error::AppError;
use crate::facts::application_of;

/// The name of the partition used when nothing else applies.
pub const DEFAULT_PARTITION_NAME: &str = "batch";

/// The criterion used to group nodes into partitions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionCriterion {
    /// Tier nodes by real memory.
    RealMemory,
    /// Tier nodes by CPU count.
    Cpus,
    /// Tier nodes by cores per socket.
    CoresPerSocket,
    /// Group nodes by their explicit partition, or by the application they belong to.
    Application,
    /// An unrecognized criterion, which falls back to a single default partition.
    Unsupported(String),
}

impl PartitionCriterion {
    /// The catalog resource this criterion tiers on, if any.
    pub fn metric(&self) -> Option<&'static str> {
        match self {
            Self::RealMemory => Some(RESOURCE_REAL_MEMORY),
            Self::Cpus => Some(RESOURCE_CPUS),
            Self::CoresPerSocket => Some(RESOURCE_CORES_PER_SOCKET),
            Self::Application | Self::Unsupported(_) => None,
        }
    }
}

impl Default for PartitionCriterion {
    fn default() -> Self {
        Self::Application
    }
}

impl FromStr for PartitionCriterion {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "realmemory" | "memory" => Self::RealMemory,
            "cpus" | "cpu" => Self::Cpus,
            "corespersocket" => Self::CoresPerSocket,
            "application" | "partition" => Self::Application,
            _ => Self::Unsupported(s.trim().to_string()),
        })
    }
}

impl fmt::Display for PartitionCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RealMemory => f.write_str(RESOURCE_REAL_MEMORY),
            Self::Cpus => f.write_str(RESOURCE_CPUS),
            Self::CoresPerSocket => f.write_str(RESOURCE_CORES_PER_SOCKET),
            Self::Application => f.write_str("Application"),
            Self::Unsupported(val) => write!(f, "Unsupported({})", val),
        }
    }
}

/// A single partition of the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PartitionSpec {
    pub name: String,
    /// Member node names, in a stable order.
    pub member_nodes: Vec<String>,
    /// Whether this is the cluster's default partition. Exactly one partition is the default.
    pub default: bool,
    /// Partition level limits, rendered as `Key=Value` pairs.
    pub limits: BTreeMap<String, String>,
}

/// Operator supplied planning parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannerConfig {
    /// The name of the default partition.
    pub default_partition: String,
    /// Per-partition limits, keyed by partition name.
    pub limits: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            default_partition: DEFAULT_PARTITION_NAME.into(),
            limits: Default::default(),
        }
    }
}

impl PlannerConfig {
    /// Parse per-partition limits of the form `gpu:MaxTime=1-00:00:00,State=UP;batch:MaxNodes=4`.
    pub fn parse_limits(raw: &str) -> Result<BTreeMap<String, BTreeMap<String, String>>, AppError> {
        let mut limits: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for entry in raw.split(';').map(str::trim).filter(|entry| !entry.is_empty()) {
            let (partition, pairs) = entry
                .split_once(':')
                .ok_or_else(|| AppError::InvalidInput(format!("partition limits entry {:?} must be of the form `partition:Key=Value`", entry)))?;
            let partition = partition.trim();
            if partition.is_empty() {
                return Err(AppError::InvalidInput(format!("partition limits entry {:?} has an empty partition name", entry)));
            }
            let target = limits.entry(partition.to_string()).or_default();
            for pair in pairs.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| AppError::InvalidInput(format!("partition limit {:?} must be of the form `Key=Value`", pair)))?;
                target.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        Ok(limits)
    }
}

/// Compute the partitions of the cluster from the given catalog.
///
/// DOWN and drained nodes are left out of every partition unless force-included. Partitions
/// of the `Application` criterion survive even when all of their members are excluded, so
/// that jobs queued on them are not lost.
pub fn plan(catalog: &NodeCatalog, criterion: &PartitionCriterion, config: &PlannerConfig) -> Vec<PartitionSpec> {
    let mut groups: Vec<(String, Vec<String>)> = match criterion.metric() {
        Some(metric) => plan_tiers(catalog, metric, config),
        None if matches!(criterion, PartitionCriterion::Application) => plan_applications(catalog),
        None => {
            tracing::debug!(%criterion, "unsupported partition criterion, using single default partition");
            let members: Vec<_> = catalog.nodes().filter(|node| node.is_schedulable()).map(|node| node.name.clone()).collect();
            if members.is_empty() {
                vec![]
            } else {
                vec![(config.default_partition.clone(), members)]
            }
        }
    };
    groups.retain(|(name, _)| !name.is_empty());

    let default_idx = groups
        .iter()
        .position(|(name, _)| name == &config.default_partition)
        .unwrap_or(0);
    groups
        .into_iter()
        .enumerate()
        .map(|(idx, (name, member_nodes))| {
            let mut limits = BTreeMap::new();
            limits.insert("State".to_string(), "UP".to_string());
            if let Some(extra) = config.limits.get(&name) {
                limits.extend(extra.iter().map(|(key, val)| (key.clone(), val.clone())));
            }
            PartitionSpec {
                name,
                member_nodes,
                default: idx == default_idx,
                limits,
            }
        })
        .collect()
}

/// Tier schedulable nodes ascending by the given metric, one tier per distinct metric value.
fn plan_tiers(catalog: &NodeCatalog, metric: &str, config: &PlannerConfig) -> Vec<(String, Vec<String>)> {
    let mut nodes: Vec<(i64, &NodeRecord)> = catalog
        .nodes()
        .filter(|node| node.is_schedulable())
        .map(|node| (node.resource(metric).unwrap_or_default(), node))
        .collect();
    nodes.sort_by(|(a_val, a), (b_val, b)| a_val.cmp(b_val).then_with(|| a.name.cmp(&b.name)));

    let mut tiers: Vec<(i64, Vec<String>)> = vec![];
    for (value, node) in nodes {
        match tiers.last_mut() {
            Some((tier_value, members)) if *tier_value == value => members.push(node.name.clone()),
            _ => tiers.push((value, vec![node.name.clone()])),
        }
    }
    tiers
        .into_iter()
        .enumerate()
        .map(|(idx, (_, members))| (tier_name(&config.default_partition, idx), members))
        .collect()
}

/// Group nodes by explicit partition, falling back to the application name of their unit.
fn plan_applications(catalog: &NodeCatalog) -> Vec<(String, Vec<String>)> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for node in catalog.nodes() {
        let name = node.partition.clone().unwrap_or_else(|| application_of(&node.unit_id).to_string());
        let members = groups.entry(name).or_default();
        if node.is_schedulable() {
            members.push(node.name.clone());
        }
    }
    groups.into_iter().collect()
}

/// The name of the metric tier at the given index. The lowest tier carries the default name.
pub fn tier_name(default_partition: &str, idx: usize) -> String {
    if idx == 0 {
        default_partition.to_string()
    } else {
        format!("{}-tier{}", default_partition, idx)
    }
}
