//! Node catalog.
//!
//! The catalog is derived state: it is rebuilt from scratch out of the current compute relation
//! facts and the health gate on every pass, and never mutated in place.

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::facts::{self, FactStore, Role, UnitFacts};
use crate::health::HealthGate;

/// Resource name of a node's CPU count.
pub const RESOURCE_CPUS: &str = "CPUs";
/// Resource name of a node's real memory in MB.
pub const RESOURCE_REAL_MEMORY: &str = "RealMemory";
/// Resource name of a node's cores per socket.
pub const RESOURCE_CORES_PER_SOCKET: &str = "CoresPerSocket";

/// The weight of a node which does not publish one.
pub const DEFAULT_NODE_WEIGHT: i64 = 1;

const METRIC_CATALOG_NODES: &str = "fleet_catalog_nodes";
const METRIC_INCOMPLETE_UNITS: &str = "fleet_catalog_incomplete_units";

lazy_static! {
    static ref RE_NODE_NAME_INVALID: Regex = Regex::new(r"[^-_.a-zA-Z0-9]").expect("failed to compile RE_NODE_NAME_INVALID regex");
}

/// The required facts of a compute unit and the resource each one populates.
const REQUIRED_RESOURCES: [(&str, &str); 3] = [
    (facts::KEY_NODE_CPUS, RESOURCE_CPUS),
    (facts::KEY_NODE_REALMEMORY, RESOURCE_REAL_MEMORY),
    (facts::KEY_NODE_CORESPERSOCKET, RESOURCE_CORES_PER_SOCKET),
];

/// The health of a node as seen by the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeHealth {
    Unknown,
    Healthy,
    Down,
    Drained,
}

/// A single compute node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NodeRecord {
    /// The unit which published this node's facts.
    pub unit_id: String,
    /// The node name used in the cluster configuration.
    pub name: String,
    /// Numeric resources of the node, keyed by resource name.
    pub resources: BTreeMap<String, i64>,
    /// The node's explicit partition, if it published one.
    pub partition: Option<String>,
    pub weight: i64,
    pub health: NodeHealth,
    /// The reason attached to a DOWN or drained node.
    pub health_reason: Option<String>,
    /// Keep the node in partitions even when DOWN or drained.
    pub force_included: bool,
    /// Generic resources, such as `gpu:tesla:2`.
    pub generic_resources: Vec<String>,
}

impl NodeRecord {
    /// Get the value of a named resource.
    pub fn resource(&self, name: &str) -> Option<i64> {
        self.resources.get(name).copied()
    }

    /// Whether this node may be placed in a partition.
    pub fn is_schedulable(&self) -> bool {
        self.force_included || !matches!(self.health, NodeHealth::Down | NodeHealth::Drained)
    }
}

/// The set of known compute nodes, keyed by node name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NodeCatalog {
    nodes: BTreeMap<String, NodeRecord>,
}

impl NodeCatalog {
    /// Rebuild the catalog from the current facts and health gate.
    ///
    /// Units with incomplete or malformed facts are skipped and reported in the returned error
    /// list; they do not fail the rebuild.
    pub fn rebuild(facts: &FactStore, gate: &HealthGate) -> (Self, Vec<AppError>) {
        let mut nodes: BTreeMap<String, NodeRecord> = BTreeMap::new();
        let mut rejected = vec![];
        for (unit_id, unit_facts) in facts.units_with_role(Role::Compute, Role::Compute) {
            let record = match build_record(unit_id, unit_facts, gate) {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(unit_id, error = %err, "skipping compute unit");
                    metrics::increment_counter!(METRIC_INCOMPLETE_UNITS);
                    rejected.push(err);
                    continue;
                }
            };
            if let Some(existing) = nodes.get(&record.name) {
                let err = AppError::InvalidInput(format!(
                    "node name {} published by {} is already taken by {}",
                    record.name, record.unit_id, existing.unit_id
                ));
                tracing::warn!(unit_id, error = %err, "skipping compute unit");
                rejected.push(err);
                continue;
            }
            nodes.insert(record.name.clone(), record);
        }
        metrics::gauge!(METRIC_CATALOG_NODES, nodes.len() as f64);
        (Self { nodes }, rejected)
    }

    /// Build a catalog directly from a set of records.
    pub fn from_records(records: impl IntoIterator<Item = NodeRecord>) -> Self {
        Self {
            nodes: records.into_iter().map(|record| (record.name.clone(), record)).collect(),
        }
    }

    /// Get a node by name.
    pub fn get(&self, name: &str) -> Option<&NodeRecord> {
        self.nodes.get(name)
    }

    /// Iterate over all nodes, ordered by name.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// The node name of a compute unit: its published hostname, or a name derived from its unit ID.
pub fn node_name_for(unit_id: &str, unit_facts: &UnitFacts) -> String {
    match unit_facts.get(facts::KEY_NODE_HOSTNAME).map(|val| val.trim()) {
        Some(hostname) if !hostname.is_empty() => hostname.to_string(),
        _ => RE_NODE_NAME_INVALID.replace_all(unit_id, "-").into_owned(),
    }
}

fn build_record(unit_id: &str, unit_facts: &UnitFacts, gate: &HealthGate) -> Result<NodeRecord, AppError> {
    let mut missing = vec![];
    let mut resources = BTreeMap::new();
    for (key, resource) in REQUIRED_RESOURCES.iter() {
        match unit_facts.get(*key).map(|val| val.trim().parse::<i64>()) {
            Some(Ok(val)) if val > 0 => {
                resources.insert(resource.to_string(), val);
            }
            _ => missing.push(key.to_string()),
        }
    }
    let weight = match unit_facts.get(facts::KEY_NODE_WEIGHT).map(|val| val.trim()) {
        None | Some("") => DEFAULT_NODE_WEIGHT,
        Some(raw) => match raw.parse::<i64>() {
            Ok(val) if val > 0 => val,
            _ => {
                missing.push(facts::KEY_NODE_WEIGHT.to_string());
                DEFAULT_NODE_WEIGHT
            }
        },
    };
    let generic_resources = match unit_facts.get(facts::KEY_NODE_GRES).map(|val| parse_gres(val)) {
        None => vec![],
        Some(Ok(gres)) => gres,
        Some(Err(_)) => {
            missing.push(facts::KEY_NODE_GRES.to_string());
            vec![]
        }
    };
    if !missing.is_empty() {
        return Err(AppError::IncompleteFacts {
            unit: unit_id.to_string(),
            missing,
        });
    }

    let name = node_name_for(unit_id, unit_facts);
    let effective = gate.effective(&name);
    let partition = unit_facts
        .get(facts::KEY_NODE_PARTITION)
        .map(|val| val.trim())
        .filter(|val| !val.is_empty())
        .map(String::from);
    Ok(NodeRecord {
        unit_id: unit_id.to_string(),
        name,
        resources,
        partition,
        weight,
        health: effective.health,
        health_reason: effective.reason,
        force_included: effective.force_included,
        generic_resources,
    })
}

/// Parse a generic resources fact: a JSON array of strings, or a comma separated list.
fn parse_gres(raw: &str) -> Result<Vec<String>, AppError> {
    let raw = raw.trim();
    let items: Vec<String> = if raw.starts_with('[') {
        serde_json::from_str(raw).map_err(|err| AppError::InvalidInput(format!("malformed gres list: {}", err)))?
    } else {
        raw.split(',').map(String::from).collect()
    };
    Ok(items.into_iter().map(|item| item.trim().to_string()).filter(|item| !item.is_empty()).collect())
}
