//! Facts exchanged between units over relations.
//!
//! Every unit publishes a small set of string key/value facts on each relation it takes part in,
//! and reads the facts of every other unit on that relation. A unit may only write its own facts;
//! facts of a unit which has departed a relation disappear with it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// The role a unit publishes on every relation it writes to.
pub const KEY_UNIT_ROLE: &str = "unit.role";

/// Compute node CPU count.
pub const KEY_NODE_CPUS: &str = "node.cpus";
/// Compute node real memory in MB.
pub const KEY_NODE_REALMEMORY: &str = "node.realmemory";
/// Compute node cores per socket.
pub const KEY_NODE_CORESPERSOCKET: &str = "node.corespersocket";
/// Compute node generic resources, as a JSON array of strings.
pub const KEY_NODE_GRES: &str = "node.gres";
/// Optional compute node scheduling weight.
pub const KEY_NODE_WEIGHT: &str = "node.weight";
/// Optional explicit partition of a compute node.
pub const KEY_NODE_PARTITION: &str = "node.partition";
/// Optional hostname of a compute node. Defaults to a name derived from the unit ID.
pub const KEY_NODE_HOSTNAME: &str = "node.hostname";
/// Outcome of the last node health check, `HEALTHY` or `DOWN`.
pub const KEY_HEALTH_OUTCOME: &str = "health.outcome";
/// Free form reason attached to the last node health check.
pub const KEY_HEALTH_REASON: &str = "health.reason";

/// The highest configuration generation a target unit has applied.
pub const KEY_APPLIED_GENERATION: &str = "applied.generation";
/// A JSON encoded `ApplyFailure` reported by a target unit.
pub const KEY_APPLIED_ERROR: &str = "applied.error";

/// The accounting database URI.
pub const KEY_DB_URI: &str = "db.uri";
/// Whether the accounting database is ready, `true` or `false`.
pub const KEY_DB_READY: &str = "db.ready";
/// The gateway endpoint.
pub const KEY_GATEWAY_ENDPOINT: &str = "gateway.endpoint";
/// Whether the gateway is ready, `true` or `false`.
pub const KEY_GATEWAY_READY: &str = "gateway.ready";
/// The hostname of a controller unit.
pub const KEY_CONTROLLER_HOSTNAME: &str = "controller.hostname";

/// The generation of the configuration document published by the primary controller.
pub const KEY_CONFIG_GENERATION: &str = "config.generation";
/// The fingerprint of the configuration document published by the primary controller.
pub const KEY_CONFIG_FINGERPRINT: &str = "config.fingerprint";
/// The body of the configuration document published by the primary controller.
pub const KEY_CONFIG_BODY: &str = "config.body";
/// The generation targeted by the current rollout step.
pub const KEY_ROLLOUT_GENERATION: &str = "rollout.generation";
/// The action of the current rollout step, `RELOAD` or `RESTART`.
pub const KEY_ROLLOUT_ACTION: &str = "rollout.action";
/// The unit IDs targeted by the current rollout step, as a JSON array.
pub const KEY_ROLLOUT_TARGETS: &str = "rollout.targets";
/// The attempt number of the current rollout step.
pub const KEY_ROLLOUT_ATTEMPT: &str = "rollout.attempt";

/// The roles a unit may play in a cluster.
///
/// Each non-controller role is related to the controller over a relation of the same name. The
/// `Controller` relation is the peer relation among controller units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Controller,
    Compute,
    Accounting,
    Gateway,
}

impl Role {
    /// All roles, in rollout order of their relations.
    pub const ALL: [Role; 4] = [Role::Accounting, Role::Controller, Role::Compute, Role::Gateway];

    /// The string form of this role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::Compute => "compute",
            Self::Accounting => "accounting",
            Self::Gateway => "gateway",
        }
    }

    /// The name of the workload daemon managed for this role.
    pub fn service_name(&self) -> &'static str {
        match self {
            Self::Controller => "slurmctld",
            Self::Compute => "slurmd",
            Self::Accounting => "slurmdbd",
            Self::Gateway => "slurmrestd",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "controller" => Ok(Self::Controller),
            "compute" => Ok(Self::Compute),
            "accounting" => Ok(Self::Accounting),
            "gateway" => Ok(Self::Gateway),
            other => Err(AppError::InvalidInput(format!("unknown role {:?}", other))),
        }
    }
}

/// A single fact published by a unit on a relation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    /// The unit which published this fact.
    pub unit_id: String,
    pub key: String,
    pub value: String,
    /// The relation this fact was published on.
    pub relation: Role,
}

/// A relation's facts keyed by `(unit_id, key)`.
pub type RelationFacts = BTreeMap<(String, String), String>;

/// The facts of a single unit on a single relation.
pub type UnitFacts = BTreeMap<String, String>;

/// An in-memory snapshot of all facts visible to a unit, across all of its relations.
///
/// Snapshots are cheap to rebuild and are compared by value, so consumers hold on to an
/// immutable copy and rebuild derived state whenever the snapshot changes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FactStore {
    relations: BTreeMap<Role, BTreeMap<String, UnitFacts>>,
}

impl FactStore {
    /// Create a new empty instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a set of facts. Later facts overwrite earlier facts with the same key.
    pub fn from_facts(facts: impl IntoIterator<Item = Fact>) -> Self {
        let mut store = Self::new();
        for fact in facts {
            store.publish(fact.relation, &fact.unit_id, &fact.key, fact.value);
        }
        store
    }

    /// Publish a fact on behalf of the given unit, overwriting that unit's prior value.
    ///
    /// Returns `true` if the stored value changed.
    pub fn publish(&mut self, relation: Role, unit_id: &str, key: &str, value: impl Into<String>) -> bool {
        let value = value.into();
        let unit = self.relations.entry(relation).or_default().entry(unit_id.to_string()).or_default();
        match unit.get(key) {
            Some(existing) if existing == &value => false,
            _ => {
                unit.insert(key.to_string(), value);
                true
            }
        }
    }

    /// Publish a batch of facts on behalf of the given unit.
    ///
    /// Returns `true` if any stored value changed.
    pub fn publish_all<K, V>(&mut self, relation: Role, unit_id: &str, facts: impl IntoIterator<Item = (K, V)>) -> bool
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut changed = false;
        for (key, value) in facts {
            changed |= self.publish(relation, unit_id, key.as_ref(), value);
        }
        changed
    }

    /// Remove a single fact of the given unit.
    pub fn retract(&mut self, relation: Role, unit_id: &str, key: &str) -> bool {
        self.relations
            .get_mut(&relation)
            .and_then(|units| units.get_mut(unit_id))
            .map(|unit| unit.remove(key).is_some())
            .unwrap_or(false)
    }

    /// Remove all facts of a unit which has departed the given relation.
    pub fn depart(&mut self, relation: Role, unit_id: &str) -> bool {
        self.relations.get_mut(&relation).map(|units| units.remove(unit_id).is_some()).unwrap_or(false)
    }

    /// Remove a relation entirely, along with all facts published on it.
    pub fn remove_relation(&mut self, relation: Role) -> bool {
        self.relations.remove(&relation).is_some()
    }

    /// Read all facts of the given relation, keyed by `(unit_id, key)`.
    pub fn read_all(&self, relation: Role) -> RelationFacts {
        self.units(relation)
            .flat_map(|(unit_id, facts)| facts.iter().map(move |(key, value)| ((unit_id.to_string(), key.clone()), value.clone())))
            .collect()
    }

    /// Iterate over the units of the given relation, ordered by unit ID.
    pub fn units(&self, relation: Role) -> impl Iterator<Item = (&str, &UnitFacts)> {
        self.relations.get(&relation).into_iter().flat_map(|units| units.iter().map(|(id, facts)| (id.as_str(), facts)))
    }

    /// Iterate over the units of the given relation which declare the given role.
    pub fn units_with_role(&self, relation: Role, role: Role) -> impl Iterator<Item = (&str, &UnitFacts)> {
        self.units(relation)
            .filter(move |(_, facts)| facts.get(KEY_UNIT_ROLE).map(|val| val.as_str() == role.as_str()).unwrap_or(false))
    }

    /// The facts of a single unit on the given relation.
    pub fn unit(&self, relation: Role, unit_id: &str) -> Option<&UnitFacts> {
        self.relations.get(&relation).and_then(|units| units.get(unit_id))
    }

    /// Get a single fact value.
    pub fn get(&self, relation: Role, unit_id: &str, key: &str) -> Option<&str> {
        self.unit(relation, unit_id).and_then(|facts| facts.get(key)).map(String::as_str)
    }

    /// Iterate over every fact in the store.
    pub fn facts(&self) -> impl Iterator<Item = Fact> + '_ {
        self.relations.iter().flat_map(|(relation, units)| {
            units.iter().flat_map(move |(unit_id, facts)| {
                facts.iter().map(move |(key, value)| Fact {
                    unit_id: unit_id.clone(),
                    key: key.clone(),
                    value: value.clone(),
                    relation: *relation,
                })
            })
        })
    }

    /// The highest `applied.generation` reported by any unit on any relation.
    pub fn max_applied_generation(&self) -> Option<u64> {
        self.relations
            .values()
            .flat_map(|units| units.values())
            .filter_map(|facts| facts.get(KEY_APPLIED_GENERATION))
            .filter_map(|val| val.parse::<u64>().ok())
            .max()
    }
}

/// Interpret a fact value as a boolean flag.
pub fn is_truthy(value: Option<&str>) -> bool {
    matches!(value.map(|val| val.trim().to_ascii_lowercase()).as_deref(), Some("true") | Some("yes") | Some("1"))
}

/// The application name portion of a unit ID, `compute` for `compute/3`.
pub fn application_of(unit_id: &str) -> &str {
    unit_id.split('/').next().unwrap_or(unit_id)
}
