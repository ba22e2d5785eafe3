//! Configuration document composition.
//!
//! The composer is a pure function of its inputs. It renders one configuration document out of
//! the catalog, the partition plan, the accounting and gateway registrations and the operator's
//! override text, and fingerprints a canonical form of that document so that cosmetic differences
//! never read as drift.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use maplit::btreemap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::catalog::{NodeCatalog, NodeHealth, RESOURCE_REAL_MEMORY};
use crate::error::AppError;
use crate::facts::{self, FactStore, Role};
use crate::planner::PartitionSpec;

/// The default port of the accounting daemon.
pub const DEFAULT_ACCOUNTING_PORT: u16 = 6819;
/// The prefix of generated cluster names.
pub const CLUSTER_NAME_PREFIX: &str = "charmed-hpc";
/// The parameter which must always carry the configless flag.
pub const CONTROLLER_PARAMETERS_KEY: &str = "SlurmctldParameters";
/// Lets compute daemons fetch their configuration from the controller.
pub const CONFIGLESS_FLAG: &str = "enable_configless";

/// The line separating generated stanzas from the operator's override text.
const CONTROLLER_HOST_KEY: &str = "SlurmctldHost";
const OVERRIDES_MARKER: &str = "# Operator overrides";
const HEADER: &str = "# This file is managed by fleet-operator. Manual edits will be overwritten.";
/// The upper bound of memory reserved for the node daemon, in MB.
const MEM_SPEC_LIMIT_MAX: i64 = 1024;

lazy_static! {
    static ref RE_EQUALS: Regex = Regex::new(r"\s*=\s*").expect("failed to compile RE_EQUALS regex");
    static ref RE_URI: Regex =
        Regex::new(r"^(?:[a-zA-Z][a-zA-Z0-9+.-]*://)?(?:[^@/]*@)?(\[[^\]]+\]|[^:/?#]+)(?::(\d+))?").expect("failed to compile RE_URI regex");
}

/// The parameters every generated document carries.
fn base_parameters() -> BTreeMap<String, String> {
    let params = btreemap! {
        "AuthType" => "auth/slurm",
        "CredType" => "cred/slurm",
        "SlurmctldPort" => "6817",
        "SlurmdPort" => "6818",
        "SlurmUser" => "slurm",
        "SlurmdUser" => "root",
        "SelectType" => "select/cons_tres",
        "SelectTypeParameters" => "CR_Core_Memory",
        "SchedulerType" => "sched/backfill",
        "ProctrackType" => "proctrack/linuxproc",
        "StateSaveLocation" => "/var/lib/slurm/checkpoint",
        "SlurmdSpoolDir" => "/var/lib/slurm/slurmd",
        "SlurmctldPidFile" => "/var/run/slurmctld.pid",
        "SlurmdPidFile" => "/var/run/slurmd.pid",
        "SlurmctldLogFile" => "/var/log/slurm/slurmctld.log",
        "SlurmdLogFile" => "/var/log/slurm/slurmd.log",
        "HealthCheckProgram" => "/usr/sbin/charmed-hpc-nhc-wrapper",
        "HealthCheckInterval" => "600",
        "HealthCheckNodeState" => "ANY,CYCLE",
        "ReturnToService" => "0",
        CONTROLLER_PARAMETERS_KEY => CONFIGLESS_FLAG,
    };
    params.into_iter().map(|(key, val)| (key.to_string(), val.to_string())).collect()
}

/// The accounting backend endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AccountingEndpoint {
    /// The unit which published the endpoint.
    pub unit_id: String,
    /// The connection string as published.
    pub uri: String,
    pub host: String,
    pub port: u16,
}

impl AccountingEndpoint {
    /// Parse an endpoint out of a connection string.
    ///
    /// Accepts `scheme://[user[:pass]@]host[:port][/path]` as well as bare `host[:port]`. The port
    /// defaults to the accounting daemon's port.
    pub fn parse(unit_id: &str, uri: &str) -> Result<Self, AppError> {
        let uri = uri.trim();
        let caps = RE_URI
            .captures(uri)
            .ok_or_else(|| AppError::InvalidInput(format!("malformed accounting uri {:?}", uri)))?;
        let host = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        if host.is_empty() {
            return Err(AppError::InvalidInput(format!("accounting uri {:?} has no host", uri)));
        }
        let port = match caps.get(2) {
            Some(port) => port
                .as_str()
                .parse::<u16>()
                .map_err(|err| AppError::InvalidInput(format!("invalid port in accounting uri {:?}: {}", uri, err)))?,
            None => DEFAULT_ACCOUNTING_PORT,
        };
        Ok(Self {
            unit_id: unit_id.to_string(),
            uri: uri.to_string(),
            host: host.to_string(),
            port,
        })
    }

    /// The endpoint of the first ready accounting unit, ordered by unit ID.
    ///
    /// Absent until some accounting unit publishes `db.ready=true` along with a usable `db.uri`.
    pub fn from_facts(facts: &FactStore) -> Option<Self> {
        facts
            .units_with_role(Role::Accounting, Role::Accounting)
            .filter(|(_, unit)| facts::is_truthy(unit.get(facts::KEY_DB_READY).map(String::as_str)))
            .find_map(|(unit_id, unit)| {
                let uri = unit.get(facts::KEY_DB_URI)?;
                match Self::parse(unit_id, uri) {
                    Ok(endpoint) => Some(endpoint),
                    Err(err) => {
                        tracing::warn!(unit_id, error = %err, "ignoring accounting unit");
                        None
                    }
                }
            })
    }
}

/// The registered gateway endpoints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GatewayRegistration {
    /// Endpoints of all ready gateway units, sorted.
    pub endpoints: Vec<String>,
}

impl GatewayRegistration {
    /// The registration of all ready gateway units, absent when none is ready.
    pub fn from_facts(facts: &FactStore) -> Option<Self> {
        let endpoints: BTreeSet<String> = facts
            .units_with_role(Role::Gateway, Role::Gateway)
            .filter(|(_, unit)| facts::is_truthy(unit.get(facts::KEY_GATEWAY_READY).map(String::as_str)))
            .filter_map(|(_, unit)| unit.get(facts::KEY_GATEWAY_ENDPOINT))
            .map(|endpoint| endpoint.trim().to_string())
            .filter(|endpoint| !endpoint.is_empty())
            .collect();
        if endpoints.is_empty() {
            None
        } else {
            Some(Self {
                endpoints: endpoints.into_iter().collect(),
            })
        }
    }
}

/// A deterministic hash over the canonical form of a document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub u64);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s.trim(), 16)
            .map(Self)
            .map_err(|err| AppError::InvalidInput(format!("malformed fingerprint {:?}: {}", s, err)))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// An immutable, versioned configuration document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClusterConfigDocument {
    body: String,
    fingerprint: Fingerprint,
    generation: u64,
}

/// The persisted form of a document. The fingerprint is always recomputed from the body.
#[derive(Serialize, Deserialize)]
struct PersistedDocument {
    generation: u64,
    body: String,
}

impl ClusterConfigDocument {
    /// Restore a previously issued document.
    pub fn restore(generation: u64, body: String) -> Self {
        let fingerprint = fingerprint(&body);
        Self { body, fingerprint, generation }
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// The generation of this document. Generations strictly increase across the fleet.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Encode this document for persistence in leader data.
    pub fn to_json(&self) -> Result<String, AppError> {
        serde_json::to_string(&PersistedDocument {
            generation: self.generation,
            body: self.body.clone(),
        })
        .map_err(|err| AppError::Ise(err.into()))
    }

    /// Decode a document from its persisted form.
    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        let doc: PersistedDocument =
            serde_json::from_str(raw).map_err(|err| AppError::InvalidInput(format!("malformed persisted document: {}", err)))?;
        Ok(Self::restore(doc.generation, doc.body))
    }
}

/// The inputs of a single composition.
#[derive(Clone, Copy, Debug)]
pub struct ComposeInputs<'a> {
    pub cluster_name: &'a str,
    /// Controller hostnames, in primary/backup order.
    pub controllers: &'a [String],
    pub catalog: &'a NodeCatalog,
    pub partitions: &'a [PartitionSpec],
    pub accounting: Option<&'a AccountingEndpoint>,
    pub gateway: Option<&'a GatewayRegistration>,
    /// Free form override text, appended verbatim.
    pub overrides: &'a str,
    pub overrides_max_bytes: usize,
    /// New documents are always numbered above this generation.
    pub generation_floor: u64,
}

/// Compose a configuration document.
///
/// When the fingerprint of the result matches `previous`, `previous` is returned as is, so that
/// identical inputs never produce a new generation.
pub fn compose(inputs: &ComposeInputs<'_>, previous: Option<&ClusterConfigDocument>) -> Result<ClusterConfigDocument, AppError> {
    validate(inputs)?;
    let body = render(inputs);
    let fingerprint = fingerprint(&body);
    if let Some(prev) = previous {
        if prev.fingerprint == fingerprint {
            return Ok(prev.clone());
        }
    }
    let generation = previous.map(|prev| prev.generation).unwrap_or(0).max(inputs.generation_floor) + 1;
    Ok(ClusterConfigDocument { body, fingerprint, generation })
}

fn validate(inputs: &ComposeInputs<'_>) -> Result<(), AppError> {
    if inputs.cluster_name.trim().is_empty() {
        return Err(AppError::Compose("cluster name must not be empty".into()));
    }
    if inputs.overrides.len() > inputs.overrides_max_bytes {
        return Err(AppError::Compose(format!(
            "override text is {} bytes, which exceeds the limit of {} bytes",
            inputs.overrides.len(),
            inputs.overrides_max_bytes
        )));
    }
    let mut seen = BTreeSet::new();
    let mut defaults = 0;
    for partition in inputs.partitions {
        if !seen.insert(partition.name.as_str()) {
            return Err(AppError::Compose(format!("duplicate partition name {}", partition.name)));
        }
        if partition.default {
            defaults += 1;
        }
        if let Some(member) = partition.member_nodes.iter().find(|member| inputs.catalog.get(member).is_none()) {
            return Err(AppError::Compose(format!("partition {} references unknown node {}", partition.name, member)));
        }
    }
    if !inputs.partitions.is_empty() && defaults != 1 {
        return Err(AppError::Compose(format!("expected exactly one default partition, found {}", defaults)));
    }
    Ok(())
}

fn render(inputs: &ComposeInputs<'_>) -> String {
    let mut lines = vec![HEADER.to_string(), format!("ClusterName={}", inputs.cluster_name)];
    lines.extend(inputs.controllers.iter().map(|host| format!("{}={}", CONTROLLER_HOST_KEY, host)));

    // Global parameters: base, then accounting, then gateway; later sources win on conflict.
    let mut params = base_parameters();
    if let Some(accounting) = inputs.accounting {
        params.insert("AccountingStorageType".into(), "accounting_storage/slurmdbd".into());
        params.insert("AccountingStorageHost".into(), accounting.host.clone());
        params.insert("AccountingStoragePort".into(), accounting.port.to_string());
        params.insert("AccountingStorageEnforce".into(), "associations".into());
    }
    if inputs.gateway.is_some() {
        params.insert("AuthAltTypes".into(), "auth/jwt".into());
        params.insert("AuthAltParameters".into(), "jwt_key=/var/lib/slurm/checkpoint/jwt_hs256.key".into());
    }
    lines.extend(params.iter().map(|(key, val)| format!("{}={}", key, val)));

    lines.push(String::new());
    for node in inputs.catalog.nodes() {
        let mut line = format!("NodeName={}", node.name);
        for (resource, val) in node.resources.iter() {
            line.push_str(&format!(" {}={}", resource, val));
        }
        if let Some(memory) = node.resource(RESOURCE_REAL_MEMORY) {
            line.push_str(&format!(" MemSpecLimit={}", (memory / 2).min(MEM_SPEC_LIMIT_MAX)));
        }
        line.push_str(&format!(" Weight={}", node.weight));
        if !node.generic_resources.is_empty() {
            line.push_str(&format!(" Gres={}", node.generic_resources.join(",")));
        }
        lines.push(line);
    }
    for node in inputs.catalog.nodes() {
        let state = match node.health {
            NodeHealth::Down => "DOWN",
            NodeHealth::Drained => "DRAIN",
            NodeHealth::Unknown | NodeHealth::Healthy => continue,
        };
        let reason = node.health_reason.as_deref().filter(|reason| !reason.trim().is_empty()).unwrap_or("unspecified");
        lines.push(format!("DownNodes={} State={} Reason=\"{}\"", node.name, state, reason.replace('"', "'")));
    }

    lines.push(String::new());
    for partition in inputs.partitions {
        let mut line = format!("PartitionName={}", partition.name);
        if !partition.member_nodes.is_empty() {
            line.push_str(&format!(" Nodes={}", partition.member_nodes.join(",")));
        }
        line.push_str(if partition.default { " Default=YES" } else { " Default=NO" });
        for (key, val) in partition.limits.iter() {
            line.push_str(&format!(" {}={}", key, val));
        }
        lines.push(line);
    }

    lines.push(String::new());
    lines.push(OVERRIDES_MARKER.to_string());
    let mut body = lines.join("\n");
    body.push('\n');
    let overrides = guard_configless(inputs.overrides);
    if !overrides.trim().is_empty() {
        body.push_str(&overrides);
        if !overrides.ends_with('\n') {
            body.push('\n');
        }
    }
    body
}

/// Ensure an override of the controller parameters keeps the configless flag.
///
/// Every other line of the override text is passed through untouched.
fn guard_configless(overrides: &str) -> String {
    let mut out = String::with_capacity(overrides.len() + CONFIGLESS_FLAG.len() + 1);
    for (idx, line) in overrides.split('\n').enumerate() {
        if idx > 0 {
            out.push('\n');
        }
        match line.split_once('=') {
            Some((key, value)) if key.trim().eq_ignore_ascii_case(CONTROLLER_PARAMETERS_KEY) && !value.contains(CONFIGLESS_FLAG) => {
                let value = value.trim();
                if value.is_empty() {
                    out.push_str(&format!("{}={}", key.trim_end(), CONFIGLESS_FLAG));
                } else {
                    out.push_str(&format!("{}={},{}", key.trim_end(), value, CONFIGLESS_FLAG));
                }
            }
            _ => out.push_str(line),
        }
    }
    out
}

/// Compute the fingerprint of a document body.
pub fn fingerprint(body: &str) -> Fingerprint {
    Fingerprint(seahash::hash(canonicalize(body).as_bytes()))
}

/// The canonical form of a document body.
///
/// Comments and blank lines are dropped, whitespace is collapsed, `key = value` is normalized to
/// `key=value`, and the attributes of each generated stanza as well as the stanzas themselves are
/// sorted. Controller host lines keep their order, since it is the primary/backup order, and so
/// do override lines, since later lines win.
pub fn canonicalize(body: &str) -> String {
    let mut hosts = vec![];
    let mut generated = vec![];
    let mut overrides = vec![];
    let mut in_overrides = false;
    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed == OVERRIDES_MARKER {
            in_overrides = true;
            continue;
        }
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let normalized = RE_EQUALS.replace_all(trimmed, "=");
        let mut tokens = tokenize(&normalized);
        if in_overrides {
            overrides.push(tokens.join(" "));
        } else if normalized.split_once('=').map(|(key, _)| key == CONTROLLER_HOST_KEY).unwrap_or(false) {
            hosts.push(tokens.join(" "));
        } else {
            if tokens.len() > 1 {
                tokens[1..].sort();
            }
            generated.push(tokens.join(" "));
        }
    }
    generated.sort();
    hosts.extend(generated);
    let mut canonical = hosts.join("\n");
    canonical.push_str("\n--\n");
    canonical.push_str(&overrides.join("\n"));
    canonical
}

/// Split a line on whitespace, keeping double-quoted sections together.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = vec![];
    let mut current = String::new();
    let mut quoted = false;
    for ch in line.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                current.push(ch);
            }
            ch if ch.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            ch => current.push(ch),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Order controller hosts: hosts of the previous document keep their position, new hosts are
/// appended in the order given, and hosts no longer present are dropped.
pub fn order_controller_hosts(previous_body: Option<&str>, current: &[String]) -> Vec<String> {
    let current_set: BTreeSet<&str> = current.iter().map(String::as_str).collect();
    let mut ordered: Vec<String> = previous_body
        .map(controller_hosts)
        .unwrap_or_default()
        .into_iter()
        .filter(|host| current_set.contains(host.as_str()))
        .collect();
    for host in current {
        if !ordered.contains(host) {
            ordered.push(host.clone());
        }
    }
    ordered
}

/// The controller hosts named by a document body, in order.
pub fn controller_hosts(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.trim().split_once('='))
        .filter(|(key, _)| key.trim() == CONTROLLER_HOST_KEY)
        .map(|(_, val)| val.trim().to_string())
        .collect()
}

/// The accounting parameters named by a document body, canonicalized.
pub fn accounting_parameters(body: &str) -> Vec<String> {
    let mut params: Vec<String> = body
        .lines()
        .map(|line| RE_EQUALS.replace_all(line.trim(), "=").into_owned())
        .filter(|line| line.starts_with("AccountingStorage"))
        .collect();
    params.sort();
    params
}

/// Generate a new random cluster name.
pub fn generate_cluster_name() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|ch| char::from(ch).to_ascii_lowercase())
        .collect();
    format!("{}-{}", CLUSTER_NAME_PREFIX, suffix)
}
