//! The target side of the fleet: compute, accounting and gateway units.
//!
//! An agent publishes its unit's facts, applies the documents the primary controller directs it to
//! apply, and reports the outcome back over its relation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream, WatchStream};

use crate::config::Config;
use crate::error::ShutdownError;
use crate::relations::{FactsRx, RelationDir};
use crate::server::UnitStatus;
use crate::sink::{run_command, CommandSink};
use fleet_core::apply::{applied_facts, failure_facts, pending_apply, ApplyDecision, ApplyFailure, ApplyGuard};
use fleet_core::facts::*;
use fleet_core::health::CheckOutcome;

/// The longest health check output published as a DOWN reason.
const MAX_HEALTH_REASON_LEN: usize = 256;
const NULL_VALUE: &str = "(null)";

const METRIC_APPLIED: &str = "fleet_agent_documents_applied";
const METRIC_APPLY_FAILURES: &str = "fleet_agent_apply_failures";

/// The apply history of a unit, as reported on its status.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ApplyStatus {
    pub last_applied_generation: Option<u64>,
    pub last_failure: Option<ApplyFailure>,
}

/// Applies the documents a unit is directed to apply and reports the outcome over its relation.
pub struct Applier {
    relation: Role,
    relations: RelationDir,
    sink: CommandSink,
    guard: ApplyGuard,
    /// The generation and attempt of the last failed apply, retried only when re-issued.
    last_failure: Option<(u64, u32)>,
    status: ApplyStatus,
}

impl Applier {
    /// Create a new instance applying directives published on the given relation.
    pub fn new(relation: Role, relations: RelationDir, sink: CommandSink) -> Self {
        metrics::register_counter!(METRIC_APPLIED, metrics::Unit::Count, "configuration documents applied by this unit");
        metrics::register_counter!(METRIC_APPLY_FAILURES, metrics::Unit::Count, "configuration documents this unit failed to apply");
        Self {
            relation,
            relations,
            sink,
            guard: ApplyGuard::default(),
            last_failure: None,
            status: ApplyStatus::default(),
        }
    }

    pub fn sink(&self) -> &CommandSink {
        &self.sink
    }

    pub fn status(&self) -> &ApplyStatus {
        &self.status
    }

    /// Check the given generation against the generations this unit has already applied.
    pub fn check(&self, generation: u64) -> ApplyDecision {
        self.guard.check(generation)
    }

    /// Seed the apply guard from the generation this unit last reported as applied.
    pub async fn seed(&mut self) -> Result<()> {
        let published = self.relations.published(self.relation).await?;
        let last_applied = published.get(KEY_APPLIED_GENERATION).and_then(|val| val.parse().ok());
        self.guard = ApplyGuard::new(last_applied);
        self.status.last_applied_generation = last_applied;
        Ok(())
    }

    /// Apply the document this unit is directed to apply, if any.
    ///
    /// Returns `true` if a document was applied or failed to apply.
    #[tracing::instrument(level = "debug", skip(self, facts))]
    pub async fn apply_pending(&mut self, facts: &FactStore) -> bool {
        let pending = match pending_apply(facts, self.relation, self.relations.unit_id(), &self.guard) {
            Some(pending) => pending,
            None => return false,
        };
        let generation = pending.document.generation();
        if self.last_failure == Some((generation, pending.attempt)) {
            return false;
        }

        tracing::info!(generation, action = %pending.action, attempt = pending.attempt, controller = %pending.controller_unit, "applying configuration document");
        match self.sink.apply(&pending.document, Some(pending.action)).await {
            Ok(()) => self.report_applied(generation).await,
            Err(err) => self.report_failure(generation, pending.attempt, err).await,
        }
        true
    }

    /// Record the given generation as applied and publish it.
    pub async fn report_applied(&mut self, generation: u64) {
        metrics::increment_counter!(METRIC_APPLIED);
        if let Err(err) = self.guard.record(generation) {
            tracing::error!(error = %err, "error recording applied generation");
            return;
        }
        self.last_failure = None;
        let res = match self.relations.retract(self.relation, &[KEY_APPLIED_ERROR]).await {
            Ok(_) => self.relations.publish(self.relation, applied_facts(generation)).await,
            Err(err) => Err(err),
        };
        if let Err(err) = res {
            tracing::error!(error = ?err, generation, "error publishing applied generation");
        }
        self.status.last_applied_generation = Some(generation);
        self.status.last_failure = None;
    }

    /// Record a failure to apply the given generation and publish it.
    pub async fn report_failure(&mut self, generation: u64, attempt: u32, err: anyhow::Error) {
        metrics::increment_counter!(METRIC_APPLY_FAILURES);
        let message = format!("{:#}", err);
        tracing::error!(error = %message, generation, "error applying configuration document");
        self.last_failure = Some((generation, attempt));
        match failure_facts(generation, &message) {
            Ok(facts) => {
                if let Err(err) = self.relations.publish(self.relation, facts).await {
                    tracing::error!(error = ?err, generation, "error publishing apply failure");
                }
            }
            Err(err) => tracing::error!(error = %err, "error encoding apply failure"),
        }
        self.status.last_failure = Some(ApplyFailure { generation, message });
    }
}

/// A task driving the target side of a single unit.
pub struct Agent {
    config: Arc<Config>,
    /// The relation this unit takes part in.
    relation: Role,
    relations: RelationDir,
    applier: Applier,
    facts: WatchStream<Arc<FactStore>>,
    status_tx: watch::Sender<UnitStatus>,
    shutdown: BroadcastStream<()>,
}

impl Agent {
    /// Create a new instance.
    pub fn new(
        config: Arc<Config>, relations: RelationDir, sink: CommandSink, facts_rx: FactsRx, shutdown: broadcast::Receiver<()>,
    ) -> (Self, watch::Receiver<UnitStatus>) {
        let (status_tx, status_rx) = watch::channel(UnitStatus::new(&config.unit_id, config.role));
        (
            Self {
                relation: config.role,
                applier: Applier::new(config.role, relations.clone(), sink),
                config,
                relations,
                facts: WatchStream::new(facts_rx),
                status_tx,
                shutdown: BroadcastStream::new(shutdown),
            },
            status_rx,
        )
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        self.publish_identity().await.map_err(ShutdownError::from)?;
        self.applier.seed().await.map_err(ShutdownError::from)?;
        self.publish_status();
        tracing::info!(relation = %self.relation, last_applied = ?self.applier.status().last_applied_generation, "agent initialized");

        let health_checks = match (&self.config.role, &self.config.health_check_command) {
            (Role::Compute, Some(command)) if !command.trim().is_empty() => {
                Some(IntervalStream::new(tokio::time::interval(Duration::from_secs(self.config.health_check_interval_seconds))))
            }
            _ => None,
        };
        let mut health_checks = futures::stream::iter(health_checks).flatten();

        loop {
            tokio::select! {
                Some(facts) = self.facts.next() => {
                    if self.applier.apply_pending(&facts).await {
                        self.publish_status();
                    }
                }
                Some(_) = health_checks.next() => self.run_health_check().await,
                _ = self.shutdown.next() => break,
            }
        }

        tracing::debug!("agent stopped");
        Ok(())
    }

    /// Publish the facts describing this unit.
    async fn publish_identity(&self) -> Result<()> {
        let mut facts = BTreeMap::new();
        facts.insert(KEY_UNIT_ROLE, self.relation.to_string());
        match self.relation {
            Role::Compute => {
                let detected = match run_command(&self.config.node_info_command, self.config.command_timeout()).await {
                    Ok(output) => parse_node_info(&output),
                    Err(err) => {
                        tracing::warn!(error = ?err, "error detecting node capabilities, only explicit node facts will be published");
                        BTreeMap::new()
                    }
                };
                facts.extend(detected);
                facts.extend(explicit_node_facts(&self.config));
                facts.insert(KEY_NODE_HOSTNAME, self.config.hostname());
            }
            Role::Accounting => {
                if let Some(uri) = &self.config.db_uri {
                    facts.insert(KEY_DB_URI, uri.clone());
                    facts.insert(KEY_DB_READY, true.to_string());
                }
            }
            Role::Gateway => {
                if let Some(endpoint) = &self.config.gateway_endpoint {
                    facts.insert(KEY_GATEWAY_ENDPOINT, endpoint.clone());
                    facts.insert(KEY_GATEWAY_READY, true.to_string());
                }
            }
            Role::Controller => (),
        }
        self.relations.publish(self.relation, facts).await.context("error publishing unit facts")?;
        Ok(())
    }

    /// Run the node health check and publish its outcome.
    async fn run_health_check(&mut self) {
        let command = match &self.config.health_check_command {
            Some(command) => command,
            None => return,
        };
        let (outcome, reason) = match run_command(command, self.config.command_timeout()).await {
            Ok(_) => (CheckOutcome::Healthy, String::new()),
            Err(err) => (CheckOutcome::Down, truncate(&format!("{:#}", err), MAX_HEALTH_REASON_LEN)),
        };
        tracing::debug!(%outcome, "health check finished");
        let facts = vec![(KEY_HEALTH_OUTCOME, outcome.to_string()), (KEY_HEALTH_REASON, reason)];
        if let Err(err) = self.relations.publish(self.relation, facts).await {
            tracing::error!(error = ?err, "error publishing health check outcome");
        }
    }

    fn publish_status(&self) {
        let mut status = { self.status_tx.borrow().clone() }; // Ensure borrow ref doesn't leak read lock.
        status.apply = self.applier.status().clone();
        let _ = self.status_tx.send(status);
    }
}

/// Parse the node capability line printed by `slurmd -C` into compute facts.
///
/// Only the `NodeName=` line is considered. Values which do not parse are skipped.
pub fn parse_node_info(output: &str) -> BTreeMap<&'static str, String> {
    let mut facts = BTreeMap::new();
    let line = match output.lines().map(str::trim).find(|line| line.starts_with("NodeName=")) {
        Some(line) => line,
        None => return facts,
    };
    for (key, val) in line.split_whitespace().filter_map(|pair| pair.split_once('=')) {
        let fact = match key {
            "CPUs" => KEY_NODE_CPUS,
            "RealMemory" => KEY_NODE_REALMEMORY,
            "CoresPerSocket" => KEY_NODE_CORESPERSOCKET,
            "Gres" => {
                if !val.is_empty() && val != NULL_VALUE {
                    facts.insert(KEY_NODE_GRES, val.to_string());
                }
                continue;
            }
            _ => continue,
        };
        if val.parse::<i64>().is_ok() {
            facts.insert(fact, val.to_string());
        }
    }
    facts
}

/// The compute facts set explicitly in config, which take precedence over detected ones.
pub fn explicit_node_facts(config: &Config) -> BTreeMap<&'static str, String> {
    let mut facts = BTreeMap::new();
    let numeric = [
        (KEY_NODE_CPUS, config.node_cpus),
        (KEY_NODE_REALMEMORY, config.node_realmemory),
        (KEY_NODE_CORESPERSOCKET, config.node_corespersocket),
        (KEY_NODE_WEIGHT, config.node_weight),
    ];
    for (key, val) in numeric.iter() {
        if let Some(val) = val {
            facts.insert(*key, val.to_string());
        }
    }
    let textual = [(KEY_NODE_GRES, &config.node_gres), (KEY_NODE_PARTITION, &config.node_partition)];
    for (key, val) in textual.iter() {
        if let Some(val) = val.as_deref().map(str::trim).filter(|val| !val.is_empty()) {
            facts.insert(*key, val.to_string());
        }
    }
    facts
}

fn truncate(raw: &str, max: usize) -> String {
    match raw.char_indices().nth(max) {
        Some((idx, _)) => raw[..idx].to_string(),
        None => raw.to_string(),
    }
}
