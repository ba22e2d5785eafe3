//! Configuration convergence.
//!
//! The `ConvergenceController` is the controller-side state machine. Every pass it rebuilds the
//! cluster view from the current facts, composes a document, and when the document drifted from
//! what was last issued (and this unit is primary) it builds an ordered `RolloutPlan`. The plan is
//! then driven one `Directive` at a time by the caller, which executes each directive against the
//! local configuration sink or by publishing facts to the targets' relation.
//!
//! The controller never performs I/O itself; all timing is driven by the `now` passed in.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::apply::{DaemonAction, TargetReport};
use crate::catalog::{NodeCatalog, NodeHealth};
use crate::composer::{
    accounting_parameters, compose, controller_hosts, generate_cluster_name, order_controller_hosts, AccountingEndpoint,
    ClusterConfigDocument, ComposeInputs, GatewayRegistration,
};
use crate::error::AppError;
use crate::facts::{self, FactStore, Role};
use crate::failover::{FailoverCoordinator, LeadershipSubstrate};
use crate::health::HealthGate;
use crate::planner::{plan, PartitionCriterion, PartitionSpec, PlannerConfig};

/// Leader data key of the last document issued by a primary.
pub const KEY_ISSUED_DOCUMENT: &str = "config.issued";
/// Leader data key of the last document whose rollout completed.
pub const KEY_APPLIED_DOCUMENT: &str = "config.applied";
/// Leader data key of the persisted health gate.
pub const KEY_HEALTH_GATE: &str = "health.gate";
/// Leader data key of the cluster name.
pub const KEY_CLUSTER_NAME: &str = "cluster.name";

/// The number of failure reports retained for status queries.
pub const MAX_RETAINED_FAILURES: usize = 32;

const METRIC_CURRENT_GENERATION: &str = "fleet_config_current_generation";
const METRIC_APPLIED_GENERATION: &str = "fleet_config_applied_generation";
const METRIC_PLANS_STARTED: &str = "fleet_rollout_plans_started";
const METRIC_PLANS_COMPLETED: &str = "fleet_rollout_plans_completed";
const METRIC_PLANS_SUPERSEDED: &str = "fleet_rollout_plans_superseded";
const METRIC_PLANS_FAILED: &str = "fleet_rollout_plans_partially_failed";
const METRIC_PLANS_ABANDONED: &str = "fleet_rollout_plans_abandoned";

/// Rollout tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RolloutConfig {
    /// How long a `wait_for_ack` step waits for its targets before re-issuing.
    pub ack_timeout: Duration,
    /// How many times a timed out step is re-issued before the plan is marked partially failed.
    pub max_retries: u32,
    /// The number of compute units per reload batch.
    pub compute_batch_size: usize,
    /// The size limit of operator override text.
    pub overrides_max_bytes: usize,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(60),
            max_retries: 3,
            compute_batch_size: 10,
            overrides_max_bytes: 64 * 1024,
        }
    }
}

/// The states of the convergence controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerState {
    /// No rollout in flight.
    Idle,
    /// Drift was detected and a plan is being built.
    Planning,
    /// A plan is being driven.
    RollingOut,
    /// This unit is not primary; documents are composed for observability only.
    Suspended,
}

/// What a rollout step does to its targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepAction {
    WriteConfig,
    Reload,
    Restart,
}

impl StepAction {
    /// The daemon action of this step, if it is not a plain write.
    pub fn daemon_action(&self) -> Option<DaemonAction> {
        match self {
            Self::WriteConfig => None,
            Self::Reload => Some(DaemonAction::Reload),
            Self::Restart => Some(DaemonAction::Restart),
        }
    }
}

/// A single step of a rollout plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RolloutStep {
    pub target_role: Role,
    pub action: StepAction,
    /// Block the plan until every target acknowledges the generation.
    pub wait_for_ack: bool,
    /// Whether this step runs against the controller's own configuration sink.
    pub local: bool,
    /// The unit IDs targeted by this step.
    pub targets: Vec<String>,
}

/// An ordered rollout of one generation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RolloutPlan {
    pub target_generation: u64,
    pub steps: Vec<RolloutStep>,
}

impl RolloutPlan {
    /// Build the rollout plan of the given document.
    ///
    /// Steps are ordered accounting, controller, compute, gateway, so that no compute daemon ever
    /// receives a document referencing an accounting or controller endpoint which is not yet live.
    /// The accounting daemon is only touched when its stanza changed, and the controller is
    /// restarted instead of reloaded when its host list changed. Roles without units get no steps.
    pub fn build(document: &ClusterConfigDocument, applied_body: Option<&str>, view: &ClusterView, local_unit: &str, config: &RolloutConfig) -> Self {
        let mut steps = vec![];
        let units = |role: Role| view.units.get(&role).cloned().unwrap_or_default();

        let accounting = units(Role::Accounting);
        let accounting_changed = applied_body.map(accounting_parameters) != Some(accounting_parameters(document.body()));
        if accounting_changed && !accounting.is_empty() {
            steps.push(step(Role::Accounting, StepAction::WriteConfig, false, false, &accounting));
            steps.push(step(Role::Accounting, StepAction::Restart, true, false, &accounting));
        }

        let hosts_changed = applied_body.map(controller_hosts) != Some(controller_hosts(document.body()));
        let controller_action = if hosts_changed { StepAction::Restart } else { StepAction::Reload };
        let local = vec![local_unit.to_string()];
        steps.push(step(Role::Controller, StepAction::WriteConfig, false, true, &local));
        steps.push(step(Role::Controller, controller_action, false, true, &local));
        let peers = units(Role::Controller);
        if !peers.is_empty() {
            steps.push(step(Role::Controller, StepAction::WriteConfig, false, false, &peers));
            steps.push(step(Role::Controller, controller_action, true, false, &peers));
        }

        let compute = units(Role::Compute);
        if !compute.is_empty() {
            steps.push(step(Role::Compute, StepAction::WriteConfig, false, false, &compute));
            for batch in compute.chunks(config.compute_batch_size.max(1)) {
                steps.push(step(Role::Compute, StepAction::Reload, true, false, batch));
            }
        }

        let gateway = units(Role::Gateway);
        if !gateway.is_empty() {
            steps.push(step(Role::Gateway, StepAction::WriteConfig, false, false, &gateway));
            steps.push(step(Role::Gateway, StepAction::Restart, true, false, &gateway));
        }

        Self {
            target_generation: document.generation(),
            steps,
        }
    }
}

fn step(target_role: Role, action: StepAction, wait_for_ack: bool, local: bool, targets: &[String]) -> RolloutStep {
    RolloutStep {
        target_role,
        action,
        wait_for_ack,
        local,
        targets: targets.to_vec(),
    }
}

/// The terminal outcome of a rollout plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "outcome")]
pub enum PlanOutcome {
    /// Every step completed.
    Completed { generation: u64 },
    /// A step failed or timed out; later steps were not issued.
    PartiallyFailed { generation: u64, step: usize, reason: String },
    /// A newer generation preempted the plan.
    Superseded { generation: u64, by: u64 },
    /// Primary status was lost while the plan was in flight.
    Abandoned { generation: u64, term: u64 },
}

/// A failure retained for status queries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    pub generation: u64,
    pub message: String,
}

/// A single action the caller must execute on behalf of the plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Directive {
    pub document: ClusterConfigDocument,
    pub step_index: usize,
    pub step: RolloutStep,
    /// Starts at 1 and increments on every re-issue after an ack timeout.
    pub attempt: u32,
    /// The term under which the directive was issued.
    pub term: u64,
}

impl Directive {
    pub fn generation(&self) -> u64 {
        self.document.generation()
    }
}

/// The inputs of a reconciliation pass.
#[derive(Clone, Copy, Debug)]
pub struct ReconcileInputs<'a> {
    pub facts: &'a FactStore,
    pub health: &'a HealthGate,
    /// The hostname of the local controller, always part of the controller host list.
    pub hostname: &'a str,
    pub cluster_name: &'a str,
    pub criterion: &'a PartitionCriterion,
    pub planner: &'a PlannerConfig,
    pub overrides: &'a str,
}

/// The cluster state derived from one fact snapshot.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ClusterView {
    pub catalog: NodeCatalog,
    pub partitions: Vec<PartitionSpec>,
    pub accounting: Option<AccountingEndpoint>,
    pub gateway: Option<GatewayRegistration>,
    /// Controller hostnames, in primary/backup order.
    pub controllers: Vec<String>,
    /// Rollout targets per role, sorted by unit ID. Controller targets exclude the local unit.
    pub units: BTreeMap<Role, Vec<String>>,
}

impl ClusterView {
    /// Derive the cluster view from scratch.
    pub fn derive(inputs: &ReconcileInputs<'_>, previous_body: Option<&str>, local_unit: &str) -> (Self, Vec<AppError>) {
        let (catalog, rejected) = NodeCatalog::rebuild(inputs.facts, inputs.health);
        let partitions = plan(&catalog, inputs.criterion, inputs.planner);
        let accounting = AccountingEndpoint::from_facts(inputs.facts);
        let gateway = GatewayRegistration::from_facts(inputs.facts);

        let mut hosts = vec![];
        if !inputs.hostname.is_empty() {
            hosts.push(inputs.hostname.to_string());
        }
        let peer_hosts = inputs
            .facts
            .units_with_role(Role::Controller, Role::Controller)
            .filter(|(unit_id, _)| *unit_id != local_unit)
            .filter_map(|(_, unit)| unit.get(facts::KEY_CONTROLLER_HOSTNAME))
            .map(|host| host.trim().to_string())
            .filter(|host| !host.is_empty());
        for host in peer_hosts {
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
        let controllers = order_controller_hosts(previous_body, &hosts);

        let mut units = BTreeMap::new();
        let mut compute: Vec<String> = catalog
            .nodes()
            .filter(|node| node.health != NodeHealth::Down)
            .map(|node| node.unit_id.clone())
            .collect();
        compute.sort();
        units.insert(Role::Compute, compute);
        for role in [Role::Accounting, Role::Gateway, Role::Controller] {
            let ids = inputs
                .facts
                .units_with_role(role, role)
                .map(|(unit_id, _)| unit_id)
                .filter(|unit_id| *unit_id != local_unit)
                .map(String::from)
                .collect();
            units.insert(role, ids);
        }

        (
            Self {
                catalog,
                partitions,
                accounting,
                gateway,
                controllers,
                units,
            },
            rejected,
        )
    }
}

/// The result of a reconciliation pass.
#[derive(Clone, Debug)]
pub struct ReconcileReport {
    pub primary: bool,
    pub document: ClusterConfigDocument,
    /// Units skipped for incomplete or invalid facts.
    pub rejected: Vec<String>,
    /// The generation a new plan was built for, if any.
    pub planned: Option<u64>,
    /// The generation of a plan superseded by this pass, if any.
    pub superseded: Option<u64>,
}

/// A queryable snapshot of the controller.
#[derive(Clone, Debug, Serialize)]
pub struct ConvergenceStatus {
    pub state: ControllerState,
    pub current_generation: Option<u64>,
    pub current_fingerprint: Option<String>,
    pub target_generation: Option<u64>,
    pub plan_step: Option<usize>,
    pub plan_steps: Option<usize>,
    pub last_applied_generation: Option<u64>,
    pub last_outcome: Option<PlanOutcome>,
    pub failures: Vec<FailureReport>,
    /// Endpoints of the ready gateway units as of the last pass.
    pub gateway_endpoints: Vec<String>,
}

#[derive(Clone, Debug)]
enum StepProgress {
    Pending,
    AwaitingAck { issued_at: Instant, attempt: u32 },
}

#[derive(Clone, Debug)]
struct ActiveRollout {
    plan: RolloutPlan,
    document: ClusterConfigDocument,
    term: u64,
    cursor: usize,
    progress: StepProgress,
}

/// What to do next with the step under the cursor.
enum StepVerdict {
    Issue(Directive),
    Advance,
    Wait,
    Fail(AppError),
    Complete,
}

/// The controller-side convergence state machine.
pub struct ConvergenceController {
    unit_id: String,
    config: RolloutConfig,
    state: ControllerState,
    current: Option<ClusterConfigDocument>,
    view: Option<ClusterView>,
    active: Option<ActiveRollout>,
    /// The highest generation a plan was built for by this unit.
    last_planned: u64,
    last_applied: Option<u64>,
    last_outcome: Option<PlanOutcome>,
    failures: VecDeque<FailureReport>,
}

impl ConvergenceController {
    /// Create a new instance.
    pub fn new(unit_id: impl Into<String>, config: RolloutConfig) -> Self {
        metrics::register_gauge!(METRIC_CURRENT_GENERATION, metrics::Unit::Count, "the generation of the currently composed configuration document");
        metrics::register_gauge!(METRIC_APPLIED_GENERATION, metrics::Unit::Count, "the last configuration generation whose rollout completed");
        metrics::register_counter!(METRIC_PLANS_STARTED, metrics::Unit::Count, "rollout plans started");
        metrics::register_counter!(METRIC_PLANS_COMPLETED, metrics::Unit::Count, "rollout plans completed");
        metrics::register_counter!(METRIC_PLANS_SUPERSEDED, metrics::Unit::Count, "rollout plans preempted by a newer generation");
        metrics::register_counter!(METRIC_PLANS_FAILED, metrics::Unit::Count, "rollout plans which partially failed");
        metrics::register_counter!(METRIC_PLANS_ABANDONED, metrics::Unit::Count, "rollout plans abandoned on loss of primary status");
        Self {
            unit_id: unit_id.into(),
            config,
            state: ControllerState::Idle,
            current: None,
            view: None,
            active: None,
            last_planned: 0,
            last_applied: None,
            last_outcome: None,
            failures: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// The document composed by the last successful pass.
    pub fn current_document(&self) -> Option<&ClusterConfigDocument> {
        self.current.as_ref()
    }

    /// The cluster view derived by the last successful pass.
    pub fn view(&self) -> Option<&ClusterView> {
        self.view.as_ref()
    }

    /// The plan in flight, if any.
    pub fn active_plan(&self) -> Option<&RolloutPlan> {
        self.active.as_ref().map(|active| &active.plan)
    }

    /// Run a reconciliation pass over the given inputs.
    ///
    /// A compose failure is returned as an error and leaves the previous document in effect.
    #[tracing::instrument(level = "debug", skip(self, inputs, failover))]
    pub fn reconcile<L: LeadershipSubstrate>(&mut self, inputs: &ReconcileInputs<'_>, failover: &mut FailoverCoordinator<L>) -> Result<ReconcileReport, AppError> {
        let primary = match failover.refresh() {
            Ok(primary) => primary,
            Err(err) => {
                tracing::warn!(error = %err, "error refreshing primary status, treating this unit as non-primary");
                false
            }
        };

        let issued = read_document(failover, KEY_ISSUED_DOCUMENT);
        let applied = read_document(failover, KEY_APPLIED_DOCUMENT);
        if let Some(applied) = &applied {
            self.last_applied = self.last_applied.max(Some(applied.generation()));
        }
        let previous = issued.clone().or_else(|| self.current.clone());

        let (view, rejected) = ClusterView::derive(inputs, previous.as_ref().map(|doc| doc.body()), &self.unit_id);
        let generation_floor = [
            self.last_planned,
            self.last_applied.unwrap_or_default(),
            inputs.facts.max_applied_generation().unwrap_or_default(),
            issued.as_ref().map(|doc| doc.generation()).unwrap_or_default(),
        ]
        .iter()
        .copied()
        .max()
        .unwrap_or_default();
        let compose_inputs = ComposeInputs {
            cluster_name: inputs.cluster_name,
            controllers: &view.controllers,
            catalog: &view.catalog,
            partitions: &view.partitions,
            accounting: view.accounting.as_ref(),
            gateway: view.gateway.as_ref(),
            overrides: inputs.overrides,
            overrides_max_bytes: self.config.overrides_max_bytes,
            generation_floor,
        };
        let document = match compose(&compose_inputs, previous.as_ref()) {
            Ok(document) => document,
            Err(err) => {
                tracing::error!(error = %err, "error composing configuration, previous document stays in effect");
                self.retain_failure(previous.as_ref().map(|doc| doc.generation()).unwrap_or_default(), &err);
                return Err(err);
            }
        };
        metrics::gauge!(METRIC_CURRENT_GENERATION, document.generation() as f64);
        let mut report = ReconcileReport {
            primary,
            document: document.clone(),
            rejected: rejected.iter().map(|err| err.to_string()).collect(),
            planned: None,
            superseded: None,
        };
        self.current = Some(document.clone());

        if !primary {
            if self.active.is_some() {
                self.abandon(failover.term());
            }
            self.state = ControllerState::Suspended;
            self.view = Some(view);
            return Ok(report);
        }
        if self.state == ControllerState::Suspended {
            self.state = ControllerState::Idle;
        }

        if issued.as_ref().map(|doc| doc.fingerprint()) != Some(document.fingerprint()) {
            failover.leader_set(KEY_ISSUED_DOCUMENT, &document.to_json()?)?;
            tracing::info!(generation = document.generation(), fingerprint = %document.fingerprint(), "issued new configuration generation");
        }

        let target = document.generation();
        let superseded = self.active.as_ref().map(|active| active.plan.target_generation).filter(|generation| *generation != target);
        if let Some(generation) = superseded {
            self.active = None;
            tracing::info!(generation, by = target, "rollout superseded by newer generation");
            metrics::increment_counter!(METRIC_PLANS_SUPERSEDED);
            self.last_outcome = Some(PlanOutcome::Superseded { generation, by: target });
            report.superseded = Some(generation);
        }

        let settled = self.last_planned.max(self.last_applied.unwrap_or_default());
        if self.active.is_none() && target > settled {
            self.state = ControllerState::Planning;
            let plan = RolloutPlan::build(&document, applied.as_ref().map(|doc| doc.body()), &view, &self.unit_id, &self.config);
            tracing::info!(generation = target, steps = plan.steps.len(), "starting rollout");
            metrics::increment_counter!(METRIC_PLANS_STARTED);
            self.last_planned = target;
            self.active = Some(ActiveRollout {
                plan,
                document,
                term: failover.term(),
                cursor: 0,
                progress: StepProgress::Pending,
            });
            report.planned = Some(target);
        }
        self.state = if self.active.is_some() { ControllerState::RollingOut } else { ControllerState::Idle };
        self.view = Some(view);
        Ok(report)
    }

    /// Get the next directive of the plan in flight, if one is due.
    ///
    /// Primary status is confirmed before every directive. Steps which wait for acknowledgement
    /// are re-issued after the ack timeout, up to the configured number of retries.
    pub fn next_directive<L: LeadershipSubstrate>(&mut self, facts: &FactStore, failover: &mut FailoverCoordinator<L>, now: Instant) -> Option<Directive> {
        loop {
            let term = self.active.as_ref()?.term;
            if !failover.is_primary() || failover.term() != term {
                self.abandon(failover.term().max(term));
                return None;
            }
            match self.evaluate_step(facts, now) {
                StepVerdict::Issue(directive) => return Some(directive),
                StepVerdict::Advance => continue,
                StepVerdict::Wait => return None,
                StepVerdict::Fail(err) => {
                    self.fail(err);
                    return None;
                }
                StepVerdict::Complete => {
                    self.complete(failover);
                    return None;
                }
            }
        }
    }

    fn evaluate_step(&mut self, facts: &FactStore, now: Instant) -> StepVerdict {
        let config = &self.config;
        let active = match self.active.as_mut() {
            Some(active) => active,
            None => return StepVerdict::Wait,
        };
        let step = match active.plan.steps.get(active.cursor) {
            Some(step) => step.clone(),
            None => return StepVerdict::Complete,
        };
        let generation = active.document.generation();
        let step_index = active.cursor;
        match active.progress.clone() {
            StepProgress::Pending => {
                if step.wait_for_ack {
                    active.progress = StepProgress::AwaitingAck { issued_at: now, attempt: 1 };
                } else {
                    active.cursor += 1;
                }
                StepVerdict::Issue(Directive {
                    document: active.document.clone(),
                    step_index,
                    step,
                    attempt: 1,
                    term: active.term,
                })
            }
            StepProgress::AwaitingAck { issued_at, attempt } => {
                let mut waiting = 0;
                for target in step.targets.iter() {
                    // A target which departed no longer needs the document.
                    let report = match TargetReport::read(facts, step.target_role, target) {
                        Some(report) => report,
                        None => continue,
                    };
                    if let Some(failure) = report.failed(generation) {
                        return StepVerdict::Fail(AppError::ReloadFailed {
                            unit: target.clone(),
                            generation,
                            message: failure.message.clone(),
                        });
                    }
                    if !report.has_applied(generation) {
                        waiting += 1;
                    }
                }
                if waiting == 0 {
                    active.cursor += 1;
                    active.progress = StepProgress::Pending;
                    return StepVerdict::Advance;
                }
                if now.saturating_duration_since(issued_at) < config.ack_timeout {
                    return StepVerdict::Wait;
                }
                if attempt > config.max_retries {
                    return StepVerdict::Fail(AppError::RolloutTimeout {
                        role: step.target_role,
                        generation,
                        attempts: attempt,
                    });
                }
                tracing::warn!(role = %step.target_role, generation, attempt, waiting, "rollout step timed out waiting on acks, re-issuing");
                active.progress = StepProgress::AwaitingAck {
                    issued_at: now,
                    attempt: attempt + 1,
                };
                StepVerdict::Issue(Directive {
                    document: active.document.clone(),
                    step_index,
                    step,
                    attempt: attempt + 1,
                    term: active.term,
                })
            }
        }
    }

    /// Record the failed execution of a directive, failing the plan it belongs to.
    pub fn directive_failed(&mut self, directive: &Directive, err: AppError) {
        let matches = self
            .active
            .as_ref()
            .map(|active| active.plan.target_generation == directive.generation())
            .unwrap_or(false);
        if matches {
            self.fail(err);
        } else {
            tracing::debug!(generation = directive.generation(), error = %err, "ignoring failure of directive from a finished plan");
        }
    }

    /// A queryable snapshot of this controller.
    pub fn status(&self) -> ConvergenceStatus {
        ConvergenceStatus {
            state: self.state,
            current_generation: self.current.as_ref().map(|doc| doc.generation()),
            current_fingerprint: self.current.as_ref().map(|doc| doc.fingerprint().to_string()),
            target_generation: self.active.as_ref().map(|active| active.plan.target_generation),
            plan_step: self.active.as_ref().map(|active| active.cursor),
            plan_steps: self.active.as_ref().map(|active| active.plan.steps.len()),
            last_applied_generation: self.last_applied,
            last_outcome: self.last_outcome.clone(),
            failures: self.failures.iter().cloned().collect(),
            gateway_endpoints: self
                .view
                .as_ref()
                .and_then(|view| view.gateway.as_ref())
                .map(|gateway| gateway.endpoints.clone())
                .unwrap_or_default(),
        }
    }

    fn fail(&mut self, err: AppError) {
        let active = match self.active.take() {
            Some(active) => active,
            None => return,
        };
        let generation = active.plan.target_generation;
        tracing::error!(error = %err, generation, step = active.cursor, "rollout partially failed");
        metrics::increment_counter!(METRIC_PLANS_FAILED);
        self.retain_failure(generation, &err);
        self.last_outcome = Some(PlanOutcome::PartiallyFailed {
            generation,
            step: active.cursor,
            reason: err.to_string(),
        });
        self.state = ControllerState::Idle;
    }

    fn complete<L: LeadershipSubstrate>(&mut self, failover: &mut FailoverCoordinator<L>) {
        let active = match self.active.take() {
            Some(active) => active,
            None => return,
        };
        let generation = active.plan.target_generation;
        match active.document.to_json().and_then(|raw| failover.leader_set(KEY_APPLIED_DOCUMENT, &raw)) {
            Ok(_) => (),
            Err(err) => tracing::warn!(error = %err, generation, "error recording applied generation in leader data"),
        }
        tracing::info!(generation, "rollout completed");
        metrics::increment_counter!(METRIC_PLANS_COMPLETED);
        metrics::gauge!(METRIC_APPLIED_GENERATION, generation as f64);
        self.last_applied = self.last_applied.max(Some(generation));
        self.last_outcome = Some(PlanOutcome::Completed { generation });
        self.state = ControllerState::Idle;
    }

    fn abandon(&mut self, term: u64) {
        let active = match self.active.take() {
            Some(active) => active,
            None => return,
        };
        let generation = active.plan.target_generation;
        let err = AppError::LeadershipLost { term };
        tracing::warn!(error = %err, generation, "abandoning rollout");
        metrics::increment_counter!(METRIC_PLANS_ABANDONED);
        self.retain_failure(generation, &err);
        self.last_outcome = Some(PlanOutcome::Abandoned { generation, term });
        self.state = ControllerState::Suspended;
    }

    fn retain_failure(&mut self, generation: u64, err: &AppError) {
        if self.failures.len() >= MAX_RETAINED_FAILURES {
            self.failures.pop_front();
        }
        self.failures.push_back(FailureReport {
            generation,
            message: err.to_string(),
        });
    }
}

/// Read a persisted document from leader data.
pub fn read_document<L: LeadershipSubstrate>(failover: &FailoverCoordinator<L>, key: &str) -> Option<ClusterConfigDocument> {
    let raw = failover.leader_get(key)?;
    match ClusterConfigDocument::from_json(&raw) {
        Ok(doc) => Some(doc),
        Err(err) => {
            tracing::warn!(key, error = %err, "ignoring malformed document in leader data");
            None
        }
    }
}

/// Resolve the cluster name: the configured name, else the persisted one, else a newly generated
/// one when this unit is primary. Non-primary units without a persisted name get `None`.
pub fn resolve_cluster_name<L: LeadershipSubstrate>(configured: Option<&str>, failover: &mut FailoverCoordinator<L>) -> Result<Option<String>, AppError> {
    if let Some(name) = configured.map(str::trim).filter(|name| !name.is_empty()) {
        return Ok(Some(name.to_string()));
    }
    if let Some(name) = failover.leader_get(KEY_CLUSTER_NAME) {
        return Ok(Some(name));
    }
    if !failover.is_primary() {
        return Ok(None);
    }
    let name = generate_cluster_name();
    failover.leader_set(KEY_CLUSTER_NAME, &name)?;
    tracing::info!(cluster_name = %name, "generated cluster name");
    Ok(Some(name))
}

/// Load the persisted health gate, or an empty gate if none was persisted.
pub fn load_health_gate<L: LeadershipSubstrate>(failover: &FailoverCoordinator<L>) -> HealthGate {
    match failover.leader_get(KEY_HEALTH_GATE).map(|raw| HealthGate::from_json(&raw)) {
        Some(Ok(gate)) => gate,
        Some(Err(err)) => {
            tracing::warn!(error = %err, "ignoring malformed health gate in leader data");
            HealthGate::default()
        }
        None => HealthGate::default(),
    }
}

/// Persist the health gate. Only the primary may do so.
pub fn store_health_gate<L: LeadershipSubstrate>(failover: &mut FailoverCoordinator<L>, gate: &HealthGate) -> Result<(), AppError> {
    failover.leader_set(KEY_HEALTH_GATE, &gate.to_json()?)
}
