//! The reconciliation loop of controller units.
//!
//! Every controller composes the configuration document from the current facts. The primary
//! additionally drives rollouts, executing controller-local steps against its own configuration
//! sink and publishing directives for remote steps on the target relations. Standby controllers
//! apply the documents the primary directs at them, like any other target.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream, ReceiverStream, WatchStream};

use crate::agent::Applier;
use crate::config::Config;
use crate::error::{AppError, ShutdownError};
use crate::leadership::{LeaderState, LeaseSubstrate};
use crate::relations::{FactsRx, RelationDir};
use crate::server::UnitStatus;
use crate::sink::CommandSink;
use fleet_core::apply::ApplyDecision;
use fleet_core::convergence::{load_health_gate, resolve_cluster_name, store_health_gate, ConvergenceController, Directive, ReconcileInputs};
use fleet_core::facts::*;
use fleet_core::failover::FailoverCoordinator;
use fleet_core::health::{CheckOutcome, HealthGate};

/// The interval of reconciliation passes in the absence of any change.
const PASS_INTERVAL: Duration = Duration::from_secs(1);
const ADMIN_CHANNEL_CAPACITY: usize = 100;

/// A health gate operation on a single node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeOp {
    Drain,
    Undrain,
    Down,
    Healthy,
    /// Keep the node in its partitions even while DOWN or drained.
    Include,
    /// Revert `Include`.
    Exclude,
}

impl fmt::Display for NodeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drain => f.write_str("drain"),
            Self::Undrain => f.write_str("undrain"),
            Self::Down => f.write_str("down"),
            Self::Healthy => f.write_str("healthy"),
            Self::Include => f.write_str("include"),
            Self::Exclude => f.write_str("exclude"),
        }
    }
}

impl FromStr for NodeOp {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drain" => Ok(Self::Drain),
            "undrain" => Ok(Self::Undrain),
            "down" => Ok(Self::Down),
            "healthy" => Ok(Self::Healthy),
            "include" => Ok(Self::Include),
            "exclude" => Ok(Self::Exclude),
            other => Err(AppError::InvalidInput(format!("unknown node operation {:?}", other))),
        }
    }
}

/// An operator request forwarded to the controller loop.
#[derive(Debug)]
pub struct AdminCommand {
    pub node: String,
    pub op: NodeOp,
    pub reason: String,
    /// Receives whether the node's health state changed, once the change is persisted.
    pub reply: oneshot::Sender<Result<bool, AppError>>,
}

/// The sending half of the controller's admin channel.
pub type AdminTx = mpsc::Sender<AdminCommand>;

/// A task driving the controller side of a single unit.
pub struct ControllerTask {
    config: Arc<Config>,
    relations: RelationDir,
    /// Applies documents to the local sink, both as primary and as standby.
    applier: Applier,
    failover: FailoverCoordinator<LeaseSubstrate>,
    convergence: ConvergenceController,
    gate: HealthGate,
    cluster_name: Option<String>,

    facts_rx: FactsRx,
    facts: WatchStream<Arc<FactStore>>,
    leader_state: WatchStream<LeaderState>,
    admin: ReceiverStream<AdminCommand>,
    status_tx: watch::Sender<UnitStatus>,
    shutdown: BroadcastStream<()>,
}

impl ControllerTask {
    /// Create a new instance.
    pub fn new(
        config: Arc<Config>, relations: RelationDir, sink: CommandSink, substrate: LeaseSubstrate, leader_rx: watch::Receiver<LeaderState>, facts_rx: FactsRx,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, AdminTx, watch::Receiver<UnitStatus>) {
        let (admin_tx, admin_rx) = mpsc::channel(ADMIN_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(UnitStatus::new(&config.unit_id, Role::Controller));
        (
            Self {
                applier: Applier::new(Role::Controller, relations.clone(), sink),
                failover: FailoverCoordinator::new(config.unit_id.clone(), substrate),
                convergence: ConvergenceController::new(config.unit_id.clone(), config.rollout()),
                gate: HealthGate::new(),
                cluster_name: None,
                facts: WatchStream::new(facts_rx.clone()),
                facts_rx,
                leader_state: WatchStream::new(leader_rx),
                admin: ReceiverStream::new(admin_rx),
                status_tx,
                shutdown: BroadcastStream::new(shutdown),
                relations,
                config,
            },
            admin_tx,
            status_rx,
        )
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        self.publish_identity().await.map_err(ShutdownError::from)?;
        self.applier.seed().await.map_err(ShutdownError::from)?;
        tracing::info!(hostname = %self.config.hostname(), "controller initialized");

        let mut ticks = IntervalStream::new(tokio::time::interval(PASS_INTERVAL));
        loop {
            tokio::select! {
                Some(_) = self.facts.next() => self.pass().await,
                Some(state) = self.leader_state.next() => {
                    tracing::debug!(state = ?state, "new leader state detected");
                    self.pass().await;
                }
                Some(_) = ticks.next() => self.pass().await,
                Some(cmd) = self.admin.next() => self.handle_admin(cmd).await,
                _ = self.shutdown.next() => break,
            }
        }

        tracing::debug!("controller stopped");
        Ok(())
    }

    /// Publish the facts describing this unit on every relation.
    async fn publish_identity(&self) -> Result<()> {
        for relation in Role::ALL.iter().copied() {
            self.relations
                .publish(relation, vec![(KEY_UNIT_ROLE, Role::Controller.to_string())])
                .await
                .with_context(|| format!("error publishing controller identity on relation {}", relation))?;
        }
        self.relations
            .publish(Role::Controller, vec![(KEY_CONTROLLER_HOSTNAME, self.config.hostname())])
            .await
            .context("error publishing controller hostname")?;
        Ok(())
    }

    /// Perform a full reconciliation pass over the latest facts.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn pass(&mut self) {
        let facts = { self.facts_rx.borrow().clone() }; // Ensure borrow ref doesn't leak read lock.
        if let Err(err) = self.failover.refresh() {
            tracing::warn!(error = %err, "error refreshing primary status");
        }

        self.gate = load_health_gate(&self.failover);
        if self.failover.is_primary() && self.gate.observe_reports(&facts) {
            if let Err(err) = store_health_gate(&mut self.failover, &self.gate) {
                tracing::warn!(error = %err, "error persisting health reports");
            }
        }

        match resolve_cluster_name(self.config.cluster_name.as_deref(), &mut self.failover) {
            Ok(Some(name)) => self.cluster_name = Some(name),
            Ok(None) => tracing::debug!("waiting on the primary controller to establish the cluster name"),
            Err(err) => tracing::warn!(error = %err, "error resolving cluster name"),
        }

        if let Some(cluster_name) = self.cluster_name.clone() {
            let hostname = self.config.hostname();
            let inputs = ReconcileInputs {
                facts: &facts,
                health: &self.gate,
                hostname: &hostname,
                cluster_name: &cluster_name,
                criterion: &self.config.partition_criterion,
                planner: &self.config.planner,
                overrides: &self.config.config_overrides,
            };
            match self.convergence.reconcile(&inputs, &mut self.failover) {
                Ok(report) => {
                    for rejected in report.rejected.iter() {
                        tracing::debug!(reason = %rejected, "unit skipped for this pass");
                    }
                }
                Err(err) => tracing::debug!(error = %err, "reconciliation pass failed"),
            }
        }

        if self.failover.is_primary() {
            self.drive(&facts).await;
        } else {
            self.applier.apply_pending(&facts).await;
        }
        self.publish_status();
    }

    /// Execute every directive of the plan in flight which is currently due.
    async fn drive(&mut self, facts: &FactStore) {
        while let Some(directive) = self.convergence.next_directive(facts, &mut self.failover, Instant::now()) {
            // Confirm primary status right before every externally visible action.
            if !self.failover.is_primary() {
                tracing::warn!(generation = directive.generation(), "primary status lost before directive could be executed");
                break;
            }
            let res = if directive.step.local {
                self.execute_local(&directive).await
            } else {
                self.publish_directive(&directive).await
            };
            if let Err(err) = res {
                self.convergence.directive_failed(&directive, err);
                break;
            }
        }
    }

    /// Execute a controller-local step against this unit's configuration sink.
    #[tracing::instrument(level = "debug", skip(self, directive), fields(generation = directive.generation(), action = ?directive.step.action))]
    async fn execute_local(&mut self, directive: &Directive) -> Result<(), AppError> {
        let generation = directive.generation();
        let action = directive.step.action.daemon_action();
        // A generation applied before a restart or as a standby target is never applied again.
        match self.applier.check(generation) {
            ApplyDecision::Apply => (),
            decision => {
                tracing::debug!(?decision, "generation already applied on this unit, skipping local step");
                return Ok(());
            }
        }
        let res = match action {
            None => self.applier.sink().write(directive.document.body()).await.map(|_| ()),
            Some(action) => self.applier.sink().perform(action).await,
        };
        match res {
            Ok(()) => {
                if action.is_some() {
                    self.applier.report_applied(generation).await;
                }
                Ok(())
            }
            Err(err) => {
                let message = format!("{:#}", err);
                self.applier.report_failure(generation, directive.attempt, err).await;
                Err(AppError::ReloadFailed {
                    unit: self.config.unit_id.clone(),
                    generation,
                    message,
                })
            }
        }
    }

    /// Publish a remote step on its target relation.
    ///
    /// Every step carries the document, so that targets never observe a directive without the
    /// document it refers to.
    #[tracing::instrument(level = "debug", skip(self, directive), fields(generation = directive.generation(), role = %directive.step.target_role))]
    async fn publish_directive(&mut self, directive: &Directive) -> Result<(), AppError> {
        let generation = directive.generation().to_string();
        let document = &directive.document;
        let mut facts = vec![
            (KEY_CONFIG_GENERATION, generation.clone()),
            (KEY_CONFIG_FINGERPRINT, document.fingerprint().to_string()),
            (KEY_CONFIG_BODY, document.body().to_string()),
        ];
        if let Some(action) = directive.step.action.daemon_action() {
            let targets = serde_json::to_string(&directive.step.targets).map_err(|err| AppError::Ise(err.into()))?;
            facts.push((KEY_ROLLOUT_GENERATION, generation));
            facts.push((KEY_ROLLOUT_ACTION, action.to_string()));
            facts.push((KEY_ROLLOUT_TARGETS, targets));
            facts.push((KEY_ROLLOUT_ATTEMPT, directive.attempt.to_string()));
        }
        self.relations.publish(directive.step.target_role, facts).await.map_err(AppError::Ise)?;
        tracing::info!(
            action = ?directive.step.action,
            targets = directive.step.targets.len(),
            attempt = directive.attempt,
            "published rollout directive"
        );
        Ok(())
    }

    /// Handle an operator request, replying once the health gate is persisted.
    async fn handle_admin(&mut self, cmd: AdminCommand) {
        let res = self.apply_admin(&cmd.node, cmd.op, &cmd.reason);
        if let Err(err) = &res {
            tracing::warn!(error = %err, node = %cmd.node, op = %cmd.op, "error applying node operation");
        }
        let _ = cmd.reply.send(res);
        self.pass().await;
    }

    fn apply_admin(&mut self, node: &str, op: NodeOp, reason: &str) -> Result<bool, AppError> {
        if node.trim().is_empty() {
            return Err(AppError::InvalidInput("node name must not be empty".into()));
        }
        let reason = reason.trim();
        if matches!(op, NodeOp::Drain | NodeOp::Down) && reason.is_empty() {
            return Err(AppError::InvalidInput(format!("a reason is required to {} a node", op)));
        }
        self.failover.refresh()?;
        if !self.failover.is_primary() {
            return Err(AppError::LeadershipLost { term: self.failover.term() });
        }

        let mut gate = load_health_gate(&self.failover);
        let changed = match op {
            NodeOp::Drain => gate.drain(node, reason),
            NodeOp::Undrain => gate.undrain(node),
            NodeOp::Down => gate.mark(node, CheckOutcome::Down, reason),
            NodeOp::Healthy => gate.clear(node),
            NodeOp::Include => gate.force_include(node, true),
            NodeOp::Exclude => gate.force_include(node, false),
        };
        if changed {
            store_health_gate(&mut self.failover, &gate)?;
        }
        self.gate = gate;
        Ok(changed)
    }

    fn publish_status(&self) {
        let mut status = { self.status_tx.borrow().clone() }; // Ensure borrow ref doesn't leak read lock.
        status.primary = self.failover.is_primary();
        status.term = self.failover.term();
        status.cluster_name = self.cluster_name.clone();
        status.convergence = Some(self.convergence.status());
        status.apply = self.applier.status().clone();
        let _ = self.status_tx.send(status);
    }
}
