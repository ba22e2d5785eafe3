//! Node health gating.
//!
//! Health check outcomes reported by compute units and operator actions (drain, undrain, clear)
//! are folded into a single per-node state which the catalog consults on every pass. The gate is
//! serializable so that the primary controller can persist it in leader data and a successor can
//! pick it up after failover.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::catalog::{node_name_for, NodeHealth};
use crate::error::AppError;
use crate::facts::{FactStore, Role, KEY_HEALTH_OUTCOME, KEY_HEALTH_REASON};

/// A reason containing this token (case-insensitive) clears an earlier DOWN outcome.
pub const CLEARED_TOKEN: &str = "cleared";

/// The outcome of a single health check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckOutcome {
    Healthy,
    Down,
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => f.write_str("HEALTHY"),
            Self::Down => f.write_str("DOWN"),
        }
    }
}

impl FromStr for CheckOutcome {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HEALTHY" => Ok(Self::Healthy),
            "DOWN" => Ok(Self::Down),
            other => Err(AppError::InvalidInput(format!("unknown health check outcome {:?}", other))),
        }
    }
}

/// The health state of a single node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHealthState {
    /// The outcome currently in effect.
    #[serde(default)]
    pub outcome: Option<CheckOutcome>,
    /// The reason attached to a DOWN outcome.
    #[serde(default)]
    pub down_reason: Option<String>,
    /// When set, the node is drained with the given reason.
    #[serde(default)]
    pub drain_reason: Option<String>,
    /// Include the node in partitions even when it is DOWN or drained.
    #[serde(default)]
    pub force_included: bool,
    /// The last check reported by the node itself, used to apply each report only once.
    #[serde(default)]
    pub last_report: Option<(CheckOutcome, String)>,
}

/// The effective health of a node along with the reason for it, if any.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EffectiveHealth {
    pub health: NodeHealth,
    pub reason: Option<String>,
    pub force_included: bool,
}

/// Per-node health gate.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthGate {
    #[serde(default)]
    nodes: BTreeMap<String, NodeHealthState>,
}

impl HealthGate {
    /// Create a new empty instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a health check outcome for the given node.
    ///
    /// A DOWN outcome marks the node DOWN with the given reason, unless the reason carries the
    /// `cleared` token, which is how an operator clears a DOWN condition. A HEALTHY outcome clears
    /// DOWN. Returns `true` if the node's state changed.
    pub fn mark(&mut self, node: &str, outcome: CheckOutcome, reason: &str) -> bool {
        let state = self.nodes.entry(node.to_string()).or_default();
        let before = state.clone();
        if outcome == CheckOutcome::Healthy || is_cleared(reason) {
            state.outcome = Some(CheckOutcome::Healthy);
            state.down_reason = None;
        } else {
            state.outcome = Some(CheckOutcome::Down);
            state.down_reason = Some(reason.to_string());
        }
        *state != before
    }

    /// Clear a DOWN node, as an operator action.
    pub fn clear(&mut self, node: &str) -> bool {
        self.mark(node, CheckOutcome::Down, CLEARED_TOKEN)
    }

    /// Drain the given node. Draining is independent of the node's check outcome.
    pub fn drain(&mut self, node: &str, reason: &str) -> bool {
        let state = self.nodes.entry(node.to_string()).or_default();
        let reason = Some(reason.to_string());
        if state.drain_reason == reason {
            return false;
        }
        state.drain_reason = reason;
        true
    }

    /// Undrain the given node.
    pub fn undrain(&mut self, node: &str) -> bool {
        self.nodes.get_mut(node).map(|state| state.drain_reason.take().is_some()).unwrap_or(false)
    }

    /// Set the force-include override for the given node.
    pub fn force_include(&mut self, node: &str, include: bool) -> bool {
        let state = self.nodes.entry(node.to_string()).or_default();
        let changed = state.force_included != include;
        state.force_included = include;
        changed
    }

    /// Get the recorded state of the given node.
    pub fn state(&self, node: &str) -> Option<&NodeHealthState> {
        self.nodes.get(node)
    }

    /// Iterate over all recorded node states.
    pub fn nodes(&self) -> impl Iterator<Item = (&str, &NodeHealthState)> {
        self.nodes.iter().map(|(node, state)| (node.as_str(), state))
    }

    /// The effective health of the given node.
    ///
    /// DOWN takes precedence over drained, which takes precedence over a HEALTHY outcome.
    pub fn effective(&self, node: &str) -> EffectiveHealth {
        let state = match self.nodes.get(node) {
            Some(state) => state,
            None => {
                return EffectiveHealth {
                    health: NodeHealth::Unknown,
                    reason: None,
                    force_included: false,
                }
            }
        };
        let (health, reason) = if state.outcome == Some(CheckOutcome::Down) {
            (NodeHealth::Down, state.down_reason.clone())
        } else if state.drain_reason.is_some() {
            (NodeHealth::Drained, state.drain_reason.clone())
        } else if state.outcome == Some(CheckOutcome::Healthy) {
            (NodeHealth::Healthy, None)
        } else {
            (NodeHealth::Unknown, None)
        };
        EffectiveHealth {
            health,
            reason,
            force_included: state.force_included,
        }
    }

    /// Fold health check reports published by compute units into the gate.
    ///
    /// Each distinct report is applied once, so an operator clear is not undone by a stale DOWN
    /// report which is still published. Returns `true` if any node's state changed.
    pub fn observe_reports(&mut self, facts: &FactStore) -> bool {
        let mut changed = false;
        for (unit_id, unit_facts) in facts.units_with_role(Role::Compute, Role::Compute) {
            let outcome = match unit_facts.get(KEY_HEALTH_OUTCOME).map(|val| val.parse::<CheckOutcome>()) {
                Some(Ok(outcome)) => outcome,
                Some(Err(err)) => {
                    tracing::warn!(unit_id, error = %err, "ignoring malformed health report");
                    continue;
                }
                None => continue,
            };
            let reason = unit_facts.get(KEY_HEALTH_REASON).cloned().unwrap_or_default();
            let node = node_name_for(unit_id, unit_facts);
            let report = Some((outcome, reason.clone()));
            if self.nodes.get(&node).map(|state| state.last_report == report).unwrap_or(false) {
                continue;
            }
            self.mark(&node, outcome, &reason);
            let state = self.nodes.entry(node).or_default();
            state.last_report = report;
            changed = true;
        }
        changed
    }

    /// Encode this gate for persistence.
    pub fn to_json(&self) -> Result<String, AppError> {
        serde_json::to_string(self).map_err(|err| AppError::Ise(err.into()))
    }

    /// Decode a gate from its persisted form.
    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        serde_json::from_str(raw).map_err(|err| AppError::InvalidInput(format!("malformed health gate: {}", err)))
    }
}

fn is_cleared(reason: &str) -> bool {
    reason.to_ascii_lowercase().contains(CLEARED_TOKEN)
}
