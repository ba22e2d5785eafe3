//! Target side of a rollout.
//!
//! A target unit reads the primary controller's published document and rollout directive from
//! its relation, and applies the document only when it is targeted and the generation is newer
//! than anything it has applied before.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::composer::{fingerprint, ClusterConfigDocument, Fingerprint};
use crate::error::AppError;
use crate::facts::{self, FactStore, Role, UnitFacts};

/// The daemon action performed after a document is written.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonAction {
    Reload,
    Restart,
}

impl fmt::Display for DaemonAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reload => f.write_str("reload"),
            Self::Restart => f.write_str("restart"),
        }
    }
}

impl FromStr for DaemonAction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reload" => Ok(Self::Reload),
            "restart" => Ok(Self::Restart),
            other => Err(AppError::InvalidInput(format!("unknown daemon action {:?}", other))),
        }
    }
}

/// A failure reported by a target through the `applied.error` fact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyFailure {
    pub generation: u64,
    pub message: String,
}

/// The outcome of checking a generation against an `ApplyGuard`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyDecision {
    /// The generation is new and must be applied.
    Apply,
    /// The generation was already applied; re-delivery is a no-op.
    AlreadyApplied,
    /// The generation is older than the last applied one.
    Stale { last_applied: u64 },
}

/// Tracks the last generation applied on a target, making application monotonic and idempotent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyGuard {
    last_applied: Option<u64>,
}

impl ApplyGuard {
    /// Create a guard which has already applied the given generation.
    pub fn new(last_applied: Option<u64>) -> Self {
        Self { last_applied }
    }

    pub fn last_applied(&self) -> Option<u64> {
        self.last_applied
    }

    /// Check whether the given generation should be applied.
    pub fn check(&self, generation: u64) -> ApplyDecision {
        match self.last_applied {
            Some(last) if generation == last => ApplyDecision::AlreadyApplied,
            Some(last) if generation < last => ApplyDecision::Stale { last_applied: last },
            _ => ApplyDecision::Apply,
        }
    }

    /// Record the given generation as applied.
    pub fn record(&mut self, generation: u64) -> Result<(), AppError> {
        if let Some(last) = self.last_applied {
            if generation < last {
                return Err(AppError::InvalidInput(format!(
                    "refusing to record generation {} as applied, generation {} was already applied",
                    generation, last
                )));
            }
        }
        self.last_applied = Some(generation);
        Ok(())
    }
}

/// A document a target has been directed to apply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingApply {
    /// The unit of the primary controller which published the directive.
    pub controller_unit: String,
    pub document: ClusterConfigDocument,
    pub action: DaemonAction,
    pub attempt: u32,
}

/// Find the document the given target unit must apply on the given relation, if any.
///
/// Of all controller units on the relation, the one publishing the highest generation is taken as
/// the primary. A directive is only returned when this unit is targeted, the directive's
/// generation matches the published document, the document's fingerprint checks out, and the
/// guard has not applied the generation yet.
pub fn pending_apply(facts: &FactStore, relation: Role, unit_id: &str, guard: &ApplyGuard) -> Option<PendingApply> {
    let (controller_unit, published) = facts
        .units_with_role(relation, Role::Controller)
        .filter(|(id, _)| *id != unit_id)
        .filter_map(|(id, unit)| parse_u64(unit, facts::KEY_CONFIG_GENERATION).map(|generation| (generation, id, unit)))
        .max_by_key(|(generation, _, _)| *generation)
        .map(|(_, id, unit)| (id, unit))?;

    let generation = parse_u64(published, facts::KEY_CONFIG_GENERATION)?;
    if parse_u64(published, facts::KEY_ROLLOUT_GENERATION)? != generation {
        return None;
    }
    let targets: Vec<String> = serde_json::from_str(published.get(facts::KEY_ROLLOUT_TARGETS)?).ok()?;
    if !targets.iter().any(|target| target == unit_id) {
        return None;
    }
    if guard.check(generation) != ApplyDecision::Apply {
        return None;
    }

    let body = published.get(facts::KEY_CONFIG_BODY)?.clone();
    let expected: Fingerprint = published.get(facts::KEY_CONFIG_FINGERPRINT)?.parse().ok()?;
    if fingerprint(&body) != expected {
        tracing::warn!(controller_unit, generation, "published document does not match its fingerprint, ignoring");
        return None;
    }
    let action = published.get(facts::KEY_ROLLOUT_ACTION)?.parse().ok()?;
    let attempt = parse_u64(published, facts::KEY_ROLLOUT_ATTEMPT).unwrap_or(1) as u32;
    Some(PendingApply {
        controller_unit: controller_unit.to_string(),
        document: ClusterConfigDocument::restore(generation, body),
        action,
        attempt,
    })
}

/// The facts a target publishes after applying a document.
pub fn applied_facts(generation: u64) -> Vec<(&'static str, String)> {
    vec![(facts::KEY_APPLIED_GENERATION, generation.to_string())]
}

/// The facts a target publishes after failing to apply a document.
pub fn failure_facts(generation: u64, message: &str) -> Result<Vec<(&'static str, String)>, AppError> {
    let failure = ApplyFailure {
        generation,
        message: message.to_string(),
    };
    let encoded = serde_json::to_string(&failure).map_err(|err| AppError::Ise(err.into()))?;
    Ok(vec![(facts::KEY_APPLIED_ERROR, encoded)])
}

/// The report of a single target, as read from its facts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetReport {
    pub applied_generation: Option<u64>,
    pub failure: Option<ApplyFailure>,
}

impl TargetReport {
    /// Read the report of the given unit on the given relation. `None` if the unit is not present.
    pub fn read(facts: &FactStore, relation: Role, unit_id: &str) -> Option<Self> {
        let unit = facts.unit(relation, unit_id)?;
        Some(Self {
            applied_generation: parse_u64(unit, facts::KEY_APPLIED_GENERATION),
            failure: unit.get(facts::KEY_APPLIED_ERROR).and_then(|raw| serde_json::from_str(raw).ok()),
        })
    }

    /// Whether the target has applied at least the given generation.
    pub fn has_applied(&self, generation: u64) -> bool {
        self.applied_generation.map(|applied| applied >= generation).unwrap_or(false)
    }

    /// The failure reported for exactly the given generation, if any.
    pub fn failed(&self, generation: u64) -> Option<&ApplyFailure> {
        self.failure.as_ref().filter(|failure| failure.generation == generation)
    }
}

fn parse_u64(unit: &UnitFacts, key: &str) -> Option<u64> {
    unit.get(key).and_then(|val| val.trim().parse().ok())
}
