//! Primary controller failover.
//!
//! The substrate (the unit orchestrator's leader election) only guarantees that eventually a
//! single unit believes it is leader. On top of it, the coordinator keeps a monotonically
//! increasing term in leader data; a unit only acts as primary while the substrate calls it leader
//! AND the recorded token names it as holder of the highest term it has observed. A deposed
//! primary which still believes itself leader therefore stops acting as soon as it observes a
//! higher term.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// The leader data key holding the current `LeadershipToken`.
pub const KEY_LEADER_TOKEN: &str = "leader.token";

const METRIC_IS_PRIMARY: &str = "fleet_controller_is_primary";
const METRIC_TERM: &str = "fleet_controller_term";

/// The leader election facility provided by the unit orchestrator.
pub trait LeadershipSubstrate {
    /// Whether the orchestrator currently considers this unit the leader.
    fn is_leader(&self) -> bool;
    /// Store a value in leader data. Only the leader may write.
    fn leader_set(&mut self, key: &str, value: &str) -> Result<(), AppError>;
    /// Read a value from leader data.
    fn leader_get(&self, key: &str) -> Option<String>;
}

/// The holder and term of primary status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadershipToken {
    pub holder_unit_id: String,
    pub term: u64,
}

/// Decides whether this unit may act as primary controller.
pub struct FailoverCoordinator<L> {
    unit_id: String,
    substrate: L,
    /// The highest term ever observed by this unit.
    highest_term: u64,
    /// Whether this unit was primary as of the last refresh.
    was_primary: bool,
}

impl<L: LeadershipSubstrate> FailoverCoordinator<L> {
    /// Create a new instance.
    pub fn new(unit_id: impl Into<String>, substrate: L) -> Self {
        metrics::register_gauge!(METRIC_IS_PRIMARY, metrics::Unit::Count, "1.0 while this unit acts as primary controller, 0.0 otherwise");
        metrics::register_gauge!(METRIC_TERM, metrics::Unit::Count, "the highest leadership term observed by this unit");
        Self {
            unit_id: unit_id.into(),
            substrate,
            highest_term: 0,
            was_primary: false,
        }
    }

    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    /// The highest term observed by this unit.
    pub fn term(&self) -> u64 {
        self.highest_term
    }

    /// The token currently recorded in leader data.
    pub fn token(&self) -> Option<LeadershipToken> {
        let raw = self.substrate.leader_get(KEY_LEADER_TOKEN)?;
        match serde_json::from_str(&raw) {
            Ok(token) => Some(token),
            Err(err) => {
                tracing::warn!(error = %err, "ignoring malformed leadership token");
                None
            }
        }
    }

    /// Observe the current token and claim a new term if the substrate made this unit leader.
    ///
    /// Returns whether this unit is primary after the refresh.
    #[tracing::instrument(level = "debug", skip(self), fields(unit_id = %self.unit_id))]
    pub fn refresh(&mut self) -> Result<bool, AppError> {
        let observed = self.token();
        if let Some(token) = &observed {
            self.highest_term = self.highest_term.max(token.term);
        }
        let holds_token = observed.as_ref().map(|token| token.holder_unit_id == self.unit_id).unwrap_or(false);
        if self.substrate.is_leader() && !holds_token {
            let token = LeadershipToken {
                holder_unit_id: self.unit_id.clone(),
                term: self.highest_term + 1,
            };
            let encoded = serde_json::to_string(&token).map_err(|err| AppError::Ise(err.into()))?;
            self.substrate.leader_set(KEY_LEADER_TOKEN, &encoded)?;
            self.highest_term = token.term;
            tracing::info!(term = token.term, "claimed primary controller term");
        }
        metrics::gauge!(METRIC_TERM, self.highest_term as f64);

        let primary = self.is_primary();
        if primary != self.was_primary {
            tracing::info!(primary, term = self.highest_term, "primary controller status changed");
            self.was_primary = primary;
        }
        let is_primary_value = if primary { 1.0 } else { 0.0 };
        metrics::gauge!(METRIC_IS_PRIMARY, is_primary_value);
        Ok(primary)
    }

    /// Whether this unit may currently act as primary.
    ///
    /// Must be checked again right before every externally visible action.
    pub fn is_primary(&self) -> bool {
        if !self.substrate.is_leader() {
            return false;
        }
        match self.token() {
            Some(token) => token.holder_unit_id == self.unit_id && token.term >= self.highest_term,
            None => false,
        }
    }

    /// Read a value from leader data.
    pub fn leader_get(&self, key: &str) -> Option<String> {
        self.substrate.leader_get(key)
    }

    /// Write a value to leader data. Fails with `LeadershipLost` unless this unit is primary.
    pub fn leader_set(&mut self, key: &str, value: &str) -> Result<(), AppError> {
        if !self.is_primary() {
            return Err(AppError::LeadershipLost { term: self.highest_term });
        }
        self.substrate.leader_set(key, value)
    }
}

/// A shared in-memory leader election, used for standalone operation and tests.
///
/// Every unit takes a `MemorySubstrate` handle on the same instance.
#[derive(Clone, Debug, Default)]
pub struct MemoryLeadership {
    inner: Arc<Mutex<MemoryLeadershipState>>,
}

#[derive(Debug, Default)]
struct MemoryLeadershipState {
    leader: Option<String>,
    data: BTreeMap<String, String>,
}

impl MemoryLeadership {
    /// Create a new instance with no leader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the given unit the leader, or clear the leader with `None`.
    pub fn elect(&self, unit_id: Option<&str>) {
        self.lock().leader = unit_id.map(String::from);
    }

    /// The current leader.
    pub fn leader(&self) -> Option<String> {
        self.lock().leader.clone()
    }

    /// Write leader data directly, bypassing the leader check.
    pub fn force_set(&self, key: &str, value: &str) {
        self.lock().data.insert(key.to_string(), value.to_string());
    }

    /// Get a substrate handle for the given unit.
    pub fn handle(&self, unit_id: impl Into<String>) -> MemorySubstrate {
        MemorySubstrate {
            unit_id: unit_id.into(),
            shared: self.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryLeadershipState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A single unit's view of a `MemoryLeadership`.
#[derive(Clone, Debug)]
pub struct MemorySubstrate {
    unit_id: String,
    shared: MemoryLeadership,
}

impl LeadershipSubstrate for MemorySubstrate {
    fn is_leader(&self) -> bool {
        self.shared.lock().leader.as_deref() == Some(self.unit_id.as_str())
    }

    fn leader_set(&mut self, key: &str, value: &str) -> Result<(), AppError> {
        let mut state = self.shared.lock();
        if state.leader.as_deref() != Some(self.unit_id.as_str()) {
            return Err(AppError::InvalidInput(format!("unit {} is not leader and may not set leader data", self.unit_id)));
        }
        state.data.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn leader_get(&self, key: &str) -> Option<String> {
        self.shared.lock().data.get(key).cloned()
    }
}
