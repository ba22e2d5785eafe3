//! Leader election over a lease file in the shared state directory.
//!
//! The lease file does not guarantee that only one unit is acting as leader. Every holder records
//! its renew time, and candidates only take over a lease which has not changed for a full lease
//! duration. Updates are optimistic: a unit only writes the lease if it is unchanged since its
//! last observation, so two candidates can never both acquire the same expired lease. Fencing of
//! leadership actions is layered on top by the failover coordinator's terms.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{bail, ensure, Context, Result};
use chrono::{prelude::*, Duration};
use futures::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::ShutdownResult;
use fleet_core::failover::LeadershipSubstrate;
use fleet_core::AppError;

type DateTimeUtc = DateTime<Utc>;

const JITTER_FACTOR: f64 = 1.2;
/// The period between lease observations, in seconds.
pub const LEASE_RETRY_SECONDS: i64 = 2;

const LEADERSHIP_DIR: &str = "leadership";
const LEASE_FILE: &str = "lease.json";
const LOCK_FILE: &str = "lease.lock";
/// A lock file older than this is considered abandoned by a crashed unit.
const LOCK_STALE_AFTER: std::time::Duration = std::time::Duration::from_secs(10);
const LOCK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

const METRIC_IS_LEADER: &str = "fleet_operator_is_leader";
const METRIC_LEADERSHIP_CHANGE: &str = "fleet_operator_num_leadership_changes";

/// Different states which a leader elector may be in.
#[derive(Clone, Debug, PartialEq)]
pub enum LeaderState {
    /// This unit is the leader.
    Leading,
    /// A different unit is currently the leader, identified by the encapsulated string.
    Following(String),
    /// The lease state is unknown or unheld, or the leader elector task is starting or stopping.
    Standby,
}

/// The persisted lease, including the leader data written by the lease holder.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaseRecord {
    #[serde(default)]
    pub holder_identity: Option<String>,
    #[serde(default)]
    pub acquire_time: Option<DateTimeUtc>,
    #[serde(default)]
    pub renew_time: Option<DateTimeUtc>,
    #[serde(default)]
    pub lease_duration_seconds: i64,
    #[serde(default)]
    pub lease_transitions: u64,
    /// Leader data, readable by every unit and writable only by the holder.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl LeaseRecord {
    /// Whether the lease has expired as of the given time, according to its own renew time.
    pub fn is_expired(&self, now: DateTimeUtc) -> bool {
        match self.renew_time {
            Some(renewed) => renewed + Duration::seconds(self.lease_duration_seconds) <= now,
            None => true,
        }
    }

    /// Whether the lease is held by the given identity and not expired.
    pub fn is_held_by(&self, identity: &str, now: DateTimeUtc) -> bool {
        self.holder_identity.as_deref() == Some(identity) && !self.is_expired(now)
    }
}

/// Access to the lease file.
///
/// All operations are blocking and must be called from blocking contexts in async code.
#[derive(Clone, Debug)]
pub struct LeaseStore {
    dir: PathBuf,
}

impl LeaseStore {
    /// Open the lease store under the given state directory, creating it as needed.
    pub fn open(state_dir: impl AsRef<Path>) -> ShutdownResult<Self> {
        let dir = state_dir.as_ref().join(LEADERSHIP_DIR);
        std::fs::create_dir_all(&dir).with_context(|| format!("error creating leadership directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// Read the current lease. A missing lease reads as an unheld default.
    pub fn read(&self) -> Result<LeaseRecord> {
        let path = self.dir.join(LEASE_FILE);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(LeaseRecord::default()),
            Err(err) => return Err(err).context("error reading lease"),
        };
        serde_json::from_slice(&raw).context("error decoding lease")
    }

    /// Update the lease under the lease lock.
    ///
    /// The closure aborts the update by returning `None`, in which case nothing is written.
    pub fn update<T>(&self, f: impl FnOnce(&mut LeaseRecord) -> Option<T>) -> Result<Option<T>> {
        let _lock = self.lock()?;
        let mut record = self.read()?;
        let out = match f(&mut record) {
            Some(out) => out,
            None => return Ok(None),
        };
        let encoded = serde_json::to_vec_pretty(&record).context("error encoding lease")?;
        let (path, tmp) = (self.dir.join(LEASE_FILE), self.dir.join(LEASE_FILE).with_extension("tmp"));
        std::fs::write(&tmp, &encoded).context("error writing lease")?;
        std::fs::rename(&tmp, &path).context("error replacing lease")?;
        Ok(Some(out))
    }

    fn lock(&self) -> Result<LockGuard> {
        let path = self.dir.join(LOCK_FILE);
        let started = std::time::Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(LockGuard { path }),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => (),
                Err(err) => return Err(err).context("error acquiring lease lock"),
            }
            let stale = std::fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .map(|age| age > LOCK_STALE_AFTER)
                .unwrap_or(false);
            if stale {
                tracing::warn!("removing stale lease lock");
                let _ = std::fs::remove_file(&path);
                continue;
            }
            if started.elapsed() > LOCK_TIMEOUT {
                bail!("timeout acquiring lease lock");
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }
}

/// Removes the lease lock file when dropped.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::error!(error = ?err, "error releasing lease lock");
        }
    }
}

/// Configuration for leader election.
#[derive(Clone, Debug)]
pub struct LeaderElectionConfig {
    /// The identity to use when the lease is acquired.
    identity: String,
    /// The duration that non-leader candidates will wait to force acquire leadership.
    /// This is measured against time of last observed change.
    lease_duration: Duration,
    /// The duration after which the current lease holder renews the lease.
    renew_deadline: Duration,
    /// The duration which leader elector clients wait between lease observations.
    retry_period: Duration,
}

impl LeaderElectionConfig {
    // Create a new `LeaderElectionConfig` instance, validating given inputs.
    pub fn new(identity: String, lease_duration: Duration, renew_deadline: Duration, retry_period: Duration) -> Result<Self> {
        ensure!(lease_duration > renew_deadline, "lease_duration must be greater than renew_deadline");
        ensure!(
            renew_deadline > Duration::seconds((JITTER_FACTOR * retry_period.num_seconds() as f64) as i64),
            "renew_deadline must be greater than retry_period*{}",
            JITTER_FACTOR,
        );
        ensure!(lease_duration.num_seconds() >= 1, "lease_duration must be at least 1 second");
        ensure!(renew_deadline.num_seconds() >= 1, "renew_deadline must be at least 1 second");
        ensure!(retry_period.num_seconds() >= 1, "retry_period must be at least 1 second");
        Ok(Self {
            identity,
            lease_duration,
            renew_deadline,
            retry_period,
        })
    }
}

/// A task which is responsible for acquiring and maintaining the lease to establish leadership.
pub struct LeaderElector {
    store: LeaseStore,
    /// Leader election config.
    config: LeaderElectionConfig,
    /// Sender for the current state of the leadership coordination system.
    state_tx: watch::Sender<LeaderState>,
    /// The last known leader state.
    state: LeaderState,
    /// A broadcast channel used to trigger task shutdown.
    shutdown: BroadcastStream<()>,

    /// The last observed lease, shared with this unit's `LeaseSubstrate`.
    last_observed_lease: Arc<RwLock<LeaseRecord>>,
    /// The last time when a change was observed on the lease.
    last_observed_change: DateTimeUtc,
}

impl LeaderElector {
    // Create a new `LeaderElector` instance.
    pub fn new(store: LeaseStore, config: LeaderElectionConfig, shutdown: broadcast::Receiver<()>) -> (Self, watch::Receiver<LeaderState>) {
        metrics::register_gauge!(METRIC_LEADERSHIP_CHANGE, metrics::Unit::Count, "the number of leadership changes in the controller consensus group");
        metrics::register_gauge!(
            METRIC_IS_LEADER,
            metrics::Unit::Count,
            "a gauge indicating if this unit is the leader, where 1.0 indicates leadership, any other value does not"
        );
        let (state_tx, state_rx) = watch::channel(LeaderState::Standby);
        (
            LeaderElector {
                store,
                config,
                state_tx,
                state: LeaderState::Standby,
                shutdown: BroadcastStream::new(shutdown),
                last_observed_lease: Default::default(),
                last_observed_change: Utc::now(),
            },
            state_rx,
        )
    }

    /// A leadership substrate sharing this elector's view of the lease.
    pub fn substrate(&self) -> LeaseSubstrate {
        LeaseSubstrate {
            identity: self.config.identity.clone(),
            store: self.store.clone(),
            lease: self.last_observed_lease.clone(),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!("leader elector task started");

        // Perform an initial pass at acquiring / renewing the lease.
        if let Err(err) = self.try_acquire_or_renew().await {
            tracing::error!(error = ?err, "error attempting to acquire/renew lease");
        }

        loop {
            let delay_duration = self.get_next_acquire_renew_time();
            let poll_duration = self.config.retry_period.to_std().unwrap_or_default();
            let delay = tokio::time::sleep(delay_duration.min(poll_duration));
            tokio::pin!(delay);
            tokio::select! {
                _ = &mut delay => {
                    let res = if delay_duration <= poll_duration {
                        self.try_acquire_or_renew().await
                    } else {
                        self.observe_lease().await
                    };
                    if let Err(err) = res {
                        tracing::error!(error = ?err, "error during lease coordination");
                        if !matches!(&self.state, LeaderState::Standby) {
                            self.set_state(LeaderState::Standby);
                        }
                        self.last_observed_change = Utc::now();
                    }
                }
                _ = self.shutdown.next() => break,
            }
        }

        if matches!(&self.state, LeaderState::Leading) {
            if let Err(err) = self.release().await {
                tracing::error!(error = ?err, "error releasing lease");
            }
        }
        self.set_state(LeaderState::Standby);
        tracing::info!("leader elector task stopped");
        Ok(())
    }

    /// Read the lease, updating observation info as needed.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn observe_lease(&mut self) -> Result<()> {
        let store = self.store.clone();
        let lease = tokio::task::spawn_blocking(move || store.read()).await.context("error joining lease read")??;
        let changed = { *read_lease(&self.last_observed_lease) != lease };
        if changed {
            tracing::debug!("lease update observed");
            self.last_observed_change = Utc::now();
            self.update_lease(lease);
        }
        Ok(())
    }

    /// Attempt to acquire or renew the lease.
    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn try_acquire_or_renew(&mut self) -> Result<()> {
        // 1. Update observation info as needed.
        self.observe_lease().await.context("error observing lease")?;

        // 2. If following a non-expired leader, then we are done here.
        let now = Utc::now();
        let deadline_as_follower = self.last_observed_change + self.config.lease_duration;
        if let LeaderState::Following(other) = &self.state {
            let expired = read_lease(&self.last_observed_lease).is_expired(now);
            if deadline_as_follower > now && !expired {
                tracing::debug!("leadership lease is held by {} and has not yet expired", other);
                return Ok(());
            }
        }

        // 3. Write the updated lease, unless it changed since it was observed.
        let (store, observed) = (self.store.clone(), self.last_observed_lease.clone());
        let (identity, lease_duration) = (self.config.identity.clone(), self.config.lease_duration.num_seconds());
        let leading = matches!(&self.state, LeaderState::Leading);
        let updated = tokio::task::spawn_blocking(move || {
            store.update(|lease| {
                if *read_lease(&observed) != *lease {
                    return None;
                }
                lease.lease_duration_seconds = lease_duration;
                lease.renew_time = Some(now);
                if !leading {
                    lease.holder_identity = Some(identity);
                    lease.acquire_time = Some(now);
                    lease.lease_transitions += 1;
                }
                *write_lease(&observed) = lease.clone();
                Some(lease.clone())
            })
        })
        .await
        .context("error joining lease update")??;

        match updated {
            Some(lease) => {
                self.last_observed_change = now;
                self.update_lease(lease);
            }
            // Another unit updated the lease concurrently, pick up its change on the next pass.
            None => tracing::debug!("lease changed concurrently, not updating"),
        }
        Ok(())
    }

    /// Release the lease held by this unit, keeping its leader data.
    async fn release(&mut self) -> Result<()> {
        let (store, identity) = (self.store.clone(), self.config.identity.clone());
        tokio::task::spawn_blocking(move || {
            store.update(|lease| {
                if lease.holder_identity.as_deref() != Some(identity.as_str()) {
                    return None;
                }
                lease.holder_identity = None;
                lease.renew_time = None;
                Some(())
            })
        })
        .await
        .context("error joining lease release")??;
        tracing::info!("lease released");
        Ok(())
    }

    /// Update the lease as observed from the store.
    ///
    /// This will also handle updating this object's leadership state.
    #[tracing::instrument(level = "debug", skip(self, lease))]
    fn update_lease(&mut self, lease: LeaseRecord) {
        metrics::gauge!(METRIC_LEADERSHIP_CHANGE, lease.lease_transitions as f64);
        let holder = lease.holder_identity.clone().unwrap_or_default();
        *write_lease(&self.last_observed_lease) = lease;
        let lease_is_held = holder == self.config.identity;
        let state_opt = match &self.state {
            LeaderState::Leading if lease_is_held => None,
            LeaderState::Following(id) if id == &holder => None,
            LeaderState::Standby if holder.is_empty() => None,
            LeaderState::Following(_) | LeaderState::Standby if lease_is_held => Some(LeaderState::Leading),
            LeaderState::Leading | LeaderState::Following(_) if holder.is_empty() => Some(LeaderState::Standby),
            LeaderState::Leading | LeaderState::Following(_) | LeaderState::Standby => Some(LeaderState::Following(holder)),
        };
        if let Some(state) = state_opt {
            tracing::info!(state = ?state, "leader state changed");
            self.set_state(state);
        }
    }

    /// Get the duration to delay before attempting the next lease update.
    fn get_next_acquire_renew_time(&self) -> std::time::Duration {
        let now = Utc::now();
        let addend = match &self.state {
            LeaderState::Leading => self.config.renew_deadline,
            LeaderState::Following(_) => self.config.lease_duration,
            LeaderState::Standby => return self.config.retry_period.to_std().unwrap_or_default(),
        };
        let deadline = self.last_observed_change + addend;
        if deadline > now {
            (deadline - now).to_std().unwrap_or_default()
        } else {
            std::time::Duration::from_secs(0)
        }
    }

    /// Set the current leader state & emit a state update.
    fn set_state(&mut self, state: LeaderState) {
        self.state = state;
        let _ = self.state_tx.send(self.state.clone());
        let is_leader_value = if matches!(self.state, LeaderState::Leading) { 1.0 } else { 0.0 };
        metrics::gauge!(METRIC_IS_LEADER, is_leader_value);
    }
}

/// The leadership substrate backed by the lease file.
///
/// Leadership is read from the last observed lease, which the leader elector keeps current.
/// Writes of leader data go straight to the lease file and are visible to the writer immediately.
#[derive(Clone, Debug)]
pub struct LeaseSubstrate {
    identity: String,
    store: LeaseStore,
    lease: Arc<RwLock<LeaseRecord>>,
}

impl LeaseSubstrate {
    /// Create a substrate which is not driven by a leader elector.
    pub fn new(identity: impl Into<String>, store: LeaseStore) -> Self {
        Self {
            identity: identity.into(),
            store,
            lease: Default::default(),
        }
    }

    /// Re-read the lease from the store.
    pub fn reload(&self) -> Result<()> {
        let lease = self.store.read()?;
        *write_lease(&self.lease) = lease;
        Ok(())
    }
}

impl LeadershipSubstrate for LeaseSubstrate {
    fn is_leader(&self) -> bool {
        read_lease(&self.lease).is_held_by(&self.identity, Utc::now())
    }

    fn leader_set(&mut self, key: &str, value: &str) -> Result<(), AppError> {
        let (identity, cache) = (self.identity.as_str(), &self.lease);
        let written = self
            .store
            .update(|lease| {
                if !lease.is_held_by(identity, Utc::now()) {
                    return None;
                }
                lease.data.insert(key.to_string(), value.to_string());
                *write_lease(cache) = lease.clone();
                Some(())
            })
            .map_err(AppError::Ise)?;
        match written {
            Some(_) => Ok(()),
            None => Err(AppError::InvalidInput(format!("unit {} does not hold the lease and may not set leader data", self.identity))),
        }
    }

    fn leader_get(&self, key: &str) -> Option<String> {
        read_lease(&self.lease).data.get(key).cloned()
    }
}

fn read_lease(lease: &RwLock<LeaseRecord>) -> RwLockReadGuard<'_, LeaseRecord> {
    lease.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lease(lease: &RwLock<LeaseRecord>) -> RwLockWriteGuard<'_, LeaseRecord> {
    lease.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
