use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use tokio::sync::{broadcast, watch};

use crate::leadership::*;
use fleet_core::failover::{FailoverCoordinator, LeadershipSubstrate};

fn test_config(identity: &str) -> Result<LeaderElectionConfig> {
    LeaderElectionConfig::new(identity.into(), Duration::seconds(3), Duration::seconds(2), Duration::seconds(1))
}

async fn wait_for_state(state_rx: &mut watch::Receiver<LeaderState>, expected: LeaderState) -> Result<()> {
    let wait = async {
        while *state_rx.borrow() != expected {
            state_rx.changed().await?;
        }
        Ok::<_, anyhow::Error>(())
    };
    tokio::time::timeout(StdDuration::from_secs(10), wait)
        .await
        .context("timeout waiting for leader state")?
}

#[test]
fn election_config_rejects_invalid_durations() -> Result<()> {
    let res = LeaderElectionConfig::new("slurmctld/0".into(), Duration::seconds(10), Duration::seconds(10), Duration::seconds(2));
    assert!(res.is_err(), "expected lease_duration == renew_deadline to be rejected");
    let res = LeaderElectionConfig::new("slurmctld/0".into(), Duration::seconds(15), Duration::seconds(2), Duration::seconds(2));
    assert!(res.is_err(), "expected renew_deadline below jittered retry_period to be rejected");
    let res = LeaderElectionConfig::new("slurmctld/0".into(), Duration::seconds(15), Duration::seconds(10), Duration::seconds(LEASE_RETRY_SECONDS));
    assert!(res.is_ok(), "expected default durations to be accepted");
    Ok(())
}

#[test]
fn aborted_updates_write_nothing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = LeaseStore::open(dir.path())?;
    assert_eq!(store.read()?, LeaseRecord::default());

    let res: Option<()> = store.update(|lease| {
        lease.holder_identity = Some("slurmctld/0".into());
        None
    })?;
    assert!(res.is_none());
    assert_eq!(store.read()?, LeaseRecord::default());
    assert!(!dir.path().join("leadership").join("lease.lock").exists(), "lease lock must be released");
    Ok(())
}

#[test]
fn expiry_follows_renew_time() {
    let now = Utc::now();
    let mut lease = LeaseRecord {
        holder_identity: Some("slurmctld/0".into()),
        renew_time: Some(now),
        lease_duration_seconds: 15,
        ..Default::default()
    };
    assert!(lease.is_held_by("slurmctld/0", now));
    assert!(!lease.is_held_by("slurmctld/1", now));
    assert!(lease.is_expired(now + Duration::seconds(15)));
    lease.renew_time = None;
    assert!(lease.is_expired(now));
}

#[test]
fn only_the_holder_may_set_leader_data() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = LeaseStore::open(dir.path())?;
    let mut holder = LeaseSubstrate::new("slurmctld/0", store.clone());
    let mut other = LeaseSubstrate::new("slurmctld/1", store.clone());

    assert!(!holder.is_leader());
    assert!(holder.leader_set("cluster.name", "cluster-a").is_err(), "expected write without lease to fail");

    store.update(|lease| {
        lease.holder_identity = Some("slurmctld/0".into());
        lease.renew_time = Some(Utc::now());
        lease.lease_duration_seconds = 60;
        Some(())
    })?;
    holder.reload()?;
    other.reload()?;
    assert!(holder.is_leader());
    assert!(!other.is_leader());

    holder.leader_set("cluster.name", "cluster-a")?;
    assert_eq!(holder.leader_get("cluster.name").as_deref(), Some("cluster-a"), "leader data must be readable by its writer immediately");
    assert!(other.leader_set("cluster.name", "cluster-b").is_err());
    assert_eq!(other.leader_get("cluster.name"), None, "followers observe leader data on reload");
    other.reload()?;
    assert_eq!(other.leader_get("cluster.name").as_deref(), Some("cluster-a"));
    Ok(())
}

#[tokio::test]
async fn elector_acquires_follows_and_releases() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = LeaseStore::open(dir.path())?;
    let (shutdown_tx, _) = broadcast::channel(1);

    let (first, mut first_rx) = LeaderElector::new(store.clone(), test_config("slurmctld/0")?, shutdown_tx.subscribe());
    let first_substrate = first.substrate();
    let first_handle = first.spawn();
    wait_for_state(&mut first_rx, LeaderState::Leading).await?;
    assert!(first_substrate.is_leader());

    let (second_shutdown_tx, _) = broadcast::channel(1);
    let (second, mut second_rx) = LeaderElector::new(store.clone(), test_config("slurmctld/1")?, second_shutdown_tx.subscribe());
    let second_substrate = second.substrate();
    let second_handle = second.spawn();
    wait_for_state(&mut second_rx, LeaderState::Following("slurmctld/0".into())).await?;
    assert!(!second_substrate.is_leader());

    // The leader's terms become visible to followers through the lease.
    let mut coordinator = FailoverCoordinator::new("slurmctld/0", first_substrate);
    assert!(coordinator.refresh()?, "expected lease holder to become primary");
    assert_eq!(coordinator.term(), 1);

    // Stopping the leader releases the lease, and the follower takes over.
    let _ = shutdown_tx.send(());
    first_handle.await??;
    assert_eq!(store.read()?.holder_identity, None);
    wait_for_state(&mut second_rx, LeaderState::Leading).await?;
    let mut successor = FailoverCoordinator::new("slurmctld/1", second_substrate);
    assert!(successor.refresh()?);
    assert_eq!(successor.term(), 2, "expected successor to claim a higher term");

    let _ = second_shutdown_tx.send(());
    second_handle.await??;
    Ok(())
}
