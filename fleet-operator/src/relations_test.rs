use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use crate::relations::{RelationDir, RelationWatcher};
use fleet_core::facts::{KEY_NODE_CPUS, KEY_UNIT_ROLE};
use fleet_core::Role;

#[tokio::test]
async fn published_facts_appear_in_snapshots() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let compute = RelationDir::open(dir.path(), "compute/0").await?;
    let controller = RelationDir::open(dir.path(), "slurmctld/0").await?;

    assert!(compute.publish(Role::Compute, vec![(KEY_UNIT_ROLE, "compute"), (KEY_NODE_CPUS, "4")]).await?);
    assert!(!compute.publish(Role::Compute, vec![(KEY_NODE_CPUS, "4")]).await?, "identical facts must not report a change");
    assert!(controller.publish(Role::Compute, vec![(KEY_UNIT_ROLE, "controller")]).await?);

    let snapshot = controller.snapshot().await?;
    assert_eq!(snapshot.get(Role::Compute, "compute/0", KEY_NODE_CPUS), Some("4"));
    assert_eq!(snapshot.get(Role::Compute, "slurmctld/0", KEY_UNIT_ROLE), Some("controller"));
    assert_eq!(snapshot.units(Role::Compute).count(), 2);
    assert_eq!(snapshot.units(Role::Gateway).count(), 0);
    Ok(())
}

#[tokio::test]
async fn publish_merges_and_retract_removes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let relations = RelationDir::open(dir.path(), "compute/0").await?;
    relations.publish(Role::Compute, vec![("a", "1"), ("b", "2")]).await?;
    relations.publish(Role::Compute, vec![("b", "3")]).await?;

    let published = relations.published(Role::Compute).await?;
    assert_eq!(published.get("a").map(String::as_str), Some("1"));
    assert_eq!(published.get("b").map(String::as_str), Some("3"));

    assert!(relations.retract(Role::Compute, &["a", "missing"]).await?);
    assert!(!relations.retract(Role::Compute, &["a"]).await?);
    assert!(relations.published(Role::Compute).await?.get("a").is_none());
    assert!(relations.published(Role::Gateway).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn unreadable_unit_files_are_skipped() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let relations = RelationDir::open(dir.path(), "compute/0").await?;
    relations.publish(Role::Compute, vec![(KEY_UNIT_ROLE, "compute")]).await?;
    tokio::fs::write(dir.path().join("relations").join("compute").join("compute_1.json"), b"{not json").await?;
    tokio::fs::write(dir.path().join("relations").join("compute").join("compute_2.tmp"), b"{}").await?;

    let snapshot = relations.snapshot().await?;
    let units: Vec<&str> = snapshot.units(Role::Compute).map(|(unit_id, _)| unit_id).collect();
    assert_eq!(units, vec!["compute/0"]);
    Ok(())
}

#[tokio::test]
async fn watcher_emits_changed_snapshots() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let relations = RelationDir::open(dir.path(), "compute/0").await?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let initial = relations.snapshot().await?;
    let (watcher, mut facts_rx) = RelationWatcher::new(relations.clone(), Duration::from_millis(10), initial, shutdown_tx.subscribe());
    let handle = watcher.spawn();

    relations.publish(Role::Compute, vec![(KEY_NODE_CPUS, "8")]).await?;
    tokio::time::timeout(Duration::from_secs(5), facts_rx.changed())
        .await
        .context("timeout waiting for relation change")??;
    let cpus = facts_rx.borrow().get(Role::Compute, "compute/0", KEY_NODE_CPUS).map(String::from);
    assert_eq!(cpus.as_deref(), Some("8"));

    let _ = shutdown_tx.send(());
    handle.await??;
    Ok(())
}
