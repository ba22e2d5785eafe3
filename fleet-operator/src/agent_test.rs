use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use crate::agent::*;
use crate::config::Config;
use crate::relations::{RelationDir, RelationWatcher};
use crate::sink::CommandSink;
use fleet_core::composer::fingerprint;
use fleet_core::facts::*;

const NODE_INFO: &str = "NodeName=node-a CPUs=8 Boards=1 SocketsPerBoard=2 CoresPerSocket=4 ThreadsPerCore=1 RealMemory=15842 Gres=(null)\nUpTime=3-04:05:06\n";

fn config(pairs: &[(&str, &str)]) -> Result<Config> {
    let vars = pairs.iter().map(|(key, val)| (key.to_string(), val.to_string())).collect::<Vec<_>>();
    Config::from_vars(vars.into_iter())
}

#[test]
fn node_info_parses_capability_line() -> Result<()> {
    let facts = parse_node_info(NODE_INFO);
    assert_eq!(facts.get(KEY_NODE_CPUS).map(String::as_str), Some("8"));
    assert_eq!(facts.get(KEY_NODE_REALMEMORY).map(String::as_str), Some("15842"));
    assert_eq!(facts.get(KEY_NODE_CORESPERSOCKET).map(String::as_str), Some("4"));
    assert!(facts.get(KEY_NODE_GRES).is_none(), "expected (null) gres to be skipped, got {:?}", facts.get(KEY_NODE_GRES));

    let facts = parse_node_info("NodeName=gpu-a CPUs=lots RealMemory=1000 Gres=gpu:a100:2\n");
    assert!(facts.get(KEY_NODE_CPUS).is_none(), "expected unparsable cpus to be skipped");
    assert_eq!(facts.get(KEY_NODE_GRES).map(String::as_str), Some("gpu:a100:2"));

    assert!(parse_node_info("slurmd: error: unable to read config\n").is_empty());
    Ok(())
}

#[test]
fn explicit_node_facts_take_precedence() -> Result<()> {
    let config = config(&[
        ("RUST_LOG", "error"),
        ("ROLE", "compute"),
        ("UNIT_ID", "compute/0"),
        ("NODE_CPUS", "64"),
        ("NODE_WEIGHT", "10"),
        ("NODE_PARTITION", "  "),
    ])?;
    let mut facts = parse_node_info(NODE_INFO);
    facts.extend(explicit_node_facts(&config));
    assert_eq!(facts.get(KEY_NODE_CPUS).map(String::as_str), Some("64"));
    assert_eq!(facts.get(KEY_NODE_REALMEMORY).map(String::as_str), Some("15842"));
    assert_eq!(facts.get(KEY_NODE_WEIGHT).map(String::as_str), Some("10"));
    assert!(facts.get(KEY_NODE_PARTITION).is_none(), "expected blank partition to be skipped");
    Ok(())
}

#[tokio::test]
async fn agent_applies_directed_documents_once() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let state_dir = dir.path().join("state");
    let config_path = dir.path().join("slurm.conf");
    let config = Arc::new(config(&[
        ("RUST_LOG", "error"),
        ("ROLE", "compute"),
        ("UNIT_ID", "compute/0"),
        ("STATE_DIR", state_dir.to_str().context("non-utf8 temp path")?),
        ("CONFIG_PATH", config_path.to_str().context("non-utf8 temp path")?),
        ("RELOAD_COMMAND", "true {service}"),
        ("RESTART_COMMAND", "true {service}"),
        ("NODE_INFO_COMMAND", "echo NodeName=node-a CPUs=4 RealMemory=4000 CoresPerSocket=2"),
    ])?);
    let (shutdown_tx, _) = broadcast::channel(1);

    let relations = RelationDir::open(&config.state_dir, &config.unit_id).await?;
    let controller = RelationDir::open(&config.state_dir, "slurmctld/0").await?;
    let (watcher, facts_rx) = RelationWatcher::new(relations.clone(), Duration::from_millis(10), Default::default(), shutdown_tx.subscribe());
    let sink = CommandSink::from_config(&config);
    let (agent, mut status_rx) = Agent::new(config.clone(), relations.clone(), sink.clone(), facts_rx, shutdown_tx.subscribe());
    let (watcher, agent) = (watcher.spawn(), agent.spawn());

    let body = "ClusterName=test\n";
    controller
        .publish(
            Role::Compute,
            vec![
                (KEY_UNIT_ROLE, "controller".to_string()),
                (KEY_CONFIG_GENERATION, "4".to_string()),
                (KEY_CONFIG_FINGERPRINT, fingerprint(body).to_string()),
                (KEY_CONFIG_BODY, body.to_string()),
                (KEY_ROLLOUT_GENERATION, "4".to_string()),
                (KEY_ROLLOUT_ACTION, "reload".to_string()),
                (KEY_ROLLOUT_TARGETS, r#"["compute/0"]"#.to_string()),
                (KEY_ROLLOUT_ATTEMPT, "1".to_string()),
            ],
        )
        .await?;

    let wait = async {
        while status_rx.borrow().apply.last_applied_generation != Some(4) {
            status_rx.changed().await?;
        }
        Ok::<_, anyhow::Error>(())
    };
    tokio::time::timeout(Duration::from_secs(10), wait).await.context("timeout waiting for document to be applied")??;

    let published = relations.published(Role::Compute).await?;
    assert_eq!(published.get(KEY_APPLIED_GENERATION).map(String::as_str), Some("4"));
    assert_eq!(published.get(KEY_UNIT_ROLE).map(String::as_str), Some("compute"));
    assert_eq!(published.get(KEY_NODE_CPUS).map(String::as_str), Some("4"));
    assert_eq!(published.get(KEY_NODE_HOSTNAME).map(String::as_str), Some("compute-0"));
    assert_eq!(sink.current().await?.as_deref(), Some(body));

    let _ = shutdown_tx.send(());
    agent.await??;
    watcher.await??;
    Ok(())
}
