use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::Json;
use tokio::sync::{mpsc, watch};

use crate::controller::{AdminCommand, NodeOp};
use crate::error::AppError;
use crate::server::*;
use crate::sink::CommandSink;
use fleet_core::Role;

fn server_state(dir: &std::path::Path, admin: Option<mpsc::Sender<AdminCommand>>) -> (Arc<ServerState>, watch::Sender<UnitStatus>) {
    let (status_tx, status_rx) = watch::channel(UnitStatus::new("slurmctld/0", Role::Controller));
    let state = ServerState {
        status: status_rx,
        sink: CommandSink::new(dir.join("slurm.conf"), "slurmctld", "true", "true"),
        admin,
    };
    (Arc::new(state), status_tx)
}

/// Spawn a stand-in for the controller loop, answering every command with the given result.
fn fake_controller(reply: fn(&AdminCommand) -> Result<bool, AppError>) -> mpsc::Sender<AdminCommand> {
    let (admin_tx, mut admin_rx) = mpsc::channel::<AdminCommand>(1);
    tokio::spawn(async move {
        while let Some(cmd) = admin_rx.recv().await {
            let res = reply(&cmd);
            let _ = cmd.reply.send(res);
        }
    });
    admin_tx
}

#[tokio::test]
async fn status_reflects_latest_unit_status() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (state, status_tx) = server_state(dir.path(), None);
    let mut status = UnitStatus::new("slurmctld/0", Role::Controller);
    status.primary = true;
    status.term = 3;
    status_tx.send(status)?;

    let Json(status) = unit_status(Extension(state)).await;
    assert!(status.primary);
    assert_eq!(status.term, 3);
    let encoded = serde_json::to_value(&status)?;
    assert_eq!(encoded["role"], "controller");
    assert!(encoded.get("last_applied_generation").is_some(), "expected apply status to be flattened, got {}", encoded);
    Ok(())
}

#[tokio::test]
async fn config_is_served_once_written() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (state, _status_tx) = server_state(dir.path(), None);
    let (code, _) = current_config(Extension(state.clone())).await;
    assert_eq!(code, StatusCode::NOT_FOUND);

    state.sink.write("ClusterName=a\n").await?;
    let (code, body) = current_config(Extension(state)).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body, "ClusterName=a\n");
    Ok(())
}

#[tokio::test]
async fn node_ops_are_forwarded_to_the_controller() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let admin = fake_controller(|cmd| {
        assert_eq!(cmd.op, NodeOp::Drain);
        assert_eq!(cmd.reason, "maintenance");
        Ok(true)
    });
    let (state, _status_tx) = server_state(dir.path(), Some(admin));
    let body = Some(Json(NodeOpRequest { reason: "maintenance".into() }));
    let res = node_op(Extension(state), Path(("node-a".into(), "drain".into())), body).await;
    let Json(response) = res.map_err(|(code, msg)| anyhow::anyhow!("unexpected error response {}: {}", code, msg))?;
    assert_eq!(response.node, "node-a");
    assert!(response.changed);
    Ok(())
}

#[tokio::test]
async fn node_op_errors_map_to_status_codes() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let (state, _status_tx) = server_state(dir.path(), None);
    let res = node_op(Extension(state), Path(("node-a".into(), "drain".into())), None).await;
    assert_eq!(res.err().map(|(code, _)| code), Some(StatusCode::NOT_FOUND), "expected non-controller units to reject node ops");

    let admin = fake_controller(|_| Err(AppError::LeadershipLost { term: 2 }));
    let (state, _status_tx) = server_state(dir.path(), Some(admin));
    let res = node_op(Extension(state.clone()), Path(("node-a".into(), "reboot".into())), None).await;
    assert_eq!(res.err().map(|(code, _)| code), Some(StatusCode::BAD_REQUEST), "expected unknown operation to be rejected");

    let res = node_op(Extension(state), Path(("node-a".into(), "healthy".into())), None).await;
    assert_eq!(res.err().map(|(code, _)| code), Some(StatusCode::SERVICE_UNAVAILABLE), "expected standby controller to be unavailable");
    Ok(())
}
