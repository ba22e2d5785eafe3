//! The health, status and admin HTTP server.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{AddExtensionLayer, Json, Router};
use futures::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

use crate::agent::ApplyStatus;
use crate::config::Config;
use crate::controller::{AdminCommand, AdminTx, NodeOp};
use crate::error::{AppError, AppErrorExt};
use crate::sink::CommandSink;
use fleet_core::convergence::ConvergenceStatus;
use fleet_core::Role;

/// A queryable snapshot of a unit.
#[derive(Clone, Debug, Serialize)]
pub struct UnitStatus {
    pub unit_id: String,
    pub role: Role,
    /// Whether this unit acts as primary controller.
    pub primary: bool,
    /// The highest leadership term observed by this unit.
    pub term: u64,
    pub cluster_name: Option<String>,
    /// The convergence state of a controller unit.
    pub convergence: Option<ConvergenceStatus>,
    #[serde(flatten)]
    pub apply: ApplyStatus,
}

impl UnitStatus {
    /// Create the initial status of a unit.
    pub fn new(unit_id: &str, role: Role) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            role,
            primary: false,
            term: 0,
            cluster_name: None,
            convergence: None,
            apply: ApplyStatus::default(),
        }
    }
}

/// The state shared by all request handlers.
#[derive(Clone)]
pub struct ServerState {
    pub status: watch::Receiver<UnitStatus>,
    pub sink: CommandSink,
    /// The admin channel of the controller loop, absent on non-controller units.
    pub admin: Option<AdminTx>,
}

/// The body of a node operation request.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NodeOpRequest {
    #[serde(default)]
    pub reason: String,
}

/// The response to a node operation request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeOpResponse {
    pub node: String,
    pub op: String,
    /// Whether the operation changed the node's health state.
    pub changed: bool,
}

/// Spawns the HTTP server of this unit.
pub fn spawn_server(config: &Config, state: ServerState, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<Result<()>> {
    let app = Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/status", get(unit_status))
        .route("/config", get(current_config))
        .route("/nodes/:node/:op", post(node_op))
        .layer(AddExtensionLayer::new(Arc::new(state)));
    let server = axum::Server::bind(&([0, 0, 0, 0], config.http_port).into())
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _res = shutdown.recv().await;
        });
    tracing::info!("http server is listening at 0.0.0.0:{}", config.http_port);
    tokio::spawn(server.map_err(anyhow::Error::from))
}

/// Handle a unit status query.
pub async fn unit_status(Extension(state): Extension<Arc<ServerState>>) -> Json<UnitStatus> {
    let status = { state.status.borrow().clone() }; // Ensure borrow ref doesn't leak read lock.
    Json(status)
}

/// Handle a query for the configuration document in effect on this unit.
pub async fn current_config(Extension(state): Extension<Arc<ServerState>>) -> (StatusCode, String) {
    match state.sink.current().await {
        Ok(Some(body)) => (StatusCode::OK, body),
        Ok(None) => (StatusCode::NOT_FOUND, "no configuration document has been written on this unit".into()),
        Err(err) => AppError::http(err),
    }
}

/// Handle a health gate operation on a node.
#[tracing::instrument(level = "debug", skip(state, body))]
pub async fn node_op(
    Extension(state): Extension<Arc<ServerState>>, Path((node, op)): Path<(String, String)>, body: Option<Json<NodeOpRequest>>,
) -> Result<Json<NodeOpResponse>, (StatusCode, String)> {
    let admin = match &state.admin {
        Some(admin) => admin.clone(),
        None => return Err((StatusCode::NOT_FOUND, "node operations are only served by controller units".into())),
    };
    let parsed_op: NodeOp = op.parse().map_err(|err: AppError| (err.status_code(), err.to_string()))?;
    let reason = body.map(|Json(body)| body.reason).unwrap_or_default();

    let (reply, reply_rx) = oneshot::channel();
    let cmd = AdminCommand {
        node: node.clone(),
        op: parsed_op,
        reason,
        reply,
    };
    if admin.send(cmd).await.is_err() {
        return Err((StatusCode::SERVICE_UNAVAILABLE, "controller loop is shutting down".into()));
    }
    let changed = match reply_rx.await {
        Ok(Ok(changed)) => changed,
        Ok(Err(err)) => {
            tracing::warn!(error = %err, %node, %op, "node operation rejected");
            return Err((err.status_code(), err.to_string()));
        }
        Err(_) => return Err((StatusCode::SERVICE_UNAVAILABLE, "controller loop dropped the request".into())),
    };
    tracing::info!(%node, %op, changed, "node operation applied");
    Ok(Json(NodeOpResponse { node, op, changed }))
}
