use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::agent::Agent;
use crate::config::Config;
use crate::controller::ControllerTask;
use crate::error::{is_fatal, ShutdownError};
use crate::leadership::{LeaderElectionConfig, LeaderElector, LeaseStore, LEASE_RETRY_SECONDS};
use crate::relations::{RelationDir, RelationWatcher};
use crate::server::{spawn_server, ServerState};
use crate::sink::CommandSink;
use fleet_core::Role;

/// The application object of a single fleet unit.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the HTTP server.
    server: JoinHandle<Result<()>>,
    /// The join handle of the relation watcher.
    watcher: JoinHandle<Result<()>>,
    /// The join handle of the leader elector, on controller units.
    elector: Option<JoinHandle<Result<()>>>,
    /// The join handle of the role task, either the controller loop or the agent.
    role_task: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        let relations = RelationDir::open(&config.state_dir, &config.unit_id).await?;
        let initial = relations.snapshot().await.context("error reading initial relation state")?;
        let (watcher, facts_rx) = RelationWatcher::new(relations.clone(), config.relation_poll(), initial, shutdown_tx.subscribe());
        let sink = CommandSink::from_config(&config);

        // Spawn various core tasks.
        let (elector, role_task, status_rx, admin) = match config.role {
            Role::Controller => {
                let store = LeaseStore::open(&config.state_dir)?;
                let elect_conf = LeaderElectionConfig::new(
                    config.unit_id.clone(),
                    Duration::seconds(config.lease_duration_seconds as i64),
                    Duration::seconds(config.lease_renew_seconds as i64),
                    Duration::seconds(LEASE_RETRY_SECONDS),
                )
                .context("invalid lease coordination config")
                .map_err(ShutdownError::from)?;
                let (elector, leader_rx) = LeaderElector::new(store, elect_conf, shutdown_tx.subscribe());
                let substrate = elector.substrate();
                let (controller, admin, status_rx) =
                    ControllerTask::new(config.clone(), relations, sink.clone(), substrate, leader_rx, facts_rx, shutdown_tx.subscribe());
                (Some(elector.spawn()), controller.spawn(), status_rx, Some(admin))
            }
            Role::Compute | Role::Accounting | Role::Gateway => {
                let (agent, status_rx) = Agent::new(config.clone(), relations, sink.clone(), facts_rx, shutdown_tx.subscribe());
                (None, agent.spawn(), status_rx, None)
            }
        };
        let state = ServerState {
            status: status_rx,
            sink,
            admin,
        };
        let server = spawn_server(&config, state, shutdown_tx.subscribe());

        Ok(Self {
            _config: config,
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            server,
            watcher: watcher.spawn(),
            elector,
            role_task,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        let stopped = loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break None;
                }
                res = &mut self.role_task => {
                    // The role task only stops on its own when it hit a fatal error.
                    let res = res.context("error joining role task").and_then(|res| res);
                    if let Err(err) = &res {
                        tracing::error!(error = ?err, fatal = is_fatal(err), "role task stopped, shutting down");
                    }
                    let _ = self.shutdown_tx.send(());
                    break Some(res);
                }
                _ = self.shutdown_rx.next() => break None,
            }
        };

        let role_res = match stopped {
            Some(res) => res,
            None => (&mut self.role_task).await.context("error joining role task").and_then(|res| res),
        };
        self.shutdown(role_res).await
    }

    async fn shutdown(self, role_res: Result<()>) -> Result<()> {
        // Begin shutdown routine.
        tracing::debug!("fleet operator is shutting down");
        if let Err(err) = &role_res {
            tracing::error!(error = ?err, "error shutting down role task");
        }
        if let Some(elector) = self.elector {
            if let Err(err) = elector.await.context("error joining leader elector handle").and_then(|res| res) {
                tracing::error!(error = ?err, "error shutting down leader elector");
            }
        }
        if let Err(err) = self.watcher.await.context("error joining relation watcher handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down relation watcher");
        }
        if let Err(err) = self.server.await.context("error joining http server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down http server");
        }

        tracing::debug!("fleet operator shutdown complete");
        role_res
    }
}
