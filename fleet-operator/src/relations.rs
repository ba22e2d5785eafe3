//! File-backed relations.
//!
//! Every unit owns one file per relation under `<state_dir>/relations/<relation>/`, holding the
//! facts it publishes on that relation. A unit only ever writes its own files and every write
//! replaces the file atomically, so readers always observe a complete set of facts per unit.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};

use crate::error::ShutdownResult;
use fleet_core::facts::UnitFacts;
use fleet_core::{FactStore, Role};

const RELATIONS_DIR: &str = "relations";
const FACTS_EXT: &str = "json";
const TMP_EXT: &str = "tmp";

const METRIC_RELATION_UNITS: &str = "fleet_relation_units";

/// A channel of fact snapshots.
pub type FactsRx = watch::Receiver<Arc<FactStore>>;

/// The on-disk form of a unit's facts on one relation.
#[derive(Debug, Default, Serialize, Deserialize)]
struct UnitRecord {
    unit_id: String,
    #[serde(default)]
    facts: UnitFacts,
}

/// A handle to the relations of the fleet, publishing on behalf of a single unit.
#[derive(Clone, Debug)]
pub struct RelationDir {
    root: PathBuf,
    unit_id: String,
    /// Serializes read-modify-write cycles on this unit's files.
    write_lock: Arc<Mutex<()>>,
}

impl RelationDir {
    /// Open the relations under the given state directory, creating them as needed.
    pub async fn open(state_dir: impl AsRef<Path>, unit_id: &str) -> ShutdownResult<Self> {
        let root = state_dir.as_ref().join(RELATIONS_DIR);
        for relation in Role::ALL.iter() {
            let path = root.join(relation.as_str());
            tokio::fs::create_dir_all(&path)
                .await
                .with_context(|| format!("error creating relation directory {}", path.display()))?;
        }
        Ok(Self {
            root,
            unit_id: unit_id.to_string(),
            write_lock: Default::default(),
        })
    }

    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    /// The facts this unit currently publishes on the given relation.
    pub async fn published(&self, relation: Role) -> Result<UnitFacts> {
        Ok(read_record(&self.unit_path(relation)).await?.map(|record| record.facts).unwrap_or_default())
    }

    /// Publish facts on the given relation, overwriting prior values of the same keys.
    ///
    /// Returns `true` if anything changed.
    pub async fn publish<K, V>(&self, relation: Role, facts: impl IntoIterator<Item = (K, V)>) -> Result<bool>
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        let facts: Vec<(String, String)> = facts.into_iter().map(|(key, val)| (key.as_ref().to_string(), val.into())).collect();
        self.modify(relation, move |published| published.extend(facts)).await
    }

    /// Retract the given keys from the given relation.
    pub async fn retract(&self, relation: Role, keys: &[&str]) -> Result<bool> {
        self.modify(relation, |published| {
            for key in keys {
                published.remove(*key);
            }
        })
        .await
    }

    /// Read a snapshot of all facts of all units on all relations.
    ///
    /// Unreadable unit files are skipped, as a unit may be replacing its file concurrently.
    pub async fn snapshot(&self) -> Result<FactStore> {
        let mut store = FactStore::new();
        let mut units = 0;
        for relation in Role::ALL.iter().copied() {
            let dir = self.root.join(relation.as_str());
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .with_context(|| format!("error listing relation directory {}", dir.display()))?;
            while let Some(entry) = entries.next_entry().await.context("error reading relation directory entry")? {
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some(FACTS_EXT) {
                    continue;
                }
                let record = match read_record(&path).await {
                    Ok(Some(record)) => record,
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = ?err, "skipping unreadable unit facts");
                        continue;
                    }
                };
                units += 1;
                store.publish_all(relation, &record.unit_id, record.facts);
            }
        }
        metrics::gauge!(METRIC_RELATION_UNITS, units as f64);
        Ok(store)
    }

    async fn modify<F>(&self, relation: Role, f: F) -> Result<bool>
    where
        F: FnOnce(&mut UnitFacts),
    {
        let _guard = self.write_lock.lock().await;
        let path = self.unit_path(relation);
        let mut record = read_record(&path).await?.unwrap_or_default();
        let before = record.facts.clone();
        f(&mut record.facts);
        if record.facts == before && record.unit_id == self.unit_id {
            return Ok(false);
        }
        record.unit_id = self.unit_id.clone();
        let encoded = serde_json::to_vec_pretty(&record).context("error encoding unit facts")?;
        write_atomic(&path, &encoded).await?;
        tracing::debug!(relation = %relation, "published facts");
        Ok(true)
    }

    fn unit_path(&self, relation: Role) -> PathBuf {
        self.root.join(relation.as_str()).join(format!("{}.{}", self.unit_id.replace('/', "_"), FACTS_EXT))
    }
}

async fn read_record(path: &Path) -> Result<Option<UnitRecord>> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("error reading {}", path.display())),
    };
    let record = serde_json::from_slice(&raw).with_context(|| format!("error decoding {}", path.display()))?;
    Ok(Some(record))
}

/// Replace the file at the given path atomically.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension(TMP_EXT);
    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("error writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("error replacing {}", path.display()))?;
    Ok(())
}

/// A task which polls the relations and emits a new snapshot whenever any fact changed.
pub struct RelationWatcher {
    relations: RelationDir,
    poll: Duration,
    facts_tx: watch::Sender<Arc<FactStore>>,
    shutdown: BroadcastStream<()>,
}

impl RelationWatcher {
    /// Create a new instance, seeded with the given snapshot.
    pub fn new(relations: RelationDir, poll: Duration, initial: FactStore, shutdown: broadcast::Receiver<()>) -> (Self, FactsRx) {
        metrics::register_gauge!(METRIC_RELATION_UNITS, metrics::Unit::Count, "the number of unit fact files observed across all relations");
        let (facts_tx, facts_rx) = watch::channel(Arc::new(initial));
        (
            Self {
                relations,
                poll,
                facts_tx,
                shutdown: BroadcastStream::new(shutdown),
            },
            facts_rx,
        )
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("relation watcher started");
        let mut ticks = IntervalStream::new(tokio::time::interval(self.poll));
        loop {
            tokio::select! {
                Some(_) = ticks.next() => self.poll_relations().await,
                _ = self.shutdown.next() => break,
            }
        }
        tracing::debug!("relation watcher stopped");
        Ok(())
    }

    async fn poll_relations(&mut self) {
        let store = match self.relations.snapshot().await {
            Ok(store) => store,
            Err(err) => {
                tracing::error!(error = ?err, "error reading relations");
                return;
            }
        };
        let changed = { **self.facts_tx.borrow() != store }; // Ensure borrow ref doesn't leak read lock.
        if changed {
            tracing::debug!("relation change observed");
            let _res = self.facts_tx.send(Arc::new(store));
        }
    }
}
