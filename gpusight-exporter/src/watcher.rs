//! Workload metadata cache.
//!
//! Keeps the latest metadata of every known pod, keyed `namespace/name`, fed
//! by an external event source (typically a cluster informer).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

/// Metadata of one workload (pod).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadMeta {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl WorkloadMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = uid.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    fn key(&self) -> String {
        cache_key(&self.namespace, &self.name)
    }
}

/// Change notification from the workload event source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadEvent {
    Added(WorkloadMeta),
    Updated(WorkloadMeta),
    Deleted { namespace: String, name: String },
    /// The source has delivered its initial listing.
    Synced,
}

/// Lookup of workload metadata by namespace and name.
pub trait WorkloadResolver: Send + Sync {
    fn lookup(&self, namespace: &str, name: &str) -> Option<WorkloadMeta>;
}

fn cache_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// In-memory workload cache.
#[derive(Debug, Default)]
pub struct WorkloadWatcher {
    workloads: RwLock<HashMap<String, WorkloadMeta>>,
    synced: AtomicBool,
}

impl WorkloadWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event to the cache.
    pub fn apply(&self, event: WorkloadEvent) {
        match event {
            WorkloadEvent::Added(meta) | WorkloadEvent::Updated(meta) => {
                trace!(namespace = %meta.namespace, name = %meta.name, "Workload updated");
                self.workloads.write().insert(meta.key(), meta);
            }
            WorkloadEvent::Deleted { namespace, name } => {
                trace!(namespace = %namespace, name = %name, "Workload deleted");
                self.workloads.write().remove(&cache_key(&namespace, &name));
            }
            WorkloadEvent::Synced => {
                if !self.synced.swap(true, Ordering::Relaxed) {
                    info!(workloads = self.len(), "Workload cache synced");
                }
            }
        }
    }

    /// Whether the initial listing has been received.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.workloads.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workloads.read().is_empty()
    }

    /// Consume events until the channel closes or shutdown is signalled.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<WorkloadEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!("Workload watcher started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping workload watcher");
                        break;
                    }
                }

                event = events.recv() => {
                    match event {
                        Some(event) => self.apply(event),
                        None => {
                            debug!("Workload event source closed");
                            break;
                        }
                    }
                }
            }
        }

        info!(workloads = self.len(), "Workload watcher stopped");
        Ok(())
    }
}

impl WorkloadResolver for WorkloadWatcher {
    fn lookup(&self, namespace: &str, name: &str) -> Option<WorkloadMeta> {
        self.workloads
            .read()
            .get(&cache_key(namespace, name))
            .cloned()
    }
}
