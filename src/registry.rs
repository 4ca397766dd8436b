//! # Resource registry.
//!
//! Keeps an operator's camera set live against the `users/{op}/cameras`
//! collection. The store delivers full snapshots (possibly repeated); the
//! registry diffs each one against the previous set and only emits a
//! [`RegistryDelta`] when a source was actually added, removed or modified.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::Stream;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ConsoleError;
use crate::model::{paths, Source, SourceId};
use crate::store::{DocumentStore, Snapshot};

/// Unordered source set keyed by id.
pub type SourceSet = BTreeMap<SourceId, Source>;

#[derive(Debug, Clone, Default)]
pub struct RegistryDelta {
    pub added: Vec<Source>,
    pub removed: Vec<SourceId>,
    pub modified: Vec<Source>,
    /// Full set after this change.
    pub current: Arc<SourceSet>,
}

impl RegistryDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

pub fn diff(old: &SourceSet, new: &SourceSet) -> RegistryDelta {
    let mut delta = RegistryDelta::default();
    for (id, source) in new {
        match old.get(id) {
            None => delta.added.push(source.clone()),
            Some(previous) if previous != source => delta.modified.push(source.clone()),
            Some(_) => {}
        }
    }
    delta.removed = old.keys().filter(|id| !new.contains_key(*id)).cloned().collect();
    delta.current = Arc::new(new.clone());
    delta
}

fn parse_snapshot(snapshot: &Snapshot) -> SourceSet {
    let mut set = SourceSet::new();
    for doc in &snapshot.documents {
        match Source::from_document(&doc.id, &doc.data) {
            Some(source) => {
                set.insert(source.id.clone(), source);
            }
            None => warn!("Skipping malformed camera document: path={}", doc.path),
        }
    }
    set
}

pub struct ResourceRegistry {
    store: Arc<dyn DocumentStore>,
    operator_id: String,
}

impl ResourceRegistry {
    pub fn new(store: Arc<dyn DocumentStore>, operator_id: impl Into<String>) -> Self {
        Self {
            store,
            operator_id: operator_id.into(),
        }
    }

    /// Opens the camera-collection subscription.
    ///
    /// A store failure here is returned rather than presented as an empty
    /// registry. The first delta carries the bootstrap set (possibly empty).
    pub async fn subscribe(&self) -> Result<RegistryWatch, ConsoleError> {
        let path = paths::cameras(&self.operator_id);
        let mut sub = self.store.subscribe(&path).await?;
        info!("Registry subscribed: operator={} path={}", self.operator_id, path);

        let (delta_tx, delta_rx) = mpsc::unbounded_channel();
        let (current_tx, current_rx) = watch::channel(Arc::new(SourceSet::new()));
        let token = sub.token();
        let task_token = token.clone();
        let operator = self.operator_id.clone();

        tokio::spawn(async move {
            let mut previous = SourceSet::new();
            let mut bootstrapped = false;
            loop {
                let snapshot = tokio::select! {
                    _ = task_token.cancelled() => break,
                    snapshot = sub.recv() => match snapshot {
                        Some(s) => s,
                        None => break,
                    },
                };

                let next = parse_snapshot(&snapshot);
                let delta = diff(&previous, &next);
                if delta.is_empty() && bootstrapped {
                    debug!("Registry snapshot unchanged: operator={}", operator);
                    continue;
                }
                bootstrapped = true;

                debug!(
                    "Registry changed: operator={} added={} removed={} modified={} total={}",
                    operator,
                    delta.added.len(),
                    delta.removed.len(),
                    delta.modified.len(),
                    next.len()
                );
                current_tx.send_replace(delta.current.clone());
                previous = next;
                if delta_tx.send(delta).is_err() {
                    break;
                }
            }
            sub.cancel();
            debug!("Registry subscription closed: operator={}", operator);
        });

        Ok(RegistryWatch {
            deltas: UnboundedReceiverStream::new(delta_rx),
            current: current_rx,
            token,
        })
    }
}

/// Stream of registry deltas. Dropping it releases the store subscription.
pub struct RegistryWatch {
    deltas: UnboundedReceiverStream<RegistryDelta>,
    current: watch::Receiver<Arc<SourceSet>>,
    token: CancellationToken,
}

impl RegistryWatch {
    /// Latest known source set, which may be ahead of the deltas not yet consumed.
    pub fn current(&self) -> Arc<SourceSet> {
        self.current.borrow().clone()
    }

    pub fn current_receiver(&self) -> watch::Receiver<Arc<SourceSet>> {
        self.current.clone()
    }

    /// Safe to call more than once.
    pub fn unsubscribe(&self) {
        self.token.cancel();
    }
}

impl Stream for RegistryWatch {
    type Item = RegistryDelta;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.deltas).poll_next(cx)
    }
}

impl Drop for RegistryWatch {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
