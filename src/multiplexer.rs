//! # Subscription multiplexer.
//!
//! Maintains one live store subscription per `(source, feed)` for every source
//! in the registry: the worker's counters document plus one detection-log
//! collection per [`Category`].
//!
//! ## Rules
//! - `reconcile` is a set-difference pass: handles of vanished sources are
//!   cancelled, missing handles of present sources are opened, everything else
//!   is left alone.
//! - A handle opened for a source that disappeared from the registry while the
//!   open was in flight is cancelled immediately and never registered.
//! - A failed open is logged and retried on the next pass.
//! - Every delivery carries the generation of the handle that produced it;
//!   deliveries from cancelled handles are rejected by [`Multiplexer::accepts`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::model::{paths, Category, SourceId};
use crate::registry::SourceSet;
use crate::store::{DocumentStore, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Feed {
    Counters,
    Log(Category),
}

impl Feed {
    pub const ALL: [Feed; 5] = [
        Feed::Counters,
        Feed::Log(Category::Fire),
        Feed::Log(Category::Fall),
        Feed::Log(Category::Safety),
        Feed::Log(Category::Vehicle),
    ];

    pub fn path(self, operator: &str, source: &str) -> String {
        match self {
            Feed::Counters => paths::hazard_counts(operator, source),
            Feed::Log(category) => paths::detection_log(operator, source, category),
        }
    }
}

pub type FeedKey = (SourceId, Feed);

/// A snapshot delivered by one feed subscription.
#[derive(Debug, Clone)]
pub struct FeedUpdate {
    pub source_id: SourceId,
    pub feed: Feed,
    pub generation: u64,
    pub snapshot: Snapshot,
}

struct Handle {
    generation: u64,
    token: CancellationToken,
    _forwarder: JoinHandle<()>,
}

impl Handle {
    fn cancel(&self) {
        self.token.cancel();
    }
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub opened: usize,
    pub cancelled: usize,
    /// Opened after their source had already left the registry.
    pub discarded: usize,
    pub failed: Vec<(FeedKey, StoreError)>,
}

pub struct Multiplexer {
    store: Arc<dyn DocumentStore>,
    operator_id: String,
    handles: HashMap<FeedKey, Handle>,
    next_generation: u64,
    updates: mpsc::UnboundedSender<FeedUpdate>,
    registry: watch::Receiver<Arc<SourceSet>>,
}

impl Multiplexer {
    /// `registry` is consulted after every open to detect sources that vanished meanwhile.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        operator_id: impl Into<String>,
        updates: mpsc::UnboundedSender<FeedUpdate>,
        registry: watch::Receiver<Arc<SourceSet>>,
    ) -> Self {
        Self {
            store,
            operator_id: operator_id.into(),
            handles: HashMap::new(),
            next_generation: 1,
            updates,
            registry,
        }
    }

    pub async fn reconcile(&mut self, target: &SourceSet) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let stale: Vec<FeedKey> = self
            .handles
            .keys()
            .filter(|(source, _)| !target.contains_key(source))
            .cloned()
            .collect();
        for key in stale {
            if let Some(handle) = self.handles.remove(&key) {
                handle.cancel();
                report.cancelled += 1;
                debug!("Subscription cancelled: source={} feed={:?}", key.0, key.1);
            }
        }

        for source in target.keys() {
            for feed in Feed::ALL {
                let key = (source.clone(), feed);
                if self.handles.contains_key(&key) {
                    continue;
                }
                match self.open(source, feed).await {
                    Ok(handle) => {
                        if self.registry.borrow().contains_key(source) {
                            self.handles.insert(key, handle);
                            report.opened += 1;
                        } else {
                            handle.cancel();
                            report.discarded += 1;
                            debug!(
                                "Subscription discarded, source left registry: source={} feed={:?}",
                                source, feed
                            );
                        }
                    }
                    Err(e) => {
                        warn!(
                            "Failed to open subscription: source={} feed={:?} err={}",
                            source, feed, e
                        );
                        report.failed.push((key, e));
                    }
                }
            }
        }

        if report.opened > 0 || report.cancelled > 0 || !report.failed.is_empty() {
            info!(
                "Subscriptions reconciled: opened={} cancelled={} discarded={} failed={} live={}",
                report.opened,
                report.cancelled,
                report.discarded,
                report.failed.len(),
                self.handles.len()
            );
        }
        report
    }

    async fn open(&mut self, source: &str, feed: Feed) -> Result<Handle, StoreError> {
        let path = feed.path(&self.operator_id, source);
        let mut sub = self.store.subscribe(&path).await?;

        let generation = self.next_generation;
        self.next_generation += 1;
        let token = sub.token();
        let task_token = token.clone();
        let tx = self.updates.clone();
        let source_id = source.to_string();

        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    snapshot = sub.recv() => match snapshot {
                        Some(snapshot) => {
                            let update = FeedUpdate {
                                source_id: source_id.clone(),
                                feed,
                                generation,
                                snapshot,
                            };
                            if tx.send(update).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            sub.cancel();
        });

        Ok(Handle {
            generation,
            token,
            _forwarder: forwarder,
        })
    }

    /// True if the update came from a handle that is still registered.
    pub fn accepts(&self, update: &FeedUpdate) -> bool {
        self.handles
            .get(&(update.source_id.clone(), update.feed))
            .is_some_and(|h| h.generation == update.generation)
    }

    pub fn live_count(&self) -> usize {
        self.handles.len()
    }

    pub fn live_sources(&self, feed: Feed) -> BTreeSet<SourceId> {
        self.handles
            .keys()
            .filter(|(_, f)| *f == feed)
            .map(|(source, _)| source.clone())
            .collect()
    }

    pub fn shutdown(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.cancel();
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
