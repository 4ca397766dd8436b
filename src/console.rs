//! # Console state owner.
//!
//! One coordinating task owns the registry snapshot, the subscription table
//! and the aggregate table. Everything reaches it as a message:
//!
//! ```text
//! RegistryWatch ──delta──►┐
//! feed forwarders ──────► │ Worker ──► Multiplexer::reconcile / Aggregator
//! analysisStatus sub ───► ┘    └────► watch::Sender<Arc<ConsoleSnapshot>>
//! ```
//!
//! Readers only ever see immutable [`ConsoleSnapshot`]s published after each
//! fully processed message, so reading never waits on subscription work.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::{Aggregator, SourceStats};
use crate::error::ConsoleError;
use crate::metrics;
use crate::model::{paths, AnalysisStatus, Category, DetectionEvent, HazardCounters, Source, SourceId};
use crate::multiplexer::{Feed, FeedUpdate, Multiplexer};
use crate::playback::PlaybackManager;
use crate::registry::{RegistryDelta, RegistryWatch, ResourceRegistry, SourceSet};
use crate::store::{DocumentStore, Snapshot, StoreSubscription};

#[derive(Debug, Clone)]
pub struct ConsoleOptions {
    pub operator_id: String,
    /// Most recent detection records kept per (source, category).
    pub recent_log_limit: usize,
}

impl ConsoleOptions {
    pub fn new(operator_id: impl Into<String>) -> Self {
        Self {
            operator_id: operator_id.into(),
            recent_log_limit: 5,
        }
    }
}

/// Immutable view of the console state.
#[derive(Debug, Clone, Default)]
pub struct ConsoleSnapshot {
    /// False until the bootstrap registry set has been applied.
    pub ready: bool,
    pub sources: SourceSet,
    pub stats: BTreeMap<SourceId, SourceStats>,
    pub totals: HazardCounters,
    /// Analysis status of registered sources only.
    pub analysis: BTreeMap<SourceId, AnalysisStatus>,
    pub live_subscriptions: usize,
    pub version: u64,
}

impl ConsoleSnapshot {
    pub fn total(&self, category: Category) -> u64 {
        self.totals.get(category)
    }

    pub fn source(&self, id: &str) -> Option<&Source> {
        self.sources.get(id)
    }

    pub fn is_analyzing(&self, id: &str) -> bool {
        self.analysis.get(id).is_some_and(|s| s.analyzing)
    }
}

pub struct Console {
    operator_id: String,
    snapshots: watch::Receiver<Arc<ConsoleSnapshot>>,
    registry: watch::Receiver<Arc<SourceSet>>,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Console {
    /// Subscribes to the operator's registry and starts the coordinating task.
    ///
    /// Fails with `StoreUnavailable` if the registry subscription cannot be
    /// opened. A missing analysis-status feed only degrades the status view.
    /// Any playback session bound to a camera that leaves the registry is
    /// detached through `playback`.
    pub async fn start(
        store: Arc<dyn DocumentStore>,
        options: ConsoleOptions,
        playback: PlaybackManager,
    ) -> Result<Console, ConsoleError> {
        let operator_id = options.operator_id.clone();
        let registry = ResourceRegistry::new(store.clone(), operator_id.clone());
        let registry_watch = registry.subscribe().await?;

        let status = match store.subscribe(&paths::analysis_statuses(&operator_id)).await {
            Ok(sub) => Some(sub),
            Err(e) => {
                warn!("Analysis status feed unavailable: operator={} err={}", operator_id, e);
                None
            }
        };

        let registry_rx = registry_watch.current_receiver();
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let multiplexer = Multiplexer::new(
            store,
            operator_id.clone(),
            feed_tx,
            registry_watch.current_receiver(),
        );
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(ConsoleSnapshot::default()));
        let token = CancellationToken::new();

        let worker = Worker {
            operator_id: operator_id.clone(),
            multiplexer,
            playback,
            aggregator: Aggregator::new(options.recent_log_limit),
            sources: Arc::new(SourceSet::new()),
            statuses: BTreeMap::new(),
            ready: false,
            version: 0,
            snapshots: snapshot_tx,
        };
        let task = tokio::spawn(worker.run(registry_watch, feed_rx, status, token.clone()));
        info!("Console started: operator={}", operator_id);

        Ok(Console {
            operator_id,
            snapshots: snapshot_rx,
            registry: registry_rx,
            token,
            task: Some(task),
        })
    }

    pub fn operator_id(&self) -> &str {
        &self.operator_id
    }

    /// Latest published state. Never blocks.
    pub fn snapshot(&self) -> Arc<ConsoleSnapshot> {
        self.snapshots.borrow().clone()
    }

    /// Checks the registry's own view, which can be ahead of the last snapshot.
    pub fn is_registered(&self, id: &str) -> bool {
        self.registry.borrow().contains_key(id)
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ConsoleSnapshot>> {
        self.snapshots.clone()
    }

    /// Waits until a published snapshot satisfies `predicate`.
    pub async fn wait_until<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&ConsoleSnapshot) -> bool,
    {
        let mut rx = self.snapshots.clone();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| predicate(s))).await,
            Ok(Ok(_))
        );
        reached
    }

    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!("Console stopped: operator={}", self.operator_id);
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Worker {
    operator_id: String,
    multiplexer: Multiplexer,
    playback: PlaybackManager,
    aggregator: Aggregator,
    sources: Arc<SourceSet>,
    statuses: BTreeMap<SourceId, AnalysisStatus>,
    ready: bool,
    version: u64,
    snapshots: watch::Sender<Arc<ConsoleSnapshot>>,
}

async fn next_status(status: &mut Option<StoreSubscription>) -> Option<Snapshot> {
    match status {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

impl Worker {
    async fn run(
        mut self,
        mut registry: RegistryWatch,
        mut feeds: mpsc::UnboundedReceiver<FeedUpdate>,
        mut status: Option<StoreSubscription>,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                delta = registry.next() => match delta {
                    Some(delta) => {
                        let current = registry.current();
                        self.apply_registry(delta, current).await;
                    }
                    None => {
                        warn!("Registry stream ended: operator={}", self.operator_id);
                        break;
                    }
                },
                Some(update) = feeds.recv() => self.apply_feed(update),
                snapshot = next_status(&mut status) => match snapshot {
                    Some(snapshot) => self.apply_status(snapshot),
                    None => status = None,
                },
            }
            self.publish();
        }

        self.multiplexer.shutdown();
        registry.unsubscribe();
        if let Some(status) = status {
            status.cancel();
        }
        self.publish();
    }

    /// Converges on `current`, the newest registry set, which may already
    /// include changes whose deltas are still queued.
    async fn apply_registry(&mut self, delta: RegistryDelta, current: Arc<SourceSet>) {
        info!(
            "Registry update: operator={} added={} removed={} modified={} sources={}",
            self.operator_id,
            delta.added.len(),
            delta.removed.len(),
            delta.modified.len(),
            current.len()
        );

        let stale: Vec<SourceId> = self
            .aggregator
            .tracked()
            .filter(|id| !current.contains_key(*id))
            .cloned()
            .collect();
        for id in &stale {
            self.aggregator.evict(id);
        }
        for id in self.sources.keys().filter(|id| !current.contains_key(*id)) {
            if self.playback.detach_source(id) {
                info!("Playback stopped, camera left registry: operator={} source={}", self.operator_id, id);
            }
        }
        for id in current.keys() {
            self.aggregator.track(id);
        }
        self.sources = current.clone();
        self.ready = true;

        self.multiplexer.reconcile(&current).await;
    }

    fn apply_feed(&mut self, update: FeedUpdate) {
        if !self.multiplexer.accepts(&update) {
            debug!(
                "Dropping late delivery: source={} feed={:?} generation={}",
                update.source_id, update.feed, update.generation
            );
            return;
        }

        match update.feed {
            Feed::Counters => {
                let counters = update
                    .snapshot
                    .first()
                    .map(|doc| HazardCounters::from_document(&doc.data));
                self.aggregator
                    .on_source_counters_update(&update.source_id, counters);
            }
            Feed::Log(category) => {
                let total = update.snapshot.documents.len();
                let events: Vec<DetectionEvent> = update
                    .snapshot
                    .documents
                    .iter()
                    .filter_map(|doc| DetectionEvent::from_document(&update.source_id, category, &doc.data))
                    .collect();
                if events.len() < total {
                    warn!(
                        "Skipped {} malformed detection records: source={} category={}",
                        total - events.len(),
                        update.source_id,
                        category
                    );
                }
                self.aggregator
                    .on_detection_log(&update.source_id, category, total, events);
            }
        }
    }

    fn apply_status(&mut self, snapshot: Snapshot) {
        self.statuses = snapshot
            .documents
            .iter()
            .map(|doc| (doc.id.clone(), AnalysisStatus::from_document(&doc.id, &doc.data)))
            .collect();
    }

    fn publish(&mut self) {
        self.version += 1;
        let analysis = self
            .statuses
            .iter()
            .filter(|(id, _)| self.sources.contains_key(*id))
            .map(|(id, status)| (id.clone(), status.clone()))
            .collect();
        let snapshot = ConsoleSnapshot {
            ready: self.ready,
            sources: (*self.sources).clone(),
            stats: self.aggregator.table(),
            totals: self.aggregator.totals(),
            analysis,
            live_subscriptions: self.multiplexer.live_count(),
            version: self.version,
        };
        metrics::record_snapshot(&snapshot);
        self.snapshots.send_replace(Arc::new(snapshot));
    }
}
