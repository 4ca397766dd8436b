//! # Source lifecycle: registration and cascading removal.
//!
//! Removal runs a fixed list of steps and records an outcome per step. A failed
//! step never stops the ones after it; the camera document itself is always
//! deleted last so no undeletable source is left behind.
//!
//! Subscriptions are not touched here. They follow the camera document's
//! disappearance from the registry.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{ConsoleError, StoreError};
use crate::model::{paths, Category, Source};
use crate::playback::PlaybackManager;
use crate::store::DocumentStore;
use crate::stream_url::derive_playback_url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeStep {
    StopPlayback,
    AnalysisStatus,
    HazardCounters,
    DetectionLog(Category),
    Source,
}

impl CascadeStep {
    /// Removal order.
    pub fn plan() -> Vec<CascadeStep> {
        let mut steps = vec![
            CascadeStep::StopPlayback,
            CascadeStep::AnalysisStatus,
            CascadeStep::HazardCounters,
        ];
        steps.extend(Category::ALL.into_iter().map(CascadeStep::DetectionLog));
        steps.push(CascadeStep::Source);
        steps
    }

    pub fn label(&self) -> String {
        match self {
            CascadeStep::StopPlayback => "stop_playback".to_string(),
            CascadeStep::AnalysisStatus => "analysis_status".to_string(),
            CascadeStep::HazardCounters => "hazard_counters".to_string(),
            CascadeStep::DetectionLog(category) => category.log_collection().to_string(),
            CascadeStep::Source => "source".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub step: CascadeStep,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CascadeReport {
    pub source_id: String,
    pub steps: Vec<StepOutcome>,
}

impl CascadeReport {
    pub fn failed_steps(&self) -> Vec<CascadeStep> {
        self.steps
            .iter()
            .filter(|o| o.error.is_some())
            .map(|o| o.step)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|o| o.error.is_none())
    }

    pub fn source_removed(&self) -> bool {
        self.steps
            .iter()
            .any(|o| o.step == CascadeStep::Source && o.error.is_none())
    }

    pub fn into_result(self) -> Result<CascadeReport, ConsoleError> {
        if self.is_complete() {
            return Ok(self);
        }
        Err(ConsoleError::PartialCascadeFailure {
            failed: self.failed_steps().iter().map(CascadeStep::label).collect(),
            source_id: self.source_id,
        })
    }
}

#[derive(Clone)]
pub struct LifecycleManager {
    store: Arc<dyn DocumentStore>,
    operator_id: String,
    playback: PlaybackManager,
}

fn required<'a>(field: &str, value: &'a str) -> Result<&'a str, ConsoleError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ConsoleError::InvalidInput(format!("{field} is required")));
    }
    Ok(value)
}

fn coordinate(field: &str, value: &str) -> Result<f64, ConsoleError> {
    let value = required(field, value)?;
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ConsoleError::InvalidInput(format!("{field} must be a number, got {value:?}")))
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn DocumentStore>, operator_id: impl Into<String>, playback: PlaybackManager) -> Self {
        Self {
            store,
            operator_id: operator_id.into(),
            playback,
        }
    }

    /// Registers a camera keyed by its name.
    pub async fn register(
        &self,
        name: &str,
        ingest_url: &str,
        latitude: &str,
        longitude: &str,
    ) -> Result<Source, ConsoleError> {
        let name = required("name", name)?;
        if name.contains('/') {
            return Err(ConsoleError::InvalidInput("name must not contain '/'".to_string()));
        }
        let ingest_url = required("url", ingest_url)?;
        derive_playback_url(ingest_url)
            .map_err(|_| ConsoleError::InvalidInput(format!("url {ingest_url:?} is not a stream url")))?;
        let latitude = coordinate("latitude", latitude)?;
        let longitude = coordinate("longitude", longitude)?;

        let path = paths::camera(&self.operator_id, name);
        if self.store.get(&path).await?.is_some() {
            return Err(ConsoleError::DuplicateSource(name.to_string()));
        }

        let source = Source {
            id: name.to_string(),
            name: name.to_string(),
            ingest_url: ingest_url.to_string(),
            latitude,
            longitude,
        };
        self.store.set(&path, source.to_document()).await?;
        info!(
            "Camera registered: operator={} id={} url={}",
            self.operator_id, source.id, source.ingest_url
        );
        Ok(source)
    }

    /// Removes a camera and everything stored beneath it, best effort.
    pub async fn remove(&self, source_id: &str) -> CascadeReport {
        let mut steps = Vec::new();
        for step in CascadeStep::plan() {
            let result = self.run_step(step, source_id).await;
            if let Err(e) = &result {
                warn!(
                    "Cascade step failed: operator={} source={} step={} err={}",
                    self.operator_id,
                    source_id,
                    step.label(),
                    e
                );
            }
            steps.push(StepOutcome {
                step,
                error: result.err(),
            });
        }

        let report = CascadeReport {
            source_id: source_id.to_string(),
            steps,
        };
        if report.is_complete() {
            info!("Camera removed: operator={} id={}", self.operator_id, source_id);
        } else {
            error!(
                "Camera removal incomplete: operator={} id={} failed={:?}",
                self.operator_id,
                source_id,
                report.failed_steps()
            );
        }
        report
    }

    async fn run_step(&self, step: CascadeStep, source_id: &str) -> Result<(), String> {
        let op = &self.operator_id;
        match step {
            CascadeStep::StopPlayback => {
                self.playback.detach_source(source_id);
                Ok(())
            }
            CascadeStep::AnalysisStatus => self
                .store
                .delete(&paths::analysis_status(op, source_id))
                .await
                .map_err(|e| e.to_string()),
            CascadeStep::HazardCounters => self
                .store
                .delete(&paths::hazard_counts(op, source_id))
                .await
                .map_err(|e| e.to_string()),
            CascadeStep::DetectionLog(category) => self
                .clear_collection(&paths::detection_log(op, source_id, category))
                .await,
            CascadeStep::Source => self
                .store
                .delete(&paths::camera(op, source_id))
                .await
                .map_err(|e| e.to_string()),
        }
    }

    async fn clear_collection(&self, collection: &str) -> Result<(), String> {
        let documents = self.store.query(collection).await.map_err(|e| e.to_string())?;
        let total = documents.len();
        let results: Vec<Result<(), StoreError>> =
            join_all(documents.iter().map(|doc| self.store.delete(&doc.path))).await;
        let failures: Vec<StoreError> = results.into_iter().filter_map(Result::err).collect();
        match failures.first() {
            None => Ok(()),
            Some(first) => Err(format!(
                "{} of {} records not deleted: {}",
                failures.len(),
                total,
                first
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnalysisStatus, DetectionEvent, HazardCounters};
    use crate::playback::testing::RecordingFactory;
    use crate::store::{MemoryStore, Op};

    fn setup() -> (Arc<MemoryStore>, LifecycleManager, PlaybackManager, RecordingFactory) {
        let store = Arc::new(MemoryStore::new());
        let factory = RecordingFactory::default();
        let playback = PlaybackManager::new(Arc::new(factory.clone()), 1935);
        let lifecycle = LifecycleManager::new(store.clone(), "op", playback.clone());
        (store, lifecycle, playback, factory)
    }

    async fn seed_dependents(store: &MemoryStore, id: &str) {
        store
            .set(
                &paths::analysis_status("op", id),
                AnalysisStatus {
                    source_id: id.into(),
                    analyzing: true,
                    since: 1,
                }
                .to_document(),
            )
            .await
            .unwrap();
        store
            .set(&paths::hazard_counts("op", id), HazardCounters::default().to_document())
            .await
            .unwrap();
        for category in Category::ALL {
            for n in 0..3u64 {
                let event = DetectionEvent {
                    source_id: id.into(),
                    category,
                    timestamp: n,
                };
                let path = format!("{}/e{n}", paths::detection_log("op", id, category));
                store.set(&path, event.to_document()).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_register_validates_inputs() {
        let (_store, lifecycle, _, _) = setup();
        let cases = [
            ("", "rtmp://h/live/a", "1", "2"),
            ("a", "", "1", "2"),
            ("a", "rtmp://h/live/a", " ", "2"),
            ("a", "rtmp://h/live/a", "1", "east"),
            ("a", "rtmp://h", "1", "2"),
            ("a/b", "rtmp://h/live/a", "1", "2"),
        ];
        for (name, url, lat, lon) in cases {
            let err = lifecycle.register(name, url, lat, lon).await.unwrap_err();
            assert_eq!(err.as_label(), "invalid_input", "case {name:?} {url:?} {lat:?} {lon:?}");
        }
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_name() {
        let (store, lifecycle, _, _) = setup();
        let source = lifecycle
            .register("cam1", "rtmp://203.0.113.5/live/cam1", "37.5", "127.0")
            .await
            .unwrap();
        assert_eq!(source.id, "cam1");
        assert!(store.get("users/op/cameras/cam1").await.unwrap().is_some());

        let err = lifecycle
            .register("cam1", "rtmp://203.0.113.9/live/other", "1", "2")
            .await
            .unwrap_err();
        assert_eq!(err.as_label(), "duplicate_source");
    }

    #[tokio::test]
    async fn test_register_surfaces_store_failure() {
        let (store, lifecycle, _, _) = setup();
        store.set_available(false);
        let err = lifecycle
            .register("cam1", "rtmp://h/live/cam1", "1", "2")
            .await
            .unwrap_err();
        assert_eq!(err.as_label(), "store_unavailable");
    }

    #[tokio::test]
    async fn test_remove_deletes_everything_in_order() {
        let (store, lifecycle, playback, factory) = setup();
        let source = lifecycle
            .register("cam1", "rtmp://203.0.113.5/live/cam1", "1", "2")
            .await
            .unwrap();
        seed_dependents(&store, "cam1").await;
        playback.attach(&source).unwrap();

        let report = lifecycle.remove("cam1").await;
        assert!(report.is_complete());
        assert_eq!(
            report.steps.iter().map(|o| o.step).collect::<Vec<_>>(),
            CascadeStep::plan()
        );
        assert_eq!(store.document_count("users/op/").await, 0);
        assert_eq!(factory.count("dispose"), 1);
        assert!(report.into_result().is_ok());
    }

    #[tokio::test]
    async fn test_failed_step_does_not_abort_cascade() {
        let (store, lifecycle, _, _) = setup();
        lifecycle
            .register("cam1", "rtmp://203.0.113.5/live/cam1", "1", "2")
            .await
            .unwrap();
        seed_dependents(&store, "cam1").await;
        store
            .fail_on(Op::Delete, "users/op/cameras/cam1/fire_detection")
            .await;

        let report = lifecycle.remove("cam1").await;
        assert_eq!(
            report.failed_steps(),
            vec![CascadeStep::DetectionLog(Category::Fire)]
        );
        assert!(report.source_removed());
        assert!(store.get("users/op/cameras/cam1").await.unwrap().is_none());
        assert_eq!(
            store
                .document_count("users/op/cameras/cam1/fall_detection")
                .await,
            0
        );
        assert_eq!(store.document_count("users/op/analysisStatus/").await, 0);

        let err = report.into_result().unwrap_err();
        match err {
            ConsoleError::PartialCascadeFailure { source_id, failed } => {
                assert_eq!(source_id, "cam1");
                assert_eq!(failed, vec!["fire_detection".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_query_is_reported() {
        let (store, lifecycle, _, _) = setup();
        store.fail_on(Op::Query, "users/op/cameras/cam1/car_detection").await;
        let report = lifecycle.remove("cam1").await;
        assert_eq!(
            report.failed_steps(),
            vec![CascadeStep::DetectionLog(Category::Vehicle)]
        );
        assert!(report.source_removed());
    }
}
