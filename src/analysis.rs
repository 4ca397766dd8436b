use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::ConsoleError;
use crate::model::{now_epoch_millis, paths, AnalysisStatus, Source};
use crate::store::DocumentStore;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisRequest<'a> {
    user_id: &'a str,
    cameras: Vec<CameraRef<'a>>,
}

#[derive(Serialize)]
struct CameraRef<'a> {
    id: &'a str,
    url: &'a str,
}

/// Client for the external analysis worker's start/stop endpoints.
///
/// The status record is written only after the worker acknowledged with 2xx.
#[derive(Clone)]
pub struct AnalysisClient {
    http: reqwest::Client,
    base_url: String,
    store: Arc<dyn DocumentStore>,
    operator_id: String,
}

impl AnalysisClient {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        store: Arc<dyn DocumentStore>,
        operator_id: impl Into<String>,
    ) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            store,
            operator_id: operator_id.into(),
        })
    }

    pub async fn start(&self, source: &Source) -> Result<AnalysisStatus, ConsoleError> {
        self.request("start_analysis", source, true).await
    }

    pub async fn stop(&self, source: &Source) -> Result<AnalysisStatus, ConsoleError> {
        self.request("stop_analysis", source, false).await
    }

    async fn request(&self, endpoint: &str, source: &Source, analyzing: bool) -> Result<AnalysisStatus, ConsoleError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let body = AnalysisRequest {
            user_id: &self.operator_id,
            cameras: vec![CameraRef {
                id: &source.id,
                url: &source.ingest_url,
            }],
        };

        let response = self.http.post(&url).json(&body).send().await.map_err(|e| {
            warn!("Analysis request failed: url={} source={} err={}", url, source.id, e);
            ConsoleError::ControlEndpointFailure(e.to_string())
        })?;
        let status = response.status();
        if !status.is_success() {
            warn!(
                "Analysis request rejected: url={} source={} status={}",
                url, source.id, status
            );
            return Err(ConsoleError::ControlEndpointFailure(format!(
                "{endpoint} returned {status}"
            )));
        }

        let record = AnalysisStatus {
            source_id: source.id.clone(),
            analyzing,
            since: now_epoch_millis(),
        };
        self.store
            .set(
                &paths::analysis_status(&self.operator_id, &source.id),
                record.to_document(),
            )
            .await?;
        info!(
            "Analysis {}: operator={} source={}",
            if analyzing { "started" } else { "stopped" },
            self.operator_id,
            source.id
        );
        Ok(record)
    }
}
