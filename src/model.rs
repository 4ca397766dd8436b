use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub type SourceId = String;

pub fn now_epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Hazard categories reported by the analysis worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Fire,
    Fall,
    Safety,
    Vehicle,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Fire,
        Category::Fall,
        Category::Safety,
        Category::Vehicle,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Fire => "fire",
            Category::Fall => "fall",
            Category::Safety => "safety",
            Category::Vehicle => "vehicle",
        }
    }

    /// Name of the per-camera collection holding this category's detection log.
    pub fn log_collection(self) -> &'static str {
        match self {
            Category::Fire => "fire_detection",
            Category::Fall => "fall_detection",
            Category::Safety => "safety_issues",
            Category::Vehicle => "car_detection",
        }
    }

    /// Field name inside the worker's `total_hazard_counts/counts` document.
    pub fn counter_field(self) -> &'static str {
        match self {
            Category::Fire => "fire_detection_count",
            Category::Fall => "fall_detection_count",
            Category::Safety => "safety_issue_count",
            Category::Vehicle => "car_detection_count",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Category::Fire => "Fire suspected.",
            Category::Fall => "Fall detected.",
            Category::Safety => "Safety issue detected.",
            Category::Vehicle => "Vehicle detected.",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    pub ingest_url: String,
    pub latitude: f64,
    pub longitude: f64,
}

fn coordinate(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl Source {
    /// Parses a `cameras/{id}` document. Coordinates may be numbers or numeric strings.
    pub fn from_document(id: &str, data: &Value) -> Option<Source> {
        let ingest_url = data.get("cameraUrl")?.as_str()?.to_string();
        let name = data
            .get("cameraName")
            .and_then(Value::as_str)
            .unwrap_or(id)
            .to_string();
        Some(Source {
            id: id.to_string(),
            name,
            ingest_url,
            latitude: coordinate(data.get("latitude"))?,
            longitude: coordinate(data.get("longitude"))?,
        })
    }

    pub fn to_document(&self) -> Value {
        json!({
            "cameraName": self.name,
            "cameraUrl": self.ingest_url,
            "latitude": self.latitude,
            "longitude": self.longitude,
        })
    }
}

/// Per-category counts, either the worker's snapshot or a local tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HazardCounters {
    pub fire: u64,
    pub fall: u64,
    pub safety: u64,
    pub vehicle: u64,
}

impl HazardCounters {
    pub fn get(&self, category: Category) -> u64 {
        match category {
            Category::Fire => self.fire,
            Category::Fall => self.fall,
            Category::Safety => self.safety,
            Category::Vehicle => self.vehicle,
        }
    }

    pub fn set(&mut self, category: Category, value: u64) {
        match category {
            Category::Fire => self.fire = value,
            Category::Fall => self.fall = value,
            Category::Safety => self.safety = value,
            Category::Vehicle => self.vehicle = value,
        }
    }

    pub fn add(&mut self, other: &HazardCounters) {
        for category in Category::ALL {
            self.set(category, self.get(category).saturating_add(other.get(category)));
        }
    }

    /// Missing or non-numeric fields read as zero.
    pub fn from_document(data: &Value) -> HazardCounters {
        let mut counters = HazardCounters::default();
        for category in Category::ALL {
            let value = data
                .get(category.counter_field())
                .and_then(Value::as_u64)
                .unwrap_or(0);
            counters.set(category, value);
        }
        counters
    }

    pub fn to_document(&self) -> Value {
        let mut doc = serde_json::Map::new();
        for category in Category::ALL {
            doc.insert(category.counter_field().to_string(), json!(self.get(category)));
        }
        Value::Object(doc)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisStatus {
    pub source_id: SourceId,
    pub analyzing: bool,
    pub since: u64,
}

impl AnalysisStatus {
    pub fn from_document(source_id: &str, data: &Value) -> AnalysisStatus {
        AnalysisStatus {
            source_id: source_id.to_string(),
            analyzing: data.get("analyzing").and_then(Value::as_bool).unwrap_or(false),
            since: data.get("timestamp").and_then(Value::as_u64).unwrap_or(0),
        }
    }

    pub fn to_document(&self) -> Value {
        json!({ "analyzing": self.analyzing, "timestamp": self.since })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub source_id: SourceId,
    pub category: Category,
    pub timestamp: u64,
}

impl DetectionEvent {
    pub fn from_document(source_id: &str, category: Category, data: &Value) -> Option<DetectionEvent> {
        Some(DetectionEvent {
            source_id: source_id.to_string(),
            category,
            timestamp: data.get("timestamp")?.as_u64()?,
        })
    }

    pub fn to_document(&self) -> Value {
        json!({ "timestamp": self.timestamp })
    }

    pub fn message(&self) -> &'static str {
        self.category.message()
    }
}

/// Hierarchical document paths for one operator's resource tree.
pub mod paths {
    use super::Category;

    pub fn cameras(operator: &str) -> String {
        format!("users/{operator}/cameras")
    }

    pub fn camera(operator: &str, source: &str) -> String {
        format!("users/{operator}/cameras/{source}")
    }

    pub fn hazard_counts(operator: &str, source: &str) -> String {
        format!("users/{operator}/cameras/{source}/total_hazard_counts/counts")
    }

    pub fn detection_log(operator: &str, source: &str, category: Category) -> String {
        format!(
            "users/{operator}/cameras/{source}/{}",
            category.log_collection()
        )
    }

    pub fn analysis_statuses(operator: &str) -> String {
        format!("users/{operator}/analysisStatus")
    }

    pub fn analysis_status(operator: &str, source: &str) -> String {
        format!("users/{operator}/analysisStatus/{source}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_document_accepts_string_coordinates() {
        let doc = json!({
            "cameraName": "cam1",
            "cameraUrl": "rtmp://203.0.113.5/live/cam1",
            "latitude": "37.56",
            "longitude": 126.97,
        });
        let source = Source::from_document("cam1", &doc).unwrap();
        assert_eq!(source.name, "cam1");
        assert_eq!(source.latitude, 37.56);
        assert_eq!(source.longitude, 126.97);
    }

    #[test]
    fn test_source_document_without_url_is_rejected() {
        let doc = json!({ "cameraName": "cam1", "latitude": 1, "longitude": 2 });
        assert!(Source::from_document("cam1", &doc).is_none());
    }

    #[test]
    fn test_counters_missing_fields_read_as_zero() {
        let counters = HazardCounters::from_document(&json!({
            "fire_detection_count": 2,
            "car_detection_count": 7,
        }));
        assert_eq!(counters.get(Category::Fire), 2);
        assert_eq!(counters.get(Category::Vehicle), 7);
        assert_eq!(counters.get(Category::Fall), 0);
        assert_eq!(counters.get(Category::Safety), 0);
    }

    #[test]
    fn test_paths() {
        assert_eq!(
            paths::hazard_counts("op", "cam1"),
            "users/op/cameras/cam1/total_hazard_counts/counts"
        );
        assert_eq!(
            paths::detection_log("op", "cam1", Category::Safety),
            "users/op/cameras/cam1/safety_issues"
        );
        assert_eq!(paths::analysis_status("op", "cam1"), "users/op/analysisStatus/cam1");
    }
}
