use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::model::{Category, DetectionEvent, HazardCounters, SourceId};

/// Per-source statistics.
///
/// `counters` mirrors the worker's snapshot (last write wins). `tallies` counts
/// the detection-log records observed locally; the two are kept independently.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceStats {
    pub counters: HazardCounters,
    pub tallies: HazardCounters,
    pub recent: BTreeMap<Category, Vec<LogEntry>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub timestamp: u64,
    pub category: Category,
    pub message: &'static str,
}

impl From<&DetectionEvent> for LogEntry {
    fn from(event: &DetectionEvent) -> Self {
        LogEntry {
            timestamp: event.timestamp,
            category: event.category,
            message: event.message(),
        }
    }
}

/// Folds counter snapshots and detection logs for the tracked sources.
///
/// Only tracked sources contribute to totals; updates for untracked sources are
/// ignored.
pub struct Aggregator {
    table: HashMap<SourceId, SourceStats>,
    recent_limit: usize,
}

impl Aggregator {
    pub fn new(recent_limit: usize) -> Self {
        Self {
            table: HashMap::new(),
            recent_limit,
        }
    }

    pub fn track(&mut self, source_id: &str) {
        self.table.entry(source_id.to_string()).or_default();
    }

    /// Drops everything known about a source, excluding it from totals.
    pub fn evict(&mut self, source_id: &str) -> bool {
        self.table.remove(source_id).is_some()
    }

    pub fn tracked(&self) -> impl Iterator<Item = &SourceId> {
        self.table.keys()
    }

    /// `None` means the counters document does not exist (yet).
    pub fn on_source_counters_update(&mut self, source_id: &str, counters: Option<HazardCounters>) -> bool {
        match self.table.get_mut(source_id) {
            Some(stats) => {
                stats.counters = counters.unwrap_or_default();
                true
            }
            None => false,
        }
    }

    /// Replaces the observed log for one category.
    ///
    /// `observed` is the size of the whole record set and becomes the tally;
    /// `events` are the records that parsed, used for the recent list.
    pub fn on_detection_log(
        &mut self,
        source_id: &str,
        category: Category,
        observed: usize,
        mut events: Vec<DetectionEvent>,
    ) -> bool {
        let Some(stats) = self.table.get_mut(source_id) else {
            return false;
        };
        stats.tallies.set(category, observed as u64);

        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let recent = events
            .iter()
            .take(self.recent_limit)
            .map(LogEntry::from)
            .collect();
        stats.recent.insert(category, recent);
        true
    }

    /// Saturates at `u64::MAX`; worker counters are unbounded.
    pub fn total(&self, category: Category) -> u64 {
        self.table
            .values()
            .fold(0u64, |acc, stats| acc.saturating_add(stats.counters.get(category)))
    }

    pub fn totals(&self) -> HazardCounters {
        let mut totals = HazardCounters::default();
        for stats in self.table.values() {
            totals.add(&stats.counters);
        }
        totals
    }

    pub fn stats(&self, source_id: &str) -> Option<&SourceStats> {
        self.table.get(source_id)
    }

    pub fn table(&self) -> BTreeMap<SourceId, SourceStats> {
        self.table
            .iter()
            .map(|(id, stats)| (id.clone(), stats.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(fire: u64) -> Option<HazardCounters> {
        Some(HazardCounters {
            fire,
            ..Default::default()
        })
    }

    fn event(source: &str, category: Category, timestamp: u64) -> DetectionEvent {
        DetectionEvent {
            source_id: source.to_string(),
            category,
            timestamp,
        }
    }

    #[test]
    fn test_total_excludes_evicted_sources() {
        let mut agg = Aggregator::new(5);
        agg.track("cam1");
        agg.track("cam2");
        agg.on_source_counters_update("cam1", counters(2));
        agg.on_source_counters_update("cam2", counters(5));
        assert_eq!(agg.total(Category::Fire), 7);

        agg.evict("cam1");
        assert_eq!(agg.total(Category::Fire), 5);
        assert_eq!(agg.totals().fire, 5);
    }

    #[test]
    fn test_counters_are_last_write_wins() {
        let mut agg = Aggregator::new(5);
        agg.track("cam1");
        agg.on_source_counters_update("cam1", counters(9));
        agg.on_source_counters_update("cam1", counters(3));
        assert_eq!(agg.total(Category::Fire), 3);
        agg.on_source_counters_update("cam1", None);
        assert_eq!(agg.total(Category::Fire), 0);
    }

    #[test]
    fn test_untracked_updates_are_ignored() {
        let mut agg = Aggregator::new(5);
        assert!(!agg.on_source_counters_update("ghost", counters(4)));
        assert!(!agg.on_detection_log("ghost", Category::Fire, 0, vec![]));
        assert_eq!(agg.total(Category::Fire), 0);
    }

    #[test]
    fn test_detection_log_tally_and_recent_order() {
        let mut agg = Aggregator::new(2);
        agg.track("cam1");
        agg.on_detection_log(
            "cam1",
            Category::Fall,
            3,
            vec![
                event("cam1", Category::Fall, 10),
                event("cam1", Category::Fall, 30),
                event("cam1", Category::Fall, 20),
            ],
        );
        let stats = agg.stats("cam1").unwrap();
        assert_eq!(stats.tallies.fall, 3);
        let timestamps: Vec<u64> = stats.recent[&Category::Fall].iter().map(|e| e.timestamp).collect();
        assert_eq!(timestamps, vec![30, 20]);
        assert_eq!(stats.recent[&Category::Fall][0].message, "Fall detected.");
        // Local tallies never feed the worker-reported totals.
        assert_eq!(agg.total(Category::Fall), 0);
    }

    #[test]
    fn test_tally_counts_unparsed_records() {
        let mut agg = Aggregator::new(5);
        agg.track("cam1");
        agg.on_detection_log("cam1", Category::Fire, 4, vec![event("cam1", Category::Fire, 7)]);
        let stats = agg.stats("cam1").unwrap();
        assert_eq!(stats.tallies.fire, 4);
        assert_eq!(stats.recent[&Category::Fire].len(), 1);
    }

    #[test]
    fn test_total_saturates_on_huge_counters() {
        let mut agg = Aggregator::new(5);
        agg.track("cam1");
        agg.track("cam2");
        agg.on_source_counters_update("cam1", counters(u64::MAX));
        agg.on_source_counters_update("cam2", counters(u64::MAX));
        assert_eq!(agg.total(Category::Fire), u64::MAX);
        assert_eq!(agg.total(Category::Fire), agg.totals().fire);
    }
}
