//! Query Metrics
//!
//! In-process counters and timings for resolver and property-value queries,
//! tagged statsd-style.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimingStats {
    pub count: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

impl TimingStats {
    pub fn avg_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms as f64 / self.count as f64
        }
    }
}

/// Counter and timing tracker
#[derive(Clone, Default)]
pub struct QueryMetrics {
    counters: Arc<Mutex<HashMap<String, u64>>>,
    timings: Arc<Mutex<HashMap<String, TimingStats>>>,
}

fn series_key(name: &str, tags: &[(&str, &str)]) -> String {
    if tags.is_empty() {
        return name.to_string();
    }
    let mut tags: Vec<String> = tags.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    tags.sort();
    format!("{}{{{}}}", name, tags.join(","))
}

impl QueryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &str, tags: &[(&str, &str)]) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        *counters.entry(series_key(name, tags)).or_insert(0) += 1;
    }

    pub fn timing(&self, name: &str, time_ms: u64) {
        let mut timings = self.timings.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = timings.entry(name.to_string()).or_default();
        entry.count += 1;
        entry.total_ms += time_ms;
        entry.max_ms = entry.max_ms.max(time_ms);
    }

    /// Total for `name` across all tag combinations.
    pub fn counter(&self, name: &str) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters
            .iter()
            .filter(|(key, _)| *key == name || key.starts_with(&format!("{}{{", name)))
            .map(|(_, count)| *count)
            .sum()
    }

    pub fn get_counters(&self) -> HashMap<String, u64> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_timing(&self, name: &str) -> TimingStats {
        self.timings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_sums_tagged_series() {
        let metrics = QueryMetrics::new();
        metrics.incr("values_success", &[("team_id", "1")]);
        metrics.incr("values_success", &[("team_id", "2")]);
        metrics.incr("values_success_other", &[]);
        assert_eq!(metrics.counter("values_success"), 2);
        assert!(metrics.get_counters().contains_key("values_success{team_id=1}"));
    }

    #[test]
    fn test_timing_stats() {
        let metrics = QueryMetrics::new();
        metrics.timing("resolve", 10);
        metrics.timing("resolve", 30);
        let stats = metrics.get_timing("resolve");
        assert_eq!(stats.count, 2);
        assert_eq!(stats.max_ms, 30);
        assert_eq!(stats.avg_ms(), 20.0);
    }
}
