use crate::config::ConfigDefaults;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub row_lock_threshold: u64,
    /// Cover the rest of a batch with a table lock once the threshold is hit
    pub table_lock_after_threshold: bool,
    pub warn_on_escalation: bool,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            row_lock_threshold: 100,
            table_lock_after_threshold: false,
            warn_on_escalation: true,
        }
    }
}

impl ConfigDefaults for EscalationConfig {
    fn validate(&self) -> Result<(), String> {
        if self.row_lock_threshold == 0 {
            return Err("Row lock threshold must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EscalationRecommendation {
    pub resource: String,
    pub row_locks: u64,
    pub threshold: u64,
    pub should_escalate: bool,
}

/// Counts in-flight row locks per resource and says when a table lock would be cheaper.
///
/// Purely in-process; counts live as long as the monitor.
#[derive(Debug, Default)]
pub struct LockEscalationMonitor {
    config: EscalationConfig,
    counts: DashMap<String, u64>,
}

impl LockEscalationMonitor {
    pub fn new(config: EscalationConfig) -> Self {
        Self {
            config,
            counts: DashMap::new(),
        }
    }

    pub fn config(&self) -> &EscalationConfig {
        &self.config
    }

    /// Count one more row lock on `resource`. Returns `false` once the count
    /// has reached the threshold, meaning the caller should escalate.
    pub fn track_row_lock(&self, resource: &str) -> bool {
        let count = {
            let mut entry = self.counts.entry(resource.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        if count < self.config.row_lock_threshold {
            return true;
        }
        if self.config.warn_on_escalation && count == self.config.row_lock_threshold {
            warn!(
                "Row lock count on {} reached {}, escalate to a table lock",
                resource, count
            );
        }
        false
    }

    /// Count one row lock released; never goes below zero
    pub fn release_row_lock(&self, resource: &str) {
        if let Some(mut entry) = self.counts.get_mut(resource) {
            *entry = entry.saturating_sub(1);
        }
    }

    pub fn row_lock_count(&self, resource: &str) -> u64 {
        self.counts.get(resource).map_or(0, |entry| *entry)
    }

    /// The decision `track_row_lock` would make, without counting anything
    pub fn get_escalation_recommendation(&self, resource: &str) -> EscalationRecommendation {
        let row_locks = self.row_lock_count(resource);
        EscalationRecommendation {
            resource: resource.to_string(),
            row_locks,
            threshold: self.config.row_lock_threshold,
            should_escalate: row_locks >= self.config.row_lock_threshold,
        }
    }

    pub fn reset(&self, resource: &str) {
        if self.counts.remove(resource).is_some() {
            debug!("Reset row lock count for {}", resource);
        }
    }

    /// Current counts, sorted by resource
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counts
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(threshold: u64) -> LockEscalationMonitor {
        LockEscalationMonitor::new(EscalationConfig {
            row_lock_threshold: threshold,
            ..Default::default()
        })
    }

    #[test]
    fn test_signals_at_threshold() {
        let monitor = monitor(3);
        assert!(monitor.track_row_lock("students"));
        assert!(monitor.track_row_lock("students"));
        assert!(!monitor.track_row_lock("students"));
        assert!(!monitor.track_row_lock("students"));
        assert!(monitor.track_row_lock("alerts"));

        let recommendation = monitor.get_escalation_recommendation("students");
        assert!(recommendation.should_escalate);
        assert_eq!(recommendation.row_locks, 4);
        assert_eq!(recommendation.threshold, 3);
    }

    #[test]
    fn test_release_never_goes_negative() {
        let monitor = monitor(3);
        monitor.release_row_lock("students");
        assert_eq!(monitor.row_lock_count("students"), 0);

        monitor.track_row_lock("students");
        monitor.release_row_lock("students");
        monitor.release_row_lock("students");
        assert_eq!(monitor.row_lock_count("students"), 0);
        assert!(!monitor.get_escalation_recommendation("students").should_escalate);
    }

    #[test]
    fn test_recommendation_is_side_effect_free() {
        let monitor = monitor(2);
        monitor.get_escalation_recommendation("students");
        assert!(monitor.snapshot().is_empty());

        monitor.track_row_lock("students");
        monitor.track_row_lock("alerts");
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.keys().collect::<Vec<_>>(), vec!["alerts", "students"]);

        monitor.reset("students");
        assert_eq!(monitor.row_lock_count("students"), 0);
    }
}
