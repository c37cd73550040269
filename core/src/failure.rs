//! Per-key circuit breaker for repeated synthesis failures

use crate::hash::ContentKey;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub key: ContentKey,
    pub last_attempt: DateTime<Utc>,
    pub consecutive_failures: u32,
}

pub struct FailureTracker {
    threshold: u32,
    records: DashMap<ContentKey, FailureRecord>,
}

impl FailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            records: DashMap::new(),
        }
    }

    /// True once the key has failed `threshold` times in a row.
    pub fn is_tripped(&self, key: &ContentKey) -> bool {
        self.records
            .get(key)
            .is_some_and(|r| r.consecutive_failures >= self.threshold)
    }

    /// Returns the new consecutive count.
    pub fn record_failure(&self, key: &ContentKey) -> u32 {
        let mut entry = self
            .records
            .entry(key.clone())
            .or_insert_with(|| FailureRecord {
                key: key.clone(),
                last_attempt: Utc::now(),
                consecutive_failures: 0,
            });
        entry.consecutive_failures += 1;
        entry.last_attempt = Utc::now();
        entry.consecutive_failures
    }

    pub fn record_success(&self, key: &ContentKey) {
        self.records.remove(key);
    }

    pub fn get(&self, key: &ContentKey) -> Option<FailureRecord> {
        self.records.get(key).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records, most recent attempt first.
    pub fn snapshot(&self) -> Vec<FailureRecord> {
        let mut out: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        out.sort_by(|a, b| b.last_attempt.cmp(&a.last_attempt));
        out
    }

    /// Administrative reset; returns how many records were dropped.
    pub fn clear(&self) -> usize {
        let n = self.records.len();
        self.records.clear();
        n
    }
}
