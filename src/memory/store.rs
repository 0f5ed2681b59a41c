//! Adaptive memory storage
//!
//! Bounded, append-only log of past runs with frequency and recency queries.

use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

pub const DEFAULT_MEMORY_CAPACITY: usize = 100;

/// One remembered interaction. Never mutated once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryRecord {
    pub record_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub interaction_summary: String,
    #[serde(default)]
    pub learned_patterns: BTreeMap<String, String>,
    #[serde(default)]
    pub company_preferences: BTreeMap<String, String>,
}

impl MemoryRecord {
    pub fn new(interaction_summary: impl Into<String>) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            interaction_summary: interaction_summary.into(),
            learned_patterns: BTreeMap::new(),
            company_preferences: BTreeMap::new(),
        }
    }

    pub fn with_pattern(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.learned_patterns.insert(key.into(), value.into());
        self
    }

    pub fn with_preferences(mut self, preferences: BTreeMap<String, String>) -> Self {
        self.company_preferences.extend(preferences);
        self
    }

    fn matches(&self, needle: &str) -> bool {
        let contains = |s: &str| s.to_lowercase().contains(needle);

        contains(&self.interaction_summary)
            || self
                .learned_patterns
                .iter()
                .any(|(k, v)| contains(k) || contains(v))
            || self
                .company_preferences
                .iter()
                .any(|(k, v)| contains(k) || contains(v))
    }
}

/// Ring buffer of the most recent `capacity` records.
///
/// Appends serialize under the writer lock; every read works on a
/// consistent view of the buffer.
pub struct MemoryStore {
    capacity: usize,
    records: RwLock<VecDeque<Arc<MemoryRecord>>>,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a record, evicting the oldest once full.
    pub async fn append(&self, record: MemoryRecord) -> Uuid {
        let record_id = record.record_id;
        let mut records = self.records.write().await;

        while records.len() >= self.capacity {
            if let Some(evicted) = records.pop_front() {
                debug!(record_id = %evicted.record_id, "Evicted oldest memory record");
            }
        }
        records.push_back(Arc::new(record));

        debug!(record_id = %record_id, size = records.len(), "Memory record appended");
        record_id
    }

    /// Up to `n` records, newest first.
    pub async fn recent(&self, n: usize) -> Vec<Arc<MemoryRecord>> {
        let records = self.records.read().await;
        records.iter().rev().take(n).cloned().collect()
    }

    /// Case-insensitive substring match over summaries, patterns and
    /// preferences, newest first.
    pub async fn search(&self, pattern: &str) -> Vec<Arc<MemoryRecord>> {
        let needle = pattern.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }

        let records = self.records.read().await;
        records
            .iter()
            .rev()
            .filter(|r| r.matches(&needle))
            .cloned()
            .collect()
    }

    /// How often each value of a learned pattern was recorded.
    pub async fn pattern_frequency(&self, key: &str) -> BTreeMap<String, usize> {
        let records = self.records.read().await;
        let mut counts = BTreeMap::new();

        for value in records.iter().filter_map(|r| r.learned_patterns.get(key)) {
            *counts.entry(value.clone()).or_insert(0) += 1;
        }

        counts
    }

    /// Most recently recorded value of a company preference.
    pub async fn latest_preference(&self, key: &str) -> Option<String> {
        let records = self.records.read().await;
        records
            .iter()
            .rev()
            .find_map(|r| r.company_preferences.get(key).cloned())
    }

    /// Oldest first.
    pub async fn snapshot(&self) -> Vec<Arc<MemoryRecord>> {
        self.records.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    // =============================
    // Persistence
    // =============================

    pub async fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let snapshot = self.snapshot().await;
        let records: Vec<&MemoryRecord> = snapshot.iter().map(|r| r.as_ref()).collect();
        let json = serde_json::to_vec_pretty(&records)?;

        tokio::fs::write(path.as_ref(), json).await?;
        info!(path = %path.as_ref().display(), count = records.len(), "Memory saved");
        Ok(())
    }

    /// Load a saved store. A missing file yields an empty store; only the
    /// newest `capacity` records are kept.
    pub async fn load_from(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let store = Self::new(capacity);
        let path = path.as_ref();

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No saved memory, starting empty");
                return Ok(store);
            }
            Err(e) => return Err(e.into()),
        };

        let records: Vec<MemoryRecord> = serde_json::from_slice(&bytes)?;
        for record in records {
            store.append(record).await;
        }

        info!(path = %path.display(), count = store.len().await, "Memory loaded");
        Ok(store)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(summary: &str) -> MemoryRecord {
        MemoryRecord::new(summary)
    }

    #[tokio::test]
    async fn test_recent_is_newest_first() {
        let store = MemoryStore::new(10);
        store.append(record("first")).await;
        store.append(record("second")).await;
        store.append(record("third")).await;

        let recent = store.recent(2).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].interaction_summary, "third");
        assert_eq!(recent[1].interaction_summary, "second");
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let store = MemoryStore::new(3);
        for i in 0..5 {
            store.append(record(&format!("run {}", i))).await;
        }

        assert_eq!(store.len().await, 3);
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot[0].interaction_summary, "run 2");
        assert_eq!(snapshot[2].interaction_summary, "run 4");
    }

    #[tokio::test]
    async fn test_search_and_frequency() {
        let store = MemoryStore::new(10);
        store
            .append(record("Quarterly run 2025-Q1").with_pattern("quarterly_status", "at_risk"))
            .await;
        store
            .append(record("Quarterly run 2025-Q2").with_pattern("quarterly_status", "at_risk"))
            .await;
        store
            .append(record("Monthly run 2025-07").with_pattern("monthly_status", "compliant"))
            .await;

        let hits = store.search("QUARTERLY").await;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].interaction_summary, "Quarterly run 2025-Q2");
        assert!(store.search("   ").await.is_empty());

        let freq = store.pattern_frequency("quarterly_status").await;
        assert_eq!(freq.get("at_risk"), Some(&2));
        assert!(store.pattern_frequency("annual_status").await.is_empty());
    }

    #[tokio::test]
    async fn test_latest_preference_wins() {
        let store = MemoryStore::new(10);
        let mut prefs = BTreeMap::new();
        prefs.insert("tone".to_string(), "formal".to_string());
        store.append(record("a").with_preferences(prefs.clone())).await;

        prefs.insert("tone".to_string(), "casual".to_string());
        store.append(record("b").with_preferences(prefs)).await;
        store.append(record("c")).await;

        assert_eq!(store.latest_preference("tone").await.as_deref(), Some("casual"));
        assert_eq!(store.latest_preference("language").await, None);
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_all_kept() {
        let store = Arc::new(MemoryStore::new(100));
        let mut handles = Vec::new();

        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.append(record(&format!("run {}", i))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.len().await, 20);
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");

        let store = MemoryStore::new(10);
        store.append(record("one").with_pattern("k", "v")).await;
        store.append(record("two")).await;
        store.save_to(&path).await.unwrap();

        let loaded = MemoryStore::load_from(&path, 1).await.unwrap();
        assert_eq!(loaded.len().await, 1);
        assert_eq!(loaded.recent(1).await[0].interaction_summary, "two");

        let empty = MemoryStore::load_from(dir.path().join("missing.json"), 10).await.unwrap();
        assert!(empty.is_empty().await);
    }
}
