// In-process store, used when no hosted store is configured and by tests

use crate::storage_trait::{KvStore, StorageResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    scalars: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    // (score bits ordered, insertion seq) -> member
    series: HashMap<String, BTreeMap<(OrderedScore, u64), String>>,
    series_members: HashMap<String, BTreeSet<String>>,
    sets: HashMap<String, HashSet<String>>,
    seq: u64,
}

/// Total order over f64 scores (scores are timestamps, never NaN).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
struct OrderedScore(f64);

impl Eq for OrderedScore {}

impl Ord for OrderedScore {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Volatile `KvStore`; contents are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.tables.read().await.scalars.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.tables.write().await.scalars.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_hash(&self, key: &str) -> StorageResult<HashMap<String, String>> {
        Ok(self.tables.read().await.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn merge_hash(&self, key: &str, fields: &[(String, String)]) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        let hash = tables.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn append_series(&self, key: &str, score: f64, member: &str) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        // Sorted-set semantics: re-adding a member only updates its score.
        let known = tables
            .series_members
            .entry(key.to_string())
            .or_default()
            .contains(member);
        let series = tables.series.entry(key.to_string()).or_default();
        if known {
            series.retain(|_, m| m != member);
        }
        let seq = tables.seq;
        tables.seq += 1;
        tables
            .series
            .entry(key.to_string())
            .or_default()
            .insert((OrderedScore(score), seq), member.to_string());
        tables
            .series_members
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn range_series(&self, key: &str, min: f64, max: f64) -> StorageResult<Vec<String>> {
        let tables = self.tables.read().await;
        Ok(tables
            .series
            .get(key)
            .map(|s| {
                s.iter()
                    .filter(|((score, _), _)| score.0 >= min && score.0 <= max)
                    .map(|(_, m)| m.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn latest_series(&self, key: &str, limit: usize) -> StorageResult<Vec<String>> {
        let tables = self.tables.read().await;
        Ok(tables
            .series
            .get(key)
            .map(|s| s.values().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_set(&self, key: &str, member: &str) -> StorageResult<bool> {
        Ok(self
            .tables
            .write()
            .await
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn remove_set(&self, key: &str, member: &str) -> StorageResult<()> {
        if let Some(set) = self.tables.write().await.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }
}
