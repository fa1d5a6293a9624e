// Storage abstraction - the reconciler only needs a handful of key-value
// operations, so it stays independent of the concrete store behind them.

use crate::error::CoreError;
use async_trait::async_trait;
use std::collections::HashMap;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, CoreError>;

/// Abstract key-value store. The method set mirrors the Redis commands the
/// hosted backend speaks (GET/SET, HGETALL/HSET, ZADD/ZRANGE, SADD/SREM).
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a scalar value
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Overwrite a scalar value
    async fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Read every field of a hash; missing key yields an empty map
    async fn get_hash(&self, key: &str) -> StorageResult<HashMap<String, String>>;

    /// Set the given fields of a hash, leaving other fields untouched
    async fn merge_hash(&self, key: &str, fields: &[(String, String)]) -> StorageResult<()>;

    /// Append a member to a sorted series under a numeric score
    async fn append_series(&self, key: &str, score: f64, member: &str) -> StorageResult<()>;

    /// Members with `min <= score <= max`, ascending by score
    async fn range_series(&self, key: &str, min: f64, max: f64) -> StorageResult<Vec<String>>;

    /// The `limit` highest-scored members, newest first
    async fn latest_series(&self, key: &str, limit: usize) -> StorageResult<Vec<String>>;

    /// Insert into a set; returns true when the member was not present before
    async fn insert_set(&self, key: &str, member: &str) -> StorageResult<bool>;

    /// Remove a member from a set; absent members are not an error
    async fn remove_set(&self, key: &str, member: &str) -> StorageResult<()>;
}

/// Store key layout for one mint. Bumping `version` starts every counter
/// from zero while the series under the old names stay readable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    pub mode: String,
    pub summary: String,
    pub ts_price: String,
    pub ts_mcap: String,
    pub ts_fees_cum: String,
    pub ts_donations_cum: String,
    pub donations: String,
    pub last_sig: String,
    pub counted_sigs: String,
}

impl StoreKeys {
    pub fn new(mint: &str, version: &str) -> Self {
        let key = |name: &str| format!("token:{}:{}:{}", name, version, mint);
        Self {
            mode: key("MODE"),
            summary: key("SUMMARY"),
            ts_price: key("TS:PRICE"),
            ts_mcap: key("TS:MCAP"),
            ts_fees_cum: key("TS:FEES_CUM"),
            ts_donations_cum: key("TS:DONATIONS_CUM"),
            donations: key("DONATIONS"),
            last_sig: key("LAST_SIG"),
            counted_sigs: key("COUNTED_SIGS"),
        }
    }
}

/// Unversioned keys of the candle cache
pub mod keys {
    pub const CANDLE_CACHE_DATA: &str = "bitquery_cache:data";
    pub const CANDLE_CACHE_TS: &str = "bitquery_cache:timestamp";
}
