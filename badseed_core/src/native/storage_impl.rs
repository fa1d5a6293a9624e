// Upstash Redis REST backend for the KvStore trait

use crate::error::CoreError;
use crate::storage_trait::{KvStore, StorageResult};
use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Sends each Redis command as a JSON array (`["HSET", key, field, value]`)
/// to the REST endpoint and reads `{"result": ...}` or `{"error": ...}` back.
pub struct UpstashStore {
    client: Client,
    url: String,
    token: String,
}

impl UpstashStore {
    pub fn new(url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Result<Self, CoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::Init(format!("Failed to build store client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    async fn command(&self, args: Vec<Value>) -> StorageResult<Value> {
        let name = args.first().and_then(|a| a.as_str()).unwrap_or("?").to_string();
        debug!("Store command {}", name);
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&args)
            .send()
            .await
            .map_err(|e| CoreError::Store(format!("{} request failed: {}", name, e)))?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| CoreError::Store(format!("{} response unreadable ({}): {}", name, status, e)))?;
        parse_reply(&name, body)
    }
}

fn parse_reply(command: &str, body: Value) -> StorageResult<Value> {
    if let Some(err) = body.get("error") {
        return Err(CoreError::Store(format!("{} rejected: {}", command, err)));
    }
    body.get("result")
        .cloned()
        .ok_or_else(|| CoreError::Store(format!("{} reply without result", command)))
}

fn string_list(command: &str, value: Value) -> StorageResult<Vec<String>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                Value::Null => Err(CoreError::Store(format!("{} returned null member", command))),
                other => Ok(other.to_string()),
            })
            .collect(),
        other => Err(CoreError::Store(format!("{} returned {}", command, other))),
    }
}

/// HGETALL replies with a flat `[field, value, field, value, ...]` array.
fn pairs_to_map(flat: Vec<String>) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(flat.len() / 2);
    let mut iter = flat.into_iter();
    while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
        map.insert(field, value);
    }
    map
}

#[async_trait]
impl KvStore for UpstashStore {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        match self.command(vec![json!("GET"), json!(key)]).await? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            other => Ok(Some(other.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.command(vec![json!("SET"), json!(key), json!(value)]).await?;
        Ok(())
    }

    async fn get_hash(&self, key: &str) -> StorageResult<HashMap<String, String>> {
        let reply = self.command(vec![json!("HGETALL"), json!(key)]).await?;
        Ok(pairs_to_map(string_list("HGETALL", reply)?))
    }

    async fn merge_hash(&self, key: &str, fields: &[(String, String)]) -> StorageResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut args = vec![json!("HSET"), json!(key)];
        for (field, value) in fields {
            args.push(json!(field));
            args.push(json!(value));
        }
        self.command(args).await?;
        Ok(())
    }

    async fn append_series(&self, key: &str, score: f64, member: &str) -> StorageResult<()> {
        self.command(vec![json!("ZADD"), json!(key), json!(score), json!(member)]).await?;
        Ok(())
    }

    async fn range_series(&self, key: &str, min: f64, max: f64) -> StorageResult<Vec<String>> {
        let reply = self
            .command(vec![json!("ZRANGE"), json!(key), json!(min), json!(max), json!("BYSCORE")])
            .await?;
        string_list("ZRANGE", reply)
    }

    async fn latest_series(&self, key: &str, limit: usize) -> StorageResult<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let reply = self
            .command(vec![json!("ZRANGE"), json!(key), json!(0), json!(limit - 1), json!("REV")])
            .await?;
        string_list("ZRANGE", reply)
    }

    async fn insert_set(&self, key: &str, member: &str) -> StorageResult<bool> {
        let reply = self.command(vec![json!("SADD"), json!(key), json!(member)]).await?;
        reply
            .as_i64()
            .map(|added| added > 0)
            .ok_or_else(|| CoreError::Store(format!("SADD returned {}", reply)))
    }

    async fn remove_set(&self, key: &str, member: &str) -> StorageResult<()> {
        self.command(vec![json!("SREM"), json!(key), json!(member)]).await?;
        Ok(())
    }
}
