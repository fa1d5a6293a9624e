// Hourly OHLCV candles from BitQuery, cached in the store for one TTL window

use crate::http::HttpClient;
use crate::settings::Settings;
use crate::storage_trait::{keys, KvStore};
use chrono::Utc;
use log::{error, info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

const CANDLE_QUERY: &str = r#"
query ($mint: String!) {
  Solana {
    DEXTradeByTokens(
      where: {Trade: {Currency: {Mint: {is: $mint}}}}
      orderBy: {descending: Block_Time}
      limit: 24
    ) {
      Block {
        Time(interval: {count: 60, unit: minute})
      }
      volume: sum(of: Trade_Amount)
      high: max(of: Trade_Price)
      low: min(of: Trade_Price)
      open: minimum(of: Block_Time, get: Trade_Price)
      close: maximum(of: Block_Time, get: Trade_Price)
    }
  }
}
"#;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candle {
    pub t: String,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CandleReply {
    /// Body to serve, fresh or cached
    Chart(Value),
    /// No API token and nothing cached
    ConfigurationError,
    /// Upstream failed and nothing cached
    UpstreamError(String),
}

pub struct CandleService {
    settings: Arc<Settings>,
    store: Arc<dyn KvStore>,
    http: Arc<dyn HttpClient>,
}

impl CandleService {
    pub fn new(settings: Arc<Settings>, store: Arc<dyn KvStore>, http: Arc<dyn HttpClient>) -> Self {
        Self { settings, store, http }
    }

    async fn cached(&self) -> (Option<Value>, i64) {
        let read = async {
            let ts = self.store.get(keys::CANDLE_CACHE_TS).await?;
            let data = self.store.get(keys::CANDLE_CACHE_DATA).await?;
            Ok::<_, crate::error::CoreError>((data, ts))
        };
        match read.await {
            Ok((data, ts)) => (
                data.and_then(|raw| serde_json::from_str::<Value>(&raw).ok()),
                ts.and_then(|t| t.trim().parse::<i64>().ok()).unwrap_or(0),
            ),
            Err(e) => {
                warn!("Candle cache unreadable: {}", e);
                (None, 0)
            }
        }
    }

    pub async fn chart(&self) -> CandleReply {
        let now = Utc::now().timestamp_millis();
        let (cached, updated_at) = self.cached().await;
        let ttl_ms = (self.settings.candle_cache_ttl_secs as i64).saturating_mul(1000);

        if let Some(body) = &cached {
            if now - updated_at < ttl_ms {
                return CandleReply::Chart(body.clone());
            }
        }

        let Some(token) = self.settings.bitquery_token.as_deref().filter(|t| !t.trim().is_empty()) else {
            error!("Candle refresh needs bitquery_token");
            return match cached {
                Some(stale) => CandleReply::Chart(stale),
                None => CandleReply::ConfigurationError,
            };
        };

        info!("Refreshing candle data");
        let request = json!({ "query": CANDLE_QUERY, "variables": { "mint": self.settings.mint } });
        let response = self
            .http
            .post_json(&self.settings.bitquery_endpoint, Some(token), &request)
            .await;

        let candles = match response {
            Ok(body) if body.get("errors").map(|e| !e.is_null()).unwrap_or(false) => {
                Err(format!("BitQuery errors: {}", body["errors"]))
            }
            Ok(body) => Ok(to_candles(&body)),
            Err(e) => Err(e.to_string()),
        };

        match candles {
            Ok(chart) => {
                let body = json!({ "ok": true, "chart": chart, "updatedAt": now });
                self.save(&body, now).await;
                CandleReply::Chart(body)
            }
            Err(e) => {
                warn!("Candle refresh failed: {}", e);
                match cached {
                    Some(stale) => CandleReply::Chart(stale),
                    None => CandleReply::UpstreamError("API Error".to_string()),
                }
            }
        }
    }

    async fn save(&self, body: &Value, now: i64) {
        if let Err(e) = self.store.set(keys::CANDLE_CACHE_DATA, &body.to_string()).await {
            warn!("Failed to cache candles: {}", e);
            return;
        }
        if let Err(e) = self.store.set(keys::CANDLE_CACHE_TS, &now.to_string()).await {
            warn!("Failed to cache candle timestamp: {}", e);
        }
    }
}

fn number(v: Option<&Value>) -> f64 {
    match v {
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        Some(other) => other.as_f64().unwrap_or(0.0),
        None => 0.0,
    }
}

/// Provider rows come newest first; charts want oldest first.
fn to_candles(body: &Value) -> Vec<Candle> {
    let rows = body
        .pointer("/data/Solana/DEXTradeByTokens")
        .and_then(|r| r.as_array())
        .cloned()
        .unwrap_or_default();
    let mut candles: Vec<Candle> = rows
        .iter()
        .map(|row| Candle {
            t: row
                .pointer("/Block/Time")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
            o: number(row.get("open")),
            h: number(row.get("high")),
            l: number(row.get("low")),
            c: number(row.get("close")),
            v: number(row.get("volume")),
        })
        .collect();
    candles.reverse();
    candles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use crate::testing::StaticHttpClient;

    fn upstream() -> Value {
        json!({"data": {"Solana": {"DEXTradeByTokens": [
            {"Block": {"Time": "2025-01-01T02:00:00Z"}, "open": "2", "high": "3", "low": "1", "close": "2.5", "volume": "10"},
            {"Block": {"Time": "2025-01-01T01:00:00Z"}, "open": 1.0, "high": 2.0, "low": 0.5, "close": 2.0, "volume": 4.0}
        ]}}})
    }

    fn settings(token: Option<&str>) -> Arc<Settings> {
        let mut s = Settings::default();
        s.bitquery_token = token.map(str::to_string);
        Arc::new(s)
    }

    #[tokio::test]
    async fn test_refresh_maps_and_caches() {
        let store = Arc::new(MemoryStore::new());
        let http = Arc::new(StaticHttpClient::with_post(upstream()));
        let svc = CandleService::new(settings(Some("tok")), store.clone(), http.clone());

        let CandleReply::Chart(body) = svc.chart().await else { panic!("expected chart") };
        assert_eq!(body["ok"], json!(true));
        assert_eq!(body["chart"][0]["t"], json!("2025-01-01T01:00:00Z"));
        assert_eq!(body["chart"][1]["c"], json!(2.5));

        // Second call is served from cache.
        svc.chart().await;
        assert_eq!(http.requests().len(), 1);
        assert!(store.get(keys::CANDLE_CACHE_TS).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_cache_served_on_upstream_failure() {
        let store = Arc::new(MemoryStore::new());
        store.set(keys::CANDLE_CACHE_DATA, r#"{"ok":true,"chart":[],"updatedAt":1}"#).await.unwrap();
        store.set(keys::CANDLE_CACHE_TS, "1").await.unwrap();
        let svc = CandleService::new(settings(Some("tok")), store, Arc::new(StaticHttpClient::unreachable()));

        let CandleReply::Chart(body) = svc.chart().await else { panic!("expected stale chart") };
        assert_eq!(body["updatedAt"], json!(1));
    }

    #[tokio::test]
    async fn test_missing_token_without_cache() {
        let svc = CandleService::new(
            settings(None),
            Arc::new(MemoryStore::new()),
            Arc::new(StaticHttpClient::unreachable()),
        );
        assert_eq!(svc.chart().await, CandleReply::ConfigurationError);
    }

    #[tokio::test]
    async fn test_graphql_errors_without_cache() {
        let svc = CandleService::new(
            settings(Some("tok")),
            Arc::new(MemoryStore::new()),
            Arc::new(StaticHttpClient::with_post(json!({"errors": [{"message": "quota"}]}))),
        );
        assert!(matches!(svc.chart().await, CandleReply::UpstreamError(_)));
    }
}
