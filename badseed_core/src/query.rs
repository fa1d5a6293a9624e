// Read side: reshapes stored state for the frontend. Nothing here returns an
// error to the caller; store problems degrade to defaults.

use crate::bonding_curve::CurveMetrics;
use crate::error::CoreError;
use crate::models::{DonationEvent, Mode, SeriesPoint};
use crate::reconciler::{fields, read_number};
use crate::settings::Settings;
use crate::storage_trait::{KvStore, StoreKeys};
use chrono::Utc;
use log::warn;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

pub const DEFAULT_METRICS_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;
pub const DEFAULT_CLAIMS_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryView {
    pub mint: String,
    pub symbol: String,
    pub name: String,
    pub creator_wallet: String,
    pub donation_wallet: String,
    pub price_sol: f64,
    pub market_cap_sol: f64,
    pub curve_progress: f64,
    pub total_fees_claimed_sol: f64,
    pub total_donated_sol: f64,
    pub pre_launch_donated_sol: f64,
    pub mode: Mode,
    pub last_updated: Option<String>,
    pub debug_price: String,
    pub debug_mcap: String,
    pub debug_progress: String,
    pub supply_total: f64,
    pub supply_community: f64,
    pub supply_dev: f64,
    pub supply_donation: f64,
    pub supply_burn: f64,
    pub recent_activity: Vec<DonationEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsView {
    pub price: Vec<SeriesPoint>,
    pub market_cap: Vec<SeriesPoint>,
    pub fees_claimed_cumulative: Vec<SeriesPoint>,
    pub donations_cumulative: Vec<SeriesPoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClaimsView {
    pub claims: Vec<SeriesPoint>,
}

pub struct QueryService {
    settings: Arc<Settings>,
    store: Arc<dyn KvStore>,
    keys: StoreKeys,
}

impl QueryService {
    pub fn new(settings: Arc<Settings>, store: Arc<dyn KvStore>) -> Self {
        let keys = StoreKeys::new(&settings.mint, &settings.key_version);
        Self { settings, store, keys }
    }

    pub async fn summary(&self) -> SummaryView {
        match self.try_summary().await {
            Ok(view) => view,
            Err(e) => {
                warn!("Summary unavailable, serving pre-launch fallback: {}", e);
                self.fallback_summary()
            }
        }
    }

    async fn try_summary(&self) -> Result<SummaryView, CoreError> {
        let stored = self.store.get_hash(&self.keys.summary).await?;
        let mode = match self.store.get(&self.keys.mode).await? {
            Some(raw) => raw.parse::<Mode>().ok(),
            None => None,
        }
        .or_else(|| stored.get(fields::MODE).and_then(|m| m.parse::<Mode>().ok()))
        .unwrap_or(Mode::PreLaunch);

        let text = |name: &str| stored.get(name).filter(|v| !v.is_empty()).cloned();
        let mut view = SummaryView {
            mode,
            price_sol: read_number(&stored, fields::PRICE_SOL),
            market_cap_sol: read_number(&stored, fields::MARKET_CAP_SOL),
            curve_progress: read_number(&stored, fields::CURVE_PROGRESS),
            total_fees_claimed_sol: read_number(&stored, fields::TOTAL_FEES_CLAIMED_SOL),
            total_donated_sol: read_number(&stored, fields::TOTAL_DONATED_SOL),
            pre_launch_donated_sol: read_number(&stored, fields::PRE_LAUNCH_DONATED_SOL),
            last_updated: text(fields::LAST_UPDATED),
            debug_price: text(fields::DEBUG_PRICE).unwrap_or_default(),
            debug_mcap: text(fields::DEBUG_MCAP).unwrap_or_default(),
            debug_progress: text(fields::DEBUG_PROGRESS).unwrap_or_default(),
            supply_total: stored
                .get(fields::SUPPLY_TOTAL)
                .map(|_| read_number(&stored, fields::SUPPLY_TOTAL))
                .unwrap_or(self.settings.initial_total_supply_tokens),
            supply_community: read_number(&stored, fields::SUPPLY_COMMUNITY),
            supply_dev: read_number(&stored, fields::SUPPLY_DEV),
            supply_donation: read_number(&stored, fields::SUPPLY_DONATION),
            supply_burn: read_number(&stored, fields::SUPPLY_BURN),
            recent_activity: self.recent_activity().await,
            ..self.identity()
        };

        if view.mode == Mode::PreLaunch {
            let boot = CurveMetrics::bootstrap(self.settings.initial_sale_supply_tokens);
            if view.price_sol == 0.0 {
                view.price_sol = boot.price_sol;
                view.debug_price = boot.debug_price;
            }
            if view.market_cap_sol == 0.0 {
                view.market_cap_sol = boot.market_cap_sol;
                view.debug_mcap = boot.debug_mcap;
            }
            if view.debug_progress.is_empty() {
                view.debug_progress = boot.debug_progress;
            }
        }
        Ok(view)
    }

    /// Token identity with every figure at its bootstrap value.
    fn identity(&self) -> SummaryView {
        let boot = CurveMetrics::bootstrap(self.settings.initial_sale_supply_tokens);
        SummaryView {
            mint: self.settings.mint.clone(),
            symbol: self.settings.symbol.clone(),
            name: self.settings.name.clone(),
            creator_wallet: self.settings.creator_wallet.clone(),
            donation_wallet: self.settings.donation_wallet.clone(),
            price_sol: boot.price_sol,
            market_cap_sol: boot.market_cap_sol,
            curve_progress: 0.0,
            total_fees_claimed_sol: 0.0,
            total_donated_sol: 0.0,
            pre_launch_donated_sol: 0.0,
            mode: Mode::PreLaunch,
            last_updated: None,
            debug_price: boot.debug_price,
            debug_mcap: boot.debug_mcap,
            debug_progress: boot.debug_progress,
            supply_total: self.settings.initial_total_supply_tokens,
            supply_community: 0.0,
            supply_dev: 0.0,
            supply_donation: 0.0,
            supply_burn: 0.0,
            recent_activity: Vec::new(),
        }
    }

    pub fn fallback_summary(&self) -> SummaryView {
        self.identity()
    }

    /// Newest donation events first.
    pub async fn recent_activity(&self) -> Vec<DonationEvent> {
        match self
            .store
            .latest_series(&self.keys.donations, self.settings.recent_activity_limit)
            .await
        {
            Ok(raw) => raw
                .iter()
                .filter_map(|member| serde_json::from_str::<DonationEvent>(member).ok())
                .collect(),
            Err(e) => {
                warn!("Donation events unavailable: {}", e);
                Vec::new()
            }
        }
    }

    /// All four series within `[from, to]` (epoch ms), defaulting to the last 24 hours.
    pub async fn metrics(&self, from: Option<i64>, to: Option<i64>) -> MetricsView {
        let now = Utc::now().timestamp_millis();
        let to = to.unwrap_or(now);
        let from = from.unwrap_or(to - DEFAULT_METRICS_WINDOW_MS);

        let (price, market_cap, fees, donations) = tokio::join!(
            self.series(&self.keys.ts_price, from, to),
            self.series(&self.keys.ts_mcap, from, to),
            self.series(&self.keys.ts_fees_cum, from, to),
            self.series(&self.keys.ts_donations_cum, from, to),
        );
        MetricsView {
            price,
            market_cap,
            fees_claimed_cumulative: fees,
            donations_cumulative: donations,
        }
    }

    async fn series(&self, key: &str, from: i64, to: i64) -> Vec<SeriesPoint> {
        match self.store.range_series(key, from as f64, to as f64).await {
            Ok(raw) => raw.iter().filter_map(|m| parse_point(m)).collect(),
            Err(e) => {
                warn!("Series {} unavailable: {}", key, e);
                Vec::new()
            }
        }
    }

    /// Newest cumulative-fee snapshots first.
    pub async fn claims(&self, limit: Option<usize>) -> ClaimsView {
        let limit = limit.unwrap_or(DEFAULT_CLAIMS_LIMIT);
        match self.store.latest_series(&self.keys.ts_fees_cum, limit).await {
            Ok(raw) => ClaimsView { claims: raw.iter().filter_map(|m| parse_point(m)).collect() },
            Err(e) => {
                warn!("Claims unavailable: {}", e);
                ClaimsView::default()
            }
        }
    }
}

/// Series members are `{t, value}`; older deployments wrote the value under
/// `price_sol`, `market_cap_sol` or `amount_sol`.
fn parse_point(member: &str) -> Option<SeriesPoint> {
    let v: Value = serde_json::from_str(member).ok()?;
    let t = v.get("t").and_then(|t| t.as_i64().or_else(|| t.as_f64().map(|f| f as i64)))?;
    let value = ["value", "price_sol", "market_cap_sol", "amount_sol"]
        .iter()
        .find_map(|name| v.get(*name).and_then(Value::as_f64))?;
    Some(SeriesPoint { t, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use crate::models::InflowSource;
    use crate::storage_trait::StorageResult;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct DownStore;

    #[async_trait]
    impl KvStore for DownStore {
        async fn get(&self, _key: &str) -> StorageResult<Option<String>> {
            Err(CoreError::Store("down".into()))
        }
        async fn set(&self, _key: &str, _value: &str) -> StorageResult<()> {
            Err(CoreError::Store("down".into()))
        }
        async fn get_hash(&self, _key: &str) -> StorageResult<HashMap<String, String>> {
            Err(CoreError::Store("down".into()))
        }
        async fn merge_hash(&self, _key: &str, _fields: &[(String, String)]) -> StorageResult<()> {
            Err(CoreError::Store("down".into()))
        }
        async fn append_series(&self, _key: &str, _score: f64, _member: &str) -> StorageResult<()> {
            Err(CoreError::Store("down".into()))
        }
        async fn range_series(&self, _key: &str, _min: f64, _max: f64) -> StorageResult<Vec<String>> {
            Err(CoreError::Store("down".into()))
        }
        async fn latest_series(&self, _key: &str, _limit: usize) -> StorageResult<Vec<String>> {
            Err(CoreError::Store("down".into()))
        }
        async fn insert_set(&self, _key: &str, _member: &str) -> StorageResult<bool> {
            Err(CoreError::Store("down".into()))
        }
        async fn remove_set(&self, _key: &str, _member: &str) -> StorageResult<()> {
            Err(CoreError::Store("down".into()))
        }
    }

    fn service(store: Arc<dyn KvStore>) -> QueryService {
        QueryService::new(Arc::new(Settings::default()), store)
    }

    #[tokio::test]
    async fn test_cold_store_serves_bootstrap() {
        let q = service(Arc::new(MemoryStore::new()));
        let s = q.summary().await;
        assert_eq!(s.mode, Mode::PreLaunch);
        assert!((s.market_cap_sol - 27.96).abs() < 0.01);
        assert_eq!(s.debug_price, "vSol (30.00) / vTokens (1073.0M)");
        assert_eq!(s.total_donated_sol, 0.0);
        assert_eq!(s.last_updated, None);
    }

    #[tokio::test]
    async fn test_store_down_serves_fallback() {
        let q = service(Arc::new(DownStore));
        let s = q.summary().await;
        assert_eq!(s, q.fallback_summary());
        assert_eq!(q.metrics(None, None).await, MetricsView::default());
        assert!(q.claims(None).await.claims.is_empty());
    }

    #[tokio::test]
    async fn test_stored_values_win_outside_prelaunch() {
        let store = Arc::new(MemoryStore::new());
        let q = service(store.clone());
        let keys = StoreKeys::new(&q.settings.mint, &q.settings.key_version);
        store.set(&keys.mode, "pumpswap").await.unwrap();
        store
            .merge_hash(
                &keys.summary,
                &[
                    ("price_sol".into(), "0".into()),
                    ("total_donated_sol".into(), "3.5".into()),
                    ("last_updated".into(), "2025-01-01T00:00:00+00:00".into()),
                ],
            )
            .await
            .unwrap();
        let s = q.summary().await;
        assert_eq!(s.mode, Mode::PumpSwap);
        assert_eq!(s.price_sol, 0.0);
        assert_eq!(s.total_donated_sol, 3.5);
        assert_eq!(s.last_updated.as_deref(), Some("2025-01-01T00:00:00+00:00"));
    }

    #[tokio::test]
    async fn test_recent_activity_newest_first() {
        let store = Arc::new(MemoryStore::new());
        let q = service(store.clone());
        let keys = StoreKeys::new(&q.settings.mint, &q.settings.key_version);
        for i in 0..12i64 {
            let event = DonationEvent {
                tx: Some(format!("sig{}", i)),
                amount_sol: 0.1,
                t: 1_000 + i,
                source: InflowSource::Scan,
            };
            store
                .append_series(&keys.donations, event.t as f64, &serde_json::to_string(&event).unwrap())
                .await
                .unwrap();
        }
        let activity = q.summary().await.recent_activity;
        assert_eq!(activity.len(), 10);
        assert_eq!(activity[0].tx.as_deref(), Some("sig11"));
        assert_eq!(activity[9].tx.as_deref(), Some("sig2"));
    }

    #[tokio::test]
    async fn test_metrics_range_and_claims_order() {
        let store = Arc::new(MemoryStore::new());
        let q = service(store.clone());
        let keys = StoreKeys::new(&q.settings.mint, &q.settings.key_version);
        for t in [100i64, 200, 300] {
            let point = serde_json::to_string(&SeriesPoint { t, value: t as f64 / 100.0 }).unwrap();
            store.append_series(&keys.ts_fees_cum, t as f64, &point).await.unwrap();
            store.append_series(&keys.ts_price, t as f64, &point).await.unwrap();
        }
        // legacy member shape
        store
            .append_series(&keys.ts_mcap, 150.0, r#"{"t":150,"market_cap_sol":42.0}"#)
            .await
            .unwrap();

        let m = q.metrics(Some(150), Some(300)).await;
        assert_eq!(m.price.iter().map(|p| p.t).collect::<Vec<_>>(), vec![200, 300]);
        assert_eq!(m.market_cap, vec![SeriesPoint { t: 150, value: 42.0 }]);
        assert!(m.donations_cumulative.is_empty());

        let claims = q.claims(Some(2)).await.claims;
        assert_eq!(claims.iter().map(|p| p.t).collect::<Vec<_>>(), vec![300, 200]);
    }
}
