// State reconciler: keeps the stored summary, mode and series in line with the chain

use crate::bonding_curve::{bonding_curve_address, CurveMetrics};
use crate::error::CoreError;
use crate::models::{
    base_units_to_tokens, lamports_to_sol, Cursor, DonationEvent, InboundTransfer, InflowSource, Mode,
    SeriesPoint, TOKEN_BASE_UNITS,
};
use crate::price_source::PriceSource;
use crate::rpc_client::ChainReader;
use crate::settings::Settings;
use crate::state_machine::{next_mode, CurveObservation};
use crate::storage_trait::{KvStore, StoreKeys};
use crate::tx_parser::{balance_delta, is_failed};
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use std::collections::HashMap;
use std::sync::Arc;

/// Token accounts sent here are burned for good.
pub const INCINERATOR: &str = "1nc1nerator11111111111111111111111111111111";

pub mod fields {
    pub const MINT: &str = "mint";
    pub const SYMBOL: &str = "symbol";
    pub const NAME: &str = "name";
    pub const PRICE_SOL: &str = "price_sol";
    pub const MARKET_CAP_SOL: &str = "market_cap_sol";
    pub const CURVE_PROGRESS: &str = "curve_progress";
    pub const TOTAL_FEES_CLAIMED_SOL: &str = "total_fees_claimed_sol";
    pub const TOTAL_DONATED_SOL: &str = "total_donated_sol";
    pub const PRE_LAUNCH_DONATED_SOL: &str = "pre_launch_donated_sol";
    pub const MODE: &str = "mode";
    pub const LAST_UPDATED: &str = "last_updated";
    pub const DEBUG_PRICE: &str = "debug_price";
    pub const DEBUG_MCAP: &str = "debug_mcap";
    pub const DEBUG_PROGRESS: &str = "debug_progress";
    pub const SUPPLY_TOTAL: &str = "supply_total";
    pub const SUPPLY_COMMUNITY: &str = "supply_community";
    pub const SUPPLY_DEV: &str = "supply_dev";
    pub const SUPPLY_DONATION: &str = "supply_donation";
    pub const SUPPLY_BURN: &str = "supply_burn";
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollOutcome {
    pub mode: Mode,
    pub price_sol: f64,
    pub market_cap_sol: f64,
    pub curve_progress: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepOutcome {
    #[serde(rename = "forwarded")]
    pub forwarded_sol: f64,
    #[serde(rename = "sig")]
    pub signature: Option<String>,
    #[serde(rename = "detected")]
    pub detected_sol: f64,
    #[serde(rename = "total_new_detected")]
    pub total_new_sol: f64,
    #[serde(rename = "total_donated")]
    pub total_donated_sol: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestOutcome {
    #[serde(rename = "detected")]
    pub detected_sol: f64,
}

/// Counters and mode as read at the start of an accounting run.
#[derive(Debug, Clone, PartialEq)]
struct Baseline {
    mode: Mode,
    fees_sol: f64,
    donated_sol: f64,
    pre_launch_sol: f64,
}

/// One inflow that passed the dedup check.
#[derive(Debug, Clone)]
struct CountedInflow {
    signature: String,
    lamports: u64,
    source: InflowSource,
}

/// Auto-forward that went through. `recorded` is false when its claim in
/// the counted set could not be written yet.
#[derive(Debug, Clone)]
struct Forward {
    inflow: CountedInflow,
    recorded: bool,
}

/// Result of walking the donation wallet history.
#[derive(Debug, Default)]
struct ScanResult {
    counted: Vec<CountedInflow>,
    newest: Option<Cursor>,
}

pub struct Reconciler {
    settings: Arc<Settings>,
    chain: Arc<dyn ChainReader>,
    store: Arc<dyn KvStore>,
    prices: Arc<dyn PriceSource>,
    creator: Option<Arc<Keypair>>,
    keys: StoreKeys,
}

impl Reconciler {
    pub fn new(
        settings: Arc<Settings>,
        chain: Arc<dyn ChainReader>,
        store: Arc<dyn KvStore>,
        prices: Arc<dyn PriceSource>,
        creator: Option<Arc<Keypair>>,
    ) -> Self {
        let keys = StoreKeys::new(&settings.mint, &settings.key_version);
        Self { settings, chain, store, prices, creator, keys }
    }

    pub fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    /// Stored mode; `None` when missing or unreadable as a mode.
    async fn stored_mode(&self) -> Result<Option<Mode>, CoreError> {
        Ok(self.store.get(&self.keys.mode).await?.and_then(|raw| {
            raw.parse::<Mode>()
                .map_err(|e| warn!("Ignoring stored mode: {}", e))
                .ok()
        }))
    }

    async fn read_mode(&self) -> Result<Mode, CoreError> {
        Ok(self.stored_mode().await?.unwrap_or(Mode::PreLaunch))
    }

    async fn read_baseline(&self) -> Result<Baseline, CoreError> {
        let mode = self.read_mode().await?;
        let summary = self.store.get_hash(&self.keys.summary).await?;
        Ok(Baseline {
            mode,
            fees_sol: read_number(&summary, fields::TOTAL_FEES_CLAIMED_SOL),
            donated_sol: read_number(&summary, fields::TOTAL_DONATED_SOL),
            pre_launch_sol: read_number(&summary, fields::PRE_LAUNCH_DONATED_SOL),
        })
    }

    async fn read_cursor(&self) -> Result<Option<Cursor>, CoreError> {
        Ok(self
            .store
            .get(&self.keys.last_sig)
            .await?
            .map(|raw| Cursor::parse(&raw))
            .filter(|c| !c.signature.is_empty()))
    }

    /// Move the cursor forward; older candidates are dropped.
    async fn advance_cursor(&self, candidate: Cursor) {
        let current = match self.read_cursor().await {
            Ok(c) => c,
            Err(e) => {
                warn!("Cursor unreadable, not advancing: {}", e);
                return;
            }
        };
        if current.as_ref() == Some(&candidate) {
            return;
        }
        if !candidate.may_replace(current.as_ref()) {
            debug!("Cursor {} older than stored one, keeping stored", candidate.signature);
            return;
        }
        match serde_json::to_string(&candidate) {
            Ok(raw) => {
                if let Err(e) = self.store.set(&self.keys.last_sig, &raw).await {
                    error!("Failed to store cursor: {}", e);
                }
            }
            Err(e) => error!("Failed to encode cursor: {}", e),
        }
    }

    async fn append_point<T: Serialize>(&self, key: &str, t: i64, member: &T) {
        let result = match serde_json::to_string(member) {
            Ok(raw) => self.store.append_series(key, t as f64, &raw).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            error!("Failed to append to {}: {}", key, e);
        }
    }

    // ---------------------------------------------------------------------
    // Poll
    // ---------------------------------------------------------------------

    /// One price/mode run. Writes the mode first when it changed or was never
    /// stored, then the summary fields it owns and one price and market cap point.
    pub async fn poll(&self) -> Result<PollOutcome, CoreError> {
        let stored = self.stored_mode().await?;
        let current = stored.unwrap_or(Mode::PreLaunch);
        let observation = CurveObservation::observe(
            self.chain.as_ref(),
            current,
            &self.settings.mint,
            &self.settings.pump_fun_program,
        )
        .await;
        let mode = next_mode(current, &observation, self.settings.prelaunch_threshold_lamports());

        if stored != Some(mode) {
            match stored {
                Some(_) => info!("Mode transition {} -> {}", current, mode),
                None => info!("Recording initial mode {}", mode),
            }
            self.store.set(&self.keys.mode, mode.as_str()).await?;
        }

        let metrics = match &observation {
            CurveObservation::Skipped => self.raydium_metrics().await?,
            CurveObservation::Absent => CurveMetrics::bootstrap(self.settings.initial_sale_supply_tokens),
            CurveObservation::Present(state) => {
                CurveMetrics::from_state(state, self.settings.initial_sale_supply_tokens)
            }
            CurveObservation::Unknown => {
                // Nothing new was learned; report what is stored and write nothing.
                let summary = self.store.get_hash(&self.keys.summary).await?;
                return Ok(PollOutcome {
                    mode,
                    price_sol: read_number(&summary, fields::PRICE_SOL),
                    market_cap_sol: read_number(&summary, fields::MARKET_CAP_SOL),
                    curve_progress: read_number(&summary, fields::CURVE_PROGRESS),
                });
            }
        };

        let now = Utc::now();
        let mut update = vec![
            field(fields::MINT, &self.settings.mint),
            field(fields::SYMBOL, &self.settings.symbol),
            field(fields::NAME, &self.settings.name),
            field(fields::PRICE_SOL, metrics.price_sol),
            field(fields::MARKET_CAP_SOL, metrics.market_cap_sol),
            field(fields::CURVE_PROGRESS, metrics.curve_progress),
            field(fields::MODE, mode),
            field(fields::LAST_UPDATED, now.to_rfc3339()),
            field(fields::DEBUG_PRICE, &metrics.debug_price),
            field(fields::DEBUG_MCAP, &metrics.debug_mcap),
            field(fields::DEBUG_PROGRESS, &metrics.debug_progress),
        ];
        match self.supply_breakdown().await {
            Ok(supply) => update.extend(supply),
            Err(e) => warn!("Supply breakdown unavailable, keeping stored values: {}", e),
        }
        self.store.merge_hash(&self.keys.summary, &update).await?;

        let t = now.timestamp_millis();
        self.append_point(&self.keys.ts_price, t, &SeriesPoint { t, value: metrics.price_sol }).await;
        self.append_point(&self.keys.ts_mcap, t, &SeriesPoint { t, value: metrics.market_cap_sol }).await;

        debug!(
            "Poll done: mode={} price={} mcap={} progress={}",
            mode, metrics.price_sol, metrics.market_cap_sol, metrics.curve_progress
        );
        Ok(PollOutcome {
            mode,
            price_sol: metrics.price_sol,
            market_cap_sol: metrics.market_cap_sol,
            curve_progress: metrics.curve_progress,
        })
    }

    /// Post-migration price from the external feed; the stored price is
    /// kept when the feed has nothing.
    async fn raydium_metrics(&self) -> Result<CurveMetrics, CoreError> {
        match self.prices.price_in_sol(&self.settings.mint).await {
            Ok(Some(price)) => Ok(CurveMetrics::raydium(
                price,
                price * self.settings.initial_total_supply_tokens,
            )),
            outcome => {
                match outcome {
                    Err(e) => warn!("External price unavailable, keeping stored price: {}", e),
                    _ => warn!("External price feed has no quote, keeping stored price"),
                }
                let summary = self.store.get_hash(&self.keys.summary).await?;
                Ok(CurveMetrics::raydium(
                    read_number(&summary, fields::PRICE_SOL),
                    read_number(&summary, fields::MARKET_CAP_SOL),
                ))
            }
        }
    }

    async fn supply_breakdown(&self) -> Result<Vec<(String, String)>, CoreError> {
        let mint = &self.settings.mint;
        let curve = bonding_curve_address(mint, &self.settings.pump_fun_program)?.to_string();

        let live = self.chain.get_token_supply(mint).await?;
        let dev = self.chain.get_token_balance(&self.settings.creator_wallet, mint).await?;
        let donation = self.chain.get_token_balance(&self.settings.donation_wallet, mint).await?;
        let on_curve = self.chain.get_token_balance(&curve, mint).await?;
        let incinerated = self.chain.get_token_balance(INCINERATOR, mint).await?;

        let total = base_units_to_tokens(live);
        let initial = self.settings.initial_total_supply_tokens;
        let burn = (initial - total).max(0.0) + base_units_to_tokens(incinerated);
        let community_units = live
            .saturating_sub(dev)
            .saturating_sub(donation)
            .saturating_sub(on_curve)
            .saturating_sub(incinerated);

        Ok(vec![
            field(fields::SUPPLY_TOTAL, total),
            field(fields::SUPPLY_COMMUNITY, community_units as f64 / TOKEN_BASE_UNITS),
            field(fields::SUPPLY_DEV, base_units_to_tokens(dev)),
            field(fields::SUPPLY_DONATION, base_units_to_tokens(donation)),
            field(fields::SUPPLY_BURN, burn),
        ])
    }

    // ---------------------------------------------------------------------
    // Sweep
    // ---------------------------------------------------------------------

    /// One accounting run: rescan the donation wallet, forward creator SOL,
    /// add everything new to the counters, then advance the cursor. Claims on
    /// counted signatures are given back when the counters cannot be written.
    pub async fn sweep(&self) -> Result<SweepOutcome, CoreError> {
        let baseline = match self.read_baseline().await {
            Ok(b) => b,
            Err(e) => {
                warn!("Summary unreadable, skipping sweep: {}", e);
                return Ok(SweepOutcome::default());
            }
        };

        let scan = match self.scan_donations().await {
            Ok(scan) => scan,
            Err(e) => {
                warn!("Donation scan failed, counting nothing from history this run: {}", e);
                ScanResult::default()
            }
        };
        let mut counted = scan.counted;
        let detected_lamports: u64 = counted.iter().map(|c| c.lamports).sum();

        let forwarded = self.forward_creator_balance().await;
        let forwarded_lamports = forwarded.as_ref().map(|f| f.inflow.lamports).unwrap_or(0);
        let signature = forwarded.as_ref().map(|f| f.inflow.signature.clone());
        let unrecorded_forward = forwarded
            .as_ref()
            .filter(|f| !f.recorded)
            .map(|f| f.inflow.signature.clone());
        counted.extend(forwarded.map(|f| f.inflow));

        let total_new = detected_lamports + forwarded_lamports;
        let totals = match self
            .apply_totals(&baseline, total_new, forwarded_lamports, &counted)
            .await
        {
            Ok(totals) => totals,
            Err(e) => {
                // A forward released here comes back as a scanned inflow.
                error!("Failed to record sweep totals, releasing {} claims: {}", counted.len(), e);
                self.release_counted(&counted).await;
                return Err(e);
            }
        };

        if let Some(signature) = unrecorded_forward {
            if let Err(e) = self.mark_counted(&signature).await {
                error!("Forward {} counted but not recorded, a rescan will see it again: {}", signature, e);
            }
        }
        if let Some(newest) = scan.newest {
            self.advance_cursor(newest).await;
        }

        Ok(SweepOutcome {
            forwarded_sol: lamports_to_sol(forwarded_lamports),
            signature,
            detected_sol: lamports_to_sol(detected_lamports),
            total_new_sol: lamports_to_sol(total_new),
            total_donated_sol: totals.donated_sol,
        })
    }

    /// Walk new signatures of the donation wallet. All transactions are
    /// fetched before anything is marked counted, so a failed fetch leaves
    /// no half-recorded state behind.
    async fn scan_donations(&self) -> Result<ScanResult, CoreError> {
        let cursor = self.read_cursor().await?;
        if cursor.is_none() {
            info!("No cursor stored, scanning full history (limit {})", self.settings.signature_scan_limit);
        }
        let signatures = self
            .chain
            .get_signatures_for_address(
                &self.settings.donation_wallet,
                cursor.as_ref().map(|c| c.signature.as_str()),
                self.settings.signature_scan_limit,
            )
            .await?;
        let newest = signatures.first().map(|s| Cursor { signature: s.signature.clone(), slot: s.slot });

        let mut candidates = Vec::new();
        for info in signatures.iter().filter(|s| !s.failed) {
            let Some(tx) = self.chain.get_transaction(&info.signature).await? else {
                warn!("Transaction {} not found, skipping", info.signature);
                continue;
            };
            if is_failed(&tx) {
                continue;
            }
            let Some(delta) = balance_delta(&tx, &self.settings.donation_wallet) else {
                continue;
            };
            if delta <= 0 {
                continue;
            }
            if !self.settings.count_third_party_donations {
                let from_creator = balance_delta(&tx, &self.settings.creator_wallet)
                    .map(|d| d < 0)
                    .unwrap_or(false);
                if !from_creator {
                    debug!("Skipping third-party inflow {}", info.signature);
                    continue;
                }
            }
            candidates.push((info.signature.clone(), delta as u64));
        }

        let mut counted = Vec::new();
        for (signature, lamports) in candidates {
            match self.mark_counted(&signature).await {
                Ok(true) => {
                    info!("Scanner found +{} SOL in {}", lamports_to_sol(lamports), signature);
                    counted.push(CountedInflow { signature, lamports, source: InflowSource::Scan });
                }
                Ok(false) => {}
                Err(e) => {
                    self.release_counted(&counted).await;
                    return Err(e);
                }
            }
        }
        Ok(ScanResult { counted, newest })
    }

    /// Claim `signature` in the counted set; true when nobody had before.
    async fn mark_counted(&self, signature: &str) -> Result<bool, CoreError> {
        let fresh = self.store.insert_set(&self.keys.counted_sigs, signature).await?;
        if !fresh {
            debug!("{} already counted", signature);
        }
        Ok(fresh)
    }

    /// Give claims back so a later run can count these inflows.
    async fn release_counted(&self, inflows: &[CountedInflow]) {
        for inflow in inflows {
            if let Err(e) = self.store.remove_set(&self.keys.counted_sigs, &inflow.signature).await {
                error!("Could not release claim on {}, it stays uncounted: {}", inflow.signature, e);
            }
        }
    }

    async fn forward_creator_balance(&self) -> Option<Forward> {
        let creator = self.creator.as_ref()?;
        let from = creator.pubkey().to_string();
        let balance = match self.chain.get_balance(&from).await {
            Ok(b) => b,
            Err(e) => {
                warn!("Creator balance unavailable, not forwarding: {}", e);
                return None;
            }
        };
        let buffer = self.settings.min_buffer_lamports();
        if balance <= buffer {
            debug!("Creator balance {} within buffer, nothing to forward", balance);
            return None;
        }
        let lamports = balance - buffer;
        match self
            .chain
            .transfer_lamports(creator, &self.settings.donation_wallet, lamports)
            .await
        {
            Ok(signature) => {
                info!("Forwarded {} SOL to donation wallet: {}", lamports_to_sol(lamports), signature);
                // The transfer happened; it counts whether or not the claim sticks.
                let recorded = match self.mark_counted(&signature).await {
                    Ok(fresh) => {
                        if !fresh {
                            warn!("Forward {} was already in the counted set", signature);
                        }
                        true
                    }
                    Err(e) => {
                        warn!("Could not record forward {} yet: {}", signature, e);
                        false
                    }
                };
                Some(Forward {
                    inflow: CountedInflow { signature, lamports, source: InflowSource::AutoForward },
                    recorded,
                })
            }
            Err(e) => {
                warn!("Forward transfer failed: {}", e);
                None
            }
        }
    }

    /// Add new inflows to the counters and append events and cumulative points.
    async fn apply_totals(
        &self,
        baseline: &Baseline,
        new_lamports: u64,
        fee_lamports: u64,
        inflows: &[CountedInflow],
    ) -> Result<Baseline, CoreError> {
        let new_sol = lamports_to_sol(new_lamports);
        let fee_sol = lamports_to_sol(fee_lamports);
        let totals = Baseline {
            mode: baseline.mode,
            fees_sol: baseline.fees_sol + fee_sol,
            donated_sol: baseline.donated_sol + new_sol,
            pre_launch_sol: if baseline.mode == Mode::PreLaunch {
                baseline.pre_launch_sol + new_sol
            } else {
                baseline.pre_launch_sol
            },
        };

        let now = Utc::now();
        self.store
            .merge_hash(
                &self.keys.summary,
                &[
                    field(fields::TOTAL_FEES_CLAIMED_SOL, totals.fees_sol),
                    field(fields::TOTAL_DONATED_SOL, totals.donated_sol),
                    field(fields::PRE_LAUNCH_DONATED_SOL, totals.pre_launch_sol),
                    field(fields::LAST_UPDATED, now.to_rfc3339()),
                ],
            )
            .await?;

        let t = now.timestamp_millis();
        for inflow in inflows {
            let event = DonationEvent {
                tx: Some(inflow.signature.clone()),
                amount_sol: lamports_to_sol(inflow.lamports),
                t,
                source: inflow.source,
            };
            self.append_point(&self.keys.donations, t, &event).await;
        }
        self.append_point(&self.keys.ts_fees_cum, t, &SeriesPoint { t, value: totals.fees_sol }).await;
        self.append_point(&self.keys.ts_donations_cum, t, &SeriesPoint { t, value: totals.donated_sol })
            .await;
        Ok(totals)
    }

    // ---------------------------------------------------------------------
    // Webhook batches
    // ---------------------------------------------------------------------

    /// Count pushed inflows to the donation wallet. `last` is the final
    /// signature of the batch and its slot, when the provider sent one.
    pub async fn ingest(
        &self,
        transfers: Vec<InboundTransfer>,
        last: Option<(String, Option<u64>)>,
    ) -> Result<IngestOutcome, CoreError> {
        let mut counted = Vec::new();
        for transfer in transfers {
            if transfer.to_account != self.settings.donation_wallet || transfer.lamports == 0 {
                continue;
            }
            match self.mark_counted(&transfer.signature).await {
                Ok(true) => {
                    info!(
                        "Webhook detected +{} SOL in {}",
                        lamports_to_sol(transfer.lamports),
                        transfer.signature
                    );
                    counted.push(CountedInflow {
                        signature: transfer.signature,
                        lamports: transfer.lamports,
                        source: InflowSource::Webhook,
                    });
                }
                Ok(false) => {}
                Err(e) => {
                    self.release_counted(&counted).await;
                    return Err(e);
                }
            }
        }

        if !counted.is_empty() {
            let detected: u64 = counted.iter().map(|c| c.lamports).sum();
            let recorded = match self.read_baseline().await {
                Ok(baseline) => self.apply_totals(&baseline, detected, 0, &counted).await,
                Err(e) => Err(e),
            };
            if let Err(e) = recorded {
                error!("Failed to record webhook totals, releasing {} claims: {}", counted.len(), e);
                self.release_counted(&counted).await;
                return Err(e);
            }
        }

        if let Some((signature, slot)) = last {
            match slot {
                Some(slot) => self.advance_cursor(Cursor { signature, slot }).await,
                None => match self.read_cursor().await {
                    Ok(None) => self.advance_cursor(Cursor { signature, slot: 0 }).await,
                    Ok(Some(_)) => debug!("Batch without slot, keeping stored cursor"),
                    Err(e) => warn!("Cursor unreadable: {}", e),
                },
            }
        }

        Ok(IngestOutcome {
            detected_sol: lamports_to_sol(counted.iter().map(|c| c.lamports).sum()),
        })
    }
}

fn field(name: &str, value: impl ToString) -> (String, String) {
    (name.to_string(), value.to_string())
}

/// Numeric summary field; missing or garbled values read as zero.
pub fn read_number(summary: &HashMap<String, String>, name: &str) -> f64 {
    summary
        .get(name)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BondingCurveState;
    use crate::testing::{transfer_tx, FaultyStore, MockChain, StaticPriceSource};
    use serde_json::json;

    const THIRD_PARTY: &str = "Fan1111111111111111111111111111111111111111";

    struct Harness {
        settings: Arc<Settings>,
        chain: Arc<MockChain>,
        store: Arc<FaultyStore>,
        reconciler: Reconciler,
    }

    fn harness_with(settings: Settings, price: StaticPriceSource, creator: Option<Keypair>) -> Harness {
        let settings = Arc::new(settings);
        let chain = Arc::new(MockChain::new());
        let store = Arc::new(FaultyStore::new());
        let reconciler = Reconciler::new(
            settings.clone(),
            chain.clone(),
            store.clone(),
            Arc::new(price),
            creator.map(Arc::new),
        );
        Harness { settings, chain, store, reconciler }
    }

    fn harness() -> Harness {
        harness_with(Settings::default(), StaticPriceSource::new(None), None)
    }

    fn curve(v_sol: u64, real_tokens: u64, complete: bool) -> BondingCurveState {
        BondingCurveState {
            virtual_token_reserves: 1_000_000_000_000_000,
            virtual_sol_reserves: v_sol,
            real_token_reserves: real_tokens,
            real_sol_reserves: 0,
            token_total_supply: 1_000_000_000_000_000,
            complete,
        }
    }

    impl Harness {
        fn set_curve(&self, state: &BondingCurveState) {
            self.chain.set_curve(&self.settings.mint, &self.settings.pump_fun_program, state);
        }

        async fn summary(&self) -> HashMap<String, String> {
            self.store.get_hash(&self.reconciler.keys().summary).await.unwrap()
        }

        async fn stored_mode(&self) -> Option<String> {
            self.store.get(&self.reconciler.keys().mode).await.unwrap()
        }

        fn donate(&self, signature: &str, from: &str, lamports: u64) {
            let donation = self.settings.donation_wallet.clone();
            let slot = self.chain.state().slot + 1;
            self.chain.push_transaction(
                &[&donation],
                signature,
                transfer_tx(signature, slot, from, &donation, lamports),
            );
        }
    }

    #[tokio::test]
    async fn test_poll_without_curve_is_prelaunch_bootstrap() {
        let h = harness();
        let out = h.reconciler.poll().await.unwrap();
        assert_eq!(out.mode, Mode::PreLaunch);
        assert!((out.market_cap_sol - 27.96).abs() < 0.01);
        assert_eq!(out.curve_progress, 0.0);
        assert_eq!(h.stored_mode().await.as_deref(), Some("pre-launch"));

        let summary = h.summary().await;
        assert_eq!(summary.get("mode").map(String::as_str), Some("pre-launch"));
        assert_eq!(summary.get("symbol").map(String::as_str), Some("BADSEED"));
        assert!(!summary.contains_key(fields::TOTAL_DONATED_SOL));
    }

    #[tokio::test]
    async fn test_poll_launches_above_threshold_and_latches_raydium() {
        let h = harness_with(Settings::default(), StaticPriceSource::new(Some(5e-7)), None);

        h.set_curve(&curve(40_000_000_000, 396_550_000_000_000, false));
        let out = h.reconciler.poll().await.unwrap();
        assert_eq!(out.mode, Mode::PumpSwap);
        assert!((out.curve_progress - 50.0).abs() < 1e-9);
        assert_eq!(h.stored_mode().await.as_deref(), Some("pumpswap"));

        h.set_curve(&curve(85_000_000_000, 0, true));
        let out = h.reconciler.poll().await.unwrap();
        assert_eq!(out.mode, Mode::Raydium);
        assert_eq!(out.curve_progress, 100.0);

        // Once raydium the curve is ignored, even if it looks pre-launch again.
        h.set_curve(&curve(1_000, 700_000_000_000_000, false));
        let out = h.reconciler.poll().await.unwrap();
        assert_eq!(out.mode, Mode::Raydium);
        assert_eq!(out.price_sol, 5e-7);
        assert!((out.market_cap_sol - 500.0).abs() < 1e-9);
        assert_eq!(h.stored_mode().await.as_deref(), Some("raydium"));
    }

    #[tokio::test]
    async fn test_poll_rpc_failure_keeps_mode_and_metrics() {
        let h = harness();
        h.set_curve(&curve(40_000_000_000, 396_550_000_000_000, false));
        let first = h.reconciler.poll().await.unwrap();

        h.chain.set_fail_reads(true);
        let second = h.reconciler.poll().await.unwrap();
        assert_eq!(second.mode, Mode::PumpSwap);
        assert_eq!(second.price_sol, first.price_sol);
        assert_eq!(h.stored_mode().await.as_deref(), Some("pumpswap"));
    }

    #[tokio::test]
    async fn test_poll_undecodable_curve_is_prelaunch() {
        let h = harness();
        h.store.set(&h.reconciler.keys().mode, "pumpswap").await.unwrap();
        h.chain.set_raw_curve(&h.settings.mint, &h.settings.pump_fun_program, vec![1, 2, 3]);
        let out = h.reconciler.poll().await.unwrap();
        assert_eq!(out.mode, Mode::PreLaunch);
        assert_eq!(h.stored_mode().await.as_deref(), Some("pre-launch"));
    }

    #[tokio::test]
    async fn test_poll_never_touches_counters() {
        let h = harness();
        h.store
            .merge_hash(
                &h.reconciler.keys().summary,
                &[field(fields::TOTAL_DONATED_SOL, 12.5), field(fields::TOTAL_FEES_CLAIMED_SOL, 2.0)],
            )
            .await
            .unwrap();
        h.reconciler.poll().await.unwrap();
        let summary = h.summary().await;
        assert_eq!(read_number(&summary, fields::TOTAL_DONATED_SOL), 12.5);
        assert_eq!(read_number(&summary, fields::TOTAL_FEES_CLAIMED_SOL), 2.0);
    }

    #[tokio::test]
    async fn test_poll_supply_breakdown() {
        let h = harness();
        let s = &h.settings;
        let curve_pda = bonding_curve_address(&s.mint, &s.pump_fun_program).unwrap().to_string();
        h.chain.set_token_supply(&s.mint, 990_000_000_000_000);
        h.chain.set_token_balance(&s.creator_wallet, &s.mint, 50_000_000_000_000);
        h.chain.set_token_balance(&s.donation_wallet, &s.mint, 20_000_000_000_000);
        h.chain.set_token_balance(&curve_pda, &s.mint, 600_000_000_000_000);
        h.chain.set_token_balance(INCINERATOR, &s.mint, 5_000_000_000_000);
        h.reconciler.poll().await.unwrap();

        let summary = h.summary().await;
        assert_eq!(read_number(&summary, fields::SUPPLY_TOTAL), 990_000_000.0);
        assert_eq!(read_number(&summary, fields::SUPPLY_DEV), 50_000_000.0);
        assert_eq!(read_number(&summary, fields::SUPPLY_DONATION), 20_000_000.0);
        assert_eq!(read_number(&summary, fields::SUPPLY_BURN), 15_000_000.0);
        assert_eq!(read_number(&summary, fields::SUPPLY_COMMUNITY), 315_000_000.0);
    }

    #[tokio::test]
    async fn test_sweep_counts_scan_once_and_advances_cursor() {
        let h = harness();
        h.donate("sig1", THIRD_PARTY, 1_000_000_000);
        h.donate("sig2", &h.settings.creator_wallet.clone(), 500_000_000);

        let out = h.reconciler.sweep().await.unwrap();
        assert!((out.detected_sol - 1.5).abs() < 1e-9);
        assert_eq!(out.forwarded_sol, 0.0);
        assert!((out.total_donated_sol - 1.5).abs() < 1e-9);

        let cursor = Cursor::parse(&h.store.get(&h.reconciler.keys().last_sig).await.unwrap().unwrap());
        assert_eq!(cursor.signature, "sig2");

        // Nothing new on the second run.
        let out = h.reconciler.sweep().await.unwrap();
        assert_eq!(out.detected_sol, 0.0);
        let summary = h.summary().await;
        assert!((read_number(&summary, fields::TOTAL_DONATED_SOL) - 1.5).abs() < 1e-9);
        assert!((read_number(&summary, fields::PRE_LAUNCH_DONATED_SOL) - 1.5).abs() < 1e-9);
        assert_eq!(read_number(&summary, fields::TOTAL_FEES_CLAIMED_SOL), 0.0);
    }

    #[tokio::test]
    async fn test_sweep_rescan_without_cursor_does_not_double_count() {
        let h = harness();
        h.donate("sig1", THIRD_PARTY, 1_000_000_000);
        h.reconciler.sweep().await.unwrap();

        // Losing the cursor forces a rescan of the same history.
        h.store.set(&h.reconciler.keys().last_sig, "").await.unwrap();
        let out = h.reconciler.sweep().await.unwrap();
        assert_eq!(out.detected_sol, 0.0);
        assert!((out.total_donated_sol - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_sweep_strict_mode_ignores_third_party() {
        let mut settings = Settings::default();
        settings.count_third_party_donations = false;
        let h = harness_with(settings, StaticPriceSource::new(None), None);
        h.donate("fan", THIRD_PARTY, 1_000_000_000);
        h.donate("dev", &h.settings.creator_wallet.clone(), 250_000_000);

        let out = h.reconciler.sweep().await.unwrap();
        assert!((out.detected_sol - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_sweep_forwards_and_next_scan_skips_own_transfer() {
        let creator = Keypair::new();
        let creator_address = creator.pubkey().to_string();
        let h = harness_with(Settings::default(), StaticPriceSource::new(None), Some(creator));
        h.store.set(&h.reconciler.keys().mode, "pumpswap").await.unwrap();
        h.chain.set_balance(&creator_address, 2_010_000_000);

        let out = h.reconciler.sweep().await.unwrap();
        assert!((out.forwarded_sol - 2.0).abs() < 1e-9);
        assert_eq!(out.signature.as_deref(), Some("forward-1"));
        assert_eq!(
            h.chain.sent(),
            vec![(creator_address.clone(), h.settings.donation_wallet.clone(), 2_000_000_000)]
        );

        // The forward now shows up in the donation wallet history.
        let out = h.reconciler.sweep().await.unwrap();
        assert_eq!(out.detected_sol, 0.0);
        assert_eq!(out.forwarded_sol, 0.0);

        let summary = h.summary().await;
        assert!((read_number(&summary, fields::TOTAL_DONATED_SOL) - 2.0).abs() < 1e-9);
        assert!((read_number(&summary, fields::TOTAL_FEES_CLAIMED_SOL) - 2.0).abs() < 1e-9);
        // Not pre-launch at the start of the sweep.
        assert_eq!(read_number(&summary, fields::PRE_LAUNCH_DONATED_SOL), 0.0);

        let events = h.store.latest_series(&h.reconciler.keys().donations, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].contains("auto_forward"));
    }

    #[tokio::test]
    async fn test_sweep_failed_forward_counts_nothing() {
        let creator = Keypair::new();
        let creator_address = creator.pubkey().to_string();
        let h = harness_with(Settings::default(), StaticPriceSource::new(None), Some(creator));
        h.chain.set_balance(&creator_address, 5_000_000_000);
        h.chain.set_fail_transfers(true);

        let out = h.reconciler.sweep().await.unwrap();
        assert_eq!(out.forwarded_sol, 0.0);
        assert_eq!(out.signature, None);
        assert_eq!(out.total_donated_sol, 0.0);
    }

    #[tokio::test]
    async fn test_sweep_rpc_failure_keeps_cursor_and_totals() {
        let h = harness();
        h.donate("sig1", THIRD_PARTY, 1_000_000_000);
        h.reconciler.sweep().await.unwrap();
        h.donate("sig2", THIRD_PARTY, 1_000_000_000);

        h.chain.set_fail_reads(true);
        let out = h.reconciler.sweep().await.unwrap();
        assert_eq!(out.detected_sol, 0.0);
        assert!((out.total_donated_sol - 1.0).abs() < 1e-9);
        let cursor = Cursor::parse(&h.store.get(&h.reconciler.keys().last_sig).await.unwrap().unwrap());
        assert_eq!(cursor.signature, "sig1");

        // Recovered RPC picks the missed inflow up.
        h.chain.set_fail_reads(false);
        let out = h.reconciler.sweep().await.unwrap();
        assert!((out.detected_sol - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_sweep_skips_failed_transactions() {
        let h = harness();
        let donation = h.settings.donation_wallet.clone();
        let mut tx = transfer_tx("bad", 1, THIRD_PARTY, &donation, 1_000_000_000);
        tx["meta"]["err"] = json!({"InstructionError": [0, "Custom"]});
        h.chain.push_transaction(&[&donation], "bad", tx);

        let out = h.reconciler.sweep().await.unwrap();
        assert_eq!(out.detected_sol, 0.0);
    }

    #[tokio::test]
    async fn test_ingest_is_idempotent_and_shared_with_scan() {
        let h = harness();
        let donation = h.settings.donation_wallet.clone();
        let batch = vec![InboundTransfer {
            to_account: donation.clone(),
            lamports: 700_000_000,
            signature: "pushed".to_string(),
        }];

        let out = h.reconciler.ingest(batch.clone(), Some(("pushed".to_string(), Some(5)))).await.unwrap();
        assert!((out.detected_sol - 0.7).abs() < 1e-9);
        let out = h.reconciler.ingest(batch, Some(("pushed".to_string(), Some(5)))).await.unwrap();
        assert_eq!(out.detected_sol, 0.0);

        // The scan sees the same transaction later and does not add it again.
        h.donate("pushed", THIRD_PARTY, 700_000_000);
        h.store.set(&h.reconciler.keys().last_sig, "").await.unwrap();
        let out = h.reconciler.sweep().await.unwrap();
        assert_eq!(out.detected_sol, 0.0);
        assert!((out.total_donated_sol - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_ingest_cursor_slot_guard() {
        let h = harness();
        let key = h.reconciler.keys().last_sig.clone();

        h.reconciler.ingest(vec![], Some(("newer".to_string(), Some(100)))).await.unwrap();
        h.reconciler.ingest(vec![], Some(("older".to_string(), Some(90)))).await.unwrap();
        h.reconciler.ingest(vec![], Some(("unslotted".to_string(), None))).await.unwrap();
        let cursor = Cursor::parse(&h.store.get(&key).await.unwrap().unwrap());
        assert_eq!(cursor, Cursor { signature: "newer".to_string(), slot: 100 });
    }

    #[tokio::test]
    async fn test_ingest_ignores_other_recipients() {
        let h = harness();
        let batch = vec![InboundTransfer {
            to_account: THIRD_PARTY.to_string(),
            lamports: 1_000_000_000,
            signature: "elsewhere".to_string(),
        }];
        let out = h.reconciler.ingest(batch, None).await.unwrap();
        assert_eq!(out.detected_sol, 0.0);
        assert!(h.summary().await.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_totals_write_failure_keeps_inflow_countable() {
        let h = harness();
        h.donate("sig1", THIRD_PARTY, 1_000_000_000);
        h.store.fail_merge_hash(1);

        assert!(h.reconciler.sweep().await.is_err());
        assert_eq!(h.store.get(&h.reconciler.keys().last_sig).await.unwrap(), None);

        let out = h.reconciler.sweep().await.unwrap();
        assert!((out.detected_sol - 1.0).abs() < 1e-9);
        let summary = h.summary().await;
        assert!((read_number(&summary, fields::TOTAL_DONATED_SOL) - 1.0).abs() < 1e-9);
        let cursor = Cursor::parse(&h.store.get(&h.reconciler.keys().last_sig).await.unwrap().unwrap());
        assert_eq!(cursor.signature, "sig1");
    }

    #[tokio::test]
    async fn test_sweep_set_failure_during_scan_counts_nothing_yet() {
        let h = harness();
        h.donate("sig1", THIRD_PARTY, 1_000_000_000);
        h.donate("sig2", THIRD_PARTY, 2_000_000_000);
        h.store.fail_insert_set(1);

        let out = h.reconciler.sweep().await.unwrap();
        assert_eq!(out.detected_sol, 0.0);
        assert_eq!(h.store.get(&h.reconciler.keys().last_sig).await.unwrap(), None);

        let out = h.reconciler.sweep().await.unwrap();
        assert!((out.detected_sol - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_forward_counts_as_fees_when_claim_write_fails() {
        let creator = Keypair::new();
        let creator_address = creator.pubkey().to_string();
        let h = harness_with(Settings::default(), StaticPriceSource::new(None), Some(creator));
        h.chain.set_balance(&creator_address, 2_010_000_000);
        h.store.fail_insert_set(1);

        let out = h.reconciler.sweep().await.unwrap();
        assert!((out.forwarded_sol - 2.0).abs() < 1e-9);

        // The claim is written after the totals, so the rescan skips it.
        let out = h.reconciler.sweep().await.unwrap();
        assert_eq!(out.detected_sol, 0.0);

        let summary = h.summary().await;
        assert!((read_number(&summary, fields::TOTAL_DONATED_SOL) - 2.0).abs() < 1e-9);
        assert!((read_number(&summary, fields::TOTAL_FEES_CLAIMED_SOL) - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_ingest_totals_write_failure_releases_claims() {
        let h = harness();
        let batch = vec![InboundTransfer {
            to_account: h.settings.donation_wallet.clone(),
            lamports: 700_000_000,
            signature: "pushed".to_string(),
        }];
        h.store.fail_merge_hash(1);

        assert!(h.reconciler.ingest(batch.clone(), Some(("pushed".to_string(), Some(5)))).await.is_err());
        assert_eq!(h.store.get(&h.reconciler.keys().last_sig).await.unwrap(), None);

        let out = h.reconciler.ingest(batch, Some(("pushed".to_string(), Some(5)))).await.unwrap();
        assert!((out.detected_sol - 0.7).abs() < 1e-9);
        let summary = h.summary().await;
        assert!((read_number(&summary, fields::TOTAL_DONATED_SOL) - 0.7).abs() < 1e-9);
    }
}
