// Pump.fun bonding curve: account location, decoding and derived metrics

use crate::error::CoreError;
use crate::models::{base_units_to_tokens, lamports_to_sol, BondingCurveState};
use crate::rpc_client::{ChainReader, RpcResult};
use borsh::BorshDeserialize;
use log::debug;
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;

/// Anchor account discriminator length
const DISCRIMINATOR_LEN: usize = 8;
/// Five u64 fields and one bool
const STATE_LEN: usize = 5 * 8 + 1;

/// Virtual reserves of a freshly created curve.
pub const BOOTSTRAP_VIRTUAL_SOL: f64 = 30.0;
pub const BOOTSTRAP_VIRTUAL_TOKENS: f64 = 1_073_000_000.0;
pub const BOOTSTRAP_TOTAL_SUPPLY: f64 = 1_000_000_000.0;

/// Derive the bonding curve PDA for `mint` under the pump.fun program.
pub fn bonding_curve_address(mint: &str, pump_program: &str) -> Result<Pubkey, CoreError> {
    let mint_pk = Pubkey::from_str(mint)
        .map_err(|e| CoreError::ParseError(format!("Invalid mint: {}", e)))?;
    let program_pk = Pubkey::from_str(pump_program)
        .map_err(|e| CoreError::ParseError(format!("Invalid program id: {}", e)))?;
    let (pda, _) = Pubkey::find_program_address(&[b"bonding-curve", mint_pk.as_ref()], &program_pk);
    Ok(pda)
}

/// Decode raw account bytes. Trailing fields added by later program versions are ignored.
pub fn decode_bonding_curve(data: &[u8]) -> Result<BondingCurveState, CoreError> {
    if data.len() < DISCRIMINATOR_LEN + STATE_LEN {
        return Err(CoreError::Decode(format!(
            "bonding curve account too short: {} bytes",
            data.len()
        )));
    }
    BondingCurveState::deserialize(&mut &data[DISCRIMINATOR_LEN..])
        .map_err(|e| CoreError::Decode(format!("bonding curve layout: {}", e)))
}

/// Fetch and decode the curve. `Ok(None)` when the account does not exist;
/// undecodable data surfaces as `CoreError::Decode`.
pub async fn fetch_bonding_curve_state<C: ChainReader + ?Sized>(
    client: &C,
    mint: &str,
    pump_program: &str,
) -> RpcResult<Option<BondingCurveState>> {
    let address = bonding_curve_address(mint, pump_program)?;
    debug!("Fetching bonding curve {} for mint {}", address, mint);
    match client.get_account_data(&address.to_string()).await? {
        Some(data) => decode_bonding_curve(&data).map(Some),
        None => Ok(None),
    }
}

/// Price in SOL per whole token; zero when the curve holds no virtual tokens.
pub fn calculate_price_from_bonding_curve(state: &BondingCurveState) -> f64 {
    if state.virtual_token_reserves == 0 {
        return 0.0;
    }
    state.virtual_sol() / state.virtual_tokens()
}

/// Share of the sale supply already sold, from the tokens left on the curve.
pub fn calculate_curve_progress(state: &BondingCurveState, initial_sale_supply: f64) -> f64 {
    let left_to_sell = base_units_to_tokens(state.real_token_reserves);
    let pct = 100.0 - (left_to_sell * 100.0 / initial_sale_supply);
    pct.clamp(0.0, 100.0)
}

pub fn calculate_market_cap(state: &BondingCurveState) -> f64 {
    calculate_price_from_bonding_curve(state) * state.total_supply_tokens()
}

/// Price, market cap and progress as written to the summary, with the
/// human-readable breakdown shown next to each figure.
#[derive(Debug, Clone, PartialEq)]
pub struct CurveMetrics {
    pub price_sol: f64,
    pub market_cap_sol: f64,
    pub curve_progress: f64,
    pub debug_price: String,
    pub debug_mcap: String,
    pub debug_progress: String,
}

impl CurveMetrics {
    pub fn from_state(state: &BondingCurveState, initial_sale_supply: f64) -> Self {
        let price = calculate_price_from_bonding_curve(state);
        let mcap = calculate_market_cap(state);
        let progress = if state.complete {
            100.0
        } else {
            calculate_curve_progress(state, initial_sale_supply)
        };
        let sold = (initial_sale_supply - base_units_to_tokens(state.real_token_reserves)).max(0.0);
        Self {
            price_sol: price,
            market_cap_sol: mcap,
            curve_progress: progress,
            debug_price: format!(
                "vSol ({:.2}) / vTokens ({:.1}M)",
                lamports_to_sol(state.virtual_sol_reserves),
                state.virtual_tokens() / 1e6
            ),
            debug_mcap: format!("Price * Supply ({:.1} SOL)", mcap),
            debug_progress: format!(
                "Sold ({:.1}M) / Target ({:.1}M)",
                sold / 1e6,
                initial_sale_supply / 1e6
            ),
        }
    }

    /// Figures for a curve that does not exist yet.
    pub fn bootstrap(initial_sale_supply: f64) -> Self {
        let price = bootstrap_price();
        let mcap = bootstrap_market_cap();
        Self {
            price_sol: price,
            market_cap_sol: mcap,
            curve_progress: 0.0,
            debug_price: format!(
                "vSol ({:.2}) / vTokens ({:.1}M)",
                BOOTSTRAP_VIRTUAL_SOL,
                BOOTSTRAP_VIRTUAL_TOKENS / 1e6
            ),
            debug_mcap: format!("Price * Supply ({:.1} SOL)", mcap),
            debug_progress: format!("Sold (0.0M) / Target ({:.1}M)", initial_sale_supply / 1e6),
        }
    }

    /// Post-migration figures from an external price.
    pub fn raydium(price_sol: f64, market_cap_sol: f64) -> Self {
        Self {
            price_sol,
            market_cap_sol,
            curve_progress: 100.0,
            debug_price: "Raydium Pool Live".to_string(),
            debug_mcap: format!("Price * Supply ({:.1} SOL)", market_cap_sol),
            debug_progress: "Bonding Complete".to_string(),
        }
    }
}

pub fn bootstrap_price() -> f64 {
    BOOTSTRAP_VIRTUAL_SOL / BOOTSTRAP_VIRTUAL_TOKENS
}

pub fn bootstrap_market_cap() -> f64 {
    bootstrap_price() * BOOTSTRAP_TOTAL_SUPPLY
}
