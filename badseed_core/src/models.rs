use borsh::BorshDeserialize;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

pub const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;
/// Pump tokens carry 6 decimals.
pub const TOKEN_BASE_UNITS: f64 = 1_000_000.0;

pub fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL
}

pub fn base_units_to_tokens(amount: u64) -> f64 {
    amount as f64 / TOKEN_BASE_UNITS
}

/// Bonding Curve State for pump.fun tokens. Field order is the on-chain
/// layout after the 8-byte account discriminator.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, BorshDeserialize)]
pub struct BondingCurveState {
    pub virtual_token_reserves: u64,
    pub virtual_sol_reserves: u64,
    pub real_token_reserves: u64,
    pub real_sol_reserves: u64,
    pub token_total_supply: u64,
    pub complete: bool,
}

impl BondingCurveState {
    pub fn virtual_sol(&self) -> f64 {
        lamports_to_sol(self.virtual_sol_reserves)
    }

    pub fn virtual_tokens(&self) -> f64 {
        base_units_to_tokens(self.virtual_token_reserves)
    }

    pub fn total_supply_tokens(&self) -> f64 {
        base_units_to_tokens(self.token_total_supply)
    }
}

/// Lifecycle stage of the token. Transitions only move forward into `Raydium`,
/// which is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    PreLaunch,
    #[serde(rename = "pumpswap")]
    PumpSwap,
    Raydium,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::PreLaunch => "pre-launch",
            Mode::PumpSwap => "pumpswap",
            Mode::Raydium => "raydium",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pre-launch" => Ok(Mode::PreLaunch),
            "pumpswap" => Ok(Mode::PumpSwap),
            "raydium" => Ok(Mode::Raydium),
            other => Err(CoreError::ParseError(format!("Unknown mode: {}", other))),
        }
    }
}

/// One entry of a time series; `t` is epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub t: i64,
    pub value: f64,
}

/// Where a counted inflow was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InflowSource {
    AutoForward,
    Scan,
    Webhook,
}

/// Entry of the donation event log backing `recent_activity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonationEvent {
    pub tx: Option<String>,
    pub amount_sol: f64,
    pub t: i64,
    pub source: InflowSource,
}

/// Last processed signature of the donation wallet history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub signature: String,
    #[serde(default)]
    pub slot: u64,
}

impl Cursor {
    /// Accepts both the JSON form and a bare signature written by older deployments.
    pub fn parse(raw: &str) -> Cursor {
        serde_json::from_str(raw).unwrap_or_else(|_| Cursor {
            signature: raw.trim().trim_matches('"').to_string(),
            slot: 0,
        })
    }

    /// A cursor never moves to an older slot.
    pub fn may_replace(&self, current: Option<&Cursor>) -> bool {
        match current {
            None => true,
            Some(existing) => self.slot >= existing.slot,
        }
    }
}

/// Entry of `getSignaturesForAddress`, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureInfo {
    pub signature: String,
    pub slot: u64,
    pub failed: bool,
}

/// Normalized SOL credit to a watched account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundTransfer {
    pub to_account: String,
    pub lamports: u64,
    pub signature: String,
}
