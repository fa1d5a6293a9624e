use crate::bonding_curve::fetch_bonding_curve_state;
use crate::error::CoreError;
use crate::models::{BondingCurveState, Mode};
use crate::rpc_client::ChainReader;
use log::warn;

/// What one poll learned about the bonding curve.
#[derive(Debug, Clone, PartialEq)]
pub enum CurveObservation {
    /// Mode is already `raydium`; the curve was not read
    Skipped,
    /// No account, or an account that does not decode as a curve
    Absent,
    /// The read failed; nothing is known this round
    Unknown,
    Present(BondingCurveState),
}

impl CurveObservation {
    /// Read the curve unless the mode is terminal.
    pub async fn observe<C: ChainReader + ?Sized>(
        client: &C,
        current: Mode,
        mint: &str,
        pump_program: &str,
    ) -> Self {
        if current == Mode::Raydium {
            return CurveObservation::Skipped;
        }
        match fetch_bonding_curve_state(client, mint, pump_program).await {
            Ok(Some(state)) => CurveObservation::Present(state),
            Ok(None) => CurveObservation::Absent,
            Err(CoreError::Decode(e)) => {
                warn!("Bonding curve for {} did not decode, treating as absent: {}", mint, e);
                CurveObservation::Absent
            }
            Err(e) => {
                warn!("Bonding curve read failed, keeping mode {}: {}", current, e);
                CurveObservation::Unknown
            }
        }
    }
}

/// Transition function of the lifecycle. `raydium` is absorbing, a complete
/// curve always wins, and below the liquidity threshold the token is treated
/// as not launched.
pub fn next_mode(current: Mode, observation: &CurveObservation, threshold_lamports: u64) -> Mode {
    if current == Mode::Raydium {
        return Mode::Raydium;
    }
    match observation {
        CurveObservation::Skipped | CurveObservation::Unknown => current,
        CurveObservation::Absent => Mode::PreLaunch,
        CurveObservation::Present(state) => {
            if state.complete {
                Mode::Raydium
            } else if state.virtual_sol_reserves < threshold_lamports {
                Mode::PreLaunch
            } else if current == Mode::PreLaunch {
                Mode::PumpSwap
            } else {
                current
            }
        }
    }
}
