//! Domain records derived from raw events. These are what downstream
//! readers query.

use serde::{Deserialize, Serialize};

use crate::fixed_point::Amount;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub address: String,
    pub manager: String,
    pub host_fee_percent: u64,
    pub pool_fee_percent: u64,
    pub min_multiplier: u64,
    pub max_multiplier: u64,
    pub order_index: String,
}

/// Content-addressed payout table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeConfig {
    pub hash: String,
    pub q: Vec<u128>,
    pub k: Vec<u128>,
    pub extra_data_hash: String,
    pub host_fee_percent: u64,
    pub pool_fee_percent: u64,
    /// First event that registered this table.
    pub order_index: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    Registered,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trial {
    pub trial_id: u64,
    pub pool: String,
    pub user: String,
    pub multiplier: u64,
    pub qk_with_config_hash: String,
    /// Order index of the registering event.
    pub order_index: String,
    pub resolution: Option<TrialResolution>,
}

impl Trial {
    pub fn state(&self) -> TrialState {
        if self.resolution.is_some() {
            TrialState::Resolved
        } else {
            TrialState::Registered
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialResolution {
    pub result_index: u32,
    pub result_k: u128,
    pub delta_amount: Amount,
}

/// Structured payload written onto a resolved game instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameResult {
    pub result_index: u32,
    pub result_k: String,
    pub multiplier: u64,
    pub delta_amount: String,
    pub is_win: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameInstance {
    pub trial_id: u64,
    pub qk_with_config_hash: String,
    pub user: String,
    pub result: Option<GameResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fee {
    pub order_index: String,
    pub trial_id: u64,
    pub pool: String,
    pub fee_amount: u64,
    /// Shares at SCALE; they sum to SCALE.
    pub host_percent: u128,
    pub pool_percent: u128,
    pub host_amount: Amount,
    pub pool_amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserStats {
    pub user: String,
    pub bets: u64,
    pub wins: u64,
    pub losses: u64,
    pub total_wagered: Amount,
    pub total_payout: Amount,
    pub last_trial_id: Option<u64>,
}

impl UserStats {
    pub fn empty(user: &str) -> Self {
        Self {
            user: user.to_string(),
            bets: 0,
            wins: 0,
            losses: 0,
            total_wagered: Amount::ZERO,
            total_payout: Amount::ZERO,
            last_trial_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalStats {
    pub plays: u64,
    pub total_wagered: Amount,
    pub total_payout: Amount,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            plays: 0,
            total_wagered: Amount::ZERO,
            total_payout: Amount::ZERO,
        }
    }
}
