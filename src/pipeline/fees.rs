//! Host/pool split of a charged fee.

use std::fmt;

use crate::error::PipelineResult;
use crate::fixed_point::{apply_share, Amount, SCALE};
use crate::model::Pool;

/// How a charged fee is divided between host and pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeeSplitPolicy {
    /// Half to the host, half to the pool, whatever the pool registered.
    #[default]
    Even,
    /// Proportional to the pool's registered host/pool fee percentages.
    PoolSchedule,
}

impl FeeSplitPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "even" => Some(FeeSplitPolicy::Even),
            "pool" | "pool_schedule" => Some(FeeSplitPolicy::PoolSchedule),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeeSplitPolicy::Even => "even",
            FeeSplitPolicy::PoolSchedule => "pool",
        }
    }

    pub fn needs_pool(&self) -> bool {
        matches!(self, FeeSplitPolicy::PoolSchedule)
    }

    /// `(host_share, pool_share)` at SCALE; always sums to SCALE.
    pub fn shares(&self, pool: Option<&Pool>) -> (u128, u128) {
        let even = (SCALE / 2, SCALE - SCALE / 2);
        match (self, pool) {
            (FeeSplitPolicy::PoolSchedule, Some(pool)) => {
                let host = pool.host_fee_percent as u128;
                let total = host + pool.pool_fee_percent as u128;
                if total == 0 {
                    return even;
                }
                let host_share = host * SCALE / total;
                (host_share, SCALE - host_share)
            }
            _ => even,
        }
    }
}

impl fmt::Display for FeeSplitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host gets `fee * host_share / SCALE` (truncated), the pool gets the rest.
pub fn split_fee(fee_amount: u64, host_share: u128) -> PipelineResult<(Amount, Amount)> {
    let host = apply_share(fee_amount, host_share)?;
    Ok((host, Amount::from(fee_amount) - host))
}
