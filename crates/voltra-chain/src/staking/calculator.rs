//! Pure calculators for staking rewards, penalties, free-transaction
//! limits and governance power.
//!
//! All of these are consensus-critical: the floating-point algebra,
//! including where each `floor` sits, must stay exactly as written or
//! nodes will disagree on reward amounts.

use crate::amount::Amount;
use crate::chainparams::ChainParams;
use crate::rewards::get_staking_reward_for_height;
use crate::staking::entry::StakeEntry;
use crate::staking::params::BLOCKS_PER_YEAR;
use crate::staking::params::GP_TO_STAKING_COEFFICIENT;
use crate::staking::params::MIN_STAKING_AMOUNT;
use crate::staking::params::NUM_STAKING_PERIODS;
use crate::staking::params::STAKING_EARLY_WITHDRAWAL_PENALTY_PERCENTAGE;
use crate::staking::params::STAKING_POOL_EXPIRY_BLOCKS;
use crate::staking::stakes_db::StakesDbCache;

/// Staking reward and penalty arithmetic.
pub struct StakingRewardsCalculator;

impl StakingRewardsCalculator {
    /// Reward paid to one stake for one block, given the global reward
    /// coefficient.
    ///
    /// The inner `floor` happens before the division by blocks-per-year;
    /// the truncation order is consensus-critical.
    pub fn block_reward_for_stake(
        params: &ChainParams,
        global_reward_coefficient: f64,
        stake: &StakeEntry,
    ) -> Amount {
        let percentage = params.staking_reward_percentage[stake.period_idx() as usize];
        let yearly = (global_reward_coefficient * percentage / 100.0 * stake.amount() as f64).floor();
        (yearly / BLOCKS_PER_YEAR as f64) as Amount
    }

    /// Amount forfeited when a stake is withdrawn before completion.
    pub fn penalty_for_stake(stake: &StakeEntry) -> Amount {
        (STAKING_EARLY_WITHDRAWAL_PENALTY_PERCENTAGE * stake.amount() as f64 / 100.0).floor()
            as Amount
    }

    /// The global coefficient scaling every stake's reward so the pool is
    /// never overdrawn.
    ///
    /// Going backward (reorg) the pool balance has already been debited
    /// for this block, so the pre-deduction payout is recovered with a
    /// different algebraic formula; using the forward formula there would
    /// drift the coefficient by one block.
    pub fn global_reward_coefficient(
        params: &ChainParams,
        stakes: &StakesDbCache,
        height: u32,
        going_backward: bool,
    ) -> f64 {
        let balance = stakes.staking_pool().balance();
        let staking_reward = get_staking_reward_for_height(height);
        let max_possible_payout = if going_backward {
            ((balance + STAKING_POOL_EXPIRY_BLOCKS as Amount * staking_reward) as f64
                / (STAKING_POOL_EXPIRY_BLOCKS - 1) as f64)
                .floor()
        } else {
            (balance as f64 / STAKING_POOL_EXPIRY_BLOCKS as f64).floor() + staking_reward as f64
        };

        let total_staked_by_period = stakes.get_amounts_by_periods();
        let mut max_potential_payout = 0.0;
        for i in 0..NUM_STAKING_PERIODS {
            max_potential_payout += params.staking_reward_percentage[i] / 100.0
                * total_staked_by_period[i] as f64
                / BLOCKS_PER_YEAR as f64;
        }
        max_potential_payout = max_potential_payout.floor();
        (max_possible_payout / max_potential_payout).min(1.0)
    }
}

/// Free-transaction byte allowance arithmetic.
pub struct FreeTxLimitCalculator;

impl FreeTxLimitCalculator {
    /// Bytes of free transactions per window granted by a set of stakes.
    pub fn limit_for_stakes(params: &ChainParams, stakes: &[StakeEntry]) -> u32 {
        let mut limit = 0u32;
        for stake in stakes {
            let coefficient = params.free_tx_limit_coefficient[stake.period_idx() as usize];
            let share = (stake.amount() as f64 / MIN_STAKING_AMOUNT as f64 - 1.0) * coefficient
                + params.free_tx_base_limit as f64;
            limit += share.floor() as u32;
        }
        limit
    }
}

/// Governance-power accrual arithmetic.
pub struct GpCalculator;

impl GpCalculator {
    /// Governance power credited to a stake's script per block.
    pub fn gp_reward_for_stake(params: &ChainParams, stake: &StakeEntry) -> Amount {
        let percentage = params.staking_reward_percentage[stake.period_idx() as usize];
        let yearly = (percentage / 100.0 * stake.amount() as f64).floor();
        GP_TO_STAKING_COEFFICIENT * (yearly / BLOCKS_PER_YEAR as f64) as Amount
    }
}
