//! On-chain coin staking.
//!
//! Coins are locked by a deposit transaction for one of a fixed set of
//! lock-in periods and accrue rewards from the chain-wide staking pool.
//! This module owns the whole staking state machine: the transaction
//! parser, the stake records, the persistent stakes database and its
//! write-through cache, and the pure reward calculators.

pub mod calculator;
pub mod encoding;
pub mod entry;
pub mod free_tx;
pub mod pool;
pub mod stakes_db;
pub mod transaction;

pub use calculator::FreeTxLimitCalculator;
pub use calculator::GpCalculator;
pub use calculator::StakingRewardsCalculator;
pub use entry::StakeEntry;
pub use free_tx::FreeTxInfo;
pub use pool::StakingPool;
pub use stakes_db::StakesDb;
pub use stakes_db::StakesDbCache;
pub use transaction::StakingTxType;

/// Consensus constants of the staking system.
pub mod params {
    use crate::amount::Amount;
    use crate::amount::COIN;

    /// Number of selectable lock-in periods.
    pub const NUM_STAKING_PERIODS: usize = 4;

    /// Blocks mined per day at the ten-minute target spacing.
    pub const BLOCKS_PER_DAY: u32 = 144;

    /// Blocks in a staking year (360 days).
    pub const BLOCKS_PER_YEAR: u32 = 360 * BLOCKS_PER_DAY;

    /// Horizon over which the staking pool balance is paid out; bounds the
    /// per-block payout the pool can sustain.
    pub const STAKING_POOL_EXPIRY_BLOCKS: u32 = 180 * BLOCKS_PER_DAY;

    /// Smallest amount that can be locked by a deposit.
    pub const MIN_STAKING_AMOUNT: Amount = 5 * COIN;

    /// Percentage of the staked amount forfeited on early withdrawal.
    pub const STAKING_EARLY_WITHDRAWAL_PENALTY_PERCENTAGE: f64 = 3.0;

    /// Lock-in period lengths in blocks (30, 90, 180 and 360 days).
    pub const STAKING_PERIOD: [u32; NUM_STAKING_PERIODS] = [4_320, 12_960, 25_920, 51_840];

    /// Governance power credited per block is this multiple of the stake's
    /// maximum per-block reward.
    pub const GP_TO_STAKING_COEFFICIENT: Amount = 1;
}
