//! The block reward schedule.
//!
//! Instead of periodic halvings, the chain follows a fixed table of 39
//! reward reductions. The first [`BOOTSTRAP_PERIOD`] blocks pay the high
//! bootstrap reward, after which the reward drops to the next table entry
//! every [`REWARD_REDUCTION_PERIOD`] blocks until it reaches zero.
//!
//! A fixed tenth of every block reward is diverted into the staking pool
//! (see [`get_staking_reward_for_height`]); the miner receives the rest.

use crate::amount::Amount;

/// Number of blocks paying the initial bootstrap reward.
pub const BOOTSTRAP_PERIOD: u32 = 4_200;

/// Number of blocks between two reward reductions.
pub const REWARD_REDUCTION_PERIOD: u32 = 52_500;

/// Total number of reward reductions before the subsidy reaches zero.
pub const NUMBER_OF_REWARD_REDUCTIONS: u32 = 39;

/// The staking pool is credited `reward / STAKING_REWARD_DIVISOR` per block.
/// The fraction is a fixed rational (1/10); integer division keeps the
/// schedule exactly reproducible.
pub const STAKING_REWARD_DIVISOR: Amount = 10;

/// Block reward for each reduction period, in satoshis.
pub const REWARD_AMOUNTS: [Amount; NUMBER_OF_REWARD_REDUCTIONS as usize] = [
    50_000_000_000,
    7_500_000_000,
    7_000_000_000,
    6_500_000_000,
    5_500_000_000,
    4_000_000_000,
    2_500_000_000,
    1_500_000_000,
    750_000_000,
    375_000_000,
    187_500_000,
    93_750_000,
    46_875_000,
    23_437_500,
    11_718_750,
    5_859_375,
    2_929_688,
    1_464_844,
    732_422,
    366_210,
    183_104,
    91_552,
    45_776,
    22_888,
    11_444,
    5_722,
    2_861,
    1_430,
    715,
    358,
    179,
    90,
    45,
    23,
    12,
    6,
    3,
    2,
    1,
];

/// Returns the full block reward (miner portion plus staking portion) for a
/// block at the given height.
pub fn get_block_reward_for_height(height: u32) -> Amount {
    for (i, reward) in REWARD_AMOUNTS.iter().enumerate() {
        if height < BOOTSTRAP_PERIOD + i as u32 * REWARD_REDUCTION_PERIOD {
            return *reward;
        }
    }
    0
}

/// Returns the amount credited to the staking pool for a block at the given
/// height.
pub fn get_staking_reward_for_height(height: u32) -> Amount {
    get_block_reward_for_height(height) / STAKING_REWARD_DIVISOR
}

/// Returns the miner subsidy: the block reward minus the staking pool
/// credit. Fees are added by the caller.
pub fn get_block_subsidy(height: u32) -> Amount {
    get_block_reward_for_height(height) - get_staking_reward_for_height(height)
}
