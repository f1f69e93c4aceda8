//! Per-network consensus parameters.
//!
//! Everything the consensus code consumes but does not define lives here:
//! proof-of-work limits, the LWMA averaging window, AuxPoW chain binding,
//! staking reward percentages and the free-transaction economics. The
//! values are hardcoded per [`Network`]; there is no runtime configuration
//! of consensus rules.

use primitive_types::U256;

use crate::staking::params::NUM_STAKING_PERIODS;

/// The networks this chain can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    /// The production network.
    Mainnet,
    /// The public test network.
    Testnet,
    /// Local regression-test network with trivial difficulty.
    Regtest,
}

/// Consensus parameters of one network.
#[derive(Debug, Clone)]
pub struct ChainParams {
    /// Which network these parameters describe.
    pub network: Network,

    /// Highest (easiest) proof-of-work target a block may use.
    pub pow_limit: U256,
    /// Expected seconds between blocks.
    pub pow_target_spacing: i64,
    /// Seconds spanned by one legacy difficulty adjustment period.
    pub pow_target_timespan: i64,
    /// Number of blocks averaged by the LWMA-1 retarget.
    pub lwma_averaging_window: i64,
    /// Testnet rule: allow a minimum-difficulty block when the tip is stale.
    pub pow_allow_min_difficulty_blocks: bool,
    /// Regtest rule: never retarget.
    pub pow_no_retargeting: bool,

    /// Our chain ID inside merged-mining version fields.
    pub aux_chain_id: i32,
    /// Height at which AuxPoW blocks become acceptable.
    pub aux_start_height: u32,
    /// Whether a parent block claiming our chain ID is rejected.
    pub strict_chain_id: bool,

    /// Yearly staking reward percentage per lock-in period.
    pub staking_reward_percentage: [f64; NUM_STAKING_PERIODS],

    /// Maximum bytes of free transactions in one block.
    pub free_tx_max_size_in_block: u64,
    /// Weight of free-transaction volume in the difficulty scaling.
    pub free_tx_difficulty_coefficient: u64,
    /// Per-period coefficient of the free-transaction byte allowance.
    pub free_tx_limit_coefficient: [f64; NUM_STAKING_PERIODS],
    /// Byte allowance granted per stake regardless of its size.
    pub free_tx_base_limit: u32,
}

impl From<Network> for ChainParams {
    fn from(network: Network) -> Self {
        match network {
            Network::Mainnet => ChainParams {
                network,
                pow_limit: mainnet_pow_limit(),
                pow_target_spacing: 10 * 60,
                pow_target_timespan: 14 * 24 * 60 * 60,
                lwma_averaging_window: 60,
                pow_allow_min_difficulty_blocks: false,
                pow_no_retargeting: false,
                aux_chain_id: 16,
                aux_start_height: 100_000,
                strict_chain_id: true,
                staking_reward_percentage: STAKING_REWARD_PERCENTAGE,
                free_tx_max_size_in_block: 100_000,
                free_tx_difficulty_coefficient: 4,
                free_tx_limit_coefficient: FREE_TX_LIMIT_COEFFICIENT,
                free_tx_base_limit: 1_000,
            },
            Network::Testnet => ChainParams {
                network,
                pow_limit: mainnet_pow_limit(),
                pow_target_spacing: 10 * 60,
                pow_target_timespan: 14 * 24 * 60 * 60,
                lwma_averaging_window: 60,
                pow_allow_min_difficulty_blocks: true,
                pow_no_retargeting: false,
                aux_chain_id: 16,
                aux_start_height: 2_000,
                strict_chain_id: true,
                staking_reward_percentage: STAKING_REWARD_PERCENTAGE,
                free_tx_max_size_in_block: 100_000,
                free_tx_difficulty_coefficient: 4,
                free_tx_limit_coefficient: FREE_TX_LIMIT_COEFFICIENT,
                free_tx_base_limit: 1_000,
            },
            Network::Regtest => ChainParams {
                network,
                pow_limit: regtest_pow_limit(),
                pow_target_spacing: 10 * 60,
                pow_target_timespan: 14 * 24 * 60 * 60,
                lwma_averaging_window: 60,
                pow_allow_min_difficulty_blocks: true,
                pow_no_retargeting: true,
                aux_chain_id: 16,
                aux_start_height: 0,
                strict_chain_id: false,
                staking_reward_percentage: STAKING_REWARD_PERCENTAGE,
                free_tx_max_size_in_block: 100_000,
                free_tx_difficulty_coefficient: 4,
                free_tx_limit_coefficient: FREE_TX_LIMIT_COEFFICIENT,
                free_tx_base_limit: 1_000,
            },
        }
    }
}

const STAKING_REWARD_PERCENTAGE: [f64; NUM_STAKING_PERIODS] = [5.0, 6.0, 7.25, 10.0];

const FREE_TX_LIMIT_COEFFICIENT: [f64; NUM_STAKING_PERIODS] = [250.0, 500.0, 1000.0, 2000.0];

/// Mainnet/testnet proof-of-work limit: a target with 32 leading zero bits.
fn mainnet_pow_limit() -> U256 {
    U256::from_big_endian(&[
        0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00,
    ])
}

/// Regtest proof-of-work limit: anything but the sign bit.
fn regtest_pow_limit() -> U256 {
    U256::MAX >> 1
}
