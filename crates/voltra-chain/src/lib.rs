// SPDX-License-Identifier: MIT

//! Consensus rules of the Voltra staking chain.
//!
//! This crate contains everything a full node needs to validate the
//! staking consensus: recognition of staking transactions, the persistent
//! stakes database with its write-through cache, the staking pool and the
//! reward/penalty calculators, free-transaction allowances, the LWMA-1
//! proof-of-work retarget weighted by free-transaction volume and the
//! merged-mining (AuxPoW) verifier.
//!
//! It deliberately contains no networking, mempool or wallet code; those
//! layers drive this crate through [`staking::StakesDbCache`] and the
//! verifier functions in [`pow`] and [`auxpow`].

pub mod amount;
pub mod auxpow;
pub mod block;
pub mod chainparams;
pub mod error;
pub mod pow;
pub mod rewards;
pub mod staking;

pub use amount::Amount;
pub use block::AuxBlockHeader;
pub use block::BlockHeader;
pub use chainparams::ChainParams;
pub use chainparams::Network;
pub use error::AuxPowError;
pub use error::BlockchainError;
pub use error::PowError;
pub use error::StakesError;
pub use staking::StakeEntry;
pub use staking::StakesDb;
pub use staking::StakesDbCache;
pub use staking::StakingTxType;
