// SPDX-License-Identifier: MIT

//! Meta crate re-exporting the Voltra consensus libraries.
//!
//! Most consumers only need [`chain`], which contains the staking consensus
//! core: the stakes database, the staking transaction parser, reward
//! calculators, proof-of-work and AuxPoW validation.

pub use voltra_chain as chain;
pub use voltra_common as common;
