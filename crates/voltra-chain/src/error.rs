//! Error types for the consensus core.
//!
//! Verifiers return a diagnostic kind instead of a bare boolean so callers
//! can log the specific reason a block or transaction was rejected and
//! score the offending peer.

use bitcoin::consensus::encode;
use bitcoin::Txid;
use voltra_common::impl_error_from;
use voltra_common::prelude::*;

/// Reasons a proof of work does not satisfy the consensus rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    /// The compact target is negative, zero, overflowing or above the
    /// network's proof-of-work limit.
    InvalidTarget,
    /// The block hash does not satisfy the claimed target.
    HashAboveTarget,
    /// The retarget window walked off the known chain.
    MissingAncestor,
    /// The header version flags AuxPoW but no aux header is attached.
    MissingAuxHeader,
    /// An aux header is attached but the version does not flag AuxPoW.
    UnexpectedAuxHeader,
    /// An AuxPoW block header carries a chain ID other than ours.
    WrongChainId,
    /// The attached AuxPoW does not commit to this block.
    AuxPow(AuxPowError),
}

impl Display for PowError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PowError::InvalidTarget => write!(f, "nBits below minimum work"),
            PowError::HashAboveTarget => write!(f, "hash does not satisfy target"),
            PowError::MissingAncestor => write!(f, "missing ancestor in retarget window"),
            PowError::MissingAuxHeader => write!(f, "AuxPoW flagged block without aux header"),
            PowError::UnexpectedAuxHeader => write!(f, "aux header on a non-AuxPoW block"),
            PowError::WrongChainId => write!(f, "AuxPoW block with wrong chain ID"),
            PowError::AuxPow(e) => write!(f, "{e}"),
        }
    }
}

impl_error_from!(PowError, AuxPowError, AuxPow);

/// Reasons an AuxPoW commitment is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxPowError {
    /// The parent chain must not claim our own chain ID.
    ParentHasOurChainId,
    /// The chain merkle branch exceeds the 30-level bound.
    ChainMerkleBranchTooLong,
    /// The coinbase merkle branch does not lead to the parent merkle root.
    MerkleRootIncorrect,
    /// The parent coinbase has no inputs to carry the commitment.
    CoinbaseHasNoInputs,
    /// The chain merkle root was not found in the parent coinbase.
    MissingChainMerkleRoot,
    /// More than one merged-mining header in the parent coinbase.
    MultipleMergedMiningHeaders,
    /// The merged-mining header is not immediately before the root.
    MergedMiningHeaderMisplaced,
    /// No merged-mining header in the parent coinbase.
    MissingMergedMiningHeader,
    /// The chain merkle tree size and nonce are missing or truncated.
    MissingTreeSizeAndNonce,
    /// The embedded tree size does not match the branch length.
    TreeSizeMismatch,
    /// The chain index is not the slot derived from nonce and chain ID.
    WrongIndex,
}

impl Display for AuxPowError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AuxPowError::ParentHasOurChainId => write!(f, "Aux POW parent has our chain ID"),
            AuxPowError::ChainMerkleBranchTooLong => {
                write!(f, "Aux POW chain merkle branch too long")
            }
            AuxPowError::MerkleRootIncorrect => write!(f, "Aux POW merkle root incorrect"),
            AuxPowError::CoinbaseHasNoInputs => write!(f, "Aux POW coinbase has no inputs"),
            AuxPowError::MissingChainMerkleRoot => {
                write!(f, "Aux POW missing chain merkle root in parent coinbase")
            }
            AuxPowError::MultipleMergedMiningHeaders => {
                write!(f, "Multiple merged mining headers in coinbase")
            }
            AuxPowError::MergedMiningHeaderMisplaced => {
                write!(f, "Merged mining header is not just before chain merkle root")
            }
            AuxPowError::MissingMergedMiningHeader => write!(f, "Merged mining header is missing"),
            AuxPowError::MissingTreeSizeAndNonce => {
                write!(
                    f,
                    "Aux POW missing chain merkle tree size and nonce in parent coinbase"
                )
            }
            AuxPowError::TreeSizeMismatch => {
                write!(f, "Aux POW merkle branch size does not match parent coinbase")
            }
            AuxPowError::WrongIndex => write!(f, "Aux POW wrong index"),
        }
    }
}

/// Failures of the stakes database and its cache.
#[derive(Debug)]
pub enum StakesError {
    /// A mutation was attempted on a view-only cache.
    ViewOnly,
    /// The referenced stake does not exist in the database.
    UnknownStake(Txid),
    /// The operation requires an active stake.
    StakeNotActive(Txid),
    /// The operation requires an inactive stake.
    StakeAlreadyActive(Txid),
    /// The script has no active stakes backing a free-transaction allowance.
    NoActiveStakes,
    /// The free-transaction window of this script has already closed.
    WindowClosed,
    /// The transaction would exceed the script's free byte allowance.
    FreeTxQuotaExceeded,
    /// A previous flush did not complete; the store needs to be rebuilt.
    IncompleteFlush,
    /// The persisted per-period totals do not match the active stakes.
    AmountsMismatch { period: usize, expected: i64, stored: i64 },
    /// The underlying key-value store failed.
    Database(kv::Error),
    /// A persisted record failed to decode.
    Decode(encode::Error),
}

impl Display for StakesError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StakesError::ViewOnly => write!(f, "cannot modify a view-only cache"),
            StakesError::UnknownStake(id) => write!(f, "unknown stake {id}"),
            StakesError::StakeNotActive(id) => write!(f, "stake {id} is not active"),
            StakesError::StakeAlreadyActive(id) => write!(f, "stake {id} is already active"),
            StakesError::NoActiveStakes => write!(f, "script has no active stakes"),
            StakesError::WindowClosed => write!(f, "free transaction window already closed"),
            StakesError::FreeTxQuotaExceeded => write!(f, "free transaction limit exceeded"),
            StakesError::IncompleteFlush => {
                write!(f, "stakes database flush did not complete; reindex required")
            }
            StakesError::AmountsMismatch {
                period,
                expected,
                stored,
            } => write!(
                f,
                "stakes database corrupted: period {period} total is {stored}, expected {expected}"
            ),
            StakesError::Database(e) => write!(f, "stakes database error: {e}"),
            StakesError::Decode(e) => write!(f, "stakes database entry corrupted: {e}"),
        }
    }
}

impl_error_from!(StakesError, kv::Error, Database);
impl_error_from!(StakesError, encode::Error, Decode);

/// Umbrella error for callers driving the whole consensus core.
#[derive(Debug)]
pub enum BlockchainError {
    Pow(PowError),
    Stakes(StakesError),
}

impl Display for BlockchainError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BlockchainError::Pow(e) => write!(f, "{e}"),
            BlockchainError::Stakes(e) => write!(f, "{e}"),
        }
    }
}

impl_error_from!(BlockchainError, PowError, Pow);
impl_error_from!(BlockchainError, StakesError, Stakes);

impl std::error::Error for PowError {}
impl std::error::Error for AuxPowError {}
impl std::error::Error for StakesError {}
impl std::error::Error for BlockchainError {}
