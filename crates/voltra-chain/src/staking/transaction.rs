//! Recognition of staking transactions.
//!
//! A staking transaction announces itself through its first output: an
//! `OP_RETURN` push whose payload starts with the marker byte `0x53` ("S")
//! and a subheader selecting the operation. Deposits lock coins in another
//! output of the same transaction; burns destroy an explicit amount.

use bitcoin::consensus::encode::VarInt;
use bitcoin::consensus::Decodable;
use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::Script;
use bitcoin::Transaction;

use crate::amount::money_range;
use crate::amount::Amount;
use crate::staking::params::MIN_STAKING_AMOUNT;
use crate::staking::params::NUM_STAKING_PERIODS;

/// Marker byte announcing a staking transaction.
pub const STAKING_TX_HEADER: u8 = 0x53;
/// Subheader byte of a deposit.
pub const STAKING_TX_DEPOSIT_SUBHEADER: u8 = 0x44;
/// Subheader byte of a burn.
pub const STAKING_TX_BURN_SUBHEADER: u8 = 0x42;

/// Bytes of script before the payload: OP_RETURN, the push length, the
/// marker and the subheader.
pub const STAKING_HEADER_SIZE: usize = 4;

/// Metadata of a recognized deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositMetadata {
    /// Index of the output holding the staked coins.
    pub output_index: u32,
    /// Selected lock-in period.
    pub period_idx: u8,
}

/// Metadata of a recognized burn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurnMetadata {
    /// Amount the sender claims to burn. Syntactically validated only; the
    /// caller must check it against the transaction's input value.
    pub amount: Amount,
}

/// A classified staking transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StakingTxType {
    Deposit(DepositMetadata),
    Burn(BurnMetadata),
}

impl StakingTxType {
    /// Classifies `tx`, returning `None` for anything that is not a
    /// well-formed staking transaction: missing first output, wrong
    /// header, truncated payload or out-of-range fields.
    pub fn from_tx(tx: &Transaction) -> Option<StakingTxType> {
        let script = &tx.output.first()?.script_pubkey;
        if !is_staking_tx_header(script) {
            return None;
        }
        if is_staking_deposit_subheader(script) {
            validate_deposit(tx)
        } else if is_staking_burn_subheader(script) {
            validate_burn(tx)
        } else {
            None
        }
    }
}

/// Whether the script starts with `OP_RETURN <push>` and the staking marker.
pub fn is_staking_tx_header(script: &Script) -> bool {
    let bytes = script.as_bytes();
    bytes.len() >= STAKING_HEADER_SIZE
        && bytes[0] == OP_RETURN.to_u8()
        && bytes[2] == STAKING_TX_HEADER
}

/// Whether the script is a staking header carrying the deposit subheader.
pub fn is_staking_deposit_header(script: &Script) -> bool {
    is_staking_tx_header(script) && is_staking_deposit_subheader(script)
}

/// Whether the script is a staking header carrying the burn subheader.
pub fn is_staking_burn_header(script: &Script) -> bool {
    is_staking_tx_header(script) && is_staking_burn_subheader(script)
}

fn is_staking_deposit_subheader(script: &Script) -> bool {
    let bytes = script.as_bytes();
    bytes.len() >= STAKING_HEADER_SIZE && bytes[3] == STAKING_TX_DEPOSIT_SUBHEADER
}

fn is_staking_burn_subheader(script: &Script) -> bool {
    let bytes = script.as_bytes();
    bytes.len() >= STAKING_HEADER_SIZE && bytes[3] == STAKING_TX_BURN_SUBHEADER
}

fn validate_deposit(tx: &Transaction) -> Option<StakingTxType> {
    let mut payload = &tx.output[0].script_pubkey.as_bytes()[STAKING_HEADER_SIZE..];

    // Canonical compact-size index of the staked output.
    let output_index = VarInt::consensus_decode(&mut payload).ok()?.0;
    if output_index == 0 || output_index >= tx.output.len() as u64 {
        return None;
    }
    let staked = &tx.output[output_index as usize];
    if (staked.value.to_sat() as Amount) < MIN_STAKING_AMOUNT {
        return None;
    }

    let period_idx = u8::consensus_decode(&mut payload).ok()?;
    if period_idx as usize >= NUM_STAKING_PERIODS {
        return None;
    }

    Some(StakingTxType::Deposit(DepositMetadata {
        output_index: output_index as u32,
        period_idx,
    }))
}

// This has no access to the value of the transaction's inputs, so it only
// validates the syntax. Validation of values must be done separately.
fn validate_burn(tx: &Transaction) -> Option<StakingTxType> {
    let mut payload = &tx.output[0].script_pubkey.as_bytes()[STAKING_HEADER_SIZE..];

    let amount = u64::consensus_decode(&mut payload).ok()? as Amount;
    if !money_range(amount) {
        return None;
    }

    Some(StakingTxType::Burn(BurnMetadata { amount }))
}
