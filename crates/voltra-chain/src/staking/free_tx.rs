//! Per-script free-transaction allowances.
//!
//! Holding active stakes entitles a script to broadcast a number of bytes
//! of fee-exempt transactions per rolling window of [`BLOCKS_PER_DAY`]
//! blocks. Confirmed and unconfirmed usage are tracked separately: the
//! unconfirmed counter guards mempool admission, the confirmed counter
//! guards block validity. Confirming a transaction moves its bytes from
//! one counter to the other.

use bitcoin::consensus::encode;
use bitcoin::consensus::Decodable;
use bitcoin::consensus::Encodable;
use bitcoin::io;
use bitcoin::Txid;
use voltra_common::prelude::*;

use crate::staking::encoding::decode_map;
use crate::staking::encoding::decode_set;
use crate::staking::encoding::encode_map;
use crate::staking::encoding::encode_set;
use crate::staking::params::BLOCKS_PER_DAY;

/// Rolling-window free-transaction state of one script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeTxInfo {
    used_unconfirmed: u32,
    used_confirmed: u32,
    limit: u32,
    window_start_height: u32,
    active_stake_ids: BTreeSet<Txid>,
    unconfirmed_transactions: BTreeMap<Txid, u32>,
}

impl FreeTxInfo {
    /// Opens a fresh window with the given byte limit. The stake-id set is
    /// a snapshot taken at window open; it is refreshed whenever the
    /// script's active stakes change.
    pub fn new(limit: u32, window_start_height: u32, active_stake_ids: BTreeSet<Txid>) -> Self {
        FreeTxInfo {
            used_unconfirmed: 0,
            used_confirmed: 0,
            limit,
            window_start_height,
            active_stake_ids,
            unconfirmed_transactions: BTreeMap::new(),
        }
    }

    pub fn used_unconfirmed(&self) -> u32 {
        self.used_unconfirmed
    }

    pub fn used_confirmed(&self) -> u32 {
        self.used_confirmed
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn set_limit(&mut self, limit: u32) {
        self.limit = limit;
    }

    pub fn set_used_confirmed(&mut self, used: u32) {
        self.used_confirmed = used;
    }

    pub fn window_start_height(&self) -> u32 {
        self.window_start_height
    }

    pub fn set_window_start_height(&mut self, height: u32) {
        self.window_start_height = height;
    }

    /// First height at which this window no longer accepts transactions.
    pub fn window_end_height(&self) -> u32 {
        self.window_start_height + BLOCKS_PER_DAY
    }

    pub fn active_stake_ids(&self) -> &BTreeSet<Txid> {
        &self.active_stake_ids
    }

    pub fn set_active_stake_ids(&mut self, active_stake_ids: BTreeSet<Txid>) {
        self.active_stake_ids = active_stake_ids;
    }

    /// Charges `size` bytes against the confirmed allowance.
    #[must_use]
    pub fn increase_used_confirmed(&mut self, size: u32) -> bool {
        if self.used_confirmed + size > self.limit {
            return false;
        }
        self.used_confirmed += size;
        true
    }

    /// Credits `size` bytes back to the confirmed allowance.
    #[must_use]
    pub fn decrease_used_confirmed(&mut self, size: u32) -> bool {
        if size > self.used_confirmed {
            return false;
        }
        self.used_confirmed -= size;
        true
    }

    /// Remembers an unconfirmed transaction and charges its size against
    /// the unconfirmed allowance. Re-adding a known id is a no-op.
    #[must_use]
    pub fn add_unconfirmed_tx_id(&mut self, txid: Txid, size: u32) -> bool {
        if self.unconfirmed_transactions.contains_key(&txid) {
            return true;
        }
        if self.used_unconfirmed + size > self.limit {
            return false;
        }
        self.unconfirmed_transactions.insert(txid, size);
        self.used_unconfirmed += size;
        true
    }

    /// Forgets an unconfirmed transaction, crediting its bytes back to the
    /// unconfirmed counter.
    pub fn remove_unconfirmed_tx_id(&mut self, txid: &Txid) {
        if let Some(size) = self.unconfirmed_transactions.remove(txid) {
            self.used_unconfirmed = self.used_unconfirmed.saturating_sub(size);
        }
    }
}

impl Encodable for FreeTxInfo {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = 0;
        len += self.used_unconfirmed.consensus_encode(w)?;
        len += self.used_confirmed.consensus_encode(w)?;
        len += self.limit.consensus_encode(w)?;
        len += self.window_start_height.consensus_encode(w)?;
        len += encode_set(&self.active_stake_ids, w)?;
        len += encode_map(&self.unconfirmed_transactions, w)?;
        Ok(len)
    }
}

impl Decodable for FreeTxInfo {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        Ok(FreeTxInfo {
            used_unconfirmed: u32::consensus_decode(r)?,
            used_confirmed: u32::consensus_decode(r)?,
            limit: u32::consensus_decode(r)?,
            window_start_height: u32::consensus_decode(r)?,
            active_stake_ids: decode_set(r)?,
            unconfirmed_transactions: decode_map(r)?,
        })
    }
}
