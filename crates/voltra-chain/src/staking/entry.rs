//! The canonical record of one stake.

use bitcoin::consensus::encode;
use bitcoin::consensus::Decodable;
use bitcoin::consensus::Encodable;
use bitcoin::hashes::Hash;
use bitcoin::io;
use bitcoin::ScriptBuf;
use bitcoin::Txid;

use crate::amount::Amount;
use crate::staking::params::STAKING_PERIOD;

/// One stake, keyed in the database by the hash of its deposit transaction.
///
/// An entry is immutable by contract once created; state transitions
/// (deactivation, reactivation, reward updates) go through the stakes DB
/// cache, which keeps the derived indices in sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeEntry {
    stake_id: Txid,
    amount: Amount,
    reward: Amount,
    period_idx: u8,
    complete_block: u32,
    num_output: u32,
    script: ScriptBuf,
    complete: bool,
    active: bool,
}

impl StakeEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stake_id: Txid,
        amount: Amount,
        reward: Amount,
        period_idx: u8,
        complete_block: u32,
        num_output: u32,
        script: ScriptBuf,
        active: bool,
    ) -> Self {
        StakeEntry {
            stake_id,
            amount,
            reward,
            period_idx,
            complete_block,
            num_output,
            script,
            complete: false,
            active,
        }
    }

    pub fn amount(&self) -> Amount {
        self.amount
    }

    pub fn reward(&self) -> Amount {
        self.reward
    }

    pub fn set_reward(&mut self, reward: Amount) {
        self.reward = reward;
    }

    pub fn period_idx(&self) -> u8 {
        self.period_idx
    }

    /// Height at which the lock-in period ends.
    pub fn complete_block(&self) -> u32 {
        self.complete_block
    }

    /// Height of the block that carried the deposit transaction.
    pub fn deposit_block(&self) -> u32 {
        self.complete_block - STAKING_PERIOD[self.period_idx as usize] + 1
    }

    /// Index of the funded output in the deposit transaction.
    pub fn num_output(&self) -> u32 {
        self.num_output
    }

    pub fn stake_id(&self) -> Txid {
        self.stake_id
    }

    /// Re-attaches the database key after decoding; the id is not part of
    /// the stored record.
    pub fn set_stake_id(&mut self, stake_id: Txid) {
        self.stake_id = stake_id;
    }

    /// The locking script that owns this stake.
    pub fn script(&self) -> &ScriptBuf {
        &self.script
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub(crate) fn set_complete(&mut self, complete: bool) {
        self.complete = complete;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn set_active(&mut self) {
        self.active = true;
    }

    pub(crate) fn set_inactive(&mut self) {
        self.active = false;
    }

    /// Approximate in-memory footprint, used to size flush batches.
    pub fn estimate_size(&self) -> usize {
        2 * core::mem::size_of::<Amount>()
            + 2 * core::mem::size_of::<u32>()
            + core::mem::size_of::<u8>()
            + 2 * core::mem::size_of::<bool>()
            + Txid::LEN
            + self.script.len()
    }
}

impl Encodable for StakeEntry {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = 0;
        len += self.amount.consensus_encode(w)?;
        len += self.reward.consensus_encode(w)?;
        len += self.period_idx.consensus_encode(w)?;
        len += self.complete_block.consensus_encode(w)?;
        len += self.num_output.consensus_encode(w)?;
        len += self.complete.consensus_encode(w)?;
        len += self.script.consensus_encode(w)?;
        len += self.active.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for StakeEntry {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        Ok(StakeEntry {
            // The key is attached by the caller via `set_stake_id`.
            stake_id: Txid::all_zeros(),
            amount: Amount::consensus_decode(r)?,
            reward: Amount::consensus_decode(r)?,
            period_idx: u8::consensus_decode(r)?,
            complete_block: u32::consensus_decode(r)?,
            num_output: u32::consensus_decode(r)?,
            complete: bool::consensus_decode(r)?,
            script: ScriptBuf::consensus_decode(r)?,
            active: bool::consensus_decode(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::consensus::deserialize;
    use bitcoin::consensus::serialize;
    use bitcoin::hashes::Hash;
    use bitcoin::ScriptBuf;
    use bitcoin::Txid;

    use super::*;
    use crate::amount::COIN;

    fn dummy_entry() -> StakeEntry {
        let script =
            ScriptBuf::from_hex("76a9149206a30c09cc853bb03bd917a4f9f29b089c1bc788ac").unwrap();
        StakeEntry::new(
            Txid::from_byte_array([7; 32]),
            10 * COIN,
            15,
            1,
            25_000,
            1,
            script,
            true,
        )
    }

    #[test]
    fn test_entry_roundtrip() {
        let entry = dummy_entry();
        let bytes = serialize(&entry);
        let mut decoded: StakeEntry = deserialize(&bytes).unwrap();
        decoded.set_stake_id(entry.stake_id());
        assert_eq!(entry, decoded);
    }

    #[test]
    fn test_deposit_block() {
        let entry = dummy_entry();
        // period 1 spans 12_960 blocks
        assert_eq!(entry.deposit_block(), 25_000 - 12_960 + 1);
    }

    #[test]
    fn test_truncated_entry_fails() {
        let entry = dummy_entry();
        let bytes = serialize(&entry);
        assert!(deserialize::<StakeEntry>(&bytes[..bytes.len() - 1]).is_err());
    }
}
