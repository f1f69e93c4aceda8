//! The chain-wide staking rewards pool.

use bitcoin::consensus::encode;
use bitcoin::consensus::Decodable;
use bitcoin::consensus::Encodable;
use bitcoin::io;
use tracing::error;

use crate::amount::Amount;
use crate::rewards::get_staking_reward_for_height;

/// Balance of the staking pool.
///
/// The pool is funded by the staking fraction of every block reward and
/// drained by per-stake payouts. It is an owned field of the stakes DB and
/// of every cache; the cache mutates its own copy, which replaces the
/// base's copy on flush. There is deliberately no process-wide instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StakingPool {
    balance: Amount,
}

impl StakingPool {
    pub fn new(balance: Amount) -> Self {
        StakingPool { balance }
    }

    pub fn balance(&self) -> Amount {
        self.balance
    }

    pub fn set_balance(&mut self, balance: Amount) {
        self.balance = balance;
    }

    pub fn increase_balance(&mut self, amount: Amount) {
        self.balance += amount;
    }

    /// Credits the pool with the staking fraction of the block reward at
    /// `height`.
    pub fn increase_balance_for_new_block(&mut self, height: u32) {
        self.balance += get_staking_reward_for_height(height);
    }

    /// Debits the pool, refusing to take the balance to zero or below.
    pub fn decrease_balance(&mut self, amount: Amount) {
        if self.balance - amount > 0 {
            self.balance -= amount;
        } else {
            error!(
                "current staking pool balance {} can not be decreased by {}",
                self.balance, amount
            );
        }
    }

    pub fn decrease_balance_for_height(&mut self, height: u32) {
        self.decrease_balance(get_staking_reward_for_height(height));
    }
}

impl Encodable for StakingPool {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.balance.consensus_encode(w)
    }
}

impl Decodable for StakingPool {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        Ok(StakingPool {
            balance: Amount::consensus_decode(r)?,
        })
    }
}
