//! End-to-end lifecycle of a stake: deposit recognition, database
//! application, reward payout at completion, and exact undo across a
//! reorganization.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::transaction::Version;
use bitcoin::Amount as SatAmount;
use bitcoin::OutPoint;
use bitcoin::ScriptBuf;
use bitcoin::Sequence;
use bitcoin::Transaction;
use bitcoin::TxIn;
use bitcoin::TxOut;
use bitcoin::Witness;
use tempfile::TempDir;
use voltra_chain::amount::COIN;
use voltra_chain::chainparams::ChainParams;
use voltra_chain::chainparams::Network;
use voltra_chain::rewards::get_staking_reward_for_height;
use voltra_chain::staking::params::STAKING_PERIOD;
use voltra_chain::staking::transaction::DepositMetadata;
use voltra_chain::staking::StakeEntry;
use voltra_chain::staking::StakesDb;
use voltra_chain::staking::StakesDbCache;
use voltra_chain::staking::StakingRewardsCalculator;
use voltra_chain::staking::StakingTxType;

fn p2pkh_script() -> ScriptBuf {
    ScriptBuf::from_hex("76a9149206a30c09cc853bb03bd917a4f9f29b089c1bc788ac").unwrap()
}

/// A transaction whose first output is a staking deposit header and whose
/// second output locks the staked coins.
fn deposit_tx(amount: i64, period_idx: u8) -> Transaction {
    let header = ScriptBuf::from_bytes(vec![OP_RETURN.to_u8(), 0x04, 0x53, 0x44, 0x01, period_idx]);
    Transaction {
        version: Version(1),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![
            TxOut {
                value: SatAmount::from_sat(0),
                script_pubkey: header,
            },
            TxOut {
                value: SatAmount::from_sat(amount as u64),
                script_pubkey: p2pkh_script(),
            },
        ],
    }
}

/// Applies a recognized deposit to the cache the way block connection
/// does, returning the created entry.
fn connect_deposit(
    cache: &mut StakesDbCache,
    tx: &Transaction,
    meta: DepositMetadata,
    height: u32,
) -> StakeEntry {
    let staked = &tx.output[meta.output_index as usize];
    let complete_block = height + STAKING_PERIOD[meta.period_idx as usize] - 1;
    let entry = StakeEntry::new(
        tx.compute_txid(),
        staked.value.to_sat() as i64,
        0,
        meta.period_idx,
        complete_block,
        meta.output_index,
        staked.script_pubkey.clone(),
        true,
    );
    cache.add_new_stake_entry(entry.clone()).unwrap();
    entry
}

#[test]
fn deposit_completion_and_reorg_roundtrip() {
    let dir = TempDir::new().unwrap();
    let params = ChainParams::from(Network::Mainnet);
    let db = StakesDb::new(dir.path()).unwrap();

    let deposit_height = 1_000;
    let tx = deposit_tx(100 * COIN, 1);
    let Some(StakingTxType::Deposit(meta)) = StakingTxType::from_tx(&tx) else {
        panic!("deposit not recognized");
    };
    assert_eq!(meta.output_index, 1);
    assert_eq!(meta.period_idx, 1);

    // Connect the deposit block: the stake enters the DB and the pool is
    // credited with the block's staking fraction.
    let entry = {
        let mut cache = StakesDbCache::new(&db);
        let entry = connect_deposit(&mut cache, &tx, meta, deposit_height);
        cache
            .staking_pool_mut()
            .unwrap()
            .increase_balance_for_new_block(deposit_height);
        cache.flush().unwrap();
        entry
    };
    let complete_block = entry.complete_block();
    assert_eq!(entry.deposit_block(), deposit_height);
    assert_eq!(db.get_amounts_by_periods()[1], 100 * COIN);
    assert_eq!(
        db.staking_pool().balance(),
        get_staking_reward_for_height(deposit_height)
    );
    assert_eq!(
        db.get_stakes_completed_at_height(complete_block)[0].stake_id(),
        entry.stake_id()
    );

    // Complete the stake: it leaves the active set, carries its accrued
    // reward, and the pool is debited for the payout.
    {
        let mut cache = StakesDbCache::new(&db);
        let coefficient = StakingRewardsCalculator::global_reward_coefficient(
            &params,
            &cache,
            complete_block,
            false,
        );
        let reward =
            StakingRewardsCalculator::block_reward_for_stake(&params, coefficient, &entry);
        let mut paid = cache.get_stake_entry(&entry.stake_id()).unwrap();
        paid.set_reward(reward);
        cache.update_stake_entry(paid).unwrap();
        cache.deactivate_stake(&entry.stake_id(), true).unwrap();
        cache.staking_pool_mut().unwrap().decrease_balance(reward);
        cache.flush().unwrap();
    }
    assert_eq!(db.get_amounts_by_periods(), [0, 0, 0, 0]);
    assert_eq!(db.get_num_complete_stakes(), 1);
    assert!(db.get_all_active_stakes().is_empty());
    let completed = db.get_stake_entry(&entry.stake_id()).unwrap();
    assert!(completed.is_complete());
    assert!(!completed.is_active());

    // Disconnect the completion block: the stake returns to the active
    // set with its aggregates byte-identical to before.
    {
        let mut cache = StakesDbCache::new(&db);
        cache
            .reactivate_stake(&entry.stake_id(), complete_block)
            .unwrap();
        cache.flush().unwrap();
    }
    assert_eq!(db.get_amounts_by_periods()[1], 100 * COIN);
    assert_eq!(db.get_num_complete_stakes(), 0);
    assert_eq!(db.get_all_active_stakes().len(), 1);
    let restored = db.get_stake_entry(&entry.stake_id()).unwrap();
    assert!(restored.is_active());
    assert!(!restored.is_complete());
}

#[test]
fn database_reopens_consistently_after_flush() {
    let dir = TempDir::new().unwrap();
    let tx = deposit_tx(40 * COIN, 2);
    let Some(StakingTxType::Deposit(meta)) = StakingTxType::from_tx(&tx) else {
        panic!("deposit not recognized");
    };

    {
        let db = StakesDb::new(dir.path()).unwrap();
        let mut cache = StakesDbCache::new(&db);
        connect_deposit(&mut cache, &tx, meta, 5_000);
        cache.flush().unwrap();
    }

    // Reopening re-runs the startup verification, which recomputes the
    // per-period totals from the stored active stakes.
    let db = StakesDb::new(dir.path()).unwrap();
    assert_eq!(db.get_amounts_by_periods()[2], 40 * COIN);
    let stakes = db.get_active_stake_ids_for_script(&p2pkh_script());
    assert_eq!(stakes.len(), 1);
    assert!(stakes.contains(&tx.compute_txid()));
}

#[test]
fn early_withdrawal_charges_the_penalty() {
    let dir = TempDir::new().unwrap();
    let db = StakesDb::new(dir.path()).unwrap();
    let tx = deposit_tx(100 * COIN, 3);
    let Some(StakingTxType::Deposit(meta)) = StakingTxType::from_tx(&tx) else {
        panic!("deposit not recognized");
    };

    let mut cache = StakesDbCache::new(&db);
    let entry = connect_deposit(&mut cache, &tx, meta, 10);
    let penalty = StakingRewardsCalculator::penalty_for_stake(&entry);
    assert_eq!(penalty, 3 * COIN);

    // Withdrawing before the lock-in ends counts as early withdrawal.
    cache.deactivate_stake(&entry.stake_id(), false).unwrap();
    assert_eq!(cache.get_num_early_withdrawn_stakes(), 1);
    assert_eq!(cache.get_num_complete_stakes(), 0);
    let withdrawn = cache.get_stake_entry(&entry.stake_id()).unwrap();
    assert!(!withdrawn.is_active());
    assert!(!withdrawn.is_complete());
}
