//! The stakes database and its write-through cache.
//!
//! [`StakesDb`] is the authoritative, persistent snapshot of the staking
//! state at the current chain tip: every stake entry plus the derived
//! indices (active set, per-script sets, per-height completion schedule,
//! per-period totals), the staking pool balance, per-script
//! free-transaction state and governance power.
//!
//! All mutations go through a [`StakesDbCache`]. An *editable* cache takes
//! the base's writer lock at construction, snapshots the derived indices
//! and accumulates changes in memory until [`StakesDbCache::flush`] writes
//! everything back atomically under a flush-ongoing marker. A *view-only*
//! cache skips the lock and delegates every read to the base, so parallel
//! readers never block each other.

use std::path::Path;

use bitcoin::consensus::deserialize;
use bitcoin::consensus::serialize;
use bitcoin::consensus::Decodable;
use bitcoin::consensus::Encodable;
use bitcoin::consensus::encode;
use bitcoin::consensus::encode::VarInt;
use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use bitcoin::Script;
use bitcoin::ScriptBuf;
use bitcoin::Transaction;
use bitcoin::Txid;
use kv::Batch;
use kv::Bucket;
use kv::Config;
use kv::Raw;
use kv::Store;
use spin::Mutex;
use spin::MutexGuard;
use spin::RwLock;
use tracing::debug;
use tracing::error;
use tracing::warn;
use voltra_common::prelude::*;

use crate::amount::Amount;
use crate::chainparams::ChainParams;
use crate::error::StakesError;
use crate::staking::calculator::FreeTxLimitCalculator;
use crate::staking::encoding::decode_set;
use crate::staking::encoding::deserialize_map;
use crate::staking::encoding::deserialize_set;
use crate::staking::encoding::encode_set;
use crate::staking::encoding::serialize_map;
use crate::staking::encoding::serialize_set;
use crate::staking::entry::StakeEntry;
use crate::staking::free_tx::FreeTxInfo;
use crate::staking::params::BLOCKS_PER_DAY;
use crate::staking::params::NUM_STAKING_PERIODS;
use crate::staking::pool::StakingPool;

pub type StakeIdsSet = BTreeSet<Txid>;
pub type StakesMap = BTreeMap<Txid, StakeEntry>;
pub type ScriptToStakesMap = BTreeMap<ScriptBuf, StakeIdsSet>;
pub type StakesCompletedAtBlockHeightMap = BTreeMap<u32, StakeIdsSet>;
pub type AmountByPeriodArray = [Amount; NUM_STAKING_PERIODS];
pub type FreeTxInfoMap = BTreeMap<ScriptBuf, FreeTxInfo>;
/// A window that closed: the script it belonged to and the confirmed bytes
/// it had used.
pub type ClosedFreeTxWindowInfo = (ScriptBuf, u32);
pub type ClosedFreeTxWindowInfoVector = Vec<ClosedFreeTxWindowInfo>;
pub type BlockFreeTxSizeMap = BTreeMap<BlockHash, u32>;
pub type FreeTxWindowEndHeightMap = BTreeMap<u32, ClosedFreeTxWindowInfoVector>;
pub type GpMap = BTreeMap<ScriptBuf, Amount>;

/// Flush batches are cut once their payload estimate crosses this size.
const DEFAULT_BATCH_SIZE: usize = 16 << 20;

/// Reserved keys of the underlying store. Stake entries live directly at
/// their 32-byte id.
mod db_keys {
    use bitcoin::consensus::Encodable;
    use bitcoin::BlockHash;
    use bitcoin::Script;

    pub const ADDRESS_TO_STAKES_MAP: &[u8] = b"address_to_stakes_map";
    pub const ACTIVE_STAKES: &[u8] = b"active_stakes";
    pub const STAKES_COMPLETED_AT_BLOCK_HEIGHT: &[u8] = b"stakes_completed_at_block_height";
    pub const AMOUNT_BY_PERIOD: &[u8] = b"amounts_by_periods";
    pub const BEST_BLOCK_HASH: &[u8] = b"best_block_hash";
    pub const STAKING_POOL: &[u8] = b"staking_pool";
    pub const FLUSH_ONGOING: &[u8] = b"flush_ongoing";
    pub const FREE_TX_INFO: &[u8] = b"free_tx_info";
    pub const NUM_COMPLETE_STAKES: &[u8] = b"num_complete_stakes";
    pub const NUM_EARLY_WITHDRAWN_STAKES: &[u8] = b"num_early_withdrawn_stakes";

    pub fn blk_free_tx_size(hash: &BlockHash) -> Vec<u8> {
        format!("blk_free_tx_size_{hash}").into_bytes()
    }

    pub fn ftx_window_end(height: u32) -> Vec<u8> {
        format!("ftx_window_end_{height}").into_bytes()
    }

    pub fn gp(script: &Script) -> Vec<u8> {
        let mut key = b"gp_".to_vec();
        script
            .consensus_encode(&mut key)
            .expect("writing to a Vec never fails");
        key
    }
}

fn serialize_amounts(amounts: &AmountByPeriodArray) -> Vec<u8> {
    let mut buf = Vec::new();
    for amount in amounts {
        amount
            .consensus_encode(&mut buf)
            .expect("writing to a Vec never fails");
    }
    buf
}

fn deserialize_amounts(bytes: &[u8]) -> Result<AmountByPeriodArray, encode::Error> {
    let mut cursor = bytes;
    let mut amounts = [0; NUM_STAKING_PERIODS];
    for slot in amounts.iter_mut() {
        *slot = Amount::consensus_decode(&mut cursor)?;
    }
    Ok(amounts)
}

// The two index maps are keyed collections of id sets; they get their own
// codec since a set is not a consensus-encodable value by itself.

fn serialize_id_set_map<K: Encodable>(map: &BTreeMap<K, StakeIdsSet>) -> Vec<u8> {
    let mut buf = Vec::new();
    VarInt(map.len() as u64)
        .consensus_encode(&mut buf)
        .expect("writing to a Vec never fails");
    for (key, ids) in map {
        key.consensus_encode(&mut buf)
            .expect("writing to a Vec never fails");
        encode_set(ids, &mut buf).expect("writing to a Vec never fails");
    }
    buf
}

fn deserialize_id_set_map<K: Decodable + Ord>(
    bytes: &[u8],
) -> Result<BTreeMap<K, StakeIdsSet>, encode::Error> {
    let mut cursor = bytes;
    let count = VarInt::consensus_decode(&mut cursor)?.0;
    let mut map = BTreeMap::new();
    for _ in 0..count {
        let key = K::consensus_decode(&mut cursor)?;
        let ids = decode_set(&mut cursor)?;
        map.insert(key, ids);
    }
    Ok(map)
}

fn serialize_windows(windows: &[ClosedFreeTxWindowInfo]) -> Vec<u8> {
    let mut buf = Vec::new();
    VarInt(windows.len() as u64)
        .consensus_encode(&mut buf)
        .expect("writing to a Vec never fails");
    for (script, used_confirmed) in windows {
        script
            .consensus_encode(&mut buf)
            .expect("writing to a Vec never fails");
        used_confirmed
            .consensus_encode(&mut buf)
            .expect("writing to a Vec never fails");
    }
    buf
}

fn deserialize_windows(bytes: &[u8]) -> Result<ClosedFreeTxWindowInfoVector, encode::Error> {
    let mut cursor = bytes;
    let count = VarInt::consensus_decode(&mut cursor)?.0;
    let mut windows = Vec::new();
    for _ in 0..count {
        let script = ScriptBuf::consensus_decode(&mut cursor)?;
        let used_confirmed = u32::consensus_decode(&mut cursor)?;
        windows.push((script, used_confirmed));
    }
    Ok(windows)
}

/// The derived indices and scalars kept in memory alongside the store.
#[derive(Debug, Clone)]
struct DbState {
    script_to_active_stakes: ScriptToStakesMap,
    active_stakes: StakeIdsSet,
    stakes_completed_at_block_height: StakesCompletedAtBlockHeightMap,
    amounts_by_periods: AmountByPeriodArray,
    free_tx_info: FreeTxInfoMap,
    staking_pool: StakingPool,
    best_block_hash: BlockHash,
    num_complete_stakes: u64,
    num_early_withdrawn_stakes: u64,
}

impl Default for DbState {
    fn default() -> Self {
        DbState {
            script_to_active_stakes: BTreeMap::new(),
            active_stakes: BTreeSet::new(),
            stakes_completed_at_block_height: BTreeMap::new(),
            amounts_by_periods: [0; NUM_STAKING_PERIODS],
            free_tx_info: BTreeMap::new(),
            staking_pool: StakingPool::default(),
            best_block_hash: BlockHash::all_zeros(),
            num_complete_stakes: 0,
            num_early_withdrawn_stakes: 0,
        }
    }
}

/// The persistent stakes database.
pub struct StakesDb {
    _store: Store,
    bucket: Bucket<'static, Raw, Raw>,
    state: RwLock<DbState>,
    // Taken by the editable cache; at most one writer at a time.
    editor_lock: Mutex<()>,
}

impl StakesDb {
    /// Opens (or creates) the database under `datadir`, loads the derived
    /// indices and verifies the store's integrity. A store left behind by
    /// an interrupted flush, or one whose per-period totals do not match
    /// its active stakes, is refused.
    pub fn new(datadir: impl AsRef<Path>) -> Result<Self, StakesError> {
        let store = Store::new(Config::new(datadir.as_ref()))?;
        let bucket = store.bucket::<Raw, Raw>(Some("stakes"))?;
        let db = StakesDb {
            _store: store,
            bucket,
            state: RwLock::new(DbState::default()),
            editor_lock: Mutex::new(()),
        };
        db.init_help_states()?;
        db.verify()?;
        Ok(db)
    }

    fn read_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StakesError> {
        Ok(self.bucket.get(&Raw::from(key))?.map(|raw| raw.to_vec()))
    }

    fn write_raw(&self, key: &[u8], value: &[u8]) -> Result<(), StakesError> {
        self.bucket.set(&Raw::from(key), &Raw::from(value))?;
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.bucket.iter().next().is_none()
    }

    fn init_help_states(&self) -> Result<(), StakesError> {
        let mut state = self.state.write();
        if let Some(bytes) = self.read_raw(db_keys::ADDRESS_TO_STAKES_MAP)? {
            state.script_to_active_stakes = deserialize_id_set_map(&bytes)?;
        }
        if let Some(bytes) = self.read_raw(db_keys::ACTIVE_STAKES)? {
            state.active_stakes = deserialize_set(&bytes)?;
        }
        if let Some(bytes) = self.read_raw(db_keys::STAKES_COMPLETED_AT_BLOCK_HEIGHT)? {
            state.stakes_completed_at_block_height = deserialize_id_set_map(&bytes)?;
        }
        if let Some(bytes) = self.read_raw(db_keys::AMOUNT_BY_PERIOD)? {
            state.amounts_by_periods = deserialize_amounts(&bytes)?;
        }
        if let Some(bytes) = self.read_raw(db_keys::FREE_TX_INFO)? {
            state.free_tx_info = deserialize_map(&bytes)?;
        }
        if let Some(bytes) = self.read_raw(db_keys::STAKING_POOL)? {
            state.staking_pool = deserialize(&bytes)?;
        }
        if let Some(bytes) = self.read_raw(db_keys::BEST_BLOCK_HASH)? {
            state.best_block_hash = deserialize(&bytes)?;
        }
        if let Some(bytes) = self.read_raw(db_keys::NUM_COMPLETE_STAKES)? {
            state.num_complete_stakes = deserialize(&bytes)?;
        }
        if let Some(bytes) = self.read_raw(db_keys::NUM_EARLY_WITHDRAWN_STAKES)? {
            state.num_early_withdrawn_stakes = deserialize(&bytes)?;
        }
        Ok(())
    }

    fn dump_help_states(&self, state: &DbState) -> Result<(), StakesError> {
        self.write_raw(
            db_keys::ADDRESS_TO_STAKES_MAP,
            &serialize_id_set_map(&state.script_to_active_stakes),
        )?;
        self.write_raw(db_keys::ACTIVE_STAKES, &serialize_set(&state.active_stakes))?;
        self.write_raw(
            db_keys::STAKES_COMPLETED_AT_BLOCK_HEIGHT,
            &serialize_id_set_map(&state.stakes_completed_at_block_height),
        )?;
        self.write_raw(
            db_keys::AMOUNT_BY_PERIOD,
            &serialize_amounts(&state.amounts_by_periods),
        )?;
        self.write_raw(db_keys::FREE_TX_INFO, &serialize_map(&state.free_tx_info))?;
        self.write_raw(db_keys::STAKING_POOL, &serialize(&state.staking_pool))?;
        self.write_raw(db_keys::BEST_BLOCK_HASH, &serialize(&state.best_block_hash))?;
        self.write_raw(
            db_keys::NUM_COMPLETE_STAKES,
            &serialize(&state.num_complete_stakes),
        )?;
        self.write_raw(
            db_keys::NUM_EARLY_WITHDRAWN_STAKES,
            &serialize(&state.num_early_withdrawn_stakes),
        )?;
        Ok(())
    }

    fn verify(&self) -> Result<(), StakesError> {
        self.verify_flush_state()?;
        self.verify_total_amounts()
    }

    /// A missing marker is only acceptable in a brand-new store; a marker
    /// still set to `true` means the previous flush never completed.
    fn verify_flush_state(&self) -> Result<(), StakesError> {
        match self.read_raw(db_keys::FLUSH_ONGOING)? {
            Some(bytes) => {
                let flush_ongoing: bool = deserialize(&bytes)?;
                if flush_ongoing {
                    return Err(StakesError::IncompleteFlush);
                }
                Ok(())
            }
            None => {
                if self.is_empty() {
                    Ok(())
                } else {
                    Err(StakesError::IncompleteFlush)
                }
            }
        }
    }

    /// Recomputes the per-period totals from the active stakes and checks
    /// them against the persisted array.
    fn verify_total_amounts(&self) -> Result<(), StakesError> {
        let mut total_staked_by_period: AmountByPeriodArray = [0; NUM_STAKING_PERIODS];
        for stake in self.get_all_active_stakes() {
            total_staked_by_period[stake.period_idx() as usize] += stake.amount();
        }
        let state = self.state.read();
        for (period, total) in total_staked_by_period.iter().enumerate() {
            if *total != state.amounts_by_periods[period] {
                return Err(StakesError::AmountsMismatch {
                    period,
                    expected: *total,
                    stored: state.amounts_by_periods[period],
                });
            }
        }
        Ok(())
    }

    /// Looks a stake up by its id. Returns `None` for unknown ids and for
    /// undecodable records.
    pub fn get_stake_entry(&self, stake_id: &Txid) -> Option<StakeEntry> {
        let bytes = match self.read_raw(stake_id.as_byte_array().as_slice()) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("cannot get stake of id {stake_id} from database");
                return None;
            }
            Err(e) => {
                error!("cannot get stake of id {stake_id} from database: {e}");
                return None;
            }
        };
        match deserialize::<StakeEntry>(&bytes) {
            Ok(mut entry) => {
                entry.set_stake_id(*stake_id);
                Some(entry)
            }
            Err(e) => {
                error!("stake entry {stake_id} is corrupted: {e}");
                None
            }
        }
    }

    /// All stakes that are still locked, in id order.
    pub fn get_all_active_stakes(&self) -> Vec<StakeEntry> {
        let ids: Vec<Txid> = self.state.read().active_stakes.iter().copied().collect();
        let mut stakes = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_stake_entry(&id) {
                Some(stake) => stakes.push(stake),
                None => error!("active stake {id} is missing from the database"),
            }
        }
        stakes
    }

    pub fn get_active_stake_ids_for_script(&self, script: &Script) -> StakeIdsSet {
        self.state
            .read()
            .script_to_active_stakes
            .get(script)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_stakes_completed_at_height(&self, height: u32) -> Vec<StakeEntry> {
        let ids: Vec<Txid> = self
            .state
            .read()
            .stakes_completed_at_block_height
            .get(&height)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        let mut stakes = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_stake_entry(&id) {
                Some(stake) => stakes.push(stake),
                None => error!("completed stake {id} is missing from the database"),
            }
        }
        stakes
    }

    pub fn get_amounts_by_periods(&self) -> AmountByPeriodArray {
        self.state.read().amounts_by_periods
    }

    pub fn get_best_block(&self) -> BlockHash {
        self.state.read().best_block_hash
    }

    pub fn get_free_tx_info_for_script(&self, script: &Script) -> Option<FreeTxInfo> {
        self.state.read().free_tx_info.get(script).cloned()
    }

    /// Bytes of free transactions the given block contained. Unknown
    /// blocks count as zero.
    pub fn get_free_tx_size_for_block(&self, hash: &BlockHash) -> u32 {
        match self.read_raw(&db_keys::blk_free_tx_size(hash)) {
            Ok(Some(bytes)) => deserialize(&bytes).unwrap_or_else(|e| {
                error!("free tx size of block {hash} is corrupted: {e}");
                0
            }),
            Ok(None) => {
                warn!("cannot get free tx size of block {hash} from database");
                0
            }
            Err(e) => {
                error!("cannot get free tx size of block {hash} from database: {e}");
                0
            }
        }
    }

    pub fn get_free_tx_windows_completed_at_height(
        &self,
        height: u32,
    ) -> ClosedFreeTxWindowInfoVector {
        match self.read_raw(&db_keys::ftx_window_end(height)) {
            Ok(Some(bytes)) => deserialize_windows(&bytes).unwrap_or_else(|e| {
                error!("free tx windows closing at height {height} are corrupted: {e}");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                error!("cannot get free tx windows for height {height} from database: {e}");
                Vec::new()
            }
        }
    }

    /// Governance power accrued by a script. Scripts without any are zero.
    pub fn get_gp_for_script(&self, script: &Script) -> Amount {
        match self.read_raw(&db_keys::gp(script)) {
            Ok(Some(bytes)) => deserialize(&bytes).unwrap_or_else(|e| {
                error!("governance power record is corrupted: {e}");
                0
            }),
            Ok(None) => 0,
            Err(e) => {
                error!("cannot get governance power from database: {e}");
                0
            }
        }
    }

    pub fn get_num_complete_stakes(&self) -> u64 {
        self.state.read().num_complete_stakes
    }

    pub fn get_num_early_withdrawn_stakes(&self) -> u64 {
        self.state.read().num_early_withdrawn_stakes
    }

    /// The staking pool as of the last flush.
    pub fn staking_pool(&self) -> StakingPool {
        self.state.read().staking_pool
    }

    fn lock_editor(&self) -> MutexGuard<'_, ()> {
        self.editor_lock.lock()
    }

    fn remove_stake_record(&self, stake_id: &Txid) {
        if let Err(e) = self.bucket.remove(&Raw::from(stake_id.as_byte_array().as_slice())) {
            error!("cannot remove stake of id {stake_id} from database: {e}");
        }
    }

    /// Writes the cache's accumulated state into the store. The whole
    /// write is bracketed by the flush-ongoing marker so an interrupted
    /// flush is detected at the next startup.
    fn flush_from_cache(&self, cache: &mut StakesDbCache) -> Result<(), StakesError> {
        self.verify_flush_state()?;
        self.write_raw(db_keys::FLUSH_ONGOING, &serialize(&true))?;

        {
            let mut state = self.state.write();
            state.script_to_active_stakes = cache.script_to_active_stakes.clone();
            state.active_stakes = cache.active_stakes.clone();
            state.staking_pool = cache.staking_pool;
            state.stakes_completed_at_block_height =
                cache.stakes_completed_at_block_height.clone();
            state.free_tx_info = cache.free_tx_info.clone();
            state.amounts_by_periods = cache.amounts_by_periods;
            state.best_block_hash = cache.best_block_hash;
            state.num_complete_stakes = cache.num_complete_stakes;
            state.num_early_withdrawn_stakes = cache.num_early_withdrawn_stakes;
            self.dump_help_states(&state)?;
        }

        let mut batch = Batch::<Raw, Raw>::new();
        let mut batch_size = 0;
        for (stake_id, entry) in std::mem::take(&mut cache.stakes_map) {
            batch.set(
                &Raw::from(stake_id.as_byte_array().as_slice()),
                &Raw::from(serialize(&entry).as_slice()),
            )?;
            batch_size += entry.estimate_size();
            if batch_size > DEFAULT_BATCH_SIZE {
                debug!(
                    "writing partial batch of {:.2} MiB",
                    batch_size as f64 / 1_048_576.0
                );
                self.bucket.batch(std::mem::replace(&mut batch, Batch::new()))?;
                batch_size = 0;
            }
        }
        debug!(
            "writing final batch of {:.2} MiB",
            batch_size as f64 / 1_048_576.0
        );
        self.bucket.batch(batch)?;

        for stake_id in std::mem::take(&mut cache.stakes_to_remove) {
            self.remove_stake_record(&stake_id);
        }

        let mut batch = Batch::<Raw, Raw>::new();
        for (hash, size) in std::mem::take(&mut cache.block_free_tx_size_map) {
            batch.set(
                &Raw::from(db_keys::blk_free_tx_size(&hash).as_slice()),
                &Raw::from(serialize(&size).as_slice()),
            )?;
        }
        self.bucket.batch(batch)?;

        for height in std::mem::take(&mut cache.free_tx_window_end_heights_to_remove) {
            self.bucket
                .remove(&Raw::from(db_keys::ftx_window_end(height).as_slice()))?;
        }
        for (height, windows) in std::mem::take(&mut cache.free_tx_info_end_height_map) {
            self.write_raw(&db_keys::ftx_window_end(height), &serialize_windows(&windows))?;
        }

        let mut batch = Batch::<Raw, Raw>::new();
        for (script, amount) in std::mem::take(&mut cache.gp_map) {
            batch.set(
                &Raw::from(db_keys::gp(&script).as_slice()),
                &Raw::from(serialize(&amount).as_slice()),
            )?;
        }
        self.bucket.batch(batch)?;

        self.write_raw(db_keys::FLUSH_ONGOING, &serialize(&false))?;
        self.bucket.flush()?;
        Ok(())
    }
}

/// A mutable overlay over a [`StakesDb`].
///
/// Editable caches own the base's writer lock for their whole lifetime, so
/// at most one exists at a time; dropping the cache (or flushing it)
/// releases the lock. View-only caches delegate all reads to the base and
/// refuse every mutation.
pub struct StakesDbCache<'a> {
    base: &'a StakesDb,
    view_only: bool,
    editor_guard: Option<MutexGuard<'a, ()>>,
    flushed: bool,

    stakes_map: StakesMap,
    stakes_to_remove: StakeIdsSet,
    script_to_active_stakes: ScriptToStakesMap,
    active_stakes: StakeIdsSet,
    stakes_completed_at_block_height: StakesCompletedAtBlockHeightMap,
    amounts_by_periods: AmountByPeriodArray,
    free_tx_info: FreeTxInfoMap,
    block_free_tx_size_map: BlockFreeTxSizeMap,
    free_tx_info_end_height_map: FreeTxWindowEndHeightMap,
    free_tx_window_end_heights_to_remove: BTreeSet<u32>,
    gp_map: GpMap,
    staking_pool: StakingPool,
    best_block_hash: BlockHash,
    num_complete_stakes: u64,
    num_early_withdrawn_stakes: u64,
}

impl<'a> StakesDbCache<'a> {
    /// Creates an editable cache, taking the base's writer lock. Blocks
    /// while another editable cache exists.
    pub fn new(base: &'a StakesDb) -> Self {
        Self::with_mode(base, false)
    }

    /// Creates a view-only cache; reads pass through, mutations fail.
    pub fn new_view_only(base: &'a StakesDb) -> Self {
        Self::with_mode(base, true)
    }

    fn with_mode(base: &'a StakesDb, view_only: bool) -> Self {
        let editor_guard = if view_only {
            None
        } else {
            Some(base.lock_editor())
        };
        let state = base.state.read();
        let mut cache = StakesDbCache {
            base,
            view_only,
            editor_guard,
            flushed: false,
            stakes_map: BTreeMap::new(),
            stakes_to_remove: BTreeSet::new(),
            script_to_active_stakes: BTreeMap::new(),
            active_stakes: BTreeSet::new(),
            stakes_completed_at_block_height: BTreeMap::new(),
            amounts_by_periods: [0; NUM_STAKING_PERIODS],
            free_tx_info: BTreeMap::new(),
            block_free_tx_size_map: BTreeMap::new(),
            free_tx_info_end_height_map: BTreeMap::new(),
            free_tx_window_end_heights_to_remove: BTreeSet::new(),
            gp_map: BTreeMap::new(),
            staking_pool: state.staking_pool,
            best_block_hash: BlockHash::all_zeros(),
            num_complete_stakes: state.num_complete_stakes,
            num_early_withdrawn_stakes: state.num_early_withdrawn_stakes,
        };
        if !view_only {
            cache.active_stakes = state.active_stakes.clone();
            cache.stakes_completed_at_block_height =
                state.stakes_completed_at_block_height.clone();
            cache.script_to_active_stakes = state.script_to_active_stakes.clone();
            cache.best_block_hash = state.best_block_hash;
            cache.amounts_by_periods = state.amounts_by_periods;
            cache.free_tx_info = state.free_tx_info.clone();
        }
        cache
    }

    pub fn is_view_only(&self) -> bool {
        self.view_only
    }

    fn require_editable(&self) -> Result<(), StakesError> {
        if self.view_only {
            error!("cannot modify a view-only cache");
            return Err(StakesError::ViewOnly);
        }
        Ok(())
    }

    /// Inserts a brand-new stake and updates every derived index.
    pub fn add_new_stake_entry(&mut self, entry: StakeEntry) -> Result<(), StakesError> {
        self.require_editable()?;
        self.stakes_completed_at_block_height
            .entry(entry.complete_block())
            .or_default()
            .insert(entry.stake_id());
        if entry.is_active() {
            self.active_stakes.insert(entry.stake_id());
            self.script_to_active_stakes
                .entry(entry.script().clone())
                .or_default()
                .insert(entry.stake_id());
            self.amounts_by_periods[entry.period_idx() as usize] += entry.amount();
        }
        self.stakes_map.insert(entry.stake_id(), entry);
        Ok(())
    }

    /// Overwrites a stake's record without touching the aggregates. This
    /// assumes nothing besides the reward changed; checks are skipped
    /// because they would need DB lookups.
    pub fn update_stake_entry(&mut self, entry: StakeEntry) -> Result<(), StakesError> {
        self.require_editable()?;
        self.stakes_map.insert(entry.stake_id(), entry);
        Ok(())
    }

    pub fn get_stake_entry(&self, stake_id: &Txid) -> Option<StakeEntry> {
        if self.view_only {
            return self.base.get_stake_entry(stake_id);
        }
        if let Some(entry) = self.stakes_map.get(stake_id) {
            return Some(entry.clone());
        }
        if self.stakes_to_remove.contains(stake_id) {
            return None;
        }
        self.base.get_stake_entry(stake_id)
    }

    /// Removes a stake entirely, e.g. when its deposit is disconnected in
    /// a reorg. Only active stakes can be removed.
    pub fn remove_stake_entry(&mut self, stake_id: &Txid) -> Result<(), StakesError> {
        self.require_editable()?;
        let stake = self
            .get_stake_entry(stake_id)
            .ok_or(StakesError::UnknownStake(*stake_id))?;
        if !stake.is_active() {
            return Err(StakesError::StakeNotActive(*stake_id));
        }
        self.amounts_by_periods[stake.period_idx() as usize] -= stake.amount();
        self.active_stakes.remove(stake_id);
        self.erase_stake_from_script_map(&stake);
        self.stakes_map.remove(stake_id);
        self.stakes_to_remove.insert(*stake_id);
        Ok(())
    }

    /// Takes a stake out of the active set, either because its lock-in
    /// ended (`set_complete`) or because it was withdrawn early.
    pub fn deactivate_stake(&mut self, stake_id: &Txid, set_complete: bool) -> Result<(), StakesError> {
        self.require_editable()?;
        let mut stake = self
            .get_stake_entry(stake_id)
            .ok_or(StakesError::UnknownStake(*stake_id))?;
        if !stake.is_active() {
            return Err(StakesError::StakeNotActive(*stake_id));
        }
        stake.set_inactive();
        stake.set_complete(set_complete);
        self.active_stakes.remove(stake_id);
        self.erase_stake_from_script_map(&stake);
        self.amounts_by_periods[stake.period_idx() as usize] -= stake.amount();
        self.stakes_map.insert(*stake_id, stake);
        if set_complete {
            self.num_complete_stakes += 1;
        } else {
            self.num_early_withdrawn_stakes += 1;
        }
        Ok(())
    }

    /// Puts a deactivated stake back, undoing a completion or withdrawal
    /// during a reorg. Completeness is recomputed from the target height.
    pub fn reactivate_stake(&mut self, stake_id: &Txid, height: u32) -> Result<(), StakesError> {
        self.require_editable()?;
        let mut stake = self
            .get_stake_entry(stake_id)
            .ok_or(StakesError::UnknownStake(*stake_id))?;
        if stake.is_active() {
            return Err(StakesError::StakeAlreadyActive(*stake_id));
        }
        stake.set_active();
        stake.set_complete(height > stake.complete_block());
        self.active_stakes.insert(*stake_id);
        self.script_to_active_stakes
            .entry(stake.script().clone())
            .or_default()
            .insert(*stake_id);
        self.amounts_by_periods[stake.period_idx() as usize] += stake.amount();
        let complete_block = stake.complete_block();
        self.stakes_map.insert(*stake_id, stake);
        if height == complete_block {
            self.num_complete_stakes = self.num_complete_stakes.saturating_sub(1);
        } else {
            self.num_early_withdrawn_stakes = self.num_early_withdrawn_stakes.saturating_sub(1);
        }
        Ok(())
    }

    fn erase_stake_from_script_map(&mut self, stake: &StakeEntry) {
        if let Some(ids) = self.script_to_active_stakes.get_mut(stake.script()) {
            ids.remove(&stake.stake_id());
            if ids.is_empty() {
                self.script_to_active_stakes.remove(stake.script());
            }
        }
    }

    pub fn get_all_active_stakes(&self) -> Vec<StakeEntry> {
        if self.view_only {
            return self.base.get_all_active_stakes();
        }
        let mut stakes = Vec::with_capacity(self.active_stakes.len());
        for id in &self.active_stakes {
            match self.get_stake_entry(id) {
                Some(stake) => {
                    debug_assert!(stake.is_active() && !stake.is_complete());
                    stakes.push(stake);
                }
                None => error!("active stake {id} is missing from the database"),
            }
        }
        stakes
    }

    pub fn get_stakes_completed_at_height(&self, height: u32) -> Vec<StakeEntry> {
        if self.view_only {
            return self.base.get_stakes_completed_at_height(height);
        }
        let Some(ids) = self.stakes_completed_at_block_height.get(&height) else {
            return Vec::new();
        };
        let mut stakes = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_stake_entry(id) {
                Some(stake) => stakes.push(stake),
                None => error!("completed stake {id} is missing from the database"),
            }
        }
        stakes
    }

    pub fn get_active_stake_ids_for_script(&self, script: &Script) -> StakeIdsSet {
        if self.view_only {
            return self.base.get_active_stake_ids_for_script(script);
        }
        self.script_to_active_stakes
            .get(script)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_amounts_by_periods(&self) -> AmountByPeriodArray {
        if self.view_only {
            return self.base.get_amounts_by_periods();
        }
        self.amounts_by_periods
    }

    pub fn set_best_block(&mut self, hash: BlockHash) -> Result<(), StakesError> {
        self.require_editable()?;
        self.best_block_hash = hash;
        Ok(())
    }

    pub fn get_best_block(&self) -> BlockHash {
        if self.view_only {
            return self.base.get_best_block();
        }
        self.best_block_hash
    }

    /// The cache's own copy of the staking pool.
    pub fn staking_pool(&self) -> &StakingPool {
        &self.staking_pool
    }

    /// Mutable access to the pool copy; replaced into the base on flush.
    pub fn staking_pool_mut(&mut self) -> Result<&mut StakingPool, StakesError> {
        self.require_editable()?;
        Ok(&mut self.staking_pool)
    }

    pub fn get_num_complete_stakes(&self) -> u64 {
        self.num_complete_stakes
    }

    pub fn get_num_early_withdrawn_stakes(&self) -> u64 {
        self.num_early_withdrawn_stakes
    }

    /// Writes all accumulated changes into the base store and releases the
    /// writer lock. Idempotent: a second call is a no-op.
    pub fn flush(&mut self) -> Result<(), StakesError> {
        self.require_editable()?;
        if self.flushed {
            return Ok(());
        }
        let base = self.base;
        base.flush_from_cache(self)?;
        self.flushed = true;
        self.editor_guard = None;
        Ok(())
    }

    pub fn get_free_tx_info_for_script(&self, script: &Script) -> Option<FreeTxInfo> {
        if self.view_only {
            return self.base.get_free_tx_info_for_script(script);
        }
        self.free_tx_info.get(script).cloned()
    }

    /// Opens a fresh free-transaction window for a script, sized from its
    /// active stakes. Returns `None` if the script already has a window or
    /// has no active stakes.
    pub fn create_free_tx_info_for_script(
        &self,
        script: &Script,
        height: u32,
        params: &ChainParams,
    ) -> Option<FreeTxInfo> {
        if self.get_free_tx_info_for_script(script).is_some() {
            error!("free tx info for script already exists");
            return None;
        }
        let active_stakes = self.get_active_stake_ids_for_script(script);
        if active_stakes.is_empty() {
            return None;
        }
        let limit = self.calculate_free_tx_limit(&active_stakes, params);
        Some(FreeTxInfo::new(limit, height, active_stakes))
    }

    /// Charges a free transaction against the script's allowance.
    ///
    /// `height == 0` means mempool admission: the transaction is remembered
    /// and charged against the unconfirmed counter. `height > 0` means the
    /// transaction confirmed at that height: its bytes move to the
    /// confirmed counter. Fails when either quota would overflow or when
    /// the script's window has already closed.
    pub fn register_free_transaction(
        &mut self,
        script: &Script,
        tx: &Transaction,
        height: u32,
        params: &ChainParams,
    ) -> Result<(), StakesError> {
        self.require_editable()?;
        let mut free_tx_info = match self.get_free_tx_info_for_script(script) {
            Some(info) => info,
            None => {
                let info = self
                    .create_free_tx_info_for_script(script, height, params)
                    .ok_or(StakesError::NoActiveStakes)?;
                self.free_tx_info.insert(script.to_owned(), info.clone());
                info
            }
        };
        if height > 0 && free_tx_info.window_start_height() == 0 {
            free_tx_info.set_window_start_height(height);
        }
        if height != 0 && height > free_tx_info.window_end_height() {
            return Err(StakesError::WindowClosed);
        }

        // The set of active stakes may have changed since the window was
        // opened; refresh the snapshot and the limit derived from it.
        let active_stake_ids = self.get_active_stake_ids_for_script(script);
        if &active_stake_ids != free_tx_info.active_stake_ids() {
            let limit = self.calculate_free_tx_limit(&active_stake_ids, params);
            free_tx_info.set_active_stake_ids(active_stake_ids);
            free_tx_info.set_limit(limit);
        }

        let vsize = tx.vsize() as u32;
        if height == 0 {
            if !free_tx_info.add_unconfirmed_tx_id(tx.compute_txid(), vsize) {
                return Err(StakesError::FreeTxQuotaExceeded);
            }
        } else {
            if !free_tx_info.increase_used_confirmed(vsize) {
                return Err(StakesError::FreeTxQuotaExceeded);
            }
            free_tx_info.remove_unconfirmed_tx_id(&tx.compute_txid());
        }
        self.free_tx_info.insert(script.to_owned(), free_tx_info);
        Ok(())
    }

    /// Credits a disconnected free transaction's bytes back to the
    /// script's confirmed counter.
    pub fn undo_free_transaction(
        &mut self,
        script: &Script,
        tx: &Transaction,
    ) -> Result<(), StakesError> {
        self.require_editable()?;
        if let Some(info) = self.free_tx_info.get_mut(script) {
            let _ = info.decrease_used_confirmed(tx.vsize() as u32);
        }
        Ok(())
    }

    /// Remembers how many free-transaction bytes a block contained, for
    /// the difficulty retarget.
    pub fn add_free_tx_size_for_block(
        &mut self,
        hash: BlockHash,
        size: u32,
    ) -> Result<(), StakesError> {
        self.require_editable()?;
        self.block_free_tx_size_map.insert(hash, size);
        Ok(())
    }

    pub fn get_free_tx_size_for_block(&self, hash: &BlockHash) -> u32 {
        if self.view_only {
            return self.base.get_free_tx_size_for_block(hash);
        }
        match self.block_free_tx_size_map.get(hash) {
            Some(size) => *size,
            None => self.base.get_free_tx_size_for_block(hash),
        }
    }

    pub fn calculate_free_tx_limit_for_script(
        &self,
        script: &Script,
        params: &ChainParams,
    ) -> u32 {
        let active_stake_ids = self.get_active_stake_ids_for_script(script);
        self.calculate_free_tx_limit(&active_stake_ids, params)
    }

    fn calculate_free_tx_limit(&self, active_stake_ids: &StakeIdsSet, params: &ChainParams) -> u32 {
        let stakes: Vec<StakeEntry> = active_stake_ids
            .iter()
            .filter_map(|id| self.get_stake_entry(id))
            .collect();
        FreeTxLimitCalculator::limit_for_stakes(params, &stakes)
    }

    /// Going forward: migrates windows that closed at or before `height`
    /// into the per-height closing record and drops them. During a reorg:
    /// drops windows that only opened beyond the reorg target.
    pub fn remove_invalid_free_tx_infos(
        &mut self,
        height: u32,
        reorg: bool,
    ) -> Result<(), StakesError> {
        self.require_editable()?;
        let closing = &mut self.free_tx_info_end_height_map;
        self.free_tx_info.retain(|script, info| {
            if !reorg && info.window_end_height() <= height {
                closing
                    .entry(height)
                    .or_default()
                    .push((script.clone(), info.used_confirmed()));
                false
            } else {
                !(reorg && info.window_start_height() > height)
            }
        });
        Ok(())
    }

    pub fn get_free_tx_windows_completed_at_height(
        &self,
        height: u32,
    ) -> ClosedFreeTxWindowInfoVector {
        if self.view_only {
            return self.base.get_free_tx_windows_completed_at_height(height);
        }
        match self.free_tx_info_end_height_map.get(&height) {
            Some(windows) => windows.clone(),
            None => self.base.get_free_tx_windows_completed_at_height(height),
        }
    }

    /// Inverse of the forward branch of [`Self::remove_invalid_free_tx_infos`]:
    /// rebuilds a window per preserved (script, used-bytes) pair when the
    /// closing block is disconnected.
    pub fn reactivate_free_tx_infos(
        &mut self,
        height: u32,
        params: &ChainParams,
    ) -> Result<(), StakesError> {
        self.require_editable()?;
        let closed_windows = self.get_free_tx_windows_completed_at_height(height);
        for (script, used_confirmed) in closed_windows {
            let Some(mut info) =
                self.create_free_tx_info_for_script(&script, height - BLOCKS_PER_DAY, params)
            else {
                warn!("script of a closed free tx window has no active stakes left");
                continue;
            };
            info.set_used_confirmed(used_confirmed);
            self.free_tx_info.insert(script, info);
        }
        self.free_tx_window_end_heights_to_remove.insert(height);
        Ok(())
    }

    pub fn get_gp_for_script(&self, script: &Script) -> Amount {
        if self.view_only {
            return self.base.get_gp_for_script(script);
        }
        match self.gp_map.get(script) {
            Some(amount) => *amount,
            None => self.base.get_gp_for_script(script),
        }
    }

    pub fn set_gp_for_script(&mut self, script: &Script, amount: Amount) -> Result<(), StakesError> {
        self.require_editable()?;
        self.gp_map.insert(script.to_owned(), amount);
        Ok(())
    }
}
