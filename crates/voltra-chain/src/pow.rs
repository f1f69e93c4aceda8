//! Proof-of-work validation and the LWMA-1 difficulty retarget.
//!
//! Targets are manipulated as 256-bit unsigned integers. The retarget is a
//! linearly-weighted moving average over the most recent window of blocks
//! (LWMA-1 by Zawy, a modification of Tom Harding's WT-144), additionally
//! weighted by the volume of fee-exempt transactions: a block that carries
//! free transactions is allowed a proportionally easier target, and the
//! averaging step strips that scaling again to recover base difficulty.

use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use bitcoin::CompactTarget;
use primitive_types::U256;

use crate::chainparams::ChainParams;
use crate::error::PowError;
use crate::staking::stakes_db::StakesDbCache;

/// Header data of one block as seen by the retarget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainEntry {
    pub height: u32,
    pub time: u32,
    pub bits: CompactTarget,
    pub hash: BlockHash,
}

/// Ancestor-by-height lookup over the branch ending at the validated tip.
/// The chain index of the node implements this; tests use plain slices.
pub trait ChainLookup {
    fn ancestor(&self, height: u32) -> Option<ChainEntry>;
}

impl ChainLookup for [ChainEntry] {
    fn ancestor(&self, height: u32) -> Option<ChainEntry> {
        self.get(height as usize)
            .copied()
            .filter(|entry| entry.height == height)
    }
}

impl ChainLookup for Vec<ChainEntry> {
    fn ancestor(&self, height: u32) -> Option<ChainEntry> {
        self.as_slice().ancestor(height)
    }
}

/// Expands a compact-encoded target. Returns the value together with the
/// negative and overflow flags of the encoding.
pub fn target_from_compact(compact: u32) -> (U256, bool, bool) {
    let size = compact >> 24;
    let mut word = compact & 0x007f_ffff;
    let value = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        let shift = 8 * (size - 3);
        if shift >= 256 {
            U256::zero()
        } else {
            U256::from(word) << shift
        }
    };
    let negative = word != 0 && (compact & 0x0080_0000) != 0;
    let overflow = word != 0
        && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32));
    (value, negative, overflow)
}

/// Compresses a target into its compact encoding. Only the three most
/// significant mantissa bytes survive, so the result never exceeds the
/// input.
pub fn target_to_compact(target: U256) -> u32 {
    let mut size = (target.bits() + 7) / 8;
    let mut compact = if size <= 3 {
        (target.low_u64() << (8 * (3 - size))) as u32
    } else {
        (target >> (8 * (size - 3))).low_u32()
    };
    // The sign bit of the mantissa must stay clear; borrow an exponent
    // byte if it is not.
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | ((size as u32) << 24)
}

/// Whether `hash` satisfies the proof-of-work requirement claimed by
/// `bits`.
pub fn check_proof_of_work(
    hash: BlockHash,
    bits: CompactTarget,
    params: &ChainParams,
) -> Result<(), PowError> {
    let (target, negative, overflow) = target_from_compact(bits.to_consensus());

    // Check range
    if negative || target.is_zero() || overflow || target > params.pow_limit {
        return Err(PowError::InvalidTarget);
    }

    // Check proof of work matches claimed amount
    if U256::from_little_endian(hash.as_byte_array()) > target {
        return Err(PowError::HashAboveTarget);
    }
    Ok(())
}

/// Computes the compact target the block after `tip` must meet.
///
/// The LWMA base target is scaled up by the free-transaction bytes the new
/// block carries: the more fee-exempt volume a miner includes, the easier
/// its target.
pub fn get_next_work_required<C: ChainLookup + ?Sized>(
    chain: &C,
    tip: &ChainEntry,
    new_block_time: u32,
    params: &ChainParams,
    stakes: &StakesDbCache,
    free_tx_size_bytes: u32,
) -> Result<CompactTarget, PowError> {
    if params.pow_allow_min_difficulty_blocks {
        // Special difficulty rule for testnet: if the new block's
        // timestamp is more than twice the target spacing behind, allow
        // mining of a min-difficulty block.
        if new_block_time as i64 > tip.time as i64 + params.pow_target_spacing * 2 {
            return Ok(CompactTarget::from_consensus(target_to_compact(
                params.pow_limit,
            )));
        }
    }
    if params.pow_no_retargeting {
        return Ok(tip.bits);
    }
    let base = lwma_calculate_next_base_work_required(chain, tip, params, stakes)?;
    let scale = params.free_tx_max_size_in_block * params.free_tx_difficulty_coefficient;
    let (scaled, _) = base.overflowing_mul(U256::from(scale + free_tx_size_bytes as u64));
    let target = scaled / U256::from(scale);
    Ok(CompactTarget::from_consensus(target_to_compact(target)))
}

/// The legacy timespan retarget, kept for header contexts that predate the
/// LWMA activation.
pub fn calc_next_work_required(
    tip: &ChainEntry,
    first_block_time: i64,
    params: &ChainParams,
) -> CompactTarget {
    if params.pow_no_retargeting {
        return tip.bits;
    }

    // Limit adjustment step
    let mut actual_timespan = tip.time as i64 - first_block_time;
    if actual_timespan < params.pow_target_timespan / 4 {
        actual_timespan = params.pow_target_timespan / 4;
    }
    if actual_timespan > params.pow_target_timespan * 4 {
        actual_timespan = params.pow_target_timespan * 4;
    }

    // Retarget
    let (target, _, _) = target_from_compact(tip.bits.to_consensus());
    let (scaled, _) = target.overflowing_mul(U256::from(actual_timespan as u64));
    let mut new_target = scaled / U256::from(params.pow_target_timespan as u64);
    if new_target > params.pow_limit {
        new_target = params.pow_limit;
    }
    CompactTarget::from_consensus(target_to_compact(new_target))
}

/// The LWMA-1 base target for the block after `tip`, before free-tx
/// scaling.
pub fn lwma_calculate_next_base_work_required<C: ChainLookup + ?Sized>(
    chain: &C,
    tip: &ChainEntry,
    params: &ChainParams,
    stakes: &StakesDbCache,
) -> Result<U256, PowError> {
    let t = params.pow_target_spacing;
    let n = params.lwma_averaging_window;

    // k normalizes the weighted average of solvetimes.
    let k = n * (n + 1) * t / 2;

    let height = tip.height as i64;

    // New coins just give away the first N blocks before using this
    // algorithm.
    if height < n {
        return Ok(params.pow_limit);
    }

    let scale = params.free_tx_max_size_in_block * params.free_tx_difficulty_coefficient;

    let mut previous_timestamp = chain
        .ancestor((height - n) as u32)
        .ok_or(PowError::MissingAncestor)?
        .time as i64;
    let mut avg_target = U256::zero();
    let mut sum_weighted_solvetimes: i64 = 0;
    let mut j: i64 = 0;

    // Loop through the N most recent blocks.
    for i in (height - n + 1)..=height {
        let block = chain.ancestor(i as u32).ok_or(PowError::MissingAncestor)?;

        // Prevent solvetimes from being negative in a safe way. It must be
        // done like this; do not attempt anything like
        // `if solvetime < 0 { solvetime = 0 }`. The +1 ensures new coins
        // do not calculate a zero next target.
        let this_timestamp = if block.time as i64 > previous_timestamp {
            block.time as i64
        } else {
            previous_timestamp + 1
        };
        let solvetime = this_timestamp - previous_timestamp;
        previous_timestamp = this_timestamp;

        // Give linearly higher weight to more recent solvetimes.
        j += 1;
        sum_weighted_solvetimes += solvetime * j;

        // Find the base difficulty from the final difficulty and the
        // block's free transaction volume.
        let (mut target, _, _) = target_from_compact(block.bits.to_consensus());
        let free_tx_bytes = stakes.get_free_tx_size_for_block(&block.hash) as u64;
        let (scaled, _) = target.overflowing_mul(U256::from(scale));
        target = scaled / U256::from(scale + free_tx_bytes);

        // Dividing by k here prevents an overflow below.
        let term = target / U256::from(n as u64) / U256::from(k as u64);
        let (sum, _) = avg_target.overflowing_add(term);
        avg_target = sum;
    }

    // The desired equation is nextTarget = avgTarget * sumWeightedSolvetimes / k,
    // but 1/k was moved into the loop above to prevent overflow on new coins.
    let (mut next_target, _) =
        avg_target.overflowing_mul(U256::from(sum_weighted_solvetimes as u64));

    if next_target > params.pow_limit {
        next_target = params.pow_limit;
    }
    Ok(next_target)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::chainparams::Network;
    use crate::staking::stakes_db::StakesDb;

    fn hash_from_low_u64(value: u64) -> BlockHash {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&value.to_le_bytes());
        BlockHash::from_byte_array(bytes)
    }

    /// A chain of `length` blocks at fixed spacing, all at the pow limit.
    fn fixed_spacing_chain(length: u32, spacing: u32, params: &ChainParams) -> Vec<ChainEntry> {
        let bits = CompactTarget::from_consensus(target_to_compact(params.pow_limit));
        (0..length)
            .map(|height| ChainEntry {
                height,
                time: 1_600_000_000 + height * spacing,
                bits,
                hash: hash_from_low_u64(height as u64),
            })
            .collect()
    }

    #[test]
    fn test_compact_roundtrip_vectors() {
        // vectors from the reference implementation of the compact format
        for (compact, expected) in [
            (0x01003456u32, 0x00000000u32),
            (0x01123456, 0x01120000),
            (0x02123456, 0x02123400),
            (0x03123456, 0x03123456),
            (0x04123456, 0x04123456),
            (0x05009234, 0x05009234),
            (0x20123456, 0x20123456),
        ] {
            let (target, negative, overflow) = target_from_compact(compact);
            assert!(!negative && !overflow, "{compact:08x}");
            assert_eq!(target_to_compact(target), expected, "{compact:08x}");
        }
    }

    #[test]
    fn test_compact_flags() {
        // sign bit set on a nonzero mantissa
        let (_, negative, overflow) = target_from_compact(0x01fedcba);
        assert!(negative);
        assert!(!overflow);
        // exponent walks the mantissa off the 256-bit range
        let (_, negative, overflow) = target_from_compact(0xff123456);
        assert!(!negative);
        assert!(overflow);
        let (_, _, overflow) = target_from_compact(0x21120000);
        assert!(overflow);
        // zero mantissa never sets flags
        let (target, negative, overflow) = target_from_compact(0xff800000);
        assert!(target.is_zero() && !negative && !overflow);
    }

    #[test]
    fn test_compact_roundtrip_never_grows() {
        for _ in 0..500 {
            let words = [
                rand::random::<u64>(),
                rand::random::<u64>(),
                rand::random::<u64>(),
                rand::random::<u64>(),
            ];
            let target = U256(words) >> (rand::random::<u32>() % 200) as usize;
            let (decoded, negative, overflow) = target_from_compact(target_to_compact(target));
            assert!(!negative && !overflow);
            assert!(decoded <= target);
            // targets with at most 24 mantissa bits survive exactly
            if target.bits() <= 24 {
                assert_eq!(decoded, target);
            }
        }
    }

    #[test]
    fn test_check_proof_of_work() {
        let params = ChainParams::from(Network::Mainnet);
        let pow_limit_bits = CompactTarget::from_consensus(target_to_compact(params.pow_limit));

        // the zero hash is below any valid target
        assert!(check_proof_of_work(hash_from_low_u64(0), pow_limit_bits, &params).is_ok());
        // all-ones hash is above the mainnet limit
        let ones = BlockHash::from_byte_array([0xff; 32]);
        assert_eq!(
            check_proof_of_work(ones, pow_limit_bits, &params),
            Err(PowError::HashAboveTarget)
        );
        // zero, negative and overflowing targets are rejected outright
        for bad_bits in [0x00000000u32, 0x01803456, 0xff123456] {
            assert_eq!(
                check_proof_of_work(
                    hash_from_low_u64(0),
                    CompactTarget::from_consensus(bad_bits),
                    &params
                ),
                Err(PowError::InvalidTarget)
            );
        }
        // a target above the pow limit is invalid even for a tiny hash
        let easy = CompactTarget::from_consensus(target_to_compact(U256::MAX >> 1));
        assert_eq!(
            check_proof_of_work(hash_from_low_u64(0), easy, &params),
            Err(PowError::InvalidTarget)
        );
    }

    #[test]
    fn test_check_proof_of_work_is_monotone() {
        let params = ChainParams::from(Network::Regtest);
        let hash = hash_from_low_u64(0xffff_ffff);
        let harder = CompactTarget::from_consensus(target_to_compact(U256::from(1u64) << 32));
        let easier = CompactTarget::from_consensus(target_to_compact(U256::from(1u64) << 48));
        // accepted at the harder target implies accepted at the easier one
        assert!(check_proof_of_work(hash, harder, &params).is_ok());
        assert!(check_proof_of_work(hash, easier, &params).is_ok());
        // rejected at the easier target implies rejected at the harder one
        let big_hash = hash_from_low_u64(u64::MAX);
        assert!(check_proof_of_work(big_hash, easier, &params).is_err());
        assert!(check_proof_of_work(big_hash, harder, &params).is_err());
    }

    #[test]
    fn test_lwma_below_window_returns_pow_limit() {
        let dir = TempDir::new().unwrap();
        let db = StakesDb::new(dir.path()).unwrap();
        let stakes = StakesDbCache::new_view_only(&db);
        let params = ChainParams::from(Network::Mainnet);

        let chain = fixed_spacing_chain(30, 600, &params);
        let tip = chain[29];
        let next =
            lwma_calculate_next_base_work_required(&chain, &tip, &params, &stakes).unwrap();
        assert_eq!(next, params.pow_limit);
    }

    #[test]
    fn test_lwma_steady_state_holds_near_the_limit() {
        let dir = TempDir::new().unwrap();
        let db = StakesDb::new(dir.path()).unwrap();
        let stakes = StakesDbCache::new_view_only(&db);
        let params = ChainParams::from(Network::Mainnet);

        let chain = fixed_spacing_chain(100, 600, &params);
        let tip = chain[99];
        let next =
            lwma_calculate_next_base_work_required(&chain, &tip, &params, &stakes).unwrap();
        // Ideal solvetimes reproduce the input target up to integer
        // truncation; the clamp keeps it at or below the limit.
        assert!(next <= params.pow_limit);
        assert!(next > params.pow_limit >> 1);
    }

    #[test]
    fn test_lwma_fast_blocks_raise_difficulty() {
        let dir = TempDir::new().unwrap();
        let db = StakesDb::new(dir.path()).unwrap();
        let stakes = StakesDbCache::new_view_only(&db);
        let params = ChainParams::from(Network::Mainnet);

        let steady = fixed_spacing_chain(100, 600, &params);
        let fast = fixed_spacing_chain(100, 300, &params);
        let steady_next =
            lwma_calculate_next_base_work_required(&steady, &steady[99], &params, &stakes)
                .unwrap();
        let fast_next =
            lwma_calculate_next_base_work_required(&fast, &fast[99], &params, &stakes).unwrap();
        assert!(fast_next < steady_next);
    }

    #[test]
    fn test_lwma_strips_free_tx_scaling() {
        let dir = TempDir::new().unwrap();
        let db = StakesDb::new(dir.path()).unwrap();
        let params = ChainParams::from(Network::Mainnet);

        let chain = fixed_spacing_chain(100, 600, &params);
        let plain = {
            let stakes = StakesDbCache::new_view_only(&db);
            lwma_calculate_next_base_work_required(&chain, &chain[99], &params, &stakes).unwrap()
        };
        // Record free-transaction volume for every window block; the
        // recovered base targets shrink accordingly.
        {
            let mut cache = StakesDbCache::new(&db);
            for entry in &chain {
                cache.add_free_tx_size_for_block(entry.hash, 50_000).unwrap();
            }
            cache.flush().unwrap();
        }
        let discounted = {
            let stakes = StakesDbCache::new_view_only(&db);
            lwma_calculate_next_base_work_required(&chain, &chain[99], &params, &stakes).unwrap()
        };
        assert!(discounted < plain);
    }

    #[test]
    fn test_next_work_scales_with_free_tx_bytes() {
        let dir = TempDir::new().unwrap();
        let db = StakesDb::new(dir.path()).unwrap();
        let stakes = StakesDbCache::new_view_only(&db);
        let params = ChainParams::from(Network::Mainnet);

        // a fast chain keeps the LWMA result clear of the pow-limit clamp
        let chain = fixed_spacing_chain(100, 300, &params);
        let tip = chain[99];
        let without = get_next_work_required(&chain, &tip, tip.time + 600, &params, &stakes, 0)
            .unwrap();
        let with = get_next_work_required(&chain, &tip, tip.time + 600, &params, &stakes, 50_000)
            .unwrap();
        let (without_target, _, _) = target_from_compact(without.to_consensus());
        let (with_target, _, _) = target_from_compact(with.to_consensus());
        // free transactions buy an easier target
        assert!(with_target > without_target);
    }

    #[test]
    fn test_testnet_min_difficulty_rule() {
        let dir = TempDir::new().unwrap();
        let db = StakesDb::new(dir.path()).unwrap();
        let stakes = StakesDbCache::new_view_only(&db);
        let params = ChainParams::from(Network::Testnet);

        let chain = fixed_spacing_chain(100, 600, &params);
        let tip = chain[99];
        // stale tip: a min-difficulty block is allowed
        let next = get_next_work_required(
            &chain,
            &tip,
            tip.time + 2 * 600 + 1,
            &params,
            &stakes,
            0,
        )
        .unwrap();
        assert_eq!(next.to_consensus(), target_to_compact(params.pow_limit));
    }

    #[test]
    fn test_regtest_never_retargets() {
        let dir = TempDir::new().unwrap();
        let db = StakesDb::new(dir.path()).unwrap();
        let stakes = StakesDbCache::new_view_only(&db);
        let params = ChainParams::from(Network::Regtest);

        let bits = CompactTarget::from_consensus(0x207fffff);
        let tip = ChainEntry {
            height: 500,
            time: 1_600_000_000,
            bits,
            hash: hash_from_low_u64(500),
        };
        let next =
            get_next_work_required(&[] as &[ChainEntry], &tip, tip.time + 600, &params, &stakes, 0)
                .unwrap();
        assert_eq!(next, bits);
    }

    #[test]
    fn test_missing_ancestor_is_an_error() {
        let dir = TempDir::new().unwrap();
        let db = StakesDb::new(dir.path()).unwrap();
        let stakes = StakesDbCache::new_view_only(&db);
        let params = ChainParams::from(Network::Mainnet);

        let chain = fixed_spacing_chain(50, 600, &params);
        let tip = ChainEntry {
            height: 100,
            time: 1_600_060_000,
            bits: chain[49].bits,
            hash: hash_from_low_u64(100),
        };
        assert_eq!(
            lwma_calculate_next_base_work_required(&chain, &tip, &params, &stakes),
            Err(PowError::MissingAncestor)
        );
    }

    #[test]
    fn test_legacy_retarget_clamps_timespan() {
        let params = ChainParams::from(Network::Mainnet);
        let bits = CompactTarget::from_consensus(0x1b0404cb);
        let tip = ChainEntry {
            height: 2016,
            time: 1_600_000_000,
            bits,
            hash: hash_from_low_u64(1),
        };
        // instant blocks: difficulty can rise at most fourfold
        let fast = calc_next_work_required(&tip, tip.time as i64, &params);
        let (fast_target, _, _) = target_from_compact(fast.to_consensus());
        let (base_target, _, _) = target_from_compact(bits.to_consensus());
        assert!(fast_target <= base_target / 4);
        assert!(fast_target > base_target / 8);
        // absurdly slow blocks: difficulty can fall at most fourfold
        let slow = calc_next_work_required(
            &tip,
            tip.time as i64 - 100 * params.pow_target_timespan,
            &params,
        );
        let (slow_target, _, _) = target_from_compact(slow.to_consensus());
        assert!(slow_target <= base_target * 4);
        assert!(slow_target > base_target * 2);
    }
}
