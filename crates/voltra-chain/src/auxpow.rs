//! Merged-mining (AuxPoW) validation.
//!
//! An AuxPoW block does not satisfy its own difficulty; instead a parent
//! chain block does, and that parent's coinbase commits to our block hash.
//! The commitment is a fixed marker followed by the root of a small merkle
//! tree of merge-mined chains, the tree size and a nonce. The nonce and
//! our chain ID pin the slot our chain must occupy in that tree, so the
//! same parent work cannot be replayed for one chain twice.

use bitcoin::hashes::sha256d;
use bitcoin::hashes::Hash;
use bitcoin::hashes::HashEngine;
use bitcoin::script::Builder;
use bitcoin::script::PushBytesBuf;
use bitcoin::absolute::LockTime;
use bitcoin::block::Header as PureHeader;
use bitcoin::block::Version;
use bitcoin::transaction;
use bitcoin::BlockHash;
use bitcoin::OutPoint;
use bitcoin::Sequence;
use bitcoin::Transaction;
use bitcoin::TxIn;
use bitcoin::TxMerkleNode;
use bitcoin::Witness;

use crate::block::AuxBlockHeader;
use crate::block::BlockHeader;
use crate::block::VERSION_CHAIN_START;
use crate::chainparams::ChainParams;
use crate::error::AuxPowError;
use crate::error::PowError;
use crate::pow::check_proof_of_work;

/// Marker announcing merge-mining data in a parent coinbase script.
pub const MERGED_MINING_HEADER: [u8; 4] = [0xfa, 0xbe, b'm', b'm'];

/// Longest accepted chain merkle branch; keeps `1 << height` within a
/// 32-bit word.
const MAX_CHAIN_MERKLE_BRANCH: usize = 30;

fn parent_chain_id(parent: &PureHeader) -> i32 {
    parent.version.to_consensus() / VERSION_CHAIN_START
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn decode_le32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Folds a merkle branch over `hash`, consuming one bit of `index` per
/// level. An index of -1 yields the zero hash.
pub fn check_merkle_branch(
    hash: sha256d::Hash,
    merkle_branch: &[TxMerkleNode],
    index: i32,
) -> sha256d::Hash {
    if index == -1 {
        return sha256d::Hash::all_zeros();
    }
    let mut hash = hash;
    let mut index = index;
    for node in merkle_branch {
        let mut engine = sha256d::Hash::engine();
        if index & 1 != 0 {
            engine.input(node.as_byte_array());
            engine.input(hash.as_byte_array());
        } else {
            engine.input(hash.as_byte_array());
            engine.input(node.as_byte_array());
        }
        hash = sha256d::Hash::from_engine(engine);
        index >>= 1;
    }
    hash
}

/// The merkle slot a chain must occupy in a commitment tree of height
/// `merkle_height`, pseudo-random but fixed per (nonce, chain) pair.
///
/// The arithmetic deliberately wraps mod 2^32; the final reduction is
/// against a power of two, so the result is consistent even on platforms
/// that used to do this in 64 bits. `merkle_height` never exceeds 30.
pub fn get_expected_index(nonce: u32, chain_id: i32, merkle_height: u32) -> i32 {
    let mut rand = nonce;
    rand = rand.wrapping_mul(1103515245).wrapping_add(12345);
    rand = rand.wrapping_add(chain_id as u32);
    rand = rand.wrapping_mul(1103515245).wrapping_add(12345);
    (rand % (1u32 << merkle_height)) as i32
}

impl AuxBlockHeader {
    /// Verifies that this AuxPoW commits the parent chain's work to
    /// `hash_aux_block` for the chain identified by `chain_id`.
    ///
    /// Side-effect free; the parent block's own PoW is checked separately
    /// against our difficulty.
    pub fn check(
        &self,
        hash_aux_block: BlockHash,
        chain_id: i32,
        params: &ChainParams,
    ) -> Result<(), AuxPowError> {
        if params.strict_chain_id && parent_chain_id(&self.parent_block) == chain_id {
            return Err(AuxPowError::ParentHasOurChainId);
        }

        if self.chain_merkle_branch.len() > MAX_CHAIN_MERKLE_BRANCH {
            return Err(AuxPowError::ChainMerkleBranchTooLong);
        }

        let root_hash = check_merkle_branch(
            hash_aux_block.to_raw_hash(),
            &self.chain_merkle_branch,
            self.chain_index,
        );
        let mut root_hash_le = root_hash.to_byte_array().to_vec();
        root_hash_le.reverse(); // correct endian

        // Check that we are in the parent block merkle tree
        if check_merkle_branch(
            self.coinbase_tx.compute_txid().to_raw_hash(),
            &self.merkle_branch,
            0,
        ) != self.parent_block.merkle_root.to_raw_hash()
        {
            return Err(AuxPowError::MerkleRootIncorrect);
        }

        let script = match self.coinbase_tx.input.first() {
            Some(input) => input.script_sig.as_bytes(),
            None => return Err(AuxPowError::CoinbaseHasNoInputs),
        };

        let pc_head = find_subslice(script, &MERGED_MINING_HEADER);
        let pc = match find_subslice(script, &root_hash_le) {
            Some(pc) => pc,
            None => return Err(AuxPowError::MissingChainMerkleRoot),
        };

        match pc_head {
            Some(head) => {
                // Enforce only one chain merkle root by checking that a
                // single instance of the merged mining header exists just
                // before.
                if find_subslice(&script[head + 1..], &MERGED_MINING_HEADER).is_some() {
                    return Err(AuxPowError::MultipleMergedMiningHeaders);
                }
                if head + MERGED_MINING_HEADER.len() != pc {
                    return Err(AuxPowError::MergedMiningHeaderMisplaced);
                }
            }
            None => return Err(AuxPowError::MissingMergedMiningHeader),
        }

        // A nonce and the tree size pin us to a deterministic slot in the
        // merkle leaves.
        let after_root = pc + root_hash_le.len();
        if script.len() - after_root < 8 {
            return Err(AuxPowError::MissingTreeSizeAndNonce);
        }
        let size = decode_le32(&script[after_root..]);
        let merkle_height = self.chain_merkle_branch.len() as u32;
        if size != 1u32 << merkle_height {
            return Err(AuxPowError::TreeSizeMismatch);
        }
        let nonce = decode_le32(&script[after_root + 4..]);
        if self.chain_index != get_expected_index(nonce, chain_id, merkle_height) {
            return Err(AuxPowError::WrongIndex);
        }

        Ok(())
    }
}

/// Validates a block header's proof of work, dispatching between the
/// block's own hash and the merge-mined parent's hash depending on the
/// version's aux flag.
pub fn check_header_proof_of_work(
    header: &BlockHeader,
    params: &ChainParams,
) -> Result<(), PowError> {
    if !header.is_aux_pow() {
        if header.aux_header.is_some() {
            return Err(PowError::UnexpectedAuxHeader);
        }
        return check_proof_of_work(header.block_hash(), header.header.bits, params);
    }

    if params.strict_chain_id && header.chain_id() != params.aux_chain_id {
        return Err(PowError::WrongChainId);
    }
    let aux = header
        .aux_header
        .as_deref()
        .ok_or(PowError::MissingAuxHeader)?;
    aux.check(header.block_hash(), header.chain_id(), params)?;
    check_proof_of_work(aux.parent_block_hash(), header.header.bits, params)
}

/// Builds the minimal AuxPoW for `header`: a fake parent block whose only
/// transaction is a coinbase carrying the commitment, with a nonce search
/// over at most 256 candidates against the header's own difficulty. Used
/// by tests and by miners bootstrapping a merge-mined template.
pub fn create_aux_block_header(header: &BlockHeader, params: &ChainParams) -> AuxBlockHeader {
    debug_assert!(header.is_aux_pow());

    // Build a minimal coinbase script input for merge-mining: the marker,
    // our hash (reversed endian, tree of size one) and a zero nonce.
    let block_hash = header.block_hash();
    let mut data = MERGED_MINING_HEADER.to_vec();
    let mut hash_le = block_hash.to_byte_array().to_vec();
    hash_le.reverse();
    data.extend_from_slice(&hash_le);
    data.push(1);
    data.extend_from_slice(&[0u8; 7]);
    let push = PushBytesBuf::try_from(data).expect("commitment data is well below push limits");
    let script_sig = Builder::new().push_slice(push).into_script();

    // Fake a parent-block coinbase with just the required input script and
    // no outputs.
    let coinbase = Transaction {
        version: transaction::Version(1),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig,
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: Vec::new(),
    };

    // A single-transaction block's merkle root is the coinbase txid.
    let mut parent_block = PureHeader {
        version: Version::from_consensus(1),
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root: TxMerkleNode::from_raw_hash(coinbase.compute_txid().to_raw_hash()),
        time: 0,
        bits: header.header.bits,
        nonce: 0,
    };
    for nonce in 0..=255 {
        parent_block.nonce = nonce;
        if check_proof_of_work(parent_block.block_hash(), header.header.bits, params).is_ok() {
            break;
        }
    }

    let mut aux_header = AuxBlockHeader::new(coinbase);
    aux_header.chain_index = 0;
    aux_header.parent_block = parent_block;
    aux_header
}

/// Flags `header` as AuxPoW and attaches a freshly built minimal proof.
pub fn init_aux_block_header(header: &mut BlockHeader, params: &ChainParams) {
    // The aux flag has to be set before hashing, since the commitment
    // covers the final block hash.
    header.set_aux_pow_version(true);
    let aux_header = create_aux_block_header(header, params);
    header.set_aux_block_header(Some(aux_header));
}
