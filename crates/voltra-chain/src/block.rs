//! Block headers with an optional merged-mining attachment.
//!
//! The version field packs three things: the low byte is the base version,
//! bit 8 flags an AuxPoW block and the high 16 bits carry the chain ID
//! used in merged mining. The block hash covers only the 80-byte pure
//! header; the AuxPoW attachment travels after it on the wire but never
//! enters the hash.

use bitcoin::block::Header as PureHeader;
use bitcoin::block::Version;
use bitcoin::consensus::encode;
use bitcoin::consensus::Decodable;
use bitcoin::consensus::Encodable;
use bitcoin::hashes::Hash;
use bitcoin::io;
use bitcoin::absolute::LockTime;
use bitcoin::transaction;
use bitcoin::BlockHash;
use bitcoin::CompactTarget;
use bitcoin::OutPoint;
use bitcoin::ScriptBuf;
use bitcoin::Sequence;
use bitcoin::Transaction;
use bitcoin::TxIn;
use bitcoin::TxMerkleNode;
use bitcoin::Witness;

/// Version bit flagging a merge-mined block.
pub const VERSION_AUXPOW: i32 = 1 << 8;

/// First version bit reserved for the merged-mining chain ID.
pub const VERSION_CHAIN_START: i32 = 1 << 16;

/// The proof a parent chain did work on top of one of our blocks.
///
/// The parent block's coinbase commits to our block hash; the two merkle
/// branches connect that commitment to the parent header on which the
/// proof of work was actually performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxBlockHeader {
    /// The parent block's coinbase transaction.
    pub coinbase_tx: Transaction,
    /// The merkle branch of the coinbase tx to the parent block's root.
    pub merkle_branch: Vec<TxMerkleNode>,
    /// The merkle branch connecting the aux block to our slot in the
    /// parent coinbase commitment.
    pub chain_merkle_branch: Vec<TxMerkleNode>,
    /// Merkle tree index of the aux block header in the commitment.
    pub chain_index: i32,
    /// Parent block header, on which the real PoW is done.
    pub parent_block: PureHeader,
}

impl AuxBlockHeader {
    pub fn new(coinbase_tx: Transaction) -> Self {
        AuxBlockHeader {
            coinbase_tx,
            merkle_branch: Vec::new(),
            chain_merkle_branch: Vec::new(),
            chain_index: 0,
            parent_block: zeroed_pure_header(),
        }
    }

    /// The parent block hash; this is what the PoW check runs against.
    pub fn parent_block_hash(&self) -> BlockHash {
        self.parent_block.block_hash()
    }
}

impl Default for AuxBlockHeader {
    fn default() -> Self {
        // A transaction without inputs does not survive the wire encoding
        // (its zero input count reads back as a segwit marker), so the
        // placeholder coinbase carries one null input.
        AuxBlockHeader::new(Transaction {
            version: transaction::Version(2),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: Vec::new(),
        })
    }
}

fn zeroed_pure_header() -> PureHeader {
    PureHeader {
        version: Version::from_consensus(0),
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root: TxMerkleNode::all_zeros(),
        time: 0,
        bits: CompactTarget::from_consensus(0),
        nonce: 0,
    }
}

impl Encodable for AuxBlockHeader {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = self.coinbase_tx.consensus_encode(w)?;
        // The coinbase merkle-tx hashBlock field is never verified or used;
        // the parent block is known directly. It is written as zero so the
        // format stays backwards compatible but compresses well.
        len += BlockHash::all_zeros().consensus_encode(w)?;
        len += self.merkle_branch.consensus_encode(w)?;
        // The index of the parent coinbase tx is always zero.
        len += 0i32.consensus_encode(w)?;
        len += self.chain_merkle_branch.consensus_encode(w)?;
        len += self.chain_index.consensus_encode(w)?;
        len += self.parent_block.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for AuxBlockHeader {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let coinbase_tx = Transaction::consensus_decode(r)?;
        let _hash_block = BlockHash::consensus_decode(r)?;
        let merkle_branch = Vec::<TxMerkleNode>::consensus_decode(r)?;
        let _index = i32::consensus_decode(r)?;
        let chain_merkle_branch = Vec::<TxMerkleNode>::consensus_decode(r)?;
        let chain_index = i32::consensus_decode(r)?;
        let parent_block = PureHeader::consensus_decode(r)?;
        Ok(AuxBlockHeader {
            coinbase_tx,
            merkle_branch,
            chain_merkle_branch,
            chain_index,
            parent_block,
        })
    }
}

/// A full block header: the hashed 80 bytes plus the optional AuxPoW
/// attachment announced by the version's aux flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// The pure header; its serialization defines the block hash.
    pub header: PureHeader,
    /// Merged-mining proof, present iff the version flags AuxPoW.
    pub aux_header: Option<Box<AuxBlockHeader>>,
}

impl BlockHeader {
    pub fn new(header: PureHeader) -> Self {
        BlockHeader {
            header,
            aux_header: None,
        }
    }

    /// The block hash, defined over the pure header only.
    pub fn block_hash(&self) -> BlockHash {
        self.header.block_hash()
    }

    pub fn version(&self) -> i32 {
        self.header.version.to_consensus()
    }

    fn set_version(&mut self, version: i32) {
        self.header.version = Version::from_consensus(version);
    }

    /// The base version, without the aux flag and chain ID.
    pub fn base_version(&self) -> i32 {
        Self::base_version_of(self.version())
    }

    pub fn base_version_of(version: i32) -> i32 {
        version % VERSION_AUXPOW
    }

    /// Initialises the version from a base version and chain ID. Must only
    /// be called while the aux flag is unset.
    pub fn set_base_version(&mut self, base_version: i32, chain_id: i32) {
        debug_assert!(base_version >= 1 && base_version < VERSION_AUXPOW);
        debug_assert!(!self.is_aux_pow());
        self.set_version(base_version | (chain_id * VERSION_CHAIN_START));
    }

    /// The merged-mining chain ID encoded in the version.
    pub fn chain_id(&self) -> i32 {
        self.version() / VERSION_CHAIN_START
    }

    /// Replaces the chain ID, leaving base version and aux flag alone.
    pub fn set_chain_id(&mut self, chain_id: i32) {
        let mut version = self.version() % VERSION_CHAIN_START;
        version |= chain_id * VERSION_CHAIN_START;
        self.set_version(version);
    }

    /// Whether the version flags this block as merge-mined.
    pub fn is_aux_pow(&self) -> bool {
        self.version() & VERSION_AUXPOW != 0
    }

    /// Sets or clears the aux flag without touching the attachment.
    pub fn set_aux_pow_version(&mut self, is_aux_pow: bool) {
        let version = if is_aux_pow {
            self.version() | VERSION_AUXPOW
        } else {
            self.version() & !VERSION_AUXPOW
        };
        self.set_version(version);
    }

    /// Attaches (or removes) the merged-mining proof, keeping the version
    /// flag in sync.
    pub fn set_aux_block_header(&mut self, aux_header: Option<AuxBlockHeader>) {
        match aux_header {
            Some(aux) => {
                self.aux_header = Some(Box::new(aux));
                self.set_aux_pow_version(true);
            }
            None => {
                self.aux_header = None;
                self.set_aux_pow_version(false);
            }
        }
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = self.header.consensus_encode(w)?;
        if self.is_aux_pow() {
            match &self.aux_header {
                Some(aux) => len += aux.consensus_encode(w)?,
                None => len += AuxBlockHeader::default().consensus_encode(w)?,
            }
        }
        Ok(len)
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let header = PureHeader::consensus_decode(r)?;
        let mut block_header = BlockHeader {
            header,
            aux_header: None,
        };
        if block_header.is_aux_pow() {
            block_header.aux_header = Some(Box::new(AuxBlockHeader::consensus_decode(r)?));
        }
        Ok(block_header)
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::consensus::deserialize;
    use bitcoin::consensus::serialize;

    use super::*;

    fn header() -> BlockHeader {
        BlockHeader::new(zeroed_pure_header())
    }

    #[test]
    fn test_version_encoding_is_orthogonal() {
        let mut block = header();
        block.set_base_version(5, 42);
        assert_eq!(block.base_version(), 5);
        assert_eq!(block.chain_id(), 42);
        assert!(!block.is_aux_pow());

        block.set_aux_pow_version(true);
        assert_eq!(block.base_version(), 5);
        assert_eq!(block.chain_id(), 42);
        assert!(block.is_aux_pow());

        block.set_chain_id(100);
        assert_eq!(block.base_version(), 5);
        assert_eq!(block.chain_id(), 100);
        assert!(block.is_aux_pow());

        block.set_aux_pow_version(false);
        assert_eq!(block.base_version(), 5);
        assert_eq!(block.chain_id(), 100);
        assert!(!block.is_aux_pow());
    }

    #[test]
    fn test_pure_header_roundtrip_is_80_bytes() {
        let mut block = header();
        block.set_base_version(2, 16);
        block.header.time = 1_600_000_000;
        block.header.nonce = 7;
        let bytes = serialize(&block);
        assert_eq!(bytes.len(), 80);
        let decoded: BlockHeader = deserialize(&bytes).unwrap();
        assert_eq!(decoded, block);
        assert!(decoded.aux_header.is_none());
    }

    #[test]
    fn test_aux_header_roundtrip() {
        let mut block = header();
        block.set_base_version(2, 16);
        let mut aux = AuxBlockHeader::default();
        aux.chain_index = 3;
        aux.chain_merkle_branch = vec![TxMerkleNode::all_zeros()];
        aux.parent_block.nonce = 99;
        block.set_aux_block_header(Some(aux));

        let bytes = serialize(&block);
        assert!(bytes.len() > 80);
        let decoded: BlockHeader = deserialize(&bytes).unwrap();
        assert_eq!(decoded, block);
        let aux = decoded.aux_header.as_ref().unwrap();
        assert_eq!(aux.chain_index, 3);
        assert_eq!(aux.chain_merkle_branch.len(), 1);
        assert_eq!(aux.parent_block.nonce, 99);
    }

    #[test]
    fn test_hash_ignores_the_attachment() {
        let mut block = header();
        block.set_base_version(2, 16);
        block.set_aux_pow_version(true);
        let hash_without_attachment = block.block_hash();
        block.aux_header = Some(Box::new(AuxBlockHeader::default()));
        assert_eq!(block.block_hash(), hash_without_attachment);
        // but the flag itself is part of the hashed version field
        block.set_aux_pow_version(false);
        assert_ne!(block.block_hash(), hash_without_attachment);
    }

    #[test]
    fn test_truncated_aux_fails_to_decode() {
        let mut block = header();
        block.set_base_version(2, 16);
        block.set_aux_block_header(Some(AuxBlockHeader::default()));
        let bytes = serialize(&block);
        assert!(deserialize::<BlockHeader>(&bytes[..81]).is_err());
    }
}
