//! Disk codec helpers for the stakes database.
//!
//! Collections are persisted wholesale under their reserved keys using the
//! standard consensus encoding: a compact-size count followed by the
//! elements in iteration order. `BTreeMap`/`BTreeSet` give a deterministic
//! order, so the stored bytes are reproducible across nodes.

use bitcoin::consensus::encode;
use bitcoin::consensus::encode::VarInt;
use bitcoin::consensus::Decodable;
use bitcoin::consensus::Encodable;
use bitcoin::io;
use voltra_common::prelude::*;

pub(crate) fn encode_set<T, W>(set: &BTreeSet<T>, w: &mut W) -> Result<usize, io::Error>
where
    T: Encodable,
    W: io::Write + ?Sized,
{
    let mut len = VarInt(set.len() as u64).consensus_encode(w)?;
    for item in set {
        len += item.consensus_encode(w)?;
    }
    Ok(len)
}

pub(crate) fn decode_set<T, R>(r: &mut R) -> Result<BTreeSet<T>, encode::Error>
where
    T: Decodable + Ord,
    R: io::Read + ?Sized,
{
    let count = VarInt::consensus_decode(r)?.0;
    let mut set = BTreeSet::new();
    for _ in 0..count {
        set.insert(T::consensus_decode(r)?);
    }
    Ok(set)
}

pub(crate) fn encode_map<K, V, W>(map: &BTreeMap<K, V>, w: &mut W) -> Result<usize, io::Error>
where
    K: Encodable,
    V: Encodable,
    W: io::Write + ?Sized,
{
    let mut len = VarInt(map.len() as u64).consensus_encode(w)?;
    for (key, value) in map {
        len += key.consensus_encode(w)?;
        len += value.consensus_encode(w)?;
    }
    Ok(len)
}

pub(crate) fn decode_map<K, V, R>(r: &mut R) -> Result<BTreeMap<K, V>, encode::Error>
where
    K: Decodable + Ord,
    V: Decodable,
    R: io::Read + ?Sized,
{
    let count = VarInt::consensus_decode(r)?.0;
    let mut map = BTreeMap::new();
    for _ in 0..count {
        let key = K::consensus_decode(r)?;
        let value = V::consensus_decode(r)?;
        map.insert(key, value);
    }
    Ok(map)
}

/// Serializes a set into a standalone blob.
pub(crate) fn serialize_set<T: Encodable>(set: &BTreeSet<T>) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_set(set, &mut buf).expect("writing to a Vec never fails");
    buf
}

pub(crate) fn deserialize_set<T: Decodable + Ord>(
    bytes: &[u8],
) -> Result<BTreeSet<T>, encode::Error> {
    let mut cursor = bytes;
    decode_set(&mut cursor)
}

/// Serializes a map into a standalone blob.
pub(crate) fn serialize_map<K: Encodable, V: Encodable>(map: &BTreeMap<K, V>) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_map(map, &mut buf).expect("writing to a Vec never fails");
    buf
}

pub(crate) fn deserialize_map<K, V>(bytes: &[u8]) -> Result<BTreeMap<K, V>, encode::Error>
where
    K: Decodable + Ord,
    V: Decodable,
{
    let mut cursor = bytes;
    decode_map(&mut cursor)
}
