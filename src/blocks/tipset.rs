// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt;
use std::sync::OnceLock;

use crate::blocks::{CachingBlockHeader, Error, Height, RawBlockHeader};
use crate::utils::encoding::blake2b_256;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use itertools::Itertools as _;
use num_bigint::BigInt;
use nunny::Vec as NonEmpty;
use serde::{Deserialize, Serialize};

/// 32-byte BLAKE2b-256 digest over the ordered block CIDs of a tipset.
/// This is the identity of a tipset everywhere in the chain index.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TipsetHash([u8; 32]);

impl TipsetHash {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Digest of the concatenated bytes of the given CIDs.
    pub fn of_cids(cids: &[Cid]) -> Self {
        let mut bytes = Vec::with_capacity(cids.len() * 64);
        for cid in cids {
            bytes.extend_from_slice(&cid.to_bytes());
        }
        Self(blake2b_256(&bytes))
    }
}

impl TryFrom<&[u8]> for TipsetHash {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let raw: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Validation(format!("invalid tipset hash length {}", bytes.len())))?;
        Ok(Self(raw))
    }
}

impl fmt::Display for TipsetHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TipsetHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TipsetHash({}…)", hex::encode(&self.0[..4]))
    }
}

/// An ordered list of block CIDs identifying a tipset, plus the lazily
/// computed [`TipsetHash`] over them. An empty key is only ever used as the
/// parent key of the genesis block.
#[derive(Clone, Debug, Default)]
pub struct TipsetKey {
    cids: Vec<Cid>,
    hash: OnceLock<TipsetHash>,
}

impl TipsetKey {
    pub fn new(cids: Vec<Cid>) -> Self {
        Self {
            cids,
            hash: OnceLock::new(),
        }
    }

    pub fn cids(&self) -> &[Cid] {
        &self.cids
    }

    pub fn is_empty(&self) -> bool {
        self.cids.is_empty()
    }

    pub fn hash(&self) -> &TipsetHash {
        self.hash.get_or_init(|| TipsetHash::of_cids(&self.cids))
    }
}

impl From<Vec<Cid>> for TipsetKey {
    fn from(cids: Vec<Cid>) -> Self {
        Self::new(cids)
    }
}

impl PartialEq for TipsetKey {
    fn eq(&self, other: &Self) -> bool {
        self.cids == other.cids
    }
}

impl Eq for TipsetKey {}

impl std::hash::Hash for TipsetKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.cids.hash(state)
    }
}

impl fmt::Display for TipsetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.cids.iter().join(", "))
    }
}

impl Serialize for TipsetKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.cids.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TipsetKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<Cid>::deserialize(deserializer).map(Self::new)
    }
}

/// A set of blocks mined at the same height with the same parent set.
/// The canonical unit of chain height.
///
/// Blocks are deterministically ordered by ticket so that two nodes holding
/// the same block set agree on the tipset key.
#[derive(Clone, Debug)]
pub struct Tipset {
    headers: NonEmpty<CachingBlockHeader>,
    key: OnceLock<TipsetKey>,
}

impl PartialEq for Tipset {
    fn eq(&self, other: &Self) -> bool {
        self.headers == other.headers
    }
}

impl Eq for Tipset {}

impl From<CachingBlockHeader> for Tipset {
    fn from(header: CachingBlockHeader) -> Self {
        Self {
            headers: nunny::vec![header],
            key: OnceLock::new(),
        }
    }
}

impl From<RawBlockHeader> for Tipset {
    fn from(header: RawBlockHeader) -> Self {
        CachingBlockHeader::new(header).into()
    }
}

impl Tipset {
    /// Builds a tipset out of the given headers, validating that they belong
    /// together: at least one block, all at the same epoch with identical
    /// parent sets, no duplicates.
    pub fn new(headers: Vec<CachingBlockHeader>) -> Result<Self, Error> {
        let mut headers = headers;
        let first = headers.first().ok_or(Error::NoBlocks)?.clone();
        for header in &headers[1..] {
            if header.epoch != first.epoch {
                return Err(Error::InvalidTipset(format!(
                    "epoch {} does not match {}",
                    header.epoch, first.epoch
                )));
            }
            if header.parents != first.parents {
                return Err(Error::InvalidTipset(
                    "parent cids are not equal".to_string(),
                ));
            }
        }
        headers.sort_by_cached_key(|h| h.to_sort_key());
        if headers.iter().map(|h| h.cid()).duplicates().next().is_some() {
            return Err(Error::InvalidTipset("duplicate block".to_string()));
        }
        let headers: NonEmpty<CachingBlockHeader> =
            headers.try_into().map_err(|_| Error::NoBlocks)?;
        Ok(Self {
            headers,
            key: OnceLock::new(),
        })
    }

    /// Loads the headers of a tipset key from the store. Returns [`None`] if
    /// any of the blocks is missing.
    pub fn load(store: &impl Blockstore, key: &TipsetKey) -> anyhow::Result<Option<Self>> {
        let mut headers = Vec::with_capacity(key.cids().len());
        for cid in key.cids() {
            match CachingBlockHeader::load(store, *cid)? {
                Some(header) => headers.push(header),
                None => return Ok(None),
            }
        }
        Ok(Some(Tipset::new(headers)?))
    }

    pub fn block_headers(&self) -> &NonEmpty<CachingBlockHeader> {
        &self.headers
    }

    /// Returns the smallest-ticket block of the tipset.
    pub fn min_ticket_block(&self) -> &CachingBlockHeader {
        self.headers.first()
    }

    pub fn epoch(&self) -> Height {
        self.min_ticket_block().epoch
    }

    /// Aggregate chain weight claimed by the tipset's blocks.
    pub fn weight(&self) -> &BigInt {
        &self.min_ticket_block().weight
    }

    /// The tipset key: ordered block CIDs plus their hash.
    pub fn key(&self) -> &TipsetKey {
        self.key.get_or_init(|| {
            TipsetKey::new(self.headers.iter().map(|h| *h.cid()).collect())
        })
    }

    pub fn hash(&self) -> &TipsetHash {
        self.key().hash()
    }

    /// Parent tipset key shared by every block in the tipset. Empty for the
    /// genesis tipset.
    pub fn parents(&self) -> &TipsetKey {
        &self.min_ticket_block().parents
    }
}
