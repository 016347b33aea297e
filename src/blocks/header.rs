// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::ops::Deref;
use std::sync::OnceLock;

use crate::blocks::{Height, Ticket, TipsetKey};
use crate::utils::cid::CidCborExt as _;
use crate::utils::db::CborStoreExt as _;
use crate::utils::encoding::blake2b_256;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::tuple::*;
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

/// Header of a block mined by a single miner. Headers are CBOR-tuple encoded
/// and content-addressed under the chain's default codec and hash function.
#[derive(Serialize_tuple, Deserialize_tuple, Default, Clone, Hash, Eq, PartialEq, Debug)]
pub struct RawBlockHeader {
    /// The id of the miner actor that mined this block
    pub miner: u64,
    /// Tie-breaker for ordering blocks within a tipset. Only the genesis
    /// block carries no ticket.
    pub ticket: Option<Ticket>,
    /// The set of parents this block was based on.
    /// Typically one, but can be several in the case where there were
    /// multiple winning ticket-holders for an epoch. Empty only for the
    /// genesis block.
    pub parents: TipsetKey,
    /// The aggregate chain weight of the parent set
    #[serde(with = "fvm_shared4::bigint::bigint_ser")]
    pub weight: BigInt,
    /// The period in which the block was mined
    pub epoch: Height,
    /// The CID of the [`TxMeta`](crate::blocks::TxMeta) listing the messages
    /// included in this block
    pub messages: Cid,
    /// Block creation time, in seconds since the Unix epoch
    pub timestamp: u64,
}

impl RawBlockHeader {
    pub fn cid(&self) -> Cid {
        Cid::from_cbor_blake2b256(self).expect("block header serialization is infallible")
    }

    /// Key used for sorting headers within a tipset: the hash of the ticket,
    /// with the CID breaking ties. Only the genesis block has no sort key.
    pub fn to_sort_key(&self) -> Option<([u8; 32], Vec<u8>)> {
        let ticket_hash = blake2b_256(self.ticket.as_ref()?.vrfproof.as_bytes());
        Some((ticket_hash, self.cid().to_bytes()))
    }
}

/// A [`RawBlockHeader`] which caches calls to [`RawBlockHeader::cid`]
#[derive(Debug, Default, Clone)]
pub struct CachingBlockHeader {
    uncached: RawBlockHeader,
    cid: OnceLock<Cid>,
}

impl PartialEq for CachingBlockHeader {
    fn eq(&self, other: &Self) -> bool {
        self.uncached == other.uncached
    }
}

impl Eq for CachingBlockHeader {}

impl Deref for CachingBlockHeader {
    type Target = RawBlockHeader;
    fn deref(&self) -> &Self::Target {
        &self.uncached
    }
}

impl From<RawBlockHeader> for CachingBlockHeader {
    fn from(value: RawBlockHeader) -> Self {
        Self::new(value)
    }
}

impl CachingBlockHeader {
    pub fn new(uncached: RawBlockHeader) -> Self {
        Self {
            uncached,
            cid: OnceLock::new(),
        }
    }

    pub fn into_raw(self) -> RawBlockHeader {
        self.uncached
    }

    /// Returns [`None`] if the blockstore doesn't contain the CID.
    pub fn load(store: &impl Blockstore, cid: Cid) -> anyhow::Result<Option<Self>> {
        if let Some(uncached) = store.get_cbor::<RawBlockHeader>(&cid)? {
            Ok(Some(Self {
                uncached,
                cid: cid.into(),
            }))
        } else {
            Ok(None)
        }
    }

    pub fn cid(&self) -> &Cid {
        self.cid.get_or_init(|| self.uncached.cid())
    }
}

impl Serialize for CachingBlockHeader {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.uncached.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CachingBlockHeader {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        RawBlockHeader::deserialize(deserializer).map(Self::new)
    }
}
