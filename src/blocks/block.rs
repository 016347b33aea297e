// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_encoding::tuple::*;

/// Limit of BLS and SECP messages combined in a block.
pub const BLOCK_MESSAGE_LIMIT: usize = 10000;

/// Tracks the CIDs of the BLS and SECP messages included in a block,
/// separately. Stored content-addressed and referenced by
/// [`RawBlockHeader::messages`](crate::blocks::RawBlockHeader::messages).
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize_tuple, Deserialize_tuple)]
pub struct TxMeta {
    pub bls_messages: Vec<Cid>,
    pub secp_messages: Vec<Cid>,
}

impl TxMeta {
    /// Number of messages referenced, across both signature domains.
    pub fn len(&self) -> usize {
        self.bls_messages.len() + self.secp_messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bls_messages.is_empty() && self.secp_messages.is_empty()
    }

    /// Iterates over all referenced message CIDs, BLS first.
    pub fn iter(&self) -> impl Iterator<Item = &Cid> {
        self.bls_messages.iter().chain(self.secp_messages.iter())
    }
}
