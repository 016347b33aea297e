// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use multihash_codetable::{Code, MultihashDigest};
use serde::{de::DeserializeOwned, ser::Serialize};

/// Extension methods for inserting and retrieving IPLD data with CBOR
/// encoding under the chain's default codec and hash function.
pub trait CborStoreExt: Blockstore {
    /// Default multihash code is 256 bit BLAKE2b
    fn default_code() -> Code {
        Code::Blake2b256
    }

    /// A wrapper over `put_keyed` that serializes to CBOR and derives the CID
    /// with the default codec and hash function.
    fn put_cbor_default<S: Serialize>(&self, obj: &S) -> anyhow::Result<Cid> {
        let bytes = fvm_ipld_encoding::to_vec(obj)?;
        let cid = Cid::new_v1(
            fvm_ipld_encoding::DAG_CBOR,
            Self::default_code().digest(&bytes),
        );
        self.put_keyed(&cid, &bytes)?;
        Ok(cid)
    }

    /// Deserializes the CBOR object stored under `cid`, if present.
    fn get_cbor<T: DeserializeOwned>(&self, cid: &Cid) -> anyhow::Result<Option<T>> {
        match self.get(cid)? {
            Some(bytes) => Ok(Some(fvm_ipld_encoding::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Deserializes the CBOR object stored under `cid` or errors with an
    /// explanation if it is missing.
    fn get_cbor_required<T: DeserializeOwned>(&self, cid: &Cid) -> anyhow::Result<T> {
        self.get_cbor(cid)?
            .ok_or_else(|| anyhow::anyhow!("object not found in block store: {cid}"))
    }
}

impl<T: Blockstore> CborStoreExt for T {}
