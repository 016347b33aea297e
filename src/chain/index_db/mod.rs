// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::blocks::{Height, Tipset, TipsetHash, TipsetKey};
use crate::chain::{BranchId, BranchInfo, Error, RenameBranch, GENESIS_BRANCH};
use lru::LruCache;
use nonzero_ext::nonzero;
use tracing::debug;

mod backend;

pub use backend::IndexDbBackend;

const DEFAULT_INFO_CACHE_SIZE: NonZeroUsize = nonzero!(1000usize);

/// One persisted tipset: its key, its position in the branch graph and the
/// link to its parent. Created once and never mutated, except for the branch
/// reassignment of a split or merge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TipsetInfo {
    pub key: TipsetKey,
    pub branch: BranchId,
    pub height: Height,
    /// [`None`] only for the genesis tipset
    pub parent_hash: Option<TipsetHash>,
}

/// The persistent tipset index: a bounded [`TipsetInfo`] cache in front of
/// the sqlite backend.
pub struct IndexDb {
    backend: IndexDbBackend,
    cache: LruCache<TipsetHash, Arc<TipsetInfo>>,
}

impl IndexDb {
    pub fn new(backend: IndexDbBackend) -> Self {
        Self {
            backend,
            cache: LruCache::new(DEFAULT_INFO_CACHE_SIZE),
        }
    }

    /// Loads the persisted branch stubs, see [`IndexDbBackend::init_db`].
    pub async fn init(&self) -> Result<BTreeMap<BranchId, BranchInfo>, Error> {
        self.backend.init_db().await
    }

    /// Persists the genesis tipset row.
    pub async fn store_genesis(&mut self, genesis_tipset: &Tipset) -> Result<(), Error> {
        let info = Arc::new(TipsetInfo {
            key: genesis_tipset.key().clone(),
            branch: GENESIS_BRANCH,
            height: 0,
            parent_hash: None,
        });
        self.store(info, None).await
    }

    /// Persists a tipset row together with the branch rename implied by a
    /// split or merge, and patches the cached entries the rename touches.
    pub async fn store(
        &mut self,
        info: Arc<TipsetInfo>,
        rename: Option<&RenameBranch>,
    ) -> Result<(), Error> {
        debug!(
            "store: {}:{}:{}",
            info.height,
            info.branch,
            info.key.hash()
        );
        self.backend.store(&info, rename).await?;
        if let Some(rename) = rename {
            for (_, cached) in self.cache.iter_mut() {
                if cached.branch == rename.old_id && cached.height > rename.above_height {
                    Arc::make_mut(cached).branch = rename.new_id;
                }
            }
        }
        self.cache.put(*info.key.hash(), info);
        Ok(())
    }

    pub async fn contains(&mut self, hash: &TipsetHash) -> Result<bool, Error> {
        match self.get(hash).await {
            Ok(_) => Ok(true),
            Err(Error::TipsetNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Point lookup by tipset hash, cached.
    pub async fn get(&mut self, hash: &TipsetHash) -> Result<Arc<TipsetInfo>, Error> {
        if let Some(cached) = self.cache.get(hash) {
            return Ok(cached.clone());
        }
        let info = IndexDbBackend::decode(self.backend.get(hash).await?)?;
        self.cache.put(*hash, info.clone());
        Ok(info)
    }

    /// Lookup of the first tipset at or above `height` on `branch`, cached.
    pub async fn get_at(&mut self, branch: BranchId, height: Height) -> Result<Arc<TipsetInfo>, Error> {
        let raw = self.backend.get_at(branch, height).await?;
        if let Some(cached) = self.cache.get(&raw.hash) {
            return Ok(cached.clone());
        }
        let info = IndexDbBackend::decode(raw)?;
        self.cache.put(*info.key.hash(), info.clone());
        Ok(info)
    }

    /// Iterates `branch` rows within `from_height..=to_height`, at most
    /// `limit` of them, height ascending.
    pub async fn walk_forward(
        &mut self,
        branch: BranchId,
        from_height: Height,
        to_height: Height,
        limit: usize,
    ) -> Result<Vec<Arc<TipsetInfo>>, Error> {
        if to_height < from_height || limit == 0 {
            return Ok(Vec::new());
        }
        let span = to_height - from_height + 1;
        let limit = (limit as u64).min(span);
        let rows = self.backend.walk(branch, from_height, limit).await?;
        rows.into_iter()
            .filter(|raw| raw.height <= to_height)
            .map(IndexDbBackend::decode)
            .collect()
    }

    /// Follows parent links from `from` downwards until `to_height`
    /// (exclusive) or `limit` rows, whichever is first. The starting row is
    /// included.
    pub async fn walk_backward(
        &mut self,
        from: &TipsetHash,
        to_height: Height,
        limit: usize,
    ) -> Result<Vec<Arc<TipsetInfo>>, Error> {
        let mut out = Vec::new();
        let mut hash = *from;
        while out.len() < limit {
            let info = self.get(&hash).await?;
            if info.height < to_height {
                break;
            }
            let parent = info.parent_hash;
            out.push(info);
            match parent {
                Some(p) => hash = p,
                None => break,
            }
        }
        Ok(out)
    }
}
