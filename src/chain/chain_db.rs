// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::blocks::{Height, Tipset, TipsetHash, TipsetKey};
use crate::chain::{
    Branches, Error, HeadChange, IndexDb, TipsetInfo, GENESIS_BRANCH,
};
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use lru::LruCache;
use nonzero_ext::nonzero;
use tokio::sync::broadcast::{self, Sender as Publisher};
use tracing::{debug, info};

const DEFAULT_TIPSET_CACHE_SIZE: NonZeroUsize = nonzero!(1000usize);

// A cap on the number of queued head-change events per receiver
const SINK_CAP: usize = 200;

/// The chain database: the in-memory branch graph, its persistent index, the
/// content-addressed object store and a bounded cache of decoded tipsets,
/// kept consistent with each other.
///
/// Any initialization failure is latched: every subsequent call fails fast
/// with the same error until re-initialized. An index that could not be
/// loaded and validated must never be used.
pub struct ChainDb<DB> {
    /// Content-addressed store holding headers, messages and message
    /// metadata
    db: Arc<DB>,
    index_db: IndexDb,
    branches: Branches,
    tipset_cache: LruCache<TipsetHash, Arc<Tipset>>,
    /// Publisher for head change events
    publisher: Publisher<HeadChange>,
    genesis_tipset: Option<Arc<Tipset>>,
    state_error: Option<Error>,
}

impl<DB> ChainDb<DB>
where
    DB: Blockstore,
{
    pub fn new(db: Arc<DB>, index_db: IndexDb) -> Self {
        let (publisher, _) = broadcast::channel(SINK_CAP);
        Self {
            db,
            index_db,
            branches: Branches::default(),
            tipset_cache: LruCache::new(DEFAULT_TIPSET_CACHE_SIZE),
            publisher,
            genesis_tipset: None,
            state_error: Some(Error::NotInitialized),
        }
    }

    /// Initializes the database in one of two modes.
    ///
    /// Bootstrap (`creating_new_db`): requires a genesis CID whose header is
    /// already in the object store and an empty index; derives and persists
    /// the genesis tipset. Reopen: requires a non-empty index, rebuilds the
    /// branch graph from it and cross-checks the genesis CID when one is
    /// supplied.
    pub async fn init(
        &mut self,
        genesis_cid: Option<Cid>,
        creating_new_db: bool,
    ) -> Result<(), Error> {
        let result = self.try_init(genesis_cid, creating_new_db).await;
        self.state_error = result.as_ref().err().cloned();
        result
    }

    async fn try_init(
        &mut self,
        genesis_cid: Option<Cid>,
        creating_new_db: bool,
    ) -> Result<(), Error> {
        let branches_map = self.index_db.init().await?;

        if creating_new_db {
            let genesis_cid = genesis_cid.ok_or(Error::NoGenesis)?;
            if !branches_map.is_empty() {
                return Err(Error::DataIntegrity(
                    "the index of a new database must be empty".to_string(),
                ));
            }
            let genesis = self
                .load_tipset_objects(&TipsetKey::new(vec![genesis_cid]))?
                .ok_or(Error::NoGenesis)?;
            if genesis.epoch() != 0 {
                return Err(Error::BadTipset(
                    "genesis tipset must be at height 0".to_string(),
                ));
            }
            self.branches.clear();
            self.branches.store_genesis(&genesis)?;
            self.index_db.store_genesis(&genesis).await?;
            info!("created chain db, genesis {}", genesis.hash());
            self.genesis_tipset = Some(genesis);
        } else {
            if branches_map.is_empty() {
                return Err(Error::NoGenesis);
            }
            self.branches.init(branches_map)?;
            let genesis_info = self.index_db.get_at(GENESIS_BRANCH, 0).await?;
            if genesis_info.height != 0 {
                return Err(Error::DataIntegrity(
                    "genesis branch has no row at height 0".to_string(),
                ));
            }
            if let Some(expected) = genesis_cid {
                if genesis_info.key.cids().first() != Some(&expected) {
                    return Err(Error::GenesisMismatch {
                        expected: expected.to_string(),
                        found: genesis_info.key.to_string(),
                    });
                }
            }
            let genesis = self
                .load_tipset_objects(&genesis_info.key)?
                .ok_or(Error::NoGenesis)?;
            self.genesis_tipset = Some(genesis);
        }

        Ok(())
    }

    /// The latched state check every public operation starts with.
    fn state(&self) -> Result<(), Error> {
        match &self.state_error {
            None => Ok(()),
            Some(e) => Err(e.clone()),
        }
    }

    fn genesis(&self) -> Result<&Arc<Tipset>, Error> {
        self.state()?;
        self.genesis_tipset
            .as_ref()
            .ok_or_else(|| Error::Invariant("initialized without a genesis tipset".to_string()))
    }

    pub fn genesis_cid(&self) -> Result<Cid, Error> {
        Ok(self.genesis()?.key().cids()[0])
    }

    pub fn genesis_tipset(&self) -> Result<Arc<Tipset>, Error> {
        Ok(self.genesis()?.clone())
    }

    /// Subscribes to changes of the synced head set.
    pub fn subscribe_head_changes(&self) -> broadcast::Receiver<HeadChange> {
        self.publisher.subscribe()
    }

    /// Replays the current synced head set as `added` events, for observers
    /// attaching after initialization.
    pub fn current_heads(&self) -> Result<Vec<HeadChange>, Error> {
        self.state()?;
        Ok(self
            .branches
            .all_heads()
            .filter(|b| b.synced_to_genesis)
            .map(|b| HeadChange {
                removed: None,
                added: Some(b.top),
            })
            .collect())
    }

    pub async fn tipset_is_stored(&mut self, hash: &TipsetHash) -> Result<bool, Error> {
        self.state()?;
        self.index_db.contains(hash).await
    }

    /// Returns a tipset by hash. The genesis tipset is special-cased so it is
    /// always available without an index lookup.
    pub async fn tipset_by_hash(&mut self, hash: &TipsetHash) -> Result<Arc<Tipset>, Error> {
        let genesis = self.genesis()?.clone();
        if hash == genesis.hash() {
            return Ok(genesis);
        }
        if let Some(cached) = self.tipset_cache.get(hash) {
            return Ok(cached.clone());
        }
        let info = self.index_db.get(hash).await?;
        self.tipset_by_key_uncached(&info.key)
    }

    /// Returns the tipset owning `height` on the canonical chain selected by
    /// [`ChainDb::set_current_head`].
    pub async fn tipset_by_height(&mut self, height: Height) -> Result<Arc<Tipset>, Error> {
        let genesis = self.genesis()?.clone();
        if height == 0 {
            return Ok(genesis);
        }
        let branch = self.branches.branch_at_height(height)?;
        let info = self.index_db.get_at(branch, height).await?;
        self.tipset_by_key(&info.key).await
    }

    pub async fn tipset_by_key(&mut self, key: &TipsetKey) -> Result<Arc<Tipset>, Error> {
        self.state()?;
        if let Some(cached) = self.tipset_cache.get(key.hash()) {
            return Ok(cached.clone());
        }
        self.tipset_by_key_uncached(key)
    }

    fn tipset_by_key_uncached(&mut self, key: &TipsetKey) -> Result<Arc<Tipset>, Error> {
        let tipset = self
            .load_tipset_objects(key)?
            .ok_or_else(|| Error::BadTipset(format!("blocks of {key} missing from store")))?;
        self.tipset_cache.put(*key.hash(), tipset.clone());
        Ok(tipset)
    }

    fn load_tipset_objects(&self, key: &TipsetKey) -> Result<Option<Arc<Tipset>>, Error> {
        Tipset::load(self.db.as_ref(), key)
            .map(|t| t.map(Arc::new))
            .map_err(|e| Error::Store(e.to_string()))
    }

    /// Selects the canonical chain running through `head`, enabling height
    /// lookups.
    pub async fn set_current_head(&mut self, head: &TipsetHash) -> Result<(), Error> {
        self.state()?;
        let info = self.index_db.get(head).await?;
        self.branches.set_current_head(info.branch, info.height)
    }

    /// Folds a fetched tipset into the graph and the index. Idempotent: a
    /// tipset that is already indexed is not an error.
    ///
    /// Returns `None` when the tipset landed on a branch connected to
    /// genesis (head-change events are published in that case), or the
    /// lowest yet-unsynced ancestor so the caller knows what to fetch next.
    pub async fn store_tipset(
        &mut self,
        tipset: &Arc<Tipset>,
        parent: &TipsetKey,
    ) -> Result<Option<Arc<Tipset>>, Error> {
        self.state()?;

        let hash = *tipset.hash();
        if self.tipset_is_stored(&hash).await? {
            return self.unsynced_bottom(&hash).await;
        }

        let height = tipset.epoch();
        if height == 0 {
            return Err(Error::BadTipset(
                "a second genesis tipset cannot be stored".to_string(),
            ));
        }
        let genesis_hash = *self.genesis()?.hash();
        let parent_hash = *parent.hash();
        if height == 1 && parent_hash != genesis_hash {
            return Err(Error::BadTipset(
                "the parent of a tipset at height 1 must be genesis".to_string(),
            ));
        }

        let mut parent_branch = None;
        let mut parent_height = 0;
        if self.tipset_is_stored(&parent_hash).await? {
            let info = self.index_db.get(&parent_hash).await?;
            parent_branch = Some(info.branch);
            parent_height = info.height;
        }

        let position =
            self.branches
                .find_store_position(tipset, &parent_hash, parent_branch, parent_height)?;

        if let Some(rename) = position.rename.filter(|r| r.split) {
            // resolve the first row above the split point: it becomes the
            // bottom of the renamed upper portion
            let new_bottom = self.index_db.get_at(rename.old_id, parent_height + 1).await?;
            if new_bottom.parent_hash != Some(parent_hash) {
                return Err(Error::Invariant(format!(
                    "split point of branch {} does not continue from {parent_hash}",
                    rename.old_id
                )));
            }
            self.branches
                .split_branch(&parent_hash, new_bottom.key.hash(), new_bottom.height, &rename)?;
        }

        let info = Arc::new(TipsetInfo {
            key: tipset.key().clone(),
            branch: position.assigned_branch,
            height,
            parent_hash: Some(parent_hash),
        });
        self.index_db.store(info, position.rename.as_ref()).await?;
        self.tipset_cache.put(hash, tipset.clone());

        let head_changes = self.branches.store_tipset(tipset, &parent_hash, &position)?;

        if head_changes.iter().all(|c| c.added.is_none()) {
            // no head appeared: the tipset sits on an unsynced branch
            if position.at_bottom_of_branch == Some(position.assigned_branch) {
                return Ok(Some(tipset.clone()));
            }
            let root = self.branches.root_branch(position.assigned_branch)?;
            if root.id != GENESIS_BRANCH {
                let bottom = root.bottom;
                return Ok(Some(self.tipset_by_hash(&bottom).await?));
            }
            Ok(None)
        } else {
            for change in head_changes {
                debug!(
                    "head change: removed {:?}, added {:?}",
                    change.removed, change.added
                );
                if self.publisher.send(change).is_err() {
                    debug!("did not publish head change, no active receivers");
                }
            }
            Ok(None)
        }
    }

    /// For an indexed tipset, the bottom of the lowest unsynced branch above
    /// genesis on its parent path, or `None` when its branch connects to
    /// genesis.
    pub async fn unsynced_bottom(
        &mut self,
        hash: &TipsetHash,
    ) -> Result<Option<Arc<Tipset>>, Error> {
        self.state()?;
        let info = self.index_db.get(hash).await?;
        let root = self.branches.root_branch(info.branch)?;
        if root.id != GENESIS_BRANCH {
            let bottom = root.bottom;
            return Ok(Some(self.tipset_by_hash(&bottom).await?));
        }
        Ok(None)
    }

    /// Walks the canonical chain upwards through `from_height..=to_height`,
    /// crossing branch boundaries transparently, visiting at most `limit`
    /// tipsets. The callback returns false to stop early.
    pub async fn walk_forward(
        &mut self,
        from_height: Height,
        to_height: Height,
        limit: usize,
        mut cb: impl FnMut(Arc<Tipset>) -> bool,
    ) -> Result<(), Error> {
        self.state()?;
        let mut h = from_height;
        let mut remaining = limit;
        'walk: while h <= to_height && remaining > 0 {
            let branch = self.branches.branch_at_height(h)?;
            let sub_to = self.branches.get_branch(branch)?.top_height.min(to_height);
            let infos = self
                .index_db
                .walk_forward(branch, h, sub_to, remaining)
                .await?;
            for info in infos {
                let tipset = self.tipset_by_key(&info.key).await?;
                remaining -= 1;
                if !cb(tipset) {
                    break 'walk;
                }
            }
            h = sub_to + 1;
        }
        Ok(())
    }

    /// Walks parent links downwards from `from` until below `to_height`. The
    /// callback returns false to stop early.
    pub async fn walk_backward(
        &mut self,
        from: &TipsetHash,
        to_height: Height,
        mut cb: impl FnMut(Arc<Tipset>) -> bool,
    ) -> Result<(), Error> {
        self.state()?;
        let mut hash = *from;
        loop {
            let tipset = self.tipset_by_hash(&hash).await?;
            let height = tipset.epoch();
            if height < to_height {
                break;
            }
            let parent = *tipset.parents().hash();
            if !cb(tipset) || height == 0 {
                break;
            }
            hash = parent;
        }
        Ok(())
    }
}
