// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::{BTreeMap, BTreeSet};

use crate::blocks::{Height, Tipset, TipsetHash};
use crate::chain::{BranchId, Error, GENESIS_BRANCH};
use tracing::{debug, warn};

/// Instruction for reassigning the branch id of already-persisted tipset
/// rows, to be applied in the same index transaction as the insert it belongs
/// to. A split moves the rows above `above_height` of a branch that is being
/// cut in two; a merge moves every row of an absorbed branch to the surviving
/// id (`above_height` is 0 since non-genesis rows all sit above height 0).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenameBranch {
    pub old_id: BranchId,
    pub new_id: BranchId,
    /// Only rows strictly above this height are reassigned
    pub above_height: Height,
    /// True when the rename is the upper half of a branch split
    pub split: bool,
}

/// Branch info, effectively the branch index entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchInfo {
    pub id: BranchId,
    /// Top tipset of this branch
    pub top: TipsetHash,
    pub top_height: Height,
    /// Bottom tipset of this branch
    pub bottom: TipsetHash,
    pub bottom_height: Height,
    /// Parent branch, if connected
    pub parent: Option<BranchId>,
    /// Hash of the bottom tipset's parent, [`None`] only for the genesis
    /// branch
    pub parent_hash: Option<TipsetHash>,
    /// True if this branch originates from genesis without holes
    pub synced_to_genesis: bool,
    /// Children, if any. Exactly one child is an inconsistent intermediate
    /// state: such branches must be merged.
    pub forks: BTreeSet<BranchId>,
}

impl BranchInfo {
    fn new(id: BranchId, hash: TipsetHash, height: Height, parent_hash: Option<TipsetHash>) -> Self {
        Self {
            id,
            top: hash,
            top_height: height,
            bottom: hash,
            bottom_height: height,
            parent: None,
            parent_hash,
            synced_to_genesis: false,
            forks: BTreeSet::new(),
        }
    }
}

/// Result of [`Branches::find_store_position`]: where a tipset attaches to
/// the graph, and which index rename has to travel in the same transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorePosition {
    /// Branch assigned to the tipset
    pub assigned_branch: BranchId,
    /// If set, the tipset must be attached to the bottom of this branch
    pub at_bottom_of_branch: Option<BranchId>,
    /// If set, the tipset must be attached to the top of this branch
    pub on_top_of_branch: Option<BranchId>,
    /// If set, a branch rename is required within the same index transaction
    pub rename: Option<RenameBranch>,
}

/// A change in the synced head set. `removed` is always delivered before
/// `added` within one event, and removal events sort before additions in the
/// returned sequence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeadChange {
    pub removed: Option<TipsetHash>,
    pub added: Option<TipsetHash>,
}

/// Acyclic graph of tipset branches.
///
/// In unsynced state not all branches are connected; they connect as tipsets
/// are downloaded. A live node always has the genesis branch with id 1; ids
/// above 1 are forks or not-yet-downloaded pieces of the chain.
///
/// Branches are held in an arena keyed by [`BranchId`], so parent/fork
/// relationships are plain integer edges.
#[derive(Default)]
pub struct Branches {
    /// The whole graph
    all: BTreeMap<BranchId, BranchInfo>,
    /// Fork-free branch tops, keyed by top hash. Includes unsynced heads;
    /// only the synced ones represent usable chain tips.
    heads: BTreeMap<TipsetHash, BranchId>,
    /// Roots which have no parent branch yet and are not genesis (holes),
    /// keyed by the awaited parent hash
    unloaded_roots: BTreeMap<TipsetHash, BranchId>,
    /// Canonical chain selected via `set_current_head`, keyed by branch top
    /// height
    current_chain: BTreeMap<Height, BranchId>,
    current_top_branch: Option<BranchId>,
    current_height: Height,
}

impl Branches {
    /// True if no branches are there yet
    pub fn empty(&self) -> bool {
        self.all.is_empty()
    }

    /// All fork-free branch tops, synced or not
    pub fn all_heads(&self) -> impl Iterator<Item = &BranchInfo> {
        self.heads.values().filter_map(|id| self.all.get(id))
    }

    /// Branch info by id
    pub fn get_branch(&self, id: BranchId) -> Result<&BranchInfo, Error> {
        self.all.get(&id).ok_or(Error::BranchNotFound(id))
    }

    /// The lowest branch reachable from `id` over parent links
    pub fn root_branch(&self, id: BranchId) -> Result<&BranchInfo, Error> {
        let mut info = self.get_branch(id)?;
        // bounded by graph size so a corrupt graph cannot loop forever
        let mut cycle_guard = self.all.len() + 1;
        while let Some(parent) = info.parent {
            cycle_guard -= 1;
            if cycle_guard == 0 {
                return Err(Error::CycleDetected);
            }
            info = self.get_branch(parent)?;
        }
        Ok(info)
    }

    /// Returns the branch owning height `h` in the current chain selected by
    /// [`Branches::set_current_head`]. For sparse height ranges this is the
    /// branch whose top is the first at or above `h`.
    pub fn branch_at_height(&self, h: Height) -> Result<BranchId, Error> {
        if self.current_chain.is_empty() {
            return Err(Error::NoCurrentChain);
        }
        if h > self.current_height {
            return Err(Error::TipsetNotFoundAt {
                branch: self.current_top_branch.unwrap_or_default(),
                height: h,
            });
        }
        let genesis = self.get_branch(GENESIS_BRANCH)?;
        if h <= genesis.top_height {
            return Ok(GENESIS_BRANCH);
        }
        match self.current_chain.range(h..).next() {
            Some((_, id)) => Ok(*id),
            None => Err(Error::TipsetNotFoundAt {
                branch: self.current_top_branch.unwrap_or_default(),
                height: h,
            }),
        }
    }

    /// Selects the current chain, from genesis to the given head; necessary
    /// to search for a branch by height. Succeeds only if `head_branch` is
    /// synced to genesis and `height` falls within its range.
    pub fn set_current_head(&mut self, head_branch: BranchId, height: Height) -> Result<(), Error> {
        if self.current_top_branch == Some(head_branch) {
            if self.current_height != height {
                let (_, top_id) = self
                    .current_chain
                    .iter()
                    .next_back()
                    .ok_or(Error::NoCurrentChain)?;
                let info = self.get_branch(*top_id)?;
                if info.top_height < height || info.bottom_height > height {
                    return Err(Error::HeightMismatch {
                        branch: info.id,
                        height,
                    });
                }
                self.current_height = height;
            }
            return Ok(());
        }

        let info = self
            .all
            .get(&head_branch)
            .ok_or(Error::BranchNotFound(head_branch))?;
        if !info.synced_to_genesis {
            return Err(Error::HeadNotSynced(head_branch));
        }
        if info.top_height < height || info.bottom_height > height {
            return Err(Error::HeightMismatch {
                branch: head_branch,
                height,
            });
        }

        self.current_height = height;
        self.current_chain.clear();
        self.current_top_branch = Some(head_branch);
        self.current_chain.insert(info.top_height, head_branch);

        // a guard to catch a cycle if it appears in the graph: db inconsistency
        let mut cycle_guard = self.all.len() + 1;
        let mut parent = info.parent;
        while let Some(id) = parent {
            cycle_guard -= 1;
            if cycle_guard == 0 {
                self.current_chain.clear();
                self.current_top_branch = None;
                return Err(Error::CycleDetected);
            }
            let branch = self.all.get(&id).ok_or_else(|| {
                Error::Invariant(format!("current chain refers to unknown branch {id}"))
            })?;
            self.current_chain.insert(branch.top_height, id);
            parent = branch.parent;
        }

        Ok(())
    }

    /// Finds the position in the graph where the given tipset is to be
    /// stored. The result is used by the index db to build the insert
    /// transaction before the graph itself is mutated.
    pub fn find_store_position(
        &self,
        tipset: &Tipset,
        parent_hash: &TipsetHash,
        parent_branch: Option<BranchId>,
        parent_height: Height,
    ) -> Result<StorePosition, Error> {
        let height = tipset.epoch();
        let hash = tipset.hash();

        if height == 0 {
            // inserting genesis
            if !self.empty() {
                return Err(Error::DataIntegrity(
                    "genesis can only be stored into an empty graph".to_string(),
                ));
            }
            return Ok(StorePosition {
                assigned_branch: GENESIS_BRANCH,
                at_bottom_of_branch: None,
                on_top_of_branch: None,
                rename: None,
            });
        }

        let mut assigned: Option<BranchId> = None;
        let mut rename: Option<RenameBranch> = None;

        // the tipset may be the one a disconnected subgraph is waiting for
        let at_bottom_of_branch = self.unloaded_roots.get(hash).copied();
        if let Some(root_id) = at_bottom_of_branch {
            assigned = Some(root_id);
        }

        if parent_height >= height {
            return Err(Error::HeightMismatch {
                branch: parent_branch.unwrap_or_default(),
                height: parent_height,
            });
        }

        let mut next_id = self.new_branch_id();
        let mut on_top_of_branch = None;

        if let Some(parent_id) = parent_branch {
            let info = self.get_branch(parent_id)?;
            if parent_height > info.top_height || parent_height < info.bottom_height {
                return Err(Error::HeightMismatch {
                    branch: parent_id,
                    height: parent_height,
                });
            }

            on_top_of_branch = Some(parent_id);

            if parent_height != info.top_height {
                // parent is mid-branch: the upper portion gets a new id
                rename = Some(RenameBranch {
                    old_id: parent_id,
                    new_id: next_id,
                    above_height: parent_height,
                    split: true,
                });
                next_id += 1;
            } else if info.forks.is_empty() {
                if let Some(absorbed) = at_bottom_of_branch {
                    // the subgraph above gets absorbed into the parent branch
                    rename = Some(RenameBranch {
                        old_id: absorbed,
                        new_id: parent_id,
                        above_height: 0,
                        split: false,
                    });
                }
                assigned = Some(parent_id);
            }
        }

        Ok(StorePosition {
            assigned_branch: assigned.unwrap_or(next_id),
            at_bottom_of_branch,
            on_top_of_branch,
            rename,
        })
    }

    /// Splits a branch in two according to `rename`: the old id keeps the
    /// range up to `rename.above_height`, the new id takes over everything
    /// above, including the forks. Head and current-chain entries referring
    /// to the old top move to the new id.
    pub fn split_branch(
        &mut self,
        new_top: &TipsetHash,
        new_bottom: &TipsetHash,
        new_bottom_height: Height,
        rename: &RenameBranch,
    ) -> Result<(), Error> {
        if rename.old_id == rename.new_id || self.all.contains_key(&rename.new_id) {
            return Err(Error::Invariant(format!(
                "split of branch {} into existing id {}",
                rename.old_id, rename.new_id
            )));
        }
        let parent = self.get_branch(rename.old_id)?.clone();
        if parent.top_height <= rename.above_height
            || parent.bottom_height > rename.above_height
            || new_bottom_height <= rename.above_height
            || new_bottom_height > parent.top_height
        {
            return Err(Error::Invariant(format!(
                "split of branch {} at height {} outside range {}..={}",
                rename.old_id, rename.above_height, parent.bottom_height, parent.top_height
            )));
        }

        debug!(
            "splitting branch {} at height {} into {}",
            rename.old_id, rename.above_height, rename.new_id
        );

        let is_head = self.heads.remove(&parent.top).is_some();
        let mut in_current_chain = false;
        if !self.current_chain.is_empty() && parent.synced_to_genesis {
            if let Some(id) = self.current_chain.get(&parent.top_height) {
                if *id == parent.id {
                    self.current_chain.remove(&parent.top_height);
                    in_current_chain = true;
                }
            }
        }

        let mut fork = parent.clone();
        fork.id = rename.new_id;
        fork.bottom = *new_bottom;
        fork.bottom_height = new_bottom_height;
        fork.parent = Some(parent.id);
        fork.parent_hash = Some(*new_top);
        for id in &fork.forks {
            if let Some(child) = self.all.get_mut(id) {
                child.parent = Some(fork.id);
            }
        }

        let fork_top = fork.top;
        let fork_top_height = fork.top_height;
        self.all.insert(fork.id, fork);

        let lower = self
            .all
            .get_mut(&rename.old_id)
            .expect("split source looked up above");
        lower.top = *new_top;
        lower.top_height = rename.above_height;
        lower.forks.clear();
        lower.forks.insert(rename.new_id);

        if is_head {
            self.heads.insert(fork_top, rename.new_id);
        }
        if in_current_chain {
            self.current_chain.insert(rename.above_height, rename.old_id);
            self.current_chain.insert(fork_top_height, rename.new_id);
        }

        Ok(())
    }

    /// Stores the genesis tipset into an empty graph.
    pub fn store_genesis(&mut self, genesis_tipset: &Tipset) -> Result<(), Error> {
        if !self.empty() {
            return Err(Error::DataIntegrity(
                "genesis can only be stored into an empty graph".to_string(),
            ));
        }
        if genesis_tipset.epoch() != 0 {
            return Err(Error::BadTipset("genesis tipset must be at height 0".to_string()));
        }
        self.new_branch(*genesis_tipset.hash(), 0, None, GENESIS_BRANCH)
    }

    /// Stores a non-genesis tipset and mutates the graph according to `pos`.
    /// Returns the changes that happened to the head set, removals first.
    pub fn store_tipset(
        &mut self,
        tipset: &Tipset,
        parent_hash: &TipsetHash,
        pos: &StorePosition,
    ) -> Result<Vec<HeadChange>, Error> {
        let height = tipset.epoch();
        let hash = *tipset.hash();
        let mut changes = Vec::new();

        if pos.at_bottom_of_branch.is_none() && pos.on_top_of_branch.is_none() {
            // standalone branch: becomes an unloaded root awaiting its parent,
            // and an unsynced head. No head events until it connects.
            self.new_branch(hash, height, Some(*parent_hash), pos.assigned_branch)?;
            return Ok(changes);
        }

        let mut linked_to_bottom: Option<BranchId> = None;

        if let Some(root_id) = pos.at_bottom_of_branch {
            // link to the bottom of an unloaded subgraph
            let waiting = self.unloaded_roots.remove(&hash).ok_or_else(|| {
                Error::Invariant(format!("no unloaded root is waiting for {hash}"))
            })?;
            if waiting != root_id {
                return Err(Error::Invariant(format!(
                    "unloaded root mismatch: {waiting} != {root_id}"
                )));
            }
            let b = self
                .all
                .get_mut(&root_id)
                .ok_or(Error::BranchNotFound(root_id))?;
            if b.bottom_height <= height || b.parent.is_some() {
                return Err(Error::Invariant(format!(
                    "branch {root_id} cannot accept {hash} at its bottom"
                )));
            }
            b.bottom_height = height;
            b.bottom = hash;
            b.parent_hash = Some(*parent_hash);
            linked_to_bottom = Some(root_id);

            if pos.on_top_of_branch.is_none() {
                // still disconnected, now waiting for this tipset's parent
                self.unloaded_roots.insert(*parent_hash, root_id);
                return Ok(changes);
            }
        }

        let on_top = pos
            .on_top_of_branch
            .ok_or_else(|| Error::Invariant("store position without an anchor".to_string()))?;

        if pos.assigned_branch == on_top {
            // linking without a fork: the parent is a fork-free head top
            let parent_branch = self.heads.remove(parent_hash).ok_or_else(|| {
                Error::Invariant(format!("parent {parent_hash} is not a head top"))
            })?;

            match linked_to_bottom {
                None => {
                    // appending the tipset on top of the head
                    let pb = self
                        .all
                        .get_mut(&parent_branch)
                        .ok_or(Error::BranchNotFound(parent_branch))?;
                    if pb.top_height >= height || !pb.forks.is_empty() {
                        return Err(Error::Invariant(format!(
                            "branch {parent_branch} cannot be extended with {hash}"
                        )));
                    }
                    pb.top_height = height;
                    pb.top = hash;
                    let notify = pb.synced_to_genesis;
                    self.heads.insert(hash, parent_branch);
                    if notify {
                        changes.push(HeadChange {
                            removed: Some(*parent_hash),
                            added: Some(hash),
                        });
                    }
                }
                Some(absorbed) => {
                    // merging branches: the subgraph above gets absorbed
                    self.merge_branches(absorbed, parent_branch, &mut changes)?;
                    if changes.len() == 1 {
                        changes[0].removed = Some(*parent_hash);
                    } else if !changes.is_empty() {
                        changes.push(HeadChange {
                            removed: Some(*parent_hash),
                            added: None,
                        });
                        // removal goes first
                        let last = changes.len() - 1;
                        changes.swap(0, last);
                    }
                }
            }
            return Ok(changes);
        }

        // make a fork off a non-head branch top
        let branch = self.get_branch(on_top)?;
        if branch.top != *parent_hash || branch.forks.is_empty() {
            return Err(Error::Invariant(format!(
                "branch {on_top} top does not match fork parent {parent_hash}"
            )));
        }
        let synced = branch.synced_to_genesis;

        if linked_to_bottom.is_none() {
            self.new_branch(hash, height, Some(*parent_hash), pos.assigned_branch)?;
            // the branch is linked right away, it is not an unloaded root
            self.unloaded_roots.remove(parent_hash);
            linked_to_bottom = Some(pos.assigned_branch);
        }

        let linked = linked_to_bottom.expect("assigned just above");
        self.all
            .get_mut(&on_top)
            .expect("looked up above")
            .forks
            .insert(linked);
        self.all
            .get_mut(&linked)
            .ok_or(Error::BranchNotFound(linked))?
            .parent = Some(on_top);
        self.update_heads(linked, synced, &mut changes);

        Ok(changes)
    }

    /// Initializes the graph from persisted branch stubs. On success returns
    /// the head-connect events as if they had just occurred. Errors if the
    /// stubs are structurally inconsistent, leaving the graph empty.
    pub fn init(
        &mut self,
        all_branches: BTreeMap<BranchId, BranchInfo>,
    ) -> Result<Vec<HeadChange>, Error> {
        self.clear();

        let mut heads = Vec::new();
        if all_branches.is_empty() {
            return Ok(heads);
        }

        // validate everything into locals first; the graph is only touched
        // once the stubs are known to be consistent
        let mut fork_edges: Vec<(BranchId, BranchId)> = Vec::new();
        let mut unloaded_roots: BTreeMap<TipsetHash, BranchId> = BTreeMap::new();
        let mut genesis_found = false;

        for (&id, b) in &all_branches {
            if id != b.id || id == 0 {
                return Err(Error::GraphLoad(format!("inconsistent branch id {id}")));
            }
            if b.top_height < b.bottom_height {
                return Err(Error::GraphLoad(format!(
                    "heights inconsistent ({} and {}) for id {}",
                    b.top_height, b.bottom_height, b.id
                )));
            }
            match b.parent {
                Some(parent_id) => {
                    if parent_id == id {
                        return Err(Error::GraphLoad(format!(
                            "parent and branch id are the same ({id})"
                        )));
                    }
                    let parent = all_branches.get(&parent_id).ok_or_else(|| {
                        Error::GraphLoad(format!("parent {parent_id} not found for branch {id}"))
                    })?;
                    if parent.top_height >= b.bottom_height {
                        return Err(Error::GraphLoad(format!(
                            "parent height inconsistent ({} and {}) for id {} and parent {}",
                            b.bottom_height, parent.top_height, id, parent_id
                        )));
                    }
                    fork_edges.push((parent_id, id));
                }
                None => {
                    if id == GENESIS_BRANCH {
                        genesis_found = true;
                    } else {
                        match b.parent_hash {
                            Some(awaited) => {
                                unloaded_roots.insert(awaited, id);
                            }
                            None => return Err(Error::ParentExpected(id)),
                        }
                    }
                }
            }
        }

        if !genesis_found {
            return Err(Error::NoGenesisBranch);
        }

        self.all = all_branches;
        self.unloaded_roots = unloaded_roots;
        for (parent, child) in fork_edges {
            self.all
                .get_mut(&parent)
                .expect("validated above")
                .forks
                .insert(child);
        }

        self.update_heads(GENESIS_BRANCH, true, &mut heads);

        // unsynced heads are tracked too, without events
        let unsynced: Vec<(TipsetHash, BranchId)> = self
            .all
            .values()
            .filter(|b| b.forks.is_empty() && !b.synced_to_genesis)
            .map(|b| (b.top, b.id))
            .collect();
        for (top, id) in unsynced {
            self.heads.insert(top, id);
        }
        for b in self.all.values() {
            if b.forks.len() == 1 {
                // intermediate state between split_branch and store_tipset,
                // should never have been persisted
                warn!("inconsistent # of forks (1) for branch {}, must be merged", b.id);
            }
        }

        Ok(heads)
    }

    /// Clears all
    pub fn clear(&mut self) {
        self.all.clear();
        self.heads.clear();
        self.unloaded_roots.clear();
        self.current_chain.clear();
        self.current_top_branch = None;
        self.current_height = 0;
    }

    /// Makes a new branch of a single tipset. Registers it as an (unsynced)
    /// head, and as an unloaded root awaiting its parent unless it is
    /// genesis.
    fn new_branch(
        &mut self,
        hash: TipsetHash,
        height: Height,
        parent_hash: Option<TipsetHash>,
        id: BranchId,
    ) -> Result<(), Error> {
        if id == 0 || self.all.contains_key(&id) {
            return Err(Error::Invariant(format!("new branch with occupied id {id}")));
        }
        let mut info = BranchInfo::new(id, hash, height, parent_hash);
        match parent_hash {
            None => {
                // here is genesis
                if id != GENESIS_BRANCH || height != 0 || !self.empty() {
                    return Err(Error::Invariant(
                        "genesis branch stored out of order".to_string(),
                    ));
                }
                info.synced_to_genesis = true;
            }
            Some(awaited) => {
                self.unloaded_roots.insert(awaited, id);
            }
        }
        self.all.insert(id, info);
        self.heads.insert(hash, id);
        Ok(())
    }

    /// Merges `absorbed` into its parent `survivor`: the survivor takes over
    /// the absorbed branch's top and forks and the absorbed id disappears
    /// from the graph.
    fn merge_branches(
        &mut self,
        absorbed: BranchId,
        survivor: BranchId,
        changes: &mut Vec<HeadChange>,
    ) -> Result<(), Error> {
        let absorbed_info = self
            .all
            .remove(&absorbed)
            .ok_or(Error::BranchNotFound(absorbed))?;
        debug!("merging branch {absorbed} into {survivor}");
        for id in &absorbed_info.forks {
            if let Some(child) = self.all.get_mut(id) {
                child.parent = Some(survivor);
            }
        }
        let synced = {
            let s = self
                .all
                .get_mut(&survivor)
                .ok_or(Error::BranchNotFound(survivor))?;
            s.top_height = absorbed_info.top_height;
            s.top = absorbed_info.top;
            s.forks = absorbed_info.forks;
            s.synced_to_genesis
        };
        self.update_heads(survivor, synced, changes);
        Ok(())
    }

    /// Propagates the synced flag from `start` through its fork tree and
    /// registers the fork-free leaves as heads. Iterative on purpose: the
    /// stack stays bounded under adversarial fork storms.
    fn update_heads(&mut self, start: BranchId, synced: bool, changes: &mut Vec<HeadChange>) {
        let mut worklist = vec![start];
        while let Some(id) = worklist.pop() {
            let Some(branch) = self.all.get_mut(&id) else {
                continue;
            };
            branch.synced_to_genesis = synced;
            if branch.forks.is_empty() {
                let top = branch.top;
                self.heads.insert(top, id);
                if synced {
                    changes.push(HeadChange {
                        removed: None,
                        added: Some(top),
                    });
                }
            } else {
                worklist.extend(branch.forks.iter().copied());
            }
        }
    }

    /// Returns a fresh unassigned branch id
    fn new_branch_id(&self) -> BranchId {
        match self.all.keys().next_back() {
            Some(max) => max + 1,
            None => GENESIS_BRANCH + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{RawBlockHeader, Ticket, Tipset, TipsetKey, VRFProof};
    use std::sync::Arc;

    fn tipset(epoch: Height, parents: &TipsetKey, seed: u8) -> Arc<Tipset> {
        Arc::new(Tipset::from(RawBlockHeader {
            miner: seed.into(),
            ticket: (epoch > 0).then(|| Ticket::new(VRFProof(vec![seed]))),
            parents: parents.clone(),
            epoch,
            ..Default::default()
        }))
    }

    struct Graph {
        branches: Branches,
        genesis: Arc<Tipset>,
    }

    impl Graph {
        fn new() -> Self {
            let genesis = tipset(0, &TipsetKey::default(), 0);
            let mut branches = Branches::default();
            branches.store_genesis(&genesis).unwrap();
            Self { branches, genesis }
        }

        /// Stores `tipset` whose parent is already indexed on `parent_branch`
        /// at `parent_height`, returning the events. Splits are exercised
        /// explicitly in their own tests.
        fn store(
            &mut self,
            tipset: &Arc<Tipset>,
            parent_hash: TipsetHash,
            parent_branch: Option<BranchId>,
            parent_height: Height,
        ) -> (StorePosition, Vec<HeadChange>) {
            let pos = self
                .branches
                .find_store_position(tipset.as_ref(), &parent_hash, parent_branch, parent_height)
                .unwrap();
            assert!(pos.rename.is_none_or(|r| !r.split));
            let changes = self
                .branches
                .store_tipset(tipset.as_ref(), &parent_hash, &pos)
                .unwrap();
            (pos, changes)
        }
    }

    #[test]
    fn genesis_is_a_synced_head() {
        let g = Graph::new();
        let heads: Vec<_> = g.branches.all_heads().collect();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].id, GENESIS_BRANCH);
        assert!(heads[0].synced_to_genesis);
        assert_eq!(&heads[0].top, g.genesis.hash());
    }

    #[test]
    fn extension_reports_removed_and_added() {
        let mut g = Graph::new();
        let gh = *g.genesis.hash();
        let t1 = tipset(1, g.genesis.key(), 1);
        let (pos, changes) = g.store(&t1, gh, Some(GENESIS_BRANCH), 0);
        assert_eq!(pos.assigned_branch, GENESIS_BRANCH);
        assert_eq!(
            changes,
            vec![HeadChange {
                removed: Some(gh),
                added: Some(*t1.hash()),
            }]
        );
        let branch = g.branches.get_branch(GENESIS_BRANCH).unwrap();
        assert_eq!(branch.top, *t1.hash());
        assert_eq!(branch.top_height, 1);
    }

    #[test]
    fn split_and_fork_partition_the_branch() {
        let mut g = Graph::new();
        let gh = *g.genesis.hash();
        let t1 = tipset(1, g.genesis.key(), 1);
        g.store(&t1, gh, Some(GENESIS_BRANCH), 0);
        let t2a = tipset(2, t1.key(), 2);
        g.store(&t2a, *t1.hash(), Some(GENESIS_BRANCH), 1);

        // a competing child of t1 arrives after the branch advanced past it
        let t2b = tipset(2, t1.key(), 3);
        let pos = g
            .branches
            .find_store_position(&t2b, t1.hash(), Some(GENESIS_BRANCH), 1)
            .unwrap();
        let rename = pos.rename.expect("mid-branch parent must split");
        assert!(rename.split);
        assert_eq!(rename.old_id, GENESIS_BRANCH);
        assert_eq!(rename.above_height, 1);
        assert_ne!(pos.assigned_branch, rename.new_id);

        g.branches
            .split_branch(t1.hash(), t2a.hash(), 2, &rename)
            .unwrap();
        let changes = g.branches.store_tipset(&t2b, t1.hash(), &pos).unwrap();
        assert_eq!(
            changes,
            vec![HeadChange {
                removed: None,
                added: Some(*t2b.hash()),
            }]
        );

        // the two ranges exactly partition the original one
        let lower = g.branches.get_branch(GENESIS_BRANCH).unwrap();
        let upper = g.branches.get_branch(rename.new_id).unwrap();
        assert_eq!((lower.bottom_height, lower.top_height), (0, 1));
        assert_eq!((upper.bottom_height, upper.top_height), (2, 2));
        assert_eq!(upper.parent, Some(GENESIS_BRANCH));
        assert_eq!(
            lower.forks,
            BTreeSet::from([rename.new_id, pos.assigned_branch])
        );

        // both tips are now synced heads
        let heads: Vec<_> = g.branches.all_heads().map(|b| b.top).collect();
        assert_eq!(heads.len(), 2);
        assert!(heads.contains(t2a.hash()));
        assert!(heads.contains(t2b.hash()));
    }

    #[test]
    fn standalone_branch_waits_for_its_parent() {
        let mut g = Graph::new();
        // an orphan at height 5 whose parent is unknown
        let t4 = tipset(4, &TipsetKey::new(vec![Default::default()]), 9);
        let t5 = tipset(5, t4.key(), 10);
        let pos = g
            .branches
            .find_store_position(&t5, t4.hash(), None, 0)
            .unwrap();
        assert_eq!(pos.at_bottom_of_branch, None);
        assert_eq!(pos.on_top_of_branch, None);
        let changes = g.branches.store_tipset(&t5, t4.hash(), &pos).unwrap();
        assert!(changes.is_empty());

        // the root is waiting for t4; when t4 arrives (still disconnected)
        // the wait moves down to t4's parent
        let pos2 = g
            .branches
            .find_store_position(&t4, t4.parents().hash(), None, 0)
            .unwrap();
        assert_eq!(pos2.at_bottom_of_branch, Some(pos.assigned_branch));
        assert_eq!(pos2.assigned_branch, pos.assigned_branch);
        let changes = g
            .branches
            .store_tipset(&t4, t4.parents().hash(), &pos2)
            .unwrap();
        assert!(changes.is_empty());
        let b = g.branches.get_branch(pos.assigned_branch).unwrap();
        assert_eq!((b.bottom_height, b.top_height), (4, 5));
    }

    #[test]
    fn merge_emits_removed_before_added() {
        let mut g = Graph::new();
        let gh = *g.genesis.hash();
        let t1 = tipset(1, g.genesis.key(), 1);
        g.store(&t1, gh, Some(GENESIS_BRANCH), 0);

        // t3 arrives first as an orphan branch waiting for t2
        let t2 = tipset(2, t1.key(), 2);
        let t3 = tipset(3, t2.key(), 3);
        let pos3 = g
            .branches
            .find_store_position(&t3, t2.hash(), None, 0)
            .unwrap();
        g.branches.store_tipset(&t3, t2.hash(), &pos3).unwrap();
        let orphan_branch = pos3.assigned_branch;

        // t2 arrives and links the orphan under the head: a merge
        let pos2 = g
            .branches
            .find_store_position(&t2, t1.hash(), Some(GENESIS_BRANCH), 1)
            .unwrap();
        assert_eq!(pos2.at_bottom_of_branch, Some(orphan_branch));
        assert_eq!(pos2.assigned_branch, GENESIS_BRANCH);
        let rename = pos2.rename.expect("merge renames the absorbed branch");
        assert!(!rename.split);
        assert_eq!(rename.old_id, orphan_branch);
        assert_eq!(rename.new_id, GENESIS_BRANCH);

        let changes = g.branches.store_tipset(&t2, t1.hash(), &pos2).unwrap();
        assert_eq!(
            changes,
            vec![HeadChange {
                removed: Some(*t1.hash()),
                added: Some(*t3.hash()),
            }]
        );

        // the absorbed id is gone, the survivor covers the whole range
        assert!(g.branches.get_branch(orphan_branch).is_err());
        let b = g.branches.get_branch(GENESIS_BRANCH).unwrap();
        assert_eq!((b.bottom_height, b.top_height), (0, 3));
    }

    #[test]
    fn event_accounting_matches_live_heads() {
        // accumulated added minus removed equals the live synced head set
        let mut g = Graph::new();
        let gh = *g.genesis.hash();
        let mut live: BTreeSet<TipsetHash> = BTreeSet::from([gh]);
        fn apply(changes: Vec<HeadChange>, live: &mut BTreeSet<TipsetHash>) {
            for c in changes {
                if let Some(r) = c.removed {
                    assert!(live.remove(&r));
                }
                if let Some(a) = c.added {
                    assert!(live.insert(a));
                }
            }
        }

        let t1 = tipset(1, g.genesis.key(), 1);
        let (_, c) = g.store(&t1, gh, Some(GENESIS_BRANCH), 0);
        apply(c, &mut live);

        let t2 = tipset(2, t1.key(), 2);
        let t3 = tipset(3, t2.key(), 3);
        let pos3 = g
            .branches
            .find_store_position(&t3, t2.hash(), None, 0)
            .unwrap();
        apply(
            g.branches.store_tipset(&t3, t2.hash(), &pos3).unwrap(),
            &mut live,
        );
        let pos2 = g
            .branches
            .find_store_position(&t2, t1.hash(), Some(GENESIS_BRANCH), 1)
            .unwrap();
        apply(
            g.branches.store_tipset(&t2, t1.hash(), &pos2).unwrap(),
            &mut live,
        );

        let synced_heads: BTreeSet<TipsetHash> = g
            .branches
            .all_heads()
            .filter(|b| b.synced_to_genesis)
            .map(|b| b.top)
            .collect();
        assert_eq!(live, synced_heads);
    }

    #[test]
    fn init_validates_structure() {
        let stub = |id: BranchId, bottom: Height, top: Height, parent: Option<BranchId>| {
            let mut b = BranchInfo::new(id, TipsetHash::default(), bottom, None);
            b.top_height = top;
            b.parent = parent;
            if parent.is_some() || id != GENESIS_BRANCH {
                b.parent_hash = Some(TipsetHash::default());
            }
            b
        };

        // no genesis branch
        let mut branches = Branches::default();
        let map = BTreeMap::from([(2, stub(2, 1, 2, None))]);
        assert_eq!(branches.init(map).unwrap_err(), Error::NoGenesisBranch);

        // parent missing
        let map = BTreeMap::from([
            (GENESIS_BRANCH, stub(GENESIS_BRANCH, 0, 1, None)),
            (2, stub(2, 2, 3, Some(7))),
        ]);
        assert!(matches!(
            branches.init(map).unwrap_err(),
            Error::GraphLoad(_)
        ));

        // parent height overlaps child range
        let map = BTreeMap::from([
            (GENESIS_BRANCH, stub(GENESIS_BRANCH, 0, 2, None)),
            (2, stub(2, 2, 3, Some(GENESIS_BRANCH))),
        ]);
        assert!(matches!(
            branches.init(map).unwrap_err(),
            Error::GraphLoad(_)
        ));

        // top below bottom
        let map = BTreeMap::from([(GENESIS_BRANCH, stub(GENESIS_BRANCH, 3, 1, None))]);
        assert!(matches!(
            branches.init(map).unwrap_err(),
            Error::GraphLoad(_)
        ));

        // non-genesis root without parent hash
        let mut orphan = stub(3, 4, 5, None);
        orphan.parent_hash = None;
        let map = BTreeMap::from([
            (GENESIS_BRANCH, stub(GENESIS_BRANCH, 0, 1, None)),
            (3, orphan),
        ]);
        assert_eq!(branches.init(map).unwrap_err(), Error::ParentExpected(3));
    }

    #[test]
    fn current_chain_walks_to_genesis() {
        let mut g = Graph::new();
        let gh = *g.genesis.hash();
        let t1 = tipset(1, g.genesis.key(), 1);
        g.store(&t1, gh, Some(GENESIS_BRANCH), 0);
        let t2a = tipset(2, t1.key(), 2);
        g.store(&t2a, *t1.hash(), Some(GENESIS_BRANCH), 1);

        let t2b = tipset(2, t1.key(), 3);
        let pos = g
            .branches
            .find_store_position(&t2b, t1.hash(), Some(GENESIS_BRANCH), 1)
            .unwrap();
        let rename = pos.rename.unwrap();
        g.branches
            .split_branch(t1.hash(), t2a.hash(), 2, &rename)
            .unwrap();
        g.branches.store_tipset(&t2b, t1.hash(), &pos).unwrap();

        // canonical chain through the t2a head
        g.branches.set_current_head(rename.new_id, 2).unwrap();
        assert_eq!(g.branches.branch_at_height(0).unwrap(), GENESIS_BRANCH);
        assert_eq!(g.branches.branch_at_height(1).unwrap(), GENESIS_BRANCH);
        assert_eq!(g.branches.branch_at_height(2).unwrap(), rename.new_id);
        assert!(g.branches.branch_at_height(3).is_err());

        // and through the competing head
        g.branches.set_current_head(pos.assigned_branch, 2).unwrap();
        assert_eq!(
            g.branches.branch_at_height(2).unwrap(),
            pos.assigned_branch
        );

        // an unsynced branch cannot become the current head
        let t9 = tipset(9, &TipsetKey::new(vec![Default::default()]), 9);
        let pos9 = g
            .branches
            .find_store_position(&t9, t9.parents().hash(), None, 0)
            .unwrap();
        g.branches
            .store_tipset(&t9, t9.parents().hash(), &pos9)
            .unwrap();
        assert_eq!(
            g.branches
                .set_current_head(pos9.assigned_branch, 9)
                .unwrap_err(),
            Error::HeadNotSynced(pos9.assigned_branch)
        );
    }
}
