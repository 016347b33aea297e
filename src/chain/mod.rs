// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::blocks::{self, Height, TipsetHash};
use thiserror::Error;

mod branches;
mod chain_db;
mod index_db;

pub use branches::{BranchInfo, Branches, HeadChange, RenameBranch, StorePosition};
pub use chain_db::ChainDb;
pub use index_db::{IndexDb, IndexDbBackend, TipsetInfo};

/// Identifier of a branch in the tipset graph. The branch containing genesis
/// always has id [`GENESIS_BRANCH`]; higher ids are forks or not-yet-connected
/// pieces of the chain. Ids are allocated monotonically and never reused.
pub type BranchId = u64;

/// The branch the genesis tipset lives on.
pub const GENESIS_BRANCH: BranchId = 1;

/// Chain and chain-index error
///
/// `Clone` so that an initialization failure can be latched inside
/// [`ChainDb`] and replayed to every subsequent caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("chain db is not initialized")]
    NotInitialized,
    #[error("genesis tipset required")]
    NoGenesis,
    #[error("genesis mismatch: expected {expected}, indexed {found}")]
    GenesisMismatch { expected: String, found: String },
    #[error("data integrity error: {0}")]
    DataIntegrity(String),
    #[error("bad tipset: {0}")]
    BadTipset(String),
    #[error("cannot load branch graph: {0}")]
    GraphLoad(String),
    #[error("branch graph has no genesis branch")]
    NoGenesisBranch,
    #[error("parent hash expected for branch {0}")]
    ParentExpected(BranchId),
    #[error("no current chain selected")]
    NoCurrentChain,
    #[error("branch {0} not found")]
    BranchNotFound(BranchId),
    #[error("branch {0} is not synced to genesis")]
    HeadNotSynced(BranchId),
    #[error("cycle detected in branch graph")]
    CycleDetected,
    #[error("height {height} out of range for branch {branch}")]
    HeightMismatch { branch: BranchId, height: Height },
    #[error("tipset {0} not indexed")]
    TipsetNotFound(TipsetHash),
    #[error("no tipset indexed at height {height} on branch {branch}")]
    TipsetNotFoundAt { branch: BranchId, height: Height },
    #[error("index backend error: {0}")]
    Backend(String),
    #[error("block store error: {0}")]
    Store(String),
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error(transparent)]
    Blocks(#[from] blocks::Error),
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Backend(e.to_string())
    }
}
