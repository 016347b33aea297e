// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Chain synchronization: keeps the local [`ChainDb`](crate::chain::ChainDb)
//! filled from the network. Peer-announced heads become sync targets; the
//! heaviest credible target is walked backwards tipset by tipset until it
//! connects to a locally-known point.
//!
//! All graph mutation happens on the [`Syncer::run`] task. Loaders never call
//! back inline: completions travel as [`SyncEvent`] records through one queue,
//! which both preserves ordering across reentrant completions and decouples
//! consumers from producer call stacks.

use crate::blocks::{CachingBlockHeader, Height, Tipset, TipsetHash, TipsetKey};
use crate::chain;
use crate::libp2p::PeerId;
use cid::Cid;
use num_bigint::BigInt;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error as ThisError;

mod block_loader;
mod sync_job;
mod sync_status;
mod tipset_loader;

pub use block_loader::BlockLoader;
pub use sync_job::{SyncTarget, Syncer};
pub use sync_status::{SyncStage, SyncStatus};
pub use tipset_loader::TipsetLoader;

/// Chain synchronization error. Network-scoped failures are kept apart from
/// [`chain::Error`] so a bad peer response never poisons the chain db state.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Error {
    #[error("bad tipset: {0}")]
    BadTipset(String),
    #[error("bad block: {0}")]
    BadBlock(String),
    #[error("no peers available")]
    NoPeers,
    #[error("network request failed: {0}")]
    Network(String),
    #[error("block store error: {0}")]
    Store(String),
    #[error(transparent)]
    ChainStore(#[from] chain::Error),
}

/// Everything the sync event loop reacts to.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A peer announced a chain head.
    NewTarget {
        peer: PeerId,
        head: TipsetKey,
        weight: BigInt,
        height: Height,
    },
    /// A peer went away; its pending target is dropped.
    PeerDisconnected(PeerId),
    /// The locally validated chain advanced; stale targets are pruned.
    SetCurrentWeight { weight: BigInt, height: Height },
    /// A block request completed, successfully or not.
    BlockLoaded {
        cid: Cid,
        peer: PeerId,
        result: Result<CachingBlockHeader, Error>,
    },
    /// A tipset assembly completed, successfully or not.
    TipsetResolved {
        hash: TipsetHash,
        result: Result<Arc<Tipset>, Error>,
    },
}

/// Tunables of the fetch pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper clamp on the depth of a single chain-exchange request
    pub max_request_depth: u64,
    /// Seconds before an in-flight chain-exchange request is abandoned
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_request_depth: 50,
            request_timeout_secs: 5,
        }
    }
}
