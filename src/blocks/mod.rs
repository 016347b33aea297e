// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

mod block;
mod header;
mod ticket;
mod tipset;
mod vrf_proof;

pub use block::{TxMeta, BLOCK_MESSAGE_LIMIT};
pub use header::{CachingBlockHeader, RawBlockHeader};
pub use ticket::Ticket;
pub use tipset::{Tipset, TipsetHash, TipsetKey};
pub use vrf_proof::VRFProof;

/// Height of a tipset in the chain, otherwise known as epoch. Height 0 is
/// reserved for the genesis tipset.
pub type Height = u64;

/// Blockchain blocks error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Tipset contains invalid data, as described by the string parameter.
    #[error("Invalid tipset: {0}")]
    InvalidTipset(String),
    /// The given tipset has no blocks
    #[error("No blocks for tipset")]
    NoBlocks,
    /// Error in validating arbitrary data
    #[error("Error validating data: {0}")]
    Validation(String),
}
