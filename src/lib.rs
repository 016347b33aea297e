// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Grove is a blockchain node built around tipset-based fork choice: the
//! chain may fork at any height, so the node maintains a DAG of tipset
//! branches, persists it durably, and reconciles it incrementally as blocks
//! are announced or fetched from peers.
//!
//! The crate is organized around the chain synchronization core:
//!
//! - [`blocks`]: block headers, tipsets and tipset keys
//! - [`chain`]: the fork-choice graph, its persistent index and the chain db
//!   facade
//! - [`chain_sync`]: loaders and the sync driver that keep the graph filled
//!   from the network
//! - [`db`], [`libp2p`], [`utils`]: the object store, the network interface
//!   types and shared helpers

pub mod blocks;
pub mod chain;
pub mod chain_sync;
pub mod db;
pub mod libp2p;
pub mod utils;
