// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Types of the chain-exchange protocol: fetching ranges of block headers,
//! message metadata and message payloads from a single peer. Only the
//! request/response data model lives here; the wire-level byte encoding is
//! the network service's concern.

use crate::blocks::{RawBlockHeader, TxMeta};
use cid::Cid;

/// `RequestOptions` flag: include block headers in the response.
pub const HEADERS: u64 = 1;
/// `RequestOptions` flag: include messages in the response.
pub const MESSAGES: u64 = 2;

/// The payload that gets sent to another node to indicate which blocks to
/// fetch, starting from `start` and walking down the parent links up to
/// `request_len` tipsets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainExchangeRequest {
    /// The tipset [`Cid`] to start the request from
    pub start: Vec<Cid>,
    /// The amount of epochs to request
    pub request_len: u64,
    /// 1 = Block headers, 2 = Messages, 3 = Blocks and Messages
    pub options: u64,
}

impl ChainExchangeRequest {
    /// If a request has the [`HEADERS`] bit set and requests Headers
    pub fn include_blocks(&self) -> bool {
        self.options & HEADERS > 0
    }

    /// If a request has the [`MESSAGES`] bit set and requests Messages
    pub fn include_messages(&self) -> bool {
        self.options & MESSAGES > 0
    }
}

/// Status codes of a chain-exchange response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainExchangeResponseStatus {
    /// All is well.
    Success,
    /// We could not fetch all blocks requested (but at least we returned
    /// the `Head` requested).
    PartialResponse,
    /// Request.Start not found.
    BlockNotFound,
    /// Requester is making too many requests.
    GoAway,
    /// Internal error occurred.
    InternalError,
    /// Request was bad.
    BadRequest,
}

/// The response to a chain-exchange request.
#[derive(Clone, Debug)]
pub struct ChainExchangeResponse {
    /// Status code of the response
    pub status: ChainExchangeResponseStatus,
    /// Status message indicating failure reason
    pub message: String,
    /// The blocks requested, deepest-first
    pub chain: Vec<BlockBundle>,
}

/// Everything the synchronizer needs to consider one block complete: its
/// header, the message-metadata object and the raw message payloads. Message
/// payloads are opaque here; they are content-addressed under the chain's
/// default codec and must hash to the CIDs listed in `tx_meta`.
#[derive(Clone, Debug)]
pub struct BlockBundle {
    pub header: RawBlockHeader,
    pub tx_meta: TxMeta,
    pub messages: Vec<Vec<u8>>,
}
