// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

pub mod chain_exchange;

pub use libp2p::PeerId;

use chain_exchange::{ChainExchangeRequest, ChainExchangeResponse};

/// Errors of the request/response layer of the network service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestResponseError {
    /// The request could not be sent over the network
    #[error("connection failure: {0}")]
    ConnectionFailure(String),
    /// The remote peer did not answer within the protocol deadline
    #[error("request timed out")]
    Timeout,
    /// The remote closed the stream without a complete response
    #[error("connection closed by remote")]
    ConnectionClosed,
}

/// Messages into the network service to handle. The service itself (peer
/// discovery, transport, wire codecs) lives outside this crate; the chain
/// synchronizer only ever talks to it through this enum.
#[derive(Debug)]
pub enum NetworkMessage {
    ChainExchangeRequest {
        peer_id: PeerId,
        request: ChainExchangeRequest,
        response_channel: flume::Sender<Result<ChainExchangeResponse, RequestResponseError>>,
    },
}

/// Deterministic peer ids for the test-suite.
#[cfg(test)]
pub(crate) fn test_peer_id(seed: u8) -> PeerId {
    let mh = cid::multihash::Multihash::wrap(0x0, &[seed, 0, 0, 0])
        .expect("digest fits the identity multihash");
    PeerId::from_multihash(mh).expect("identity multihash is a valid peer id")
}
