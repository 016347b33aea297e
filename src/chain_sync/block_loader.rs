// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;
use std::time::Duration;

use crate::blocks::{CachingBlockHeader, TxMeta, BLOCK_MESSAGE_LIMIT};
use crate::chain_sync::{Error, SyncConfig, SyncEvent};
use crate::libp2p::chain_exchange::{
    BlockBundle, ChainExchangeRequest, ChainExchangeResponseStatus, HEADERS, MESSAGES,
};
use crate::libp2p::{NetworkMessage, PeerId};
use crate::utils::db::CborStoreExt as _;
use ahash::{HashSet, HashSetExt};
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use multihash_codetable::{Code, MultihashDigest};
use tracing::{debug, warn};

/// Fetches block headers together with their message completeness.
///
/// A block is complete only when its header, its [`TxMeta`] and every message
/// it references are in the local store. Anything else joins a wantlist and
/// one aggregated chain-exchange request is issued for it; a CID already in
/// flight is never requested twice. Responses are persisted by a detached
/// task and surface as [`SyncEvent::BlockLoaded`] on the sync queue.
pub struct BlockLoader<DB> {
    db: Arc<DB>,
    network_send: flume::Sender<NetworkMessage>,
    events: flume::Sender<SyncEvent>,
    config: SyncConfig,
    in_flight: HashSet<Cid>,
    last_good_peer: Option<PeerId>,
}

impl<DB> BlockLoader<DB>
where
    DB: Blockstore + Send + Sync + 'static,
{
    pub fn new(
        db: Arc<DB>,
        network_send: flume::Sender<NetworkMessage>,
        events: flume::Sender<SyncEvent>,
        config: SyncConfig,
    ) -> Self {
        Self {
            db,
            network_send,
            events,
            config,
            in_flight: HashSet::new(),
            last_good_peer: None,
        }
    }

    /// Probes the local store for every CID and requests whatever is not
    /// complete yet. The returned vector has one entry per input CID: the
    /// header when the block is locally complete, [`None`] when it has to
    /// come from the network (or is already on its way).
    pub fn load_blocks(
        &mut self,
        cids: &[Cid],
        preferred_peer: Option<PeerId>,
        depth: u64,
    ) -> Result<Vec<Option<CachingBlockHeader>>, Error> {
        let mut available = vec![None; cids.len()];
        let mut wanted = Vec::new();
        for (i, cid) in cids.iter().enumerate() {
            if self.in_flight.contains(cid) {
                // already on the wire
                continue;
            }
            match self.find_block_in_local_store(cid)? {
                Some(header) => available[i] = Some(header),
                None => wanted.push(*cid),
            }
        }
        if !wanted.is_empty() {
            self.request(wanted, preferred_peer, depth)?;
        }
        Ok(available)
    }

    /// Bookkeeping for a completed request: the CID leaves the in-flight set
    /// and a successful peer becomes the default for the next request.
    pub fn on_block(&mut self, cid: &Cid, peer: PeerId, ok: bool) {
        self.in_flight.remove(cid);
        if ok {
            self.last_good_peer = Some(peer);
        }
    }

    /// The header, only if the block is fully complete locally.
    fn find_block_in_local_store(&self, cid: &Cid) -> Result<Option<CachingBlockHeader>, Error> {
        let Some(header) =
            CachingBlockHeader::load(self.db.as_ref(), *cid).map_err(|e| Error::Store(e.to_string()))?
        else {
            return Ok(None);
        };
        let Some(meta) = self
            .db
            .get_cbor::<TxMeta>(&header.messages)
            .map_err(|e| Error::Store(e.to_string()))?
        else {
            return Ok(None);
        };
        for msg_cid in meta.iter() {
            if !self.db.has(msg_cid).map_err(|e| Error::Store(e.to_string()))? {
                return Ok(None);
            }
        }
        Ok(Some(header))
    }

    /// One aggregated request for all wanted CIDs, depth clamped.
    fn request(
        &mut self,
        wanted: Vec<Cid>,
        preferred_peer: Option<PeerId>,
        depth: u64,
    ) -> Result<(), Error> {
        let peer = preferred_peer
            .or(self.last_good_peer)
            .ok_or(Error::NoPeers)?;
        let depth = depth.clamp(1, self.config.max_request_depth);

        let (sender, receiver) = flume::bounded(1);
        self.network_send
            .send(NetworkMessage::ChainExchangeRequest {
                peer_id: peer,
                request: ChainExchangeRequest {
                    start: wanted.clone(),
                    request_len: depth,
                    options: HEADERS | MESSAGES,
                },
                response_channel: sender,
            })
            .map_err(|_| Error::Network("network service unavailable".to_string()))?;

        debug!("requesting {} blocks from {peer}, depth {depth}", wanted.len());
        self.in_flight.extend(wanted.iter().copied());

        let db = self.db.clone();
        let events = self.events.clone();
        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        tokio::spawn(async move {
            handle_response(db, events, peer, wanted, receiver, timeout).await;
        });
        Ok(())
    }
}

/// Awaits one chain-exchange response, persists its bundles and reports a
/// [`SyncEvent::BlockLoaded`] per wanted CID. A failed request, a bad status
/// or a missing block is a terminal error for every CID that waited on it.
async fn handle_response<DB: Blockstore>(
    db: Arc<DB>,
    events: flume::Sender<SyncEvent>,
    peer: PeerId,
    wanted: Vec<Cid>,
    receiver: flume::Receiver<
        Result<crate::libp2p::chain_exchange::ChainExchangeResponse, crate::libp2p::RequestResponseError>,
    >,
    timeout: Duration,
) {
    let response = match tokio::time::timeout(timeout, receiver.recv_async()).await {
        Err(_) => Err(Error::Network("chain exchange request timed out".to_string())),
        Ok(Err(_)) => Err(Error::Network("chain exchange stream closed".to_string())),
        Ok(Ok(Err(e))) => Err(Error::Network(e.to_string())),
        Ok(Ok(Ok(response))) => match response.status {
            ChainExchangeResponseStatus::Success
            | ChainExchangeResponseStatus::PartialResponse => Ok(response),
            status => Err(Error::Network(format!(
                "chain exchange failed with {status:?}: {}",
                response.message
            ))),
        },
    };

    let mut received: HashSet<Cid> = HashSet::new();
    let error = match response {
        Ok(response) => {
            let mut failure = None;
            for bundle in response.chain {
                match persist_bundle(db.as_ref(), bundle) {
                    Ok((cid, header)) => {
                        if wanted.contains(&cid) && received.insert(cid) {
                            let _ = events.send(SyncEvent::BlockLoaded {
                                cid,
                                peer,
                                result: Ok(header),
                            });
                        }
                    }
                    Err(e) => {
                        // one corrupt bundle taints the whole response
                        warn!("dropping response from {peer}: {e}");
                        received.clear();
                        failure = Some(e);
                        break;
                    }
                }
            }
            failure.unwrap_or_else(|| {
                Error::Network(format!("block missing from response of {peer}"))
            })
        }
        Err(e) => e,
    };

    for cid in wanted {
        if !received.contains(&cid) {
            let _ = events.send(SyncEvent::BlockLoaded {
                cid,
                peer,
                result: Err(error.clone()),
            });
        }
    }
}

/// Validates a bundle against its own metadata and persists its objects:
/// messages first, then the [`TxMeta`], then the header. Returns the header
/// CID.
fn persist_bundle<DB: Blockstore>(
    db: &DB,
    bundle: BlockBundle,
) -> Result<(Cid, CachingBlockHeader), Error> {
    let BlockBundle {
        header,
        tx_meta,
        messages,
    } = bundle;

    if tx_meta.len() > BLOCK_MESSAGE_LIMIT {
        return Err(Error::BadBlock(format!(
            "too many messages ({})",
            tx_meta.len()
        )));
    }

    for data in &messages {
        let cid = Cid::new_v1(fvm_ipld_encoding::DAG_CBOR, Code::Blake2b256.digest(data));
        db.put_keyed(&cid, data)
            .map_err(|e| Error::Store(e.to_string()))?;
    }
    // the bundle must leave the block complete: every referenced message is
    // either in the bundle or already stored
    for msg_cid in tx_meta.iter() {
        if !db.has(msg_cid).map_err(|e| Error::Store(e.to_string()))? {
            return Err(Error::BadBlock(format!("message {msg_cid} not delivered")));
        }
    }

    let meta_cid = db
        .put_cbor_default(&tx_meta)
        .map_err(|e| Error::Store(e.to_string()))?;
    if meta_cid != header.messages {
        return Err(Error::BadBlock(format!(
            "message metadata mismatch: {meta_cid} != {}",
            header.messages
        )));
    }

    let header_cid = db
        .put_cbor_default(&header)
        .map_err(|e| Error::Store(e.to_string()))?;
    Ok((header_cid, CachingBlockHeader::new(header)))
}
