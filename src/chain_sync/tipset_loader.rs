// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;

use crate::blocks::{CachingBlockHeader, Tipset, TipsetHash, TipsetKey};
use crate::chain_sync::{BlockLoader, Error, SyncEvent};
use crate::libp2p::PeerId;
use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use tracing::error;

/// One pending tipset assembly.
struct RequestCtx {
    tipset_key: TipsetKey,
    wantlist: HashSet<Cid>,
    blocks_filled: Vec<Option<CachingBlockHeader>>,
}

/// Assembles full tipsets out of individually fetched blocks.
///
/// Each request keeps its own wantlist; all wantlists join a global one so a
/// single arriving block satisfies every pending tipset that needs it. A
/// request whose blocks are all local resolves immediately, but through the
/// event queue, never inline. One failed block fails every tipset waiting on
/// it.
pub struct TipsetLoader<DB> {
    block_loader: BlockLoader<DB>,
    events: flume::Sender<SyncEvent>,
    tipset_requests: HashMap<TipsetHash, RequestCtx>,
    global_wantlist: HashSet<Cid>,
}

impl<DB> TipsetLoader<DB>
where
    DB: Blockstore + Send + Sync + 'static,
{
    pub fn new(block_loader: BlockLoader<DB>, events: flume::Sender<SyncEvent>) -> Self {
        Self {
            block_loader,
            events,
            tipset_requests: HashMap::new(),
            global_wantlist: HashSet::new(),
        }
    }

    /// Requests assembly of the tipset identified by `key`. A no-op if the
    /// same tipset is already pending. Resolution arrives as
    /// [`SyncEvent::TipsetResolved`].
    pub fn load_tipset(
        &mut self,
        key: &TipsetKey,
        preferred_peer: Option<PeerId>,
        depth: u64,
    ) -> Result<(), Error> {
        let hash = *key.hash();
        if self.tipset_requests.contains_key(&hash) {
            // already waiting, the pending request will answer this one too
            return Ok(());
        }

        let blocks_available = self
            .block_loader
            .load_blocks(key.cids(), preferred_peer, depth)?;

        let mut wantlist = HashSet::new();
        for (i, block) in blocks_available.iter().enumerate() {
            if block.is_none() {
                wantlist.insert(key.cids()[i]);
            }
        }

        if wantlist.is_empty() {
            // complete already; scheduled through the queue so the caller
            // never observes a completion inside its own call stack
            let result = assemble(key, blocks_available);
            let _ = self.events.send(SyncEvent::TipsetResolved { hash, result });
            return Ok(());
        }

        self.global_wantlist.extend(wantlist.iter().copied());
        self.tipset_requests.insert(
            hash,
            RequestCtx {
                tipset_key: key.clone(),
                wantlist,
                blocks_filled: blocks_available,
            },
        );
        Ok(())
    }

    /// Fans one block completion out to every pending tipset request,
    /// emitting [`SyncEvent::TipsetResolved`] for each request it finishes.
    pub fn on_block(&mut self, cid: &Cid, peer: PeerId, result: Result<CachingBlockHeader, Error>) {
        self.block_loader.on_block(cid, peer, result.is_ok());

        if !self.global_wantlist.remove(cid) {
            // not our block
            return;
        }

        match result {
            Ok(header) => {
                let mut completed = Vec::new();
                for (hash, ctx) in self.tipset_requests.iter_mut() {
                    if !ctx.wantlist.remove(cid) {
                        continue;
                    }
                    let Some(pos) = ctx.tipset_key.cids().iter().position(|c| c == cid) else {
                        continue;
                    };
                    ctx.blocks_filled[pos] = Some(header.clone());
                    if ctx.wantlist.is_empty() {
                        completed.push(*hash);
                    }
                }
                for hash in completed {
                    if let Some(ctx) = self.tipset_requests.remove(&hash) {
                        let result = assemble(&ctx.tipset_key, ctx.blocks_filled);
                        let _ = self.events.send(SyncEvent::TipsetResolved { hash, result });
                    }
                }
            }
            Err(e) => {
                let affected: Vec<TipsetHash> = self
                    .tipset_requests
                    .iter()
                    .filter(|(_, ctx)| ctx.wantlist.contains(cid))
                    .map(|(hash, _)| *hash)
                    .collect();
                for hash in affected {
                    self.tipset_requests.remove(&hash);
                    let _ = self.events.send(SyncEvent::TipsetResolved {
                        hash,
                        result: Err(e.clone()),
                    });
                }
            }
        }
    }
}

/// Builds the tipset once every block slot is filled.
fn assemble(
    key: &TipsetKey,
    blocks: Vec<Option<CachingBlockHeader>>,
) -> Result<Arc<Tipset>, Error> {
    let headers: Option<Vec<CachingBlockHeader>> = blocks.into_iter().collect();
    let headers =
        headers.ok_or_else(|| Error::BadTipset("tipset assembled with missing blocks".to_string()))?;
    match Tipset::new(headers) {
        Ok(tipset) => {
            let tipset = Arc::new(tipset);
            if tipset.key() != key {
                return Err(Error::BadTipset(format!(
                    "assembled tipset key {} does not match requested {key}",
                    tipset.key()
                )));
            }
            Ok(tipset)
        }
        Err(e) => {
            error!("cannot create tipset: {e}");
            Err(Error::BadTipset(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{RawBlockHeader, Ticket, VRFProof};
    use crate::chain_sync::SyncConfig;
    use crate::db::MemoryDB;
    use crate::libp2p::chain_exchange::{
        BlockBundle, ChainExchangeResponse, ChainExchangeResponseStatus,
    };
    use crate::libp2p::NetworkMessage;
    use crate::blocks::TxMeta;
    use crate::utils::db::CborStoreExt as _;

    fn setup() -> (
        TipsetLoader<MemoryDB>,
        Arc<MemoryDB>,
        flume::Receiver<NetworkMessage>,
        flume::Receiver<SyncEvent>,
    ) {
        let db = Arc::new(MemoryDB::default());
        let (network_send, network_recv) = flume::unbounded();
        let (event_send, event_recv) = flume::unbounded();
        let block_loader = BlockLoader::new(
            db.clone(),
            network_send,
            event_send.clone(),
            SyncConfig::default(),
        );
        (
            TipsetLoader::new(block_loader, event_send),
            db,
            network_recv,
            event_recv,
        )
    }

    /// A header with an empty (but stored) message tree.
    fn header(db: &MemoryDB, epoch: u64, seed: u8) -> RawBlockHeader {
        let meta_cid = db.put_cbor_default(&TxMeta::default()).unwrap();
        RawBlockHeader {
            miner: seed.into(),
            ticket: Some(Ticket::new(VRFProof(vec![seed]))),
            epoch,
            messages: meta_cid,
            ..Default::default()
        }
    }

    fn bundle(header: &RawBlockHeader) -> BlockBundle {
        BlockBundle {
            header: header.clone(),
            tx_meta: TxMeta::default(),
            messages: vec![],
        }
    }

    #[tokio::test]
    async fn local_tipset_resolves_through_the_queue() {
        let (mut loader, db, network, events) = setup();
        let h = header(&db, 1, 1);
        db.put_cbor_default(&h).unwrap();

        let key = TipsetKey::new(vec![h.cid()]);
        loader.load_tipset(&key, None, 1).unwrap();
        assert!(network.is_empty());

        // nothing was delivered inline; the resolution sits in the queue
        match events.recv_async().await.unwrap() {
            SyncEvent::TipsetResolved { hash, result } => {
                assert_eq!(hash, *key.hash());
                assert_eq!(result.unwrap().key(), &key);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn one_block_fans_out_to_all_waiting_tipsets() {
        let (mut loader, db, network, events) = setup();
        let peer = crate::libp2p::test_peer_id(1);

        let shared = header(&db, 2, 1);
        let other = header(&db, 2, 2);
        db.put_cbor_default(&other).unwrap();

        // two tipset requests both waiting for the shared block
        let key_a = TipsetKey::new(vec![shared.cid()]);
        let key_b = TipsetKey::new(vec![shared.cid(), other.cid()]);
        loader.load_tipset(&key_a, Some(peer), 1).unwrap();
        loader.load_tipset(&key_b, Some(peer), 1).unwrap();

        // exactly one network request went out for the shared block
        let NetworkMessage::ChainExchangeRequest {
            request,
            response_channel,
            ..
        } = network.recv().unwrap();
        assert_eq!(request.start, vec![shared.cid()]);
        assert!(network.is_empty());

        response_channel
            .send(Ok(ChainExchangeResponse {
                status: ChainExchangeResponseStatus::Success,
                message: String::new(),
                chain: vec![bundle(&shared)],
            }))
            .unwrap();

        // drive the loop by hand: block event in, two tipset events out
        let mut resolved = Vec::new();
        loop {
            match events.recv_async().await.unwrap() {
                SyncEvent::BlockLoaded { cid, peer, result } => {
                    loader.on_block(&cid, peer, result)
                }
                SyncEvent::TipsetResolved { hash, result } => {
                    assert!(result.is_ok());
                    resolved.push(hash);
                    if resolved.len() == 2 {
                        break;
                    }
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(resolved.contains(key_a.hash()));
        assert!(resolved.contains(key_b.hash()));
    }

    #[tokio::test]
    async fn one_bad_block_fails_the_whole_tipset() {
        let (mut loader, db, network, events) = setup();
        let peer = crate::libp2p::test_peer_id(1);

        let missing = header(&db, 2, 1);
        let key = TipsetKey::new(vec![missing.cid()]);
        loader.load_tipset(&key, Some(peer), 1).unwrap();

        let NetworkMessage::ChainExchangeRequest {
            response_channel, ..
        } = network.recv().unwrap();
        // the peer answers with nothing useful
        response_channel
            .send(Ok(ChainExchangeResponse {
                status: ChainExchangeResponseStatus::BlockNotFound,
                message: "unknown cid".to_string(),
                chain: vec![],
            }))
            .unwrap();

        loop {
            match events.recv_async().await.unwrap() {
                SyncEvent::BlockLoaded { cid, peer, result } => {
                    loader.on_block(&cid, peer, result)
                }
                SyncEvent::TipsetResolved { hash, result } => {
                    assert_eq!(hash, *key.hash());
                    assert!(matches!(result, Err(Error::Network(_))));
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn duplicate_requests_are_coalesced() {
        let (mut loader, db, network, _events) = setup();
        let peer = crate::libp2p::test_peer_id(1);

        let h = header(&db, 2, 1);
        let key = TipsetKey::new(vec![h.cid()]);
        loader.load_tipset(&key, Some(peer), 1).unwrap();
        loader.load_tipset(&key, Some(peer), 1).unwrap();

        // a single request on the wire
        assert_eq!(network.len(), 1);
    }
}
