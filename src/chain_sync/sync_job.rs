// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;

use crate::blocks::{Height, Tipset, TipsetHash, TipsetKey};
use crate::chain::ChainDb;
use crate::chain_sync::{
    BlockLoader, Error, SyncConfig, SyncEvent, SyncStage, SyncStatus, TipsetLoader,
};
use crate::libp2p::{NetworkMessage, PeerId};
use ahash::{HashMap, HashMapExt};
use fvm_ipld_blockstore::Blockstore;
use num_bigint::BigInt;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

/// One backward walk from an announced head down to a locally-known point.
///
/// The job requests the head tipset if it is unindexed, stores every resolved
/// tipset, and keeps requesting whatever [`ChainDb::store_tipset`] reports as
/// the next unsynced ancestor. Completions that do not match the awaited
/// hash are stale deliveries of a cancelled or superseded walk and are
/// dropped.
struct SyncJob {
    peer: PeerId,
    head: TipsetKey,
    next: Option<TipsetHash>,
    active: bool,
    status: Arc<RwLock<SyncStatus>>,
}

impl SyncJob {
    fn new(peer: PeerId, head: TipsetKey, status: Arc<RwLock<SyncStatus>>) -> Self {
        Self {
            peer,
            head,
            next: None,
            active: true,
            status,
        }
    }

    fn is_active(&self) -> bool {
        self.active
    }

    async fn start<DB>(
        &mut self,
        chain_db: &mut ChainDb<DB>,
        loader: &mut TipsetLoader<DB>,
        probable_depth: u64,
    ) where
        DB: Blockstore + Send + Sync + 'static,
    {
        self.status.write().init(self.peer, self.head.clone());
        debug!("sync job started towards {} via {}", self.head, self.peer);
        if let Err(e) = self.try_start(chain_db, loader, probable_depth).await {
            self.finish_err(e);
        }
    }

    async fn try_start<DB>(
        &mut self,
        chain_db: &mut ChainDb<DB>,
        loader: &mut TipsetLoader<DB>,
        probable_depth: u64,
    ) -> Result<(), Error>
    where
        DB: Blockstore + Send + Sync + 'static,
    {
        let head = self.head.clone();
        let head_hash = *head.hash();
        if !chain_db.tipset_is_stored(&head_hash).await? {
            // not indexed, loading
            loader.load_tipset(&head, Some(self.peer), probable_depth)?;
            self.await_next(head_hash);
            return Ok(());
        }
        let unsynced = chain_db.unsynced_bottom(&head_hash).await?;
        self.next_target(loader, unsynced)
    }

    async fn on_tipset_loaded<DB>(
        &mut self,
        chain_db: &mut ChainDb<DB>,
        loader: &mut TipsetLoader<DB>,
        hash: TipsetHash,
        result: Result<Arc<Tipset>, Error>,
    ) where
        DB: Blockstore + Send + Sync + 'static,
    {
        if !self.active || self.next != Some(hash) {
            // not the tipset this walk is waiting for
            return;
        }
        if let Err(e) = self.process(chain_db, loader, result).await {
            self.finish_err(e);
        }
    }

    async fn process<DB>(
        &mut self,
        chain_db: &mut ChainDb<DB>,
        loader: &mut TipsetLoader<DB>,
        result: Result<Arc<Tipset>, Error>,
    ) -> Result<(), Error>
    where
        DB: Blockstore + Send + Sync + 'static,
    {
        let tipset = result?;
        self.status.write().last_loaded = Some(*tipset.hash());
        let parents = tipset.parents().clone();
        let unsynced = chain_db.store_tipset(&tipset, &parents).await?;
        self.next_target(loader, unsynced)
    }

    /// Requests the parent of the lowest unsynced ancestor, or closes the
    /// walk when the chain db reports none.
    fn next_target<DB>(
        &mut self,
        loader: &mut TipsetLoader<DB>,
        last_loaded: Option<Arc<Tipset>>,
    ) -> Result<(), Error>
    where
        DB: Blockstore + Send + Sync + 'static,
    {
        let Some(bottom) = last_loaded else {
            self.finish(SyncStage::SyncedToGenesis, None);
            return Ok(());
        };

        self.status.write().last_loaded = Some(*bottom.hash());
        let next_key = bottom.parents().clone();
        if next_key.is_empty() {
            return Err(Error::BadTipset(
                "unsynced ancestor with no parents".to_string(),
            ));
        }
        self.await_next(*next_key.hash());
        let probable_depth = bottom.epoch().saturating_sub(1).max(1);
        loader.load_tipset(&next_key, Some(self.peer), probable_depth)?;
        Ok(())
    }

    fn await_next(&mut self, hash: TipsetHash) {
        self.next = Some(hash);
        self.status.write().next = Some(hash);
    }

    fn finish(&mut self, stage: SyncStage, error: Option<Error>) {
        info!("sync job towards {} finished: {stage}", self.head);
        self.active = false;
        self.status.write().finish(stage, error);
    }

    fn finish_err(&mut self, e: Error) {
        warn!("sync job towards {} failed: {e}", self.head);
        let stage = match &e {
            Error::BadTipset(_) | Error::BadBlock(_) => SyncStage::BadBlocks,
            _ => SyncStage::InternalError,
        };
        self.finish(stage, Some(e));
    }
}

/// A peer-announced sync candidate.
#[derive(Clone, Debug)]
pub struct SyncTarget {
    pub head: TipsetKey,
    pub weight: BigInt,
    pub height: Height,
}

/// Arbitrates among peer-announced heads and drives one [`SyncJob`] at a
/// time, always towards the heaviest target that outweighs the local chain.
///
/// The syncer owns the [`ChainDb`] and the loaders: every graph mutation
/// happens on its [`Syncer::run`] task, events arriving through one queue.
pub struct Syncer<DB> {
    chain_db: ChainDb<DB>,
    tipset_loader: TipsetLoader<DB>,
    pending_targets: HashMap<PeerId, SyncTarget>,
    current_weight: BigInt,
    current_height: Height,
    current_job: Option<SyncJob>,
    events_rx: flume::Receiver<SyncEvent>,
    events_tx: flume::Sender<SyncEvent>,
    status: Arc<RwLock<SyncStatus>>,
}

impl<DB> Syncer<DB>
where
    DB: Blockstore + Send + Sync + 'static,
{
    pub fn new(
        chain_db: ChainDb<DB>,
        db: Arc<DB>,
        network_send: flume::Sender<NetworkMessage>,
        config: SyncConfig,
    ) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        let block_loader = BlockLoader::new(db, network_send, events_tx.clone(), config);
        let tipset_loader = TipsetLoader::new(block_loader, events_tx.clone());
        Self {
            chain_db,
            tipset_loader,
            pending_targets: HashMap::new(),
            current_weight: BigInt::default(),
            current_height: 0,
            current_job: None,
            events_rx,
            events_tx,
            status: Arc::new(RwLock::new(SyncStatus::default())),
        }
    }

    /// The handle peers, gossip and the node wiring push events through.
    pub fn event_sender(&self) -> flume::Sender<SyncEvent> {
        self.events_tx.clone()
    }

    /// Live view of the current (or last) sync job.
    pub fn status(&self) -> Arc<RwLock<SyncStatus>> {
        self.status.clone()
    }

    pub fn chain_db(&mut self) -> &mut ChainDb<DB> {
        &mut self.chain_db
    }

    /// Consumes events until every sender is gone.
    pub async fn run(mut self) {
        while let Ok(event) = self.events_rx.recv_async().await {
            self.handle_event(event).await;
        }
    }

    async fn handle_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::NewTarget {
                peer,
                head,
                weight,
                height,
            } => self.new_target(peer, head, weight, height).await,
            SyncEvent::PeerDisconnected(peer) => {
                self.pending_targets.remove(&peer);
            }
            SyncEvent::SetCurrentWeight { weight, height } => {
                self.set_current_weight_and_height(weight, height);
            }
            SyncEvent::BlockLoaded { cid, peer, result } => {
                self.tipset_loader.on_block(&cid, peer, result);
            }
            SyncEvent::TipsetResolved { hash, result } => {
                if let Some(job) = self.current_job.as_mut() {
                    job.on_tipset_loaded(&mut self.chain_db, &mut self.tipset_loader, hash, result)
                        .await;
                }
                self.drain_pending_targets().await;
            }
        }
    }

    async fn new_target(&mut self, peer: PeerId, head: TipsetKey, weight: BigInt, height: Height) {
        if weight <= self.current_weight {
            // not a sync target
            return;
        }
        if self.is_active() {
            self.pending_targets
                .insert(peer, SyncTarget { head, weight, height });
        } else {
            self.start_job(peer, head, height).await;
            self.drain_pending_targets().await;
        }
    }

    /// The locally validated chain advanced; targets it outweighs are
    /// dropped.
    fn set_current_weight_and_height(&mut self, weight: BigInt, height: Height) {
        self.current_weight = weight;
        self.current_height = height;
        let current_weight = self.current_weight.clone();
        self.pending_targets
            .retain(|_, target| target.weight > current_weight);
    }

    fn is_active(&self) -> bool {
        self.current_job.as_ref().is_some_and(SyncJob::is_active)
    }

    /// Starts jobs for queued targets until one stays active or none
    /// qualify.
    async fn drain_pending_targets(&mut self) {
        while !self.is_active() {
            let Some((peer, target)) = self.choose_next_target() else {
                break;
            };
            self.pending_targets.remove(&peer);
            self.start_job(peer, target.head, target.height).await;
        }
    }

    /// The heaviest pending target above the local weight. When every
    /// pending target is obsolete the whole set is forgotten.
    fn choose_next_target(&mut self) -> Option<(PeerId, SyncTarget)> {
        let best = self
            .pending_targets
            .iter()
            .filter(|(_, t)| t.weight > self.current_weight)
            .max_by(|(_, a), (_, b)| a.weight.cmp(&b.weight))
            .map(|(peer, t)| (*peer, t.clone()));
        if best.is_none() {
            self.pending_targets.clear();
        }
        best
    }

    async fn start_job(&mut self, peer: PeerId, head: TipsetKey, height: Height) {
        let probable_depth = if height > self.current_height {
            height - self.current_height
        } else {
            height
        }
        .max(1);
        let mut job = SyncJob::new(peer, head, self.status.clone());
        job.start(&mut self.chain_db, &mut self.tipset_loader, probable_depth)
            .await;
        self.current_job = Some(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{RawBlockHeader, Ticket, TxMeta, VRFProof};
    use crate::chain::{HeadChange, IndexDb, IndexDbBackend};
    use crate::db::MemoryDB;
    use crate::libp2p::chain_exchange::{
        BlockBundle, ChainExchangeResponse, ChainExchangeResponseStatus,
    };
    use crate::utils::db::CborStoreExt as _;
    use cid::Cid;
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;

    fn header(store: &MemoryDB, epoch: Height, parents: &TipsetKey, seed: u8) -> RawBlockHeader {
        let meta_cid = store.put_cbor_default(&TxMeta::default()).unwrap();
        RawBlockHeader {
            miner: seed.into(),
            ticket: (epoch > 0).then(|| Ticket::new(VRFProof(vec![seed]))),
            parents: parents.clone(),
            weight: BigInt::from(epoch) * 10,
            epoch,
            messages: meta_cid,
            ..Default::default()
        }
    }

    async fn bootstrapped_syncer(
        store: Arc<MemoryDB>,
        genesis: &RawBlockHeader,
    ) -> (Syncer<MemoryDB>, flume::Receiver<NetworkMessage>) {
        store.put_cbor_default(genesis).unwrap();
        let pool = crate::utils::sqlite::open_memory().await.unwrap();
        let index_db = IndexDb::new(IndexDbBackend::open(pool).await.unwrap());
        let mut chain_db = ChainDb::new(store.clone(), index_db);
        chain_db.init(Some(genesis.cid()), true).await.unwrap();

        let (network_send, network_recv) = flume::unbounded();
        let syncer = Syncer::new(chain_db, store, network_send, SyncConfig::default());
        (syncer, network_recv)
    }

    /// Answers chain-exchange requests from a map of headers, walking parent
    /// links downwards like a real peer would.
    fn spawn_peer(
        network_recv: flume::Receiver<NetworkMessage>,
        headers: StdHashMap<Cid, RawBlockHeader>,
    ) {
        tokio::spawn(async move {
            while let Ok(msg) = network_recv.recv_async().await {
                let NetworkMessage::ChainExchangeRequest {
                    request,
                    response_channel,
                    ..
                } = msg;
                let mut chain = Vec::new();
                let mut cursor = request.start[0];
                for _ in 0..request.request_len {
                    let Some(h) = headers.get(&cursor) else { break };
                    chain.push(BlockBundle {
                        header: h.clone(),
                        tx_meta: TxMeta::default(),
                        messages: vec![],
                    });
                    match h.parents.cids().first() {
                        Some(parent) => cursor = *parent,
                        None => break,
                    }
                }
                let _ = response_channel.send(Ok(ChainExchangeResponse {
                    status: ChainExchangeResponseStatus::Success,
                    message: String::new(),
                    chain,
                }));
            }
        });
    }

    /// Drives the syncer's queue by hand until the job leaves `InProgress`.
    async fn drive_to_completion(syncer: &mut Syncer<MemoryDB>) {
        while syncer.status.read().stage == SyncStage::InProgress {
            let event = tokio::time::timeout(Duration::from_secs(5), syncer.events_rx.recv_async())
                .await
                .expect("sync made no progress")
                .unwrap();
            syncer.handle_event(event).await;
        }
    }

    #[tokio::test]
    async fn backward_sync_to_genesis() {
        let store = Arc::new(MemoryDB::default());
        let genesis = header(&store, 0, &TipsetKey::default(), 0);
        let (mut syncer, network_recv) = bootstrapped_syncer(store.clone(), &genesis).await;
        let mut head_changes = syncer.chain_db().subscribe_head_changes();

        // the peer holds a chain of four tipsets above genesis
        let mut headers = StdHashMap::new();
        let mut parent_key = TipsetKey::new(vec![genesis.cid()]);
        let mut head_key = parent_key.clone();
        for epoch in 1..=4 {
            let h = header(&store, epoch, &parent_key, epoch as u8);
            parent_key = TipsetKey::new(vec![h.cid()]);
            head_key = parent_key.clone();
            headers.insert(h.cid(), h);
        }
        spawn_peer(network_recv, headers);

        let peer = crate::libp2p::test_peer_id(1);
        syncer
            .handle_event(SyncEvent::NewTarget {
                peer,
                head: head_key.clone(),
                weight: BigInt::from(1000),
                height: 4,
            })
            .await;
        drive_to_completion(&mut syncer).await;

        assert_eq!(syncer.status.read().stage, SyncStage::SyncedToGenesis);

        // the synced head moved from genesis to the announced head
        let mut last = None;
        while let Ok(change) = head_changes.try_recv() {
            last = Some(change);
        }
        assert_eq!(
            last,
            Some(HeadChange {
                removed: Some(*TipsetKey::new(vec![genesis.cid()]).hash()),
                added: Some(*head_key.hash()),
            })
        );

        // and the whole chain is walkable
        let mut epochs = Vec::new();
        syncer
            .chain_db()
            .walk_backward(head_key.hash(), 0, |ts| {
                epochs.push(ts.epoch());
                true
            })
            .await
            .unwrap();
        assert_eq!(epochs, vec![4, 3, 2, 1, 0]);
    }

    #[tokio::test]
    async fn bad_peer_response_fails_only_the_job() {
        let store = Arc::new(MemoryDB::default());
        let genesis = header(&store, 0, &TipsetKey::default(), 0);
        let (mut syncer, network_recv) = bootstrapped_syncer(store.clone(), &genesis).await;

        // peer with no blocks at all
        spawn_peer(network_recv, StdHashMap::new());

        let bogus_head = TipsetKey::new(vec![header(&store, 9, &TipsetKey::default(), 9).cid()]);
        syncer
            .handle_event(SyncEvent::NewTarget {
                peer: crate::libp2p::test_peer_id(2),
                head: bogus_head,
                weight: BigInt::from(1000),
                height: 9,
            })
            .await;
        drive_to_completion(&mut syncer).await;

        let status = syncer.status.read().clone();
        assert_eq!(status.stage, SyncStage::InternalError);
        assert!(matches!(status.error, Some(Error::Network(_))));

        // the chain db is untouched and usable
        assert_eq!(syncer.chain_db().current_heads().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn heaviest_target_wins() {
        let store = Arc::new(MemoryDB::default());
        let genesis = header(&store, 0, &TipsetKey::default(), 0);
        let (mut syncer, _network_recv) = bootstrapped_syncer(store.clone(), &genesis).await;

        let peer_a = crate::libp2p::test_peer_id(3);
        let peer_b = crate::libp2p::test_peer_id(4);
        syncer.pending_targets.insert(
            peer_a,
            SyncTarget {
                head: TipsetKey::default(),
                weight: BigInt::from(10),
                height: 5,
            },
        );
        syncer.pending_targets.insert(
            peer_b,
            SyncTarget {
                head: TipsetKey::default(),
                weight: BigInt::from(30),
                height: 6,
            },
        );

        syncer.current_weight = BigInt::from(20);
        let (chosen, target) = syncer.choose_next_target().unwrap();
        assert_eq!(chosen, peer_b);
        assert_eq!(target.weight, BigInt::from(30));

        // when the local chain outweighs everything, the set is forgotten
        syncer.current_weight = BigInt::from(50);
        assert!(syncer.choose_next_target().is_none());
        assert!(syncer.pending_targets.is_empty());
    }

    #[tokio::test]
    async fn light_targets_are_ignored() {
        let store = Arc::new(MemoryDB::default());
        let genesis = header(&store, 0, &TipsetKey::default(), 0);
        let (mut syncer, network_recv) = bootstrapped_syncer(store.clone(), &genesis).await;

        syncer
            .handle_event(SyncEvent::SetCurrentWeight {
                weight: BigInt::from(100),
                height: 10,
            })
            .await;
        syncer
            .handle_event(SyncEvent::NewTarget {
                peer: crate::libp2p::test_peer_id(2),
                head: TipsetKey::default(),
                weight: BigInt::from(50),
                height: 5,
            })
            .await;

        assert!(!syncer.is_active());
        assert!(syncer.pending_targets.is_empty());
        assert!(network_recv.is_empty());
        assert_eq!(syncer.status.read().stage, SyncStage::Idle);
    }

    #[tokio::test]
    async fn stale_completions_are_ignored() {
        let store = Arc::new(MemoryDB::default());
        let genesis = header(&store, 0, &TipsetKey::default(), 0);
        let (mut syncer, network_recv) = bootstrapped_syncer(store.clone(), &genesis).await;

        // request goes out and stays unanswered; drop the service end so the
        // response task reports a closed stream later
        let target = header(&store, 5, &TipsetKey::new(vec![Cid::default()]), 5);
        syncer
            .handle_event(SyncEvent::NewTarget {
                peer: crate::libp2p::test_peer_id(2),
                head: TipsetKey::new(vec![target.cid()]),
                weight: BigInt::from(1000),
                height: 5,
            })
            .await;
        assert!(syncer.is_active());

        // a completion for a hash nobody asked for
        let unrelated = TipsetKey::new(vec![Cid::default()]);
        syncer
            .handle_event(SyncEvent::TipsetResolved {
                hash: *unrelated.hash(),
                result: Err(Error::BadTipset("stale".to_string())),
            })
            .await;
        assert!(syncer.is_active());
        assert_eq!(syncer.status.read().stage, SyncStage::InProgress);
        drop(network_recv);
    }
}
