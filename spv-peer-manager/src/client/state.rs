//! Manager state guarded by the manager's lock, and the side effects its transitions produce.
//!
//! Every transition runs synchronously under the lock and returns a list of [`Action`]s.
//! The caller performs them after releasing the lock: sending to peers, calling into the
//! wallet, waking publish receipts and emitting events.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::ManagerConfig;
use super::events::{PeerInfo, SpvEvent};
use crate::bloom::BloomFilterManager;
use crate::chain::{BlockEntry, ChainStore};
use crate::error::{PublishError, SyncErrorCode};
use crate::mempool::publisher::{PublishResult, Resolved, TransactionPublisher};
use crate::network::pool::backoff;
use crate::network::{
    ConnectedPeer, GetBlocksMessage, Inventory, Misbehavior, NetworkMessage, PeerConnection,
    PeerHandshake, PeerPool,
};
use crate::sync::{DownloadCandidate, SyncPhase, SyncState, select_download_peer};
use crate::types::{BlockHash, PeerAddress, PeerId, Transaction, Txid, unix_time_now};
use crate::validation::HeaderValidator;

/// Below this many known addresses, new peers are asked for more.
const MIN_KNOWN_PEERS: usize = 1000;

/// A side effect to perform once the state lock is released.
pub(crate) enum Action {
    Send {
        peer: PeerId,
        connection: Arc<dyn PeerConnection>,
        message: NetworkMessage,
    },
    Disconnect {
        connection: Arc<dyn PeerConnection>,
    },
    Emit(SpvEvent),
    Resolve(Resolved),
    UpdateWallet {
        txids: Vec<Txid>,
        height: u32,
        timestamp: u32,
    },
    RemoveFromWallet(Txid),
    /// Fetch the wallet's elements and install a new filter generation.
    RebuildFilter,
    /// Queue the wallet's unconfirmed transactions for publishing.
    RepublishUnconfirmed,
    /// Start a connection round.
    Connect,
}

pub(crate) struct ManagerState {
    pub config: ManagerConfig,
    pub chain: ChainStore,
    pub pool: PeerPool,
    pub bloom: BloomFilterManager,
    pub publisher: TransactionPublisher,
    pub sync: SyncState,
    pub header_validator: HeaderValidator,
    pub peers: HashMap<PeerId, ConnectedPeer>,
    /// Addresses with a connection attempt in flight.
    pub connecting: HashSet<PeerAddress>,
    pub earliest_key_time: u64,
    /// Set by `connect`, cleared by `disconnect`. Reconnects only happen while set.
    pub connected_mode: bool,
    /// Failed attempts since a peer last connected.
    pub connect_failures: u32,
    pub reconnect_at: Option<Instant>,
    next_peer_id: u64,
    filter_rebuild_pending: bool,
    last_saved_height: u32,
}

impl ManagerState {
    pub fn new(
        config: ManagerConfig,
        chain: ChainStore,
        pool: PeerPool,
        earliest_key_time: u64,
    ) -> Self {
        let header_validator =
            HeaderValidator::new(&config.network_params, config.max_future_block_time);
        let last_saved_height = chain.tip_height();
        Self {
            bloom: BloomFilterManager::new(config.bloom_config()),
            publisher: TransactionPublisher::new(config.min_relay_peers, config.publish_timeout),
            sync: SyncState::new(),
            header_validator,
            peers: HashMap::new(),
            connecting: HashSet::new(),
            earliest_key_time,
            connected_mode: false,
            connect_failures: 0,
            reconnect_at: None,
            next_peer_id: 1,
            filter_rebuild_pending: false,
            last_saved_height,
            config,
            chain,
            pool,
        }
    }

    // Queries

    pub fn is_active_peer(&self, peer: PeerId) -> bool {
        self.peers.get(&peer).is_some_and(|p| p.is_active())
    }

    pub fn active_peer_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_active()).count()
    }

    pub fn connected_ids(&self) -> HashSet<PeerId> {
        self.peers.values().filter(|p| p.is_active()).map(|p| p.id).collect()
    }

    /// Best height reported by any connected peer, never below our own tip.
    pub fn estimated_height(&self) -> u32 {
        self.peers
            .values()
            .filter(|p| p.is_active())
            .map(|p| p.best_height)
            .max()
            .unwrap_or(0)
            .max(self.chain.tip_height())
    }

    pub fn sync_progress(&mut self) -> f64 {
        let last = self.chain.tip_height();
        let estimated = self.estimated_height();
        self.sync.progress(last, estimated)
    }

    pub fn relay_count(&self, txid: &Txid) -> usize {
        self.publisher.relay_count(txid, &self.connected_ids())
    }

    pub fn peer_info(&self) -> Vec<PeerInfo> {
        let mut info: Vec<PeerInfo> = self
            .peers
            .values()
            .filter(|p| p.is_active())
            .map(|p| PeerInfo {
                id: p.id,
                address: p.address,
                best_height: p.best_height,
                latency: p.latency,
                is_download_peer: p.is_download_peer,
                user_agent: p.user_agent.clone(),
            })
            .collect();
        info.sort_by_key(|p| p.id);
        info
    }

    fn candidates(&self) -> Vec<DownloadCandidate> {
        self.peers
            .values()
            .filter(|p| p.is_active())
            .map(|p| DownloadCandidate {
                peer: p.id,
                best_height: p.best_height,
                latency: p.latency,
            })
            .collect()
    }

    // Message helpers

    pub(crate) fn send(&self, peer: PeerId, message: NetworkMessage) -> Option<Action> {
        let connected = self.peers.get(&peer).filter(|p| p.is_active())?;
        Some(Action::Send {
            peer,
            connection: connected.connection.clone(),
            message,
        })
    }

    fn broadcast(&self, message: NetworkMessage) -> Vec<Action> {
        let mut ids: Vec<PeerId> = self.connected_ids().into_iter().collect();
        ids.sort();
        ids.into_iter().filter_map(|id| self.send(id, message.clone())).collect()
    }

    pub(crate) fn queue_filter_rebuild(&mut self) -> Option<Action> {
        if std::mem::replace(&mut self.filter_rebuild_pending, true) {
            None
        } else {
            Some(Action::RebuildFilter)
        }
    }

    pub(crate) fn locator_request(
        &self,
        phase: SyncPhase,
        stop_hash: BlockHash,
    ) -> Option<NetworkMessage> {
        let request = GetBlocksMessage {
            locator_hashes: self.chain.block_locator(),
            stop_hash,
        };
        match phase {
            SyncPhase::Headers => Some(NetworkMessage::GetHeaders(request)),
            SyncPhase::Blocks | SyncPhase::Synced => Some(NetworkMessage::GetBlocks(request)),
            SyncPhase::Idle => None,
        }
    }

    /// Ask the download peer for the next batch of the current phase.
    pub(crate) fn request_next_batch(&self) -> Option<Action> {
        let peer = self.sync.download_peer()?;
        let message = self.locator_request(self.sync.phase(), BlockHash::all_zeros())?;
        self.send(peer, message)
    }

    // Peer lifecycle

    /// Register a peer whose handshake completed.
    pub fn add_peer(
        &mut self,
        connection: Arc<dyn PeerConnection>,
        handshake: &PeerHandshake,
        token: CancellationToken,
    ) -> (PeerId, Vec<Action>) {
        let id = PeerId(self.next_peer_id);
        self.next_peer_id += 1;

        let mut peer = ConnectedPeer::new(
            id,
            connection,
            handshake,
            token,
            self.bloom.false_positive_rate(),
        );
        self.pool.record_connected(peer.address, handshake, unix_time_now());
        self.connect_failures = 0;
        info!(
            "Connected to peer {} ({}) at height {}, {}",
            id, peer.address, handshake.best_height, handshake.user_agent
        );

        let mut actions = Vec::new();
        let filter_load = match self.bloom.filter() {
            Some(filter) if !self.filter_rebuild_pending => {
                peer.filter_generation = Some(self.bloom.generation());
                Some(filter.to_filter_load())
            }
            _ => None,
        };
        let first_peer = self.peers.is_empty();
        self.peers.insert(id, peer);

        match filter_load {
            Some(load) => actions.extend(self.send(id, NetworkMessage::FilterLoad(load))),
            None => actions.extend(self.queue_filter_rebuild()),
        }
        if self.pool.len() < MIN_KNOWN_PEERS {
            actions.extend(self.send(id, NetworkMessage::GetAddr));
        }
        let pending = self.publisher.pending_txids();
        if !pending.is_empty() {
            let inv = pending.into_iter().map(Inventory::Transaction).collect();
            actions.extend(self.send(id, NetworkMessage::Inv(inv)));
        }
        if first_peer {
            actions.push(Action::RepublishUnconfirmed);
        }

        // A peer claiming a longer chain than the download peer takes over.
        if self.sync.is_session_active() && handshake.best_height > self.chain.tip_height() {
            let current_best = self
                .sync
                .download_peer()
                .and_then(|dl| self.peers.get(&dl))
                .map_or(0, |dl| dl.best_height);
            if handshake.best_height > current_best {
                info!(
                    "Peer {} reports height {}, switching download peer",
                    id, handshake.best_height
                );
                self.set_download_peer(Some(id));
                actions.extend(self.request_next_batch());
            }
        }
        (id, actions)
    }

    pub(crate) fn set_download_peer(&mut self, peer: Option<PeerId>) {
        for connected in self.peers.values_mut() {
            if connected.is_download_peer && Some(connected.id) != peer {
                connected.is_download_peer = false;
                connected.requested_blocks.clear();
            }
        }
        if let Some(connected) = peer.and_then(|id| self.peers.get_mut(&id)) {
            connected.is_download_peer = true;
        }
        self.sync.set_download_peer(peer);
        self.sync.touch();
    }

    /// Drop a peer, penalizing it for `misbehavior` if given.
    ///
    /// A dropped download peer is replaced by the best remaining peer, which receives a fresh
    /// filter before the download resumes. Without a replacement, a misbehavior drop fails
    /// the session with `failure`.
    pub fn remove_peer(
        &mut self,
        id: PeerId,
        misbehavior: Option<Misbehavior>,
        failure: Option<SyncErrorCode>,
    ) -> Vec<Action> {
        let Some(peer) = self.peers.remove(&id) else {
            return Vec::new();
        };
        peer.token.cancel();
        let mut actions = vec![Action::Disconnect {
            connection: peer.connection.clone(),
        }];

        match misbehavior {
            Some(misbehavior) => {
                let penalty = self.pool.penalize(&peer.address, misbehavior);
                warn!(
                    "Disconnecting peer {} ({}) for {:?}, score {}{}",
                    id,
                    peer.address,
                    misbehavior,
                    penalty.score,
                    if penalty.banned { ", banned" } else { "" }
                );
            }
            None => debug!("Peer {} ({}) disconnected", id, peer.address),
        }
        self.publisher.remove_peer(id);
        if misbehavior.is_some() {
            actions.extend(self.flush_peers());
        }

        if peer.is_download_peer {
            self.sync.set_download_peer(None);
            actions.extend(self.replace_download_peer(Some(id), failure));
        }
        self.schedule_reconnect();
        actions.extend(self.evaluate_publishes());
        actions
    }

    fn replace_download_peer(
        &mut self,
        previous: Option<PeerId>,
        failure: Option<SyncErrorCode>,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        match select_download_peer(&self.candidates(), previous) {
            Some(next) => {
                info!("Peer {} is the new download peer", next);
                self.set_download_peer(Some(next));
                if self.sync.is_session_active() {
                    actions.extend(self.queue_filter_rebuild());
                    actions.extend(self.request_next_batch());
                }
            }
            None => {
                if let Some(error) = failure {
                    if self.sync.finish_session(false) {
                        warn!("Sync failed without a replacement download peer: {:?}", error);
                        actions.push(Action::Emit(SpvEvent::SyncFailed {
                            error,
                        }));
                    }
                }
            }
        }
        actions
    }

    pub(crate) fn schedule_reconnect(&mut self) {
        if !self.connected_mode
            || self.reconnect_at.is_some()
            || self.peers.len() + self.connecting.len() >= self.config.max_connections
        {
            return;
        }
        let delay = backoff(
            self.config.reconnect_delay,
            self.connect_failures,
            self.config.max_reconnect_delay,
        );
        debug!("Reconnecting in {:?}", delay);
        self.reconnect_at = Some(Instant::now() + delay);
    }

    /// Decide what follows a connection round.
    pub fn after_connect_round(&mut self, had_candidates: bool) -> Vec<Action> {
        if !self.connected_mode {
            return Vec::new();
        }
        if self.peers.is_empty() {
            if !had_candidates || self.connect_failures >= self.config.max_connect_failures {
                warn!(
                    "Unable to connect to any peer after {} attempts",
                    self.connect_failures
                );
                self.connected_mode = false;
                self.connect_failures = 0;
                self.reconnect_at = None;
                self.sync.finish_session(false);
                return vec![Action::Emit(SpvEvent::SyncFailed {
                    error: SyncErrorCode::NotConnected,
                })];
            }
            self.schedule_reconnect();
            return Vec::new();
        }
        if self.peers.len() < self.config.max_connections {
            self.schedule_reconnect();
        }
        let mut actions = self.ensure_syncing();
        actions.extend(self.flush_peers_when_synced());
        actions
    }

    /// Start a session unless one is running or the tip already matches the best known height.
    pub fn ensure_syncing(&mut self) -> Vec<Action> {
        if self.sync.is_session_active() {
            return Vec::new();
        }
        if self.sync.is_synced() && self.chain.tip_height() >= self.estimated_height() {
            return Vec::new();
        }
        self.start_sync()
    }

    /// Begin a sync session with the best available download peer.
    pub fn start_sync(&mut self) -> Vec<Action> {
        let current = self.sync.download_peer().filter(|id| self.is_active_peer(*id));
        if current.is_none() {
            let selected = select_download_peer(&self.candidates(), None);
            self.set_download_peer(selected);
        }
        if self.sync.download_peer().is_none() {
            return Vec::new();
        }

        let tip = self.chain.tip_height();
        let estimated = self.estimated_height();
        if tip >= estimated {
            self.sync.begin_session(tip, SyncPhase::Blocks);
            return self.complete_sync();
        }

        let phase = SyncPhase::for_tip(self.chain.tip().time(), self.earliest_key_time);
        info!("Starting {:?} sync from height {} towards {}", phase, tip, estimated);
        self.sync.begin_session(tip, phase);
        let mut actions = vec![Action::Emit(SpvEvent::SyncStarted)];
        actions.extend(self.request_next_batch());
        actions
    }

    fn complete_sync(&mut self) -> Vec<Action> {
        if !self.sync.finish_session(true) {
            return Vec::new();
        }
        info!("Sync complete at height {}", self.chain.tip_height());
        let mut actions = vec![Action::Emit(SpvEvent::SyncSucceeded)];
        if self.bloom.false_positive_rate() > self.config.bloom_reduced_fp_rate {
            // The new generation is built at the reduced rate and followed by `mempool`.
            actions.extend(self.queue_filter_rebuild());
        } else {
            actions.extend(self.broadcast(NetworkMessage::MemPool));
        }
        actions.extend(self.flush_saves());
        actions
    }

    /// After a batch of blocks: finish the session at the best height, or save periodically.
    /// Once synced, every chain change is saved right away.
    pub(crate) fn check_sync_progress(&mut self) -> Vec<Action> {
        if self.sync.is_synced() {
            return self.flush_blocks();
        }
        if !self.sync.is_session_active() {
            return Vec::new();
        }
        let tip = self.chain.tip_height();
        if tip >= self.estimated_height() {
            return self.complete_sync();
        }
        if tip >= self.last_saved_height + self.config.block_save_interval {
            return self.flush_blocks();
        }
        Vec::new()
    }

    fn flush_blocks(&mut self) -> Vec<Action> {
        self.last_saved_height = self.chain.tip_height();
        match self.chain.take_save() {
            Some(save) => vec![Action::Emit(SpvEvent::SaveBlocks {
                blocks: save.blocks,
                replace: save.replace,
            })],
            None => Vec::new(),
        }
    }

    /// Emit everything unsaved in the chain and the peer pool.
    pub fn flush_saves(&mut self) -> Vec<Action> {
        let mut actions = self.flush_blocks();
        actions.extend(self.flush_peers());
        actions
    }

    fn flush_peers(&mut self) -> Option<Action> {
        self.pool.take_save().map(|save| {
            Action::Emit(SpvEvent::SavePeers {
                peers: save.peers,
                replace: save.replace,
            })
        })
    }

    /// Save pool changes as they happen once synced. While syncing they wait for the end of
    /// the session.
    pub(crate) fn flush_peers_when_synced(&mut self) -> Option<Action> {
        if !self.sync.is_synced() {
            return None;
        }
        self.flush_peers()
    }

    /// Build a filter generation from `elements` and load it into every connected peer.
    pub fn install_filter(&mut self, elements: Vec<Vec<u8>>) -> Vec<Action> {
        self.filter_rebuild_pending = false;
        let load = match self.bloom.rebuild(elements, self.sync.is_synced()) {
            Ok(load) => load,
            Err(e) => {
                warn!("Failed to build bloom filter: {}", e);
                return Vec::new();
            }
        };
        let generation = self.bloom.generation();
        let rate = self.bloom.false_positive_rate();
        for peer in self.peers.values_mut().filter(|p| p.is_active()) {
            peer.filter_generation = Some(generation);
            peer.fp_rate = rate;
            peer.fp_count = 0;
        }
        let mut actions = self.broadcast(NetworkMessage::FilterLoad(load));
        if self.sync.is_synced() {
            actions.extend(self.broadcast(NetworkMessage::MemPool));
        }
        actions
    }

    /// Rebuild only if the wallet grew past the current filter.
    pub fn wallet_updated(&mut self, elements: Vec<Vec<u8>>) -> Vec<Action> {
        if self.peers.is_empty() || !self.bloom.needs_update(elements.len()) {
            return Vec::new();
        }
        self.install_filter(elements)
    }

    // Publishing

    pub fn publish(
        &mut self,
        tx: Transaction,
        completion: oneshot::Sender<PublishResult>,
    ) -> Vec<Action> {
        let txid = tx.txid();
        if self.active_peer_count() == 0 {
            let _ = completion.send(Err(PublishError::NotConnected));
            return Vec::new();
        }
        let mut actions = Vec::new();
        if let Some(superseded) = self.publisher.publish(tx, Some(completion), Instant::now()) {
            actions.push(Action::Resolve(superseded));
        }
        actions.extend(self.broadcast(NetworkMessage::Inv(vec![Inventory::Transaction(txid)])));
        actions
    }

    /// Queue wallet transactions that are not in a block yet and announce them.
    pub fn republish(&mut self, transactions: Vec<Transaction>) -> Vec<Action> {
        let now = Instant::now();
        let mut announced = Vec::new();
        for tx in transactions {
            let txid = tx.txid();
            if !tx.is_signed() || self.publisher.is_pending(&txid) {
                continue;
            }
            self.publisher.publish(tx, None, now);
            announced.push(Inventory::Transaction(txid));
        }
        if announced.is_empty() {
            return Vec::new();
        }
        debug!("Announcing {} unconfirmed wallet transactions", announced.len());
        self.broadcast(NetworkMessage::Inv(announced))
    }

    pub(crate) fn evaluate_publishes(&mut self) -> Vec<Action> {
        let resolved = self.publisher.evaluate(&self.connected_ids(), Instant::now());
        resolution_actions(resolved)
    }

    // Lifecycle

    /// Close every session and cancel outstanding work.
    pub fn disconnect_all(&mut self) -> Vec<Action> {
        self.connected_mode = false;
        self.reconnect_at = None;
        self.connect_failures = 0;

        let mut ids: Vec<PeerId> = self.peers.keys().copied().collect();
        ids.sort();
        let mut actions = Vec::new();
        for id in ids {
            if let Some(peer) = self.peers.remove(&id) {
                peer.token.cancel();
                actions.push(Action::Disconnect {
                    connection: peer.connection,
                });
            }
        }
        actions.extend(resolution_actions(self.publisher.cancel_all()));

        if self.sync.is_session_active() {
            actions.push(Action::Emit(SpvEvent::SyncFailed {
                error: SyncErrorCode::Cancelled,
            }));
        }
        self.sync.reset();
        actions.extend(self.flush_saves());
        info!("Disconnected from all peers");
        actions
    }

    /// Rewind to the last block before the earliest key time and download again from
    /// a different peer.
    pub fn rescan(&mut self) -> Vec<Action> {
        let height = self.chain.rescan_height(self.earliest_key_time);
        let removed = self.chain.rewind_to(height);
        info!("Rescanning from height {} ({} blocks removed)", height, removed.len());

        let previous = self.sync.download_peer();
        self.sync.reset();
        self.last_saved_height = self.chain.tip_height();
        if self.active_peer_count() == 0 {
            return Vec::new();
        }
        let next = select_download_peer(&self.candidates(), previous);
        self.set_download_peer(next);

        let mut actions: Vec<Action> = self.queue_filter_rebuild().into_iter().collect();
        actions.extend(self.start_sync());
        actions
    }

    /// The periodic maintenance tick.
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();

        if self.sync.is_session_active() && self.sync.is_stalled(self.config.sync_timeout) {
            match self.sync.download_peer() {
                Some(stalled) => {
                    warn!("Download peer {} stalled, replacing it", stalled);
                    actions.extend(self.remove_peer(
                        stalled,
                        Some(Misbehavior::Timeout),
                        Some(SyncErrorCode::TimedOut),
                    ));
                }
                None => {
                    self.sync.finish_session(false);
                    actions.push(Action::Emit(SpvEvent::SyncFailed {
                        error: SyncErrorCode::TimedOut,
                    }));
                }
            }
        }

        actions.extend(self.evaluate_publishes());

        let expired = self.chain.expire_orphans();
        if !expired.is_empty() {
            debug!("Expired {} orphan blocks", expired.len());
        }

        if self.sync.is_synced() {
            let tip = self.chain.tip_height();
            let threshold = self.config.lagging_peer_threshold;
            let mut lagging: Vec<PeerId> = self
                .peers
                .values()
                .filter(|p| p.is_active() && p.best_height.saturating_add(threshold) < tip)
                .map(|p| p.id)
                .collect();
            lagging.sort();
            for id in lagging {
                info!("Dropping peer {} lagging behind height {}", id, tip);
                actions.extend(self.remove_peer(id, None, None));
            }
        }

        if self.reconnect_at.is_some_and(|at| now >= at) {
            self.reconnect_at = None;
            if self.connected_mode
                && self.peers.len() + self.connecting.len() < self.config.max_connections
            {
                actions.push(Action::Connect);
            }
        }
        actions
    }

    pub fn tip(&self) -> BlockEntry {
        self.chain.tip().clone()
    }
}

/// Actions completing settled publishes. Refused transactions leave the wallet.
pub(crate) fn resolution_actions(resolved: Vec<Resolved>) -> Vec<Action> {
    let mut actions = Vec::new();
    for resolution in resolved {
        if let Err(PublishError::Rejected {
            rescan_recommended,
        }) = resolution.result
        {
            actions.push(Action::RemoveFromWallet(resolution.txid));
            actions.push(Action::Emit(SpvEvent::TxRejected {
                txid: resolution.txid,
                rescan_recommended,
            }));
        }
        actions.push(Action::Resolve(resolution));
    }
    actions
}
