//! Network message handling for the peer manager.

use tracing::{debug, trace, warn};

use super::events::SpvEvent;
use super::state::{Action, ManagerState};
use crate::bloom::update_fp_rate;
use crate::chain::{ChainUpdate, IncomingBlock};
use crate::error::{SyncErrorCode, ValidationError};
use crate::network::{AddrEntry, Inventory, Misbehavior, NetworkMessage, Reject};
use crate::sync::SyncPhase;
use crate::types::{
    BlockHash, BlockHeader, MerkleBlock, PeerId, TX_UNCONFIRMED, Transaction, Txid,
};
use crate::validation::{MerkleVerifier, Validator};

const ONE_WEEK: u64 = 7 * 24 * 60 * 60;

/// Applies one peer message to the manager state.
pub(crate) struct MessageHandler<'a> {
    state: &'a mut ManagerState,
    verifier: &'a dyn MerkleVerifier,
    /// Local clock in unix seconds.
    now: u64,
}

impl<'a> MessageHandler<'a> {
    pub fn new(state: &'a mut ManagerState, verifier: &'a dyn MerkleVerifier, now: u64) -> Self {
        Self {
            state,
            verifier,
            now,
        }
    }

    /// Handle a message from `peer`. Transactions go through [`handle_transaction`] instead,
    /// since the wallet has to see them first.
    ///
    /// [`handle_transaction`]: MessageHandler::handle_transaction
    pub fn handle_network_message(
        &mut self,
        peer: PeerId,
        message: NetworkMessage,
    ) -> Vec<Action> {
        if !self.state.is_active_peer(peer) {
            trace!("Ignoring {} from inactive peer {}", message.cmd(), peer);
            return Vec::new();
        }
        trace!("Handling {} from peer {}", message.cmd(), peer);

        let mut actions = match message {
            NetworkMessage::Inv(items) => self.handle_inv(peer, items),
            NetworkMessage::GetData(items) => self.handle_getdata(peer, items),
            NetworkMessage::MerkleBlock(block) => self.handle_merkle_block(peer, block),
            NetworkMessage::Headers(headers) => self.handle_headers(peer, headers),
            NetworkMessage::Addr(entries) => self.handle_addr(peer, entries),
            NetworkMessage::Reject(reject) => self.handle_reject(peer, reject),
            NetworkMessage::Ping(nonce) => {
                self.state.send(peer, NetworkMessage::Pong(nonce)).into_iter().collect()
            }
            NetworkMessage::NotFound(items) => {
                self.handle_not_found(peer, items);
                Vec::new()
            }
            NetworkMessage::Tx(tx) => {
                warn!("Transaction {} reached the handler without wallet registration", tx.txid());
                Vec::new()
            }
            other => {
                debug!("Ignoring {} from peer {}", other.cmd(), peer);
                Vec::new()
            }
        };
        actions.extend(self.state.evaluate_publishes());
        actions.extend(self.state.flush_peers_when_synced());
        actions
    }

    /// Screen a relayed transaction before the wallet sees it. Returns the actions that
    /// refuse it, or `None` if it should go to the wallet.
    pub fn screen_transaction(&mut self, peer: PeerId, tx: &Transaction) -> Option<Vec<Action>> {
        if !self.state.is_active_peer(peer) {
            return Some(Vec::new());
        }
        if self.violates_filter(peer, tx) {
            warn!("Peer {} relayed transaction {} outside the filter", peer, tx.txid());
            return Some(self.misbehaving(peer, Misbehavior::FilterViolation));
        }
        None
    }

    /// A peer with the current filter only relays what the filter matches.
    fn violates_filter(&mut self, peer: PeerId, tx: &Transaction) -> bool {
        let current = self.state.bloom.generation();
        let filter_generation = self.state.peers.get(&peer).and_then(|p| p.filter_generation);
        current > 0
            && filter_generation == Some(current)
            && !self.state.publisher.is_pending(&tx.txid())
            && !self.state.bloom.matches_transaction(tx)
    }

    /// Handle a relayed transaction after the wallet saw it. `relevant` is the wallet's verdict.
    pub fn handle_transaction(
        &mut self,
        peer: PeerId,
        tx: Transaction,
        relevant: bool,
    ) -> Vec<Action> {
        // The filter may have changed while the wallet had the transaction.
        if let Some(refused) = self.screen_transaction(peer, &tx) {
            return refused;
        }
        let txid = tx.txid();

        self.state.publisher.record_relay(txid, peer);
        let mut actions = Vec::new();
        if relevant {
            let confirmed_in = self
                .state
                .chain
                .main_chain()
                .rev()
                .take(self.state.config.blocks_batch_size)
                .find(|entry| entry.matched_txids.contains(&txid))
                .map(|entry| (entry.height, entry.time()));
            if let Some((height, timestamp)) = confirmed_in {
                debug!("Transaction {} was matched in block {}", txid, height);
                actions.push(Action::UpdateWallet {
                    txids: vec![txid],
                    height,
                    timestamp,
                });
                actions.extend(super::state::resolution_actions(
                    self.state.publisher.confirm(&[txid]),
                ));
            }
            actions.push(Action::Emit(SpvEvent::TxStatusUpdate));
        } else if let Some(connected) = self.state.peers.get_mut(&peer) {
            connected.fp_count = connected.fp_count.saturating_add(1);
        }
        actions.extend(self.state.evaluate_publishes());
        actions
    }

    fn misbehaving(&mut self, peer: PeerId, misbehavior: Misbehavior) -> Vec<Action> {
        self.state.remove_peer(peer, Some(misbehavior), Some(SyncErrorCode::Protocol))
    }

    fn invalid_block(&mut self, peer: PeerId, error: &ValidationError) -> Vec<Action> {
        warn!("Peer {} sent an invalid block: {}", peer, error);
        self.misbehaving(peer, Misbehavior::from_validation(error))
    }

    fn handle_inv(&mut self, peer: PeerId, items: Vec<Inventory>) -> Vec<Action> {
        let mut tx_requests = Vec::new();
        let mut new_blocks: Vec<BlockHash> = Vec::new();
        let mut announced_blocks = 0usize;

        for item in items {
            match item {
                Inventory::Transaction(txid) => {
                    let seen = self.state.publisher.is_known(&txid);
                    self.state.publisher.record_relay(txid, peer);
                    if !seen && !self.state.publisher.is_pending(&txid) {
                        tx_requests.push(Inventory::Transaction(txid));
                    }
                }
                Inventory::Block(hash) | Inventory::FilteredBlock(hash) => {
                    announced_blocks += 1;
                    if !self.state.chain.contains(&hash) && !new_blocks.contains(&hash) {
                        new_blocks.push(hash);
                    }
                }
            }
        }

        let tip = self.state.chain.tip_height();
        let is_download_peer = self.state.sync.download_peer() == Some(peer);
        let phase = self.state.sync.phase();
        let generation = self.state.bloom.generation();
        let mut actions = Vec::new();

        if let Some(connected) = self.state.peers.get_mut(&peer) {
            if !new_blocks.is_empty() {
                let claimed = tip.saturating_add(new_blocks.len() as u32);
                if claimed > connected.best_height {
                    connected.best_height = claimed;
                    let address = connected.address;
                    self.state.pool.record_height(&address, claimed);
                }
            }
            let fetch_blocks = is_download_peer
                && matches!(phase, SyncPhase::Blocks | SyncPhase::Synced)
                && connected.filter_generation.is_some();
            if fetch_blocks && !new_blocks.is_empty() {
                for hash in &new_blocks {
                    connected.requested_blocks.insert(*hash, generation);
                }
                debug!("Requesting {} filtered blocks from peer {}", new_blocks.len(), peer);
                let request = new_blocks.iter().map(|h| Inventory::FilteredBlock(*h)).collect();
                actions.extend(self.state.send(peer, NetworkMessage::GetData(request)));
            }
        }

        if !tx_requests.is_empty() {
            actions.extend(self.state.send(peer, NetworkMessage::GetData(tx_requests)));
        }

        // The download peer answered `getblocks` with nothing new while we are still behind.
        let exhausted = is_download_peer
            && phase == SyncPhase::Blocks
            && announced_blocks > 0
            && new_blocks.is_empty()
            && self.state.peers.get(&peer).is_some_and(|p| p.requested_blocks.is_empty());
        if exhausted && tip < self.state.estimated_height() {
            actions.extend(self.promote_higher_peer(peer));
        }
        actions
    }

    /// Hand the download to a peer reporting more blocks than `exhausted` could deliver.
    fn promote_higher_peer(&mut self, exhausted: PeerId) -> Vec<Action> {
        let tip = self.state.chain.tip_height();
        let next = self
            .state
            .peers
            .values()
            .filter(|p| p.is_active() && p.id != exhausted && p.best_height > tip)
            .max_by(|a, b| a.best_height.cmp(&b.best_height).then(b.latency.cmp(&a.latency)))
            .map(|p| p.id);
        let Some(next) = next else {
            return Vec::new();
        };
        debug!("Peer {} has nothing more, downloading from {}", exhausted, next);
        self.state.set_download_peer(Some(next));
        self.state.request_next_batch().into_iter().collect()
    }

    fn handle_getdata(&mut self, peer: PeerId, items: Vec<Inventory>) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut not_found = Vec::new();
        for item in items {
            let Inventory::Transaction(txid) = item else {
                not_found.push(item);
                continue;
            };
            match self.state.publisher.pending_transaction(&txid).cloned() {
                Some(tx) => {
                    self.state.publisher.record_relay(txid, peer);
                    actions.extend(self.state.send(peer, NetworkMessage::Tx(tx)));
                }
                None => not_found.push(item),
            }
        }
        if !not_found.is_empty() {
            actions.extend(self.state.send(peer, NetworkMessage::NotFound(not_found)));
        }
        actions
    }

    fn handle_not_found(&mut self, peer: PeerId, items: Vec<Inventory>) {
        let Some(connected) = self.state.peers.get_mut(&peer) else {
            return;
        };
        for item in items {
            if let Inventory::FilteredBlock(hash) | Inventory::Block(hash) = item {
                connected.requested_blocks.remove(&hash);
            }
        }
    }

    fn handle_merkle_block(&mut self, peer: PeerId, block: MerkleBlock) -> Vec<Action> {
        let hash = block.block_hash();
        let current = self.state.bloom.generation();
        let Some(connected) = self.state.peers.get_mut(&peer) else {
            return Vec::new();
        };
        let requested_generation = connected.requested_blocks.remove(&hash);
        let filter_generation = connected.filter_generation;
        let is_download_peer = connected.is_download_peer;

        if let Err(e) = self.state.header_validator.check_header(&block.header, &hash, self.now) {
            return self.invalid_block(peer, &e);
        }

        // Blocks filtered with an older generation may miss matches; fetch them again.
        let stale = match requested_generation {
            Some(generation) => generation < current,
            None => filter_generation != Some(current),
        };
        if stale {
            debug!("Merkle block {} from peer {} used a stale filter", hash, peer);
            if !is_download_peer {
                return Vec::new();
            }
            if let Some(connected) = self.state.peers.get_mut(&peer) {
                connected.requested_blocks.insert(hash, current);
            }
            let request = NetworkMessage::GetData(vec![Inventory::FilteredBlock(hash)]);
            return self.state.send(peer, request).into_iter().collect();
        }

        let proof = self.verifier.verify(&block);
        if !proof.valid {
            warn!("Peer {} sent merkle block {} with an invalid proof", peer, hash);
            return self.misbehaving(peer, Misbehavior::InvalidMerkleProof);
        }

        if !is_download_peer {
            trace!("Ignoring merkle block {} from non-download peer {}", hash, peer);
            return Vec::new();
        }

        let overloaded = match self.state.peers.get_mut(&peer) {
            Some(connected) => {
                connected.fp_rate =
                    update_fp_rate(connected.fp_rate, block.total_transactions, connected.fp_count);
                connected.fp_count = 0;
                self.state.sync.is_synced() && self.state.bloom.is_overloaded(connected.fp_rate)
            }
            None => false,
        };

        let updates = match self
            .state
            .chain
            .accept_block(IncomingBlock::from_merkle_block(&block, proof.matched))
        {
            Ok(updates) => updates,
            Err(e) => return self.invalid_block(peer, &e),
        };
        let mut actions = self.apply_chain_updates(peer, updates);

        if overloaded {
            warn!("Peer {} exceeds the filter's false positive rate, reducing it", peer);
            self.state.bloom.force_reduced_rate();
            actions.extend(self.state.remove_peer(peer, None, None));
            actions.extend(self.state.queue_filter_rebuild());
        }

        actions.extend(self.after_blocks(peer));
        actions
    }

    fn handle_headers(&mut self, peer: PeerId, headers: Vec<BlockHeader>) -> Vec<Action> {
        if self.state.sync.download_peer() != Some(peer)
            || self.state.sync.phase() != SyncPhase::Headers
        {
            trace!("Ignoring unsolicited headers from peer {}", peer);
            return Vec::new();
        }
        let batch_size = self.state.config.headers_batch_size;
        if headers.len() > batch_size {
            warn!("Peer {} sent {} headers, more than {}", peer, headers.len(), batch_size);
            return self.misbehaving(peer, Misbehavior::InvalidMessage);
        }
        let received = headers.len();
        let full_batch = received == batch_size;

        // Headers within a week of the earliest key are fetched as merkle blocks instead.
        let earliest_key_time = self.state.earliest_key_time;
        let blocks: Vec<IncomingBlock> = headers
            .into_iter()
            .map(IncomingBlock::from_header)
            .take_while(|b| b.header.time as u64 + ONE_WEEK < earliest_key_time)
            .collect();
        let reached_key_time = blocks.len() < received;

        if let Err(e) = self.state.header_validator.validate(&blocks[..]) {
            return self.invalid_block(peer, &e);
        }

        let mut updates = Vec::new();
        for block in blocks {
            match self.state.chain.accept_block(block) {
                Ok(accepted) => updates.extend(accepted),
                Err(e) => {
                    let mut actions = self.apply_chain_updates(peer, updates);
                    actions.extend(self.invalid_block(peer, &e));
                    return actions;
                }
            }
        }
        let mut actions = self.apply_chain_updates(peer, updates);

        let tip_time = self.state.chain.tip().time();
        if reached_key_time || SyncPhase::for_tip(tip_time, earliest_key_time) == SyncPhase::Blocks
        {
            debug!(
                "Headers reached the earliest key time at height {}",
                self.state.chain.tip_height()
            );
            self.state.sync.set_phase(SyncPhase::Blocks);
            actions.extend(self.state.request_next_batch());
        } else if full_batch {
            actions.extend(self.state.request_next_batch());
        }
        actions.extend(self.state.check_sync_progress());
        actions
    }

    /// Translate chain updates into wallet updates, publish confirmations and events.
    fn apply_chain_updates(&mut self, peer: PeerId, updates: Vec<ChainUpdate>) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut changed = false;
        let mut orphan_requested = false;

        for update in updates {
            match update {
                ChainUpdate::Extended(entry) | ChainUpdate::Updated(entry) => {
                    changed = true;
                    let (height, time) = (entry.height, entry.time());
                    actions.extend(self.confirm_block(&entry.matched_txids, height, time));
                }
                ChainUpdate::Reorganized {
                    fork_height,
                    disconnected,
                    connected,
                } => {
                    changed = true;
                    warn!(
                        "Reorganized at height {}: {} blocks disconnected, {} connected",
                        fork_height,
                        disconnected.len(),
                        connected.len()
                    );
                    for entry in &disconnected {
                        if !entry.matched_txids.is_empty() {
                            actions.push(Action::UpdateWallet {
                                txids: entry.matched_txids.clone(),
                                height: TX_UNCONFIRMED,
                                timestamp: 0,
                            });
                        }
                    }
                    for entry in &connected {
                        actions.extend(self.confirm_block(
                            &entry.matched_txids,
                            entry.height,
                            entry.time(),
                        ));
                    }
                }
                ChainUpdate::Orphaned {
                    hash,
                    prev_hash,
                } => {
                    debug!("Block {} is an orphan, missing parent {}", hash, prev_hash);
                    if orphan_requested || self.state.sync.download_peer() != Some(peer) {
                        continue;
                    }
                    orphan_requested = true;
                    let phase = match self.state.sync.phase() {
                        SyncPhase::Headers => SyncPhase::Headers,
                        _ => SyncPhase::Blocks,
                    };
                    let stop_hash = match phase {
                        SyncPhase::Headers => BlockHash::all_zeros(),
                        _ => hash,
                    };
                    if let Some(request) = self.state.locator_request(phase, stop_hash) {
                        actions.extend(self.state.send(peer, request));
                    }
                }
                ChainUpdate::SideChain {
                    hash,
                    height,
                } => trace!("Block {} extends a side chain at height {}", hash, height),
                ChainUpdate::Duplicate {
                    hash,
                } => trace!("Duplicate block {}", hash),
            }
        }

        if changed {
            self.state.sync.touch();
            actions.push(Action::Emit(SpvEvent::TxStatusUpdate));
        }
        actions
    }

    fn confirm_block(
        &mut self,
        txids: &[Txid],
        height: u32,
        timestamp: u32,
    ) -> Vec<Action> {
        if txids.is_empty() {
            return Vec::new();
        }
        let mut actions = vec![Action::UpdateWallet {
            txids: txids.to_vec(),
            height,
            timestamp,
        }];
        actions.extend(super::state::resolution_actions(self.state.publisher.confirm(txids)));
        actions
    }

    /// Once the download peer delivered everything requested, ask for more or finish.
    fn after_blocks(&mut self, peer: PeerId) -> Vec<Action> {
        let mut actions = Vec::new();
        let drained = self
            .state
            .peers
            .get(&peer)
            .is_some_and(|p| p.is_download_peer && p.requested_blocks.is_empty());
        if drained
            && self.state.sync.phase() == SyncPhase::Blocks
            && self.state.chain.tip_height() < self.state.estimated_height()
        {
            actions.extend(self.state.request_next_batch());
        }
        actions.extend(self.state.check_sync_progress());
        actions
    }

    fn handle_addr(&mut self, peer: PeerId, entries: Vec<AddrEntry>) -> Vec<Action> {
        let max = self.state.config.max_addr_per_message;
        match self.state.pool.handle_addr(&entries, self.now, max) {
            Ok(changed) => {
                trace!("Peer {} sent {} addresses, {} new", peer, entries.len(), changed);
                Vec::new()
            }
            Err(misbehavior) => self.misbehaving(peer, misbehavior),
        }
    }

    fn handle_reject(&mut self, peer: PeerId, reject: Reject) -> Vec<Action> {
        match reject.txid {
            Some(txid) if reject.message == "tx" => {
                warn!(
                    "Peer {} rejected transaction {}: {} (code {:#x})",
                    peer, txid, reject.reason, reject.code
                );
                self.state.publisher.record_reject(&txid, peer, reject.indicates_spent_inputs());
            }
            _ => debug!("Peer {} rejected {}: {}", peer, reject.message, reject.reason),
        }
        Vec::new()
    }
}
