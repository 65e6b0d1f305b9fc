//! High-level peer manager API.
//!
//! This module contains:
//! - `PeerManager`, the handle the application owns
//! - The shared core driven by peer reader tasks and the maintenance tick
//! - Execution of the actions state transitions produce

pub mod config;
pub mod events;

mod lifecycle;
mod message_handler;
mod queries;
mod state;
mod transactions;

#[cfg(test)]
mod config_test;

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::chain::{BlockEntry, ChainStore};
use crate::error::{Result, SpvError, SyncError};
use crate::network::{NetworkMessage, PeerConnector, PeerPool, PeerRecord};
use crate::types::{PeerId, unix_time_now};
use crate::validation::MerkleVerifier;
use crate::wallet::WalletInterface;

pub use config::ManagerConfig;
pub use events::{NetworkReachability, PeerInfo, PublishReceipt, SpvEvent};

use message_handler::MessageHandler;
use state::{Action, ManagerState};

/// Where events go and how connectivity is checked.
struct Callbacks {
    events: mpsc::UnboundedSender<SpvEvent>,
    reachability: Arc<dyn NetworkReachability>,
}

/// SPV peer manager: keeps a set of peer connections, syncs the chain of merkle blocks
/// matching the wallet's bloom filter, and publishes wallet transactions.
pub struct PeerManager<W: WalletInterface + 'static> {
    shared: Arc<Shared<W>>,
}

/// State shared between the handle, peer reader tasks and the maintenance task.
pub(crate) struct Shared<W: WalletInterface + 'static> {
    state: Mutex<ManagerState>,
    wallet: Arc<RwLock<W>>,
    connector: Arc<dyn PeerConnector>,
    verifier: Arc<dyn MerkleVerifier>,
    callbacks: OnceLock<Callbacks>,
    maintenance_started: AtomicBool,
    shutdown: CancellationToken,
}

impl<W: WalletInterface + 'static> PeerManager<W> {
    /// Create a manager from persisted blocks and peers.
    ///
    /// `blocks` is the saved main chain in ascending order; empty starts from genesis.
    /// `earliest_key_time` is the creation time of the wallet's oldest key in unix seconds.
    /// Headers older than it by more than a week are synced without merkle blocks.
    pub fn new(
        config: ManagerConfig,
        wallet: Arc<RwLock<W>>,
        connector: Arc<dyn PeerConnector>,
        verifier: Arc<dyn MerkleVerifier>,
        earliest_key_time: u64,
        blocks: Vec<BlockEntry>,
        peers: Vec<PeerRecord>,
    ) -> Result<Self> {
        config.validate().map_err(SpvError::Config)?;

        let chain = ChainStore::new(config.network_params.clone(), blocks, config.chain_limits())?;
        let mut pool =
            PeerPool::new(config.max_known_peers, config.ban_score, config.misbehavior.clone());
        pool.seed(peers);
        debug!(
            "Peer manager loaded {} blocks (tip {}) and {} peers",
            chain.len(),
            chain.tip_height(),
            pool.len()
        );

        let state = ManagerState::new(config, chain, pool, earliest_key_time);
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                wallet,
                connector,
                verifier,
                callbacks: OnceLock::new(),
                maintenance_started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Register the event sink and the reachability check. Allowed once, before connecting.
    pub fn set_callbacks(
        &self,
        events: mpsc::UnboundedSender<SpvEvent>,
        reachability: Arc<dyn NetworkReachability>,
    ) -> Result<()> {
        {
            let state = self.shared.lock();
            if state.connected_mode || !state.peers.is_empty() {
                return Err(SyncError::InvalidState(
                    "callbacks must be set before connecting".to_string(),
                )
                .into());
            }
        }
        self.shared
            .callbacks
            .set(Callbacks {
                events,
                reachability,
            })
            .map_err(|_| {
                SpvError::Sync(SyncError::InvalidState("callbacks already set".to_string()))
            })
    }

    /// Feed a message received from `peer`.
    ///
    /// Reader tasks spawned by [`connect`](Self::connect) call this for every message;
    /// it is public so an embedding transport can drive the manager directly.
    pub async fn handle_peer_message(&self, peer: PeerId, message: NetworkMessage) {
        self.shared.handle_message(peer, message).await;
    }
}

impl<W: WalletInterface + 'static> Drop for PeerManager<W> {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl<W: WalletInterface + 'static> Shared<W> {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: SpvEvent) {
        match self.callbacks.get() {
            Some(callbacks) => {
                // The receiver may be gone during shutdown.
                let _ = callbacks.events.send(event);
            }
            None => trace!("No event sink registered, dropping {:?}", event),
        }
    }

    fn is_reachable(&self) -> bool {
        self.callbacks.get().is_none_or(|c| c.reachability.network_is_reachable())
    }

    pub(crate) async fn handle_message(self: &Arc<Self>, peer: PeerId, message: NetworkMessage) {
        if let NetworkMessage::Tx(tx) = message {
            let refused = {
                let mut state = self.lock();
                let mut handler =
                    MessageHandler::new(&mut state, self.verifier.as_ref(), unix_time_now());
                handler.screen_transaction(peer, &tx)
            };
            if let Some(actions) = refused {
                self.run_actions(actions).await;
                return;
            }
            let relevant = self.wallet.write().await.register_transaction(&tx).await;
            let actions = {
                let mut state = self.lock();
                let mut handler =
                    MessageHandler::new(&mut state, self.verifier.as_ref(), unix_time_now());
                handler.handle_transaction(peer, tx, relevant)
            };
            self.run_actions(actions).await;
            return;
        }

        let actions = {
            let mut state = self.lock();
            let mut handler =
                MessageHandler::new(&mut state, self.verifier.as_ref(), unix_time_now());
            handler.handle_network_message(peer, message)
        };
        self.run_actions(actions).await;
    }

    /// Perform side effects in order. Follow-up actions from filter rebuilds run before
    /// anything queued after them.
    async fn run_actions(self: &Arc<Self>, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Send {
                    peer,
                    connection,
                    message,
                } => {
                    let command = message.cmd();
                    if let Err(e) = connection.send_message(message).await {
                        debug!("Failed to send {} to peer {}: {}", command, peer, e);
                        let follow = self.lock().remove_peer(peer, None, None);
                        queue.extend(follow);
                    }
                }
                Action::Disconnect {
                    connection,
                } => connection.disconnect().await,
                Action::Emit(event) => self.emit(event),
                Action::Resolve(resolved) => resolved.complete(),
                Action::UpdateWallet {
                    txids,
                    height,
                    timestamp,
                } => {
                    self.wallet.write().await.update_transactions(&txids, height, timestamp).await;
                }
                Action::RemoveFromWallet(txid) => {
                    self.wallet.write().await.remove_transaction(&txid).await;
                }
                Action::RebuildFilter => {
                    let elements = self.wallet.read().await.bloom_filter_elements().await;
                    let follow = self.lock().install_filter(elements);
                    for action in follow.into_iter().rev() {
                        queue.push_front(action);
                    }
                }
                Action::RepublishUnconfirmed => {
                    let transactions = self.wallet.read().await.unconfirmed_transactions().await;
                    let follow = self.lock().republish(transactions);
                    for action in follow.into_iter().rev() {
                        queue.push_front(action);
                    }
                }
                Action::Connect => {
                    if self.is_reachable() {
                        tokio::spawn(self.clone().connect_owned());
                    } else {
                        debug!("Network unreachable, postponing reconnect");
                        self.lock().schedule_reconnect();
                    }
                }
            }
        }
    }
}
