//! Connection lifecycle.
//!
//! This module contains:
//! - Connection rounds (`connect`) and reconnects
//! - Per-peer reader tasks
//! - The maintenance tick (`check_timeouts`)
//! - Shutdown (`disconnect`) and `rescan`

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::SpvEvent;
use super::state::Action;
use super::{PeerManager, Shared};
use crate::error::{NetworkError, SyncErrorCode};
use crate::network::pool::backoff;
use crate::network::{PeerConnection, PeerHandshake};
use crate::types::{PeerAddress, PeerId, ServiceFlags};
use crate::wallet::WalletInterface;

impl<W: WalletInterface + 'static> PeerManager<W> {
    /// Connect to peers and start syncing.
    ///
    /// Returns once the connection round finished. Reader tasks and the maintenance tick keep
    /// running in the background until [`disconnect`](Self::disconnect) or drop.
    pub async fn connect(&self) {
        self.shared.connect().await;
    }

    /// Close every connection. Pending publishes are cancelled, an active sync session is
    /// reported failed with `Cancelled`, and unsaved blocks and peers are flushed.
    pub async fn disconnect(&self) {
        let actions = self.shared.lock().disconnect_all();
        self.shared.run_actions(actions).await;
    }

    /// Rewind the chain to before the earliest key time and sync again from a different
    /// download peer with a fresh bloom filter.
    pub async fn rescan(&self) {
        let actions = self.shared.lock().rescan();
        self.shared.run_actions(actions).await;
    }

    /// Run the maintenance checks now: stalled sync, publish deadlines, orphan expiry,
    /// lagging peers and scheduled reconnects. The background tick calls this periodically.
    pub async fn check_timeouts(&self) {
        self.shared.check_timeouts().await;
    }
}

impl<W: WalletInterface + 'static> Shared<W> {
    pub(crate) fn connect_owned(self: Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move { self.connect().await })
    }

    pub(crate) async fn connect(self: &Arc<Self>) {
        if !self.is_reachable() {
            warn!("Network unreachable, not connecting");
            self.emit(SpvEvent::SyncFailed {
                error: SyncErrorCode::NetworkUnreachable,
            });
            return;
        }
        self.ensure_maintenance();

        let mut candidates = self.select_candidates();
        if candidates.as_ref().is_some_and(|c| c.is_empty()) {
            let discovered = self.connector.discover_peers().await;
            debug!("Discovered {} peers", discovered.len());
            {
                let mut state = self.lock();
                for record in discovered {
                    state.pool.add_or_update(record);
                }
            }
            candidates = self.select_candidates();
        }
        let Some(candidates) = candidates else {
            return;
        };
        let had_candidates = !candidates.is_empty();

        let mut attempts = JoinSet::new();
        for (address, timeout) in candidates {
            let connector = self.connector.clone();
            attempts.spawn(async move {
                let attempt = connector.connect(address.socket_addr());
                let result = tokio::time::timeout(timeout, attempt)
                    .await
                    .unwrap_or(Err(NetworkError::Timeout));
                (address, result)
            });
        }

        while let Some(joined) = attempts.join_next().await {
            let (address, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Connection attempt task failed: {}", e);
                    continue;
                }
            };
            match result {
                Ok((connection, handshake)) => {
                    self.on_connected(address, connection, handshake).await
                }
                Err(e) => self.on_connect_failed(address, &e),
            }
        }

        let actions = self.lock().after_connect_round(had_candidates);
        self.run_actions(actions).await;
    }

    /// Pick addresses to dial and their timeouts, marking them in flight.
    /// `None` when no connection slot is free.
    fn select_candidates(&self) -> Option<Vec<(PeerAddress, std::time::Duration)>> {
        let mut state = self.lock();
        state.connected_mode = true;
        state.reconnect_at = None;

        let open = state.peers.len() + state.connecting.len();
        let free = state.config.max_connections.checked_sub(open).filter(|n| *n > 0)?;
        let exclude: HashSet<PeerAddress> = state
            .peers
            .values()
            .map(|p| p.address)
            .chain(state.connecting.iter().copied())
            .collect();
        let picks = state.pool.select_candidates(free, &exclude, &mut rand::thread_rng());

        let mut candidates = Vec::with_capacity(picks.len());
        for address in picks {
            let failures = state.pool.get(&address).map_or(0, |r| r.connect_failures);
            let timeout = backoff(
                state.config.connect_timeout,
                failures,
                state.config.max_connect_timeout,
            );
            state.connecting.insert(address);
            candidates.push((address, timeout));
        }
        Some(candidates)
    }

    async fn on_connected(
        self: &Arc<Self>,
        address: PeerAddress,
        connection: Arc<dyn PeerConnection>,
        handshake: PeerHandshake,
    ) {
        if !handshake.services.contains(ServiceFlags::required()) {
            info!("Peer {} lacks required services {:?}", address, handshake.services);
            connection.disconnect().await;
            let error = NetworkError::ProtocolError("missing required services".to_string());
            self.on_connect_failed(address, &error);
            return;
        }

        let token = self.shutdown.child_token();
        let added = {
            let mut state = self.lock();
            state.connecting.remove(&address);
            if state.connected_mode {
                Some(state.add_peer(connection.clone(), &handshake, token.clone()))
            } else {
                None
            }
        };
        let Some((id, actions)) = added else {
            debug!("Disconnected while connecting to {}", address);
            connection.disconnect().await;
            return;
        };

        self.spawn_reader(id, connection, token);
        self.run_actions(actions).await;
    }

    fn on_connect_failed(&self, address: PeerAddress, error: &NetworkError) {
        let mut state = self.lock();
        state.connecting.remove(&address);
        state.connect_failures += 1;
        let failures = state.pool.record_connect_failure(&address);
        debug!("Connection to {} failed ({} in a row): {}", address, failures, error);
    }

    /// Forward every message from `connection` until it closes or `token` is cancelled.
    fn spawn_reader(
        self: &Arc<Self>,
        peer: PeerId,
        connection: Arc<dyn PeerConnection>,
        token: CancellationToken,
    ) {
        let shared = self.clone();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = token.cancelled() => return,
                    received = connection.receive_message() => received,
                };
                match received {
                    Ok(Some(message)) => shared.handle_message(peer, message).await,
                    Ok(None) => {
                        debug!("Peer {} closed the connection", peer);
                        break;
                    }
                    Err(e) => {
                        debug!("Error reading from peer {}: {}", peer, e);
                        break;
                    }
                }
            }
            let actions = shared.lock().remove_peer(peer, None, None);
            shared.run_actions(actions).await;
        });
    }

    fn ensure_maintenance(self: &Arc<Self>) {
        if self.maintenance_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = self.clone();
        let period = self.lock().config.maintenance_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = interval.tick() => shared.check_timeouts().await,
                }
            }
            debug!("Maintenance task stopped");
        });
    }

    pub(crate) async fn check_timeouts(self: &Arc<Self>) {
        let actions: Vec<Action> = self.lock().check_timeouts(Instant::now());
        self.run_actions(actions).await;
    }
}
