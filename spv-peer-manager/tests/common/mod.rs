//! Manager harness over mock peers for integration testing.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use spv_peer_manager::network::{Inventory, NetworkMessage, PeerRecord};
use spv_peer_manager::test_utils::{
    MockConnection, MockConnector, MockMerkleVerifier, MockWallet, drain_events, merkle_block,
    p2pkh_element, test_peer_record, test_socket_address,
};
use spv_peer_manager::types::{BlockHeader, PeerId};
use spv_peer_manager::{ManagerConfig, PeerManager, SpvEvent};
use tokio::sync::{RwLock, mpsc};

/// Regtest policy with a quiet maintenance tick and a sparse bloom filter.
pub fn test_config() -> ManagerConfig {
    let mut config = ManagerConfig::regtest().with_bloom_rates(0.000_001, 0.000_000_5);
    config.maintenance_interval = Duration::from_secs(3600);
    config
}

pub struct TestNode {
    pub manager: PeerManager<MockWallet>,
    pub wallet: Arc<RwLock<MockWallet>>,
    pub connector: Arc<MockConnector>,
    pub verifier: Arc<MockMerkleVerifier>,
    pub events: mpsc::UnboundedReceiver<SpvEvent>,
    pub genesis: BlockHeader,
}

impl TestNode {
    /// A manager knowing `peers`, with the network reported as `reachable`.
    pub fn new(config: ManagerConfig, peers: Vec<PeerRecord>, reachable: bool) -> Self {
        let genesis = config.network_params.genesis;
        let wallet = Arc::new(RwLock::new(MockWallet::with_elements(vec![p2pkh_element(1)])));
        let connector = MockConnector::new();
        let verifier = MockMerkleVerifier::new();
        let manager = PeerManager::new(
            config,
            wallet.clone(),
            connector.clone(),
            verifier.clone(),
            0,
            Vec::new(),
            peers,
        )
        .expect("valid configuration");

        let (sender, events) = mpsc::unbounded_channel();
        manager.set_callbacks(sender, Arc::new(move || reachable)).expect("callbacks");
        Self {
            manager,
            wallet,
            connector,
            verifier,
            events,
            genesis,
        }
    }

    /// Accepting peers 1..=n at the given heights, one connection slot each. Not connected yet.
    pub fn with_peers(config: ManagerConfig, heights: &[u32]) -> Self {
        let records = (1..=heights.len() as u8).map(|n| test_peer_record(test_socket_address(n)));
        let config = config.with_max_connections(heights.len().max(1));
        let node = Self::new(config, records.collect(), true);
        for (i, height) in heights.iter().enumerate() {
            node.connector.add_peer(test_socket_address(i as u8 + 1), *height);
        }
        node
    }

    /// As [`with_peers`](Self::with_peers), after a connection round.
    pub async fn connected(config: ManagerConfig, heights: &[u32]) -> Self {
        let node = Self::with_peers(config, heights);
        node.manager.connect().await;
        node
    }

    /// Session id of the `n`th test peer.
    pub fn peer_id(&self, n: u8) -> PeerId {
        let address = test_socket_address(n);
        self.manager
            .peer_info()
            .into_iter()
            .find(|p| p.address.socket_addr() == address)
            .map(|p| p.id)
            .expect("peer is connected")
    }

    pub fn connection(&self, n: u8) -> Arc<MockConnection> {
        self.connector.connection(test_socket_address(n)).expect("session was opened")
    }

    pub fn events(&mut self) -> Vec<SpvEvent> {
        drain_events(&mut self.events)
    }

    /// Announce `headers` from `peer` with an `inv`.
    pub async fn announce(&self, peer: PeerId, headers: &[BlockHeader]) {
        let inv = headers.iter().map(|h| Inventory::Block(h.block_hash())).collect();
        self.manager.handle_peer_message(peer, NetworkMessage::Inv(inv)).await;
    }

    /// Send `headers` from `peer` as merkle blocks.
    pub async fn deliver(&self, peer: PeerId, headers: &[BlockHeader]) {
        for header in headers {
            let message = NetworkMessage::MerkleBlock(merkle_block(*header));
            self.manager.handle_peer_message(peer, message).await;
        }
    }

    /// Announce and deliver `headers` from `peer`.
    pub async fn sync_blocks(&self, peer: PeerId, headers: &[BlockHeader]) {
        self.announce(peer, headers).await;
        self.deliver(peer, headers).await;
    }
}

pub fn count(events: &[SpvEvent], event: &SpvEvent) -> usize {
    events.iter().filter(|e| *e == event).count()
}

/// Whether `connection` was sent a message matching `predicate`.
pub fn was_sent(connection: &MockConnection, predicate: impl Fn(&NetworkMessage) -> bool) -> bool {
    connection.sent().iter().any(predicate)
}
