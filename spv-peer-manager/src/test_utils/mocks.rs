//! In-memory wallet, connections and merkle verification for driving the manager in tests.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::SpvEvent;
use crate::error::{NetworkError, NetworkResult};
use crate::network::{NetworkMessage, PeerConnection, PeerConnector, PeerHandshake, PeerRecord};
use crate::types::{BlockHash, MerkleBlock, ServiceFlags, Transaction, Txid};
use crate::validation::{MerkleMatch, MerkleVerifier};
use crate::wallet::WalletInterface;

/// Address of the `n`th test peer.
pub fn test_socket_address(n: u8) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 8333)
}

/// A known-peer record for `address` offering the required services.
pub fn test_peer_record(address: SocketAddr) -> PeerRecord {
    PeerRecord::new(address, ServiceFlags::required(), crate::types::unix_time_now())
}

/// Handshake of a peer at `best_height`.
pub fn test_handshake(best_height: u32) -> PeerHandshake {
    PeerHandshake {
        version: 70015,
        services: ServiceFlags::required(),
        best_height,
        user_agent: "/mock:0.1.0/".to_string(),
        latency: Duration::from_millis(50),
    }
}

/// Everything currently queued on an event receiver.
pub fn drain_events(events: &mut mpsc::UnboundedReceiver<SpvEvent>) -> Vec<SpvEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

/// Let spawned tasks run until they block.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Wallet that keeps everything in memory and records what the manager told it.
#[derive(Debug, Default)]
pub struct MockWallet {
    pub elements: Vec<Vec<u8>>,
    /// Relayed transactions the wallet claims.
    pub relevant: HashSet<Txid>,
    /// Claim every relayed transaction.
    pub accept_all: bool,
    pub transactions: HashMap<Txid, Transaction>,
    /// Confirmation height per transaction.
    pub heights: HashMap<Txid, u32>,
    /// Every `update_transactions` call in order.
    pub updates: Vec<(Vec<Txid>, u32)>,
    pub removed: Vec<Txid>,
    pub unconfirmed: Vec<Transaction>,
}

impl MockWallet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_elements(elements: Vec<Vec<u8>>) -> Self {
        Self {
            elements,
            ..Self::default()
        }
    }

    pub fn height_of(&self, txid: &Txid) -> Option<u32> {
        self.heights.get(txid).copied()
    }
}

#[async_trait]
impl WalletInterface for MockWallet {
    async fn bloom_filter_elements(&self) -> Vec<Vec<u8>> {
        self.elements.clone()
    }

    async fn register_transaction(&mut self, tx: &Transaction) -> bool {
        let txid = tx.txid();
        if !self.accept_all && !self.relevant.contains(&txid) {
            return false;
        }
        self.transactions.insert(txid, tx.clone());
        true
    }

    async fn update_transactions(&mut self, txids: &[Txid], height: u32, _timestamp: u32) {
        for txid in txids {
            self.heights.insert(*txid, height);
        }
        self.updates.push((txids.to_vec(), height));
    }

    async fn remove_transaction(&mut self, txid: &Txid) {
        self.transactions.remove(txid);
        self.heights.remove(txid);
        self.removed.push(*txid);
    }

    async fn unconfirmed_transactions(&self) -> Vec<Transaction> {
        self.unconfirmed.clone()
    }
}

/// One side of a fake peer session.
pub struct MockConnection {
    address: SocketAddr,
    sent: Mutex<Vec<NetworkMessage>>,
    inbound: mpsc::UnboundedSender<NetworkMessage>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<NetworkMessage>>,
    closed: CancellationToken,
    fail_sends: AtomicBool,
}

impl MockConnection {
    pub fn new(address: SocketAddr) -> Arc<Self> {
        let (inbound, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            address,
            sent: Mutex::new(Vec::new()),
            inbound,
            receiver: tokio::sync::Mutex::new(receiver),
            closed: CancellationToken::new(),
            fail_sends: AtomicBool::new(false),
        })
    }

    /// Deliver `message` as if the remote peer sent it.
    pub fn push(&self, message: NetworkMessage) {
        let _ = self.inbound.send(message);
    }

    /// Messages the manager sent so far.
    pub fn sent(&self) -> Vec<NetworkMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Messages sent so far, clearing the log.
    pub fn take_sent(&self) -> Vec<NetworkMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Close the session from the remote side.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Make every following send fail.
    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    fn address(&self) -> SocketAddr {
        self.address
    }

    async fn send_message(&self, message: NetworkMessage) -> NetworkResult<()> {
        if self.closed.is_cancelled() {
            return Err(NetworkError::PeerDisconnected);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(NetworkError::NotConnected);
        }
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push(message);
        Ok(())
    }

    async fn receive_message(&self) -> NetworkResult<Option<NetworkMessage>> {
        let mut receiver = self.receiver.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(None),
            message = receiver.recv() => Ok(message),
        }
    }

    async fn disconnect(&self) {
        self.closed.cancel();
    }
}

/// How a fake peer answers a connection attempt.
#[derive(Debug, Clone)]
pub enum PeerBehavior {
    Accept(PeerHandshake),
    Refuse,
    /// Never completes; the manager's connect timeout has to fire.
    Hang,
}

/// Connector over a fixed set of fake peers.
#[derive(Default)]
pub struct MockConnector {
    behaviors: Mutex<HashMap<SocketAddr, PeerBehavior>>,
    connections: Mutex<HashMap<SocketAddr, Arc<MockConnection>>>,
    attempts: Mutex<Vec<SocketAddr>>,
    discoverable: Mutex<Vec<PeerRecord>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A peer at `address` that accepts connections and reports `best_height`.
    pub fn add_peer(&self, address: SocketAddr, best_height: u32) {
        self.set_behavior(address, PeerBehavior::Accept(test_handshake(best_height)));
    }

    pub fn set_behavior(&self, address: SocketAddr, behavior: PeerBehavior) {
        self.behaviors.lock().unwrap_or_else(|e| e.into_inner()).insert(address, behavior);
    }

    /// Records returned from `discover_peers`.
    pub fn set_discoverable(&self, records: Vec<PeerRecord>) {
        *self.discoverable.lock().unwrap_or_else(|e| e.into_inner()) = records;
    }

    /// The latest session opened to `address`.
    pub fn connection(&self, address: SocketAddr) -> Option<Arc<MockConnection>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner()).get(&address).cloned()
    }

    /// Every address dialed, in order.
    pub fn attempts(&self) -> Vec<SocketAddr> {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(
        &self,
        address: SocketAddr,
    ) -> NetworkResult<(Arc<dyn PeerConnection>, PeerHandshake)> {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner()).push(address);
        let behavior =
            self.behaviors.lock().unwrap_or_else(|e| e.into_inner()).get(&address).cloned();
        match behavior {
            Some(PeerBehavior::Accept(handshake)) => {
                let connection = MockConnection::new(address);
                self.connections
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(address, connection.clone());
                let connection: Arc<dyn PeerConnection> = connection;
                Ok((connection, handshake))
            }
            Some(PeerBehavior::Hang) => std::future::pending().await,
            Some(PeerBehavior::Refuse) | None => {
                Err(NetworkError::ConnectionFailed(format!("{} refused", address)))
            }
        }
    }

    async fn discover_peers(&self) -> Vec<PeerRecord> {
        self.discoverable.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Merkle verification with scripted results: valid with no matches unless told otherwise.
#[derive(Debug, Default)]
pub struct MockMerkleVerifier {
    matches: Mutex<HashMap<BlockHash, Vec<Txid>>>,
    invalid: Mutex<HashSet<BlockHash>>,
}

impl MockMerkleVerifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Report `txids` as matched in block `hash`.
    pub fn set_matches(&self, hash: BlockHash, txids: Vec<Txid>) {
        self.matches.lock().unwrap_or_else(|e| e.into_inner()).insert(hash, txids);
    }

    /// Report block `hash` as carrying a broken proof.
    pub fn set_invalid(&self, hash: BlockHash) {
        self.invalid.lock().unwrap_or_else(|e| e.into_inner()).insert(hash);
    }
}

impl MerkleVerifier for MockMerkleVerifier {
    fn verify(&self, block: &MerkleBlock) -> MerkleMatch {
        let hash = block.block_hash();
        if self.invalid.lock().unwrap_or_else(|e| e.into_inner()).contains(&hash) {
            return MerkleMatch::invalid();
        }
        MerkleMatch {
            matched: self
                .matches
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&hash)
                .cloned()
                .unwrap_or_default(),
            valid: true,
        }
    }
}
