//! Network layer of the SPV peer manager.
//!
//! The wire codec and handshake are supplied by the embedding application through
//! [`PeerConnector`] and [`PeerConnection`]. This module holds the manager-side
//! bookkeeping: peer records, reputation scoring and the known-peer pool.

pub mod constants;
pub mod message;
pub mod peer;
pub mod pool;
pub mod reputation;


use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::NetworkResult;
use crate::types::ServiceFlags;

pub use message::{AddrEntry, FilterLoad, GetBlocksMessage, Inventory, NetworkMessage, Reject};
pub use peer::{ConnectedPeer, PeerRecord, PeerStatus};
pub use pool::PeerPool;
pub use reputation::{Misbehavior, MisbehaviorScores};

/// Result of a completed version handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHandshake {
    /// Protocol version announced by the peer.
    pub version: u32,
    pub services: ServiceFlags,
    /// Chain height the peer reported in its `version` message.
    pub best_height: u32,
    pub user_agent: String,
    /// Round-trip time measured during the handshake.
    pub latency: Duration,
}

/// One live session with a remote peer.
///
/// Implementations own framing and serialization. All methods take `&self`; the
/// manager shares the session between its reader task and its action executor.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Remote endpoint of this session.
    fn address(&self) -> SocketAddr;

    /// Send a message to the peer.
    async fn send_message(&self, message: NetworkMessage) -> NetworkResult<()>;

    /// Wait for the next message. `Ok(None)` means the session closed.
    async fn receive_message(&self) -> NetworkResult<Option<NetworkMessage>>;

    /// Close the session. Pending and future `receive_message` calls return `Ok(None)`.
    async fn disconnect(&self);
}

/// Opens sessions to remote peers.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Open a session to `address` and complete the version handshake.
    async fn connect(
        &self,
        address: SocketAddr,
    ) -> NetworkResult<(Arc<dyn PeerConnection>, PeerHandshake)>;

    /// Additional candidate peers, e.g. from DNS seeds. Called when the known set runs dry.
    async fn discover_peers(&self) -> Vec<PeerRecord> {
        Vec::new()
    }
}
