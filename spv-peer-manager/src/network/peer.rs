//! Known-peer records and live peer sessions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::reputation::clamp_misbehavior_score;
use super::{PeerConnection, PeerHandshake};
use crate::types::{BlockHash, PeerAddress, PeerId, ServiceFlags};

/// Persistent description of one known network endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub address: PeerAddress,
    pub services: ServiceFlags,
    /// Unix seconds at which the peer was last seen alive.
    pub last_seen: u64,
    /// Chain height the peer last reported.
    #[serde(default)]
    pub best_height: u32,
    #[serde(default)]
    pub latency: Duration,
    #[serde(default, deserialize_with = "clamp_misbehavior_score")]
    pub misbehavior_score: i32,
    /// Consecutive failed connection attempts.
    #[serde(default)]
    pub connect_failures: u32,
}

impl PeerRecord {
    pub fn new(address: impl Into<PeerAddress>, services: ServiceFlags, last_seen: u64) -> Self {
        Self {
            address: address.into(),
            services,
            last_seen,
            best_height: 0,
            latency: Duration::ZERO,
            misbehavior_score: 0,
            connect_failures: 0,
        }
    }
}

/// Lifecycle of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Connecting,
    Connected,
    Disconnecting,
}

/// A live session owned by the manager for the lifetime of the connection.
pub struct ConnectedPeer {
    pub id: PeerId,
    pub address: PeerAddress,
    pub connection: Arc<dyn PeerConnection>,
    pub status: PeerStatus,
    pub is_download_peer: bool,
    pub services: ServiceFlags,
    pub user_agent: String,
    /// Height from the handshake, raised by block announcements.
    pub best_height: u32,
    pub latency: Duration,
    /// Bloom filter generation most recently sent to this peer.
    pub filter_generation: Option<u64>,
    /// Running estimate of the false-positive rate this peer delivers.
    pub fp_rate: f64,
    /// Relayed transactions the wallet did not recognize since the last merkle block.
    pub fp_count: u32,
    /// Merkle blocks requested from this peer, keyed to the filter generation at request time.
    pub requested_blocks: HashMap<BlockHash, u64>,
    /// Cancels the peer's reader task.
    pub token: CancellationToken,
    pub connected_at: Instant,
}

impl ConnectedPeer {
    pub fn new(
        id: PeerId,
        connection: Arc<dyn PeerConnection>,
        handshake: &PeerHandshake,
        token: CancellationToken,
        initial_fp_rate: f64,
    ) -> Self {
        Self {
            id,
            address: PeerAddress::new(connection.address()),
            connection,
            status: PeerStatus::Connected,
            is_download_peer: false,
            services: handshake.services,
            user_agent: handshake.user_agent.clone(),
            best_height: handshake.best_height,
            latency: handshake.latency,
            filter_generation: None,
            fp_rate: initial_fp_rate,
            fp_count: 0,
            requested_blocks: HashMap::new(),
            token,
            connected_at: Instant::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == PeerStatus::Connected
    }
}

impl fmt::Debug for ConnectedPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectedPeer")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("status", &self.status)
            .field("is_download_peer", &self.is_download_peer)
            .field("best_height", &self.best_height)
            .field("latency", &self.latency)
            .field("filter_generation", &self.filter_generation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_deserialize_clamps_score() {
        let record = PeerRecord::new(
            "127.0.0.1:8333".parse::<std::net::SocketAddr>().unwrap(),
            ServiceFlags::required(),
            1_700_000_000,
        );
        let mut json = serde_json::to_value(&record).unwrap();
        json["misbehavior_score"] = serde_json::json!(5000);
        let restored: PeerRecord = serde_json::from_value(json).unwrap();
        assert_eq!(restored.misbehavior_score, 100);
        assert_eq!(restored.address, record.address);
    }
}
