//! Query methods for peers, chain height and sync progress.

use super::PeerManager;
use super::events::PeerInfo;
use crate::chain::BlockEntry;
use crate::types::{PeerId, Txid};
use crate::wallet::WalletInterface;

impl<W: WalletInterface + 'static> PeerManager<W> {
    // ============ Peer Queries ============

    /// Whether at least one peer session is open.
    pub fn is_connected(&self) -> bool {
        self.shared.lock().active_peer_count() > 0
    }

    pub fn peer_count(&self) -> usize {
        self.shared.lock().active_peer_count()
    }

    /// Snapshot of the connected peers, ordered by id.
    pub fn peer_info(&self) -> Vec<PeerInfo> {
        self.shared.lock().peer_info()
    }

    pub fn download_peer(&self) -> Option<PeerId> {
        self.shared.lock().sync.download_peer()
    }

    /// Number of known peer addresses.
    pub fn known_peer_count(&self) -> usize {
        self.shared.lock().pool.len()
    }

    // ============ Chain Queries ============

    /// Height of the verified tip.
    pub fn last_block_height(&self) -> u32 {
        self.shared.lock().chain.tip_height()
    }

    /// Best height reported by connected peers, at least our own tip.
    pub fn estimated_block_height(&self) -> u32 {
        self.shared.lock().estimated_height()
    }

    pub fn tip(&self) -> BlockEntry {
        self.shared.lock().tip()
    }

    /// Fraction of the current sync session completed, in `[0, 1]`.
    ///
    /// The value never decreases within a session, even when peers report new blocks.
    pub fn sync_progress(&self) -> f64 {
        self.shared.lock().sync_progress()
    }

    pub fn is_synced(&self) -> bool {
        self.shared.lock().sync.is_synced()
    }

    // ============ Transaction Queries ============

    /// Number of connected peers that announced or requested `txid`.
    pub fn relay_count(&self, txid: &Txid) -> usize {
        self.shared.lock().relay_count(txid)
    }
}
