//! Events reported to the embedding application and the handles it receives.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::chain::BlockEntry;
use crate::error::{PublishError, SyncErrorCode};
use crate::mempool::publisher::PublishResult;
use crate::network::PeerRecord;
use crate::types::{PeerAddress, PeerId, Txid};

/// Events emitted by the peer manager.
#[derive(Debug, Clone, PartialEq)]
pub enum SpvEvent {
    /// The download peer began catching up.
    SyncStarted,

    /// The verified tip reached the best height known across peers. Once per sync session.
    SyncSucceeded,

    /// Sync stopped without reaching the best height.
    SyncFailed {
        error: SyncErrorCode,
    },

    /// Wallet transactions changed confirmation state.
    TxStatusUpdate,

    /// A wallet transaction was refused by every connected peer and removed from the wallet.
    TxRejected {
        txid: Txid,
        rescan_recommended: bool,
    },

    /// Blocks to persist. With `replace` the list is the whole main chain.
    SaveBlocks {
        blocks: Vec<BlockEntry>,
        replace: bool,
    },

    /// Peer records to persist. With `replace` the list is the whole known set.
    SavePeers {
        peers: Vec<PeerRecord>,
        replace: bool,
    },
}

/// Connectivity check polled before connecting.
pub trait NetworkReachability: Send + Sync {
    fn network_is_reachable(&self) -> bool;
}

impl<F> NetworkReachability for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn network_is_reachable(&self) -> bool {
        self()
    }
}

/// Completion handle of a published transaction.
#[derive(Debug)]
pub struct PublishReceipt {
    txid: Txid,
    receiver: oneshot::Receiver<PublishResult>,
}

impl PublishReceipt {
    pub(crate) fn new(txid: Txid, receiver: oneshot::Receiver<PublishResult>) -> Self {
        Self {
            txid,
            receiver,
        }
    }

    /// A receipt that already carries its result.
    pub(crate) fn ready(txid: Txid, result: PublishResult) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(result);
        Self::new(txid, receiver)
    }

    pub fn txid(&self) -> Txid {
        self.txid
    }

    /// Wait for the network's verdict.
    pub async fn wait(self) -> PublishResult {
        self.receiver.await.unwrap_or(Err(PublishError::Cancelled))
    }

    /// The result, if already decided.
    pub fn try_result(&mut self) -> Option<PublishResult> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(PublishError::Cancelled)),
        }
    }
}

/// Snapshot of one connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub address: PeerAddress,
    pub best_height: u32,
    pub latency: Duration,
    pub is_download_peer: bool,
    pub user_agent: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ready_receipt() {
        let txid = Txid::from_byte_array([1; 32]);
        let mut receipt = PublishReceipt::ready(txid, Err(PublishError::NotConnected));
        assert_eq!(receipt.txid(), txid);
        assert_eq!(receipt.try_result(), Some(Err(PublishError::NotConnected)));
    }

    #[tokio::test]
    async fn test_dropped_sender_is_cancelled() {
        let (sender, receiver) = oneshot::channel();
        let receipt = PublishReceipt::new(Txid::all_zeros(), receiver);
        drop(sender);
        assert_eq!(receipt.wait().await, Err(PublishError::Cancelled));
    }

    #[test]
    fn test_closure_reachability() {
        let online = || true;
        let offline = || false;
        assert!(online.network_is_reachable());
        assert!(!offline.network_is_reachable());
    }
}
