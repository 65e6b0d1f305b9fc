//! Transaction publishing and wallet change notifications.

use tokio::sync::oneshot;
use tracing::debug;

use super::PeerManager;
use super::events::PublishReceipt;
use crate::error::PublishError;
use crate::types::Transaction;
use crate::wallet::WalletInterface;

impl<W: WalletInterface + 'static> PeerManager<W> {
    /// Announce a signed transaction to every connected peer.
    ///
    /// The receipt resolves when enough peers relayed it, every peer refused it, it was seen
    /// in a block, or the publish timeout passed. Unsigned transactions and publishing while
    /// disconnected fail immediately.
    pub async fn publish_tx(&self, tx: Transaction) -> PublishReceipt {
        let txid = tx.txid();
        if !tx.is_signed() {
            debug!("Refusing to publish unsigned transaction {}", txid);
            return PublishReceipt::ready(txid, Err(PublishError::InvalidTransaction));
        }

        let (sender, receiver) = oneshot::channel();
        let actions = self.shared.lock().publish(tx, sender);
        self.shared.run_actions(actions).await;
        PublishReceipt::new(txid, receiver)
    }

    /// Tell the manager the wallet gained addresses or outputs. The bloom filter is rebuilt
    /// and reloaded into every peer when it no longer covers the wallet.
    pub async fn wallet_updated(&self) {
        let elements = self.shared.wallet.read().await.bloom_filter_elements().await;
        let actions = self.shared.lock().wallet_updated(elements);
        self.shared.run_actions(actions).await;
    }
}
