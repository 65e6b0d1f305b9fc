//! SPV peer manager library.
//!
//! This library implements the networking core of a bitcoin SPV wallet:
//!
//! - Keep a scored pool of known peers and a few outbound connections
//! - Sync the header chain, switching to bloom-filtered merkle blocks near the wallet's
//!   earliest key
//! - Verify proof of work, checkpoints and merkle proofs, and follow the most-work chain
//!   through bounded reorganizations
//! - Publish wallet transactions and track which peers relayed them
//! - Report progress and persistence needs through events
//!
//! Transport, wallet and storage are supplied by the application through
//! [`PeerConnector`](network::PeerConnector), [`WalletInterface`](wallet::WalletInterface)
//! and the `SaveBlocks`/`SavePeers` events.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use spv_peer_manager::network::PeerConnector;
//! use spv_peer_manager::validation::PartialMerkleVerifier;
//! use spv_peer_manager::wallet::WalletInterface;
//! use spv_peer_manager::{ManagerConfig, PeerManager, SpvEvent};
//! use tokio::sync::{RwLock, mpsc};
//!
//! async fn run<W: WalletInterface + 'static>(
//!     wallet: Arc<RwLock<W>>,
//!     connector: Arc<dyn PeerConnector>,
//! ) -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = PeerManager::new(
//!         ManagerConfig::testnet(),
//!         wallet,
//!         connector,
//!         Arc::new(PartialMerkleVerifier),
//!         1_700_000_000,
//!         Vec::new(),
//!         Vec::new(),
//!     )?;
//!
//!     let (events, mut receiver) = mpsc::unbounded_channel();
//!     manager.set_callbacks(events, Arc::new(|| true))?;
//!     manager.connect().await;
//!
//!     while let Some(event) = receiver.recv().await {
//!         if event == SpvEvent::SyncSucceeded {
//!             println!("synced to {}", manager.last_block_height());
//!             break;
//!         }
//!     }
//!     manager.disconnect().await;
//!     Ok(())
//! }
//! ```

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub mod bloom;
pub mod chain;
pub mod client;
pub mod error;
pub mod logging;
pub mod mempool;
pub mod network;
pub mod sync;
pub mod types;
pub mod validation;
pub mod wallet;

// Re-export main types for convenience
pub use client::{
    ManagerConfig, NetworkReachability, PeerInfo, PeerManager, PublishReceipt, SpvEvent,
};
pub use error::{
    BloomError, LoggingError, LoggingResult, NetworkError, PublishError, SpvError, SyncError,
    SyncErrorCode, ValidationError,
};
pub use logging::{LoggingConfig, LoggingGuard, init_console_logging, init_logging};
pub use tracing::level_filters::LevelFilter;

/// Current version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
