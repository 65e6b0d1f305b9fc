//! Chain synchronization state: phases, download peer choice and progress.

pub mod progress;
pub mod state;

pub use progress::SyncProgress;
pub use state::{DownloadCandidate, SyncPhase, SyncState, select_download_peer};
