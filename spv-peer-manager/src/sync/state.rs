//! Sync state management.

use std::time::Duration;

use tokio::time::Instant;

use super::progress::SyncProgress;
use crate::types::PeerId;

const ONE_WEEK: u64 = 7 * 24 * 60 * 60;

/// What the download peer is currently asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    /// No download in progress.
    #[default]
    Idle,
    /// Bare headers, for history older than the wallet's keys.
    Headers,
    /// Merkle blocks through `getblocks`, `inv` and filtered `getdata`.
    Blocks,
    /// Caught up with the best height known across peers.
    Synced,
}

impl SyncPhase {
    /// Headers while the tip is more than a week older than the earliest key, blocks after.
    pub fn for_tip(tip_time: u32, earliest_key_time: u64) -> Self {
        if tip_time as u64 + ONE_WEEK < earliest_key_time {
            SyncPhase::Headers
        } else {
            SyncPhase::Blocks
        }
    }

    pub fn is_downloading(self) -> bool {
        matches!(self, SyncPhase::Headers | SyncPhase::Blocks)
    }
}

/// A connected peer as seen by download peer selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadCandidate {
    pub peer: PeerId,
    pub best_height: u32,
    pub latency: Duration,
}

/// Pick the peer with the highest reported height, then the lowest latency.
///
/// `exclude` is skipped unless it is the only candidate.
pub fn select_download_peer(
    candidates: &[DownloadCandidate],
    exclude: Option<PeerId>,
) -> Option<PeerId> {
    best_candidate(candidates.iter().filter(|c| Some(c.peer) != exclude))
        .or_else(|| best_candidate(candidates.iter()))
}

fn best_candidate<'a>(candidates: impl Iterator<Item = &'a DownloadCandidate>) -> Option<PeerId> {
    candidates
        .max_by(|a, b| a.best_height.cmp(&b.best_height).then_with(|| b.latency.cmp(&a.latency)))
        .map(|c| c.peer)
}

/// Manages the state of one sync session at a time.
#[derive(Debug)]
pub struct SyncState {
    phase: SyncPhase,
    download_peer: Option<PeerId>,
    /// A session started and has not yet succeeded or failed.
    session_active: bool,
    progress: SyncProgress,
    /// Last time the download peer delivered something new.
    last_progress: Instant,
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            phase: SyncPhase::Idle,
            download_peer: None,
            session_active: false,
            progress: SyncProgress::default(),
            last_progress: Instant::now(),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: SyncPhase) {
        self.phase = phase;
    }

    pub fn download_peer(&self) -> Option<PeerId> {
        self.download_peer
    }

    pub fn set_download_peer(&mut self, peer: Option<PeerId>) {
        self.download_peer = peer;
    }

    pub fn is_session_active(&self) -> bool {
        self.session_active
    }

    pub fn is_synced(&self) -> bool {
        self.phase == SyncPhase::Synced
    }

    /// Begin a session from `start_height`. Reported progress keeps its high-water mark until
    /// [`reset`](Self::reset).
    pub fn begin_session(&mut self, start_height: u32, phase: SyncPhase) {
        self.session_active = true;
        self.phase = phase;
        self.progress.restart(start_height);
        self.touch();
    }

    /// End the session. Returns false if none was active.
    pub fn finish_session(&mut self, synced: bool) -> bool {
        let was_active = std::mem::take(&mut self.session_active);
        self.phase = if synced {
            SyncPhase::Synced
        } else {
            SyncPhase::Idle
        };
        was_active
    }

    /// Forget the download peer, session and progress, e.g. after disconnecting everything.
    pub fn reset(&mut self) {
        self.phase = SyncPhase::Idle;
        self.download_peer = None;
        self.session_active = false;
        self.progress = SyncProgress::default();
    }

    pub fn progress(&mut self, last: u32, estimated: u32) -> f64 {
        self.progress.update(last, estimated)
    }

    /// Record that the download peer made progress.
    pub fn touch(&mut self) {
        self.last_progress = Instant::now();
    }

    pub fn is_stalled(&self, timeout: Duration) -> bool {
        self.phase.is_downloading() && self.last_progress.elapsed() >= timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(peer: u64, best_height: u32, latency_ms: u64) -> DownloadCandidate {
        DownloadCandidate {
            peer: PeerId(peer),
            best_height,
            latency: Duration::from_millis(latency_ms),
        }
    }

    #[test]
    fn test_highest_then_fastest() {
        let candidates =
            [candidate(1, 100, 10), candidate(2, 500, 300), candidate(3, 500, 50)];
        assert_eq!(select_download_peer(&candidates, None), Some(PeerId(3)));
        assert_eq!(select_download_peer(&candidates, Some(PeerId(3))), Some(PeerId(2)));
        assert_eq!(select_download_peer(&[], None), None);
    }

    #[test]
    fn test_exclusion_falls_back_to_only_peer() {
        let candidates = [candidate(1, 100, 10)];
        assert_eq!(select_download_peer(&candidates, Some(PeerId(1))), Some(PeerId(1)));
    }

    #[test]
    fn test_phase_for_tip() {
        let key_time = 1_700_000_000u64;
        assert_eq!(SyncPhase::for_tip(0, key_time), SyncPhase::Headers);
        assert_eq!(SyncPhase::for_tip((key_time - ONE_WEEK) as u32, key_time), SyncPhase::Blocks);
        assert_eq!(SyncPhase::for_tip(0, 0), SyncPhase::Blocks);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_and_stall() {
        let mut state = SyncState::new();
        assert!(!state.is_stalled(Duration::from_secs(20)));

        state.begin_session(0, SyncPhase::Blocks);
        assert!(state.is_session_active());
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(state.is_stalled(Duration::from_secs(20)));

        state.touch();
        assert!(!state.is_stalled(Duration::from_secs(20)));

        assert!(state.finish_session(true));
        assert!(!state.finish_session(true));
        assert!(state.is_synced());
        assert!(!state.is_stalled(Duration::ZERO));
    }

    #[test]
    fn test_progress_kept_across_sessions_until_reset() {
        let mut state = SyncState::new();
        state.begin_session(0, SyncPhase::Blocks);
        assert_eq!(state.progress(10, 10), 1.0);
        state.finish_session(true);

        // A peer announces more blocks and a new session starts from the tip.
        state.begin_session(10, SyncPhase::Blocks);
        assert_eq!(state.progress(10, 15), 1.0);
        state.finish_session(true);

        state.reset();
        state.begin_session(0, SyncPhase::Blocks);
        assert_eq!(state.progress(0, 15), 0.0);
    }
}
