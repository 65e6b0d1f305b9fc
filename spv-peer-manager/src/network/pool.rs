//! Known-peer pool: candidate selection, gossip intake, penalties and retention.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use tracing::{debug, info, trace, warn};

use super::constants::{MAX_ADDR_FUTURE_DRIFT, UNTRUSTED_ADDR_AGE};
use super::message::AddrEntry;
use super::reputation::{Misbehavior, MisbehaviorScores};
use super::{PeerHandshake, PeerRecord};
use crate::types::{PeerAddress, ServiceFlags};

/// Result of penalizing a peer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Penalty {
    /// Score after the penalty was applied.
    pub score: i32,
    /// The record reached the ban threshold.
    pub banned: bool,
}

/// Peers that should be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSave {
    pub peers: Vec<PeerRecord>,
    /// Replace the whole persisted set instead of upserting one record.
    pub replace: bool,
}

/// `base * 2^failures`, capped at `max`.
pub fn backoff(base: Duration, failures: u32, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(failures.min(16)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

/// The set of peers the manager knows about. Banned peers stay in `known` with their score
/// so the ban is persisted with the rest of the snapshot.
#[derive(Debug)]
pub struct PeerPool {
    known: HashMap<PeerAddress, PeerRecord>,
    max_known_peers: usize,
    ban_score: i32,
    scores: MisbehaviorScores,
    /// Records changed since the last save.
    dirty: HashSet<PeerAddress>,
    /// A record was removed since the last save, so only a full snapshot is accurate.
    removed: bool,
}

impl PeerPool {
    pub fn new(max_known_peers: usize, ban_score: i32, scores: MisbehaviorScores) -> Self {
        Self {
            known: HashMap::new(),
            max_known_peers,
            ban_score,
            scores,
            dirty: HashSet::new(),
            removed: false,
        }
    }

    /// Load the persisted snapshot. Seeded records are not considered dirty.
    pub fn seed(&mut self, records: impl IntoIterator<Item = PeerRecord>) {
        for record in records {
            self.known.insert(record.address, record);
        }
        if self.known.len() > self.max_known_peers {
            self.enforce_cap();
        }
    }

    /// Number of known peers that are not banned.
    pub fn len(&self) -> usize {
        self.known.values().filter(|r| !self.is_banned_record(r)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn banned_count(&self) -> usize {
        self.known.values().filter(|r| self.is_banned_record(r)).count()
    }

    pub fn get(&self, address: &PeerAddress) -> Option<&PeerRecord> {
        self.known.get(address)
    }

    pub fn is_banned(&self, address: &PeerAddress) -> bool {
        self.known.get(address).is_some_and(|r| self.is_banned_record(r))
    }

    fn is_banned_record(&self, record: &PeerRecord) -> bool {
        record.misbehavior_score >= self.ban_score
    }

    /// Insert a record or merge it into the existing one. Banned addresses are ignored.
    pub fn add_or_update(&mut self, record: PeerRecord) -> bool {
        if self.is_banned(&record.address) {
            trace!("Ignoring banned address {}", record.address);
            return false;
        }
        let address = record.address;
        match self.known.get_mut(&address) {
            Some(existing) => {
                if record.last_seen <= existing.last_seen && record.services == existing.services {
                    return false;
                }
                existing.last_seen = existing.last_seen.max(record.last_seen);
                existing.services |= record.services;
            }
            None => {
                self.known.insert(address, record);
            }
        }
        self.dirty.insert(address);
        true
    }

    /// Take in an `addr` message. Returns the number of new or updated records, or the
    /// misbehavior if the message is oversized.
    pub fn handle_addr(
        &mut self,
        entries: &[AddrEntry],
        now: u64,
        max_per_message: usize,
    ) -> Result<usize, Misbehavior> {
        if entries.len() > max_per_message {
            warn!("addr message with {} entries exceeds limit {}", entries.len(), max_per_message);
            return Err(Misbehavior::InvalidMessage);
        }

        let mut changed = 0;
        for entry in entries {
            if !entry.services.contains(ServiceFlags::NETWORK) {
                continue;
            }
            let mut last_seen = entry.time as u64;
            if last_seen > now + MAX_ADDR_FUTURE_DRIFT {
                last_seen = now.saturating_sub(UNTRUSTED_ADDR_AGE);
            }
            if self.add_or_update(PeerRecord::new(entry.address, entry.services, last_seen)) {
                changed += 1;
            }
        }
        if changed > 0 {
            debug!("Learned {} peer addresses from gossip, {} known", changed, self.known.len());
        }
        self.enforce_cap();
        Ok(changed)
    }

    /// Record a successful handshake.
    pub fn record_connected(&mut self, address: PeerAddress, handshake: &PeerHandshake, now: u64) {
        if self.is_banned(&address) {
            return;
        }
        let record = self
            .known
            .entry(address)
            .or_insert_with(|| PeerRecord::new(address, handshake.services, now));
        record.services = handshake.services;
        record.best_height = handshake.best_height;
        record.latency = handshake.latency;
        record.last_seen = now;
        record.connect_failures = 0;
        self.dirty.insert(address);
    }

    /// Record a failed connection attempt and return the consecutive failure count.
    pub fn record_connect_failure(&mut self, address: &PeerAddress) -> u32 {
        match self.known.get_mut(address) {
            Some(record) => {
                record.connect_failures = record.connect_failures.saturating_add(1);
                self.dirty.insert(*address);
                record.connect_failures
            }
            None => 0,
        }
    }

    /// Raise the height a known peer reported.
    pub fn record_height(&mut self, address: &PeerAddress, height: u32) {
        if let Some(record) = self.known.get_mut(address) {
            if height > record.best_height {
                record.best_height = height;
                self.dirty.insert(*address);
            }
        }
    }

    /// Add the penalty for `misbehavior`. Records reaching the ban score are banned but kept,
    /// so the ban survives a save and reload.
    pub fn penalize(&mut self, address: &PeerAddress, misbehavior: Misbehavior) -> Penalty {
        let delta = self.scores.score_for(misbehavior);
        let record = self
            .known
            .entry(*address)
            .or_insert_with(|| PeerRecord::new(*address, ServiceFlags::empty(), 0));
        record.misbehavior_score = record.misbehavior_score.saturating_add(delta);
        let score = record.misbehavior_score;
        self.dirty.insert(*address);

        if score >= self.ban_score {
            info!("Banning peer {} ({:?}, score {})", address, misbehavior, score);
            return Penalty {
                score,
                banned: true,
            };
        }

        debug!("Penalized peer {} for {:?}, score now {}", address, misbehavior, score);
        Penalty {
            score,
            banned: false,
        }
    }

    /// Evict the worst records until the retention cap holds: highest score first, then
    /// oldest `last_seen`. Banned records count toward the cap but go last, oldest first.
    pub fn enforce_cap(&mut self) -> usize {
        let excess = self.known.len().saturating_sub(self.max_known_peers);
        if excess == 0 {
            return 0;
        }
        let ban_score = self.ban_score;
        let mut ranked: Vec<(i32, u64, PeerAddress)> =
            self.known.values().map(|r| (r.misbehavior_score, r.last_seen, r.address)).collect();
        ranked.sort_by(|a, b| {
            (a.0 >= ban_score)
                .cmp(&(b.0 >= ban_score))
                .then_with(|| if a.0 >= ban_score { a.1.cmp(&b.1) } else { b.0.cmp(&a.0) })
                .then(a.1.cmp(&b.1))
        });
        for (_, _, address) in ranked.into_iter().take(excess) {
            self.known.remove(&address);
            self.dirty.remove(&address);
        }
        self.removed = true;
        debug!("Evicted {} peers over retention cap {}", excess, self.max_known_peers);
        excess
    }

    /// Choose up to `count` connection candidates, at random, weighted toward low misbehavior
    /// and recent activity. Records without the required services or in `exclude` are skipped.
    pub fn select_candidates<R: Rng + ?Sized>(
        &self,
        count: usize,
        exclude: &HashSet<PeerAddress>,
        rng: &mut R,
    ) -> Vec<PeerAddress> {
        let mut pool: Vec<&PeerRecord> = self
            .known
            .values()
            .filter(|r| r.services.contains(ServiceFlags::required()))
            .filter(|r| !self.is_banned_record(r))
            .filter(|r| !exclude.contains(&r.address))
            .collect();
        // Most recently seen first; rank feeds the weight so recency breaks score ties.
        pool.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.address.cmp(&b.address)));

        let n = pool.len();
        let mut weights: Vec<f64> = pool
            .iter()
            .enumerate()
            .map(|(rank, r)| (n - rank) as f64 / (1.0 + r.misbehavior_score.max(0) as f64))
            .collect();

        let mut chosen = Vec::with_capacity(count.min(n));
        while chosen.len() < count {
            let Ok(dist) = WeightedIndex::new(&weights) else {
                break;
            };
            let idx = dist.sample(rng);
            chosen.push(pool[idx].address);
            weights[idx] = 0.0;
        }
        chosen
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.removed || !self.dirty.is_empty()
    }

    /// Collect what needs persisting since the last call: one upserted record, or a full
    /// snapshot when several records changed or any was removed.
    pub fn take_save(&mut self) -> Option<PeerSave> {
        if !self.has_unsaved_changes() {
            return None;
        }
        let save = if !self.removed && self.dirty.len() == 1 {
            let address = self.dirty.iter().next().copied();
            let peers = address.and_then(|a| self.known.get(&a)).cloned().into_iter().collect();
            PeerSave {
                peers,
                replace: false,
            }
        } else {
            let mut peers: Vec<PeerRecord> = self.known.values().cloned().collect();
            peers.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
            PeerSave {
                peers,
                replace: true,
            }
        };
        self.dirty.clear();
        self.removed = false;
        Some(save)
    }
}
