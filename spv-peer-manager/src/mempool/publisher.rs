//! Tracks locally published transactions until the network accepts or refuses them.
//!
//! A transaction counts as relayed by a peer once that peer announces it back to
//! us or asks for it with `getdata`. Relay bits are kept per transaction for every
//! announced txid, not only the ones we published, so [`relay_count`] works for
//! any transaction. Tracking is capped; past the cap the oldest txids that are not
//! pending are forgotten first.
//!
//! [`relay_count`]: TransactionPublisher::relay_count

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::PublishError;
use crate::types::{PeerId, Transaction, Txid};

pub type PublishResult = Result<(), PublishError>;

/// Announced txids whose relay bits are kept.
pub const MAX_TRACKED_RELAYS: usize = 10_000;

/// A transaction waiting for the network's verdict.
#[derive(Debug)]
pub struct PublishedTx {
    pub tx: Transaction,
    /// Peers that refused the transaction.
    pub rejected_by: HashSet<PeerId>,
    /// Whether any refusal cited spent or missing inputs.
    pub spent_inputs: bool,
    completion: Option<oneshot::Sender<PublishResult>>,
    pub deadline: Instant,
}

/// A publish that reached its final state. Completing it is left to the caller so the
/// waiter is woken outside any lock.
#[derive(Debug)]
pub struct Resolved {
    pub txid: Txid,
    pub result: PublishResult,
    completion: Option<oneshot::Sender<PublishResult>>,
}

impl Resolved {
    /// Whether a caller is waiting on this outcome.
    pub fn has_waiter(&self) -> bool {
        self.completion.is_some()
    }

    /// Deliver the result to the waiting receipt, if any.
    pub fn complete(self) {
        if let Some(sender) = self.completion {
            // The receipt may have been dropped.
            let _ = sender.send(self.result);
        }
    }
}

#[derive(Debug)]
pub struct TransactionPublisher {
    pending: HashMap<Txid, PublishedTx>,
    tx_relays: HashMap<Txid, HashSet<PeerId>>,
    /// Txids in the order they were first tracked. May hold txids already dropped.
    relay_order: VecDeque<Txid>,
    relay_capacity: usize,
    min_relay_peers: usize,
    publish_timeout: Duration,
}

impl TransactionPublisher {
    pub fn new(min_relay_peers: usize, publish_timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            tx_relays: HashMap::new(),
            relay_order: VecDeque::new(),
            relay_capacity: MAX_TRACKED_RELAYS,
            min_relay_peers: min_relay_peers.max(1),
            publish_timeout,
        }
    }

    pub fn with_relay_capacity(mut self, capacity: usize) -> Self {
        self.relay_capacity = capacity.max(1);
        self
    }

    /// Queue `tx` for publishing. A transaction queued again keeps its relay bits and gets a
    /// fresh deadline; an earlier waiter on it is resolved as cancelled.
    pub fn publish(
        &mut self,
        tx: Transaction,
        completion: Option<oneshot::Sender<PublishResult>>,
        now: Instant,
    ) -> Option<Resolved> {
        let txid = tx.txid();
        let deadline = now + self.publish_timeout;

        if let Some(existing) = self.pending.get_mut(&txid) {
            existing.deadline = deadline;
            if completion.is_none() {
                return None;
            }
            let superseded = std::mem::replace(&mut existing.completion, completion);
            return superseded.map(|sender| Resolved {
                txid,
                result: Err(PublishError::Cancelled),
                completion: Some(sender),
            });
        }

        debug!("Publishing transaction {}", txid);
        self.pending.insert(
            txid,
            PublishedTx {
                tx,
                rejected_by: HashSet::new(),
                spent_inputs: false,
                completion,
                deadline,
            },
        );
        None
    }

    pub fn is_pending(&self, txid: &Txid) -> bool {
        self.pending.contains_key(txid)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_transaction(&self, txid: &Txid) -> Option<&Transaction> {
        self.pending.get(txid).map(|p| &p.tx)
    }

    pub fn pending_txids(&self) -> Vec<Txid> {
        self.pending.keys().copied().collect()
    }

    /// Whether any peer has announced `txid`.
    pub fn is_known(&self, txid: &Txid) -> bool {
        self.tx_relays.contains_key(txid)
    }

    /// Set `peer`'s relay bit for `txid`. Returns true if the bit was not set before.
    pub fn record_relay(&mut self, txid: Txid, peer: PeerId) -> bool {
        if !self.tx_relays.contains_key(&txid) {
            self.relay_order.push_back(txid);
        }
        let inserted = self.tx_relays.entry(txid).or_default().insert(peer);
        self.enforce_relay_capacity();
        inserted
    }

    /// Number of txids with relay bits.
    pub fn tracked_count(&self) -> usize {
        self.tx_relays.len()
    }

    fn enforce_relay_capacity(&mut self) {
        if self.tx_relays.len() > self.relay_capacity {
            let mut kept = VecDeque::new();
            while self.tx_relays.len() > self.relay_capacity {
                let Some(txid) = self.relay_order.pop_front() else {
                    break;
                };
                if self.pending.contains_key(&txid) && self.tx_relays.contains_key(&txid) {
                    kept.push_back(txid);
                } else {
                    self.tx_relays.remove(&txid);
                }
            }
            while let Some(txid) = kept.pop_back() {
                self.relay_order.push_front(txid);
            }
            debug!("Relay tracking over capacity, {} txids kept", self.tx_relays.len());
        }
        if self.relay_order.len() > self.relay_capacity.saturating_mul(2) {
            let tracked = &self.tx_relays;
            let mut seen = HashSet::new();
            self.relay_order.retain(|txid| tracked.contains_key(txid) && seen.insert(*txid));
        }
    }

    /// Number of distinct connected peers that relayed `txid`.
    pub fn relay_count(&self, txid: &Txid, connected: &HashSet<PeerId>) -> usize {
        self.tx_relays.get(txid).map_or(0, |peers| peers.intersection(connected).count())
    }

    /// Record a `reject` for a pending transaction.
    pub fn record_reject(&mut self, txid: &Txid, peer: PeerId, spent_inputs: bool) {
        if let Some(published) = self.pending.get_mut(txid) {
            published.rejected_by.insert(peer);
            published.spent_inputs |= spent_inputs;
        }
        if let Some(peers) = self.tx_relays.get_mut(txid) {
            peers.remove(&peer);
        }
    }

    /// Forget everything `peer` told us.
    pub fn remove_peer(&mut self, peer: PeerId) {
        self.tx_relays.retain(|_, peers| {
            peers.remove(&peer);
            !peers.is_empty()
        });
        for published in self.pending.values_mut() {
            published.rejected_by.remove(&peer);
        }
    }

    /// Settle every pending transaction whose outcome is decided.
    pub fn evaluate(&mut self, connected: &HashSet<PeerId>, now: Instant) -> Vec<Resolved> {
        let mut decided = Vec::new();
        for (txid, published) in &self.pending {
            let relays = self.relay_count(txid, connected);
            let rejections = published.rejected_by.intersection(connected).count();
            let all_answered = !connected.is_empty()
                && connected
                    .iter()
                    .all(|p| published.rejected_by.contains(p) || self.relayed_by(txid, p));

            let result = if relays >= self.min_relay_peers || (all_answered && relays > 0) {
                Some(Ok(()))
            } else if relays == 0 && !connected.is_empty() && rejections == connected.len() {
                Some(Err(PublishError::Rejected {
                    rescan_recommended: published.spent_inputs,
                }))
            } else if now >= published.deadline {
                Some(if relays > 0 {
                    Ok(())
                } else {
                    Err(PublishError::TimedOut)
                })
            } else {
                None
            };
            if let Some(result) = result {
                decided.push((*txid, result));
            }
        }

        decided
            .into_iter()
            .filter_map(|(txid, result)| {
                let published = self.pending.remove(&txid)?;
                info!("Publish of {} finished: {:?}", txid, result);
                Some(Resolved {
                    txid,
                    result,
                    completion: published.completion,
                })
            })
            .collect()
    }

    /// Transactions seen in a verified block succeed regardless of relays.
    pub fn confirm(&mut self, txids: &[Txid]) -> Vec<Resolved> {
        txids
            .iter()
            .filter_map(|txid| {
                self.tx_relays.remove(txid);
                let published = self.pending.remove(txid)?;
                debug!("Published transaction {} confirmed", txid);
                Some(Resolved {
                    txid: *txid,
                    result: Ok(()),
                    completion: published.completion,
                })
            })
            .collect()
    }

    /// Resolve everything as cancelled and drop all relay state.
    pub fn cancel_all(&mut self) -> Vec<Resolved> {
        self.tx_relays.clear();
        self.relay_order.clear();
        self.pending
            .drain()
            .map(|(txid, published)| Resolved {
                txid,
                result: Err(PublishError::Cancelled),
                completion: published.completion,
            })
            .collect()
    }

    fn relayed_by(&self, txid: &Txid, peer: &PeerId) -> bool {
        self.tx_relays.get(txid).is_some_and(|peers| peers.contains(peer))
    }
}
