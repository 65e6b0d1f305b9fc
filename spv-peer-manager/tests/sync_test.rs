//! Chain sync through the manager: download peer choice, completion, reorgs, rescans.

mod common;

use std::time::Duration;

use common::{TestNode, count, test_config, was_sent};
use spv_peer_manager::SpvEvent;
use spv_peer_manager::error::SyncErrorCode;
use spv_peer_manager::network::{AddrEntry, NetworkMessage};
use spv_peer_manager::test_utils::{mine_chain, settle, test_socket_address};
use spv_peer_manager::types::{ServiceFlags, TX_UNCONFIRMED, Txid, unix_time_now};

#[tokio::test]
async fn test_highest_peer_downloads_and_sync_succeeds_once() {
    let mut node = TestNode::connected(test_config(), &[500, 100, 100]).await;
    let a = node.peer_id(1);
    assert_eq!(node.manager.peer_count(), 3);
    assert_eq!(node.manager.download_peer(), Some(a));
    assert_eq!(node.manager.estimated_block_height(), 500);
    assert!(was_sent(&node.connection(1), |m| matches!(m, NetworkMessage::GetBlocks(_))));
    assert!(!was_sent(&node.connection(2), |m| matches!(m, NetworkMessage::GetBlocks(_))));
    for n in 1..=3 {
        assert!(was_sent(&node.connection(n), |m| matches!(m, NetworkMessage::FilterLoad(_))));
    }
    assert_eq!(count(&node.events(), &SpvEvent::SyncStarted), 1);

    let blocks = mine_chain(&node.genesis, 500, 0);
    node.sync_blocks(a, &blocks).await;
    assert_eq!(node.manager.last_block_height(), 500);
    assert!(node.manager.is_synced());
    assert_eq!(node.manager.sync_progress(), 1.0);

    let events = node.events();
    assert_eq!(count(&events, &SpvEvent::SyncSucceeded), 1);
    assert!(events.iter().any(|e| matches!(e, SpvEvent::SaveBlocks { replace: true, .. })));
    // Once synced every peer is asked for its mempool.
    for n in 1..=3 {
        assert!(was_sent(&node.connection(n), |m| *m == NetworkMessage::MemPool));
    }

    // A new block after sync does not report success again.
    let next = mine_chain(&blocks[499], 1, 0);
    node.sync_blocks(a, &next).await;
    assert_eq!(node.manager.last_block_height(), 501);
    assert_eq!(count(&node.events(), &SpvEvent::SyncSucceeded), 0);
}

#[tokio::test]
async fn test_peers_at_our_height_complete_immediately() {
    let mut node = TestNode::connected(test_config(), &[0, 0]).await;
    assert!(node.manager.is_synced());
    let events = node.events();
    assert_eq!(count(&events, &SpvEvent::SyncSucceeded), 1);
    assert_eq!(count(&events, &SpvEvent::SyncStarted), 0);
}

#[tokio::test]
async fn test_progress_never_decreases() {
    let node = TestNode::connected(test_config(), &[10]).await;
    let a = node.peer_id(1);
    let blocks = mine_chain(&node.genesis, 20, 0);

    node.sync_blocks(a, &blocks[..5]).await;
    assert_eq!(node.manager.sync_progress(), 0.5);

    // The peer now claims 20 blocks; the raw fraction drops to a quarter.
    node.announce(a, &blocks[5..]).await;
    assert_eq!(node.manager.estimated_block_height(), 20);
    assert_eq!(node.manager.sync_progress(), 0.5);

    node.deliver(a, &blocks[5..15]).await;
    assert_eq!(node.manager.sync_progress(), 0.75);
}

#[tokio::test(start_paused = true)]
async fn test_progress_holds_when_higher_peer_joins_after_sync() {
    let mut node = TestNode::connected(test_config(), &[10, 10]).await;
    let a = node.manager.download_peer().expect("a download peer");
    let blocks = mine_chain(&node.genesis, 10, 0);
    node.sync_blocks(a, &blocks).await;
    assert!(node.manager.is_synced());
    assert_eq!(node.manager.sync_progress(), 1.0);
    node.events();

    // The other peer drops and comes back reporting five more blocks.
    let other = if a == node.peer_id(1) { 2 } else { 1 };
    node.connector.add_peer(test_socket_address(other), 15);
    node.connection(other).close();
    settle().await;
    tokio::time::advance(Duration::from_secs(5)).await;
    node.manager.check_timeouts().await;
    settle().await;

    assert_eq!(node.manager.peer_count(), 2);
    assert_eq!(node.manager.estimated_block_height(), 15);
    assert_eq!(count(&node.events(), &SpvEvent::SyncStarted), 1);
    assert_eq!(node.manager.sync_progress(), 1.0);
}

#[tokio::test]
async fn test_blocks_and_peers_saved_after_sync() {
    let mut config = test_config();
    config.max_addr_per_message = 2;
    let mut node = TestNode::connected(config, &[10, 10]).await;
    let a = node.manager.download_peer().expect("a download peer");
    let blocks = mine_chain(&node.genesis, 15, 0);
    node.sync_blocks(a, &blocks[..10]).await;
    assert!(node.manager.is_synced());
    node.events();

    node.sync_blocks(a, &blocks[10..]).await;
    assert_eq!(node.manager.last_block_height(), 15);
    let saved: Vec<u32> = node
        .events()
        .iter()
        .filter_map(|e| match e {
            SpvEvent::SaveBlocks {
                blocks,
                ..
            } => blocks.last().map(|b| b.height),
            _ => None,
        })
        .collect();
    assert!(!saved.is_empty());
    assert_eq!(saved.last(), Some(&15));

    let other = if a == node.peer_id(1) { 2 } else { 1 };
    let b = node.peer_id(other);
    let entries: Vec<AddrEntry> = (20..23)
        .map(|n| AddrEntry {
            time: unix_time_now() as u32,
            services: ServiceFlags::required(),
            address: test_socket_address(n),
        })
        .collect();

    // Gossip learned while synced is saved with the message.
    node.manager.handle_peer_message(b, NetworkMessage::Addr(entries[..2].to_vec())).await;
    let events = node.events();
    assert!(events.iter().any(|e| matches!(e, SpvEvent::SavePeers { .. })));

    // So is the penalty for an oversized one.
    node.manager.handle_peer_message(b, NetworkMessage::Addr(entries)).await;
    assert_eq!(node.manager.peer_count(), 1);
    let penalized = node.events().into_iter().any(|e| match e {
        SpvEvent::SavePeers {
            peers,
            ..
        } => peers
            .iter()
            .any(|p| p.address.socket_addr() == test_socket_address(other) && p.misbehavior_score > 0),
        _ => false,
    });
    assert!(penalized);
}

#[tokio::test]
async fn test_reorg_rolls_back_before_confirming() {
    let node = TestNode::connected(test_config(), &[10]).await;
    let a = node.peer_id(1);
    let (first, second) = (Txid::from_byte_array([1; 32]), Txid::from_byte_array([2; 32]));
    let main = mine_chain(&node.genesis, 2, 0);
    let fork = mine_chain(&node.genesis, 3, 1);
    node.verifier.set_matches(main[1].block_hash(), vec![first]);
    node.verifier.set_matches(fork[1].block_hash(), vec![first]);
    node.verifier.set_matches(fork[2].block_hash(), vec![second]);

    node.deliver(a, &main).await;
    node.deliver(a, &fork).await;

    assert_eq!(node.manager.tip().hash, fork[2].block_hash());
    let wallet = node.wallet.read().await;
    assert_eq!(
        wallet.updates,
        vec![
            (vec![first], 2),
            (vec![first], TX_UNCONFIRMED),
            (vec![first], 2),
            (vec![second], 3),
        ]
    );
    assert_eq!(wallet.height_of(&first), Some(2));
    assert_eq!(wallet.height_of(&second), Some(3));
}

#[tokio::test]
async fn test_orphans_connect_once_parent_arrives() {
    let node = TestNode::connected(test_config(), &[10]).await;
    let a = node.peer_id(1);
    let blocks = mine_chain(&node.genesis, 3, 0);
    node.connection(1).take_sent();

    node.deliver(a, &blocks[1..]).await;
    assert_eq!(node.manager.last_block_height(), 0);
    let orphan = blocks[1].block_hash();
    assert!(was_sent(&node.connection(1), |m| {
        matches!(m, NetworkMessage::GetBlocks(request) if request.stop_hash == orphan)
    }));

    node.deliver(a, &blocks[..1]).await;
    assert_eq!(node.manager.last_block_height(), 3);
    assert_eq!(node.manager.tip().hash, blocks[2].block_hash());
}

#[tokio::test]
async fn test_disconnect_mid_sync_cancels_and_saves_once() {
    let mut node = TestNode::connected(test_config(), &[20]).await;
    let a = node.peer_id(1);
    let blocks = mine_chain(&node.genesis, 5, 0);
    node.sync_blocks(a, &blocks).await;
    node.events();

    node.manager.disconnect().await;
    assert!(!node.manager.is_connected());
    assert!(node.connection(1).is_closed());

    let events = node.events();
    assert_eq!(
        count(
            &events,
            &SpvEvent::SyncFailed {
                error: SyncErrorCode::Cancelled,
            }
        ),
        1
    );
    let saves: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SpvEvent::SaveBlocks {
                blocks,
                ..
            } => Some(blocks),
            _ => None,
        })
        .collect();
    assert_eq!(saves.len(), 1);
    assert_eq!(saves[0].last().map(|b| b.height), Some(5));

    // Nothing is left to save or report.
    node.manager.disconnect().await;
    assert!(node.events().is_empty());
}

#[tokio::test]
async fn test_rescan_switches_download_peer() {
    let mut node = TestNode::connected(test_config(), &[20, 10, 10]).await;
    let a = node.peer_id(1);
    let blocks = mine_chain(&node.genesis, 20, 0);
    node.sync_blocks(a, &blocks).await;
    assert!(node.manager.is_synced());
    node.events();

    node.manager.rescan().await;
    assert_eq!(node.manager.last_block_height(), 0);
    let next = node.manager.download_peer().expect("a download peer");
    assert_ne!(next, a);
    assert_eq!(node.manager.sync_progress(), 0.0);
    assert_eq!(count(&node.events(), &SpvEvent::SyncStarted), 1);

    let n = if next == node.peer_id(2) { 2 } else { 3 };
    assert!(was_sent(&node.connection(n), |m| matches!(m, NetworkMessage::GetBlocks(_))));
}

#[tokio::test]
async fn test_lagging_peer_dropped_once_synced() {
    let node = TestNode::connected(test_config(), &[30, 5]).await;
    let a = node.peer_id(1);
    let blocks = mine_chain(&node.genesis, 30, 0);
    node.sync_blocks(a, &blocks).await;
    assert!(node.manager.is_synced());

    node.manager.check_timeouts().await;
    assert_eq!(node.manager.peer_count(), 1);
    assert!(node.connection(2).is_closed());
}

#[tokio::test]
async fn test_wallet_growth_reloads_filter() {
    let node = TestNode::connected(test_config(), &[0, 0]).await;
    for n in 1..=2 {
        node.connection(n).take_sent();
    }

    // Same elements: nothing to do.
    node.manager.wallet_updated().await;
    assert!(node.connection(1).sent().is_empty());

    node.wallet.write().await.elements.push(vec![2; 20]);
    node.manager.wallet_updated().await;
    for n in 1..=2 {
        assert!(was_sent(&node.connection(n), |m| matches!(m, NetworkMessage::FilterLoad(_))));
        assert!(was_sent(&node.connection(n), |m| *m == NetworkMessage::MemPool));
    }
}
