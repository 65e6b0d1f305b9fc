//! Connection rounds, reconnects, download peer failover and maintenance timeouts.

mod common;

use std::time::Duration;

use common::{TestNode, count, test_config, was_sent};
use spv_peer_manager::error::SyncErrorCode;
use spv_peer_manager::network::{NetworkMessage, PeerHandshake};
use spv_peer_manager::test_utils::{
    PeerBehavior, settle, test_handshake, test_peer_record, test_socket_address,
};
use spv_peer_manager::types::ServiceFlags;
use spv_peer_manager::SpvEvent;

fn failed(error: SyncErrorCode) -> SpvEvent {
    SpvEvent::SyncFailed {
        error,
    }
}

#[tokio::test]
async fn test_unreachable_network_reports_failure() {
    let config = test_config();
    let mut node = TestNode::new(config, vec![test_peer_record(test_socket_address(1))], false);
    node.connector.add_peer(test_socket_address(1), 10);

    node.manager.connect().await;
    assert_eq!(node.events(), vec![failed(SyncErrorCode::NetworkUnreachable)]);
    assert!(node.connector.attempts().is_empty());
    assert!(!node.manager.is_connected());
}

#[tokio::test]
async fn test_all_peers_refusing_reports_not_connected() {
    let mut config = test_config();
    config.max_connect_failures = 2;
    let mut node = TestNode::with_peers(config, &[10, 10]);
    for n in 1..=2 {
        node.connector.set_behavior(test_socket_address(n), PeerBehavior::Refuse);
    }

    node.manager.connect().await;
    assert_eq!(node.connector.attempts().len(), 2);
    assert_eq!(node.events(), vec![failed(SyncErrorCode::NotConnected)]);
    assert!(!node.manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_with_backoff_until_failure_limit() {
    let mut config = test_config();
    config.max_connect_failures = 3;
    let mut node = TestNode::with_peers(config, &[10, 10]);
    for n in 1..=2 {
        node.connector.set_behavior(test_socket_address(n), PeerBehavior::Refuse);
    }

    node.manager.connect().await;
    assert_eq!(node.connector.attempts().len(), 2);
    assert!(node.events().is_empty());

    // Not due yet.
    node.manager.check_timeouts().await;
    settle().await;
    assert_eq!(node.connector.attempts().len(), 2);

    tokio::time::advance(Duration::from_secs(60)).await;
    node.manager.check_timeouts().await;
    settle().await;
    assert_eq!(node.connector.attempts().len(), 4);
    assert_eq!(node.events(), vec![failed(SyncErrorCode::NotConnected)]);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_peer_times_out() {
    let node = TestNode::with_peers(test_config(), &[10, 10]);
    node.connector.set_behavior(test_socket_address(2), PeerBehavior::Hang);

    node.manager.connect().await;
    assert_eq!(node.manager.peer_count(), 1);
    assert_eq!(node.connector.attempts().len(), 2);
    assert_eq!(node.manager.download_peer(), Some(node.peer_id(1)));
}

#[tokio::test]
async fn test_peer_without_bloom_service_is_dropped() {
    let mut config = test_config();
    config.max_connect_failures = 1;
    let mut node = TestNode::with_peers(config, &[10]);
    let handshake = PeerHandshake {
        services: ServiceFlags::NETWORK,
        ..test_handshake(10)
    };
    node.connector.set_behavior(test_socket_address(1), PeerBehavior::Accept(handshake));

    node.manager.connect().await;
    assert!(!node.manager.is_connected());
    assert!(node.connection(1).is_closed());
    assert_eq!(node.events(), vec![failed(SyncErrorCode::NotConnected)]);
}

#[tokio::test]
async fn test_discovers_peers_when_none_known() {
    let node = TestNode::new(test_config().with_max_connections(1), Vec::new(), true);
    let address = test_socket_address(7);
    node.connector.add_peer(address, 0);
    node.connector.set_discoverable(vec![test_peer_record(address)]);

    node.manager.connect().await;
    assert_eq!(node.manager.peer_count(), 1);
    assert_eq!(node.manager.known_peer_count(), 1);
    assert_eq!(node.connector.attempts(), vec![address]);
}

#[tokio::test]
async fn test_callbacks_only_set_once() {
    let node = TestNode::with_peers(test_config(), &[0]);
    let (sender, _receiver) = tokio::sync::mpsc::unbounded_channel();
    let result = node.manager.set_callbacks(sender, std::sync::Arc::new(|| true));
    assert!(result.is_err());
}

#[tokio::test]
async fn test_remote_close_hands_download_to_next_peer() {
    let node = TestNode::connected(test_config(), &[10, 5]).await;
    assert_eq!(node.manager.download_peer(), Some(node.peer_id(1)));
    let next = node.peer_id(2);
    node.connection(2).take_sent();

    node.connection(1).close();
    settle().await;

    assert_eq!(node.manager.peer_count(), 1);
    assert_eq!(node.manager.download_peer(), Some(next));
    let second = node.connection(2);
    assert!(was_sent(&second, |m| matches!(m, NetworkMessage::FilterLoad(_))));
    assert!(was_sent(&second, |m| matches!(m, NetworkMessage::GetBlocks(_))));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_download_peer_replaced() {
    let mut node = TestNode::connected(test_config(), &[10, 9]).await;
    let stalled = node.peer_id(1);
    let next = node.peer_id(2);
    node.events();

    tokio::time::advance(Duration::from_secs(10)).await;
    node.manager.check_timeouts().await;
    assert_eq!(node.manager.download_peer(), Some(stalled));

    tokio::time::advance(Duration::from_secs(11)).await;
    node.manager.check_timeouts().await;
    assert_eq!(node.manager.download_peer(), Some(next));
    assert!(node.connection(1).is_closed());
    assert!(was_sent(&node.connection(2), |m| matches!(m, NetworkMessage::GetBlocks(_))));
    assert_eq!(count(&node.events(), &failed(SyncErrorCode::TimedOut)), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stall_without_replacement_fails_sync() {
    let mut node = TestNode::connected(test_config(), &[10]).await;
    node.events();

    tokio::time::advance(Duration::from_secs(21)).await;
    node.manager.check_timeouts().await;
    assert!(!node.manager.is_connected());
    assert_eq!(count(&node.events(), &failed(SyncErrorCode::TimedOut)), 1);
}
