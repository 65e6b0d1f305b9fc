mod builders;
mod mocks;

pub use builders::{
    BLOCK_SPACING, REGTEST_BITS, TestHeaderBuilder, block_entries, merkle_block, mine_chain,
    mine_header, p2pkh_element, p2pkh_script, test_transaction,
};
pub use mocks::{
    MockConnection, MockConnector, MockMerkleVerifier, MockWallet, PeerBehavior, drain_events,
    settle, test_handshake, test_peer_record, test_socket_address,
};
