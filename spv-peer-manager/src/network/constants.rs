//! Network constants for the peer pool

use std::time::Duration;

// Connection limits
pub const MAX_CONNECTIONS: usize = 3;
pub const MAX_KNOWN_PEERS: usize = 2500;

// Timeouts
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(20);
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(20);

// Reconnection
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
pub const MAX_CONNECT_FAILURES: u32 = 20;

// Peer exchange
pub const MAX_ADDR_PER_MESSAGE: usize = 1000;
/// Gossiped timestamps further than this in the future are not trusted.
pub const MAX_ADDR_FUTURE_DRIFT: u64 = 10 * 60;
/// Age assigned to addresses whose timestamp was not trusted.
pub const UNTRUSTED_ADDR_AGE: u64 = 5 * 24 * 60 * 60;

// Connection maintenance
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);
pub const LAGGING_PEER_THRESHOLD: u32 = 10;
