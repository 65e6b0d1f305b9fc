//! Outbound transaction publishing and relay tracking.

pub mod publisher;

pub use publisher::{PublishedTx, Resolved, TransactionPublisher};
