//! `replication_client`
//!
//! Client-side systems:
//! - Connection management (reliable + unreliable channels)
//! - Anchor reporting so the server can scope relevance
//! - Frame verification and decoding
//! - Replica cache with interpolation for rendering

pub mod client;
pub mod replica;

pub use client::ReplicaClient;
