//! `replication_server`
//!
//! Server-side systems:
//! - Fixed timestep loop driving the replication scheduler
//! - Simulation world standing in for the gameplay model
//! - Receives anchor updates, sends replication frames
//!
//! Networking model:
//! - TCP: handshake/control plane
//! - UDP: data plane (anchor updates in, replication frames out)

pub mod server;

pub use server::ReplicationServer;
