//! `replication_shared`
//!
//! The entity replication and relevance core, shared by server and client.
//!
//! Design goals:
//! - Deterministic: priority-ordered iteration, caller-supplied time.
//! - Single-threaded and non-blocking; the scheduler never performs I/O.
//! - Clear seams: the gameplay model sits behind [`entity::EntitySource`],
//!   the transport behind [`scheduler::ReplicationSink`].
//! - No `unsafe`.

pub mod change;
pub mod codec;
pub mod config;
pub mod entity;
pub mod math;
pub mod net;
pub mod registry;
pub mod relevance;
pub mod scheduler;
pub mod stats;
pub mod throttle;
pub mod world;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::codec::*;
    pub use crate::config::*;
    pub use crate::entity::*;
    pub use crate::math::*;
    pub use crate::net::ClientId;
    pub use crate::registry::{Frequency, Priority};
    pub use crate::relevance::ClientView;
    pub use crate::scheduler::*;
    pub use crate::world::SimWorld;
}
