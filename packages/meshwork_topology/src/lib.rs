//! Topology computation for a meshwork overlay.
//!
//! Performs no I/O. Takes a set of [`Node`]s and an [`Allocator`] and produces an immutable
//! [`Topology`] snapshot, which can be diffed against the snapshot that is currently applied.

pub mod allocator;
pub mod diff;
pub mod node;
pub mod topology;

pub use allocator::{Allocator, AllocatorError};
pub use diff::{diff, Change, NodeDelta};
pub use node::{ready, Node};
pub use topology::{
    build, Election, Granularity, NodeConfig, Options, Peer, Segment, Topology, DEFAULT_PORT,
};
