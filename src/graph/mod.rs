//! Desired-state resource graph.
//!
//! The [`GraphBuilder`] accumulates declarations and turns them into an
//! immutable [`ResourceGraph`]: nodes in declaration order plus the
//! dependency edges derived from their references.

mod builder;
mod cycle;
mod hash;

pub use builder::{Edge, GraphBuilder, ResourceGraph, ResourceNode};
pub use hash::GraphHasher;

pub(crate) use cycle::topological_order;
