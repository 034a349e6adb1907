//! Application layer: node assembly and top-level errors.

pub mod coordinator;
pub mod error;

pub use coordinator::{BackgroundTasks, Coordinator, broadcast_to_nodes, node_clients};
