//! Edge Activation and Transfer Batching
//!
//! This module re-exports the edge-mesh crate.

// Re-export everything from edge-mesh crate
pub use edge_mesh::*;
