//! # Sparse Graph Associative Memory
//!
//! A recurrent memory module for reinforcement-learning agents that stores
//! accumulated history as a growing sparse graph instead of a fixed-size
//! vector or attention window. Each timestep's observation becomes a node,
//! pluggable edge selectors wire new nodes to the past, and a graph neural
//! network propagates information along the edges to produce one belief
//! vector per timestep.
//!
//! ## Features
//! - Capacity-bounded node arena with watermark indexing and oldest-first
//!   eviction
//! - Deterministic and learned edge selection (relaxed-categorical
//!   sampling hardened through a straight-through estimator)
//! - Block-diagonal batching of ragged per-element graphs into one GNN
//!   invocation
//! - Fixed-size hidden-state transport with lossless round trips up to a
//!   configured edge capacity
//! - Recurrent state-in/state-out adapter for windowed, zero-padded
//!   sequence batching
//!
//! ## Architecture
//!
//! ```text
//! obs [B,tau,feat] ─► RecurrentGcm ─► SparseGcm ─► beliefs [Σtau, feat']
//!                        │               │
//!                  pack/unpack     EdgeSelector chain
//!                 (HiddenCodec)    Preprocessor + PositionalEncoding
//!                        │         flatten ─► Gnn (opaque)
//!                  GraphState ◄────────────────┘
//! ```

pub mod adapter;
pub mod codec;
pub mod error;
pub mod gnn;
pub mod indexing;
pub mod learned;
pub mod memory;
pub mod positional;
pub mod sampling;
pub mod selector;
pub mod state;


pub use adapter::{ElementState, RecurrentGcm, SparseGcmConfig};
pub use codec::{flatten_edges, pack, unpack};
pub use error::GcmError;
pub use gnn::{Gnn, GraphConv, GraphConvStack};
pub use learned::LearnedEdge;
pub use memory::SparseGcm;
pub use positional::{PositionalEncoding, PositionalMode};
pub use selector::{EdgeSelector, TemporalBackedge};
pub use state::{GraphState, EDGE_SENTINEL};

/// Result type for graph memory operations
pub type GcmResult<T> = Result<T, GcmError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        EdgeSelector, ElementState, GcmError, GcmResult, Gnn, GraphConvStack, GraphState,
        LearnedEdge, PositionalEncoding, PositionalMode, RecurrentGcm, SparseGcm, SparseGcmConfig,
        TemporalBackedge,
    };
}
