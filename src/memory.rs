//! Sparse graph memory engine
//!
//! Owns the incremental graph state and drives one memory update per call:
//! insert the new observations as nodes, extend the edge set through the
//! selector chains, flatten the batch into a single disjoint-union graph,
//! propagate with the GNN, and read the belief vectors back out at the
//! freshly inserted positions.
//!
//! ```text
//! observations ─┐
//!               ▼
//!   ┌───────── insert nodes (copy-on-write) ─────────┐
//!   │                                                │
//!   │  selector chain (raw features)                 │
//!   │  preprocessor → positional encoding            │
//!   │  aux selector chain (processed features)       │
//!   │                                                │
//!   └── flatten valid nodes + edges ──► GNN ──► beliefs at new nodes
//! ```
//!
//! The engine is a pure function of (observations, hidden state): it holds
//! no mutable state of its own, so one engine may serve many independent
//! episodes as long as each call chain owns its state exclusively.

use candle_core::{DType, Tensor};
use candle_nn::Module;

use crate::codec::flatten_edges;
use crate::error::GcmError;
use crate::gnn::Gnn;
use crate::indexing::{output_node_idxs, valid_node_idxs};
use crate::positional::PositionalEncoding;
use crate::selector::{run_chain, EdgeSelector};
use crate::state::GraphState;
use crate::GcmResult;

/// Graph associative memory over a pluggable GNN.
pub struct SparseGcm {
    gnn: Box<dyn Gnn>,
    preprocessor: Option<Box<dyn Module>>,
    positional: Option<PositionalEncoding>,
    edge_selectors: Vec<Box<dyn EdgeSelector>>,
    aux_edge_selectors: Vec<Box<dyn EdgeSelector>>,
    graph_size: usize,
    edge_weights: bool,
}

impl SparseGcm {
    pub fn new(gnn: Box<dyn Gnn>, graph_size: usize) -> GcmResult<Self> {
        if graph_size == 0 {
            return Err(GcmError::InvalidParameter(
                "graph_size must be nonzero".into(),
            ));
        }
        Ok(Self {
            gnn,
            preprocessor: None,
            positional: None,
            edge_selectors: Vec::new(),
            aux_edge_selectors: Vec::new(),
            graph_size,
            edge_weights: false,
        })
    }

    /// Per-node transform applied to a working copy before the GNN; the
    /// stored nodes stay raw so observations remain reconstructable.
    pub fn with_preprocessor(mut self, preprocessor: Box<dyn Module>) -> Self {
        self.preprocessor = Some(preprocessor);
        self
    }

    /// Rewrap the current preprocessor, e.g. to chain a further stage
    /// behind an already-installed projection.
    pub(crate) fn map_preprocessor(
        mut self,
        f: impl FnOnce(Option<Box<dyn Module>>) -> Box<dyn Module>,
    ) -> Self {
        self.preprocessor = Some(f(self.preprocessor.take()));
        self
    }

    pub fn with_positional_encoding(mut self, encoding: PositionalEncoding) -> Self {
        self.positional = Some(encoding);
        self
    }

    /// Selectors that run on raw observation features, before any
    /// preprocessing. Use these for human-interpretable priors.
    pub fn with_edge_selectors(mut self, selectors: Vec<Box<dyn EdgeSelector>>) -> Self {
        self.edge_selectors = selectors;
        self
    }

    /// Selectors that run after preprocessing and positional encoding;
    /// their inputs are no longer human-readable, so only learned priors
    /// belong here.
    pub fn with_aux_edge_selectors(mut self, selectors: Vec<Box<dyn EdgeSelector>>) -> Self {
        self.aux_edge_selectors = selectors;
        self
    }

    /// Whether edge weights reach the GNN; when off, all-ones weights are
    /// substituted. Only required when a learned selector emits
    /// gradient-carrying edge values.
    pub fn with_edge_weights(mut self, enabled: bool) -> Self {
        self.edge_weights = enabled;
        self
    }

    pub fn graph_size(&self) -> usize {
        self.graph_size
    }

    pub fn output_size(&self) -> usize {
        self.gnn.output_size()
    }

    /// Zero state for `batch_size` episodes of `feat`-wide observations.
    pub fn initial_state(
        &self,
        batch_size: usize,
        feat: usize,
        device: &candle_core::Device,
    ) -> GcmResult<GraphState> {
        GraphState::zeros(batch_size, self.graph_size, feat, device)
    }

    /// Insert up to `taus[b]` timesteps per element from the zero-padded
    /// observation tensor `x [B, tau_max, feat]`, then query the memory.
    ///
    /// Returns `sum(taus)` belief vectors in batch-major, time-ascending
    /// order together with the updated state. An all-zero `taus` is a
    /// no-op on the state and yields an empty belief tensor.
    pub fn step(
        &self,
        x: &Tensor,
        taus: &[usize],
        hidden: Option<GraphState>,
    ) -> GcmResult<(Tensor, GraphState)> {
        let (b, tau_max, feat) = x.dims3()?;
        if taus.len() != b {
            return Err(GcmError::DimensionMismatch {
                expected: b,
                got: taus.len(),
            });
        }
        if let Some(&bad) = taus.iter().find(|&&tau| tau > tau_max) {
            return Err(GcmError::InvalidParameter(format!(
                "valid length {bad} exceeds the observation tensor's {tau_max} timesteps"
            )));
        }

        let mut state = match hidden {
            Some(h) => {
                if h.batch_size() != b {
                    return Err(GcmError::InvalidHiddenState(format!(
                        "state batch {} does not match observation batch {b}",
                        h.batch_size()
                    )));
                }
                if h.capacity() != self.graph_size {
                    return Err(GcmError::InvalidHiddenState(format!(
                        "state capacity {} does not match configured graph size {}",
                        h.capacity(),
                        self.graph_size
                    )));
                }
                if h.feat_size() != feat {
                    return Err(GcmError::DimensionMismatch {
                        expected: h.feat_size(),
                        got: feat,
                    });
                }
                h.validate()?;
                h
            }
            None => GraphState::zeros(b, self.graph_size, feat, x.device())?,
        };

        let total: usize = taus.iter().sum();
        if total == 0 {
            let empty = Tensor::zeros((0, self.gnn.output_size()), DType::F32, x.device())?;
            return Ok((empty, state));
        }

        // Make room, then write the new observations in.
        state.wrap_overflow(taus)?;
        state.write_new_nodes(x, taus)?;

        if !self.edge_selectors.is_empty() {
            let (edges, weights) = run_chain(
                &self.edge_selectors,
                state.nodes(),
                state.edges(),
                state.weights(),
                state.t(),
                taus,
            )?;
            state.set_edges(edges, weights)?;
        }

        // All further feature transforms happen on a working copy; the
        // state keeps the raw observations.
        let mut dirty = state.nodes().clone();
        if let Some(pp) = &self.preprocessor {
            dirty = pp.forward(&dirty)?;
        }
        if let Some(pe) = &self.positional {
            dirty = pe.apply(&dirty)?;
        }
        if !self.aux_edge_selectors.is_empty() {
            let (edges, weights) = run_chain(
                &self.aux_edge_selectors,
                &dirty,
                state.edges(),
                state.weights(),
                state.t(),
                taus,
            )?;
            state.set_edges(edges, weights)?;
        }

        let (_, _, dirty_feat) = dirty.dims3()?;
        if dirty_feat != self.gnn.input_size() {
            return Err(GcmError::DimensionMismatch {
                expected: self.gnn.input_size(),
                got: dirty_feat,
            });
        }

        // One block-diagonal union graph over every element's valid range.
        let (b_idxs, n_idxs) = valid_node_idxs(state.t(), taus);
        let flat_idx: Vec<u32> = b_idxs
            .iter()
            .zip(&n_idxs)
            .map(|(&batch, &node)| (batch * self.graph_size + node) as u32)
            .collect();
        let flat_idx_t = Tensor::from_vec(flat_idx, (b_idxs.len(),), x.device())?;
        let flat_nodes = dirty
            .reshape((b * self.graph_size, dirty_feat))?
            .index_select(&flat_idx_t, 0)?;

        let (flat_edges, flat_weights) = flatten_edges(&state, taus)?;
        let gnn_weights = if self.edge_weights {
            flat_weights
        } else {
            flat_weights.ones_like()?
        };

        let node_feats = self.gnn.forward(&flat_nodes, &flat_edges, &gnn_weights)?;

        let out_idx: Vec<u32> = output_node_idxs(state.t(), taus)
            .into_iter()
            .map(|i| i as u32)
            .collect();
        let out_idx_t = Tensor::from_vec(out_idx, (total,), x.device())?;
        let beliefs = node_feats.index_select(&out_idx_t, 0)?;

        if beliefs
            .flatten_all()?
            .to_vec1::<f32>()?
            .iter()
            .any(|v| !v.is_finite())
        {
            return Err(GcmError::NonFiniteBelief);
        }

        state.advance_t(taus);
        Ok((beliefs, state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gnn::GraphConvStack;
    use crate::selector::TemporalBackedge;
    use candle_core::Device;
    use candle_nn::{VarBuilder, VarMap};

    fn engine(feat: usize, graph_size: usize) -> SparseGcm {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let gnn = GraphConvStack::new(&[feat, feat], vb.pp("gnn")).unwrap();
        SparseGcm::new(Box::new(gnn), graph_size)
            .unwrap()
            .with_edge_selectors(vec![Box::new(TemporalBackedge)])
    }

    fn obs(b: usize, tau: usize, feat: usize, fill: f32) -> Tensor {
        Tensor::full(fill, (b, tau, feat), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_sequential_inserts_accumulate() {
        let gcm = engine(3, 16);
        let mut hidden = None;
        for k in 1..=4usize {
            let x = obs(2, 2, 3, k as f32);
            let (beliefs, state) = gcm.step(&x, &[2, 2], hidden).unwrap();
            assert_eq!(beliefs.dims(), &[4, 3]);
            assert_eq!(state.t(), &[2 * k, 2 * k]);
            hidden = Some(state);
        }
        // The first 8 node rows replay the inserted observations in order.
        let nodes = hidden.unwrap().nodes().to_vec3::<f32>().unwrap();
        for b in 0..2 {
            for step in 0..4 {
                for i in 0..2 {
                    assert_eq!(nodes[b][2 * step + i], vec![(step + 1) as f32; 3]);
                }
            }
            for unused in 8..16 {
                assert_eq!(nodes[b][unused], vec![0f32; 3]);
            }
        }
    }

    #[test]
    fn test_zero_tau_is_noop() {
        let gcm = engine(3, 8);
        let x = obs(2, 1, 3, 1.0);
        let (_, state) = gcm.step(&x, &[1, 1], None).unwrap();
        let (beliefs, state2) = gcm.step(&x, &[0, 0], Some(state.clone())).unwrap();
        assert_eq!(beliefs.dims(), &[0, 3]);
        assert_eq!(state2.t(), state.t());
    }

    #[test]
    fn test_ragged_taus_emit_batch_major_beliefs() {
        let gcm = engine(2, 8);
        let x = obs(2, 3, 2, 1.0);
        let (beliefs, state) = gcm.step(&x, &[1, 3], None).unwrap();
        assert_eq!(beliefs.dims(), &[4, 2]);
        assert_eq!(state.t(), &[1, 3]);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let gcm = engine(2, 4);
        let mut hidden = None;
        for k in 1..=6usize {
            let x = obs(1, 1, 2, k as f32);
            let (_, state) = gcm.step(&x, &[1], hidden).unwrap();
            hidden = Some(state);
        }
        let state = hidden.unwrap();
        assert_eq!(state.t(), &[4]);
        let nodes = state.nodes().to_vec3::<f32>().unwrap();
        // Observations 1 and 2 were evicted; 3..=6 remain, shifted down.
        for (row, expected) in (3..=6).enumerate() {
            assert_eq!(nodes[0][row], vec![expected as f32; 2]);
        }
        // No edge may reference an index at or beyond the watermark.
        state.validate().unwrap();
    }

    #[test]
    fn test_beliefs_are_finite() {
        let gcm = engine(4, 32);
        let mut hidden = None;
        for _ in 0..8 {
            let x = Tensor::rand(-10f32, 10f32, (3, 2, 4), &Device::Cpu).unwrap();
            let (beliefs, state) = gcm.step(&x, &[2, 2, 2], hidden).unwrap();
            for v in beliefs.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
                assert!(v.is_finite());
            }
            hidden = Some(state);
        }
    }

    #[test]
    fn test_corrupt_hidden_state_is_rejected() {
        let dev = Device::Cpu;
        let gcm = engine(2, 4);
        // An edge referencing node 3 while only 1 node is valid.
        let bad = GraphState::from_parts(
            Tensor::zeros((1, 4, 2), DType::F32, &dev).unwrap(),
            Tensor::from_vec(vec![3i64, 0], (1, 2, 1), &dev).unwrap(),
            Tensor::ones((1, 1, 1), DType::F32, &dev).unwrap(),
            vec![1],
        )
        .unwrap();
        let x = obs(1, 1, 2, 1.0);
        assert!(matches!(
            gcm.step(&x, &[1], Some(bad)),
            Err(GcmError::InvalidHiddenState(_))
        ));
    }

    #[test]
    fn test_batch_mismatch_is_rejected() {
        let gcm = engine(2, 4);
        let x = obs(2, 1, 2, 1.0);
        assert!(gcm.step(&x, &[1], None).is_err());
    }
}
