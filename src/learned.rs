//! Differentiable edge discovery
//!
//! Scores every admissible (sink, source) pair with a small MLP, draws a
//! fixed number of relaxed-categorical samples per sink, unions the draws,
//! and hardens the result through a straight-through threshold. The
//! forward pass yields crisp {0,1} adjacency decisions; gradients flow
//! back through the soft scores into the scorer weights.
//!
//! Candidates are time-respecting by construction: a sink may only draw
//! edges from sources with a strictly smaller node index, optionally
//! limited to a trailing window to bound memory cost on long episodes.
//! The hardened adjacency is filtered back against the candidate set, so
//! no sampling noise can ever produce a forward-in-time edge.

use candle_core::Tensor;
use candle_nn::{layer_norm, linear, LayerNorm, Linear, Module, VarBuilder};
use rayon::prelude::*;

use crate::error::GcmError;
use crate::sampling::{gumbel_softmax_hard, hardmax, straight_through};
use crate::selector::{merge_new_edges, EdgeSelector};
use crate::GcmResult;

/// Logit floor marking non-candidate pairs in the dense score cube.
const SCORE_FLOOR: f32 = f32::MIN;

/// Cutoff for the deterministic (hardmax) sampling path.
const HARDMAX_CUTOFF: f32 = 0.2;

/// Pairwise edge scorer: logits(edge(sink, source)) from the concatenated
/// feature vectors of the two endpoints.
#[derive(Debug)]
struct EdgeScorer {
    l1: Linear,
    ln1: LayerNorm,
    l2: Linear,
    ln2: LayerNorm,
    l3: Linear,
}

impl EdgeScorer {
    fn new(input_size: usize, vb: VarBuilder) -> GcmResult<Self> {
        Ok(Self {
            l1: linear(2 * input_size, input_size, vb.pp("l1"))?,
            ln1: layer_norm(input_size, 1e-5, vb.pp("ln1"))?,
            l2: linear(input_size, input_size, vb.pp("l2"))?,
            ln2: layer_norm(input_size, 1e-5, vb.pp("ln2"))?,
            l3: linear(input_size, 1, vb.pp("l3"))?,
        })
    }

    fn forward(&self, pairs: &Tensor) -> GcmResult<Tensor> {
        let h = self.ln1.forward(&self.l1.forward(pairs)?.relu()?)?;
        let h = self.ln2.forward(&self.l2.forward(&h)?.relu()?)?;
        Ok(self.l3.forward(&h)?)
    }
}

/// Learned edge selector over temporal candidate pairs.
pub struct LearnedEdge {
    scorer: EdgeScorer,
    input_size: usize,
    num_edge_samples: usize,
    deterministic: bool,
    window: Option<usize>,
    temperature: f64,
}

impl LearnedEdge {
    /// `input_size` is the node feature width this selector will see;
    /// `num_edge_samples` bounds how many edges each sink may receive per
    /// call; `deterministic` switches from stochastic sampling to a
    /// thresholded softmax; `window` limits sources to
    /// `[sink - window, sink)`.
    pub fn new(
        input_size: usize,
        num_edge_samples: usize,
        deterministic: bool,
        window: Option<usize>,
        vb: VarBuilder,
    ) -> GcmResult<Self> {
        if input_size == 0 {
            return Err(GcmError::InvalidParameter(
                "learned edge selector needs a nonzero input size".into(),
            ));
        }
        if num_edge_samples == 0 {
            return Err(GcmError::InvalidParameter(
                "num_edge_samples must be at least 1".into(),
            ));
        }
        Ok(Self {
            scorer: EdgeScorer::new(input_size, vb.pp("edge_scorer"))?,
            input_size,
            num_edge_samples,
            deterministic,
            window,
            temperature: 1.0,
        })
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    fn is_candidate(&self, sink: usize, source: usize, valid: usize) -> bool {
        let lo = self.window.map_or(0, |w| sink.saturating_sub(w));
        sink < valid && source < sink && source >= lo
    }

    /// All admissible (batch, sink, source) triples, batch-major then
    /// sink- and source-ascending.
    fn candidates(&self, t: &[usize], taus: &[usize]) -> Vec<(usize, usize, usize)> {
        let window = self.window;
        t.par_iter()
            .zip(taus)
            .enumerate()
            .flat_map_iter(|(b, (&tb, &tau))| {
                let valid = tb + tau;
                (1..valid).flat_map(move |sink| {
                    let lo = window.map_or(0, |w| sink.saturating_sub(w));
                    (lo..sink).map(move |source| (b, sink, source))
                })
            })
            .collect()
    }
}

impl EdgeSelector for LearnedEdge {
    fn select(
        &self,
        nodes: &Tensor,
        edges: &Tensor,
        weights: &Tensor,
        t: &[usize],
        taus: &[usize],
    ) -> GcmResult<(Tensor, Tensor)> {
        let (bsz, capacity, feat) = nodes.dims3()?;
        if feat != self.input_size {
            return Err(GcmError::DimensionMismatch {
                expected: self.input_size,
                got: feat,
            });
        }

        let cands = self.candidates(t, taus);
        if cands.is_empty() {
            // Nothing selectable (every element holds at most one node).
            return Ok((edges.clone(), weights.clone()));
        }
        let n = t
            .iter()
            .zip(taus)
            .map(|(&tb, &tau)| tb + tau)
            .max()
            .unwrap_or(0);

        // Score each candidate pair from its endpoint features.
        let flat_nodes = nodes.reshape((bsz * capacity, feat))?;
        let sink_idx: Vec<u32> = cands
            .iter()
            .map(|&(b, s, _)| (b * capacity + s) as u32)
            .collect();
        let source_idx: Vec<u32> = cands
            .iter()
            .map(|&(b, _, src)| (b * capacity + src) as u32)
            .collect();
        let device = nodes.device();
        let sink_t = Tensor::from_vec(sink_idx, (cands.len(),), device)?;
        let source_t = Tensor::from_vec(source_idx, (cands.len(),), device)?;
        let pairs = Tensor::cat(
            &[
                &flat_nodes.index_select(&sink_t, 0)?,
                &flat_nodes.index_select(&source_t, 0)?,
            ],
            1,
        )?;
        let logits = self.scorer.forward(&pairs)?.squeeze(1)?;

        // Scatter logits into a dense [B, n, n] score cube with every
        // non-candidate position absorbed at the floor, then sample a
        // source distribution per sink.
        let cube = bsz * n * n;
        let positions: Vec<u32> = cands
            .iter()
            .map(|&(b, s, src)| (b * n * n + s * n + src) as u32)
            .collect();
        let positions_t = Tensor::from_vec(positions.clone(), (cands.len(),), device)?;
        let mut floor = vec![SCORE_FLOOR; cube];
        for &p in &positions {
            floor[p as usize] = 0.0;
        }
        let floor_t = Tensor::from_vec(floor, (cube,), device)?;
        let zeros = Tensor::zeros((cube,), logits.dtype(), device)?;
        let scattered = zeros.index_add(&positions_t, &logits, 0)?;
        let scores = (scattered + floor_t)?.reshape((bsz, n, n))?;

        let adj = if self.deterministic {
            hardmax(&scores, HARDMAX_CUTOFF)?
        } else {
            let mut union: Option<Tensor> = None;
            for _ in 0..self.num_edge_samples {
                let draw = gumbel_softmax_hard(&scores, self.temperature)?;
                union = Some(match union {
                    None => draw,
                    Some(u) => (u + draw)?,
                });
            }
            straight_through(&union.unwrap(), 0.0)?
        };

        // Harvest the fired entries, keeping only real candidates. Sinks
        // with no admissible source get a uniform draw from the floor
        // rows; those land outside the candidate set and are dropped here,
        // as are self edges.
        let fired = adj.to_vec3::<f32>()?;
        let mut kept_positions: Vec<u32> = Vec::new();
        let mut new_edges: Vec<Vec<(i64, i64)>> = vec![Vec::new(); bsz];
        let mut counts = vec![0usize; bsz];
        for b in 0..bsz {
            let valid = t[b] + taus[b];
            for sink in 0..n {
                for source in 0..n {
                    if fired[b][sink][source] > 0.0 && self.is_candidate(sink, source, valid) {
                        new_edges[b].push((sink as i64, source as i64));
                        kept_positions.push((b * n * n + sink * n + source) as u32);
                        counts[b] += 1;
                    }
                }
            }
        }
        if kept_positions.is_empty() {
            return Ok((edges.clone(), weights.clone()));
        }

        // Edge values come straight out of the hardened adjacency so the
        // soft-score gradient path survives into the weights.
        let flat_adj = adj.reshape((cube,))?;
        let kept_t = Tensor::from_vec(kept_positions, (counts.iter().sum::<usize>(),), device)?;
        let values = flat_adj.index_select(&kept_t, 0)?;
        let mut weight_rows = Vec::with_capacity(bsz);
        let mut offset = 0;
        for &count in &counts {
            if count > 0 {
                weight_rows.push(values.narrow(0, offset, count)?);
            } else {
                weight_rows.push(Tensor::ones((1,), values.dtype(), device)?);
            }
            offset += count;
        }

        merge_new_edges(edges, weights, &new_edges, Some(&weight_rows))
    }
}
