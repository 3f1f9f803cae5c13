//! Batched graph memory state
//!
//! The state is an arena: node storage is allocated once at the configured
//! capacity and never resized, with the per-element watermark `t` marking
//! how many rows hold real observations. Edge storage grows along its last
//! dimension; unused slots carry the sentinel index `-1` and are filtered
//! before any graph computation.
//!
//! Node rows always hold the raw (pre-preprocessing) observations, so the
//! original inputs stay reconstructable from the state alone.

use candle_core::{DType, Device, IndexOp, Tensor};

use crate::error::GcmError;
use crate::GcmResult;

/// Sentinel marking an unused edge slot.
pub const EDGE_SENTINEL: i64 = -1;

/// Fill value for weight slots paired with sentinel edges.
pub const WEIGHT_FILL: f64 = 1.0;

/// Recurrent graph memory state for a batch of independent episodes.
///
/// Layout:
/// - `nodes`: `[B, N, feat]` f32, rows `[0, t[b])` real, the rest zero
/// - `edges`: `[B, 2, E]` i64, row 0 sinks, row 1 sources, `-1` sentinel
/// - `weights`: `[B, 1, E]` f32, paired slot-for-slot with `edges`
/// - `t`: valid-node count per element
///
/// The memory engine is the only mutator. Callers that hold a state across
/// steps receive fresh tensors each step (copy-on-write insertion), so a
/// previously returned state is never modified behind their back.
#[derive(Debug, Clone)]
pub struct GraphState {
    nodes: Tensor,
    edges: Tensor,
    weights: Tensor,
    t: Vec<usize>,
}

impl GraphState {
    /// Empty state: zero nodes, no edges, `t = 0` everywhere.
    pub fn zeros(
        batch_size: usize,
        graph_size: usize,
        feat: usize,
        device: &Device,
    ) -> GcmResult<Self> {
        Ok(Self {
            nodes: Tensor::zeros((batch_size, graph_size, feat), DType::F32, device)?,
            edges: Tensor::zeros((batch_size, 2, 0), DType::I64, device)?,
            weights: Tensor::zeros((batch_size, 1, 0), DType::F32, device)?,
            t: vec![0; batch_size],
        })
    }

    /// Assemble a state from its raw parts, checking shape agreement.
    pub fn from_parts(
        nodes: Tensor,
        edges: Tensor,
        weights: Tensor,
        t: Vec<usize>,
    ) -> GcmResult<Self> {
        let (b, _, _) = nodes.dims3()?;
        let (eb, two, e) = edges.dims3()?;
        let (wb, one, we) = weights.dims3()?;
        if two != 2 || one != 1 {
            return Err(GcmError::InvalidHiddenState(format!(
                "edges must be [B,2,E] and weights [B,1,E], got [{eb},{two},{e}] and [{wb},{one},{we}]"
            )));
        }
        if eb != b || wb != b || t.len() != b {
            return Err(GcmError::InvalidHiddenState(format!(
                "batch dims disagree: nodes {b}, edges {eb}, weights {wb}, t {}",
                t.len()
            )));
        }
        if e != we {
            return Err(GcmError::InvalidHiddenState(format!(
                "edges hold {e} slots but weights hold {we}"
            )));
        }
        Ok(Self {
            nodes,
            edges,
            weights,
            t,
        })
    }

    pub fn nodes(&self) -> &Tensor {
        &self.nodes
    }

    pub fn edges(&self) -> &Tensor {
        &self.edges
    }

    pub fn weights(&self) -> &Tensor {
        &self.weights
    }

    pub fn t(&self) -> &[usize] {
        &self.t
    }

    pub fn batch_size(&self) -> usize {
        self.t.len()
    }

    /// Node capacity `N` of each element's arena.
    pub fn capacity(&self) -> usize {
        self.nodes.dims3().map(|(_, n, _)| n).unwrap_or(0)
    }

    pub fn feat_size(&self) -> usize {
        self.nodes.dims3().map(|(_, _, f)| f).unwrap_or(0)
    }

    /// Number of edge slots currently allocated per element (including
    /// sentinel slots).
    pub fn edge_capacity(&self) -> usize {
        self.edges.dims3().map(|(_, _, e)| e).unwrap_or(0)
    }

    /// Check the structural invariants: every non-sentinel edge endpoint
    /// lies in `[0, t[b])` and every watermark fits the arena.
    pub fn validate(&self) -> GcmResult<()> {
        let n = self.capacity();
        for (b, &tb) in self.t.iter().enumerate() {
            if tb > n {
                return Err(GcmError::InvalidHiddenState(format!(
                    "element {b} claims {tb} valid nodes but capacity is {n}"
                )));
            }
        }
        for (b, element) in self.edge_lists()?.iter().enumerate() {
            for &(sink, source) in element {
                let bound = self.t[b] as i64;
                if sink < 0 || source < 0 || sink >= bound || source >= bound {
                    return Err(GcmError::InvalidHiddenState(format!(
                        "element {b} edge ({sink}, {source}) outside valid range [0, {bound})"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Per-element (sink, source) pairs with sentinel slots filtered out.
    pub fn edge_lists(&self) -> GcmResult<Vec<Vec<(i64, i64)>>> {
        let raw = self.edges.to_vec3::<i64>()?;
        Ok(raw
            .iter()
            .map(|element| {
                element[0]
                    .iter()
                    .zip(&element[1])
                    .filter(|(&s, &src)| s != EDGE_SENTINEL && src != EDGE_SENTINEL)
                    .map(|(&s, &src)| (s, src))
                    .collect()
            })
            .collect())
    }

    /// Per-element (sink, source, weight) triples, sentinel slots filtered.
    /// Reads weight values out of the tensor, so this is a test and
    /// transport aid, not a gradient path.
    pub fn edge_triples(&self) -> GcmResult<Vec<Vec<(i64, i64, f32)>>> {
        let raw = self.edges.to_vec3::<i64>()?;
        let w = self.weights.to_vec3::<f32>()?;
        let mut out = Vec::with_capacity(raw.len());
        for b in 0..raw.len() {
            let mut element = Vec::new();
            for i in 0..raw[b][0].len() {
                let (sink, source) = (raw[b][0][i], raw[b][1][i]);
                if sink != EDGE_SENTINEL && source != EDGE_SENTINEL {
                    element.push((sink, source, w[b][0][i]));
                }
            }
            out.push(element);
        }
        Ok(out)
    }

    /// Write the first `taus[b]` rows of `x[b]` into node rows
    /// `[t[b], t[b]+taus[b])`. Builds fresh node tensors rather than
    /// writing in place, so states handed out earlier stay stable.
    pub(crate) fn write_new_nodes(&mut self, x: &Tensor, taus: &[usize]) -> GcmResult<()> {
        let (b, n, feat) = self.nodes.dims3()?;
        let mut rows = Vec::with_capacity(b);
        for batch in 0..b {
            let tau = taus[batch];
            if tau == 0 {
                rows.push(self.nodes.i(batch)?);
                continue;
            }
            let t = self.t[batch];
            let fresh = x.i(batch)?.narrow(0, 0, tau)?;
            let mut parts: Vec<Tensor> = Vec::with_capacity(3);
            if t > 0 {
                parts.push(self.nodes.i(batch)?.narrow(0, 0, t)?);
            }
            parts.push(fresh);
            if t + tau < n {
                parts.push(Tensor::zeros((n - t - tau, feat), DType::F32, x.device())?);
            }
            rows.push(Tensor::cat(&parts, 0)?);
        }
        self.nodes = Tensor::stack(&rows, 0)?;
        Ok(())
    }

    /// Replace the edge set. `new_edges` and `new_weights` must agree on
    /// their slot count; selectors use this after appending their output.
    pub(crate) fn set_edges(&mut self, edges: Tensor, weights: Tensor) -> GcmResult<()> {
        let (_, _, e) = edges.dims3()?;
        let (_, _, we) = weights.dims3()?;
        if e != we {
            return Err(GcmError::InvalidHiddenState(format!(
                "edge/weight slot counts diverged: {e} vs {we}"
            )));
        }
        self.edges = edges;
        self.weights = weights;
        Ok(())
    }

    pub(crate) fn advance_t(&mut self, taus: &[usize]) {
        for (tb, tau) in self.t.iter_mut().zip(taus) {
            *tb += tau;
        }
    }

    /// Evict the oldest nodes of any element whose arena cannot fit its
    /// incoming `taus[b]` rows. For an overflowing element the node rows
    /// shift left by the overflow amount `k`, the vacated tail rows are
    /// zeroed, every edge endpoint is renumbered down by `k` (edges that
    /// referenced an evicted row become sentinel), and `t[b]` drops by `k`.
    /// Non-overflowing elements are untouched.
    pub fn wrap_overflow(&mut self, taus: &[usize]) -> GcmResult<()> {
        let (b, n, feat) = self.nodes.dims3()?;
        if let Some(bad) = taus.iter().position(|&tau| tau > n) {
            return Err(GcmError::InvalidParameter(format!(
                "element {bad} inserts {} timesteps but the arena holds only {n}",
                taus[bad]
            )));
        }
        let shifts: Vec<usize> = (0..b)
            .map(|batch| (self.t[batch] + taus[batch]).saturating_sub(n))
            .collect();
        if shifts.iter().all(|&k| k == 0) {
            return Ok(());
        }

        let mut rows = Vec::with_capacity(b);
        for batch in 0..b {
            let k = shifts[batch];
            if k == 0 {
                rows.push(self.nodes.i(batch)?);
                continue;
            }
            let kept = self.nodes.i(batch)?.narrow(0, k, n - k)?;
            let vacated = Tensor::zeros((k, feat), DType::F32, self.nodes.device())?;
            rows.push(Tensor::cat(&[&kept, &vacated], 0)?);
            self.t[batch] -= k;
        }
        self.nodes = Tensor::stack(&rows, 0)?;

        // Renumber edges on the host; sentinel out anything that pointed at
        // an evicted row. Weight slots stay in place so the pairing (and
        // any gradient path through the weights) survives.
        let e = self.edge_capacity();
        if e > 0 {
            let raw = self.edges.to_vec3::<i64>()?;
            let mut flat = Vec::with_capacity(b * 2 * e);
            for batch in 0..b {
                let k = shifts[batch] as i64;
                for row in 0..2 {
                    for slot in 0..e {
                        let sink = raw[batch][0][slot];
                        let source = raw[batch][1][slot];
                        let dropped = sink == EDGE_SENTINEL
                            || source == EDGE_SENTINEL
                            || sink < k
                            || source < k;
                        flat.push(if dropped {
                            EDGE_SENTINEL
                        } else {
                            raw[batch][row][slot] - k
                        });
                    }
                }
            }
            self.edges = Tensor::from_vec(flat, (b, 2, e), self.edges.device())?;
        }
        Ok(())
    }
}
