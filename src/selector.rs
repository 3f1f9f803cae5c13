//! Pluggable edge selection
//!
//! An edge selector inspects the current nodes and edge set and returns an
//! extended edge set for the newly inserted nodes. Selectors compose as an
//! explicit list of stages with a uniform call signature; the engine runs
//! one chain on raw observation features (human-interpretable priors) and
//! an auxiliary chain after preprocessing and positional encoding (learned
//! priors, whose inputs no longer need to be readable).

use candle_core::{DType, Tensor};

use crate::state::{EDGE_SENTINEL, WEIGHT_FILL};
use crate::GcmResult;

/// Capability interface for edge selection stages.
///
/// Implementations receive the full batched state and return the merged
/// `(edges, weights)` pair, slot counts in lock-step. A selector that has
/// nothing to add returns its inputs unchanged; it must not error on
/// degenerate graphs (for instance a single node with no possible edge).
pub trait EdgeSelector {
    fn select(
        &self,
        nodes: &Tensor,
        edges: &Tensor,
        weights: &Tensor,
        t: &[usize],
        taus: &[usize],
    ) -> GcmResult<(Tensor, Tensor)>;
}

/// Run a chain of selectors in order, feeding each stage the previous
/// stage's output.
pub fn run_chain(
    selectors: &[Box<dyn EdgeSelector>],
    nodes: &Tensor,
    edges: &Tensor,
    weights: &Tensor,
    t: &[usize],
    taus: &[usize],
) -> GcmResult<(Tensor, Tensor)> {
    let mut edges = edges.clone();
    let mut weights = weights.clone();
    for selector in selectors {
        let (e, w) = selector.select(nodes, &edges, &weights, t, taus)?;
        edges = e;
        weights = w;
    }
    Ok((edges, weights))
}

/// Append per-element new edges (ragged) onto a `[B, 2, E]` edge tensor,
/// padding shorter elements with the sentinel. Weight slots for padded
/// entries carry the fill value; real entries take the supplied
/// gradient-carrying weight rows, or 1.0 when `new_weights` is absent.
pub(crate) fn merge_new_edges(
    edges: &Tensor,
    weights: &Tensor,
    new_edges: &[Vec<(i64, i64)>],
    new_weights: Option<&[Tensor]>,
) -> GcmResult<(Tensor, Tensor)> {
    let b = new_edges.len();
    let ne = new_edges.iter().map(Vec::len).max().unwrap_or(0);
    if ne == 0 {
        return Ok((edges.clone(), weights.clone()));
    }
    let device = edges.device();

    let mut flat = Vec::with_capacity(b * 2 * ne);
    for element in new_edges {
        for row in 0..2 {
            for slot in 0..ne {
                flat.push(match element.get(slot) {
                    Some(&(sink, source)) => {
                        if row == 0 {
                            sink
                        } else {
                            source
                        }
                    }
                    None => EDGE_SENTINEL,
                });
            }
        }
    }
    let appended = Tensor::from_vec(flat, (b, 2, ne), device)?;

    let mut weight_rows = Vec::with_capacity(b);
    for batch in 0..b {
        let real = new_edges[batch].len();
        let mut parts: Vec<Tensor> = Vec::with_capacity(2);
        if real > 0 {
            match new_weights {
                Some(rows) => parts.push(rows[batch].narrow(0, 0, real)?),
                None => parts.push(Tensor::ones((real,), DType::F32, device)?),
            }
        }
        if ne > real {
            let fill = Tensor::full(WEIGHT_FILL as f32, (ne - real,), device)?;
            parts.push(fill);
        }
        weight_rows.push(Tensor::cat(&parts, 0)?);
    }
    let appended_weights = Tensor::stack(&weight_rows, 0)?.unsqueeze(1)?;

    Ok((
        Tensor::cat(&[edges, &appended], 2)?,
        Tensor::cat(&[weights, &appended_weights], 2)?,
    ))
}

/// Rule-based temporal prior: every newly inserted node receives an edge
/// from its immediate predecessor, giving the graph a chain backbone the
/// GNN can always follow.
#[derive(Debug, Clone, Default)]
pub struct TemporalBackedge;

impl EdgeSelector for TemporalBackedge {
    fn select(
        &self,
        _nodes: &Tensor,
        edges: &Tensor,
        weights: &Tensor,
        t: &[usize],
        taus: &[usize],
    ) -> GcmResult<(Tensor, Tensor)> {
        let new_edges: Vec<Vec<(i64, i64)>> = t
            .iter()
            .zip(taus)
            .map(|(&tb, &tau)| {
                (tb.max(1)..tb + tau)
                    .map(|i| (i as i64, i as i64 - 1))
                    .collect()
            })
            .collect();
        merge_new_edges(edges, weights, &new_edges, None)
    }
}
