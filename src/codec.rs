//! Hidden-state packing and flattening
//!
//! The true per-element edge count is ragged, but recurrent state must
//! cross training-step boundaries as fixed-size tensors. [`pack`] squeezes
//! a state into a capacity-bounded transport form (lossy past `max_edges`,
//! with a warning on every truncation); [`unpack`] restores a working
//! state, deduplicating edges so repeated pack/unpack cycles are
//! idempotent up to the capacity bound. [`flatten_edges`] re-offsets the
//! per-element edge lists into the disjoint-union index space the GNN
//! consumes.
//!
//! Weight slots are always moved with gradient-preserving tensor ops
//! (`index_select` and `cat`), never rebuilt from host values, so learned
//! edge values keep their backward path across a flatten.

use std::collections::BTreeMap;

use candle_core::{DType, IndexOp, Tensor};

use crate::indexing::batch_offsets;
use crate::state::{GraphState, EDGE_SENTINEL, WEIGHT_FILL};
use crate::GcmResult;

/// Re-offset every element's edges into the flat disjoint-union index
/// space, filter sentinel slots, and coalesce duplicate (sink, source)
/// pairs keeping the minimum weight. Output is sorted by flat sink then
/// source, which groups edges by batch element.
///
/// `taus` widens each element's valid range to `[0, t[b] + taus[b])`,
/// matching the mid-step state in which freshly inserted nodes already
/// carry edges. Returns `([2, E], [E])`.
pub fn flatten_edges(state: &GraphState, taus: &[usize]) -> GcmResult<(Tensor, Tensor)> {
    let device = state.edges().device();
    let e = state.edge_capacity();
    let t = state.t();
    let offsets = batch_offsets(t, taus);

    // key: (flat sink, flat source) -> (weight value, flat weight slot)
    let mut best: BTreeMap<(i64, i64), (f32, u32)> = BTreeMap::new();
    if e > 0 {
        let raw = state.edges().to_vec3::<i64>()?;
        let w = state.weights().to_vec3::<f32>()?;
        for b in 0..state.batch_size() {
            let valid = (t[b] + taus[b]) as i64;
            let offset = offsets[b] as i64;
            for slot in 0..e {
                let (sink, source) = (raw[b][0][slot], raw[b][1][slot]);
                if sink == EDGE_SENTINEL || source == EDGE_SENTINEL {
                    continue;
                }
                if sink >= valid || source >= valid || sink < 0 || source < 0 {
                    continue;
                }
                let key = (sink + offset, source + offset);
                let value = w[b][0][slot];
                let candidate = (value, (b * e + slot) as u32);
                best.entry(key)
                    .and_modify(|cur| {
                        if value < cur.0 {
                            *cur = candidate;
                        }
                    })
                    .or_insert(candidate);
            }
        }
    }

    let count = best.len();
    if count == 0 {
        return Ok((
            Tensor::zeros((2, 0), DType::I64, device)?,
            Tensor::zeros((0,), DType::F32, device)?,
        ));
    }

    let mut sinks = Vec::with_capacity(count);
    let mut sources = Vec::with_capacity(count);
    let mut slots = Vec::with_capacity(count);
    for (&(sink, source), &(_, slot)) in &best {
        sinks.push(sink);
        sources.push(source);
        slots.push(slot);
    }
    sinks.extend(sources);
    let flat_edges = Tensor::from_vec(sinks, (2, count), device)?;

    let slot_t = Tensor::from_vec(slots, (count,), device)?;
    let flat_weights = state
        .weights()
        .reshape((state.batch_size() * e,))?
        .index_select(&slot_t, 0)?;
    Ok((flat_edges, flat_weights))
}

/// Pack a state into fixed transport capacity: exactly `max_edges` edge
/// slots per element, left-filled with the element's real edges and
/// sentinel-padded. When an element holds more real edges than fit, the
/// oldest are dropped and the loss is logged; callers should size
/// `max_edges` generously.
pub fn pack(state: &GraphState, max_edges: usize) -> GcmResult<GraphState> {
    let device = state.edges().device();
    let b = state.batch_size();
    let e = state.edge_capacity();
    let raw = if e > 0 {
        state.edges().to_vec3::<i64>()?
    } else {
        vec![vec![vec![], vec![]]; b]
    };

    let mut flat = Vec::with_capacity(b * 2 * max_edges);
    let mut weight_rows = Vec::with_capacity(b);
    for batch in 0..b {
        let valid = state.t()[batch] as i64;
        let mut kept: Vec<usize> = (0..e)
            .filter(|&slot| {
                let (sink, source) = (raw[batch][0][slot], raw[batch][1][slot]);
                sink >= 0 && source >= 0 && sink < valid && source < valid
            })
            .collect();
        if kept.len() > max_edges {
            let dropped = kept.len() - max_edges;
            log::warn!(
                "element {batch} holds {} edges but transport capacity is {max_edges}; \
                 dropping the {dropped} oldest",
                kept.len()
            );
            kept.drain(..dropped);
        }

        for row in 0..2 {
            for slot in 0..max_edges {
                flat.push(match kept.get(slot) {
                    Some(&src_slot) => raw[batch][row][src_slot],
                    None => EDGE_SENTINEL,
                });
            }
        }

        let element_weights = state.weights().i(batch)?.squeeze(0)?;
        let mut parts: Vec<Tensor> = Vec::with_capacity(2);
        if !kept.is_empty() {
            let idx: Vec<u32> = kept.iter().map(|&s| s as u32).collect();
            let idx_t = Tensor::from_vec(idx, (kept.len(),), device)?;
            parts.push(element_weights.index_select(&idx_t, 0)?);
        }
        if kept.len() < max_edges {
            parts.push(Tensor::full(
                WEIGHT_FILL as f32,
                (max_edges - kept.len(),),
                device,
            )?);
        }
        weight_rows.push(Tensor::cat(&parts, 0)?);
    }

    GraphState::from_parts(
        state.nodes().clone(),
        Tensor::from_vec(flat, (b, 2, max_edges), device)?,
        Tensor::stack(&weight_rows, 0)?.unsqueeze(1)?,
        state.t().to_vec(),
    )
}

/// Restore a packed state into working form: sentinel slots dropped,
/// duplicate (sink, source) pairs coalesced keeping the minimum weight,
/// slots re-padded to the largest surviving per-element count. Applying
/// [`pack`] then [`unpack`] returns the original edge set whenever every
/// element's deduplicated count fits the transport capacity.
pub fn unpack(state: &GraphState) -> GcmResult<GraphState> {
    let device = state.edges().device();
    let b = state.batch_size();
    let e = state.edge_capacity();
    let raw = if e > 0 {
        state.edges().to_vec3::<i64>()?
    } else {
        vec![vec![vec![], vec![]]; b]
    };
    let w = if e > 0 {
        state.weights().to_vec3::<f32>()?
    } else {
        vec![vec![vec![]]; b]
    };

    // Deduplicate per element, remembering the winning slot per pair.
    let mut survivors: Vec<Vec<((i64, i64), u32)>> = Vec::with_capacity(b);
    for batch in 0..b {
        let mut best: BTreeMap<(i64, i64), (f32, u32)> = BTreeMap::new();
        for slot in 0..e {
            let (sink, source) = (raw[batch][0][slot], raw[batch][1][slot]);
            if sink == EDGE_SENTINEL || source == EDGE_SENTINEL {
                continue;
            }
            let value = w[batch][0][slot];
            let candidate = (value, (batch * e + slot) as u32);
            best.entry((sink, source))
                .and_modify(|cur| {
                    if value < cur.0 {
                        *cur = candidate;
                    }
                })
                .or_insert(candidate);
        }
        survivors.push(
            best.into_iter()
                .map(|(key, (_, slot))| (key, slot))
                .collect(),
        );
    }

    let capacity = survivors.iter().map(Vec::len).max().unwrap_or(0);
    let mut flat = Vec::with_capacity(b * 2 * capacity);
    let mut weight_rows = Vec::with_capacity(b);
    let all_weights = if e > 0 {
        state.weights().reshape((b * e,))?
    } else {
        Tensor::zeros((0,), DType::F32, device)?
    };
    for element in &survivors {
        for row in 0..2 {
            for slot in 0..capacity {
                flat.push(match element.get(slot) {
                    Some(&((sink, source), _)) => {
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
        let mut parts: Vec<Tensor> = Vec::with_capacity(2);
        if !element.is_empty() {
            let idx: Vec<u32> = element.iter().map(|&(_, slot)| slot).collect();
            let idx_t = Tensor::from_vec(idx, (element.len(),), device)?;
            parts.push(all_weights.index_select(&idx_t, 0)?);
        }
        if element.len() < capacity {
            parts.push(Tensor::full(
                WEIGHT_FILL as f32,
                (capacity - element.len(),),
                device,
            )?);
        }
        weight_rows.push(if parts.is_empty() {
            Tensor::zeros((0,), DType::F32, device)?
        } else {
            Tensor::cat(&parts, 0)?
        });
    }

    GraphState::from_parts(
        state.nodes().clone(),
        Tensor::from_vec(flat, (b, 2, capacity), device)?,
        Tensor::stack(&weight_rows, 0)?.unsqueeze(1)?,
        state.t().to_vec(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn state(t: Vec<usize>, edges: Vec<Vec<(i64, i64, f32)>>) -> GraphState {
        let dev = Device::Cpu;
        let b = t.len();
        let e = edges.iter().map(Vec::len).max().unwrap_or(0);
        let mut flat = Vec::new();
        let mut w = Vec::new();
        for element in &edges {
            for row in 0..2 {
                for slot in 0..e {
                    flat.push(match element.get(slot) {
                        Some(&(sink, source, _)) => {
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
            for slot in 0..e {
                w.push(element.get(slot).map(|&(_, _, v)| v).unwrap_or(1.0));
            }
        }
        GraphState::from_parts(
            Tensor::zeros((b, 8, 2), DType::F32, &dev).unwrap(),
            Tensor::from_vec(flat, (b, 2, e), &dev).unwrap(),
            Tensor::from_vec(w, (b, 1, e), &dev).unwrap(),
            t,
        )
        .unwrap()
    }

    #[test]
    fn test_flatten_offsets_and_dedups() {
        let s = state(
            vec![3, 2],
            vec![
                vec![(1, 0, 2.0), (1, 0, 0.5), (2, 1, 1.0)],
                vec![(1, 0, 1.0)],
            ],
        );
        let (edges, weights) = flatten_edges(&s, &[0, 0]).unwrap();
        let e = edges.to_vec2::<i64>().unwrap();
        // Element 1's nodes start at flat offset 3.
        assert_eq!(e[0], vec![1, 2, 4]);
        assert_eq!(e[1], vec![0, 1, 3]);
        // Duplicate (1,0) kept the minimum weight.
        assert_eq!(weights.to_vec1::<f32>().unwrap(), vec![0.5, 1.0, 1.0]);
    }

    #[test]
    fn test_pack_unpack_round_trip() {
        let s = state(
            vec![4, 3],
            vec![
                vec![(1, 0, 1.0), (2, 0, 0.25), (3, 2, 1.0)],
                vec![(2, 1, 0.75)],
            ],
        );
        let restored = unpack(&pack(&s, 5).unwrap()).unwrap();
        assert_eq!(
            restored.edge_triples().unwrap(),
            s.edge_triples().unwrap()
        );
        assert_eq!(restored.t(), s.t());
    }

    #[test]
    fn test_pack_truncates_oldest_first() {
        let s = state(
            vec![4],
            vec![vec![(1, 0, 1.0), (2, 1, 1.0), (3, 1, 1.0)]],
        );
        let packed = pack(&s, 2).unwrap();
        assert_eq!(packed.edge_capacity(), 2);
        // The oldest edge (1,0) is the casualty.
        assert_eq!(
            packed.edge_triples().unwrap()[0],
            vec![(2, 1, 1.0), (3, 1, 1.0)]
        );
    }

    #[test]
    fn test_repeated_cycles_are_idempotent() {
        let s = state(vec![3], vec![vec![(1, 0, 0.5), (2, 0, 1.0)]]);
        let once = unpack(&pack(&s, 4).unwrap()).unwrap();
        let twice = unpack(&pack(&once, 4).unwrap()).unwrap();
        assert_eq!(
            once.edge_triples().unwrap(),
            twice.edge_triples().unwrap()
        );
    }

    #[test]
    fn test_empty_state_round_trips() {
        let dev = Device::Cpu;
        let s = GraphState::zeros(2, 4, 2, &dev).unwrap();
        let packed = pack(&s, 3).unwrap();
        assert_eq!(packed.edge_capacity(), 3);
        let restored = unpack(&packed).unwrap();
        assert!(restored.edge_lists().unwrap().iter().all(Vec::is_empty));
    }
}
