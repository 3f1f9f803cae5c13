//! Index arithmetic for ragged batched graphs
//!
//! Every batch element owns a graph with its own valid-node count `t[b]`
//! and its own number of newly inserted timesteps `taus[b]`. Running a
//! single GNN pass over the whole batch requires concatenating the
//! per-element node ranges into one disjoint-union graph, and later
//! scattering the results back into zero-padded form. The functions here
//! compute the index sets for both directions.
//!
//! All functions are pure: they never mutate their inputs, and callers
//! rely on the exact output ordering (batch-major, then index-ascending).

use candle_core::Tensor;

use crate::GcmResult;

/// Starting offset of each batch element's node range in the flattened
/// disjoint-union graph.
///
/// `offsets[0] = 0`, `offsets[b] = sum of (t[i] + taus[i]) for i < b`.
pub fn batch_offsets(t: &[usize], taus: &[usize]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(t.len());
    let mut acc = 0;
    for b in 0..t.len() {
        offsets.push(acc);
        acc += t[b] + taus[b];
    }
    offsets
}

/// (batch, node-index) pairs for the nodes inserted this call: indices
/// `[t[b], t[b] + taus[b])` for each element, batch-major ascending.
pub fn new_node_idxs(t: &[usize], taus: &[usize]) -> (Vec<usize>, Vec<usize>) {
    let total: usize = taus.iter().sum();
    let mut batch_idxs = Vec::with_capacity(total);
    let mut node_idxs = Vec::with_capacity(total);
    for b in 0..t.len() {
        for i in t[b]..t[b] + taus[b] {
            batch_idxs.push(b);
            node_idxs.push(i);
        }
    }
    (batch_idxs, node_idxs)
}

/// (batch, node-index) pairs for every real node `[0, t[b] + taus[b])`,
/// batch-major ascending. These are the rows that participate in graph
/// propagation.
pub fn valid_node_idxs(t: &[usize], taus: &[usize]) -> (Vec<usize>, Vec<usize>) {
    let total: usize = t.iter().zip(taus).map(|(a, b)| a + b).sum();
    let mut batch_idxs = Vec::with_capacity(total);
    let mut node_idxs = Vec::with_capacity(total);
    for b in 0..t.len() {
        for i in 0..t[b] + taus[b] {
            batch_idxs.push(b);
            node_idxs.push(i);
        }
    }
    (batch_idxs, node_idxs)
}

/// (batch, within-chunk-offset) pairs identifying the real rows of a
/// zero-padded `[B, max(taus), feat]` tensor: offsets `[0, taus[b])` for
/// each element. Unlike [`new_node_idxs`] these are not shifted by `t`.
pub fn nonpadded_idxs(taus: &[usize]) -> (Vec<usize>, Vec<usize>) {
    let total: usize = taus.iter().sum();
    let mut batch_idxs = Vec::with_capacity(total);
    let mut chunk_idxs = Vec::with_capacity(total);
    for (b, &tau) in taus.iter().enumerate() {
        for i in 0..tau {
            batch_idxs.push(b);
            chunk_idxs.push(i);
        }
    }
    (batch_idxs, chunk_idxs)
}

/// Flat-graph row indices of the newly inserted nodes, in the same order
/// as [`new_node_idxs`]. Valid nodes are packed `[0, t[b]+taus[b])` per
/// element, so the new nodes of element `b` sit at
/// `offsets[b] + t[b] .. offsets[b] + t[b] + taus[b]`.
pub fn output_node_idxs(t: &[usize], taus: &[usize]) -> Vec<usize> {
    let offsets = batch_offsets(t, taus);
    let total: usize = taus.iter().sum();
    let mut idxs = Vec::with_capacity(total);
    for b in 0..t.len() {
        for i in 0..taus[b] {
            idxs.push(offsets[b] + t[b] + i);
        }
    }
    idxs
}

/// Scatter a flattened `[sum(taus), feat]` tensor into zero-padded
/// `[B, max(taus), feat]` form. The flat rows must be ordered batch-major
/// then time-ascending, which is exactly how the engine emits beliefs.
pub fn pad_to_dense(flat: &Tensor, taus: &[usize]) -> GcmResult<Tensor> {
    let (_, feat) = flat.dims2()?;
    let b = taus.len();
    let tau_max = taus.iter().copied().max().unwrap_or(0);
    let mut rows = Vec::with_capacity(b);
    let mut offset = 0;
    for &tau in taus {
        let real = if tau > 0 {
            Some(flat.narrow(0, offset, tau)?)
        } else {
            None
        };
        let row = match (real, tau_max - tau) {
            (Some(r), 0) => r,
            (Some(r), pad) => {
                let zeros = Tensor::zeros((pad, feat), flat.dtype(), flat.device())?;
                Tensor::cat(&[&r, &zeros], 0)?
            }
            (None, pad) => Tensor::zeros((pad, feat), flat.dtype(), flat.device())?,
        };
        rows.push(row);
        offset += tau;
    }
    Ok(Tensor::stack(&rows, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_batch_offsets() {
        assert_eq!(batch_offsets(&[2, 5], &[1, 2]), vec![0, 3]);
        assert_eq!(batch_offsets(&[0, 0, 0], &[4, 1, 2]), vec![0, 4, 5]);
        assert_eq!(batch_offsets(&[], &[]), Vec::<usize>::new());
    }

    #[test]
    fn test_new_node_idxs() {
        let (b_idxs, n_idxs) = new_node_idxs(&[2, 5], &[1, 2]);
        assert_eq!(b_idxs, vec![0, 1, 1]);
        assert_eq!(n_idxs, vec![2, 5, 6]);
    }

    #[test]
    fn test_valid_node_idxs_counts() {
        let (b_idxs, n_idxs) = valid_node_idxs(&[2, 1], &[1, 0]);
        assert_eq!(b_idxs, vec![0, 0, 0, 1]);
        assert_eq!(n_idxs, vec![0, 1, 2, 0]);
    }

    #[test]
    fn test_nonpadded_idxs() {
        let (b_idxs, c_idxs) = nonpadded_idxs(&[2, 3]);
        assert_eq!(b_idxs, vec![0, 0, 1, 1, 1]);
        assert_eq!(c_idxs, vec![0, 1, 0, 1, 2]);
    }

    #[test]
    fn test_output_node_idxs() {
        // Element 0 holds nodes [0,3), new ones at [2,3).
        // Element 1 holds nodes [3,10), new ones at [8,10).
        let idxs = output_node_idxs(&[2, 5], &[1, 2]);
        assert_eq!(idxs, vec![2, 8, 9]);
    }

    #[test]
    fn test_pad_to_dense() {
        let dev = Device::Cpu;
        let flat = Tensor::from_vec(vec![1f32, 2., 3., 4., 5., 6.], (3, 2), &dev).unwrap();
        let dense = pad_to_dense(&flat, &[1, 2]).unwrap();
        assert_eq!(dense.dims(), &[2, 2, 2]);
        let v = dense.to_vec3::<f32>().unwrap();
        assert_eq!(v[0][0], vec![1., 2.]);
        assert_eq!(v[0][1], vec![0., 0.]);
        assert_eq!(v[1][0], vec![3., 4.]);
        assert_eq!(v[1][1], vec![5., 6.]);
    }

    #[test]
    fn test_total_counts() {
        let t = [3, 0, 7];
        let taus = [2, 4, 0];
        assert_eq!(new_node_idxs(&t, &taus).0.len(), 6);
        assert_eq!(valid_node_idxs(&t, &taus).0.len(), 16);
        assert_eq!(nonpadded_idxs(&taus).0.len(), 6);
        assert_eq!(output_node_idxs(&t, &taus).len(), 6);
    }
}
