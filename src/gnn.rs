//! Graph neural network seam
//!
//! The memory engine treats message passing as an opaque function over a
//! flattened disjoint-union graph: node features `[M, in]`, edge index
//! `[2, E]` (row 0 sinks, row 1 sources), edge weights `[E]`. The
//! reference implementation is a weighted graph-convolution stack with a
//! bounded activation between layers; anything satisfying [`Gnn`] can be
//! plugged in instead.

use candle_core::{DType, IndexOp, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder};

use crate::error::GcmError;
use crate::GcmResult;

/// Opaque message-passing function over a flattened graph.
pub trait Gnn {
    fn forward(&self, x: &Tensor, edge_index: &Tensor, weights: &Tensor) -> GcmResult<Tensor>;

    /// Expected node feature width at the input.
    fn input_size(&self) -> usize;

    /// Node feature width produced at the output.
    fn output_size(&self) -> usize;
}

/// Single weighted graph convolution:
/// `x'_i = W_root x_i + W_neigh Σ_{(i,j) in E} w_ij x_j`.
#[derive(Debug)]
pub struct GraphConv {
    root: Linear,
    neigh: Linear,
    in_size: usize,
    out_size: usize,
}

impl GraphConv {
    pub fn new(in_size: usize, out_size: usize, vb: VarBuilder) -> GcmResult<Self> {
        Ok(Self {
            root: linear(in_size, out_size, vb.pp("root"))?,
            neigh: linear(in_size, out_size, vb.pp("neigh"))?,
            in_size,
            out_size,
        })
    }

    fn aggregate(&self, x: &Tensor, edge_index: &Tensor, weights: &Tensor) -> GcmResult<Tensor> {
        let (_, e) = edge_index.dims2()?;
        if e == 0 {
            return Ok(x.zeros_like()?);
        }
        let sinks = edge_index.i(0)?.to_dtype(DType::U32)?;
        let sources = edge_index.i(1)?.to_dtype(DType::U32)?;
        let messages = x
            .index_select(&sources, 0)?
            .broadcast_mul(&weights.unsqueeze(1)?)?;
        Ok(x.zeros_like()?.index_add(&sinks, &messages, 0)?)
    }

    pub fn forward(&self, x: &Tensor, edge_index: &Tensor, weights: &Tensor) -> GcmResult<Tensor> {
        let agg = self.aggregate(x, edge_index, weights)?;
        Ok((self.root.forward(x)? + self.neigh.forward(&agg)?)?)
    }
}

/// Stack of graph convolutions with `tanh` after every layer. The final
/// bounded activation keeps belief vectors finite under repeated
/// propagation.
#[derive(Debug)]
pub struct GraphConvStack {
    layers: Vec<GraphConv>,
}

impl GraphConvStack {
    /// `dims` lists the feature width at every boundary, so
    /// `&[64, 64, 64]` builds two convolutions.
    pub fn new(dims: &[usize], vb: VarBuilder) -> GcmResult<Self> {
        if dims.len() < 2 {
            return Err(GcmError::InvalidParameter(
                "a graph convolution stack needs at least one layer".into(),
            ));
        }
        let mut layers = Vec::with_capacity(dims.len() - 1);
        for (i, pair) in dims.windows(2).enumerate() {
            layers.push(GraphConv::new(
                pair[0],
                pair[1],
                vb.pp(format!("conv_{i}")),
            )?);
        }
        Ok(Self { layers })
    }
}

impl Gnn for GraphConvStack {
    fn forward(&self, x: &Tensor, edge_index: &Tensor, weights: &Tensor) -> GcmResult<Tensor> {
        let mut h = x.clone();
        for layer in &self.layers {
            h = layer.forward(&h, edge_index, weights)?.tanh()?;
        }
        Ok(h)
    }

    fn input_size(&self) -> usize {
        self.layers.first().map(|l| l.in_size).unwrap_or(0)
    }

    fn output_size(&self) -> usize {
        self.layers.last().map(|l| l.out_size).unwrap_or(0)
    }
}
