//! Positional encoding over node indices
//!
//! The graph alone carries no notion of order. A deterministic sinusoidal
//! signal keyed by node index gives the GNN a temporal ordering to
//! exploit, either summed onto the features or appended as extra columns.

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::GcmError;
use crate::GcmResult;

/// How the positional signal is combined with node features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PositionalMode {
    #[default]
    Off,
    /// Sum the signal onto the features (signal width = feature width).
    Add,
    /// Append the signal as extra feature columns.
    Cat,
}

/// Sinusoidal position table over node indices `[0, max_len)`.
#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    mode: PositionalMode,
    dim: usize,
    table: Tensor,
}

impl PositionalEncoding {
    /// `dim` is the signal width: the node feature width for
    /// [`PositionalMode::Add`], the number of appended columns for
    /// [`PositionalMode::Cat`].
    pub fn new(
        max_len: usize,
        mode: PositionalMode,
        dim: usize,
        device: &Device,
    ) -> GcmResult<Self> {
        if dim == 0 {
            return Err(GcmError::InvalidParameter(
                "positional encoding width must be nonzero".into(),
            ));
        }
        let mut table = vec![0f32; max_len * dim];
        for pos in 0..max_len {
            for i in 0..dim {
                let exponent = (2 * (i / 2)) as f64 / dim as f64;
                let angle = pos as f64 / 10000f64.powf(exponent);
                table[pos * dim + i] = if i % 2 == 0 {
                    angle.sin() as f32
                } else {
                    angle.cos() as f32
                };
            }
        }
        Ok(Self {
            mode,
            dim,
            table: Tensor::from_vec(table, (max_len, dim), device)?,
        })
    }

    pub fn mode(&self) -> PositionalMode {
        self.mode
    }

    /// Feature width after encoding, given the incoming width.
    pub fn output_width(&self, feat: usize) -> usize {
        match self.mode {
            PositionalMode::Off | PositionalMode::Add => feat,
            PositionalMode::Cat => feat + self.dim,
        }
    }

    /// Apply to `[B, N, feat]` node features. Encodings are keyed by the
    /// node's current arena index, so after an eviction shift every
    /// surviving node picks up the encoding of its new position.
    pub fn apply(&self, nodes: &Tensor) -> GcmResult<Tensor> {
        let (b, n, feat) = nodes.dims3()?;
        match self.mode {
            PositionalMode::Off => Ok(nodes.clone()),
            PositionalMode::Add => {
                if feat != self.dim {
                    return Err(GcmError::DimensionMismatch {
                        expected: self.dim,
                        got: feat,
                    });
                }
                let signal = self.table.narrow(0, 0, n)?.unsqueeze(0)?;
                Ok(nodes.broadcast_add(&signal)?)
            }
            PositionalMode::Cat => {
                let signal = self
                    .table
                    .narrow(0, 0, n)?
                    .unsqueeze(0)?
                    .broadcast_as((b, n, self.dim))?
                    .contiguous()?;
                Ok(Tensor::cat(&[nodes, &signal], 2)?)
            }
        }
    }
}
