//! Relaxation primitives for discrete decisions under gradient descent
//!
//! Choosing graph edges is a discrete decision, but the edge scorer must
//! stay trainable end to end. The primitives here make that possible as an
//! explicit two-path operation: the forward value is a crisp {0,1}
//! decision, while the backward gradient follows the pre-hardening soft
//! scores. The composition `soft + (hard - soft).detach()` carries the
//! hard value forward and routes gradients through `soft` only.

use candle_core::{DType, Tensor, D};
use candle_nn::ops::softmax;

use crate::GcmResult;

/// Straight-through threshold: forward `(x > cutoff)` as f32, backward
/// identity into `x`.
pub fn straight_through(x: &Tensor, cutoff: f32) -> GcmResult<Tensor> {
    let hard = x.gt(cutoff)?.to_dtype(DType::F32)?;
    Ok(((hard - x)?.detach() + x)?)
}

/// Soft relaxed-categorical sample over the last axis.
///
/// Adds Gumbel noise `-ln(-ln u)` to the logits and applies a
/// temperature-scaled softmax. Rows whose logits are uniformly at the
/// floor value come out uniform; callers filter those downstream.
pub fn gumbel_softmax(logits: &Tensor, temperature: f64) -> GcmResult<Tensor> {
    let u = Tensor::rand(0f32, 1f32, logits.dims().to_vec(), logits.device())?;
    let gumbel = u
        .clamp(1e-10f32, 1f32)?
        .log()?
        .neg()?
        .clamp(1e-10f32, f32::MAX)?
        .log()?
        .neg()?;
    let noisy = ((logits + gumbel)? / temperature)?;
    Ok(softmax(&noisy, D::Minus1)?)
}

/// Hard relaxed-categorical sample: one-hot at the soft sample's argmax on
/// the forward pass, soft gradients on the backward pass.
pub fn gumbel_softmax_hard(logits: &Tensor, temperature: f64) -> GcmResult<Tensor> {
    let soft = gumbel_softmax(logits, temperature)?;
    let hard = one_hot_argmax(&soft)?;
    Ok(((hard - &soft)?.detach() + &soft)?)
}

/// Deterministic alternative to sampling: softmax over the last axis, then
/// a straight-through threshold at `cutoff`. Several entries may fire.
pub fn hardmax(logits: &Tensor, cutoff: f32) -> GcmResult<Tensor> {
    let soft = softmax(logits, D::Minus1)?;
    let hard = soft.gt(cutoff)?.to_dtype(DType::F32)?;
    Ok(((hard - &soft)?.detach() + &soft)?)
}

/// One-hot encoding of the argmax along the last axis, same shape as the
/// input. Built on the host; used only as the forward value of a
/// straight-through pair, so it carries no gradient of its own.
fn one_hot_argmax(x: &Tensor) -> GcmResult<Tensor> {
    let dims = x.dims().to_vec();
    let last = *dims.last().unwrap_or(&0);
    let idx: Vec<u32> = x.argmax(D::Minus1)?.flatten_all()?.to_vec1::<u32>()?;
    let mut hard = vec![0f32; idx.len() * last];
    for (row, &i) in idx.iter().enumerate() {
        hard[row * last + i as usize] = 1.0;
    }
    Ok(Tensor::from_vec(hard, dims, x.device())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_straight_through_forward_values() {
        let dev = Device::Cpu;
        let x = Tensor::from_vec(vec![-1f32, 0.5, 2.0, 0.0], (4,), &dev).unwrap();
        let y = straight_through(&x, 0.0).unwrap();
        assert_eq!(y.to_vec1::<f32>().unwrap(), vec![0., 1., 1., 0.]);
    }

    #[test]
    fn test_gumbel_hard_rows_are_one_hot() {
        let dev = Device::Cpu;
        let logits = Tensor::rand(-1f32, 1f32, (3, 5), &dev).unwrap();
        let hard = gumbel_softmax_hard(&logits, 1.0).unwrap();
        let rows = hard.to_vec2::<f32>().unwrap();
        for row in rows {
            let ones = row.iter().filter(|&&v| (v - 1.0).abs() < 1e-6).count();
            let zeros = row.iter().filter(|&&v| v.abs() < 1e-6).count();
            assert_eq!(ones, 1);
            assert_eq!(zeros, row.len() - 1);
        }
    }

    #[test]
    fn test_gumbel_hard_follows_dominant_logit() {
        let dev = Device::Cpu;
        // One overwhelming logit: sampling must pick it regardless of noise.
        let logits = Tensor::from_vec(vec![0f32, 1e6, 0., 0.], (1, 4), &dev).unwrap();
        for _ in 0..8 {
            let hard = gumbel_softmax_hard(&logits, 1.0).unwrap();
            assert_eq!(hard.to_vec2::<f32>().unwrap()[0][1], 1.0);
        }
    }

    #[test]
    fn test_hardmax_thresholds() {
        let dev = Device::Cpu;
        let logits = Tensor::from_vec(vec![0f32, 10., 0.], (1, 3), &dev).unwrap();
        let y = hardmax(&logits, 0.2).unwrap();
        let row = &y.to_vec2::<f32>().unwrap()[0];
        assert_eq!(row[1], 1.0);
        assert_eq!(row[0], 0.0);
        assert_eq!(row[2], 0.0);
    }
}
