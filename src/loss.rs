//! Loss functions over mini-batches.
//!
//! Predictions and targets are `[rows, classes]` matrices. Each row's loss is averaged over
//! its elements (so the scale does not depend on the output width); rows are then weighted
//! by an optional per-row mask and the sum is divided by the mini-batch size. Time series are
//! folded to one row per (example, step) before they get here, which makes the score a sum
//! over time steps averaged over examples.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, Zip};

use crate::activation::sigmoid;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Loss {
    /// `0.5 * mean((pred - target)^2)` per row.
    #[default]
    Mse,
    /// `mean(|pred - target|)` per row.
    Mae,
    /// Expects raw logits and targets in `[0, 1]`; pair it with an `Identity` activation.
    BinaryCrossEntropyWithLogits,
    /// Expects raw logits and one-hot rows; pair it with an `Identity` activation.
    SoftmaxCrossEntropy,
}

impl Loss {
    /// Score plus dL/d(pred).
    ///
    /// Shape contract:
    /// - `pred.dim() == target.dim()`
    /// - `weights`, when given, has one entry per row
    pub fn backward(
        self,
        pred: ArrayView2<'_, f32>,
        target: ArrayView2<'_, f32>,
        weights: Option<&[f32]>,
        batch_size: usize,
    ) -> Result<(f32, Array2<f32>)> {
        check_rows(pred, target, weights)?;
        if batch_size == 0 {
            return Err(Error::InvalidData("mini-batch must not be empty".to_owned()));
        }

        let scale = 1.0 / batch_size as f32;
        let mut grad = Array2::<f32>::zeros(pred.dim());
        let mut total = 0.0_f32;
        for (r, mut g) in grad.rows_mut().into_iter().enumerate() {
            let w = weights.map_or(1.0, |w| w[r]);
            if w == 0.0 {
                continue;
            }
            let row_loss = self.row_backward(pred.row(r), target.row(r), g.view_mut());
            g.mapv_inplace(|v| v * w * scale);
            total += w * row_loss;
        }
        Ok((total * scale, grad))
    }

    /// Score only.
    pub fn score(
        self,
        pred: ArrayView2<'_, f32>,
        target: ArrayView2<'_, f32>,
        weights: Option<&[f32]>,
        batch_size: usize,
    ) -> Result<f32> {
        self.backward(pred, target, weights, batch_size)
            .map(|(score, _)| score)
    }

    /// Weighted loss of every row, without the mini-batch average.
    ///
    /// Masked rows score zero. Summing the result and dividing by the mini-batch size gives
    /// [`score`](Self::score).
    pub fn score_rows(
        self,
        pred: ArrayView2<'_, f32>,
        target: ArrayView2<'_, f32>,
        weights: Option<&[f32]>,
    ) -> Result<Vec<f32>> {
        check_rows(pred, target, weights)?;
        let mut scratch = Array1::<f32>::zeros(pred.ncols());
        Ok((0..pred.nrows())
            .map(|r| {
                let w = weights.map_or(1.0, |w| w[r]);
                if w == 0.0 {
                    return 0.0;
                }
                w * self.row_backward(pred.row(r), target.row(r), scratch.view_mut())
            })
            .collect())
    }

    fn row_backward(
        self,
        pred: ArrayView1<'_, f32>,
        target: ArrayView1<'_, f32>,
        mut d: ArrayViewMut1<'_, f32>,
    ) -> f32 {
        let n = pred.len();
        if n == 0 {
            return 0.0;
        }
        let inv_n = 1.0 / n as f32;
        let mut sum = 0.0_f32;

        match self {
            Loss::Mse => {
                Zip::from(&mut d)
                    .and(&pred)
                    .and(&target)
                    .for_each(|g, &p, &t| {
                        let diff = p - t;
                        sum = diff.mul_add(diff, sum);
                        *g = diff * inv_n;
                    });
                0.5 * sum * inv_n
            }
            Loss::Mae => {
                Zip::from(&mut d)
                    .and(&pred)
                    .and(&target)
                    .for_each(|g, &p, &t| {
                        let diff = p - t;
                        sum += diff.abs();
                        // Subgradient 0 at diff == 0.
                        *g = if diff > 0.0 {
                            inv_n
                        } else if diff < 0.0 {
                            -inv_n
                        } else {
                            0.0
                        };
                    });
                sum * inv_n
            }
            Loss::BinaryCrossEntropyWithLogits => {
                Zip::from(&mut d)
                    .and(&pred)
                    .and(&target)
                    .for_each(|g, &x, &t| {
                        // max(x, 0) - x t + ln(1 + e^-|x|), stable for large |x|.
                        sum += x.max(0.0) - x * t + (1.0 + (-x.abs()).exp()).ln();
                        *g = (sigmoid(x) - t) * inv_n;
                    });
                sum * inv_n
            }
            Loss::SoftmaxCrossEntropy => {
                let max = pred.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
                let sum_exp: f32 = pred.iter().map(|&x| (x - max).exp()).sum();
                let log_sum_exp = max + sum_exp.ln();
                Zip::from(&mut d)
                    .and(&pred)
                    .and(&target)
                    .for_each(|g, &x, &t| {
                        if t != 0.0 {
                            sum -= t * (x - log_sum_exp);
                        }
                        *g = ((x - log_sum_exp).exp() - t) * inv_n;
                    });
                sum * inv_n
            }
        }
    }
}

fn check_rows(
    pred: ArrayView2<'_, f32>,
    target: ArrayView2<'_, f32>,
    weights: Option<&[f32]>,
) -> Result<()> {
    if pred.dim() != target.dim() {
        return Err(Error::ShapeMismatch(format!(
            "predictions {:?} and labels {:?} differ",
            pred.dim(),
            target.dim()
        )));
    }
    if let Some(w) = weights {
        if w.len() != pred.nrows() {
            return Err(Error::ShapeMismatch(format!(
                "label mask has {} entries for {} rows",
                w.len(),
                pred.nrows()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn mse_matches_hand_computed_values() {
        let pred = array![[1.0_f32, 3.0]];
        let target = array![[2.0_f32, 1.0]];
        let (score, grad) = Loss::Mse.backward(pred.view(), target.view(), None, 1).unwrap();
        // 0.5 * mean([1, 4]) = 1.25
        assert!((score - 1.25).abs() < 1e-6);
        assert!((grad[[0, 0]] + 0.5).abs() < 1e-6);
        assert!((grad[[0, 1]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn score_is_averaged_over_the_mini_batch_and_masked_rows_drop_out() {
        let pred = array![[1.0_f32], [3.0], [100.0]];
        let target = array![[0.0_f32], [0.0], [0.0]];
        let (score, grad) = Loss::Mse
            .backward(pred.view(), target.view(), Some(&[1.0, 1.0, 0.0]), 2)
            .unwrap();
        // (0.5 * 1 + 0.5 * 9) / 2
        assert!((score - 2.5).abs() < 1e-6);
        assert_eq!(grad[[2, 0]], 0.0);
        assert!((grad[[1, 0]] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn row_scores_sum_to_the_batch_score() {
        let pred = array![[1.0_f32, 0.0], [3.0, 1.0], [100.0, 2.0]];
        let target = array![[0.0_f32, 0.0], [0.0, 0.0], [0.0, 0.0]];
        let mask = [1.0, 0.5, 0.0];
        let rows = Loss::Mse
            .score_rows(pred.view(), target.view(), Some(&mask))
            .unwrap();
        // 0.5 * mean([1, 0]), 0.5 * 0.5 * mean([9, 1]), masked
        assert_eq!(rows.len(), 3);
        assert!((rows[0] - 0.25).abs() < 1e-6);
        assert!((rows[1] - 1.25).abs() < 1e-6);
        assert_eq!(rows[2], 0.0);
        let score = Loss::Mse
            .score(pred.view(), target.view(), Some(&mask), 3)
            .unwrap();
        assert!((rows.iter().sum::<f32>() / 3.0 - score).abs() < 1e-6);
    }

    #[test]
    fn bce_with_logits_is_stable_for_extreme_logits() {
        let logits = array![[100.0_f32, -100.0]];
        let target = array![[1.0_f32, 0.0]];
        let score = Loss::BinaryCrossEntropyWithLogits
            .score(logits.view(), target.view(), None, 1)
            .unwrap();
        assert!(score.is_finite());
        assert!(score < 1e-3);
    }

    #[test]
    fn softmax_cross_entropy_prefers_correct_class_and_grads_sum_to_zero() {
        let good = array![[5.0_f32, 0.0, -1.0]];
        let bad = array![[-1.0_f32, 0.0, 5.0]];
        let target = array![[1.0_f32, 0.0, 0.0]];
        let loss = Loss::SoftmaxCrossEntropy;
        let (good_score, grad) = loss.backward(good.view(), target.view(), None, 1).unwrap();
        let bad_score = loss.score(bad.view(), target.view(), None, 1).unwrap();
        assert!(good_score < bad_score);
        assert!(grad.sum().abs() < 1e-6);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let pred = array![[1.0_f32, 2.0]];
        let target = array![[1.0_f32]];
        assert!(matches!(
            Loss::Mae.score(pred.view(), target.view(), None, 1),
            Err(Error::ShapeMismatch(_))
        ));
    }
}
