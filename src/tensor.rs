//! Tensor type and layout helpers.
//!
//! All activations, gradients, masks and parameter tables use [`Tensor`], a reference-counted
//! `f32` array with a dynamic rank. Cloning a `Tensor` is a shallow copy; writing through a
//! shared tensor copies the data first, so a layer can never corrupt a caller's array.
//!
//! Layouts:
//!
//! - feed-forward activations: `[batch, features]`
//! - time series: `[batch, features, time]`
//! - time-series masks: `[batch, time]`, per-example masks: `[batch, 1]`

use ndarray::{ArcArray, Array, ArrayView2, Axis, Ix2, IxDyn, ShapeBuilder, Slice};

use crate::envelope::FlatOrder;
use crate::{Error, Result};

pub type Tensor = ArcArray<f32, IxDyn>;

/// Zero-filled tensor with the given shape.
#[inline]
pub fn zeros(shape: &[usize]) -> Tensor {
    ArcArray::zeros(IxDyn(shape))
}

/// Build a tensor from row-major data.
pub fn from_vec(shape: &[usize], data: Vec<f32>) -> Result<Tensor> {
    let expected: usize = shape.iter().product();
    if data.len() != expected {
        return Err(Error::ShapeMismatch(format!(
            "data len {} does not match shape {shape:?} ({expected} elements)",
            data.len()
        )));
    }
    Array::from_shape_vec(IxDyn(shape), data)
        .map(Array::into_shared)
        .map_err(|e| Error::ShapeMismatch(e.to_string()))
}

/// `[1, n]` row vector.
pub fn row_vector(data: &[f32]) -> Tensor {
    let n = data.len();
    Array::from_shape_vec(IxDyn(&[1, n]), data.to_vec())
        .map(Array::into_shared)
        .unwrap_or_else(|_| zeros(&[1, 0]))
}

#[inline]
pub fn is_row_vector(t: &Tensor) -> bool {
    t.ndim() == 2 && t.shape()[0] == 1
}

/// Length of the time axis of a `[batch, features, time]` tensor.
pub fn time_length(t: &Tensor) -> Result<usize> {
    if t.ndim() != 3 {
        return Err(Error::ShapeMismatch(format!(
            "expected a rank 3 time series, got shape {:?}",
            t.shape()
        )));
    }
    Ok(t.shape()[2])
}

/// Slice `[start, end)` along the time axis.
///
/// Rank 3 tensors are sliced on axis 2, rank 2 masks on axis 1.
pub fn time_slice(t: &Tensor, start: usize, end: usize) -> Result<Tensor> {
    let axis = match t.ndim() {
        3 => 2,
        2 => 1,
        n => {
            return Err(Error::ShapeMismatch(format!(
                "cannot slice time on a rank {n} tensor"
            )));
        }
    };
    let len = t.shape()[axis];
    if start >= end || end > len {
        return Err(Error::InvalidIndex(format!(
            "time range [{start}, {end}) out of bounds for length {len}"
        )));
    }
    Ok(t.slice_axis(Axis(axis), Slice::from(start..end))
        .to_owned()
        .into_shared())
}

/// Drop a trailing time axis of length 1: `[b, n, 1] -> [b, n]`.
///
/// Any other tensor is returned unchanged.
pub fn squeeze_time(t: Tensor) -> Tensor {
    if t.ndim() == 3 && t.shape()[2] == 1 {
        t.index_axis_move(Axis(2), 0)
    } else {
        t
    }
}

/// `[b, n, t] -> [b*t, n]`, rows ordered example-major then time.
pub fn fold_time(t: &Tensor) -> Result<Tensor> {
    let (b, n, steps) = dims3(t)?;
    let data: Vec<f32> = t
        .view()
        .permuted_axes(vec![0, 2, 1])
        .iter()
        .copied()
        .collect();
    from_vec(&[b * steps, n], data)
}

/// Inverse of [`fold_time`]: `[b*t, n] -> [b, n, t]`.
pub fn unfold_time(t: &Tensor, batch: usize) -> Result<Tensor> {
    let (rows, n) = dims2(t)?;
    if batch == 0 || rows % batch != 0 {
        return Err(Error::ShapeMismatch(format!(
            "cannot unfold {rows} rows into a batch of {batch}"
        )));
    }
    let steps = rows / batch;
    let data: Vec<f32> = t.iter().copied().collect();
    Ok(from_vec(&[batch, steps, n], data)?.permuted_axes(vec![0, 2, 1]))
}

/// Fold a `[b, t]` mask into one weight per folded row.
pub fn fold_mask(mask: &Tensor) -> Result<Vec<f32>> {
    dims2(mask)?;
    Ok(mask.iter().copied().collect())
}

/// Write `t` into `out` in the requested flattening order.
///
/// Shape contract: `out.len() == t.len()`.
pub fn flatten_into(t: &Tensor, order: FlatOrder, out: &mut [f32]) -> Result<()> {
    if out.len() != t.len() {
        return Err(Error::ShapeMismatch(format!(
            "cannot flatten {} elements into a slice of {}",
            t.len(),
            out.len()
        )));
    }
    match order {
        FlatOrder::RowMajor => {
            for (dst, &src) in out.iter_mut().zip(t.iter()) {
                *dst = src;
            }
        }
        FlatOrder::ColumnMajor => {
            for (dst, &src) in out.iter_mut().zip(t.t().iter()) {
                *dst = src;
            }
        }
    }
    Ok(())
}

/// Read a tensor of `shape` out of a flat slice stored in `order`.
pub fn unflatten(data: &[f32], shape: &[usize], order: FlatOrder) -> Result<Tensor> {
    let expected: usize = shape.iter().product();
    if data.len() != expected {
        return Err(Error::ShapeMismatch(format!(
            "slice of {} elements does not match shape {shape:?}",
            data.len()
        )));
    }
    let arr = match order {
        FlatOrder::RowMajor => Array::from_shape_vec(IxDyn(shape), data.to_vec()),
        FlatOrder::ColumnMajor => Array::from_shape_vec(IxDyn(shape).f(), data.to_vec()),
    };
    arr.map(Array::into_shared)
        .map_err(|e| Error::ShapeMismatch(e.to_string()))
}

/// Borrow a flat parameter slice as a matrix without copying.
pub fn matrix_view(
    data: &[f32],
    rows: usize,
    cols: usize,
    order: FlatOrder,
) -> Result<ArrayView2<'_, f32>> {
    let view = match order {
        FlatOrder::RowMajor => ArrayView2::from_shape((rows, cols), data),
        FlatOrder::ColumnMajor => ArrayView2::from_shape((rows, cols).f(), data),
    };
    view.map_err(|e| Error::ShapeMismatch(format!("{rows}x{cols} view: {e}")))
}

/// View a rank 2 tensor as a matrix.
pub fn as_matrix(t: &Tensor) -> Result<ArrayView2<'_, f32>> {
    t.view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| Error::ShapeMismatch(format!("expected a matrix, got {:?}", t.shape())))
}

pub(crate) fn dims2(t: &Tensor) -> Result<(usize, usize)> {
    match t.shape() {
        &[a, b] => Ok((a, b)),
        other => Err(Error::ShapeMismatch(format!(
            "expected rank 2, got shape {other:?}"
        ))),
    }
}

pub(crate) fn dims3(t: &Tensor) -> Result<(usize, usize, usize)> {
    match t.shape() {
        &[a, b, c] => Ok((a, b, c)),
        other => Err(Error::ShapeMismatch(format!(
            "expected rank 3, got shape {other:?}"
        ))),
    }
}
