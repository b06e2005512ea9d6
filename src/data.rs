//! Mini-batch sources.
//!
//! A [`DataSet`] is one mini-batch (or a whole in-memory set): features, optional labels and
//! their optional masks, all sharing the leading batch axis. A [`BatchIterator`] yields them;
//! [`AsyncBatchIterator`] prefetches from another iterator on a background thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, sync_channel};
use std::thread::{self, JoinHandle};

use ndarray::{Axis, Slice};

use crate::envelope::{Activations, MaskState};
use crate::{Error, Result, Tensor, tensor};

/// Features plus optional labels and masks.
///
/// Shapes:
/// - features `[batch, n_in]` or `[batch, n_in, time]`
/// - labels `[batch, n_out]` or `[batch, n_out, time]`
/// - masks `[batch, time]` for time series, `[batch, 1]` otherwise
#[derive(Debug, Clone, PartialEq)]
pub struct DataSet {
    pub features: Tensor,
    pub labels: Option<Tensor>,
    pub features_mask: Option<Tensor>,
    pub labels_mask: Option<Tensor>,
}

impl DataSet {
    pub fn new(features: Tensor, labels: Tensor) -> Result<Self> {
        Self::with_masks(features, Some(labels), None, None)
    }

    /// Features only, as used for pretraining.
    pub fn unlabeled(features: Tensor) -> Result<Self> {
        Self::with_masks(features, None, None, None)
    }

    pub fn with_masks(
        features: Tensor,
        labels: Option<Tensor>,
        features_mask: Option<Tensor>,
        labels_mask: Option<Tensor>,
    ) -> Result<Self> {
        let ds = Self {
            features,
            labels,
            features_mask,
            labels_mask,
        };
        ds.validate()?;
        Ok(ds)
    }

    /// Build a feed-forward set from per-example rows.
    ///
    /// This is a convenience constructor (it copies into contiguous storage).
    pub fn from_rows(inputs: &[Vec<f32>], targets: &[Vec<f32>]) -> Result<Self> {
        if inputs.len() != targets.len() {
            return Err(Error::InvalidData(format!(
                "inputs/targets length mismatch: {} vs {}",
                inputs.len(),
                targets.len()
            )));
        }
        let features = stack_rows(inputs, "input")?;
        let labels = stack_rows(targets, "target")?;
        Self::new(features, labels)
    }

    fn validate(&self) -> Result<()> {
        let rank = self.features.ndim();
        if rank != 2 && rank != 3 {
            return Err(Error::InvalidData(format!(
                "features must be rank 2 or 3, got shape {:?}",
                self.features.shape()
            )));
        }
        let batch = self.len();
        if batch == 0 {
            return Err(Error::InvalidData("data set must not be empty".to_owned()));
        }
        if let Some(labels) = &self.labels {
            if labels.ndim() != rank || labels.shape()[0] != batch {
                return Err(Error::InvalidData(format!(
                    "labels {:?} do not match features {:?}",
                    labels.shape(),
                    self.features.shape()
                )));
            }
        }
        for (what, mask, series) in [
            ("features mask", &self.features_mask, Some(&self.features)),
            ("labels mask", &self.labels_mask, self.labels.as_ref()),
        ] {
            let (Some(mask), Some(series)) = (mask, series) else {
                continue;
            };
            let expected = if series.ndim() == 3 { series.shape()[2] } else { 1 };
            if mask.shape() != [batch, expected] {
                return Err(Error::InvalidData(format!(
                    "{what} {:?} does not match [{batch}, {expected}]",
                    mask.shape()
                )));
            }
        }
        Ok(())
    }

    /// Number of examples.
    #[inline]
    pub fn len(&self) -> usize {
        self.features.shape().first().copied().unwrap_or(0)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_time_series(&self) -> bool {
        self.features.ndim() == 3
    }

    /// Features as a network input; an attached features mask is active.
    pub fn input(&self) -> Activations {
        let state = self.features_mask.as_ref().map(|_| MaskState::Active);
        Activations::with_mask(self.features.clone(), self.features_mask.clone(), state)
    }

    /// Consecutive mini-batches of at most `batch_size` examples.
    pub fn batches(&self, batch_size: usize) -> Result<Vec<DataSet>> {
        if batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be > 0".to_owned()));
        }
        let n = self.len();
        let mut out = Vec::with_capacity(n.div_ceil(batch_size));
        let mut start = 0;
        while start < n {
            let end = (start + batch_size).min(n);
            out.push(DataSet {
                features: rows(&self.features, start, end),
                labels: self.labels.as_ref().map(|t| rows(t, start, end)),
                features_mask: self.features_mask.as_ref().map(|t| rows(t, start, end)),
                labels_mask: self.labels_mask.as_ref().map(|t| rows(t, start, end)),
            });
            start = end;
        }
        Ok(out)
    }
}

fn rows(t: &Tensor, start: usize, end: usize) -> Tensor {
    t.slice_axis(Axis(0), Slice::from(start..end))
        .to_owned()
        .into_shared()
}

fn stack_rows(rows: &[Vec<f32>], what: &str) -> Result<Tensor> {
    let dim = rows.first().map_or(0, Vec::len);
    if dim == 0 {
        return Err(Error::InvalidData(format!("{what} rows must not be empty")));
    }
    let mut flat = Vec::with_capacity(rows.len() * dim);
    for (i, row) in rows.iter().enumerate() {
        if row.len() != dim {
            return Err(Error::InvalidData(format!(
                "{what} row {i} has len {}, expected {dim}",
                row.len()
            )));
        }
        flat.extend_from_slice(row);
    }
    tensor::from_vec(&[rows.len(), dim], flat)
}

/// A resettable stream of mini-batches.
pub trait BatchIterator: Iterator<Item = DataSet> + Send {
    fn reset_supported(&self) -> bool;

    /// Whether wrapping this iterator in an [`AsyncBatchIterator`] is allowed.
    fn async_supported(&self) -> bool;

    /// Rewind to the first batch.
    fn reset(&mut self) -> Result<()>;
}

/// In-memory batches.
#[derive(Debug, Clone)]
pub struct ListBatchIterator {
    batches: Vec<DataSet>,
    cursor: usize,
}

impl ListBatchIterator {
    pub fn new(batches: Vec<DataSet>) -> Self {
        Self { batches, cursor: 0 }
    }

    pub fn from_dataset(ds: &DataSet, batch_size: usize) -> Result<Self> {
        Ok(Self::new(ds.batches(batch_size)?))
    }

    #[inline]
    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }
}

impl Iterator for ListBatchIterator {
    type Item = DataSet;

    fn next(&mut self) -> Option<DataSet> {
        let ds = self.batches.get(self.cursor)?.clone();
        self.cursor += 1;
        Some(ds)
    }
}

impl BatchIterator for ListBatchIterator {
    fn reset_supported(&self) -> bool {
        true
    }

    fn async_supported(&self) -> bool {
        true
    }

    fn reset(&mut self) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }
}

/// Prefetches batches from `I` on a worker thread into a bounded queue.
///
/// [`shutdown`](Self::shutdown) stops the worker, discards staged batches and hands the inner
/// iterator back. Dropping the iterator shuts it down too.
#[derive(Debug)]
pub struct AsyncBatchIterator<I: BatchIterator + 'static> {
    queue_size: usize,
    reset_supported: bool,
    stop: Arc<AtomicBool>,
    rx: Option<Receiver<DataSet>>,
    worker: Option<JoinHandle<I>>,
}

impl<I: BatchIterator + 'static> AsyncBatchIterator<I> {
    pub fn new(inner: I, queue_size: usize) -> Result<Self> {
        if queue_size == 0 {
            return Err(Error::InvalidConfig("queue_size must be > 0".to_owned()));
        }
        let reset_supported = inner.reset_supported();
        let mut it = Self {
            queue_size,
            reset_supported,
            stop: Arc::new(AtomicBool::new(false)),
            rx: None,
            worker: None,
        };
        it.spawn(inner)?;
        Ok(it)
    }

    fn spawn(&mut self, mut inner: I) -> Result<()> {
        let (tx, rx) = sync_channel(self.queue_size);
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let worker = thread::Builder::new()
            .name("batch-prefetch".to_owned())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    let Some(ds) = inner.next() else {
                        break;
                    };
                    // The receiver is gone once the consumer shuts down.
                    if tx.send(ds).is_err() {
                        break;
                    }
                }
                inner
            })
            .map_err(|e| Error::Concurrency(format!("failed to start prefetch thread: {e}")))?;
        self.stop = stop;
        self.rx = Some(rx);
        self.worker = Some(worker);
        Ok(())
    }

    /// Stop prefetching and return the inner iterator.
    ///
    /// Returns `None` if already shut down or if the worker panicked.
    pub fn shutdown(&mut self) -> Option<I> {
        self.stop.store(true, Ordering::Release);
        // Unblocks a worker waiting on a full queue; staged batches are dropped with it.
        let staged = self.rx.take().map_or(0, |rx| rx.try_iter().count());
        let worker = self.worker.take()?;
        match worker.join() {
            Ok(inner) => {
                tracing::debug!(discarded = staged, "batch prefetcher shut down");
                Some(inner)
            }
            Err(_) => {
                tracing::warn!("batch prefetch thread panicked");
                None
            }
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

impl<I: BatchIterator + 'static> Iterator for AsyncBatchIterator<I> {
    type Item = DataSet;

    fn next(&mut self) -> Option<DataSet> {
        self.rx.as_ref()?.recv().ok()
    }
}

impl<I: BatchIterator + 'static> BatchIterator for AsyncBatchIterator<I> {
    fn reset_supported(&self) -> bool {
        self.reset_supported
    }

    fn async_supported(&self) -> bool {
        false
    }

    fn reset(&mut self) -> Result<()> {
        if !self.reset_supported {
            return Err(Error::UnsupportedConfiguration(
                "inner iterator does not support reset".to_owned(),
            ));
        }
        let mut inner = self
            .shutdown()
            .ok_or_else(|| Error::Concurrency("prefetch worker is not available".to_owned()))?;
        inner.reset()?;
        self.spawn(inner)
    }
}

impl<I: BatchIterator + 'static> Drop for AsyncBatchIterator<I> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
