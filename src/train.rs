//! The training loop.
//!
//! [`Network::fit`] runs one epoch over a [`BatchIterator`]: each batch is forwarded,
//! backpropagated and applied as one update (or, with truncated BPTT, one update per time
//! segment). Everything that used to be hidden mutable state (the ETL time of the last batch,
//! the number of updates) comes back in the [`FitReport`].

use std::ops::Range;
use std::time::{Duration, Instant};

use crate::data::{AsyncBatchIterator, BatchIterator, DataSet, ListBatchIterator};
use crate::error::soften;
use crate::network::Network;
use crate::recurrent::segment_ranges;
use crate::workspace::WorkspaceKind;
use crate::{Error, Result, Tensor, tensor};

/// Batches staged ahead of the training loop when prefetching.
pub const PREFETCH_QUEUE_SIZE: usize = 2;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitReport {
    /// Parameter updates applied during this call.
    pub iterations: u64,
    /// Time spent waiting for the most recent batch.
    pub last_etl_time: Duration,
    /// Score of the last update, if any update produced one.
    pub final_score: Option<f32>,
}

impl Network {
    /// One epoch over `batches`.
    ///
    /// Iterators that allow it are prefetched on a background thread; the prefetcher is shut
    /// down before this returns, whether training succeeded or not.
    pub fn fit<I: BatchIterator + 'static>(&mut self, mut batches: I) -> Result<FitReport> {
        if batches.async_supported() {
            let mut prefetched = AsyncBatchIterator::new(batches, PREFETCH_QUEUE_SIZE)?;
            let report = self.fit_iter(&mut prefetched);
            prefetched.shutdown();
            report
        } else {
            self.fit_iter(&mut batches)
        }
    }

    /// One epoch over `ds` split into mini-batches of `batch_size`.
    pub fn fit_dataset(&mut self, ds: &DataSet, batch_size: usize) -> Result<FitReport> {
        self.fit(ListBatchIterator::from_dataset(ds, batch_size)?)
    }

    /// One epoch over `batches`, consumed on the calling thread.
    pub fn fit_iter(&mut self, batches: &mut dyn BatchIterator) -> Result<FitReport> {
        let epoch = self.config.epoch_count;
        for l in &mut self.listeners {
            l.on_epoch_start(epoch);
        }

        if self.config.pretrain {
            self.pretrain(batches)?;
            if self.config.backprop {
                rewind(batches)?;
            }
        }

        let mut report = FitReport::default();
        if self.config.backprop {
            let mut waiting = Instant::now();
            while let Some(ds) = batches.next() {
                report.last_etl_time = waiting.elapsed();
                let before = self.config.iteration_count;
                let score = if self.config.is_tbptt() {
                    self.truncated_bptt(&ds)?
                } else {
                    self.fit_batch(&ds)?
                };
                report.iterations += self.config.iteration_count - before;
                if score.is_some() {
                    report.final_score = score;
                }
                waiting = Instant::now();
            }
        }

        for l in &mut self.listeners {
            l.on_epoch_end(epoch);
        }
        self.rnn_clear_previous_state();
        self.config.epoch_count += 1;
        tracing::debug!(
            epoch,
            iterations = report.iterations,
            score = ?report.final_score,
            "epoch finished"
        );
        Ok(report)
    }

    /// Forward, backward and update on one mini-batch.
    ///
    /// Returns `Ok(None)` without updating when the network cannot produce a score.
    pub fn fit_batch(&mut self, ds: &DataSet) -> Result<Option<f32>> {
        self.training_ws.arena_mut(WorkspaceKind::Cache).open_frame();
        let out = self.train_step(ds);
        self.training_ws.arena_mut(WorkspaceKind::Cache).close_frame();
        self.clear();
        out
    }

    fn train_step(&mut self, ds: &DataSet) -> Result<Option<f32>> {
        self.set_input(ds.input());
        self.set_labels(ds.labels.clone(), ds.labels_mask.clone());
        let Some(score) = self.compute_gradient_and_score()? else {
            return Ok(None);
        };
        self.apply_update()?;
        let (iteration, epoch) = (self.config.iteration_count, self.config.epoch_count);
        for l in &mut self.listeners {
            l.iteration_done(iteration, epoch, score);
        }
        Ok(Some(score))
    }

    /// Train on a time series one `tbptt_fwd_length` segment at a time.
    ///
    /// Recurrent state is cleared before the first segment, carried from each segment into
    /// the next, and cleared again after the last one. Returns the last segment's score.
    /// Inputs that are not rank 3, or whose feature and label time lengths differ, are
    /// logged and skipped.
    pub fn truncated_bptt(&mut self, ds: &DataSet) -> Result<Option<f32>> {
        let Some(segments) = soften(self.tbptt_segments(ds))? else {
            return Ok(None);
        };
        let labels = ds.labels.as_ref().ok_or(Error::MissingLabels)?;

        self.rnn_clear_previous_state();
        self.training_ws.arena_mut(WorkspaceKind::Cache).open_frame();
        // Outer frame spans the call; the inner one holds the state carried between segments.
        let tbptt = self.training_ws.arena_mut(WorkspaceKind::Tbptt);
        tbptt.open_frame();
        tbptt.open_frame();
        let mut last = None;
        let mut failure = None;
        for range in segments {
            let step = time_segment(ds, labels, range)
                .and_then(|segment| self.train_step(&segment))
                .and_then(|score| {
                    self.update_rnn_state_with_tbptt_state();
                    let tbptt = self.training_ws.arena_mut(WorkspaceKind::Tbptt);
                    tbptt.close_frame();
                    tbptt.open_frame();
                    self.stack.adopt_previous_state(tbptt)?;
                    Ok(score)
                });
            self.clear();
            match step {
                Ok(Some(score)) => last = Some(score),
                Ok(None) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        let tbptt = self.training_ws.arena_mut(WorkspaceKind::Tbptt);
        tbptt.close_frame();
        tbptt.close_frame();
        self.training_ws.arena_mut(WorkspaceKind::Cache).close_frame();
        self.rnn_clear_previous_state();
        match failure {
            Some(e) => Err(e),
            None => Ok(last),
        }
    }

    fn tbptt_segments(&self, ds: &DataSet) -> Result<Vec<Range<usize>>> {
        let Some(labels) = &ds.labels else {
            return Err(Error::MissingLabels);
        };
        if ds.features.ndim() != 3 || labels.ndim() != 3 {
            return Err(Error::UnsupportedConfiguration(format!(
                "truncated BPTT needs rank 3 features and labels, got {:?} and {:?}",
                ds.features.shape(),
                labels.shape()
            )));
        }
        let time_len = tensor::time_length(&ds.features)?;
        let label_len = tensor::time_length(labels)?;
        if time_len != label_len {
            return Err(Error::UnsupportedConfiguration(format!(
                "feature time length {time_len} differs from label time length {label_len}"
            )));
        }
        Ok(segment_ranges(time_len, self.config.tbptt_fwd_length))
    }

    /// Run the unsupervised step of every pretrain layer over `batches`, first layer first.
    pub fn pretrain(&mut self, batches: &mut dyn BatchIterator) -> Result<()> {
        let layers: Vec<usize> = (0..self.stack.len())
            .filter(|&idx| self.stack.nodes()[idx].is_pretrain_layer())
            .collect();
        for (n, idx) in layers.into_iter().enumerate() {
            if n > 0 {
                rewind(batches)?;
            }
            self.pretrain_layer(idx, batches)?;
        }
        Ok(())
    }

    /// Pretrain layer `idx` on every batch of `batches`.
    ///
    /// Layers below `idx` run in inference mode to produce its input. Returns the last step's
    /// score; a layer that cannot be pretrained is logged and skipped.
    pub fn pretrain_layer(&mut self, idx: usize, batches: &mut dyn BatchIterator) -> Result<Option<f32>> {
        let node = self.stack.node(idx)?;
        if !node.is_pretrain_layer() {
            return soften(Err(Error::UnsupportedConfiguration(format!(
                "layer {idx} ({}) is not a pretrain layer",
                node.layer_type()
            ))));
        }
        let mut score = None;
        for ds in batches {
            let input = if idx == 0 {
                ds.input()
            } else {
                self.set_input(ds.input());
                let acts = self.feed_forward_to_layer(idx - 1, false);
                self.clear();
                acts?
                    .pop()
                    .ok_or_else(|| Error::MissingInput("no activations below the pretrain layer".to_owned()))?
            };
            let Network {
                stack,
                store,
                training_ws,
                ..
            } = self;
            let range = store.layout().range(idx).unwrap_or(0..0);
            let params = &mut store.as_mut_slice()[range];
            let step = {
                let mut scope = training_ws.arena_mut(WorkspaceKind::External).enter_scope();
                stack.node_mut(idx)?.pretrain_step(params, &input, &mut scope)
            };
            score = Some(step?);
            self.stack.clear();
        }
        tracing::debug!(layer = idx, score = ?score, "layer pretrained");
        Ok(score)
    }
}

fn time_segment(ds: &DataSet, labels: &Tensor, range: Range<usize>) -> Result<DataSet> {
    let slice = |t: &Option<Tensor>| {
        t.as_ref()
            .map(|t| tensor::time_slice(t, range.start, range.end))
            .transpose()
    };
    Ok(DataSet {
        features: tensor::time_slice(&ds.features, range.start, range.end)?,
        labels: Some(tensor::time_slice(labels, range.start, range.end)?),
        features_mask: slice(&ds.features_mask)?,
        labels_mask: slice(&ds.labels_mask)?,
    })
}

fn rewind(batches: &mut dyn BatchIterator) -> Result<()> {
    if !batches.reset_supported() {
        return Err(Error::UnsupportedConfiguration(
            "the batch iterator cannot be reset for another pass".to_owned(),
        ));
    }
    batches.reset()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackpropType, NetworkConfig};
    use crate::layer::Node;
    use crate::layers::{Dense, LossOutput, SimpleRnn};
    use crate::loss::Loss;
    use crate::stack::LayerStack;
    use crate::Activation;

    fn regression() -> DataSet {
        DataSet::from_rows(
            &[vec![0.0, 0.0], vec![0.0, 1.0], vec![1.0, 0.0], vec![1.0, 1.0]],
            &[vec![0.0], vec![1.0], vec![1.0], vec![2.0]],
        )
        .unwrap()
    }

    fn dense_network(lr: f32) -> Network {
        let stack = LayerStack::new(vec![
            Node::standard(Dense::new(2, 3, Activation::Tanh)),
            Node::output(LossOutput::new(3, 1, Activation::Identity, Loss::Mse)),
        ])
        .unwrap();
        let config = NetworkConfig {
            lr,
            ..NetworkConfig::default()
        };
        Network::new(config, stack).unwrap()
    }

    #[test]
    fn fit_applies_one_update_per_batch_and_counts_the_epoch() {
        let mut net = dense_network(1e-2);
        let report = net.fit_dataset(&regression(), 2).unwrap();
        assert_eq!(report.iterations, 2);
        assert!(report.final_score.is_some());
        assert_eq!(net.config().iteration_count, 2);
        assert_eq!(net.config().epoch_count, 1);
        assert!(net.input().is_none());
    }

    #[test]
    fn training_reduces_the_score() {
        let mut net = dense_network(0.1);
        let ds = regression();
        let before = net.score_dataset(&ds).unwrap().unwrap();
        for _ in 0..300 {
            let mut batches = ListBatchIterator::from_dataset(&ds, 4).unwrap();
            net.fit_iter(&mut batches).unwrap();
        }
        let after = net.score_dataset(&ds).unwrap().unwrap();
        assert!(after < before * 0.5, "{after} vs {before}");
    }

    #[test]
    fn unlabeled_batches_are_a_hard_error() {
        let mut net = dense_network(1e-2);
        let ds = DataSet::unlabeled(regression().features).unwrap();
        assert_eq!(net.fit_dataset(&ds, 4), Err(Error::MissingLabels));
    }

    fn series(batch: usize, n: usize, t: usize) -> Tensor {
        let data = (0..batch * n * t).map(|i| ((i % 7) as f32 - 3.0) / 4.0).collect();
        tensor::from_vec(&[batch, n, t], data).unwrap()
    }

    fn rnn_network(fwd: usize, back: usize) -> Network {
        let config = NetworkConfig {
            backprop_type: BackpropType::TruncatedBptt,
            tbptt_fwd_length: fwd,
            tbptt_back_length: back,
            ..NetworkConfig::default()
        };
        let stack = LayerStack::new(vec![
            Node::recurrent(SimpleRnn::new(2, 3, Activation::Tanh)),
            Node::output(LossOutput::new(3, 1, Activation::Identity, Loss::Mse)),
        ])
        .unwrap();
        Network::new(config, stack).unwrap()
    }

    #[test]
    fn tbptt_updates_once_per_segment_and_clears_state() {
        let mut net = rnn_network(3, 2);
        let ds = DataSet::new(series(2, 2, 7), series(2, 1, 7)).unwrap();
        let score = net.truncated_bptt(&ds).unwrap();
        assert!(score.is_some());
        assert_eq!(net.config().iteration_count, 3);
        let state = net.rnn_get_previous_state(0).unwrap().unwrap();
        assert!(state.is_empty());
    }

    #[test]
    fn tbptt_skips_feed_forward_input() {
        let mut net = rnn_network(3, 3);
        let ds = regression();
        assert_eq!(net.truncated_bptt(&ds), Ok(None));
        assert_eq!(net.config().iteration_count, 0);

        let mismatched = DataSet {
            features: series(2, 2, 6),
            labels: Some(series(2, 1, 5)),
            features_mask: None,
            labels_mask: None,
        };
        assert_eq!(net.truncated_bptt(&mismatched), Ok(None));
    }
}
