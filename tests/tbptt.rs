use std::sync::{Arc, Mutex};

use approx::assert_abs_diff_eq;
use ndarray::{Axis, s};

use rust_stacknet::{
    Activation, Activations, BackpropType, DataSet, ListBatchIterator, Loss, LossOutput,
    Network, NetworkBuilder, NetworkConfig, Node, Result, SimpleRnn, Tensor, TrainingListener,
    Updater, WorkspaceKind, segment_ranges, tensor,
};

/// Leaves the parameters untouched so segment states can be compared with a single pass.
#[derive(Debug, Clone)]
struct NoUpdate;

impl Updater for NoUpdate {
    fn update(&mut self, gradient: &mut [f32], _iteration: u64, _epoch: u64) -> Result<()> {
        gradient.fill(0.0);
        Ok(())
    }

    fn state_view(&self) -> Tensor {
        tensor::zeros(&[1, 0])
    }

    fn set_state_view(&mut self, _state: &Tensor) -> Result<()> {
        Ok(())
    }

    fn box_clone(&self) -> Box<dyn Updater> {
        Box::new(self.clone())
    }
}

/// Records the recurrent layer's output at the last step of every forward pass.
#[derive(Debug, Clone, Default)]
struct LastStep(Arc<Mutex<Vec<Tensor>>>);

impl TrainingListener for LastStep {
    fn on_forward_pass(&mut self, activations: &[Activations]) {
        let rnn = &activations[1].tensor;
        let t = rnn.shape()[2];
        let last = rnn.index_axis(Axis(2), t - 1).to_owned().into_shared();
        self.0.lock().unwrap().push(last);
    }
}

const STEPS: usize = 100;

fn sequence() -> DataSet {
    let features: Vec<f32> = (0..2 * 2 * STEPS)
        .map(|i| ((i * 37 % 23) as f32 / 11.0) - 1.0)
        .collect();
    let labels: Vec<f32> = (0..2 * STEPS).map(|i| ((i % 5) as f32) / 5.0).collect();
    DataSet::new(
        tensor::from_vec(&[2, 2, STEPS], features).unwrap(),
        tensor::from_vec(&[2, 1, STEPS], labels).unwrap(),
    )
    .unwrap()
}

fn network(fwd: usize) -> Network {
    let config = NetworkConfig {
        backprop_type: BackpropType::TruncatedBptt,
        tbptt_fwd_length: fwd,
        tbptt_back_length: fwd,
        seed: 5,
        ..NetworkConfig::default()
    };
    NetworkBuilder::new(config)
        .layer(Node::recurrent(SimpleRnn::new(2, 4, Activation::Tanh)))
        .layer(Node::output(LossOutput::new(4, 1, Activation::Identity, Loss::Mse)))
        .build()
        .unwrap()
}

#[test]
fn segments_are_contiguous_and_the_last_may_be_short() {
    assert_eq!(segment_ranges(100, 30), vec![0..30, 30..60, 60..90, 90..100]);
    assert_eq!(segment_ranges(60, 30), vec![0..30, 30..60]);
    assert_eq!(segment_ranges(7, 10), vec![0..7]);
}

#[test]
fn state_after_each_segment_matches_a_full_pass() {
    let ds = sequence();
    let mut net = network(30);
    net.set_updater(Box::new(NoUpdate));
    let recorder = LastStep::default();
    let seen = Arc::clone(&recorder.0);
    net.add_listener(recorder);

    let report = net.fit_iter(&mut ListBatchIterator::new(vec![ds.clone()])).unwrap();
    assert_eq!(report.iterations, 4);

    let full = net
        .feed_forward(Activations::new(ds.features.clone()), false)
        .unwrap();
    let hidden = &full[1].tensor;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 4);
    for (segment, end) in [30, 60, 90, 100].into_iter().enumerate() {
        let expected = hidden.index_axis(Axis(2), end - 1);
        for (a, b) in seen[segment].iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
        }
    }
}

#[test]
fn state_does_not_leak_out_of_a_training_call() {
    let mut net = network(30);
    net.truncated_bptt(&sequence()).unwrap().unwrap();
    let state = net.rnn_get_previous_state(0).unwrap().unwrap();
    assert!(state.is_empty());
    assert_eq!(net.config().iteration_count, 4);
}

#[test]
fn time_steps_reproduce_the_full_sequence_output() {
    let ds = sequence();
    let mut net = network(30);
    let full = net.output(&ds.features, false).unwrap();

    net.rnn_clear_previous_state();
    for t in 0..STEPS {
        let step = ds.features.index_axis(Axis(2), t).to_owned().into_shared();
        let out = net.rnn_time_step(&step).unwrap();
        assert_eq!(out.shape(), &[2, 1]);
        let expected = full.index_axis(Axis(2), t);
        for (a, b) in out.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
        }
    }
    assert!(net.input().is_none());

    let state = net.rnn_get_previous_state(0).unwrap().unwrap();
    assert_eq!(state.get("h").unwrap().shape(), &[2, 4]);
    net.rnn_clear_previous_state();
    assert!(net.rnn_get_previous_state(0).unwrap().unwrap().is_empty());
    assert_eq!(net.rnn_get_previous_state(1).unwrap(), None);
}

#[test]
fn stored_state_can_be_set_and_is_not_written_by_stored_state_activation() {
    let ds = sequence();
    let mut net = network(30);
    let start = tensor::from_vec(&[2, 4], vec![0.5; 8]).unwrap();
    let mut state = rust_stacknet::RnnState::new();
    state.insert("h", start.clone());
    net.rnn_set_previous_state(0, state).unwrap();

    let acts = net
        .rnn_activate_using_stored_state(&Activations::new(ds.features.clone()), false, false)
        .unwrap();
    assert_eq!(acts.len(), 3);
    let after = net.rnn_get_previous_state(0).unwrap().unwrap();
    assert_eq!(after.get("h").unwrap(), &start);

    let mut plain = network(30);
    let zero_start = plain.feed_forward(Activations::new(ds.features), false).unwrap();
    assert_ne!(acts[1].tensor, zero_start[1].tensor);
}

#[test]
fn carried_state_lives_in_the_tbptt_arena_for_one_call() {
    let mut net = network(30);
    net.truncated_bptt(&sequence()).unwrap().unwrap();
    let tbptt = net.workspaces(true).arena(WorkspaceKind::Tbptt);
    assert_eq!(tbptt.cycles(), 1);
    assert_eq!(tbptt.depth(), 0);
    assert_eq!(tbptt.live_count(), 0);
    // One [2, 4] hidden state carried across each boundary.
    assert_eq!(tbptt.peak(), 8);

    net.truncated_bptt(&sequence()).unwrap().unwrap();
    assert_eq!(net.workspaces(true).arena(WorkspaceKind::Tbptt).cycles(), 2);
}

/// `sequence()` with steps 25..35 of every example masked out and overwritten with `fill`.
fn gapped(fill: f32) -> DataSet {
    let base = sequence();
    let mut features = base.features.to_owned();
    let mut labels = base.labels.unwrap().to_owned();
    let mut mask = vec![1.0_f32; 2 * STEPS];
    for b in 0..2 {
        for t in 25..35 {
            mask[b * STEPS + t] = 0.0;
            features.slice_mut(s![b, .., t]).fill(fill);
            labels[[b, 0, t]] = -fill;
        }
    }
    let mask = tensor::from_vec(&[2, STEPS], mask).unwrap();
    DataSet::with_masks(
        features.into_shared(),
        Some(labels.into_shared()),
        Some(mask.clone()),
        Some(mask),
    )
    .unwrap()
}

#[test]
fn masked_steps_contribute_nothing_across_segment_boundaries() {
    let mut results = Vec::new();
    for fill in [0.0, 7.5, -40.0] {
        let mut net = network(30);
        let score = net.truncated_bptt(&gapped(fill)).unwrap().unwrap();
        results.push((net.params(), score));
    }
    assert_eq!(results[0], results[1]);
    assert_eq!(results[1], results[2]);

    // The same edit on unmasked steps does change training.
    let mut unmasked = sequence();
    let mut labels = unmasked.labels.take().unwrap().to_owned();
    labels[[0, 0, 31]] = 40.0;
    unmasked.labels = Some(labels.into_shared());
    let mut net = network(30);
    net.truncated_bptt(&unmasked).unwrap().unwrap();
    let mut plain = network(30);
    plain.truncated_bptt(&sequence()).unwrap().unwrap();
    assert_ne!(net.params(), plain.params());
}

#[test]
fn example_scores_sum_unmasked_steps() {
    let mut net = network(30);
    let ds = gapped(3.0);
    let per_example = net.score_examples(&ds).unwrap().unwrap();
    assert_eq!(per_example.shape(), &[2, 1]);
    let score = net.score_dataset(&ds).unwrap().unwrap();
    assert_abs_diff_eq!(per_example.sum() / 2.0, score, epsilon = 1e-4);

    // Changing what sits under the mask changes no example's score.
    assert_eq!(net.score_examples(&gapped(-8.0)).unwrap().unwrap(), per_example);
}
