use std::sync::Arc;
use std::thread;

use approx::assert_abs_diff_eq;

use rust_stacknet::{
    Activation, DataSet, Dense, Error, GradientsAccumulator, Loss, LossOutput, Network,
    NetworkBuilder, NetworkConfig, Node, Optimizer, Result, SharedGradientsAccumulator, Tensor,
};

fn network() -> Network {
    NetworkBuilder::new(NetworkConfig {
        lr: 0.1,
        ..NetworkConfig::default()
    })
    .seed(21)
    .layer(Node::standard(Dense::new(2, 3, Activation::Tanh)))
    .layer(Node::output(LossOutput::new(3, 1, Activation::Identity, Loss::Mse)))
    .build()
    .unwrap()
}

fn batch(offset: f32) -> DataSet {
    DataSet::from_rows(
        &[vec![offset, 1.0], vec![1.0, -offset]],
        &[vec![1.0], vec![-1.0]],
    )
    .unwrap()
}

/// Update a standalone copy would apply for `ds`.
fn standalone_update(net: &Network, ds: &DataSet) -> Vec<f32> {
    let mut copy = net.clone();
    let before = copy.params();
    copy.fit_batch(ds).unwrap().unwrap();
    before
        .iter()
        .zip(copy.params().iter())
        .map(|(b, a)| b - a)
        .collect()
}

fn assert_close(actual: &Tensor, expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert_abs_diff_eq!(*a, *e, epsilon = 1e-6);
    }
}

#[test]
fn each_party_also_applies_the_others_updates() {
    let mut a = network();
    let mut b = network();
    let start: Vec<f32> = a.params().iter().copied().collect();
    let (da, db) = (batch(0.5), batch(-0.25));
    let ua = standalone_update(&a, &da);
    let ub = standalone_update(&b, &db);

    let acc = Arc::new(SharedGradientsAccumulator::new(a.num_params()));
    a.set_gradients_accumulator(acc.clone()).unwrap();
    b.set_gradients_accumulator(acc).unwrap();

    // a goes first: nothing pending yet, so it applies only its own update.
    a.fit_batch(&da).unwrap().unwrap();
    let expected_a: Vec<f32> = start.iter().zip(&ua).map(|(p, u)| p - u).collect();
    assert_close(&a.params(), &expected_a);

    // b applies its own update plus the one a published.
    b.fit_batch(&db).unwrap().unwrap();
    let expected_b: Vec<f32> = start
        .iter()
        .zip(ua.iter().zip(&ub))
        .map(|(p, (x, y))| p - x - y)
        .collect();
    assert_close(&b.params(), &expected_b);
}

#[test]
fn clones_do_not_inherit_the_accumulator() {
    let mut a = network();
    let acc = Arc::new(SharedGradientsAccumulator::new(a.num_params()));
    a.set_gradients_accumulator(acc.clone()).unwrap();

    let mut copy = a.clone();
    copy.fit_batch(&batch(1.0)).unwrap().unwrap();

    // Nothing was published, so `a`'s next step is its own update only.
    let ua = standalone_update(&a, &batch(0.0));
    let start: Vec<f32> = a.params().iter().copied().collect();
    a.fit_batch(&batch(0.0)).unwrap().unwrap();
    let expected: Vec<f32> = start.iter().zip(&ua).map(|(p, u)| p - u).collect();
    assert_close(&a.params(), &expected);
}

#[test]
fn parties_can_train_on_separate_threads() {
    let acc = Arc::new(SharedGradientsAccumulator::new(network().num_params()));
    let handles: Vec<_> = (0..3)
        .map(|party| {
            let acc = Arc::clone(&acc);
            thread::spawn(move || {
                let mut net = network();
                net.set_gradients_accumulator(acc).unwrap();
                for step in 0..5 {
                    net.fit_batch(&batch(party as f32 * 0.1 + step as f32 * 0.01))
                        .unwrap()
                        .unwrap();
                }
                net.config().iteration_count
            })
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), 5);
    }
}

fn momentum_network() -> Network {
    NetworkBuilder::new(NetworkConfig {
        lr: 0.1,
        optimizer: Optimizer::SgdMomentum { momentum: 0.9 },
        ..NetworkConfig::default()
    })
    .seed(21)
    .layer(Node::output(LossOutput::new(2, 1, Activation::Identity, Loss::Mse)))
    .build()
    .unwrap()
}

#[test]
fn an_accumulator_of_the_wrong_size_is_rejected_on_attach() {
    let mut net = momentum_network();
    let acc = Arc::new(SharedGradientsAccumulator::new(999));
    assert!(matches!(
        net.set_gradients_accumulator(acc),
        Err(Error::ShapeMismatch(_))
    ));
    net.fit_batch(&batch(0.5)).unwrap().unwrap();
    assert_eq!(net.config().iteration_count, 1);
}

/// Accepts registration but refuses every exchange.
#[derive(Debug)]
struct Unreachable(usize);

impl GradientsAccumulator for Unreachable {
    fn num_params(&self) -> usize {
        self.0
    }

    fn register(&self) -> Result<usize> {
        Ok(0)
    }

    fn store_update(&self, _party: usize, _update: &[f32]) -> Result<()> {
        Err(Error::Concurrency("peer unreachable".to_owned()))
    }

    fn apply_update(&self, _party: usize, _update: &mut [f32]) -> Result<()> {
        Ok(())
    }
}

#[test]
fn a_failed_exchange_leaves_params_and_updater_state_untouched() {
    let mut net = momentum_network();
    net.fit_batch(&batch(0.5)).unwrap().unwrap();
    net.set_gradients_accumulator(Arc::new(Unreachable(net.num_params())))
        .unwrap();

    let params = net.params();
    let state = net.updater_state();
    assert!(matches!(
        net.fit_batch(&batch(-0.25)),
        Err(Error::Concurrency(_))
    ));
    assert_eq!(net.params(), params);
    assert_eq!(net.updater_state(), state);
    assert_eq!(net.config().iteration_count, 1);
}
