use approx::assert_abs_diff_eq;
use rand::rngs::StdRng;

use rust_stacknet::{
    Activation, Activations, DataSet, Dense, FlatOrder, Gradients, Layer, ListBatchIterator, Loss,
    LossOutput, Network, NetworkBuilder, NetworkConfig, Node, ParamSpec, Result, Tensor,
    Workspace, tensor,
};

/// Subtracts a learned per-feature mean; pretraining pulls the mean halfway towards the batch.
#[derive(Debug, Clone)]
struct Centering {
    n: usize,
}

impl Centering {
    fn column_means(&self, t: &Tensor) -> Vec<f32> {
        let rows = t.shape()[0];
        (0..self.n)
            .map(|j| (0..rows).map(|i| t[[i, j]]).sum::<f32>() / rows as f32)
            .collect()
    }
}

impl Layer for Centering {
    fn layer_type(&self) -> &'static str {
        "Centering"
    }

    fn param_specs(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::new("mean", &[1, self.n], FlatOrder::RowMajor)]
    }

    fn init_params(&self, params: &mut [f32], _rng: &mut StdRng) {
        params.fill(0.0);
    }

    fn activate(
        &mut self,
        params: &[f32],
        input: Activations,
        _training: bool,
        _ws: &mut Workspace,
    ) -> Result<Activations> {
        let mut out = input.tensor.to_owned();
        for i in 0..out.shape()[0] {
            for (j, m) in params.iter().enumerate() {
                out[[i, j]] -= m;
            }
        }
        Ok(input.map_tensor(out.into_shared()))
    }

    fn backprop_gradient(
        &mut self,
        _params: &[f32],
        epsilon: Gradients,
        _ws: &mut Workspace,
    ) -> Result<Gradients> {
        let eps = epsilon.activation_grad.clone().unwrap_or_else(|| tensor::zeros(&[1, self.n]));
        let rows = eps.shape()[0];
        let dmean: Vec<f32> = (0..self.n)
            .map(|j| -(0..rows).map(|i| eps[[i, j]]).sum::<f32>())
            .collect();
        let mut out = Gradients {
            activation_grad: Some(eps),
            mask: epsilon.mask,
            mask_state: epsilon.mask_state,
            ..Gradients::default()
        };
        out.params.push("mean", tensor::row_vector(&dmean), FlatOrder::RowMajor);
        Ok(out)
    }

    fn is_pretrain_layer(&self) -> bool {
        true
    }

    fn pretrain_step(
        &mut self,
        params: &mut [f32],
        input: &Activations,
        _ws: &mut Workspace,
    ) -> Result<f32> {
        let means = self.column_means(&input.tensor);
        let mut score = 0.0;
        for (p, m) in params.iter_mut().zip(means) {
            score += (m - *p) * (m - *p);
            *p += 0.5 * (m - *p);
        }
        Ok(score)
    }

    fn box_clone(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

fn network(pretrain: bool, backprop: bool) -> Network {
    NetworkBuilder::new(NetworkConfig {
        pretrain,
        backprop,
        ..NetworkConfig::default()
    })
    .seed(2)
    .layer(Node::standard(Dense::new(2, 2, Activation::Tanh)))
    .layer(Node::standard(Centering { n: 2 }))
    .layer(Node::output(LossOutput::new(2, 1, Activation::Identity, Loss::Mse)))
    .build()
    .unwrap()
}

fn data() -> DataSet {
    DataSet::from_rows(
        &[vec![0.2, 0.4], vec![-0.6, 0.1], vec![0.9, -0.3], vec![0.5, 0.5]],
        &[vec![1.0], vec![0.0], vec![0.5], vec![0.2]],
    )
    .unwrap()
}

#[test]
fn pretraining_a_layer_uses_the_activations_below_it() {
    let mut net = network(false, true);
    let ds = data();
    let below = net.activate_selected_layers(0, 0, &ds.features).unwrap();
    let expected: Vec<f32> = Centering { n: 2 }
        .column_means(&below)
        .into_iter()
        .map(|m| 0.5 * m)
        .collect();

    let mut batches = ListBatchIterator::from_dataset(&ds, 4).unwrap();
    let score = net.pretrain_layer(1, &mut batches).unwrap();
    assert!(score.is_some());

    let mean = net.get_param(1, "mean").unwrap();
    assert_eq!(mean.shape(), &[1, 2]);
    for (j, e) in expected.iter().enumerate() {
        assert_abs_diff_eq!(mean[[0, j]], *e, epsilon = 1e-6);
    }
    assert!(net.input().is_none());
}

#[test]
fn layers_without_a_pretrain_step_are_skipped() {
    let mut net = network(false, true);
    let before = net.params();
    let mut batches = ListBatchIterator::from_dataset(&data(), 2).unwrap();
    assert_eq!(net.pretrain_layer(0, &mut batches).unwrap(), None);
    assert_eq!(net.params(), before);
}

#[test]
fn pretrain_only_fit_never_applies_an_update() {
    let mut net = network(true, false);
    let dense = net.get_param(0, "W").unwrap();
    let report = net.fit_dataset(&data(), 2).unwrap();

    assert_eq!(report.iterations, 0);
    assert_eq!(net.config().iteration_count, 0);
    assert_eq!(net.config().epoch_count, 1);
    assert_eq!(net.get_param(0, "W").unwrap(), dense);
    assert!(net.get_param(1, "mean").unwrap().iter().any(|&m| m != 0.0));
}

#[test]
fn pretraining_then_backprop_rewinds_the_batches() {
    let mut net = network(true, true);
    let report = net.fit_dataset(&data(), 2).unwrap();
    assert_eq!(report.iterations, 2);
    assert_eq!(net.config().iteration_count, 2);
    assert!(report.final_score.is_some());
}
