//! Backward pipeline.
//!
//! Layers are visited from last to first. Each layer's named gradients are buffered and
//! prepended, so the final map still lists layer 0 first no matter the traversal direction.
//! A frozen layer ends the traversal: neither it nor anything below it sees a gradient.

use std::collections::VecDeque;

use crate::envelope::{BackpropResult, GradientEntry, GradientMap, Gradients};
use crate::error::soften;
use crate::layer::Node;
use crate::stack::LayerStack;
use crate::workspace::Workspaces;
use crate::{Error, Result, Tensor};

impl LayerStack {
    /// Gradients for every trainable layer.
    ///
    /// With `with_output_layer` the last layer must be an output layer with labels set and
    /// `epsilon` is ignored; otherwise `epsilon` is dL/d(output of the last layer), and a stack
    /// ending in an output layer is rejected. Both a missing output layer and an external error
    /// aimed at one are logged no-ops (`Ok(None)`); missing labels are an error.
    ///
    /// `tbptt_back_length` limits how far recurrent layers propagate back in time.
    pub fn backprop_gradients(
        &mut self,
        params: &[f32],
        epsilon: Option<Tensor>,
        with_output_layer: bool,
        tbptt_back_length: Option<usize>,
        ws: &mut Workspaces,
    ) -> Result<Option<BackpropResult>> {
        soften(self.calc_backprop_gradients(params, epsilon, with_output_layer, tbptt_back_length, ws))
    }

    fn calc_backprop_gradients(
        &mut self,
        params: &[f32],
        epsilon: Option<Tensor>,
        with_output_layer: bool,
        tbptt_back_length: Option<usize>,
        ws: &mut Workspaces,
    ) -> Result<BackpropResult> {
        self.check_params(params)?;
        let n = self.nodes.len();

        // Output layer entries go last.
        let mut output_entries = GradientMap::new();
        let (mut current, layer_from) = if with_output_layer {
            let (output, view) = self.output_layer_mut(params)?;
            if !output.has_labels() {
                return Err(Error::MissingLabels);
            }
            let grads = ws.micro_step(|scope| output.backprop_gradient(view, Gradients::default(), scope))?;
            output_entries = grads.params.prefixed(n - 1);
            (grads.activation_grad, n.checked_sub(2))
        } else {
            if matches!(self.nodes.last(), Some(Node::Output(_))) {
                return Err(Error::UnsupportedConfiguration(
                    "cannot backpropagate an external error into an output layer".to_owned(),
                ));
            }
            let eps = epsilon.ok_or_else(|| {
                Error::MissingInput("an output error is required without an output layer".to_owned())
            })?;
            (Some(eps), Some(n - 1))
        };

        let mut ordered: VecDeque<GradientEntry> = VecDeque::new();
        if let Some(layer_from) = layer_from {
            for idx in (0..=layer_from).rev() {
                let Some(eps) = current.take() else {
                    break;
                };
                let view = self.layout.slice(params, idx);
                let grads = match &mut self.nodes[idx] {
                    Node::Frozen(_) => break,
                    Node::Standard(layer) => {
                        ws.micro_step(|s| layer.backprop_gradient(view, Gradients::epsilon(eps), s))?
                    }
                    Node::Output(layer) => {
                        ws.micro_step(|s| layer.backprop_gradient(view, Gradients::epsilon(eps), s))?
                    }
                    Node::Recurrent(layer) => match tbptt_back_length {
                        Some(k) => ws.micro_step(|s| {
                            layer.tbptt_backprop_gradient(view, Gradients::epsilon(eps), k, s)
                        })?,
                        None => ws.micro_step(|s| {
                            layer.backprop_gradient(view, Gradients::epsilon(eps), s)
                        })?,
                    },
                    Node::Nested(inner) => {
                        match inner.backprop_gradients(view, Some(eps), false, tbptt_back_length, ws)? {
                            Some(result) => Gradients {
                                activation_grad: result.input_error,
                                params: result.gradients,
                                ..Gradients::default()
                            },
                            None => break,
                        }
                    }
                };

                // Prepend this layer's entries while keeping their own order.
                let entries: Vec<GradientEntry> = grads.params.prefixed(idx).into_iter().collect();
                for entry in entries.into_iter().rev() {
                    ordered.push_front(entry);
                }
                current = grads.activation_grad;
            }
        }

        let mut gradients: GradientMap = ordered.into_iter().collect();
        gradients.extend(output_entries);
        Ok(BackpropResult {
            gradients,
            input_error: current,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Activation;
    use crate::layer::OutputLayer;
    use crate::layers::{Dense, LossOutput};
    use crate::loss::Loss;
    use crate::tensor;
    use crate::envelope::Activations;

    fn network() -> LayerStack {
        LayerStack::new(vec![
            Node::standard(Dense::new(2, 3, Activation::Tanh)),
            Node::standard(Dense::new(3, 3, Activation::Tanh)),
            Node::output(LossOutput::new(3, 1, Activation::Identity, Loss::Mse)),
        ])
        .unwrap()
    }

    fn forward(stack: &mut LayerStack, params: &[f32], ws: &mut Workspaces) {
        let input = Activations::new(tensor::from_vec(&[2, 2], vec![0.5, -0.5, 1.0, 0.2]).unwrap());
        let acts = stack.feed_forward_to_layer(params, &input, 1, true, ws).unwrap();
        let (out, _) = stack.output_layer_mut(params).unwrap();
        out.set_input(acts[2].clone());
        out.set_labels(Some(tensor::from_vec(&[2, 1], vec![1.0, 0.0]).unwrap()), None);
    }

    #[test]
    fn gradients_come_out_in_layer_order() {
        let mut stack = network();
        let params: Vec<f32> = (0..stack.num_params()).map(|i| (i as f32 * 0.37).sin() * 0.5).collect();
        let mut ws = Workspaces::default();
        forward(&mut stack, &params, &mut ws);

        let result = stack
            .backprop_gradients(&params, None, true, None, &mut ws)
            .unwrap()
            .unwrap();
        let keys: Vec<&str> = result.gradients.keys().collect();
        assert_eq!(keys, vec!["0_W", "0_b", "1_W", "1_b", "2_W", "2_b"]);
        assert_eq!(result.input_error.unwrap().shape(), &[2, 2]);
    }

    #[test]
    fn missing_labels_is_an_error_and_missing_output_layer_is_a_no_op() {
        let mut stack = network();
        let params = vec![0.1; stack.num_params()];
        let mut ws = Workspaces::default();
        assert_eq!(
            stack.backprop_gradients(&params, None, true, None, &mut ws),
            Err(Error::MissingLabels)
        );

        let mut plain = LayerStack::new(vec![Node::standard(Dense::new(2, 1, Activation::Tanh))]).unwrap();
        let params = vec![0.1; plain.num_params()];
        assert_eq!(plain.backprop_gradients(&params, None, true, None, &mut ws), Ok(None));
    }

    #[test]
    fn external_epsilon_entry_point_skips_the_loss() {
        let mut stack = LayerStack::new(vec![
            Node::standard(Dense::new(2, 3, Activation::Tanh)),
            Node::standard(Dense::new(3, 2, Activation::Identity)),
        ])
        .unwrap();
        let params = vec![0.2; stack.num_params()];
        let mut ws = Workspaces::default();
        let input = Activations::new(tensor::from_vec(&[1, 2], vec![1.0, 2.0]).unwrap());
        stack.feed_forward_to_layer(&params, &input, 1, true, &mut ws).unwrap();

        let eps = tensor::from_vec(&[1, 2], vec![1.0, -1.0]).unwrap();
        let result = stack
            .backprop_gradients(&params, Some(eps), false, None, &mut ws)
            .unwrap()
            .unwrap();
        assert_eq!(result.gradients.len(), 4);
        assert!(result.input_error.is_some());

        assert!(matches!(
            stack.backprop_gradients(&params, None, false, None, &mut ws),
            Err(Error::MissingInput(_))
        ));
    }

    #[test]
    fn external_epsilon_is_refused_by_an_output_layer() {
        let mut stack = network();
        let params = vec![0.1; stack.num_params()];
        let mut ws = Workspaces::default();
        forward(&mut stack, &params, &mut ws);

        let eps = tensor::from_vec(&[2, 1], vec![1.0, 1.0]).unwrap();
        assert_eq!(
            stack.backprop_gradients(&params, Some(eps), false, None, &mut ws),
            Ok(None)
        );
    }
}
