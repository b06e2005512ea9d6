//! Forward pipeline.

use crate::envelope::Activations;
use crate::layer::{Node, dispatch};
use crate::stack::LayerStack;
use crate::workspace::{WorkspaceMode, Workspaces};
use crate::{Error, Result};

impl LayerStack {
    /// Activations of every layer up to and including `last`.
    ///
    /// `result[0]` is (a shallow copy of) `input`; `result[i + 1]` is layer `i`'s output.
    /// Each layer runs as one micro-step: its own nested scope, with the output promoted
    /// into the external arena before the scope closes.
    pub fn feed_forward_to_layer(
        &mut self,
        params: &[f32],
        input: &Activations,
        last: usize,
        training: bool,
        ws: &mut Workspaces,
    ) -> Result<Vec<Activations>> {
        if last >= self.nodes.len() {
            return Err(Error::index("layer", last, self.nodes.len()));
        }
        self.check_params(params)?;

        let mut activations = Vec::with_capacity(last + 2);
        activations.push(input.shallow_clone());
        for idx in 0..=last {
            let current = activations
                .last()
                .map(Activations::shallow_clone)
                .ok_or_else(|| Error::MissingInput("empty activation list".to_owned()))?;
            let out = self.activate_node(params, idx, current, training, ws)?;
            activations.push(out);
        }

        if !training && ws.mode() == WorkspaceMode::Separate {
            ws.feed_forward.initialize_workspace();
        }
        Ok(activations)
    }

    /// Output of layer `to` when `input` is fed straight into layer `from`.
    pub fn activate_selected_layers(
        &mut self,
        params: &[f32],
        from: usize,
        to: usize,
        input: &Activations,
        ws: &mut Workspaces,
    ) -> Result<Activations> {
        let n = self.nodes.len();
        if from >= n {
            return Err(Error::index("from layer", from, n));
        }
        if to >= n {
            return Err(Error::index("to layer", to, n));
        }
        if from > to {
            return Err(Error::InvalidIndex(format!(
                "from layer {from} is after to layer {to}"
            )));
        }
        self.check_params(params)?;

        let mut current = input.shallow_clone();
        for idx in from..=to {
            current = self.activate_node(params, idx, current, false, ws)?;
        }
        Ok(current)
    }

    /// Run one node. Frozen layers always run in inference mode.
    pub(crate) fn activate_node(
        &mut self,
        params: &[f32],
        idx: usize,
        input: Activations,
        training: bool,
        ws: &mut Workspaces,
    ) -> Result<Activations> {
        let view = self.layout.slice(params, idx);
        let node = &mut self.nodes[idx];
        node.set_input_mini_batch_size(input.batch_size());
        let training = training && !node.is_frozen();

        dispatch!(
            node,
            layer => ws.micro_step(|scope| layer.activate(view, input, training, scope)),
            nested => {
                let last = nested.len() - 1;
                let mut acts = nested.feed_forward_to_layer(view, &input, last, training, ws)?;
                acts.pop()
                    .ok_or_else(|| Error::MissingInput("nested stack produced no output".to_owned()))
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Activation;
    use crate::layers::{ActivationLayer, Dense};
    use crate::tensor;
    use crate::workspace::{CacheMode, WorkspaceMode};

    fn stack() -> LayerStack {
        LayerStack::new(vec![
            Node::standard(Dense::new(2, 3, Activation::Identity)),
            Node::standard(ActivationLayer::new(Activation::ReLU)),
            Node::standard(Dense::new(3, 1, Activation::Identity)),
        ])
        .unwrap()
    }

    #[test]
    fn feed_forward_returns_input_plus_one_entry_per_layer() {
        let mut s = stack();
        let params = vec![0.1; s.num_params()];
        let mut ws = Workspaces::new(WorkspaceMode::Separate, CacheMode::None).unwrap();
        let input = Activations::new(tensor::from_vec(&[4, 2], vec![1.0; 8]).unwrap());

        let acts = s
            .feed_forward_to_layer(&params, &input, 2, false, &mut ws)
            .unwrap();
        assert_eq!(acts.len(), 4);
        assert_eq!(acts[0], input);
        assert_eq!(acts[1].tensor.shape(), &[4, 3]);
        assert_eq!(acts[3].tensor.shape(), &[4, 1]);

        let partial = s
            .feed_forward_to_layer(&params, &input, 0, true, &mut ws)
            .unwrap();
        assert_eq!(partial.len(), 2);

        assert!(matches!(
            s.feed_forward_to_layer(&params, &input, 3, true, &mut ws),
            Err(Error::InvalidIndex(_))
        ));
        assert!(matches!(
            s.feed_forward_to_layer(&params[1..], &input, 2, true, &mut ws),
            Err(Error::ShapeMismatch(_))
        ));
    }

    #[test]
    fn activate_selected_layers_checks_bounds() {
        let mut s = stack();
        let params = vec![0.1; s.num_params()];
        let mut ws = Workspaces::default();
        let hidden = Activations::new(tensor::from_vec(&[1, 3], vec![1.0, -1.0, 2.0]).unwrap());

        let out = s
            .activate_selected_layers(&params, 1, 2, &hidden, &mut ws)
            .unwrap();
        // relu -> [1, 0, 2]; dense with all weights and bias 0.1 -> 0.3 + 0.1
        assert!((out.tensor[[0, 0]] - 0.4).abs() < 1e-6);

        assert!(s.activate_selected_layers(&params, 2, 1, &hidden, &mut ws).is_err());
        assert!(matches!(
            s.activate_selected_layers(&params, 0, 3, &hidden, &mut ws),
            Err(Error::InvalidIndex(_))
        ));
    }
}
