use rand::rngs::StdRng;

use crate::envelope::{Activations, Gradients};
use crate::layer::Layer;
use crate::params::ParamSpec;
use crate::workspace::Workspace;
use crate::{Activation, Error, Result, Tensor};

/// Parameterless layer applying an activation element-wise.
#[derive(Debug, Clone)]
pub struct ActivationLayer {
    activation: Activation,
    output: Option<Tensor>,
}

impl ActivationLayer {
    pub fn new(activation: Activation) -> Self {
        Self {
            activation,
            output: None,
        }
    }
}

impl Layer for ActivationLayer {
    fn layer_type(&self) -> &'static str {
        "Activation"
    }

    fn param_specs(&self) -> Vec<ParamSpec> {
        Vec::new()
    }

    fn init_params(&self, _params: &mut [f32], _rng: &mut StdRng) {}

    fn activate(
        &mut self,
        _params: &[f32],
        input: Activations,
        training: bool,
        ws: &mut Workspace,
    ) -> Result<Activations> {
        let mut y = ws.alloc(input.tensor.shape())?;
        y.assign(&input.tensor);
        self.activation.apply(&mut y);
        if training {
            self.output = Some(y.clone());
        }
        Ok(input.map_tensor(y))
    }

    fn backprop_gradient(
        &mut self,
        _params: &[f32],
        epsilon: Gradients,
        ws: &mut Workspace,
    ) -> Result<Gradients> {
        let y = self.output.as_ref().ok_or_else(|| {
            Error::MissingInput("activation backprop called without a training forward pass".to_owned())
        })?;
        let incoming = epsilon
            .activation_grad
            .ok_or_else(|| Error::MissingInput("activation backprop needs an output error".to_owned()))?;
        let mut eps = ws.alloc(incoming.shape())?;
        eps.assign(&incoming);
        self.activation.backprop_inplace(y, &mut eps)?;
        Ok(Gradients {
            activation_grad: Some(eps),
            mask: epsilon.mask,
            mask_state: epsilon.mask_state,
            ..Gradients::default()
        })
    }

    fn clear(&mut self) {
        self.output = None;
    }

    fn box_clone(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}
