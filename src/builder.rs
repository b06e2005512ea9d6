//! Network builder.
//!
//! `NetworkBuilder` is the recommended way to define a network: it collects the configuration
//! and the ordered layer nodes, validates both, and hands back an initialized [`Network`].

use crate::config::NetworkConfig;
use crate::layer::Node;
use crate::network::Network;
use crate::stack::LayerStack;
use crate::{Error, Result, Tensor};

/// Builder for a [`Network`].
///
/// Example:
///
/// ```rust
/// use rust_stacknet::{Activation, Dense, Loss, LossOutput, NetworkBuilder, NetworkConfig, Node};
///
/// # fn main() -> rust_stacknet::Result<()> {
/// let net = NetworkBuilder::new(NetworkConfig::default())
///     .layer(Node::standard(Dense::new(2, 8, Activation::ReLU)))
///     .layer(Node::output(LossOutput::new(8, 1, Activation::Identity, Loss::Mse)))
///     .build()?;
/// assert_eq!(net.num_params(), 2 * 8 + 8 + 8 + 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct NetworkBuilder {
    config: NetworkConfig,
    nodes: Vec<Node>,
}

impl NetworkBuilder {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            nodes: Vec::new(),
        }
    }

    /// Append a layer slot.
    pub fn layer(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Convenience for [`NetworkConfig::seed`].
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Validate and initialize with randomly drawn parameters.
    pub fn build(self) -> Result<Network> {
        let (config, stack) = self.into_parts()?;
        Network::new(config, stack)
    }

    /// Validate and initialize from a `[1, n]` row vector of parameters.
    pub fn build_with_params(self, params: &Tensor) -> Result<Network> {
        let (config, stack) = self.into_parts()?;
        Network::init(config, stack, Some(params))
    }

    /// The layers as a stack, for nesting inside another network.
    pub fn build_stack(self) -> Result<LayerStack> {
        self.into_parts().map(|(_, stack)| stack)
    }

    fn into_parts(self) -> Result<(NetworkConfig, LayerStack)> {
        if self.nodes.is_empty() {
            return Err(Error::InvalidConfig(
                "network must have at least one layer".to_owned(),
            ));
        }
        self.config.validate()?;
        Ok((self.config, LayerStack::new(self.nodes)?))
    }
}
