//! A layered-network training engine.
//!
//! `rust-stacknet` trains an ordered stack of layers. The engine owns the parts that make an
//! arbitrary layer sequence trainable; the layers themselves are black boxes behind the
//! [`Layer`] contract.
//!
//! # Design
//!
//! - One flat parameter buffer per network. Every layer reads and writes only its own
//!   contiguous sub-range; layer `i`'s range starts where layer `i - 1`'s ends, and layers
//!   without parameters have no range at all. A gradient buffer with the same layout receives
//!   each backward pass.
//! - Scoped workspaces ([`Workspace`]) bound what a training step allocates. Each layer step
//!   runs in its own nested scope; results that must outlive it are promoted outwards.
//! - Capabilities are tagged once ([`Node`]): standard, recurrent, output, frozen, or a nested
//!   [`LayerStack`]. A frozen layer ends the backward pass.
//! - Recurrent layers keep their state between [`Network::rnn_time_step`] calls, and truncated
//!   BPTT carries it from one time segment to the next.
//!
//! # Errors
//!
//! Every fallible operation returns [`Result`]. [`Error::UnsupportedConfiguration`] is special:
//! it marks a legitimate partial setup (for example a stack without a terminal output layer).
//! The engine logs it with `tracing::warn!` and the operation returns `Ok(None)`.
//!
//! # Data layout and shapes
//!
//! - Scalars are `f32`; tensors are [`Tensor`] (`ndarray::ArcArray<f32, IxDyn>`).
//! - Feed-forward activations are `[batch, features]`, time series `[batch, features, time]`,
//!   time-series masks `[batch, time]`.
//! - Parameter keys are `"<layer>_<name>"`, e.g. `"0_W"`.
//!
//! # Quick start
//!
//! ```rust
//! use rust_stacknet::{
//!     Activation, DataSet, Dense, Loss, LossOutput, NetworkBuilder, NetworkConfig, Node,
//! };
//!
//! # fn main() -> rust_stacknet::Result<()> {
//! let train = DataSet::from_rows(
//!     &[vec![0.0, 0.0], vec![0.0, 1.0], vec![1.0, 0.0], vec![1.0, 1.0]],
//!     &[vec![0.0], vec![1.0], vec![1.0], vec![0.0]],
//! )?;
//!
//! let mut net = NetworkBuilder::new(NetworkConfig::default())
//!     .layer(Node::standard(Dense::new(2, 8, Activation::Tanh)))
//!     .layer(Node::output(LossOutput::new(8, 1, Activation::Sigmoid, Loss::Mse)))
//!     .build()?;
//!
//! for _ in 0..10 {
//!     net.fit_dataset(&train, 4)?;
//! }
//! assert_eq!(net.config().epoch_count, 10);
//! let out = net.output(&train.features, false)?;
//! assert_eq!(out.shape(), &[4, 1]);
//! # Ok(())
//! # }
//! ```
//!
//! # MSRV
//!
//! This crate's minimum supported Rust version (MSRV) is specified in `Cargo.toml`.

pub mod activation;
mod backward;
pub mod builder;
pub mod config;
pub mod data;
pub mod envelope;
pub mod error;
mod forward;
pub mod layer;
pub mod layers;
pub mod listener;
pub mod loss;
pub mod network;
pub mod optim;
pub mod params;
mod recurrent;
pub mod stack;
pub mod tensor;
pub mod train;
pub mod workspace;

pub use activation::Activation;
pub use builder::NetworkBuilder;
pub use config::{BackpropType, NetworkConfig};
pub use data::{AsyncBatchIterator, BatchIterator, DataSet, ListBatchIterator};
pub use envelope::{
    Activations, BackpropResult, FlatOrder, GradientEntry, GradientMap, Gradients, MaskState,
    TensorMap,
};
pub use error::{Error, Result};
pub use layer::{Layer, Node, NodeKind, OutputLayer, RecurrentLayer, RnnState};
pub use layers::{ActivationLayer, Dense, Init, LossOutput, SimpleRnn};
pub use listener::{ScoreLogger, TrainingListener};
pub use loss::Loss;
pub use network::Network;
pub use optim::{
    GradientsAccumulator, LrSchedule, Optimizer, OptimizerUpdater, SharedGradientsAccumulator,
    Updater,
};
pub use params::{GradientBuffer, ParamLayout, ParamSpec, ParamStore};
pub use recurrent::segment_ranges;
pub use stack::LayerStack;
pub use tensor::Tensor;
pub use train::FitReport;
pub use workspace::{
    AllocationPolicy, ArenaState, CacheMode, LearningPolicy, Leverage, MemoryLocation,
    MirroringPolicy, ResetPolicy, SpillPolicy, Workspace, WorkspaceConfig, WorkspaceKind,
    WorkspaceMode, WorkspaceScope, Workspaces,
};
