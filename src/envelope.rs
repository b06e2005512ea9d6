//! Carriers for data flowing between layers.
//!
//! [`Activations`] travels forward, [`Gradients`] travels backward. Both bundle a tensor with
//! its optional mask and mask state; gradients additionally carry the named parameter
//! gradients of the layer that produced them, each tagged with the order it must be
//! flattened in.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::Tensor;

/// How a mask attached to an envelope should be interpreted.
///
/// `None` on the envelope means "no mask state" (no mask was ever attached).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskState {
    /// The mask applies to this layer.
    Active,
    /// The mask is carried along but not applied.
    Passthrough,
}

/// Order in which a named tensor is written into (and read out of) a flat buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FlatOrder {
    /// `c` order: last axis varies fastest.
    #[default]
    RowMajor,
    /// `f` order: first axis varies fastest.
    ColumnMajor,
}

/// Forward envelope: a layer input or output.
#[derive(Debug, Clone, PartialEq)]
pub struct Activations {
    pub tensor: Tensor,
    pub mask: Option<Tensor>,
    pub mask_state: Option<MaskState>,
}

impl Activations {
    #[inline]
    pub fn new(tensor: Tensor) -> Self {
        Self {
            tensor,
            mask: None,
            mask_state: None,
        }
    }

    #[inline]
    pub fn with_mask(tensor: Tensor, mask: Option<Tensor>, mask_state: Option<MaskState>) -> Self {
        Self {
            tensor,
            mask,
            mask_state,
        }
    }

    /// Copy handed to a layer; the data is shared until either side writes.
    #[inline]
    pub fn shallow_clone(&self) -> Self {
        self.clone()
    }

    /// Same mask and state, new tensor.
    #[inline]
    pub fn map_tensor(&self, tensor: Tensor) -> Self {
        Self {
            tensor,
            mask: self.mask.clone(),
            mask_state: self.mask_state,
        }
    }

    #[inline]
    pub fn batch_size(&self) -> usize {
        self.tensor.shape().first().copied().unwrap_or(0)
    }

    #[inline]
    pub fn is_time_series(&self) -> bool {
        self.tensor.ndim() == 3
    }

    #[inline]
    pub fn mask_is_active(&self) -> bool {
        self.mask.is_some() && self.mask_state == Some(MaskState::Active)
    }
}

impl From<Tensor> for Activations {
    fn from(tensor: Tensor) -> Self {
        Self::new(tensor)
    }
}

/// Ordered `name -> tensor` mapping.
///
/// Iteration follows insertion order, which is what makes parameter tables and gradient maps
/// come out in layer order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorMap {
    entries: Vec<(String, Tensor)>,
}

impl TensorMap {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, t)| t)
    }

    /// Insert or replace, keeping the original position on replace.
    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = tensor,
            None => self.entries.push((key, tensor)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Tensor> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|(k, t)| (k.as_str(), t))
    }

    /// Whether both maps hold exactly the same key set, ignoring order.
    pub fn same_keys(&self, other: &TensorMap) -> bool {
        self.len() == other.len() && self.keys().all(|k| other.get(k).is_some())
    }
}

impl FromIterator<(String, Tensor)> for TensorMap {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        let mut map = TensorMap::new();
        for (k, t) in iter {
            map.insert(k, t);
        }
        map
    }
}

/// One named parameter gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientEntry {
    pub key: String,
    pub tensor: Tensor,
    pub order: FlatOrder,
}

/// Ordered parameter gradients.
///
/// Inside a layer the keys are bare parameter names (`"W"`); once the backward pipeline has
/// collected them they are prefixed with the layer index (`"0_W"`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GradientMap {
    entries: Vec<GradientEntry>,
}

impl GradientMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, tensor: Tensor, order: FlatOrder) {
        self.entries.push(GradientEntry {
            key: key.into(),
            tensor,
            order,
        });
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&GradientEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, GradientEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, GradientEntry> {
        self.entries.iter_mut()
    }

    /// Same entries with every key prefixed by `"<prefix>_"`.
    pub fn prefixed(self, prefix: usize) -> Self {
        Self {
            entries: self
                .entries
                .into_iter()
                .map(|e| GradientEntry {
                    key: format!("{prefix}_{}", e.key),
                    ..e
                })
                .collect(),
        }
    }

    pub fn extend(&mut self, other: GradientMap) {
        self.entries.extend(other.entries);
    }
}

impl IntoIterator for GradientMap {
    type Item = GradientEntry;
    type IntoIter = std::vec::IntoIter<GradientEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl FromIterator<GradientEntry> for GradientMap {
    fn from_iter<I: IntoIterator<Item = GradientEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Backward envelope.
///
/// Going into a layer, `activation_grad` is dL/d(output) and `params` is empty. Coming out,
/// `activation_grad` is dL/d(input) (absent when the layer has nothing upstream to feed) and
/// `params` holds the layer's own parameter gradients.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gradients {
    pub activation_grad: Option<Tensor>,
    pub mask: Option<Tensor>,
    pub mask_state: Option<MaskState>,
    pub params: GradientMap,
}

impl Gradients {
    pub fn epsilon(tensor: Tensor) -> Self {
        Self {
            activation_grad: Some(tensor),
            ..Self::default()
        }
    }
}

/// Result of a full backward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct BackpropResult {
    /// Keys `"<layer>_<name>"`, layer 0 first.
    pub gradients: GradientMap,
    /// dL/d(network input); `None` if traversal stopped at a frozen layer.
    pub input_error: Option<Tensor>,
}
