//! Flat parameter and gradient buffers.
//!
//! Every parameter of every layer lives in one contiguous buffer. Layer `i` owns the
//! sub-range starting exactly where layer `i - 1`'s ends; layers with no parameters own no
//! range at all. Inside a layer's range the named parameters ([`ParamSpec`]) follow each
//! other in declaration order, each stored in its own flattening order.
//!
//! The gradient buffer ([`GradientBuffer`]) uses the identical layout so that an update can
//! be applied element-wise.

use std::ops::Range;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::envelope::{FlatOrder, GradientMap, TensorMap};
use crate::{Error, Result, Tensor, tensor};

/// A named parameter declared by a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ParamSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub order: FlatOrder,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, shape: &[usize], order: FlatOrder) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
            order,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-layer ranges into a flat buffer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParamLayout {
    ranges: Vec<Option<Range<usize>>>,
    total: usize,
}

impl ParamLayout {
    /// Lay out consecutive ranges; a zero count gets no range.
    pub fn from_counts(counts: &[usize]) -> Self {
        let mut ranges = Vec::with_capacity(counts.len());
        let mut offset = 0;
        for &count in counts {
            if count == 0 {
                ranges.push(None);
            } else {
                ranges.push(Some(offset..offset + count));
                offset += count;
            }
        }
        Self {
            ranges,
            total: offset,
        }
    }

    /// Number of layers.
    #[inline]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of parameters.
    #[inline]
    pub fn total(&self) -> usize {
        self.total
    }

    #[inline]
    pub fn range(&self, layer: usize) -> Option<Range<usize>> {
        self.ranges.get(layer).cloned().flatten()
    }

    /// Slice of `buffer` owned by `layer`; empty for parameterless layers.
    #[inline]
    pub fn slice<'a>(&self, buffer: &'a [f32], layer: usize) -> &'a [f32] {
        match self.range(layer) {
            Some(r) => &buffer[r],
            None => &[],
        }
    }

    #[inline]
    pub fn slice_mut<'a>(&self, buffer: &'a mut [f32], layer: usize) -> &'a mut [f32] {
        match self.range(layer) {
            Some(r) => &mut buffer[r],
            None => &mut [],
        }
    }
}

/// Split a `"<layer>_<name>"` key.
pub fn parse_key(key: &str) -> Result<(usize, &str)> {
    let (idx, name) = key
        .split_once('_')
        .ok_or_else(|| Error::InvalidParamKey(key.to_owned()))?;
    let idx = idx
        .parse::<usize>()
        .map_err(|_| Error::InvalidParamKey(key.to_owned()))?;
    if name.is_empty() {
        return Err(Error::InvalidParamKey(key.to_owned()));
    }
    Ok((idx, name))
}

/// Offset of `name` inside a layer's range, plus its spec.
fn locate<'a>(specs: &'a [ParamSpec], name: &str) -> Option<(usize, &'a ParamSpec)> {
    let mut offset = 0;
    for spec in specs {
        if spec.name == name {
            return Some((offset, spec));
        }
        offset += spec.len();
    }
    None
}

/// The network's flat parameter buffer plus its layout.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamStore {
    buffer: Vec<f32>,
    layout: ParamLayout,
    specs: Vec<Vec<ParamSpec>>,
}

impl ParamStore {
    /// Build the buffer for layers declaring `specs`.
    ///
    /// A supplied buffer must be a `[1, n]` row vector with `n` equal to the total parameter
    /// count; its values are taken as is. Otherwise a zero buffer is allocated and the second
    /// return value is `true`, meaning each layer still has to initialize its own view.
    pub fn initialize(specs: Vec<Vec<ParamSpec>>, supplied: Option<&Tensor>) -> Result<(Self, bool)> {
        let counts: Vec<usize> = specs
            .iter()
            .map(|layer| layer.iter().map(ParamSpec::len).sum())
            .collect();
        let layout = ParamLayout::from_counts(&counts);
        let total = layout.total();

        let (buffer, needs_init) = match supplied {
            Some(t) => {
                if !tensor::is_row_vector(t) {
                    return Err(Error::ShapeMismatch(format!(
                        "parameters must be a [1, {total}] row vector, got shape {:?}",
                        t.shape()
                    )));
                }
                if t.len() != total {
                    return Err(Error::ShapeMismatch(format!(
                        "parameter vector has {} elements, layers declare {total}",
                        t.len()
                    )));
                }
                (t.iter().copied().collect(), false)
            }
            None => (vec![0.0; total], true),
        };

        Ok((
            Self {
                buffer,
                layout,
                specs,
            },
            needs_init,
        ))
    }

    #[inline]
    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    #[inline]
    pub fn specs(&self) -> &[Vec<ParamSpec>] {
        &self.specs
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.buffer
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.buffer
    }

    /// Address of the first element; stable for the life of the store.
    #[inline]
    pub fn buffer_ptr(&self) -> *const f32 {
        self.buffer.as_ptr()
    }

    /// Copy of the whole buffer as a `[1, n]` row vector.
    pub fn params(&self) -> Tensor {
        tensor::row_vector(&self.buffer)
    }

    /// Layer `i`'s view; `None` for parameterless layers.
    pub fn view(&self, layer: usize) -> Result<Option<&[f32]>> {
        self.check_layer(layer)?;
        Ok(self.layout.range(layer).map(|r| &self.buffer[r]))
    }

    pub fn view_mut(&mut self, layer: usize) -> Result<Option<&mut [f32]>> {
        self.check_layer(layer)?;
        Ok(self.layout.range(layer).map(|r| &mut self.buffer[r]))
    }

    /// Overwrite the whole buffer in place.
    pub fn set_params(&mut self, values: &Tensor) -> Result<()> {
        if values.len() != self.buffer.len() {
            return Err(Error::ShapeMismatch(format!(
                "got {} parameters, network has {}",
                values.len(),
                self.buffer.len()
            )));
        }
        for (dst, &src) in self.buffer.iter_mut().zip(values.iter()) {
            *dst = src;
        }
        Ok(())
    }

    pub fn get_param(&self, layer: usize, name: &str) -> Result<Tensor> {
        let (offset, spec) = self.find(layer, name)?;
        let start = self.layer_start(layer) + offset;
        tensor::unflatten(&self.buffer[start..start + spec.len()], &spec.shape, spec.order)
    }

    pub fn set_param(&mut self, layer: usize, name: &str, value: &Tensor) -> Result<()> {
        let (offset, spec) = self.find(layer, name)?;
        if value.shape() != spec.shape.as_slice() {
            return Err(Error::ShapeMismatch(format!(
                "parameter {layer}_{name} has shape {:?}, got {:?}",
                spec.shape,
                value.shape()
            )));
        }
        let order = spec.order;
        let len = spec.len();
        let start = self.layer_start(layer) + offset;
        tensor::flatten_into(value, order, &mut self.buffer[start..start + len])
    }

    /// `get_param` addressed as `"<layer>_<name>"`.
    pub fn get_param_by_key(&self, key: &str) -> Result<Tensor> {
        let (layer, name) = parse_key(key)?;
        self.get_param(layer, name)
    }

    pub fn set_param_by_key(&mut self, key: &str, value: &Tensor) -> Result<()> {
        let (layer, name) = parse_key(key)?;
        self.set_param(layer, name, value)
    }

    /// Every named parameter, keyed `"<layer>_<name>"`, in layer order.
    pub fn param_table(&self) -> Result<TensorMap> {
        let mut table = TensorMap::new();
        for (layer, specs) in self.specs.iter().enumerate() {
            for spec in specs {
                table.insert(format!("{layer}_{}", spec.name), self.get_param(layer, &spec.name)?);
            }
        }
        Ok(table)
    }

    /// Replace the whole table at once.
    ///
    /// The key set and every shape are checked before anything is written, so a rejected
    /// table leaves the buffer untouched.
    pub fn set_param_table(&mut self, table: &TensorMap) -> Result<()> {
        let current = self.param_table()?;
        if !current.same_keys(table) {
            let mut expected: Vec<&str> = current.keys().collect();
            let mut got: Vec<&str> = table.keys().collect();
            expected.sort_unstable();
            got.sort_unstable();
            return Err(Error::InvalidConfig(format!(
                "parameter table keys {got:?} do not match network keys {expected:?}"
            )));
        }
        for (key, value) in table.iter() {
            let Some(existing) = current.get(key) else {
                return Err(Error::InvalidParamKey(key.to_owned()));
            };
            if existing.shape() != value.shape() {
                return Err(Error::ShapeMismatch(format!(
                    "parameter {key} has shape {:?}, got {:?}",
                    existing.shape(),
                    value.shape()
                )));
            }
        }
        for (key, value) in table.iter() {
            self.set_param_by_key(key, value)?;
        }
        Ok(())
    }

    /// Fresh gradient buffer with this store's layout.
    pub fn build_gradient_view(&self) -> GradientBuffer {
        GradientBuffer {
            buffer: vec![0.0; self.buffer.len()],
            layout: self.layout.clone(),
        }
    }

    fn check_layer(&self, layer: usize) -> Result<()> {
        if layer >= self.layout.len() {
            return Err(Error::index("layer", layer, self.layout.len()));
        }
        Ok(())
    }

    fn layer_start(&self, layer: usize) -> usize {
        self.layout.range(layer).map_or(0, |r| r.start)
    }

    fn find(&self, layer: usize, name: &str) -> Result<(usize, &ParamSpec)> {
        self.check_layer(layer)?;
        locate(&self.specs[layer], name).ok_or_else(|| Error::InvalidParamKey(format!("{layer}_{name}")))
    }
}

/// Flat gradient buffer laid out like the [`ParamStore`] it was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientBuffer {
    buffer: Vec<f32>,
    layout: ParamLayout,
}

impl GradientBuffer {
    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.buffer
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.buffer
    }

    #[inline]
    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    /// Layer `i`'s gradient view; `None` for parameterless layers.
    pub fn view(&self, layer: usize) -> Option<&[f32]> {
        self.layout.range(layer).map(|r| &self.buffer[r])
    }

    pub fn zero_layer(&mut self, layer: usize) {
        if let Some(r) = self.layout.range(layer) {
            self.buffer[r].fill(0.0);
        }
    }

    /// Write a keyed gradient map into the buffer.
    ///
    /// Layers absent from the map (for example below a frozen layer) end up zero. Every entry
    /// is checked before anything is written, so a rejected map leaves the buffer as it was.
    pub fn pack(&mut self, grads: &GradientMap, specs: &[Vec<ParamSpec>]) -> Result<()> {
        let mut slots = Vec::with_capacity(grads.len());
        for entry in grads.iter() {
            let (layer, name) = parse_key(&entry.key)?;
            let layer_specs = specs
                .get(layer)
                .ok_or_else(|| Error::index("layer", layer, specs.len()))?;
            let (offset, spec) = locate(layer_specs, name)
                .ok_or_else(|| Error::InvalidParamKey(entry.key.clone()))?;
            if entry.tensor.shape() != spec.shape.as_slice() {
                return Err(Error::ShapeMismatch(format!(
                    "gradient {} has shape {:?}, parameter is {:?}",
                    entry.key,
                    entry.tensor.shape(),
                    spec.shape
                )));
            }
            let start = self.layout.range(layer).map_or(0, |r| r.start) + offset;
            let end = start + spec.len();
            if end > self.buffer.len() {
                return Err(Error::ShapeMismatch(format!(
                    "gradient {} ends at {end}, buffer holds {}",
                    entry.key,
                    self.buffer.len()
                )));
            }
            slots.push((entry, start..end));
        }

        self.buffer.fill(0.0);
        for (entry, range) in slots {
            tensor::flatten_into(&entry.tensor, entry.order, &mut self.buffer[range])?;
        }
        Ok(())
    }
}
