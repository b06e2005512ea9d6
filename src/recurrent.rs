//! Recurrent state handling and truncated-BPTT segmentation.

use std::ops::Range;

use crate::envelope::Activations;
use crate::layer::{Node, RnnState};
use crate::stack::LayerStack;
use crate::workspace::{Workspace, Workspaces};
use crate::{Error, Result};

/// Contiguous `[start, end)` segments covering `0..time_len`.
///
/// The last segment may be shorter than `fwd_len`.
pub fn segment_ranges(time_len: usize, fwd_len: usize) -> Vec<Range<usize>> {
    if fwd_len == 0 {
        return Vec::new();
    }
    let count = time_len.div_ceil(fwd_len);
    (0..count)
        .map(|i| {
            let start = i * fwd_len;
            start..(start + fwd_len).min(time_len)
        })
        .collect()
}

impl LayerStack {
    /// Feed one or more time steps through every layer, carrying recurrent state.
    pub fn rnn_time_step(
        &mut self,
        params: &[f32],
        input: &Activations,
        ws: &mut Workspaces,
    ) -> Result<Activations> {
        self.check_params(params)?;
        let mut current = input.shallow_clone();
        for idx in 0..self.nodes.len() {
            let view = self.layout.slice(params, idx);
            let node = &mut self.nodes[idx];
            node.set_input_mini_batch_size(current.batch_size());
            current = match node {
                Node::Recurrent(layer) => {
                    ws.micro_step(|s| layer.rnn_time_step(view, current, s))?
                }
                Node::Nested(inner) => inner.rnn_time_step(view, &current, ws)?,
                _ => self.activate_node(params, idx, current, false, ws)?,
            };
        }
        Ok(current)
    }

    /// Activations of every layer, starting recurrent layers from their stored state without
    /// updating it.
    ///
    /// With `store_last_for_tbptt` each recurrent layer keeps its final state as TBPTT state,
    /// ready for [`update_rnn_state_with_tbptt_state`](Self::update_rnn_state_with_tbptt_state).
    pub fn rnn_activate_using_stored_state(
        &mut self,
        params: &[f32],
        input: &Activations,
        training: bool,
        store_last_for_tbptt: bool,
        ws: &mut Workspaces,
    ) -> Result<Vec<Activations>> {
        self.check_params(params)?;
        let mut activations = Vec::with_capacity(self.nodes.len() + 1);
        activations.push(input.shallow_clone());
        let mut current = input.shallow_clone();
        for idx in 0..self.nodes.len() {
            let view = self.layout.slice(params, idx);
            let node = &mut self.nodes[idx];
            node.set_input_mini_batch_size(current.batch_size());
            current = match node {
                Node::Recurrent(layer) => ws.micro_step(|s| {
                    layer.rnn_activate_using_stored_state(
                        view,
                        current,
                        training,
                        store_last_for_tbptt,
                        s,
                    )
                })?,
                Node::Nested(inner) => {
                    let mut acts = inner.rnn_activate_using_stored_state(
                        view,
                        &current,
                        training,
                        store_last_for_tbptt,
                        ws,
                    )?;
                    acts.pop().ok_or_else(|| {
                        Error::MissingInput("nested stack produced no output".to_owned())
                    })?
                }
                _ => self.activate_node(params, idx, current, training, ws)?,
            };
            activations.push(current.shallow_clone());
        }
        Ok(activations)
    }

    /// Stored state of recurrent layer `idx`; `None` for non-recurrent layers.
    pub fn rnn_get_previous_state(&self, idx: usize) -> Result<Option<RnnState>> {
        match self.node(idx)? {
            Node::Recurrent(layer) => Ok(Some(layer.rnn_get_previous_state())),
            _ => Ok(None),
        }
    }

    pub fn rnn_set_previous_state(&mut self, idx: usize, state: RnnState) -> Result<()> {
        match self.node_mut(idx)? {
            Node::Recurrent(layer) => {
                layer.rnn_set_previous_state(state);
                Ok(())
            }
            other => Err(Error::InvalidIndex(format!(
                "layer {idx} is a {} layer, not a recurrent layer",
                other.kind()
            ))),
        }
    }

    pub fn rnn_clear_previous_state(&mut self) {
        for node in &mut self.nodes {
            match node {
                Node::Recurrent(layer) => layer.rnn_clear_previous_state(),
                Node::Nested(inner) => inner.rnn_clear_previous_state(),
                _ => {}
            }
        }
    }

    /// Copy each recurrent layer's end-of-segment state into its stored state.
    pub fn update_rnn_state_with_tbptt_state(&mut self) {
        for node in &mut self.nodes {
            match node {
                Node::Recurrent(layer) => {
                    let state = layer.rnn_get_tbptt_state();
                    layer.rnn_set_previous_state(state);
                }
                Node::Nested(inner) => inner.update_rnn_state_with_tbptt_state(),
                _ => {}
            }
        }
    }

    /// Lease every stored recurrent state tensor to `ws`'s innermost scope.
    pub(crate) fn adopt_previous_state(&self, ws: &mut Workspace) -> Result<()> {
        for node in &self.nodes {
            match node {
                Node::Recurrent(layer) => {
                    for (_, t) in layer.rnn_get_previous_state().iter() {
                        ws.adopt(t.clone())?;
                    }
                }
                Node::Nested(inner) => inner.adopt_previous_state(ws)?,
                _ => {}
            }
        }
        Ok(())
    }

    pub(crate) fn has_recurrent_layer(&self) -> bool {
        self.nodes.iter().any(|node| match node {
            Node::Recurrent(_) => true,
            Node::Nested(inner) => inner.has_recurrent_layer(),
            _ => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_cover_the_series_without_overlap() {
        assert_eq!(segment_ranges(100, 30), vec![0..30, 30..60, 60..90, 90..100]);
        assert_eq!(segment_ranges(60, 30), vec![0..30, 30..60]);
        assert_eq!(segment_ranges(5, 10), vec![0..5]);
        assert!(segment_ranges(0, 10).is_empty());
        assert!(segment_ranges(10, 0).is_empty());
    }
}
