//! Scoped memory arenas ("workspaces").
//!
//! A [`Workspace`] hands out tensors while a scope is open and reclaims them when that scope
//! closes. A tensor that must outlive its scope has to be promoted ("leveraged") into another
//! arena, or into the enclosing scope of the same arena, before the scope closes.
//!
//! Rust ownership already rules out reading freed memory, so the arena tracks *leases*: every
//! tensor it hands out is registered in the innermost open frame, keyed by its data pointer.
//! Closing a frame drops its leases and rewinds the usage counter according to the reset
//! policy. A promoted tensor's lease holds a reference to it; when the holding frame closes
//! and that reference is the last one, the storage goes back to the pool. Still-shared
//! tensors are retired and checked again when the next cycle starts. Later allocations take
//! pooled buffers first, as do buffers given back with [`Workspace::recycle`].
//!
//! Sizing follows the learning policy: the arena observes whole cycles (outermost scope
//! enter to outermost scope exit) and fixes or grows its capacity from the observed peak.
//! Exceeding the capacity afterwards triggers the spill policy.
//!
//! The network owns one [`Workspaces`] set per mode and threads it explicitly through the
//! forward and backward pipelines; there is no global registry.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use ndarray::{Array, IxDyn};

use crate::envelope::{Activations, Gradients};
use crate::{Error, Result, Tensor, tensor};

/// The four arena lifetimes the engine uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkspaceKind {
    /// Spans one external training step.
    External,
    /// Reused for every per-layer micro-step of a forward or backward pass.
    FeedForward,
    /// Spans a whole truncated-BPTT call across its segments.
    Tbptt,
    /// Long-lived cache, optionally host resident.
    Cache,
}

impl WorkspaceKind {
    pub fn name(self) -> &'static str {
        match self {
            WorkspaceKind::External => "LOOP_EXTERNAL",
            WorkspaceKind::FeedForward => "LOOP_FF",
            WorkspaceKind::Tbptt => "LOOP_TBPTT",
            WorkspaceKind::Cache => "LOOP_CACHE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AllocationPolicy {
    /// Capacity is exactly the observed peak.
    Strict,
    /// Capacity is the observed peak plus the overallocation fraction.
    Overallocate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ResetPolicy {
    /// Closing a scope rewinds usage to where that scope started.
    BlockLeft,
    /// Usage only rewinds when the outermost scope closes.
    EndOfBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SpillPolicy {
    /// Grow the capacity and keep going.
    Reallocate,
    /// Refuse the allocation with [`Error::WorkspaceOverflow`].
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LearningPolicy {
    /// Observe `cycles_before_initialization` cycles, then fix the size once.
    FirstLoop,
    /// Keep growing to the observed peak after every cycle.
    OverTime,
    /// Use `initial_size` as is.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MirroringPolicy {
    Full,
    /// All allocations stay in host memory.
    HostOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    Device,
    Host,
}

/// Arena configuration. Sizes are counted in `f32` elements.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WorkspaceConfig {
    pub initial_size: usize,
    /// Extra fraction added on top of the learned size.
    pub overallocation_limit: f32,
    pub allocation_policy: AllocationPolicy,
    pub reset_policy: ResetPolicy,
    pub spill_policy: SpillPolicy,
    pub learning_policy: LearningPolicy,
    pub cycles_before_initialization: usize,
    pub mirroring_policy: MirroringPolicy,
}

impl WorkspaceConfig {
    /// Arena spanning one external training step.
    pub fn external() -> Self {
        Self {
            initial_size: 0,
            overallocation_limit: 0.3,
            allocation_policy: AllocationPolicy::Overallocate,
            reset_policy: ResetPolicy::BlockLeft,
            spill_policy: SpillPolicy::Reallocate,
            learning_policy: LearningPolicy::FirstLoop,
            cycles_before_initialization: 1,
            mirroring_policy: MirroringPolicy::Full,
        }
    }

    /// Arena reused by every layer micro-step.
    pub fn feed_forward() -> Self {
        Self {
            overallocation_limit: 0.2,
            learning_policy: LearningPolicy::OverTime,
            ..Self::external()
        }
    }

    /// Arena spanning a truncated-BPTT call.
    pub fn tbptt() -> Self {
        Self::feed_forward()
    }

    pub fn cache() -> Self {
        Self {
            overallocation_limit: 0.2,
            ..Self::external()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.overallocation_limit.is_finite() && self.overallocation_limit >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "workspace overallocation limit must be finite and >= 0, got {}",
                self.overallocation_limit
            )));
        }
        if self.learning_policy == LearningPolicy::FirstLoop
            && self.cycles_before_initialization == 0
        {
            return Err(Error::InvalidConfig(
                "first-loop learning needs at least one observed cycle".to_owned(),
            ));
        }
        Ok(())
    }

    fn sized(&self, peak: usize) -> usize {
        let grown = match self.allocation_policy {
            AllocationPolicy::Strict => peak,
            AllocationPolicy::Overallocate => {
                peak + (peak as f64 * f64::from(self.overallocation_limit)).round() as usize
            }
        };
        grown.max(self.initial_size)
    }
}

/// Workspace usage while training or running inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum WorkspaceMode {
    /// Every arena is a no-op: allocations are untracked and never recycled.
    None,
    /// One arena: per-layer scopes nest inside the external arena.
    Single,
    /// Per-layer scopes use a dedicated feed-forward arena.
    #[default]
    Separate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CacheMode {
    #[default]
    None,
    Host,
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaState {
    Uninitialized,
    Scoped(usize),
}

#[derive(Debug, Clone)]
struct Lease {
    len: usize,
    /// Held once the tensor has been promoted out of the step that produced it, so its storage
    /// can be reclaimed when the holding frame closes. Tensors still being written are not
    /// held, since a second reference would turn every in-place write into a copy.
    held: Option<Tensor>,
}

#[derive(Debug, Clone)]
struct Frame {
    mark: usize,
    /// data pointer -> lease
    leases: HashMap<usize, Lease>,
}

/// Reclaimed buffers kept per arena.
const MAX_POOLED_BUFFERS: usize = 256;

/// One scoped arena.
#[derive(Debug, Clone)]
pub struct Workspace {
    kind: WorkspaceKind,
    config: WorkspaceConfig,
    enabled: bool,
    capacity: usize,
    sized: bool,
    used: usize,
    cycle_peak: usize,
    peak: usize,
    cycles: usize,
    spills: usize,
    pool: Vec<Vec<f32>>,
    /// Promoted tensors that were still shared when their frame closed.
    retired: Vec<Tensor>,
    frames: Vec<Frame>,
}

impl Workspace {
    pub fn new(kind: WorkspaceKind, config: WorkspaceConfig) -> Result<Self> {
        config.validate()?;
        let sized = config.learning_policy == LearningPolicy::None;
        Ok(Self {
            kind,
            config,
            enabled: true,
            capacity: config.initial_size,
            sized,
            used: 0,
            cycle_peak: 0,
            peak: 0,
            cycles: 0,
            spills: 0,
            pool: Vec::new(),
            retired: Vec::new(),
            frames: Vec::new(),
        })
    }

    /// The no-op arena used when workspaces are turned off.
    pub fn disabled(kind: WorkspaceKind) -> Self {
        Self {
            kind,
            config: WorkspaceConfig::external(),
            enabled: false,
            capacity: 0,
            sized: false,
            used: 0,
            cycle_peak: 0,
            peak: 0,
            cycles: 0,
            spills: 0,
            pool: Vec::new(),
            retired: Vec::new(),
            frames: Vec::new(),
        }
    }

    #[inline]
    pub fn kind(&self) -> WorkspaceKind {
        self.kind
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[inline]
    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    #[inline]
    pub fn state(&self) -> ArenaState {
        match self.frames.len() {
            0 => ArenaState::Uninitialized,
            depth => ArenaState::Scoped(depth),
        }
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Largest usage seen in any completed cycle.
    #[inline]
    pub fn peak(&self) -> usize {
        self.peak
    }

    #[inline]
    pub fn cycles(&self) -> usize {
        self.cycles
    }

    /// Number of times the capacity had to grow after sizing.
    #[inline]
    pub fn spills(&self) -> usize {
        self.spills
    }

    /// Buffers waiting to be handed out again.
    #[inline]
    pub fn pooled(&self) -> usize {
        self.pool.len()
    }

    #[inline]
    pub fn location(&self) -> MemoryLocation {
        match self.config.mirroring_policy {
            MirroringPolicy::HostOnly => MemoryLocation::Host,
            MirroringPolicy::Full => MemoryLocation::Device,
        }
    }

    pub fn set_mirroring_policy(&mut self, policy: MirroringPolicy) {
        self.config.mirroring_policy = policy;
    }

    /// Tensors currently leased across all open frames.
    pub fn live_count(&self) -> usize {
        self.frames.iter().map(|f| f.leases.len()).sum()
    }

    pub fn is_live(&self, t: &Tensor) -> bool {
        let addr = addr_of(t);
        self.frames.iter().any(|f| f.leases.contains_key(&addr))
    }

    /// Open a nested scope; it is released when the returned guard drops.
    pub fn enter_scope(&mut self) -> WorkspaceScope<'_> {
        self.open_frame();
        WorkspaceScope { ws: self }
    }

    /// Fix the arena size now instead of waiting for the learning policy.
    ///
    /// Only legal at depth 0; inside an open scope it is ignored.
    pub fn initialize_workspace(&mut self) {
        if !self.enabled {
            return;
        }
        if !self.frames.is_empty() {
            tracing::debug!(
                workspace = self.name(),
                depth = self.depth(),
                "initialize_workspace ignored inside an open scope"
            );
            return;
        }
        let target = self.config.sized(self.peak);
        if target > self.capacity || !self.sized {
            tracing::debug!(
                workspace = self.name(),
                capacity = target,
                "workspace initialized"
            );
        }
        self.capacity = self.capacity.max(target);
        self.sized = true;
    }

    /// Zero-filled tensor leased to the innermost open scope.
    ///
    /// With no open scope the tensor is detached (untracked). Storage comes from the pool when
    /// a large enough buffer is there.
    pub fn alloc(&mut self, shape: &[usize]) -> Result<Tensor> {
        let n: usize = shape.iter().product();
        if !self.enabled {
            return Ok(tensor::zeros(shape));
        }
        if !self.frames.is_empty() {
            self.reserve(n)?;
        }
        let mut buf = self.take_pooled(n);
        buf.clear();
        buf.resize(n, 0.0);
        let t = Array::from_shape_vec(IxDyn(shape), buf)
            .map(Array::into_shared)
            .map_err(|e| Error::ShapeMismatch(e.to_string()))?;
        self.lease(&t, n, None);
        Ok(t)
    }

    /// Register a tensor produced elsewhere as leased to the innermost open scope.
    pub fn adopt(&mut self, t: Tensor) -> Result<Tensor> {
        if self.enabled && !self.frames.is_empty() && !self.is_live(&t) {
            self.reserve(t.len())?;
            self.lease(&t, t.len(), None);
        }
        Ok(t)
    }

    /// Give a tensor's storage back to the pool.
    ///
    /// The storage is only pooled when `t` was its last reference.
    pub fn recycle(&mut self, t: Tensor) {
        if !self.enabled {
            return;
        }
        // Drop the lease (and any held reference) before checking for uniqueness.
        self.release_lease(&t);
        self.reclaim(t);
    }

    /// Move a tensor's lease from this arena into `target`'s innermost scope.
    ///
    /// The promoted bytes count against `target`, so its spill policy applies. If `target` has
    /// no open scope the tensor becomes detached.
    pub fn leverage_to(&mut self, t: &Tensor, target: &mut Workspace) -> Result<Tensor> {
        let Some(len) = self.lease_len(t) else {
            return Ok(t.clone());
        };
        if target.enabled && !target.frames.is_empty() {
            target.reserve(len)?;
            self.release_lease(t);
            target.lease(t, len, Some(t.clone()));
        } else {
            self.release_lease(t);
        }
        Ok(t.clone())
    }

    /// Move a tensor's lease into the enclosing scope of this same arena.
    pub fn leverage_to_parent(&mut self, t: &Tensor) -> Tensor {
        let depth = self.frames.len();
        if !self.enabled || depth == 0 {
            return t.clone();
        }
        let addr = addr_of(t);
        if let Some(lease) = self.frames[depth - 1].leases.remove(&addr) {
            if depth >= 2 {
                let len = lease.len;
                self.frames[depth - 2].leases.insert(
                    addr,
                    Lease {
                        len,
                        held: Some(t.clone()),
                    },
                );
                // The bytes stay counted once this block rewinds.
                self.frames[depth - 1].mark += len;
            } else if self.config.reset_policy == ResetPolicy::BlockLeft {
                self.used = self.used.saturating_sub(lease.len);
            }
        }
        t.clone()
    }

    /// Pool every retired buffer that is no longer shared; release the rest to their holders.
    pub fn sweep_retired(&mut self) {
        for t in std::mem::take(&mut self.retired) {
            self.reclaim(t);
        }
    }

    /// Hand every pooled buffer to `target`.
    pub(crate) fn transfer_pool(&mut self, target: &mut Workspace) {
        if !target.enabled {
            return;
        }
        let room = MAX_POOLED_BUFFERS.saturating_sub(target.pool.len());
        let moved = self.pool.len().min(room);
        target.pool.extend(self.pool.drain(..moved));
    }

    pub(crate) fn open_frame(&mut self) {
        if self.frames.is_empty() && !self.retired.is_empty() {
            self.sweep_retired();
        }
        self.frames.push(Frame {
            mark: self.used,
            leases: HashMap::new(),
        });
    }

    pub(crate) fn close_frame(&mut self) {
        let Some(frame) = self.frames.pop() else {
            return;
        };
        if !self.enabled {
            return;
        }
        if !frame.leases.is_empty() {
            tracing::trace!(
                workspace = self.name(),
                reclaimed = frame.leases.len(),
                "scope closed"
            );
        }
        for lease in frame.leases.into_values() {
            if let Some(t) = lease.held {
                match t.try_into_owned_nocopy() {
                    Ok(owned) => self.pool_buffer(owned.into_raw_vec()),
                    Err(shared) => self.retired.push(shared),
                }
            }
        }
        if self.config.reset_policy == ResetPolicy::BlockLeft {
            self.used = frame.mark;
        }
        if self.frames.is_empty() {
            self.end_cycle();
        }
    }

    fn end_cycle(&mut self) {
        self.cycles += 1;
        self.peak = self.peak.max(self.cycle_peak);
        self.cycle_peak = 0;
        self.used = 0;

        match self.config.learning_policy {
            LearningPolicy::FirstLoop => {
                if !self.sized && self.cycles >= self.config.cycles_before_initialization {
                    self.capacity = self.config.sized(self.peak);
                    self.sized = true;
                    tracing::debug!(
                        workspace = self.name(),
                        capacity = self.capacity,
                        "workspace size learned"
                    );
                }
            }
            LearningPolicy::OverTime => {
                let target = self.config.sized(self.peak);
                if target > self.capacity {
                    self.capacity = target;
                }
                if self.cycles >= self.config.cycles_before_initialization {
                    self.sized = true;
                }
            }
            LearningPolicy::None => {}
        }
    }

    fn reserve(&mut self, n: usize) -> Result<()> {
        let next = self.used + n;
        if self.sized && next > self.capacity {
            match self.config.spill_policy {
                SpillPolicy::Reallocate => {
                    let grown = self.config.sized(next);
                    tracing::debug!(
                        workspace = self.name(),
                        from = self.capacity,
                        to = grown,
                        "workspace spilled"
                    );
                    self.capacity = grown;
                    self.spills += 1;
                }
                SpillPolicy::Fail => {
                    return Err(Error::WorkspaceOverflow {
                        name: self.name(),
                        requested: n,
                        available: self.capacity.saturating_sub(self.used),
                    });
                }
            }
        }
        self.used = next;
        self.cycle_peak = self.cycle_peak.max(self.used);
        Ok(())
    }

    /// Smallest pooled buffer that fits `n`, or a fresh one.
    fn take_pooled(&mut self, n: usize) -> Vec<f32> {
        let best = self
            .pool
            .iter()
            .enumerate()
            .filter(|(_, b)| b.capacity() >= n)
            .min_by_key(|(_, b)| b.capacity())
            .map(|(idx, _)| idx);
        match best {
            Some(idx) => self.pool.swap_remove(idx),
            None => Vec::with_capacity(n),
        }
    }

    fn pool_buffer(&mut self, buf: Vec<f32>) {
        if self.pool.len() < MAX_POOLED_BUFFERS {
            self.pool.push(buf);
        }
    }

    fn reclaim(&mut self, t: Tensor) {
        if let Ok(owned) = t.try_into_owned_nocopy() {
            self.pool_buffer(owned.into_raw_vec());
        }
    }

    fn lease(&mut self, t: &Tensor, len: usize, held: Option<Tensor>) {
        if self.frames.is_empty() {
            return;
        }
        // A live tensor never shares its data pointer with a new one, so an existing lease at
        // this address belongs to a tensor that has since been dropped.
        if let Some(stale) = self.release_lease(t) {
            tracing::trace!(workspace = self.name(), len = stale, "stale lease replaced");
        }
        if let Some(frame) = self.frames.last_mut() {
            frame.leases.insert(addr_of(t), Lease { len, held });
        }
    }

    fn lease_len(&self, t: &Tensor) -> Option<usize> {
        if !self.enabled {
            return None;
        }
        let addr = addr_of(t);
        self.frames
            .iter()
            .rev()
            .find_map(|f| f.leases.get(&addr).map(|l| l.len))
    }

    fn release_lease(&mut self, t: &Tensor) -> Option<usize> {
        if !self.enabled {
            return None;
        }
        let addr = addr_of(t);
        for frame in self.frames.iter_mut().rev() {
            if let Some(lease) = frame.leases.remove(&addr) {
                if self.config.reset_policy == ResetPolicy::BlockLeft {
                    self.used = self.used.saturating_sub(lease.len);
                }
                return Some(lease.len);
            }
        }
        None
    }
}

#[inline]
fn addr_of(t: &Tensor) -> usize {
    t.as_ptr() as usize
}

/// Open scope on a [`Workspace`]; closing happens on drop, including on error paths.
#[derive(Debug)]
pub struct WorkspaceScope<'a> {
    ws: &'a mut Workspace,
}

impl WorkspaceScope<'_> {
    /// Explicit close; equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Deref for WorkspaceScope<'_> {
    type Target = Workspace;

    fn deref(&self) -> &Workspace {
        &*self.ws
    }
}

impl DerefMut for WorkspaceScope<'_> {
    fn deref_mut(&mut self) -> &mut Workspace {
        &mut *self.ws
    }
}

impl Drop for WorkspaceScope<'_> {
    fn drop(&mut self) {
        self.ws.close_frame();
    }
}

/// Values that can be promoted out of a closing scope.
pub trait Leverage: Sized {
    /// Move every tensor in `self` out of `from`'s innermost scope, into `to` when given or into
    /// `from`'s enclosing scope otherwise.
    fn leverage(self, from: &mut Workspace, to: Option<&mut Workspace>) -> Result<Self>;
}

fn leverage_one(t: &Tensor, from: &mut Workspace, to: Option<&mut Workspace>) -> Result<Tensor> {
    match to {
        Some(target) => from.leverage_to(t, target),
        None => Ok(from.leverage_to_parent(t)),
    }
}

impl Leverage for Tensor {
    fn leverage(self, from: &mut Workspace, to: Option<&mut Workspace>) -> Result<Self> {
        leverage_one(&self, from, to)
    }
}

impl Leverage for Activations {
    fn leverage(mut self, from: &mut Workspace, mut to: Option<&mut Workspace>) -> Result<Self> {
        self.tensor = leverage_one(&self.tensor, from, to.as_deref_mut())?;
        if let Some(mask) = &self.mask {
            self.mask = Some(leverage_one(mask, from, to.as_deref_mut())?);
        }
        Ok(self)
    }
}

impl Leverage for Gradients {
    fn leverage(mut self, from: &mut Workspace, mut to: Option<&mut Workspace>) -> Result<Self> {
        if let Some(eps) = &self.activation_grad {
            self.activation_grad = Some(leverage_one(eps, from, to.as_deref_mut())?);
        }
        for entry in self.params.iter_mut() {
            entry.tensor = leverage_one(&entry.tensor, from, to.as_deref_mut())?;
        }
        Ok(self)
    }
}

impl<T: Leverage> Leverage for Vec<T> {
    fn leverage(self, from: &mut Workspace, mut to: Option<&mut Workspace>) -> Result<Self> {
        self.into_iter()
            .map(|v| v.leverage(from, to.as_deref_mut()))
            .collect()
    }
}

/// The arena set owned by one network for one mode (training or inference).
#[derive(Debug, Clone)]
pub struct Workspaces {
    mode: WorkspaceMode,
    pub external: Workspace,
    pub feed_forward: Workspace,
    pub tbptt: Workspace,
    pub cache: Workspace,
}

impl Default for Workspaces {
    fn default() -> Self {
        Self {
            mode: WorkspaceMode::None,
            external: Workspace::disabled(WorkspaceKind::External),
            feed_forward: Workspace::disabled(WorkspaceKind::FeedForward),
            tbptt: Workspace::disabled(WorkspaceKind::Tbptt),
            cache: Workspace::disabled(WorkspaceKind::Cache),
        }
    }
}

impl Workspaces {
    pub fn new(mode: WorkspaceMode, cache_mode: CacheMode) -> Result<Self> {
        let mut ws = Self {
            mode,
            ..Self::default()
        };
        if mode == WorkspaceMode::None {
            return Ok(ws);
        }
        ws.external = Workspace::new(WorkspaceKind::External, WorkspaceConfig::external())?;
        ws.tbptt = Workspace::new(WorkspaceKind::Tbptt, WorkspaceConfig::tbptt())?;
        if mode == WorkspaceMode::Separate {
            ws.feed_forward =
                Workspace::new(WorkspaceKind::FeedForward, WorkspaceConfig::feed_forward())?;
        }
        match cache_mode {
            CacheMode::None => {}
            CacheMode::Host => {
                let mut cache = Workspace::new(WorkspaceKind::Cache, WorkspaceConfig::cache())?;
                cache.set_mirroring_policy(MirroringPolicy::HostOnly);
                ws.cache = cache;
            }
            CacheMode::Device => {
                ws.cache = Workspace::new(WorkspaceKind::Cache, WorkspaceConfig::cache())?;
            }
        }
        Ok(ws)
    }

    #[inline]
    pub fn mode(&self) -> WorkspaceMode {
        self.mode
    }

    pub fn arena(&self, kind: WorkspaceKind) -> &Workspace {
        match kind {
            WorkspaceKind::External => &self.external,
            WorkspaceKind::FeedForward => &self.feed_forward,
            WorkspaceKind::Tbptt => &self.tbptt,
            WorkspaceKind::Cache => &self.cache,
        }
    }

    pub fn arena_mut(&mut self, kind: WorkspaceKind) -> &mut Workspace {
        match kind {
            WorkspaceKind::External => &mut self.external,
            WorkspaceKind::FeedForward => &mut self.feed_forward,
            WorkspaceKind::Tbptt => &mut self.tbptt,
            WorkspaceKind::Cache => &mut self.cache,
        }
    }

    /// Run `f` with every arena in `kinds` scoped, outermost first.
    ///
    /// Scopes close in reverse order whether `f` succeeds or fails.
    pub fn scoped<T>(
        &mut self,
        kinds: &[WorkspaceKind],
        f: impl FnOnce(&mut Workspaces) -> Result<T>,
    ) -> Result<T> {
        for &kind in kinds {
            self.arena_mut(kind).open_frame();
        }
        self.hand_back_buffers();
        let out = f(self);
        for &kind in kinds.iter().rev() {
            self.arena_mut(kind).close_frame();
        }
        self.hand_back_buffers();
        out
    }

    /// With separate workspaces every layer allocation happens in the feed-forward arena, so
    /// storage reclaimed by the arenas its results were promoted into goes back there.
    fn hand_back_buffers(&mut self) {
        if self.mode != WorkspaceMode::Separate {
            return;
        }
        let Workspaces {
            external,
            feed_forward,
            tbptt,
            cache,
            ..
        } = self;
        for arena in [external, tbptt, cache] {
            arena.transfer_pool(feed_forward);
        }
    }

    /// One layer step: run `f` in a fresh nested scope and promote its result out of it.
    ///
    /// With separate workspaces the scope lives in the feed-forward arena and results move into
    /// the external arena; otherwise the scope nests inside the external arena itself.
    pub fn micro_step<T: Leverage>(
        &mut self,
        f: impl FnOnce(&mut Workspace) -> Result<T>,
    ) -> Result<T> {
        match self.mode {
            WorkspaceMode::Separate => {
                let Workspaces {
                    feed_forward,
                    external,
                    ..
                } = self;
                let mut scope = feed_forward.enter_scope();
                let out = f(&mut *scope)?;
                out.leverage(&mut *scope, Some(external))
            }
            WorkspaceMode::Single | WorkspaceMode::None => {
                let mut scope = self.external.enter_scope();
                let out = f(&mut *scope)?;
                out.leverage(&mut *scope, None)
            }
        }
    }

    /// Size every idle arena from what it has observed so far.
    pub fn initialize_all(&mut self) {
        self.external.initialize_workspace();
        self.feed_forward.initialize_workspace();
        self.tbptt.initialize_workspace();
        self.cache.initialize_workspace();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(kind: WorkspaceKind) -> Workspace {
        Workspace::new(kind, WorkspaceConfig::external()).unwrap()
    }

    #[test]
    fn scopes_nest_and_close_back_to_uninitialized() {
        let mut ws = arena(WorkspaceKind::External);
        assert_eq!(ws.state(), ArenaState::Uninitialized);
        {
            let mut outer = ws.enter_scope();
            assert_eq!(outer.state(), ArenaState::Scoped(1));
            {
                let inner = outer.enter_scope();
                assert_eq!(inner.state(), ArenaState::Scoped(2));
            }
            assert_eq!(outer.state(), ArenaState::Scoped(1));
        }
        assert_eq!(ws.state(), ArenaState::Uninitialized);
        assert_eq!(ws.cycles(), 1);
    }

    #[test]
    fn closing_a_scope_reclaims_unpromoted_leases() {
        let mut ws = arena(WorkspaceKind::External);
        let mut outer = ws.enter_scope();
        let kept;
        {
            let mut inner = outer.enter_scope();
            let a = inner.alloc(&[4]).unwrap();
            let b = inner.alloc(&[4]).unwrap();
            assert_eq!(inner.live_count(), 2);
            assert_eq!(inner.used(), 8);
            kept = inner.leverage_to_parent(&b);
            drop(a);
        }
        assert_eq!(outer.live_count(), 1);
        assert!(outer.is_live(&kept));
        assert_eq!(outer.used(), 4);
    }

    #[test]
    fn first_loop_learning_fixes_capacity_with_overallocation() {
        let mut ws = arena(WorkspaceKind::External);
        {
            let mut s = ws.enter_scope();
            s.alloc(&[10, 10]).unwrap();
        }
        assert_eq!(ws.capacity(), 130);
        {
            let mut s = ws.enter_scope();
            s.alloc(&[10, 10]).unwrap();
        }
        assert_eq!(ws.capacity(), 130);
        assert_eq!(ws.spills(), 0);
    }

    #[test]
    fn spill_policy_decides_between_growth_and_failure() {
        let mut grow = arena(WorkspaceKind::External);
        grow.initialize_workspace();
        {
            let mut s = grow.enter_scope();
            s.alloc(&[8]).unwrap();
        }
        assert_eq!(grow.spills(), 1);
        assert!(grow.capacity() >= 8);

        let mut strict = Workspace::new(
            WorkspaceKind::External,
            WorkspaceConfig {
                initial_size: 4,
                spill_policy: SpillPolicy::Fail,
                learning_policy: LearningPolicy::None,
                ..WorkspaceConfig::external()
            },
        )
        .unwrap();
        let mut s = strict.enter_scope();
        s.alloc(&[4]).unwrap();
        let err = s.alloc(&[1]).unwrap_err();
        assert!(matches!(err, Error::WorkspaceOverflow { requested: 1, .. }));
    }

    #[test]
    fn recycled_buffers_are_reused() {
        let mut ws = arena(WorkspaceKind::FeedForward);
        let mut s = ws.enter_scope();
        let a = s.alloc(&[16]).unwrap();
        let ptr = a.as_ptr();
        s.recycle(a);
        let b = s.alloc(&[2, 8]).unwrap();
        assert_eq!(b.as_ptr(), ptr);
        assert!(b.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn promoted_storage_returns_to_the_pool_when_its_scope_closes() {
        let mut ws = arena(WorkspaceKind::External);
        let mut ptrs = Vec::new();
        for _ in 0..3 {
            let mut outer = ws.enter_scope();
            {
                let mut inner = outer.enter_scope();
                let t = inner.alloc(&[64]).unwrap();
                ptrs.push(t.as_ptr());
                inner.leverage_to_parent(&t);
            }
            drop(outer);
            assert_eq!(ws.pooled(), 1);
        }
        assert_eq!(ptrs[0], ptrs[1]);
        assert_eq!(ptrs[1], ptrs[2]);
        assert_eq!(ws.cycles(), 3);
    }

    #[test]
    fn shared_storage_is_retired_until_the_next_cycle() {
        let mut ws = arena(WorkspaceKind::External);
        let outside;
        {
            let mut outer = ws.enter_scope();
            let mut inner = outer.enter_scope();
            let t = inner.alloc(&[8]).unwrap();
            outside = inner.leverage_to_parent(&t);
        }
        assert_eq!(ws.pooled(), 0);
        drop(outside);
        ws.enter_scope().release();
        assert_eq!(ws.pooled(), 1);
    }

    #[test]
    fn promotion_is_charged_to_the_target_arena() {
        let mut strict = Workspace::new(
            WorkspaceKind::External,
            WorkspaceConfig {
                initial_size: 4,
                spill_policy: SpillPolicy::Fail,
                learning_policy: LearningPolicy::None,
                ..WorkspaceConfig::external()
            },
        )
        .unwrap();
        let mut target = strict.enter_scope();
        let _resident = target.alloc(&[2]).unwrap();

        let mut ff = arena(WorkspaceKind::FeedForward);
        let mut s = ff.enter_scope();
        let small = s.alloc(&[2]).unwrap();
        let big = s.alloc(&[3]).unwrap();

        s.leverage_to(&small, &mut target).unwrap();
        assert!(target.is_live(&small));
        assert_eq!(target.used(), 4);

        let err = s.leverage_to(&big, &mut target).unwrap_err();
        assert!(matches!(err, Error::WorkspaceOverflow { requested: 3, .. }));
        assert!(s.is_live(&big));
        assert!(!target.is_live(&big));
        assert_eq!(target.used(), 4);
    }

    #[test]
    fn a_reused_address_replaces_its_stale_lease() {
        let mut ws = arena(WorkspaceKind::External);
        ws.open_frame();
        let t = tensor::zeros(&[4]);
        ws.reserve(4).unwrap();
        ws.lease(&t, 4, None);
        ws.reserve(4).unwrap();
        ws.lease(&t, 4, None);
        assert_eq!(ws.live_count(), 1);
        assert_eq!(ws.used(), 4);
        ws.close_frame();
    }

    #[test]
    fn disabled_arena_never_tracks_or_fails() {
        let mut ws = Workspace::disabled(WorkspaceKind::External);
        let mut s = ws.enter_scope();
        let t = s.alloc(&[1_000]).unwrap();
        assert_eq!(s.live_count(), 0);
        assert!(!s.is_live(&t));
        drop(s);
        assert_eq!(ws.capacity(), 0);
    }

    #[test]
    fn host_cache_mode_pins_cache_to_host() {
        let ws = Workspaces::new(WorkspaceMode::Separate, CacheMode::Host).unwrap();
        assert_eq!(ws.cache.location(), MemoryLocation::Host);
        assert_eq!(ws.external.location(), MemoryLocation::Device);
        assert!(ws.feed_forward.is_enabled());

        let single = Workspaces::new(WorkspaceMode::Single, CacheMode::None).unwrap();
        assert!(!single.feed_forward.is_enabled());
        assert!(!single.cache.is_enabled());
    }

    #[test]
    fn micro_step_promotes_into_external_and_releases_on_error() {
        let mut ws = Workspaces::new(WorkspaceMode::Separate, CacheMode::None).unwrap();
        ws.external.open_frame();

        let out = ws.micro_step(|s| s.alloc(&[3])).unwrap();
        assert!(ws.external.is_live(&out));
        assert_eq!(ws.feed_forward.depth(), 0);

        let err = ws.micro_step(|s| {
            s.alloc(&[3])?;
            Err::<Tensor, _>(Error::MissingLabels)
        });
        assert_eq!(err.unwrap_err(), Error::MissingLabels);
        assert_eq!(ws.feed_forward.depth(), 0);
        assert_eq!(ws.feed_forward.live_count(), 0);

        ws.external.close_frame();
        assert_eq!(ws.external.live_count(), 0);
    }
}
