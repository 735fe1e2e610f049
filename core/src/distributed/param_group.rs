//! Flattening of several parameters into one communication buffer.
//!
//! Every member is padded to a multiple of the world size on its own and split the same way
//! a single [`ShardedFlatParameter`](super::flat_param::ShardedFlatParameter) is. The group
//! buffer is **rank-major**: block `r` is the concatenation of every member's chunk `r`, so
//! each rank's share of the group is one contiguous block and a single all-gather (or
//! all-reduce) moves the whole group.
//!
//! ```text
//! members      a = [a0 a1 a2]            b = [b0 b1 b2 b3 b4]
//! world size 2 a chunks [a0 a1] [a2 _]   b chunks [b0 b1 b2] [b3 b4 _]
//! buffer       | a0 a1 b0 b1 b2 | a2 _ b3 b4 _ |
//!                   rank 0          rank 1
//! ```

use super::backend::CollectiveBackend;
use super::sharding::ShardSpec;
use crate::autograd::GraphNode;
use crate::error::{Error, Result};
use crate::nn::{ParamState, Parameter};
use crate::tensor::{Tensor, TensorElem};
use std::rc::Rc;
use tracing::debug;

/// Position of one member inside a rank block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberLayout {
    pub name: String,
    pub shape: Vec<usize>,
    /// Offset of this member's chunk inside every rank block.
    pub offset: usize,
    pub spec: ShardSpec,
}

/// Layout of a group buffer, identical on every rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupLayout {
    members: Vec<MemberLayout>,
    block_len: usize,
    world_size: usize,
}

impl GroupLayout {
    /// Computes the layout of `(name, shape)` members split across `world_size` ranks.
    pub fn new(members: &[(String, Vec<usize>)], world_size: usize, rank: usize) -> Result<Self> {
        let mut offset = 0;
        let mut layouts = Vec::with_capacity(members.len());
        for (name, shape) in members {
            let spec = ShardSpec::new(shape.iter().product(), world_size, rank)?;
            layouts.push(MemberLayout {
                name: name.clone(),
                shape: shape.clone(),
                offset,
                spec,
            });
            offset += spec.chunk_len();
        }
        Ok(Self {
            members: layouts,
            block_len: offset,
            world_size,
        })
    }

    pub fn members(&self) -> &[MemberLayout] {
        &self.members
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Length of one rank block, i.e. one rank's share of the group.
    pub fn block_len(&self) -> usize {
        self.block_len
    }

    /// Length of the whole padded buffer.
    pub fn buffer_len(&self) -> usize {
        self.block_len * self.world_size
    }

    /// Number of real (unpadded) elements.
    pub fn numel(&self) -> usize {
        self.members.iter().map(|m| m.spec.numel()).sum()
    }

    /// Writes full member tensors into `buffer`, zeroing the padding.
    pub fn flatten_into<T: TensorElem>(
        &self,
        members: &[Tensor<T, 1>],
        buffer: &mut Tensor<T, 1>,
    ) -> Result<()> {
        self.check_members(members)?;
        self.check_buffer(buffer)?;

        let out = buffer.data_mut();
        for (layout, tensor) in self.members.iter().zip(members) {
            let src = tensor.data();
            for rank in 0..self.world_size {
                let b = layout.spec.bounds_of(rank);
                let dst = rank * self.block_len + layout.offset;
                out[dst..dst + b.len].copy_from_slice(&src[b.start..b.start + b.len]);
                out[dst + b.len..dst + b.chunk_len()].fill(T::zero());
            }
        }
        Ok(())
    }

    /// Builds a fresh buffer from full member tensors.
    pub fn flatten<T: TensorElem>(&self, members: &[Tensor<T, 1>]) -> Result<Tensor<T, 1>> {
        let mut buffer = Tensor::zeros([self.buffer_len()]);
        self.flatten_into(members, &mut buffer)?;
        Ok(buffer)
    }

    /// Recovers the full (flattened, unpadded) member tensors from a group buffer.
    pub fn unflatten_from<T: TensorElem>(&self, buffer: &Tensor<T, 1>) -> Result<Vec<Tensor<T, 1>>> {
        self.check_buffer(buffer)?;

        let src = buffer.data();
        let members = self
            .members
            .iter()
            .map(|layout| {
                let mut full = Vec::with_capacity(layout.spec.numel());
                for rank in 0..self.world_size {
                    let b = layout.spec.bounds_of(rank);
                    let at = rank * self.block_len + layout.offset;
                    full.extend_from_slice(&src[at..at + b.len]);
                }
                Tensor::from_vec(full)
            })
            .collect();
        Ok(members)
    }

    fn check_members<T: TensorElem>(&self, members: &[Tensor<T, 1>]) -> Result<()> {
        if members.len() != self.members.len() {
            return Err(Error::Config(format!(
                "group has {} members, got {} tensors",
                self.members.len(),
                members.len()
            )));
        }
        for (layout, tensor) in self.members.iter().zip(members) {
            if tensor.size() != layout.spec.numel() {
                return Err(Error::ShapeMismatch {
                    expected: layout.shape.clone(),
                    got: tensor.shape().to_vec(),
                });
            }
        }
        Ok(())
    }

    fn check_buffer<T: TensorElem>(&self, buffer: &Tensor<T, 1>) -> Result<()> {
        if buffer.size() != self.buffer_len() {
            return Err(Error::ShapeMismatch {
                expected: vec![self.buffer_len()],
                got: buffer.shape().to_vec(),
            });
        }
        Ok(())
    }
}

/// The parameters of one wrapped module, sharded as a unit.
#[derive(Debug)]
pub struct FlatParamGroup<T: TensorElem> {
    params: Vec<Parameter<T>>,
    layout: GroupLayout,
}

impl<T: TensorElem> FlatParamGroup<T> {
    /// Takes over `params`, leaving every one of them SHARDED.
    ///
    /// Fails without touching any parameter if one is already managed or listed twice.
    pub fn new(params: Vec<(String, Parameter<T>)>, world_size: usize, rank: usize) -> Result<Self> {
        for (i, (name, p)) in params.iter().enumerate() {
            if p.is_managed() {
                return Err(Error::Config(format!(
                    "parameter `{name}` is already managed by a sharding coordinator"
                )));
            }
            if params[..i].iter().any(|(_, q)| q.ptr_eq(p)) {
                return Err(Error::Config(format!("parameter `{name}` is listed twice")));
            }
        }

        let shapes: Vec<_> = params
            .iter()
            .map(|(name, p)| (name.clone(), p.shape()))
            .collect();
        let layout = GroupLayout::new(&shapes, world_size, rank)?;
        for (_, p) in &params {
            p.into_managed(world_size, rank)?;
        }

        debug!(
            rank,
            world_size,
            members = params.len(),
            numel = layout.numel(),
            block_len = layout.block_len(),
            "sharded parameter group"
        );
        Ok(Self {
            params: params.into_iter().map(|(_, p)| p).collect(),
            layout,
        })
    }

    pub fn layout(&self) -> &GroupLayout {
        &self.layout
    }

    pub fn params(&self) -> &[Parameter<T>] {
        &self.params
    }

    pub fn is_sharded(&self) -> bool {
        self.params.iter().all(Parameter::is_sharded)
    }

    /// This rank's block: the concatenation of every member's local chunk.
    pub fn local_chunk(&self) -> Result<Tensor<T, 1>> {
        self.expect_all(ParamState::Sharded)?;
        let chunks: Vec<_> = self.params.iter().map(Parameter::data).collect();
        Ok(Tensor::cat(&chunks))
    }

    /// SHARDED -> FULL for every member with one all-gather.
    ///
    /// `hook` is attached to the full state so that graph leaves created from the members
    /// during this phase run it after their gradients are in.
    pub fn gather<B: CollectiveBackend>(
        &self,
        backend: &B,
        hook: Option<Rc<dyn GraphNode>>,
    ) -> Result<()> {
        let local = self.local_chunk()?;
        let buffer = if self.layout.world_size() == 1 {
            local
        } else {
            backend.all_gather(&local)?
        };
        let fulls = self.layout.unflatten_from(&buffer)?;
        for (p, full) in self.params.iter().zip(fulls) {
            p.with_managed(|flat| flat.materialize(full, hook.clone()))?;
        }
        debug!(rank = backend.rank(), numel = self.layout.numel(), "gathered full parameters");
        Ok(())
    }

    /// FULL -> SHARDED for every member. Full gradients, if any, are sliced to this rank's
    /// chunk.
    pub fn reshard(&self) -> Result<()> {
        self.expect_all(ParamState::Full)?;
        for p in &self.params {
            p.with_managed(|flat| flat.shard())?;
        }
        debug!(members = self.params.len(), "resharded parameters");
        Ok(())
    }

    /// FULL -> SHARDED without any collective, dropping the full gradients collected since
    /// the gather. Sharded gradients from earlier passes are kept.
    pub fn discard_full(&self) -> Result<()> {
        self.expect_all(ParamState::Full)?;
        for p in &self.params {
            p.with_managed(|flat| {
                flat.take_full_grad()?;
                flat.shard()
            })?;
        }
        debug!(members = self.params.len(), "discarded full gradients and resharded");
        Ok(())
    }

    /// Sums full gradients across ranks with one all-reduce, then reshards.
    ///
    /// With `reduce == false` (or a single rank) each rank keeps its own contribution.
    /// Members that received no gradient contribute zeros.
    pub fn reduce_and_reshard<B: CollectiveBackend>(&self, backend: &B, reduce: bool) -> Result<()> {
        self.expect_all(ParamState::Full)?;

        let mut grads = Vec::with_capacity(self.params.len());
        for p in &self.params {
            let grad = p.with_managed(|flat| {
                let numel = flat.spec().numel();
                Ok(flat.take_full_grad()?.unwrap_or_else(|| Tensor::zeros([numel])))
            })?;
            grads.push(grad);
        }

        if reduce && self.layout.world_size() > 1 {
            let buffer = self.layout.flatten(&grads)?;
            let reduced = backend.all_reduce_sum(&buffer)?;
            grads = self.layout.unflatten_from(&reduced)?;
            debug!(rank = backend.rank(), numel = self.layout.numel(), "reduced gradients");
        }

        for (p, grad) in self.params.iter().zip(grads) {
            p.with_managed(|flat| {
                flat.set_full_grad(grad)?;
                flat.shard()
            })?;
        }
        Ok(())
    }

    /// Fails unless every member is in `expected`. Nothing is changed.
    fn expect_all(&self, expected: ParamState) -> Result<()> {
        match self.params.iter().map(Parameter::state).find(|s| *s != expected) {
            None => Ok(()),
            Some(found) => Err(Error::InvalidState {
                expected: state_name(expected),
                found: state_name(found),
            }),
        }
    }
}

fn state_name(state: ParamState) -> &'static str {
    match state {
        ParamState::Local => "local",
        ParamState::Sharded => "sharded",
        ParamState::Full => "full",
    }
}
