//! A parameter whose flattened values are split across the ranks of a process group.

use super::backend::CollectiveBackend;
use super::sharding::ShardSpec;
use crate::autograd::GraphNode;
use crate::error::{Error, Result};
use crate::tensor::{Tensor, TensorElem};
use std::fmt;
use std::rc::Rc;

/// Where the values of a [`ShardedFlatParameter`] currently live.
enum FlatState<T: TensorElem> {
    /// Only this rank's chunk (`chunk_len` elements, zero padded) is held.
    Sharded {
        chunk: Tensor<T, 1>,
        grad: Option<Tensor<T, 1>>,
    },
    /// The whole parameter (`numel` elements) is materialized.
    Full {
        data: Tensor<T, 1>,
        grad: Option<Tensor<T, 1>>,
        /// Sharded gradient carried over from before the gather, re-added on `shard`.
        stashed_grad: Option<Tensor<T, 1>>,
        /// Graph node that must run after every use of this parameter in backward.
        hook: Option<Rc<dyn GraphNode>>,
    },
}

/// A flattened parameter with a SHARDED and a FULL state.
///
/// In the SHARDED state only this rank's contiguous chunk of the flattened, padded parameter
/// is stored; in the FULL state the whole logical tensor is. The gradient always has the shape
/// of the current state.
pub struct ShardedFlatParameter<T: TensorElem> {
    shape: Vec<usize>,
    spec: ShardSpec,
    state: FlatState<T>,
}

impl<T: TensorElem> ShardedFlatParameter<T> {
    /// Builds a parameter in the SHARDED state from its full flattened values.
    pub fn from_full(full: &Tensor<T, 1>, shape: Vec<usize>, spec: ShardSpec) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != spec.numel() {
            return Err(Error::ShapeMismatch {
                expected: vec![spec.numel()],
                got: shape,
            });
        }
        let mut param = Self {
            shape,
            spec,
            state: FlatState::Full {
                data: full.clone(),
                grad: None,
                stashed_grad: None,
                hook: None,
            },
        };
        param.check_full_len(full)?;
        param.shard()?;
        Ok(param)
    }

    /// Logical (unsharded) shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn spec(&self) -> &ShardSpec {
        &self.spec
    }

    pub fn is_sharded(&self) -> bool {
        matches!(self.state, FlatState::Sharded { .. })
    }

    pub(crate) fn state_name(&self) -> &'static str {
        match self.state {
            FlatState::Sharded { .. } => "sharded",
            FlatState::Full { .. } => "full",
        }
    }

    /// Values held locally: the padded chunk when sharded, the whole parameter when full.
    pub fn local_data(&self) -> &Tensor<T, 1> {
        match &self.state {
            FlatState::Sharded { chunk, .. } => chunk,
            FlatState::Full { data, .. } => data,
        }
    }

    /// Mutable access to the locally held values.
    pub fn local_data_mut(&mut self) -> &mut Tensor<T, 1> {
        match &mut self.state {
            FlatState::Sharded { chunk, .. } => chunk,
            FlatState::Full { data, .. } => data,
        }
    }

    /// Gradient matching the current state, if any.
    pub fn grad(&self) -> Option<&Tensor<T, 1>> {
        match &self.state {
            FlatState::Sharded { grad, .. } | FlatState::Full { grad, .. } => grad.as_ref(),
        }
    }

    pub fn zero_grad(&mut self) {
        match &mut self.state {
            FlatState::Sharded { grad, .. } => *grad = None,
            FlatState::Full {
                grad, stashed_grad, ..
            } => {
                *grad = None;
                *stashed_grad = None;
            }
        }
    }

    /// Slices `full` (any tensor with this parameter's element count, e.g. a gradient computed
    /// elsewhere) down to this rank's chunk, padded with zeros.
    pub fn sharded_chunk(&self, full: &Tensor<T, 1>) -> Result<Tensor<T, 1>> {
        self.check_full_len(full)?;
        let bounds = self.spec.bounds();
        full.narrow(bounds.start, bounds.len)?
            .padded(bounds.chunk_len())
    }

    /// FULL -> SHARDED: keeps only this rank's chunk of the values and of the gradient.
    ///
    /// A full gradient, if present, is sliced and added to the gradient stashed at gather time.
    pub fn shard(&mut self) -> Result<()> {
        let FlatState::Full {
            data,
            grad,
            stashed_grad,
            ..
        } = &self.state
        else {
            return Err(self.invalid("full"));
        };

        let chunk = self.sharded_chunk(data)?;
        let grad = match (grad, stashed_grad) {
            (Some(full), Some(stash)) => Some((&self.sharded_chunk(full)? + stash)?),
            (Some(full), None) => Some(self.sharded_chunk(full)?),
            (None, stash) => stash.clone(),
        };
        self.state = FlatState::Sharded { chunk, grad };
        Ok(())
    }

    /// SHARDED -> FULL through an all-gather of every rank's chunk.
    ///
    /// The result is exactly the values that were sharded: the gather only concatenates, and
    /// padding is dropped. With a single rank no collective is issued.
    pub fn unshard<B: CollectiveBackend>(&mut self, backend: &B) -> Result<()> {
        let FlatState::Sharded { chunk, .. } = &self.state else {
            return Err(self.invalid("sharded"));
        };
        let full = if self.spec.world_size() == 1 {
            chunk.clone()
        } else {
            let gathered = backend.all_gather(chunk)?;
            self.unpad(&gathered)?
        };
        self.materialize(full, None)
    }

    /// Drops padding from a rank-major gather of padded chunks.
    pub(crate) fn unpad(&self, gathered: &Tensor<T, 1>) -> Result<Tensor<T, 1>> {
        if gathered.size() != self.spec.padded_numel() {
            return Err(Error::ShapeMismatch {
                expected: vec![self.spec.padded_numel()],
                got: vec![gathered.size()],
            });
        }
        // Padding sits at the tail of the buffer, so the prefix is the parameter.
        gathered.narrow(0, self.spec.numel())
    }

    /// SHARDED -> FULL with values produced by a collective elsewhere (the group gather).
    pub(crate) fn materialize(
        &mut self,
        full: Tensor<T, 1>,
        hook: Option<Rc<dyn GraphNode>>,
    ) -> Result<()> {
        self.check_full_len(&full)?;
        let FlatState::Sharded { grad, .. } = &mut self.state else {
            return Err(self.invalid("sharded"));
        };
        let stashed_grad = grad.take();
        self.state = FlatState::Full {
            data: full,
            grad: None,
            stashed_grad,
            hook,
        };
        Ok(())
    }

    pub(crate) fn hook(&self) -> Option<Rc<dyn GraphNode>> {
        match &self.state {
            FlatState::Full { hook, .. } => hook.clone(),
            FlatState::Sharded { .. } => None,
        }
    }

    /// Adds a full-shape gradient contribution. Only valid while FULL.
    pub(crate) fn accumulate_full_grad(&mut self, contribution: Tensor<T, 1>) -> Result<()> {
        self.check_full_len(&contribution)?;
        let FlatState::Full { grad, .. } = &mut self.state else {
            return Err(self.invalid("full"));
        };
        match grad {
            Some(g) => g.add_assign(&contribution),
            None => {
                *grad = Some(contribution);
                Ok(())
            }
        }
    }

    /// Takes the full gradient out, leaving `None`. Only valid while FULL.
    pub(crate) fn take_full_grad(&mut self) -> Result<Option<Tensor<T, 1>>> {
        match &mut self.state {
            FlatState::Full { grad, .. } => Ok(grad.take()),
            FlatState::Sharded { .. } => Err(self.invalid("full")),
        }
    }

    /// Replaces the full gradient. Only valid while FULL.
    pub(crate) fn set_full_grad(&mut self, value: Tensor<T, 1>) -> Result<()> {
        self.check_full_len(&value)?;
        match &mut self.state {
            FlatState::Full { grad, .. } => {
                *grad = Some(value);
                Ok(())
            }
            FlatState::Sharded { .. } => Err(self.invalid("full")),
        }
    }

    fn check_full_len(&self, full: &Tensor<T, 1>) -> Result<()> {
        if full.size() != self.spec.numel() {
            return Err(Error::ShapeMismatch {
                expected: self.shape.clone(),
                got: vec![full.size()],
            });
        }
        Ok(())
    }

    fn invalid(&self, expected: &'static str) -> Error {
        Error::InvalidState {
            expected,
            found: self.state_name(),
        }
    }
}

impl<T: TensorElem> fmt::Debug for ShardedFlatParameter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedFlatParameter")
            .field("shape", &self.shape)
            .field("spec", &self.spec)
            .field("state", &self.state_name())
            .field("local_len", &self.local_data().size())
            .finish()
    }
}
