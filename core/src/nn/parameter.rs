//! Learnable parameters.
//!
//! A [`Parameter`] is a shared handle: the module that owns it, the graph nodes that read it
//! during backward and the sharding coordinator that manages it all see the same storage.
//! What the storage currently is is an explicit tag ([`ParamSlot`]) rather than a runtime type
//! check.

use crate::autograd::{GradCell, GraphNode, Variable};
use crate::distributed::flat_param::ShardedFlatParameter;
use crate::distributed::sharding::ShardSpec;
use crate::error::{Error, Result};
use crate::tensor::{Tensor, TensorElem};
use std::cell::{Ref, RefCell};
use std::fmt;
use std::rc::Rc;

/// A parameter that lives entirely on this worker.
#[derive(Debug, Clone)]
pub struct LocalParam<T: TensorElem> {
    shape: Vec<usize>,
    data: Tensor<T, 1>,
    grad: Option<Tensor<T, 1>>,
}

impl<T: TensorElem> LocalParam<T> {
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &Tensor<T, 1> {
        &self.data
    }

    pub fn grad(&self) -> Option<&Tensor<T, 1>> {
        self.grad.as_ref()
    }
}

/// Storage behind a [`Parameter`].
#[derive(Debug)]
pub enum ParamSlot<T: TensorElem> {
    /// Not managed by a sharding coordinator.
    Local(LocalParam<T>),
    /// Managed by a sharding coordinator; sharded or full.
    Managed(ShardedFlatParameter<T>),
}

/// Query form of a parameter's storage state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamState {
    Local,
    Sharded,
    Full,
}

/// Shared handle to a learnable tensor.
///
/// Values and gradients are stored flattened; [`Parameter::shape`] keeps the logical shape.
#[derive(Clone)]
pub struct Parameter<T: TensorElem> {
    slot: Rc<RefCell<ParamSlot<T>>>,
}

impl<T: TensorElem> Parameter<T> {
    pub fn new<const RANK: usize>(tensor: Tensor<T, RANK>) -> Self {
        let shape = tensor.shape().to_vec();
        Self {
            slot: Rc::new(RefCell::new(ParamSlot::Local(LocalParam {
                shape,
                data: tensor.into_flat(),
                grad: None,
            }))),
        }
    }

    /// Borrows the underlying storage.
    pub fn slot(&self) -> Ref<'_, ParamSlot<T>> {
        self.slot.borrow()
    }

    /// Logical (unsharded) shape.
    pub fn shape(&self) -> Vec<usize> {
        match &*self.slot.borrow() {
            ParamSlot::Local(p) => p.shape.clone(),
            ParamSlot::Managed(p) => p.shape().to_vec(),
        }
    }

    pub fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn state(&self) -> ParamState {
        match &*self.slot.borrow() {
            ParamSlot::Local(_) => ParamState::Local,
            ParamSlot::Managed(p) if p.is_sharded() => ParamState::Sharded,
            ParamSlot::Managed(_) => ParamState::Full,
        }
    }

    pub fn is_managed(&self) -> bool {
        self.state() != ParamState::Local
    }

    pub fn is_sharded(&self) -> bool {
        self.state() == ParamState::Sharded
    }

    /// Values held on this worker: the padded chunk when sharded, every element otherwise.
    pub fn data(&self) -> Tensor<T, 1> {
        match &*self.slot.borrow() {
            ParamSlot::Local(p) => p.data.clone(),
            ParamSlot::Managed(p) => p.local_data().clone(),
        }
    }

    /// Gradient matching the current state: a chunk when sharded, full otherwise.
    pub fn grad(&self) -> Option<Tensor<T, 1>> {
        match &*self.slot.borrow() {
            ParamSlot::Local(p) => p.grad.clone(),
            ParamSlot::Managed(p) => p.grad().cloned(),
        }
    }

    pub fn zero_grad(&self) {
        match &mut *self.slot.borrow_mut() {
            ParamSlot::Local(p) => p.grad = None,
            ParamSlot::Managed(p) => p.zero_grad(),
        }
    }

    /// This worker's chunk of `full`, a tensor with the parameter's element count.
    pub fn sharded_chunk<const RANK: usize>(&self, full: &Tensor<T, RANK>) -> Result<Tensor<T, 1>> {
        self.with_managed(|p| p.sharded_chunk(&full.flatten()))
    }

    /// Overwrites the values. The parameter must be local or full.
    pub fn copy_from<const RANK: usize>(&self, values: &Tensor<T, RANK>) -> Result<()> {
        let numel = self.numel();
        if values.size() != numel {
            return Err(Error::ShapeMismatch {
                expected: self.shape(),
                got: values.shape().to_vec(),
            });
        }
        let mut slot = self.slot.borrow_mut();
        let target = match &mut *slot {
            ParamSlot::Local(p) => &mut p.data,
            ParamSlot::Managed(p) if !p.is_sharded() => p.local_data_mut(),
            ParamSlot::Managed(_) => {
                return Err(Error::InvalidState {
                    expected: "full",
                    found: "sharded",
                });
            }
        };
        target.data_mut().copy_from_slice(values.data());
        Ok(())
    }

    /// Graph leaf viewing this parameter. Gradients reaching the leaf are added to
    /// [`Parameter::grad`].
    ///
    /// Fails with [`Error::InvalidState`] while the parameter is sharded.
    pub fn variable<const RANK: usize>(&self) -> Result<Variable<T, RANK>> {
        let data = self.full_tensor::<RANK>()?;
        let hook = match &*self.slot.borrow() {
            ParamSlot::Managed(p) => p.hook(),
            ParamSlot::Local(_) => None,
        };
        let grad: GradCell<T, RANK> = Rc::new(RefCell::new(None));
        let node = Rc::new(ParamLeafNode {
            param: self.clone(),
            grad: grad.clone(),
            parents: hook.into_iter().collect(),
        });
        Ok(Variable::with_node(data, grad, node).with_source(self.clone()))
    }

    /// Full values in the logical shape.
    pub(crate) fn full_tensor<const RANK: usize>(&self) -> Result<Tensor<T, RANK>> {
        let (flat, shape) = match &*self.slot.borrow() {
            ParamSlot::Local(p) => (p.data.clone(), p.shape.clone()),
            ParamSlot::Managed(p) if !p.is_sharded() => (p.local_data().clone(), p.shape().to_vec()),
            ParamSlot::Managed(_) => {
                return Err(Error::InvalidState {
                    expected: "full",
                    found: "sharded",
                });
            }
        };
        flat.reshape_dyn(&shape)
    }

    pub(crate) fn accumulate_grad(&self, contribution: Tensor<T, 1>) -> Result<()> {
        match &mut *self.slot.borrow_mut() {
            ParamSlot::Local(p) => match &mut p.grad {
                Some(g) => g.add_assign(&contribution),
                None => {
                    p.grad = Some(contribution);
                    Ok(())
                }
            },
            ParamSlot::Managed(p) => p.accumulate_full_grad(contribution),
        }
    }

    /// Replaces the gradient of a local parameter.
    pub(crate) fn set_local_grad(&self, grad: Tensor<T, 1>) -> Result<()> {
        match &mut *self.slot.borrow_mut() {
            ParamSlot::Local(p) if grad.size() == p.data.size() => {
                p.grad = Some(grad);
                Ok(())
            }
            ParamSlot::Local(p) => Err(Error::ShapeMismatch {
                expected: p.shape.clone(),
                got: vec![grad.size()],
            }),
            ParamSlot::Managed(_) => Err(Error::InvalidState {
                expected: "local",
                found: "managed",
            }),
        }
    }

    /// Hands the storage to a sharding coordinator. The parameter ends up SHARDED; an
    /// existing local gradient is dropped.
    pub(crate) fn into_managed(&self, world_size: usize, rank: usize) -> Result<()> {
        let mut slot = self.slot.borrow_mut();
        let ParamSlot::Local(local) = &*slot else {
            return Err(Error::Config("parameter is already managed by a sharding coordinator".into()));
        };
        let spec = ShardSpec::new(local.data.size(), world_size, rank)?;
        let flat = ShardedFlatParameter::from_full(&local.data, local.shape.clone(), spec)?;
        *slot = ParamSlot::Managed(flat);
        Ok(())
    }

    /// Runs `f` on the managed storage.
    pub(crate) fn with_managed<R>(
        &self,
        f: impl FnOnce(&mut ShardedFlatParameter<T>) -> Result<R>,
    ) -> Result<R> {
        match &mut *self.slot.borrow_mut() {
            ParamSlot::Managed(p) => f(p),
            ParamSlot::Local(_) => Err(Error::InvalidState {
                expected: "managed",
                found: "local",
            }),
        }
    }

    /// Whether two handles share storage.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.slot, &other.slot)
    }
}

impl<T: TensorElem> fmt::Debug for Parameter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `try_borrow` so formatting never panics while a node holds the slot.
        match self.slot.try_borrow() {
            Ok(slot) => f
                .debug_struct("Parameter")
                .field("shape", &match &*slot {
                    ParamSlot::Local(p) => p.shape.clone(),
                    ParamSlot::Managed(p) => p.shape().to_vec(),
                })
                .field("state", &match &*slot {
                    ParamSlot::Local(_) => ParamState::Local,
                    ParamSlot::Managed(p) if p.is_sharded() => ParamState::Sharded,
                    ParamSlot::Managed(_) => ParamState::Full,
                })
                .finish(),
            Err(_) => f.write_str("Parameter(<borrowed>)"),
        }
    }
}

/// Graph leaf of a parameter view: moves the gradient collected by the view into the
/// parameter.
///
/// For a managed parameter its only parent is the coordinator's post-backward node, so that
/// node runs after every leaf of the group.
struct ParamLeafNode<T: TensorElem, const RANK: usize> {
    param: Parameter<T>,
    grad: GradCell<T, RANK>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem, const RANK: usize> fmt::Debug for ParamLeafNode<T, RANK> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamLeafNode")
            .field("param", &self.param)
            .finish()
    }
}

impl<T: TensorElem, const RANK: usize> GraphNode for ParamLeafNode<T, RANK> {
    fn backward(&self) -> Result<()> {
        let grad = self.grad.borrow_mut().take();
        match grad {
            Some(g) => self.param.accumulate_grad(g.into_flat()),
            None => Ok(()),
        }
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }

    fn discard_grad(&self) {
        self.grad.borrow_mut().take();
    }
}
