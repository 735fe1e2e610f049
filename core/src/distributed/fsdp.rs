use super::backend::CollectiveBackend;
use super::param_group::FlatParamGroup;
use crate::autograd::{GradCell, GraphNode, Variable};
use crate::autograd::ops::accumulate;
use crate::error::{Error, Result};
use crate::nn::{Module, Parameter};
use crate::tensor::TensorElem;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, warn};

/// Debug switches for [`Fsdp`].
///
/// Deserializes from a partial config: missing fields keep their defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsdpDebugConfig {
    /// Skip the gradient all-reduce: every rank keeps its own contribution, sharded.
    pub no_reduce_grads: bool,
}

/// State shared between the wrapper and the graph nodes it inserts.
struct Shared<T: TensorElem, B> {
    group: FlatParamGroup<T>,
    backend: B,
    config: FsdpDebugConfig,
}

/// A wrapper for Fully Sharded Data Parallelism.
///
/// On construction every parameter of the wrapped module is flattened, and each rank keeps
/// only its chunk. Full parameters exist only while they are needed:
///
/// 1. `forward`: All-Gather, run the module, reshard.
/// 2. `backward`: All-Gather again before the module's gradients are computed, then
///    All-Reduce (SUM) the full gradients and keep this rank's chunk of the result.
///
/// Outside of those phases (and of [`Fsdp::summon_full_params`]) every managed parameter is
/// sharded. Gradients are summed, not averaged, across ranks.
///
/// # Example
///
/// ```rust
/// use fsdp_rs::autograd::Variable;
/// use fsdp_rs::distributed::cpu_backend::CpuBackend;
/// use fsdp_rs::distributed::fsdp::{Fsdp, FsdpDebugConfig};
/// use fsdp_rs::nn::Linear;
/// use fsdp_rs::tensor::Tensor;
///
/// let backend = CpuBackend::ring(1).pop().unwrap();
/// let layer = Linear::<f32>::new(Tensor::ones([3, 2]), None);
/// let model = Fsdp::new(layer, backend, FsdpDebugConfig::default()).unwrap();
///
/// let out = model.forward(&Variable::new(Tensor::ones([4, 3]))).unwrap();
/// out.sum().backward().unwrap();
/// assert!(model.parameters().iter().all(|p| p.is_sharded()));
/// ```
pub struct Fsdp<T: TensorElem, M: Module<T>, B: CollectiveBackend> {
    module: M,
    shared: Rc<Shared<T, B>>,
}

impl<T, M, B> Fsdp<T, M, B>
where
    T: TensorElem,
    M: Module<T>,
    B: CollectiveBackend + 'static,
{
    /// Shards `module`'s parameters across `backend`'s process group.
    ///
    /// Fails with [`Error::Config`] if a parameter is already managed (nested wrapping).
    pub fn new(module: M, backend: B, config: FsdpDebugConfig) -> Result<Self> {
        let (world_size, rank) = (backend.world_size(), backend.rank());
        let group = FlatParamGroup::new(module.named_parameters(), world_size, rank)?;
        debug!(rank, world_size, ?config, "wrapped module with fsdp");
        Ok(Self {
            module,
            shared: Rc::new(Shared {
                group,
                backend,
                config,
            }),
        })
    }

    /// Runs the wrapped module with full parameters.
    ///
    /// Parameters are resharded before returning, also when the module fails. The returned
    /// variable carries a node that gathers the parameters again when backward reaches it,
    /// and reduces and reshards them once every gradient of the module is in.
    pub fn forward(&self, input: &Variable<T, 2>) -> Result<Variable<T, 2>> {
        let post: Rc<dyn GraphNode> = Rc::new(PostBackwardNode {
            shared: self.shared.clone(),
        });
        self.shared
            .group
            .gather(&self.shared.backend, Some(post.clone()))?;

        let result = self.module.forward(input);
        let resharded = self.shared.group.reshard();
        let output = result?;
        resharded?;

        let out_grad: GradCell<T, 2> = Rc::new(RefCell::new(None));
        let mut parents: Vec<Rc<dyn GraphNode>> = output.node.iter().cloned().collect();
        // The post-backward node must run even if no parameter took part in the output.
        parents.push(post);
        let node = Rc::new(PreBackwardNode {
            shared: self.shared.clone(),
            inner_grad: output.grad.clone(),
            out_grad: out_grad.clone(),
            parents,
        });
        Ok(Variable::with_node(output.data, out_grad, node))
    }

    /// Materializes every parameter until the returned guard is dropped or released.
    ///
    /// Inside the scope parameters are FULL and may be read or overwritten (e.g. with
    /// [`Module::load_state_dict`]); resharding keeps whatever values they hold then.
    pub fn summon_full_params(&mut self) -> Result<FullParamsGuard<'_, T, M, B>> {
        self.shared.group.gather(&self.shared.backend, None)?;
        Ok(FullParamsGuard {
            fsdp: self,
            released: false,
        })
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut M {
        &mut self.module
    }

    pub fn process_group(&self) -> &B {
        &self.shared.backend
    }

    pub fn debug_config(&self) -> FsdpDebugConfig {
        self.shared.config
    }

    pub fn named_parameters(&self) -> Vec<(String, Parameter<T>)> {
        self.module.named_parameters()
    }

    pub fn parameters(&self) -> Vec<Parameter<T>> {
        self.module.parameters()
    }

    pub fn zero_grad(&self) {
        self.module.zero_grad();
    }

    /// Whether every managed parameter is currently sharded.
    pub fn is_sharded(&self) -> bool {
        self.shared.group.is_sharded()
    }
}

/// A wrapped module is a module: sibling submodules can each be wrapped with their own
/// group and composed, every one gathering and reducing its own parameters.
impl<T, M, B> Module<T> for Fsdp<T, M, B>
where
    T: TensorElem,
    M: Module<T>,
    B: CollectiveBackend + 'static,
{
    fn forward(&self, input: &Variable<T, 2>) -> Result<Variable<T, 2>> {
        Fsdp::forward(self, input)
    }

    fn named_parameters(&self) -> Vec<(String, Parameter<T>)> {
        self.module.named_parameters()
    }
}

impl<T: TensorElem, M: Module<T>, B: CollectiveBackend> fmt::Debug for Fsdp<T, M, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fsdp")
            .field("module", &self.module)
            .field("rank", &self.shared.backend.rank())
            .field("world_size", &self.shared.backend.world_size())
            .field("config", &self.shared.config)
            .finish()
    }
}

/// Scope in which the parameters of an [`Fsdp`] module are full.
///
/// Dropping the guard reshards (errors are logged); [`FullParamsGuard::release`] reshards and
/// returns the error instead.
pub struct FullParamsGuard<'a, T: TensorElem, M: Module<T>, B: CollectiveBackend> {
    fsdp: &'a mut Fsdp<T, M, B>,
    released: bool,
}

impl<T, M, B> FullParamsGuard<'_, T, M, B>
where
    T: TensorElem,
    M: Module<T>,
    B: CollectiveBackend,
{
    pub fn module(&self) -> &M {
        &self.fsdp.module
    }

    pub fn module_mut(&mut self) -> &mut M {
        &mut self.fsdp.module
    }

    /// Leaves the scope, resharding now.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.fsdp.shared.group.reshard()
    }
}

impl<T, M, B> Drop for FullParamsGuard<'_, T, M, B>
where
    T: TensorElem,
    M: Module<T>,
    B: CollectiveBackend,
{
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.fsdp.shared.group.reshard() {
            warn!(%err, "failed to reshard parameters when leaving full-parameter scope");
        }
    }
}

/// Sits between the wrapper's output and the module's output. Gathers the parameters
/// before any node of the module reads them, then passes the gradient through.
struct PreBackwardNode<T: TensorElem, B> {
    shared: Rc<Shared<T, B>>,
    inner_grad: GradCell<T, 2>,
    out_grad: GradCell<T, 2>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem, B> fmt::Debug for PreBackwardNode<T, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreBackwardNode").finish_non_exhaustive()
    }
}

impl<T: TensorElem, B: CollectiveBackend> GraphNode for PreBackwardNode<T, B> {
    fn backward(&self) -> Result<()> {
        if !self.shared.group.is_sharded() {
            // Full here means another scope (a guard, or a forward whose backward has not
            // finished) still owns the parameters.
            return Err(Error::InvalidState {
                expected: "sharded",
                found: "full",
            });
        }
        self.shared.group.gather(&self.shared.backend, None)?;
        debug!(rank = self.shared.backend.rank(), "pre-backward gather");

        let grad = self.out_grad.borrow_mut().take();
        match grad {
            Some(g) => accumulate(&self.inner_grad, g),
            None => Ok(()),
        }
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }

    fn discard_grad(&self) {
        self.out_grad.borrow_mut().take();
    }

    /// A later node failed: the post-backward node will not run, so give up this pass's
    /// full gradients and reshard locally.
    fn abort(&self) {
        if self.shared.group.is_sharded() {
            return;
        }
        match self.shared.group.discard_full() {
            Ok(()) => warn!(
                rank = self.shared.backend.rank(),
                "backward failed after gather, dropped full gradients and resharded"
            ),
            Err(err) => warn!(%err, "failed to reshard parameters after a failed backward"),
        }
    }
}

/// Parent of every parameter leaf created during one forward: runs once their gradients
/// are in, reduces them and reshards.
struct PostBackwardNode<T: TensorElem, B> {
    shared: Rc<Shared<T, B>>,
}

impl<T: TensorElem, B> fmt::Debug for PostBackwardNode<T, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostBackwardNode").finish_non_exhaustive()
    }
}

impl<T: TensorElem, B: CollectiveBackend> GraphNode for PostBackwardNode<T, B> {
    fn backward(&self) -> Result<()> {
        let reduce = !self.shared.config.no_reduce_grads;
        self.shared
            .group
            .reduce_and_reshard(&self.shared.backend, reduce)?;
        debug!(rank = self.shared.backend.rank(), reduce, "post-backward reshard");
        Ok(())
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        Vec::new()
    }
}
