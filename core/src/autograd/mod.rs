//! Automatic Differentiation (Autograd) module.
//!
//! `fsdp-rs` implements reverse-mode AD with a define-by-run graph: every operation on
//! [`Variable`]s allocates a [`GraphNode`] that remembers how to push the output gradient back
//! to its inputs, and the `Rc` links between nodes form the DAG. Calling
//! [`Variable::backward`] on the loss sorts that DAG topologically and runs every node in
//! reverse order.
//!
//! Two properties matter for sharded training:
//!
//! 1. Backward is fallible. A node may issue a collective (the sharding coordinator hooks
//!    gather and reduce steps into the graph), and a failed collective must reach the caller.
//! 2. An operand that is a view of a module [`Parameter`](crate::nn::Parameter) is *not*
//!    copied into the graph. The node keeps the parameter handle and reads the full values
//!    again during backward, so the parameter only needs to be materialized while it is
//!    actually in use.
//!
//! ```rust
//! use fsdp_rs::autograd::Variable;
//! use fsdp_rs::tensor::Tensor;
//!
//! let x = Variable::new(Tensor::<f32, 1>::from_vec(vec![3.0]));
//! let y = x.add(&x).unwrap().sum();
//! y.backward().unwrap();
//!
//! // d(x + x)/dx = 2
//! assert_eq!(x.grad_value().unwrap().data(), &[2.0]);
//! ```

use crate::error::Result;
use crate::nn::Parameter;
use crate::tensor::{Tensor, TensorElem};
use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::Rc;

pub mod engine;
pub mod ops;

/// Shared, lazily-filled gradient slot of a variable.
pub type GradCell<T, const RANK: usize> = Rc<RefCell<Option<Tensor<T, RANK>>>>;

/// A node in the computation graph.
pub trait GraphNode: Debug {
    /// Computes the gradient for this node and propagates it to its inputs.
    fn backward(&self) -> Result<()>;
    /// Returns the nodes that produced this node's inputs.
    fn parents(&self) -> Vec<Rc<dyn GraphNode>>;

    /// Drops the gradient collected for this node's output. Called on every node but the
    /// root when a backward pass fails.
    fn discard_grad(&self) {}

    /// Releases what a completed `backward` still holds once a later node of the same pass
    /// has failed.
    fn abort(&self) {}
}

/// A variable in the computation graph.
#[derive(Clone, Debug)]
pub struct Variable<T, const RANK: usize>
where
    T: TensorElem,
{
    /// The forward value.
    pub data: Tensor<T, RANK>,
    /// The gradient of the loss with respect to this variable.
    pub grad: GradCell<T, RANK>,
    /// The node that produced this variable (`None` for plain leaves).
    pub node: Option<Rc<dyn GraphNode>>,
    /// The parameter this variable views, if any.
    pub(crate) source: Option<Parameter<T>>,
}

impl<T, const RANK: usize> Variable<T, RANK>
where
    T: TensorElem,
{
    /// Creates a new leaf variable (inputs, constants).
    pub fn new(data: Tensor<T, RANK>) -> Self {
        Self {
            data,
            grad: Rc::new(RefCell::new(None)),
            node: None,
            source: None,
        }
    }

    /// Creates a variable produced by `node`, with `grad` as its gradient slot.
    pub fn with_node(data: Tensor<T, RANK>, grad: GradCell<T, RANK>, node: Rc<dyn GraphNode>) -> Self {
        Self {
            data,
            grad,
            node: Some(node),
            source: None,
        }
    }

    pub(crate) fn with_source(mut self, source: Parameter<T>) -> Self {
        self.source = Some(source);
        self
    }

    /// Returns a copy of the accumulated gradient.
    pub fn grad_value(&self) -> Option<Tensor<T, RANK>> {
        self.grad.borrow().clone()
    }

    /// Runs the backward pass with this variable as the root.
    ///
    /// The root gradient is seeded with ones unless a gradient is already present.
    ///
    /// If a node fails, the gradients of every intermediate variable are dropped, so the pass
    /// can be run again from the same root. Gradients already delivered to parameters are
    /// kept; call `zero_grad` on the module first if they should not count twice.
    pub fn backward(&self) -> Result<()> {
        {
            let mut grad = self.grad.borrow_mut();
            if grad.is_none() {
                *grad = Some(Tensor::ones(*self.data.shape()));
            }
        }
        engine::backward(self.node.clone())
    }
}
