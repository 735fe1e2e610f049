//! Differentiable operations.
//!
//! Each operation computes its forward value eagerly and records a node whose `backward`
//! accumulates the output gradient into the gradient slots of its inputs.

use super::{GradCell, GraphNode, Variable};
use crate::error::Result;
use crate::nn::Parameter;
use crate::tensor::{Tensor, TensorElem};
use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::Rc;

/// Adds `grad` into `cell`, initializing it on first use.
pub(crate) fn accumulate<T: TensorElem, const RANK: usize>(
    cell: &GradCell<T, RANK>,
    grad: Tensor<T, RANK>,
) -> Result<()> {
    let mut slot = cell.borrow_mut();
    match slot.as_mut() {
        Some(existing) => existing.add_assign(&grad),
        None => {
            *slot = Some(grad);
            Ok(())
        }
    }
}

fn parents_of(nodes: &[&Option<Rc<dyn GraphNode>>]) -> Vec<Rc<dyn GraphNode>> {
    nodes.iter().filter_map(|n| (*n).clone()).collect()
}

/// A forward operand kept for the backward pass.
///
/// Parameter views keep the handle and re-read the parameter when the gradient is computed,
/// so a sharded parameter does not stay materialized inside the graph.
#[derive(Debug)]
enum Saved<T: TensorElem, const RANK: usize> {
    Value(Tensor<T, RANK>),
    Param(Parameter<T>),
}

impl<T: TensorElem, const RANK: usize> Saved<T, RANK> {
    fn capture(var: &Variable<T, RANK>) -> Self {
        match &var.source {
            Some(param) => Saved::Param(param.clone()),
            None => Saved::Value(var.data.clone()),
        }
    }

    fn load(&self) -> Result<Tensor<T, RANK>> {
        match self {
            Saved::Value(t) => Ok(t.clone()),
            Saved::Param(p) => p.full_tensor(),
        }
    }
}

// --- Add ---

#[derive(Debug)]
struct AddNode<T: TensorElem, const RANK: usize> {
    lhs_grad: GradCell<T, RANK>,
    rhs_grad: GradCell<T, RANK>,
    out_grad: GradCell<T, RANK>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem, const RANK: usize> GraphNode for AddNode<T, RANK> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = self.out_grad.borrow().clone() else {
            return Ok(());
        };
        accumulate(&self.lhs_grad, grad.clone())?;
        accumulate(&self.rhs_grad, grad)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }

    fn discard_grad(&self) {
        self.out_grad.borrow_mut().take();
    }
}

// --- MatMul ---

#[derive(Debug)]
struct MatMulNode<T: TensorElem> {
    lhs: Saved<T, 2>,
    rhs: Saved<T, 2>,
    lhs_grad: GradCell<T, 2>,
    rhs_grad: GradCell<T, 2>,
    out_grad: GradCell<T, 2>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for MatMulNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = self.out_grad.borrow().clone() else {
            return Ok(());
        };
        // C = A @ B:  dA = dC @ B^T,  dB = A^T @ dC
        let lhs = self.lhs.load()?;
        let rhs = self.rhs.load()?;
        accumulate(&self.lhs_grad, grad.matmul(&rhs.transpose())?)?;
        accumulate(&self.rhs_grad, lhs.transpose().matmul(&grad)?)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }

    fn discard_grad(&self) {
        self.out_grad.borrow_mut().take();
    }
}

// --- AddBias ---

#[derive(Debug)]
struct AddBiasNode<T: TensorElem> {
    input_grad: GradCell<T, 2>,
    bias_grad: GradCell<T, 1>,
    out_grad: GradCell<T, 2>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for AddBiasNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = self.out_grad.borrow().clone() else {
            return Ok(());
        };
        accumulate(&self.bias_grad, grad.sum_rows())?;
        accumulate(&self.input_grad, grad)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }

    fn discard_grad(&self) {
        self.out_grad.borrow_mut().take();
    }
}

// --- ReLU ---

#[derive(Debug)]
struct ReluNode<T: TensorElem, const RANK: usize> {
    /// 1 where the input was positive, 0 elsewhere.
    mask: Tensor<T, RANK>,
    input_grad: GradCell<T, RANK>,
    out_grad: GradCell<T, RANK>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem, const RANK: usize> GraphNode for ReluNode<T, RANK> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = self.out_grad.borrow().clone() else {
            return Ok(());
        };
        accumulate(&self.input_grad, (&grad * &self.mask)?)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }

    fn discard_grad(&self) {
        self.out_grad.borrow_mut().take();
    }
}

// --- Sum ---

#[derive(Debug)]
struct SumNode<T: TensorElem, const RANK: usize> {
    shape: [usize; RANK],
    input_grad: GradCell<T, RANK>,
    out_grad: GradCell<T, 0>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem, const RANK: usize> GraphNode for SumNode<T, RANK> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = self.out_grad.borrow().clone() else {
            return Ok(());
        };
        let g = grad.data()[0];
        accumulate(&self.input_grad, Tensor::from_fn(self.shape, |_| g))
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }

    fn discard_grad(&self) {
        self.out_grad.borrow_mut().take();
    }
}

impl<T, const RANK: usize> Variable<T, RANK>
where
    T: TensorElem,
{
    /// Element-wise addition.
    pub fn add(&self, rhs: &Self) -> Result<Self> {
        let data = (&self.data + &rhs.data)?;
        let out_grad = Rc::new(RefCell::new(None));
        let node = Rc::new(AddNode {
            lhs_grad: self.grad.clone(),
            rhs_grad: rhs.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node, &rhs.node]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }

    /// Rectified linear unit, `max(x, 0)`.
    pub fn relu(&self) -> Self {
        let zero = T::zero();
        let data = self.data.map(|x| if x > zero { x } else { zero });
        let mask = self
            .data
            .map(|x| if x > zero { T::one() } else { zero });
        let out_grad = Rc::new(RefCell::new(None));
        let node = Rc::new(ReluNode {
            mask,
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node]),
        });
        Variable::with_node(data, out_grad, node)
    }

    /// Sums every element into a scalar.
    pub fn sum(&self) -> Variable<T, 0> {
        let total = self.data.data().iter().fold(T::zero(), |acc, &x| acc + x);
        let data = Tensor::from_fn([], |_| total);
        let out_grad = Rc::new(RefCell::new(None));
        let node = Rc::new(SumNode {
            shape: *self.data.shape(),
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node]),
        });
        Variable::with_node(data, out_grad, node)
    }
}

impl<T> Variable<T, 2>
where
    T: TensorElem,
{
    /// Matrix multiplication, `[M, K] x [K, N] -> [M, N]`.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        let data = self.data.matmul(&rhs.data)?;
        let out_grad = Rc::new(RefCell::new(None));
        let node = Rc::new(MatMulNode {
            lhs: Saved::capture(self),
            rhs: Saved::capture(rhs),
            lhs_grad: self.grad.clone(),
            rhs_grad: rhs.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node, &rhs.node]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }

    /// Adds a `[N]` bias to every row of `[M, N]`.
    pub fn add_bias(&self, bias: &Variable<T, 1>) -> Result<Self> {
        let data = self.data.add_row(&bias.data)?;
        let out_grad = Rc::new(RefCell::new(None));
        let node = Rc::new(AddBiasNode {
            input_grad: self.grad.clone(),
            bias_grad: bias.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node, &bias.node]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }
}
