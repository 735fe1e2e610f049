use super::backend::CollectiveBackend;
use super::sync::broadcast_parameters;
use crate::autograd::Variable;
use crate::error::{Error, Result};
use crate::nn::{Module, Parameter};
use crate::tensor::{Tensor, TensorElem};
use std::marker::PhantomData;
use tracing::debug;

/// Data parallelism with full replicas.
///
/// Every rank holds the whole module. Construction broadcasts rank 0's parameters so all
/// replicas start equal; after backward, [`Ddp::sync_gradients`] replaces every gradient by
/// its AVERAGE across ranks (one all-reduce for the whole model).
pub struct Ddp<T: TensorElem, M: Module<T>, B: CollectiveBackend> {
    module: M,
    backend: B,
    _marker: PhantomData<T>,
}

impl<T, M, B> Ddp<T, M, B>
where
    T: TensorElem,
    M: Module<T>,
    B: CollectiveBackend,
{
    pub fn new(module: M, backend: B) -> Result<Self> {
        broadcast_parameters(&module, &backend, 0)?;
        Ok(Self {
            module,
            backend,
            _marker: PhantomData,
        })
    }

    pub fn forward(&self, input: &Variable<T, 2>) -> Result<Variable<T, 2>> {
        self.module.forward(input)
    }

    /// Averages gradients across ranks. Parameters without a gradient take part as zeros
    /// and end up with the average.
    pub fn sync_gradients(&self) -> Result<()> {
        let params = self.module.parameters();
        let world_size = self.backend.world_size();

        let grads: Vec<Tensor<T, 1>> = params
            .iter()
            .map(|p| p.grad().unwrap_or_else(|| Tensor::zeros([p.numel()])))
            .collect();
        let bucket = Tensor::cat(&grads);
        let reduced = self.backend.all_reduce_sum(&bucket)?;

        let scale = T::from_usize(world_size)
            .map(|n| T::one() / n)
            .ok_or_else(|| Error::Unsupported("world size not representable".into()))?;
        let averaged = reduced.scale(scale);

        let mut offset = 0;
        for p in &params {
            let n = p.numel();
            p.set_local_grad(averaged.narrow(offset, n)?)?;
            offset += n;
        }
        debug!(
            rank = self.backend.rank(),
            world_size,
            numel = bucket.size(),
            "averaged gradients"
        );
        Ok(())
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn parameters(&self) -> Vec<Parameter<T>> {
        self.module.parameters()
    }

    pub fn named_parameters(&self) -> Vec<(String, Parameter<T>)> {
        self.module.named_parameters()
    }
}
