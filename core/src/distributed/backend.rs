use crate::error::Result;
use crate::tensor::{Tensor, TensorElem};
use std::rc::Rc;

/// A process group: the set of workers taking part in collective communication.
///
/// Every collective is a synchronization barrier. All ranks must issue the same collectives in
/// the same order with the same sizes, otherwise the group deadlocks. Implementations never
/// retry; a failed collective is reported as [`Error::Collective`](crate::Error::Collective).
///
/// - **CPU/Ring**: [`CpuBackend`](super::cpu_backend::CpuBackend), worker threads connected by
///   channels.
pub trait CollectiveBackend {
    /// Returns the rank of the current worker.
    fn rank(&self) -> usize;

    /// Returns the number of workers in the group.
    fn world_size(&self) -> usize;

    /// Returns `src`'s tensor on every rank.
    ///
    /// The tensor passed on non-source ranks only provides the expected shape.
    fn broadcast<T: TensorElem, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK>,
        src: usize,
    ) -> Result<Tensor<T, RANK>>;

    /// Concatenates every rank's chunk in rank order.
    ///
    /// All chunks must have the same length; the result has `world_size * chunk.size()`
    /// elements and is identical on every rank.
    fn all_gather<T: TensorElem>(&self, chunk: &Tensor<T, 1>) -> Result<Tensor<T, 1>>;

    /// Element-wise sum of every rank's tensor, returned on every rank.
    fn all_reduce_sum<T: TensorElem, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK>,
    ) -> Result<Tensor<T, RANK>>;
}

/// Lets several coordinators on one worker share a single process group.
impl<B: CollectiveBackend> CollectiveBackend for Rc<B> {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn world_size(&self) -> usize {
        (**self).world_size()
    }

    fn broadcast<T: TensorElem, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK>,
        src: usize,
    ) -> Result<Tensor<T, RANK>> {
        (**self).broadcast(tensor, src)
    }

    fn all_gather<T: TensorElem>(&self, chunk: &Tensor<T, 1>) -> Result<Tensor<T, 1>> {
        (**self).all_gather(chunk)
    }

    fn all_reduce_sum<T: TensorElem, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK>,
    ) -> Result<Tensor<T, RANK>> {
        (**self).all_reduce_sum(tensor)
    }
}
