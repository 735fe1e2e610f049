use super::backend::CollectiveBackend;
use super::sharding::shard_bounds;
use crate::error::{Error, Result};
use crate::tensor::{Tensor, TensorElem};
use crossbeam::channel::{Receiver, Sender, unbounded};
use std::any::Any;
use tracing::trace;

/// A message on the ring. Carries a `Vec<T>`; the receiver downcasts it back, so two workers
/// disagreeing on the element type get an error rather than garbage.
type Packet = Box<dyn Any + Send>;

/// A CPU collective backend for worker threads.
///
/// Workers form a ring: each one receives from `rank - 1` and sends to `rank + 1`. All-reduce
/// uses the bandwidth-optimal **Ring All-Reduce** (scatter-reduce followed by all-gather);
/// chunk boundaries come from [`shard_bounds`], so buffers that do not divide evenly by the
/// world size are fine.
pub struct CpuBackend {
    rank: usize,
    world_size: usize,
    left_rx: Receiver<Packet>,
    right_tx: Sender<Packet>,
}

impl CpuBackend {
    pub fn new(
        rank: usize,
        world_size: usize,
        left_rx: Receiver<Packet>,
        right_tx: Sender<Packet>,
    ) -> Self {
        Self {
            rank,
            world_size,
            left_rx,
            right_tx,
        }
    }

    /// Builds the endpoints of a `world_size`-worker ring, indexed by rank.
    ///
    /// Channel `i` connects rank `i` (sender) to rank `i + 1` (receiver).
    pub fn ring(world_size: usize) -> Vec<CpuBackend> {
        let (txs, rxs): (Vec<_>, Vec<_>) = (0..world_size).map(|_| unbounded()).unzip();
        (0..world_size)
            .map(|rank| {
                let left = (rank + world_size - 1) % world_size;
                CpuBackend::new(rank, world_size, rxs[left].clone(), txs[rank].clone())
            })
            .collect()
    }

    fn send<T: TensorElem>(&self, data: Vec<T>) -> Result<()> {
        self.right_tx
            .send(Box::new(data))
            .map_err(|_| Error::Collective(format!("rank {}: right neighbour hung up", self.rank)))
    }

    fn recv<T: TensorElem>(&self, expected_len: usize) -> Result<Vec<T>> {
        let packet = self
            .left_rx
            .recv()
            .map_err(|_| Error::Collective(format!("rank {}: left neighbour hung up", self.rank)))?;
        let data = packet.downcast::<Vec<T>>().map_err(|_| {
            Error::Collective(format!("rank {}: received a chunk of another element type", self.rank))
        })?;
        if data.len() != expected_len {
            return Err(Error::Collective(format!(
                "rank {}: expected a chunk of {} elements, received {}",
                self.rank,
                expected_len,
                data.len()
            )));
        }
        Ok(*data)
    }

    /// Index of the chunk handled at `step`, offset from this rank.
    fn ring_index(&self, step: usize, offset: isize) -> usize {
        (self.rank as isize - step as isize + offset).rem_euclid(self.world_size as isize) as usize
    }
}

impl CollectiveBackend for CpuBackend {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn broadcast<T: TensorElem, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK>,
        src: usize,
    ) -> Result<Tensor<T, RANK>> {
        if src >= self.world_size {
            return Err(Error::Config(format!(
                "broadcast source {src} out of range for world size {}",
                self.world_size
            )));
        }
        if self.world_size == 1 {
            return Ok(tensor.clone());
        }

        let right = (self.rank + 1) % self.world_size;
        if self.rank == src {
            self.send(tensor.data().to_vec())?;
            return Ok(tensor.clone());
        }

        let data: Vec<T> = self.recv(tensor.size())?;
        // The message travels once around the ring and stops before returning to `src`.
        if right != src {
            self.send(data.clone())?;
        }
        trace!(rank = self.rank, src, "broadcast received");
        Tensor::new(data, *tensor.shape())
    }

    fn all_gather<T: TensorElem>(&self, chunk: &Tensor<T, 1>) -> Result<Tensor<T, 1>> {
        if self.world_size == 1 {
            return Ok(chunk.clone());
        }

        let c = chunk.size();
        let mut out = vec![T::zero(); c * self.world_size];
        out[self.rank * c..(self.rank + 1) * c].copy_from_slice(chunk.data());

        // At step `s` we forward the block that originated at `rank - s` and receive the one
        // that originated at `rank - s - 1`.
        for step in 0..self.world_size - 1 {
            let send_idx = self.ring_index(step, 0);
            let recv_idx = self.ring_index(step, -1);

            self.send(out[send_idx * c..(send_idx + 1) * c].to_vec())?;
            let block: Vec<T> = self.recv(c)?;
            out[recv_idx * c..(recv_idx + 1) * c].copy_from_slice(&block);
            trace!(rank = self.rank, step, recv_idx, "all_gather step");
        }

        Ok(Tensor::from_vec(out))
    }

    fn all_reduce_sum<T: TensorElem, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK>,
    ) -> Result<Tensor<T, RANK>> {
        if self.world_size == 1 {
            return Ok(tensor.clone());
        }

        let mut data = tensor.data().to_vec();
        let total = data.len();
        let bounds = |idx: usize| {
            let b = shard_bounds(total, self.world_size, idx);
            (b.start, b.start + b.len)
        };

        // --- Phase 1: Scatter-Reduce ---
        // After `world_size - 1` steps rank r holds the complete sum of chunk r + 1.
        for step in 0..self.world_size - 1 {
            let (s0, s1) = bounds(self.ring_index(step, 0));
            let (r0, r1) = bounds(self.ring_index(step, -1));

            self.send(data[s0..s1].to_vec())?;
            let recv: Vec<T> = self.recv(r1 - r0)?;
            for (d, v) in data[r0..r1].iter_mut().zip(recv) {
                *d += v;
            }
            trace!(rank = self.rank, step, "scatter-reduce step");
        }

        // --- Phase 2: All-Gather ---
        // Circulate the reduced chunks so every rank ends with the full sum.
        for step in 0..self.world_size - 1 {
            let (s0, s1) = bounds(self.ring_index(step, 1));
            let (r0, r1) = bounds(self.ring_index(step, 0));

            self.send(data[s0..s1].to_vec())?;
            let recv: Vec<T> = self.recv(r1 - r0)?;
            data[r0..r1].copy_from_slice(&recv);
            trace!(rank = self.rank, step, "all-gather step");
        }

        Tensor::new(data, *tensor.shape())
    }
}
