#![allow(dead_code)]

use fsdp_rs::Result;
use fsdp_rs::distributed::{CollectiveBackend, CpuBackend};
use fsdp_rs::tensor::{Tensor, TensorElem};
use std::cell::RefCell;
use std::rc::Rc;
use std::thread;

pub const IN_FEATURES: usize = 3;
pub const HIDDEN: usize = 5;
pub const OUT_FEATURES: usize = 2;
pub const BATCH: usize = 2;

/// Logs to the test writer; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Runs `f` on `world_size` worker threads connected in a ring and returns the results
/// in rank order.
pub fn run_workers<F, R>(world_size: usize, f: F) -> Vec<R>
where
    F: Fn(CpuBackend) -> R + Send + Sync + Copy + 'static,
    R: Send + 'static,
{
    let handles: Vec<_> = CpuBackend::ring(world_size)
        .into_iter()
        .map(|backend| thread::spawn(move || f(backend)))
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().expect("worker panicked"))
        .collect()
}

/// This rank's input batch, different on every rank.
pub fn local_batch(rank: usize) -> Tensor<f32, 2> {
    Tensor::from_fn([BATCH, IN_FEATURES], |i| {
        ((i + rank * 7) as f32 * 0.37).sin()
    })
}

/// Every rank's batch stacked in rank order.
pub fn global_batch(world_size: usize) -> Tensor<f32, 2> {
    let data = (0..world_size)
        .flat_map(|rank| local_batch(rank).into_vec())
        .collect();
    Tensor::new(data, [BATCH * world_size, IN_FEATURES]).expect("batch shape")
}

pub fn assert_close(actual: &Tensor<f32, 1>, expected: &Tensor<f32, 1>, tol: f64, what: &str) {
    let diff = actual
        .max_abs_diff(expected)
        .unwrap_or_else(|| panic!("{what}: shape {:?} vs {:?}", actual.shape(), expected.shape()));
    assert!(
        diff <= tol,
        "{what}: max abs diff {diff} > {tol}\n actual: {actual:?}\n expected: {expected:?}"
    );
}

/// Collective backend that records the collectives it forwards.
pub struct RecordingBackend<B> {
    inner: B,
    log: Rc<RefCell<Vec<&'static str>>>,
}

impl<B: CollectiveBackend> RecordingBackend<B> {
    pub fn new(inner: B) -> (Self, Rc<RefCell<Vec<&'static str>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        (
            Self {
                inner,
                log: log.clone(),
            },
            log,
        )
    }
}

impl<B: CollectiveBackend> CollectiveBackend for RecordingBackend<B> {
    fn rank(&self) -> usize {
        self.inner.rank()
    }

    fn world_size(&self) -> usize {
        self.inner.world_size()
    }

    fn broadcast<T: TensorElem, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK>,
        src: usize,
    ) -> Result<Tensor<T, RANK>> {
        self.log.borrow_mut().push("broadcast");
        self.inner.broadcast(tensor, src)
    }

    fn all_gather<T: TensorElem>(&self, chunk: &Tensor<T, 1>) -> Result<Tensor<T, 1>> {
        self.log.borrow_mut().push("all_gather");
        self.inner.all_gather(chunk)
    }

    fn all_reduce_sum<T: TensorElem, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK>,
    ) -> Result<Tensor<T, RANK>> {
        self.log.borrow_mut().push("all_reduce_sum");
        self.inner.all_reduce_sum(tensor)
    }
}
