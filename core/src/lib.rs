//! # fsdp-rs
//!
//! `fsdp-rs` is a pure Rust implementation of Fully Sharded Data Parallel training: model
//! parameters are split across workers, rebuilt on demand for computation, and split again
//! afterwards, while forward outputs and gradients stay numerically identical to an
//! unsharded model.
//!
//! It runs on **CPU only**; workers are threads connected by channels.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: Core N-dimensional tensor implementation.
//! - [`autograd`]: Define-by-run reverse-mode differentiation with fallible backward.
//! - [`nn`]: Parameters, the [`Module`](nn::Module) trait and a few layers.
//! - [`distributed`]: Collective backends, sharding and the [`Fsdp`](distributed::Fsdp)
//!   wrapper.
//!
//! ## Example
//!
//! ```rust
//! use fsdp_rs::autograd::Variable;
//! use fsdp_rs::distributed::{CpuBackend, Fsdp, FsdpDebugConfig};
//! use fsdp_rs::nn::Linear;
//! use fsdp_rs::tensor::Tensor;
//! use std::thread;
//!
//! let workers: Vec<_> = CpuBackend::ring(2)
//!     .into_iter()
//!     .map(|backend| {
//!         thread::spawn(move || {
//!             let layer = Linear::<f32>::new(Tensor::ones([4, 2]), None);
//!             let model = Fsdp::new(layer, backend, FsdpDebugConfig::default()).unwrap();
//!             let x = Variable::new(Tensor::ones([3, 4]));
//!             model.forward(&x).unwrap().sum().backward().unwrap();
//!             // Each rank holds half of the 8 weight gradients, summed over both ranks.
//!             model.module().weight.grad().unwrap().into_vec()
//!         })
//!     })
//!     .collect();
//!
//! for worker in workers {
//!     assert_eq!(worker.join().unwrap(), vec![6.0; 4]);
//! }
//! ```

pub mod autograd;
pub mod distributed;
pub mod error;
pub mod nn;
pub mod tensor;

pub use autograd::Variable;
pub use error::{Error, Result};
pub use tensor::{Tensor, TensorElem};
