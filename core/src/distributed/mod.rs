//! # Distributed Training
//!
//! When a model does not fit on one worker, its parameters have to be split across workers.
//!
//! ## Parallelism Strategies
//!
//! ### 1. Data Parallelism (DP)
//! *   **Concept**: Replicate the *entire model* on every worker. Split the *dataset*.
//! *   **Communication**: Gradients are averaged across workers using **All-Reduce**.
//! *   [`Ddp`](ddp::Ddp) implements it, mostly as a reference to check sharded training
//!     against.
//!
//! ### 2. Fully Sharded Data Parallelism (FSDP)
//! *   **Concept**: Every worker still sees its own data, but only stores a `1 / world_size`
//!     chunk of every parameter. Full parameters are rebuilt with **All-Gather** right before
//!     they are used and dropped right after.
//! *   **Communication**: All-Gather before forward and before backward, **All-Reduce** (SUM)
//!     of the gradients after backward.
//! *   [`Fsdp`](fsdp::Fsdp) implements it on top of
//!     [`FlatParamGroup`](param_group::FlatParamGroup) and
//!     [`ShardedFlatParameter`](flat_param::ShardedFlatParameter).
//!
//! ## Module Contents
//!
//! *   [`CollectiveBackend`](backend::CollectiveBackend): the process group interface.
//! *   [`CpuBackend`](cpu_backend::CpuBackend): worker threads connected in a ring, with a
//!     from-scratch **Ring All-Reduce**.
//! *   [`sharding`]: the pure partition function every rank agrees on.

pub mod backend;
pub mod cpu_backend;
pub mod ddp;
pub mod flat_param;
pub mod fsdp;
pub mod param_group;
pub mod sharding;
pub mod sync;

pub use backend::CollectiveBackend;
pub use cpu_backend::CpuBackend;
pub use ddp::Ddp;
pub use fsdp::{Fsdp, FsdpDebugConfig, FullParamsGuard};
pub use sync::broadcast_parameters;
