//! Sharded training must match unsharded training.

mod common;

use common::*;
use fsdp_rs::autograd::Variable;
use fsdp_rs::distributed::{
    CollectiveBackend, CpuBackend, Ddp, Fsdp, FsdpDebugConfig, broadcast_parameters,
};
use fsdp_rs::nn::{Linear, Mlp, Module, Parameter};
use fsdp_rs::Result;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::rc::Rc;

const TOL: f64 = 1e-5;

fn mlp(seed: u64) -> Mlp<f32> {
    Mlp::init(IN_FEATURES, HIDDEN, OUT_FEATURES, &mut StdRng::seed_from_u64(seed)).unwrap()
}

/// FSDP against a single-process model that sees every rank's batch at once.
fn check_against_reference(backend: CpuBackend) {
    init_tracing();
    let rank = backend.rank();
    let world_size = backend.world_size();
    let backend = Rc::new(backend);

    // Ranks start from different weights until rank 0's are broadcast.
    let reference = mlp(100 + rank as u64);
    broadcast_parameters(&reference, &backend, 0).unwrap();
    let model = mlp(0);
    model.load_state_dict(&reference.state_dict().unwrap()).unwrap();
    let fsdp = Fsdp::new(model, backend.clone(), FsdpDebugConfig::default()).unwrap();

    // Same input, same loss.
    let x = Variable::new(local_batch(rank));
    let loss = fsdp.forward(&x).unwrap().sum();
    let ref_loss = reference.forward(&x).unwrap().sum();
    let (a, b) = (loss.data.data()[0], ref_loss.data.data()[0]);
    assert!((a - b).abs() < 1e-5, "rank {rank}: loss {a} vs {b}");

    loss.backward().unwrap();
    // The sum of every rank's loss is the loss of the stacked batch.
    reference
        .forward(&Variable::new(global_batch(world_size)))
        .unwrap()
        .sum()
        .backward()
        .unwrap();

    for ((name, p), (_, q)) in fsdp.named_parameters().into_iter().zip(reference.named_parameters()) {
        assert!(p.is_sharded(), "{name} not sharded after backward");
        let expected = p.sharded_chunk(&q.grad().unwrap()).unwrap();
        assert_close(&p.grad().unwrap(), &expected, TOL, &format!("rank {rank} grad {name}"));
    }
}

#[test]
fn test_fsdp_matches_reference_even_world_size() {
    run_workers(2, check_against_reference);
}

#[test]
fn test_fsdp_matches_reference_uneven_world_size() {
    // 3 ranks: none of the parameter sizes (15, 5, 10, 2) divides evenly.
    run_workers(3, check_against_reference);
}

/// FSDP sums gradients where DDP averages them.
fn check_against_ddp(backend: CpuBackend) {
    init_tracing();
    let rank = backend.rank();
    let world_size = backend.world_size();
    let backend = Rc::new(backend);

    let ddp = Ddp::new(mlp(200 + rank as u64), backend.clone()).unwrap();
    let model = mlp(0);
    model.load_state_dict(&ddp.module().state_dict().unwrap()).unwrap();
    let fsdp = Fsdp::new(model, backend.clone(), FsdpDebugConfig::default()).unwrap();

    let x = Variable::new(local_batch(rank));
    ddp.forward(&x).unwrap().sum().backward().unwrap();
    ddp.sync_gradients().unwrap();
    fsdp.forward(&x).unwrap().sum().backward().unwrap();

    for ((name, p), (_, q)) in fsdp.named_parameters().into_iter().zip(ddp.named_parameters()) {
        let summed = q.grad().unwrap().scale(world_size as f32);
        let expected = p.sharded_chunk(&summed).unwrap();
        assert_close(&p.grad().unwrap(), &expected, TOL, &format!("rank {rank} grad {name}"));
    }
}

#[test]
fn test_fsdp_matches_ddp_times_world_size() {
    run_workers(2, check_against_ddp);
    run_workers(4, check_against_ddp);
}

#[test]
fn test_parameters_sharded_around_every_call() {
    let logs = run_workers(2, |backend| {
        let rank = backend.rank();
        let (backend, log) = RecordingBackend::new(backend);
        let fsdp = Fsdp::new(mlp(1), backend, FsdpDebugConfig::default()).unwrap();

        for _ in 0..2 {
            fsdp.zero_grad();
            assert!(fsdp.parameters().iter().all(|p| p.is_sharded()));

            let out = fsdp.forward(&Variable::new(local_batch(rank))).unwrap();
            for p in fsdp.parameters() {
                assert!(p.is_sharded());
                assert!(p.grad().is_none());
            }

            out.sum().backward().unwrap();
            for p in fsdp.parameters() {
                assert!(p.is_sharded());
                let chunk = p.numel().div_ceil(2);
                assert_eq!(p.data().size(), chunk);
                assert_eq!(p.grad().unwrap().size(), chunk);
            }
        }
        log.borrow().clone()
    });

    for log in logs {
        assert_eq!(
            log,
            vec![
                "all_gather",
                "all_gather",
                "all_reduce_sum",
                "all_gather",
                "all_gather",
                "all_reduce_sum"
            ]
        );
    }
}

/// Layers applied in order with a ReLU in between.
#[derive(Debug)]
struct Stack {
    layers: Vec<Box<dyn Module<f32>>>,
}

impl Module<f32> for Stack {
    fn forward(&self, input: &Variable<f32, 2>) -> Result<Variable<f32, 2>> {
        let mut x = input.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            if i > 0 {
                x = x.relu();
            }
            x = layer.forward(&x)?;
        }
        Ok(x)
    }

    fn named_parameters(&self) -> Vec<(String, Parameter<f32>)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(i, layer)| {
                let prefix = format!("fc{}", i + 1);
                layer
                    .named_parameters()
                    .into_iter()
                    .map(move |(name, p)| (format!("{prefix}.{name}"), p))
            })
            .collect()
    }
}

/// A sharded copy of `layer`.
fn wrapped_copy<B: CollectiveBackend + 'static>(layer: &Linear<f32>, backend: B) -> Box<dyn Module<f32>> {
    let mut rng = StdRng::seed_from_u64(0);
    let copy = Linear::init(layer.in_features(), layer.out_features(), true, &mut rng).unwrap();
    copy.load_state_dict(&layer.state_dict().unwrap()).unwrap();
    Box::new(Fsdp::new(copy, backend, FsdpDebugConfig::default()).unwrap())
}

#[test]
fn test_wrapped_siblings_match_reference() {
    for world_size in [2, 3] {
        let logs = run_workers(world_size, |backend| {
            init_tracing();
            let rank = backend.rank();
            let world_size = backend.world_size();
            let (backend, log) = RecordingBackend::new(backend);
            let backend = Rc::new(backend);

            let reference = mlp(300 + rank as u64);
            broadcast_parameters(&reference, &backend, 0).unwrap();
            let model = Stack {
                layers: vec![
                    wrapped_copy(&reference.fc1, backend.clone()),
                    wrapped_copy(&reference.fc2, backend.clone()),
                ],
            };
            log.borrow_mut().clear();

            let x = Variable::new(local_batch(rank));
            let out = model.forward(&x).unwrap();
            let expected = reference.forward(&x).unwrap();
            assert_close(&out.data.flatten(), &expected.data.flatten(), TOL, "output");

            out.sum().backward().unwrap();
            reference
                .forward(&Variable::new(global_batch(world_size)))
                .unwrap()
                .sum()
                .backward()
                .unwrap();

            let params = model.named_parameters();
            assert_eq!(params.len(), 4);
            for ((name, p), (ref_name, q)) in params.into_iter().zip(reference.named_parameters()) {
                assert_eq!(name, ref_name);
                assert!(p.is_sharded(), "{name} not sharded after backward");
                let expected = p.sharded_chunk(&q.grad().unwrap()).unwrap();
                assert_close(&p.grad().unwrap(), &expected, TOL, &format!("rank {rank} grad {name}"));
            }
            log.borrow().clone()
        });

        // Each sibling gathers for forward and backward and reduces once.
        for log in logs {
            let count = |op: &str| log.iter().filter(|c| **c == op).count();
            assert_eq!(count("all_gather"), 4);
            assert_eq!(count("all_reduce_sum"), 2);
            assert_eq!(log[..2], ["all_gather", "all_gather"]);
        }
    }
}
