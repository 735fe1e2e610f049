mod common;

use common::*;
use fsdp_rs::autograd::Variable;
use fsdp_rs::distributed::{
    CollectiveBackend, CpuBackend, Fsdp, FsdpDebugConfig, broadcast_parameters,
};
use fsdp_rs::nn::{Mlp, Module, StateDict};
use fsdp_rs::{Error, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

type ShardedMlp<B> = Fsdp<f32, Mlp<f32>, B>;

fn mlp(seed: u64) -> Mlp<f32> {
    Mlp::init(IN_FEATURES, HIDDEN, OUT_FEATURES, &mut StdRng::seed_from_u64(seed)).unwrap()
}

#[test]
fn test_round_trip_is_exact() {
    for world_size in [1, 2, 3, 4] {
        run_workers(world_size, |backend| {
            let world_size = backend.world_size();
            let model = mlp(3);
            let original = model.state_dict().unwrap();
            let shapes: Vec<_> = model.parameters().iter().map(|p| p.shape()).collect();

            let mut fsdp = Fsdp::new(model, backend, FsdpDebugConfig::default()).unwrap();
            for p in fsdp.parameters() {
                assert!(p.is_sharded());
                assert_eq!(p.data().size(), p.numel().div_ceil(world_size));
            }

            for _ in 0..2 {
                let guard = fsdp.summon_full_params().unwrap();
                let params = guard.module().parameters();
                assert!(params.iter().all(|p| !p.is_sharded()));
                let full_shapes: Vec<_> = params.iter().map(|p| p.shape()).collect();
                assert_eq!(full_shapes, shapes);
                // Bit-identical, not just close.
                assert_eq!(guard.module().state_dict().unwrap(), original);
                drop(guard);
                assert!(fsdp.is_sharded());
            }
        });
    }
}

fn load_inside_scope<B: CollectiveBackend + 'static>(
    fsdp: &mut ShardedMlp<B>,
    state: &StateDict<f32>,
) -> Result<()> {
    let guard = fsdp.summon_full_params()?;
    assert!(guard.module().parameters().iter().all(|p| !p.is_sharded()));
    guard.module().load_state_dict(state)?;
    guard.release()
}

#[test]
fn test_error_inside_scope_still_reshards() {
    run_workers(2, |backend| {
        let mut fsdp = Fsdp::new(mlp(4), backend, FsdpDebugConfig::default()).unwrap();
        let err = load_inside_scope(&mut fsdp, &StateDict::new()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(fsdp.is_sharded());

        // The group is still usable afterwards.
        let out = fsdp.forward(&Variable::new(local_batch(0))).unwrap();
        out.sum().backward().unwrap();
        assert!(fsdp.is_sharded());
    });
}

#[test]
fn test_panic_inside_scope_still_reshards() {
    let backend = CpuBackend::ring(1).pop().unwrap();
    let mut fsdp = Fsdp::new(mlp(4), backend, FsdpDebugConfig::default()).unwrap();

    // A failing assertion inside the scope unwinds through the guard.
    let result = catch_unwind(AssertUnwindSafe(|| {
        let guard = fsdp.summon_full_params().unwrap();
        assert!(guard.module().parameters().iter().all(|p| p.is_sharded()));
    }));
    assert!(result.is_err());
    assert!(fsdp.is_sharded());
}

#[test]
fn test_state_dict_loaded_inside_scope_is_kept() {
    run_workers(2, |backend| {
        let rank = backend.rank();
        let mut fsdp = Fsdp::new(mlp(5), backend, FsdpDebugConfig::default()).unwrap();
        let target = mlp(6);
        load_inside_scope(&mut fsdp, &target.state_dict().unwrap()).unwrap();
        assert!(fsdp.is_sharded());

        let x = Variable::new(local_batch(rank));
        let out = fsdp.forward(&x).unwrap();
        let expected = target.forward(&x).unwrap();
        assert_close(&out.data.flatten(), &expected.data.flatten(), 1e-6, "output");
    });
}

#[test]
fn test_no_reduce_grads_keeps_local_gradients() {
    let logs = run_workers(2, |backend| {
        let rank = backend.rank();
        let (backend, log) = RecordingBackend::new(backend);
        let config = FsdpDebugConfig {
            no_reduce_grads: true,
        };
        let fsdp = Fsdp::new(mlp(9), backend, config).unwrap();
        let reference = mlp(9);

        let x = Variable::new(local_batch(rank));
        fsdp.forward(&x).unwrap().sum().backward().unwrap();
        reference.forward(&x).unwrap().sum().backward().unwrap();

        for ((name, p), (_, q)) in fsdp.named_parameters().into_iter().zip(reference.named_parameters()) {
            let expected = p.sharded_chunk(&q.grad().unwrap()).unwrap();
            assert_close(&p.grad().unwrap(), &expected, 1e-6, &format!("rank {rank} grad {name}"));
        }
        log.borrow().clone()
    });

    for log in logs {
        assert!(!log.contains(&"all_reduce_sum"));
        assert_eq!(log, vec!["all_gather", "all_gather"]);
    }
}

#[test]
fn test_world_size_one_issues_no_collectives() {
    let (backend, log) = RecordingBackend::new(CpuBackend::ring(1).pop().unwrap());
    let mut fsdp = Fsdp::new(mlp(11), backend, FsdpDebugConfig::default()).unwrap();
    let reference = mlp(11);

    let x = Variable::new(local_batch(0));
    fsdp.forward(&x).unwrap().sum().backward().unwrap();
    reference.forward(&x).unwrap().sum().backward().unwrap();
    fsdp.summon_full_params().unwrap().release().unwrap();

    assert!(log.borrow().is_empty());
    for (p, q) in fsdp.parameters().iter().zip(reference.parameters()) {
        // Sharded and full coincide.
        assert!(p.is_sharded());
        assert_eq!(p.data().size(), p.numel());
        assert_close(&p.grad().unwrap(), &q.grad().unwrap(), 1e-6, "grad");
    }
}

#[test]
fn test_gradients_accumulate_across_steps() {
    run_workers(3, |backend| {
        let rank = backend.rank();
        let fsdp = Fsdp::new(mlp(12), backend, FsdpDebugConfig::default()).unwrap();
        let x = Variable::new(local_batch(rank));

        fsdp.forward(&x).unwrap().sum().backward().unwrap();
        let first: Vec<_> = fsdp.parameters().iter().map(|p| p.grad().unwrap()).collect();
        fsdp.forward(&x).unwrap().sum().backward().unwrap();

        for (p, g) in fsdp.parameters().iter().zip(first) {
            assert_close(&p.grad().unwrap(), &g.scale(2.0), 1e-5, "accumulated grad");
        }
    });
}

#[test]
fn test_broadcast_of_sharded_parameters_fails_before_sending() {
    let (backend, log) = RecordingBackend::new(CpuBackend::ring(1).pop().unwrap());
    let backend = Rc::new(backend);
    let mut fsdp = Fsdp::new(mlp(13), backend.clone(), FsdpDebugConfig::default()).unwrap();
    let before = fsdp.module().parameters().iter().map(|p| p.data()).collect::<Vec<_>>();

    let err = broadcast_parameters(fsdp.module(), &backend, 0).unwrap_err();
    assert_eq!(
        err,
        Error::InvalidState {
            expected: "full",
            found: "sharded"
        }
    );
    assert!(log.borrow().is_empty());
    let after = fsdp.module().parameters().iter().map(|p| p.data()).collect::<Vec<_>>();
    assert_eq!(after, before);

    // Full parameters inside the scope can be broadcast.
    let guard = fsdp.summon_full_params().unwrap();
    broadcast_parameters(guard.module(), &backend, 0).unwrap();
    guard.release().unwrap();
    assert_eq!(*log.borrow(), vec!["broadcast"; 4]);
    assert!(fsdp.is_sharded());
}
