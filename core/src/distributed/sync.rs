//! Helpers that make workers agree on parameter values.

use super::backend::CollectiveBackend;
use crate::error::{Error, Result};
use crate::nn::{Module, ParamState};
use crate::tensor::TensorElem;
use tracing::debug;

/// Overwrites every parameter of `module` with `src`'s values.
///
/// Parameters are broadcast one by one in [`Module::named_parameters`] order, which every
/// rank must agree on. They must be local or full: a sharded parameter fails with
/// [`Error::InvalidState`] before anything is sent.
pub fn broadcast_parameters<T, M, B>(module: &M, backend: &B, src: usize) -> Result<()>
where
    T: TensorElem,
    M: Module<T> + ?Sized,
    B: CollectiveBackend,
{
    let params = module.named_parameters();
    if let Some((name, _)) = params.iter().find(|(_, p)| p.state() == ParamState::Sharded) {
        debug!(rank = backend.rank(), %name, "refusing to broadcast a sharded parameter");
        return Err(Error::InvalidState {
            expected: "full",
            found: "sharded",
        });
    }
    for (name, param) in &params {
        let values = backend.broadcast(&param.data(), src)?;
        param.copy_from(&values)?;
        debug!(rank = backend.rank(), src, %name, "broadcast parameter");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::cpu_backend::CpuBackend;
    use crate::nn::Mlp;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::thread;

    #[test]
    fn test_broadcast_parameters_from_rank_zero() {
        let handles: Vec<_> = CpuBackend::ring(3)
            .into_iter()
            .map(|backend| {
                thread::spawn(move || {
                    // Every rank starts from a different seed.
                    let mut rng = StdRng::seed_from_u64(backend.rank() as u64);
                    let mlp = Mlp::<f32>::init(3, 4, 2, &mut rng).unwrap();
                    broadcast_parameters(&mlp, &backend, 0).unwrap();
                    mlp.state_dict().unwrap()
                })
            })
            .collect();
        let states: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let expected = Mlp::<f32>::init(3, 4, 2, &mut StdRng::seed_from_u64(0))
            .unwrap()
            .state_dict()
            .unwrap();
        for state in states {
            assert_eq!(state, expected);
        }
    }
}
