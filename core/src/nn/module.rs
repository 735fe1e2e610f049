use super::{ParamState, Parameter};
use crate::autograd::Variable;
use crate::error::{Error, Result};
use crate::tensor::{Tensor, TensorElem};
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Flattened parameter values keyed by parameter name.
pub type StateDict<T> = BTreeMap<String, Tensor<T, 1>>;

/// A Module trait for Neural Network layers.
///
/// A module exposes its learnable tensors as named [`Parameter`] handles. Because handles
/// share storage, the sharding coordinator can take them over without the module knowing:
/// the module keeps calling [`Parameter::variable`] in `forward`, and the coordinator makes
/// sure the parameters are full while it does.
///
/// Parameter names must be unique and stable: they key the state dict and the order of
/// [`Module::named_parameters`] is the order in which parameters are laid out for
/// communication, so every worker must report the same order.
pub trait Module<T: TensorElem>: Debug {
    /// Computes `[batch, in] -> [batch, out]`.
    fn forward(&self, input: &Variable<T, 2>) -> Result<Variable<T, 2>>;

    /// Every parameter with its dotted name, in a deterministic order.
    fn named_parameters(&self) -> Vec<(String, Parameter<T>)>;

    fn parameters(&self) -> Vec<Parameter<T>> {
        self.named_parameters().into_iter().map(|(_, p)| p).collect()
    }

    fn zero_grad(&self) {
        for p in self.parameters() {
            p.zero_grad();
        }
    }

    /// Full parameter values. Fails while any parameter is sharded.
    fn state_dict(&self) -> Result<StateDict<T>> {
        self.named_parameters()
            .into_iter()
            .map(|(name, p)| {
                if p.state() == ParamState::Sharded {
                    return Err(Error::InvalidState {
                        expected: "full",
                        found: "sharded",
                    });
                }
                Ok((name, p.data()))
            })
            .collect()
    }

    /// Overwrites every parameter from `state`. Fails while any parameter is sharded, or if
    /// a key is missing or has the wrong size; extra keys are ignored.
    fn load_state_dict(&self, state: &StateDict<T>) -> Result<()> {
        let params = self.named_parameters();
        // Validate everything first so a bad dict leaves the module untouched.
        for (name, p) in &params {
            let value = state
                .get(name)
                .ok_or_else(|| Error::Config(format!("missing key `{name}` in state dict")))?;
            if value.size() != p.numel() {
                return Err(Error::ShapeMismatch {
                    expected: p.shape(),
                    got: value.shape().to_vec(),
                });
            }
            if p.is_sharded() {
                return Err(Error::InvalidState {
                    expected: "full",
                    found: "sharded",
                });
            }
        }
        for (name, p) in &params {
            if let Some(value) = state.get(name) {
                p.copy_from(value)?;
            }
        }
        Ok(())
    }
}
