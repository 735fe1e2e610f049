use super::{Linear, Module, Parameter};
use crate::autograd::Variable;
use crate::error::Result;
use crate::tensor::TensorElem;
use rand::Rng;

/// Two-layer perceptron: `Linear -> ReLU -> Linear`.
#[derive(Debug)]
pub struct Mlp<T: TensorElem> {
    pub fc1: Linear<T>,
    pub fc2: Linear<T>,
}

impl<T: TensorElem> Mlp<T> {
    pub fn new(fc1: Linear<T>, fc2: Linear<T>) -> Self {
        Self { fc1, fc2 }
    }

    pub fn init<R: Rng + ?Sized>(
        in_features: usize,
        hidden: usize,
        out_features: usize,
        rng: &mut R,
    ) -> Result<Self> {
        Ok(Self {
            fc1: Linear::init(in_features, hidden, true, rng)?,
            fc2: Linear::init(hidden, out_features, true, rng)?,
        })
    }
}

impl<T: TensorElem> Module<T> for Mlp<T> {
    fn forward(&self, input: &Variable<T, 2>) -> Result<Variable<T, 2>> {
        let hidden = self.fc1.forward(input)?.relu();
        self.fc2.forward(&hidden)
    }

    fn named_parameters(&self) -> Vec<(String, Parameter<T>)> {
        let prefixed = |prefix: &str, layer: &Linear<T>| {
            layer
                .named_parameters()
                .into_iter()
                .map(move |(name, p)| (format!("{prefix}.{name}"), p))
                .collect::<Vec<_>>()
        };
        let mut params = prefixed("fc1", &self.fc1);
        params.extend(prefixed("fc2", &self.fc2));
        params
    }
}
