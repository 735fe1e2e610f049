use super::{Module, Parameter};
use crate::autograd::Variable;
use crate::error::{Error, Result};
use crate::tensor::{Tensor, TensorElem};
use rand::Rng;

/// Linear Layer: `y = xW + b`
///
/// - `weight`: `[in_features, out_features]`, so the forward pass is a plain matmul.
/// - `bias`: `[out_features]`, added to every row.
///
/// # Examples
/// ```rust
/// use fsdp_rs::nn::{Linear, Module};
/// use fsdp_rs::autograd::Variable;
/// use fsdp_rs::tensor::Tensor;
///
/// let layer = Linear::<f32>::new(Tensor::ones([3, 2]), Some(Tensor::zeros([2])));
/// let x = Variable::new(Tensor::ones([4, 3]));
/// let y = layer.forward(&x).unwrap();
/// assert_eq!(y.data.shape(), &[4, 2]);
/// ```
#[derive(Debug)]
pub struct Linear<T: TensorElem> {
    pub weight: Parameter<T>,
    pub bias: Option<Parameter<T>>,
}

impl<T: TensorElem> Linear<T> {
    pub fn new(weight: Tensor<T, 2>, bias: Option<Tensor<T, 1>>) -> Self {
        Self {
            weight: Parameter::new(weight),
            bias: bias.map(Parameter::new),
        }
    }

    /// Xavier-uniform weights, zero bias.
    ///
    /// Weights are drawn from `U(-a, a)` with `a = sqrt(6 / (in + out))`.
    pub fn init<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        bias: bool,
        rng: &mut R,
    ) -> Result<Self> {
        let limit = (6.0 / (in_features + out_features) as f64).sqrt();
        let data = (0..in_features * out_features)
            .map(|_| {
                T::from_f64(rng.random_range(-limit..limit)).ok_or_else(|| {
                    Error::Unsupported("element type cannot represent the initial weights".into())
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let weight = Tensor::new(data, [in_features, out_features])?;
        let bias = bias.then(|| Tensor::zeros([out_features]));
        Ok(Self::new(weight, bias))
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[1]
    }
}

impl<T: TensorElem> Module<T> for Linear<T> {
    fn forward(&self, input: &Variable<T, 2>) -> Result<Variable<T, 2>> {
        let out = input.matmul(&self.weight.variable()?)?;
        match &self.bias {
            Some(bias) => out.add_bias(&bias.variable()?),
            None => Ok(out),
        }
    }

    fn named_parameters(&self) -> Vec<(String, Parameter<T>)> {
        let mut params = vec![("weight".to_string(), self.weight.clone())];
        if let Some(bias) = &self.bias {
            params.push(("bias".to_string(), bias.clone()));
        }
        params
    }
}
