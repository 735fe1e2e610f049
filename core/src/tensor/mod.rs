//! Core Tensor implementation.
//!
//! A [`Tensor`] is a dense, row-major, N-dimensional array backed by a `Vec<T>`. Its rank is a
//! const generic, so a bias vector is a `Tensor<T, 1>` and a weight matrix a `Tensor<T, 2>`,
//! while the extent of every dimension stays a runtime value (batch sizes vary between calls).
//!
//! The sharding layer mostly works on *flat* rank-1 tensors: every parameter is flattened,
//! padded and cut into equal chunks, and the collectives move those chunks around. The
//! [`Tensor::flatten`], [`Tensor::narrow`], [`Tensor::cat`] and [`Tensor::padded`] helpers exist
//! for that purpose.
//!
//! ```rust
//! use fsdp_rs::tensor::Tensor;
//!
//! let t = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]).unwrap();
//! assert_eq!(t.shape(), &[2, 3]);
//!
//! let flat = t.flatten();
//! assert_eq!(flat.narrow(4, 2).unwrap().data(), &[5.0, 6.0]);
//! ```

use crate::error::{Error, Result};
use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;

pub mod ops;

/// Trait bound for elements that can be stored in a Tensor.
///
/// `Send + Sync + 'static` lets chunks travel between worker threads through the collective
/// backend; the numeric traits cover the arithmetic used by the ops and the initializers.
pub trait TensorElem:
    Num
    + NumAssign
    + Copy
    + Clone
    + Debug
    + Send
    + Sync
    + FromPrimitive
    + ToPrimitive
    + PartialOrd
    + 'static
{
}

impl<T> TensorElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
        + 'static
{
}

/// A dense N-dimensional array.
///
/// - `T`: the element type.
/// - `RANK`: the number of dimensions. Shapes are checked at runtime.
#[derive(Clone, PartialEq)]
pub struct Tensor<T, const RANK: usize>
where
    T: TensorElem,
{
    shape: [usize; RANK],
    data: Vec<T>,
}

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Creates a new Tensor from a vector of data and a shape.
    ///
    /// # Errors
    ///
    /// Returns `Error::ShapeMismatch` if the length of `data` does not match the product of `shape`.
    pub fn new(data: Vec<T>, shape: [usize; RANK]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(Error::ShapeMismatch {
                expected: vec![size],
                got: vec![data.len()],
            });
        }
        Ok(Self { shape, data })
    }

    /// Creates a new Tensor filled with zeros.
    pub fn zeros(shape: [usize; RANK]) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape,
            data: vec![T::zero(); size],
        }
    }

    /// Creates a new Tensor filled with ones.
    pub fn ones(shape: [usize; RANK]) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape,
            data: vec![T::one(); size],
        }
    }

    /// Creates a tensor whose `i`-th element (in row-major order) is `f(i)`.
    pub fn from_fn<F>(shape: [usize; RANK], f: F) -> Self
    where
        F: FnMut(usize) -> T,
    {
        let size: usize = shape.iter().product();
        Self {
            shape,
            data: (0..size).map(f).collect(),
        }
    }

    /// Reshapes the tensor. The number of elements must remain the same.
    pub fn reshape<const NEW_RANK: usize>(
        self,
        new_shape: [usize; NEW_RANK],
    ) -> Result<Tensor<T, NEW_RANK>> {
        let new_size: usize = new_shape.iter().product();
        if self.data.len() != new_size {
            return Err(Error::ShapeMismatch {
                expected: vec![self.data.len()],
                got: vec![new_size],
            });
        }
        Ok(Tensor {
            shape: new_shape,
            data: self.data,
        })
    }

    /// Reshapes into a rank known only at runtime (a `Vec<usize>` of dims).
    ///
    /// Used when a flat parameter is viewed with the logical shape recorded at wrap time.
    pub fn reshape_dyn<const NEW_RANK: usize>(self, dims: &[usize]) -> Result<Tensor<T, NEW_RANK>> {
        let new_shape: [usize; NEW_RANK] = dims.try_into().map_err(|_| Error::ShapeMismatch {
            expected: dims.to_vec(),
            got: vec![NEW_RANK],
        })?;
        self.reshape(new_shape)
    }

    /// Returns a rank-1 tensor holding the same elements.
    pub fn flatten(&self) -> Tensor<T, 1> {
        Tensor {
            shape: [self.data.len()],
            data: self.data.clone(),
        }
    }

    /// Consumes the tensor, returning a rank-1 tensor without copying.
    pub fn into_flat(self) -> Tensor<T, 1> {
        Tensor {
            shape: [self.data.len()],
            data: self.data,
        }
    }

    /// Returns the shape of the tensor.
    pub const fn shape(&self) -> &[usize; RANK] {
        &self.shape
    }

    /// Returns the underlying data as a flat slice.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Returns the underlying data as a mutable flat slice.
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Consumes the tensor and returns its storage.
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Returns the total number of elements.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Largest absolute element-wise difference, or `None` when the shapes differ.
    pub fn max_abs_diff(&self, other: &Self) -> Option<f64> {
        if self.shape != other.shape {
            return None;
        }
        self.data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| {
                let a = a.to_f64().unwrap_or(f64::NAN);
                let b = b.to_f64().unwrap_or(f64::NAN);
                (a - b).abs()
            })
            .try_fold(0.0f64, |acc, d| if d.is_nan() { None } else { Some(acc.max(d)) })
    }
}

impl<T> Tensor<T, 1>
where
    T: TensorElem,
{
    /// Creates a rank-1 tensor from a vector.
    pub fn from_vec(data: Vec<T>) -> Self {
        Self {
            shape: [data.len()],
            data,
        }
    }

    /// Returns `len` elements starting at `start` as a new tensor.
    pub fn narrow(&self, start: usize, len: usize) -> Result<Self> {
        let end = start.checked_add(len).filter(|&end| end <= self.data.len());
        match end {
            Some(end) => Ok(Self::from_vec(self.data[start..end].to_vec())),
            None => Err(Error::IndexOutOfBounds {
                index: vec![start, len],
                shape: self.shape.to_vec(),
            }),
        }
    }

    /// Concatenates rank-1 tensors end to end.
    pub fn cat(parts: &[Self]) -> Self {
        let total = parts.iter().map(|p| p.data.len()).sum();
        let mut data = Vec::with_capacity(total);
        for part in parts {
            data.extend_from_slice(&part.data);
        }
        Self::from_vec(data)
    }

    /// Returns a copy extended with zeros up to `len` elements.
    pub fn padded(&self, len: usize) -> Result<Self> {
        if len < self.data.len() {
            return Err(Error::ShapeMismatch {
                expected: vec![len],
                got: vec![self.data.len()],
            });
        }
        let mut data = Vec::with_capacity(len);
        data.extend_from_slice(&self.data);
        data.resize(len, T::zero());
        Ok(Self::from_vec(data))
    }
}

impl<T, const RANK: usize> Debug for Tensor<T, RANK>
where
    T: TensorElem,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("data", &self.data)
            .finish()
    }
}
