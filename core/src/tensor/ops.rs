//! Tensor operations.
//!
//! Element-wise arithmetic requires identical shapes (no implicit broadcasting); the one
//! broadcast the layers need, adding a bias row to every row of a matrix, is the explicit
//! [`Tensor::add_row`]. Element-wise work is spread over CPU cores with `rayon`.
//!
//! ```rust
//! use fsdp_rs::tensor::Tensor;
//!
//! let a = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();
//! let b = Tensor::<f32, 1>::new(vec![3.0, 4.0], [2]).unwrap();
//!
//! let c = (&a + &b).unwrap();
//! assert_eq!(c.data(), &[4.0, 6.0]);
//! ```

use super::{Tensor, TensorElem};
use crate::error::{Error, Result};

use rayon::prelude::*;
use std::ops::{Add, Mul, Sub};

/// Implements a shape-checked element-wise binary operator for `&Tensor`.
macro_rules! impl_bin_op {
    ($trait:ident, $method:ident) => {
        impl<T, const RANK: usize> $trait for &Tensor<T, RANK>
        where
            T: TensorElem,
        {
            type Output = Result<Tensor<T, RANK>>;

            fn $method(self, rhs: Self) -> Self::Output {
                if self.shape != rhs.shape {
                    return Err(Error::ShapeMismatch {
                        expected: self.shape.to_vec(),
                        got: rhs.shape.to_vec(),
                    });
                }

                let mut out = Tensor::zeros(self.shape);
                out.data
                    .par_iter_mut()
                    .zip(self.data.par_iter())
                    .zip(rhs.data.par_iter())
                    .for_each(|((o, a), b)| {
                        *o = a.$method(*b);
                    });

                Ok(out)
            }
        }
    };
}

impl_bin_op!(Add, add);
impl_bin_op!(Sub, sub);
impl_bin_op!(Mul, mul);

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Applies `f` to every element.
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(T) -> T + Sync + Send,
    {
        let mut out = Tensor::zeros(self.shape);
        out.data
            .par_iter_mut()
            .zip(self.data.par_iter())
            .for_each(|(o, i)| *o = f(*i));
        out
    }

    /// Multiplies every element by `factor`.
    pub fn scale(&self, factor: T) -> Self {
        self.map(move |x| x * factor)
    }

    /// Adds `rhs` into `self` in place.
    pub fn add_assign(&mut self, rhs: &Self) -> Result<()> {
        if self.shape != rhs.shape {
            return Err(Error::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: rhs.shape.to_vec(),
            });
        }
        self.data
            .par_iter_mut()
            .zip(rhs.data.par_iter())
            .for_each(|(a, b)| *a += *b);
        Ok(())
    }
}

impl<T> Tensor<T, 2>
where
    T: TensorElem,
{
    /// Matrix multiplication: `[M, K] x [K, N] -> [M, N]`.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        let [m, k] = self.shape;
        let [k2, n] = rhs.shape;
        if k != k2 {
            return Err(Error::ShapeMismatch {
                expected: vec![k, n],
                got: rhs.shape.to_vec(),
            });
        }

        // Rows of rhs^T are columns of rhs, so the inner loop walks both operands sequentially.
        let rhs_t = rhs.transpose();
        let mut out = Tensor::zeros([m, n]);
        if n == 0 {
            return Ok(out);
        }
        out.data
            .par_chunks_mut(n)
            .enumerate()
            .for_each(|(row, out_row)| {
                let a = &self.data[row * k..(row + 1) * k];
                for (col, o) in out_row.iter_mut().enumerate() {
                    let b = &rhs_t.data[col * k..(col + 1) * k];
                    let mut sum = T::zero();
                    for (&x, &y) in a.iter().zip(b.iter()) {
                        sum += x * y;
                    }
                    *o = sum;
                }
            });
        Ok(out)
    }

    /// Swaps the two dimensions.
    pub fn transpose(&self) -> Self {
        let [rows, cols] = self.shape;
        let mut out = Tensor::zeros([cols, rows]);
        if rows == 0 {
            return out;
        }
        out.data
            .par_chunks_mut(rows)
            .enumerate()
            .for_each(|(c, out_row)| {
                for (r, o) in out_row.iter_mut().enumerate() {
                    *o = self.data[r * cols + c];
                }
            });
        out
    }

    /// Adds a `[N]` row vector to every row of an `[M, N]` matrix.
    pub fn add_row(&self, row: &Tensor<T, 1>) -> Result<Self> {
        let [_, n] = self.shape;
        if row.shape != [n] {
            return Err(Error::ShapeMismatch {
                expected: vec![n],
                got: row.shape.to_vec(),
            });
        }
        let mut out = self.clone();
        if n == 0 {
            return Ok(out);
        }
        out.data.par_chunks_mut(n).for_each(|out_row| {
            for (o, b) in out_row.iter_mut().zip(row.data.iter()) {
                *o += *b;
            }
        });
        Ok(out)
    }

    /// Sums over the rows, `[M, N] -> [N]`.
    pub fn sum_rows(&self) -> Tensor<T, 1> {
        let [_, n] = self.shape;
        let mut out = vec![T::zero(); n];
        if n == 0 {
            return Tensor::from_vec(out);
        }
        for row in self.data.chunks(n) {
            for (o, v) in out.iter_mut().zip(row.iter()) {
                *o += *v;
            }
        }
        Tensor::from_vec(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic() {
        let a = Tensor::<f32, 1>::from_vec(vec![1.0, 2.0]);
        let b = Tensor::<f32, 1>::from_vec(vec![3.0, 5.0]);
        assert_eq!((&a + &b).unwrap().data(), &[4.0, 7.0]);
        assert_eq!((&b - &a).unwrap().data(), &[2.0, 3.0]);
        assert_eq!((&a * &b).unwrap().data(), &[3.0, 10.0]);

        let c = Tensor::<f32, 1>::from_vec(vec![1.0]);
        assert!((&a + &c).is_err());
    }

    #[test]
    fn test_map_scale_add_assign() {
        let mut t = Tensor::<f64, 1>::from_vec(vec![1.0, -2.0]);
        assert_eq!(t.map(|x| x * x).data(), &[1.0, 4.0]);
        assert_eq!(t.scale(3.0).data(), &[3.0, -6.0]);
        t.add_assign(&Tensor::from_vec(vec![1.0, 1.0])).unwrap();
        assert_eq!(t.data(), &[2.0, -1.0]);
    }

    #[test]
    fn test_matmul_2d() {
        let a = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0, 4.0], [2, 2]).unwrap();
        let b = Tensor::<f32, 2>::new(vec![5.0, 6.0, 7.0, 8.0], [2, 2]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.data(), &[19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_rectangular() {
        // [1, 3] x [3, 2]
        let a = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0], [1, 3]).unwrap();
        let b = Tensor::<f32, 2>::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], [3, 2]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &[1, 2]);
        assert_eq!(c.data(), &[4.0, 5.0]);
    }

    #[test]
    fn test_matmul_shape_mismatch() {
        let a = Tensor::<f32, 2>::zeros([2, 2]);
        let b = Tensor::<f32, 2>::zeros([3, 2]);
        assert!(matches!(a.matmul(&b), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_transpose() {
        let t = Tensor::<i32, 2>::new(vec![1, 2, 3, 4, 5, 6], [2, 3]).unwrap();
        let tt = t.transpose();
        assert_eq!(tt.shape(), &[3, 2]);
        assert_eq!(tt.data(), &[1, 4, 2, 5, 3, 6]);
        assert_eq!(tt.transpose(), t);
    }

    #[test]
    fn test_add_row_and_sum_rows() {
        let m = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0, 4.0], [2, 2]).unwrap();
        let row = Tensor::<f32, 1>::from_vec(vec![10.0, 20.0]);
        let out = m.add_row(&row).unwrap();
        assert_eq!(out.data(), &[11.0, 22.0, 13.0, 24.0]);
        assert_eq!(m.sum_rows().data(), &[4.0, 6.0]);
        assert!(m.add_row(&Tensor::from_vec(vec![1.0])).is_err());
    }
}
