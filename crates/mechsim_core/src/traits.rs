use crate::error::Result;
use nalgebra::DMatrix;
use num_traits::{One, Zero};
use std::fmt::Debug;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

/// A trait for types that can be used as scalars in residual assembly.
/// Implemented by `f64` and by the dual number, so a residual written once over `T: Scalar`
/// yields either plain values or values together with their derivatives.
pub trait Scalar:
    Clone
    + Debug
    + Zero
    + One
    + From<f64>
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + SubAssign
    + Mul<f64, Output = Self>
    + Div<f64, Output = Self>
    + 'static
{
    /// Plain value, dropping any derivative information.
    fn value(&self) -> f64;
    fn sqrt(&self) -> Self;
    fn sin(&self) -> Self;
    fn cos(&self) -> Self;
    fn exp(&self) -> Self;
    fn ln(&self) -> Self;
}

impl Scalar for f64 {
    fn value(&self) -> f64 {
        *self
    }
    fn sqrt(&self) -> Self {
        f64::sqrt(*self)
    }
    fn sin(&self) -> Self {
        f64::sin(*self)
    }
    fn cos(&self) -> Self {
        f64::cos(*self)
    }
    fn exp(&self) -> Self {
        f64::exp(*self)
    }
    fn ln(&self) -> Self {
        f64::ln(*self)
    }
}

/// A vector-valued function `F: R^dim_x -> R^dim_f` together with its Jacobian.
///
/// `dim_x` and `dim_f` are fixed for the lifetime of the object. `evaluate` writes only
/// into `f`, and `evaluate_deriv` must return the exact Jacobian of `evaluate`
/// (shape `dim_f x dim_x`).
pub trait NonlinearFunction {
    fn dim_x(&self) -> usize;

    fn dim_f(&self) -> usize;

    /// x: point of evaluation (length `dim_x`)
    /// f: output buffer (length `dim_f`)
    fn evaluate(&self, x: &[f64], f: &mut [f64]) -> Result<()>;

    /// Writes the Jacobian at `x` into `df`, which must already be `dim_f x dim_x`.
    fn evaluate_deriv(&self, x: &[f64], df: &mut DMatrix<f64>) -> Result<()>;
}

impl<F: NonlinearFunction + ?Sized> NonlinearFunction for &F {
    fn dim_x(&self) -> usize {
        (**self).dim_x()
    }
    fn dim_f(&self) -> usize {
        (**self).dim_f()
    }
    fn evaluate(&self, x: &[f64], f: &mut [f64]) -> Result<()> {
        (**self).evaluate(x, f)
    }
    fn evaluate_deriv(&self, x: &[f64], df: &mut DMatrix<f64>) -> Result<()> {
        (**self).evaluate_deriv(x, df)
    }
}

/// A residual written once over the generic scalar type.
/// Wrap it in [`crate::autodiff::Autodiff`] to get a `NonlinearFunction` with an exact Jacobian.
pub trait GenericFunction {
    fn dim_x(&self) -> usize;

    fn dim_f(&self) -> usize;

    fn evaluate_generic<T: Scalar>(&self, x: &[T], f: &mut [T]) -> Result<()>;
}

/// A one-step scheme for the autonomous ODE `y' = f(y)`.
pub trait TimeStepper {
    /// Advances `state` in place from `t` to `t + h`.
    /// Steppers keep no notion of time; callers drive the outer loop.
    fn advance(&mut self, h: f64, state: &mut [f64]) -> Result<()>;
}
