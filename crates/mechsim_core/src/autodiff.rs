use crate::error::{check_len, Result, SimError};
use crate::traits::{GenericFunction, NonlinearFunction, Scalar};
use nalgebra::DMatrix;
use num_traits::{One, Zero};
use std::fmt;
use std::ops::{
    Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign,
};

/// Dual number for forward-mode AD with a run-time number of seed directions.
/// val: real part
/// eps: partial derivatives w.r.t. the seed variables; empty for a constant
///
/// Binary operations between two non-constant duals require equal `eps` lengths.
/// A constant operand contributes a zero derivative of whatever length the other side has.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dual {
    val: f64,
    eps: Vec<f64>,
}

impl Dual {
    /// A constant: no derivative information.
    pub fn constant(val: f64) -> Self {
        Self {
            val,
            eps: Vec::new(),
        }
    }

    /// A variable slot with `dim` zeroed partials. The caller seeds it.
    pub fn variable(val: f64, dim: usize) -> Self {
        Self {
            val,
            eps: vec![0.0; dim],
        }
    }

    /// Variable `index` out of `dim`, seeded with the unit basis vector.
    pub fn seeded(val: f64, dim: usize, index: usize) -> Self {
        let mut dual = Self::variable(val, dim);
        dual.eps[index] = 1.0;
        dual
    }

    pub fn value(&self) -> f64 {
        self.val
    }

    pub fn derivative(&self) -> &[f64] {
        &self.eps
    }

    pub fn dim(&self) -> usize {
        self.eps.len()
    }

    pub fn is_constant(&self) -> bool {
        self.eps.is_empty()
    }

    /// Result with value `val` and derivative `da * self' + db * rhs'`.
    fn combine(
        &self,
        rhs: &Dual,
        val: f64,
        da: f64,
        db: f64,
        context: &'static str,
    ) -> Result<Dual> {
        let eps = match (self.is_constant(), rhs.is_constant()) {
            (true, true) => Vec::new(),
            (false, true) => self.eps.iter().map(|a| da * a).collect(),
            (true, false) => rhs.eps.iter().map(|b| db * b).collect(),
            (false, false) => {
                check_len(context, self.eps.len(), rhs.eps.len())?;
                self.eps
                    .iter()
                    .zip(&rhs.eps)
                    .map(|(a, b)| da * a + db * b)
                    .collect()
            }
        };
        Ok(Dual { val, eps })
    }

    /// Chain rule for a unary function with value `val` and derivative `d` at `self.val`.
    fn chain(&self, val: f64, d: f64) -> Dual {
        Dual {
            val,
            eps: self.eps.iter().map(|e| d * e).collect(),
        }
    }

    pub fn try_add(&self, rhs: &Dual) -> Result<Dual> {
        self.combine(rhs, self.val + rhs.val, 1.0, 1.0, "dual addition")
    }

    pub fn try_sub(&self, rhs: &Dual) -> Result<Dual> {
        self.combine(rhs, self.val - rhs.val, 1.0, -1.0, "dual subtraction")
    }

    pub fn try_mul(&self, rhs: &Dual) -> Result<Dual> {
        self.combine(
            rhs,
            self.val * rhs.val,
            rhs.val,
            self.val,
            "dual multiplication",
        )
    }

    pub fn try_div(&self, rhs: &Dual) -> Result<Dual> {
        let inv = 1.0 / rhs.val;
        self.combine(
            rhs,
            self.val * inv,
            inv,
            -self.val * inv * inv,
            "dual division",
        )
    }

    /// Division by a plain scalar. An exact zero is a domain error.
    pub fn try_div_scalar(&self, rhs: f64) -> Result<Dual> {
        if rhs == 0.0 {
            return Err(SimError::DivisionByZero(format!(
                "dual number {} divided by plain scalar 0",
                self.val
            )));
        }
        Ok(self.scale(1.0 / rhs))
    }

    fn scale(&self, factor: f64) -> Dual {
        self.chain(self.val * factor, factor)
    }

    pub fn sqrt(&self) -> Dual {
        let s = self.val.sqrt();
        self.chain(s, 0.5 / s)
    }

    pub fn sin(&self) -> Dual {
        self.chain(self.val.sin(), self.val.cos())
    }

    pub fn cos(&self) -> Dual {
        self.chain(self.val.cos(), -self.val.sin())
    }

    pub fn exp(&self) -> Dual {
        let e = self.val.exp();
        self.chain(e, e)
    }

    pub fn ln(&self) -> Dual {
        self.chain(self.val.ln(), 1.0 / self.val)
    }

    pub fn powi(&self, n: i32) -> Dual {
        self.chain(self.val.powi(n), f64::from(n) * self.val.powi(n - 1))
    }
}

impl From<f64> for Dual {
    fn from(val: f64) -> Self {
        Self::constant(val)
    }
}

impl fmt::Display for Dual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [", self.val)?;
        for (i, d) in self.eps.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

// Operators panic on a shape mismatch, as nalgebra does; use the `try_*` methods to recover.
macro_rules! impl_dual_op {
    ($trait:ident, $method:ident, $checked:ident) => {
        impl $trait<&Dual> for &Dual {
            type Output = Dual;
            fn $method(self, rhs: &Dual) -> Dual {
                self.$checked(rhs).unwrap_or_else(|err| panic!("{err}"))
            }
        }
        impl $trait<Dual> for Dual {
            type Output = Dual;
            fn $method(self, rhs: Dual) -> Dual {
                (&self).$method(&rhs)
            }
        }
        impl $trait<&Dual> for Dual {
            type Output = Dual;
            fn $method(self, rhs: &Dual) -> Dual {
                (&self).$method(rhs)
            }
        }
        impl $trait<Dual> for &Dual {
            type Output = Dual;
            fn $method(self, rhs: Dual) -> Dual {
                self.$method(&rhs)
            }
        }
        impl $trait<Dual> for f64 {
            type Output = Dual;
            fn $method(self, rhs: Dual) -> Dual {
                (&Dual::constant(self)).$method(&rhs)
            }
        }
        impl $trait<&Dual> for f64 {
            type Output = Dual;
            fn $method(self, rhs: &Dual) -> Dual {
                (&Dual::constant(self)).$method(rhs)
            }
        }
    };
}

impl_dual_op!(Add, add, try_add);
impl_dual_op!(Sub, sub, try_sub);
impl_dual_op!(Mul, mul, try_mul);
impl_dual_op!(Div, div, try_div);

impl Add<f64> for Dual {
    type Output = Dual;
    fn add(mut self, rhs: f64) -> Dual {
        self.val += rhs;
        self
    }
}

impl Sub<f64> for Dual {
    type Output = Dual;
    fn sub(mut self, rhs: f64) -> Dual {
        self.val -= rhs;
        self
    }
}

impl Mul<f64> for Dual {
    type Output = Dual;
    fn mul(self, rhs: f64) -> Dual {
        self.scale(rhs)
    }
}

impl Mul<f64> for &Dual {
    type Output = Dual;
    fn mul(self, rhs: f64) -> Dual {
        self.scale(rhs)
    }
}

impl Div<f64> for Dual {
    type Output = Dual;
    fn div(self, rhs: f64) -> Dual {
        self.try_div_scalar(rhs).unwrap_or_else(|err| panic!("{err}"))
    }
}

impl Div<f64> for &Dual {
    type Output = Dual;
    fn div(self, rhs: f64) -> Dual {
        self.try_div_scalar(rhs).unwrap_or_else(|err| panic!("{err}"))
    }
}

impl Neg for Dual {
    type Output = Dual;
    fn neg(self) -> Dual {
        self.scale(-1.0)
    }
}

impl Neg for &Dual {
    type Output = Dual;
    fn neg(self) -> Dual {
        self.scale(-1.0)
    }
}

impl AddAssign for Dual {
    fn add_assign(&mut self, rhs: Self) {
        *self = &*self + &rhs;
    }
}
impl AddAssign<&Dual> for Dual {
    fn add_assign(&mut self, rhs: &Dual) {
        *self = &*self + rhs;
    }
}
impl SubAssign for Dual {
    fn sub_assign(&mut self, rhs: Self) {
        *self = &*self - &rhs;
    }
}
impl SubAssign<&Dual> for Dual {
    fn sub_assign(&mut self, rhs: &Dual) {
        *self = &*self - rhs;
    }
}
impl MulAssign for Dual {
    fn mul_assign(&mut self, rhs: Self) {
        *self = &*self * &rhs;
    }
}
impl DivAssign for Dual {
    fn div_assign(&mut self, rhs: Self) {
        *self = &*self / &rhs;
    }
}

impl Zero for Dual {
    fn zero() -> Self {
        Self::constant(0.0)
    }
    fn is_zero(&self) -> bool {
        self.val == 0.0 && self.eps.iter().all(|d| *d == 0.0)
    }
}

impl One for Dual {
    fn one() -> Self {
        Self::constant(1.0)
    }
}

impl Scalar for Dual {
    fn value(&self) -> f64 {
        self.val
    }
    fn sqrt(&self) -> Self {
        Dual::sqrt(self)
    }
    fn sin(&self) -> Self {
        Dual::sin(self)
    }
    fn cos(&self) -> Self {
        Dual::cos(self)
    }
    fn exp(&self) -> Self {
        Dual::exp(self)
    }
    fn ln(&self) -> Self {
        Dual::ln(self)
    }
}

// --- Jacobians via seeded duals ---

/// Evaluates `func` once with every input promoted to a dual of dimension `dim_x`,
/// seeded with its own unit vector. The output partials are the Jacobian rows.
pub fn jacobian_via_dual<G: GenericFunction>(
    func: &G,
    x: &[f64],
    df: &mut DMatrix<f64>,
) -> Result<()> {
    let n = func.dim_x();
    let m = func.dim_f();
    check_len("jacobian input", n, x.len())?;
    check_len("jacobian rows", m, df.nrows())?;
    check_len("jacobian columns", n, df.ncols())?;

    let dual_x: Vec<Dual> = x
        .iter()
        .enumerate()
        .map(|(i, &v)| Dual::seeded(v, n, i))
        .collect();
    let mut dual_out = vec![Dual::zero(); m];
    func.evaluate_generic(&dual_x, &mut dual_out)?;

    for (row, entry) in dual_out.iter().enumerate() {
        if entry.is_constant() {
            // Output did not depend on x at all.
            df.row_mut(row).fill(0.0);
            continue;
        }
        check_len("jacobian row", n, entry.dim())?;
        for (col, d) in entry.derivative().iter().enumerate() {
            df[(row, col)] = *d;
        }
    }
    Ok(())
}

/// Turns a generic residual into a `NonlinearFunction` whose Jacobian comes from dual numbers.
pub struct Autodiff<F> {
    pub inner: F,
}

impl<F> Autodiff<F> {
    pub fn new(inner: F) -> Self {
        Self { inner }
    }
}

impl<F: GenericFunction> NonlinearFunction for Autodiff<F> {
    fn dim_x(&self) -> usize {
        self.inner.dim_x()
    }

    fn dim_f(&self) -> usize {
        self.inner.dim_f()
    }

    fn evaluate(&self, x: &[f64], f: &mut [f64]) -> Result<()> {
        check_len("evaluate input", self.inner.dim_x(), x.len())?;
        check_len("evaluate output", self.inner.dim_f(), f.len())?;
        self.inner.evaluate_generic(x, f)
    }

    fn evaluate_deriv(&self, x: &[f64], df: &mut DMatrix<f64>) -> Result<()> {
        jacobian_via_dual(&self.inner, x, df)
    }
}
