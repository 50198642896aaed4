use crate::error::{check_len, check_shape, Result, SimError};
use crate::traits::NonlinearFunction;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Mass on a linear spring as a first order system.
/// State `(x, v)`, right-hand side `(v, -(k/m) x)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HarmonicOscillator {
    pub mass: f64,
    pub stiffness: f64,
}

impl HarmonicOscillator {
    pub fn new(mass: f64, stiffness: f64) -> Result<Self> {
        if !(mass > 0.0) {
            return Err(SimError::InvalidConfiguration(format!(
                "oscillator mass must be positive, got {mass}"
            )));
        }
        Ok(Self { mass, stiffness })
    }

    pub fn angular_frequency(&self) -> f64 {
        (self.stiffness / self.mass).sqrt()
    }

    /// Exact state at time `t` starting from `(x0, v0)`.
    pub fn exact(&self, t: f64, x0: f64, v0: f64) -> [f64; 2] {
        let w = self.angular_frequency();
        let (s, c) = (w * t).sin_cos();
        [x0 * c + v0 / w * s, -x0 * w * s + v0 * c]
    }
}

impl NonlinearFunction for HarmonicOscillator {
    fn dim_x(&self) -> usize {
        2
    }

    fn dim_f(&self) -> usize {
        2
    }

    fn evaluate(&self, x: &[f64], f: &mut [f64]) -> Result<()> {
        check_len("oscillator state", 2, x.len())?;
        check_len("oscillator output", 2, f.len())?;
        f[0] = x[1];
        f[1] = -self.stiffness / self.mass * x[0];
        Ok(())
    }

    fn evaluate_deriv(&self, x: &[f64], df: &mut DMatrix<f64>) -> Result<()> {
        check_len("oscillator state", 2, x.len())?;
        check_shape("oscillator jacobian", df, 2, 2)?;
        df.fill(0.0);
        df[(0, 1)] = 1.0;
        df[(1, 0)] = -self.stiffness / self.mass;
        Ok(())
    }
}

/// `f(x) = diag(w) x`. Serves as the mass/regularization operator of the
/// second order integrators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagonalMatrixFunction {
    pub weights: DVector<f64>,
}

impl DiagonalMatrixFunction {
    pub fn new(weights: DVector<f64>) -> Self {
        Self { weights }
    }
}

impl NonlinearFunction for DiagonalMatrixFunction {
    fn dim_x(&self) -> usize {
        self.weights.len()
    }

    fn dim_f(&self) -> usize {
        self.weights.len()
    }

    fn evaluate(&self, x: &[f64], f: &mut [f64]) -> Result<()> {
        check_len("diagonal input", self.weights.len(), x.len())?;
        check_len("diagonal output", self.weights.len(), f.len())?;
        for ((out, w), xi) in f.iter_mut().zip(self.weights.iter()).zip(x) {
            *out = w * xi;
        }
        Ok(())
    }

    fn evaluate_deriv(&self, x: &[f64], df: &mut DMatrix<f64>) -> Result<()> {
        let n = self.weights.len();
        check_len("diagonal input", n, x.len())?;
        check_shape("diagonal jacobian", df, n, n)?;
        df.fill(0.0);
        df.set_diagonal(&self.weights);
        Ok(())
    }
}
