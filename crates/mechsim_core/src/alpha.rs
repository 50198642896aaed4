//! Generalized-alpha integration of second order systems `M(x'') = F(x)`.
//!
//! The unknown of every step is the new position. Accelerations and velocities follow
//! from the Newmark update formulas, and the equation of motion is enforced at the
//! intermediate points `x_{n+1-alpha_f}` and `a_{n+1-alpha_m}`. Algebraic constraints
//! enter through `F` as multiplier rows, which are solved at `x_{n+1}` without any
//! velocity or acceleration history and are regularized by a small entry of `M`.

use crate::error::{check_len, check_shape, Result, SimError};
use crate::newton::{newton_solve, NewtonSettings};
use crate::traits::NonlinearFunction;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlphaParameters {
    pub alpha_m: f64,
    pub alpha_f: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl AlphaParameters {
    /// Chung-Hulbert parameters for spectral radius `rho_inf` at infinite frequency.
    /// `rho_inf = 1` is non-dissipative, `rho_inf = 0` annihilates the highest modes.
    pub fn from_rho_inf(rho_inf: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&rho_inf) {
            return Err(SimError::InvalidConfiguration(format!(
                "rho_inf must lie in [0, 1], got {rho_inf}"
            )));
        }
        let alpha_m = (2.0 * rho_inf - 1.0) / (rho_inf + 1.0);
        let alpha_f = rho_inf / (rho_inf + 1.0);
        let gamma = 0.5 - alpha_m + alpha_f;
        let beta = 0.25 * (1.0 - alpha_m + alpha_f).powi(2);
        Ok(Self {
            alpha_m,
            alpha_f,
            beta,
            gamma,
        })
    }

    /// Trapezoidal (average acceleration) Newmark scheme.
    pub fn newmark() -> Self {
        Self {
            alpha_m: 0.0,
            alpha_f: 0.0,
            beta: 0.25,
            gamma: 0.5,
        }
    }
}

/// Settings for a constrained mechanical simulation run.
/// `regularization` is the mass-operator weight of every multiplier row; it keeps the
/// saddle-point Newton system regular and should be small against the system's mass scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlphaSettings {
    pub rho_inf: f64,
    pub regularization: f64,
    #[serde(default)]
    pub newton: NewtonSettings,
}

impl Default for AlphaSettings {
    fn default() -> Self {
        Self {
            rho_inf: 0.8,
            regularization: 1e-12,
            newton: NewtonSettings::default(),
        }
    }
}

impl AlphaSettings {
    pub fn integrator(&self) -> Result<GeneralizedAlpha> {
        if !(self.regularization >= 0.0) || !self.regularization.is_finite() {
            return Err(SimError::InvalidConfiguration(format!(
                "regularization must be non-negative and finite, got {}",
                self.regularization
            )));
        }
        self.newton.validate()?;
        Ok(GeneralizedAlpha {
            params: AlphaParameters::from_rho_inf(self.rho_inf)?,
            newton: self.newton,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlphaReport {
    pub steps: usize,
    pub newton_iterations: usize,
    pub final_time: f64,
}

/// Residual of one step as a function of `x_{n+1}`.
///
/// The first `n - algebraic` components are differential: their rows read
/// `M(a_{n+1-alpha_m}) - F(x_{n+1-alpha_f})`. The trailing `algebraic` components carry no
/// history. They enter `F` unblended and their rows read `M(x_{n+1}) - F(x_{n+1})`, so
/// constraints hold at the new time level.
struct AlphaResidual<'a, R: ?Sized, M: ?Sized> {
    rhs: &'a R,
    mass: &'a M,
    params: AlphaParameters,
    dt: f64,
    algebraic: usize,
    x_old: &'a [f64],
    v_old: &'a [f64],
    a_old: &'a [f64],
}

impl<R: ?Sized, M: ?Sized> AlphaResidual<'_, R, M> {
    fn differential(&self) -> usize {
        self.x_old.len() - self.algebraic
    }

    fn new_acceleration(&self, x: &[f64], out: &mut [f64]) {
        let beta = self.params.beta;
        let scale = 1.0 / (beta * self.dt * self.dt);
        let carry = (1.0 - 2.0 * beta) / (2.0 * beta);
        for i in 0..out.len() {
            out[i] = (x[i] - self.x_old[i] - self.dt * self.v_old[i]) * scale
                - carry * self.a_old[i];
        }
    }

    fn new_velocity(&self, a_new: &[f64], out: &mut [f64]) {
        let gamma = self.params.gamma;
        for i in 0..out.len() {
            out[i] = self.v_old[i] + self.dt * ((1.0 - gamma) * self.a_old[i] + gamma * a_new[i]);
        }
    }

    /// Inputs of the mass operator and of the force at the intermediate level.
    /// Algebraic components are passed through as `x_{n+1}` in both.
    fn intermediate(&self, x: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let AlphaParameters {
            alpha_m, alpha_f, ..
        } = self.params;
        let nd = self.differential();
        let mut mass_input = x.to_vec();
        self.new_acceleration(&x[..nd], &mut mass_input[..nd]);
        for (a, a_old) in mass_input[..nd].iter_mut().zip(self.a_old) {
            *a = (1.0 - alpha_m) * *a + alpha_m * a_old;
        }
        let mut force_input = x.to_vec();
        for (xf, x_old) in force_input[..nd].iter_mut().zip(self.x_old) {
            *xf = (1.0 - alpha_f) * *xf + alpha_f * x_old;
        }
        (mass_input, force_input)
    }
}

impl<R, M> NonlinearFunction for AlphaResidual<'_, R, M>
where
    R: NonlinearFunction + ?Sized,
    M: NonlinearFunction + ?Sized,
{
    fn dim_x(&self) -> usize {
        self.x_old.len()
    }

    fn dim_f(&self) -> usize {
        self.x_old.len()
    }

    fn evaluate(&self, x: &[f64], f: &mut [f64]) -> Result<()> {
        let nd = self.differential();
        let (mass_input, force_input) = self.intermediate(x);
        let mut force = vec![0.0; f.len()];
        self.mass.evaluate(&mass_input, f)?;
        self.rhs.evaluate(&force_input, &mut force)?;
        if self.algebraic > 0 {
            let mut constraint = vec![0.0; f.len()];
            self.rhs.evaluate(x, &mut constraint)?;
            force[nd..].copy_from_slice(&constraint[nd..]);
        }
        for (fi, force_i) in f.iter_mut().zip(&force) {
            *fi -= force_i;
        }
        Ok(())
    }

    fn evaluate_deriv(&self, x: &[f64], df: &mut DMatrix<f64>) -> Result<()> {
        let n = self.x_old.len();
        let nd = self.differential();
        check_shape("generalized-alpha jacobian", df, n, n)?;
        let AlphaParameters {
            alpha_m,
            alpha_f,
            beta,
            ..
        } = self.params;
        let (mass_input, force_input) = self.intermediate(x);

        self.mass.evaluate_deriv(&mass_input, df)?;
        let acc_scale = (1.0 - alpha_m) / (beta * self.dt * self.dt);
        for j in 0..nd {
            df.column_mut(j).scale_mut(acc_scale);
        }

        let mut force_jac = DMatrix::zeros(n, n);
        self.rhs.evaluate_deriv(&force_input, &mut force_jac)?;
        for j in 0..nd {
            force_jac.column_mut(j).scale_mut(1.0 - alpha_f);
        }
        if self.algebraic > 0 {
            let mut constraint_jac = DMatrix::zeros(n, n);
            self.rhs.evaluate_deriv(x, &mut constraint_jac)?;
            force_jac
                .rows_mut(nd, self.algebraic)
                .copy_from(&constraint_jac.rows(nd, self.algebraic));
        }
        *df -= force_jac;
        Ok(())
    }
}

/// Fixed-step generalized-alpha driver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeneralizedAlpha {
    pub params: AlphaParameters,
    pub newton: NewtonSettings,
}

impl GeneralizedAlpha {
    pub fn new(rho_inf: f64) -> Result<Self> {
        Ok(Self {
            params: AlphaParameters::from_rho_inf(rho_inf)?,
            newton: NewtonSettings::default(),
        })
    }

    pub fn newmark() -> Self {
        Self {
            params: AlphaParameters::newmark(),
            newton: NewtonSettings::default(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn simulate<R, M>(
        &self,
        t_end: f64,
        steps: usize,
        x: &mut [f64],
        dx: &mut [f64],
        ddx: &mut [f64],
        rhs: &R,
        mass: &M,
    ) -> Result<AlphaReport>
    where
        R: NonlinearFunction + ?Sized,
        M: NonlinearFunction + ?Sized,
    {
        self.simulate_with_callback(t_end, steps, x, dx, ddx, rhs, mass, |_, _| {})
    }

    /// Advances `(x, dx, ddx)` over `steps` equal steps of `[0, t_end]` in place.
    /// `callback(t, x)` runs after every accepted step.
    #[allow(clippy::too_many_arguments)]
    pub fn simulate_with_callback<R, M, C>(
        &self,
        t_end: f64,
        steps: usize,
        x: &mut [f64],
        dx: &mut [f64],
        ddx: &mut [f64],
        rhs: &R,
        mass: &M,
        callback: C,
    ) -> Result<AlphaReport>
    where
        R: NonlinearFunction + ?Sized,
        M: NonlinearFunction + ?Sized,
        C: FnMut(f64, &[f64]),
    {
        self.simulate_constrained(t_end, steps, 0, x, dx, ddx, rhs, mass, callback)
    }

    /// Like [`Self::simulate_with_callback`], with the last `algebraic` state components
    /// treated as algebraic unknowns (Lagrange multipliers). Their rows of `F` are
    /// enforced at `x_{n+1}` and their entries of `dx` and `ddx` are left at zero.
    #[allow(clippy::too_many_arguments)]
    pub fn simulate_constrained<R, M, C>(
        &self,
        t_end: f64,
        steps: usize,
        algebraic: usize,
        x: &mut [f64],
        dx: &mut [f64],
        ddx: &mut [f64],
        rhs: &R,
        mass: &M,
        mut callback: C,
    ) -> Result<AlphaReport>
    where
        R: NonlinearFunction + ?Sized,
        M: NonlinearFunction + ?Sized,
        C: FnMut(f64, &[f64]),
    {
        if steps == 0 {
            return Err(SimError::InvalidConfiguration(
                "steps must be greater than zero.".into(),
            ));
        }
        if !(t_end > 0.0) || !t_end.is_finite() {
            return Err(SimError::InvalidConfiguration(format!(
                "t_end must be positive and finite, got {t_end}"
            )));
        }
        let n = x.len();
        if algebraic > n {
            return Err(SimError::InvalidConfiguration(format!(
                "{algebraic} algebraic components in a state of length {n}"
            )));
        }
        check_len("velocity", n, dx.len())?;
        check_len("acceleration", n, ddx.len())?;
        check_len("force input", n, rhs.dim_x())?;
        check_len("force output", n, rhs.dim_f())?;
        check_len("mass input", n, mass.dim_x())?;
        check_len("mass output", n, mass.dim_f())?;

        let nd = n - algebraic;
        let dt = t_end / steps as f64;
        info!(t_end, steps, dt, dim = n, algebraic, "Starting generalized-alpha integration");

        dx[nd..].fill(0.0);
        ddx[nd..].fill(0.0);
        let mut x_old = x.to_vec();
        let mut v_old = dx.to_vec();
        let mut a_old = ddx.to_vec();
        let mut newton_iterations = 0usize;

        for step in 0..steps {
            let residual = AlphaResidual {
                rhs,
                mass,
                params: self.params,
                dt,
                algebraic,
                x_old: &x_old,
                v_old: &v_old,
                a_old: &a_old,
            };
            let report = newton_solve(&residual, x, &self.newton).map_err(|err| {
                warn!(step, time = step as f64 * dt, %err, "generalized-alpha step failed");
                err
            })?;
            newton_iterations += report.iterations;

            residual.new_acceleration(&x[..nd], &mut ddx[..nd]);
            residual.new_velocity(&ddx[..nd], &mut dx[..nd]);

            x_old.copy_from_slice(x);
            v_old.copy_from_slice(dx);
            a_old.copy_from_slice(ddx);
            callback((step + 1) as f64 * dt, x);
        }

        info!(newton_iterations, "Finished generalized-alpha integration");
        Ok(AlphaReport {
            steps,
            newton_iterations,
            final_time: t_end,
        })
    }
}
