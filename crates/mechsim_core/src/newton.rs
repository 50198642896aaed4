use crate::error::{check_len, Result, SimError};
use crate::traits::NonlinearFunction;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// A negligible correction is accepted only while `‖F(x)‖` stays within this
/// factor of `tolerance`, i.e. at the round-off level of a badly scaled residual.
const ROUND_OFF_FACTOR: f64 = 1e3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NewtonSettings {
    pub max_steps: usize,
    pub damping: f64,
    /// Absolute bound on ‖F(x)‖.
    pub tolerance: f64,
    /// Relative bound on the last undamped Newton correction; below it the residual is round-off.
    pub step_tolerance: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_steps: 20,
            damping: 1.0,
            tolerance: 1e-10,
            step_tolerance: 1e-10,
        }
    }
}

impl NewtonSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(SimError::InvalidConfiguration(
                "max_steps must be greater than zero.".into(),
            ));
        }
        if !(self.damping > 0.0) {
            return Err(SimError::InvalidConfiguration(
                "damping must be positive.".into(),
            ));
        }
        if !(self.tolerance > 0.0) || self.step_tolerance < 0.0 {
            return Err(SimError::InvalidConfiguration(
                "tolerances must be positive.".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewtonReport {
    pub iterations: usize,
    pub residual_norm: f64,
}

/// Solves `F(x) = 0` with full (optionally damped) Newton steps `x <- x - J(x)^{-1} F(x)`.
///
/// `x` holds the initial guess and receives the converged state. A singular Jacobian is
/// reported as [`SimError::SingularMatrix`], an exhausted budget as [`SimError::NotConverged`].
pub fn newton_solve<F: NonlinearFunction + ?Sized>(
    func: &F,
    x: &mut [f64],
    settings: &NewtonSettings,
) -> Result<NewtonReport> {
    settings.validate()?;
    let dim = func.dim_x();
    check_len("newton initial guess", dim, x.len())?;
    check_len("newton residual", dim, func.dim_f())?;

    let mut residual = vec![0.0; dim];
    let mut jacobian = DMatrix::zeros(dim, dim);
    func.evaluate(x, &mut residual)?;
    let mut residual_norm = l2_norm(&residual);
    let mut iterations = 0usize;

    loop {
        if residual_norm <= settings.tolerance {
            break;
        }
        if !residual_norm.is_finite() || iterations >= settings.max_steps {
            warn!(
                iterations,
                residual_norm, "Newton solver exhausted its iteration budget"
            );
            return Err(SimError::NotConverged {
                iterations,
                residual_norm,
            });
        }

        func.evaluate_deriv(x, &mut jacobian)?;
        let delta = solve_linear_system(&jacobian, &residual)?;

        // Undamped correction: measures how far x is from the root, whatever the damping.
        let correction = delta.norm();
        for (xi, di) in x.iter_mut().zip(delta.iter()) {
            *xi -= settings.damping * di;
        }

        iterations += 1;
        func.evaluate(x, &mut residual)?;
        residual_norm = l2_norm(&residual);
        trace!(iterations, residual_norm, correction, "Newton iteration");

        if correction <= settings.step_tolerance * (1.0 + l2_norm(x))
            && residual_norm <= ROUND_OFF_FACTOR * settings.tolerance
        {
            break;
        }
    }

    debug!(iterations, residual_norm, "Newton solver converged");
    Ok(NewtonReport {
        iterations,
        residual_norm,
    })
}

/// Dense LU solve of `J delta = rhs`.
pub fn solve_linear_system(jacobian: &DMatrix<f64>, rhs: &[f64]) -> Result<DVector<f64>> {
    check_len("linear system", jacobian.nrows(), rhs.len())?;
    if !jacobian.is_square() {
        return Err(SimError::DimensionMismatch {
            context: "linear system columns",
            expected: jacobian.nrows(),
            actual: jacobian.ncols(),
        });
    }
    let rhs = DVector::from_column_slice(rhs);
    jacobian
        .clone()
        .lu()
        .solve(&rhs)
        .filter(|v| v.iter().all(|entry| entry.is_finite()))
        .ok_or_else(|| SimError::SingularMatrix("Jacobian is singular.".into()))
}

pub(crate) fn l2_norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::Autodiff;
    use crate::traits::{GenericFunction, Scalar};
    use approx::assert_abs_diff_eq;

    /// x^2 + y^2 = 4, x = y
    struct Circle;

    impl GenericFunction for Circle {
        fn dim_x(&self) -> usize {
            2
        }
        fn dim_f(&self) -> usize {
            2
        }
        fn evaluate_generic<T: Scalar>(&self, x: &[T], f: &mut [T]) -> Result<()> {
            f[0] = x[0].clone() * x[0].clone() + x[1].clone() * x[1].clone() - T::from(4.0);
            f[1] = x[0].clone() - x[1].clone();
            Ok(())
        }
    }

    /// Residual x^2 + 1 has no real root.
    struct NoRoot;

    impl GenericFunction for NoRoot {
        fn dim_x(&self) -> usize {
            1
        }
        fn dim_f(&self) -> usize {
            1
        }
        fn evaluate_generic<T: Scalar>(&self, x: &[T], f: &mut [T]) -> Result<()> {
            f[0] = x[0].clone() * x[0].clone() + T::from(1.0);
            Ok(())
        }
    }

    #[test]
    fn converges_to_circle_intersection() {
        let func = Autodiff::new(Circle);
        let mut x = vec![1.0, 2.0];
        let report = newton_solve(&func, &mut x, &NewtonSettings::default()).unwrap();
        let root = 2.0f64.sqrt();
        assert_abs_diff_eq!(x[0], root, epsilon = 1e-10);
        assert_abs_diff_eq!(x[1], root, epsilon = 1e-10);
        assert!(report.iterations > 0 && report.iterations < 10);
        assert!(report.residual_norm <= 1e-10);
    }

    #[test]
    fn reports_non_convergence_distinctly() {
        // From 0.5 the iterates of x^2 + 1 wander over the real line and never hit x = 0.
        let func = Autodiff::new(NoRoot);
        let mut x = vec![0.5];
        let settings = NewtonSettings {
            max_steps: 8,
            ..NewtonSettings::default()
        };
        let err = newton_solve(&func, &mut x, &settings).expect_err("no real root");
        match err {
            SimError::NotConverged {
                iterations,
                residual_norm,
            } => {
                assert_eq!(iterations, 8);
                assert!(residual_norm >= 1.0);
            }
            other => panic!("expected NotConverged, got {other:?}"),
        }
    }

    /// x - 5
    struct Shift;

    impl GenericFunction for Shift {
        fn dim_x(&self) -> usize {
            1
        }
        fn dim_f(&self) -> usize {
            1
        }
        fn evaluate_generic<T: Scalar>(&self, x: &[T], f: &mut [T]) -> Result<()> {
            f[0] = x[0].clone() - T::from(5.0);
            Ok(())
        }
    }

    #[test]
    fn tiny_damped_steps_are_not_convergence() {
        let func = Autodiff::new(Shift);
        let mut x = vec![0.0];
        let settings = NewtonSettings {
            damping: 1e-11,
            ..NewtonSettings::default()
        };
        let err = newton_solve(&func, &mut x, &settings).expect_err("barely moved");
        assert!(matches!(
            err,
            SimError::NotConverged {
                iterations: 20,
                ..
            }
        ));
        assert!(x[0] < 1e-8);

        let mut x = vec![0.0];
        let report = newton_solve(&func, &mut x, &NewtonSettings::default()).unwrap();
        assert_eq!(report.iterations, 1);
        assert_abs_diff_eq!(x[0], 5.0, epsilon = 1e-12);
    }

    #[test]
    fn reports_singular_jacobian() {
        // Jacobian 2x vanishes at the initial guess.
        let func = Autodiff::new(NoRoot);
        let mut x = vec![0.0];
        let err = newton_solve(&func, &mut x, &NewtonSettings::default())
            .expect_err("singular jacobian");
        assert!(matches!(err, SimError::SingularMatrix(_)));
    }

    #[test]
    fn rejects_invalid_settings_and_guess() {
        let func = Autodiff::new(Circle);
        let mut x = vec![1.0, 1.0];
        let settings = NewtonSettings {
            max_steps: 0,
            ..NewtonSettings::default()
        };
        let err = newton_solve(&func, &mut x, &settings).expect_err("zero steps");
        assert!(format!("{err}").contains("max_steps"));

        let mut short = vec![1.0];
        let err = newton_solve(&func, &mut short, &NewtonSettings::default())
            .expect_err("short guess");
        assert!(matches!(err, SimError::DimensionMismatch { .. }));
    }
}
