use crate::collocation::ButcherTableau;
use crate::error::{check_len, check_shape, Result, SimError};
use crate::newton::{newton_solve, NewtonSettings};
use crate::traits::{NonlinearFunction, TimeStepper};
use nalgebra::DMatrix;

fn check_rhs<F: NonlinearFunction + ?Sized>(rhs: &F, state: &[f64]) -> Result<()> {
    check_len("ode right-hand side", rhs.dim_x(), rhs.dim_f())?;
    check_len("ode state", rhs.dim_x(), state.len())
}

/// Explicit Euler: y <- y + h f(y)
pub struct ExplicitEuler<'a, F: ?Sized> {
    rhs: &'a F,
    f: Vec<f64>,
}

impl<'a, F: NonlinearFunction + ?Sized> ExplicitEuler<'a, F> {
    pub fn new(rhs: &'a F) -> Self {
        Self {
            rhs,
            f: vec![0.0; rhs.dim_f()],
        }
    }
}

impl<F: NonlinearFunction + ?Sized> TimeStepper for ExplicitEuler<'_, F> {
    fn advance(&mut self, h: f64, state: &mut [f64]) -> Result<()> {
        check_rhs(self.rhs, state)?;
        self.rhs.evaluate(state, &mut self.f)?;
        for (y, f) in state.iter_mut().zip(&self.f) {
            *y += h * f;
        }
        Ok(())
    }
}

/// Improved Euler (Heun) predictor-corrector.
pub struct ImprovedEuler<'a, F: ?Sized> {
    rhs: &'a F,
    f0: Vec<f64>,
    f1: Vec<f64>,
    predictor: Vec<f64>,
}

impl<'a, F: NonlinearFunction + ?Sized> ImprovedEuler<'a, F> {
    pub fn new(rhs: &'a F) -> Self {
        let dim = rhs.dim_f();
        Self {
            rhs,
            f0: vec![0.0; dim],
            f1: vec![0.0; dim],
            predictor: vec![0.0; dim],
        }
    }
}

impl<F: NonlinearFunction + ?Sized> TimeStepper for ImprovedEuler<'_, F> {
    fn advance(&mut self, h: f64, state: &mut [f64]) -> Result<()> {
        check_rhs(self.rhs, state)?;

        // predictor: y + h f(y)
        self.rhs.evaluate(state, &mut self.f0)?;
        for i in 0..state.len() {
            self.predictor[i] = state[i] + h * self.f0[i];
        }

        // corrector: y + h/2 (f(y) + f(predictor))
        self.rhs.evaluate(&self.predictor, &mut self.f1)?;
        for i in 0..state.len() {
            state[i] += 0.5 * h * (self.f0[i] + self.f1[i]);
        }
        Ok(())
    }
}

/// `x - y_old - h (theta f_old + (1 - theta) f(x))` for the one-step theta family.
/// Implicit Euler has no explicit part (`theta = 0`), Crank-Nicolson uses `theta = 1/2`.
struct ThetaResidual<'a, F: ?Sized> {
    rhs: &'a F,
    y_old: &'a [f64],
    /// `(theta, f(y_old))`
    explicit: Option<(f64, &'a [f64])>,
    h: f64,
}

impl<F: ?Sized> ThetaResidual<'_, F> {
    fn theta(&self) -> f64 {
        self.explicit.map_or(0.0, |(theta, _)| theta)
    }
}

impl<F: NonlinearFunction + ?Sized> NonlinearFunction for ThetaResidual<'_, F> {
    fn dim_x(&self) -> usize {
        self.rhs.dim_x()
    }

    fn dim_f(&self) -> usize {
        self.rhs.dim_f()
    }

    fn evaluate(&self, x: &[f64], f: &mut [f64]) -> Result<()> {
        self.rhs.evaluate(x, f)?;
        let implicit = (1.0 - self.theta()) * self.h;
        for i in 0..f.len() {
            f[i] = x[i] - self.y_old[i] - implicit * f[i];
        }
        if let Some((theta, f_old)) = self.explicit {
            for (fi, fo) in f.iter_mut().zip(f_old) {
                *fi -= theta * self.h * fo;
            }
        }
        Ok(())
    }

    fn evaluate_deriv(&self, x: &[f64], df: &mut DMatrix<f64>) -> Result<()> {
        self.rhs.evaluate_deriv(x, df)?;
        *df *= -(1.0 - self.theta()) * self.h;
        for i in 0..df.nrows() {
            df[(i, i)] += 1.0;
        }
        Ok(())
    }
}

/// Implicit Euler: solves `y_new - y - h f(y_new) = 0` by Newton, starting from `y`.
pub struct ImplicitEuler<'a, F: ?Sized> {
    rhs: &'a F,
    pub settings: NewtonSettings,
    y_old: Vec<f64>,
}

impl<'a, F: NonlinearFunction + ?Sized> ImplicitEuler<'a, F> {
    pub fn new(rhs: &'a F) -> Self {
        Self::with_settings(rhs, NewtonSettings::default())
    }

    pub fn with_settings(rhs: &'a F, settings: NewtonSettings) -> Self {
        Self {
            rhs,
            settings,
            y_old: vec![0.0; rhs.dim_x()],
        }
    }
}

impl<F: NonlinearFunction + ?Sized> TimeStepper for ImplicitEuler<'_, F> {
    fn advance(&mut self, h: f64, state: &mut [f64]) -> Result<()> {
        check_rhs(self.rhs, state)?;
        self.y_old.copy_from_slice(state);
        let residual = ThetaResidual {
            rhs: self.rhs,
            y_old: &self.y_old,
            explicit: None,
            h,
        };
        newton_solve(&residual, state, &self.settings)?;
        Ok(())
    }
}

/// Crank-Nicolson: solves `y_new - y - h/2 (f(y) + f(y_new)) = 0` by Newton.
pub struct CrankNicolson<'a, F: ?Sized> {
    rhs: &'a F,
    pub settings: NewtonSettings,
    y_old: Vec<f64>,
    f_old: Vec<f64>,
}

impl<'a, F: NonlinearFunction + ?Sized> CrankNicolson<'a, F> {
    pub fn new(rhs: &'a F) -> Self {
        Self::with_settings(rhs, NewtonSettings::default())
    }

    pub fn with_settings(rhs: &'a F, settings: NewtonSettings) -> Self {
        Self {
            rhs,
            settings,
            y_old: vec![0.0; rhs.dim_x()],
            f_old: vec![0.0; rhs.dim_f()],
        }
    }
}

impl<F: NonlinearFunction + ?Sized> TimeStepper for CrankNicolson<'_, F> {
    fn advance(&mut self, h: f64, state: &mut [f64]) -> Result<()> {
        check_rhs(self.rhs, state)?;
        self.y_old.copy_from_slice(state);
        self.rhs.evaluate(state, &mut self.f_old)?;
        let residual = ThetaResidual {
            rhs: self.rhs,
            y_old: &self.y_old,
            explicit: Some((0.5, self.f_old.as_slice())),
            h,
        };
        newton_solve(&residual, state, &self.settings)?;
        Ok(())
    }
}

/// Stacked stage equations `k_i - f(y + h sum_j a_ij k_j) = 0`, unknowns `k_1..k_s`.
struct StageResidual<'a, F: ?Sized> {
    rhs: &'a F,
    tableau: &'a ButcherTableau,
    y: &'a [f64],
    h: f64,
}

impl<F: NonlinearFunction + ?Sized> StageResidual<'_, F> {
    fn stage_value(&self, k: &[f64], i: usize, out: &mut [f64]) {
        let n = self.y.len();
        out.copy_from_slice(self.y);
        for j in 0..self.tableau.stages() {
            let a_ij = self.tableau.a[(i, j)];
            if a_ij == 0.0 {
                continue;
            }
            for (o, kj) in out.iter_mut().zip(&k[j * n..(j + 1) * n]) {
                *o += self.h * a_ij * kj;
            }
        }
    }
}

impl<F: NonlinearFunction + ?Sized> NonlinearFunction for StageResidual<'_, F> {
    fn dim_x(&self) -> usize {
        self.tableau.stages() * self.y.len()
    }

    fn dim_f(&self) -> usize {
        self.dim_x()
    }

    fn evaluate(&self, k: &[f64], f: &mut [f64]) -> Result<()> {
        let n = self.y.len();
        let mut stage = vec![0.0; n];
        for i in 0..self.tableau.stages() {
            self.stage_value(k, i, &mut stage);
            let block = &mut f[i * n..(i + 1) * n];
            self.rhs.evaluate(&stage, block)?;
            for (fi, ki) in block.iter_mut().zip(&k[i * n..(i + 1) * n]) {
                *fi = ki - *fi;
            }
        }
        Ok(())
    }

    fn evaluate_deriv(&self, k: &[f64], df: &mut DMatrix<f64>) -> Result<()> {
        let n = self.y.len();
        let s = self.tableau.stages();
        check_shape("stage jacobian", df, s * n, s * n)?;
        let mut stage = vec![0.0; n];
        let mut jac = DMatrix::zeros(n, n);
        df.fill(0.0);
        for i in 0..s {
            self.stage_value(k, i, &mut stage);
            self.rhs.evaluate_deriv(&stage, &mut jac)?;
            for j in 0..s {
                let mut block = df.view_mut((i * n, j * n), (n, n));
                block.copy_from(&jac);
                block *= -self.h * self.tableau.a[(i, j)];
                if i == j {
                    for d in 0..n {
                        block[(d, d)] += 1.0;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Implicit Runge-Kutta with a caller-supplied (typically collocation) tableau.
/// All stage derivatives are solved jointly by Newton; the update is `y + h sum_i b_i k_i`.
pub struct ImplicitRungeKutta<'a, F: ?Sized> {
    rhs: &'a F,
    tableau: ButcherTableau,
    pub settings: NewtonSettings,
    y_old: Vec<f64>,
    k: Vec<f64>,
}

impl<'a, F: NonlinearFunction + ?Sized> ImplicitRungeKutta<'a, F> {
    pub fn new(rhs: &'a F, tableau: ButcherTableau) -> Self {
        Self::with_settings(rhs, tableau, NewtonSettings::default())
    }

    pub fn with_settings(rhs: &'a F, tableau: ButcherTableau, settings: NewtonSettings) -> Self {
        let n = rhs.dim_x();
        let s = tableau.stages();
        Self {
            rhs,
            tableau,
            settings,
            y_old: vec![0.0; n],
            k: vec![0.0; s * n],
        }
    }

    pub fn tableau(&self) -> &ButcherTableau {
        &self.tableau
    }
}

impl<F: NonlinearFunction + ?Sized> TimeStepper for ImplicitRungeKutta<'_, F> {
    fn advance(&mut self, h: f64, state: &mut [f64]) -> Result<()> {
        check_rhs(self.rhs, state)?;
        let n = state.len();
        let s = self.tableau.stages();
        self.y_old.copy_from_slice(state);

        // Every stage starts from f(y).
        self.rhs.evaluate(state, &mut self.k[..n])?;
        for i in 1..s {
            self.k.copy_within(0..n, i * n);
        }

        let residual = StageResidual {
            rhs: self.rhs,
            tableau: &self.tableau,
            y: &self.y_old,
            h,
        };
        newton_solve(&residual, &mut self.k, &self.settings)?;

        for i in 0..s {
            let weight = h * self.tableau.b[i];
            for (y, ki) in state.iter_mut().zip(&self.k[i * n..(i + 1) * n]) {
                *y += weight * ki;
            }
        }
        Ok(())
    }
}

/// Explicit Runge-Kutta for a strictly lower triangular tableau.
pub struct ExplicitRungeKutta<'a, F: ?Sized> {
    rhs: &'a F,
    tableau: ButcherTableau,
    k: Vec<Vec<f64>>,
    tmp: Vec<f64>,
}

impl<'a, F: NonlinearFunction + ?Sized> ExplicitRungeKutta<'a, F> {
    pub fn new(rhs: &'a F, tableau: ButcherTableau) -> Result<Self> {
        if !tableau.is_explicit() {
            return Err(SimError::InvalidConfiguration(
                "explicit Runge-Kutta requires a strictly lower triangular tableau".into(),
            ));
        }
        let n = rhs.dim_x();
        Ok(Self {
            rhs,
            k: vec![vec![0.0; n]; tableau.stages()],
            tableau,
            tmp: vec![0.0; n],
        })
    }
}

impl<F: NonlinearFunction + ?Sized> TimeStepper for ExplicitRungeKutta<'_, F> {
    fn advance(&mut self, h: f64, state: &mut [f64]) -> Result<()> {
        check_rhs(self.rhs, state)?;
        let s = self.tableau.stages();
        for i in 0..s {
            self.tmp.copy_from_slice(state);
            for j in 0..i {
                let a_ij = self.tableau.a[(i, j)];
                for (t, kj) in self.tmp.iter_mut().zip(&self.k[j]) {
                    *t += h * a_ij * kj;
                }
            }
            self.rhs.evaluate(&self.tmp, &mut self.k[i])?;
        }
        for i in 0..s {
            let weight = h * self.tableau.b[i];
            for (y, ki) in state.iter_mut().zip(&self.k[i]) {
                *y += weight * ki;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::HarmonicOscillator;

    fn global_error<S: TimeStepper>(stepper: &mut S, t_end: f64, steps: usize) -> f64 {
        let osc = HarmonicOscillator::new(1.0, 1.0).unwrap();
        let h = t_end / steps as f64;
        let mut y = vec![1.0, 0.0];
        for _ in 0..steps {
            stepper.advance(h, &mut y).expect("step should succeed");
        }
        let exact = osc.exact(t_end, 1.0, 0.0);
        ((y[0] - exact[0]).powi(2) + (y[1] - exact[1]).powi(2)).sqrt()
    }

    fn observed_order<S: TimeStepper>(mut make: impl FnMut() -> S, t_end: f64, steps: usize) -> f64 {
        let coarse = global_error(&mut make(), t_end, steps);
        let fine = global_error(&mut make(), t_end, 2 * steps);
        (coarse / fine).log2()
    }

    fn amplitude(y: &[f64]) -> f64 {
        (y[0] * y[0] + y[1] * y[1]).sqrt()
    }

    #[test]
    fn first_order_methods_halve_the_error() {
        let osc = HarmonicOscillator::new(1.0, 1.0).unwrap();
        let explicit = observed_order(|| ExplicitEuler::new(&osc), 1.0, 400);
        let implicit = observed_order(|| ImplicitEuler::new(&osc), 1.0, 400);
        assert!((explicit - 1.0).abs() < 0.1, "explicit Euler order {explicit}");
        assert!((implicit - 1.0).abs() < 0.1, "implicit Euler order {implicit}");
    }

    #[test]
    fn second_order_methods_quarter_the_error() {
        let osc = HarmonicOscillator::new(1.0, 1.0).unwrap();
        let improved = observed_order(|| ImprovedEuler::new(&osc), 1.0, 100);
        let crank = observed_order(|| CrankNicolson::new(&osc), 1.0, 100);
        assert!((improved - 2.0).abs() < 0.1, "improved Euler order {improved}");
        assert!((crank - 2.0).abs() < 0.1, "Crank-Nicolson order {crank}");
    }

    #[test]
    fn gauss_collocation_reaches_order_2s() {
        let osc = HarmonicOscillator::new(1.0, 1.0).unwrap();
        for (stages, steps) in [(1usize, 40usize), (2, 10), (3, 10)] {
            let tableau = ButcherTableau::gauss(stages).unwrap();
            let order = observed_order(
                || ImplicitRungeKutta::new(&osc, tableau.clone()),
                2.0,
                steps,
            );
            let expected = 2.0 * stages as f64;
            assert!(
                (order - expected).abs() < 0.3,
                "{stages}-stage Gauss order {order}, expected {expected}"
            );
        }
    }

    #[test]
    fn classical_rk4_is_fourth_order() {
        let osc = HarmonicOscillator::new(1.0, 1.0).unwrap();
        let order = observed_order(
            || ExplicitRungeKutta::new(&osc, ButcherTableau::rk4()).unwrap(),
            2.0,
            20,
        );
        assert!((order - 4.0).abs() < 0.2, "RK4 order {order}");
    }

    #[test]
    fn explicit_runge_kutta_rejects_implicit_tableau() {
        let osc = HarmonicOscillator::new(1.0, 1.0).unwrap();
        let err = ExplicitRungeKutta::new(&osc, ButcherTableau::gauss(2).unwrap())
            .err()
            .expect("implicit tableau");
        assert!(matches!(err, SimError::InvalidConfiguration(_)));
    }

    #[test]
    fn implicit_methods_keep_amplitude_where_explicit_euler_diverges() {
        let osc = HarmonicOscillator::new(1.0, 1.0).unwrap();
        let t_end = 40.0 * std::f64::consts::PI;
        let steps = 1000;
        let h = t_end / steps as f64;

        let run = |stepper: &mut dyn TimeStepper| {
            let mut y = vec![1.0, 0.0];
            let mut worst: f64 = 0.0;
            for _ in 0..steps {
                stepper.advance(h, &mut y).expect("step should succeed");
                worst = worst.max((amplitude(&y) - 1.0).abs());
            }
            (y, worst)
        };

        let (_, crank_drift) = run(&mut CrankNicolson::new(&osc));
        let (_, gauss_drift) = run(&mut ImplicitRungeKutta::new(
            &osc,
            ButcherTableau::gauss(2).unwrap(),
        ));
        let (euler_state, _) = run(&mut ExplicitEuler::new(&osc));

        assert!(crank_drift < 1e-6, "Crank-Nicolson drift {crank_drift}");
        assert!(gauss_drift < 1e-6, "Gauss drift {gauss_drift}");
        assert!(
            amplitude(&euler_state) > 10.0,
            "explicit Euler amplitude {}",
            amplitude(&euler_state)
        );
    }

    #[test]
    fn advance_rejects_wrong_state_length() {
        let osc = HarmonicOscillator::new(1.0, 1.0).unwrap();
        let mut stepper = CrankNicolson::new(&osc);
        let mut y = vec![1.0, 0.0, 0.0];
        let err = stepper.advance(0.1, &mut y).expect_err("wrong length");
        assert!(matches!(err, SimError::DimensionMismatch { .. }));
    }
}
