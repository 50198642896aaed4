//! Butcher tableaux for Runge-Kutta methods.
//!
//! Collocation tableaux are derived from their abscissae: `a[i][j]` integrates the Lagrange
//! basis polynomial of node `j` over `[0, c_i]`, `b[j]` integrates it over `[0, 1]`.
//! Both follow from the moment conditions `sum_j a_ij c_j^k = c_i^(k+1) / (k+1)` and
//! `sum_j b_j c_j^k = 1 / (k+1)` for `k < s`.

use crate::error::{check_len, check_shape, Result, SimError};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ButcherTableau {
    /// Stage coupling, `s x s`.
    pub a: DMatrix<f64>,
    /// Quadrature weights.
    pub b: DVector<f64>,
    /// Stage abscissae.
    pub c: DVector<f64>,
}

impl ButcherTableau {
    pub fn new(a: DMatrix<f64>, b: DVector<f64>, c: DVector<f64>) -> Result<Self> {
        let s = c.len();
        if s == 0 {
            return Err(SimError::InvalidConfiguration(
                "a Butcher tableau needs at least one stage".into(),
            ));
        }
        check_shape("butcher tableau a", &a, s, s)?;
        check_len("butcher tableau b", s, b.len())?;
        Ok(Self { a, b, c })
    }

    /// Collocation method at the given abscissae.
    pub fn collocation(c: &[f64]) -> Result<Self> {
        let c = DVector::from_column_slice(c);
        let (a, b) = compute_ab_from_c(&c)?;
        Ok(Self { a, b, c })
    }

    /// `s`-stage Gauss-Legendre collocation, order `2s`.
    pub fn gauss(stages: usize) -> Result<Self> {
        Self::collocation(&gauss_legendre_nodes(stages)?)
    }

    /// `s`-stage Radau IIA collocation, order `2s - 1`.
    pub fn radau(stages: usize) -> Result<Self> {
        Self::collocation(&gauss_radau_nodes(stages)?)
    }

    /// Classical explicit fourth order method.
    pub fn rk4() -> Self {
        let a = DMatrix::from_row_slice(
            4,
            4,
            &[
                0.0, 0.0, 0.0, 0.0, //
                0.5, 0.0, 0.0, 0.0, //
                0.0, 0.5, 0.0, 0.0, //
                0.0, 0.0, 1.0, 0.0,
            ],
        );
        let b = DVector::from_column_slice(&[1.0 / 6.0, 1.0 / 3.0, 1.0 / 3.0, 1.0 / 6.0]);
        let c = DVector::from_column_slice(&[0.0, 0.5, 0.5, 1.0]);
        Self { a, b, c }
    }

    pub fn stages(&self) -> usize {
        self.c.len()
    }

    /// True if `a` is strictly lower triangular.
    pub fn is_explicit(&self) -> bool {
        let s = self.stages();
        (0..s).all(|i| (i..s).all(|j| self.a[(i, j)] == 0.0))
    }
}

/// Solves the moment conditions for `(a, b)` given distinct abscissae `c`.
pub fn compute_ab_from_c(c: &DVector<f64>) -> Result<(DMatrix<f64>, DVector<f64>)> {
    let s = c.len();
    if s == 0 {
        return Err(SimError::InvalidConfiguration(
            "collocation needs at least one abscissa".into(),
        ));
    }

    // Row k holds c_j^k.
    let vandermonde = DMatrix::from_fn(s, s, |k, j| c[j].powi(k as i32));
    let lu = vandermonde.lu();
    if !lu.is_invertible() {
        return Err(SimError::SingularMatrix(
            "collocation abscissae must be distinct".into(),
        ));
    }

    let moments = DVector::from_fn(s, |k, _| 1.0 / (k as f64 + 1.0));
    let b = lu
        .solve(&moments)
        .ok_or_else(|| SimError::SingularMatrix("collocation weight system".into()))?;

    let mut a = DMatrix::zeros(s, s);
    for i in 0..s {
        let rhs = DVector::from_fn(s, |k, _| c[i].powi(k as i32 + 1) / (k as f64 + 1.0));
        let row = lu
            .solve(&rhs)
            .ok_or_else(|| SimError::SingularMatrix("collocation stage system".into()))?;
        a.row_mut(i).copy_from(&row.transpose());
    }
    Ok((a, b))
}

/// Legendre polynomial `P_n(t)` on `[-1, 1]` by the three-term recurrence.
pub fn legendre(n: usize, t: f64) -> f64 {
    let (mut p_prev, mut p) = (1.0, t);
    if n == 0 {
        return p_prev;
    }
    for k in 1..n {
        let kf = k as f64;
        let next = ((2.0 * kf + 1.0) * t * p - kf * p_prev) / (kf + 1.0);
        p_prev = p;
        p = next;
    }
    p
}

/// Zeros of `P_s(2x - 1)`, ascending in `(0, 1)`.
pub fn gauss_legendre_nodes(stages: usize) -> Result<Vec<f64>> {
    if stages == 0 {
        return Err(SimError::InvalidConfiguration(
            "Gauss rule needs at least one node".into(),
        ));
    }
    let roots = bracket_roots(|t| legendre(stages, t), -1.0, 1.0, stages);
    finish_nodes(roots, stages, "Gauss-Legendre")
}

/// Right Radau nodes: zeros of `P_s(2x - 1) - P_{s-1}(2x - 1)`, ascending, last node at 1.
pub fn gauss_radau_nodes(stages: usize) -> Result<Vec<f64>> {
    if stages == 0 {
        return Err(SimError::InvalidConfiguration(
            "Radau rule needs at least one node".into(),
        ));
    }
    let q = |t: f64| legendre(stages, t) - legendre(stages - 1, t);
    // t = 1 is always a root; scan strictly below it.
    let mut roots = bracket_roots(q, -1.0, 1.0 - 1e-9, stages - 1);
    roots.push(1.0);
    finish_nodes(roots, stages, "Gauss-Radau")
}

fn finish_nodes(roots: Vec<f64>, stages: usize, rule: &str) -> Result<Vec<f64>> {
    if roots.len() != stages {
        return Err(SimError::InvalidConfiguration(format!(
            "{rule} rule: found {} of {stages} nodes",
            roots.len()
        )));
    }
    Ok(roots.into_iter().map(|t| 0.5 * (t + 1.0)).collect())
}

/// Sign changes on a fine grid, refined by bisection.
fn bracket_roots(f: impl Fn(f64) -> f64, lo: f64, hi: f64, expected: usize) -> Vec<f64> {
    let samples = 400 * (expected + 1);
    let width = (hi - lo) / samples as f64;
    let mut roots = Vec::with_capacity(expected);
    let mut left = lo;
    let mut f_left = f(left);
    for k in 1..=samples {
        let right = lo + k as f64 * width;
        let f_right = f(right);
        if f_left == 0.0 {
            roots.push(left);
        } else if f_left * f_right < 0.0 {
            let (mut a, mut b, mut fa) = (left, right, f_left);
            for _ in 0..200 {
                let mid = 0.5 * (a + b);
                let fm = f(mid);
                if fm == 0.0 || (b - a) < 1e-16 {
                    a = mid;
                    b = mid;
                    break;
                }
                if fa * fm < 0.0 {
                    b = mid;
                } else {
                    a = mid;
                    fa = fm;
                }
            }
            roots.push(0.5 * (a + b));
        }
        left = right;
        f_left = f_right;
    }
    roots
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn quadrature(tableau: &ButcherTableau, degree: i32) -> f64 {
        tableau
            .b
            .iter()
            .zip(tableau.c.iter())
            .map(|(b, c)| b * c.powi(degree))
            .sum()
    }

    #[test]
    fn gauss_weights_integrate_up_to_degree_2s_minus_1() {
        for s in 1..=5 {
            let tableau = ButcherTableau::gauss(s).unwrap();
            for degree in 0..(2 * s as i32) {
                let exact = 1.0 / (degree as f64 + 1.0);
                assert_abs_diff_eq!(quadrature(&tableau, degree), exact, epsilon = 1e-11);
            }
        }
        // degree 2s is no longer exact
        let tableau = ButcherTableau::gauss(2).unwrap();
        assert!((quadrature(&tableau, 4) - 0.2).abs() > 1e-4);
    }

    #[test]
    fn radau_weights_integrate_up_to_degree_2s_minus_2() {
        for s in 1..=4 {
            let tableau = ButcherTableau::radau(s).unwrap();
            assert_eq!(*tableau.c.as_slice().last().unwrap(), 1.0);
            for degree in 0..(2 * s as i32 - 1) {
                let exact = 1.0 / (degree as f64 + 1.0);
                assert_abs_diff_eq!(quadrature(&tableau, degree), exact, epsilon = 1e-11);
            }
        }
    }

    #[test]
    fn stage_rows_integrate_polynomials_up_to_c_i() {
        let tableau = ButcherTableau::gauss(3).unwrap();
        for i in 0..3 {
            for degree in 0..3 {
                let approx: f64 = (0..3)
                    .map(|j| tableau.a[(i, j)] * tableau.c[j].powi(degree))
                    .sum();
                let exact = tableau.c[i].powi(degree + 1) / (degree as f64 + 1.0);
                assert_abs_diff_eq!(approx, exact, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn two_stage_gauss_matches_known_tableau() {
        let tableau = ButcherTableau::gauss(2).unwrap();
        let r = 3.0f64.sqrt() / 6.0;
        assert_abs_diff_eq!(tableau.c[0], 0.5 - r, epsilon = 1e-13);
        assert_abs_diff_eq!(tableau.c[1], 0.5 + r, epsilon = 1e-13);
        assert_abs_diff_eq!(tableau.a[(0, 0)], 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(tableau.a[(0, 1)], 0.25 - r, epsilon = 1e-12);
        assert_abs_diff_eq!(tableau.a[(1, 0)], 0.25 + r, epsilon = 1e-12);
        assert_abs_diff_eq!(tableau.b[0], 0.5, epsilon = 1e-12);
        assert!(!tableau.is_explicit());
        assert!(ButcherTableau::rk4().is_explicit());
    }

    #[test]
    fn new_checks_tableau_shapes() {
        let rk4 = ButcherTableau::rk4();
        let rebuilt = ButcherTableau::new(rk4.a.clone(), rk4.b.clone(), rk4.c.clone()).unwrap();
        assert_eq!(rebuilt, rk4);

        let err = ButcherTableau::new(rk4.a.clone(), DVector::zeros(3), rk4.c.clone())
            .expect_err("short weights");
        assert!(format!("{err}").contains("butcher tableau b"));

        let err = ButcherTableau::new(DMatrix::zeros(4, 3), rk4.b.clone(), rk4.c.clone())
            .expect_err("non-square coupling");
        assert!(matches!(
            err,
            SimError::DimensionMismatch {
                expected: 4,
                actual: 3,
                ..
            }
        ));

        let err = ButcherTableau::new(DMatrix::zeros(0, 0), DVector::zeros(0), DVector::zeros(0))
            .expect_err("no stages");
        assert!(matches!(err, SimError::InvalidConfiguration(_)));
    }

    #[test]
    fn coincident_abscissae_are_singular() {
        let err = ButcherTableau::collocation(&[0.5, 0.5]).expect_err("duplicate nodes");
        assert!(matches!(err, SimError::SingularMatrix(_)));
    }
}
