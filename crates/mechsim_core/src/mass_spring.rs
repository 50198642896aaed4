//! Masses, fixed points, springs and rigid distance joints in `D` dimensions.
//!
//! The system is integrated as a constrained second order problem. Its state is the
//! stacked mass positions (mass-major, then coordinate) followed by one Lagrange
//! multiplier per joint.

use crate::alpha::{AlphaReport, AlphaSettings};
use crate::autodiff::jacobian_via_dual;
use crate::error::{check_len, Result, SimError};
use crate::functions::DiagonalMatrixFunction;
use crate::traits::{GenericFunction, NonlinearFunction, Scalar};
use nalgebra::{DMatrix, DVector, SVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

fn zero_vector<const D: usize>() -> SVector<f64, D> {
    SVector::zeros()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mass<const D: usize> {
    pub mass: f64,
    pub pos: SVector<f64, D>,
    #[serde(default = "zero_vector")]
    pub vel: SVector<f64, D>,
    #[serde(default = "zero_vector")]
    pub acc: SVector<f64, D>,
}

impl<const D: usize> Mass<D> {
    /// A mass at rest.
    pub fn new(mass: f64, pos: SVector<f64, D>) -> Self {
        Self {
            mass,
            pos,
            vel: SVector::zeros(),
            acc: SVector::zeros(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fix<const D: usize> {
    pub pos: SVector<f64, D>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectorKind {
    Fix,
    Mass,
}

/// Index into the fix or mass sequence of the owning system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connector {
    pub kind: ConnectorKind,
    pub index: usize,
}

impl Connector {
    pub fn fix(index: usize) -> Self {
        Self {
            kind: ConnectorKind::Fix,
            index,
        }
    }

    pub fn mass(index: usize) -> Self {
        Self {
            kind: ConnectorKind::Mass,
            index,
        }
    }

    pub fn is_fix(&self) -> bool {
        self.kind == ConnectorKind::Fix
    }
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ConnectorKind::Fix => write!(f, "fix {}", self.index),
            ConnectorKind::Mass => write!(f, "mass {}", self.index),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Spring {
    pub length: f64,
    pub stiffness: f64,
    pub connectors: [Connector; 2],
}

/// Keeps its two endpoints at distance `length`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Joint {
    pub length: f64,
    pub connectors: [Connector; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MassSpringSystem<const D: usize> {
    #[serde(default)]
    fixes: Vec<Fix<D>>,
    #[serde(default)]
    masses: Vec<Mass<D>>,
    #[serde(default)]
    springs: Vec<Spring>,
    #[serde(default)]
    joints: Vec<Joint>,
    #[serde(default = "zero_vector")]
    gravity: SVector<f64, D>,
}

impl<const D: usize> Default for MassSpringSystem<D> {
    fn default() -> Self {
        Self {
            fixes: Vec::new(),
            masses: Vec::new(),
            springs: Vec::new(),
            joints: Vec::new(),
            gravity: SVector::zeros(),
        }
    }
}

impl<const D: usize> MassSpringSystem<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_gravity(&mut self, gravity: SVector<f64, D>) {
        self.gravity = gravity;
    }

    pub fn gravity(&self) -> &SVector<f64, D> {
        &self.gravity
    }

    pub fn add_fix(&mut self, fix: Fix<D>) -> Connector {
        self.fixes.push(fix);
        Connector::fix(self.fixes.len() - 1)
    }

    pub fn add_mass(&mut self, mass: Mass<D>) -> Result<Connector> {
        if !(mass.mass > 0.0) || !mass.mass.is_finite() {
            return Err(SimError::InvalidConfiguration(format!(
                "mass must be positive and finite, got {}",
                mass.mass
            )));
        }
        self.masses.push(mass);
        Ok(Connector::mass(self.masses.len() - 1))
    }

    /// Returns the index of the new spring.
    pub fn add_spring(&mut self, spring: Spring) -> Result<usize> {
        for c in spring.connectors {
            self.check_connector(c)?;
        }
        self.springs.push(spring);
        Ok(self.springs.len() - 1)
    }

    /// Returns the index of the new joint, which is also its multiplier slot.
    pub fn add_joint(&mut self, joint: Joint) -> Result<usize> {
        check_joint(&joint)?;
        for c in joint.connectors {
            self.check_connector(c)?;
        }
        self.joints.push(joint);
        Ok(self.joints.len() - 1)
    }

    pub fn fixes(&self) -> &[Fix<D>] {
        &self.fixes
    }

    pub fn masses(&self) -> &[Mass<D>] {
        &self.masses
    }

    pub fn masses_mut(&mut self) -> &mut [Mass<D>] {
        &mut self.masses
    }

    pub fn springs(&self) -> &[Spring] {
        &self.springs
    }

    pub fn joints(&self) -> &[Joint] {
        &self.joints
    }

    pub fn connector_position(&self, c: Connector) -> Result<SVector<f64, D>> {
        self.check_connector(c)?;
        Ok(match c.kind {
            ConnectorKind::Fix => self.fixes[c.index].pos,
            ConnectorKind::Mass => self.masses[c.index].pos,
        })
    }

    fn check_connector(&self, c: Connector) -> Result<()> {
        let len = match c.kind {
            ConnectorKind::Fix => self.fixes.len(),
            ConnectorKind::Mass => self.masses.len(),
        };
        if c.index >= len {
            return Err(SimError::InvalidConfiguration(format!(
                "connector {c} does not exist ({len} available)"
            )));
        }
        Ok(())
    }

    /// Checks everything a deserialized or hand-edited system could get wrong.
    pub fn validate(&self) -> Result<()> {
        for (i, mass) in self.masses.iter().enumerate() {
            if !(mass.mass > 0.0) || !mass.mass.is_finite() {
                return Err(SimError::InvalidConfiguration(format!(
                    "mass {i} has non-positive mass {}",
                    mass.mass
                )));
            }
        }
        for spring in &self.springs {
            for c in spring.connectors {
                self.check_connector(c)?;
            }
        }
        for joint in &self.joints {
            check_joint(joint)?;
            for c in joint.connectors {
                self.check_connector(c)?;
            }
        }
        Ok(())
    }

    /// Number of position unknowns, `D * #masses`.
    pub fn position_dim(&self) -> usize {
        D * self.masses.len()
    }

    /// Positions plus one multiplier per joint.
    pub fn state_dim(&self) -> usize {
        self.position_dim() + self.joints.len()
    }

    /// Copies positions, velocities and accelerations into flat mass-major vectors.
    pub fn get_state(&self, x: &mut [f64], dx: &mut [f64], ddx: &mut [f64]) -> Result<()> {
        let n = self.position_dim();
        check_len("state positions", n, x.len())?;
        check_len("state velocities", n, dx.len())?;
        check_len("state accelerations", n, ddx.len())?;
        for (i, m) in self.masses.iter().enumerate() {
            for k in 0..D {
                x[D * i + k] = m.pos[k];
                dx[D * i + k] = m.vel[k];
                ddx[D * i + k] = m.acc[k];
            }
        }
        Ok(())
    }

    pub fn set_state(&mut self, x: &[f64], dx: &[f64], ddx: &[f64]) -> Result<()> {
        let n = self.position_dim();
        check_len("state positions", n, x.len())?;
        check_len("state velocities", n, dx.len())?;
        check_len("state accelerations", n, ddx.len())?;
        for (i, m) in self.masses.iter_mut().enumerate() {
            for k in 0..D {
                m.pos[k] = x[D * i + k];
                m.vel[k] = dx[D * i + k];
                m.acc[k] = ddx[D * i + k];
            }
        }
        Ok(())
    }

    pub fn simulate(&mut self, t_end: f64, steps: usize) -> Result<AlphaReport> {
        self.simulate_with(t_end, steps, &AlphaSettings::default())
    }

    /// Integrates the system over `[0, t_end]` and stores the final state in the masses.
    /// On error the masses keep their previous state.
    pub fn simulate_with(
        &mut self,
        t_end: f64,
        steps: usize,
        settings: &AlphaSettings,
    ) -> Result<AlphaReport> {
        self.validate()?;
        let integrator = settings.integrator()?;

        let n = self.position_dim();
        let dim = self.state_dim();
        let mut x = vec![0.0; dim];
        let mut dx = vec![0.0; dim];
        let mut ddx = vec![0.0; dim];
        self.get_state(&mut x[..n], &mut dx[..n], &mut ddx[..n])?;

        let mut weights = DVector::from_element(dim, 1.0);
        weights.rows_mut(n, dim - n).fill(settings.regularization);
        let mass_op = DiagonalMatrixFunction::new(weights);

        info!(
            masses = self.masses.len(),
            springs = self.springs.len(),
            joints = self.joints.len(),
            "Simulating mass-spring system"
        );
        let report = {
            let func = MassSpringFunction::new(self)?;
            integrator.simulate_constrained(
                t_end,
                steps,
                self.joints.len(),
                &mut x,
                &mut dx,
                &mut ddx,
                &func,
                &mass_op,
                |_, _| {},
            )?
        };

        self.set_state(&x[..n], &dx[..n], &ddx[..n])?;
        Ok(report)
    }
}

fn check_joint(joint: &Joint) -> Result<()> {
    if joint.connectors.iter().all(Connector::is_fix) {
        return Err(SimError::InvalidConfiguration(format!(
            "joint between {} and {} has no movable endpoint",
            joint.connectors[0], joint.connectors[1]
        )));
    }
    Ok(())
}

fn fmt_vector<const D: usize>(v: &SVector<f64, D>) -> String {
    let coords: Vec<String> = v.iter().map(|c| c.to_string()).collect();
    format!("({})", coords.join(", "))
}

impl<const D: usize> fmt::Display for MassSpringSystem<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "gravity = {}", fmt_vector(&self.gravity))?;
        writeln!(f, "fixes:")?;
        for (i, fix) in self.fixes.iter().enumerate() {
            writeln!(f, "  {i}: pos = {}", fmt_vector(&fix.pos))?;
        }
        writeln!(f, "masses:")?;
        for (i, m) in self.masses.iter().enumerate() {
            writeln!(
                f,
                "  {i}: m = {}, pos = {}, vel = {}, acc = {}",
                m.mass,
                fmt_vector(&m.pos),
                fmt_vector(&m.vel),
                fmt_vector(&m.acc)
            )?;
        }
        writeln!(f, "springs:")?;
        for (i, s) in self.springs.iter().enumerate() {
            writeln!(
                f,
                "  {i}: length = {}, stiffness = {}, {} - {}",
                s.length, s.stiffness, s.connectors[0], s.connectors[1]
            )?;
        }
        writeln!(f, "joints:")?;
        for (i, j) in self.joints.iter().enumerate() {
            writeln!(
                f,
                "  {i}: length = {}, {} - {}",
                j.length, j.connectors[0], j.connectors[1]
            )?;
        }
        Ok(())
    }
}

/// Net force per unit mass for every mass, followed by one constraint row
/// `|p1 - p2|^2 - L^2` per joint.
pub struct MassSpringFunction<'a, const D: usize> {
    system: &'a MassSpringSystem<D>,
}

impl<'a, const D: usize> MassSpringFunction<'a, D> {
    pub fn new(system: &'a MassSpringSystem<D>) -> Result<Self> {
        system.validate()?;
        Ok(Self { system })
    }

    fn dimension(&self) -> usize {
        self.system.state_dim()
    }

    fn position<T: Scalar>(&self, c: Connector, x: &[T]) -> [T; D] {
        match c.kind {
            ConnectorKind::Fix => {
                let pos = &self.system.fixes[c.index].pos;
                std::array::from_fn(|k| T::from(pos[k]))
            }
            ConnectorKind::Mass => std::array::from_fn(|k| x[D * c.index + k].clone()),
        }
    }
}

impl<const D: usize> GenericFunction for MassSpringFunction<'_, D> {
    fn dim_x(&self) -> usize {
        self.dimension()
    }

    fn dim_f(&self) -> usize {
        self.dimension()
    }

    fn evaluate_generic<T: Scalar>(&self, x: &[T], f: &mut [T]) -> Result<()> {
        let dim = self.dimension();
        check_len("mass-spring state", dim, x.len())?;
        check_len("mass-spring residual", dim, f.len())?;
        let sys = self.system;
        let n = sys.position_dim();

        for fi in f.iter_mut() {
            *fi = T::zero();
        }

        for (i, m) in sys.masses.iter().enumerate() {
            for k in 0..D {
                f[D * i + k] += T::from(m.mass * sys.gravity[k]);
            }
        }

        for (s, spring) in sys.springs.iter().enumerate() {
            let [c1, c2] = spring.connectors;
            let p1 = self.position(c1, x);
            let p2 = self.position(c2, x);
            let diff: [T; D] = std::array::from_fn(|k| p2[k].clone() - p1[k].clone());
            let mut dist2 = T::zero();
            for d in &diff {
                dist2 += d.clone() * d.clone();
            }
            if dist2.value() == 0.0 {
                return Err(SimError::DivisionByZero(format!(
                    "endpoints of spring {s} coincide"
                )));
            }
            let dist = dist2.sqrt();
            let force = (dist.clone() - T::from(spring.length)) * spring.stiffness;
            for (k, d) in diff.into_iter().enumerate() {
                let fk = force.clone() * d / dist.clone();
                if !c1.is_fix() {
                    f[D * c1.index + k] += fk.clone();
                }
                if !c2.is_fix() {
                    f[D * c2.index + k] -= fk;
                }
            }
        }

        for (j, joint) in sys.joints.iter().enumerate() {
            check_joint(joint)?;
            let [c1, c2] = joint.connectors;
            let lambda = x[n + j].clone();
            let p1 = self.position(c1, x);
            let p2 = self.position(c2, x);
            let mut dist2 = T::zero();
            for (k, (a, b)) in p1.into_iter().zip(p2).enumerate() {
                let d = a - b;
                let fk = lambda.clone() * d.clone() * 2.0;
                if !c1.is_fix() {
                    f[D * c1.index + k] += fk.clone();
                }
                if !c2.is_fix() {
                    f[D * c2.index + k] -= fk;
                }
                dist2 += d.clone() * d;
            }
            f[n + j] = dist2 - T::from(joint.length * joint.length);
        }

        for (i, m) in sys.masses.iter().enumerate() {
            for k in 0..D {
                f[D * i + k] = f[D * i + k].clone() / m.mass;
            }
        }
        Ok(())
    }
}

impl<const D: usize> NonlinearFunction for MassSpringFunction<'_, D> {
    fn dim_x(&self) -> usize {
        self.dimension()
    }

    fn dim_f(&self) -> usize {
        self.dimension()
    }

    fn evaluate(&self, x: &[f64], f: &mut [f64]) -> Result<()> {
        self.evaluate_generic(x, f)
    }

    fn evaluate_deriv(&self, x: &[f64], df: &mut DMatrix<f64>) -> Result<()> {
        jacobian_via_dual(self, x, df)
    }
}
