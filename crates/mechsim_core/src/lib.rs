//! The `mechsim_core` crate provides a small numerical simulation engine.
//! Residuals are written once over a generic scalar type and evaluated either with `f64`
//! or with dual numbers, which yields exact Jacobians for the implicit solvers.
//!
//! Key components:
//! - **Traits**: `Scalar`, `NonlinearFunction` (residual plus Jacobian), `GenericFunction`, `TimeStepper`.
//! - **Autodiff**: run-time sized dual numbers, `jacobian_via_dual` and the `Autodiff` wrapper.
//! - **Newton**: dense Newton solver with LU linear solves.
//! - **Solvers**: explicit/improved/implicit Euler, Crank-Nicolson, explicit and implicit Runge-Kutta.
//! - **Collocation**: Butcher tableaux from collocation nodes (Gauss-Legendre, Radau IIA).
//! - **Alpha**: generalized-alpha and Newmark integration of `M(x'') = F(x)`.
//! - **Mass-spring**: masses, fixes, springs and distance joints with Lagrange multipliers.
pub mod alpha;
pub mod autodiff;
pub mod collocation;
pub mod error;
pub mod functions;
pub mod mass_spring;
pub mod newton;
pub mod solvers;
pub mod traits;
pub mod trajectory;

pub use error::{Result, SimError};
