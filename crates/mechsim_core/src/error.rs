use thiserror::Error;

/// Failures reported by the residual, solver and integrator layers.
///
/// Shape problems are programming errors, configuration problems are caught before
/// any solve starts, and the two numerical variants are kept apart so a caller can
/// retry a non-converged step with a smaller step size while treating a singular
/// system as fatal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    #[error("dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("division by zero: {0}")]
    DivisionByZero(String),

    #[error("singular matrix: {0}")]
    SingularMatrix(String),

    #[error("Newton solver failed to converge in {iterations} steps (‖F(x)‖ = {residual_norm:e})")]
    NotConverged { iterations: usize, residual_norm: f64 },
}

pub type Result<T> = std::result::Result<T, SimError>;

pub(crate) fn check_len(context: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(SimError::DimensionMismatch {
            context,
            expected,
            actual,
        });
    }
    Ok(())
}

pub(crate) fn check_shape(
    context: &'static str,
    matrix: &nalgebra::DMatrix<f64>,
    rows: usize,
    cols: usize,
) -> Result<()> {
    check_len(context, rows, matrix.nrows())?;
    check_len(context, cols, matrix.ncols())
}
