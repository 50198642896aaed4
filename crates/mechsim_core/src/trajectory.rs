use crate::error::{Result, SimError};
use crate::traits::TimeStepper;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Sampled solution of a fixed-step run. `states[i]` is the state at `times[i]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub times: Vec<f64>,
    pub states: Vec<Vec<f64>>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn last_state(&self) -> Option<&[f64]> {
        self.states.last().map(Vec::as_slice)
    }

    /// One line per sample: `t  y0 y1 ...`.
    pub fn write_to<W: Write>(&self, mut out: W) -> anyhow::Result<()> {
        for (t, state) in self.times.iter().zip(&self.states) {
            write!(out, "{t} ").context("Failed to write trajectory time")?;
            for y in state {
                write!(out, " {y}").context("Failed to write trajectory state")?;
            }
            writeln!(out).context("Failed to write trajectory line")?;
        }
        out.flush().context("Failed to flush trajectory output")?;
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create trajectory file {}", path.display()))?;
        self.write_to(BufWriter::new(file))
            .with_context(|| format!("Failed to save trajectory to {}", path.display()))
    }
}

/// Runs `stepper` for `steps` equal steps over `[0, t_end]` starting at `y0`.
/// The initial state is recorded as the first sample.
pub fn record_trajectory<S: TimeStepper + ?Sized>(
    stepper: &mut S,
    t_end: f64,
    steps: usize,
    y0: &[f64],
) -> Result<Trajectory> {
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

    let h = t_end / steps as f64;
    info!(t_end, steps, h, dim = y0.len(), "Recording trajectory");

    let mut trajectory = Trajectory {
        times: Vec::with_capacity(steps + 1),
        states: Vec::with_capacity(steps + 1),
    };
    let mut y = y0.to_vec();
    trajectory.times.push(0.0);
    trajectory.states.push(y.clone());

    for i in 1..=steps {
        stepper.advance(h, &mut y)?;
        trajectory.times.push(i as f64 * h);
        trajectory.states.push(y.clone());
    }
    Ok(trajectory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::HarmonicOscillator;
    use crate::solvers::{CrankNicolson, ExplicitEuler};
    use approx::assert_abs_diff_eq;

    #[test]
    fn records_every_step_including_start() {
        let osc = HarmonicOscillator::new(1.0, 1.0).unwrap();
        let mut stepper = CrankNicolson::new(&osc);
        let traj = record_trajectory(&mut stepper, 1.0, 10, &[1.0, 0.0]).unwrap();

        assert_eq!(traj.len(), 11);
        assert_eq!(traj.states[0], vec![1.0, 0.0]);
        assert_abs_diff_eq!(traj.times[10], 1.0, epsilon = 1e-14);

        let last = traj.last_state().unwrap();
        let exact = osc.exact(1.0, 1.0, 0.0);
        assert_abs_diff_eq!(last[0], exact[0], epsilon = 5e-3);
        assert_abs_diff_eq!(last[1], exact[1], epsilon = 5e-3);
    }

    #[test]
    fn writes_one_line_per_sample() {
        let osc = HarmonicOscillator::new(1.0, 1.0).unwrap();
        let mut stepper = ExplicitEuler::new(&osc);
        let traj = record_trajectory(&mut stepper, 0.5, 5, &[1.0, 0.0]).unwrap();

        let mut buf = Vec::new();
        traj.write_to(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0], "0  1 0");
        assert_eq!(lines[1].split_whitespace().count(), 3);
    }

    #[test]
    fn rejects_empty_runs() {
        let osc = HarmonicOscillator::new(1.0, 1.0).unwrap();
        let mut stepper = ExplicitEuler::new(&osc);
        let err = record_trajectory(&mut stepper, 1.0, 0, &[1.0, 0.0]).expect_err("no steps");
        assert!(matches!(err, SimError::InvalidConfiguration(_)));

        let err = record_trajectory(&mut stepper, -1.0, 4, &[1.0, 0.0]).expect_err("negative end");
        assert!(matches!(err, SimError::InvalidConfiguration(_)));
    }

    #[test]
    fn save_reports_missing_directory() {
        let traj = Trajectory::default();
        let err = traj
            .save("/nonexistent-directory/trajectory.txt")
            .expect_err("missing directory");
        assert!(format!("{err}").contains("Failed to create trajectory file"));
    }
}
