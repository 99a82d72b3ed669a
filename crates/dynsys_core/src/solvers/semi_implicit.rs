use super::{SolverDescription, StepReport};
use crate::equation::EquationSystem;
use crate::executable::{EvaluationStrategy, ExecutableSystem, JacobianMap};
use crate::traits::{DynamicSystemSolver, DynamicalSystem, Steppable};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Newton corrector limits shared by every equation of a step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrectorSettings {
    pub max_iterations: usize,
    /// Convergence threshold, scaled by the half-step size.
    pub tolerance: f64,
}

impl Default for CorrectorSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            tolerance: 1e-10,
        }
    }
}

impl CorrectorSettings {
    fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            bail!("max_iterations must be greater than zero.");
        }
        if !(self.tolerance > 0.0 && self.tolerance.is_finite()) {
            bail!("Corrector tolerance must be positive and finite, got {}.", self.tolerance);
        }
        Ok(())
    }
}

/// Symmetric two-half-step scheme: an explicit Gauss-Seidel sweep forward
/// over the equations, then an implicit sweep backward whose scalar
/// equations are solved by Newton iteration on the Jacobian diagonal.
#[derive(Debug, Clone, Default)]
pub struct KdSolver {
    settings: CorrectorSettings,
    strategy: EvaluationStrategy,
}

impl KdSolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(mut self, settings: CorrectorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_strategy(mut self, strategy: EvaluationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn settings(&self) -> CorrectorSettings {
        self.settings
    }
}

impl DynamicSystemSolver for KdSolver {
    type Stepper = KdStepper;

    fn description(&self) -> SolverDescription {
        SolverDescription {
            name: "KD semi-implicit".to_string(),
            order: 2,
            implicit: true,
            symmetric: true,
        }
    }

    fn prepare(&self, system: &EquationSystem) -> Result<KdStepper> {
        self.settings.validate()?;
        let executable = ExecutableSystem::build(system, self.strategy)?;
        let jacobian = JacobianMap::build(system, self.strategy)?;
        let dim = executable.dimension();
        Ok(KdStepper {
            system: executable,
            jacobian: Arc::new(jacobian),
            settings: self.settings,
            first_half: vec![0.0; dim],
            args: vec![0.0; dim],
        })
    }
}

#[derive(Debug, Clone)]
pub struct KdStepper {
    system: ExecutableSystem,
    jacobian: Arc<JacobianMap>,
    settings: CorrectorSettings,
    first_half: Vec<f64>,
    args: Vec<f64>,
}

impl KdStepper {
    pub fn jacobian(&self) -> &JacobianMap {
        &self.jacobian
    }

    /// Solves `x = first_half[i] + h f_i(x, others)` for equation `i`,
    /// leaving the solution in `args[i]`.
    fn correct(&mut self, i: usize, h: f64) -> (bool, usize) {
        let target = self.first_half[i];
        let diagonal = self.jacobian.entry(i, i);
        let threshold = self.settings.tolerance * h.abs();

        let mut x = target;
        for iteration in 1..=self.settings.max_iterations {
            self.args[i] = x;
            let residual = x - target - h * self.system.apply_one(i, &self.args);
            let slope = 1.0 - h * diagonal.evaluate(&self.args);
            let next = x - residual / slope;
            // NaN never satisfies the comparison, so it runs to the cap.
            if (next - x).abs() <= threshold {
                self.args[i] = next;
                return (true, iteration);
            }
            x = next;
        }
        self.args[i] = x;
        (false, self.settings.max_iterations)
    }
}

impl Steppable for KdStepper {
    fn step(&mut self, state: &mut [f64], dt: f64) -> StepReport {
        let h = 0.5 * dt;
        let dim = state.len();

        // Explicit half: equations below i already see their new values.
        self.args.copy_from_slice(state);
        for i in 0..dim {
            self.first_half[i] = state[i] + h * self.system.apply_one(i, &self.args);
            self.args[i] = self.first_half[i];
        }

        // Implicit half, reverse order: equations above i are already final.
        let mut report = StepReport::default();
        for i in (0..dim).rev() {
            let (converged, iterations) = self.correct(i, h);
            if !converged {
                log::warn!(
                    "Newton corrector for equation {} stopped after {} iterations without converging",
                    self.system.variables()[i],
                    iterations
                );
            }
            report = report.merge(StepReport {
                converged,
                corrector_iterations: iterations,
            });
        }

        state.copy_from_slice(&self.args);
        report
    }
}
