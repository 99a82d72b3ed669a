pub mod butcher;
pub mod extrapolation;
pub mod semi_implicit;
mod tableaus;

pub use butcher::{ButcherSolver, ButcherStepper, ButcherTableau};
pub use extrapolation::{ExtrapolationSolver, ExtrapolationStepper};
pub use semi_implicit::{CorrectorSettings, KdSolver, KdStepper};

use crate::equation::EquationSystem;
use crate::error::SolveError;
use crate::state::DynamicSystemState;
use crate::step::{Step, StepSource};
use crate::traits::{DynamicSystemSolver, Steppable};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Static metadata describing a stepping algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverDescription {
    pub name: String,
    /// Global convergence order.
    pub order: u32,
    /// Whether each step runs a corrector loop.
    pub implicit: bool,
    /// Whether the error expansion contains only even powers of the step.
    pub symmetric: bool,
}

/// Per-step diagnostics returned alongside every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    /// `false` if any corrector loop stopped at its iteration cap.
    pub converged: bool,
    /// Largest number of corrector iterations used by a single equation.
    pub corrector_iterations: usize,
}

impl Default for StepReport {
    fn default() -> Self {
        Self {
            converged: true,
            corrector_iterations: 0,
        }
    }
}

impl StepReport {
    pub fn merge(self, other: StepReport) -> StepReport {
        StepReport {
            converged: self.converged && other.converged,
            corrector_iterations: self.corrector_iterations.max(other.corrector_iterations),
        }
    }
}

/// One element of a solve.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub state: DynamicSystemState,
    pub delta: f64,
    pub report: StepReport,
}

/// Lazy, unbounded, forward-only sequence of states produced by a solve.
///
/// The initial state is not repeated; the first element is the state after
/// the first step. Consumers bound the work by stopping iteration.
pub struct Trajectory<S, I> {
    stepper: S,
    steps: I,
    names: Arc<[String]>,
    values: Vec<f64>,
}

impl<S, I> Trajectory<S, I>
where
    S: Steppable,
    I: Iterator<Item = Step>,
{
    /// Drops the per-step diagnostics.
    pub fn states(self) -> impl Iterator<Item = DynamicSystemState> {
        self.map(|record| record.state)
    }

    /// Yields states up to and including the step that reaches `end`.
    pub fn until(self, end: f64) -> impl Iterator<Item = StepRecord> {
        self.take_while(move |record| record.state.independent() <= end + 0.5 * record.delta)
    }

    /// Variable names of every emitted state, in system declaration order.
    pub fn variables(&self) -> &[String] {
        &self.names
    }
}

impl<S, I> Iterator for Trajectory<S, I>
where
    S: Steppable,
    I: Iterator<Item = Step>,
{
    type Item = StepRecord;

    fn next(&mut self) -> Option<StepRecord> {
        let step = self.steps.next()?;
        let report = self.stepper.step(&mut self.values, step.delta);
        Some(StepRecord {
            state: DynamicSystemState::from_parts(
                step.value,
                Arc::clone(&self.names),
                &self.values,
            ),
            delta: step.delta,
            report,
        })
    }
}

/// Checks solve preconditions and prepares the stepper; no step runs here.
pub(crate) fn start<D, P>(
    solver: &D,
    system: &EquationSystem,
    initial: &DynamicSystemState,
    steps: &P,
) -> Result<Trajectory<D::Stepper, P::Stepper>, SolveError>
where
    D: DynamicSystemSolver + ?Sized,
    P: StepSource,
{
    let values = initial
        .values_in_order(system.variables())
        .ok_or_else(|| SolveError::VariableMismatch {
            expected: system.variables().to_vec(),
            found: initial.names().to_vec(),
        })?;
    let steps = steps.create(initial.independent())?;
    let stepper = solver
        .prepare(system)
        .context("Failed to prepare solver")?;

    log::debug!(
        "starting {} over {} variables at t0 = {}",
        solver.description().name,
        system.dimension(),
        initial.independent()
    );

    Ok(Trajectory {
        stepper,
        steps,
        names: system.shared_variables(),
        values,
    })
}
