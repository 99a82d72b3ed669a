use crate::equation::EquationSystem;
use crate::error::SolveError;
use crate::solvers::{self, SolverDescription, StepReport, Trajectory};
use crate::state::DynamicSystemState;
use crate::step::StepSource;
use anyhow::Result;

/// Represents an autonomous first-order vector field `x' = f(x)`.
pub trait DynamicalSystem {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the right-hand side of equation `index` at `x`.
    fn apply_one(&self, index: usize, x: &[f64]) -> f64;

    /// Evaluates every right-hand side at `x` into `out`.
    fn apply(&self, x: &[f64], out: &mut [f64]) {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.apply_one(i, x);
        }
    }
}

/// A callable numeric function produced from an expression.
///
/// Arguments are passed positionally, in the order reported by
/// [`NumericFunction::ordered_arguments`].
pub trait NumericFunction: Send + Sync {
    fn execute(&self, args: &[f64]) -> f64;

    fn ordered_arguments(&self) -> &[String];
}

/// A prepared integrator that can step a state vector forward.
pub trait Steppable {
    /// Advances `state` (in system declaration order) by one step of size `dt`.
    fn step(&mut self, state: &mut [f64], dt: f64) -> StepReport;
}

/// Uniform entry point shared by every stepping algorithm.
pub trait DynamicSystemSolver {
    type Stepper: Steppable;

    fn description(&self) -> SolverDescription;

    /// Builds everything a run needs (callable functions, Jacobian, scratch
    /// buffers) for `system`. Called once per solve.
    fn prepare(&self, system: &EquationSystem) -> Result<Self::Stepper>;

    /// Returns the lazy, unbounded sequence of states starting after
    /// `initial`. Preconditions are checked before any step executes.
    fn solve<P: StepSource>(
        &self,
        system: &EquationSystem,
        initial: &DynamicSystemState,
        steps: &P,
    ) -> Result<Trajectory<Self::Stepper, P::Stepper>, SolveError>
    where
        Self: Sized,
    {
        solvers::start(self, system, initial, steps)
    }
}
