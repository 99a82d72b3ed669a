//! The `dynsys_core` crate integrates systems of explicit first-order ODEs
//! step by step.
//!
//! Key components:
//! - **Equation model**: `EquationSystem` validates parsed `x' = f(...)`
//!   statements; `DynamicSystemState` is the immutable per-step snapshot.
//! - **Equation Engine**: parser, symbolic derivative and a bytecode VM that
//!   back the callable right-hand sides and Jacobian entries in `executable`.
//! - **Solvers**: explicit Butcher-tableau methods, the semi-implicit KD
//!   scheme and a Richardson extrapolation wrapper, all behind
//!   `DynamicSystemSolver`, which yields a lazy unbounded `Trajectory`.
pub mod derivative;
pub mod equation;
pub mod equation_engine;
pub mod error;
pub mod executable;
pub mod solvers;
pub mod state;
pub mod step;
pub mod traits;

#[cfg(test)]
mod test_support;

pub use equation::{Equation, EquationSystem, LeadingDerivative};
pub use error::{FormatError, SolveError};
pub use executable::{EvaluationStrategy, JacobianMap};
pub use solvers::{
    ButcherSolver, ButcherTableau, CorrectorSettings, ExtrapolationSolver, KdSolver,
    SolverDescription, StepRecord, StepReport, Trajectory,
};
pub use state::DynamicSystemState;
pub use step::{FixedStepSource, Step, StepSource};
pub use traits::{DynamicSystemSolver, DynamicalSystem, NumericFunction, Steppable};
