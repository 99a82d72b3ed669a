use crate::error::SolveError;
use serde::{Deserialize, Serialize};

/// One increment of the independent variable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Step size.
    pub delta: f64,
    /// Independent-variable value reached after the step.
    pub value: f64,
}

/// Supplies the sequence of steps a solver walks through.
pub trait StepSource {
    type Stepper: Iterator<Item = Step>;

    /// Starts a step sequence at `initial`, rejecting invalid parameters
    /// before any step is produced.
    fn create(&self, initial: f64) -> Result<Self::Stepper, SolveError>;
}

/// Constant step size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FixedStepSource {
    pub delta: f64,
}

impl FixedStepSource {
    pub fn new(delta: f64) -> Self {
        Self { delta }
    }
}

impl StepSource for FixedStepSource {
    type Stepper = FixedStepper;

    fn create(&self, initial: f64) -> Result<FixedStepper, SolveError> {
        if !(self.delta > 0.0 && self.delta.is_finite()) {
            return Err(SolveError::NonPositiveStep(self.delta));
        }
        Ok(FixedStepper {
            initial,
            delta: self.delta,
            taken: 0,
        })
    }
}

/// Unbounded iterator of equally sized steps.
///
/// The `k`-th value is computed as `initial + k * delta` so long runs do not
/// accumulate rounding drift.
#[derive(Debug, Clone)]
pub struct FixedStepper {
    initial: f64,
    delta: f64,
    taken: u64,
}

impl Iterator for FixedStepper {
    type Item = Step;

    fn next(&mut self) -> Option<Step> {
        self.taken += 1;
        Some(Step {
            delta: self.delta,
            value: self.initial + self.taken as f64 * self.delta,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (usize::MAX, None)
    }
}
