use crate::equation::EquationSystem;
use crate::state::DynamicSystemState;
use crate::step::FixedStepSource;
use crate::traits::DynamicSystemSolver;

/// `x1' = -x1 - 2 x2`, `x2' = 3 x1 - 4 x2`.
pub fn linear_system() -> EquationSystem {
    EquationSystem::parse(["x1' = -x1 - 2*x2", "x2' = 3*x1 - 4*x2"])
        .expect("linear test system should validate")
}

pub fn initial_state() -> DynamicSystemState {
    DynamicSystemState::at(0.0, [("x1", 1.0), ("x2", 2.0)])
}

/// Closed-form solution of [`linear_system`] from [`initial_state`].
pub fn exact(t: f64) -> [f64; 2] {
    let w = 15f64.sqrt() / 2.0;
    let decay = (-2.5 * t).exp();
    [
        -decay / 3.0 * (15f64.sqrt() * (w * t).sin() - 3.0 * (w * t).cos()),
        2.0 * decay * (w * t).cos(),
    ]
}

/// Largest absolute deviation from the exact solution over `steps` steps of
/// size `h`.
pub fn max_error<D: DynamicSystemSolver>(solver: &D, h: f64, steps: usize) -> f64 {
    solver
        .solve(&linear_system(), &initial_state(), &FixedStepSource::new(h))
        .expect("solve should start")
        .take(steps)
        .map(|record| {
            let expected = exact(record.state.independent());
            let x1 = record.state.get("x1").expect("x1 present");
            let x2 = record.state.get("x2").expect("x2 present");
            (x1 - expected[0]).abs().max((x2 - expected[1]).abs())
        })
        .fold(0.0, f64::max)
}

/// Ratio of the error at step `2h` to the error at `h` over the same horizon.
pub fn error_ratio<D: DynamicSystemSolver>(solver: &D, h: f64, steps: usize) -> f64 {
    max_error(solver, 2.0 * h, steps / 2) / max_error(solver, h, steps)
}

pub fn assert_err_contains<T: std::fmt::Debug>(result: anyhow::Result<T>, needle: &str) {
    let err = result.expect_err("expected error");
    let message = format!("{err:#}");
    assert!(
        message.contains(needle),
        "expected error to contain \"{needle}\", got \"{message}\""
    );
}
