use super::{SolverDescription, StepReport};
use crate::equation::EquationSystem;
use crate::traits::{DynamicSystemSolver, Steppable};
use anyhow::{bail, Result};

/// Richardson extrapolation over any base solver.
///
/// Each output step of size `H` runs the base method with `c = 1..=n`
/// substeps of size `H / c` from the same state and combines the results
/// with an Aitken-Neville table built on the base order.
#[derive(Debug, Clone)]
pub struct ExtrapolationSolver<S> {
    base: S,
    stages: usize,
}

impl<S: DynamicSystemSolver> ExtrapolationSolver<S> {
    pub fn new(base: S, stages: usize) -> Result<Self> {
        if stages == 0 {
            bail!("Extrapolation needs at least one stage.");
        }
        Ok(Self { base, stages })
    }

    pub fn base(&self) -> &S {
        &self.base
    }

    pub fn stages(&self) -> usize {
        self.stages
    }
}

/// Effective order after eliminating `stages - 1` error terms of a base
/// method of order `base`.
fn extrapolated_order(base: u32, stages: usize, symmetric: bool) -> u32 {
    let n = stages as u32;
    match (n, symmetric, base) {
        (1, _, p) => p,
        (n, true, 2) => 2 * n,
        (_, true, p) => p + 2,
        (n, false, 1) => n,
        (_, false, p) => p + 1,
    }
}

impl<S: DynamicSystemSolver> DynamicSystemSolver for ExtrapolationSolver<S> {
    type Stepper = ExtrapolationStepper<S::Stepper>;

    fn description(&self) -> SolverDescription {
        let base = self.base.description();
        SolverDescription {
            name: format!("{} extrapolated x{}", base.name, self.stages),
            order: extrapolated_order(base.order, self.stages, base.symmetric),
            implicit: base.implicit,
            symmetric: base.symmetric && self.stages == 1,
        }
    }

    fn prepare(&self, system: &EquationSystem) -> Result<Self::Stepper> {
        let base_order = self.base.description().order;
        if base_order == 0 {
            bail!("Base solver must declare a positive order.");
        }
        let base = self.base.prepare(system)?;
        Ok(ExtrapolationStepper {
            base,
            base_order: base_order as i32,
            table: vec![vec![0.0; system.dimension()]; self.stages],
        })
    }
}

/// One prepared base stepper reused for every subdivision run.
#[derive(Debug, Clone)]
pub struct ExtrapolationStepper<T> {
    base: T,
    base_order: i32,
    table: Vec<Vec<f64>>,
}

impl<T: Steppable> Steppable for ExtrapolationStepper<T> {
    fn step(&mut self, state: &mut [f64], dt: f64) -> StepReport {
        let n = self.table.len();
        let mut report = StepReport::default();

        for (row, values) in self.table.iter_mut().enumerate() {
            let substeps = row + 1;
            let h = dt / substeps as f64;
            values.copy_from_slice(state);
            for _ in 0..substeps {
                report = report.merge(self.base.step(values, h));
            }
        }

        // T[j][k+1] = T[j][k] + (T[j][k] - T[j-1][k]) / ((c_j / c_{j-k-1})^p - 1),
        // updated in place from the bottom so T[j-1][k] is still available.
        for var in 0..state.len() {
            for k in 0..n.saturating_sub(1) {
                for j in (k + 1..n).rev() {
                    let ratio = (j + 1) as f64 / (j - k) as f64;
                    let denominator = ratio.powi(self.base_order) - 1.0;
                    let delta = self.table[j][var] - self.table[j - 1][var];
                    self.table[j][var] += delta / denominator;
                }
            }
            state[var] = self.table[n - 1][var];
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solvers::{ButcherSolver, KdSolver};
    use crate::state::DynamicSystemState;
    use crate::step::FixedStepSource;
    use crate::test_support::{
        assert_err_contains, error_ratio, initial_state, linear_system, max_error,
    };
    use approx::assert_relative_eq;

    fn declared<S: DynamicSystemSolver>(base: S, stages: usize) -> u32 {
        ExtrapolationSolver::new(base, stages)
            .unwrap()
            .description()
            .order
    }

    #[test]
    fn declared_order_follows_base_properties() {
        assert_eq!(declared(ButcherSolver::euler(), 3), 3);
        assert_eq!(declared(ButcherSolver::rk4(), 1), 4);
        assert_eq!(declared(ButcherSolver::rk4(), 2), 5);
        assert_eq!(declared(KdSolver::new(), 2), 4);
        assert_eq!(declared(KdSolver::new(), 3), 6);

        let wrapped = ExtrapolationSolver::new(KdSolver::new(), 2).unwrap().description();
        assert!(wrapped.implicit);
        assert!(!wrapped.symmetric);
    }

    #[test]
    fn single_stage_reproduces_the_base_solver() {
        let system = linear_system();
        let steps = FixedStepSource::new(0.05);
        let base: Vec<_> = ButcherSolver::midpoint()
            .solve(&system, &initial_state(), &steps)
            .unwrap()
            .states()
            .take(40)
            .collect();
        let wrapped: Vec<_> = ExtrapolationSolver::new(ButcherSolver::midpoint(), 1)
            .unwrap()
            .solve(&system, &initial_state(), &steps)
            .unwrap()
            .states()
            .take(40)
            .collect();
        assert_eq!(base, wrapped);
    }

    #[test]
    fn max_error_is_bounded_by_declared_order() {
        fn check<S: DynamicSystemSolver>(solver: S, h: f64) {
            let description = solver.description();
            let error = max_error(&solver, h, 1000);
            assert!(
                error <= 2.0 * h.powi(description.order as i32),
                "{}: error {error:e} exceeds 2 h^{} for h = {h}",
                description.name,
                description.order
            );
        }
        check(ExtrapolationSolver::new(ButcherSolver::euler(), 3).unwrap(), 0.01);
        check(ExtrapolationSolver::new(KdSolver::new(), 2).unwrap(), 0.01);
        check(ExtrapolationSolver::new(ButcherSolver::rk4(), 2).unwrap(), 0.02);
        check(ExtrapolationSolver::new(KdSolver::new(), 3).unwrap(), 0.02);
    }

    #[test]
    fn measured_order_matches_declared_order() {
        fn check<S: DynamicSystemSolver>(solver: S, h: f64) {
            let expected = 2f64.powi(solver.description().order as i32);
            let ratio = error_ratio(&solver, h, 1000);
            assert_relative_eq!(ratio, expected, max_relative = 0.05);
        }
        check(ExtrapolationSolver::new(ButcherSolver::euler(), 3).unwrap(), 0.005);
        check(ExtrapolationSolver::new(KdSolver::new(), 2).unwrap(), 0.01);
        check(ExtrapolationSolver::new(KdSolver::new(), 3).unwrap(), 0.01);
        check(ExtrapolationSolver::new(ButcherSolver::rk4(), 2).unwrap(), 0.01);
    }

    #[test]
    fn wrappers_nest() {
        let inner = ExtrapolationSolver::new(ButcherSolver::euler(), 2).unwrap();
        let outer = ExtrapolationSolver::new(inner, 2).unwrap();
        assert_eq!(outer.description().order, 3);

        let ratio = error_ratio(&outer, 0.005, 1000);
        assert_relative_eq!(ratio, 8.0, max_relative = 0.05);
    }

    #[test]
    fn extrapolation_beats_its_base() {
        let base = max_error(&ButcherSolver::euler(), 0.01, 1000);
        let wrapped = ExtrapolationSolver::new(ButcherSolver::euler(), 3).unwrap();
        let wrapped = max_error(&wrapped, 0.01, 1000);
        assert!(wrapped * 100.0 < base, "base {base:e}, wrapped {wrapped:e}");
    }

    #[test]
    fn solves_are_deterministic_across_threads() {
        let run = || -> Vec<(Vec<f64>, StepReport)> {
            let system =
                EquationSystem::parse(["theta' = omega", "omega' = -sin(theta)"]).unwrap();
            let state = DynamicSystemState::at(0.0, [("theta", 2.0), ("omega", 0.5)]);
            ExtrapolationSolver::new(KdSolver::new(), 3)
                .unwrap()
                .solve(&system, &state, &FixedStepSource::new(0.1))
                .unwrap()
                .take(100)
                .map(|record| (record.state.values().to_vec(), record.report))
                .collect()
        };
        let here = run();
        let there = std::thread::spawn(run).join().expect("thread should finish");
        assert_eq!(here, run());
        assert_eq!(here, there);
    }

    #[test]
    fn rejects_zero_stages() {
        assert_err_contains(
            ExtrapolationSolver::new(ButcherSolver::rk4(), 0),
            "at least one stage",
        );
    }
}
