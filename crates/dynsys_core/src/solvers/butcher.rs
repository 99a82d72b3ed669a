use super::tableaus::{self, StaticTableau};
use super::{SolverDescription, StepReport};
use crate::equation::EquationSystem;
use crate::executable::{EvaluationStrategy, ExecutableSystem};
use crate::traits::{DynamicSystemSolver, DynamicalSystem, Steppable};
use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use std::sync::Arc;

/// Coefficients `(A, B)` of an explicit Runge-Kutta method.
///
/// `A` is strictly lower triangular, so every stage only depends on the
/// stages before it. The declared order is metadata and is not checked
/// against the coefficients.
#[derive(Debug, Clone, PartialEq)]
pub struct ButcherTableau {
    name: String,
    order: u32,
    a: DMatrix<f64>,
    b: DVector<f64>,
}

impl ButcherTableau {
    pub fn new(
        name: impl Into<String>,
        order: u32,
        a: DMatrix<f64>,
        b: DVector<f64>,
    ) -> Result<Self> {
        let stages = a.nrows();
        if stages == 0 {
            bail!("Tableau must have at least one stage.");
        }
        if a.ncols() != stages {
            bail!("Stage matrix must be square, got {}x{}.", stages, a.ncols());
        }
        if b.len() != stages {
            bail!(
                "Weight vector length mismatch. Expected {}, got {}.",
                stages,
                b.len()
            );
        }
        if order == 0 {
            bail!("Order must be positive.");
        }
        for row in 0..stages {
            for col in row..stages {
                if a[(row, col)] != 0.0 {
                    bail!(
                        "Stage matrix must be strictly lower triangular; entry ({}, {}) is {}.",
                        row,
                        col,
                        a[(row, col)]
                    );
                }
            }
        }
        if a.iter().chain(b.iter()).any(|v| !v.is_finite()) {
            bail!("Tableau coefficients must be finite.");
        }
        Ok(Self {
            name: name.into(),
            order,
            a,
            b,
        })
    }

    /// Builds a tableau from the below-diagonal part of each stage row.
    pub fn from_rows(
        name: impl Into<String>,
        order: u32,
        rows: &[&[f64]],
        weights: &[f64],
    ) -> Result<Self> {
        let stages = rows.len();
        for (stage, row) in rows.iter().enumerate() {
            if row.len() > stage {
                bail!(
                    "Stage {} may only reference {} earlier stages, got {} coefficients.",
                    stage,
                    stage,
                    row.len()
                );
            }
        }
        Self::new(
            name,
            order,
            lower_triangular(rows, stages),
            DVector::from_column_slice(weights),
        )
    }

    fn from_static(table: &StaticTableau) -> Self {
        Self {
            name: table.name.to_string(),
            order: table.order,
            a: lower_triangular(table.a, table.b.len()),
            b: DVector::from_column_slice(table.b),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    pub fn stages(&self) -> usize {
        self.b.len()
    }

    pub fn a(&self) -> &DMatrix<f64> {
        &self.a
    }

    pub fn b(&self) -> &DVector<f64> {
        &self.b
    }
}

fn lower_triangular(rows: &[&[f64]], stages: usize) -> DMatrix<f64> {
    DMatrix::from_fn(stages, stages, |i, j| {
        rows.get(i).and_then(|row| row.get(j)).copied().unwrap_or(0.0)
    })
}

/// Explicit Runge-Kutta solver driven entirely by a [`ButcherTableau`].
#[derive(Debug, Clone)]
pub struct ButcherSolver {
    tableau: Arc<ButcherTableau>,
    strategy: EvaluationStrategy,
}

impl ButcherSolver {
    pub fn new(tableau: ButcherTableau) -> Self {
        Self {
            tableau: Arc::new(tableau),
            strategy: EvaluationStrategy::default(),
        }
    }

    fn builtin(table: &StaticTableau) -> Self {
        Self::new(ButcherTableau::from_static(table))
    }

    pub fn euler() -> Self {
        Self::builtin(&tableaus::EULER)
    }

    pub fn midpoint() -> Self {
        Self::builtin(&tableaus::MIDPOINT)
    }

    pub fn rk4() -> Self {
        Self::builtin(&tableaus::RK4)
    }

    /// Dormand-Prince 5 (7 stages).
    pub fn dormand_prince5() -> Self {
        Self::builtin(&tableaus::DORMAND_PRINCE5)
    }

    /// Prince-Dormand 8(7) stages with the 7th-order weights (13 stages).
    pub fn dormand_prince7() -> Self {
        Self::builtin(&tableaus::DORMAND_PRINCE7)
    }

    /// Prince-Dormand 8(7) stages with the 8th-order weights (13 stages).
    pub fn dormand_prince8() -> Self {
        Self::builtin(&tableaus::DORMAND_PRINCE8)
    }

    /// Hairer's DOP853 (12 stages, order 8).
    pub fn dop853() -> Self {
        Self::builtin(&tableaus::DOP853)
    }

    /// Fehlberg 7(8) stages with the 7th-order weights (13 stages).
    pub fn fehlberg7() -> Self {
        Self::builtin(&tableaus::FEHLBERG7)
    }

    /// Fehlberg 7(8) stages with the 8th-order weights (13 stages).
    pub fn fehlberg8() -> Self {
        Self::builtin(&tableaus::FEHLBERG8)
    }

    pub fn with_strategy(mut self, strategy: EvaluationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn tableau(&self) -> &ButcherTableau {
        &self.tableau
    }
}

impl DynamicSystemSolver for ButcherSolver {
    type Stepper = ButcherStepper;

    fn description(&self) -> SolverDescription {
        SolverDescription {
            name: self.tableau.name.clone(),
            order: self.tableau.order,
            implicit: false,
            symmetric: false,
        }
    }

    fn prepare(&self, system: &EquationSystem) -> Result<ButcherStepper> {
        let system = ExecutableSystem::build(system, self.strategy)?;
        let dim = system.dimension();
        Ok(ButcherStepper {
            k: vec![vec![0.0; dim]; self.tableau.stages()],
            arg: vec![0.0; dim],
            tableau: Arc::clone(&self.tableau),
            system,
        })
    }
}

/// Prepared state of a [`ButcherSolver`] run: callable right-hand sides plus
/// one slope buffer per stage.
#[derive(Debug, Clone)]
pub struct ButcherStepper {
    tableau: Arc<ButcherTableau>,
    system: ExecutableSystem,
    k: Vec<Vec<f64>>,
    arg: Vec<f64>,
}

impl Steppable for ButcherStepper {
    fn step(&mut self, state: &mut [f64], dt: f64) -> StepReport {
        let a = &self.tableau.a;
        let b = &self.tableau.b;
        let stages = b.len();

        for s in 0..stages {
            // arg = x + dt * sum_{j<s} a[s][j] k[j]
            for (i, slot) in self.arg.iter_mut().enumerate() {
                let mut acc = 0.0;
                for j in 0..s {
                    acc += a[(s, j)] * self.k[j][i];
                }
                *slot = state[i] + dt * acc;
            }
            self.system.apply(&self.arg, &mut self.k[s]);
        }

        // x_next = x + dt * sum_s b[s] k[s]
        for (i, value) in state.iter_mut().enumerate() {
            let mut acc = 0.0;
            for s in 0..stages {
                acc += b[s] * self.k[s][i];
            }
            *value += dt * acc;
        }

        StepReport::default()
    }
}
