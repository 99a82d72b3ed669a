//! Callable views of an equation system.
//!
//! Every right-hand side (and, for semi-implicit solvers, every Jacobian
//! entry) is turned into a [`NumericFunction`] once per solve and bound to
//! positions of the state vector.

use crate::equation::EquationSystem;
use crate::equation_engine::{Bytecode, Compiler, Expr, VM};
use crate::traits::{DynamicalSystem, NumericFunction};
use anyhow::{anyhow, bail, Context, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// How expressions are turned into callable functions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvaluationStrategy {
    /// Walk the expression tree on every call.
    Interpreted,
    /// Compile to bytecode for the stack VM.
    #[default]
    Compiled,
}

impl EvaluationStrategy {
    /// Builds a function of the expression's free variables, ordered as they
    /// appear in `variables`.
    pub fn build(self, expr: &Expr, variables: &[String]) -> Result<Arc<dyn NumericFunction>> {
        if !expr.is_computable() {
            bail!("Expression {} contains derivative references", expr);
        }
        let free = expr.free_variables();
        if let Some(unknown) = free.iter().find(|name| !variables.contains(*name)) {
            bail!("Unknown variable: {}", unknown);
        }
        let arguments: Vec<String> = variables
            .iter()
            .filter(|name| free.contains(*name))
            .cloned()
            .collect();

        Ok(match self {
            EvaluationStrategy::Interpreted => {
                Arc::new(InterpretedFunction::new(expr.clone(), arguments))
            }
            EvaluationStrategy::Compiled => Arc::new(CompiledFunction::new(expr, arguments)?),
        })
    }
}

/// Tree-walking evaluator.
pub struct InterpretedFunction {
    expr: Expr,
    arguments: Vec<String>,
    index: HashMap<String, usize>,
}

impl InterpretedFunction {
    pub fn new(expr: Expr, arguments: Vec<String>) -> Self {
        let index = arguments
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            expr,
            arguments,
            index,
        }
    }

    fn eval(&self, expr: &Expr, args: &[f64]) -> f64 {
        match expr {
            Expr::Number(n) => *n,
            Expr::Variable(name) => self.index.get(name).map_or(f64::NAN, |&i| args[i]),
            Expr::Derivative(..) => f64::NAN,
            Expr::Binary(left, op, right) => {
                op.apply(self.eval(left, args), self.eval(right, args))
            }
            Expr::Neg(inner) => -self.eval(inner, args),
            Expr::Call(func, arg) => func.apply(self.eval(arg, args)),
        }
    }
}

impl NumericFunction for InterpretedFunction {
    fn execute(&self, args: &[f64]) -> f64 {
        self.eval(&self.expr, args)
    }

    fn ordered_arguments(&self) -> &[String] {
        &self.arguments
    }
}

/// Bytecode evaluated by the stack [`VM`].
pub struct CompiledFunction {
    bytecode: Bytecode,
    arguments: Vec<String>,
}

impl CompiledFunction {
    pub fn new(expr: &Expr, arguments: Vec<String>) -> Result<Self> {
        let bytecode = Compiler::new(&arguments).compile(expr)?;
        Ok(Self {
            bytecode,
            arguments,
        })
    }

    pub fn bytecode(&self) -> &Bytecode {
        &self.bytecode
    }
}

impl NumericFunction for CompiledFunction {
    fn execute(&self, args: &[f64]) -> f64 {
        VM::execute(&self.bytecode, args)
    }

    fn ordered_arguments(&self) -> &[String] {
        &self.arguments
    }
}

thread_local! {
    static ARGUMENTS: RefCell<Vec<f64>> = RefCell::new(Vec::with_capacity(16));
}

/// A numeric function wired to positions of a full state vector.
#[derive(Clone)]
pub struct BoundFunction {
    function: Arc<dyn NumericFunction>,
    positions: Vec<usize>,
}

impl BoundFunction {
    pub fn bind(function: Arc<dyn NumericFunction>, variables: &[String]) -> Result<Self> {
        let positions = function
            .ordered_arguments()
            .iter()
            .map(|name| {
                variables
                    .iter()
                    .position(|v| v == name)
                    .ok_or_else(|| anyhow!("Function argument {} is not a state variable", name))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            function,
            positions,
        })
    }

    /// Evaluates the function with arguments gathered from `state`.
    pub fn evaluate(&self, state: &[f64]) -> f64 {
        ARGUMENTS.with(|cell| {
            let mut args = cell.borrow_mut();
            args.clear();
            args.extend(self.positions.iter().map(|&p| state[p]));
            self.function.execute(&args)
        })
    }

    pub fn function(&self) -> &Arc<dyn NumericFunction> {
        &self.function
    }
}

impl fmt::Debug for BoundFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundFunction")
            .field("arguments", &self.function.ordered_arguments())
            .field("positions", &self.positions)
            .finish()
    }
}

/// One callable right-hand side per equation.
#[derive(Debug, Clone)]
pub struct ExecutableSystem {
    variables: Arc<[String]>,
    equations: Vec<BoundFunction>,
}

impl ExecutableSystem {
    pub fn build(system: &EquationSystem, strategy: EvaluationStrategy) -> Result<Self> {
        let variables = system.shared_variables();
        let equations = system
            .equations()
            .iter()
            .map(|eq| {
                let function = strategy.build(eq.rhs(), &variables).with_context(|| {
                    format!("Failed to build right-hand side of {}'", eq.variable())
                })?;
                BoundFunction::bind(function, &variables)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            variables,
            equations,
        })
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn equation(&self, index: usize) -> &BoundFunction {
        &self.equations[index]
    }
}

impl DynamicalSystem for ExecutableSystem {
    fn dimension(&self) -> usize {
        self.equations.len()
    }

    fn apply_one(&self, index: usize, x: &[f64]) -> f64 {
        self.equations[index].evaluate(x)
    }
}

/// Partial derivatives of every right-hand side with respect to every state
/// variable, keyed by `(equation variable, differentiation variable)`.
#[derive(Debug, Clone)]
pub struct JacobianMap {
    variables: Arc<[String]>,
    keys: HashMap<(String, String), usize>,
    entries: Vec<BoundFunction>,
}

impl JacobianMap {
    pub fn build(system: &EquationSystem, strategy: EvaluationStrategy) -> Result<Self> {
        let variables = system.shared_variables();
        let dim = variables.len();
        let mut keys = HashMap::with_capacity(dim * dim);
        let mut entries = Vec::with_capacity(dim * dim);

        for eq in system.equations() {
            for column in variables.iter() {
                let partial = eq.rhs().derivative(column);
                log::trace!("d({}')/d({}) = {}", eq.variable(), column, partial);
                let function = strategy.build(&partial, &variables).with_context(|| {
                    format!("Failed to build Jacobian entry ({}, {})", eq.variable(), column)
                })?;
                keys.insert((eq.variable().to_string(), column.clone()), entries.len());
                entries.push(BoundFunction::bind(function, &variables)?);
            }
        }

        Ok(Self {
            variables,
            keys,
            entries,
        })
    }

    pub fn get(&self, row: &str, column: &str) -> Option<&BoundFunction> {
        self.keys
            .get(&(row.to_string(), column.to_string()))
            .map(|&idx| &self.entries[idx])
    }

    /// Entry by declaration index; `row` and `column` must be in range.
    pub fn entry(&self, row: usize, column: usize) -> &BoundFunction {
        &self.entries[row * self.variables.len() + column]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evaluates the full Jacobian at `state` (declaration order).
    pub fn evaluate(&self, state: &[f64]) -> DMatrix<f64> {
        let dim = self.variables.len();
        DMatrix::from_fn(dim, dim, |i, j| self.entry(i, j).evaluate(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn pendulum() -> EquationSystem {
        EquationSystem::parse(["theta' = omega", "omega' = -9.81 * sin(theta) - 0.5 * omega"])
            .expect("pendulum should validate")
    }

    #[test]
    fn functions_take_only_their_free_variables() {
        let system = pendulum();
        let exec = ExecutableSystem::build(&system, EvaluationStrategy::Compiled).unwrap();
        assert_eq!(
            exec.equation(0).function().ordered_arguments(),
            &["omega".to_string()]
        );
        assert_eq!(
            exec.equation(1).function().ordered_arguments(),
            &["theta".to_string(), "omega".to_string()]
        );
    }

    #[test]
    fn interpreted_and_compiled_agree() {
        let system = pendulum();
        let compiled = ExecutableSystem::build(&system, EvaluationStrategy::Compiled).unwrap();
        let interpreted =
            ExecutableSystem::build(&system, EvaluationStrategy::Interpreted).unwrap();
        let x = [0.3, -1.2];
        let mut a = [0.0; 2];
        let mut b = [0.0; 2];
        compiled.apply(&x, &mut a);
        interpreted.apply(&x, &mut b);
        assert_eq!(a, b);
        assert_relative_eq!(a[1], -9.81 * 0.3f64.sin() + 0.6, epsilon = 1e-12);
    }

    #[test]
    fn jacobian_is_keyed_by_variable_pairs() {
        let system = pendulum();
        let jacobian = JacobianMap::build(&system, EvaluationStrategy::Compiled).unwrap();
        assert_eq!(jacobian.len(), 4);

        let x = [0.3, -1.2];
        let d_omega_d_theta = jacobian.get("omega", "theta").expect("entry exists");
        assert_relative_eq!(d_omega_d_theta.evaluate(&x), -9.81 * 0.3f64.cos(), epsilon = 1e-12);
        assert_relative_eq!(jacobian.get("omega", "omega").unwrap().evaluate(&x), -0.5);
        assert!(jacobian.get("omega", "phi").is_none());

        let matrix = jacobian.evaluate(&x);
        assert_eq!(matrix[(0, 0)], 0.0);
        assert_eq!(matrix[(0, 1)], 1.0);
        assert_relative_eq!(matrix[(1, 0)], -9.81 * 0.3f64.cos(), epsilon = 1e-12);
    }

    #[test]
    fn build_rejects_unknown_names() {
        let expr = crate::equation_engine::parse("a + b").unwrap();
        let err = EvaluationStrategy::Interpreted
            .build(&expr, &["a".to_string()])
            .err()
            .expect("unknown variable should fail");
        assert!(err.to_string().contains("Unknown variable: b"));
    }

    #[test]
    fn jacobian_can_be_shared_across_threads() {
        let system = pendulum();
        let jacobian = Arc::new(JacobianMap::build(&system, EvaluationStrategy::Compiled).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|k| {
                let jacobian = Arc::clone(&jacobian);
                std::thread::spawn(move || jacobian.entry(1, 0).evaluate(&[k as f64 * 0.1, 0.0]))
            })
            .collect();
        for (k, handle) in handles.into_iter().enumerate() {
            let value = handle.join().expect("thread should finish");
            assert_relative_eq!(value, -9.81 * (k as f64 * 0.1).cos(), epsilon = 1e-12);
        }
    }
}
