use crate::equation_engine::{parse_statement, Expr, Statement};
use crate::error::FormatError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

/// The derivative isolated on the left-hand side of an equation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeadingDerivative {
    pub variable: String,
    pub order: u32,
}

/// An explicit ordinary differential equation `x^(n) = f(...)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Equation {
    leading: LeadingDerivative,
    rhs: Expr,
}

impl Equation {
    /// Builds an equation from an assignment whose target is a single
    /// derivative of order at least one.
    pub fn from_statement(statement: Statement) -> Result<Self, FormatError> {
        let leading = match &statement.target {
            Expr::Derivative(variable, order) if *order >= 1 => LeadingDerivative {
                variable: variable.clone(),
                order: *order,
            },
            other => return Err(FormatError::NotDerivativeAssignment(other.to_string())),
        };
        Ok(Self {
            leading,
            rhs: statement.value,
        })
    }

    pub fn leading(&self) -> &LeadingDerivative {
        &self.leading
    }

    pub fn variable(&self) -> &str {
        &self.leading.variable
    }

    pub fn rhs(&self) -> &Expr {
        &self.rhs
    }
}

impl FromStr for Equation {
    type Err = FormatError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let statement = parse_statement(input).map_err(|err| FormatError::Parse {
            input: input.to_string(),
            message: format!("{err:#}"),
        })?;
        Self::from_statement(statement)
    }
}

/// An ordered, validated set of first-order equations.
///
/// Immutable after construction; cheap to share between solves.
#[derive(Debug, Clone, PartialEq)]
pub struct EquationSystem {
    equations: Vec<Equation>,
    variables: Arc<[String]>,
}

impl EquationSystem {
    pub fn new(equations: Vec<Equation>) -> Result<Self, FormatError> {
        if equations.is_empty() {
            return Err(FormatError::Empty);
        }

        let mut leading: HashMap<&str, u32> = HashMap::with_capacity(equations.len());
        for eq in &equations {
            let LeadingDerivative { variable, order } = eq.leading();
            if *order > 1 {
                return Err(FormatError::UnsupportedOrder {
                    variable: variable.clone(),
                    order: *order,
                });
            }
            if leading.insert(variable.as_str(), *order).is_some() {
                return Err(FormatError::DuplicateLeadingDerivative {
                    variable: variable.clone(),
                });
            }
        }

        for eq in &equations {
            for (variable, order) in eq.rhs().derivative_references() {
                match leading.get(variable.as_str()) {
                    None => {
                        return Err(FormatError::UnknownVariable {
                            equation: eq.variable().to_string(),
                            variable,
                            order,
                        })
                    }
                    Some(&lead) if order >= lead => {
                        return Err(FormatError::OrderNotBelowLeading {
                            equation: eq.variable().to_string(),
                            variable,
                            order,
                            leading: lead,
                        })
                    }
                    Some(_) => {}
                }
            }
            if !eq.rhs().is_computable() {
                return Err(FormatError::NotComputable(eq.variable().to_string()));
            }
        }

        let variables: Arc<[String]> = equations
            .iter()
            .map(|eq| eq.variable().to_string())
            .collect();
        log::debug!("built equation system over {:?}", variables);

        Ok(Self {
            equations,
            variables,
        })
    }

    /// Parses and validates one statement per equation.
    pub fn parse<I, S>(statements: I) -> Result<Self, FormatError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let equations = statements
            .into_iter()
            .map(|s| s.as_ref().parse::<Equation>())
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(equations)
    }

    pub fn equations(&self) -> &[Equation] {
        &self.equations
    }

    /// Leading-derivative variable names, in declaration order.
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub(crate) fn shared_variables(&self) -> Arc<[String]> {
        Arc::clone(&self.variables)
    }

    pub fn dimension(&self) -> usize {
        self.equations.len()
    }

    pub fn index_of(&self, variable: &str) -> Option<usize> {
        self.variables.iter().position(|v| v == variable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_linear_system_in_declaration_order() {
        let system = EquationSystem::parse(["x2' = 3*x1 - 4*x2", "x1' = -x1 - 2*x2"])
            .expect("system should validate");
        assert_eq!(system.variables(), &["x2".to_string(), "x1".to_string()]);
        assert_eq!(system.dimension(), 2);
        assert_eq!(system.index_of("x1"), Some(1));
        assert_eq!(system.equations()[0].leading().order, 1);
    }

    #[test]
    fn rejects_duplicate_leading_derivative() {
        let err = EquationSystem::parse(["x1' = x2", "x2' = x1", "x1' = -x1"]).unwrap_err();
        assert_eq!(
            err,
            FormatError::DuplicateLeadingDerivative {
                variable: "x1".into()
            }
        );
    }

    #[test]
    fn rejects_reference_to_undeclared_higher_derivative() {
        let err = EquationSystem::parse(["x1' = x1''", "x2' = x1"]).unwrap_err();
        assert!(matches!(
            err,
            FormatError::OrderNotBelowLeading { ref variable, order: 2, leading: 1, .. }
                if variable == "x1"
        ));
    }

    #[test]
    fn rejects_unknown_variables() {
        let err = EquationSystem::parse(["x' = y"]).unwrap_err();
        assert!(matches!(err, FormatError::UnknownVariable { order: 0, .. }));

        let err = EquationSystem::parse(["x' = z' + x"]).unwrap_err();
        assert!(matches!(err, FormatError::UnknownVariable { order: 1, .. }));
    }

    #[test]
    fn rejects_higher_order_equations() {
        let err = EquationSystem::parse(["x'' = -x"]).unwrap_err();
        assert_eq!(
            err,
            FormatError::UnsupportedOrder {
                variable: "x".into(),
                order: 2
            }
        );
    }

    #[test]
    fn rejects_non_derivative_targets_and_empty_systems() {
        assert!(matches!(
            "x = 3".parse::<Equation>(),
            Err(FormatError::NotDerivativeAssignment(_))
        ));
        assert!(matches!(
            "x' = (".parse::<Equation>(),
            Err(FormatError::Parse { .. })
        ));
        assert_eq!(
            EquationSystem::new(Vec::new()).unwrap_err(),
            FormatError::Empty
        );
    }
}
