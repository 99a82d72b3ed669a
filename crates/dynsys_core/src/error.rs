use thiserror::Error;

/// Reasons an equation or an equation system is rejected at construction.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormatError {
    #[error("failed to parse `{input}`: {message}")]
    Parse { input: String, message: String },

    #[error("`{0}` is not an assignment to a single derivative")]
    NotDerivativeAssignment(String),

    #[error("right-hand side of {0}' is not computable")]
    NotComputable(String),

    #[error("equation system must contain at least one equation")]
    Empty,

    #[error("leading derivative {variable}' is declared more than once")]
    DuplicateLeadingDerivative { variable: String },

    #[error(
        "leading derivative of {variable} has order {order}; only first-order equations are supported"
    )]
    UnsupportedOrder { variable: String, order: u32 },

    #[error(
        "equation for {equation}' references {variable} at order {order}, which is not the leading derivative of any equation"
    )]
    UnknownVariable {
        equation: String,
        variable: String,
        order: u32,
    },

    #[error(
        "equation for {equation}' references {variable} at order {order}, but {variable} is only defined up to order {leading}"
    )]
    OrderNotBelowLeading {
        equation: String,
        variable: String,
        order: u32,
        leading: u32,
    },
}

/// Reasons a solve is refused before its first step.
#[derive(Debug, Error)]
pub enum SolveError {
    #[error("step size must be positive and finite, got {0}")]
    NonPositiveStep(f64),

    #[error("state variables {found:?} do not match system variables {expected:?}")]
    VariableMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error(transparent)]
    Preparation(#[from] anyhow::Error),
}
