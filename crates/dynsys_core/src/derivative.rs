//! Symbolic differentiation of parsed expressions.
//!
//! Results are simplified while they are built: constants are folded and
//! additive/multiplicative identities are dropped, so the derivative of a
//! linear right-hand side collapses to a single number.
//!
//! `0 * e` and `0 / e` fold to `0` without looking at `e`. Where `e` would
//! evaluate to NaN or infinity the folded partial differs from the
//! unsimplified one: `d/dx (x * (1 / y))` is `1 / y`, which is infinite at
//! `y = 0` where the raw product rule gives NaN.

use crate::equation_engine::{BinaryOp, Expr, Function};

impl Expr {
    /// Takes the partial derivative of the expression with respect to `variable`.
    ///
    /// Derivative references (`x'`) are treated as independent symbols and
    /// differentiate to zero.
    pub fn derivative(&self, variable: &str) -> Expr {
        match self {
            Expr::Number(_) | Expr::Derivative(..) => num(0.0),
            Expr::Variable(name) => num(if name == variable { 1.0 } else { 0.0 }),
            Expr::Neg(inner) => neg(inner.derivative(variable)),
            Expr::Binary(left, op, right) => {
                let dl = left.derivative(variable);
                let dr = right.derivative(variable);
                let l = || (**left).clone();
                let r = || (**right).clone();
                match op {
                    BinaryOp::Add => add(dl, dr),
                    BinaryOp::Sub => sub(dl, dr),
                    BinaryOp::Mul => add(mul(dl, r()), mul(l(), dr)),
                    BinaryOp::Div => div(
                        sub(mul(dl, r()), mul(l(), dr)),
                        pow(r(), num(2.0)),
                    ),
                    BinaryOp::Pow if is_zero(&dr) => {
                        // d(u^c) = c * u^(c-1) * u'
                        mul(mul(r(), pow(l(), sub(r(), num(1.0)))), dl)
                    }
                    BinaryOp::Pow => {
                        // d(u^v) = u^v * (v' ln u + v u' / u)
                        mul(
                            self.clone(),
                            add(
                                mul(dr, call(Function::Ln, l())),
                                div(mul(r(), dl), l()),
                            ),
                        )
                    }
                }
            }
            Expr::Call(func, arg) => {
                let darg = arg.derivative(variable);
                if is_zero(&darg) {
                    return num(0.0);
                }
                let a = || (**arg).clone();
                let outer = match func {
                    Function::Sin => call(Function::Cos, a()),
                    Function::Cos => neg(call(Function::Sin, a())),
                    Function::Tan => div(num(1.0), pow(call(Function::Cos, a()), num(2.0))),
                    Function::Exp => call(Function::Exp, a()),
                    Function::Ln => div(num(1.0), a()),
                    Function::Sqrt => div(num(1.0), mul(num(2.0), call(Function::Sqrt, a()))),
                };
                mul(outer, darg)
            }
        }
    }
}

fn num(value: f64) -> Expr {
    Expr::Number(value)
}

fn as_number(expr: &Expr) -> Option<f64> {
    match expr {
        Expr::Number(n) => Some(*n),
        _ => None,
    }
}

fn is_zero(expr: &Expr) -> bool {
    as_number(expr) == Some(0.0)
}

fn is_one(expr: &Expr) -> bool {
    as_number(expr) == Some(1.0)
}

fn binary(left: Expr, op: BinaryOp, right: Expr) -> Expr {
    Expr::Binary(Box::new(left), op, Box::new(right))
}

fn call(func: Function, arg: Expr) -> Expr {
    match as_number(&arg) {
        Some(value) => num(func.apply(value)),
        None => Expr::Call(func, Box::new(arg)),
    }
}

fn neg(expr: Expr) -> Expr {
    match expr {
        Expr::Number(n) => num(-n),
        Expr::Neg(inner) => *inner,
        other => Expr::Neg(Box::new(other)),
    }
}

fn add(left: Expr, right: Expr) -> Expr {
    match (as_number(&left), as_number(&right)) {
        (Some(a), Some(b)) => num(a + b),
        (Some(a), None) if a == 0.0 => right,
        (None, Some(b)) if b == 0.0 => left,
        _ => match right {
            Expr::Neg(inner) => binary(left, BinaryOp::Sub, *inner),
            right => binary(left, BinaryOp::Add, right),
        },
    }
}

fn sub(left: Expr, right: Expr) -> Expr {
    match (as_number(&left), as_number(&right)) {
        (Some(a), Some(b)) => num(a - b),
        (Some(a), None) if a == 0.0 => neg(right),
        (None, Some(b)) if b == 0.0 => left,
        _ => binary(left, BinaryOp::Sub, right),
    }
}

fn mul(left: Expr, right: Expr) -> Expr {
    match (as_number(&left), as_number(&right)) {
        (Some(a), Some(b)) => num(a * b),
        (Some(a), None) => scale(a, right),
        (None, Some(b)) => scale(b, left),
        (None, None) => binary(left, BinaryOp::Mul, right),
    }
}

// Constant factors are kept on the left. A zero factor drops `expr` even if
// it is not finite.
fn scale(factor: f64, expr: Expr) -> Expr {
    if factor == 0.0 {
        num(0.0)
    } else if factor == 1.0 {
        expr
    } else if factor == -1.0 {
        neg(expr)
    } else {
        binary(num(factor), BinaryOp::Mul, expr)
    }
}

fn div(left: Expr, right: Expr) -> Expr {
    match (as_number(&left), as_number(&right)) {
        (Some(a), Some(b)) if b != 0.0 => num(a / b),
        (Some(a), _) if a == 0.0 => num(0.0),
        _ if is_one(&right) => left,
        _ => binary(left, BinaryOp::Div, right),
    }
}

fn pow(base: Expr, exponent: Expr) -> Expr {
    match (as_number(&base), as_number(&exponent)) {
        (Some(a), Some(b)) => num(a.powf(b)),
        (_, Some(b)) if b == 0.0 => num(1.0),
        (_, Some(b)) if b == 1.0 => base,
        _ => binary(base, BinaryOp::Pow, exponent),
    }
}

#[cfg(test)]
mod tests {
    use crate::equation_engine::{parse, Compiler, Expr, VM};
    use approx::assert_relative_eq;

    fn d(input: &str, variable: &str) -> Expr {
        parse(input)
            .expect("expression should parse")
            .derivative(variable)
    }

    fn eval(expr: &Expr, vars: &[&str], values: &[f64]) -> f64 {
        let names: Vec<String> = vars.iter().map(|s| s.to_string()).collect();
        let code = Compiler::new(&names)
            .compile(expr)
            .expect("derivative should compile");
        VM::execute(&code, values)
    }

    #[test]
    fn linear_right_hand_sides_fold_to_constants() {
        assert_eq!(d("-x1 - 2*x2", "x1"), Expr::Number(-1.0));
        assert_eq!(d("-x1 - 2*x2", "x2"), Expr::Number(-2.0));
        assert_eq!(d("3*x1 - 4*x2", "x2"), Expr::Number(-4.0));
        assert_eq!(d("3*x1 - 4*x2", "y"), Expr::Number(0.0));
    }

    #[test]
    fn power_rule_with_constant_exponent() {
        assert_eq!(d("x^2", "x").to_string(), "2 * x");
        assert_eq!(d("x^3", "x").to_string(), "3 * x ^ 2");
    }

    #[test]
    fn derivatives_match_finite_differences() {
        let cases = [
            "x * y + sin(x) * exp(-x)",
            "x / (1 + y^2)",
            "sqrt(x) * ln(x + y)",
            "tan(x * y) - cos(x)^3",
            "x ^ y",
            "2 ^ (x * y)",
        ];
        let (x, y) = (0.7, 1.3);
        let h = 1e-6;
        for case in cases {
            let expr = parse(case).unwrap();
            let dx = expr.derivative("x");
            let f = |a: f64| eval(&expr, &["x", "y"], &[a, y]);
            let numeric = (f(x + h) - f(x - h)) / (2.0 * h);
            let symbolic = eval(&dx, &["x", "y"], &[x, y]);
            assert_relative_eq!(symbolic, numeric, max_relative = 1e-6);
        }
    }

    #[test]
    fn zero_factors_drop_singular_subterms() {
        let dx = d("x * (1 / y)", "x");
        assert_eq!(dx.to_string(), "1 / y");
        let at_pole = eval(&dx, &["x", "y"], &[2.0, 0.0]);
        assert!(at_pole.is_infinite() && at_pole > 0.0);

        assert_eq!(d("x * ln(y)", "x").to_string(), "ln(y)");
    }

    #[test]
    fn derivative_references_are_constants() {
        assert_eq!(d("x' * x", "x").to_string(), "x'");
    }
}
