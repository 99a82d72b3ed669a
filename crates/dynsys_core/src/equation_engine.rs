use anyhow::{anyhow, bail, Result};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Elementary functions callable from equations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    Sin,
    Cos,
    Tan,
    Exp,
    Ln,
    Sqrt,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sin" => Some(Function::Sin),
            "cos" => Some(Function::Cos),
            "tan" => Some(Function::Tan),
            "exp" => Some(Function::Exp),
            "ln" => Some(Function::Ln),
            "sqrt" => Some(Function::Sqrt),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Function::Sin => "sin",
            Function::Cos => "cos",
            Function::Tan => "tan",
            Function::Exp => "exp",
            Function::Ln => "ln",
            Function::Sqrt => "sqrt",
        }
    }

    pub fn apply(self, x: f64) -> f64 {
        match self {
            Function::Sin => x.sin(),
            Function::Cos => x.cos(),
            Function::Tan => x.tan(),
            Function::Exp => x.exp(),
            Function::Ln => x.ln(),
            Function::Sqrt => x.sqrt(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Pow => a.powf(b),
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Pow => "^",
        }
    }

    fn precedence(self) -> u8 {
        match self {
            BinaryOp::Add | BinaryOp::Sub => 1,
            BinaryOp::Mul | BinaryOp::Div => 2,
            BinaryOp::Pow => 4,
        }
    }
}

/// Abstract Syntax Tree nodes for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    /// A variable followed by `order` primes, e.g. `x''`.
    Derivative(String, u32),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
    Neg(Box<Expr>),
    Call(Function, Box<Expr>),
}

const NEG_PRECEDENCE: u8 = 3;
const ATOM_PRECEDENCE: u8 = 5;

impl Expr {
    fn precedence(&self) -> u8 {
        match self {
            Expr::Number(n) if *n < 0.0 || (*n == 0.0 && n.is_sign_negative()) => NEG_PRECEDENCE,
            Expr::Binary(_, op, _) => op.precedence(),
            Expr::Neg(_) => NEG_PRECEDENCE,
            _ => ATOM_PRECEDENCE,
        }
    }

    /// Names of every variable the expression reads, derivative bases included.
    pub fn free_variables(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.visit(&mut |node| match node {
            Expr::Variable(name) | Expr::Derivative(name, _) => {
                names.insert(name.clone());
            }
            _ => {}
        });
        names
    }

    /// Every `(variable, derivative order)` pair referenced; plain variables
    /// are reported with order 0.
    pub fn derivative_references(&self) -> Vec<(String, u32)> {
        let mut refs = Vec::new();
        self.visit(&mut |node| match node {
            Expr::Variable(name) => refs.push((name.clone(), 0)),
            Expr::Derivative(name, order) => refs.push((name.clone(), *order)),
            _ => {}
        });
        refs
    }

    /// True when the expression can be evaluated from plain variable values.
    pub fn is_computable(&self) -> bool {
        let mut computable = true;
        self.visit(&mut |node| {
            if let Expr::Derivative(..) = node {
                computable = false;
            }
        });
        computable
    }

    fn visit<F: FnMut(&Expr)>(&self, f: &mut F) {
        f(self);
        match self {
            Expr::Binary(left, _, right) => {
                left.visit(f);
                right.visit(f);
            }
            Expr::Neg(inner) | Expr::Call(_, inner) => inner.visit(f),
            _ => {}
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{}", n),
            Expr::Variable(name) => write!(f, "{}", name),
            Expr::Derivative(name, order) => {
                write!(f, "{}{}", name, "'".repeat(*order as usize))
            }
            Expr::Neg(inner) => {
                if inner.precedence() < NEG_PRECEDENCE {
                    write!(f, "-({})", inner)
                } else {
                    write!(f, "-{}", inner)
                }
            }
            Expr::Call(func, arg) => write!(f, "{}({})", func.name(), arg),
            Expr::Binary(left, op, right) => {
                let prec = op.precedence();
                let left_parens = match op {
                    BinaryOp::Pow => left.precedence() <= prec,
                    _ => left.precedence() < prec,
                };
                let right_parens = match op {
                    BinaryOp::Pow => right.precedence() < NEG_PRECEDENCE,
                    _ => right.precedence() <= prec,
                };
                if left_parens {
                    write!(f, "({})", left)?;
                } else {
                    write!(f, "{}", left)?;
                }
                write!(f, " {} ", op.symbol())?;
                if right_parens {
                    write!(f, "({})", right)
                } else {
                    write!(f, "{}", right)
                }
            }
        }
    }
}

/// An assignment `target = value` as written in the source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub target: Expr,
    pub value: Expr,
}

// --- Simple Parser ---

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    parser.expect_end()?;
    Ok(expr)
}

/// Parses an assignment statement such as `x' = -x + y`.
pub fn parse_statement(input: &str) -> Result<Statement> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let target = parser.parse_expression()?;
    match parser.consume() {
        Some(Token::Equals) => {}
        _ => bail!("Expected '=' after the assignment target"),
    }
    let value = parser.parse_expression()?;
    parser.expect_end()?;
    Ok(Statement { target, value })
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Prime,
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    Equals,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num_str.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            if let Some(&e) = chars.peek() {
                if e == 'e' || e == 'E' {
                    let mut lookahead = chars.clone();
                    lookahead.next();
                    let mut exponent = String::from("e");
                    if let Some(&sign) = lookahead.peek() {
                        if sign == '+' || sign == '-' {
                            exponent.push(sign);
                            lookahead.next();
                        }
                    }
                    if lookahead.peek().is_some_and(|d| d.is_ascii_digit()) {
                        while let Some(&d) = lookahead.peek() {
                            if !d.is_ascii_digit() {
                                break;
                            }
                            exponent.push(d);
                            lookahead.next();
                        }
                        num_str.push_str(&exponent);
                        chars = lookahead;
                    }
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| anyhow!("Invalid number literal '{}'", num_str))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            let token = match c {
                '\'' => Token::Prime,
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                '=' => Token::Equals,
                other => bail!("Unexpected character '{}'", other),
            };
            tokens.push(token);
            chars.next();
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_end(&self) -> Result<()> {
        match self.peek() {
            None => Ok(()),
            Some(token) => bail!("Unexpected trailing token {:?}", token),
        }
    }

    fn parse_expression(&mut self) -> Result<Expr> {
        let mut left = self.parse_term()?;

        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.consume();
            let right = self.parse_term()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Minus) => {
                self.consume();
                let expr = self.parse_unary()?;
                Ok(Expr::Neg(Box::new(expr)))
            }
            Some(Token::Plus) => {
                self.consume();
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    // Right-associative; the exponent may carry its own sign (`2^-x`).
    fn parse_power(&mut self) -> Result<Expr> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(
                Box::new(base),
                BinaryOp::Pow,
                Box::new(exponent),
            ));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => match self.peek() {
                Some(Token::LParen) => {
                    let func = Function::from_name(&name)
                        .ok_or_else(|| anyhow!("Unknown function: {}", name))?;
                    self.consume(); // eat '('
                    let arg = self.parse_expression()?;
                    match self.consume() {
                        Some(Token::RParen) => Ok(Expr::Call(func, Box::new(arg))),
                        _ => bail!("Expected ')'"),
                    }
                }
                Some(Token::Prime) => {
                    let mut order = 0;
                    while let Some(Token::Prime) = self.peek() {
                        self.consume();
                        order += 1;
                    }
                    Ok(Expr::Derivative(name, order))
                }
                _ => Ok(Expr::Variable(name)),
            },
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                match self.consume() {
                    Some(Token::RParen) => Ok(expr),
                    _ => bail!("Expected ')'"),
                }
            }
            Some(token) => bail!("Unexpected token {:?}", token),
            None => bail!("Unexpected end of input"),
        }
    }
}

// --- Bytecode ---

/// OpCodes for the Stack-based Virtual Machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant onto the stack.
    LoadConst(f64),
    /// Pushes argument `idx` onto the stack.
    LoadVar(usize),
    /// Pops top two values (b, a), pushes `a op b`.
    Binary(BinaryOp),
    /// Pops top value (a), pushes -a.
    Neg,
    /// Pops top value (a), pushes f(a).
    Call(Function),
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
    /// Deepest stack the program reaches.
    pub max_stack: usize,
}

/// Compiles an AST (`Expr`) into `Bytecode`.
/// Resolves variable names to argument indices.
pub struct Compiler {
    pub var_map: HashMap<String, usize>,
}

impl Compiler {
    pub fn new(var_names: &[String]) -> Self {
        let var_map = var_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self { var_map }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode> {
        let mut ops = Vec::new();
        let mut depth = 0usize;
        let mut max_stack = 0usize;
        self.compile_recursive(expr, &mut ops, &mut depth, &mut max_stack)?;
        Ok(Bytecode { ops, max_stack })
    }

    fn compile_recursive(
        &self,
        expr: &Expr,
        ops: &mut Vec<OpCode>,
        depth: &mut usize,
        max_stack: &mut usize,
    ) -> Result<()> {
        match expr {
            Expr::Number(n) => {
                ops.push(OpCode::LoadConst(*n));
                *depth += 1;
                *max_stack = (*max_stack).max(*depth);
            }
            Expr::Variable(name) => {
                let idx = self
                    .var_map
                    .get(name)
                    .ok_or_else(|| anyhow!("Unknown variable: {}", name))?;
                ops.push(OpCode::LoadVar(*idx));
                *depth += 1;
                *max_stack = (*max_stack).max(*depth);
            }
            Expr::Derivative(name, order) => {
                bail!(
                    "Cannot compile derivative reference {}",
                    Expr::Derivative(name.clone(), *order)
                );
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops, depth, max_stack)?;
                self.compile_recursive(right, ops, depth, max_stack)?;
                ops.push(OpCode::Binary(*op));
                *depth -= 1;
            }
            Expr::Neg(operand) => {
                self.compile_recursive(operand, ops, depth, max_stack)?;
                ops.push(OpCode::Neg);
            }
            Expr::Call(func, arg) => {
                self.compile_recursive(arg, ops, depth, max_stack)?;
                ops.push(OpCode::Call(*func));
            }
        }
        Ok(())
    }
}

thread_local! {
    static VM_STACK: RefCell<Vec<f64>> = RefCell::new(Vec::with_capacity(64));
}

/// Stack-based Virtual Machine for evaluating compiled equations.
///
/// The VM is stateless; scratch space lives in a thread-local buffer so a
/// compiled function can be shared across threads without locking.
pub struct VM;

impl VM {
    pub fn execute(bytecode: &Bytecode, vars: &[f64]) -> f64 {
        VM_STACK.with(|cell| {
            let mut stack = cell.borrow_mut();
            Self::run(bytecode, vars, &mut stack)
        })
    }

    /// Executes the bytecode on a caller-provided stack.
    pub fn run(bytecode: &Bytecode, vars: &[f64], stack: &mut Vec<f64>) -> f64 {
        stack.clear();
        stack.reserve(bytecode.max_stack);

        for op in &bytecode.ops {
            match *op {
                OpCode::LoadConst(val) => stack.push(val),
                OpCode::LoadVar(idx) => stack.push(vars[idx]),
                OpCode::Binary(op) => {
                    let b = stack.pop().unwrap_or(f64::NAN);
                    let a = stack.pop().unwrap_or(f64::NAN);
                    stack.push(op.apply(a, b));
                }
                OpCode::Neg => {
                    let a = stack.pop().unwrap_or(f64::NAN);
                    stack.push(-a);
                }
                OpCode::Call(func) => {
                    let a = stack.pop().unwrap_or(f64::NAN);
                    stack.push(func.apply(a));
                }
            }
        }

        stack.pop().unwrap_or(f64::NAN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn eval(input: &str, vars: &[&str], values: &[f64]) -> f64 {
        let expr = parse(input).expect("expression should parse");
        let code = Compiler::new(&names(vars))
            .compile(&expr)
            .expect("expression should compile");
        VM::execute(&code, values)
    }

    #[test]
    fn power_binds_tighter_than_unary_minus() {
        assert_relative_eq!(eval("-x^2", &["x"], &[3.0]), -9.0);
        assert_relative_eq!(eval("2^3^2", &[], &[]), 512.0);
        assert_relative_eq!(eval("2^-1", &[], &[]), 0.5);
    }

    #[test]
    fn evaluates_functions_and_exponent_literals() {
        let value = eval("sin(x)^2 + cos(x)^2 + 1.5e-1 * exp(0)", &["x"], &[0.7]);
        assert_relative_eq!(value, 1.15, epsilon = 1e-12);
        assert_relative_eq!(
            eval("sqrt(y) / ln(e1)", &["y", "e1"], &[4.0, 1.0f64.exp()]),
            2.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn parses_derivative_assignment() {
        let statement = parse_statement("x1' = -x1 - 2*x2").expect("statement should parse");
        assert_eq!(statement.target, Expr::Derivative("x1".into(), 1));
        assert_eq!(
            statement.value.derivative_references(),
            vec![("x1".to_string(), 0), ("x2".to_string(), 0)]
        );
        assert!(statement.value.is_computable());
    }

    #[test]
    fn counts_primes_as_derivative_order() {
        let expr = parse("x'' + y").expect("expression should parse");
        assert!(!expr.is_computable());
        assert!(expr.derivative_references().contains(&("x".to_string(), 2)));
        assert_eq!(
            expr.free_variables().into_iter().collect::<Vec<_>>(),
            vec!["x".to_string(), "y".to_string()]
        );
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse("x +").is_err());
        assert!(parse("foo(x)").is_err());
        assert!(parse("x # y").is_err());
        assert!(parse("(x").is_err());
        assert!(parse("x = y").is_err());
        assert!(parse_statement("x' + 1").is_err());
    }

    #[test]
    fn compiler_rejects_unknown_names_and_derivatives() {
        let compiler = Compiler::new(&names(&["x"]));
        assert!(compiler.compile(&parse("x + y").unwrap()).is_err());
        assert!(compiler.compile(&parse("x'").unwrap()).is_err());
    }

    #[test]
    fn compiler_tracks_stack_depth() {
        let code = Compiler::new(&names(&["a", "b", "c"]))
            .compile(&parse("a + b * (c - 1)").unwrap())
            .unwrap();
        assert_eq!(code.max_stack, 4);
        assert_relative_eq!(VM::execute(&code, &[1.0, 2.0, 4.0]), 7.0);
    }

    #[test]
    fn display_is_reparseable() {
        let source = "-(a - b) * c ^ (d + 1) - (-2) ^ x / sin(y - z)";
        let expr = parse(source).unwrap();
        let reparsed = parse(&expr.to_string()).unwrap();
        assert_eq!(expr, reparsed);
    }
}
