#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Duration;
use kf_agg::{AggError, Aggregation, Selectable, select};
use kf_series::{ComparisonOp, PointwiseOp, Series, SeriesError};
use kf_types::{Sample, is_truthy, parse_duration_literal};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Definition-time failures. An expression that fails to parse never becomes
/// a `Reader`, so these are reported once and never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyntaxError {
    #[error("unexpected character '{character}' at position {position}")]
    UnexpectedCharacter { position: usize, character: char },
    #[error("unterminated string literal starting at position {position}")]
    UnterminatedString { position: usize },
    #[error("statement keyword '{keyword}' is not part of the expression language")]
    RejectedKeyword { keyword: String },
    #[error("assignment is not an expression; use '==' to compare")]
    Assignment { position: usize },
    #[error("comparison chains are ambiguous; split them with 'and'")]
    ChainedComparison,
    #[error("malformed number literal '{literal}'")]
    InvalidNumber { literal: String },
    #[error("unexpected token {token}")]
    UnexpectedToken { token: String },
    #[error("expression ended unexpectedly")]
    UnexpectedEnd,
}

/// Run-time failures. A `Reader` is pure, so the same environment always
/// produces the same error.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("identifier '{name}' is not bound in the environment")]
    UnboundIdentifier { name: String },
    #[error("no builtin named '{name}'")]
    UnboundOperator { name: String },
    #[error("{operator} takes {expected} arguments, got {actual}")]
    Arity {
        operator: String,
        expected: String,
        actual: usize,
    },
    #[error("{operator} cannot operate on ({operands})")]
    TypeMismatch {
        operator: String,
        operands: String,
    },
    #[error(transparent)]
    Series(#[from] SeriesError),
    #[error(transparent)]
    Agg(#[from] AggError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    Number {
        value: f64,
    },
    Text {
        value: String,
    },
    /// Original spelling preserved; resolution is case-insensitive.
    Identifier {
        name: String,
    },
    /// Eager application: arguments evaluate left to right before the
    /// operator runs.
    Apply {
        operator: String,
        args: Vec<Expr>,
    },
    /// Lazy application: the operator receives compiled but unevaluated
    /// argument thunks and decides which to force.
    LazyApply {
        operator: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Text(String),
    Ident(String),
    If,
    Else,
    And,
    Or,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    SlashSlash,
    Gt,
    Ge,
    Lt,
    Le,
    EqEq,
    NotEq,
    LParen,
    RParen,
    Comma,
}

const REJECTED_KEYWORDS: &[&str] = &[
    "IMPORT", "FOR", "WHILE", "DEF", "LAMBDA", "RAISE", "WITH", "RETURN", "CLASS", "ASSERT",
    "DEL", "TRY", "YIELD", "GLOBAL",
];

fn tokenize(input: &str) -> Result<Vec<Token>, SyntaxError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                if chars.get(i + 1) == Some(&'/') {
                    tokens.push(Token::SlashSlash);
                    i += 2;
                } else {
                    tokens.push(Token::Slash);
                    i += 1;
                }
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(SyntaxError::Assignment { position: i });
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    return Err(SyntaxError::UnexpectedCharacter {
                        position: i,
                        character: c,
                    });
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let start = i;
                i += 1;
                let mut text = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err(SyntaxError::UnterminatedString { position: start }),
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Text(text));
            }
            _ if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                if chars.get(i) == Some(&'.') {
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                // A trailing identifier character makes this a word like
                // "2s"; those only exist inside string literals.
                if chars
                    .get(i)
                    .is_some_and(|ch| ch.is_ascii_alphabetic() || *ch == '_')
                {
                    while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                        i += 1;
                    }
                    let literal: String = chars[start..i].iter().collect();
                    return Err(SyntaxError::InvalidNumber { literal });
                }
                let literal: String = chars[start..i].iter().collect();
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| SyntaxError::InvalidNumber {
                        literal: literal.clone(),
                    })?;
                tokens.push(Token::Number(value));
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let upper = word.to_uppercase();
                if REJECTED_KEYWORDS.contains(&upper.as_str()) {
                    return Err(SyntaxError::RejectedKeyword { keyword: word });
                }
                match upper.as_str() {
                    "IF" => tokens.push(Token::If),
                    "ELSE" => tokens.push(Token::Else),
                    "AND" => tokens.push(Token::And),
                    "OR" => tokens.push(Token::Or),
                    "NOT" => tokens.push(Token::Not),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            _ => {
                return Err(SyntaxError::UnexpectedCharacter {
                    position: i,
                    character: c,
                });
            }
        }
    }
    Ok(tokens)
}

/// Parse one expression; trailing tokens are an error.
pub fn parse(input: &str) -> Result<Expr, SyntaxError> {
    let tokens = tokenize(input)?;
    let mut pos = 0;
    let expr = parse_conditional(&tokens, &mut pos)?;
    if pos < tokens.len() {
        return Err(SyntaxError::UnexpectedToken {
            token: format!("{:?}", tokens[pos]),
        });
    }
    Ok(expr)
}

fn lazy(operator: &str, args: Vec<Expr>) -> Expr {
    Expr::LazyApply {
        operator: operator.to_owned(),
        args,
    }
}

fn apply(operator: &str, args: Vec<Expr>) -> Expr {
    Expr::Apply {
        operator: operator.to_owned(),
        args,
    }
}

// body if test else orelse
fn parse_conditional(tokens: &[Token], pos: &mut usize) -> Result<Expr, SyntaxError> {
    let body = parse_or(tokens, pos)?;
    if tokens.get(*pos) != Some(&Token::If) {
        return Ok(body);
    }
    *pos += 1;
    let test = parse_or(tokens, pos)?;
    match tokens.get(*pos) {
        Some(Token::Else) => *pos += 1,
        Some(token) => {
            return Err(SyntaxError::UnexpectedToken {
                token: format!("{token:?}"),
            });
        }
        None => return Err(SyntaxError::UnexpectedEnd),
    }
    let orelse = parse_conditional(tokens, pos)?;
    Ok(lazy("IF", vec![test, body, orelse]))
}

fn parse_or(tokens: &[Token], pos: &mut usize) -> Result<Expr, SyntaxError> {
    let mut left = parse_and(tokens, pos)?;
    while tokens.get(*pos) == Some(&Token::Or) {
        *pos += 1;
        let right = parse_and(tokens, pos)?;
        left = lazy("OR", vec![left, right]);
    }
    Ok(left)
}

fn parse_and(tokens: &[Token], pos: &mut usize) -> Result<Expr, SyntaxError> {
    let mut left = parse_not(tokens, pos)?;
    while tokens.get(*pos) == Some(&Token::And) {
        *pos += 1;
        let right = parse_not(tokens, pos)?;
        left = lazy("AND", vec![left, right]);
    }
    Ok(left)
}

fn parse_not(tokens: &[Token], pos: &mut usize) -> Result<Expr, SyntaxError> {
    if tokens.get(*pos) == Some(&Token::Not) {
        *pos += 1;
        let inner = parse_not(tokens, pos)?;
        return Ok(lazy("NOT", vec![inner]));
    }
    parse_comparison(tokens, pos)
}

fn comparison_operator(token: &Token) -> Option<&'static str> {
    match token {
        Token::Gt => Some("GT"),
        Token::Ge => Some("GTE"),
        Token::Lt => Some("LT"),
        Token::Le => Some("LTE"),
        Token::EqEq => Some("EQ"),
        Token::NotEq => Some("NE"),
        _ => None,
    }
}

fn parse_comparison(tokens: &[Token], pos: &mut usize) -> Result<Expr, SyntaxError> {
    let left = parse_additive(tokens, pos)?;
    let Some(operator) = tokens.get(*pos).and_then(comparison_operator) else {
        return Ok(left);
    };
    *pos += 1;
    let right = parse_additive(tokens, pos)?;
    if tokens.get(*pos).and_then(comparison_operator).is_some() {
        return Err(SyntaxError::ChainedComparison);
    }
    Ok(apply(operator, vec![left, right]))
}

fn parse_additive(tokens: &[Token], pos: &mut usize) -> Result<Expr, SyntaxError> {
    let mut left = parse_multiplicative(tokens, pos)?;
    loop {
        let operator = match tokens.get(*pos) {
            Some(Token::Plus) => "ADD",
            Some(Token::Minus) => "SUB",
            _ => break,
        };
        *pos += 1;
        let right = parse_multiplicative(tokens, pos)?;
        left = apply(operator, vec![left, right]);
    }
    Ok(left)
}

fn parse_multiplicative(tokens: &[Token], pos: &mut usize) -> Result<Expr, SyntaxError> {
    let mut left = parse_unary(tokens, pos)?;
    loop {
        let operator = match tokens.get(*pos) {
            Some(Token::Star) => "MUL",
            Some(Token::Slash) => "DIV",
            Some(Token::SlashSlash) => "FLOORDIV",
            _ => break,
        };
        *pos += 1;
        let right = parse_unary(tokens, pos)?;
        left = apply(operator, vec![left, right]);
    }
    Ok(left)
}

fn parse_unary(tokens: &[Token], pos: &mut usize) -> Result<Expr, SyntaxError> {
    if tokens.get(*pos) == Some(&Token::Minus) {
        *pos += 1;
        let inner = parse_unary(tokens, pos)?;
        return Ok(apply("NEG", vec![inner]));
    }
    parse_atom(tokens, pos)
}

fn parse_atom(tokens: &[Token], pos: &mut usize) -> Result<Expr, SyntaxError> {
    match tokens.get(*pos) {
        Some(Token::Number(value)) => {
            *pos += 1;
            Ok(Expr::Number { value: *value })
        }
        Some(Token::Text(value)) => {
            *pos += 1;
            Ok(Expr::Text {
                value: value.clone(),
            })
        }
        Some(Token::Ident(name)) => {
            *pos += 1;
            if tokens.get(*pos) != Some(&Token::LParen) {
                return Ok(Expr::Identifier { name: name.clone() });
            }
            *pos += 1;
            let mut args = Vec::new();
            if tokens.get(*pos) != Some(&Token::RParen) {
                loop {
                    args.push(parse_conditional(tokens, pos)?);
                    match tokens.get(*pos) {
                        Some(Token::Comma) => *pos += 1,
                        Some(Token::RParen) => break,
                        Some(token) => {
                            return Err(SyntaxError::UnexpectedToken {
                                token: format!("{token:?}"),
                            });
                        }
                        None => return Err(SyntaxError::UnexpectedEnd),
                    }
                }
            }
            *pos += 1;
            Ok(apply(&name.to_uppercase(), args))
        }
        Some(Token::LParen) => {
            *pos += 1;
            let inner = parse_conditional(tokens, pos)?;
            match tokens.get(*pos) {
                Some(Token::RParen) => {
                    *pos += 1;
                    Ok(inner)
                }
                Some(token) => Err(SyntaxError::UnexpectedToken {
                    token: format!("{token:?}"),
                }),
                None => Err(SyntaxError::UnexpectedEnd),
            }
        }
        Some(token) => Err(SyntaxError::UnexpectedToken {
            token: format!("{token:?}"),
        }),
        None => Err(SyntaxError::UnexpectedEnd),
    }
}

/// A value flowing through expression evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Duration(Duration),
    Text(String),
    Series(Series),
    Aggregation(Aggregation),
    Nothing,
}

impl Value {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Number(_) => "number",
            Self::Duration(_) => "duration",
            Self::Text(_) => "text",
            Self::Series(_) => "series",
            Self::Aggregation(_) => "aggregation",
            Self::Nothing => "nothing",
        }
    }
}

pub const NOTHING_IDENTIFIER: &str = "NOTHING";

/// Case-insensitive binding of identifiers to values. `NOTHING` is always
/// bound so expressions can mention it without the scheduler providing it.
#[derive(Debug, Clone)]
pub struct Environment {
    bindings: BTreeMap<String, Value>,
    window_carry: Vec<Sample>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    #[must_use]
    pub fn new() -> Self {
        let mut bindings = BTreeMap::new();
        bindings.insert(NOTHING_IDENTIFIER.to_owned(), Value::Nothing);
        Self {
            bindings,
            window_carry: Vec::new(),
        }
    }

    pub fn bind(&mut self, name: &str, value: Value) {
        self.bindings.insert(name.to_uppercase(), value);
    }

    /// Look up a binding, case-insensitively. Aggregations come back flagged
    /// `skip_merge`: a looked-up aggregation is already a merged running
    /// total, so re-merging it into itself later would double-count.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.get_upper(&name.to_uppercase())
    }

    fn get_upper(&self, key: &str) -> Option<Value> {
        let mut value = self.bindings.get(key)?.clone();
        if let Value::Aggregation(agg) = &mut value {
            agg.mark_skip_merge();
        }
        Some(value)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(&name.to_uppercase())
    }

    #[must_use]
    pub fn window_carry(&self) -> &[Sample] {
        &self.window_carry
    }

    /// Remainder samples left over from the previous chunk's windowing,
    /// consumed by the WINDOW builtin.
    pub fn set_window_carry(&mut self, carry: Vec<Sample>) {
        self.window_carry = carry;
    }
}

#[derive(Debug, Clone)]
enum Node {
    Const(Value),
    Identifier { original: String, key: String },
    Apply { operator: String, args: Vec<Node> },
    LazyApply { operator: String, args: Vec<Node> },
}

fn eval(node: &Node, builtins: &BuiltinTable, env: &Environment) -> Result<Value, EvalError> {
    match node {
        Node::Const(value) => Ok(value.clone()),
        Node::Identifier { original, key } => {
            env.get_upper(key)
                .ok_or_else(|| EvalError::UnboundIdentifier {
                    name: original.clone(),
                })
        }
        Node::Apply { operator, args } => {
            let f = builtins
                .eager(operator)
                .ok_or_else(|| EvalError::UnboundOperator {
                    name: operator.clone(),
                })?;
            let values = args
                .iter()
                .map(|arg| eval(arg, builtins, env))
                .collect::<Result<Vec<_>, _>>()?;
            f(env, &values)
        }
        Node::LazyApply { operator, args } => {
            let f = builtins
                .lazy(operator)
                .ok_or_else(|| EvalError::UnboundOperator {
                    name: operator.clone(),
                })?;
            let thunks: Vec<Thunk<'_>> = args.iter().map(|arg| Thunk { node: arg, builtins }).collect();
            f(env, &thunks)
        }
    }
}

/// A compiled but not yet evaluated argument of a lazy builtin.
#[derive(Clone, Copy)]
pub struct Thunk<'a> {
    node: &'a Node,
    builtins: &'a BuiltinTable,
}

impl Thunk<'_> {
    pub fn force(&self, env: &Environment) -> Result<Value, EvalError> {
        eval(self.node, self.builtins, env)
    }
}

pub type EagerBuiltin = fn(&Environment, &[Value]) -> Result<Value, EvalError>;
pub type LazyBuiltin = for<'a> fn(&Environment, &[Thunk<'a>]) -> Result<Value, EvalError>;

/// Named operator registry, built once and shared between compilers.
#[derive(Debug, Default)]
pub struct BuiltinTable {
    eager: BTreeMap<String, EagerBuiltin>,
    lazy: BTreeMap<String, LazyBuiltin>,
}

impl BuiltinTable {
    #[must_use]
    pub fn standard() -> Self {
        let mut table = Self::default();
        table.register_eager("ADD", builtin_add);
        table.register_eager("SUB", builtin_sub);
        table.register_eager("MUL", builtin_mul);
        table.register_eager("DIV", builtin_div);
        table.register_eager("FLOORDIV", builtin_floordiv);
        table.register_eager("NEG", builtin_neg);
        table.register_eager("GT", builtin_gt);
        table.register_eager("LT", builtin_lt);
        table.register_eager("GTE", builtin_gte);
        table.register_eager("LTE", builtin_lte);
        table.register_eager("EQ", builtin_eq);
        table.register_eager("NE", builtin_ne);
        table.register_eager("AVERAGE", builtin_average);
        table.register_eager("MIN", builtin_min);
        table.register_eager("MAX", builtin_max);
        table.register_eager("SUM", builtin_sum);
        table.register_eager("WINDOW", builtin_window);
        table.register_eager("THD", builtin_thd);
        table.register_eager("TABLE", builtin_table);
        table.register_lazy("IF", builtin_if);
        table.register_lazy("AND", builtin_and);
        table.register_lazy("OR", builtin_or);
        table.register_lazy("NOT", builtin_not);
        table
    }

    pub fn register_eager(&mut self, name: &str, f: EagerBuiltin) {
        self.eager.insert(name.to_uppercase(), f);
    }

    pub fn register_lazy(&mut self, name: &str, f: LazyBuiltin) {
        self.lazy.insert(name.to_uppercase(), f);
    }

    fn eager(&self, name: &str) -> Option<EagerBuiltin> {
        self.eager.get(name).copied()
    }

    fn lazy(&self, name: &str) -> Option<LazyBuiltin> {
        self.lazy.get(name).copied()
    }
}

fn expect_arity(operator: &str, expected: usize, actual: usize) -> Result<(), EvalError> {
    if actual == expected {
        return Ok(());
    }
    Err(EvalError::Arity {
        operator: operator.to_owned(),
        expected: expected.to_string(),
        actual,
    })
}

fn type_mismatch(operator: &str, operands: &[Value]) -> EvalError {
    EvalError::TypeMismatch {
        operator: operator.to_owned(),
        operands: operands
            .iter()
            .map(Value::kind)
            .collect::<Vec<_>>()
            .join(", "),
    }
}

fn pointwise(operator: &str, op: PointwiseOp, args: &[Value]) -> Result<Value, EvalError> {
    expect_arity(operator, 2, args.len())?;
    match (&args[0], &args[1]) {
        (Value::Nothing, _) | (_, Value::Nothing) => Ok(Value::Nothing),
        (Value::Number(a), Value::Number(b)) => Ok(Value::Number(op.apply(*a, *b))),
        (Value::Series(a), Value::Series(b)) => Ok(Value::Series(a.binary(b, op)?)),
        (Value::Series(a), Value::Number(b)) => Ok(Value::Series(a.binary_scalar(*b, op, false)?)),
        (Value::Number(a), Value::Series(b)) => Ok(Value::Series(b.binary_scalar(*a, op, true)?)),
        (Value::Aggregation(a), Value::Aggregation(b)) => Ok(Value::Aggregation(
            Aggregation::combine(op, a.clone(), b.clone()),
        )),
        (Value::Aggregation(a), Value::Number(b)) => Ok(Value::Aggregation(Aggregation::combine(
            op,
            a.clone(),
            Aggregation::constant(*b),
        ))),
        (Value::Number(a), Value::Aggregation(b)) => Ok(Value::Aggregation(Aggregation::combine(
            op,
            Aggregation::constant(*a),
            b.clone(),
        ))),
        _ => Err(type_mismatch(operator, args)),
    }
}

fn comparison(operator: &str, op: ComparisonOp, args: &[Value]) -> Result<Value, EvalError> {
    expect_arity(operator, 2, args.len())?;
    match (&args[0], &args[1]) {
        (Value::Nothing, _) | (_, Value::Nothing) => Ok(Value::Nothing),
        (Value::Number(a), Value::Number(b)) => Ok(Value::Number(f64::from(op.holds(*a, *b)))),
        (Value::Series(a), Value::Series(b)) => Ok(Value::Series(a.compare(b, op)?)),
        (Value::Series(a), Value::Number(b)) => Ok(Value::Series(a.compare_scalar(*b, op, false)?)),
        (Value::Number(a), Value::Series(b)) => Ok(Value::Series(b.compare_scalar(*a, op, true)?)),
        (Value::Aggregation(a), Value::Aggregation(b)) => Ok(Value::Aggregation(
            Aggregation::compare(op, a.clone(), b.clone()),
        )),
        (Value::Aggregation(a), Value::Number(b)) => Ok(Value::Aggregation(Aggregation::compare(
            op,
            a.clone(),
            Aggregation::constant(*b),
        ))),
        (Value::Number(a), Value::Aggregation(b)) => Ok(Value::Aggregation(Aggregation::compare(
            op,
            Aggregation::constant(*a),
            b.clone(),
        ))),
        _ => Err(type_mismatch(operator, args)),
    }
}

fn builtin_add(_env: &Environment, args: &[Value]) -> Result<Value, EvalError> {
    pointwise("ADD", PointwiseOp::Add, args)
}

fn builtin_sub(_env: &Environment, args: &[Value]) -> Result<Value, EvalError> {
    pointwise("SUB", PointwiseOp::Sub, args)
}

fn builtin_mul(_env: &Environment, args: &[Value]) -> Result<Value, EvalError> {
    pointwise("MUL", PointwiseOp::Mul, args)
}

fn builtin_div(_env: &Environment, args: &[Value]) -> Result<Value, EvalError> {
    pointwise("DIV", PointwiseOp::Div, args)
}

fn builtin_floordiv(_env: &Environment, args: &[Value]) -> Result<Value, EvalError> {
    pointwise("FLOORDIV", PointwiseOp::FloorDiv, args)
}

fn builtin_gt(_env: &Environment, args: &[Value]) -> Result<Value, EvalError> {
    comparison("GT", ComparisonOp::Gt, args)
}

fn builtin_lt(_env: &Environment, args: &[Value]) -> Result<Value, EvalError> {
    comparison("LT", ComparisonOp::Lt, args)
}

fn builtin_gte(_env: &Environment, args: &[Value]) -> Result<Value, EvalError> {
    comparison("GTE", ComparisonOp::Gte, args)
}

fn builtin_lte(_env: &Environment, args: &[Value]) -> Result<Value, EvalError> {
    comparison("LTE", ComparisonOp::Lte, args)
}

fn builtin_eq(_env: &Environment, args: &[Value]) -> Result<Value, EvalError> {
    comparison("EQ", ComparisonOp::Eq, args)
}

fn builtin_ne(_env: &Environment, args: &[Value]) -> Result<Value, EvalError> {
    comparison("NE", ComparisonOp::Ne, args)
}

fn builtin_neg(_env: &Environment, args: &[Value]) -> Result<Value, EvalError> {
    expect_arity("NEG", 1, args.len())?;
    match &args[0] {
        Value::Nothing => Ok(Value::Nothing),
        Value::Number(v) => Ok(Value::Number(-v)),
        Value::Series(s) => Ok(Value::Series(s.map_values(|v| -v)?)),
        Value::Aggregation(a) => Ok(Value::Aggregation(Aggregation::combine(
            PointwiseOp::Sub,
            Aggregation::constant(0.0),
            a.clone(),
        ))),
        _ => Err(type_mismatch("NEG", args)),
    }
}

/// Reducers are window-sensitive: a windowed series collapses to one sample
/// per window, a flat series folds into an aggregation leaf that the
/// scheduler can merge across chunks.
fn reduce(
    operator: &str,
    args: &[Value],
    per_window: fn(&Series) -> Result<Series, SeriesError>,
    fold: fn(&Series) -> Result<Aggregation, AggError>,
) -> Result<Value, EvalError> {
    expect_arity(operator, 1, args.len())?;
    match &args[0] {
        Value::Nothing => Ok(Value::Nothing),
        Value::Series(s) if s.is_windowed() => Ok(Value::Series(per_window(s)?)),
        Value::Series(s) => Ok(Value::Aggregation(fold(s)?)),
        _ => Err(type_mismatch(operator, args)),
    }
}

fn builtin_average(_env: &Environment, args: &[Value]) -> Result<Value, EvalError> {
    reduce("AVERAGE", args, Series::average, Aggregation::average_of)
}

fn builtin_min(_env: &Environment, args: &[Value]) -> Result<Value, EvalError> {
    reduce("MIN", args, Series::min, Aggregation::min_of)
}

fn builtin_max(_env: &Environment, args: &[Value]) -> Result<Value, EvalError> {
    reduce("MAX", args, Series::max, Aggregation::max_of)
}

fn builtin_sum(_env: &Environment, args: &[Value]) -> Result<Value, EvalError> {
    reduce("SUM", args, Series::sum, Aggregation::sum_of)
}

fn builtin_window(env: &Environment, args: &[Value]) -> Result<Value, EvalError> {
    expect_arity("WINDOW", 2, args.len())?;
    let width = match &args[1] {
        Value::Duration(d) => *d,
        Value::Number(ms) => Duration::milliseconds(*ms as i64),
        _ => return Err(type_mismatch("WINDOW", args)),
    };
    match &args[0] {
        Value::Nothing => Ok(Value::Nothing),
        Value::Series(series) => {
            // The remainder of the previous chunk goes in front of any
            // carry the series already has.
            let mut series = series.clone();
            let mut carry = env.window_carry().to_vec();
            carry.extend_from_slice(series.carry_in());
            series.set_carry_in(carry);
            Ok(Value::Series(series.window(width)?))
        }
        _ => Err(type_mismatch("WINDOW", args)),
    }
}

fn builtin_thd(_env: &Environment, args: &[Value]) -> Result<Value, EvalError> {
    expect_arity("THD", 2, args.len())?;
    let Value::Number(base_hz) = &args[1] else {
        return Err(type_mismatch("THD", args));
    };
    match &args[0] {
        Value::Nothing => Ok(Value::Nothing),
        Value::Series(s) if s.is_windowed() => Ok(Value::Series(s.thd_per_window(*base_hz)?)),
        Value::Series(s) => Ok(Value::Number(s.thd(*base_hz)?)),
        _ => Err(type_mismatch("THD", args)),
    }
}

fn builtin_table(_env: &Environment, args: &[Value]) -> Result<Value, EvalError> {
    if args.is_empty() || args.len() % 2 != 0 {
        return Err(EvalError::Arity {
            operator: "TABLE".to_owned(),
            expected: "name/value pairs".to_owned(),
            actual: args.len(),
        });
    }
    let mut columns = BTreeMap::new();
    for pair in args.chunks(2) {
        let Value::Text(name) = &pair[0] else {
            return Err(type_mismatch("TABLE", args));
        };
        let cell = match &pair[1] {
            Value::Number(v) => Aggregation::constant(*v),
            Value::Aggregation(a) => a.clone(),
            _ => return Err(type_mismatch("TABLE", args)),
        };
        columns.insert(name.clone(), vec![cell]);
    }
    Ok(Value::Aggregation(Aggregation::table(columns)))
}

fn selectable<'a>(value: &'a Value, operator: &str) -> Result<Selectable<'a>, EvalError> {
    match value {
        Value::Series(s) => Ok(Selectable::Series(s)),
        Value::Aggregation(a) => Ok(Selectable::Aggregation(a)),
        Value::Number(v) => Ok(Selectable::Number(*v)),
        _ => Err(type_mismatch(operator, std::slice::from_ref(value))),
    }
}

fn coerce_aggregation(value: Value, operator: &str) -> Result<Aggregation, EvalError> {
    match value {
        Value::Aggregation(a) => Ok(a),
        Value::Number(v) => Ok(Aggregation::constant(v)),
        other => Err(type_mismatch(operator, &[other])),
    }
}

/// Lazy conditional. A scalar (or Nothing) test forces exactly one branch;
/// a series test materializes both branches and selects per sample; an
/// aggregation test defers the decision into an `If` aggregation node so it
/// can merge across chunks before being decided.
fn builtin_if(env: &Environment, args: &[Thunk<'_>]) -> Result<Value, EvalError> {
    expect_arity("IF", 3, args.len())?;
    match args[0].force(env)? {
        Value::Nothing => args[2].force(env),
        Value::Number(v) => {
            if is_truthy(v) {
                args[1].force(env)
            } else {
                args[2].force(env)
            }
        }
        Value::Series(test) => {
            let body = args[1].force(env)?;
            let orelse = args[2].force(env)?;
            let out = select(&test, selectable(&body, "IF")?, selectable(&orelse, "IF")?)?;
            Ok(Value::Series(out))
        }
        Value::Aggregation(test) => {
            let body = coerce_aggregation(args[1].force(env)?, "IF")?;
            let orelse = coerce_aggregation(args[2].force(env)?, "IF")?;
            Ok(Value::Aggregation(Aggregation::conditional(
                test, body, orelse,
            )))
        }
        other => Err(type_mismatch("IF", &[other])),
    }
}

fn scalar_truthy(operator: &str, value: &Value) -> Result<bool, EvalError> {
    match value {
        Value::Number(v) => Ok(is_truthy(*v)),
        Value::Nothing => Ok(false),
        Value::Text(t) => Ok(!t.is_empty()),
        Value::Duration(d) => Ok(d.num_milliseconds() != 0),
        Value::Series(_) | Value::Aggregation(_) => {
            Err(type_mismatch(operator, std::slice::from_ref(value)))
        }
    }
}

// AND/OR return an operand, not a boolean, matching the conditional-skip
// pattern `signal and average(signal)`.
fn builtin_and(env: &Environment, args: &[Thunk<'_>]) -> Result<Value, EvalError> {
    expect_arity("AND", 2, args.len())?;
    let first = args[0].force(env)?;
    if !scalar_truthy("AND", &first)? {
        return Ok(first);
    }
    args[1].force(env)
}

fn builtin_or(env: &Environment, args: &[Thunk<'_>]) -> Result<Value, EvalError> {
    expect_arity("OR", 2, args.len())?;
    let first = args[0].force(env)?;
    if scalar_truthy("OR", &first)? {
        return Ok(first);
    }
    args[1].force(env)
}

fn builtin_not(env: &Environment, args: &[Thunk<'_>]) -> Result<Value, EvalError> {
    expect_arity("NOT", 1, args.len())?;
    let value = args[0].force(env)?;
    Ok(Value::Number(f64::from(!scalar_truthy("NOT", &value)?)))
}

/// Compile-time rewriting of string literals; first matching transformer
/// wins, no match leaves the literal as text.
pub type Transformer = fn(&str) -> Option<Value>;

fn duration_transformer(text: &str) -> Option<Value> {
    parse_duration_literal(text).map(Value::Duration)
}

/// Turns parsed expressions into `Reader`s. Compilation itself never fails;
/// unbound identifiers and operators surface at run time, when the
/// environment is known.
#[derive(Debug, Clone)]
pub struct Compiler {
    builtins: Arc<BuiltinTable>,
    transformers: Vec<Transformer>,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    #[must_use]
    pub fn new() -> Self {
        Self::with_builtins(Arc::new(BuiltinTable::standard()))
    }

    #[must_use]
    pub fn with_builtins(builtins: Arc<BuiltinTable>) -> Self {
        Self {
            builtins,
            transformers: vec![duration_transformer],
        }
    }

    pub fn push_transformer(&mut self, transformer: Transformer) {
        self.transformers.push(transformer);
    }

    #[must_use]
    pub fn compile(&self, expr: &Expr) -> Reader {
        let mut identifiers = IdentifierSet::default();
        let node = self.lower(expr, &mut identifiers);
        Reader {
            node,
            builtins: Arc::clone(&self.builtins),
            identifiers: identifiers.in_order,
        }
    }

    fn lower(&self, expr: &Expr, identifiers: &mut IdentifierSet) -> Node {
        match expr {
            Expr::Number { value } => Node::Const(Value::Number(*value)),
            Expr::Text { value } => {
                let transformed = self
                    .transformers
                    .iter()
                    .find_map(|transformer| transformer(value));
                Node::Const(transformed.unwrap_or_else(|| Value::Text(value.clone())))
            }
            Expr::Identifier { name } => {
                identifiers.record(name);
                Node::Identifier {
                    original: name.clone(),
                    key: name.to_uppercase(),
                }
            }
            Expr::Apply { operator, args } => Node::Apply {
                operator: operator.clone(),
                args: args
                    .iter()
                    .map(|arg| self.lower(arg, identifiers))
                    .collect(),
            },
            Expr::LazyApply { operator, args } => Node::LazyApply {
                operator: operator.clone(),
                args: args
                    .iter()
                    .map(|arg| self.lower(arg, identifiers))
                    .collect(),
            },
        }
    }
}

#[derive(Default)]
struct IdentifierSet {
    seen: BTreeSet<String>,
    in_order: Vec<String>,
}

impl IdentifierSet {
    fn record(&mut self, name: &str) {
        if self.seen.insert(name.to_uppercase()) {
            self.in_order.push(name.to_owned());
        }
    }
}

/// A compiled expression. `run` is pure: the same environment always yields
/// the same value or the same error.
#[derive(Debug, Clone)]
pub struct Reader {
    node: Node,
    builtins: Arc<BuiltinTable>,
    identifiers: Vec<String>,
}

impl Reader {
    pub fn run(&self, env: &Environment) -> Result<Value, EvalError> {
        eval(&self.node, &self.builtins, env)
    }

    /// Identifiers the expression references, in original spelling and
    /// discovery order, deduplicated case-insensitively.
    #[must_use]
    pub fn identifiers(&self) -> &[String] {
        &self.identifiers
    }
}

/// Parse and compile in one step with a default compiler.
pub fn compile(text: &str) -> Result<Reader, SyntaxError> {
    let expr = parse(text)?;
    Ok(Compiler::new().compile(&expr))
}
