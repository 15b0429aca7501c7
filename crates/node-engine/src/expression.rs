//! Restricted expression language for conditions, switches, loops and
//! transforms
//!
//! Expressions are parsed into a small AST and interpreted against a
//! [`Scope`] of JSON bindings. The interpreter has no ambient capabilities:
//! the only things an expression can reach are its bindings and a fixed
//! table of pure functions.
//!
//! Supported syntax:
//! - literals: numbers, `'single'` / `"double"` quoted strings, `true`,
//!   `false`, `null`, arrays `[1, 2]`
//! - field access: `a.b`, `a[0]`, `a["key"]`, plus `.length` on strings and
//!   arrays
//! - unary `!` `-`, arithmetic `+ - * / %` (`+` concatenates when either
//!   side is a string), comparison `== != > < >= <=` (`===` and `!==` are
//!   accepted as aliases), logical `&&` `||`, ternary `c ? a : b`, parentheses
//! - functions: `len lower upper trim contains starts_with ends_with
//!   to_string to_number keys join abs round min max`
//!
//! Missing fields evaluate to `null`. Numeric comparison uses f64 coercion,
//! so `1 == 1.0`. `&&` and `||` short-circuit and yield the deciding operand.
//! Every evaluation is bounded by a step budget and a wall-clock deadline.

use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;

use crate::constants::{limits, timeouts};

/// Identifiers rejected anywhere in an expression
pub const BLOCKED_IDENTIFIERS: &[&str] = &[
    "eval",
    "Function",
    "setTimeout",
    "setInterval",
    "fetch",
    "XMLHttpRequest",
    "window",
    "document",
    "global",
    "globalThis",
    "process",
    "require",
    "import",
    "__proto__",
    "prototype",
    "constructor",
];

const MAX_NESTING: usize = 64;
const MAX_TOKENS: usize = 2_048;

/// Errors from parsing or evaluating an expression
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExpressionError {
    #[error("parse error at offset {position}: {message}")]
    Parse { message: String, position: usize },

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("function '{name}' expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: String,
        got: usize,
    },

    #[error("forbidden identifier '{0}'")]
    Forbidden(String),

    #[error("evaluation error: {0}")]
    Eval(String),

    #[error("expression exceeded {0} evaluation steps")]
    StepLimit(usize),

    #[error("expression timed out after {0:?}")]
    Timeout(Duration),
}

fn eval_err(msg: impl Into<String>) -> ExpressionError {
    ExpressionError::Eval(msg.into())
}

/// Budget applied to one evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalLimits {
    pub max_steps: usize,
    pub timeout: Duration,
}

impl Default for EvalLimits {
    fn default() -> Self {
        Self {
            max_steps: limits::EXPRESSION_STEPS,
            timeout: Duration::from_millis(timeouts::EXPRESSION_MS),
        }
    }
}

/// Variables visible to an expression
///
/// Named bindings shadow each other (last bound wins). Identifiers with no
/// binding fall back to fields of the fallback object, if any, and then to
/// `null`.
#[derive(Debug, Clone, Default)]
pub struct Scope<'a> {
    bindings: Vec<(&'a str, &'a Value)>,
    fallback: Option<&'a Value>,
}

impl<'a> Scope<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, name: &'a str, value: &'a Value) -> Self {
        self.bindings.push((name, value));
        self
    }

    pub fn with_fallback(mut self, value: &'a Value) -> Self {
        self.fallback = Some(value);
        self
    }

    fn resolve(&self, name: &str) -> Value {
        if let Some((_, v)) = self.bindings.iter().rev().find(|(n, _)| *n == name) {
            return (*v).clone();
        }
        self.fallback
            .and_then(|f| f.get(name))
            .cloned()
            .unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
    Not,
    Question,
    Colon,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    pos: usize,
}

fn parse_error(message: impl Into<String>, position: usize) -> ExpressionError {
    ExpressionError::Parse {
        message: message.into(),
        position,
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let peek = |idx: usize| chars.get(idx).copied();

    while i < chars.len() {
        let start = i;
        let c = chars[i];
        let (tok, width) = match c {
            ' ' | '\t' | '\r' | '\n' => {
                i += 1;
                continue;
            }
            '=' if peek(i + 1) == Some('=') => {
                if peek(i + 2) == Some('=') {
                    (Tok::Eq, 3)
                } else {
                    (Tok::Eq, 2)
                }
            }
            '!' if peek(i + 1) == Some('=') => {
                if peek(i + 2) == Some('=') {
                    (Tok::Ne, 3)
                } else {
                    (Tok::Ne, 2)
                }
            }
            '!' => (Tok::Not, 1),
            '>' if peek(i + 1) == Some('=') => (Tok::Ge, 2),
            '>' => (Tok::Gt, 1),
            '<' if peek(i + 1) == Some('=') => (Tok::Le, 2),
            '<' => (Tok::Lt, 1),
            '&' if peek(i + 1) == Some('&') => (Tok::And, 2),
            '|' if peek(i + 1) == Some('|') => (Tok::Or, 2),
            '+' => (Tok::Plus, 1),
            '-' => (Tok::Minus, 1),
            '*' => (Tok::Star, 1),
            '/' => (Tok::Slash, 1),
            '%' => (Tok::Percent, 1),
            '?' => (Tok::Question, 1),
            ':' => (Tok::Colon, 1),
            ',' => (Tok::Comma, 1),
            '(' => (Tok::LParen, 1),
            ')' => (Tok::RParen, 1),
            '[' => (Tok::LBracket, 1),
            ']' => (Tok::RBracket, 1),
            '.' if !peek(i + 1).is_some_and(|n| n.is_ascii_digit()) => (Tok::Dot, 1),
            '"' | '\'' => {
                let quote = c;
                let mut j = i + 1;
                let mut s = String::new();
                loop {
                    match peek(j) {
                        None => return Err(parse_error("unterminated string literal", start)),
                        Some('\\') => {
                            let escaped = peek(j + 1)
                                .ok_or_else(|| parse_error("unterminated string literal", start))?;
                            s.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                other => other,
                            });
                            j += 2;
                        }
                        Some(ch) if ch == quote => {
                            j += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(ch);
                            j += 1;
                        }
                    }
                }
                (Tok::Str(s), j - i)
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut j = i;
                let mut seen_dot = false;
                while let Some(ch) = peek(j) {
                    if ch.is_ascii_digit() {
                        j += 1;
                    } else if ch == '.' && !seen_dot && peek(j + 1).is_some_and(|n| n.is_ascii_digit()) {
                        seen_dot = true;
                        j += 1;
                    } else {
                        break;
                    }
                }
                let raw: String = chars[i..j].iter().collect();
                let n: f64 = raw
                    .parse()
                    .map_err(|_| parse_error(format!("invalid number '{}'", raw), start))?;
                (Tok::Num(n), j - i)
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let mut j = i;
                while peek(j).is_some_and(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '$') {
                    j += 1;
                }
                let word: String = chars[i..j].iter().collect();
                let tok = match word.as_str() {
                    "true" => Tok::True,
                    "false" => Tok::False,
                    "null" | "undefined" => Tok::Null,
                    _ => Tok::Ident(word),
                };
                (tok, j - i)
            }
            other => return Err(parse_error(format!("unexpected character '{}'", other), start)),
        };
        tokens.push(Token { tok, pos: start });
        i += width;
    }

    Ok(tokens)
}

/// Identifiers outside string literals that are on the blocklist
///
/// Works on raw text so it also reports on expressions that do not parse.
pub fn blocked_identifiers(expression: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    let mut word = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    let flush = |word: &mut String, found: &mut Vec<String>| {
        if !word.is_empty() && BLOCKED_IDENTIFIERS.contains(&word.as_str()) && !found.contains(word) {
            found.push(word.clone());
        }
        word.clear();
    };

    for c in expression.chars() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
            word.push(c);
        } else {
            flush(&mut word, &mut found);
            if c == '"' || c == '\'' || c == '`' {
                quote = Some(c);
            }
        }
    }
    flush(&mut word, &mut found);
    found
}

/// Validation messages for an expression field
///
/// An empty list means the expression is acceptable.
pub fn validate_expression(expression: &str) -> Vec<String> {
    if expression.trim().is_empty() {
        return vec!["Expression is required".to_string()];
    }
    let blocked = blocked_identifiers(expression);
    if !blocked.is_empty() {
        return blocked
            .into_iter()
            .map(|id| format!("Expression contains forbidden identifier '{}'", id))
            .collect();
    }
    match Expression::parse(expression) {
        Ok(_) => Vec::new(),
        Err(e) => vec![format!("Invalid expression: {}", e)],
    }
}

// ---------------------------------------------------------------------------
// AST and parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Ident(String),
    Array(Vec<Expr>),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Func {
    Len,
    Lower,
    Upper,
    Trim,
    Contains,
    StartsWith,
    EndsWith,
    ToString,
    ToNumber,
    Keys,
    Join,
    Abs,
    Round,
    Min,
    Max,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "len" => Self::Len,
            "lower" => Self::Lower,
            "upper" => Self::Upper,
            "trim" => Self::Trim,
            "contains" => Self::Contains,
            "starts_with" => Self::StartsWith,
            "ends_with" => Self::EndsWith,
            "to_string" => Self::ToString,
            "to_number" => Self::ToNumber,
            "keys" => Self::Keys,
            "join" => Self::Join,
            "abs" => Self::Abs,
            "round" => Self::Round,
            "min" => Self::Min,
            "max" => Self::Max,
            _ => return None,
        })
    }

    /// (min, max) argument count; `None` max means variadic
    fn arity(self) -> (usize, Option<usize>) {
        match self {
            Self::Len | Self::Lower | Self::Upper | Self::Trim => (1, Some(1)),
            Self::ToString | Self::ToNumber | Self::Keys | Self::Abs => (1, Some(1)),
            Self::Contains | Self::StartsWith | Self::EndsWith => (2, Some(2)),
            Self::Join | Self::Round => (1, Some(2)),
            Self::Min | Self::Max => (1, None),
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map(|t| t.pos).unwrap_or(self.end)
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<(), ExpressionError> {
        if self.eat(&tok) {
            Ok(())
        } else {
            Err(parse_error(format!("expected {}", what), self.position()))
        }
    }

    fn enter(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(parse_error("expression nested too deeply", self.position()));
        }
        Ok(())
    }

    fn ternary(&mut self) -> Result<Expr, ExpressionError> {
        self.enter()?;
        let cond = self.binary(0)?;
        let expr = if self.eat(&Tok::Question) {
            let then = self.ternary()?;
            self.expect(Tok::Colon, "':' in conditional expression")?;
            let otherwise = self.ternary()?;
            Expr::Conditional(Box::new(cond), Box::new(then), Box::new(otherwise))
        } else {
            cond
        };
        self.depth -= 1;
        Ok(expr)
    }

    /// Precedence climbing over the binary operator levels
    fn binary(&mut self, level: usize) -> Result<Expr, ExpressionError> {
        const LEVELS: &[&[(Tok, BinOp)]] = &[
            &[(Tok::Or, BinOp::Or)],
            &[(Tok::And, BinOp::And)],
            &[(Tok::Eq, BinOp::Eq), (Tok::Ne, BinOp::Ne)],
            &[
                (Tok::Gt, BinOp::Gt),
                (Tok::Lt, BinOp::Lt),
                (Tok::Ge, BinOp::Ge),
                (Tok::Le, BinOp::Le),
            ],
            &[(Tok::Plus, BinOp::Add), (Tok::Minus, BinOp::Sub)],
            &[(Tok::Star, BinOp::Mul), (Tok::Slash, BinOp::Div), (Tok::Percent, BinOp::Rem)],
        ];

        if level >= LEVELS.len() {
            return self.unary();
        }

        let mut left = self.binary(level + 1)?;
        loop {
            let op = LEVELS[level]
                .iter()
                .find(|(tok, _)| self.peek() == Some(tok))
                .map(|(_, op)| *op);
            let Some(op) = op else { break };
            self.pos += 1;
            let right = self.binary(level + 1)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat(&Tok::Not) {
            self.enter()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        if self.eat(&Tok::Minus) {
            self.enter()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Tok::Dot) {
                let pos = self.position();
                match self.peek().cloned() {
                    Some(Tok::Ident(name)) => {
                        self.pos += 1;
                        if self.peek() == Some(&Tok::LParen) {
                            return Err(parse_error(
                                format!("method call '.{}()' is not supported; use a function", name),
                                pos,
                            ));
                        }
                        expr = Expr::Member(Box::new(expr), name);
                    }
                    _ => return Err(parse_error("expected field name after '.'", pos)),
                }
            } else if self.eat(&Tok::LBracket) {
                let index = self.ternary()?;
                self.expect(Tok::RBracket, "']'")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        let pos = self.position();
        let Some(tok) = self.peek().cloned() else {
            return Err(parse_error("unexpected end of expression", pos));
        };
        self.pos += 1;

        match tok {
            Tok::Num(n) => Ok(Expr::Literal(number(n))),
            Tok::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Tok::True => Ok(Expr::Literal(Value::Bool(true))),
            Tok::False => Ok(Expr::Literal(Value::Bool(false))),
            Tok::Null => Ok(Expr::Literal(Value::Null)),
            Tok::LParen => {
                let inner = self.ternary()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(inner)
            }
            Tok::LBracket => {
                let mut items = Vec::new();
                if !self.eat(&Tok::RBracket) {
                    loop {
                        items.push(self.ternary()?);
                        if self.eat(&Tok::RBracket) {
                            break;
                        }
                        self.expect(Tok::Comma, "',' or ']' in array literal")?;
                    }
                }
                Ok(Expr::Array(items))
            }
            Tok::Ident(name) => {
                if BLOCKED_IDENTIFIERS.contains(&name.as_str()) {
                    return Err(ExpressionError::Forbidden(name));
                }
                if !self.eat(&Tok::LParen) {
                    return Ok(Expr::Ident(name));
                }
                let func = Func::lookup(&name).ok_or_else(|| ExpressionError::UnknownFunction(name.clone()))?;
                let mut args = Vec::new();
                if !self.eat(&Tok::RParen) {
                    loop {
                        args.push(self.ternary()?);
                        if self.eat(&Tok::RParen) {
                            break;
                        }
                        self.expect(Tok::Comma, "',' or ')' in argument list")?;
                    }
                }
                let (min, max) = func.arity();
                if args.len() < min || max.is_some_and(|m| args.len() > m) {
                    let expected = match max {
                        Some(m) if m == min => min.to_string(),
                        Some(m) => format!("{}-{}", min, m),
                        None => format!("at least {}", min),
                    };
                    return Err(ExpressionError::Arity {
                        name,
                        expected,
                        got: args.len(),
                    });
                }
                Ok(Expr::Call(func, args))
            }
            other => Err(parse_error(format!("unexpected token {:?}", other), pos)),
        }
    }
}

/// A parsed expression, reusable across evaluations
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(parse_error("empty expression", 0));
        }
        if tokens.len() > MAX_TOKENS {
            return Err(parse_error(format!("expression longer than {} tokens", MAX_TOKENS), 0));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
            end: source.chars().count(),
        };
        let root = parser.ternary()?;
        if parser.pos < parser.tokens.len() {
            let pos = parser.position();
            let tok = parser.tokens[parser.pos].tok.clone();
            return Err(parse_error(format!("unexpected token {:?}", tok), pos));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn eval(&self, scope: &Scope<'_>, limits: EvalLimits) -> Result<Value, ExpressionError> {
        let mut interp = Interpreter {
            scope,
            steps: 0,
            limits,
            deadline: Instant::now() + limits.timeout,
        };
        interp.eval(&self.root)
    }
}

/// Parse and evaluate in one call
pub fn evaluate(expression: &str, scope: &Scope<'_>, limits: EvalLimits) -> Result<Value, ExpressionError> {
    Expression::parse(expression)?.eval(scope, limits)
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// Build a JSON number, keeping integral values integral
pub fn number(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Truthiness: `false`, `null`, `0`, `""` are false; everything else true
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// String form used by `+`, `to_string`, `join` and switch matching
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn as_num(value: &Value, context: &str) -> Result<f64, ExpressionError> {
    value
        .as_f64()
        .ok_or_else(|| eval_err(format!("{} expects a number, got {}", context, type_name(value))))
}

fn as_str<'v>(value: &'v Value, context: &str) -> Result<&'v str, ExpressionError> {
    value
        .as_str()
        .ok_or_else(|| eval_err(format!("{} expects a string, got {}", context, type_name(value))))
}

/// Numbers compare by value, so `1` equals `1.0`
fn loose_equals(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn order(left: &Value, right: &Value, op: BinOp) -> bool {
    let ordering = if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        l.partial_cmp(&r)
    } else if let (Some(l), Some(r)) = (left.as_str(), right.as_str()) {
        Some(l.cmp(r))
    } else {
        // null and mismatched types never order
        None
    };
    match (ordering, op) {
        (Some(o), BinOp::Gt) => o.is_gt(),
        (Some(o), BinOp::Lt) => o.is_lt(),
        (Some(o), BinOp::Ge) => o.is_ge(),
        (Some(o), BinOp::Le) => o.is_le(),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

struct Interpreter<'s, 'a> {
    scope: &'s Scope<'a>,
    steps: usize,
    limits: EvalLimits,
    deadline: Instant,
}

impl Interpreter<'_, '_> {
    fn tick(&mut self, cost: usize) -> Result<(), ExpressionError> {
        let before = self.steps;
        self.steps = self.steps.saturating_add(cost.max(1));
        if self.steps > self.limits.max_steps {
            return Err(ExpressionError::StepLimit(self.limits.max_steps));
        }
        // Clock reads are comparatively expensive; check every 256 steps
        if before / 256 != self.steps / 256 && Instant::now() > self.deadline {
            return Err(ExpressionError::Timeout(self.limits.timeout));
        }
        Ok(())
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, ExpressionError> {
        self.tick(1)?;
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ident(name) => Ok(self.scope.resolve(name)),
            Expr::Array(items) => {
                let values = items.iter().map(|e| self.eval(e)).collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Array(values))
            }
            Expr::Member(target, name) => {
                let target = self.eval(target)?;
                Ok(member(&target, name))
            }
            Expr::Index(target, index) => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                Ok(index_value(&target, &index))
            }
            Expr::Not(inner) => Ok(Value::Bool(!truthy(&self.eval(inner)?))),
            Expr::Neg(inner) => {
                let v = self.eval(inner)?;
                Ok(number(-as_num(&v, "unary '-'")?))
            }
            Expr::Conditional(cond, then, otherwise) => {
                if truthy(&self.eval(cond)?) {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::Binary(BinOp::And, l, r) => {
                let left = self.eval(l)?;
                if truthy(&left) {
                    self.eval(r)
                } else {
                    Ok(left)
                }
            }
            Expr::Binary(BinOp::Or, l, r) => {
                let left = self.eval(l)?;
                if truthy(&left) {
                    Ok(left)
                } else {
                    self.eval(r)
                }
            }
            Expr::Binary(op, l, r) => {
                let left = self.eval(l)?;
                let right = self.eval(r)?;
                self.binary(*op, &left, &right)
            }
            Expr::Call(func, args) => {
                let values = args.iter().map(|e| self.eval(e)).collect::<Result<Vec<_>, _>>()?;
                self.call(*func, &values)
            }
        }
    }

    fn binary(&mut self, op: BinOp, left: &Value, right: &Value) -> Result<Value, ExpressionError> {
        match op {
            BinOp::Add => match (left, right) {
                (Value::String(_), _) | (_, Value::String(_)) => {
                    let joined = format!("{}{}", to_display_string(left), to_display_string(right));
                    self.tick(joined.len() / 64)?;
                    Ok(Value::String(joined))
                }
                (Value::Array(a), Value::Array(b)) => {
                    self.tick(a.len() + b.len())?;
                    Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
                }
                _ => Ok(number(as_num(left, "'+'")? + as_num(right, "'+'")?)),
            },
            BinOp::Sub => Ok(number(as_num(left, "'-'")? - as_num(right, "'-'")?)),
            BinOp::Mul => Ok(number(as_num(left, "'*'")? * as_num(right, "'*'")?)),
            BinOp::Div | BinOp::Rem => {
                let l = as_num(left, "arithmetic")?;
                let r = as_num(right, "arithmetic")?;
                if r == 0.0 {
                    return Err(eval_err("division by zero"));
                }
                Ok(number(if op == BinOp::Div { l / r } else { l % r }))
            }
            BinOp::Eq => Ok(Value::Bool(loose_equals(left, right))),
            BinOp::Ne => Ok(Value::Bool(!loose_equals(left, right))),
            BinOp::Gt | BinOp::Lt | BinOp::Ge | BinOp::Le => Ok(Value::Bool(order(left, right, op))),
            BinOp::And | BinOp::Or => Err(eval_err("logical operator evaluated eagerly")),
        }
    }

    fn call(&mut self, func: Func, args: &[Value]) -> Result<Value, ExpressionError> {
        let arg = |i: usize| args.get(i).unwrap_or(&Value::Null);
        match func {
            Func::Len => match arg(0) {
                Value::String(s) => Ok(Value::from(s.chars().count())),
                Value::Array(a) => Ok(Value::from(a.len())),
                Value::Object(o) => Ok(Value::from(o.len())),
                Value::Null => Ok(Value::from(0)),
                other => Err(eval_err(format!("len() not defined for {}", type_name(other)))),
            },
            Func::Lower => Ok(Value::String(as_str(arg(0), "lower()")?.to_lowercase())),
            Func::Upper => Ok(Value::String(as_str(arg(0), "upper()")?.to_uppercase())),
            Func::Trim => Ok(Value::String(as_str(arg(0), "trim()")?.trim().to_string())),
            Func::Contains => {
                let found = match arg(0) {
                    Value::String(s) => s.contains(&to_display_string(arg(1))),
                    Value::Array(items) => {
                        self.tick(items.len())?;
                        items.iter().any(|v| loose_equals(v, arg(1)))
                    }
                    Value::Object(map) => map.contains_key(&to_display_string(arg(1))),
                    Value::Null => false,
                    other => return Err(eval_err(format!("contains() not defined for {}", type_name(other)))),
                };
                Ok(Value::Bool(found))
            }
            Func::StartsWith => Ok(Value::Bool(
                as_str(arg(0), "starts_with()")?.starts_with(as_str(arg(1), "starts_with()")?),
            )),
            Func::EndsWith => Ok(Value::Bool(
                as_str(arg(0), "ends_with()")?.ends_with(as_str(arg(1), "ends_with()")?),
            )),
            Func::ToString => Ok(Value::String(to_display_string(arg(0)))),
            Func::ToNumber => Ok(match arg(0) {
                Value::Number(n) => Value::Number(n.clone()),
                Value::String(s) => s.trim().parse::<f64>().map(number).unwrap_or(Value::Null),
                Value::Bool(b) => Value::from(u8::from(*b)),
                _ => Value::Null,
            }),
            Func::Keys => match arg(0) {
                Value::Object(map) => Ok(Value::Array(map.keys().cloned().map(Value::String).collect())),
                other => Err(eval_err(format!("keys() expects an object, got {}", type_name(other)))),
            },
            Func::Join => {
                let Value::Array(items) = arg(0) else {
                    return Err(eval_err(format!("join() expects an array, got {}", type_name(arg(0)))));
                };
                self.tick(items.len())?;
                let sep = match args.get(1) {
                    Some(v) => as_str(v, "join()")?.to_string(),
                    None => ",".to_string(),
                };
                Ok(Value::String(
                    items.iter().map(to_display_string).collect::<Vec<_>>().join(&sep),
                ))
            }
            Func::Abs => Ok(number(as_num(arg(0), "abs()")?.abs())),
            Func::Round => {
                let n = as_num(arg(0), "round()")?;
                let digits = match args.get(1) {
                    Some(d) => as_num(d, "round()")?.clamp(0.0, 15.0) as i32,
                    None => 0,
                };
                let factor = 10f64.powi(digits);
                Ok(number((n * factor).round() / factor))
            }
            Func::Min | Func::Max => {
                let candidates: &[Value] = match args {
                    [Value::Array(items)] => items.as_slice(),
                    _ => args,
                };
                self.tick(candidates.len())?;
                let mut best: Option<f64> = None;
                for v in candidates {
                    let n = as_num(v, if func == Func::Min { "min()" } else { "max()" })?;
                    best = Some(match best {
                        None => n,
                        Some(b) if func == Func::Min => b.min(n),
                        Some(b) => b.max(n),
                    });
                }
                Ok(best.map(number).unwrap_or(Value::Null))
            }
        }
    }
}

fn member(target: &Value, name: &str) -> Value {
    match target {
        Value::Object(map) => map.get(name).cloned().unwrap_or(Value::Null),
        Value::Array(items) if name == "length" => Value::from(items.len()),
        Value::String(s) if name == "length" => Value::from(s.chars().count()),
        _ => Value::Null,
    }
}

fn index_value(target: &Value, index: &Value) -> Value {
    match (target, index) {
        (Value::Array(items), Value::Number(n)) => n
            .as_f64()
            .filter(|f| *f >= 0.0 && f.fract() == 0.0)
            .and_then(|f| items.get(f as usize))
            .cloned()
            .unwrap_or(Value::Null),
        (Value::Object(map), Value::String(key)) => map.get(key).cloned().unwrap_or(Value::Null),
        (Value::String(s), Value::Number(n)) => n
            .as_f64()
            .filter(|f| *f >= 0.0 && f.fract() == 0.0)
            .and_then(|f| s.chars().nth(f as usize))
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}
