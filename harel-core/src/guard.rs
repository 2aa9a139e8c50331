//! Guard expression evaluation.
//!
//! Guards are boolean expressions over the machine context and the event
//! being processed. The expression language supports:
//!
//! - `ctx.field` / `event.field` - field access (truthy check)
//! - `ctx.field.nested` - nested field access
//! - `ctx.field == value` - equality (strings, numbers, booleans, null)
//! - `ctx.field != value` - inequality
//! - `ctx.field > value` - greater than (numbers)
//! - `ctx.field >= value` - greater or equal (numbers)
//! - `ctx.field < value` - less than (numbers)
//! - `ctx.field <= value` - less or equal (numbers)
//! - `!expr` - logical NOT
//! - `expr && expr` - logical AND (higher precedence than OR)
//! - `expr || expr` - logical OR
//! - `(expr)` - grouping for precedence control
//!
//! A guard string that is a bare identifier (`isValid`) instead names a
//! guard function registered in [`Implementations`].
//!
//! Examples:
//! - `ctx.enabled` - true if enabled is truthy
//! - `ctx.attempts < 3 && event.retryable` - compound condition
//! - `event.status == "ok"` - string comparison on the event payload

use crate::error::CoreError;
use crate::event::Event;
use crate::implementations::Implementations;
use serde_json::Value;
use std::cmp::Ordering;

/// Where a guard field is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Context,
    Event,
}

/// A field reference such as `ctx.order.paid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRef {
    pub scope: Scope,
    pub path: String,
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CmpOp {
    /// Operator tokens, longest first so `>=` is never read as `>`.
    const TOKENS: [(&'static str, CmpOp); 6] = [
        ("==", CmpOp::Eq),
        ("!=", CmpOp::Ne),
        (">=", CmpOp::Ge),
        ("<=", CmpOp::Le),
        (">", CmpOp::Gt),
        ("<", CmpOp::Lt),
    ];

    /// Ordering operators only accept numeric operands.
    fn is_ordering(self) -> bool {
        !matches!(self, CmpOp::Eq | CmpOp::Ne)
    }

    fn apply(self, actual: &Value, expected: &Value) -> bool {
        let ordering = || actual.as_f64()?.partial_cmp(&expected.as_f64()?);
        match self {
            CmpOp::Eq => values_equal(actual, expected),
            CmpOp::Ne => !values_equal(actual, expected),
            CmpOp::Gt => ordering() == Some(Ordering::Greater),
            CmpOp::Ge => matches!(ordering(), Some(Ordering::Greater | Ordering::Equal)),
            CmpOp::Lt => ordering() == Some(Ordering::Less),
            CmpOp::Le => matches!(ordering(), Some(Ordering::Less | Ordering::Equal)),
        }
    }
}

/// A parsed guard expression.
#[derive(Debug, Clone)]
pub enum GuardExpr {
    /// Field is truthy.
    Truthy(FieldRef),
    /// Field compared against a literal.
    Compare(FieldRef, CmpOp, Value),
    And(Box<GuardExpr>, Box<GuardExpr>),
    Or(Box<GuardExpr>, Box<GuardExpr>),
    Not(Box<GuardExpr>),
}

impl GuardExpr {
    /// Parses a guard expression from a string.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(invalid("empty guard expression"));
        }

        let mut parser = Parser::new(s);
        let expr = parser.parse_or()?;
        parser.skip_whitespace();
        if !parser.rest().is_empty() {
            return Err(invalid(format!("unexpected input at '{}'", parser.rest())));
        }
        Ok(expr)
    }

    /// Evaluates the guard against a context and an event (as JSON).
    pub fn evaluate(&self, ctx: &Value, event: &Value) -> bool {
        let read = |field: &FieldRef| match field.scope {
            Scope::Context => lookup(ctx, &field.path),
            Scope::Event => lookup(event, &field.path),
        };

        match self {
            GuardExpr::Truthy(field) => is_truthy(read(field)),
            GuardExpr::Compare(field, op, expected) => op.apply(read(field), expected),
            GuardExpr::And(left, right) => left.evaluate(ctx, event) && right.evaluate(ctx, event),
            GuardExpr::Or(left, right) => left.evaluate(ctx, event) || right.evaluate(ctx, event),
            GuardExpr::Not(inner) => !inner.evaluate(ctx, event),
        }
    }
}

/// A compiled transition guard.
#[derive(Debug, Clone)]
pub enum Guard {
    /// Inline expression.
    Expr { source: String, expr: GuardExpr },
    /// Guard function looked up in the machine's implementations.
    Named(String),
}

impl Guard {
    /// Compiles a guard string, checking named guards against `implementations`.
    pub fn compile(s: &str, implementations: &Implementations) -> Result<Self, CoreError> {
        let s = s.trim();
        if is_identifier(s) {
            if !implementations.has_guard(s) {
                return Err(CoreError::invalid_definition(format!(
                    "guard '{}' is not implemented",
                    s
                )));
            }
            return Ok(Guard::Named(s.to_string()));
        }
        Ok(Guard::Expr {
            source: s.to_string(),
            expr: GuardExpr::parse(s)?,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Guard::Expr { source, .. } => source,
            Guard::Named(name) => name,
        }
    }
}

fn invalid(reason: impl Into<String>) -> CoreError {
    CoreError::InvalidGuard {
        reason: reason.into(),
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

static NULL: Value = Value::Null;

/// Follows a dotted path; anything missing reads as null.
fn lookup<'v>(root: &'v Value, path: &str) -> &'v Value {
    path.split('.')
        .try_fold(root, |current, key| current.as_object()?.get(key))
        .unwrap_or(&NULL)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64() == b.as_f64(),
        _ => a == b,
    }
}

/// Recursive descent parser: `or := and ('||' and)*`,
/// `and := unary ('&&' unary)*`, `unary := '!' unary | primary`,
/// `primary := '(' or ')' | field (op literal)?`.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

type Combine = fn(Box<GuardExpr>, Box<GuardExpr>) -> GuardExpr;

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn parse_or(&mut self) -> Result<GuardExpr, CoreError> {
        self.parse_chain("||", Self::parse_and, GuardExpr::Or)
    }

    fn parse_and(&mut self) -> Result<GuardExpr, CoreError> {
        self.parse_chain("&&", Self::parse_unary, GuardExpr::And)
    }

    /// Left-associative chain of `operand (token operand)*`.
    fn parse_chain(
        &mut self,
        token: &str,
        operand: fn(&mut Self) -> Result<GuardExpr, CoreError>,
        combine: Combine,
    ) -> Result<GuardExpr, CoreError> {
        let mut left = operand(self)?;
        while self.eat(token) {
            let right = operand(self)?;
            left = combine(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<GuardExpr, CoreError> {
        if self.eat("!") {
            let inner = self.parse_unary()?;
            return Ok(GuardExpr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<GuardExpr, CoreError> {
        if self.eat("(") {
            let expr = self.parse_or()?;
            if !self.eat(")") {
                return Err(invalid("expected ')'"));
            }
            return Ok(expr);
        }

        let field = self.parse_field()?;
        self.skip_whitespace();
        let Some(&(token, op)) = CmpOp::TOKENS.iter().find(|(t, _)| self.rest().starts_with(t))
        else {
            return Ok(GuardExpr::Truthy(field));
        };
        self.pos += token.len();

        self.skip_whitespace();
        let literal = if op.is_ordering() {
            self.parse_number()?
        } else {
            self.parse_literal()?
        };
        Ok(GuardExpr::Compare(field, op, literal))
    }

    fn parse_field(&mut self) -> Result<FieldRef, CoreError> {
        let scope = if self.eat("ctx.") {
            Scope::Context
        } else if self.eat("event.") {
            Scope::Event
        } else {
            return Err(invalid("field must start with 'ctx.' or 'event.'"));
        };

        let path = self.take_while(|c| c.is_alphanumeric() || c == '_' || c == '.');
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(invalid(format!("invalid field name '{}'", path)));
        }
        Ok(FieldRef {
            scope,
            path: path.to_string(),
        })
    }

    fn parse_literal(&mut self) -> Result<Value, CoreError> {
        const KEYWORDS: [(&str, Value); 3] = [
            ("true", Value::Bool(true)),
            ("false", Value::Bool(false)),
            ("null", Value::Null),
        ];
        for (keyword, value) in KEYWORDS {
            if self.eat(keyword) {
                return Ok(value);
            }
        }
        if self.eat("\"") {
            return self.parse_string();
        }
        self.parse_number()
    }

    /// Reads the remainder of a string literal whose opening quote has been
    /// consumed. `\x` yields `x`.
    fn parse_string(&mut self) -> Result<Value, CoreError> {
        let mut out = String::new();
        let mut chars = self.rest().char_indices();
        while let Some((offset, c)) = chars.next() {
            match c {
                '"' => {
                    self.pos += offset + 1;
                    return Ok(Value::String(out));
                }
                '\\' => {
                    if let Some((_, escaped)) = chars.next() {
                        out.push(escaped);
                    }
                }
                _ => out.push(c),
            }
        }
        Err(invalid("unterminated string"))
    }

    fn parse_number(&mut self) -> Result<Value, CoreError> {
        let text = self.take_while(|c| c.is_ascii_digit() || c == '-' || c == '.');
        text.parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| invalid(format!("invalid number: '{}'", text)))
    }

    /// Skips whitespace, then consumes `token` if it comes next.
    fn eat(&mut self, token: &str) -> bool {
        self.skip_whitespace();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn take_while(&mut self, accept: impl Fn(char) -> bool) -> &'a str {
        let rest = self.rest();
        let len = rest.find(|c: char| !accept(c)).unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }

    fn skip_whitespace(&mut self) {
        self.take_while(char::is_whitespace);
    }
}

/// Evaluates compiled guards against a context and event.
pub struct GuardEvaluator;

impl GuardEvaluator {
    /// Evaluates a guard. Named guards that return an error are reported as
    /// [`CoreError::GuardFailed`].
    pub fn evaluate(
        guard: &Guard,
        implementations: &Implementations,
        ctx: &Value,
        event: &Event,
    ) -> Result<bool, CoreError> {
        match guard {
            Guard::Expr { expr, .. } => Ok(expr.evaluate(ctx, &event.to_value())),
            Guard::Named(name) => implementations
                .call_guard(name, ctx, event)
                .map_err(|e| CoreError::GuardFailed {
                    guard: name.clone(),
                    reason: e.to_string(),
                }),
        }
    }

    /// Evaluates an optional guard (None = always true).
    pub fn evaluate_opt(
        guard: Option<&Guard>,
        implementations: &Implementations,
        ctx: &Value,
        event: &Event,
    ) -> Result<bool, CoreError> {
        match guard {
            Some(g) => Self::evaluate(g, implementations, ctx, event),
            None => Ok(true),
        }
    }
}
