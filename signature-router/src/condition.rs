//! Rule condition evaluation
//!
//! [`ConditionEvaluator`] is the seam for the condition language. The default
//! [`ExpressionEvaluator`] understands a small boolean language over the
//! transaction context:
//!
//! - literals: `1000`, `12.50`, `-3`, `'EUR'`, `"m-1"`, `true`, `false`, `null`
//! - fields: `amount` (alias `amount.value`), `amount.currency` (alias
//!   `currency`), `merchantId`, `orderId`, `description` (snake_case accepted)
//! - comparisons: `==`, `!=`, `>`, `>=`, `<`, `<=`
//! - composition: `&&`/`and`, `||`/`or`, `!`/`not`, parentheses
//!
//! A reference to an unknown field makes the whole condition a non-match.
//! Syntax and type errors are reported as [`ConditionError`].

use crate::types::TransactionContext;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Maximum accepted expression size in bytes.
const MAX_EXPRESSION_BYTES: usize = 4096;
/// Maximum nesting of parentheses and negations.
const MAX_NESTING: usize = 32;

/// Evaluates a condition expression against a transaction context
pub trait ConditionEvaluator: Send + Sync {
    /// Returns whether the condition holds.
    ///
    /// Missing fields yield `Ok(false)`; malformed expressions yield an error.
    fn evaluate(
        &self,
        expression: &str,
        context: &TransactionContext,
    ) -> std::result::Result<bool, ConditionError>;
}

/// Condition parse or evaluation failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConditionError {
    /// Blank expression
    #[error("expression is empty")]
    EmptyInput,

    /// Expression longer than the limit
    #[error("expression is {actual_bytes} bytes (max {max_bytes})")]
    InputTooLarge {
        /// Limit
        max_bytes: usize,
        /// Actual size
        actual_bytes: usize,
    },

    /// Too many nested groups
    #[error("nesting exceeds depth {max_depth} at {position}")]
    NestingTooDeep {
        /// Limit
        max_depth: usize,
        /// Byte offset
        position: usize,
    },

    /// Unexpected token
    #[error("unexpected `{found}` at {position}, expected {expected}")]
    UnexpectedToken {
        /// What the parser wanted
        expected: &'static str,
        /// What it saw
        found: String,
        /// Byte offset
        position: usize,
    },

    /// String literal without closing quote
    #[error("unterminated string starting at {position}")]
    UnterminatedString {
        /// Byte offset of the opening quote
        position: usize,
    },

    /// Numeric literal that does not parse
    #[error("invalid number `{raw}` at {position}")]
    InvalidNumber {
        /// Literal text
        raw: String,
        /// Byte offset
        position: usize,
    },

    /// Operator applied to incompatible values
    #[error("cannot apply `{op}` to {left} and {right}")]
    TypeMismatch {
        /// Operator
        op: &'static str,
        /// Left operand type
        left: &'static str,
        /// Right operand type
        right: &'static str,
    },

    /// Expression did not produce a boolean
    #[error("expression yields {found}, expected a boolean")]
    NotBoolean {
        /// Produced type
        found: &'static str,
    },
}

/// Default evaluator with a per-expression parse cache
#[derive(Default)]
pub struct ExpressionEvaluator {
    cache: DashMap<String, std::result::Result<Arc<Expr>, ConditionError>>,
}

impl ExpressionEvaluator {
    /// Create evaluator
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse without evaluating, for validating rule input
    pub fn validate(&self, expression: &str) -> std::result::Result<(), ConditionError> {
        self.compiled(expression).map(|_| ())
    }

    /// Number of cached expressions
    pub fn cached_expressions(&self) -> usize {
        self.cache.len()
    }

    fn compiled(&self, expression: &str) -> std::result::Result<Arc<Expr>, ConditionError> {
        if let Some(entry) = self.cache.get(expression) {
            return entry.value().clone();
        }
        let parsed = parse(expression).map(Arc::new);
        self.cache.insert(expression.to_string(), parsed.clone());
        parsed
    }
}

impl ConditionEvaluator for ExpressionEvaluator {
    fn evaluate(
        &self,
        expression: &str,
        context: &TransactionContext,
    ) -> std::result::Result<bool, ConditionError> {
        let expr = self.compiled(expression)?;
        match eval(&expr, context) {
            Ok(Value::Bool(result)) => Ok(result),
            Ok(other) => Err(ConditionError::NotBoolean {
                found: other.type_name(),
            }),
            Err(EvalError::MissingField(path)) => {
                debug!("Condition `{}` references missing field {}", expression, path);
                Ok(false)
            }
            Err(EvalError::Invalid(e)) => Err(e),
        }
    }
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token<'a> {
    Ident(&'a str),
    Number(&'a str),
    Text(String),
    True,
    False,
    Null,
    Compare(CompareOp),
    And,
    Or,
    Not,
    Dot,
    LParen,
    RParen,
    Eof,
}

impl Token<'_> {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) | Token::Number(s) => (*s).to_string(),
            Token::Text(s) => format!("'{}'", s),
            Token::True => "true".to_string(),
            Token::False => "false".to_string(),
            Token::Null => "null".to_string(),
            Token::Compare(op) => op.symbol().to_string(),
            Token::And => "&&".to_string(),
            Token::Or => "||".to_string(),
            Token::Not => "!".to_string(),
            Token::Dot => ".".to_string(),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
            Token::Eof => "end of input".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Spanned<'a> {
    token: Token<'a>,
    position: usize,
}

fn lex(input: &str) -> std::result::Result<Vec<Spanned<'_>>, ConditionError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() {
        let start = offset;
        let next = bytes.get(offset + 1).copied();
        let token = match bytes[offset] {
            b' ' | b'\t' | b'\n' | b'\r' => {
                offset += 1;
                continue;
            }
            b'(' => {
                offset += 1;
                Token::LParen
            }
            b')' => {
                offset += 1;
                Token::RParen
            }
            b'.' => {
                offset += 1;
                Token::Dot
            }
            b'!' if next == Some(b'=') => {
                offset += 2;
                Token::Compare(CompareOp::Ne)
            }
            b'!' => {
                offset += 1;
                Token::Not
            }
            b'=' if next == Some(b'=') => {
                offset += 2;
                Token::Compare(CompareOp::Eq)
            }
            b'>' if next == Some(b'=') => {
                offset += 2;
                Token::Compare(CompareOp::Ge)
            }
            b'>' => {
                offset += 1;
                Token::Compare(CompareOp::Gt)
            }
            b'<' if next == Some(b'=') => {
                offset += 2;
                Token::Compare(CompareOp::Le)
            }
            b'<' => {
                offset += 1;
                Token::Compare(CompareOp::Lt)
            }
            b'&' if next == Some(b'&') => {
                offset += 2;
                Token::And
            }
            b'|' if next == Some(b'|') => {
                offset += 2;
                Token::Or
            }
            quote @ (b'\'' | b'"') => {
                let body_start = offset + 1;
                let end = bytes[body_start..]
                    .iter()
                    .position(|&b| b == quote)
                    .map(|rel| body_start + rel)
                    .ok_or(ConditionError::UnterminatedString { position: start })?;
                offset = end + 1;
                Token::Text(input[body_start..end].to_string())
            }
            b'0'..=b'9' | b'-' if bytes[offset] != b'-' || next.map_or(false, |b| b.is_ascii_digit()) => {
                offset += 1;
                while offset < bytes.len() && (bytes[offset].is_ascii_digit() || bytes[offset] == b'.') {
                    offset += 1;
                }
                Token::Number(&input[start..offset])
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                while offset < bytes.len() && (bytes[offset].is_ascii_alphanumeric() || bytes[offset] == b'_') {
                    offset += 1;
                }
                match &input[start..offset] {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    ident => Token::Ident(ident),
                }
            }
            other => {
                return Err(ConditionError::UnexpectedToken {
                    expected: "operand or operator",
                    found: char::from(other).to_string(),
                    position: start,
                });
            }
        };
        tokens.push(Spanned { token, position: start });
    }

    if tokens.is_empty() {
        return Err(ConditionError::EmptyInput);
    }
    tokens.push(Spanned {
        token: Token::Eof,
        position: input.len(),
    });
    Ok(tokens)
}

// ============================================================================
// Parser
// ============================================================================

/// Parsed condition
#[derive(Debug, Clone, PartialEq)]
pub struct Expr(Node);

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(Value),
    Field(String),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Compare(CompareOp, Box<Node>, Box<Node>),
}

fn parse(input: &str) -> std::result::Result<Expr, ConditionError> {
    if input.len() > MAX_EXPRESSION_BYTES {
        return Err(ConditionError::InputTooLarge {
            max_bytes: MAX_EXPRESSION_BYTES,
            actual_bytes: input.len(),
        });
    }
    let tokens = lex(input)?;
    let mut parser = Parser {
        tokens,
        index: 0,
        nesting: 0,
    };
    let node = parser.parse_or()?;
    parser.expect(Token::Eof, "end of input")?;
    Ok(Expr(node))
}

struct Parser<'a> {
    tokens: Vec<Spanned<'a>>,
    index: usize,
    nesting: usize,
}

impl<'a> Parser<'a> {
    fn current(&self) -> &Spanned<'a> {
        // lex() always terminates the stream with Eof and parsing never moves past it
        &self.tokens[self.index.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) {
        if self.index < self.tokens.len() - 1 {
            self.index += 1;
        }
    }

    fn matches(&mut self, token: &Token<'_>) -> bool {
        if &self.current().token == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token<'_>, expected: &'static str) -> std::result::Result<(), ConditionError> {
        if self.matches(&token) {
            Ok(())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn unexpected(&self, expected: &'static str) -> ConditionError {
        let current = self.current();
        ConditionError::UnexpectedToken {
            expected,
            found: current.token.describe(),
            position: current.position,
        }
    }

    fn enter(&mut self) -> std::result::Result<(), ConditionError> {
        self.nesting += 1;
        if self.nesting > MAX_NESTING {
            return Err(ConditionError::NestingTooDeep {
                max_depth: MAX_NESTING,
                position: self.current().position,
            });
        }
        Ok(())
    }

    fn parse_or(&mut self) -> std::result::Result<Node, ConditionError> {
        let mut node = self.parse_and()?;
        while self.matches(&Token::Or) {
            let rhs = self.parse_and()?;
            node = Node::Or(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> std::result::Result<Node, ConditionError> {
        let mut node = self.parse_unary()?;
        while self.matches(&Token::And) {
            let rhs = self.parse_unary()?;
            node = Node::And(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_unary(&mut self) -> std::result::Result<Node, ConditionError> {
        if self.matches(&Token::Not) {
            self.enter()?;
            let inner = self.parse_unary()?;
            self.nesting -= 1;
            return Ok(Node::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> std::result::Result<Node, ConditionError> {
        let lhs = self.parse_operand()?;
        if let Token::Compare(op) = self.current().token {
            self.advance();
            let rhs = self.parse_operand()?;
            return Ok(Node::Compare(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_operand(&mut self) -> std::result::Result<Node, ConditionError> {
        let current = self.current().clone();
        match current.token {
            Token::LParen => {
                self.advance();
                self.enter()?;
                let inner = self.parse_or()?;
                self.nesting -= 1;
                self.expect(Token::RParen, "`)`")?;
                Ok(inner)
            }
            Token::Number(raw) => {
                self.advance();
                Decimal::from_str(raw)
                    .map(|n| Node::Literal(Value::Number(n)))
                    .map_err(|_| ConditionError::InvalidNumber {
                        raw: raw.to_string(),
                        position: current.position,
                    })
            }
            Token::Text(text) => {
                self.advance();
                Ok(Node::Literal(Value::Text(text)))
            }
            Token::True => {
                self.advance();
                Ok(Node::Literal(Value::Bool(true)))
            }
            Token::False => {
                self.advance();
                Ok(Node::Literal(Value::Bool(false)))
            }
            Token::Null => {
                self.advance();
                Ok(Node::Literal(Value::Null))
            }
            Token::Ident(first) => {
                self.advance();
                let mut path = first.to_string();
                while self.matches(&Token::Dot) {
                    match self.current().token {
                        Token::Ident(segment) => {
                            path.push('.');
                            path.push_str(segment);
                            self.advance();
                        }
                        _ => return Err(self.unexpected("field name after `.`")),
                    }
                }
                Ok(Node::Field(path))
            }
            _ => Err(self.unexpected("operand")),
        }
    }
}

// ============================================================================
// Evaluation
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Number(Decimal),
    Text(String),
    Bool(bool),
    Null,
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Text(_) => "string",
            Value::Bool(_) => "boolean",
            Value::Null => "null",
        }
    }
}

enum EvalError {
    MissingField(String),
    Invalid(ConditionError),
}

impl From<ConditionError> for EvalError {
    fn from(e: ConditionError) -> Self {
        EvalError::Invalid(e)
    }
}

fn resolve_field(path: &str, context: &TransactionContext) -> Option<Value> {
    let value = match path {
        "amount" | "amount.value" => Value::Number(context.amount.value),
        "currency" | "amount.currency" => Value::Text(context.amount.currency.clone()),
        "merchantId" | "merchant_id" => Value::Text(context.merchant_id.clone()),
        "orderId" | "order_id" => Value::Text(context.order_id.clone()),
        "description" => context
            .description
            .clone()
            .map(Value::Text)
            .unwrap_or(Value::Null),
        _ => return None,
    };
    Some(value)
}

fn eval(expr: &Expr, context: &TransactionContext) -> std::result::Result<Value, EvalError> {
    eval_node(&expr.0, context)
}

fn eval_node(node: &Node, context: &TransactionContext) -> std::result::Result<Value, EvalError> {
    match node {
        Node::Literal(value) => Ok(value.clone()),
        Node::Field(path) => {
            resolve_field(path, context).ok_or_else(|| EvalError::MissingField(path.clone()))
        }
        Node::Not(inner) => Ok(Value::Bool(!eval_bool(inner, context)?)),
        Node::And(lhs, rhs) => {
            if !eval_bool(lhs, context)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval_bool(rhs, context)?))
        }
        Node::Or(lhs, rhs) => {
            if eval_bool(lhs, context)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval_bool(rhs, context)?))
        }
        Node::Compare(op, lhs, rhs) => {
            let left = eval_node(lhs, context)?;
            let right = eval_node(rhs, context)?;
            Ok(Value::Bool(compare(*op, &left, &right)?))
        }
    }
}

fn eval_bool(node: &Node, context: &TransactionContext) -> std::result::Result<bool, EvalError> {
    match eval_node(node, context)? {
        Value::Bool(b) => Ok(b),
        other => Err(EvalError::Invalid(ConditionError::NotBoolean {
            found: other.type_name(),
        })),
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> std::result::Result<bool, ConditionError> {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => Some(a.cmp(b)),
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => {
            return equality(op, a == b, left, right);
        }
        (Value::Null, _) | (_, Value::Null) => {
            return equality(op, left == right, left, right);
        }
        _ => None,
    };

    let ordering = ordering.ok_or(ConditionError::TypeMismatch {
        op: op.symbol(),
        left: left.type_name(),
        right: right.type_name(),
    })?;

    Ok(match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
    })
}

fn equality(op: CompareOp, equal: bool, left: &Value, right: &Value) -> std::result::Result<bool, ConditionError> {
    match op {
        CompareOp::Eq => Ok(equal),
        CompareOp::Ne => Ok(!equal),
        _ => Err(ConditionError::TypeMismatch {
            op: op.symbol(),
            left: left.type_name(),
            right: right.type_name(),
        }),
    }
}
