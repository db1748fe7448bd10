//! Sandboxed arithmetic and boolean expressions over scan variables.
//!
//! Derived variables and conditions are written as small expressions such as
//! `qx - 2` or `qy >= qx - 2 and n_split > 1`. They are tokenized and parsed
//! with a recursive descent parser into an AST that can only reference bound
//! variables, a fixed set of math functions and the constants `pi` and `e`.

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Syntax error in '{expression}' at offset {offset}: {message}")]
    Syntax {
        expression: String,
        offset: usize,
        message: String,
    },
    #[error("Expression references '{0}' which is not bound")]
    UnresolvedReference(String),
    #[error("Unknown function '{0}'")]
    UnknownFunction(String),
    #[error("Function '{name}' expects {expected} argument(s), got {found}")]
    Arity {
        name: String,
        expected: &'static str,
        found: usize,
    },
    #[error("Operation '{operation}' cannot be applied to {found}")]
    TypeMismatch {
        operation: &'static str,
        found: String,
    },
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Expression produced a non-finite number")]
    NonFinite,
}

/// A single scan value as seen by expressions, templates and the naming engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl Scalar {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Bool(_) => "boolean",
            Self::Text(_) => "string",
        }
    }

    /// Round floats to a fixed number of decimals, other values are untouched
    pub fn rounded(self, decimals: i32) -> Self {
        match self {
            Self::Float(value) => Self::Float(round_to(value, decimals)),
            other => other,
        }
    }

    pub fn to_yaml(&self) -> serde_yaml::Value {
        match self {
            Self::Int(value) => serde_yaml::Value::from(*value),
            Self::Float(value) => serde_yaml::Value::from(*value),
            Self::Bool(value) => serde_yaml::Value::Bool(*value),
            Self::Text(value) => serde_yaml::Value::String(value.clone()),
        }
    }

    /// Convert a yaml scalar, mappings and sequences are rejected
    pub fn from_yaml(value: &serde_yaml::Value) -> Option<Self> {
        match value {
            serde_yaml::Value::Bool(value) => Some(Self::Bool(*value)),
            serde_yaml::Value::Number(number) => number
                .as_i64()
                .map(Self::Int)
                .or_else(|| number.as_f64().map(Self::Float)),
            serde_yaml::Value::String(value) => Some(Self::Text(value.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => f.write_str(&float_repr(*value)),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "{value}"),
        }
    }
}

/// Shortest round-trip rendering of a float, positional for exponents in
/// `-4..16` and `1e+16` style otherwise, integral values keep their `.0`
pub fn float_repr(value: f64) -> String {
    if !value.is_finite() {
        return if value.is_nan() {
            "nan".to_string()
        } else if value > 0.0 {
            "inf".to_string()
        } else {
            "-inf".to_string()
        };
    }

    // `{:e}` yields the shortest round-trip digits, e.g. `-1.25e-7`
    let scientific = format!("{value:e}");
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let (sign, mantissa) = match mantissa.strip_prefix('-') {
        Some(mantissa) => ("-", mantissa),
        None => ("", mantissa),
    };
    let digits = mantissa.replace('.', "");

    if !(-4..16).contains(&exponent) {
        let (first, rest) = digits.split_at(1);
        let fraction = if rest.is_empty() {
            String::new()
        } else {
            format!(".{rest}")
        };
        let exponent_sign = if exponent < 0 { '-' } else { '+' };
        return format!("{sign}{first}{fraction}e{exponent_sign}{:02}", exponent.abs());
    }

    if exponent < 0 {
        let zeros = "0".repeat((-exponent - 1) as usize);
        return format!("{sign}0.{zeros}{digits}");
    }

    let integral_len = exponent as usize + 1;
    if digits.len() <= integral_len {
        let zeros = "0".repeat(integral_len - digits.len());
        format!("{sign}{digits}{zeros}.0")
    } else {
        let (integral, fraction) = digits.split_at(integral_len);
        format!("{sign}{integral}.{fraction}")
    }
}

// remainder taking the sign of the divisor
fn floor_rem(a: f64, b: f64) -> f64 {
    let rem = a % b;
    if rem != 0.0 && (rem < 0.0) != (b < 0.0) {
        rem + b
    } else {
        rem
    }
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    let rounded = (value * factor).round() / factor;

    // avoid negative zero leaking into names
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(Scalar),
    Text(String),
    Ident(String),
    Op(BinaryOp),
    Minus,
    Not,
    LParen,
    RParen,
    Comma,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Pow => "**",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "and",
            Self::Or => "or",
        }
    }

    fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(Scalar),
    Variable(String),
    Neg(Box<Node>),
    Not(Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
    Call(String, Vec<Node>),
}

const FUNCTIONS: [&str; 13] = [
    "abs", "sqrt", "exp", "log", "log10", "sin", "cos", "tan", "floor", "ceil", "round", "min",
    "max",
];

/// A parsed, side-effect free expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

impl FromStr for Expression {
    type Err = ExpressionError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        Self::parse(source)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            source,
            tokens,
            position: 0,
        };
        let root = parser.parse_or()?;

        if let Some((offset, token)) = parser.tokens.get(parser.position) {
            return Err(parser.error_at(*offset, format!("unexpected token {token:?}")));
        }

        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// All identifiers read by the expression (functions excluded)
    pub fn references(&self) -> BTreeSet<String> {
        let mut references = BTreeSet::new();
        collect_references(&self.root, &mut references);
        references
    }

    pub fn evaluate(&self, context: &BTreeMap<String, Scalar>) -> Result<Scalar, ExpressionError> {
        evaluate(&self.root, context)
    }

    /// Evaluate as a filter predicate, non boolean results are rejected
    pub fn evaluate_predicate(
        &self,
        context: &BTreeMap<String, Scalar>,
    ) -> Result<bool, ExpressionError> {
        match self.evaluate(context)? {
            Scalar::Bool(value) => Ok(value),
            other => Err(ExpressionError::TypeMismatch {
                operation: "condition",
                found: other.type_name().to_string(),
            }),
        }
    }
}

fn collect_references(node: &Node, references: &mut BTreeSet<String>) {
    match node {
        Node::Literal(_) => {}
        Node::Variable(name) => {
            references.insert(name.clone());
        }
        Node::Neg(inner) | Node::Not(inner) => collect_references(inner, references),
        Node::Binary(_, left, right) => {
            collect_references(left, references);
            collect_references(right, references);
        }
        Node::Call(_, arguments) => arguments
            .iter()
            .for_each(|argument| collect_references(argument, references)),
    }
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let syntax = |offset: usize, message: String| ExpressionError::Syntax {
        expression: source.to_string(),
        offset,
        message,
    };
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut index = 0;

    while index < bytes.len() {
        let current = bytes[index] as char;
        let next = bytes.get(index + 1).map(|byte| *byte as char);
        let start = index;

        match current {
            c if c.is_ascii_whitespace() => {
                index += 1;
                continue;
            }
            '0'..='9' | '.' => {
                let mut is_float = false;
                while index < bytes.len() {
                    let c = bytes[index] as char;
                    if c.is_ascii_digit() {
                        index += 1;
                    } else if c == '.' {
                        is_float = true;
                        index += 1;
                    } else if (c == 'e' || c == 'E') && index > start {
                        is_float = true;
                        index += 1;
                        if matches!(bytes.get(index).map(|byte| *byte as char), Some('+' | '-')) {
                            index += 1;
                        }
                    } else {
                        break;
                    }
                }
                let literal = &source[start..index];
                let number = if is_float {
                    literal.parse::<f64>().map(Scalar::Float).ok()
                } else {
                    literal.parse::<i64>().map(Scalar::Int).ok()
                };
                match number {
                    Some(number) => tokens.push((start, Token::Literal(number))),
                    None => return Err(syntax(start, format!("invalid number '{literal}'"))),
                }
                continue;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                while index < bytes.len()
                    && ((bytes[index] as char).is_ascii_alphanumeric() || bytes[index] == b'_')
                {
                    index += 1;
                }
                let token = match &source[start..index] {
                    "and" => Token::Op(BinaryOp::And),
                    "or" => Token::Op(BinaryOp::Or),
                    "not" => Token::Not,
                    "true" | "True" => Token::Literal(Scalar::Bool(true)),
                    "false" | "False" => Token::Literal(Scalar::Bool(false)),
                    ident => Token::Ident(ident.to_string()),
                };
                tokens.push((start, token));
                continue;
            }
            '\'' | '"' => {
                let quote = bytes[index];
                index += 1;
                let content_start = index;
                while index < bytes.len() && bytes[index] != quote {
                    index += 1;
                }
                if index == bytes.len() {
                    return Err(syntax(start, "unterminated string".to_string()));
                }
                tokens.push((start, Token::Text(source[content_start..index].to_string())));
                index += 1;
                continue;
            }
            _ => {}
        }

        let (token, width) = match (current, next) {
            ('*', Some('*')) => (Token::Op(BinaryOp::Pow), 2),
            ('=', Some('=')) => (Token::Op(BinaryOp::Eq), 2),
            ('!', Some('=')) => (Token::Op(BinaryOp::Ne), 2),
            ('<', Some('=')) => (Token::Op(BinaryOp::Le), 2),
            ('>', Some('=')) => (Token::Op(BinaryOp::Ge), 2),
            ('&', Some('&')) => (Token::Op(BinaryOp::And), 2),
            ('|', Some('|')) => (Token::Op(BinaryOp::Or), 2),
            ('+', _) => (Token::Op(BinaryOp::Add), 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Op(BinaryOp::Mul), 1),
            ('/', _) => (Token::Op(BinaryOp::Div), 1),
            ('%', _) => (Token::Op(BinaryOp::Rem), 1),
            ('<', _) => (Token::Op(BinaryOp::Lt), 1),
            ('>', _) => (Token::Op(BinaryOp::Gt), 1),
            ('!', _) => (Token::Not, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            (',', _) => (Token::Comma, 1),
            (other, _) => return Err(syntax(start, format!("unexpected character '{other}'"))),
        };
        tokens.push((start, token));
        index += width;
    }

    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<(usize, Token)>,
    position: usize,
}

impl Parser<'_> {
    fn error_at(&self, offset: usize, message: String) -> ExpressionError {
        ExpressionError::Syntax {
            expression: self.source.to_string(),
            offset,
            message,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position).map(|(_, token)| token)
    }

    fn advance(&mut self) -> Option<(usize, Token)> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        match self.advance() {
            Some((_, token)) if token == expected => Ok(()),
            Some((offset, token)) => {
                Err(self.error_at(offset, format!("expected {expected:?}, found {token:?}")))
            }
            None => Err(self.error_at(self.source.len(), format!("expected {expected:?}"))),
        }
    }

    fn parse_or(&mut self) -> Result<Node, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Op(BinaryOp::Or)) {
            self.advance();
            let right = self.parse_and()?;
            left = Node::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Node, ExpressionError> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::Op(BinaryOp::And)) {
            self.advance();
            let right = self.parse_not()?;
            left = Node::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Node, ExpressionError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            return Ok(Node::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Node, ExpressionError> {
        let left = self.parse_additive()?;
        match self.peek() {
            Some(Token::Op(op)) if op.is_comparison() => {
                let op = *op;
                self.advance();
                let right = self.parse_additive()?;
                if let Some((offset, Token::Op(next))) = self.tokens.get(self.position) {
                    if next.is_comparison() {
                        return Err(
                            self.error_at(*offset, "chained comparisons are not supported".into())
                        );
                    }
                }
                Ok(Node::Binary(op, Box::new(left), Box::new(right)))
            }
            _ => Ok(left),
        }
    }

    fn parse_additive(&mut self) -> Result<Node, ExpressionError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(BinaryOp::Add)) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Node::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Node, ExpressionError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(op @ (BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem))) => *op,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Node::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Node, ExpressionError> {
        if self.peek() == Some(&Token::Minus) {
            self.advance();
            return Ok(Node::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<Node, ExpressionError> {
        let base = self.parse_primary()?;
        if self.peek() == Some(&Token::Op(BinaryOp::Pow)) {
            self.advance();
            // right associative, binds tighter than unary minus on its left
            let exponent = self.parse_unary()?;
            return Ok(Node::Binary(
                BinaryOp::Pow,
                Box::new(base),
                Box::new(exponent),
            ));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Node, ExpressionError> {
        match self.advance() {
            Some((_, Token::Literal(value))) => Ok(Node::Literal(value)),
            Some((_, Token::Text(value))) => Ok(Node::Literal(Scalar::Text(value))),
            Some((offset, Token::Ident(name))) => {
                if self.peek() != Some(&Token::LParen) {
                    return Ok(Node::Variable(name));
                }
                if !FUNCTIONS.contains(&name.as_str()) {
                    return Err(self.error_at(offset, format!("unknown function '{name}'")));
                }
                self.advance();
                let mut arguments = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        arguments.push(self.parse_or()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RParen)?;
                Ok(Node::Call(name, arguments))
            }
            Some((_, Token::LParen)) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some((offset, token)) => {
                Err(self.error_at(offset, format!("unexpected token {token:?}")))
            }
            None => Err(self.error_at(self.source.len(), "unexpected end of input".into())),
        }
    }
}

fn numeric(value: &Scalar, operation: &'static str) -> Result<f64, ExpressionError> {
    value.as_f64().ok_or_else(|| ExpressionError::TypeMismatch {
        operation,
        found: value.type_name().to_string(),
    })
}

fn boolean(value: &Scalar, operation: &'static str) -> Result<bool, ExpressionError> {
    value.as_bool().ok_or_else(|| ExpressionError::TypeMismatch {
        operation,
        found: value.type_name().to_string(),
    })
}

fn finite(value: f64) -> Result<Scalar, ExpressionError> {
    if value.is_finite() {
        Ok(Scalar::Float(value))
    } else {
        Err(ExpressionError::NonFinite)
    }
}

fn evaluate(node: &Node, context: &BTreeMap<String, Scalar>) -> Result<Scalar, ExpressionError> {
    match node {
        Node::Literal(value) => Ok(value.clone()),
        Node::Variable(name) => match context.get(name) {
            Some(value) => Ok(value.clone()),
            None => match name.as_str() {
                "pi" => Ok(Scalar::Float(std::f64::consts::PI)),
                "e" => Ok(Scalar::Float(std::f64::consts::E)),
                _ => Err(ExpressionError::UnresolvedReference(name.clone())),
            },
        },
        Node::Neg(inner) => match evaluate(inner, context)? {
            Scalar::Int(value) => Ok(value
                .checked_neg()
                .map(Scalar::Int)
                .unwrap_or(Scalar::Float(-(value as f64)))),
            other => finite(-numeric(&other, "-")?),
        },
        Node::Not(inner) => Ok(Scalar::Bool(!boolean(&evaluate(inner, context)?, "not")?)),
        Node::Binary(BinaryOp::And, left, right) => {
            if !boolean(&evaluate(left, context)?, "and")? {
                return Ok(Scalar::Bool(false));
            }
            Ok(Scalar::Bool(boolean(&evaluate(right, context)?, "and")?))
        }
        Node::Binary(BinaryOp::Or, left, right) => {
            if boolean(&evaluate(left, context)?, "or")? {
                return Ok(Scalar::Bool(true));
            }
            Ok(Scalar::Bool(boolean(&evaluate(right, context)?, "or")?))
        }
        Node::Binary(op, left, right) => {
            let left = evaluate(left, context)?;
            let right = evaluate(right, context)?;
            if op.is_comparison() {
                compare(*op, &left, &right)
            } else {
                arithmetic(*op, &left, &right)
            }
        }
        Node::Call(name, arguments) => {
            let values = arguments
                .iter()
                .map(|argument| evaluate(argument, context))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, &values)
        }
    }
}

fn compare(op: BinaryOp, left: &Scalar, right: &Scalar) -> Result<Scalar, ExpressionError> {
    let result = match (left, right) {
        (Scalar::Text(a), Scalar::Text(b)) => match op {
            BinaryOp::Eq => a == b,
            BinaryOp::Ne => a != b,
            _ => {
                return Err(ExpressionError::TypeMismatch {
                    operation: op.symbol(),
                    found: "string".to_string(),
                })
            }
        },
        (Scalar::Bool(a), Scalar::Bool(b)) => match op {
            BinaryOp::Eq => a == b,
            BinaryOp::Ne => a != b,
            _ => {
                return Err(ExpressionError::TypeMismatch {
                    operation: op.symbol(),
                    found: "boolean".to_string(),
                })
            }
        },
        (Scalar::Int(a), Scalar::Int(b)) => match op {
            BinaryOp::Eq => a == b,
            BinaryOp::Ne => a != b,
            BinaryOp::Lt => a < b,
            BinaryOp::Le => a <= b,
            BinaryOp::Gt => a > b,
            _ => a >= b,
        },
        _ if left.as_f64().is_some() && right.as_f64().is_some() => {
            let (a, b) = (numeric(left, op.symbol())?, numeric(right, op.symbol())?);
            match op {
                BinaryOp::Eq => a == b,
                BinaryOp::Ne => a != b,
                BinaryOp::Lt => a < b,
                BinaryOp::Le => a <= b,
                BinaryOp::Gt => a > b,
                _ => a >= b,
            }
        }
        // values of different kinds are never equal
        _ => match op {
            BinaryOp::Eq => false,
            BinaryOp::Ne => true,
            _ => {
                return Err(ExpressionError::TypeMismatch {
                    operation: op.symbol(),
                    found: format!("{} and {}", left.type_name(), right.type_name()),
                })
            }
        },
    };

    Ok(Scalar::Bool(result))
}

fn arithmetic(op: BinaryOp, left: &Scalar, right: &Scalar) -> Result<Scalar, ExpressionError> {
    if let (Scalar::Int(a), Scalar::Int(b)) = (left, right) {
        let exact = match op {
            BinaryOp::Add => a.checked_add(*b),
            BinaryOp::Sub => a.checked_sub(*b),
            BinaryOp::Mul => a.checked_mul(*b),
            BinaryOp::Rem if *b == 0 => return Err(ExpressionError::DivisionByZero),
            BinaryOp::Rem => a
                .checked_rem(*b)
                .map(|rem| if rem != 0 && (rem < 0) != (*b < 0) { rem + b } else { rem }),
            BinaryOp::Pow => u32::try_from(*b).ok().and_then(|exp| a.checked_pow(exp)),
            _ => None,
        };
        if let Some(value) = exact {
            return Ok(Scalar::Int(value));
        }
    }

    let (a, b) = (numeric(left, op.symbol())?, numeric(right, op.symbol())?);
    match op {
        BinaryOp::Add => finite(a + b),
        BinaryOp::Sub => finite(a - b),
        BinaryOp::Mul => finite(a * b),
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => Err(ExpressionError::DivisionByZero),
        BinaryOp::Div => finite(a / b),
        BinaryOp::Rem => finite(floor_rem(a, b)),
        _ => finite(a.powf(b)),
    }
}

fn call(name: &str, values: &[Scalar]) -> Result<Scalar, ExpressionError> {
    let arity = |expected: &'static str| ExpressionError::Arity {
        name: name.to_string(),
        expected,
        found: values.len(),
    };

    match name {
        "min" | "max" => {
            let (first, rest) = values.split_first().ok_or_else(|| arity("at least 1"))?;
            let mut best = first.clone();
            for value in rest {
                let replace = match compare(BinaryOp::Lt, value, &best)? {
                    Scalar::Bool(less) => less == (name == "min"),
                    _ => false,
                };
                if replace {
                    best = value.clone();
                }
            }
            numeric(&best, "min/max")?;
            Ok(best)
        }
        "round" if values.len() == 2 => {
            let digits = match &values[1] {
                Scalar::Int(digits) => i32::try_from(*digits).map_err(|_| ExpressionError::NonFinite)?,
                other => {
                    return Err(ExpressionError::TypeMismatch {
                        operation: "round",
                        found: other.type_name().to_string(),
                    })
                }
            };
            finite(round_to(numeric(&values[0], "round")?, digits))
        }
        _ => {
            let [value] = values else {
                return Err(arity("1"));
            };
            if let Scalar::Int(integer) = value {
                match name {
                    "abs" => {
                        return integer
                            .checked_abs()
                            .map(Scalar::Int)
                            .ok_or(ExpressionError::NonFinite)
                    }
                    "floor" | "ceil" | "round" => return Ok(Scalar::Int(*integer)),
                    _ => {}
                }
            }
            let x = numeric(value, "function call")?;
            match name {
                "abs" => finite(x.abs()),
                "sqrt" => finite(x.sqrt()),
                "exp" => finite(x.exp()),
                "log" => finite(x.ln()),
                "log10" => finite(x.log10()),
                "sin" => finite(x.sin()),
                "cos" => finite(x.cos()),
                "tan" => finite(x.tan()),
                "floor" => to_integer(x.floor()),
                "ceil" => to_integer(x.ceil()),
                "round" => to_integer(x.round()),
                other => Err(ExpressionError::UnknownFunction(other.to_string())),
            }
        }
    }
}

fn to_integer(value: f64) -> Result<Scalar, ExpressionError> {
    if value.is_finite() && value.abs() < i64::MAX as f64 {
        Ok(Scalar::Int(value as i64))
    } else {
        Err(ExpressionError::NonFinite)
    }
}
