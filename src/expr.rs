#![allow(missing_docs)]

//! Expression collaborator used for formula-typed metadata fields.
//!
//! Formulas are compiled once into a small AST and evaluated against the
//! metadata of the record being saved. Field references are bare identifiers
//! (`weight`) or braced names (`{Body Weight}`).

use std::collections::BTreeMap;

use thiserror::Error;

/// Failures raised while compiling or evaluating a formula.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("unexpected character '{found}' at offset {offset}")]
    UnexpectedChar { found: char, offset: usize },
    #[error("unexpected end of formula")]
    UnexpectedEnd,
    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("function '{name}' takes {expected} argument(s), got {found}")]
    Arity {
        name: String,
        expected: &'static str,
        found: usize,
    },
    #[error("field '{0}' has no value")]
    MissingValue(String),
    #[error("field '{field}' is not numeric: '{value}'")]
    NotNumeric { field: String, value: String },
    #[error("division by zero")]
    DivisionByZero,
    #[error("result is not a finite number")]
    NotFinite,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

/// Compiled formula.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledExpr {
    /// Numeric literal.
    Number(f64),
    /// Reference to a metadata field.
    Field(String),
    /// Unary minus.
    Neg(Box<CompiledExpr>),
    /// Binary operation.
    Binary(BinOp, Box<CompiledExpr>, Box<CompiledExpr>),
    /// Built-in function call.
    Call(String, Vec<CompiledExpr>),
}

impl CompiledExpr {
    /// Names of the fields the formula reads.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            CompiledExpr::Number(_) => {}
            CompiledExpr::Field(name) => out.push(name),
            CompiledExpr::Neg(inner) => inner.collect_fields(out),
            CompiledExpr::Binary(_, lhs, rhs) => {
                lhs.collect_fields(out);
                rhs.collect_fields(out);
            }
            CompiledExpr::Call(_, args) => args.iter().for_each(|a| a.collect_fields(out)),
        }
    }
}

/// Compiles and evaluates formulas.
pub trait ExpressionEngine: Send + Sync {
    /// Parses `text`.
    fn compile(&self, text: &str) -> Result<CompiledExpr, ExprError>;

    /// Evaluates `expr` against a record's metadata.
    fn evaluate(
        &self,
        expr: &CompiledExpr,
        record: &BTreeMap<String, String>,
    ) -> Result<f64, ExprError>;
}

/// Built-in arithmetic engine: `+ - * / ^`, parentheses, unary minus and the
/// functions `abs`, `round`, `sqrt`, `min`, `max`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArithmeticEngine;

impl ExpressionEngine for ArithmeticEngine {
    fn compile(&self, text: &str) -> Result<CompiledExpr, ExprError> {
        let tokens = tokenize(text)?;
        let mut parser = Parser { tokens, at: 0 };
        let expr = parser.expr()?;
        match parser.peek() {
            None => Ok(expr),
            Some(token) => Err(ExprError::UnexpectedToken(token.to_string())),
        }
    }

    fn evaluate(
        &self,
        expr: &CompiledExpr,
        record: &BTreeMap<String, String>,
    ) -> Result<f64, ExprError> {
        let value = eval(expr, record)?;
        if value.is_finite() {
            Ok(value)
        } else {
            Err(ExprError::NotFinite)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Comma,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{n}"),
            Token::Ident(name) => f.write_str(name),
            Token::Op(op) => write!(f, "{op}"),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::Comma => f.write_str(","),
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some(&(offset, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '0'..='9' | '.' => {
                let mut literal = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        literal.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| ExprError::UnexpectedChar { found: c, offset })?;
                tokens.push(Token::Number(value));
            }
            '{' => {
                chars.next();
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some((_, '}')) => break,
                        Some((_, ch)) => name.push(ch),
                        None => return Err(ExprError::UnexpectedEnd),
                    }
                }
                tokens.push(Token::Ident(name.trim().to_string()));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' {
                        name.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(name));
            }
            '+' | '-' | '*' | '/' | '^' => {
                chars.next();
                tokens.push(Token::Op(c));
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            other => return Err(ExprError::UnexpectedChar { found: other, offset }),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    at: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.at)
    }

    fn bump(&mut self) -> Result<Token, ExprError> {
        let token = self.tokens.get(self.at).cloned().ok_or(ExprError::UnexpectedEnd)?;
        self.at += 1;
        Ok(token)
    }

    fn expect(&mut self, want: Token) -> Result<(), ExprError> {
        let token = self.bump()?;
        if token == want {
            Ok(())
        } else {
            Err(ExprError::UnexpectedToken(token.to_string()))
        }
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> Result<CompiledExpr, ExprError> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek() {
            let op = if *op == '+' { BinOp::Add } else { BinOp::Sub };
            self.at += 1;
            let rhs = self.term()?;
            lhs = CompiledExpr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    // term := unary (('*' | '/') unary)*
    fn term(&mut self) -> Result<CompiledExpr, ExprError> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op @ ('*' | '/'))) = self.peek() {
            let op = if *op == '*' { BinOp::Mul } else { BinOp::Div };
            self.at += 1;
            let rhs = self.unary()?;
            lhs = CompiledExpr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<CompiledExpr, ExprError> {
        if let Some(Token::Op('-')) = self.peek() {
            self.at += 1;
            return Ok(CompiledExpr::Neg(Box::new(self.unary()?)));
        }
        self.power()
    }

    // Right associative.
    fn power(&mut self) -> Result<CompiledExpr, ExprError> {
        let base = self.atom()?;
        if let Some(Token::Op('^')) = self.peek() {
            self.at += 1;
            let exponent = self.unary()?;
            return Ok(CompiledExpr::Binary(
                BinOp::Pow,
                Box::new(base),
                Box::new(exponent),
            ));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<CompiledExpr, ExprError> {
        match self.bump()? {
            Token::Number(n) => Ok(CompiledExpr::Number(n)),
            Token::LParen => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) if self.peek() == Some(&Token::LParen) => {
                self.at += 1;
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        args.push(self.expr()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.at += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RParen)?;
                check_call(&name, args.len())?;
                Ok(CompiledExpr::Call(name.to_ascii_lowercase(), args))
            }
            Token::Ident(name) => Ok(CompiledExpr::Field(name)),
            other => Err(ExprError::UnexpectedToken(other.to_string())),
        }
    }
}

fn check_call(name: &str, found: usize) -> Result<(), ExprError> {
    let (ok, expected) = match name.to_ascii_lowercase().as_str() {
        "abs" | "round" | "sqrt" => (found == 1, "1"),
        "min" | "max" => (found >= 1, "at least 1"),
        _ => return Err(ExprError::UnknownFunction(name.to_string())),
    };
    if ok {
        Ok(())
    } else {
        Err(ExprError::Arity {
            name: name.to_string(),
            expected,
            found,
        })
    }
}

fn eval(expr: &CompiledExpr, record: &BTreeMap<String, String>) -> Result<f64, ExprError> {
    match expr {
        CompiledExpr::Number(n) => Ok(*n),
        CompiledExpr::Field(name) => {
            let raw = record
                .get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ExprError::MissingValue(name.clone()))?;
            raw.parse::<f64>().map_err(|_| ExprError::NotNumeric {
                field: name.clone(),
                value: raw.to_string(),
            })
        }
        CompiledExpr::Neg(inner) => Ok(-eval(inner, record)?),
        CompiledExpr::Binary(op, lhs, rhs) => {
            let (a, b) = (eval(lhs, record)?, eval(rhs, record)?);
            match op {
                BinOp::Add => Ok(a + b),
                BinOp::Sub => Ok(a - b),
                BinOp::Mul => Ok(a * b),
                BinOp::Div if b == 0.0 => Err(ExprError::DivisionByZero),
                BinOp::Div => Ok(a / b),
                BinOp::Pow => Ok(a.powf(b)),
            }
        }
        CompiledExpr::Call(name, args) => {
            let values = args
                .iter()
                .map(|a| eval(a, record))
                .collect::<Result<Vec<_>, _>>()?;
            match (name.as_str(), values.as_slice()) {
                ("abs", [x]) => Ok(x.abs()),
                ("round", [x]) => Ok(x.round()),
                ("sqrt", [x]) => Ok(x.sqrt()),
                ("min", _) => Ok(values.iter().copied().fold(f64::INFINITY, f64::min)),
                ("max", _) => Ok(values.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
                _ => Err(ExprError::UnknownFunction(name.clone())),
            }
        }
    }
}

/// Renders a formula result the way it is stored in metadata: integers
/// without a fractional part, everything else with at most six decimals.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        let text = format!("{value:.6}");
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}
