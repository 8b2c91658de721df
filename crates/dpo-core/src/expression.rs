//! Boolean and scalar expression evaluation over a JSON context document.
//!
//! Conditions configured on actions and execution modes (`apply_condition`,
//! `fail_condition`, `execution_condition`, `select_expression`) and runtime
//! transformer options are small expressions evaluated against a context
//! record serialized to JSON. The language covers literals, comparison and
//! boolean operators, parenthesized groups, dotted field paths and the
//! functions `size`, `min` and `max`.
//!
//! A path segment applied to an array of objects maps over the elements, so
//! `selected_partition_values.dt` yields the list of `dt` values of every
//! selected partition record.

use crate::error::{DpoError, Result};
use crate::frame::cmp_scalars;
use serde_json::Value;
use std::cmp::Ordering;

/// Evaluates an expression and requires a boolean result.
pub fn evaluate_bool(expr: &str, ctx: &Value) -> Result<bool> {
    match evaluate(expr, ctx)? {
        Value::Bool(b) => Ok(b),
        other => Err(DpoError::config(format!(
            "expression '{}' evaluated to {} instead of a boolean",
            expr, other
        ))),
    }
}

/// Evaluates an expression against a context document.
pub fn evaluate(expr: &str, ctx: &Value) -> Result<Value> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser {
        expr,
        tokens,
        pos: 0,
    };
    let ast = parser.parse_or()?;
    parser.expect_end()?;
    eval(&ast, ctx)
}

/// Replaces `%{path}` tokens with the rendered value of the path expression.
pub fn substitute_tokens(template: &str, ctx: &Value) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("%{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            DpoError::config(format!("unterminated %{{}} token in '{}'", template))
        })?;
        let value = evaluate(&after[..end], ctx)?;
        out.push_str(&render(&value));
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Num(serde_json::Number),
    Str(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
    Dot,
}

fn tokenize(expr: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
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
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(DpoError::config(format!(
                        "unterminated string literal in '{}'",
                        expr
                    )));
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            '=' | '!' | '<' | '>' | '&' | '|' => {
                let next = chars.get(i + 1).copied();
                let (op, len) = match (c, next) {
                    ('=', Some('=')) => ("==", 2),
                    ('!', Some('=')) => ("!=", 2),
                    ('<', Some('=')) => ("<=", 2),
                    ('>', Some('=')) => (">=", 2),
                    ('&', Some('&')) => ("&&", 2),
                    ('|', Some('|')) => ("||", 2),
                    ('<', _) => ("<", 1),
                    ('>', _) => (">", 1),
                    ('!', _) => ("!", 1),
                    _ => {
                        return Err(DpoError::config(format!(
                            "unexpected character '{}' in '{}'",
                            c, expr
                        )))
                    }
                };
                tokens.push(Token::Op(op));
                i += len;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == 'e')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num: serde_json::Number = text.parse().map_err(|_| {
                    DpoError::config(format!("invalid number '{}' in '{}'", text, expr))
                })?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(Token::Ident(word));
            }
            other => {
                return Err(DpoError::config(format!(
                    "unexpected character '{}' in '{}'",
                    other, expr
                )))
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug)]
enum Expr {
    Lit(Value),
    Path(Vec<String>),
    Call(String, Vec<Expr>),
    Not(Box<Expr>),
    Bin(&'static str, Box<Expr>, Box<Expr>),
}

struct Parser<'a> {
    expr: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn error(&self, message: &str) -> DpoError {
        DpoError::config(format!("{} in expression '{}'", message, self.expr))
    }

    fn expect_end(&self) -> Result<()> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(self.error("trailing tokens"))
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Op("||")) {
            self.bump();
            let right = self.parse_and()?;
            left = Expr::Bin("||", Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::Op("&&")) {
            self.bump();
            let right = self.parse_not()?;
            left = Expr::Bin("&&", Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Op("!")) {
            self.bump();
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr> {
        let left = self.parse_primary()?;
        if let Some(Token::Op(op)) = self.peek() {
            if matches!(*op, "==" | "!=" | "<" | "<=" | ">" | ">=") {
                let op = *op;
                self.bump();
                let right = self.parse_primary()?;
                return Ok(Expr::Bin(op, Box::new(left), Box::new(right)));
            }
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.bump() {
            Some(Token::Num(n)) => Ok(Expr::Lit(Value::Number(n))),
            Some(Token::Str(s)) => Ok(Expr::Lit(Value::String(s))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("expected ')'")),
                }
            }
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Lit(Value::Bool(true))),
                "false" => Ok(Expr::Lit(Value::Bool(false))),
                "null" => Ok(Expr::Lit(Value::Null)),
                _ => {
                    if self.peek() == Some(&Token::LParen) {
                        self.bump();
                        let mut args = Vec::new();
                        if self.peek() != Some(&Token::RParen) {
                            loop {
                                args.push(self.parse_or()?);
                                match self.peek() {
                                    Some(Token::Comma) => {
                                        self.bump();
                                    }
                                    _ => break,
                                }
                            }
                        }
                        match self.bump() {
                            Some(Token::RParen) => Ok(Expr::Call(word, args)),
                            _ => Err(self.error("expected ')' after call arguments")),
                        }
                    } else {
                        let mut path = vec![word];
                        while self.peek() == Some(&Token::Dot) {
                            self.bump();
                            match self.bump() {
                                Some(Token::Ident(seg)) => path.push(seg),
                                _ => return Err(self.error("expected identifier after '.'")),
                            }
                        }
                        Ok(Expr::Path(path))
                    }
                }
            },
            _ => Err(self.error("expected a value")),
        }
    }
}

fn eval(expr: &Expr, ctx: &Value) -> Result<Value> {
    match expr {
        Expr::Lit(v) => Ok(v.clone()),
        Expr::Path(path) => Ok(resolve_path(ctx, path)),
        Expr::Call(name, args) => {
            let values: Vec<Value> = args
                .iter()
                .map(|a| eval(a, ctx))
                .collect::<Result<Vec<_>>>()?;
            call(name, &values)
        }
        Expr::Not(inner) => match eval(inner, ctx)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(DpoError::config(format!(
                "'!' applied to non-boolean {}",
                other
            ))),
        },
        Expr::Bin(op, left, right) => {
            let l = eval(left, ctx)?;
            let r = eval(right, ctx)?;
            binary(op, l, r)
        }
    }
}

/// Walks a dotted path. A segment hitting an array maps over its elements,
/// collecting the non-null field values.
fn resolve_path(ctx: &Value, path: &[String]) -> Value {
    let mut current = ctx.clone();
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(segment).cloned().unwrap_or(Value::Null),
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::Object(map) => map.get(segment).cloned(),
                        _ => None,
                    })
                    .filter(|v| !v.is_null())
                    .collect(),
            ),
            _ => Value::Null,
        };
    }
    current
}

fn call(name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "size" => {
            let [arg] = args else {
                return Err(DpoError::config("size() takes exactly one argument"));
            };
            let n = match arg {
                Value::Array(items) => items.len(),
                Value::String(s) => s.len(),
                Value::Object(map) => map.len(),
                Value::Null => 0,
                _ => return Err(DpoError::config("size() argument is not a collection")),
            };
            Ok(Value::from(n as u64))
        }
        "min" | "max" => {
            let [arg] = args else {
                return Err(DpoError::config(format!("{}() takes exactly one argument", name)));
            };
            let Value::Array(items) = arg else {
                return Err(DpoError::config(format!("{}() argument is not an array", name)));
            };
            let picked = if name == "min" {
                items.iter().min_by(|a, b| cmp_scalars(a, b))
            } else {
                items.iter().max_by(|a, b| cmp_scalars(a, b))
            };
            Ok(picked.cloned().unwrap_or(Value::Null))
        }
        other => Err(DpoError::config(format!("unknown function '{}'", other))),
    }
}

fn binary(op: &str, l: Value, r: Value) -> Result<Value> {
    match op {
        "&&" | "||" => match (l, r) {
            (Value::Bool(a), Value::Bool(b)) => {
                Ok(Value::Bool(if op == "&&" { a && b } else { a || b }))
            }
            _ => Err(DpoError::config(format!("'{}' applied to non-booleans", op))),
        },
        "==" => Ok(Value::Bool(scalar_eq(&l, &r))),
        "!=" => Ok(Value::Bool(!scalar_eq(&l, &r))),
        _ => {
            if l.is_null() || r.is_null() {
                return Ok(Value::Bool(false));
            }
            let ord = cmp_scalars(&l, &r);
            let result = match op {
                "<" => ord == Ordering::Less,
                "<=" => ord != Ordering::Greater,
                ">" => ord == Ordering::Greater,
                ">=" => ord != Ordering::Less,
                _ => return Err(DpoError::config(format!("unknown operator '{}'", op))),
            };
            Ok(Value::Bool(result))
        }
    }
}

fn scalar_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => l == r,
    }
}
