//! Restricted boolean expressions over a step's outputs.
//!
//! Grammar (everything else is rejected):
//!
//! ```text
//! expr       := or_expr
//! or_expr    := and_expr ("or" and_expr)*
//! and_expr   := not_expr ("and" not_expr)*
//! not_expr   := "not" not_expr | comparison
//! comparison := operand (cmp_op operand)*
//! cmp_op     := == | != | < | <= | > | >= | in | not in
//! operand    := primary ("[" expr "]")*
//! primary    := literal | path | "[" items "]" | "(" expr ")" | "(" items ")"
//! path       := ident ("." (ident | int))*
//! ```
//!
//! Dotted paths are lookups into the output map: `a.b.0` reads
//! `outputs["a"]["b"][0]`. There are no calls, no attribute access on
//! computed values, no arithmetic and no builtins.

use std::cmp::Ordering;

use serde_json::{Number, Value};
use tracing::debug;

use crate::capability::Artifacts;

/// Maximum nesting of operands and `not` chains.
pub const MAX_DEPTH: usize = 64;

/// Errors from lexing, parsing or evaluating a condition.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("lex error at offset {offset}: {message}")]
    Lex { offset: usize, message: String },

    #[error("parse error: {message}")]
    Parse { message: String },

    #[error("disallowed construct: {construct}")]
    Disallowed { construct: String },

    #[error("evaluation error: {message}")]
    Eval { message: String },

    #[error("expression nested deeper than {limit} levels")]
    TooDeep { limit: usize },
}

type CondResult<T> = Result<T, ConditionError>;

fn disallowed<T>(construct: &str) -> CondResult<T> {
    Err(ConditionError::Disallowed {
        construct: construct.to_string(),
    })
}

fn parse_error<T>(message: impl Into<String>) -> CondResult<T> {
    Err(ConditionError::Parse {
        message: message.into(),
    })
}

fn eval_error<T>(message: impl Into<String>) -> CondResult<T> {
    Err(ConditionError::Eval {
        message: message.into(),
    })
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn lex(source: &str) -> CondResult<Vec<Token>> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let lex_error = |offset: usize, message: &str| ConditionError::Lex {
        offset,
        message: message.to_string(),
    };

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|&(_, c)| c);

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() {
            let after_dot = tokens.last() == Some(&Token::Dot);
            let start = i;
            while i < chars.len() && chars[i].1.is_ascii_digit() {
                i += 1;
            }
            let mut is_float = false;
            if !after_dot {
                if i + 1 < chars.len() && chars[i].1 == '.' && chars[i + 1].1.is_ascii_digit() {
                    is_float = true;
                    i += 1;
                    while i < chars.len() && chars[i].1.is_ascii_digit() {
                        i += 1;
                    }
                }
                if i < chars.len() && matches!(chars[i].1, 'e' | 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && matches!(chars[j].1, '+' | '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].1.is_ascii_digit() {
                        is_float = true;
                        i = j;
                        while i < chars.len() && chars[i].1.is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
            }
            if i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                return Err(lex_error(offset, "invalid number literal"));
            }
            let text: String = chars[start..i].iter().map(|&(_, c)| c).collect();
            let token = if is_float {
                let value: f64 = text
                    .parse()
                    .map_err(|_| lex_error(offset, "invalid float literal"))?;
                if !value.is_finite() {
                    return Err(lex_error(offset, "float literal out of range"));
                }
                Token::Float(value)
            } else {
                Token::Int(
                    text.parse()
                        .map_err(|_| lex_error(offset, "integer literal out of range"))?,
                )
            };
            tokens.push(token);
            continue;
        }

        if c == '\'' || c == '"' {
            let quote = c;
            let mut value = String::new();
            i += 1;
            let mut closed = false;
            while i < chars.len() {
                let ch = chars[i].1;
                if ch == quote {
                    closed = true;
                    i += 1;
                    break;
                }
                if ch == '\\' {
                    let escaped = chars
                        .get(i + 1)
                        .map(|&(_, c)| c)
                        .ok_or_else(|| lex_error(chars[i].0, "dangling escape"))?;
                    value.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '0' => '\0',
                        other => other,
                    });
                    i += 2;
                    continue;
                }
                value.push(ch);
                i += 1;
            }
            if !closed {
                return Err(lex_error(offset, "unterminated string literal"));
            }
            tokens.push(Token::Str(value));
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(
                chars[start..i].iter().map(|&(_, c)| c).collect(),
            ));
            continue;
        }

        let (token, width) = match (c, next) {
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            (',', _) => (Token::Comma, 1),
            ('.', _) => (Token::Dot, 1),
            ('=', Some('=')) => (Token::Eq, 2),
            ('!', Some('=')) => (Token::Ne, 2),
            ('<', Some('=')) => (Token::Le, 2),
            ('>', Some('=')) => (Token::Ge, 2),
            ('<', Some('<')) | ('>', Some('>')) => return disallowed("bitwise operator"),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('=', _) => return disallowed("assignment"),
            ('+' | '-' | '*' | '/' | '%' | '@', _) => return disallowed("arithmetic"),
            ('&' | '|' | '^' | '~', _) => return disallowed("bitwise operator"),
            ('{' | '}', _) => return disallowed("dict or set literal"),
            (':', _) => return disallowed("slice or lambda"),
            _ => return Err(lex_error(offset, &format!("unexpected character {c:?}"))),
        };
        tokens.push(token);
        i += width;
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Keywords that introduce constructs outside the grammar.
fn reserved_construct(word: &str) -> Option<&'static str> {
    match word {
        "lambda" => Some("lambda"),
        "if" | "else" => Some("conditional expression"),
        "for" => Some("comprehension"),
        "is" => Some("identity comparison"),
        "await" | "yield" | "import" => Some("statement keyword"),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Name(String),
    Subscript(Box<Expr>, Box<Expr>),
    List(Vec<Expr>),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s == keyword)
    }

    fn expect(&mut self, expected: Token) -> CondResult<()> {
        match self.advance() {
            Some(ref t) if *t == expected => Ok(()),
            Some(t) => parse_error(format!("expected {expected:?}, found {t:?}")),
            None => parse_error(format!("expected {expected:?}, found end of input")),
        }
    }

    fn enter(&mut self) -> CondResult<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ConditionError::TooDeep { limit: MAX_DEPTH });
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn parse_expr(&mut self) -> CondResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> CondResult<Expr> {
        let mut items = vec![self.parse_and()?];
        while self.at_keyword("or") {
            self.advance();
            items.push(self.parse_and()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::Or(items)
        })
    }

    fn parse_and(&mut self) -> CondResult<Expr> {
        let mut items = vec![self.parse_not()?];
        while self.at_keyword("and") {
            self.advance();
            items.push(self.parse_not()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::And(items)
        })
    }

    fn parse_not(&mut self) -> CondResult<Expr> {
        if self.at_keyword("not") {
            self.advance();
            self.enter()?;
            let inner = self.parse_not();
            self.leave();
            return Ok(Expr::Not(Box::new(inner?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> CondResult<Expr> {
        let first = self.parse_operand()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => CmpOp::Eq,
                Some(Token::Ne) => CmpOp::Ne,
                Some(Token::Lt) => CmpOp::Lt,
                Some(Token::Le) => CmpOp::Le,
                Some(Token::Gt) => CmpOp::Gt,
                Some(Token::Ge) => CmpOp::Ge,
                Some(Token::Ident(k)) if k == "in" => CmpOp::In,
                Some(Token::Ident(k)) if k == "not" => {
                    if matches!(self.peek_at(1), Some(Token::Ident(k)) if k == "in") {
                        self.advance();
                        CmpOp::NotIn
                    } else {
                        return parse_error("expected 'in' after 'not'");
                    }
                }
                _ => break,
            };
            self.advance();
            rest.push((op, self.parse_operand()?));
        }
        Ok(if rest.is_empty() {
            first
        } else {
            Expr::Compare(Box::new(first), rest)
        })
    }

    fn parse_operand(&mut self) -> CondResult<Expr> {
        self.enter()?;
        let result = self.parse_operand_inner();
        self.leave();
        result
    }

    fn parse_operand_inner(&mut self) -> CondResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::LBracket) => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Subscript(Box::new(expr), Box::new(index));
                }
                Some(Token::Dot) => return disallowed("attribute access"),
                Some(Token::LParen) => return disallowed("call"),
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> CondResult<Expr> {
        match self.advance() {
            Some(Token::Int(n)) => Ok(Expr::Literal(Value::from(n))),
            Some(Token::Float(f)) => Ok(Expr::Literal(
                Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
            )),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(name)) => self.parse_name(name),
            Some(Token::LBracket) => Ok(Expr::List(self.parse_items(Token::RBracket)?)),
            Some(Token::LParen) => {
                if self.peek() == Some(&Token::RParen) {
                    self.advance();
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.parse_expr()?;
                if self.peek() == Some(&Token::Comma) {
                    self.advance();
                    let mut items = vec![first];
                    items.extend(self.parse_items(Token::RParen)?);
                    return Ok(Expr::List(items));
                }
                self.expect(Token::RParen)?;
                Ok(first)
            }
            Some(t) => parse_error(format!("unexpected token {t:?}")),
            None => parse_error("unexpected end of input"),
        }
    }

    /// Comma-separated expressions up to `close`, trailing comma allowed.
    fn parse_items(&mut self, close: Token) -> CondResult<Vec<Expr>> {
        let mut items = Vec::new();
        loop {
            if self.peek() == Some(&close) {
                self.advance();
                return Ok(items);
            }
            items.push(self.parse_expr()?);
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(ref t) if *t == close => return Ok(items),
                Some(t) => return parse_error(format!("expected ',' or {close:?}, found {t:?}")),
                None => return parse_error("unterminated sequence"),
            }
        }
    }

    fn parse_name(&mut self, name: String) -> CondResult<Expr> {
        match name.as_str() {
            "True" | "true" => return Ok(Expr::Literal(Value::Bool(true))),
            "False" | "false" => return Ok(Expr::Literal(Value::Bool(false))),
            "None" | "null" => return Ok(Expr::Literal(Value::Null)),
            "and" | "or" | "not" | "in" => {
                return parse_error(format!("unexpected keyword '{name}'"))
            }
            _ => {}
        }

        let mut expr = Expr::Name(name);
        while self.peek() == Some(&Token::Dot) {
            self.advance();
            let key = match self.advance() {
                Some(Token::Ident(segment)) => Value::String(segment),
                Some(Token::Int(index)) => Value::from(index),
                Some(t) => return parse_error(format!("invalid path segment {t:?}")),
                None => return parse_error("path ends with '.'"),
            };
            expr = Expr::Subscript(Box::new(expr), Box::new(Expr::Literal(key)));
        }
        Ok(expr)
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "NoneType",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// Python-style truthiness.
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Numeric view of a value; booleans count as 0 and 1.
fn numeric(v: &Value) -> Option<Numeric> {
    match v {
        Value::Bool(b) => Some(Numeric::Int(i64::from(*b))),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(Numeric::Int(i)),
            None => n.as_f64().map(Numeric::Float),
        },
        _ => None,
    }
}

#[derive(Clone, Copy)]
enum Numeric {
    Int(i64),
    Float(f64),
}

impl Numeric {
    fn as_f64(self) -> f64 {
        match self {
            Numeric::Int(i) => i as f64,
            Numeric::Float(f) => f,
        }
    }

    fn cmp(self, other: Numeric) -> Ordering {
        match (self, other) {
            (Numeric::Int(a), Numeric::Int(b)) => a.cmp(&b),
            (a, b) => a
                .as_f64()
                .partial_cmp(&b.as_f64())
                .unwrap_or(Ordering::Equal),
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(p, q)| values_equal(p, q))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map_or(false, |w| values_equal(v, w)))
        }
        _ => match (numeric(a), numeric(b)) {
            (Some(x), Some(y)) => x.cmp(y) == Ordering::Equal,
            _ => false,
        },
    }
}

fn order(a: &Value, b: &Value, op: &str) -> CondResult<Ordering> {
    if let (Value::String(x), Value::String(y)) = (a, b) {
        return Ok(x.cmp(y));
    }
    match (numeric(a), numeric(b)) {
        (Some(x), Some(y)) => Ok(x.cmp(y)),
        _ => eval_error(format!(
            "'{op}' not supported between '{}' and '{}'",
            type_name(a),
            type_name(b)
        )),
    }
}

fn contains(container: &Value, needle: &Value) -> CondResult<bool> {
    match container {
        Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, needle))),
        Value::String(haystack) => match needle {
            Value::String(n) => Ok(haystack.contains(n.as_str())),
            other => eval_error(format!(
                "'in <string>' requires string as left operand, not {}",
                type_name(other)
            )),
        },
        Value::Object(map) => match needle {
            Value::String(key) => Ok(map.contains_key(key)),
            Value::Array(_) | Value::Object(_) => {
                eval_error(format!("unhashable type: '{}'", type_name(needle)))
            }
            _ => Ok(false),
        },
        other => eval_error(format!(
            "argument of type '{}' is not iterable",
            type_name(other)
        )),
    }
}

fn subscript(base: &Value, key: &Value) -> CondResult<Value> {
    match (base, key) {
        (Value::Object(map), Value::String(k)) => map
            .get(k)
            .cloned()
            .ok_or_else(|| ConditionError::Eval {
                message: format!("key {k:?} not found"),
            }),
        (Value::Object(map), Value::Number(n)) => map
            .get(&n.to_string())
            .cloned()
            .ok_or_else(|| ConditionError::Eval {
                message: format!("key {n} not found"),
            }),
        (Value::Array(items), Value::Number(n)) => {
            let index = n.as_i64().ok_or_else(|| ConditionError::Eval {
                message: "list indices must be integers".to_string(),
            })?;
            resolve_index(index, items.len())
                .and_then(|i| items.get(i).cloned())
                .ok_or_else(|| ConditionError::Eval {
                    message: format!("list index {index} out of range"),
                })
        }
        (Value::String(s), Value::Number(n)) => {
            let chars: Vec<char> = s.chars().collect();
            n.as_i64()
                .and_then(|index| resolve_index(index, chars.len()))
                .map(|i| Value::String(chars[i].to_string()))
                .ok_or_else(|| ConditionError::Eval {
                    message: "string index out of range".to_string(),
                })
        }
        (Value::Object(_) | Value::Array(_) | Value::String(_), _) => eval_error(format!(
            "invalid index of type '{}' for '{}'",
            type_name(key),
            type_name(base)
        )),
        _ => eval_error(format!("'{}' object is not subscriptable", type_name(base))),
    }
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let i = if index < 0 { len + index } else { index };
    (0..len).contains(&i).then_some(i as usize)
}

fn eval(expr: &Expr, outputs: &Artifacts) -> CondResult<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Name(name) => outputs
            .get(name)
            .cloned()
            .ok_or_else(|| ConditionError::Eval {
                message: format!("name '{name}' is not defined"),
            }),
        Expr::Subscript(base, key) => subscript(&eval(base, outputs)?, &eval(key, outputs)?),
        Expr::List(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| eval(item, outputs))
                .collect::<CondResult<_>>()?,
        )),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, outputs)?))),
        Expr::And(items) => {
            let mut last = Value::Bool(true);
            for item in items {
                last = eval(item, outputs)?;
                if !truthy(&last) {
                    break;
                }
            }
            Ok(last)
        }
        Expr::Or(items) => {
            let mut last = Value::Bool(false);
            for item in items {
                last = eval(item, outputs)?;
                if truthy(&last) {
                    break;
                }
            }
            Ok(last)
        }
        Expr::Compare(first, rest) => {
            let mut left = eval(first, outputs)?;
            for (op, rhs) in rest {
                let right = eval(rhs, outputs)?;
                let holds = match op {
                    CmpOp::Eq => values_equal(&left, &right),
                    CmpOp::Ne => !values_equal(&left, &right),
                    CmpOp::Lt => order(&left, &right, "<")? == Ordering::Less,
                    CmpOp::Le => order(&left, &right, "<=")? != Ordering::Greater,
                    CmpOp::Gt => order(&left, &right, ">")? == Ordering::Greater,
                    CmpOp::Ge => order(&left, &right, ">=")? != Ordering::Less,
                    CmpOp::In => contains(&right, &left)?,
                    CmpOp::NotIn => !contains(&right, &left)?,
                };
                if !holds {
                    return Ok(Value::Bool(false));
                }
                left = right;
            }
            Ok(Value::Bool(true))
        }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// A parsed condition, reusable across evaluations.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> CondResult<Self> {
        let tokens = lex(source)?;
        if tokens.is_empty() {
            return parse_error("empty expression");
        }
        for (idx, token) in tokens.iter().enumerate() {
            let path_segment = idx > 0 && tokens[idx - 1] == Token::Dot;
            if let (Token::Ident(word), false) = (token, path_segment) {
                if let Some(construct) = reserved_construct(word) {
                    return disallowed(construct);
                }
            }
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.parse_expr()?;
        if let Some(t) = parser.peek() {
            return parse_error(format!("unexpected trailing token {t:?}"));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, outputs: &Artifacts) -> CondResult<bool> {
        eval(&self.expr, outputs).map(|v| truthy(&v))
    }
}

/// Parse and evaluate in one go.
pub fn evaluate(source: &str, outputs: &Artifacts) -> CondResult<bool> {
    Condition::parse(source)?.evaluate(outputs)
}

/// Fail-closed evaluation: any error counts as "not satisfied".
pub fn is_satisfied(source: &str, outputs: &Artifacts) -> bool {
    match evaluate(source, outputs) {
        Ok(satisfied) => satisfied,
        Err(e) => {
            debug!(condition = %source, error = %e, "condition evaluation failed");
            false
        }
    }
}
