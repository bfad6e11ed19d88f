//! Safe expression evaluator.
//!
//! An explicit AST walker over a restricted expression subset: literals,
//! identifiers, member access, arithmetic/logical/comparison operators,
//! conditionals, array/object literals, template strings, and an allow-list
//! of string methods. No assignment, no function definitions, no `new`, no
//! free calls. A character allowlist and a token denylist run before
//! parsing, and evaluation is bounded by a wall-clock budget.
//!
//! Untrusted gate expressions and edge transforms run through here;
//! isolation is at the evaluator level, not process-level sandboxing.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde_json::{Number, Value};

use crate::domain::errors::{DomainError, DomainResult};

/// Maximum accepted source length in bytes.
const MAX_SOURCE_BYTES: usize = 4096;
/// Maximum parser nesting depth.
const MAX_DEPTH: usize = 64;
/// Evaluation wall-clock budget.
const EVAL_BUDGET: Duration = Duration::from_millis(30);

/// String methods callable inside expressions. Everything else is rejected.
const STRING_METHODS: &[&str] = &[
    "toLowerCase",
    "toUpperCase",
    "trim",
    "includes",
    "startsWith",
    "endsWith",
    "slice",
    "substring",
    "split",
    "replace",
    "match",
];

/// Identifiers and property names rejected before parsing, to defend
/// against parser-level smuggling of host capabilities.
const DENIED_TOKENS: &[&str] = &[
    "process",
    "global",
    "globalThis",
    "prototype",
    "constructor",
    "__proto__",
    "import",
    "require",
    "eval",
    "fetch",
    "setTimeout",
    "setInterval",
    "setImmediate",
    "Function",
];

fn err(message: impl Into<String>) -> DomainError {
    DomainError::Expression(message.into())
}

/// Evaluate `source` against a scope of named values.
pub fn evaluate(source: &str, scope: &BTreeMap<String, Value>) -> DomainResult<Value> {
    pre_check(source)?;
    let tokens = lex(source)?;
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_program()?;
    let evaluator = Evaluator {
        scope,
        deadline: Instant::now() + EVAL_BUDGET,
    };
    evaluator.eval(&expr)
}

/// Evaluate and coerce the result to a boolean by truthiness.
pub fn evaluate_truthy(source: &str, scope: &BTreeMap<String, Value>) -> DomainResult<bool> {
    Ok(is_truthy(&evaluate(source, scope)?))
}

/// Convenience scope builder for the common `{data, raw}` shape.
pub fn gate_scope(data: &Value, raw: &str) -> BTreeMap<String, Value> {
    let mut scope = BTreeMap::new();
    scope.insert("data".to_string(), data.clone());
    scope.insert("raw".to_string(), Value::String(raw.to_string()));
    scope
}

// ---------------------------------------------------------------------------
// Pre-parse checks
// ---------------------------------------------------------------------------

fn pre_check(source: &str) -> DomainResult<()> {
    if source.trim().is_empty() {
        return Err(err("empty expression"));
    }
    if source.len() > MAX_SOURCE_BYTES {
        return Err(err(format!(
            "expression exceeds {MAX_SOURCE_BYTES} bytes"
        )));
    }

    for (idx, c) in source.char_indices() {
        let allowed = c.is_ascii_alphanumeric()
            || c.is_whitespace()
            || "+-*/%!<>=&|?:.,'\"`()[]{}_$\\".contains(c);
        if !allowed {
            return Err(err(format!("disallowed character {c:?} at byte {idx}")));
        }
    }

    // Word-boundary scan over identifier-shaped runs.
    let mut word = String::new();
    for c in source.chars().chain(std::iter::once(' ')) {
        if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
            word.push(c);
        } else {
            if DENIED_TOKENS.contains(&word.as_str()) {
                return Err(err(format!("token {word:?} is not allowed")));
            }
            word.clear();
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    /// Raw template pieces; embedded expressions are parsed recursively
    Template(Vec<TemplatePiece>),
    Ident(String),
    Punct(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
enum TemplatePiece {
    Lit(String),
    Expr(String),
}

const PUNCTUATION: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "??", "<", ">", "+", "-", "*", "/", "%",
    "!", "?", ":", ".", ",", "(", ")", "[", "]", "{", "}",
];

fn lex(source: &str) -> DomainResult<Vec<Token>> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < bytes.len() && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            let raw = &source[start..i];
            let value: f64 = raw.parse().map_err(|_| err(format!("bad number literal {raw:?}")))?;
            tokens.push(Token::Num(value));
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < bytes.len() {
                let c = bytes[i] as char;
                if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
                    i += 1;
                } else {
                    break;
                }
            }
            tokens.push(Token::Ident(source[start..i].to_string()));
            continue;
        }

        if c == '\'' || c == '"' {
            let (text, next) = lex_string(source, i, c)?;
            tokens.push(Token::Str(text));
            i = next;
            continue;
        }

        if c == '`' {
            let (pieces, next) = lex_template(source, i)?;
            tokens.push(Token::Template(pieces));
            i = next;
            continue;
        }

        let rest = &source[i..];
        match PUNCTUATION.iter().copied().find(|p| rest.starts_with(*p)) {
            Some(p) => {
                tokens.push(Token::Punct(p));
                i += p.len();
            }
            None => return Err(err(format!("unexpected character {c:?} at byte {i}"))),
        }
    }

    Ok(tokens)
}

fn lex_string(source: &str, open: usize, quote: char) -> DomainResult<(String, usize)> {
    let bytes = source.as_bytes();
    let mut text = String::new();
    let mut i = open + 1;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == '\\' && i + 1 < bytes.len() {
            let escaped = bytes[i + 1] as char;
            text.push(match escaped {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                other => other,
            });
            i += 2;
            continue;
        }
        if c == quote {
            return Ok((text, i + 1));
        }
        text.push(c);
        i += 1;
    }
    Err(err("unterminated string literal"))
}

fn lex_template(source: &str, open: usize) -> DomainResult<(Vec<TemplatePiece>, usize)> {
    let bytes = source.as_bytes();
    let mut pieces = Vec::new();
    let mut lit = String::new();
    let mut i = open + 1;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == '\\' && i + 1 < bytes.len() {
            lit.push(bytes[i + 1] as char);
            i += 2;
            continue;
        }
        if c == '`' {
            if !lit.is_empty() {
                pieces.push(TemplatePiece::Lit(lit));
            }
            return Ok((pieces, i + 1));
        }
        if c == '$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if !lit.is_empty() {
                pieces.push(TemplatePiece::Lit(std::mem::take(&mut lit)));
            }
            let mut depth = 1;
            let expr_start = i + 2;
            let mut j = expr_start;
            while j < bytes.len() && depth > 0 {
                match bytes[j] {
                    b'{' => depth += 1,
                    b'}' => depth -= 1,
                    _ => {}
                }
                j += 1;
            }
            if depth != 0 {
                return Err(err("unterminated template interpolation"));
            }
            pieces.push(TemplatePiece::Expr(source[expr_start..j - 1].to_string()));
            i = j;
            continue;
        }
        lit.push(c);
        i += 1;
    }

    Err(err("unterminated template string"))
}

// ---------------------------------------------------------------------------
// Parser (precedence climbing)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Template(Vec<TemplateExpr>),
    Ident(String),
    Member {
        object: Box<Expr>,
        property: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Unary {
        op: &'static str,
        operand: Box<Expr>,
    },
    Binary {
        op: &'static str,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical {
        op: &'static str,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Conditional {
        cond: Box<Expr>,
        then: Box<Expr>,
        alt: Box<Expr>,
    },
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    MethodCall {
        receiver: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum TemplateExpr {
    Lit(String),
    Expr(Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    fn parse_program(&mut self) -> DomainResult<Expr> {
        let expr = self.parse_expr()?;
        if self.pos < self.tokens.len() {
            return Err(err(format!("trailing tokens after expression: {:?}", self.tokens[self.pos])));
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if matches!(self.peek(), Some(Token::Punct(q)) if *q == p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> DomainResult<()> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(err(format!("expected {p:?} at token {}", self.pos)))
        }
    }

    fn enter(&mut self) -> DomainResult<DepthGuard<'_>> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(err("expression nesting too deep"));
        }
        Ok(DepthGuard { parser: self })
    }

    fn parse_expr(&mut self) -> DomainResult<Expr> {
        self.parse_conditional()
    }

    fn parse_conditional(&mut self) -> DomainResult<Expr> {
        let cond = self.parse_nullish()?;
        if self.eat_punct("?") {
            let then = self.parse_expr()?;
            self.expect_punct(":")?;
            let alt = self.parse_expr()?;
            return Ok(Expr::Conditional {
                cond: Box::new(cond),
                then: Box::new(then),
                alt: Box::new(alt),
            });
        }
        Ok(cond)
    }

    fn parse_nullish(&mut self) -> DomainResult<Expr> {
        let mut left = self.parse_or()?;
        while self.eat_punct("??") {
            let right = self.parse_or()?;
            left = Expr::Logical {
                op: "??",
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> DomainResult<Expr> {
        let mut left = self.parse_and()?;
        while self.eat_punct("||") {
            let right = self.parse_and()?;
            left = Expr::Logical {
                op: "||",
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> DomainResult<Expr> {
        let mut left = self.parse_equality()?;
        while self.eat_punct("&&") {
            let right = self.parse_equality()?;
            left = Expr::Logical {
                op: "&&",
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> DomainResult<Expr> {
        let mut left = self.parse_relational()?;
        loop {
            let op = if self.eat_punct("===") {
                "==="
            } else if self.eat_punct("!==") {
                "!=="
            } else if self.eat_punct("==") {
                "=="
            } else if self.eat_punct("!=") {
                "!="
            } else {
                break;
            };
            let right = self.parse_relational()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> DomainResult<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let op = if self.eat_punct("<=") {
                "<="
            } else if self.eat_punct(">=") {
                ">="
            } else if self.eat_punct("<") {
                "<"
            } else if self.eat_punct(">") {
                ">"
            } else {
                break;
            };
            let right = self.parse_additive()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> DomainResult<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = if self.eat_punct("+") {
                "+"
            } else if self.eat_punct("-") {
                "-"
            } else {
                break;
            };
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> DomainResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.eat_punct("*") {
                "*"
            } else if self.eat_punct("/") {
                "/"
            } else if self.eat_punct("%") {
                "%"
            } else {
                break;
            };
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> DomainResult<Expr> {
        let op = if self.eat_punct("!") {
            Some("!")
        } else if self.eat_punct("-") {
            Some("-")
        } else if self.eat_punct("+") {
            Some("+")
        } else {
            None
        };
        if let Some(op) = op {
            let guard = self.enter()?;
            let operand = guard.parser.parse_unary()?;
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> DomainResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat_punct(".") {
                let name = match self.peek() {
                    Some(Token::Ident(name)) => name.clone(),
                    other => return Err(err(format!("expected property name, got {other:?}"))),
                };
                self.pos += 1;

                if self.eat_punct("(") {
                    if !STRING_METHODS.contains(&name.as_str()) {
                        return Err(err(format!("method {name:?} is not allowed")));
                    }
                    let mut args = Vec::new();
                    if !self.eat_punct(")") {
                        loop {
                            args.push(self.parse_expr()?);
                            if self.eat_punct(")") {
                                break;
                            }
                            self.expect_punct(",")?;
                        }
                    }
                    expr = Expr::MethodCall {
                        receiver: Box::new(expr),
                        method: name,
                        args,
                    };
                } else {
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property: name,
                    };
                }
                continue;
            }

            if self.eat_punct("[") {
                let index = self.parse_expr()?;
                self.expect_punct("]")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
                continue;
            }

            if matches!(self.peek(), Some(Token::Punct("("))) {
                return Err(err("call expressions are not allowed"));
            }

            break;
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> DomainResult<Expr> {
        let token = self
            .peek()
            .cloned()
            .ok_or_else(|| err("unexpected end of expression"))?;

        match token {
            Token::Num(n) => {
                self.pos += 1;
                Ok(Expr::Literal(number_value(n)?))
            }
            Token::Str(s) => {
                self.pos += 1;
                Ok(Expr::Literal(Value::String(s)))
            }
            Token::Template(pieces) => {
                self.pos += 1;
                let guard = self.enter()?;
                let mut parts = Vec::new();
                for piece in pieces {
                    match piece {
                        TemplatePiece::Lit(lit) => parts.push(TemplateExpr::Lit(lit)),
                        TemplatePiece::Expr(src) => {
                            let tokens = lex(&src)?;
                            let mut inner = Parser::new(tokens);
                            inner.depth = guard.parser.depth;
                            parts.push(TemplateExpr::Expr(Box::new(inner.parse_program()?)));
                        }
                    }
                }
                Ok(Expr::Template(parts))
            }
            Token::Ident(name) => {
                self.pos += 1;
                match name.as_str() {
                    "true" => Ok(Expr::Literal(Value::Bool(true))),
                    "false" => Ok(Expr::Literal(Value::Bool(false))),
                    "null" | "undefined" => Ok(Expr::Literal(Value::Null)),
                    "new" | "function" | "class" | "typeof" | "delete" | "in" | "instanceof"
                    | "void" | "yield" | "await" => Err(err(format!("keyword {name:?} is not allowed"))),
                    _ => Ok(Expr::Ident(name)),
                }
            }
            Token::Punct("(") => {
                self.pos += 1;
                let guard = self.enter()?;
                let expr = guard.parser.parse_expr()?;
                guard.parser.expect_punct(")")?;
                Ok(expr)
            }
            Token::Punct("[") => {
                self.pos += 1;
                let guard = self.enter()?;
                let mut items = Vec::new();
                if !guard.parser.eat_punct("]") {
                    loop {
                        items.push(guard.parser.parse_expr()?);
                        if guard.parser.eat_punct("]") {
                            break;
                        }
                        guard.parser.expect_punct(",")?;
                    }
                }
                Ok(Expr::Array(items))
            }
            Token::Punct("{") => {
                self.pos += 1;
                let guard = self.enter()?;
                let mut entries = Vec::new();
                if !guard.parser.eat_punct("}") {
                    loop {
                        let key = match guard.parser.peek() {
                            Some(Token::Ident(name)) => name.clone(),
                            Some(Token::Str(s)) => s.clone(),
                            other => return Err(err(format!("expected object key, got {other:?}"))),
                        };
                        guard.parser.pos += 1;
                        guard.parser.expect_punct(":")?;
                        let value = guard.parser.parse_expr()?;
                        entries.push((key, value));
                        if guard.parser.eat_punct("}") {
                            break;
                        }
                        guard.parser.expect_punct(",")?;
                    }
                }
                Ok(Expr::Object(entries))
            }
            other => Err(err(format!("unexpected token {other:?}"))),
        }
    }
}

struct DepthGuard<'a> {
    parser: &'a mut Parser,
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.parser.depth -= 1;
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

struct Evaluator<'a> {
    scope: &'a BTreeMap<String, Value>,
    deadline: Instant,
}

impl Evaluator<'_> {
    fn eval(&self, expr: &Expr) -> DomainResult<Value> {
        if Instant::now() > self.deadline {
            return Err(err("evaluation budget exceeded"));
        }

        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ident(name) => self
                .scope
                .get(name)
                .cloned()
                .ok_or_else(|| err(format!("Unknown identifier: {name}"))),
            Expr::Template(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        TemplateExpr::Lit(lit) => out.push_str(lit),
                        TemplateExpr::Expr(inner) => out.push_str(&to_display(&self.eval(inner)?)),
                    }
                }
                Ok(Value::String(out))
            }
            Expr::Member { object, property } => {
                let object = self.eval(object)?;
                Ok(member(&object, property))
            }
            Expr::Index { object, index } => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                match &index {
                    Value::String(key) => Ok(member(&object, key)),
                    Value::Number(n) => {
                        let idx = n.as_f64().unwrap_or(-1.0);
                        if idx < 0.0 || idx.fract() != 0.0 {
                            return Ok(Value::Null);
                        }
                        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                        let idx = idx as usize;
                        match &object {
                            Value::Array(items) => Ok(items.get(idx).cloned().unwrap_or(Value::Null)),
                            Value::String(s) => Ok(s
                                .chars()
                                .nth(idx)
                                .map(|c| Value::String(c.to_string()))
                                .unwrap_or(Value::Null)),
                            _ => Ok(Value::Null),
                        }
                    }
                    _ => Err(err("index must be a string or number")),
                }
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match *op {
                    "!" => Ok(Value::Bool(!is_truthy(&value))),
                    "-" => number_value(-as_number(&value)?),
                    "+" => number_value(as_number(&value)?),
                    _ => Err(err(format!("unknown unary operator {op}"))),
                }
            }
            Expr::Logical { op, left, right } => {
                let left = self.eval(left)?;
                match *op {
                    "&&" => {
                        if is_truthy(&left) {
                            self.eval(right)
                        } else {
                            Ok(left)
                        }
                    }
                    "||" => {
                        if is_truthy(&left) {
                            Ok(left)
                        } else {
                            self.eval(right)
                        }
                    }
                    "??" => {
                        if left.is_null() {
                            self.eval(right)
                        } else {
                            Ok(left)
                        }
                    }
                    _ => Err(err(format!("unknown logical operator {op}"))),
                }
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary(op, &left, &right)
            }
            Expr::Conditional { cond, then, alt } => {
                if is_truthy(&self.eval(cond)?) {
                    self.eval(then)
                } else {
                    self.eval(alt)
                }
            }
            Expr::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item)?);
                }
                Ok(Value::Array(values))
            }
            Expr::Object(entries) => {
                let mut map = serde_json::Map::new();
                for (key, value) in entries {
                    map.insert(key.clone(), self.eval(value)?);
                }
                Ok(Value::Object(map))
            }
            Expr::MethodCall {
                receiver,
                method,
                args,
            } => {
                let receiver = self.eval(receiver)?;
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    arg_values.push(self.eval(arg)?);
                }
                string_method(&receiver, method, &arg_values)
            }
        }
    }
}

fn member(object: &Value, property: &str) -> Value {
    match object {
        Value::Object(map) => map.get(property).cloned().unwrap_or(Value::Null),
        Value::Array(items) if property == "length" => Value::from(items.len()),
        Value::String(s) if property == "length" => Value::from(s.chars().count()),
        _ => Value::Null,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn as_number(value: &Value) -> DomainResult<f64> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| err("non-finite number")),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Null => Ok(0.0),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| err(format!("cannot convert {s:?} to a number"))),
        _ => Err(err("cannot convert value to a number")),
    }
}

fn number_value(n: f64) -> DomainResult<Value> {
    if !n.is_finite() {
        return Err(err("arithmetic produced a non-finite number"));
    }
    // Keep integral results integral so wired values stay clean.
    #[allow(clippy::cast_possible_truncation)]
    if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        Ok(Value::Number(Number::from(n as i64)))
    } else {
        Number::from_f64(n)
            .map(Value::Number)
            .ok_or_else(|| err("arithmetic produced an unrepresentable number"))
    }
}

fn to_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (left, right) {
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            match (as_number(left), as_number(right)) {
                (Ok(a), Ok(b)) => (a - b).abs() < f64::EPSILON,
                _ => false,
            }
        }
        _ => false,
    }
}

fn binary(op: &str, left: &Value, right: &Value) -> DomainResult<Value> {
    match op {
        "===" => Ok(Value::Bool(left == right)),
        "!==" => Ok(Value::Bool(left != right)),
        "==" => Ok(Value::Bool(loose_eq(left, right))),
        "!=" => Ok(Value::Bool(!loose_eq(left, right))),
        "+" => {
            if left.is_string() || right.is_string() {
                Ok(Value::String(format!("{}{}", to_display(left), to_display(right))))
            } else {
                number_value(as_number(left)? + as_number(right)?)
            }
        }
        "-" => number_value(as_number(left)? - as_number(right)?),
        "*" => number_value(as_number(left)? * as_number(right)?),
        "/" => number_value(as_number(left)? / as_number(right)?),
        "%" => number_value(as_number(left)? % as_number(right)?),
        "<" | "<=" | ">" | ">=" => {
            let ordering = match (left, right) {
                (Value::String(a), Value::String(b)) => a.partial_cmp(b),
                _ => as_number(left)?.partial_cmp(&as_number(right)?),
            };
            let ordering = ordering.ok_or_else(|| err("values are not comparable"))?;
            let result = match op {
                "<" => ordering.is_lt(),
                "<=" => ordering.is_le(),
                ">" => ordering.is_gt(),
                ">=" => ordering.is_ge(),
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        _ => Err(err(format!("unknown operator {op}"))),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn string_method(receiver: &Value, method: &str, args: &[Value]) -> DomainResult<Value> {
    let s = match receiver {
        Value::String(s) => s.as_str(),
        _ => return Err(err(format!("{method} is only available on strings"))),
    };

    let arg_str = |idx: usize| -> DomainResult<&str> {
        match args.get(idx) {
            Some(Value::String(v)) => Ok(v.as_str()),
            _ => Err(err(format!("{method} expects a string argument"))),
        }
    };
    let chars: Vec<char> = s.chars().collect();
    let resolve_index = |value: Option<&Value>, default: i64| -> DomainResult<i64> {
        match value {
            None => Ok(default),
            Some(v) => Ok(as_number(v)? as i64),
        }
    };

    match method {
        "toLowerCase" => Ok(Value::String(s.to_lowercase())),
        "toUpperCase" => Ok(Value::String(s.to_uppercase())),
        "trim" => Ok(Value::String(s.trim().to_string())),
        "includes" => Ok(Value::Bool(s.contains(arg_str(0)?))),
        "startsWith" => Ok(Value::Bool(s.starts_with(arg_str(0)?))),
        "endsWith" => Ok(Value::Bool(s.ends_with(arg_str(0)?))),
        "slice" => {
            let len = chars.len() as i64;
            let clamp = |idx: i64| -> usize {
                let idx = if idx < 0 { len + idx } else { idx };
                idx.clamp(0, len) as usize
            };
            let start = clamp(resolve_index(args.first(), 0)?);
            let end = clamp(resolve_index(args.get(1), len)?);
            let out: String = if start < end {
                chars[start..end].iter().collect()
            } else {
                String::new()
            };
            Ok(Value::String(out))
        }
        "substring" => {
            let len = chars.len() as i64;
            let clamp = |idx: i64| -> usize { idx.clamp(0, len) as usize };
            let mut start = clamp(resolve_index(args.first(), 0)?);
            let mut end = clamp(resolve_index(args.get(1), len)?);
            if start > end {
                std::mem::swap(&mut start, &mut end);
            }
            Ok(Value::String(chars[start..end].iter().collect()))
        }
        "split" => {
            let sep = arg_str(0)?;
            let parts: Vec<Value> = if sep.is_empty() {
                s.chars().map(|c| Value::String(c.to_string())).collect()
            } else {
                s.split(sep).map(|p| Value::String(p.to_string())).collect()
            };
            Ok(Value::Array(parts))
        }
        "replace" => {
            let from = arg_str(0)?;
            let to = arg_str(1)?;
            Ok(Value::String(s.replacen(from, to, 1)))
        }
        "match" => {
            let pattern = arg_str(0)?;
            let re = regex::Regex::new(pattern).map_err(|e| err(format!("bad regex: {e}")))?;
            match re.captures(s) {
                Some(captures) => {
                    let groups: Vec<Value> = captures
                        .iter()
                        .map(|g| match g {
                            Some(m) => Value::String(m.as_str().to_string()),
                            None => Value::Null,
                        })
                        .collect();
                    Ok(Value::Array(groups))
                }
                None => Ok(Value::Null),
            }
        }
        _ => Err(err(format!("method {method:?} is not allowed"))),
    }
}
