// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Expression Evaluator: a restricted-grammar safe evaluator for
//! plain dotted/indexed paths and `${...}` expressions.
//!
//! There is no `ast`-module equivalent to lean on here, so the allowed
//! grammar is implemented as a small hand-rolled recursive-descent parser.
//! Anything outside its accepted productions is rejected with
//! `"Unsupported expression element: {kind}"`.

use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};
use crate::value::Value;

// ---------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Op(String),
    Eof,
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
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
            '\'' | '"' => {
                let quote = c;
                i += 1;
                let mut s = String::new();
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                i += 1; // closing quote
                tokens.push(Token::Str(s));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| OrchestratorError::UnsupportedExpression(format!("number:{}", text)))?;
                tokens.push(Token::Number(n));
            }
            '=' | '!' | '<' | '>' => {
                let mut op = String::from(c);
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    op.push('=');
                    i += 2;
                } else {
                    i += 1;
                }
                tokens.push(Token::Op(op));
            }
            '+' | '-' | '*' | '/' | '%' => {
                tokens.push(Token::Op(c.to_string()));
                i += 1;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(OrchestratorError::UnsupportedExpression(format!(
                    "character '{}'",
                    other
                )))
            }
        }
    }
    tokens.push(Token::Eof);
    Ok(tokens)
}

// ---------------------------------------------------------------------
// AST — every variant here corresponds to an allowed grammar production.
// There is no catch-all "other" node: anything the parser cannot build
// one of these from is rejected before evaluation.
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Name(String),
    Attribute(Box<Expr>, String),
    Subscript(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
    BoolOp(BoolOp, Vec<Expr>),
    Not(Box<Expr>),
    UnaryMinus(Box<Expr>),
    BinOp(Box<Expr>, ArithOp, Box<Expr>),
    Call(String, Vec<Expr>),
    ListLit(Vec<Expr>),
    DictLit(Vec<(Expr, Expr)>),
}

#[derive(Debug, Clone, Copy)]
enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    In,
    NotIn,
    Is,
    IsNot,
}

#[derive(Debug, Clone, Copy)]
enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy)]
enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

// ---------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, tok: &Token) -> Result<()> {
        if self.peek() == tok {
            self.advance();
            Ok(())
        } else {
            Err(OrchestratorError::ExpressionParse {
                expr: format!("{:?}", self.tokens),
                reason: format!("expected {:?}, found {:?}", tok, self.peek()),
            })
        }
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        let mut operands = vec![];
        while matches!(self.peek(), Token::Ident(s) if s == "or") {
            self.advance();
            if operands.is_empty() {
                operands.push(left.clone());
            }
            operands.push(self.parse_and()?);
        }
        if operands.len() > 1 {
            left = Expr::BoolOp(BoolOp::Or, operands);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        let mut operands = vec![];
        while matches!(self.peek(), Token::Ident(s) if s == "and") {
            self.advance();
            if operands.is_empty() {
                operands.push(left.clone());
            }
            operands.push(self.parse_not()?);
        }
        if operands.len() > 1 {
            left = Expr::BoolOp(BoolOp::And, operands);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if matches!(self.peek(), Token::Ident(s) if s == "not") {
            self.advance();
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr> {
        let left = self.parse_additive()?;
        let op = match self.peek().clone() {
            Token::Op(s) if s == "==" => Some(CompareOp::Eq),
            Token::Op(s) if s == "!=" => Some(CompareOp::NotEq),
            Token::Op(s) if s == "<" => Some(CompareOp::Lt),
            Token::Op(s) if s == "<=" => Some(CompareOp::LtEq),
            Token::Op(s) if s == ">" => Some(CompareOp::Gt),
            Token::Op(s) if s == ">=" => Some(CompareOp::GtEq),
            Token::Ident(s) if s == "in" => Some(CompareOp::In),
            Token::Ident(s) if s == "is" => Some(CompareOp::Is),
            Token::Ident(s) if s == "not" => {
                // lookahead for "not in"
                if self.pos + 1 < self.tokens.len()
                    && self.tokens[self.pos + 1] == Token::Ident("in".to_string())
                {
                    Some(CompareOp::NotIn)
                } else {
                    None
                }
            }
            _ => None,
        };
        let Some(op) = op else {
            return Ok(left);
        };
        match op {
            CompareOp::NotIn => {
                self.advance(); // not
                self.advance(); // in
            }
            CompareOp::Is => {
                self.advance();
                if matches!(self.peek(), Token::Ident(s) if s == "not") {
                    self.advance();
                    let right = self.parse_additive()?;
                    return Ok(Expr::Compare(Box::new(left), CompareOp::IsNot, Box::new(right)));
                }
            }
            _ => {
                self.advance();
            }
        }
        let right = self.parse_additive()?;
        Ok(Expr::Compare(Box::new(left), op, Box::new(right)))
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Op(s) if s == "+" => ArithOp::Add,
                Token::Op(s) if s == "-" => ArithOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::BinOp(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Op(s) if s == "*" => ArithOp::Mul,
                Token::Op(s) if s == "/" => ArithOp::Div,
                Token::Op(s) if s == "%" => ArithOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::BinOp(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Token::Op(s) if s == "-" => {
                self.advance();
                Ok(Expr::UnaryMinus(Box::new(self.parse_unary()?)))
            }
            Token::Op(s) if s == "+" => {
                self.advance();
                self.parse_unary()
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_atom()?;
        loop {
            match self.peek().clone() {
                Token::Dot => {
                    self.advance();
                    let Token::Ident(name) = self.advance() else {
                        return Err(OrchestratorError::UnsupportedExpression(
                            "attribute name".to_string(),
                        ));
                    };
                    expr = Expr::Attribute(Box::new(expr), name);
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(&Token::RBracket)?;
                    expr = Expr::Subscript(Box::new(expr), Box::new(index));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_atom(&mut self) -> Result<Expr> {
        match self.advance() {
            Token::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::LParen => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if self.peek() != &Token::RBracket {
                    items.push(self.parse_expr()?);
                    while self.peek() == &Token::Comma {
                        self.advance();
                        if self.peek() == &Token::RBracket {
                            break;
                        }
                        items.push(self.parse_expr()?);
                    }
                }
                self.expect(&Token::RBracket)?;
                Ok(Expr::ListLit(items))
            }
            Token::Ident(name) => match name.as_str() {
                "True" => Ok(Expr::Literal(Value::Bool(true))),
                "False" => Ok(Expr::Literal(Value::Bool(false))),
                "None" => Ok(Expr::Literal(Value::Null)),
                "coalesce" => {
                    self.expect(&Token::LParen)?;
                    let mut args = Vec::new();
                    if self.peek() != &Token::RParen {
                        args.push(self.parse_expr()?);
                        while self.peek() == &Token::Comma {
                            self.advance();
                            args.push(self.parse_expr()?);
                        }
                    }
                    self.expect(&Token::RParen)?;
                    Ok(Expr::Call("coalesce".to_string(), args))
                }
                _ if matches!(self.peek(), Token::LParen) => Err(
                    OrchestratorError::UnsupportedExpression(format!("function call '{}'", name)),
                ),
                _ => Ok(Expr::Name(name)),
            },
            other => Err(OrchestratorError::UnsupportedExpression(format!(
                "token {:?}",
                other
            ))),
        }
    }
}

fn parse_expression(src: &str) -> Result<Expr> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if parser.peek() != &Token::Eof {
        return Err(OrchestratorError::ExpressionParse {
            expr: src.to_string(),
            reason: "trailing tokens after expression".to_string(),
        });
    }
    Ok(expr)
}

// ---------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------

/// Internal evaluation failure distinct from a normal `OrchestratorError`:
/// represents the "attribute missing" condition the evaluator falls back
/// on for boolean gates rather than the null-safety sentinel path.
enum EvalError {
    AttributeMissing,
    Other(OrchestratorError),
}

impl From<OrchestratorError> for EvalError {
    fn from(e: OrchestratorError) -> Self {
        EvalError::Other(e)
    }
}

/// Internal evaluation value, carrying the null-safety sentinel alongside
/// real values. The sentinel is stripped to `Value::Null` before it is
/// ever returned to a caller.
#[derive(Clone)]
enum EvalValue {
    Real(Value),
    NullSafe,
}

impl EvalValue {
    fn strip(self) -> Value {
        match self {
            EvalValue::Real(v) => v,
            EvalValue::NullSafe => Value::Null,
        }
    }

    fn is_truthy(&self) -> bool {
        match self {
            EvalValue::Real(v) => v.is_truthy(),
            EvalValue::NullSafe => false,
        }
    }

    fn equals_none(&self) -> bool {
        matches!(self, EvalValue::NullSafe) || matches!(self, EvalValue::Real(Value::Null))
    }
}

async fn eval_node(expr: &Expr, ctx: &ExecutionContext) -> std::result::Result<EvalValue, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(EvalValue::Real(v.clone())),
        Expr::Name(name) => match ctx.get(name).await {
            Some(v) => Ok(EvalValue::Real(v)),
            None => Ok(EvalValue::NullSafe),
        },
        Expr::Attribute(obj, name) => {
            let obj_val = Box::pin(eval_node(obj, ctx)).await?;
            match obj_val {
                EvalValue::NullSafe => Ok(EvalValue::NullSafe),
                EvalValue::Real(v) => match v.get(name) {
                    Some(found) => Ok(EvalValue::Real(found.clone())),
                    None => Ok(EvalValue::NullSafe),
                },
            }
        }
        Expr::Subscript(obj, index) => {
            let obj_val = Box::pin(eval_node(obj, ctx)).await?;
            let index_val = Box::pin(eval_node(index, ctx)).await?;
            match obj_val {
                EvalValue::NullSafe => Ok(EvalValue::NullSafe),
                EvalValue::Real(v) => {
                    let result = match index_val {
                        EvalValue::Real(Value::Number(n)) => v.get_index(n as usize).cloned(),
                        EvalValue::Real(Value::String(s)) => v.get(&s).cloned(),
                        _ => None,
                    };
                    Ok(result.map(EvalValue::Real).unwrap_or(EvalValue::NullSafe))
                }
            }
        }
        Expr::Not(inner) => {
            let v = Box::pin(eval_node(inner, ctx)).await?;
            Ok(EvalValue::Real(Value::Bool(!v.is_truthy())))
        }
        Expr::UnaryMinus(inner) => {
            let v = Box::pin(eval_node(inner, ctx)).await?;
            match v {
                EvalValue::Real(Value::Number(n)) => Ok(EvalValue::Real(Value::Number(-n))),
                _ => Err(EvalError::AttributeMissing),
            }
        }
        Expr::BoolOp(op, operands) => {
            match op {
                BoolOp::And => {
                    let mut last = EvalValue::Real(Value::Bool(true));
                    for operand in operands {
                        last = Box::pin(eval_node(operand, ctx)).await?;
                        if !last.is_truthy() {
                            return Ok(last);
                        }
                    }
                    Ok(last)
                }
                BoolOp::Or => {
                    let mut last = EvalValue::Real(Value::Bool(false));
                    for operand in operands {
                        last = Box::pin(eval_node(operand, ctx)).await?;
                        if last.is_truthy() {
                            return Ok(last);
                        }
                    }
                    Ok(last)
                }
            }
        }
        Expr::BinOp(left, op, right) => {
            let l = Box::pin(eval_node(left, ctx)).await?;
            let r = Box::pin(eval_node(right, ctx)).await?;
            if l.equals_none() || r.equals_none() {
                return Err(EvalError::AttributeMissing);
            }
            let (EvalValue::Real(lv), EvalValue::Real(rv)) = (l, r) else {
                return Err(EvalError::AttributeMissing);
            };
            match (lv, rv, op) {
                (Value::Number(a), Value::Number(b), ArithOp::Add) => {
                    Ok(EvalValue::Real(Value::Number(a + b)))
                }
                (Value::Number(a), Value::Number(b), ArithOp::Sub) => {
                    Ok(EvalValue::Real(Value::Number(a - b)))
                }
                (Value::Number(a), Value::Number(b), ArithOp::Mul) => {
                    Ok(EvalValue::Real(Value::Number(a * b)))
                }
                (Value::Number(a), Value::Number(b), ArithOp::Div) => {
                    Ok(EvalValue::Real(Value::Number(a / b)))
                }
                (Value::Number(a), Value::Number(b), ArithOp::Mod) => {
                    Ok(EvalValue::Real(Value::Number(a % b)))
                }
                (Value::String(a), Value::String(b), ArithOp::Add) => {
                    Ok(EvalValue::Real(Value::String(a + &b)))
                }
                _ => Err(EvalError::AttributeMissing),
            }
        }
        Expr::Compare(left, op, right) => {
            let l = Box::pin(eval_node(left, ctx)).await?;
            let r = Box::pin(eval_node(right, ctx)).await?;
            eval_compare(l, *op, r)
        }
        Expr::Call(name, args) => {
            if name != "coalesce" {
                return Err(EvalError::Other(OrchestratorError::UnsupportedExpression(
                    format!("function call '{}'", name),
                )));
            }
            for arg in args {
                let v = Box::pin(eval_node(arg, ctx)).await?;
                if !v.equals_none() {
                    return Ok(v);
                }
            }
            Ok(EvalValue::NullSafe)
        }
        Expr::ListLit(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(Box::pin(eval_node(item, ctx)).await?.strip());
            }
            Ok(EvalValue::Real(Value::List(out)))
        }
        Expr::DictLit(pairs) => {
            let mut map = std::collections::BTreeMap::new();
            for (k, v) in pairs {
                let key = Box::pin(eval_node(k, ctx)).await?.strip();
                let val = Box::pin(eval_node(v, ctx)).await?.strip();
                if let Value::String(key) = key {
                    map.insert(key, val);
                }
            }
            Ok(EvalValue::Real(Value::Map(map)))
        }
    }
}

fn eval_compare(
    l: EvalValue,
    op: CompareOp,
    r: EvalValue,
) -> std::result::Result<EvalValue, EvalError> {
    match op {
        CompareOp::Eq | CompareOp::Is => {
            if l.equals_none() && r.equals_none() {
                return Ok(EvalValue::Real(Value::Bool(true)));
            }
            if l.equals_none() || r.equals_none() {
                return Ok(EvalValue::Real(Value::Bool(false)));
            }
            let (EvalValue::Real(lv), EvalValue::Real(rv)) = (l, r) else {
                unreachable!()
            };
            Ok(EvalValue::Real(Value::Bool(lv == rv)))
        }
        CompareOp::NotEq | CompareOp::IsNot => {
            let eq = eval_compare(l, CompareOp::Eq, r)?;
            Ok(EvalValue::Real(Value::Bool(!eq.is_truthy())))
        }
        CompareOp::Lt | CompareOp::LtEq | CompareOp::Gt | CompareOp::GtEq => {
            if l.equals_none() || r.equals_none() {
                return Err(EvalError::AttributeMissing);
            }
            let (EvalValue::Real(Value::Number(a)), EvalValue::Real(Value::Number(b))) = (l, r)
            else {
                return Err(EvalError::AttributeMissing);
            };
            let result = match op {
                CompareOp::Lt => a < b,
                CompareOp::LtEq => a <= b,
                CompareOp::Gt => a > b,
                CompareOp::GtEq => a >= b,
                _ => unreachable!(),
            };
            Ok(EvalValue::Real(Value::Bool(result)))
        }
        CompareOp::In | CompareOp::NotIn => {
            if r.equals_none() {
                return Err(EvalError::AttributeMissing);
            }
            let EvalValue::Real(container) = r else {
                unreachable!()
            };
            let needle = l.strip();
            let found = match &container {
                Value::List(items) => items.contains(&needle),
                Value::String(s) => needle
                    .as_str()
                    .map(|n| s.contains(n))
                    .unwrap_or(false),
                Value::Map(map) => needle
                    .as_str()
                    .map(|n| map.contains_key(n))
                    .unwrap_or(false),
                _ => false,
            };
            let result = if matches!(op, CompareOp::In) {
                found
            } else {
                !found
            };
            Ok(EvalValue::Real(Value::Bool(result)))
        }
    }
}

/// Evaluates a `${...}` expression (the braces already stripped) against
/// the given context. Errors that represent a genuinely unsupported
/// construct propagate; the "attribute missing" fallback resolves
/// to `true`/`false` based on whether the source text mentions `not in`
/// or `!=`.
pub async fn evaluate_expr(src: &str, ctx: &ExecutionContext) -> Result<Value> {
    let ast = parse_expression(src)?;
    match eval_node(&ast, ctx).await {
        Ok(v) => Ok(v.strip()),
        Err(EvalError::AttributeMissing) => {
            if src.contains("not in") || src.contains("!=") {
                Ok(Value::Bool(true))
            } else {
                Ok(Value::Bool(false))
            }
        }
        Err(EvalError::Other(e)) => Err(e),
    }
}

/// Evaluates a plain dotted/indexed path with no `${...}` wrapper — just a
/// context lookup, never raising (null-safety applies the same way).
pub async fn evaluate_plain_path(path: &str, ctx: &ExecutionContext) -> Result<Value> {
    Ok(ctx.get(path).await.unwrap_or(Value::Null))
}

/// Dispatches on whether `raw` is a `${...}` expression or a plain path.
pub async fn evaluate(raw: &str, ctx: &ExecutionContext) -> Result<Value> {
    if let Some(inner) = raw.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        evaluate_expr(inner, ctx).await
    } else {
        evaluate_plain_path(raw, ctx).await
    }
}

/// Evaluates a boolean gate expression (`when`/`unless`/`loop_until`),
/// defaulting to its truthiness.
pub async fn evaluate_bool(raw: &str, ctx: &ExecutionContext) -> Result<bool> {
    Ok(evaluate(raw, ctx).await?.is_truthy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn null_safe_chain_never_raises() {
        let ctx = ExecutionContext::new("wf", "run-1");
        let result = evaluate_expr("steps.skipped_step.outputs.foo", &ctx).await;
        assert_eq!(result.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn coalesce_returns_first_non_null_argument() {
        let ctx = Arc::new(ExecutionContext::new("wf", "run-1"));
        ctx.set("inputs.default", Value::from("fallback")).await;
        let result = evaluate_expr(
            "coalesce(steps.skipped_step.outputs.code, inputs.default)",
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(result, Value::from("fallback"));
    }

    #[tokio::test]
    async fn in_operator_checks_list_membership() {
        let ctx = Arc::new(ExecutionContext::new("wf", "run-1"));
        ctx.set("status", Value::from("APPROVED")).await;
        let result = evaluate_expr("status in ['APPROVED', 'APPROVED_WITH_NOTES']", &ctx)
            .await
            .unwrap();
        assert_eq!(result, Value::Bool(true));
    }

    #[tokio::test]
    async fn comparison_and_boolean_composition() {
        let ctx = Arc::new(ExecutionContext::new("wf", "run-1"));
        ctx.set("count", Value::from(3.0)).await;
        let result = evaluate_expr("count > 1 and count < 10", &ctx).await.unwrap();
        assert_eq!(result, Value::Bool(true));
    }

    #[tokio::test]
    async fn unsupported_token_is_rejected() {
        let ctx = ExecutionContext::new("wf", "run-1");
        let err = evaluate_expr("import os", &ctx).await.unwrap_err();
        match err {
            OrchestratorError::UnsupportedExpression(_) => {}
            other => panic!("expected UnsupportedExpression, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn plain_path_lookup_does_not_require_dollar_brace() {
        let ctx = Arc::new(ExecutionContext::new("wf", "run-1"));
        ctx.set("a.b", Value::from("value")).await;
        let result = evaluate("a.b", &ctx).await.unwrap();
        assert_eq!(result, Value::from("value"));
    }
}
