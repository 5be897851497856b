//! Sandboxed guard-expression evaluation.
//!
//! Guards are evaluated by a hand-rolled lexer, recursive-descent parser and
//! AST walker over a small closed grammar. Expression text can never reach a
//! host-language evaluator, define functions, or touch anything beyond the
//! supplied context map; the worst an expression can do is fail to parse.

mod lexer;
mod parser;

use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use crate::graph::{Condition, Dialect};

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("parse error at {pos}: {message}")]
    Parse { pos: usize, message: String },
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("unsupported context value for '{0}'")]
    Unsupported(String),
    #[error("type error: {0}")]
    Type(String),
}

/// Value domain of the expression language.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    Bool(bool),
    Num(f64),
    Str(String),
    Null,
}

impl ExprValue {
    pub fn truthy(&self) -> bool {
        match self {
            ExprValue::Bool(b) => *b,
            ExprValue::Num(n) => *n != 0.0 && !n.is_nan(),
            ExprValue::Str(s) => !s.is_empty(),
            ExprValue::Null => false,
        }
    }

    pub fn to_number(&self) -> Option<f64> {
        match self {
            ExprValue::Num(n) => Some(*n),
            ExprValue::Bool(true) => Some(1.0),
            ExprValue::Bool(false) => Some(0.0),
            ExprValue::Str(s) => s.trim().parse::<f64>().ok(),
            ExprValue::Null => Some(0.0),
        }
    }

    pub fn display(&self) -> String {
        match self {
            ExprValue::Bool(b) => b.to_string(),
            ExprValue::Num(n) => {
                // f64 holds exact integers only up to 2^53; beyond that the
                // i64 cast would saturate, so keep the float rendering.
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 9_007_199_254_740_992.0 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            ExprValue::Str(s) => s.clone(),
            ExprValue::Null => "null".to_string(),
        }
    }

    pub fn strict_eq(&self, other: &ExprValue) -> bool {
        match (self, other) {
            (ExprValue::Bool(a), ExprValue::Bool(b)) => a == b,
            (ExprValue::Num(a), ExprValue::Num(b)) => a == b,
            (ExprValue::Str(a), ExprValue::Str(b)) => a == b,
            (ExprValue::Null, ExprValue::Null) => true,
            _ => false,
        }
    }

    pub fn loose_eq(&self, other: &ExprValue) -> bool {
        if self.strict_eq(other) {
            return true;
        }
        match (self.to_number(), other.to_number()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    fn from_json(name: &str, value: &Value) -> Result<ExprValue, ExprError> {
        match value {
            Value::Bool(b) => Ok(ExprValue::Bool(*b)),
            Value::Number(n) => n
                .as_f64()
                .map(ExprValue::Num)
                .ok_or_else(|| ExprError::Unsupported(name.to_string())),
            Value::String(s) => Ok(ExprValue::Str(s.clone())),
            Value::Null => Ok(ExprValue::Null),
            Value::Array(_) | Value::Object(_) => Err(ExprError::Unsupported(name.to_string())),
        }
    }
}

/// Rewrites the friendly condition dialect into the expression grammar:
/// `and` -> `&&`, `or` -> `||`, `not` -> `!`, bare `=` -> `===`. String
/// literals pass through untouched; `==`, `!=`, `<=`, `>=` are preserved.
pub fn rewrite_friendly(src: &str) -> String {
    let mut out = String::with_capacity(src.len() + 8);
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\'' || c == '"' {
            let quote = c;
            out.push(c);
            i += 1;
            while i < chars.len() {
                out.push(chars[i]);
                if chars[i] == '\\' && i + 1 < chars.len() {
                    out.push(chars[i + 1]);
                    i += 2;
                    continue;
                }
                let done = chars[i] == quote;
                i += 1;
                if done {
                    break;
                }
            }
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            match word.as_str() {
                "and" => out.push_str("&&"),
                "or" => out.push_str("||"),
                "not" => out.push('!'),
                _ => out.push_str(&word),
            }
        } else if c == '=' {
            let mut run = 0;
            while i + run < chars.len() && chars[i + run] == '=' {
                run += 1;
            }
            let prev = out.trim_end().chars().last();
            if run == 1 && !matches!(prev, Some('!') | Some('<') | Some('>') | Some('=')) {
                out.push_str("===");
            } else {
                for _ in 0..run {
                    out.push('=');
                }
            }
            i += run;
        } else {
            out.push(c);
            i += 1;
        }
    }

    out
}

/// Evaluates expression text to its value. Unknown identifiers resolve to
/// `fallback` when one is configured.
pub fn evaluate_value(
    text: &str,
    context: &HashMap<String, Value>,
    fallback: Option<&ExprValue>,
) -> Result<ExprValue, ExprError> {
    let tokens = lexer::lex(text)?;
    let ast = parser::Parser::new(tokens).parse()?;
    let resolve = |name: &str| -> Result<ExprValue, ExprError> {
        match context.get(name) {
            Some(v) => ExprValue::from_json(name, v),
            None => match fallback {
                Some(v) => Ok(v.clone()),
                None => Err(ExprError::UnknownVariable(name.to_string())),
            },
        }
    };
    parser::eval(&ast, &resolve)
}

/// Evaluates expression text to a boolean. Empty or whitespace-only text is
/// an unconditional flow and evaluates to `true`.
pub fn evaluate(
    text: &str,
    context: &HashMap<String, Value>,
    fallback: Option<&ExprValue>,
) -> Result<bool, ExprError> {
    if text.trim().is_empty() {
        return Ok(true);
    }
    Ok(evaluate_value(text, context, fallback)?.truthy())
}

/// Evaluates a guard condition, routing the friendly dialect through the
/// rewrite pass first.
pub fn evaluate_condition(
    condition: &Condition,
    context: &HashMap<String, Value>,
    fallback: Option<&ExprValue>,
) -> Result<bool, ExprError> {
    match condition.dialect {
        Dialect::Expression => evaluate(&condition.body, context, fallback),
        Dialect::Friendly => evaluate(&rewrite_friendly(&condition.body), context, fallback),
    }
}
