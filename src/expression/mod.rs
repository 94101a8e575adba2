//! Restricted expression language used by conditions, routing, transforms
//! and template-matrix keys.
//!
//! Expressions read from a context map and never mutate it. Supported:
//! literals, dotted and bracket access, `+ - * / %`, comparisons, boolean
//! logic, a ternary and a handful of built-in functions.
//!
//! ```
//! use serde_json::{json, Map, Value};
//!
//! let ctx: Map<String, Value> = json!({"remaining_days": 6, "sendEveryNDays": 3})
//!     .as_object()
//!     .cloned()
//!     .unwrap();
//! let due = eduflow::expression::evaluate("remaining_days % sendEveryNDays == 0", &ctx).unwrap();
//! assert_eq!(due, json!(true));
//! ```

pub mod ast;
mod eval;
mod parser;

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::Result;
use ast::Expr;

pub use eval::{is_truthy, to_display_string, ITEM_KEY};
pub use parser::parse_expression;

/// A parsed expression that can be evaluated repeatedly.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self> {
        Ok(Self {
            source: source.to_string(),
            ast: parse_expression(source)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    pub fn evaluate(&self, ctx: &Map<String, Value>) -> Result<Value> {
        eval::eval(&self.ast, ctx)
    }

    pub fn evaluate_boolean(&self, ctx: &Map<String, Value>, default: bool) -> bool {
        match self.evaluate(ctx) {
            Ok(value) => is_truthy(&value),
            Err(e) => {
                debug!(expression = %self.source, error = %e, "Condition fell back to default");
                default
            }
        }
    }
}

/// Parse and evaluate `expression` against `ctx`.
pub fn evaluate(expression: &str, ctx: &Map<String, Value>) -> Result<Value> {
    Expression::parse(expression)?.evaluate(ctx)
}

/// Evaluate `expression` as a condition.
///
/// Parse and evaluation errors yield `default`; non-boolean results are
/// converted by truthiness.
pub fn evaluate_boolean(expression: &str, ctx: &Map<String, Value>, default: bool) -> bool {
    match Expression::parse(expression) {
        Ok(parsed) => parsed.evaluate_boolean(ctx, default),
        Err(e) => {
            debug!(expression, error = %e, "Condition fell back to default");
            default
        }
    }
}
