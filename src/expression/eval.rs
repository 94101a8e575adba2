//! Tree-walking evaluation of parsed expressions against a JSON context.

use serde_json::{Map, Number, Value};

use super::ast::{BinaryOp, Expr, UnaryOp};
use crate::error::{Error, Result};

/// Context key holding the current loop item.
pub const ITEM_KEY: &str = "item";

pub(crate) fn eval(expr: &Expr, ctx: &Map<String, Value>) -> Result<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Ident(name) => lookup_identifier(name, ctx),
        Expr::Member(target, name) => {
            let target = eval(target, ctx)?;
            member(&target, name)
        }
        Expr::Index(target, index) => {
            let target = eval(target, ctx)?;
            match eval(index, ctx)? {
                Value::String(key) => member(&target, &key),
                Value::Number(n) => match (n.as_u64(), &target) {
                    (Some(i), Value::Array(items)) => items.get(i as usize).cloned().ok_or_else(|| {
                        Error::Expression(format!(
                            "index {} out of bounds (length {})",
                            i,
                            items.len()
                        ))
                    }),
                    _ => Err(Error::Expression(format!(
                        "cannot index {} with {}",
                        type_name(&target),
                        n
                    ))),
                },
                other => Err(Error::Expression(format!(
                    "invalid index type {}",
                    type_name(&other)
                ))),
            }
        }
        Expr::Unary(op, operand) => {
            let value = eval(operand, ctx)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!is_truthy(&value))),
                UnaryOp::Neg => match to_num(&value) {
                    Some(Num::Int(i)) => match i.checked_neg() {
                        Some(n) => Ok(Value::from(n)),
                        None => float_value(-(i as f64)),
                    },
                    Some(Num::Float(f)) => float_value(-f),
                    None => Err(Error::Expression(format!(
                        "cannot negate {}",
                        type_name(&value)
                    ))),
                },
            }
        }
        Expr::Binary(BinaryOp::And, left, right) => {
            if !is_truthy(&eval(left, ctx)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(is_truthy(&eval(right, ctx)?)))
        }
        Expr::Binary(BinaryOp::Or, left, right) => {
            if is_truthy(&eval(left, ctx)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(is_truthy(&eval(right, ctx)?)))
        }
        Expr::Binary(op, left, right) => {
            let left = eval(left, ctx)?;
            let right = eval(right, ctx)?;
            binary(*op, &left, &right)
        }
        Expr::Ternary(condition, then, otherwise) => {
            if is_truthy(&eval(condition, ctx)?) {
                eval(then, ctx)
            } else {
                eval(otherwise, ctx)
            }
        }
        Expr::Call(name, args) => call(name, args, ctx),
    }
}

fn lookup_identifier(name: &str, ctx: &Map<String, Value>) -> Result<Value> {
    if let Some(value) = ctx.get(name) {
        return Ok(value.clone());
    }
    if let Some(Value::Object(item)) = ctx.get(ITEM_KEY) {
        if let Some(value) = item.get(name) {
            return Ok(value.clone());
        }
    }
    Err(Error::Expression(format!("unresolved identifier '{}'", name)))
}

fn member(target: &Value, name: &str) -> Result<Value> {
    match target {
        Value::Object(map) => map
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Expression(format!("unresolved property '{}'", name))),
        Value::Array(items) => {
            if name == "length" {
                return Ok(Value::from(items.len()));
            }
            name.parse::<usize>()
                .ok()
                .and_then(|i| items.get(i).cloned())
                .ok_or_else(|| Error::Expression(format!("unresolved array element '{}'", name)))
        }
        Value::String(s) if name == "length" => Ok(Value::from(s.chars().count())),
        other => Err(Error::Expression(format!(
            "cannot read property '{}' of {}",
            name,
            type_name(other)
        ))),
    }
}

// =============================================================================
// OPERATORS
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

fn to_num(value: &Value) -> Option<Num> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(Num::Int(i)),
            None => n.as_f64().map(Num::Float),
        },
        _ => None,
    }
}

fn float_value(f: f64) -> Result<Value> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| Error::Expression(format!("arithmetic produced a non-finite value ({})", f)))
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(left, right))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(left, right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => compare(op, left, right),
        BinaryOp::Add if left.is_string() || right.is_string() => Ok(Value::String(format!(
            "{}{}",
            to_display_string(left),
            to_display_string(right)
        ))),
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            match (to_num(left), to_num(right)) {
                (Some(a), Some(b)) => arithmetic(op, a, b),
                _ => Err(Error::Expression(format!(
                    "operator '{}' not supported between {} and {}",
                    op.symbol(),
                    type_name(left),
                    type_name(right)
                ))),
            }
        }
        BinaryOp::And => Ok(Value::Bool(is_truthy(left) && is_truthy(right))),
        BinaryOp::Or => Ok(Value::Bool(is_truthy(left) || is_truthy(right))),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (to_num(left), to_num(right)) {
        (Some(Num::Int(a)), Some(Num::Int(b))) => a == b,
        (Some(a), Some(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> Result<Value> {
    let ordering = match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => match (to_num(left), to_num(right)) {
            (Some(Num::Int(a)), Some(Num::Int(b))) => Some(a.cmp(&b)),
            (Some(a), Some(b)) => a.as_f64().partial_cmp(&b.as_f64()),
            _ => {
                return Err(Error::Expression(format!(
                    "cannot compare {} with {}",
                    type_name(left),
                    type_name(right)
                )))
            }
        },
    };

    let Some(ordering) = ordering else {
        return Ok(Value::Bool(false));
    };
    let result = match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        _ => ordering.is_ge(),
    };
    Ok(Value::Bool(result))
}

fn arithmetic(op: BinaryOp, a: Num, b: Num) -> Result<Value> {
    if matches!(op, BinaryOp::Div | BinaryOp::Rem) && b.as_f64() == 0.0 {
        return Err(Error::Expression(format!(
            "{} by zero",
            if op == BinaryOp::Div { "division" } else { "modulo" }
        )));
    }

    if let (Num::Int(x), Num::Int(y)) = (a, b) {
        let exact = match op {
            BinaryOp::Add => x.checked_add(y),
            BinaryOp::Sub => x.checked_sub(y),
            BinaryOp::Mul => x.checked_mul(y),
            BinaryOp::Div if x.checked_rem(y) == Some(0) => x.checked_div(y),
            BinaryOp::Div => None,
            _ => x.checked_rem(y),
        };
        if let Some(n) = exact {
            return Ok(Value::from(n));
        }
    }

    let (x, y) = (a.as_f64(), b.as_f64());
    let result = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div => x / y,
        _ => x % y,
    };
    float_value(result)
}

// =============================================================================
// FUNCTIONS
// =============================================================================

fn call(name: &str, args: &[Expr], ctx: &Map<String, Value>) -> Result<Value> {
    if name == "coalesce" {
        for arg in args {
            match eval(arg, ctx) {
                Ok(Value::Null) | Err(_) => continue,
                Ok(value) => return Ok(value),
            }
        }
        return Ok(Value::Null);
    }

    let values = args
        .iter()
        .map(|arg| eval(arg, ctx))
        .collect::<Result<Vec<_>>>()?;
    let single = |values: &[Value]| -> Result<Value> {
        match values {
            [value] => Ok(value.clone()),
            _ => Err(Error::Expression(format!(
                "{}() takes exactly one argument, got {}",
                name,
                values.len()
            ))),
        }
    };

    match name {
        "len" => match single(&values)? {
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(items) => Ok(Value::from(items.len())),
            Value::Object(map) => Ok(Value::from(map.len())),
            Value::Null => Ok(Value::from(0)),
            other => Err(Error::Expression(format!(
                "len() not supported for {}",
                type_name(&other)
            ))),
        },
        "lower" => Ok(Value::String(to_display_string(&single(&values)?).to_lowercase())),
        "upper" => Ok(Value::String(to_display_string(&single(&values)?).to_uppercase())),
        "string" => Ok(Value::String(to_display_string(&single(&values)?))),
        _ => Err(Error::Expression(format!("unknown function '{}'", name))),
    }
}

// =============================================================================
// CONVERSIONS
// =============================================================================

/// Truthiness used for conditions: null, false, zero, empty strings and
/// empty arrays are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

/// String form used for concatenation, switch case lookup and template keys.
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
