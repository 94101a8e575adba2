//! Nom parser for the expression grammar.
//!
//! Precedence, lowest first: ternary, `||`/`or`, `&&`/`and`, equality,
//! comparison, additive, multiplicative, unary, postfix access.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, digit1, multispace0, one_of, satisfy},
    combinator::{all_consuming, map, map_opt, not, opt, recognize, value, verify},
    multi::{many0, separated_list0},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use serde_json::{Number, Value};

use super::ast::{BinaryOp, Expr, UnaryOp};
use crate::error::{Error, Result};

const KEYWORDS: &[&str] = &["and", "or", "not", "true", "false", "null"];

/// Longest accepted expression, in bytes.
pub const MAX_EXPRESSION_LEN: usize = 4096;

/// Deepest accepted nesting of brackets, prefix operators and ternaries.
pub const MAX_NESTING_DEPTH: usize = 64;

/// Parse a complete expression string.
pub fn parse_expression(source: &str) -> Result<Expr> {
    if source.trim().is_empty() {
        return Err(Error::Expression("empty expression".to_string()));
    }
    if source.len() > MAX_EXPRESSION_LEN {
        return Err(Error::Expression(format!(
            "expression is {} bytes long, the limit is {}",
            source.len(),
            MAX_EXPRESSION_LEN
        )));
    }
    let depth = nesting_depth(source);
    if depth > MAX_NESTING_DEPTH {
        return Err(Error::Expression(format!(
            "expression nests {} levels deep, the limit is {}",
            depth, MAX_NESTING_DEPTH
        )));
    }

    match all_consuming(ws(expr))(source) {
        Ok((_, parsed)) => Ok(parsed),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(Error::Expression(format!(
            "malformed expression '{}' near '{}'",
            source,
            snippet(e.input)
        ))),
        Err(nom::Err::Incomplete(_)) => Err(Error::Expression(format!(
            "incomplete expression '{}'",
            source
        ))),
    }
}

/// Upper bound on the parser's recursion for `source`: open brackets, plus
/// the current run of prefix operators, plus every ternary seen so far.
/// String literals are skipped.
fn nesting_depth(source: &str) -> usize {
    let mut brackets = 0usize;
    let mut prefix_run = 0usize;
    let mut ternaries = 0usize;
    let mut deepest = 0usize;

    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' | '\'' => {
                let mut escaped = false;
                for inner in chars.by_ref() {
                    match inner {
                        _ if escaped => escaped = false,
                        '\\' => escaped = true,
                        _ if inner == c => break,
                        _ => {}
                    }
                }
                prefix_run = 0;
            }
            '(' | '[' => {
                brackets += 1;
                prefix_run = 0;
            }
            ')' | ']' => {
                brackets = brackets.saturating_sub(1);
                prefix_run = 0;
            }
            '?' => ternaries += 1,
            '!' if chars.peek() != Some(&'=') => prefix_run += 1,
            '-' => prefix_run += 1,
            c if c.is_whitespace() => {}
            c if is_ident_char(c) => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if !is_ident_char(next) {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                if word == "not" {
                    prefix_run += 1;
                } else {
                    prefix_run = 0;
                }
            }
            _ => prefix_run = 0,
        }
        deepest = deepest.max(brackets + prefix_run + ternaries);
    }
    deepest
}

fn snippet(rest: &str) -> String {
    if rest.is_empty() {
        return "<end>".to_string();
    }
    rest.chars().take(20).collect()
}

// =============================================================================
// HELPERS
// =============================================================================

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// A word operator or literal that must not run into an identifier (`or` vs `order`).
fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(tag(word), not(satisfy(is_ident_char)))
}

fn raw_identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c: char| c.is_alphabetic() || c == '_'),
        take_while(is_ident_char),
    ))(input)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    verify(raw_identifier, |name: &str| !KEYWORDS.contains(&name))(input)
}

/// Property names after a dot may be keywords or numeric (`rows.0`).
fn property_name(input: &str) -> IResult<&str, &str> {
    take_while1(is_ident_char)(input)
}

/// Left-associative chain of `operand (operator operand)*`.
fn fold_binary<'a>(
    input: &'a str,
    operand: fn(&'a str) -> IResult<&'a str, Expr>,
    operator: fn(&'a str) -> IResult<&'a str, BinaryOp>,
) -> IResult<&'a str, Expr> {
    let (mut input, mut left) = operand(input)?;
    loop {
        match operator(input) {
            Ok((rest, op)) => {
                let (rest, right) = operand(rest)?;
                left = Expr::Binary(op, Box::new(left), Box::new(right));
                input = rest;
            }
            Err(nom::Err::Error(_)) => return Ok((input, left)),
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// OPERATORS
// =============================================================================

fn or_op(input: &str) -> IResult<&str, BinaryOp> {
    ws(alt((
        value(BinaryOp::Or, tag("||")),
        value(BinaryOp::Or, keyword("or")),
    )))(input)
}

fn and_op(input: &str) -> IResult<&str, BinaryOp> {
    ws(alt((
        value(BinaryOp::And, tag("&&")),
        value(BinaryOp::And, keyword("and")),
    )))(input)
}

fn equality_op(input: &str) -> IResult<&str, BinaryOp> {
    ws(alt((
        value(BinaryOp::Eq, tag("==")),
        value(BinaryOp::Ne, tag("!=")),
    )))(input)
}

fn comparison_op(input: &str) -> IResult<&str, BinaryOp> {
    ws(alt((
        value(BinaryOp::Le, tag("<=")),
        value(BinaryOp::Ge, tag(">=")),
        value(BinaryOp::Lt, char('<')),
        value(BinaryOp::Gt, char('>')),
    )))(input)
}

fn additive_op(input: &str) -> IResult<&str, BinaryOp> {
    ws(alt((
        value(BinaryOp::Add, char('+')),
        value(BinaryOp::Sub, char('-')),
    )))(input)
}

fn multiplicative_op(input: &str) -> IResult<&str, BinaryOp> {
    ws(alt((
        value(BinaryOp::Mul, char('*')),
        value(BinaryOp::Div, char('/')),
        value(BinaryOp::Rem, char('%')),
    )))(input)
}

// =============================================================================
// GRAMMAR
// =============================================================================

fn expr(input: &str) -> IResult<&str, Expr> {
    let (input, condition) = or_expr(input)?;
    let (input, branches) = opt(tuple((ws(char('?')), expr, ws(char(':')), expr)))(input)?;

    let parsed = match branches {
        Some((_, then, _, otherwise)) => Expr::Ternary(
            Box::new(condition),
            Box::new(then),
            Box::new(otherwise),
        ),
        None => condition,
    };
    Ok((input, parsed))
}

fn or_expr(input: &str) -> IResult<&str, Expr> {
    fold_binary(input, and_expr, or_op)
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    fold_binary(input, equality_expr, and_op)
}

fn equality_expr(input: &str) -> IResult<&str, Expr> {
    fold_binary(input, comparison_expr, equality_op)
}

fn comparison_expr(input: &str) -> IResult<&str, Expr> {
    fold_binary(input, additive_expr, comparison_op)
}

fn additive_expr(input: &str) -> IResult<&str, Expr> {
    fold_binary(input, multiplicative_expr, additive_op)
}

fn multiplicative_expr(input: &str) -> IResult<&str, Expr> {
    fold_binary(input, unary_expr, multiplicative_op)
}

fn unary_expr(input: &str) -> IResult<&str, Expr> {
    alt((
        map(
            preceded(ws(alt((tag("!"), keyword("not")))), unary_expr),
            |operand| Expr::Unary(UnaryOp::Not, Box::new(operand)),
        ),
        map(preceded(ws(char('-')), unary_expr), |operand| {
            Expr::Unary(UnaryOp::Neg, Box::new(operand))
        }),
        postfix_expr,
    ))(input)
}

enum Suffix {
    Member(String),
    Index(Expr),
}

fn postfix_expr(input: &str) -> IResult<&str, Expr> {
    let (input, base) = primary(input)?;
    let (input, suffixes) = many0(alt((
        map(preceded(ws(char('.')), property_name), |name: &str| {
            Suffix::Member(name.to_string())
        }),
        map(delimited(ws(char('[')), expr, ws(char(']'))), Suffix::Index),
    )))(input)?;

    let folded = suffixes
        .into_iter()
        .fold(base, |target, suffix| match suffix {
            Suffix::Member(name) => Expr::Member(Box::new(target), name),
            Suffix::Index(index) => Expr::Index(Box::new(target), Box::new(index)),
        });
    Ok((input, folded))
}

fn primary(input: &str) -> IResult<&str, Expr> {
    ws(alt((
        number,
        map(string_literal, |s| Expr::Literal(Value::String(s))),
        value(Expr::Literal(Value::Bool(true)), keyword("true")),
        value(Expr::Literal(Value::Bool(false)), keyword("false")),
        value(Expr::Literal(Value::Null), keyword("null")),
        call,
        map(preceded(opt(char('#')), identifier), |name: &str| {
            Expr::Ident(name.to_string())
        }),
        delimited(char('('), expr, char(')')),
    )))(input)
}

fn call(input: &str) -> IResult<&str, Expr> {
    map(
        pair(
            identifier,
            delimited(
                ws(char('(')),
                separated_list0(ws(char(',')), expr),
                ws(char(')')),
            ),
        ),
        |(name, args)| Expr::Call(name.to_string(), args),
    )(input)
}

fn number(input: &str) -> IResult<&str, Expr> {
    map_opt(
        recognize(tuple((
            digit1,
            opt(pair(char('.'), digit1)),
            opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
        ))),
        |text: &str| {
            let number = if text.contains(['.', 'e', 'E']) {
                text.parse::<f64>().ok().and_then(Number::from_f64)
            } else {
                text.parse::<i64>()
                    .ok()
                    .map(Number::from)
                    .or_else(|| text.parse::<f64>().ok().and_then(Number::from_f64))
            };
            number.map(|n| Expr::Literal(Value::Number(n)))
        },
    )(input)
}

/// Single- or double-quoted string with backslash escapes.
fn string_literal(input: &str) -> IResult<&str, String> {
    let (rest, quote) = alt((char('"'), char('\'')))(input)?;

    let mut out = String::new();
    let mut chars = rest.char_indices();
    while let Some((idx, c)) = chars.next() {
        if c == quote {
            return Ok((&rest[idx + c.len_utf8()..], out));
        }
        if c == '\\' {
            match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, escaped)) => out.push(escaped),
                None => break,
            }
        } else {
            out.push(c);
        }
    }

    Err(nom::Err::Failure(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Char,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lit(v: Value) -> Box<Expr> {
        Box::new(Expr::Literal(v))
    }

    fn ident(name: &str) -> Box<Expr> {
        Box::new(Expr::Ident(name.to_string()))
    }

    #[test]
    fn test_deep_nesting_is_rejected_not_overflowed() {
        let parens = format!("{}1{}", "(".repeat(4000), ")".repeat(4000));
        let err = parse_expression(&parens).unwrap_err();
        assert_eq!(err.code(), "EXPRESSION_ERROR");

        let nots = format!("{}true", "!".repeat(3000));
        assert_eq!(parse_expression(&nots).unwrap_err().code(), "EXPRESSION_ERROR");

        let too_deep = format!("{}1{}", "(".repeat(65), ")".repeat(65));
        assert!(parse_expression(&too_deep).is_err());
        let allowed = format!("{}1{}", "(".repeat(20), ")".repeat(20));
        assert_eq!(parse_expression(&allowed).unwrap(), Expr::Literal(json!(1)));
    }

    #[test]
    fn test_nesting_ignores_brackets_inside_strings() {
        let source = format!("name == '{}'", "(".repeat(200));
        assert!(parse_expression(&source).is_ok());
        assert!(parse_expression("a != b").is_ok());
    }

    #[test]
    fn test_overlong_expression_is_rejected() {
        let long = vec!["x"; MAX_EXPRESSION_LEN].join("+");
        assert_eq!(parse_expression(&long).unwrap_err().code(), "EXPRESSION_ERROR");
    }

    #[test]
    fn test_arithmetic_precedence() {
        let parsed = parse_expression("1 + 2 * 3").unwrap();
        assert_eq!(
            parsed,
            Expr::Binary(
                BinaryOp::Add,
                lit(json!(1)),
                Box::new(Expr::Binary(BinaryOp::Mul, lit(json!(2)), lit(json!(3)))),
            )
        );
    }

    #[test]
    fn test_modulo_condition_shape() {
        let parsed = parse_expression("remaining_days % sendEveryNDays == 0").unwrap();
        assert_eq!(
            parsed,
            Expr::Binary(
                BinaryOp::Eq,
                Box::new(Expr::Binary(
                    BinaryOp::Rem,
                    ident("remaining_days"),
                    ident("sendEveryNDays"),
                )),
                lit(json!(0)),
            )
        );
    }

    #[test]
    fn test_member_and_index_access() {
        let parsed = parse_expression("item.contacts[0]['email']").unwrap();
        assert_eq!(
            parsed,
            Expr::Index(
                Box::new(Expr::Index(
                    Box::new(Expr::Member(ident("item"), "contacts".to_string())),
                    lit(json!(0)),
                )),
                lit(json!("email")),
            )
        );
    }

    #[test]
    fn test_hash_prefix_is_ignored() {
        assert_eq!(
            parse_expression("#item.city").unwrap(),
            parse_expression("item.city").unwrap()
        );
    }

    #[test]
    fn test_keywords_do_not_split_identifiers() {
        let parsed = parse_expression("order and notes").unwrap();
        assert_eq!(
            parsed,
            Expr::Binary(BinaryOp::And, ident("order"), ident("notes"))
        );
    }

    #[test]
    fn test_ternary_and_calls() {
        let parsed = parse_expression("len(items) > 0 ? lower(name) : 'none'").unwrap();
        match parsed {
            Expr::Ternary(cond, then, otherwise) => {
                assert!(matches!(*cond, Expr::Binary(BinaryOp::Gt, _, _)));
                assert!(matches!(*then, Expr::Call(ref name, _) if name == "lower"));
                assert_eq!(*otherwise, Expr::Literal(json!("none")));
            }
            other => panic!("expected ternary, got {:?}", other),
        }
    }

    #[test]
    fn test_string_escapes() {
        let parsed = parse_expression(r#""it\'s \"ok\"""#).unwrap();
        assert_eq!(parsed, Expr::Literal(json!("it's \"ok\"")));
    }

    #[test]
    fn test_float_literal() {
        assert_eq!(parse_expression("0.25").unwrap(), Expr::Literal(json!(0.25)));
    }

    #[test]
    fn test_malformed_expressions_fail() {
        for source in ["a +", "(a", "a b", "'open", "", "a ==", "1 +* 2"] {
            let err = parse_expression(source).unwrap_err();
            assert_eq!(err.code(), "EXPRESSION_ERROR", "source: {:?}", source);
        }
    }
}
