//! Guard Expressions
//!
//! Sequence-flow conditions are parsed once at deployment and evaluated
//! against the variable scope of the execution leaving a node.
//!
//! Supported syntax:
//!
//! ```text
//! amount > 100 && approved
//! status == "open" || !(retries >= 3)
//! order.customer.tier != 'gold'
//! ${x > 10}
//! ```
//!
//! Dotted names index into JSON variables. Referencing a variable that does
//! not exist is an evaluation error, not `false`.

use std::cmp::Ordering;
use std::fmt;

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{char, digit1, multispace0, satisfy},
    combinator::{all_consuming, map, map_res, opt, recognize},
    multi::fold_many0,
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};
use serde_json::Value;
use thiserror::Error;

use crate::runtime::VariableValue;

/// Parse and evaluation failures of guard expressions.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("invalid expression '{expression}': {message}")]
    Syntax { expression: String, message: String },

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("cannot compare {left} with {right}")]
    TypeMismatch { left: String, right: String },

    #[error("expression '{0}' does not evaluate to a boolean")]
    NotBoolean(String),
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// Literal operands.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    /// Variable name followed by JSON path segments
    Variable(Vec<String>),
    Not(Box<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

// ============================================================================
// Parser
// ============================================================================

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.'),
    ))(input)
}

/// Identifiers, with `true`, `false` and `null` as keywords.
fn name_or_keyword(input: &str) -> IResult<&str, Expr> {
    map(identifier, |name: &str| match name {
        "true" => Expr::Literal(Literal::Bool(true)),
        "false" => Expr::Literal(Literal::Bool(false)),
        "null" => Expr::Literal(Literal::Null),
        path => Expr::Variable(path.split('.').map(str::to_string).collect()),
    })(input)
}

fn number(input: &str) -> IResult<&str, Expr> {
    map_res(
        recognize(tuple((opt(char('-')), digit1, opt(pair(char('.'), digit1))))),
        |text: &str| text.parse::<f64>().map(|n| Expr::Literal(Literal::Number(n))),
    )(input)
}

fn string(input: &str) -> IResult<&str, Expr> {
    let double_quoted = delimited(char('"'), take_while(|c: char| c != '"'), char('"'));
    let single_quoted = delimited(char('\''), take_while(|c: char| c != '\''), char('\''));
    map(alt((double_quoted, single_quoted)), |s: &str| {
        Expr::Literal(Literal::Str(s.to_string()))
    })(input)
}

fn parens(input: &str) -> IResult<&str, Expr> {
    delimited(ws(char('(')), or_expr, ws(char(')')))(input)
}

fn operand(input: &str) -> IResult<&str, Expr> {
    ws(alt((parens, string, number, name_or_keyword)))(input)
}

fn cmp_op(input: &str) -> IResult<&str, CmpOp> {
    alt((
        map(tag("=="), |_| CmpOp::Eq),
        map(tag("!="), |_| CmpOp::Ne),
        map(tag(">="), |_| CmpOp::Ge),
        map(tag("<="), |_| CmpOp::Le),
        map(tag(">"), |_| CmpOp::Gt),
        map(tag("<"), |_| CmpOp::Lt),
    ))(input)
}

fn comparison(input: &str) -> IResult<&str, Expr> {
    let (input, left) = operand(input)?;
    let (input, right) = opt(pair(ws(cmp_op), operand))(input)?;
    let expr = match right {
        Some((op, right)) => Expr::Compare(Box::new(left), op, Box::new(right)),
        None => left,
    };
    Ok((input, expr))
}

fn unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(char('!')), unary), |e| Expr::Not(Box::new(e))),
        comparison,
    ))(input)
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = unary(input)?;
    fold_many0(
        preceded(ws(tag("&&")), unary),
        move || first.clone(),
        |acc, next| Expr::And(Box::new(acc), Box::new(next)),
    )(input)
}

fn or_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = and_expr(input)?;
    fold_many0(
        preceded(ws(tag("||")), and_expr),
        move || first.clone(),
        |acc, next| Expr::Or(Box::new(acc), Box::new(next)),
    )(input)
}

/// Strips an optional `${ ... }` wrapper.
fn unwrap_template(source: &str) -> &str {
    let trimmed = source.trim();
    trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .unwrap_or(trimmed)
}

impl Expr {
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let body = unwrap_template(source);
        if body.is_empty() {
            return Err(ExpressionError::Syntax {
                expression: source.to_string(),
                message: "empty expression".to_string(),
            });
        }
        all_consuming(ws(or_expr))(body)
            .map(|(_, expr)| expr)
            .map_err(|e| ExpressionError::Syntax {
                expression: source.to_string(),
                message: e.to_string(),
            })
    }

    /// Variable names this expression reads.
    pub fn variables(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_variables(&mut names);
        names
    }

    fn collect_variables<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Variable(path) => {
                if let Some(name) = path.first() {
                    names.push(name);
                }
            }
            Expr::Not(inner) => inner.collect_variables(names),
            Expr::Compare(l, _, r) | Expr::And(l, r) | Expr::Or(l, r) => {
                l.collect_variables(names);
                r.collect_variables(names);
            }
        }
    }
}

// ============================================================================
// Evaluation
// ============================================================================

/// Value an operand evaluates to.
#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Other(Value),
}

impl Operand {
    fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => n.as_f64().map_or(Self::Other(value.clone()), Self::Number),
            Value::String(s) => Self::Str(s.clone()),
            other => Self::Other(other.clone()),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Bool(b) => format!("boolean {}", b),
            Self::Number(n) => format!("number {}", n),
            Self::Str(s) => format!("string \"{}\"", s),
            Self::Other(v) => format!("value {}", v),
        }
    }
}

fn evaluate_operand<F>(expr: &Expr, lookup: &F) -> Result<Operand, ExpressionError>
where
    F: Fn(&str) -> Option<VariableValue>,
{
    match expr {
        Expr::Literal(Literal::Null) => Ok(Operand::Null),
        Expr::Literal(Literal::Bool(b)) => Ok(Operand::Bool(*b)),
        Expr::Literal(Literal::Number(n)) => Ok(Operand::Number(*n)),
        Expr::Literal(Literal::Str(s)) => Ok(Operand::Str(s.clone())),
        Expr::Variable(path) => {
            let full_name = path.join(".");
            let (name, rest) = path
                .split_first()
                .ok_or_else(|| ExpressionError::UnknownVariable(full_name.clone()))?;
            let value = lookup(name).ok_or_else(|| ExpressionError::UnknownVariable(name.clone()))?;

            if rest.is_empty() {
                return Ok(Operand::from_json(&value.to_json()));
            }
            let mut current = value.to_json();
            for segment in rest {
                current = current
                    .get(segment.as_str())
                    .cloned()
                    .ok_or_else(|| ExpressionError::UnknownVariable(full_name.clone()))?;
            }
            Ok(Operand::from_json(&current))
        }
        other => evaluate_bool(other, lookup).map(Operand::Bool),
    }
}

fn compare(left: &Operand, op: CmpOp, right: &Operand) -> Result<bool, ExpressionError> {
    let ordering = match (left, right) {
        (Operand::Number(a), Operand::Number(b)) => a.partial_cmp(b),
        (Operand::Str(a), Operand::Str(b)) => Some(a.cmp(b)),
        (Operand::Bool(a), Operand::Bool(b)) if matches!(op, CmpOp::Eq | CmpOp::Ne) => Some(a.cmp(b)),
        (Operand::Null, Operand::Null) => Some(Ordering::Equal),
        _ => None,
    };

    match (ordering, op) {
        (Some(o), CmpOp::Eq) => Ok(o == Ordering::Equal),
        (Some(o), CmpOp::Ne) => Ok(o != Ordering::Equal),
        (Some(o), CmpOp::Gt) => Ok(o == Ordering::Greater),
        (Some(o), CmpOp::Ge) => Ok(o != Ordering::Less),
        (Some(o), CmpOp::Lt) => Ok(o == Ordering::Less),
        (Some(o), CmpOp::Le) => Ok(o != Ordering::Greater),
        // Mixed types are simply unequal
        (None, CmpOp::Eq) => Ok(left == right),
        (None, CmpOp::Ne) => Ok(left != right),
        (None, _) => Err(ExpressionError::TypeMismatch {
            left: left.describe(),
            right: right.describe(),
        }),
    }
}

fn evaluate_bool<F>(expr: &Expr, lookup: &F) -> Result<bool, ExpressionError>
where
    F: Fn(&str) -> Option<VariableValue>,
{
    match expr {
        Expr::And(l, r) => Ok(evaluate_bool(l, lookup)? && evaluate_bool(r, lookup)?),
        Expr::Or(l, r) => Ok(evaluate_bool(l, lookup)? || evaluate_bool(r, lookup)?),
        Expr::Not(inner) => Ok(!evaluate_bool(inner, lookup)?),
        Expr::Compare(l, op, r) => {
            let left = evaluate_operand(l, lookup)?;
            let right = evaluate_operand(r, lookup)?;
            compare(&left, *op, &right)
        }
        operand => match evaluate_operand(operand, lookup)? {
            Operand::Bool(b) => Ok(b),
            other => Err(ExpressionError::NotBoolean(other.describe())),
        },
    }
}

/// A parsed guard expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parses a guard.
    ///
    /// # Example
    ///
    /// ```
    /// use procrunner::process::Condition;
    /// use procrunner::runtime::VariableValue;
    ///
    /// let condition = Condition::parse("x > 10").unwrap();
    /// let vars = |name: &str| (name == "x").then(|| VariableValue::Integer(20));
    /// assert!(condition.evaluate(&vars).unwrap());
    /// ```
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        Ok(Self {
            source: source.to_string(),
            expr: Expr::parse(source)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Evaluates against a variable lookup.
    pub fn evaluate<F>(&self, lookup: &F) -> Result<bool, ExpressionError>
    where
        F: Fn(&str) -> Option<VariableValue>,
    {
        evaluate_bool(&self.expr, lookup)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn eval(source: &str, vars: &[(&str, VariableValue)]) -> Result<bool, ExpressionError> {
        let map: HashMap<String, VariableValue> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        let lookup = |name: &str| map.get(name).cloned();
        Condition::parse(source)?.evaluate(&lookup)
    }

    #[test]
    fn test_numeric_comparisons() {
        let x = [("x", VariableValue::Integer(5))];
        assert!(!eval("x > 10", &x).unwrap());
        assert!(eval("x <= 5", &x).unwrap());
        assert!(eval("x == 5", &x).unwrap());
        assert!(eval("x != 4.5", &x).unwrap());
        assert!(eval("x >= -1", &x).unwrap());
        assert!(eval("x < 5.5", &x).unwrap());
    }

    #[test]
    fn test_boolean_logic_and_precedence() {
        let vars = [
            ("a", VariableValue::Boolean(true)),
            ("b", VariableValue::Boolean(false)),
            ("c", VariableValue::Boolean(true)),
        ];
        assert!(eval("a || b && c", &vars).unwrap());
        assert!(!eval("(a || b) && !c", &vars).unwrap());
        assert!(eval("!b", &vars).unwrap());
        assert!(eval("a && (b || c)", &vars).unwrap());
    }

    #[test]
    fn test_strings_and_literals() {
        let vars = [("status", VariableValue::from("open"))];
        assert!(eval("status == \"open\"", &vars).unwrap());
        assert!(eval("status != 'closed'", &vars).unwrap());
        assert!(eval("true", &[]).unwrap());
        assert!(eval("null == null", &[]).unwrap());
    }

    #[test]
    fn test_json_path() {
        let vars = [("order", VariableValue::Json(json!({"customer": {"tier": "gold"}, "total": 250})))];
        assert!(eval("order.customer.tier == 'gold'", &vars).unwrap());
        assert!(eval("order.total > 100", &vars).unwrap());
        assert_eq!(
            eval("order.missing == 1", &vars),
            Err(ExpressionError::UnknownVariable("order.missing".to_string()))
        );
    }

    #[test]
    fn test_template_wrapper() {
        assert!(eval("${x > 10}", &[("x", VariableValue::Integer(20))]).unwrap());
    }

    #[test]
    fn test_unknown_variable_is_error() {
        assert_eq!(
            eval("missing > 1", &[]),
            Err(ExpressionError::UnknownVariable("missing".to_string()))
        );
    }

    #[test]
    fn test_type_mismatch() {
        let vars = [("s", VariableValue::from("abc"))];
        assert!(matches!(eval("s > 1", &vars), Err(ExpressionError::TypeMismatch { .. })));
        assert!(!eval("s == 1", &vars).unwrap());
    }

    #[test]
    fn test_non_boolean_result() {
        let vars = [("n", VariableValue::Integer(1))];
        assert!(matches!(eval("n", &vars), Err(ExpressionError::NotBoolean(_))));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(Condition::parse("x >"), Err(ExpressionError::Syntax { .. })));
        assert!(matches!(Condition::parse(""), Err(ExpressionError::Syntax { .. })));
        assert!(matches!(Condition::parse("x > 1 )"), Err(ExpressionError::Syntax { .. })));
        assert!(matches!(Condition::parse("${}"), Err(ExpressionError::Syntax { .. })));
    }

    #[test]
    fn test_keywords_do_not_swallow_identifiers() {
        let vars = [("trueish", VariableValue::Boolean(false))];
        assert!(!eval("trueish", &vars).unwrap());
    }

    #[test]
    fn test_variables_listing() {
        let condition = Condition::parse("a > 1 && (b.c == 'x' || !d)").unwrap();
        assert_eq!(condition.expr().variables(), vec!["a", "b", "d"]);
        assert_eq!(condition.to_string(), "a > 1 && (b.c == 'x' || !d)");
    }
}
