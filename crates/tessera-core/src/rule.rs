//! Boolean expression language used inside `rule` bodies.
//!
//! Supported syntax:
//! - Comparisons: `==`, `!=`, `>`, `<`, `>=`, `<=`
//! - Boolean operators: `&&`, `||`, `!`
//! - Membership: `x in list` and substring `"ab" in text`
//! - Paths: rule parameters by name and `context.data.<key>` request data
//! - Literals: integers, doubles, `'single'` or `"double"` quoted strings,
//!   `true`, `false` and `[a, b]` arrays
//! - Parentheses for grouping

use std::sync::LazyLock;

use pest::Parser;
use pest::error::{ErrorVariant, LineColLocation};
use pest::iterators::{Pair, Pairs};
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest_derive::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCode;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuleError {
    #[error("invalid rule expression: {0}")]
    Parse(String),
    #[error("rule evaluation failed: {0}")]
    Evaluation(String),
}

impl RuleError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Parse(_) => ErrorCode::InvalidRuleExpression,
            Self::Evaluation(_) => ErrorCode::RuleEvaluation,
        }
    }
}

// --- AST ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Literal(Literal),
    Array(Vec<Expr>),
    Path(Vec<String>),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    Neg(Box<Expr>),
    In {
        element: Box<Expr>,
        collection: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl Expr {
    /// Root identifiers referenced by the expression, excluding `context`.
    pub fn free_variables(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_variables(&mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect_variables<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Array(items) => items.iter().for_each(|e| e.collect_variables(out)),
            Expr::Path(segments) => {
                if let Some(root) = segments.first()
                    && root != "context"
                {
                    out.push(root);
                }
            }
            Expr::Binary { left, right, .. } => {
                left.collect_variables(out);
                right.collect_variables(out);
            }
            Expr::Not(inner) | Expr::Neg(inner) => inner.collect_variables(out),
            Expr::In {
                element,
                collection,
            } => {
                element.collect_variables(out);
                collection.collect_variables(out);
            }
        }
    }
}

// --- Parser ---

#[derive(Parser)]
#[grammar = "rule.pest"]
struct RuleParser;

static PRATT: LazyLock<PrattParser<Rule>> = LazyLock::new(|| {
    PrattParser::new()
        .op(Op::infix(Rule::or, Assoc::Left))
        .op(Op::infix(Rule::and, Assoc::Left))
        .op(Op::infix(Rule::eq, Assoc::Left)
            | Op::infix(Rule::ne, Assoc::Left)
            | Op::infix(Rule::gt, Assoc::Left)
            | Op::infix(Rule::lt, Assoc::Left)
            | Op::infix(Rule::ge, Assoc::Left)
            | Op::infix(Rule::le, Assoc::Left)
            | Op::infix(Rule::in_op, Assoc::Left))
        .op(Op::prefix(Rule::not) | Op::prefix(Rule::neg))
});

fn syntax_error(err: pest::error::Error<Rule>) -> RuleError {
    let column = match err.line_col {
        LineColLocation::Pos((_, col)) | LineColLocation::Span((_, col), _) => col,
    };
    let detail = match &err.variant {
        ErrorVariant::ParsingError { positives, .. } if !positives.is_empty() => {
            let expected = positives
                .iter()
                .map(|r| format!("{r:?}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!("expected {expected}")
        }
        variant => variant.message().into_owned(),
    };
    RuleError::Parse(format!("column {column}: {detail}"))
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.extend(chars.next()),
            c => out.push(c),
        }
    }
    out
}

fn build_primary(pair: Pair<'_, Rule>) -> Result<Expr, RuleError> {
    match pair.as_rule() {
        Rule::expr => build_expr(pair.into_inner()),
        Rule::array => pair
            .into_inner()
            .map(|item| build_expr(item.into_inner()))
            .collect::<Result<_, _>>()
            .map(Expr::Array),
        Rule::integer => pair
            .as_str()
            .parse()
            .map(|n| Expr::Literal(Literal::Int(n)))
            .map_err(|_| RuleError::Parse(format!("invalid integer `{}`", pair.as_str()))),
        Rule::double => pair
            .as_str()
            .parse()
            .map(|f| Expr::Literal(Literal::Float(f)))
            .map_err(|_| RuleError::Parse(format!("invalid double `{}`", pair.as_str()))),
        Rule::boolean => Ok(Expr::Literal(Literal::Bool(pair.as_str() == "true"))),
        Rule::string => {
            let raw = pair.into_inner().next().map(|p| p.as_str()).unwrap_or_default();
            Ok(Expr::Literal(Literal::Str(unescape(raw))))
        }
        Rule::path => Ok(Expr::Path(
            pair.into_inner().map(|seg| seg.as_str().to_string()).collect(),
        )),
        other => Err(RuleError::Parse(format!("unexpected {other:?}"))),
    }
}

fn build_expr(pairs: Pairs<'_, Rule>) -> Result<Expr, RuleError> {
    PRATT
        .map_primary(build_primary)
        .map_prefix(|op, operand| {
            let operand = Box::new(operand?);
            match op.as_rule() {
                Rule::not => Ok(Expr::Not(operand)),
                _ => Ok(Expr::Neg(operand)),
            }
        })
        .map_infix(|left, op, right| {
            let (left, right) = (Box::new(left?), Box::new(right?));
            let op = match op.as_rule() {
                Rule::in_op => {
                    return Ok(Expr::In {
                        element: left,
                        collection: right,
                    });
                }
                Rule::or => BinOp::Or,
                Rule::and => BinOp::And,
                Rule::eq => BinOp::Eq,
                Rule::ne => BinOp::Ne,
                Rule::gt => BinOp::Gt,
                Rule::lt => BinOp::Lt,
                Rule::ge => BinOp::Ge,
                _ => BinOp::Le,
            };
            Ok(Expr::Binary { op, left, right })
        })
        .parse(pairs)
}

/// Parses a rule body into an expression tree.
pub fn parse_expression(input: &str) -> Result<Expr, RuleError> {
    let mut pairs = RuleParser::parse(Rule::expression, input).map_err(syntax_error)?;
    let expr = pairs
        .next()
        .and_then(|expression| expression.into_inner().find(|p| p.as_rule() == Rule::expr))
        .ok_or_else(|| RuleError::Parse("empty expression".into()))?;
    build_expr(expr.into_inner())
}

// --- Evaluator ---

/// Evaluates `expr` against `scope`, a JSON object of named variables.
pub fn evaluate(expr: &Expr, scope: &Value) -> Result<bool, RuleError> {
    match eval_value(expr, scope)? {
        Val::Bool(b) => Ok(b),
        other => Err(RuleError::Evaluation(format!(
            "rule must evaluate to boolean, got {other:?}"
        ))),
    }
}

#[derive(Debug, Clone)]
enum Val {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Array(Vec<Val>),
    Null,
}

impl Val {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Val::Int(n) => Some(*n as f64),
            Val::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl PartialEq for Val {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Val::Int(a), Val::Int(b)) => a == b,
            (Val::Float(a), Val::Float(b)) => a == b,
            (Val::Int(a), Val::Float(b)) | (Val::Float(b), Val::Int(a)) => (*a as f64) == *b,
            (Val::Str(a), Val::Str(b)) => a == b,
            (Val::Bool(a), Val::Bool(b)) => a == b,
            (Val::Array(a), Val::Array(b)) => a == b,
            (Val::Null, Val::Null) => true,
            _ => false,
        }
    }
}

fn as_bool(val: Val, op: &str) -> Result<bool, RuleError> {
    match val {
        Val::Bool(b) => Ok(b),
        other => Err(RuleError::Evaluation(format!(
            "`{op}` requires boolean operands, got {other:?}"
        ))),
    }
}

fn eval_value(expr: &Expr, scope: &Value) -> Result<Val, RuleError> {
    match expr {
        Expr::Literal(lit) => Ok(match lit {
            Literal::Int(n) => Val::Int(*n),
            Literal::Float(f) => Val::Float(*f),
            Literal::Str(s) => Val::Str(s.clone()),
            Literal::Bool(b) => Val::Bool(*b),
        }),
        Expr::Array(items) => Ok(Val::Array(
            items
                .iter()
                .map(|e| eval_value(e, scope))
                .collect::<Result<_, _>>()?,
        )),
        Expr::Path(segments) => {
            let mut current = scope;
            for seg in segments {
                current = current.get(seg).unwrap_or(&Value::Null);
            }
            Ok(json_to_val(current))
        }
        Expr::Not(inner) => Ok(Val::Bool(!as_bool(eval_value(inner, scope)?, "!")?)),
        Expr::Neg(inner) => match eval_value(inner, scope)? {
            Val::Int(n) => Ok(Val::Int(-n)),
            Val::Float(f) => Ok(Val::Float(-f)),
            other => Err(RuleError::Evaluation(format!(
                "`-` requires a numeric operand, got {other:?}"
            ))),
        },
        Expr::In {
            element,
            collection,
        } => {
            let elem = eval_value(element, scope)?;
            match (eval_value(collection, scope)?, elem) {
                (Val::Array(items), elem) => Ok(Val::Bool(items.contains(&elem))),
                (Val::Str(haystack), Val::Str(needle)) => {
                    Ok(Val::Bool(haystack.contains(needle.as_str())))
                }
                (Val::Null, _) => Ok(Val::Bool(false)),
                _ => Err(RuleError::Evaluation(
                    "`in` requires an array or string on the right side".into(),
                )),
            }
        }
        Expr::Binary { op, left, right } => {
            match op {
                BinOp::And => {
                    if !as_bool(eval_value(left, scope)?, "&&")? {
                        return Ok(Val::Bool(false));
                    }
                    return Ok(Val::Bool(as_bool(eval_value(right, scope)?, "&&")?));
                }
                BinOp::Or => {
                    if as_bool(eval_value(left, scope)?, "||")? {
                        return Ok(Val::Bool(true));
                    }
                    return Ok(Val::Bool(as_bool(eval_value(right, scope)?, "||")?));
                }
                _ => {}
            }
            let l = eval_value(left, scope)?;
            let r = eval_value(right, scope)?;
            match op {
                BinOp::Eq => Ok(Val::Bool(l == r)),
                BinOp::Ne => Ok(Val::Bool(l != r)),
                _ => {
                    let ordering = match (&l, &r) {
                        (Val::Str(a), Val::Str(b)) => a.partial_cmp(b),
                        _ => match (l.as_f64(), r.as_f64()) {
                            (Some(a), Some(b)) => a.partial_cmp(&b),
                            _ => None,
                        },
                    }
                    .ok_or_else(|| {
                        RuleError::Evaluation(format!(
                            "cannot order {l:?} and {r:?}"
                        ))
                    })?;
                    Ok(Val::Bool(match op {
                        BinOp::Gt => ordering.is_gt(),
                        BinOp::Lt => ordering.is_lt(),
                        BinOp::Ge => ordering.is_ge(),
                        _ => ordering.is_le(),
                    }))
                }
            }
        }
    }
}

fn json_to_val(value: &Value) -> Val {
    match value {
        Value::Null | Value::Object(_) => Val::Null,
        Value::Bool(b) => Val::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Val::Int(i),
            None => n.as_f64().map(Val::Float).unwrap_or(Val::Null),
        },
        Value::String(s) => Val::Str(s.clone()),
        Value::Array(arr) => Val::Array(arr.iter().map(json_to_val).collect()),
    }
}
