// ============================================================================
// Filter fragments
// ============================================================================
//
// A fragment such as
//
//     where this.amount > 10 and this.customer like 'ACME%'
//     order by this.amount desc limit 5
//
// is parsed by wrapping it into `SELECT * FROM filter_source <fragment>` and
// handing it to sqlparser. Property paths start at `this` (which may be
// omitted) and resolve into the stored JSON state of each row. Predicates use
// SQL three-valued logic: comparing with null is unknown, and rows whose
// predicate is not true are dropped.
//
// ============================================================================

use super::pattern::eval_like;
use crate::core::{EntityId, PersistError, Result};
use serde_json::Value as JsonValue;
use sqlparser::ast as sql_ast;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    /// Property path below `this`; empty means the whole state.
    Property(Vec<String>),
    Literal(JsonValue),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
    IsNull {
        operand: Operand,
        negated: bool,
    },
    InList {
        operand: Operand,
        list: Vec<Operand>,
        negated: bool,
    },
    Between {
        operand: Operand,
        low: Operand,
        high: Operand,
        negated: bool,
    },
    Like {
        operand: Operand,
        pattern: Operand,
        negated: bool,
        case_insensitive: bool,
    },
    /// A bare boolean property or literal.
    Truth(Operand),
}

#[derive(Debug, Clone, PartialEq)]
struct SortKey {
    path: Vec<String>,
    descending: bool,
}

/// A parsed filter fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    source: String,
    predicate: Option<Predicate>,
    order_by: Vec<SortKey>,
    limit: Option<usize>,
}

impl Filter {
    pub fn parse(fragment: &str) -> Result<Self> {
        let source = fragment.trim().to_string();
        let sql = format!("SELECT * FROM filter_source {}", source);
        let mut statements = Parser::parse_sql(&PostgreSqlDialect {}, &sql)
            .map_err(|e| PersistError::Query(format!("cannot parse '{}': {}", source, e)))?;
        if statements.len() != 1 {
            return Err(PersistError::Query(format!(
                "'{}' must be a single filter",
                source
            )));
        }

        let sql_ast::Statement::Query(query) = statements.remove(0) else {
            return Err(PersistError::Query(format!("'{}' is not a filter", source)));
        };
        let query = *query;
        let sql_ast::SetExpr::Select(select) = *query.body else {
            return Err(PersistError::Query(format!(
                "'{}' must be a where/order by/limit fragment",
                source
            )));
        };
        if select.from.len() != 1 || !select.from[0].joins.is_empty() {
            return Err(PersistError::Query("joins are not supported in filters".into()));
        }

        let predicate = select.selection.map(convert_predicate).transpose()?;
        let order_by = convert_order_by(query.order_by)?;
        let limit = convert_limit(query.limit_clause)?;

        Ok(Self {
            source,
            predicate,
            order_by,
            limit,
        })
    }

    /// The fragment as written, trimmed.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn matches(&self, state: &JsonValue) -> Result<bool> {
        match &self.predicate {
            Some(predicate) => Ok(evaluate(predicate, state)? == Some(true)),
            None => Ok(true),
        }
    }

    /// Filters, orders and limits `rows`, returning the surviving ids.
    /// Rows that compare equal keep their input order.
    pub fn apply(&self, rows: Vec<(EntityId, JsonValue)>) -> Result<Vec<EntityId>> {
        let mut selected = Vec::with_capacity(rows.len());
        for (id, state) in rows {
            if self.matches(&state)? {
                selected.push((id, state));
            }
        }

        if !self.order_by.is_empty() {
            let mut failure = None;
            selected.sort_by(|(_, a), (_, b)| {
                for key in &self.order_by {
                    let ordering = match compare_for_sort(key, a, b) {
                        Ok(ordering) => ordering,
                        Err(err) => {
                            failure.get_or_insert(err);
                            Ordering::Equal
                        }
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
            if let Some(err) = failure {
                return Err(err);
            }
        }

        let limit = self.limit.unwrap_or(usize::MAX);
        Ok(selected.into_iter().take(limit).map(|(id, _)| id).collect())
    }
}

// ----------------------------------------------------------------------------
// Conversion from the sqlparser AST
// ----------------------------------------------------------------------------

fn convert_predicate(expr: sql_ast::Expr) -> Result<Predicate> {
    use sql_ast::BinaryOperator as Op;

    match expr {
        sql_ast::Expr::Nested(inner) => convert_predicate(*inner),
        sql_ast::Expr::BinaryOp { left, op, right } => {
            let op = match op {
                Op::And => {
                    return Ok(Predicate::And(
                        Box::new(convert_predicate(*left)?),
                        Box::new(convert_predicate(*right)?),
                    ));
                }
                Op::Or => {
                    return Ok(Predicate::Or(
                        Box::new(convert_predicate(*left)?),
                        Box::new(convert_predicate(*right)?),
                    ));
                }
                Op::Eq => CompareOp::Eq,
                Op::NotEq => CompareOp::NotEq,
                Op::Lt => CompareOp::Lt,
                Op::LtEq => CompareOp::LtEq,
                Op::Gt => CompareOp::Gt,
                Op::GtEq => CompareOp::GtEq,
                other => {
                    return Err(PersistError::Query(format!(
                        "unsupported operator in filter: {}",
                        other
                    )));
                }
            };
            Ok(Predicate::Compare {
                left: convert_operand(*left)?,
                op,
                right: convert_operand(*right)?,
            })
        }
        sql_ast::Expr::UnaryOp {
            op: sql_ast::UnaryOperator::Not,
            expr,
        } => Ok(Predicate::Not(Box::new(convert_predicate(*expr)?))),
        sql_ast::Expr::IsNull(expr) => Ok(Predicate::IsNull {
            operand: convert_operand(*expr)?,
            negated: false,
        }),
        sql_ast::Expr::IsNotNull(expr) => Ok(Predicate::IsNull {
            operand: convert_operand(*expr)?,
            negated: true,
        }),
        sql_ast::Expr::InList {
            expr,
            list,
            negated,
        } => Ok(Predicate::InList {
            operand: convert_operand(*expr)?,
            list: list
                .into_iter()
                .map(convert_operand)
                .collect::<Result<Vec<_>>>()?,
            negated,
        }),
        sql_ast::Expr::Between {
            expr,
            negated,
            low,
            high,
        } => Ok(Predicate::Between {
            operand: convert_operand(*expr)?,
            low: convert_operand(*low)?,
            high: convert_operand(*high)?,
            negated,
        }),
        sql_ast::Expr::Like {
            negated,
            expr,
            pattern,
            escape_char,
            ..
        } => like(*expr, *pattern, negated, escape_char.is_some(), false),
        sql_ast::Expr::ILike {
            negated,
            expr,
            pattern,
            escape_char,
            ..
        } => like(*expr, *pattern, negated, escape_char.is_some(), true),
        other => Ok(Predicate::Truth(convert_operand(other)?)),
    }
}

fn like(
    expr: sql_ast::Expr,
    pattern: sql_ast::Expr,
    negated: bool,
    has_escape: bool,
    case_insensitive: bool,
) -> Result<Predicate> {
    if has_escape {
        return Err(PersistError::Query("LIKE ... ESCAPE is not supported".into()));
    }
    Ok(Predicate::Like {
        operand: convert_operand(expr)?,
        pattern: convert_operand(pattern)?,
        negated,
        case_insensitive,
    })
}

fn convert_operand(expr: sql_ast::Expr) -> Result<Operand> {
    match expr {
        sql_ast::Expr::Identifier(ident) => Ok(Operand::Property(property_path(vec![ident.value]))),
        sql_ast::Expr::CompoundIdentifier(idents) => Ok(Operand::Property(property_path(
            idents.into_iter().map(|ident| ident.value).collect(),
        ))),
        sql_ast::Expr::Value(value) => Ok(Operand::Literal(convert_value(&value.value)?)),
        sql_ast::Expr::Nested(inner) => convert_operand(*inner),
        sql_ast::Expr::UnaryOp {
            op: sql_ast::UnaryOperator::Minus,
            expr,
        } => match convert_operand(*expr)? {
            Operand::Literal(JsonValue::Number(n)) => Ok(Operand::Literal(negate(&n)?)),
            other => Err(PersistError::Query(format!("cannot negate {:?}", other))),
        },
        other => Err(PersistError::Query(format!(
            "unsupported expression in filter: {}",
            other
        ))),
    }
}

/// Drops the leading `this` alias.
fn property_path(mut parts: Vec<String>) -> Vec<String> {
    if parts.first().is_some_and(|first| first.eq_ignore_ascii_case("this")) {
        parts.remove(0);
    }
    parts
}

fn convert_value(value: &sql_ast::Value) -> Result<JsonValue> {
    match value {
        sql_ast::Value::Number(n, _) => {
            if let Ok(i) = n.parse::<i64>() {
                Ok(JsonValue::from(i))
            } else if let Ok(f) = n.parse::<f64>() {
                Ok(JsonValue::from(f))
            } else {
                Err(PersistError::Query(format!("invalid number: {}", n)))
            }
        }
        sql_ast::Value::SingleQuotedString(s) | sql_ast::Value::DoubleQuotedString(s) => {
            Ok(JsonValue::String(s.clone()))
        }
        sql_ast::Value::Boolean(b) => Ok(JsonValue::Bool(*b)),
        sql_ast::Value::Null => Ok(JsonValue::Null),
        other => Err(PersistError::Query(format!("unsupported literal: {}", other))),
    }
}

fn negate(n: &serde_json::Number) -> Result<JsonValue> {
    if let Some(i) = n.as_i64() {
        return Ok(JsonValue::from(-i));
    }
    n.as_f64()
        .map(|f| JsonValue::from(-f))
        .ok_or_else(|| PersistError::Query(format!("cannot negate {}", n)))
}

fn convert_order_by(order_by: Option<sql_ast::OrderBy>) -> Result<Vec<SortKey>> {
    let Some(order_by) = order_by else {
        return Ok(Vec::new());
    };

    match order_by.kind {
        sql_ast::OrderByKind::Expressions(exprs) => exprs
            .into_iter()
            .map(|order| match convert_operand(order.expr)? {
                Operand::Property(path) => Ok(SortKey {
                    path,
                    descending: order.options.asc.map(|asc| !asc).unwrap_or(false),
                }),
                Operand::Literal(value) => Err(PersistError::Query(format!(
                    "cannot order by literal {}",
                    value
                ))),
            })
            .collect(),
        sql_ast::OrderByKind::All(_) => {
            Err(PersistError::Query("ORDER BY ALL is not supported".into()))
        }
    }
}

fn convert_limit(limit_clause: Option<sql_ast::LimitClause>) -> Result<Option<usize>> {
    let limit = match limit_clause {
        None => return Ok(None),
        Some(sql_ast::LimitClause::LimitOffset { limit: None, .. }) => return Ok(None),
        Some(sql_ast::LimitClause::LimitOffset {
            limit: Some(limit),
            offset: None,
            ..
        }) => limit,
        Some(_) => return Err(PersistError::Query("OFFSET is not supported".into())),
    };

    match limit {
        sql_ast::Expr::Value(value) => match &value.value {
            sql_ast::Value::Number(n, _) => n
                .parse::<usize>()
                .map(Some)
                .map_err(|_| PersistError::Query(format!("invalid LIMIT value: {}", n))),
            other => Err(PersistError::Query(format!(
                "LIMIT must be a number, got {}",
                other
            ))),
        },
        other => Err(PersistError::Query(format!(
            "LIMIT must be a number, got {}",
            other
        ))),
    }
}

// ----------------------------------------------------------------------------
// Evaluation
// ----------------------------------------------------------------------------

static NULL: JsonValue = JsonValue::Null;

fn resolve<'a>(path: &[String], state: &'a JsonValue) -> &'a JsonValue {
    path.iter()
        .try_fold(state, |value, part| value.get(part.as_str()))
        .unwrap_or(&NULL)
}

fn value_of<'a>(operand: &'a Operand, state: &'a JsonValue) -> &'a JsonValue {
    match operand {
        Operand::Property(path) => resolve(path, state),
        Operand::Literal(value) => value,
    }
}

/// `None` when either side is null.
fn compare(left: &JsonValue, right: &JsonValue) -> Result<Option<Ordering>> {
    match (left, right) {
        (JsonValue::Null, _) | (_, JsonValue::Null) => Ok(None),
        (JsonValue::Number(a), JsonValue::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                return Ok(Some(a.cmp(&b)));
            }
            let a = a.as_f64().unwrap_or(f64::NAN);
            let b = b.as_f64().unwrap_or(f64::NAN);
            Ok(Some(a.partial_cmp(&b).unwrap_or(Ordering::Equal)))
        }
        (JsonValue::String(a), JsonValue::String(b)) => Ok(Some(a.cmp(b))),
        (JsonValue::Bool(a), JsonValue::Bool(b)) => Ok(Some(a.cmp(b))),
        _ => Err(PersistError::Query(format!(
            "cannot compare {} with {}",
            type_name(left),
            type_name(right)
        ))),
    }
}

/// Nulls sort last in either direction.
fn compare_for_sort(key: &SortKey, a: &JsonValue, b: &JsonValue) -> Result<Ordering> {
    let left = resolve(&key.path, a);
    let right = resolve(&key.path, b);
    match (left.is_null(), right.is_null()) {
        (true, true) => Ok(Ordering::Equal),
        (true, false) => Ok(Ordering::Greater),
        (false, true) => Ok(Ordering::Less),
        (false, false) => {
            let ordering = compare(left, right)?.unwrap_or(Ordering::Equal);
            Ok(if key.descending {
                ordering.reverse()
            } else {
                ordering
            })
        }
    }
}

fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "text",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn evaluate(predicate: &Predicate, state: &JsonValue) -> Result<Option<bool>> {
    match predicate {
        Predicate::Compare { left, op, right } => {
            let ordering = compare(value_of(left, state), value_of(right, state))?;
            Ok(ordering.map(|ordering| match op {
                CompareOp::Eq => ordering == Ordering::Equal,
                CompareOp::NotEq => ordering != Ordering::Equal,
                CompareOp::Lt => ordering == Ordering::Less,
                CompareOp::LtEq => ordering != Ordering::Greater,
                CompareOp::Gt => ordering == Ordering::Greater,
                CompareOp::GtEq => ordering != Ordering::Less,
            }))
        }
        Predicate::And(left, right) => Ok(match (evaluate(left, state)?, evaluate(right, state)?) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        }),
        Predicate::Or(left, right) => Ok(match (evaluate(left, state)?, evaluate(right, state)?) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        }),
        Predicate::Not(inner) => Ok(evaluate(inner, state)?.map(|value| !value)),
        Predicate::IsNull { operand, negated } => {
            Ok(Some(value_of(operand, state).is_null() != *negated))
        }
        Predicate::InList {
            operand,
            list,
            negated,
        } => {
            let value = value_of(operand, state);
            if value.is_null() {
                return Ok(None);
            }
            let mut unknown = false;
            for candidate in list {
                match compare(value, value_of(candidate, state))? {
                    Some(Ordering::Equal) => return Ok(Some(!*negated)),
                    Some(_) => {}
                    None => unknown = true,
                }
            }
            Ok(if unknown { None } else { Some(*negated) })
        }
        Predicate::Between {
            operand,
            low,
            high,
            negated,
        } => {
            let value = value_of(operand, state);
            let above = compare(value, value_of(low, state))?;
            let below = compare(value, value_of(high, state))?;
            Ok(match (above, below) {
                (Some(above), Some(below)) => {
                    let within = above != Ordering::Less && below != Ordering::Greater;
                    Some(within != *negated)
                }
                _ => None,
            })
        }
        Predicate::Like {
            operand,
            pattern,
            negated,
            case_insensitive,
        } => match (value_of(operand, state), value_of(pattern, state)) {
            (JsonValue::String(text), JsonValue::String(pattern)) => {
                let matched = eval_like(text, pattern, !case_insensitive)?;
                Ok(Some(matched != *negated))
            }
            (JsonValue::Null, _) | (_, JsonValue::Null) => Ok(None),
            (left, right) => Err(PersistError::Query(format!(
                "LIKE needs text operands, got {} and {}",
                type_name(left),
                type_name(right)
            ))),
        },
        Predicate::Truth(operand) => match value_of(operand, state) {
            JsonValue::Bool(value) => Ok(Some(*value)),
            JsonValue::Null => Ok(None),
            other => Err(PersistError::Query(format!(
                "expected a boolean condition, got {}",
                type_name(other)
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows() -> Vec<(EntityId, JsonValue)> {
        vec![
            (EntityId::Int(1), json!({ "amount": 40, "customer": "ACME Corp", "paid": true })),
            (EntityId::Int(2), json!({ "amount": 5, "customer": "Globex", "paid": false })),
            (EntityId::Int(3), json!({ "amount": 12.5, "customer": "ACME Labs", "paid": null })),
            (EntityId::Int(4), json!({ "amount": null, "customer": "Initech", "paid": true })),
        ]
    }

    fn ids(filter: &str) -> Vec<i64> {
        Filter::parse(filter)
            .unwrap()
            .apply(rows())
            .unwrap()
            .into_iter()
            .filter_map(|id| id.as_i64())
            .collect()
    }

    #[test]
    fn test_empty_fragment_selects_everything() {
        assert_eq!(ids(""), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_comparisons_skip_nulls() {
        assert_eq!(ids("where this.amount > 10"), vec![1, 3]);
        assert_eq!(ids("where amount <= 12.5"), vec![2, 3]);
        assert_eq!(ids("where not this.amount > 10"), vec![2]);
    }

    #[test]
    fn test_boolean_connectives() {
        assert_eq!(ids("where this.amount > 10 and this.paid = true"), vec![1]);
        assert_eq!(ids("where this.amount < 10 or this.paid"), vec![1, 2, 4]);
        assert_eq!(ids("where this.paid is null"), vec![3]);
        assert_eq!(ids("where this.amount is not null and not this.paid"), vec![2]);
    }

    #[test]
    fn test_in_between_and_like() {
        assert_eq!(ids("where this.customer in ('Globex', 'Initech')"), vec![2, 4]);
        assert_eq!(ids("where this.amount between 5 and 13"), vec![2, 3]);
        assert_eq!(ids("where this.customer like 'ACME%'"), vec![1, 3]);
        assert_eq!(ids("where this.customer not like 'ACME%'"), vec![2, 4]);
        assert_eq!(ids("where this.customer ilike 'acme%'"), vec![1, 3]);
    }

    #[test]
    fn test_order_by_and_limit() {
        assert_eq!(ids("order by this.amount desc"), vec![1, 3, 2, 4]);
        assert_eq!(ids("order by this.amount"), vec![2, 3, 1, 4]);
        assert_eq!(ids("where this.amount > 0 order by this.customer desc limit 2"), vec![2, 3]);
    }

    #[test]
    fn test_nested_properties() {
        let rows = vec![
            (EntityId::Int(1), json!({ "address": { "city": "Oslo" } })),
            (EntityId::Int(2), json!({ "address": { "city": "Lima" } })),
        ];
        let filter = Filter::parse("where this.address.city = 'Lima'").unwrap();
        assert_eq!(filter.apply(rows).unwrap(), vec![EntityId::Int(2)]);
    }

    #[test]
    fn test_invalid_fragments_are_query_errors() {
        assert!(matches!(
            Filter::parse("where this.amount >"),
            Err(PersistError::Query(_))
        ));
        assert!(matches!(
            Filter::parse("where this.amount > 1 limit 2 offset 1"),
            Err(PersistError::Query(_))
        ));

        let filter = Filter::parse("where this.customer > 3").unwrap();
        assert!(matches!(filter.apply(rows()), Err(PersistError::Query(_))));
    }
}
