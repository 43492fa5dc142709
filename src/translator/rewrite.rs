//! Domain rewrite rules applied to a validated query, in a fixed order:
//!
//! 1. enumerated-code filters are widened to the full accepted set
//! 2. equality on possibly-wrapped identifiers becomes a substring match
//! 3. the row cap is injected or clamped
//!
//! Every rule leaves an already-rewritten query unchanged.

use crate::encoding::bare_identifier;
use crate::error::{EngineError, Result};
use crate::schema::SchemaDescriptor;
use itertools::Itertools;
use serde::Serialize;
use sqlparser::ast::{visit_expressions_mut, BinaryOperator, Expr, Statement, Value};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::ops::ControlFlow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteRule {
    EnumeratedCodeSet,
    WrappedIdentifierMatch,
    RowCapInjected,
    RowCapClamped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteOutcome {
    pub fired: Vec<RewriteRule>,
    pub row_limit: u64,
}

pub fn apply_rewrites(
    statement: &mut Statement,
    schema: &SchemaDescriptor,
    row_cap: u64,
) -> Result<RewriteOutcome> {
    let mut fired = Vec::new();

    if widen_enumerated_codes(statement, schema)? {
        fired.push(RewriteRule::EnumeratedCodeSet);
    }
    if match_wrapped_identifiers(statement, schema)? {
        fired.push(RewriteRule::WrappedIdentifierMatch);
    }
    let (row_limit, cap_rule) = enforce_row_cap(statement, row_cap)?;
    if let Some(rule) = cap_rule {
        fired.push(rule);
    }

    Ok(RewriteOutcome { fired, row_limit })
}

/// Column name referenced by a plain or qualified identifier
fn column_name(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.as_str()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.as_str()),
        Expr::Nested(inner) => column_name(inner),
        _ => None,
    }
}

/// Text of a number or string literal
fn literal_text(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Value(Value::Number(n, _)) => Some(n.clone()),
        Expr::Value(Value::SingleQuotedString(s)) => Some(s.clone()),
        Expr::Value(Value::DoubleQuotedString(s)) => Some(s.clone()),
        _ => None,
    }
}

/// `column = literal` in either orientation, returning the column side and the literal
fn equality_operands(expr: &Expr) -> Option<(&Expr, String)> {
    let Expr::BinaryOp { left, op: BinaryOperator::Eq, right, .. } = expr else {
        return None;
    };
    if column_name(left).is_some() {
        literal_text(right).map(|lit| (left.as_ref(), lit))
    } else if column_name(right).is_some() {
        literal_text(left).map(|lit| (right.as_ref(), lit))
    } else {
        None
    }
}

fn parse_expr(text: &str) -> Result<Expr> {
    Parser::new(&PostgreSqlDialect {})
        .try_with_sql(text)
        .and_then(|mut parser| parser.parse_expr())
        .map_err(|e| EngineError::UnsafeQuery(format!("Rewrite produced invalid SQL `{}`: {}", text, e)))
}

fn run_rule<F>(statement: &mut Statement, mut rule: F) -> Result<bool>
where
    F: FnMut(&Expr) -> Option<String>,
{
    let mut changed = false;
    let flow = visit_expressions_mut(statement, |expr| {
        if let Some(replacement) = rule(&*expr) {
            match parse_expr(&replacement) {
                Ok(new_expr) => {
                    *expr = new_expr;
                    changed = true;
                }
                Err(e) => return ControlFlow::Break(e),
            }
        }
        ControlFlow::Continue(())
    });
    if let ControlFlow::Break(e) = flow {
        return Err(e);
    }
    Ok(changed)
}

/// `temp_qc = 1` or `temp_qc IN (1)` becomes `temp_qc IN (1, 2, 3)`. A list
/// that already holds every accepted code is left as written.
fn widen_enumerated_codes(statement: &mut Statement, schema: &SchemaDescriptor) -> Result<bool> {
    run_rule(statement, |expr| {
        let (column, current) = match expr {
            Expr::InList { expr: column, list, negated: false, .. } => {
                (column.as_ref(), list.iter().map(|e| literal_text(e)).collect::<Option<Vec<_>>>()?)
            }
            other => {
                let (column, literal) = equality_operands(other)?;
                (column, vec![literal])
            }
        };
        let accepted = schema.enumerated_values(column_name(column)?)?;
        let current: Vec<String> = current.iter().map(|v| v.trim().to_string()).collect();
        let full: Vec<String> = accepted.iter().map(|v| v.to_string()).collect();
        if full.iter().all(|v| current.contains(v)) && matches!(expr, Expr::InList { .. }) {
            return None;
        }
        // Codes outside the accepted set are kept, never dropped
        let extras = current.iter().filter(|v| !full.contains(v)).map(|v| match v.parse::<i64>() {
            Ok(_) => v.clone(),
            Err(_) => format!("'{}'", v.replace('\'', "''")),
        });
        let widened = full.iter().cloned().chain(extras).join(", ");
        Some(format!("{} IN ({})", column, widened))
    })
}

/// `float_id = '1901766'` becomes `float_id LIKE '%1901766%'`
fn match_wrapped_identifiers(statement: &mut Statement, schema: &SchemaDescriptor) -> Result<bool> {
    run_rule(statement, |expr| {
        let (column, literals) = match expr {
            Expr::InList { expr: column, list, negated: false, .. } => {
                (column.as_ref(), list.iter().map(|e| literal_text(e)).collect::<Option<Vec<_>>>()?)
            }
            other => {
                let (column, literal) = equality_operands(other)?;
                (column, vec![literal])
            }
        };
        if literals.is_empty() || !schema.is_wrapped_identifier(column_name(column)?) {
            return None;
        }
        let clauses: Vec<String> = literals
            .iter()
            .map(|lit| format!("{} LIKE {}", column, contains_pattern(&bare_identifier(lit))))
            .collect();
        if clauses.len() == 1 {
            clauses.into_iter().next()
        } else {
            Some(format!("({})", clauses.iter().join(" OR ")))
        }
    })
}

/// Quoted `'%value%'` literal with LIKE wildcards in `value` escaped
fn contains_pattern(value: &str) -> String {
    let escaped = value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
        .replace('\'', "''");
    format!("'%{}%'", escaped)
}

fn limit_value(expr: &Expr) -> Option<u64> {
    match expr {
        Expr::Value(Value::Number(n, _)) => n.parse().ok(),
        _ => None,
    }
}

/// Inject `LIMIT row_cap` when absent, clamp when larger. Returns the
/// effective limit and the rule that fired, if any.
fn enforce_row_cap(statement: &mut Statement, row_cap: u64) -> Result<(u64, Option<RewriteRule>)> {
    let Statement::Query(query) = statement else {
        return Err(EngineError::UnsafeQuery("Row cap applies to queries only".to_string()));
    };
    // FETCH FIRST n ROWS is folded into LIMIT; a bare FETCH FIRST ROW means one row
    let fetched = match query.fetch.take() {
        None => None,
        Some(fetch) if fetch.percent || fetch.with_ties => {
            return Err(EngineError::UnsafeQuery(
                "FETCH with PERCENT or WITH TIES cannot be bounded by the row cap".to_string(),
            ))
        }
        Some(fetch) => Some(
            fetch
                .quantity
                .unwrap_or_else(|| Expr::Value(Value::Number("1".to_string(), false))),
        ),
    };
    let requested = query.limit.take().or(fetched);

    let (limit, rule) = match requested.as_ref().map(limit_value) {
        None => (row_cap, Some(RewriteRule::RowCapInjected)),
        Some(Some(n)) if n <= row_cap => (n, None),
        // Too large, or not a plain number
        Some(_) => (row_cap, Some(RewriteRule::RowCapClamped)),
    };

    query.limit = match rule {
        None => requested,
        Some(_) => Some(Expr::Value(Value::Number(row_cap.to_string(), false))),
    };
    Ok((limit, rule))
}
