//! Deterministic safety checks on generated SQL.
//!
//! The generated text is parsed with sqlparser and must be exactly one
//! read-only query over the schema table. Anything else is `UnsafeQuery`.

use crate::error::{EngineError, Result};
use crate::schema::SchemaDescriptor;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::ops::ControlFlow;
use sqlparser::ast::{
    visit_expressions, Expr, GroupByExpr, ObjectName, Query, SelectItem, SetExpr, Statement, Visit,
    Visitor,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

lazy_static! {
    static ref CODE_FENCE: Regex = Regex::new(r"```[A-Za-z]*").unwrap();
    static ref LINE_COMMENT: Regex = Regex::new(r"--[^\n]*").unwrap();
    static ref QUERY_LINE_START: Regex = Regex::new(r"(?im)^\s*(SELECT|WITH)\b").unwrap();
    static ref SELECT_KEYWORD: Regex = Regex::new(r"(?i)\bSELECT\b").unwrap();
}

/// The only functions a generated query may call. Anything else, including
/// `query_to_xml`, `current_setting` and the `pg_*` / `lo_*` families, could
/// read outside the schema table.
const ALLOWED_FUNCTIONS: &[&str] = &[
    // aggregates
    "count", "sum", "avg", "min", "max", "stddev", "stddev_samp", "stddev_pop",
    "variance", "var_samp", "var_pop", "percentile_cont", "percentile_disc", "mode",
    "corr", "covar_pop", "covar_samp", "regr_slope", "regr_intercept", "bool_and",
    "bool_or", "string_agg", "array_agg",
    // window
    "row_number", "rank", "dense_rank", "ntile", "lag", "lead", "first_value",
    "last_value",
    // math
    "abs", "round", "floor", "ceil", "ceiling", "trunc", "sqrt", "cbrt", "power",
    "exp", "ln", "log", "log10", "sign", "mod", "greatest", "least", "radians",
    "degrees", "sin", "cos", "tan", "asin", "acos", "atan", "atan2", "pi",
    "width_bucket",
    // date and time
    "now", "current_date", "current_timestamp", "current_time", "localtimestamp",
    "date_trunc", "date_part", "age", "make_date", "make_timestamp", "to_char",
    "to_date", "to_timestamp", "timezone",
    // text and nulls
    "lower", "upper", "trim", "btrim", "ltrim", "rtrim", "length", "char_length",
    "concat", "replace", "split_part", "left", "right", "coalesce", "nullif",
];

/// Strip markdown fences, SQL line comments and any prose before the query
pub fn clean_raw_output(raw: &str) -> Result<String> {
    let without_fences = CODE_FENCE.replace_all(raw, " ");
    let without_comments = LINE_COMMENT.replace_all(&without_fences, " ");

    // Prefer a line that opens with the query; fall back to the first SELECT
    let start = QUERY_LINE_START
        .captures(&without_comments)
        .and_then(|caps| caps.get(1))
        .or_else(|| SELECT_KEYWORD.find(&without_comments))
        .ok_or_else(|| EngineError::UnsafeQuery("No SELECT statement in generated text".to_string()))?
        .start();

    let sql = without_comments[start..].split_whitespace().collect::<Vec<_>>().join(" ");
    Ok(sql)
}

/// Parse `sql` and require exactly one statement
pub fn parse_single_statement(sql: &str) -> Result<Statement> {
    let mut statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| EngineError::UnsafeQuery(format!("Unparsable query: {}", e)))?;

    match statements.len() {
        1 => Ok(statements.remove(0)),
        0 => Err(EngineError::UnsafeQuery("Empty query".to_string())),
        n => Err(EngineError::UnsafeQuery(format!("Expected one statement, found {}", n))),
    }
}

/// Reject anything that is not a single read-only query over known tables
pub fn check_read_only(statement: &Statement, schema: &SchemaDescriptor) -> Result<()> {
    if !matches!(statement, Statement::Query(_)) {
        return Err(EngineError::UnsafeQuery(format!(
            "Only SELECT queries are allowed, got: {}",
            statement_kind(statement)
        )));
    }

    let mut visitor = SafetyVisitor {
        schema,
        cte_names: HashSet::new(),
        reads_schema_table: false,
    };
    if let ControlFlow::Break(reason) = statement.visit(&mut visitor) {
        return Err(EngineError::UnsafeQuery(reason));
    }
    if !visitor.reads_schema_table {
        return Err(EngineError::UnsafeQuery(format!(
            "Query does not read from {}",
            schema.table
        )));
    }
    Ok(())
}

fn statement_kind(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .next()
        .unwrap_or("statement")
        .to_uppercase()
}

struct SafetyVisitor<'a> {
    schema: &'a SchemaDescriptor,
    cte_names: HashSet<String>,
    reads_schema_table: bool,
}

impl Visitor for SafetyVisitor<'_> {
    type Break = String;

    fn pre_visit_statement(&mut self, statement: &Statement) -> ControlFlow<Self::Break> {
        // Covers data-modifying statements nested inside CTEs
        if !matches!(statement, Statement::Query(_)) {
            return ControlFlow::Break(format!(
                "Nested {} statement is not allowed",
                statement_kind(statement)
            ));
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.cte_names.insert(cte.alias.name.value.to_lowercase());
            }
        }
        if !query.locks.is_empty() {
            return ControlFlow::Break("Row locking clauses are not allowed".to_string());
        }
        if has_select_into(&query.body) {
            return ControlFlow::Break("SELECT INTO is not allowed".to_string());
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        let parts: Vec<String> = relation.0.iter().map(|i| i.value.to_lowercase()).collect();
        let Some(name) = parts.last() else {
            return ControlFlow::Continue(());
        };

        if parts.len() == 1 && self.cte_names.contains(name) {
            return ControlFlow::Continue(());
        }

        let qualifier_ok = match parts.len() {
            1 => true,
            2 => parts[0] == "public",
            _ => false,
        };
        if qualifier_ok && self.schema.is_known_table(name) {
            self.reads_schema_table = true;
            return ControlFlow::Continue(());
        }
        ControlFlow::Break(format!("Unknown table: {}", relation))
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if let Expr::Function(function) = expr {
            let allowed = match function.name.0.as_slice() {
                [ident] => ALLOWED_FUNCTIONS.contains(&ident.value.to_lowercase().as_str()),
                _ => false,
            };
            if !allowed {
                return ControlFlow::Break(format!("Function {} is not allowed", function.name));
            }
        }
        ControlFlow::Continue(())
    }
}

fn has_select_into(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.into.is_some(),
        SetExpr::Query(query) => has_select_into(&query.body),
        SetExpr::SetOperation { left, right, .. } => has_select_into(left) || has_select_into(right),
        _ => false,
    }
}

/// One output column of the outermost SELECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedColumn {
    /// Name the server gives the column: the alias, the column itself, or
    /// the function name for an unaliased call
    pub output: String,
    /// Lowercased column identifiers the expression reads
    pub sources: BTreeSet<String>,
}

/// Output columns of `statement`. Wildcards contribute nothing.
pub fn projected_columns(statement: &Statement) -> Vec<ProjectedColumn> {
    let Statement::Query(query) = statement else {
        return Vec::new();
    };
    let Some(items) = outer_projection(&query.body) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match item {
            SelectItem::UnnamedExpr(expr) => Some(ProjectedColumn {
                output: output_name(expr),
                sources: identifiers(expr),
            }),
            SelectItem::ExprWithAlias { expr, alias } => Some(ProjectedColumn {
                output: alias.value.to_lowercase(),
                sources: identifiers(expr),
            }),
            SelectItem::QualifiedWildcard(..) | SelectItem::Wildcard(_) => None,
        })
        .collect()
}

fn outer_projection(body: &SetExpr) -> Option<&Vec<SelectItem>> {
    match body {
        SetExpr::Select(select) => Some(&select.projection),
        SetExpr::Query(query) => outer_projection(&query.body),
        SetExpr::SetOperation { left, .. } => outer_projection(left),
        _ => None,
    }
}

fn output_name(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(ident) => ident.value.to_lowercase(),
        Expr::CompoundIdentifier(parts) => parts
            .last()
            .map(|i| i.value.to_lowercase())
            .unwrap_or_default(),
        Expr::Function(function) => function
            .name
            .0
            .last()
            .map(|i| i.value.to_lowercase())
            .unwrap_or_default(),
        Expr::Cast { expr, .. } | Expr::Nested(expr) => output_name(expr),
        _ => "?column?".to_string(),
    }
}

fn identifiers(expr: &Expr) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    let _ = visit_expressions(expr, |e| {
        match e {
            Expr::Identifier(ident) => {
                names.insert(ident.value.to_lowercase());
            }
            Expr::CompoundIdentifier(parts) => {
                if let Some(last) = parts.last() {
                    names.insert(last.value.to_lowercase());
                }
            }
            _ => {}
        }
        ControlFlow::<()>::Continue(())
    });
    names
}

/// Structural complexity of a validated query, 1 (simple) to 4 (very complex)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryComplexity {
    pub score: u8,
    pub description: String,
}

pub fn assess_complexity(statement: &Statement) -> QueryComplexity {
    let mut visitor = ComplexityVisitor::default();
    let _ = statement.visit(&mut visitor);

    let mut score = 1u8;
    let mut factors = Vec::new();
    if visitor.joins {
        score += 2;
        factors.push("table joins");
    }
    if visitor.aggregation {
        score += 1;
        factors.push("aggregation");
    }
    if visitor.having {
        score += 1;
        factors.push("filtered aggregation");
    }
    if visitor.case {
        score += 1;
        factors.push("conditional logic");
    }
    if visitor.queries > 1 {
        score += 1;
        factors.push("subqueries");
    }

    let score = score.min(4);
    let label = match score {
        1 => "Simple",
        2 => "Moderate",
        3 => "Complex",
        _ => "Very Complex",
    };
    let description = if factors.is_empty() {
        label.to_string()
    } else {
        format!("{} (includes: {})", label, factors.join(", "))
    };

    QueryComplexity { score, description }
}

#[derive(Default)]
struct ComplexityVisitor {
    joins: bool,
    aggregation: bool,
    having: bool,
    case: bool,
    queries: usize,
}

impl Visitor for ComplexityVisitor {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        self.queries += 1;
        if let SetExpr::Select(select) = query.body.as_ref() {
            if select.from.len() > 1 || select.from.iter().any(|t| !t.joins.is_empty()) {
                self.joins = true;
            }
            match &select.group_by {
                GroupByExpr::All => self.aggregation = true,
                GroupByExpr::Expressions(exprs) => {
                    if !exprs.is_empty() {
                        self.aggregation = true;
                    }
                }
            }
            if select.having.is_some() {
                self.having = true;
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if matches!(expr, Expr::Case { .. }) {
            self.case = true;
        }
        ControlFlow::Continue(())
    }
}
