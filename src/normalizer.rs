//! Result Normalizer
//!
//! Turns every backend cell into one of four presentation-safe kinds:
//! number, text, timestamp or null. Cells that cannot be converted become
//! null and are reported once per column, never per cell.

use crate::encoding::unwrap_encoded_text;
use crate::execution::result::{RawTable, RawValue};
use chrono::{DateTime, TimeZone, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Scalar {
    Number(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Null,
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Scalar::Timestamp(t) => Some(*t),
            _ => None,
        }
    }
}

/// Column name to value, in result column order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedRow(pub IndexMap<String, Scalar>);

impl NormalizedRow {
    pub fn get(&self, column: &str) -> Option<&Scalar> {
        self.0.get(column)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTable {
    pub columns: Vec<String>,
    pub rows: Vec<NormalizedRow>,
}

impl NormalizedTable {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Columns holding at least one non-null value in this result
    pub fn columns_present(&self) -> BTreeSet<String> {
        self.columns
            .iter()
            .filter(|c| self.rows.iter().any(|r| r.get(c).map_or(false, |v| !v.is_null())))
            .cloned()
            .collect()
    }

    /// Non-null values of `column`, in row order
    pub fn values<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a Scalar> + 'a {
        self.rows
            .iter()
            .filter_map(move |r| r.get(column))
            .filter(|v| !v.is_null())
    }
}

/// Cells of one column that had to be nulled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizationWarning {
    pub column: String,
    pub affected_cells: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    pub table: NormalizedTable,
    pub warnings: Vec<NormalizationWarning>,
}

/// Normalize every cell of `raw`. Never fails.
pub fn normalize(raw: RawTable) -> Normalized {
    let columns = unique_column_names(&raw.columns);
    let mut issues: IndexMap<usize, (usize, String)> = IndexMap::new();

    let rows = raw
        .rows
        .into_iter()
        .map(|cells| {
            let mut row = IndexMap::with_capacity(columns.len());
            let mut cells = cells.into_iter();
            for (index, column) in columns.iter().enumerate() {
                let cell = cells.next().unwrap_or(RawValue::Null);
                let scalar = match convert(cell) {
                    Ok(scalar) => scalar,
                    Err(reason) => {
                        let entry = issues.entry(index).or_insert((0, reason));
                        entry.0 += 1;
                        Scalar::Null
                    }
                };
                row.insert(column.clone(), scalar);
            }
            NormalizedRow(row)
        })
        .collect();

    let warnings: Vec<NormalizationWarning> = issues
        .into_iter()
        .map(|(index, (affected_cells, reason))| {
            let column = columns[index].clone();
            warn!(column = %column, affected_cells, reason = %reason, "Replaced unconvertible cells with null");
            NormalizationWarning {
                column,
                affected_cells,
                reason,
            }
        })
        .collect();

    Normalized {
        table: NormalizedTable { columns, rows },
        warnings,
    }
}

/// `SELECT a.x, b.x` yields two `x` columns; keep both as `x` and `x_2`
fn unique_column_names(columns: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    columns
        .iter()
        .map(|name| {
            let mut candidate = name.clone();
            let mut suffix = 2;
            while !seen.insert(candidate.clone()) {
                candidate = format!("{}_{}", name, suffix);
                suffix += 1;
            }
            candidate
        })
        .collect()
}

fn finite(value: f64) -> Result<Scalar, String> {
    if value.is_finite() {
        Ok(Scalar::Number(value))
    } else {
        Err("non-finite number".to_string())
    }
}

fn text(value: String) -> Scalar {
    match unwrap_encoded_text(&value) {
        Some(inner) => Scalar::Text(inner),
        None => Scalar::Text(value),
    }
}

fn convert(cell: RawValue) -> Result<Scalar, String> {
    match cell {
        RawValue::Null => Ok(Scalar::Null),
        RawValue::Bool(b) => Ok(Scalar::Text(b.to_string())),
        RawValue::Int(i) => Ok(Scalar::Number(i as f64)),
        RawValue::Float(f) => finite(f),
        RawValue::Decimal(d) => match d.trim().parse::<f64>() {
            Ok(f) => finite(f),
            Err(_) => Err(format!("unparsable decimal '{}'", d)),
        },
        RawValue::Text(s) => Ok(text(s)),
        RawValue::Bytes(bytes) => String::from_utf8(bytes)
            .map(text)
            .map_err(|_| "bytes are not valid UTF-8".to_string()),
        RawValue::Timestamp(naive) => Ok(Scalar::Timestamp(Utc.from_utc_datetime(&naive))),
        RawValue::TimestampTz(ts) => Ok(Scalar::Timestamp(ts)),
        RawValue::Date(date) => date
            .and_hms_opt(0, 0, 0)
            .map(|naive| Scalar::Timestamp(Utc.from_utc_datetime(&naive)))
            .ok_or_else(|| "invalid date".to_string()),
        RawValue::Json(value) => match value {
            serde_json::Value::Null => Ok(Scalar::Null),
            serde_json::Value::Bool(b) => Ok(Scalar::Text(b.to_string())),
            serde_json::Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| "JSON number out of range".to_string())
                .and_then(finite),
            serde_json::Value::String(s) => Ok(text(s)),
            _ => Err("nested JSON value".to_string()),
        },
        RawValue::Undecodable { type_name } => Err(format!("unsupported column type {}", type_name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn table(columns: &[&str], rows: Vec<Vec<RawValue>>) -> RawTable {
        RawTable {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    #[test]
    fn test_kinds_are_closed_set() {
        let naive = NaiveDate::from_ymd_opt(2023, 10, 1)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap();
        let raw = table(
            &["float_id", "pressure", "cycle", "ts", "mode", "day"],
            vec![vec![
                RawValue::Text("b'1901766 '".to_string()),
                RawValue::Decimal("2032.700000000000045474735".to_string()),
                RawValue::Int(12),
                RawValue::Timestamp(naive),
                RawValue::Bool(true),
                RawValue::Date(NaiveDate::from_ymd_opt(2023, 10, 2).unwrap()),
            ]],
        );

        let normalized = normalize(raw);
        assert!(normalized.warnings.is_empty());
        let row = &normalized.table.rows[0];
        assert_eq!(row.get("float_id"), Some(&Scalar::Text("1901766".to_string())));
        assert_eq!(row.get("pressure").and_then(Scalar::as_number), Some(2032.7));
        assert_eq!(row.get("cycle"), Some(&Scalar::Number(12.0)));
        assert_eq!(
            row.get("ts").and_then(Scalar::as_timestamp).map(|t| t.to_rfc3339()),
            Some("2023-10-01T12:30:00+00:00".to_string())
        );
        assert_eq!(row.get("mode"), Some(&Scalar::Text("true".to_string())));
        assert!(row.get("day").and_then(Scalar::as_timestamp).is_some());
    }

    #[test]
    fn test_bad_cells_become_null_with_one_warning_per_column() {
        let raw = table(
            &["temperature", "blob"],
            vec![
                vec![RawValue::Float(f64::NAN), RawValue::Bytes(vec![0xff, 0xfe])],
                vec![RawValue::Decimal("NaN".to_string()), RawValue::Bytes(b"b'2902746 '".to_vec())],
                vec![RawValue::Float(14.5), RawValue::Undecodable { type_name: "POINT".to_string() }],
            ],
        );

        let normalized = normalize(raw);
        assert_eq!(normalized.warnings.len(), 2);
        assert_eq!(normalized.warnings[0].column, "temperature");
        assert_eq!(normalized.warnings[0].affected_cells, 2);
        assert_eq!(normalized.warnings[1].column, "blob");
        assert_eq!(normalized.warnings[1].affected_cells, 2);

        let rows = &normalized.table.rows;
        assert_eq!(rows[0].get("temperature"), Some(&Scalar::Null));
        assert_eq!(rows[1].get("blob"), Some(&Scalar::Text("2902746".to_string())));
        assert_eq!(rows[2].get("temperature"), Some(&Scalar::Number(14.5)));
    }

    #[test]
    fn test_columns_present_ignores_all_null_columns() {
        let raw = table(
            &["pressure", "temperature"],
            vec![
                vec![RawValue::Float(10.0), RawValue::Null],
                vec![RawValue::Float(20.0), RawValue::Null],
            ],
        );
        let normalized = normalize(raw);
        let present = normalized.table.columns_present();
        assert!(present.contains("pressure"));
        assert!(!present.contains("temperature"));
    }

    #[test]
    fn test_json_cells() {
        let raw = table(
            &["j"],
            vec![
                vec![RawValue::Json(serde_json::json!(3.5))],
                vec![RawValue::Json(serde_json::json!({"a": 1}))],
            ],
        );
        let normalized = normalize(raw);
        assert_eq!(normalized.table.rows[0].get("j"), Some(&Scalar::Number(3.5)));
        assert_eq!(normalized.table.rows[1].get("j"), Some(&Scalar::Null));
        assert_eq!(normalized.warnings.len(), 1);
    }

    #[test]
    fn test_decimal_text_is_always_a_number() {
        let cases = [
            ("2032.700000000000045474735", 2032.7),
            ("0.0000001", 1e-7),
            ("1e-7", 1e-7),
            ("-0.000001", -1e-6),
            ("-45.25", -45.25),
            ("123456789012345678901234567890.5", 1.2345678901234568e29),
            ("1E+20", 1e20),
            (" 17 ", 17.0),
            ("0", 0.0),
        ];
        let raw = table(
            &["value"],
            cases
                .iter()
                .map(|(text, _)| vec![RawValue::Decimal(text.to_string())])
                .collect(),
        );

        let normalized = normalize(raw);
        assert!(normalized.warnings.is_empty());
        for (row, (text, expected)) in normalized.table.rows.iter().zip(cases.iter()) {
            match row.get("value") {
                Some(Scalar::Number(n)) => {
                    assert!(n.is_finite(), "{}", text);
                    assert!((n - expected).abs() <= expected.abs() * 1e-12, "{} -> {}", text, n);
                }
                other => panic!("{} normalized to {:?}", text, other),
            }
        }
    }

    #[test]
    fn test_decimal_beyond_float_range_is_null() {
        let raw = table(
            &["value"],
            vec![
                vec![RawValue::Decimal(format!("1{}", "0".repeat(400)))],
                vec![RawValue::Decimal("12.5".to_string())],
            ],
        );
        let normalized = normalize(raw);
        assert_eq!(normalized.table.rows[0].get("value"), Some(&Scalar::Null));
        assert_eq!(normalized.table.rows[1].get("value"), Some(&Scalar::Number(12.5)));
        assert_eq!(normalized.warnings.len(), 1);
        assert_eq!(normalized.warnings[0].affected_cells, 1);
    }

    #[test]
    fn test_duplicate_column_names_kept() {
        let raw = table(&["x", "x"], vec![vec![RawValue::Int(1), RawValue::Int(2)]]);
        let normalized = normalize(raw);
        assert_eq!(normalized.table.columns, vec!["x".to_string(), "x_2".to_string()]);
        assert_eq!(normalized.table.rows[0].get("x_2"), Some(&Scalar::Number(2.0)));
    }

    #[test]
    fn test_scalar_serialization_is_tagged() {
        let json = serde_json::to_value(Scalar::Number(1.5)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "number", "value": 1.5}));
        let json = serde_json::to_value(Scalar::Null).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "null"}));
    }
}
