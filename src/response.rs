//! Response Synthesizer
//!
//! Builds the answer text from the normalized result. Statistics are only
//! computed for columns that actually hold values in this result; the
//! column set is never assumed.

use crate::normalizer::{NormalizedTable, Scalar};
use crate::schema::{SchemaDescriptor, SemanticType};
use crate::translator::{ProjectedColumn, TranslatedQuery};
use itertools::Itertools;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

const MAX_DISTINCT_TEXT_VALUES: usize = 5;
const MAX_FOLLOW_UPS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynthesizedResponse {
    pub answer_text: String,
    pub follow_ups: Vec<String>,
}

pub struct ResponseSynthesizer {
    schema: Arc<SchemaDescriptor>,
}

impl ResponseSynthesizer {
    pub fn new(schema: Arc<SchemaDescriptor>) -> Self {
        Self { schema }
    }

    pub fn synthesize(
        &self,
        question: &str,
        table: &NormalizedTable,
        query: &TranslatedQuery,
    ) -> SynthesizedResponse {
        let present = table.columns_present();
        let follow_ups = self.follow_ups(question, table, &present);

        if table.is_empty() {
            return SynthesizedResponse {
                answer_text: "No matching data was found for this question. Try widening the region, \
                              time range or float selection."
                    .to_string(),
                follow_ups,
            };
        }

        let mut lines = vec![match table.row_count() {
            1 => "Found 1 matching record.".to_string(),
            n => format!("Found {} matching records.", n),
        }];

        let has_extent = present.contains("latitude") && present.contains("longitude");
        for column in table.columns.iter().filter(|c| present.contains(*c)) {
            if has_extent && (column == "latitude" || column == "longitude") {
                continue;
            }
            if let Some(line) = self.describe_column(table, column) {
                lines.push(line);
            }
        }
        if has_extent {
            if let Some(line) = extent_line(table) {
                lines.push(line);
            }
        }

        for missing in self.missing_columns(question, &present, &query.projection()) {
            lines.push(format!(
                "No {} data is available for the matched records.",
                missing
            ));
        }

        if query.row_cap_applied() && table.row_count() as u64 >= query.row_limit {
            lines.push(format!(
                "Results were capped at {} rows; narrow the question to see everything.",
                query.row_limit
            ));
        }

        SynthesizedResponse {
            answer_text: lines.join("\n"),
            follow_ups,
        }
    }

    /// Numeric columns the question asks about that hold no value in the
    /// result. A column counts when it is returned under its own name, or
    /// when an output column computed from it (`MAX(pressure)`) holds data.
    fn missing_columns(
        &self,
        question: &str,
        present: &BTreeSet<String>,
        projection: &[ProjectedColumn],
    ) -> Vec<String> {
        self.schema
            .columns_mentioned(question)
            .into_iter()
            .filter(|c| c.semantic_type == SemanticType::Numeric)
            .filter(|c| {
                let name = c.name.to_lowercase();
                let derived = projection
                    .iter()
                    .any(|p| p.sources.contains(&name) && holds(present, &p.output));
                !holds(present, &name) && !derived
            })
            .map(|c| c.display_name())
            .collect()
    }

    fn unit_suffix(&self, column: &str) -> String {
        self.schema
            .column(column)
            .and_then(|c| c.unit.as_deref())
            .map(|unit| format!(" {}", unit))
            .unwrap_or_default()
    }

    fn describe_column(&self, table: &NormalizedTable, column: &str) -> Option<String> {
        let label = column.replace('_', " ");
        let values: Vec<&Scalar> = table.values(column).collect();
        let first = values.first()?;

        match first {
            Scalar::Number(_) => {
                let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_number()).collect();
                let unit = self.unit_suffix(column);
                let min = numbers.iter().cloned().fold(f64::INFINITY, f64::min);
                let max = numbers.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                if numbers.len() == 1 || min == max {
                    Some(format!("{}: {}{}", label, format_number(min), unit))
                } else {
                    let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
                    Some(format!(
                        "{}: min {}{unit}, max {}{unit}, mean {}{unit}",
                        label,
                        format_number(min),
                        format_number(max),
                        format_number(mean),
                        unit = unit
                    ))
                }
            }
            Scalar::Text(_) => {
                let distinct: Vec<&str> = values.iter().filter_map(|v| v.as_text()).unique().collect();
                let shown = distinct.iter().take(MAX_DISTINCT_TEXT_VALUES).join(", ");
                if distinct.len() > MAX_DISTINCT_TEXT_VALUES {
                    Some(format!(
                        "{}: {} and {} more",
                        label,
                        shown,
                        distinct.len() - MAX_DISTINCT_TEXT_VALUES
                    ))
                } else {
                    Some(format!("{}: {}", label, shown))
                }
            }
            Scalar::Timestamp(_) => {
                let (earliest, latest) = values
                    .iter()
                    .filter_map(|v| v.as_timestamp())
                    .minmax()
                    .into_option()?;
                let fmt = |t: chrono::DateTime<chrono::Utc>| t.format("%Y-%m-%d %H:%M UTC").to_string();
                if earliest == latest {
                    Some(format!("{}: {}", label, fmt(earliest)))
                } else {
                    Some(format!("{}: {} to {}", label, fmt(earliest), fmt(latest)))
                }
            }
            Scalar::Null => None,
        }
    }

    fn follow_ups(&self, question: &str, table: &NormalizedTable, present: &BTreeSet<String>) -> Vec<String> {
        let lower = question.to_lowercase();
        let mut suggestions = Vec::new();

        if lower.contains("temperature") || present.contains("temperature") {
            suggestions.push("Show temperature-depth profiles for these floats".to_string());
        }
        if lower.contains("salinity") || present.contains("salinity") {
            suggestions.push("Analyze the salinity distribution".to_string());
        }
        if ["arabian", "bengal", "indian"].iter().any(|r| lower.contains(r)) {
            suggestions.push("Compare with other ocean regions".to_string());
        }
        if present.contains("pressure") && !lower.contains("deep") {
            suggestions.push("What is the deepest measurement in these results?".to_string());
        }
        if present.contains("timestamp") {
            suggestions.push("Analyze temporal trends over this period".to_string());
        }
        if present.contains("float_id") && table.values("float_id").filter_map(|v| v.as_text()).unique().count() > 1 {
            suggestions.push("Examine individual float trajectories".to_string());
        }
        if table.is_empty() {
            suggestions.push("Show the most recent measurements".to_string());
        }

        suggestions.into_iter().unique().take(MAX_FOLLOW_UPS).collect()
    }
}

/// `present` has `column`, or a deduplicated `column_2`, `column_3`, …
fn holds(present: &BTreeSet<String>, column: &str) -> bool {
    present.iter().any(|p| {
        let p = p.to_lowercase();
        p == column
            || p.strip_prefix(column)
                .and_then(|rest| rest.strip_prefix('_'))
                .map_or(false, |n| n.parse::<u32>().is_ok())
    })
}

fn extent_line(table: &NormalizedTable) -> Option<String> {
    let range = |column: &str| {
        table
            .values(column)
            .filter_map(|v| v.as_number())
            .fold(None, |acc: Option<(f64, f64)>, x| match acc {
                None => Some((x, x)),
                Some((lo, hi)) => Some((lo.min(x), hi.max(x))),
            })
    };
    let (lat_min, lat_max) = range("latitude")?;
    let (lon_min, lon_max) = range("longitude")?;
    Some(format!(
        "Area covered: latitude {} to {}, longitude {} to {}",
        format_number(lat_min),
        format_number(lat_max),
        format_number(lon_min),
        format_number(lon_max)
    ))
}

/// Two decimals, trailing zeros trimmed: 2032.70 -> 2032.7, 5.00 -> 5
pub fn format_number(value: f64) -> String {
    let formatted = format!("{:.2}", value);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    match trimmed {
        "-0" => "0".to_string(),
        other => other.to_string(),
    }
}
