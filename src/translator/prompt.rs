//! Prompt construction for the generative phase, including a lightweight
//! keyword analysis of the question.

use crate::rag::RetrievedContext;
use crate::schema::{SchemaDescriptor, SemanticType};
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

lazy_static! {
    // WMO float numbers are 7 digits
    static ref FLOAT_NUMBER: Regex = Regex::new(r"\b\d{7}\b").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Geographic,
    Temporal,
    Depth,
    Parameter,
    Comparison,
    Statistics,
    FloatSpecific,
    General,
}

impl QueryType {
    // Checked in order, first match wins
    const PATTERNS: &'static [(QueryType, &'static [&'static str])] = &[
        (QueryType::Geographic, &["region", "area", "location", "near", "arabian", "bengal", "ocean", "sea"]),
        (QueryType::Temporal, &["recent", "last", "month", "year", "date", "period", "historical", "trend"]),
        (QueryType::Depth, &["deep", "deepest", "depth", "pressure", "surface", "bottom", "vertical"]),
        (QueryType::Parameter, &["temperature", "salinity", "oxygen", "chlorophyll", "ph", "bgc"]),
        (QueryType::Comparison, &["compare", "difference", "versus", "vs", "between"]),
        (QueryType::Statistics, &["average", "mean", "max", "min", "count", "sum", "statistics", "distribution"]),
        (QueryType::FloatSpecific, &["float", "profile", "cycle", "trajectory"]),
    ];

    fn detect(words: &str) -> Self {
        Self::PATTERNS
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| words.contains(&format!(" {} ", k))))
            .map(|(query_type, _)| *query_type)
            .unwrap_or(QueryType::General)
    }
}

/// Named ocean region with its bounding box in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Region {
    pub name: &'static str,
    pub lat: (f64, f64),
    pub lon: (f64, f64),
}

const REGIONS: &[(&str, Region)] = &[
    ("arabian sea", Region { name: "Arabian Sea", lat: (5.0, 30.0), lon: (40.0, 80.0) }),
    ("bay of bengal", Region { name: "Bay of Bengal", lat: (5.0, 25.0), lon: (80.0, 100.0) }),
    ("bengal", Region { name: "Bay of Bengal", lat: (5.0, 25.0), lon: (80.0, 100.0) }),
    ("arabian", Region { name: "Arabian Sea", lat: (5.0, 30.0), lon: (40.0, 80.0) }),
    ("equatorial", Region { name: "Equatorial Indian Ocean", lat: (-10.0, 5.0), lon: (40.0, 100.0) }),
    ("southern ocean", Region { name: "Southern Indian Ocean", lat: (-50.0, -10.0), lon: (20.0, 120.0) }),
    ("southern indian", Region { name: "Southern Indian Ocean", lat: (-50.0, -10.0), lon: (20.0, 120.0) }),
    ("indian ocean", Region { name: "Indian Ocean", lat: (-50.0, 30.0), lon: (20.0, 120.0) }),
];

const TIME_PERIODS: &[(&str, &str)] = &[
    ("last week", "Last 7 days"),
    ("last month", "Last 30 days"),
    ("last year", "Last 365 days"),
    ("recent", "Last 30 days"),
    ("recently", "Last 30 days"),
    ("january", "January"),
    ("february", "February"),
    ("march", "March"),
    ("april", "April"),
    ("may", "May"),
    ("june", "June"),
    ("july", "July"),
    ("august", "August"),
    ("september", "September"),
    ("october", "October"),
    ("oct", "October"),
    ("november", "November"),
    ("nov", "November"),
    ("december", "December"),
];

/// What the question appears to ask for. Only used to steer the prompt;
/// nothing downstream depends on it being right.
#[derive(Debug, Clone, Serialize)]
pub struct QuestionAnalysis {
    pub query_type: QueryType,
    pub region: Option<Region>,
    pub columns: Vec<String>,
    pub time_period: Option<String>,
    /// Bare float numbers mentioned in the question
    pub identifiers: Vec<String>,
}

impl QuestionAnalysis {
    pub fn from_question(question: &str, schema: &SchemaDescriptor) -> Self {
        let words = padded_words(question);

        let region = REGIONS
            .iter()
            .find(|(keyword, _)| words.contains(&format!(" {} ", keyword)))
            .map(|(_, region)| *region);

        let time_period = TIME_PERIODS
            .iter()
            .find(|(keyword, _)| words.contains(&format!(" {} ", keyword)))
            .map(|(_, period)| period.to_string())
            .or_else(|| {
                // Explicit year
                words
                    .split_whitespace()
                    .find(|w| w.len() == 4 && (w.starts_with("19") || w.starts_with("20")) && w.chars().all(|c| c.is_ascii_digit()))
                    .map(|year| format!("Year {}", year))
            });

        Self {
            query_type: QueryType::detect(&words),
            region,
            columns: schema
                .columns_mentioned(question)
                .into_iter()
                .map(|c| c.name.clone())
                .collect(),
            time_period,
            identifiers: FLOAT_NUMBER
                .find_iter(question)
                .map(|m| m.as_str().to_string())
                .unique()
                .collect(),
        }
    }

    fn render(&self) -> String {
        let region = match &self.region {
            Some(r) => format!(
                "{} (latitude {} to {}, longitude {} to {})",
                r.name, r.lat.0, r.lat.1, r.lon.0, r.lon.1
            ),
            None => "Not specified".to_string(),
        };
        let columns = if self.columns.is_empty() {
            "None detected".to_string()
        } else {
            self.columns.join(", ")
        };
        let identifiers = if self.identifiers.is_empty() {
            "None".to_string()
        } else {
            self.identifiers.join(", ")
        };
        format!(
            "Query Type: {:?}\nDetected Region: {}\nDetected Columns: {}\nTime Period: {}\nIdentifiers: {}",
            self.query_type,
            region,
            columns,
            self.time_period.as_deref().unwrap_or("All time"),
            identifiers
        )
    }
}

fn padded_words(text: &str) -> String {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    format!(" {} ", cleaned.split_whitespace().join(" "))
}

pub fn build_prompt(
    question: &str,
    schema: &SchemaDescriptor,
    context: &[RetrievedContext],
    analysis: &QuestionAnalysis,
    row_cap: u64,
) -> String {
    let context_block = if context.is_empty() {
        "No similar records available.".to_string()
    } else {
        context
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{}. {}", i + 1, c.summary))
            .join("\n")
    };

    let rules = schema_rules(schema, analysis)
        .into_iter()
        .map(|rule| format!("- {}\n", rule))
        .join("");

    format!(
        r#"You are an expert PostgreSQL query generator for the {table} table.

DATABASE SCHEMA:
{schema}

USER QUERY: {question}

CONTEXT FROM SIMILAR RECORDS:
{context}

QUERY ANALYSIS:
{analysis}

RULES:
- Return exactly one SELECT statement and nothing else. No explanations, no markdown.
- Read only from table {table}. Never modify data.
{rules}- Always end with LIMIT {row_cap} or smaller

SQL:"#,
        schema = schema.describe(),
        question = question.trim(),
        context = context_block,
        analysis = analysis.render(),
        table = schema.table,
        rules = rules,
        row_cap = row_cap,
    )
}

/// Column-specific rules. Each one is emitted only when the schema has the
/// columns it talks about.
fn schema_rules(schema: &SchemaDescriptor, analysis: &QuestionAnalysis) -> Vec<String> {
    let mut rules = Vec::new();

    let example = analysis
        .identifiers
        .first()
        .map(String::as_str)
        .unwrap_or("<identifier>");
    for column in schema.columns.iter().filter(|c| c.possibly_wrapped_identifier) {
        rules.push(format!(
            "Compare {} with the bare identifier as text, e.g. {} = '{}'",
            column.name, column.name, example
        ));
    }

    let enumerated: Vec<String> = schema
        .columns
        .iter()
        .filter(|c| c.is_enumerated())
        .map(|c| format!("{} IN ({})", c.name, c.accepted_values.iter().join(", ")))
        .collect();
    if !enumerated.is_empty() {
        rules.push(format!(
            "Filter coded columns with their full accepted set, e.g. {}",
            enumerated.join(" AND ")
        ));
    }

    let numeric = |name: &str| {
        schema
            .column(name)
            .map_or(false, |c| c.semantic_type == SemanticType::Numeric)
    };
    if numeric("latitude") && numeric("longitude") {
        rules.push("Spatial filters: latitude BETWEEN a AND b AND longitude BETWEEN c AND d".to_string());
    }
    if numeric("pressure") {
        rules.push("Depth: surface is pressure <= 10, deep ocean is pressure > 1000".to_string());
        rules.push("Depth profiles ORDER BY pressure ASC".to_string());
    }
    if let Some(time) = schema
        .columns
        .iter()
        .find(|c| c.semantic_type == SemanticType::Timestamp)
    {
        rules.push(format!("Time series ORDER BY {} DESC", time.name));
    }

    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analysis_detects_region_and_identifiers() {
        let schema = SchemaDescriptor::argo_profiles();
        let analysis = QuestionAnalysis::from_question(
            "Show temperature for float 2902746 in the Bay of Bengal last month",
            &schema,
        );
        assert_eq!(analysis.region.map(|r| r.name), Some("Bay of Bengal"));
        assert_eq!(analysis.identifiers, vec!["2902746".to_string()]);
        assert_eq!(analysis.time_period.as_deref(), Some("Last 30 days"));
        assert!(analysis.columns.contains(&"temperature".to_string()));
        assert_eq!(analysis.query_type, QueryType::Geographic);
    }

    #[test]
    fn test_analysis_general_question() {
        let schema = SchemaDescriptor::argo_profiles();
        let analysis = QuestionAnalysis::from_question("hello there", &schema);
        assert_eq!(analysis.query_type, QueryType::General);
        assert!(analysis.region.is_none());
        assert!(analysis.identifiers.is_empty());
    }

    #[test]
    fn test_prompt_contains_schema_context_and_cap() {
        let schema = SchemaDescriptor::argo_profiles();
        let context = vec![RetrievedContext {
            summary: "Float 1901766 cycle 3, Arabian Sea, surface temperature 28.1 degC".to_string(),
            distance: 0.4,
        }];
        let question = "deepest measurement for float 1901766";
        let analysis = QuestionAnalysis::from_question(question, &schema);
        let prompt = build_prompt(question, &schema, &context, &analysis, 500);

        assert!(prompt.contains("Table: argo_profiles"));
        assert!(prompt.contains("1. Float 1901766 cycle 3"));
        assert!(prompt.contains("LIMIT 500"));
        assert!(prompt.contains("temp_qc IN (1, 2, 3)"));
        assert!(prompt.contains("Identifiers: 1901766"));
        assert!(prompt.contains("e.g. float_id = '1901766'"));
        assert!(prompt.contains("ORDER BY timestamp DESC"));
        assert!(prompt.contains("latitude BETWEEN"));
    }

    #[test]
    fn test_prompt_rules_follow_the_schema() {
        let schema: SchemaDescriptor = serde_json::from_value(serde_json::json!({
            "table": "measurements",
            "columns": [
                {
                    "name": "identifier",
                    "semantic_type": "text",
                    "possibly_wrapped_identifier": true
                },
                { "name": "reading", "semantic_type": "numeric" },
                { "name": "observed_at", "semantic_type": "timestamp" }
            ]
        }))
        .unwrap();
        let question = "latest reading for sensor 42";
        let analysis = QuestionAnalysis::from_question(question, &schema);
        let prompt = build_prompt(question, &schema, &[], &analysis, 100);

        assert!(prompt.contains("generator for the measurements table"));
        assert!(prompt.contains("e.g. identifier = '<identifier>'"));
        assert!(prompt.contains("Time series ORDER BY observed_at DESC"));
        for absent in ["oceanographic", "float_id", "pressure", "latitude", "coded columns"] {
            assert!(!prompt.contains(absent), "{}", absent);
        }
    }
}
