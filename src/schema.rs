//! Schema Descriptor
//!
//! The fixed contract shared with the relational store: one table, its
//! columns, their semantic types and value constraints. Loaded once at
//! startup and shared read-only.

use crate::error::{EngineError, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    Numeric,
    Text,
    Timestamp,
    /// Small enumerated set of integer codes (quality flags)
    CategoricalCode,
}

impl SemanticType {
    fn label(&self) -> &'static str {
        match self {
            SemanticType::Numeric => "numeric",
            SemanticType::Text => "text",
            SemanticType::Timestamp => "timestamp",
            SemanticType::CategoricalCode => "categorical code",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub semantic_type: SemanticType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub unit: Option<String>,
    /// Full accepted set for categorical codes
    #[serde(default)]
    pub accepted_values: Vec<i64>,
    /// Stored values may carry a `b'…'` wrapper with trailing padding
    #[serde(default)]
    pub possibly_wrapped_identifier: bool,
    /// Words in a question that refer to this column
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl ColumnDescriptor {
    fn new(name: &str, semantic_type: SemanticType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            semantic_type,
            description: description.to_string(),
            unit: None,
            accepted_values: Vec::new(),
            possibly_wrapped_identifier: false,
            keywords: Vec::new(),
        }
    }

    fn unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    fn keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|k| k.to_string()).collect();
        self
    }

    fn accepted(mut self, values: &[i64]) -> Self {
        self.accepted_values = values.to_vec();
        self
    }

    fn wrapped_identifier(mut self) -> Self {
        self.possibly_wrapped_identifier = true;
        self
    }

    pub fn is_enumerated(&self) -> bool {
        self.semantic_type == SemanticType::CategoricalCode && !self.accepted_values.is_empty()
    }

    /// Human-readable label used in answers ("temperature", "dissolved oxygen")
    pub fn display_name(&self) -> String {
        self.name.replace('_', " ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub table: String,
    #[serde(default)]
    pub description: String,
    pub columns: Vec<ColumnDescriptor>,
}

impl SchemaDescriptor {
    /// Load a schema override from JSON
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read schema {}: {}", path.display(), e))
        })?;
        let schema: SchemaDescriptor = serde_json::from_str(&content)?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn validate(&self) -> Result<()> {
        if self.table.trim().is_empty() {
            return Err(EngineError::Config("Schema table name is empty".to_string()));
        }
        if self.columns.is_empty() {
            return Err(EngineError::Config(format!("Schema for {} has no columns", self.table)));
        }
        for column in &self.columns {
            if column.semantic_type == SemanticType::CategoricalCode
                && column.accepted_values.is_empty()
            {
                return Err(EngineError::Config(format!(
                    "Categorical column {} has no accepted values",
                    column.name
                )));
            }
            if column.possibly_wrapped_identifier && column.semantic_type != SemanticType::Text {
                return Err(EngineError::Config(format!(
                    "Wrapped identifier column {} must be text",
                    column.name
                )));
            }
        }
        let duplicates: Vec<&str> = self
            .columns
            .iter()
            .map(|c| c.name.as_str())
            .duplicates_by(|name| name.to_lowercase())
            .collect();
        if !duplicates.is_empty() {
            return Err(EngineError::Config(format!(
                "Duplicate columns in schema: {}",
                duplicates.join(", ")
            )));
        }
        Ok(())
    }

    /// ARGO float profile table
    pub fn argo_profiles() -> Self {
        use SemanticType::*;

        let columns = vec![
            ColumnDescriptor::new("id", Numeric, "Unique record identifier"),
            ColumnDescriptor::new("float_id", Text, "Float identifier (WMO number)")
                .wrapped_identifier()
                .keywords(&["float", "floats", "platform"]),
            ColumnDescriptor::new("cycle_number", Numeric, "Measurement cycle number")
                .keywords(&["cycle", "cycles"]),
            ColumnDescriptor::new("latitude", Numeric, "Latitude in decimal degrees (-90 to 90)")
                .unit("degrees_north")
                .keywords(&["latitude", "lat"]),
            ColumnDescriptor::new("longitude", Numeric, "Longitude in decimal degrees (-180 to 180)")
                .unit("degrees_east")
                .keywords(&["longitude", "lon"]),
            ColumnDescriptor::new("timestamp", Timestamp, "UTC measurement datetime")
                .keywords(&["date", "time", "when"]),
            ColumnDescriptor::new("pressure", Numeric, "Water pressure in dbar (1 dbar is about 1 m depth)")
                .unit("dbar")
                .keywords(&["pressure", "depth", "deep", "deepest", "shallow", "shallowest", "surface"]),
            ColumnDescriptor::new("temperature", Numeric, "In-situ temperature")
                .unit("degC")
                .keywords(&["temperature", "temp", "thermal", "warm", "warmest", "cold", "coldest"]),
            ColumnDescriptor::new("salinity", Numeric, "Practical salinity")
                .unit("PSU")
                .keywords(&["salinity", "salt", "saline", "psu"]),
            ColumnDescriptor::new("dissolved_oxygen", Numeric, "Dissolved oxygen")
                .unit("umol/kg")
                .keywords(&["oxygen", "o2", "dissolved oxygen"]),
            ColumnDescriptor::new("chlorophyll", Numeric, "Chlorophyll-a")
                .unit("mg/m3")
                .keywords(&["chlorophyll", "chl", "chla", "phytoplankton"]),
            ColumnDescriptor::new("ph", Numeric, "pH on the seawater scale")
                .keywords(&["ph", "acidity"]),
            ColumnDescriptor::new("temp_qc", CategoricalCode, "Temperature QC flag (1=good, 2=probably good, 3=questionable)")
                .accepted(&[1, 2, 3]),
            ColumnDescriptor::new("sal_qc", CategoricalCode, "Salinity QC flag (1=good, 2=probably good, 3=questionable)")
                .accepted(&[1, 2, 3]),
            ColumnDescriptor::new("data_mode", Text, "R=Realtime, D=Delayed, A=Adjusted"),
            ColumnDescriptor::new("platform_type", Text, "ARGO, BGC-ARGO, etc."),
            ColumnDescriptor::new("created_at", Timestamp, "Record creation time"),
        ];

        Self {
            table: "argo_profiles".to_string(),
            description: "ARGO float profile measurements, one row per depth level".to_string(),
            columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn is_known_table(&self, name: &str) -> bool {
        self.table.eq_ignore_ascii_case(name)
    }

    /// Accepted code set when `name` is an enumerated-code column
    pub fn enumerated_values(&self, name: &str) -> Option<&[i64]> {
        self.column(name)
            .filter(|c| c.is_enumerated())
            .map(|c| c.accepted_values.as_slice())
    }

    pub fn is_wrapped_identifier(&self, name: &str) -> bool {
        self.column(name).map(|c| c.possibly_wrapped_identifier).unwrap_or(false)
    }

    /// Columns a question refers to through their name or keywords
    pub fn columns_mentioned(&self, question: &str) -> Vec<&ColumnDescriptor> {
        let padded = normalize_words(question);
        self.columns
            .iter()
            .filter(|c| {
                std::iter::once(c.display_name())
                    .chain(c.keywords.iter().cloned())
                    .any(|term| padded.contains(&normalize_words(&term)))
            })
            .collect()
    }

    /// Schema block embedded in the translation prompt
    pub fn describe(&self) -> String {
        let mut lines = vec![format!("Table: {}", self.table)];
        if !self.description.is_empty() {
            lines.push(format!("Description: {}", self.description));
        }
        lines.push("Columns:".to_string());
        for column in &self.columns {
            let mut line = format!("- {} ({})", column.name, column.semantic_type.label());
            if !column.description.is_empty() {
                line.push_str(&format!(" - {}", column.description));
            }
            if let Some(unit) = &column.unit {
                line.push_str(&format!(" [{}]", unit));
            }
            if column.is_enumerated() {
                line.push_str(&format!(
                    "; accepted values: {}",
                    column.accepted_values.iter().join(", ")
                ));
            }
            if column.possibly_wrapped_identifier {
                line.push_str("; compare using the bare identifier as text");
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

/// Lowercase, punctuation to spaces, padded so word lookups can use ` word `
fn normalize_words(text: &str) -> String {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    format!(" {} ", cleaned.split_whitespace().join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argo_schema_is_valid() {
        let schema = SchemaDescriptor::argo_profiles();
        schema.validate().unwrap();
        assert!(schema.is_known_table("ARGO_PROFILES"));
        assert!(schema.is_wrapped_identifier("float_id"));
        assert!(!schema.is_wrapped_identifier("data_mode"));
        assert_eq!(schema.enumerated_values("temp_qc"), Some(&[1, 2, 3][..]));
        assert_eq!(schema.enumerated_values("pressure"), None);
    }

    #[test]
    fn test_columns_mentioned_uses_keywords() {
        let schema = SchemaDescriptor::argo_profiles();
        let names: Vec<String> = schema
            .columns_mentioned("What is the deepest measurement for float 6904092?")
            .iter()
            .map(|c| c.name.clone())
            .collect();
        assert!(names.contains(&"pressure".to_string()));
        assert!(names.contains(&"float_id".to_string()));
        assert!(!names.contains(&"temperature".to_string()));
    }

    #[test]
    fn test_columns_mentioned_multiword_keyword() {
        let schema = SchemaDescriptor::argo_profiles();
        let names: Vec<String> = schema
            .columns_mentioned("Show dissolved oxygen near the surface")
            .iter()
            .map(|c| c.name.clone())
            .collect();
        assert!(names.contains(&"dissolved_oxygen".to_string()));
        assert!(names.contains(&"pressure".to_string()));
    }

    #[test]
    fn test_categorical_without_values_rejected() {
        let mut schema = SchemaDescriptor::argo_profiles();
        schema.columns[12].accepted_values.clear();
        assert!(matches!(schema.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_describe_lists_accepted_values() {
        let description = SchemaDescriptor::argo_profiles().describe();
        assert!(description.contains("Table: argo_profiles"));
        assert!(description.contains("- temp_qc (categorical code)"));
        assert!(description.contains("accepted values: 1, 2, 3"));
    }
}
