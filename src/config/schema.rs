/// Explicit schema descriptors for strategy cards and emitted logs.
///
/// Replaces runtime attribute probing with structural validation: every
/// mandatory field is declared up front as (name, type, nullability) and
/// checked for presence and parsability, never for value correctness.
use serde::{Deserialize, Serialize};

use crate::data::logs::LogTable;

/// Expected type of a mandatory field.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Integer,
    Float,
    String,
    /// ISO-8601 timestamp kept as text; ordering is lexicographic.
    Timestamp,
}

impl FieldType {
    /// Structural check: does the raw cell parse as this type?
    pub fn accepts(&self, raw: &str) -> bool {
        match self {
            FieldType::Integer => raw.parse::<i64>().is_ok(),
            FieldType::Float => raw.parse::<f64>().is_ok(),
            FieldType::String => true,
            FieldType::Timestamp => !raw.is_empty(),
        }
    }
}

/// One mandatory field of a tabular output.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub nullable: bool,
}

impl FieldDescriptor {
    pub fn new(name: &str, field_type: FieldType, nullable: bool) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            nullable,
        }
    }
}

/// Schema descriptor for one tabular artifact (trade log or audit log).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
}

impl SchemaDescriptor {
    pub fn new(name: &str, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            name: name.to_string(),
            fields,
        }
    }

    /// Validate a parsed table against this descriptor.
    ///
    /// Returns a list of violations: missing columns first, then type
    /// failures sampled from the first row that carries a value. Extra
    /// columns are permitted (indicator columns vary per strategy).
    pub fn validate_table(&self, table: &LogTable) -> Vec<String> {
        let mut violations = Vec::new();
        for field in &self.fields {
            let Some(col) = table.column_index(&field.name) else {
                violations.push(format!("{}: missing required column {}", self.name, field.name));
                continue;
            };
            for row in 0..table.len() {
                let raw = table.cell(row, col).unwrap_or("");
                if raw.is_empty() {
                    if field.nullable {
                        continue;
                    }
                    violations.push(format!(
                        "{}: column {} is empty at row {} but not nullable",
                        self.name, field.name, row
                    ));
                    break;
                }
                if !field.field_type.accepts(raw) {
                    violations.push(format!(
                        "{}: column {} expected {:?}, got {:?} at row {}",
                        self.name, field.name, field.field_type, raw, row
                    ));
                }
                // First non-empty value is enough for a structural check.
                break;
            }
        }
        violations
    }
}
