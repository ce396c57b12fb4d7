//! Dynamic-analysis document model.
//!
//! The analysis LLM produces an open record: a `reasoning` string, a
//! declared *schema* (list of `{key, description, type}`), and an `analysis`
//! object whose required sections are fixed and whose additional sections
//! must match the declared schema. At the wire boundary the open record is
//! represented as a tagged-variant list of sections; the validated schema
//! and the section list are persisted as separate fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Sections that must be present in every analysis, all plain strings.
pub const REQUIRED_SECTIONS: [&str; 3] = ["tldr", "detailed_summary", "transcript_corrections"];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schema
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The value shape a dynamic section may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SectionKind {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "string[]")]
    StringArray,
    #[serde(rename = "object")]
    Object,
}

impl SectionKind {
    /// Does `value` conform to this kind?
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::StringArray => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
            Self::Object => value.is_object(),
        }
    }
}

/// One declared entry of the LLM-generated extraction schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    pub key: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: SectionKind,
}

/// One extracted section, tagged with its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub key: String,
    pub kind: SectionKind,
    pub value: Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Document
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A validated dynamic-analysis result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisDocument {
    pub reasoning: String,
    pub schema: Vec<SchemaField>,
    pub sections: Vec<Section>,
}

impl AnalysisDocument {
    /// Validate a raw LLM output object and convert it into the tagged
    /// section-list representation.
    ///
    /// Validation failures are [`Error::Fatal`]: the model produced a shape
    /// that cannot be repaired by retrying the same parse.
    pub fn from_llm_output(raw: &Value) -> Result<Self> {
        let obj = raw
            .as_object()
            .ok_or_else(|| Error::Fatal("analysis output is not a JSON object".into()))?;

        let reasoning = obj
            .get("reasoning")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Fatal("analysis output missing string `reasoning`".into()))?
            .to_owned();

        let schema: Vec<SchemaField> = obj
            .get("schema")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| Error::Fatal(format!("invalid analysis schema: {e}")))?
            .ok_or_else(|| Error::Fatal("analysis output missing `schema`".into()))?;

        let analysis = obj
            .get("analysis")
            .and_then(Value::as_object)
            .ok_or_else(|| Error::Fatal("analysis output missing object `analysis`".into()))?;

        let mut sections = Vec::with_capacity(analysis.len());

        // Required sections first, always strings.
        for key in REQUIRED_SECTIONS {
            let value = analysis
                .get(key)
                .ok_or_else(|| Error::Fatal(format!("analysis missing required section `{key}`")))?;
            if !value.is_string() {
                return Err(Error::Fatal(format!(
                    "required section `{key}` must be a string"
                )));
            }
            sections.push(Section {
                key: key.to_owned(),
                kind: SectionKind::String,
                value: value.clone(),
            });
        }

        // Additional sections must each match a declared schema entry.
        for (key, value) in analysis {
            if REQUIRED_SECTIONS.contains(&key.as_str()) {
                continue;
            }
            let field = schema
                .iter()
                .find(|f| f.key == *key)
                .ok_or_else(|| Error::Fatal(format!("section `{key}` not declared in schema")))?;
            if !field.kind.matches(value) {
                return Err(Error::Fatal(format!(
                    "section `{key}` does not match declared type"
                )));
            }
            sections.push(Section {
                key: key.clone(),
                kind: field.kind,
                value: value.clone(),
            });
        }

        Ok(Self {
            reasoning,
            schema,
            sections,
        })
    }

    /// The persisted / wire representation.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn section(&self, key: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.key == key)
    }
}
