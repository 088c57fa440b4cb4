//! # File Catalog
//!
//! A YAML catalog mapping structured path templates to filesystem
//! locations, consumed by user tasks. Each entry carries a description, an
//! id, a file type, a path template with `{name}` / `{name:fmt}` fields,
//! and an `options` mapping from field names to value lists or
//! `range(start, stop[, step])` specifiers. Iterating an entry produces the
//! Cartesian product of its options with path formatting applied; `${VAR}`
//! in templates expands from the process environment at read time.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, PipelineResult};

/// Values an option field may take
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValues {
    /// `range(0, 20)` or `range(0, 20, 2)`
    Range(String),
    List(Vec<Value>),
}

impl OptionValues {
    /// Expand to the concrete value list
    pub fn values(&self) -> PipelineResult<Vec<Value>> {
        match self {
            OptionValues::List(values) => Ok(values.clone()),
            OptionValues::Range(spec) => parse_range(spec),
        }
    }
}

/// One catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub description: String,
    pub id: String,
    pub filetype: String,
    /// Template with `{field}` / `{field:04d}` / `{field:.3f}` markers
    pub path: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, OptionValues>,
}

impl CatalogEntry {
    /// Cartesian product of the entry's options with the path template
    /// applied; returns (option assignment, formatted path) pairs
    pub fn expand(&self) -> PipelineResult<Vec<(BTreeMap<String, Value>, String)>> {
        let template = expand_env_vars(&self.path);

        let mut fields: Vec<(&str, Vec<Value>)> = Vec::with_capacity(self.options.len());
        for (name, values) in &self.options {
            fields.push((name, values.values()?));
        }

        let mut assignments: Vec<BTreeMap<String, Value>> = vec![BTreeMap::new()];
        for (name, values) in &fields {
            let mut next = Vec::with_capacity(assignments.len() * values.len());
            for assignment in &assignments {
                for value in values {
                    let mut extended = assignment.clone();
                    extended.insert((*name).to_string(), value.clone());
                    next.push(extended);
                }
            }
            assignments = next;
        }

        assignments
            .into_iter()
            .map(|assignment| {
                let path = format_template(&template, &assignment)?;
                Ok((assignment, path))
            })
            .collect()
    }

    /// Does the description contain every keyword (case-insensitive) and do
    /// the entry's options cover every filter value?
    pub fn matches(&self, keywords: &[&str], filters: &BTreeMap<String, Value>) -> bool {
        let description = self.description.to_lowercase();
        if !keywords
            .iter()
            .all(|kw| description.contains(&kw.to_lowercase()))
        {
            return false;
        }
        filters.iter().all(|(name, wanted)| {
            self.options
                .get(name)
                .and_then(|values| values.values().ok())
                .is_some_and(|values| values.contains(wanted))
        })
    }
}

/// A parsed catalog (one YAML stream, one entry per document, or a single
/// document holding a sequence of entries)
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    pub fn from_str(text: &str) -> PipelineResult<Self> {
        let mut entries = Vec::new();
        for document in serde_yaml::Deserializer::from_str(text) {
            let value = serde_yaml::Value::deserialize(document)
                .map_err(|e| PipelineError::catalog(e.to_string()))?;
            match value {
                serde_yaml::Value::Null => {}
                serde_yaml::Value::Sequence(items) => {
                    for item in items {
                        entries.push(
                            serde_yaml::from_value(item)
                                .map_err(|e| PipelineError::catalog(e.to_string()))?,
                        );
                    }
                }
                other => entries.push(
                    serde_yaml::from_value(other)
                        .map_err(|e| PipelineError::catalog(e.to_string()))?,
                ),
            }
        }
        Ok(Self { entries })
    }

    pub fn from_path(path: &Path) -> PipelineResult<Self> {
        Self::from_str(&std::fs::read_to_string(path)?)
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Select entries by description keywords and option-value filters
    pub fn select(
        &self,
        keywords: &[&str],
        filters: &BTreeMap<String, Value>,
    ) -> Vec<&CatalogEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.matches(keywords, filters))
            .collect()
    }
}

/// Parse `range(start, stop[, step])` into integer values
fn parse_range(spec: &str) -> PipelineResult<Vec<Value>> {
    let inner = spec
        .trim()
        .strip_prefix("range(")
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| PipelineError::catalog(format!("bad range specifier {spec:?}")))?;
    let parts: Vec<i64> = inner
        .split(',')
        .map(|piece| {
            piece.trim().parse::<i64>().map_err(|e| {
                PipelineError::catalog(format!("bad range bound {:?}: {e}", piece.trim()))
            })
        })
        .collect::<PipelineResult<_>>()?;
    let (start, stop, step) = match parts.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => {
            return Err(PipelineError::catalog(format!(
                "range takes 1 to 3 bounds, got {spec:?}"
            )))
        }
    };
    if step == 0 {
        return Err(PipelineError::catalog("range step must be non-zero"));
    }
    let mut values = Vec::new();
    let mut current = start;
    while (step > 0 && current < stop) || (step < 0 && current > stop) {
        values.push(Value::from(current));
        current += step;
    }
    Ok(values)
}

/// Expand `${NAME}` from the process environment; unset vars expand empty
fn expand_env_vars(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                if let Ok(value) = std::env::var(name) {
                    out.push_str(&value);
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Apply `{field}` / `{field:04d}` / `{field:.3f}` markers
fn format_template(template: &str, values: &BTreeMap<String, Value>) -> PipelineResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let Some(end) = rest[start..].find('}') else {
            return Err(PipelineError::catalog(format!(
                "unclosed field in template {template:?}"
            )));
        };
        let field = &rest[start + 1..start + end];
        let (name, format) = match field.split_once(':') {
            Some((name, format)) => (name, Some(format)),
            None => (field, None),
        };
        let value = values.get(name).ok_or_else(|| {
            PipelineError::catalog(format!("template field {name:?} has no option values"))
        })?;
        out.push_str(&format_value(value, format)?);
        rest = &rest[start + end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn format_value(value: &Value, format: Option<&str>) -> PipelineResult<String> {
    let plain = |value: &Value| match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let Some(format) = format else {
        return Ok(plain(value));
    };

    // {field:04d}: zero-padded integer
    if let Some(spec) = format.strip_suffix('d') {
        let number = value.as_i64().ok_or_else(|| {
            PipelineError::catalog(format!("format {format:?} needs an integer, got {value}"))
        })?;
        let width: usize = spec.trim_start_matches('0').parse().unwrap_or(0);
        return Ok(if spec.starts_with('0') {
            format!("{number:0width$}")
        } else {
            format!("{number:width$}")
        });
    }
    // {field:.3f}: fixed-precision float
    if let Some(spec) = format.strip_suffix('f') {
        let number = value.as_f64().ok_or_else(|| {
            PipelineError::catalog(format!("format {format:?} needs a number, got {value}"))
        })?;
        let precision: usize = spec
            .strip_prefix('.')
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| PipelineError::catalog(format!("bad float format {format:?}")))?;
        return Ok(format!("{number:.precision$}"));
    }
    Err(PipelineError::catalog(format!(
        "unsupported format specifier {format:?}"
    )))
}
