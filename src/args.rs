//! # Argument Trees and Dependency Resolution
//!
//! Task arguments are captured as a tagged tree of [`ArgNode`]s so that
//! embedded futures can be lifted into dependency edges at enqueue time and
//! substituted with their resolved values immediately before dispatch. The
//! serialized tree is the record's `args_blob`/`kwargs_blob`; future nodes
//! act as placeholder markers until the scheduler materializes them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, PipelineResult};
use crate::fingerprint::Fingerprint;

/// Placeholder for a not-yet-resolved task result embedded in arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FutureRef {
    /// Queue-local id of the referent record
    pub task_id: i64,
    /// Fingerprint the referent was enqueued under
    pub fingerprint: Fingerprint,
}

/// One node of a captured argument tree
///
/// The variants mirror JSON scalars plus the `Future` placeholder. Maps use
/// `BTreeMap` so every serialization of the same tree is byte-identical,
/// which the fingerprint relies on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ArgNode {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ArgNode>),
    Map(BTreeMap<String, ArgNode>),
    Future(FutureRef),
}

impl ArgNode {
    /// Build a node from a plain JSON value (no futures)
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => ArgNode::Null,
            Value::Bool(b) => ArgNode::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ArgNode::Int(i)
                } else {
                    ArgNode::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => ArgNode::Str(s.clone()),
            Value::Array(items) => ArgNode::List(items.iter().map(ArgNode::from_value).collect()),
            Value::Object(map) => ArgNode::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), ArgNode::from_value(v)))
                    .collect(),
            ),
        }
    }

    /// Canonical JSON rendering for fingerprint hashing
    ///
    /// Future nodes render as their referent's fingerprint only: the task id
    /// is queue-local bookkeeping and must not perturb the digest.
    pub fn canonical_value(&self) -> Value {
        match self {
            ArgNode::Null => Value::Null,
            ArgNode::Bool(b) => Value::Bool(*b),
            ArgNode::Int(i) => Value::from(*i),
            ArgNode::Float(f) => Value::from(*f),
            ArgNode::Str(s) => Value::String(s.clone()),
            ArgNode::List(items) => {
                Value::Array(items.iter().map(ArgNode::canonical_value).collect())
            }
            ArgNode::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.canonical_value()))
                    .collect(),
            ),
            ArgNode::Future(fref) => {
                serde_json::json!({ "$future": fref.fingerprint.as_str() })
            }
        }
    }

    /// Substitute future placeholders with resolved dependency results
    ///
    /// `results` maps dep task id to its cached payload. A future whose
    /// referent is missing from the map is an internal scheduling error.
    pub fn materialize(&self, results: &BTreeMap<i64, Value>) -> PipelineResult<Value> {
        match self {
            ArgNode::Null => Ok(Value::Null),
            ArgNode::Bool(b) => Ok(Value::Bool(*b)),
            ArgNode::Int(i) => Ok(Value::from(*i)),
            ArgNode::Float(f) => Ok(Value::from(*f)),
            ArgNode::Str(s) => Ok(Value::String(s.clone())),
            ArgNode::List(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|n| n.materialize(results))
                    .collect::<PipelineResult<Vec<_>>>()?,
            )),
            ArgNode::Map(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), v.materialize(results)?);
                }
                Ok(Value::Object(out))
            }
            ArgNode::Future(fref) => results.get(&fref.task_id).cloned().ok_or_else(|| {
                PipelineError::enqueue(format!(
                    "no resolved result for dependency task {}",
                    fref.task_id
                ))
            }),
        }
    }

    fn visit_futures<'a>(&'a self, out: &mut Vec<&'a FutureRef>) {
        match self {
            ArgNode::List(items) => {
                for item in items {
                    item.visit_futures(out);
                }
            }
            ArgNode::Map(map) => {
                for node in map.values() {
                    node.visit_futures(out);
                }
            }
            ArgNode::Future(fref) => out.push(fref),
            _ => {}
        }
    }
}

/// Walk args and kwargs, returning the embedded future references in
/// first-seen order with duplicates removed
///
/// The returned order defines `dep_ids` and therefore the order in which
/// dependency fingerprints enter the task's own fingerprint.
pub fn collect_deps<'a>(
    args: &'a [ArgNode],
    kwargs: &'a BTreeMap<String, ArgNode>,
) -> Vec<&'a FutureRef> {
    let mut found = Vec::new();
    for node in args {
        node.visit_futures(&mut found);
    }
    for node in kwargs.values() {
        node.visit_futures(&mut found);
    }

    let mut seen = std::collections::HashSet::new();
    found.retain(|fref| seen.insert(fref.task_id));
    found
}

impl From<i64> for ArgNode {
    fn from(v: i64) -> Self {
        ArgNode::Int(v)
    }
}

impl From<f64> for ArgNode {
    fn from(v: f64) -> Self {
        ArgNode::Float(v)
    }
}

impl From<bool> for ArgNode {
    fn from(v: bool) -> Self {
        ArgNode::Bool(v)
    }
}

impl From<&str> for ArgNode {
    fn from(v: &str) -> Self {
        ArgNode::Str(v.to_string())
    }
}

impl From<String> for ArgNode {
    fn from(v: String) -> Self {
        ArgNode::Str(v)
    }
}

impl<T: Into<ArgNode>> From<Vec<T>> for ArgNode {
    fn from(items: Vec<T>) -> Self {
        ArgNode::List(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn future(id: i64) -> ArgNode {
        ArgNode::Future(FutureRef {
            task_id: id,
            fingerprint: Fingerprint::from_hex(format!("{id:064x}")),
        })
    }

    // ---- Dependency walk ----

    #[test]
    fn test_collect_deps_ordered_and_deduped() {
        let args = vec![
            future(3),
            ArgNode::List(vec![future(1), future(3)]),
            ArgNode::Int(7),
        ];
        let mut kwargs = BTreeMap::new();
        kwargs.insert("extra".to_string(), future(2));

        let deps = collect_deps(&args, &kwargs);
        let ids: Vec<i64> = deps.iter().map(|d| d.task_id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn test_collect_deps_empty_for_scalars() {
        let args = vec![ArgNode::Int(1), ArgNode::Str("x".to_string())];
        assert!(collect_deps(&args, &BTreeMap::new()).is_empty());
    }

    // ---- Materialization ----

    #[test]
    fn test_materialize_substitutes_nested_future() {
        let node = ArgNode::List(vec![ArgNode::Int(1), future(5)]);
        let mut results = BTreeMap::new();
        results.insert(5, serde_json::json!(0.25));

        let value = node.materialize(&results).unwrap();
        assert_eq!(value, serde_json::json!([1, 0.25]));
    }

    #[test]
    fn test_materialize_missing_dep_errors() {
        let node = future(9);
        let err = node.materialize(&BTreeMap::new()).unwrap_err();
        assert!(matches!(err, PipelineError::Enqueue(_)));
    }

    // ---- Canonical rendering ----

    #[test]
    fn test_canonical_value_uses_fingerprint_not_id() {
        let fref = FutureRef {
            task_id: 42,
            fingerprint: Fingerprint::from_hex("ab".repeat(32)),
        };
        let canonical = ArgNode::Future(fref).canonical_value();
        let text = canonical.to_string();
        assert!(text.contains(&"ab".repeat(32)));
        assert!(!text.contains("42"));
    }

    #[test]
    fn test_blob_round_trip() {
        let args = vec![
            ArgNode::Map(
                [("seed".to_string(), ArgNode::Int(12))]
                    .into_iter()
                    .collect(),
            ),
            future(1),
        ];
        let blob = serde_json::to_string(&args).unwrap();
        let back: Vec<ArgNode> = serde_json::from_str(&blob).unwrap();
        assert_eq!(args, back);
    }
}
