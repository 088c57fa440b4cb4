//! # App Registry
//!
//! User callables are registered by name together with their textual source
//! (for fingerprinting); there is no runtime code rewriting. The registry
//! must exist in the worker process too, which is why worker re-entry goes
//! through [`crate::bootstrap`] at the top of the user's `main`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

/// Failure reported by a native app callable
#[derive(Debug, Error)]
#[error("{0}")]
pub struct AppError(pub String);

impl AppError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Materialized arguments handed to a native app at execution time
///
/// All future placeholders have been substituted with their resolved values
/// by the scheduler before the worker sees this.
#[derive(Debug, Clone, Default)]
pub struct TaskArgs {
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl TaskArgs {
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    /// Positional argument as f64, erroring with the app's vocabulary
    pub fn arg_f64(&self, index: usize) -> Result<f64, AppError> {
        self.arg(index)
            .and_then(Value::as_f64)
            .ok_or_else(|| AppError::new(format!("argument {index} is not a number")))
    }

    pub fn kwarg_f64(&self, name: &str) -> Result<f64, AppError> {
        self.kwarg(name)
            .and_then(Value::as_f64)
            .ok_or_else(|| AppError::new(format!("keyword argument {name:?} is not a number")))
    }

    pub fn kwarg_i64(&self, name: &str) -> Result<i64, AppError> {
        self.kwarg(name)
            .and_then(Value::as_i64)
            .ok_or_else(|| AppError::new(format!("keyword argument {name:?} is not an integer")))
    }
}

/// A registered native callable
pub type AppFn = Arc<dyn Fn(&TaskArgs) -> Result<Value, AppError> + Send + Sync>;

/// Name → callable map shared by enqueuers and worker processes
#[derive(Clone, Default)]
pub struct AppRegistry {
    apps: HashMap<String, AppFn>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callable under its logical app name
    pub fn register<F>(&mut self, name: impl Into<String>, app: F)
    where
        F: Fn(&TaskArgs) -> Result<Value, AppError> + Send + Sync + 'static,
    {
        self.apps.insert(name.into(), Arc::new(app));
    }

    pub fn get(&self, name: &str) -> Option<AppFn> {
        self.apps.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.apps.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.apps.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for AppRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppRegistry")
            .field("apps", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_call() {
        let mut registry = AppRegistry::new();
        registry.register("double", |args: &TaskArgs| {
            Ok(Value::from(args.arg_f64(0)? * 2.0))
        });

        let app = registry.get("double").unwrap();
        let args = TaskArgs {
            args: vec![Value::from(21.0)],
            kwargs: BTreeMap::new(),
        };
        assert_eq!(app(&args).unwrap(), Value::from(42.0));
    }

    #[test]
    fn test_missing_app() {
        let registry = AppRegistry::new();
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn test_arg_helpers_report_errors() {
        let args = TaskArgs {
            args: vec![Value::from("text")],
            kwargs: BTreeMap::new(),
        };
        assert!(args.arg_f64(0).is_err());
        assert!(args.arg_f64(3).is_err());
    }
}
