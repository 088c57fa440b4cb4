//! # Worker Environment
//!
//! A named set of environment variables exported verbatim into every worker
//! process spawned for a queue, plus a version inventory of the software
//! stack captured at declaration time. The inventory is bookkeeping only and
//! never participates in fingerprints.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Variables exported into worker processes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    /// Label for logs and snapshots ("nersc-cosmodesi", "laptop", ...)
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    vars: BTreeMap<String, String>,
}

impl Environment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vars: BTreeMap::new(),
        }
    }

    /// Set a variable; returns self for chained declaration
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }
}

/// Capture the version inventory recorded next to app source snapshots
///
/// Currently the engine's own crate version; callers extend it with the
/// libraries their apps link.
pub fn version_inventory() -> BTreeMap<String, String> {
    let mut versions = BTreeMap::new();
    versions.insert(
        env!("CARGO_PKG_NAME").to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    );
    versions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let env = Environment::new("hpc")
            .set("OMP_NUM_THREADS", "4")
            .set("SURVEY_ROOT", "/data/survey");
        assert_eq!(env.get("OMP_NUM_THREADS"), Some("4"));
        assert_eq!(env.vars().len(), 2);
    }

    #[test]
    fn test_serde_round_trip() {
        let env = Environment::new("laptop").set("A", "1");
        let json = serde_json::to_string(&env).unwrap();
        let back: Environment = serde_json::from_str(&json).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn test_version_inventory_includes_engine() {
        let versions = version_inventory();
        assert!(versions.contains_key("skypipe-core"));
    }
}
