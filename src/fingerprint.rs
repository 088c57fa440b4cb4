//! # Content Fingerprints
//!
//! A fingerprint makes re-execution a pure function of inputs: it is a
//! SHA-256 digest over the task's identity (source text or declared name),
//! the canonical serialization of its arguments with embedded futures
//! replaced by their referents' fingerprints, and the ordered list of
//! dependency fingerprints. Identical fingerprints short-circuit to the
//! result cache; any change to a participating input yields a new digest.
//!
//! Source text participates verbatim: insignificant whitespace and comments
//! are *not* stripped, so editing a comment invalidates the cache. This
//! matches the user expectation that "editing the function" re-runs it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::args::ArgNode;
use crate::error::PipelineResult;

/// Domain-separation prefix, bumped if the hash layout ever changes.
const FINGERPRINT_DOMAIN: &[u8] = b"skypipe.fingerprint.v1\0";

/// How a task identifies itself in its fingerprint
///
/// `Code` hashes the full source blob; `Named` hashes only the given name,
/// making the task identical to any other bearing the same name and
/// arguments. Naming is how a caller *rebinds* to a previously computed
/// result without matching source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppIdentity<'a> {
    /// Fingerprint over the verbatim source text of the callable
    Code(&'a str),
    /// Fingerprint over the app name (or user alias) only
    Named(&'a str),
}

/// Hex-encoded SHA-256 content fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an already-computed hex digest (e.g. read back from the store)
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compute the fingerprint of a task
    ///
    /// Layout: domain prefix, identity segment (`code:` or `name:`),
    /// canonical JSON of positional then named arguments (futures rendered
    /// as their referent fingerprints, map keys sorted), then each
    /// dependency fingerprint in `dep_ids` order.
    pub fn compute(
        identity: AppIdentity<'_>,
        args: &[ArgNode],
        kwargs: &BTreeMap<String, ArgNode>,
        dep_fingerprints: &[Fingerprint],
    ) -> PipelineResult<Self> {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_DOMAIN);

        match identity {
            AppIdentity::Code(source) => {
                hasher.update(b"code:");
                hasher.update(source.as_bytes());
            }
            AppIdentity::Named(name) => {
                hasher.update(b"name:");
                hasher.update(name.as_bytes());
            }
        }
        hasher.update([0u8]);

        let canonical_args: Vec<serde_json::Value> =
            args.iter().map(ArgNode::canonical_value).collect();
        hasher.update(serde_json::to_vec(&canonical_args)?);
        hasher.update([0u8]);

        // BTreeMap keeps kwargs key order deterministic
        let canonical_kwargs: BTreeMap<&str, serde_json::Value> = kwargs
            .iter()
            .map(|(k, v)| (k.as_str(), v.canonical_value()))
            .collect();
        hasher.update(serde_json::to_vec(&canonical_kwargs)?);
        hasher.update([0u8]);

        for dep in dep_fingerprints {
            hasher.update(dep.as_str().as_bytes());
            hasher.update([0u8]);
        }

        use fmt::Write;
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(64);
        for byte in digest {
            write!(hex, "{byte:02x}").ok();
        }
        Ok(Self(hex))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::FutureRef;

    fn no_kwargs() -> BTreeMap<String, ArgNode> {
        BTreeMap::new()
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let args = vec![ArgNode::Int(3), ArgNode::Str("seed".to_string())];
        let a = Fingerprint::compute(AppIdentity::Code("fn f() {}"), &args, &no_kwargs(), &[])
            .unwrap();
        let b = Fingerprint::compute(AppIdentity::Code("fn f() {}"), &args, &no_kwargs(), &[])
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_code_edit_invalidates() {
        // A comment-only edit still changes the digest
        let args = vec![ArgNode::Int(3)];
        let a = Fingerprint::compute(AppIdentity::Code("fn f() {}"), &args, &no_kwargs(), &[])
            .unwrap();
        let b = Fingerprint::compute(
            AppIdentity::Code("fn f() {} // tweak"),
            &args,
            &no_kwargs(),
            &[],
        )
        .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_named_identity_ignores_code() {
        let args = vec![ArgNode::Int(1)];
        let a = Fingerprint::compute(AppIdentity::Named("average"), &args, &no_kwargs(), &[])
            .unwrap();
        let b = Fingerprint::compute(AppIdentity::Named("average"), &args, &no_kwargs(), &[])
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_args_participate() {
        let a = Fingerprint::compute(
            AppIdentity::Named("f"),
            &[ArgNode::Int(1)],
            &no_kwargs(),
            &[],
        )
        .unwrap();
        let b = Fingerprint::compute(
            AppIdentity::Named("f"),
            &[ArgNode::Int(2)],
            &no_kwargs(),
            &[],
        )
        .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_future_hashes_by_referent_fingerprint() {
        // Two futures with different task ids but the same fingerprint are
        // the same input as far as the digest is concerned.
        let fp = Fingerprint::from_hex("aa".repeat(32));
        let args_a = vec![ArgNode::Future(FutureRef {
            task_id: 1,
            fingerprint: fp.clone(),
        })];
        let args_b = vec![ArgNode::Future(FutureRef {
            task_id: 9,
            fingerprint: fp.clone(),
        })];
        let deps = vec![fp];
        let a =
            Fingerprint::compute(AppIdentity::Named("f"), &args_a, &no_kwargs(), &deps).unwrap();
        let b =
            Fingerprint::compute(AppIdentity::Named("f"), &args_b, &no_kwargs(), &deps).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_dep_fingerprints_participate() {
        let deps_a = vec![Fingerprint::from_hex("aa".repeat(32))];
        let deps_b = vec![Fingerprint::from_hex("bb".repeat(32))];
        let a = Fingerprint::compute(AppIdentity::Named("f"), &[], &no_kwargs(), &deps_a).unwrap();
        let b = Fingerprint::compute(AppIdentity::Named("f"), &[], &no_kwargs(), &deps_b).unwrap();
        assert_ne!(a, b);
    }
}
