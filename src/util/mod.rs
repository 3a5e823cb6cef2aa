//! Shared helpers: naming, hashing, passwords, quantity comparison and
//! structural diffs.

pub mod retry;
pub mod ringlog;

use std::collections::BTreeMap;
use std::fmt;

use kube::ResourceExt;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Identity of a cluster or pod: `(namespace, name)`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Identity of any namespaced Kubernetes object. Objects without a
    /// namespace resolve to `default`, matching what the API server stores.
    pub fn from_object<K: ResourceExt>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_else(|| "default".to_string()),
            name: obj.name_any(),
        }
    }

    /// Parse `namespace/name`, `/name` or a bare `name` (namespace defaults
    /// to `default`). Empty name or namespace-only forms are rejected.
    pub fn decode(s: &str) -> Result<Self, String> {
        let (namespace, name) = match s.split_once('/') {
            Some((ns, n)) => (ns, n),
            None => ("", s),
        };
        if name.is_empty() || name.contains('/') {
            return Err(format!("incorrect namespaced name: {s:?}"));
        }
        Ok(Self {
            namespace: if namespace.is_empty() {
                "default".to_string()
            } else {
                namespace.to_string()
            },
            name: name.to_string(),
        })
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// FNV-1a over the cluster identity. Worker assignment must be a pure
/// function of `(namespace, name)`, stable across restarts, so the stdlib
/// hasher (randomly seeded) is not an option.
fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes.iter().fold(OFFSET, |acc, &b| {
        (acc ^ u64::from(b)).wrapping_mul(PRIME)
    })
}

/// Stable worker assignment: `fnv1a64("namespace/name") mod workers`.
pub fn cluster_worker_id(cluster: &NamespacedName, workers: u32) -> u32 {
    let key = format!("{}/{}", cluster.namespace, cluster.name);
    (fnv1a64(key.as_bytes()) % u64::from(workers.max(1))) as u32
}

/// Generate a random alphanumeric password of the given length.
pub fn random_password(length: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..length)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

/// Derive the password hash stored in `pg_authid` and shipped in
/// `CREATE ROLE` / `ALTER ROLE`: `"md5" || md5(password || username)`.
/// Passwords that are already digests pass through unchanged so repeated
/// syncs stay idempotent.
pub fn pg_user_password(username: &str, password: &str) -> String {
    if password.starts_with("md5") && password.len() == 35 {
        return password.to_string();
    }
    format!("md5{:x}", md5::compute(format!("{password}{username}")))
}

/// True when every key/value pair of `needle` is present in `haystack`.
pub fn map_contains(haystack: &BTreeMap<String, String>, needle: &BTreeMap<String, String>) -> bool {
    needle
        .iter()
        .all(|(k, v)| haystack.get(k).is_some_and(|hv| hv == v))
}

/// Parse a Kubernetes resource quantity into a canonical number of base
/// units (bytes for memory, cores for CPU). Handles decimal (`k`, `M`, `G`,
/// `T`), binary (`Ki`, `Mi`, `Gi`, `Ti`), `m` (milli) suffixes and plain
/// scientific notation, so `1G` compares equal to `1e9` and different from
/// `1Gi`.
pub fn parse_quantity(s: &str) -> Result<f64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty quantity".to_string());
    }
    let suffixes: [(&str, f64); 11] = [
        ("Ki", 1024.0),
        ("Mi", 1024f64.powi(2)),
        ("Gi", 1024f64.powi(3)),
        ("Ti", 1024f64.powi(4)),
        ("Pi", 1024f64.powi(5)),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("m", 1e-3),
    ];
    for (suffix, mult) in suffixes {
        if let Some(num) = s.strip_suffix(suffix) {
            let v: f64 = num
                .parse()
                .map_err(|e| format!("could not parse quantity {s:?}: {e}"))?;
            return Ok(v * mult);
        }
    }
    s.parse()
        .map_err(|e| format!("could not parse quantity {s:?}: {e}"))
}

/// Compare two quantities for semantic equality after canonicalization.
pub fn quantities_equal(a: &str, b: &str) -> bool {
    match (parse_quantity(a), parse_quantity(b)) {
        (Ok(a), Ok(b)) => (a - b).abs() < f64::EPSILON * a.abs().max(b.abs()).max(1.0),
        _ => a == b,
    }
}

/// True when the requested quantity does not exceed the limit.
pub fn request_is_smaller_than_limit(request: &str, limit: &str) -> Result<bool, String> {
    Ok(parse_quantity(request)? <= parse_quantity(limit)?)
}

/// Compact structural diff of two serializable values, for DEBUG logging.
/// Lists dot-separated paths whose values differ; an empty string means the
/// values are structurally equal.
pub fn pretty_diff<T: Serialize>(old: &T, new: &T) -> String {
    let old = serde_json::to_value(old).unwrap_or(serde_json::Value::Null);
    let new = serde_json::to_value(new).unwrap_or(serde_json::Value::Null);
    let mut paths = Vec::new();
    diff_value("", &old, &new, &mut paths);
    paths.join("\n")
}

fn diff_value(path: &str, old: &serde_json::Value, new: &serde_json::Value, out: &mut Vec<String>) {
    use serde_json::Value;
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            for key in a.keys().chain(b.keys().filter(|k| !a.contains_key(*k))) {
                let sub = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                diff_value(
                    &sub,
                    a.get(key).unwrap_or(&Value::Null),
                    b.get(key).unwrap_or(&Value::Null),
                    out,
                );
            }
        }
        (Value::Array(a), Value::Array(b)) if a.len() != b.len() => {
            out.push(format!("{path}: [{}] != [{}]", a.len(), b.len()));
        }
        (Value::Array(a), Value::Array(b)) => {
            for (i, (av, bv)) in a.iter().zip(b).enumerate() {
                diff_value(&format!("{path}[{i}]"), av, bv, out);
            }
        }
        (a, b) if a != b => out.push(format!("{path}: {a} != {b}")),
        _ => {}
    }
}
