//! npm `package-lock.json` (lockfileVersion 2/3) importer.
//!
//! Entries live under `packages`, keyed `""` for the root and
//! `node_modules/<name>[/node_modules/<name>...]` for installed packages.
//! The package name is whatever follows the last `node_modules/` segment.

use serde_json::Value;

use super::{LockFile, LockFilePackage};
use crate::error::{Error, Result};

/// Recover a package name from a packages key. Nested keys keep only the
/// innermost name; scoped names keep their `@scope/` prefix.
fn name_from_key(key: &str) -> Option<&str> {
    if key.is_empty() {
        return None;
    }
    let name = match key.rfind("node_modules/") {
        Some(idx) => &key[idx + "node_modules/".len()..],
        None => key,
    };
    let name = name.trim_matches('/');
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

fn string_map(value: Option<&Value>) -> std::collections::BTreeMap<String, String> {
    let mut out = std::collections::BTreeMap::new();
    if let Some(obj) = value.and_then(Value::as_object) {
        for (k, v) in obj {
            if let Some(s) = v.as_str() {
                out.insert(k.clone(), s.to_string());
            }
        }
    }
    out
}

/// Import a package-lock.json document into the canonical lockfile.
pub fn import(text: &str) -> Result<LockFile> {
    let doc: Value = serde_json::from_str(text)
        .map_err(|e| Error::LockfileUnsupported(format!("package-lock.json: {}", e)))?;
    let packages = doc
        .get("packages")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::LockfileUnsupported("package-lock.json has no packages map".into()))?;

    let mut lock = LockFile::new();
    for (key, value) in packages {
        let Some(name) = name_from_key(key) else {
            continue; // root entry
        };
        let Some(version) = value.get("version").and_then(Value::as_str) else {
            continue;
        };
        let package = LockFilePackage {
            version: version.to_string(),
            resolved: value
                .get("resolved")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            integrity: value
                .get("integrity")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            dependencies: string_map(value.get("dependencies")),
            optional_dependencies: string_map(value.get("optionalDependencies")),
            peer_dependencies: string_map(value.get("peerDependencies")),
            dev: value.get("dev").and_then(Value::as_bool).unwrap_or(false),
            optional: value.get("optional").and_then(Value::as_bool).unwrap_or(false),
            engines: string_map(value.get("engines")),
        };
        lock.insert(format!("{}@{}", name, version), package)?;
    }
    Ok(lock)
}
