//! pnpm `pnpm-lock.yaml` importer. Packages are keyed `/name@version`
//! (with a leading slash) and carry `resolution: {integrity, tarball}`,
//! `dependencies` and `dev` fields.

use std::collections::BTreeMap;

use serde_yaml::Value;

use super::{LockFile, LockFilePackage};
use crate::error::{Error, Result};

/// Split a pnpm package key `/name@version` or `/@scope/name@version`.
fn split_key(key: &str) -> Option<(String, String)> {
    let key = key.trim_start_matches('/');
    // pnpm v6 keys may carry peer suffixes like "(react@18.2.0)"; drop them
    // before looking for the version separator.
    let key = key.split('(').next()?;
    let at = key.rfind('@')?;
    if at == 0 {
        return None;
    }
    let name = &key[..at];
    let version = key[at + 1..].trim_end_matches('_');
    if name.is_empty() || version.is_empty() {
        return None;
    }
    Some((name.to_string(), version.to_string()))
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(mapping) = value.and_then(Value::as_mapping) {
        for (k, v) in mapping {
            if let (Some(k), Some(v)) = (k.as_str(), v.as_str()) {
                out.insert(k.to_string(), v.to_string());
            }
        }
    }
    out
}

/// Import a pnpm lockfile into the canonical model.
pub fn import(text: &str) -> Result<LockFile> {
    let doc: Value = serde_yaml::from_str(text)
        .map_err(|e| Error::LockfileUnsupported(format!("pnpm-lock.yaml: {}", e)))?;
    let packages = doc
        .get("packages")
        .and_then(Value::as_mapping)
        .ok_or_else(|| Error::LockfileUnsupported("pnpm-lock.yaml has no packages map".into()))?;

    let mut lock = LockFile::new();
    for (key, value) in packages {
        let Some(key) = key.as_str() else {
            continue;
        };
        let Some((name, version)) = split_key(key) else {
            continue;
        };
        let resolution = value.get("resolution");
        let integrity = resolution
            .and_then(|r| r.get("integrity"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let resolved = resolution
            .and_then(|r| r.get("tarball"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let package = LockFilePackage {
            version: version.clone(),
            resolved,
            integrity,
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

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"
lockfileVersion: '6.0'

dependencies:
  express:
    specifier: ^4.18.0
    version: 4.18.2

packages:

  /express@4.18.2:
    resolution: {integrity: sha512-express, tarball: "https://registry.npmjs.org/express/-/express-4.18.2.tgz"}
    dependencies:
      accepts: 1.3.8
    dev: false

  /accepts@1.3.8:
    resolution: {integrity: sha512-accepts}
    dev: false

  /@types/node@20.4.1:
    resolution: {integrity: sha512-types}
    dev: true
"#;

    #[test]
    fn imports_packages_with_resolution_fields() {
        let lock = import(FIXTURE).expect("import");
        assert_eq!(lock.packages.len(), 3);

        let express = &lock.packages["express@4.18.2"];
        assert_eq!(express.integrity, "sha512-express");
        assert!(express.resolved.ends_with("express-4.18.2.tgz"));
        assert_eq!(express.dependencies.get("accepts").map(String::as_str), Some("1.3.8"));

        assert!(lock.packages["@types/node@20.4.1"].dev);
    }

    #[test]
    fn key_splitting() {
        assert_eq!(split_key("/lodash@4.17.21"), Some(("lodash".into(), "4.17.21".into())));
        assert_eq!(
            split_key("/@babel/core@7.22.9"),
            Some(("@babel/core".into(), "7.22.9".into()))
        );
        assert_eq!(
            split_key("/use-sync-external-store@1.2.0(react@18.2.0)"),
            Some(("use-sync-external-store".into(), "1.2.0".into()))
        );
        assert_eq!(split_key("/@scope"), None);
    }

    #[test]
    fn invalid_yaml_is_unsupported() {
        let err = import(": not yaml {{{").unwrap_err();
        assert!(matches!(err, Error::LockfileUnsupported(_)));
    }

    #[test]
    fn missing_packages_map_is_unsupported() {
        let err = import("lockfileVersion: '6.0'\n").unwrap_err();
        assert!(matches!(err, Error::LockfileUnsupported(_)));
    }
}
