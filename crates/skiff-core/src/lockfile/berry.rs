//! yarn berry (v2+) `yarn.lock` importer. Berry lockfiles are YAML-ish with
//! a `__metadata:` block; entries are keyed `"name@npm:range"`, carry a
//! `resolution: "name@npm:version"`, a bare `checksum`, and a
//! `dependencies:` block. Checksums are stored as `sha512-<checksum>`.

use std::collections::BTreeMap;

use super::{LockFile, LockFilePackage};
use crate::error::{Error, Result};

/// Berry detection: `__metadata:` header or a `languageName: node` field.
pub fn looks_like_berry(text: &str) -> bool {
    text.lines().any(|l| {
        let l = l.trim();
        l.starts_with("__metadata:") || l == "languageName: node"
    })
}

fn unquote(s: &str) -> &str {
    s.trim().trim_matches('"')
}

/// Split a berry resolution `name@npm:version` (or `@scope/name@npm:version`).
fn split_resolution(resolution: &str) -> Option<(String, String)> {
    let resolution = unquote(resolution);
    let marker = resolution.rfind("@npm:")?;
    let name = &resolution[..marker];
    let version = &resolution[marker + "@npm:".len()..];
    if name.is_empty() || version.is_empty() {
        return None;
    }
    Some((name.to_string(), version.to_string()))
}

#[derive(Default)]
struct Entry {
    resolution: Option<(String, String)>,
    version: Option<String>,
    checksum: String,
    dependencies: BTreeMap<String, String>,
}

impl Entry {
    fn flush(self, lock: &mut LockFile) -> Result<()> {
        let Some((name, resolved_version)) = self.resolution else {
            return Ok(());
        };
        let version = self.version.unwrap_or_else(|| resolved_version.clone());
        let integrity = if self.checksum.is_empty() {
            String::new()
        } else {
            format!("sha512-{}", self.checksum)
        };
        lock.insert(
            format!("{}@{}", name, version),
            LockFilePackage {
                version,
                resolved: format!("{}@npm:{}", name, resolved_version),
                integrity,
                dependencies: self.dependencies,
                ..Default::default()
            },
        )
    }
}

/// Import a yarn berry lockfile into the canonical model.
pub fn import(text: &str) -> Result<LockFile> {
    if !looks_like_berry(text) {
        return Err(Error::LockfileUnsupported(
            "not a yarn berry lockfile (no __metadata)".into(),
        ));
    }

    let mut lock = LockFile::new();
    let mut current: Option<Entry> = None;
    let mut in_metadata = false;
    let mut in_dependencies = false;

    for raw in text.lines() {
        if raw.trim_start().starts_with('#') || raw.trim().is_empty() {
            continue;
        }
        let indent = raw.len() - raw.trim_start().len();
        let line = raw.trim();

        if indent == 0 {
            if let Some(entry) = current.take() {
                entry.flush(&mut lock)?;
            }
            in_dependencies = false;
            in_metadata = line.starts_with("__metadata:");
            if !in_metadata && line.ends_with(':') {
                current = Some(Entry::default());
            }
            continue;
        }
        if in_metadata {
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };

        if in_dependencies && indent >= 4 {
            if let Some((dep, range)) = line.split_once(':') {
                entry
                    .dependencies
                    .insert(unquote(dep).to_string(), unquote(range).to_string());
            }
            continue;
        }
        in_dependencies = false;

        if line == "dependencies:" {
            in_dependencies = true;
        } else if let Some(rest) = line.strip_prefix("resolution:") {
            entry.resolution = split_resolution(rest);
        } else if let Some(rest) = line.strip_prefix("version:") {
            entry.version = Some(unquote(rest).to_string());
        } else if let Some(rest) = line.strip_prefix("checksum:") {
            entry.checksum = unquote(rest).to_string();
        }
    }
    if let Some(entry) = current.take() {
        entry.flush(&mut lock)?;
    }
    Ok(lock)
}
