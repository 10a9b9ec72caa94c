//! yarn classic (v1) `yarn.lock` importer. Line-oriented: a top-level line
//! like `"a@^1.0.0, a@^1.1.0":` opens an entry, indented `version`,
//! `resolved`, `integrity` lines fill it, and a `dependencies:` block lists
//! `name range` pairs at deeper indentation.

use std::collections::BTreeMap;

use super::{LockFile, LockFilePackage};
use crate::error::{Error, Result};

fn strip_quotes(s: &str) -> &str {
    s.trim().trim_matches('"')
}

/// Package name from a descriptor like `a@^1.0.0` or `@scope/a@~2.0.0`.
fn name_from_descriptor(descriptor: &str) -> Option<String> {
    let descriptor = strip_quotes(descriptor);
    let at = descriptor.rfind('@')?;
    if at == 0 {
        // "@scope/pkg" with no range; take as-is.
        return Some(descriptor.to_string());
    }
    Some(descriptor[..at].to_string())
}

#[derive(Default)]
struct Entry {
    name: Option<String>,
    version: Option<String>,
    resolved: String,
    integrity: String,
    dependencies: BTreeMap<String, String>,
}

impl Entry {
    fn flush(self, lock: &mut LockFile) -> Result<()> {
        let (Some(name), Some(version)) = (self.name, self.version) else {
            return Ok(());
        };
        lock.insert(
            format!("{}@{}", name, version),
            LockFilePackage {
                version,
                resolved: self.resolved,
                integrity: self.integrity,
                dependencies: self.dependencies,
                ..Default::default()
            },
        )
    }
}

/// Import a yarn classic lockfile into the canonical model.
pub fn import(text: &str) -> Result<LockFile> {
    let mut lock = LockFile::new();
    let mut current: Option<Entry> = None;
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
            let Some(keys) = line.strip_suffix(':') else {
                return Err(Error::LockfileUnsupported(format!(
                    "yarn.lock: unexpected top-level line \"{}\"",
                    line
                )));
            };
            // Several descriptors can share an entry; they all name one package.
            let first = keys.split(',').next().unwrap_or(keys);
            current = Some(Entry { name: name_from_descriptor(first), ..Default::default() });
            continue;
        }

        let Some(entry) = current.as_mut() else {
            continue;
        };

        if in_dependencies && indent >= 4 {
            if let Some((dep, range)) = line.split_once(' ') {
                entry
                    .dependencies
                    .insert(strip_quotes(dep).to_string(), strip_quotes(range).to_string());
            }
            continue;
        }
        in_dependencies = false;

        if line == "dependencies:" {
            in_dependencies = true;
        } else if let Some(rest) = line.strip_prefix("version ") {
            entry.version = Some(strip_quotes(rest).to_string());
        } else if let Some(rest) = line.strip_prefix("resolved ") {
            entry.resolved = strip_quotes(rest).to_string();
        } else if let Some(rest) = line.strip_prefix("integrity ") {
            entry.integrity = strip_quotes(rest).to_string();
        }
    }
    if let Some(entry) = current.take() {
        entry.flush(&mut lock)?;
    }
    Ok(lock)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"# THIS IS AN AUTOGENERATED FILE. DO NOT EDIT THIS FILE DIRECTLY.
# yarn lockfile v1


"accepts@~1.3.8":
  version "1.3.8"
  resolved "https://registry.yarnpkg.com/accepts/-/accepts-1.3.8.tgz#sha"
  integrity sha512-accepts
  dependencies:
    mime-types "~2.1.34"
    negotiator "0.6.3"

express@^4.18.0, express@^4.18.2:
  version "4.18.2"
  resolved "https://registry.yarnpkg.com/express/-/express-4.18.2.tgz"
  integrity sha512-express
  dependencies:
    accepts "~1.3.8"

"@babel/code-frame@^7.0.0":
  version "7.22.5"
  resolved "https://registry.yarnpkg.com/@babel/code-frame/-/code-frame-7.22.5.tgz"
  integrity sha512-babel
"#;

    #[test]
    fn imports_entries_with_dependency_blocks() {
        let lock = import(FIXTURE).expect("import");
        assert_eq!(lock.packages.len(), 3);

        let accepts = &lock.packages["accepts@1.3.8"];
        assert_eq!(accepts.integrity, "sha512-accepts");
        assert_eq!(accepts.dependencies.len(), 2);
        assert_eq!(
            accepts.dependencies.get("negotiator").map(String::as_str),
            Some("0.6.3")
        );

        let express = &lock.packages["express@4.18.2"];
        assert_eq!(express.version, "4.18.2");
        assert_eq!(express.dependencies.get("accepts").map(String::as_str), Some("~1.3.8"));
    }

    #[test]
    fn scoped_descriptors_keep_their_scope() {
        let lock = import(FIXTURE).expect("import");
        let babel = &lock.packages["@babel/code-frame@7.22.5"];
        assert_eq!(babel.version, "7.22.5");
    }

    #[test]
    fn descriptor_name_parsing() {
        assert_eq!(name_from_descriptor("a@^1.0.0").as_deref(), Some("a"));
        assert_eq!(name_from_descriptor("\"@scope/a@~2.0.0\"").as_deref(), Some("@scope/a"));
        assert_eq!(name_from_descriptor("\"a@^1.0.0\"").as_deref(), Some("a"));
    }

    #[test]
    fn garbage_is_a_typed_error() {
        let err = import("this is not yarn").unwrap_err();
        assert!(matches!(err, Error::LockfileUnsupported(_)));
    }
}
