//! Canonical lockfile: `lockfileVersion: 3`, packages keyed `name@version`,
//! stable alphabetical serialisation. Importers normalise npm, yarn classic,
//! yarn berry and pnpm lockfiles into this shape.

pub mod berry;
pub mod npm;
pub mod pnpm;
pub mod yarn;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const LOCKFILE_VERSION: u32 = 3;
/// File name of the canonical lockfile skiff emits.
pub const LOCKFILE_NAME: &str = "skiff-lock.json";

/// One locked package.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LockFilePackage {
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resolved: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub integrity: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub optional_dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub peer_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub dev: bool,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub engines: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LockFile {
    pub lockfile_version: u32,
    #[serde(default)]
    pub packages: BTreeMap<String, LockFilePackage>,
}

impl LockFile {
    pub fn new() -> Self {
        Self { lockfile_version: LOCKFILE_VERSION, packages: BTreeMap::new() }
    }

    /// Insert a package under its spec. Inserting the same spec twice is fine
    /// when the entries agree; disagreement on version, resolved or integrity
    /// is fatal.
    pub fn insert(&mut self, spec: String, package: LockFilePackage) -> Result<()> {
        if let Some(existing) = self.packages.get(&spec) {
            if existing.version != package.version
                || existing.resolved != package.resolved
                || existing.integrity != package.integrity
            {
                return Err(Error::LockfileMismatch {
                    spec,
                    detail: format!(
                        "{} / {} vs {} / {}",
                        existing.version, existing.resolved, package.version, package.resolved
                    ),
                });
            }
            return Ok(());
        }
        self.packages.insert(spec, package);
        Ok(())
    }

    /// Serialise to pretty JSON. BTreeMap keys keep the output stable.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::LockfileUnsupported(e.to_string()))
    }

    /// Parse the canonical format.
    pub fn from_json(text: &str) -> Result<Self> {
        let lock: LockFile = serde_json::from_str(text)
            .map_err(|e| Error::LockfileUnsupported(format!("canonical lockfile: {}", e)))?;
        if lock.lockfile_version != LOCKFILE_VERSION {
            return Err(Error::LockfileUnsupported(format!(
                "lockfileVersion {} (expected {})",
                lock.lockfile_version, LOCKFILE_VERSION
            )));
        }
        Ok(lock)
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        let text = self.to_json()?;
        std::fs::write(dir.join(LOCKFILE_NAME), text)
            .map_err(|e| Error::LockfileUnsupported(e.to_string()))
    }

    pub fn read(dir: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(dir.join(LOCKFILE_NAME))
            .map_err(|e| Error::LockfileUnsupported(e.to_string()))?;
        Self::from_json(&text)
    }
}

/// Which foreign lockfile flavour a file holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockfileKind {
    Canonical,
    Npm,
    YarnClassic,
    YarnBerry,
    Pnpm,
}

/// Detect the lockfile present in a directory, preferring the canonical one.
pub fn detect(dir: &Path) -> Option<(LockfileKind, std::path::PathBuf)> {
    let canonical = dir.join(LOCKFILE_NAME);
    if canonical.is_file() {
        return Some((LockfileKind::Canonical, canonical));
    }
    let npm = dir.join("package-lock.json");
    if npm.is_file() {
        return Some((LockfileKind::Npm, npm));
    }
    let yarn = dir.join("yarn.lock");
    if yarn.is_file() {
        let kind = match std::fs::read_to_string(&yarn) {
            Ok(text) if berry::looks_like_berry(&text) => LockfileKind::YarnBerry,
            _ => LockfileKind::YarnClassic,
        };
        return Some((kind, yarn));
    }
    let pnpm = dir.join("pnpm-lock.yaml");
    if pnpm.is_file() {
        return Some((LockfileKind::Pnpm, pnpm));
    }
    None
}

/// Import whichever lockfile a directory holds into the canonical model.
pub fn import_dir(dir: &Path) -> Result<LockFile> {
    let Some((kind, path)) = detect(dir) else {
        return Err(Error::LockfileUnsupported(format!(
            "no lockfile found in {}",
            dir.display()
        )));
    };
    let text = std::fs::read_to_string(&path)
        .map_err(|e| Error::LockfileUnsupported(e.to_string()))?;
    match kind {
        LockfileKind::Canonical => LockFile::from_json(&text),
        LockfileKind::Npm => npm::import(&text),
        LockfileKind::YarnClassic => yarn::import(&text),
        LockfileKind::YarnBerry => berry::import(&text),
        LockfileKind::Pnpm => pnpm::import(&text),
    }
}
