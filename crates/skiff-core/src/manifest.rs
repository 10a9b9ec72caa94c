//! package.json model. Known fields are typed; everything else is preserved
//! verbatim in `extra` so read-modify-write never drops ecosystem fields.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// The `workspaces` field: a single pattern, a list, or `{ "packages": [...] }`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum WorkspacesField {
    Single(String),
    List(Vec<String>),
    Nested { packages: Vec<String> },
}

impl WorkspacesField {
    pub fn patterns(&self) -> Vec<String> {
        match self {
            WorkspacesField::Single(p) => vec![p.clone()],
            WorkspacesField::List(ps) => ps.clone(),
            WorkspacesField::Nested { packages } => packages.clone(),
        }
    }
}

/// The `bin` field: a bare path (named after the package) or a name -> path map.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum BinField {
    Path(String),
    Map(BTreeMap<String, String>),
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub engines: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspaces: Option<WorkspacesField>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub private: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin: Option<BinField>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scripts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dev_dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub optional_dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub peer_dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolutions: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub patched_dependencies: BTreeMap<String, String>,
    /// Fields skiff does not model, preserved as-is.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl PackageManifest {
    /// Parse a manifest from JSON text.
    pub fn parse(package: &str, json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::ManifestMalformed {
            package: package.to_string(),
            detail: e.to_string(),
        })
    }

    /// Read `package.json` from a directory.
    pub fn read_dir(dir: &Path) -> Result<Self> {
        let path = dir.join("package.json");
        let text = std::fs::read_to_string(&path).map_err(|e| Error::ManifestMalformed {
            package: path.display().to_string(),
            detail: e.to_string(),
        })?;
        Self::parse(&path.display().to_string(), &text)
    }

    /// Bin entries as alias -> relative path, normalising the bare-path form.
    pub fn bin_entries(&self) -> BTreeMap<String, String> {
        match &self.bin {
            None => BTreeMap::new(),
            Some(BinField::Map(map)) => map.clone(),
            Some(BinField::Path(path)) => {
                // "@scope/pkg" installs a bin named "pkg".
                let alias = self.name.rsplit('/').next().unwrap_or(&self.name).to_string();
                let mut map = BTreeMap::new();
                if !alias.is_empty() {
                    map.insert(alias, path.clone());
                }
                map
            }
        }
    }

    /// The npm registry tarball integrity for this manifest version, when the
    /// packument `dist` block was preserved in `extra`.
    pub fn dist_integrity(&self) -> Option<String> {
        let dist = self.extra.get("dist")?;
        dist.get("integrity").and_then(Value::as_str).map(String::from)
    }

    /// The `dist.tarball` URL, when present.
    pub fn dist_tarball(&self) -> Option<String> {
        let dist = self.extra.get("dist")?;
        dist.get("tarball").and_then(Value::as_str).map(String::from)
    }
}
