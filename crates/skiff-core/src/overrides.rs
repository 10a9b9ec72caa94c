//! Dependency overrides: npm `overrides` (flat and nested) and yarn
//! `resolutions`. Resolutions win over flat overrides; nested override keys
//! form `parent>child>leaf` chains that match on the leaf.

use serde_json::Value;

use crate::manifest::PackageManifest;

/// Flatten a (possibly nested) overrides object into chain keys.
/// `{"a": {"b": "1.0.0"}}` becomes `("a>b", "1.0.0")`.
fn flatten_overrides(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::String(s) => out.push((prefix.to_string(), s.clone())),
        Value::Object(map) => {
            for (key, child) in map {
                let chain = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}>{}", prefix, key)
                };
                flatten_overrides(&chain, child, out);
            }
        }
        // Numbers, arrays, booleans: not a range, ignored.
        _ => {}
    }
}

/// The leaf package a chain key targets: `a>b>c` targets `c`.
fn chain_leaf(key: &str) -> &str {
    key.rsplit('>').next().unwrap_or(key).trim()
}

/// Replacement range for `child_name`, if the root manifest supplies one.
/// `resolutions[child]` beats `overrides`; within overrides, a flat key beats
/// a chain whose leaf matches.
pub fn replacement_for(root: &PackageManifest, child_name: &str) -> Option<String> {
    if let Some(Value::Object(resolutions)) = &root.resolutions {
        for (key, value) in resolutions {
            // yarn resolutions accept "**/name" and "parent/name" path keys.
            let leaf = key.rsplit('/').next().unwrap_or(key);
            if leaf == child_name {
                if let Some(range) = value.as_str() {
                    return Some(range.to_string());
                }
            }
        }
    }

    let overrides = root.overrides.as_ref()?;
    let mut flat = Vec::new();
    flatten_overrides("", overrides, &mut flat);

    // Exact flat key first.
    if let Some((_, range)) = flat.iter().find(|(key, _)| key == child_name) {
        return Some(range.clone());
    }
    // Then any chain whose leaf is the child.
    flat.iter()
        .find(|(key, _)| key.contains('>') && chain_leaf(key) == child_name)
        .map(|(_, range)| range.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(json: &str) -> PackageManifest {
        PackageManifest::parse("root", json).expect("manifest")
    }

    #[test]
    fn flat_override_applies() {
        let root = manifest(r#"{"overrides": {"lodash": "4.17.21"}}"#);
        assert_eq!(replacement_for(&root, "lodash").as_deref(), Some("4.17.21"));
        assert_eq!(replacement_for(&root, "underscore"), None);
    }

    #[test]
    fn resolutions_beat_overrides() {
        let root = manifest(
            r#"{
                "overrides": {"left-pad": "1.0.0"},
                "resolutions": {"left-pad": "1.3.0"}
            }"#,
        );
        assert_eq!(replacement_for(&root, "left-pad").as_deref(), Some("1.3.0"));
    }

    #[test]
    fn resolutions_path_keys_match_on_leaf() {
        let root = manifest(r#"{"resolutions": {"**/minimist": "1.2.8"}}"#);
        assert_eq!(replacement_for(&root, "minimist").as_deref(), Some("1.2.8"));
    }

    #[test]
    fn chain_keys_match_on_leaf() {
        let root = manifest(r#"{"overrides": {"express>qs": "6.11.0"}}"#);
        assert_eq!(replacement_for(&root, "qs").as_deref(), Some("6.11.0"));
        assert_eq!(replacement_for(&root, "express"), None);
    }

    #[test]
    fn nested_objects_flatten_into_chains() {
        let root = manifest(r#"{"overrides": {"express": {"cookie": "0.5.0"}}}"#);
        assert_eq!(replacement_for(&root, "cookie").as_deref(), Some("0.5.0"));
        // "express" itself has no string range, so no replacement.
        assert_eq!(replacement_for(&root, "express"), None);
    }

    #[test]
    fn non_string_values_are_ignored() {
        let root = manifest(r#"{"overrides": {"a": 7, "b": ["x"], "c": "2.0.0"}}"#);
        assert_eq!(replacement_for(&root, "a"), None);
        assert_eq!(replacement_for(&root, "b"), None);
        assert_eq!(replacement_for(&root, "c").as_deref(), Some("2.0.0"));
    }
}
