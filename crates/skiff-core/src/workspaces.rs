//! Workspace discovery and ordering.
//!
//! The root manifest's `workspaces` patterns come in three shapes: a
//! trailing `/**` matches all sub-directories recursively, a trailing `/*`
//! matches immediate sub-directories, anything else is an exact relative
//! path. A match must hold a parseable `package.json` with a non-empty name,
//! otherwise it is skipped with a warning.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::manifest::PackageManifest;

#[derive(Clone, Debug)]
pub struct WorkspaceInfo {
    pub name: String,
    pub path: PathBuf,
    pub relative_path: String,
    pub manifest: PackageManifest,
}

fn try_load(root: &Path, dir: &Path, out: &mut Vec<WorkspaceInfo>, seen: &mut HashSet<PathBuf>) {
    if !dir.join("package.json").is_file() || !seen.insert(dir.to_path_buf()) {
        return;
    }
    let manifest = match PackageManifest::read_dir(dir) {
        Ok(m) => m,
        Err(e) => {
            crate::log::warn(&format!("skipping workspace {}: {}", dir.display(), e));
            return;
        }
    };
    if manifest.name.is_empty() {
        crate::log::warn(&format!(
            "skipping workspace {}: package.json has no name",
            dir.display()
        ));
        return;
    }
    let relative = dir
        .strip_prefix(root)
        .unwrap_or(dir)
        .to_string_lossy()
        .replace('\\', "/");
    out.push(WorkspaceInfo {
        name: manifest.name.clone(),
        path: dir.to_path_buf(),
        relative_path: relative,
        manifest,
    });
}

fn walk_recursive(root: &Path, dir: &Path, out: &mut Vec<WorkspaceInfo>, seen: &mut HashSet<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if name == "node_modules" || name.to_string_lossy().starts_with('.') {
            continue;
        }
        try_load(root, &path, out, seen);
        walk_recursive(root, &path, out, seen);
    }
}

/// Discover workspaces declared by the root manifest, in a stable order.
pub fn discover(root: &Path, root_manifest: &PackageManifest) -> Result<Vec<WorkspaceInfo>> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let Some(workspaces) = &root_manifest.workspaces else {
        return Ok(out);
    };

    for pattern in workspaces.patterns() {
        let pattern = pattern.trim().trim_end_matches('/');
        if pattern.is_empty() {
            continue;
        }
        if let Some(base) = pattern.strip_suffix("/**") {
            walk_recursive(root, &root.join(base), &mut out, &mut seen);
        } else if let Some(base) = pattern.strip_suffix("/*") {
            let Ok(entries) = std::fs::read_dir(root.join(base)) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    try_load(root, &path, &mut out, &mut seen);
                }
            }
        } else {
            try_load(root, &root.join(pattern), &mut out, &mut seen);
        }
    }
    out.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(out)
}

/// Workspace name -> info map for resolver lookups.
pub fn by_name(workspaces: &[WorkspaceInfo]) -> HashMap<String, WorkspaceInfo> {
    workspaces.iter().map(|w| (w.name.clone(), w.clone())).collect()
}

/// Order workspaces so that every dependency on another workspace comes
/// before its dependents. Kahn's algorithm with a lexicographic tie-break.
/// On a cycle the smallest blocked workspace is force-released and a
/// warning names it; the order is still total and deterministic.
pub fn topological_order(workspaces: &[WorkspaceInfo]) -> Vec<WorkspaceInfo> {
    let names: HashSet<&str> = workspaces.iter().map(|w| w.name.as_str()).collect();
    let by_name: BTreeMap<&str, &WorkspaceInfo> =
        workspaces.iter().map(|w| (w.name.as_str(), w)).collect();

    // Edges: dependency -> dependents. Only edges between workspaces count.
    let mut indegree: BTreeMap<&str, usize> = by_name.keys().map(|&n| (n, 0)).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for ws in workspaces {
        for dep in ws
            .manifest
            .dependencies
            .keys()
            .chain(ws.manifest.dev_dependencies.keys())
        {
            if names.contains(dep.as_str()) && dep != &ws.name {
                if let Some(deg) = indegree.get_mut(ws.name.as_str()) {
                    *deg += 1;
                }
                dependents.entry(dep.as_str()).or_default().push(ws.name.as_str());
            }
        }
    }

    let mut order = Vec::with_capacity(workspaces.len());
    let mut done: HashSet<&str> = HashSet::new();
    while order.len() < workspaces.len() {
        let ready = indegree
            .iter()
            .filter(|(name, &deg)| deg == 0 && !done.contains(*name))
            .map(|(&name, _)| name)
            .next();
        let next = match ready {
            Some(name) => name,
            None => {
                // Cycle: release the lexicographically smallest blocked node.
                let Some(broken) = indegree
                    .iter()
                    .filter(|(name, _)| !done.contains(*name))
                    .map(|(&name, _)| name)
                    .next()
                else {
                    break;
                };
                crate::log::warn(&format!(
                    "workspace dependency cycle detected; breaking at \"{}\"",
                    broken
                ));
                broken
            }
        };
        done.insert(next);
        if let Some(info) = by_name.get(next) {
            order.push((*info).clone());
        }
        if let Some(deps) = dependents.get(next) {
            for &dependent in deps {
                if let Some(deg) = indegree.get_mut(dependent) {
                    *deg = deg.saturating_sub(1);
                }
            }
        }
    }
    order
}
