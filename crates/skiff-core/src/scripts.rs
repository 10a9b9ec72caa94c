//! package.json script plumbing: command lookup, npm_* environment
//! assembly, and per-lifecycle timeout defaults.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::manifest::PackageManifest;

/// Timeout for a lifecycle event, per npm operational convention.
pub fn timeout_for(event: &str) -> Duration {
    match event {
        "test" => Duration::from_secs(10 * 60),
        "build" => Duration::from_secs(15 * 60),
        "install" | "preinstall" | "postinstall" => Duration::from_secs(10 * 60),
        "start" => Duration::from_secs(60 * 60),
        _ => Duration::from_secs(5 * 60),
    }
}

/// The shell command a script name maps to, or a typed error when the
/// manifest has no such script.
pub fn script_command(manifest: &PackageManifest, name: &str) -> Result<String> {
    let command = manifest.scripts.get(name).ok_or_else(|| Error::ManifestMalformed {
        package: manifest.name.clone(),
        detail: format!("no script named \"{}\"", name),
    })?;
    if command.trim().is_empty() {
        return Err(Error::ManifestMalformed {
            package: manifest.name.clone(),
            detail: format!("script \"{}\" is empty", name),
        });
    }
    Ok(command.clone())
}

/// Sanitise a script name for use in an env var: non-alphanumerics become `_`.
fn env_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// The `npm_*` environment a script sees: package identity, one
/// `npm_package_scripts_<name>` per script, and the lifecycle event.
pub fn script_env(manifest: &PackageManifest, lifecycle_event: Option<&str>) -> HashMap<String, String> {
    let mut env = HashMap::new();
    if !manifest.name.is_empty() {
        env.insert("npm_package_name".to_string(), manifest.name.clone());
    }
    if !manifest.version.is_empty() {
        env.insert("npm_package_version".to_string(), manifest.version.clone());
    }
    if let Some(description) = &manifest.description {
        env.insert("npm_package_description".to_string(), description.clone());
    }
    for (name, command) in &manifest.scripts {
        env.insert(format!("npm_package_scripts_{}", env_safe(name)), command.clone());
    }
    if let Some(event) = lifecycle_event {
        env.insert("npm_lifecycle_event".to_string(), event.to_string());
    }
    env
}
