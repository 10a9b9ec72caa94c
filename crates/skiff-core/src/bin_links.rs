//! `node_modules/.bin` entries for installed packages' declared binaries.

use std::path::Path;

use crate::error::{Error, Result};
use crate::manifest::PackageManifest;

/// Create `.bin` entries for one installed package. `package_dir` is the
/// package root inside the project's `node_modules`. Returns the aliases
/// created.
pub fn link_package_bins(node_modules: &Path, package_dir: &Path) -> Result<Vec<String>> {
    let manifest = match PackageManifest::read_dir(package_dir) {
        Ok(m) => m,
        // No manifest means nothing to link.
        Err(_) => return Ok(Vec::new()),
    };
    let entries = manifest.bin_entries();
    if entries.is_empty() {
        return Ok(Vec::new());
    }

    let bin_dir = node_modules.join(".bin");
    std::fs::create_dir_all(&bin_dir).map_err(Error::store_io)?;

    let mut created = Vec::new();
    for (alias, rel_path) in entries {
        let target = package_dir.join(&rel_path);
        if !target.is_file() {
            crate::log::warn(&format!(
                "bin \"{}\" of {} points at missing file {}",
                alias, manifest.name, rel_path
            ));
            continue;
        }
        let link_path = bin_dir.join(&alias);
        create_bin_entry(&target, &link_path)?;
        created.push(alias);
    }
    Ok(created)
}

#[cfg(unix)]
fn create_bin_entry(target: &Path, link_path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let _ = std::fs::remove_file(link_path);
    std::os::unix::fs::symlink(target, link_path).map_err(Error::store_io)?;
    // npm marks the target executable at link time.
    if let Ok(metadata) = std::fs::metadata(target) {
        let mut perms = metadata.permissions();
        perms.set_mode(perms.mode() | 0o755);
        let _ = std::fs::set_permissions(target, perms);
    }
    Ok(())
}

#[cfg(not(unix))]
fn create_bin_entry(target: &Path, link_path: &Path) -> Result<()> {
    // Windows: a .cmd shim that forwards to node.
    let shim = format!(
        "@ECHO off\r\nnode \"{}\" %*\r\n",
        target.display()
    );
    std::fs::write(link_path.with_extension("cmd"), shim).map_err(Error::store_io)?;
    Ok(())
}
