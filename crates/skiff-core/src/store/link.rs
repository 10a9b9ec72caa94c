//! Materialisation strategies: symlink, hardlink, copy, with fallback.

use std::path::Path;

use crate::error::{Error, Result};

/// How a store entry gets materialised into a project tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkStrategy {
    /// One directory symlink at the target (POSIX only).
    Symlink,
    /// Per-file hard links mirroring the directory tree.
    Hardlink,
    /// Plain recursive copy.
    Copy,
}

/// Which method actually materialised the target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkOutcome {
    Symlinked,
    Hardlinked,
    Copied,
}

/// Materialise `source` (a directory) at `target` with the requested
/// strategy, falling back symlink -> hardlink -> copy. The parent of
/// `target` is created; an existing target is replaced.
pub fn link_dir(source: &Path, target: &Path, strategy: LinkStrategy) -> Result<LinkOutcome> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(Error::store_io)?;
    }
    remove_existing(target)?;

    if strategy == LinkStrategy::Symlink {
        match symlink_dir(source, target) {
            Ok(()) => return Ok(LinkOutcome::Symlinked),
            Err(_) => {
                crate::log::warn(&format!(
                    "symlink to {} failed, falling back to hardlinks",
                    target.display()
                ));
            }
        }
    }

    if strategy != LinkStrategy::Copy {
        match hardlink_tree(source, target) {
            Ok(()) => return Ok(LinkOutcome::Hardlinked),
            Err(_) => {
                // Cross-device links fail here; a copy always works.
                remove_existing(target)?;
            }
        }
    }

    copy_tree(source, target)?;
    Ok(LinkOutcome::Copied)
}

fn remove_existing(target: &Path) -> Result<()> {
    if target.symlink_metadata().is_ok() {
        if target.is_dir() && target.symlink_metadata().map(|m| !m.is_symlink()).unwrap_or(false) {
            std::fs::remove_dir_all(target).map_err(Error::store_io)?;
        } else {
            std::fs::remove_file(target).map_err(Error::store_io)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn symlink_dir(source: &Path, target: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(source, target)
}

#[cfg(windows)]
fn symlink_dir(source: &Path, target: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(source, target)
}

#[cfg(not(any(unix, windows)))]
fn symlink_dir(_source: &Path, _target: &Path) -> std::io::Result<()> {
    Err(std::io::Error::other("symlinks unsupported on this platform"))
}

/// Mirror the directory tree with per-file hard links. Any file that cannot
/// be hard-linked is copied instead.
fn hardlink_tree(source: &Path, target: &Path) -> Result<()> {
    std::fs::create_dir_all(target).map_err(Error::store_io)?;
    for entry in std::fs::read_dir(source).map_err(Error::store_io)? {
        let entry = entry.map_err(Error::store_io)?;
        let from = entry.path();
        let to = target.join(entry.file_name());
        if from.is_dir() {
            hardlink_tree(&from, &to)?;
        } else if std::fs::hard_link(&from, &to).is_err() {
            std::fs::copy(&from, &to).map_err(Error::store_io)?;
        }
    }
    Ok(())
}

fn copy_tree(source: &Path, target: &Path) -> Result<()> {
    std::fs::create_dir_all(target).map_err(Error::store_io)?;
    for entry in std::fs::read_dir(source).map_err(Error::store_io)? {
        let entry = entry.map_err(Error::store_io)?;
        let from = entry.path();
        let to = target.join(entry.file_name());
        if from.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            std::fs::copy(&from, &to).map_err(Error::store_io)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(dir: &Path) {
        std::fs::create_dir_all(dir.join("lib")).expect("dirs");
        std::fs::write(dir.join("package.json"), "{}").expect("write");
        std::fs::write(dir.join("lib/index.js"), "x").expect("write");
    }

    #[test]
    fn hardlink_materialises_same_content() {
        let td = tempfile::tempdir().expect("tmp");
        let src = td.path().join("src");
        let dst = td.path().join("node_modules/pkg");
        fixture(&src);

        let outcome = link_dir(&src, &dst, LinkStrategy::Hardlink).expect("link");
        assert!(matches!(outcome, LinkOutcome::Hardlinked | LinkOutcome::Copied));
        assert_eq!(std::fs::read_to_string(dst.join("package.json")).expect("read"), "{}");
        assert_eq!(std::fs::read_to_string(dst.join("lib/index.js")).expect("read"), "x");
    }

    #[test]
    fn copy_strategy_never_links() {
        let td = tempfile::tempdir().expect("tmp");
        let src = td.path().join("src");
        let dst = td.path().join("out");
        fixture(&src);

        let outcome = link_dir(&src, &dst, LinkStrategy::Copy).expect("copy");
        assert_eq!(outcome, LinkOutcome::Copied);
        assert!(dst.join("lib/index.js").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_strategy_points_at_source() {
        let td = tempfile::tempdir().expect("tmp");
        let src = td.path().join("src");
        let dst = td.path().join("nm/pkg");
        fixture(&src);

        let outcome = link_dir(&src, &dst, LinkStrategy::Symlink).expect("symlink");
        assert_eq!(outcome, LinkOutcome::Symlinked);
        assert!(dst.symlink_metadata().expect("meta").is_symlink());
        assert_eq!(std::fs::read_to_string(dst.join("package.json")).expect("read"), "{}");
    }

    #[test]
    fn existing_target_is_replaced() {
        let td = tempfile::tempdir().expect("tmp");
        let src = td.path().join("src");
        let dst = td.path().join("out");
        fixture(&src);
        std::fs::create_dir_all(&dst).expect("pre-existing");
        std::fs::write(dst.join("stale.txt"), "old").expect("write");

        link_dir(&src, &dst, LinkStrategy::Copy).expect("link");
        assert!(!dst.join("stale.txt").exists());
        assert!(dst.join("package.json").is_file());
    }
}
