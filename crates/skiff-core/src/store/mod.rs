//! Content-addressable store: extracted package trees shared across projects.
//!
//! Entries live at `<store>/<hh>/<hh>/<HASH>` with
//! `HASH = sha256_hex(lowercase("{name}@{version}"))`. Insertion extracts
//! into a `.tmp-` sibling and renames, so readers never observe a partial
//! tree. Materialisation into a project is symlink, hardlink or copy.

mod link;
mod tar;

use std::path::{Path, PathBuf};

use rand::Rng;

pub use link::{link_dir, LinkOutcome, LinkStrategy};
pub use tar::extract_tgz;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::integrity::{self, sha256_hex, Algorithm};

/// Name of the memoised tarball integrity file inside a store entry.
const INTEGRITY_FILE: &str = ".integrity";
/// Conventional location of the packed tarball inside an entry, when kept.
const PACKED_TARBALL: &str = "package.tgz";

pub struct Store {
    root: PathBuf,
    strategy: LinkStrategy,
}

fn store_key(name: &str, version: &str) -> String {
    sha256_hex(&format!("{}@{}", name, version).to_lowercase())
}

impl Store {
    pub fn new(root: impl Into<PathBuf>, strategy: LinkStrategy) -> Self {
        Self { root: root.into(), strategy }
    }

    /// Build a store from configuration: symlinks if enabled, else hardlinks,
    /// else plain copies.
    pub fn from_config(config: &Config) -> Self {
        let strategy = if config.use_symlinks && cfg!(unix) {
            LinkStrategy::Symlink
        } else if config.use_hardlinks {
            LinkStrategy::Hardlink
        } else {
            LinkStrategy::Copy
        };
        Self::new(config.store_dir.clone(), strategy)
    }

    /// Deterministic entry path for a package.
    pub fn path(&self, name: &str, version: &str) -> PathBuf {
        let hash = store_key(name, version);
        self.root.join(&hash[0..2]).join(&hash[2..4]).join(hash)
    }

    pub fn exists(&self, name: &str, version: &str) -> bool {
        self.path(name, version).is_dir()
    }

    /// Extract a gzipped tarball into the store. Idempotent: an existing
    /// entry is kept as-is. The temp directory is removed on any error.
    pub fn add(&self, name: &str, version: &str, tarball: &[u8]) -> Result<()> {
        let final_path = self.path(name, version);
        if final_path.is_dir() {
            return Ok(());
        }
        let tmp = self
            .root
            .join(format!(".tmp-{:016x}", rand::thread_rng().gen::<u64>()));

        let result = (|| {
            extract_tgz(tarball, &tmp)?;
            if let Some(parent) = final_path.parent() {
                std::fs::create_dir_all(parent).map_err(Error::store_io)?;
            }
            match std::fs::rename(&tmp, &final_path) {
                Ok(()) => Ok(()),
                // Lost the race to another process; their entry is equivalent.
                Err(_) if final_path.is_dir() => Ok(()),
                Err(e) => Err(Error::store_io(e)),
            }
        })();

        if result.is_err() || tmp.exists() {
            let _ = std::fs::remove_dir_all(&tmp);
        }
        result
    }

    /// Materialise a store entry at `target` using the configured strategy.
    pub fn link(&self, name: &str, version: &str, target: &Path) -> Result<LinkOutcome> {
        let source = self.path(name, version);
        if !source.is_dir() {
            return Err(Error::StoreIo {
                detail: format!("{}@{} is not in the store", name, version),
            });
        }
        link::link_dir(&source, target, self.strategy)
    }

    /// Materialise the package contents at `target`, stripping the
    /// conventional `package/` root folder when the entry has one. This is
    /// the variant module trees are built from.
    pub fn link_package(&self, name: &str, version: &str, target: &Path) -> Result<LinkOutcome> {
        let entry = self.path(name, version);
        if !entry.is_dir() {
            return Err(Error::StoreIo {
                detail: format!("{}@{} is not in the store", name, version),
            });
        }
        let packaged = entry.join("package");
        let source = if packaged.is_dir() { packaged } else { entry };
        link::link_dir(&source, target, self.strategy)
    }

    /// sha512 SRI of the packed tarball kept at `<entry>/package.tgz`,
    /// memoised in `<entry>/.integrity`. None when no tarball is kept.
    pub fn integrity(&self, name: &str, version: &str) -> Result<Option<String>> {
        let entry = self.path(name, version);
        let memo = entry.join(INTEGRITY_FILE);
        if let Ok(cached) = std::fs::read_to_string(&memo) {
            let cached = cached.trim().to_string();
            if !cached.is_empty() {
                return Ok(Some(cached));
            }
        }
        let tarball = entry.join(PACKED_TARBALL);
        if !tarball.is_file() {
            return Ok(None);
        }
        let bytes = std::fs::read(&tarball).map_err(Error::store_io)?;
        let spec = integrity::compute(&bytes, Algorithm::Sha512);
        std::fs::write(&memo, &spec).map_err(Error::store_io)?;
        Ok(Some(spec))
    }

    /// Total bytes under the store root.
    pub fn size(&self) -> Result<u64> {
        fn dir_size(dir: &Path) -> std::io::Result<u64> {
            let mut total = 0;
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    total += dir_size(&path)?;
                } else {
                    total += entry.metadata()?.len();
                }
            }
            Ok(total)
        }
        if !self.root.exists() {
            return Ok(0);
        }
        dir_size(&self.root).map_err(Error::store_io)
    }

    /// Remove entries whose `name@version` is not in `keep`. Returns the
    /// number of entries removed.
    pub fn prune(&self, keep: &std::collections::HashSet<String>) -> Result<usize> {
        let keep_hashes: std::collections::HashSet<String> = keep
            .iter()
            .map(|spec| sha256_hex(&spec.to_lowercase()))
            .collect();
        let mut removed = 0;
        if !self.root.exists() {
            return Ok(0);
        }
        for shard1 in std::fs::read_dir(&self.root).map_err(Error::store_io)? {
            let shard1 = shard1.map_err(Error::store_io)?.path();
            if !shard1.is_dir() {
                continue;
            }
            for shard2 in std::fs::read_dir(&shard1).map_err(Error::store_io)? {
                let shard2 = shard2.map_err(Error::store_io)?.path();
                if !shard2.is_dir() {
                    continue;
                }
                for entry in std::fs::read_dir(&shard2).map_err(Error::store_io)? {
                    let entry = entry.map_err(Error::store_io)?.path();
                    let hash = entry.file_name().and_then(|n| n.to_str()).unwrap_or("");
                    if entry.is_dir() && !keep_hashes.contains(hash) {
                        std::fs::remove_dir_all(&entry).map_err(Error::store_io)?;
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }
}
