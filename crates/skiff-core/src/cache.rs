//! Package tarball cache: compressed tarballs plus metadata sidecars, keyed
//! by a content address over name, version and integrity.
//!
//! Layout: `<cache>/<hh>/<hh>/<HASH>.tgz` and `<HASH>.metadata.json`, where
//! `HASH = sha256_hex(lowercase("{name}@{version}#{integrity}"))`. An entry
//! exists only when both files are present, so a crash between the two writes
//! leaves nothing visible.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::integrity::sha256_hex;

/// Metadata sidecar for one cached tarball.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CachedPackage {
    pub name: String,
    pub version: String,
    pub integrity: String,
    pub cached_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub size: u64,
}

pub struct PackageCache {
    root: PathBuf,
}

fn cache_key(name: &str, version: &str, integrity: &str) -> String {
    sha256_hex(&format!("{}@{}#{}", name, version, integrity).to_lowercase())
}

impl PackageCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Deterministic tarball path for an entry.
    pub fn tarball_path(&self, name: &str, version: &str, integrity: &str) -> PathBuf {
        let hash = cache_key(name, version, integrity);
        self.root.join(&hash[0..2]).join(&hash[2..4]).join(format!("{}.tgz", hash))
    }

    fn metadata_path(&self, name: &str, version: &str, integrity: &str) -> PathBuf {
        let hash = cache_key(name, version, integrity);
        self.root
            .join(&hash[0..2])
            .join(&hash[2..4])
            .join(format!("{}.metadata.json", hash))
    }

    /// An entry exists only when tarball and metadata are both present.
    pub fn exists(&self, name: &str, version: &str, integrity: &str) -> bool {
        self.tarball_path(name, version, integrity).is_file()
            && self.metadata_path(name, version, integrity).is_file()
    }

    /// Read a cached tarball and stamp `lastAccessedAt`. Returns None on miss.
    pub async fn get(&self, name: &str, version: &str, integrity: &str) -> Result<Option<Vec<u8>>> {
        if !self.exists(name, version, integrity) {
            return Ok(None);
        }
        let bytes = tokio::fs::read(self.tarball_path(name, version, integrity))
            .await
            .map_err(Error::cache_io)?;
        // Stamp the access time; the entry stays valid if this fails.
        let meta_path = self.metadata_path(name, version, integrity);
        if let Ok(text) = tokio::fs::read_to_string(&meta_path).await {
            if let Ok(mut meta) = serde_json::from_str::<CachedPackage>(&text) {
                meta.last_accessed_at = Utc::now();
                if let Ok(out) = serde_json::to_string_pretty(&meta) {
                    let _ = tokio::fs::write(&meta_path, out).await;
                }
            }
        }
        Ok(Some(bytes))
    }

    /// Insert a tarball. Writes `<HASH>.tgz.tmp`, renames, then writes the
    /// metadata sidecar. On any failure both files are removed best-effort so
    /// a partial entry is never visible.
    pub async fn put<R>(
        &self,
        name: &str,
        version: &str,
        integrity: &str,
        mut reader: R,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let tarball = self.tarball_path(name, version, integrity);
        let metadata = self.metadata_path(name, version, integrity);
        let tmp = tarball.with_extension("tgz.tmp");
        if let Some(parent) = tarball.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(Error::cache_io)?;
        }

        let result = async {
            let mut out = tokio::fs::File::create(&tmp).await.map_err(Error::cache_io)?;
            let mut buf = vec![0u8; 64 * 1024];
            let mut size: u64 = 0;
            loop {
                let n = reader.read(&mut buf).await.map_err(Error::cache_io)?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n]).await.map_err(Error::cache_io)?;
                size += n as u64;
            }
            out.sync_all().await.map_err(Error::cache_io)?;
            drop(out);
            tokio::fs::rename(&tmp, &tarball).await.map_err(Error::cache_io)?;

            let now = Utc::now();
            let meta = CachedPackage {
                name: name.to_string(),
                version: version.to_string(),
                integrity: integrity.to_string(),
                cached_at: now,
                last_accessed_at: now,
                size,
            };
            let text = serde_json::to_string_pretty(&meta).map_err(Error::cache_io)?;
            tokio::fs::write(&metadata, text).await.map_err(Error::cache_io)?;
            Ok(())
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
            let _ = tokio::fs::remove_file(&tarball).await;
            let _ = tokio::fs::remove_file(&metadata).await;
        }
        result
    }

    /// Total bytes of cached tarballs.
    pub async fn size(&self) -> Result<u64> {
        let mut total = 0u64;
        for entry in self.walk_files().await? {
            if entry.extension().map(|e| e == "tgz").unwrap_or(false) {
                if let Ok(meta) = tokio::fs::metadata(&entry).await {
                    total += meta.len();
                }
            }
        }
        Ok(total)
    }

    /// Remove every cache entry.
    pub async fn clear(&self) -> Result<()> {
        if self.root.exists() {
            tokio::fs::remove_dir_all(&self.root).await.map_err(Error::cache_io)?;
        }
        Ok(())
    }

    /// List cached packages. Entries whose metadata fails to parse are skipped.
    pub async fn list(&self) -> Result<Vec<CachedPackage>> {
        let mut out = Vec::new();
        for entry in self.walk_files().await? {
            let is_meta = entry
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(".metadata.json"))
                .unwrap_or(false);
            if !is_meta {
                continue;
            }
            let Ok(text) = tokio::fs::read_to_string(&entry).await else {
                continue;
            };
            let Ok(meta) = serde_json::from_str::<CachedPackage>(&text) else {
                continue;
            };
            // Only report complete entries.
            if self.exists(&meta.name, &meta.version, &meta.integrity) {
                out.push(meta);
            }
        }
        out.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
        Ok(out)
    }

    async fn walk_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if !self.root.exists() {
            return Ok(files);
        }
        let mut dirs = vec![self.root.clone()];
        while let Some(dir) = dirs.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await.map_err(Error::cache_io)?;
            while let Some(entry) = entries.next_entry().await.map_err(Error::cache_io)? {
                let path = entry.path();
                if path.is_dir() {
                    dirs.push(path);
                } else {
                    files.push(path);
                }
            }
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingReader {
        remaining: usize,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            if self.remaining == 0 {
                return std::task::Poll::Ready(Err(std::io::Error::other("stream broke")));
            }
            let n = self.remaining.min(buf.remaining());
            buf.put_slice(&vec![7u8; n]);
            self.remaining = 0;
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let td = tempfile::tempdir().expect("tmp");
        let cache = PackageCache::new(td.path());
        let body = b"fake tarball bytes".to_vec();

        cache
            .put("left-pad", "1.3.0", "sha512-abc", body.as_slice())
            .await
            .expect("put");
        assert!(cache.exists("left-pad", "1.3.0", "sha512-abc"));

        let got = cache.get("left-pad", "1.3.0", "sha512-abc").await.expect("get");
        assert_eq!(got, Some(body));
        assert_eq!(cache.get("left-pad", "9.9.9", "sha512-abc").await.expect("get"), None);
    }

    #[tokio::test]
    async fn paths_are_deterministic_and_sharded() {
        let cache_a = PackageCache::new("/cache");
        let cache_b = PackageCache::new("/cache");
        let a = cache_a.tarball_path("p", "1.0.0", "sha256-x");
        let b = cache_b.tarball_path("p", "1.0.0", "sha256-x");
        assert_eq!(a, b);
        // `<root>/<hh>/<hh>/<hash>.tgz`
        let rel: Vec<_> = a.strip_prefix("/cache").expect("prefix").components().collect();
        assert_eq!(rel.len(), 3);
        // Case differences in inputs collapse to one entry.
        assert_eq!(
            cache_a.tarball_path("LEFT-pad", "1.0.0", "sha256-x"),
            cache_a.tarball_path("left-PAD", "1.0.0", "sha256-x"),
        );
    }

    #[tokio::test]
    async fn failed_put_leaves_no_entry() {
        let td = tempfile::tempdir().expect("tmp");
        let cache = PackageCache::new(td.path());
        let err = cache
            .put("p", "1.0.0", "sha256-x", FailingReader { remaining: 1024 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CacheIo { .. }));
        assert!(!cache.exists("p", "1.0.0", "sha256-x"));
        assert_eq!(cache.get("p", "1.0.0", "sha256-x").await.expect("get"), None);
    }

    #[tokio::test]
    async fn get_updates_last_accessed_not_cached_at() {
        let td = tempfile::tempdir().expect("tmp");
        let cache = PackageCache::new(td.path());
        cache.put("p", "1.0.0", "sha256-x", &b"bytes"[..]).await.expect("put");

        let before = cache.list().await.expect("list").remove(0);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cache.get("p", "1.0.0", "sha256-x").await.expect("get");
        let after = cache.list().await.expect("list").remove(0);

        assert_eq!(before.cached_at, after.cached_at);
        assert!(after.last_accessed_at > before.last_accessed_at);
    }

    #[tokio::test]
    async fn list_skips_corrupt_metadata() {
        let td = tempfile::tempdir().expect("tmp");
        let cache = PackageCache::new(td.path());
        cache.put("a", "1.0.0", "sha256-x", &b"aa"[..]).await.expect("put");
        cache.put("b", "2.0.0", "sha256-y", &b"bb"[..]).await.expect("put");

        // Corrupt one sidecar in place.
        let meta = cache.metadata_path("a", "1.0.0", "sha256-x");
        std::fs::write(&meta, "{broken").expect("corrupt");

        let listed = cache.list().await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "b");
    }

    #[tokio::test]
    async fn size_and_clear() {
        let td = tempfile::tempdir().expect("tmp");
        let cache = PackageCache::new(td.path());
        cache.put("a", "1.0.0", "sha256-x", &b"0123456789"[..]).await.expect("put");
        assert_eq!(cache.size().await.expect("size"), 10);
        cache.clear().await.expect("clear");
        assert_eq!(cache.size().await.expect("size"), 0);
        assert!(!cache.exists("a", "1.0.0", "sha256-x"));
    }
}
