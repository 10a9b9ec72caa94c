//! Shared test fixtures: minimal ustar/tgz builders and an in-process
//! registry double.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;

use flate2::write::GzEncoder;
use flate2::Compression;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::integrity::{self, Algorithm};
use crate::manifest::PackageManifest;
use crate::registry::Registry;

const BLOCK: usize = 512;

/// Build a minimal ustar archive. Entries with a body become regular files;
/// entries without become directories.
pub(crate) fn tar_archive(entries: &[(&str, Option<&[u8]>)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, body) in entries {
        let mut block = [0u8; BLOCK];
        let name_bytes = name.as_bytes();
        block[..name_bytes.len()].copy_from_slice(name_bytes);
        let size = body.map(|b| b.len()).unwrap_or(0);
        let size_field = format!("{:011o}\0", size);
        block[124..124 + size_field.len()].copy_from_slice(size_field.as_bytes());
        block[156] = if body.is_some() { b'0' } else { b'5' };
        block[257..263].copy_from_slice(b"ustar\0");
        let checksum_seed: u32 = block
            .iter()
            .enumerate()
            .map(|(i, &b)| if (148..156).contains(&i) { 32u32 } else { b as u32 })
            .sum();
        let checksum = format!("{:06o}\0 ", checksum_seed);
        block[148..156].copy_from_slice(checksum.as_bytes());
        out.extend_from_slice(&block);
        if let Some(body) = body {
            out.extend_from_slice(body);
            let pad = body.len().div_ceil(BLOCK) * BLOCK - body.len();
            out.extend(std::iter::repeat(0u8).take(pad));
        }
    }
    out.extend_from_slice(&[0u8; BLOCK * 2]);
    out
}

pub(crate) fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("gzip write");
    encoder.finish().expect("gzip finish")
}

/// A gzipped npm-shaped tarball with a `package/` root folder.
pub(crate) fn package_tgz(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut entries: Vec<(&str, Option<&[u8]>)> = vec![("package/", None)];
    for (name, body) in files {
        entries.push((name, Some(body)));
    }
    gzip(&tar_archive(&entries))
}

/// In-process registry double. `add` publishes a version with a real
/// tarball whose integrity matches the manifest's dist block.
#[derive(Default)]
pub(crate) struct MockRegistry {
    versions: HashMap<String, Vec<String>>,
    manifests: HashMap<String, PackageManifest>,
    tarballs: HashMap<String, Vec<u8>>,
    pub(crate) calls: Mutex<Vec<String>>,
}

impl MockRegistry {
    pub(crate) fn add(&mut self, name: &str, version: &str, deps: &[(&str, &str)]) {
        self.add_with_manifest_extras(name, version, deps, "");
    }

    /// `extras` is spliced into the manifest JSON (for bin fields and such).
    pub(crate) fn add_with_manifest_extras(
        &mut self,
        name: &str,
        version: &str,
        deps: &[(&str, &str)],
        extras: &str,
    ) {
        let deps_json: Vec<String> =
            deps.iter().map(|(n, r)| format!("\"{}\": \"{}\"", n, r)).collect();
        let extras = if extras.is_empty() { String::new() } else { format!("{},", extras) };
        let published = format!(
            r#"{{"name": "{name}", "version": "{version}", {extras} "dependencies": {{{deps}}}}}"#,
            name = name,
            version = version,
            extras = extras,
            deps = deps_json.join(", ")
        );
        let tarball = package_tgz(&[("package/package.json", published.as_bytes())]);
        let spec_integrity = integrity::compute(&tarball, Algorithm::Sha512);

        let manifest_json = format!(
            r#"{{
                "name": "{name}", "version": "{version}", {extras}
                "dependencies": {{{deps}}},
                "dist": {{
                    "tarball": "https://registry.test/{name}/-/{name}-{version}.tgz",
                    "integrity": "{integrity}"
                }}
            }}"#,
            name = name,
            version = version,
            extras = extras,
            deps = deps_json.join(", "),
            integrity = spec_integrity
        );
        let spec = format!("{}@{}", name, version);
        self.versions.entry(name.to_string()).or_default().push(version.to_string());
        self.manifests
            .insert(spec.clone(), PackageManifest::parse(name, &manifest_json).expect("mock manifest"));
        self.tarballs.insert(spec, tarball);
    }

    /// Replace the stored tarball so it no longer matches its integrity.
    pub(crate) fn corrupt_tarball(&mut self, name: &str, version: &str) {
        let spec = format!("{}@{}", name, version);
        self.tarballs.insert(spec, b"corrupted bytes".to_vec());
    }

    /// Unpublish the manifest and tarball while the version stays listed:
    /// `versions` succeeds but the per-version fetches 404.
    pub(crate) fn drop_manifest(&mut self, name: &str, version: &str) {
        let spec = format!("{}@{}", name, version);
        self.manifests.remove(&spec);
        self.tarballs.remove(&spec);
    }

    fn log(&self, line: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(line);
        }
    }
}

impl Registry for MockRegistry {
    async fn versions(&self, name: &str, _ct: &CancellationToken) -> Result<Vec<String>> {
        self.log(format!("versions {}", name));
        self.versions
            .get(name)
            .cloned()
            .ok_or_else(|| Error::RegistryNotFound { package: name.to_string() })
    }

    async fn manifest(
        &self,
        name: &str,
        version: &str,
        _ct: &CancellationToken,
    ) -> Result<PackageManifest> {
        self.log(format!("manifest {}@{}", name, version));
        self.manifests
            .get(&format!("{}@{}", name, version))
            .cloned()
            .ok_or_else(|| Error::RegistryNotFound { package: format!("{}@{}", name, version) })
    }

    async fn integrity(&self, name: &str, version: &str, ct: &CancellationToken) -> Result<String> {
        Ok(self.manifest(name, version, ct).await?.dist_integrity().unwrap_or_default())
    }

    async fn tarball(&self, name: &str, version: &str, _ct: &CancellationToken) -> Result<Vec<u8>> {
        self.log(format!("tarball {}@{}", name, version));
        self.tarballs
            .get(&format!("{}@{}", name, version))
            .cloned()
            .ok_or_else(|| Error::RegistryNotFound { package: format!("{}@{}", name, version) })
    }
}
