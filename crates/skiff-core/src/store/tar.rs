//! Gzipped ustar extraction for npm tarballs.
//!
//! Headers are parsed at their fixed offsets: name at 0..100, size at
//! 124..136 (octal), typeflag at 156, linkname at 157..257, ustar prefix at
//! 345..500. Records are 512-byte aligned; two zero blocks end the archive.
//! GNU `L` records supply long names. Absolute entry names and `..`
//! components are rejected before anything touches the filesystem.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;

use crate::error::{Error, Result};

const BLOCK: usize = 512;

const NAME_RANGE: std::ops::Range<usize> = 0..100;
const SIZE_RANGE: std::ops::Range<usize> = 124..136;
const TYPEFLAG_OFFSET: usize = 156;
const LINKNAME_RANGE: std::ops::Range<usize> = 157..257;
const PREFIX_RANGE: std::ops::Range<usize> = 345..500;

/// One parsed archive entry.
#[derive(Debug)]
struct Header {
    name: String,
    size: u64,
    typeflag: u8,
    #[allow(dead_code)]
    linkname: String,
}

fn trimmed_field(block: &[u8], range: std::ops::Range<usize>) -> String {
    let raw = &block[range];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).to_string()
}

fn parse_octal(block: &[u8], range: std::ops::Range<usize>) -> Result<u64> {
    let text = trimmed_field(block, range);
    let text = text.trim_matches(|c: char| c == ' ' || c == '\0');
    if text.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(text, 8)
        .map_err(|_| Error::StoreIo { detail: format!("bad octal size field \"{}\"", text) })
}

fn parse_header(block: &[u8]) -> Result<Header> {
    let name = trimmed_field(block, NAME_RANGE);
    let prefix = trimmed_field(block, PREFIX_RANGE);
    let full_name = if prefix.is_empty() { name } else { format!("{}/{}", prefix, name) };
    Ok(Header {
        name: full_name,
        size: parse_octal(block, SIZE_RANGE)?,
        typeflag: block[TYPEFLAG_OFFSET],
        linkname: trimmed_field(block, LINKNAME_RANGE),
    })
}

/// Validate an entry name and turn it into a relative path under `dest`.
fn sanitize_entry_path(name: &str) -> Result<PathBuf> {
    let trimmed = name.trim_start_matches("./");
    if trimmed.starts_with('/') || trimmed.starts_with('\\') {
        return Err(Error::StoreIo {
            detail: format!("absolute path in archive entry \"{}\"", name),
        });
    }
    let path = PathBuf::from(trimmed);
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(Error::StoreIo {
                    detail: format!("path traversal in archive entry \"{}\"", name),
                });
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::StoreIo {
                    detail: format!("absolute path in archive entry \"{}\"", name),
                });
            }
        }
    }
    Ok(path)
}

fn is_zero_block(block: &[u8]) -> bool {
    block.iter().all(|&b| b == 0)
}

/// Extract a gzipped ustar archive into `dest`. Directories and regular
/// files are materialised; other entry types are skipped, which is correct
/// for the tarballs npm publishes.
pub fn extract_tgz(bytes: &[u8], dest: &Path) -> Result<()> {
    let mut decoder = GzDecoder::new(bytes);
    let mut data = Vec::new();
    decoder
        .read_to_end(&mut data)
        .map_err(|e| Error::StoreIo { detail: format!("gzip decode failed: {}", e) })?;

    std::fs::create_dir_all(dest).map_err(Error::store_io)?;

    let mut offset = 0usize;
    let mut pending_long_name: Option<String> = None;
    let mut zero_blocks = 0;

    while offset + BLOCK <= data.len() {
        let block = &data[offset..offset + BLOCK];
        offset += BLOCK;

        if is_zero_block(block) {
            zero_blocks += 1;
            if zero_blocks == 2 {
                break;
            }
            continue;
        }
        zero_blocks = 0;

        let mut header = parse_header(block)?;
        if let Some(long) = pending_long_name.take() {
            header.name = long;
        }

        let data_len = header.size as usize;
        let padded = data_len.div_ceil(BLOCK) * BLOCK;
        if offset + data_len > data.len() {
            return Err(Error::StoreIo {
                detail: format!("truncated archive entry \"{}\"", header.name),
            });
        }
        let body = &data[offset..offset + data_len];
        offset += padded;

        match header.typeflag {
            // GNU long name: the body holds the real name of the next entry.
            b'L' => {
                let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
                pending_long_name = Some(String::from_utf8_lossy(&body[..end]).to_string());
            }
            b'5' => {
                let rel = sanitize_entry_path(&header.name)?;
                std::fs::create_dir_all(dest.join(rel)).map_err(Error::store_io)?;
            }
            b'0' | 0 => {
                let rel = sanitize_entry_path(&header.name)?;
                if rel.as_os_str().is_empty() {
                    continue;
                }
                let target = dest.join(&rel);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(Error::store_io)?;
                }
                std::fs::write(&target, body).map_err(Error::store_io)?;
            }
            // Symlinks, hardlinks, fifos, devices: not part of npm tarballs.
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{gzip, package_tgz, tar_archive};

    #[test]
    fn extracts_directories_and_files() {
        let td = tempfile::tempdir().expect("tmp");
        let tgz = package_tgz(&[
            ("package/package.json", br#"{"name":"a","version":"1.0.0"}"#),
            ("package/lib/index.js", b"module.exports = 1;\n"),
        ]);
        extract_tgz(&tgz, td.path()).expect("extract");

        let manifest = std::fs::read_to_string(td.path().join("package/package.json")).expect("read");
        assert!(manifest.contains("\"name\":\"a\""));
        assert_eq!(
            std::fs::read(td.path().join("package/lib/index.js")).expect("read"),
            b"module.exports = 1;\n"
        );
    }

    #[test]
    fn rejects_path_traversal() {
        let td = tempfile::tempdir().expect("tmp");
        let tgz = gzip(&tar_archive(&[("package/../../evil.txt", Some(b"owned" as &[u8]))]));
        let err = extract_tgz(&tgz, td.path()).unwrap_err();
        assert!(matches!(err, Error::StoreIo { .. }));
        assert!(!td.path().join("../evil.txt").exists());
    }

    #[test]
    fn rejects_absolute_paths() {
        let td = tempfile::tempdir().expect("tmp");
        let tgz = gzip(&tar_archive(&[("/etc/evil", Some(b"owned" as &[u8]))]));
        assert!(extract_tgz(&tgz, td.path()).is_err());
    }

    #[test]
    fn truncated_archive_is_an_error() {
        let td = tempfile::tempdir().expect("tmp");
        let mut tar = tar_archive(&[("package/a.txt", Some(b"0123456789" as &[u8]))]);
        tar.truncate(BLOCK + 4); // header plus a sliver of body
        let err = extract_tgz(&gzip(&tar), td.path()).unwrap_err();
        assert!(matches!(err, Error::StoreIo { .. }));
    }

    #[test]
    fn not_gzip_is_an_error() {
        let td = tempfile::tempdir().expect("tmp");
        assert!(extract_tgz(b"plainly not gzip", td.path()).is_err());
    }
}
