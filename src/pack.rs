//! # Content Pack Staging
//!
//! A content pack is a gzip-compressed tar archive holding one read-only
//! unit of rootfs content. The composer does not hand archives to the
//! kernel; a [`PackServer`] verifies the archive, stages its contents into
//! a private read-only tree, and serves that tree as an overlay lower
//! directory until the owning layer context is destroyed.
//!
//! ## Verification
//!
//! - Archive size is bounded by [`MAX_PACK_SIZE`] before extraction starts.
//! - Extracted size accumulates against [`MAX_PACK_EXTRACTED_SIZE`].
//! - Entry count is bounded by [`MAX_PACK_ENTRIES`].
//! - Entry paths containing `..` or starting with `/` are rejected.
//!
//! A failed extraction removes the partial staging tree; the composer then
//! rolls back the rest of the composition.

use crate::constants::{MAX_PACK_ENTRIES, MAX_PACK_EXTRACTED_SIZE, MAX_PACK_SIZE};
use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::Archive;
use tracing::{debug, warn};

/// Serves one content pack as a staged read-only tree.
///
/// Started by the composer during `compose`, stopped during `destroy` in
/// reverse composition order. The staging tree lives under the layer
/// context's scratch directory and is removed on stop.
#[derive(Debug)]
pub struct PackServer {
    /// Archive the tree was staged from.
    archive: PathBuf,
    /// Root of the staged tree.
    root: PathBuf,
    /// Hex SHA-256 of the archive bytes.
    digest: String,
}

impl PackServer {
    /// Verifies `archive` and stages its contents under `staging`.
    pub fn start(archive: &Path, staging: &Path) -> Result<Self> {
        let digest = pack_digest(archive)?;
        debug!(
            "staging pack {} (sha256:{})",
            archive.display(),
            digest
        );

        if let Err(e) = stage_pack(archive, staging) {
            // Partial staging is useless; remove it before reporting.
            let _ = fs::remove_dir_all(staging);
            return Err(e);
        }

        Ok(Self {
            archive: archive.to_path_buf(),
            root: staging.to_path_buf(),
            digest,
        })
    }

    /// Root of the staged tree, used as an overlay lower directory.
    pub fn serve_root(&self) -> &Path {
        &self.root
    }

    /// Archive this server stages.
    pub fn archive(&self) -> &Path {
        &self.archive
    }

    /// Hex SHA-256 of the archive bytes.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Stops serving and removes the staged tree.
    pub fn stop(self) {
        if let Err(e) = fs::remove_dir_all(&self.root) {
            warn!(
                "failed to remove pack staging {}: {}",
                self.root.display(),
                e
            );
        }
    }
}

/// Computes the hex SHA-256 of a pack archive.
pub fn pack_digest(archive: &Path) -> Result<String> {
    let mut file = fs::File::open(archive).map_err(|e| Error::PackInvalid {
        path: archive.to_path_buf(),
        reason: format!("cannot open archive: {}", e),
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Writes a gzip tar pack from the contents of `dir`.
///
/// Used by the build driver to produce package artifacts; entries are
/// rooted at the directory itself so extraction recreates the tree.
pub fn write_pack(dir: &Path, archive: &Path) -> Result<String> {
    let file = fs::File::create(archive)?;
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", dir)?;
    builder
        .into_inner()
        .and_then(|gz| gz.finish())
        .map_err(Error::Io)?;
    pack_digest(archive)
}

/// Verifies and extracts a pack into `dest` without tracking it as a
/// served layer. Used for package mounts, where the tree lives until the
/// package is unmounted. Extracting over an existing tree succeeds.
pub fn stage_pack(archive: &Path, dest: &Path) -> Result<()> {
    let meta = fs::metadata(archive).map_err(|e| Error::PackInvalid {
        path: archive.to_path_buf(),
        reason: format!("cannot stat archive: {}", e),
    })?;
    if meta.len() > MAX_PACK_SIZE {
        return Err(Error::PackInvalid {
            path: archive.to_path_buf(),
            reason: format!("archive is {} bytes, limit {}", meta.len(), MAX_PACK_SIZE),
        });
    }
    fs::create_dir_all(dest)?;
    extract_pack(archive, dest)
}

/// Reads the `chef.json` manifest entry from a pack archive.
pub fn read_manifest(archive: &Path) -> Result<crate::install::PackManifest> {
    let file = fs::File::open(archive).map_err(|e| Error::PackInvalid {
        path: archive.to_path_buf(),
        reason: format!("cannot open archive: {}", e),
    })?;
    let decoder = GzDecoder::new(file);
    let mut tar = Archive::new(decoder);

    for entry in tar.entries().map_err(|e| Error::PackInvalid {
        path: archive.to_path_buf(),
        reason: format!("unreadable archive: {}", e),
    })? {
        let mut entry = entry.map_err(|e| Error::PackInvalid {
            path: archive.to_path_buf(),
            reason: format!("corrupt entry: {}", e),
        })?;
        let is_manifest = entry
            .path()
            .map(|p| p.file_name().map(|n| n == "chef.json").unwrap_or(false) && p.components().count() <= 2)
            .unwrap_or(false);
        if !is_manifest {
            continue;
        }
        let mut data = String::new();
        entry.read_to_string(&mut data).map_err(|e| Error::PackInvalid {
            path: archive.to_path_buf(),
            reason: format!("manifest unreadable: {}", e),
        })?;
        return serde_json::from_str(&data).map_err(|e| Error::PackInvalid {
            path: archive.to_path_buf(),
            reason: format!("manifest invalid: {}", e),
        });
    }

    Err(Error::PackInvalid {
        path: archive.to_path_buf(),
        reason: "no chef.json manifest in pack".into(),
    })
}

fn extract_pack(archive: &Path, staging: &Path) -> Result<()> {
    let file = fs::File::open(archive).map_err(|e| Error::PackInvalid {
        path: archive.to_path_buf(),
        reason: format!("cannot open archive: {}", e),
    })?;
    let decoder = GzDecoder::new(file);
    let mut tar = Archive::new(decoder);

    let mut total_size = 0u64;
    let mut entries = 0usize;

    for entry in tar.entries().map_err(|e| Error::PackInvalid {
        path: archive.to_path_buf(),
        reason: format!("unreadable archive: {}", e),
    })? {
        let mut entry = entry.map_err(|e| Error::PackInvalid {
            path: archive.to_path_buf(),
            reason: format!("corrupt entry: {}", e),
        })?;

        let path = entry.path().map_err(|e| Error::PackInvalid {
            path: archive.to_path_buf(),
            reason: format!("bad entry path: {}", e),
        })?;

        let path_str = path.to_string_lossy();
        if path_str.contains("..") || path_str.starts_with('/') {
            return Err(Error::PackInvalid {
                path: archive.to_path_buf(),
                reason: format!("path traversal in entry: {}", path_str),
            });
        }

        entries += 1;
        if entries > MAX_PACK_ENTRIES {
            return Err(Error::PackInvalid {
                path: archive.to_path_buf(),
                reason: format!("more than {} entries", MAX_PACK_ENTRIES),
            });
        }

        total_size += entry.size();
        if total_size > MAX_PACK_EXTRACTED_SIZE {
            return Err(Error::PackInvalid {
                path: archive.to_path_buf(),
                reason: format!(
                    "extracted size exceeds {} bytes",
                    MAX_PACK_EXTRACTED_SIZE
                ),
            });
        }

        entry.unpack_in(staging).map_err(|e| Error::PackInvalid {
            path: archive.to_path_buf(),
            reason: format!("extraction failed: {}", e),
        })?;
    }

    debug!(
        "staged {} entries ({} bytes) at {}",
        entries,
        total_size,
        staging.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn make_pack(dir: &Path, files: &[(&str, &str)]) -> PathBuf {
        let content = dir.join("content");
        for (name, body) in files {
            let path = content.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            let mut f = fs::File::create(&path).unwrap();
            f.write_all(body.as_bytes()).unwrap();
        }
        let archive = dir.join("test.pack");
        write_pack(&content, &archive).unwrap();
        archive
    }

    #[test]
    fn test_pack_stage_roundtrip() {
        let temp = TempDir::new().unwrap();
        let archive = make_pack(temp.path(), &[("usr/bin/tool", "tool-bytes")]);

        let staging = temp.path().join("staging");
        let server = PackServer::start(&archive, &staging).unwrap();
        let staged = server.serve_root().join("usr/bin/tool");
        assert_eq!(fs::read_to_string(&staged).unwrap(), "tool-bytes");
        assert_eq!(server.digest().len(), 64);

        server.stop();
        assert!(!staging.exists());
    }

    #[test]
    fn test_pack_digest_stable() {
        let temp = TempDir::new().unwrap();
        let archive = make_pack(temp.path(), &[("a", "x")]);
        let d1 = pack_digest(&archive).unwrap();
        let d2 = pack_digest(&archive).unwrap();
        assert_eq!(d1, d2);
    }

    #[test]
    fn test_pack_missing_archive() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("no-such.pack");
        let staging = temp.path().join("staging");
        assert!(PackServer::start(&missing, &staging).is_err());
    }

    #[test]
    fn test_read_manifest() {
        let temp = TempDir::new().unwrap();
        let manifest = r#"{"revision": 7, "commands": []}"#;
        let archive = make_pack(temp.path(), &[("chef.json", manifest), ("bin/hello", "x")]);
        let parsed = read_manifest(&archive).unwrap();
        assert_eq!(parsed.revision, 7);

        let temp2 = TempDir::new().unwrap();
        let bare = make_pack(temp2.path(), &[("bin/hello", "x")]);
        assert!(read_manifest(&bare).is_err());
    }

    #[test]
    fn test_pack_rejects_traversal() {
        let temp = TempDir::new().unwrap();
        // Hand-build an archive containing a `..` entry.
        let archive = temp.path().join("evil.pack");
        let file = fs::File::create(&archive).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let data = b"owned";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        // `append_data`/`set_path` reject `..`, so write the traversal name
        // directly into the raw GNU header name field before checksumming.
        let name = b"../escape";
        header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
        header.set_cksum();
        builder.append(&header, &data[..]).unwrap();
        builder.into_inner().and_then(|gz| gz.finish()).unwrap();

        let staging = temp.path().join("staging");
        let err = PackServer::start(&archive, &staging).unwrap_err();
        assert!(matches!(err, Error::PackInvalid { .. }));
        assert!(!staging.exists());
    }
}
