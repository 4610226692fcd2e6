//! Artifact archive handling.

use std::fs::File;
use std::path::Path;

use flate2::read::GzDecoder;

use crate::error::{Result, StoreError};

/// Unpacks a gzipped tarball into `dest`, creating it if needed.
///
/// Entries with path traversal components are rejected by the tar crate's
/// sanitized unpacking.
///
/// # Errors
///
/// Returns an error if the archive cannot be read or unpacked.
pub fn unpack_tar_gz(archive: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest).map_err(|e| StoreError::Io {
        path: dest.to_path_buf(),
        source: e,
    })?;

    let file = File::open(archive).map_err(|e| StoreError::Io {
        path: archive.to_path_buf(),
        source: e,
    })?;

    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.unpack(dest).map_err(|e| StoreError::Unarchive {
        archive: archive.to_path_buf(),
        reason: e.to_string(),
    })?;

    tracing::debug!(archive = ?archive, dest = ?dest, "unpacked artifact archive");
    Ok(())
}
