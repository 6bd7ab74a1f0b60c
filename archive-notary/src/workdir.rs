// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Scratch space for a run. */

use {
    crate::ArchiveNotaryError,
    chrono::{DateTime, Utc},
    log::warn,
    std::path::{Path, PathBuf},
};

/// Flatten a relative path into a single file name.
///
/// `ios-release/artifacts.zip` and `ios/artifacts.zip` share a basename, so the
/// directory components are folded into the name instead of dropped.
pub fn sanitize_path(path: &str) -> String {
    path.replace(['/', '\\'], "_")
}

/// Resolve the staging directory an archive is unpacked into.
///
/// `parent` is the directory holding the archive's working files: the run's
/// working directory for top-level archives or the parent's staging directory
/// for nested archives.
pub fn staging_path(parent: &Path, archive_path: &str) -> PathBuf {
    parent.join(format!("{}.staging", sanitize_path(archive_path)))
}

/// A per-run scratch directory holding downloaded archives and staging trees.
#[derive(Clone, Debug)]
pub struct WorkingDirectory {
    path: PathBuf,
}

impl WorkingDirectory {
    /// Create a new directory under `root` named after the run start time.
    pub fn create(root: &Path, started: DateTime<Utc>) -> Result<Self, ArchiveNotaryError> {
        std::fs::create_dir_all(root)?;

        let stem = started.format("%Y%m%d-%H%M%S").to_string();
        let mut candidate = root.join(&stem);
        let mut suffix = 0;

        loop {
            match std::fs::create_dir(&candidate) {
                Ok(()) => return Ok(Self { path: candidate }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    suffix += 1;
                    candidate = root.join(format!("{}-{}", stem, suffix));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Use an existing directory, e.g. one left behind by a failed run.
    ///
    /// Archives already downloaded into it are not downloaded again.
    pub fn reuse(path: impl AsRef<Path>) -> Result<Self, ArchiveNotaryError> {
        let path = path.as_ref();

        if path.is_dir() {
            Ok(Self {
                path: path.to_path_buf(),
            })
        } else {
            Err(ArchiveNotaryError::WorkingDirectoryMissing(
                path.to_path_buf(),
            ))
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the directory and everything in it.
    pub fn remove(self) -> Result<(), ArchiveNotaryError> {
        warn!("removing working directory {}", self.path.display());
        std::fs::remove_dir_all(&self.path)?;

        Ok(())
    }
}
