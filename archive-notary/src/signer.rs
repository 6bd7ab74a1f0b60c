// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Recursive signing of nested zip archives.

Processing an archive:

1. Download it (top-level archives only) unless a previous run already did.
2. Unpack it into a staging directory next to it.
3. Confirm every listed binary and nested archive exists in the staging
   directory. A missing entry aborts the run before anything is signed.
4. Sign the listed binaries, entitlement-less entries first. Nested archives
   are processed recursively at this point, relative to the staging
   directory, and are repacked before the parent continues.
5. Update the archive in place from the staging directory.
6. Delete the staging directory.

Only top-level archives are handed to notarization. A nested archive is just
another member of its parent by the time the parent is repacked.
*/

use {
    crate::{
        config::remote_uri,
        manifest::{ArchiveSpec, FileRef},
        run_log::{ListingStage, RunLog, RunLogDirectory},
        tools::{file_sha256, zip_members, DownloadResult, Toolchain, UnpackResult, ZipMember},
        workdir::{sanitize_path, staging_path},
        ArchiveNotaryError,
    },
    std::{
        fmt::{Display, Formatter},
        path::{Path, PathBuf},
    },
};

/// Why an archive was skipped.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SkipReason {
    /// The transfer tool could not fetch the archive.
    DownloadFailed {
        remote: String,
        exit_code: Option<i32>,
    },

    /// The downloaded file could not be unpacked.
    UnpackFailed {
        archive: PathBuf,
        exit_code: Option<i32>,
    },
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DownloadFailed { remote, exit_code } => {
                write!(f, "download of {} failed (exit code {:?})", remote, exit_code)
            }
            Self::UnpackFailed { archive, exit_code } => {
                write!(
                    f,
                    "unzip of {} failed (exit code {:?})",
                    archive.display(),
                    exit_code
                )
            }
        }
    }
}

/// Result of processing a top-level archive.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProcessOutcome {
    /// The archive was signed and repacked at this path.
    Packed(PathBuf),

    /// The archive was not processed. The run continues with other archives.
    Skipped(SkipReason),
}

/// Signs the binaries inside archives described by [ArchiveSpec].
pub struct ArchiveSigner<'a> {
    tools: &'a Toolchain<'a>,
    listings: Option<&'a RunLogDirectory>,
}

impl<'a> ArchiveSigner<'a> {
    pub fn new(tools: &'a Toolchain<'a>) -> Self {
        Self {
            tools,
            listings: None,
        }
    }

    /// Record member listings of every processed archive in a run log directory.
    pub fn with_listings(mut self, directory: &'a RunLogDirectory) -> Self {
        self.listings = Some(directory);
        self
    }

    /// Download, sign, and repack a top-level archive.
    ///
    /// The archive is fetched from `<remote_base>/<commit>/<spec.path>` into
    /// `work_dir`. Download and unpack failures skip the archive. Everything
    /// else that goes wrong is fatal.
    pub fn process_archive(
        &self,
        spec: &ArchiveSpec,
        remote_base: &str,
        commit: &str,
        work_dir: &Path,
        log: &mut RunLog,
    ) -> Result<ProcessOutcome, ArchiveNotaryError> {
        let remote = remote_uri(remote_base, commit, &spec.path);
        let local = work_dir.join(sanitize_path(&spec.path));

        log.info(format!("downloading {}", remote));
        match self.tools.download(&remote, &local)? {
            DownloadResult::Fetched => {}
            DownloadResult::AlreadyPresent => {
                log.info(format!("reusing previous download {}", local.display()));
            }
            DownloadResult::Failed(exit_code) => {
                let reason = SkipReason::DownloadFailed { remote, exit_code };
                log.error(format!("skipping {}: {}", spec.path, reason));
                return Ok(ProcessOutcome::Skipped(reason));
            }
        }

        let staging = staging_path(work_dir, &spec.path);

        match self.sign_archive(spec, &spec.path, &local, &staging, log)? {
            UnpackResult::Unpacked => Ok(ProcessOutcome::Packed(local)),
            UnpackResult::Failed(exit_code) => {
                let reason = SkipReason::UnpackFailed {
                    archive: local,
                    exit_code,
                };
                log.error(format!("skipping {}: {}", spec.path, reason));
                Ok(ProcessOutcome::Skipped(reason))
            }
        }
    }

    /// Process an archive located inside its parent's staging directory.
    fn process_nested(
        &self,
        spec: &ArchiveSpec,
        parent_label: &str,
        parent_staging: &Path,
        log: &mut RunLog,
    ) -> Result<(), ArchiveNotaryError> {
        let label = format!("{}/{}", parent_label, spec.path);
        let archive = parent_staging.join(&spec.path);
        let staging = staging_path(parent_staging, &spec.path);

        log.info(format!("processing nested archive {}", label));

        match self.sign_archive(spec, &label, &archive, &staging, log)? {
            UnpackResult::Unpacked => Ok(()),
            UnpackResult::Failed(_) => Err(ArchiveNotaryError::NestedArchiveUnpack(label)),
        }
    }

    /// Unpack, validate, sign, and repack a local archive.
    ///
    /// An archive that could not be unpacked is left untouched.
    fn sign_archive(
        &self,
        spec: &ArchiveSpec,
        label: &str,
        archive: &Path,
        staging: &Path,
        log: &mut RunLog,
    ) -> Result<UnpackResult, ArchiveNotaryError> {
        log.info(format!("beginning processing of {}", label));
        log.info(format!(
            "sha256 of {} before signing: {}",
            label,
            file_sha256(archive)?
        ));

        if staging.exists() {
            std::fs::remove_dir_all(staging)?;
        }

        log.info(format!("unzipping {} to {}", label, staging.display()));
        if let UnpackResult::Failed(exit_code) = self.tools.unpack(archive, staging)? {
            if staging.exists() {
                std::fs::remove_dir_all(staging)?;
            }
            return Ok(UnpackResult::Failed(exit_code));
        }

        let before = self.capture_listing(label, archive, ListingStage::BeforeSigning, log)?;

        log.info(format!("validating config for {}", label));
        validate_entries(spec, label, staging)?;

        log.info(format!("signing binaries in {}", label));
        for (entry, with_entitlements) in spec.entries() {
            match entry {
                FileRef::Plain(path) => {
                    let binary = staging.join(path);
                    log.info(format!(
                        "signing {}{}",
                        binary.display(),
                        if with_entitlements {
                            " with entitlements"
                        } else {
                            ""
                        }
                    ));
                    self.tools.sign(&binary, with_entitlements)?;
                }
                FileRef::Nested(nested) => {
                    self.process_nested(nested, label, staging, log)?;
                }
            }
        }

        log.info(format!("zipping signed files into {}", archive.display()));
        self.tools.repack(archive, staging)?;

        let after = self.capture_listing(label, archive, ListingStage::AfterSigning, log)?;
        if let (Some(before), Some(after)) = (before, after) {
            if member_names(&before) != member_names(&after) {
                log.warn(format!(
                    "member list of {} changed during signing ({} before, {} after)",
                    label,
                    before.len(),
                    after.len()
                ));
            }
        }

        log.info(format!(
            "sha256 of {} after signing: {}",
            label,
            file_sha256(archive)?
        ));

        std::fs::remove_dir_all(staging)?;

        Ok(UnpackResult::Unpacked)
    }

    /// Read an archive's members and persist them if a listing directory is set.
    ///
    /// Listing is informational: an unreadable archive is reported, not fatal.
    fn capture_listing(
        &self,
        label: &str,
        archive: &Path,
        stage: ListingStage,
        log: &mut RunLog,
    ) -> Result<Option<Vec<ZipMember>>, ArchiveNotaryError> {
        let members = match zip_members(archive) {
            Ok(members) => members,
            Err(e) => {
                log.warn(format!("unable to list members of {}: {}", label, e));
                return Ok(None);
            }
        };

        if let Some(directory) = self.listings {
            let lines = members.iter().map(|m| m.to_string()).collect::<Vec<_>>();
            directory.write_listing(label, stage, &lines)?;
        }

        Ok(Some(members))
    }
}

fn member_names(members: &[ZipMember]) -> Vec<&str> {
    members.iter().map(|m| m.name.as_str()).collect()
}

/// Confirm every entry of a spec exists in its unpacked archive.
fn validate_entries(
    spec: &ArchiveSpec,
    label: &str,
    staging: &Path,
) -> Result<(), ArchiveNotaryError> {
    for (entry, _) in spec.entries() {
        let path = match entry {
            FileRef::Plain(path) => path,
            FileRef::Nested(nested) => &nested.path,
        };

        if !staging.join(path).is_file() {
            return Err(ArchiveNotaryError::ConfigIntegrity {
                archive: label.to_string(),
                path: path.clone(),
            });
        }
    }

    Ok(())
}
