// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Typed wrappers around the storage, zip, and codesign tools.

Each operation maps the raw exit status of its tool onto the outcome the
pipeline cares about. Downloads and unpacks report failure as a value so the
caller can skip the archive. Signing, repacking, and uploading have no skip
policy and return [ArchiveNotaryError::ToolInvocation] on failure.
*/

use {
    crate::{
        command::{CommandOutput, CommandRunner, Invocation},
        config::ToolPrograms,
        scheduler::ArtifactPublisher,
        ArchiveNotaryError,
    },
    log::{error, warn},
    sha2::Digest,
    std::{
        fmt::{Display, Formatter},
        fs::File,
        io::Read,
        path::{Path, PathBuf},
    },
};

/// Outcome of a download attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DownloadResult {
    /// The transfer tool fetched the file.
    Fetched,

    /// The destination already existed so nothing was transferred.
    AlreadyPresent,

    /// The transfer tool exited with an error.
    Failed(Option<i32>),
}

/// Outcome of an unpack attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UnpackResult {
    Unpacked,

    /// The unpack tool exited with an error.
    Failed(Option<i32>),
}

/// A member of a zip archive.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ZipMember {
    pub name: String,
    pub size: u64,
    pub crc32: u32,
}

impl Display for ZipMember {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x} {:>12} {}", self.crc32, self.size, self.name)
    }
}

/// Read the member list of a zip file.
pub fn zip_members(path: &Path) -> Result<Vec<ZipMember>, ArchiveNotaryError> {
    let mut archive = zip::ZipArchive::new(File::open(path)?)?;

    let mut members = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let file = archive.by_index(index)?;
        members.push(ZipMember {
            name: file.name().to_string(),
            size: file.size(),
            crc32: file.crc32(),
        });
    }

    Ok(members)
}

/// Compute the hex encoded SHA-256 of a file.
pub fn file_sha256(path: &Path) -> Result<String, ArchiveNotaryError> {
    let mut fh = File::open(path)?;
    let mut hasher = sha2::Sha256::new();
    let mut buffer = [0u8; 16384];

    loop {
        let count = fh.read(&mut buffer)?;
        if count == 0 {
            break;
        }

        hasher.update(&buffer[0..count]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Runs the external tools involved in signing an archive.
pub struct Toolchain<'a> {
    runner: &'a dyn CommandRunner,
    programs: ToolPrograms,
    signing_identity: String,
    entitlements_path: PathBuf,
}

impl<'a> Toolchain<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        programs: ToolPrograms,
        signing_identity: impl ToString,
        entitlements_path: impl AsRef<Path>,
    ) -> Self {
        Self {
            runner,
            programs,
            signing_identity: signing_identity.to_string(),
            entitlements_path: entitlements_path.as_ref().to_path_buf(),
        }
    }

    fn run(&self, invocation: Invocation) -> Result<CommandOutput, ArchiveNotaryError> {
        self.runner.run(&invocation)
    }

    /// Copy a remote object to a local path unless the local path exists.
    pub fn download(
        &self,
        remote: &str,
        local: &Path,
    ) -> Result<DownloadResult, ArchiveNotaryError> {
        if local.is_file() {
            warn!("{} already exists, skipping download", local.display());
            return Ok(DownloadResult::AlreadyPresent);
        }

        let output = self.run(Invocation::new(
            &self.programs.transfer,
            ["cp".to_string(), remote.to_string(), local.display().to_string()],
        ))?;

        if output.success() {
            Ok(DownloadResult::Fetched)
        } else {
            error!("download of {} failed", remote);
            // A failed transfer can leave a partial file that would otherwise be
            // mistaken for a completed download on the next run.
            if local.is_file() {
                std::fs::remove_file(local)?;
            }
            Ok(DownloadResult::Failed(output.exit_code))
        }
    }

    /// Copy a local file to a remote location.
    pub fn upload(&self, local: &Path, remote: &str) -> Result<(), ArchiveNotaryError> {
        let output = self.run(Invocation::new(
            &self.programs.transfer,
            ["cp".to_string(), local.display().to_string(), remote.to_string()],
        ))?;

        if output.success() {
            Ok(())
        } else {
            Err(ArchiveNotaryError::tool_invocation(
                &self.programs.transfer,
                format!("uploading {}", local.display()),
                output.exit_code,
            ))
        }
    }

    /// Extract an archive into a directory.
    pub fn unpack(
        &self,
        archive: &Path,
        dest: &Path,
    ) -> Result<UnpackResult, ArchiveNotaryError> {
        let output = self.run(Invocation::new(
            &self.programs.unzip,
            [
                "-o".to_string(),
                archive.display().to_string(),
                "-d".to_string(),
                dest.display().to_string(),
            ],
        ))?;

        if output.success() {
            Ok(UnpackResult::Unpacked)
        } else {
            error!(
                "unzip of {} exited with {:?}",
                archive.display(),
                output.exit_code
            );
            Ok(UnpackResult::Failed(output.exit_code))
        }
    }

    /// Update an existing archive in place from the contents of a directory.
    ///
    /// Symlinks are stored as links. Members not present in `source_dir` are
    /// left untouched. Directories get no entries of their own, so an archive
    /// that had none keeps its member list.
    pub fn repack(&self, archive: &Path, source_dir: &Path) -> Result<(), ArchiveNotaryError> {
        let archive = std::fs::canonicalize(archive)?;

        let output = self.run(
            Invocation::new(
                &self.programs.zip,
                [
                    "--symlinks".to_string(),
                    "-D".to_string(),
                    "-r".to_string(),
                    archive.display().to_string(),
                    ".".to_string(),
                ],
            )
            .current_dir(source_dir),
        )?;

        if output.success() {
            Ok(())
        } else {
            Err(ArchiveNotaryError::tool_invocation(
                &self.programs.zip,
                format!("updating {}", archive.display()),
                output.exit_code,
            ))
        }
    }

    /// Sign a binary in place with the hardened runtime and a secure timestamp.
    pub fn sign(&self, path: &Path, with_entitlements: bool) -> Result<(), ArchiveNotaryError> {
        let mut args = vec![
            "-f".to_string(),
            "-s".to_string(),
            self.signing_identity.clone(),
            path.display().to_string(),
            "--timestamp".to_string(),
            "--options=runtime".to_string(),
        ];

        if with_entitlements {
            args.push("--entitlements".to_string());
            args.push(self.entitlements_path.display().to_string());
        }

        let output = self.run(Invocation::new(&self.programs.codesign, args))?;

        if output.success() {
            Ok(())
        } else {
            Err(ArchiveNotaryError::tool_invocation(
                &self.programs.codesign,
                format!("signing {}", path.display()),
                output.exit_code,
            ))
        }
    }
}

impl<'a> ArtifactPublisher for Toolchain<'a> {
    fn publish(&self, local: &Path, destination: &str) -> Result<(), ArchiveNotaryError> {
        self.upload(local, destination)
    }
}
