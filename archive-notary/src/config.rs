// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Run configuration.

Credentials come from environment variables so they stay out of manifests and
shell history. Everything else has a default that can be overridden from the
command line.
*/

use {
    crate::{notary::SubmitPolicy, scheduler::PollPolicy, ArchiveNotaryError},
    log::{info, warn},
    std::path::{Path, PathBuf},
};

/// Environment variable holding the Apple ID used for notarization.
pub const USERNAME_ENV_VARIABLE: &str = "CODESIGN_USERNAME";

/// Environment variable holding the name of the signing certificate.
pub const CERT_NAME_ENV_VARIABLE: &str = "CODESIGN_CERT_NAME";

/// Environment variable holding the app-specific password for the Apple ID.
pub const PASSWORD_ENV_VARIABLE: &str = "APP_SPECIFIC_PASSWORD";

/// Environment variable overriding the primary bundle ID sent with submissions.
pub const PRIMARY_BUNDLE_ID_ENV_VARIABLE: &str = "CODESIGN_PRIMARY_BUNDLE_ID";

pub const DEFAULT_PRIMARY_BUNDLE_ID: &str = "com.example.arbitrary";

/// Storage location archives are downloaded from.
pub const DEFAULT_REMOTE_BASE: &str = "gs://flutter_infra/flutter";

/// Entitlements applied to binaries listed under `files_with_entitlements`.
const DEFAULT_ENTITLEMENTS: &[&str] = &[
    "com.apple.security.cs.allow-jit",
    "com.apple.security.cs.allow-unsigned-executable-memory",
];

/// Identity and account settings for signing and notarization.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Credentials {
    /// Name of the certificate `codesign -s` signs with.
    pub signing_identity: String,

    /// Apple ID the notary service is accessed with.
    pub username: String,

    /// Name of the environment variable holding the app-specific password.
    ///
    /// The notary CLI dereferences it itself, so the password is never placed
    /// on a command line.
    pub password_env: String,

    pub primary_bundle_id: String,
}

impl Credentials {
    /// Resolve credentials from the process environment.
    pub fn from_env() -> Result<Self, ArchiveNotaryError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve credentials through an arbitrary variable lookup.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ArchiveNotaryError> {
        let require = |key: &'static str| {
            lookup(key)
                .filter(|value| !value.is_empty())
                .ok_or(ArchiveNotaryError::MissingEnvironmentVariable(key))
        };

        let username = require(USERNAME_ENV_VARIABLE)?;
        let signing_identity = require(CERT_NAME_ENV_VARIABLE)?;
        require(PASSWORD_ENV_VARIABLE)?;

        Ok(Self {
            signing_identity,
            username,
            password_env: PASSWORD_ENV_VARIABLE.to_string(),
            primary_bundle_id: lookup(PRIMARY_BUNDLE_ID_ENV_VARIABLE)
                .unwrap_or_else(|| DEFAULT_PRIMARY_BUNDLE_ID.to_string()),
        })
    }

    /// The `--password` value understood by `altool`.
    pub fn password_reference(&self) -> String {
        format!("@env:{}", self.password_env)
    }
}

/// Names of the external programs invoked.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ToolPrograms {
    pub transfer: String,
    pub zip: String,
    pub unzip: String,
    pub codesign: String,
    pub xcrun: String,
}

impl Default for ToolPrograms {
    fn default() -> Self {
        Self {
            transfer: "gsutil".into(),
            zip: "zip".into(),
            unzip: "unzip".into(),
            codesign: "codesign".into(),
            xcrun: "xcrun".into(),
        }
    }
}

impl ToolPrograms {
    /// Programs needed to process archives.
    pub fn processing_programs(&self) -> Vec<&str> {
        vec![
            self.transfer.as_str(),
            self.zip.as_str(),
            self.unzip.as_str(),
            self.codesign.as_str(),
            self.xcrun.as_str(),
        ]
    }

    /// Ensure each of the given programs can be found.
    pub fn verify_installed<'a>(
        programs: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), ArchiveNotaryError> {
        for program in programs {
            let path = which::which(program)
                .map_err(|_| ArchiveNotaryError::ToolNotFound(program.to_string()))?;
            info!("using {} at {}", program, path.display());
        }

        Ok(())
    }
}

/// Settings for processing a manifest.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    /// Storage prefix archives are downloaded from.
    pub remote_base: String,

    /// Storage prefix signed archives are published to.
    ///
    /// Defaults to `remote_base`, replacing the unsigned originals.
    pub publish_base: Option<String>,

    /// Directory per-run working directories are created in.
    pub work_root: PathBuf,

    /// Directory per-run log directories are created in.
    pub log_root: PathBuf,

    pub entitlements_path: PathBuf,

    pub submit: SubmitPolicy,

    pub poll: PollPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            remote_base: DEFAULT_REMOTE_BASE.to_string(),
            publish_base: None,
            work_root: PathBuf::from("work"),
            log_root: PathBuf::from("logs"),
            entitlements_path: PathBuf::from("Entitlements.plist"),
            submit: SubmitPolicy::default(),
            poll: PollPolicy::default(),
        }
    }
}

impl PipelineSettings {
    /// Remote URI a signed top-level archive is uploaded to.
    pub fn publish_uri(&self, commit: &str, spec_path: &str) -> String {
        remote_uri(
            self.publish_base.as_deref().unwrap_or(&self.remote_base),
            commit,
            spec_path,
        )
    }
}

/// Join a storage base, revision, and relative archive path.
pub fn remote_uri(base: &str, commit: &str, path: &str) -> String {
    format!("{}/{}/{}", base.trim_end_matches('/'), commit, path)
}

/// Write the default entitlements plist if `path` does not exist.
///
/// Returns whether the file was written.
pub fn ensure_entitlements_file(path: &Path) -> Result<bool, ArchiveNotaryError> {
    if path.is_file() {
        return Ok(false);
    }

    warn!("writing entitlements to {}", path.display());

    let mut dict = plist::Dictionary::new();
    for key in DEFAULT_ENTITLEMENTS {
        dict.insert(key.to_string(), plist::Value::Boolean(true));
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    plist::Value::Dictionary(dict).to_file_xml(path)?;

    Ok(true)
}
