// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {std::path::PathBuf, thiserror::Error};

/// Unified error type for archive signing and notarization.
///
/// Every variant is fatal to a run. Archives that can be skipped are reported
/// through [crate::ProcessOutcome] instead.
#[derive(Debug, Error)]
pub enum ArchiveNotaryError {
    #[error("unknown command")]
    CliUnknownCommand,

    #[error("bad argument: {0}")]
    CliBadArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("error writing entitlements plist: {0}")]
    Plist(#[from] plist::Error),

    #[error("please provide the environment variable {0}")]
    MissingEnvironmentVariable(&'static str),

    #[error("you don't appear to have \"{0}\" installed")]
    ToolNotFound(String),

    #[error("invalid archive manifest: {0}")]
    ManifestInvalid(String),

    #[error("unknown side manifest: {0}")]
    UnknownSideManifest(String),

    #[error("cannot find file {path} listed in config for {archive}")]
    ConfigIntegrity { archive: String, path: String },

    #[error("unable to unpack nested archive {0}")]
    NestedArchiveUnpack(String),

    #[error("{program} failed while {action} (exit code {code:?})")]
    ToolInvocation {
        program: String,
        action: String,
        code: Option<i32>,
    },

    #[error("unrecognized output from command: {0}")]
    ServiceProtocol(String),

    #[error("notarization of request {request_id} failed with status \"{status}\"")]
    NotarizationRejected { request_id: String, status: String },

    #[error("no notarization request ID after {0} submission attempts")]
    SubmitRetriesExhausted(u32),

    #[error("working directory does not exist: {0}")]
    WorkingDirectoryMissing(PathBuf),
}

impl ArchiveNotaryError {
    /// Construct a [Self::ToolInvocation] from a finished command.
    pub fn tool_invocation(
        program: impl ToString,
        action: impl ToString,
        code: Option<i32>,
    ) -> Self {
        Self::ToolInvocation {
            program: program.to_string(),
            action: action.to_string(),
            code,
        }
    }
}
