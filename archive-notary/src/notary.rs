// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Apple notarization through `xcrun altool`.

Notarization is asynchronous. Uploading a signed archive yields a request UUID
and Apple scans the upload in the background. The status of the request is
then polled until Apple reports success or failure.

`altool` reports everything as free text (on stderr, even on success), so the
request UUID and status are scraped from its combined output with fixed
patterns. Output not matching these patterns is treated as an integration
failure.
*/

use {
    crate::{
        command::{CommandRunner, Invocation},
        config::Credentials,
        run_log::RunLog,
        scheduler::{Clock, StatusSource},
        ArchiveNotaryError,
    },
    log::{error, warn},
    once_cell::sync::Lazy,
    regex::Regex,
    std::{
        path::{Path, PathBuf},
        time::{Duration, Instant},
    },
};

static REQUEST_UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"RequestUUID = ([a-z0-9-]+)").expect("request UUID regex should compile")
});

static STATUS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Status: ([a-z ]+)").expect("status regex should compile"));

static LOG_FILE_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"LogFileURL: (\S+)").expect("log URL regex should compile"));

const STATUS_SUCCESS: &str = "success";
const STATUS_IN_PROGRESS: &str = "in progress";

/// How submissions are retried when no request UUID comes back.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SubmitPolicy {
    /// Total number of submission attempts, including the first.
    pub max_attempts: u32,

    /// Pause between attempts.
    pub retry_delay: Duration,
}

impl Default for SubmitPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(10),
        }
    }
}

/// A submitted notarization request awaiting a verdict.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NotarizationRequest {
    /// UUID assigned by the notary service.
    pub request_id: String,

    /// Signed archive that was submitted.
    pub local_artifact_path: PathBuf,

    /// Where the archive is uploaded once notarization succeeds.
    pub publish_destination: String,

    pub submitted_at: Instant,
}

/// Status of a notarization request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NotarizationStatus {
    /// Apple accepted the upload.
    Completed,

    /// Apple is still processing the upload.
    Pending,
}

/// Extract the request UUID from `altool --notarize-app` output.
pub fn parse_request_id(output: &str) -> Option<String> {
    REQUEST_UUID_RE
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Interpret `altool --notarization-info` output.
///
/// Any recognized status other than success or in progress means the request
/// was rejected.
pub fn parse_status(
    request_id: &str,
    output: &str,
) -> Result<NotarizationStatus, ArchiveNotaryError> {
    let status = STATUS_RE
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .ok_or_else(|| {
            ArchiveNotaryError::ServiceProtocol(format!(
                "no status in notarization info for {}",
                request_id
            ))
        })?;

    match status {
        STATUS_SUCCESS => Ok(NotarizationStatus::Completed),
        STATUS_IN_PROGRESS => Ok(NotarizationStatus::Pending),
        _ => {
            if let Some(url) = LOG_FILE_URL_RE
                .captures(output)
                .and_then(|caps| caps.get(1))
            {
                error!("notarization log for {}: {}", request_id, url.as_str());
            }

            Err(ArchiveNotaryError::NotarizationRejected {
                request_id: request_id.to_string(),
                status: status.to_string(),
            })
        }
    }
}

/// Submits archives for notarization and queries request status.
pub struct NotaryClient<'a> {
    runner: &'a dyn CommandRunner,
    clock: &'a dyn Clock,
    xcrun: String,
    credentials: Credentials,
    policy: SubmitPolicy,
}

impl<'a> NotaryClient<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        clock: &'a dyn Clock,
        xcrun: impl ToString,
        credentials: Credentials,
        policy: SubmitPolicy,
    ) -> Self {
        Self {
            runner,
            clock,
            xcrun: xcrun.to_string(),
            credentials,
            policy,
        }
    }

    fn submit_invocation(&self, artifact: &Path) -> Invocation {
        Invocation::new(
            &self.xcrun,
            [
                "altool".to_string(),
                "--notarize-app".to_string(),
                "--primary-bundle-id".to_string(),
                self.credentials.primary_bundle_id.clone(),
                "--username".to_string(),
                self.credentials.username.clone(),
                "--password".to_string(),
                self.credentials.password_reference(),
                "--file".to_string(),
                artifact.display().to_string(),
            ],
        )
    }

    fn status_invocation(&self, request_id: &str) -> Invocation {
        Invocation::new(
            &self.xcrun,
            [
                "altool".to_string(),
                "--notarization-info".to_string(),
                request_id.to_string(),
                "-u".to_string(),
                self.credentials.username.clone(),
                "--password".to_string(),
                self.credentials.password_reference(),
            ],
        )
    }

    /// Upload an archive to the notary service and return its request UUID.
    ///
    /// Output without a request UUID is retried up to the policy's attempt
    /// budget. Exhausting the budget is fatal.
    pub fn submit(&self, artifact: &Path, log: &mut RunLog) -> Result<String, ArchiveNotaryError> {
        let invocation = self.submit_invocation(artifact);

        for attempt in 1..=self.policy.max_attempts {
            log.info(format!(
                "initiating upload of {} to the notary service (attempt {} of {})",
                artifact.display(),
                attempt,
                self.policy.max_attempts
            ));

            let output = self.runner.run(&invocation)?;

            if let Some(request_id) = parse_request_id(&output.text()) {
                log.info(format!("RequestUUID for {}: {}", artifact.display(), request_id));
                return Ok(request_id);
            }

            log.warn(format!(
                "unrecognized output from command: {} (exit code {:?})",
                invocation, output.exit_code
            ));
            for line in &output.lines {
                warn!("altool> {}", line);
            }

            if attempt < self.policy.max_attempts {
                log.info(format!(
                    "retrying submission in {}s",
                    self.policy.retry_delay.as_secs()
                ));
                self.clock.sleep(self.policy.retry_delay);
            }
        }

        Err(ArchiveNotaryError::SubmitRetriesExhausted(
            self.policy.max_attempts,
        ))
    }
}

impl<'a> StatusSource for NotaryClient<'a> {
    fn check_status(&self, request_id: &str) -> Result<NotarizationStatus, ArchiveNotaryError> {
        let output = self.runner.run(&self.status_invocation(request_id))?;

        parse_status(request_id, &output.text())
    }
}
