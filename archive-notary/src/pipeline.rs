// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Top-level driver.

A run processes each top-level archive of a manifest in order, submitting
every successfully repacked archive for notarization as soon as it is ready.
Once all archives are processed the polling scheduler waits out the pending
requests, publishing each artifact as it completes.

The run log is flushed after every top-level archive, after every publish,
and when a fatal error ends the run.
*/

use {
    crate::{
        config::PipelineSettings,
        manifest::ArchiveSpec,
        notary::{NotarizationRequest, NotarizationStatus, NotaryClient},
        run_log::{RunLog, RunLogDirectory},
        scheduler::{Clock, CompletedRequest, PollingScheduler, StatusSource},
        signer::{ArchiveSigner, ProcessOutcome, SkipReason},
        tools::Toolchain,
        ArchiveNotaryError,
    },
    std::path::Path,
};

/// What a completed run did.
#[derive(Clone, Debug, Default)]
pub struct RunSummary {
    /// Archives notarized and published, in completion order.
    pub published: Vec<CompletedRequest>,

    /// Manifest paths of archives that were skipped.
    pub skipped: Vec<(String, SkipReason)>,
}

impl RunSummary {
    /// Human readable summary lines.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "{} archives published, {} skipped",
            self.published.len(),
            self.skipped.len()
        )];

        for completed in &self.published {
            lines.push(format!(
                "published {} ({} checks, {}s)",
                completed.request.publish_destination,
                completed.checks,
                completed.elapsed.as_secs()
            ));
        }
        for (path, reason) in &self.skipped {
            lines.push(format!("skipped {}: {}", path, reason));
        }

        lines
    }
}

/// Wires the signer, notary client, and scheduler together.
pub struct Pipeline<'a> {
    settings: &'a PipelineSettings,
    tools: &'a Toolchain<'a>,
    notary: &'a NotaryClient<'a>,
    clock: &'a dyn Clock,
    listings: Option<&'a RunLogDirectory>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        settings: &'a PipelineSettings,
        tools: &'a Toolchain<'a>,
        notary: &'a NotaryClient<'a>,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            settings,
            tools,
            notary,
            clock,
            listings: None,
        }
    }

    /// Write archive member listings into a run log directory.
    pub fn with_listings(mut self, directory: &'a RunLogDirectory) -> Self {
        self.listings = Some(directory);
        self
    }

    fn signer(&self) -> ArchiveSigner<'a> {
        let signer = ArchiveSigner::new(self.tools);

        match self.listings {
            Some(directory) => signer.with_listings(directory),
            None => signer,
        }
    }

    /// Sign, notarize, and publish a list of top-level archives.
    pub fn run_manifest(
        &self,
        archives: &[ArchiveSpec],
        commit: &str,
        work_dir: &Path,
        log: &mut RunLog,
    ) -> Result<RunSummary, ArchiveNotaryError> {
        let signer = self.signer();
        let mut scheduler = PollingScheduler::new(self.settings.poll, self.clock);
        let mut summary = RunSummary::default();
        let started = self.clock.now();

        for spec in archives {
            match signer.process_archive(
                spec,
                &self.settings.remote_base,
                commit,
                work_dir,
                log,
            )? {
                ProcessOutcome::Packed(local_artifact_path) => {
                    let request_id = self.notary.submit(&local_artifact_path, log)?;

                    scheduler.add(NotarizationRequest {
                        request_id,
                        local_artifact_path,
                        publish_destination: self.settings.publish_uri(commit, &spec.path),
                        submitted_at: self.clock.now(),
                    });
                }
                ProcessOutcome::Skipped(reason) => {
                    summary.skipped.push((spec.path.clone(), reason));
                }
            }

            log.flush()?;
        }

        log.info(format!(
            "waiting on {} notarization requests",
            scheduler.len()
        ));
        summary.published = scheduler.run(self.notary, self.tools, log)?;

        log.info(format!(
            "notarizing took {}s",
            self.clock.now().saturating_duration_since(started).as_secs()
        ));
        for line in summary.lines() {
            log.info(line);
        }
        log.flush()?;

        Ok(summary)
    }

    /// [Self::run_manifest] with fatal errors recorded in the run log.
    pub fn execute(
        &self,
        archives: &[ArchiveSpec],
        commit: &str,
        work_dir: &Path,
        log: &mut RunLog,
    ) -> Result<RunSummary, ArchiveNotaryError> {
        let res = self.run_manifest(archives, commit, work_dir, log);
        log.record_fatal(res)
    }

    /// Check a previously submitted request once.
    pub fn verify(
        &self,
        request_id: &str,
        log: &mut RunLog,
    ) -> Result<NotarizationStatus, ArchiveNotaryError> {
        log.info(format!("checking on the status of request {}", request_id));

        let res = self.notary.check_status(request_id).map(|status| {
            log.info(format!("request {} is {:?}", request_id, status));
            status
        });
        let status = log.record_fatal(res)?;
        log.flush()?;

        Ok(status)
    }
}
