// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Polling of in-flight notarization requests.

[PollingScheduler] owns every submitted [NotarizationRequest] of a run and
drives them to completion. Requests are kept in a queue: the request at the
front is checked and, if Apple is still processing it, moved to the back. A
full pass over the queue is a sweep.

Rate limits:

* No request is checked before [PollPolicy::warm_up] has elapsed since it was
  submitted. Apple reports freshly submitted requests as unknown.
* Sweeps start at least [PollPolicy::min_interval] apart.
* A request is never checked twice within [PollPolicy::min_interval].

There is no overall timeout: the loop ends only when every request completed
(or a fatal error occurs).
*/

use {
    crate::{
        notary::{NotarizationRequest, NotarizationStatus},
        run_log::RunLog,
        ArchiveNotaryError,
    },
    log::debug,
    std::{
        collections::VecDeque,
        path::Path,
        time::{Duration, Instant},
    },
};

/// Source of time and means of waiting.
pub trait Clock {
    fn now(&self) -> Instant;

    fn sleep(&self, duration: Duration);
}

/// A [Clock] backed by the system monotonic clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration)
    }
}

/// Something that can report the status of a notarization request.
pub trait StatusSource {
    fn check_status(&self, request_id: &str) -> Result<NotarizationStatus, ArchiveNotaryError>;
}

/// Something that can publish a notarized artifact to its destination.
pub trait ArtifactPublisher {
    fn publish(&self, local: &Path, destination: &str) -> Result<(), ArchiveNotaryError>;
}

/// Timing constraints for status checks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollPolicy {
    /// Minimum time between submission and the first status check.
    pub warm_up: Duration,

    /// Minimum time between checks of the same request and between sweeps.
    pub min_interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            warm_up: Duration::from_secs(45),
            min_interval: Duration::from_secs(20),
        }
    }
}

/// A request that finished notarization and was published.
#[derive(Clone, Debug)]
pub struct CompletedRequest {
    pub request: NotarizationRequest,

    /// Number of status checks issued for the request.
    pub checks: usize,

    /// Time from submission to the completing check.
    pub elapsed: Duration,
}

#[derive(Debug)]
struct PendingRequest {
    request: NotarizationRequest,
    checks: usize,
    last_checked: Option<Instant>,
}

/// Drives a set of notarization requests to completion.
pub struct PollingScheduler<'a> {
    pending: VecDeque<PendingRequest>,
    policy: PollPolicy,
    clock: &'a dyn Clock,
}

impl<'a> PollingScheduler<'a> {
    pub fn new(policy: PollPolicy, clock: &'a dyn Clock) -> Self {
        Self {
            pending: VecDeque::new(),
            policy,
            clock,
        }
    }

    /// Take ownership of a submitted request.
    pub fn add(&mut self, request: NotarizationRequest) {
        self.pending.push_back(PendingRequest {
            request,
            checks: 0,
            last_checked: None,
        });
    }

    /// Number of requests not yet completed.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// `from + delay`, or an error if the sum cannot be represented.
    fn deadline(from: Instant, delay: Duration) -> Result<Instant, ArchiveNotaryError> {
        from.checked_add(delay).ok_or_else(|| {
            ArchiveNotaryError::CliBadArgument(format!(
                "poll delay of {}s is out of range",
                delay.as_secs()
            ))
        })
    }

    fn wait_until(&self, deadline: Instant) -> Duration {
        let now = self.clock.now();

        if deadline > now {
            let delta = deadline - now;
            self.clock.sleep(delta);
            delta
        } else {
            Duration::ZERO
        }
    }

    /// Poll until every request completed, publishing each as it completes.
    ///
    /// Completed requests are returned in completion order. The run log is
    /// flushed after each publish.
    pub fn run(
        &mut self,
        source: &dyn StatusSource,
        publisher: &dyn ArtifactPublisher,
        log: &mut RunLog,
    ) -> Result<Vec<CompletedRequest>, ArchiveNotaryError> {
        let mut completed = vec![];
        let mut sweep_started: Option<Instant> = None;
        let mut remaining_in_sweep = 0;

        while let Some(mut pending) = self.pending.pop_front() {
            if remaining_in_sweep == 0 {
                if let Some(started) = sweep_started {
                    let paused =
                        self.wait_until(Self::deadline(started, self.policy.min_interval)?);
                    if !paused.is_zero() {
                        debug!("paused {}s before next sweep", paused.as_secs());
                    }
                }

                sweep_started = Some(self.clock.now());
                remaining_in_sweep = self.pending.len() + 1;
                debug!("starting sweep over {} requests", remaining_in_sweep);
            }
            remaining_in_sweep -= 1;

            let earliest = match pending.last_checked {
                Some(last) => Self::deadline(last, self.policy.min_interval)?,
                None => Self::deadline(pending.request.submitted_at, self.policy.warm_up)?,
            };
            if pending.last_checked.is_none() {
                log.info(format!(
                    "pausing up to {}s until the first status check of {}",
                    self.policy.warm_up.as_secs(),
                    pending.request.request_id
                ));
            }
            self.wait_until(earliest);

            let request_id = pending.request.request_id.clone();
            log.info(format!("checking on the status of request {}", request_id));

            let checked_at = self.clock.now();
            let status = source.check_status(&request_id)?;
            pending.checks += 1;
            pending.last_checked = Some(checked_at);

            match status {
                NotarizationStatus::Pending => {
                    log.info(format!(
                        "notarization of {} is still pending",
                        pending.request.local_artifact_path.display()
                    ));
                    self.pending.push_back(pending);
                }
                NotarizationStatus::Completed => {
                    let elapsed =
                        checked_at.saturating_duration_since(pending.request.submitted_at);
                    log.info(format!(
                        "notarization of {} succeeded after {} checks; notarizing took {}s",
                        pending.request.local_artifact_path.display(),
                        pending.checks,
                        elapsed.as_secs()
                    ));

                    publisher.publish(
                        &pending.request.local_artifact_path,
                        &pending.request.publish_destination,
                    )?;
                    log.info(format!(
                        "published {} to {}",
                        pending.request.local_artifact_path.display(),
                        pending.request.publish_destination
                    ));
                    log.flush()?;

                    completed.push(CompletedRequest {
                        request: pending.request,
                        checks: pending.checks,
                        elapsed,
                    });
                }
            }
        }

        Ok(completed)
    }
}
