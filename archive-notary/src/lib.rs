// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing and notarization of nested macOS zip archives.
//!
//! This crate drives Apple's command line tooling to sign every binary inside
//! a set of release archives and get the result notarized. Archives may
//! contain other archives: those are unpacked, signed, and repacked before
//! their parent is repacked.
//!
//! A run works through a manifest of archive specifications:
//!
//! 1. Each top-level archive is downloaded from remote storage and
//!    recursively signed in a working directory (see [ArchiveSigner]).
//! 2. Each signed archive is submitted to Apple's notary service, producing
//!    a [NotarizationRequest].
//! 3. A [PollingScheduler] waits until Apple accepts every request, uploading
//!    each artifact to its publish destination as it completes.
//!
//! External programs (`gsutil`, `unzip`, `zip`, `codesign`, `xcrun altool`)
//! are invoked through the [CommandRunner] trait.
//!
//! Failures fall into two groups. Download and unpack failures of a
//! top-level archive skip that archive ([ProcessOutcome::Skipped]) and the
//! run continues. Everything else is an [ArchiveNotaryError] and ends the run
//! after the [RunLog] is flushed.

pub mod command;
pub use command::*;
pub mod config;
mod error;
pub use error::*;
pub mod manifest;
pub use manifest::{ArchiveSpec, FileRef, Manifest};
pub mod notary;
pub use notary::{NotarizationRequest, NotarizationStatus, NotaryClient};
pub mod pipeline;
pub use pipeline::{Pipeline, RunSummary};
pub mod run_log;
pub use run_log::{RunLog, RunLogDirectory};
pub mod scheduler;
pub use scheduler::{Clock, PollingScheduler, SystemClock};
pub mod signer;
pub use signer::{ArchiveSigner, ProcessOutcome, SkipReason};
#[cfg(test)]
mod testutil;
pub mod tools;
pub mod workdir;
pub use workdir::WorkingDirectory;
