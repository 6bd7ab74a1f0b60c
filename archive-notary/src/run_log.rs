// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Accumulated progress records for a run.

[RunLog] buffers status lines while a unit of work is processed and writes
them to a transcript file at checkpoints: after each top-level archive, on
fatal errors, and at the end of a run. Every record is also forwarded to the
[log] facade as it is made, so console output is not delayed by buffering.

[RunLogDirectory] is the persisted side of a run: a directory keyed by start
time and revision holding the transcript and per-archive member listings.
*/

use {
    crate::{workdir::sanitize_path, ArchiveNotaryError},
    chrono::{DateTime, SecondsFormat, Utc},
    log::{error, Level},
    std::{
        fmt::{Display, Formatter},
        io::Write,
        path::{Path, PathBuf},
    },
};

const TRANSCRIPT_FILENAME: &str = "transcript.log";

/// A single record in a [RunLog].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub message: String,
}

impl Display for RunLogEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {:<5} {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.level,
            self.message
        )
    }
}

/// In-memory buffer of run progress, periodically flushed to a transcript.
#[derive(Debug, Default)]
pub struct RunLog {
    entries: Vec<RunLogEntry>,
    transcript: Option<PathBuf>,
}

impl RunLog {
    /// Construct a log that is never persisted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a log whose flushes append to the given file.
    pub fn with_transcript(path: impl AsRef<Path>) -> Self {
        Self {
            entries: vec![],
            transcript: Some(path.as_ref().to_path_buf()),
        }
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.record(Level::Info, message.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.record(Level::Warn, message.into());
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.record(Level::Error, message.into());
    }

    fn record(&mut self, level: Level, message: String) {
        log::log!(level, "{}", message);

        self.entries.push(RunLogEntry {
            timestamp: Utc::now(),
            level,
            message,
        });
    }

    /// Records accumulated since the last flush or drain.
    pub fn entries(&self) -> &[RunLogEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove and return all buffered records.
    pub fn drain(&mut self) -> Vec<RunLogEntry> {
        std::mem::take(&mut self.entries)
    }

    /// Append buffered records to the transcript and clear the buffer.
    ///
    /// Returns the number of records flushed. Without a transcript, records are
    /// simply discarded.
    pub fn flush(&mut self) -> Result<usize, ArchiveNotaryError> {
        let entries = self.drain();

        if let Some(path) = &self.transcript {
            let mut fh = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;

            for entry in &entries {
                writeln!(fh, "{}", entry)?;
            }
            fh.flush()?;
        }

        Ok(entries.len())
    }

    /// Log and flush a fatal error before handing it back.
    ///
    /// A flush failure is reported through [log] so the original error wins.
    pub fn record_fatal<T>(
        &mut self,
        res: Result<T, ArchiveNotaryError>,
    ) -> Result<T, ArchiveNotaryError> {
        res.map_err(|e| {
            self.error(format!("fatal: {}", e));

            if let Err(flush_err) = self.flush() {
                error!("unable to write run transcript: {}", flush_err);
            }

            e
        })
    }
}

/// When an archive member listing was captured.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ListingStage {
    BeforeSigning,
    AfterSigning,
}

impl ListingStage {
    fn suffix(&self) -> &'static str {
        match self {
            Self::BeforeSigning => "before",
            Self::AfterSigning => "after",
        }
    }
}

/// Persisted per-run log directory.
#[derive(Clone, Debug)]
pub struct RunLogDirectory {
    path: PathBuf,
}

impl RunLogDirectory {
    /// Create `<root>/<start time>_<revision>`.
    pub fn create(
        root: &Path,
        started: DateTime<Utc>,
        revision: &str,
    ) -> Result<Self, ArchiveNotaryError> {
        let path = root.join(format!(
            "{}_{}",
            started.format("%Y-%m-%dT%H-%M-%S"),
            sanitize_path(revision)
        ));
        std::fs::create_dir_all(path.join("listings"))?;

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn transcript_path(&self) -> PathBuf {
        self.path.join(TRANSCRIPT_FILENAME)
    }

    /// Write the member listing of an archive.
    pub fn write_listing(
        &self,
        archive_path: &str,
        stage: ListingStage,
        lines: &[String],
    ) -> Result<PathBuf, ArchiveNotaryError> {
        let path = self.path.join("listings").join(format!(
            "{}.{}.txt",
            sanitize_path(archive_path),
            stage.suffix()
        ));

        let mut data = lines.join("\n");
        data.push('\n');
        std::fs::write(&path, data)?;

        Ok(path)
    }
}

#[cfg(test)]
mod test {
    use {super::*, crate::workdir::WorkingDirectory, anyhow::Result, chrono::TimeZone};

    #[test]
    fn drain_clears() {
        let mut log = RunLog::new();
        log.info("downloading a.zip");
        log.error("cannot find file x");

        assert_eq!(log.entries().len(), 2);

        let drained = log.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].level, Level::Info);
        assert_eq!(drained[1].message, "cannot find file x");
        assert!(log.is_empty());
    }

    #[test]
    fn flush_appends_to_transcript() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let transcript = temp_dir.path().join("transcript.log");

        let mut log = RunLog::with_transcript(&transcript);
        log.info("first");
        assert_eq!(log.flush()?, 1);
        log.warn("second");
        log.info("third");
        assert_eq!(log.flush()?, 2);
        assert_eq!(log.flush()?, 0);

        let data = std::fs::read_to_string(&transcript)?;
        let lines = data.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("INFO  first"));
        assert!(lines[1].ends_with("WARN  second"));
        assert!(lines[2].ends_with("third"));

        Ok(())
    }

    #[test]
    fn fatal_errors_reach_transcript() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let transcript = temp_dir.path().join("transcript.log");
        let missing = temp_dir.path().join("previous-run");

        let mut log = RunLog::with_transcript(&transcript);
        log.info("reusing working directory");
        let res = log.record_fatal(WorkingDirectory::reuse(&missing));

        assert!(matches!(
            res,
            Err(ArchiveNotaryError::WorkingDirectoryMissing(ref path)) if path == &missing
        ));
        assert!(log.is_empty());

        let data = std::fs::read_to_string(&transcript)?;
        let lines = data.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("ERROR fatal: working directory"));
        assert!(lines[1].contains("previous-run"));

        assert_eq!(log.record_fatal(Ok::<_, ArchiveNotaryError>(7))?, 7);
        assert!(log.is_empty());

        Ok(())
    }

    #[test]
    fn directory_layout() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let started = Utc.with_ymd_and_hms(2019, 10, 3, 14, 5, 9).unwrap();

        let dir = RunLogDirectory::create(temp_dir.path(), started, "abc123")?;
        assert_eq!(
            dir.path(),
            temp_dir.path().join("2019-10-03T14-05-09_abc123")
        );

        let listing = dir.write_listing(
            "ios-profile/artifacts.zip",
            ListingStage::AfterSigning,
            &["one".to_string(), "two".to_string()],
        )?;
        assert_eq!(
            listing.file_name().and_then(|x| x.to_str()),
            Some("ios-profile_artifacts.zip.after.txt")
        );
        assert_eq!(std::fs::read_to_string(&listing)?, "one\ntwo\n");

        Ok(())
    }
}
