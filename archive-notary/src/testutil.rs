// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-process stand-ins for the external tools and the clock.

use {
    crate::{
        command::{CommandOutput, CommandRunner, Invocation},
        config::{
            Credentials, ToolPrograms, DEFAULT_PRIMARY_BUNDLE_ID, PASSWORD_ENV_VARIABLE,
        },
        notary::{NotaryClient, SubmitPolicy},
        scheduler::Clock,
        tools::Toolchain,
        ArchiveNotaryError,
    },
    anyhow::Result,
    std::{
        cell::{Cell, RefCell},
        collections::{BTreeSet, HashMap, VecDeque},
        io::{Cursor, Read, Write},
        path::{Path, PathBuf},
        time::{Duration, Instant},
    },
};

/// Appended to a file by the fake `codesign`.
pub const SIGNATURE_MARKER: &[u8] = b"\n#signed";

pub const TEST_SIGNING_IDENTITY: &str = "Test Identity";

const REMOTE_PREFIX: &str = "fake://remote";

fn zip_options() -> zip::write::FileOptions {
    zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644)
}

/// Serialize members into an in-memory zip file, in the order given.
///
/// Names ending in `/` become directory entries.
pub fn zip_bytes(members: &[(&str, &[u8])]) -> Result<Vec<u8>> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));

    for (name, data) in members {
        if name.ends_with('/') {
            writer.add_directory(*name, zip_options())?;
        } else {
            writer.start_file(*name, zip_options())?;
            writer.write_all(data)?;
        }
    }

    Ok(writer.finish()?.into_inner())
}

pub fn write_zip(path: &Path, members: &[(&str, &[u8])]) -> Result<()> {
    std::fs::write(path, zip_bytes(members)?)?;

    Ok(())
}

/// Read every member of a zip file, in archive order.
pub fn read_zip(path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let mut archive = zip::ZipArchive::new(std::fs::File::open(path)?)?;

    let mut members = vec![];
    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        let mut data = vec![];
        file.read_to_end(&mut data)?;
        members.push((file.name().to_string(), data));
    }

    Ok(members)
}

/// A [Clock] that only moves when told to, or when slept on.
pub struct ManualClock {
    origin: Instant,
    elapsed: Cell<Duration>,
    sleeps: RefCell<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Cell::new(Duration::ZERO),
            sleeps: RefCell::new(vec![]),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.elapsed.set(self.elapsed.get() + duration);
    }

    /// Every duration passed to [Clock::sleep], in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed.get()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.borrow_mut().push(duration);
        self.advance(duration);
    }
}

#[derive(Default)]
struct NotaryState {
    submit_outputs: VecDeque<String>,
    submissions: usize,
    checks_until_success: HashMap<String, usize>,
    checks: HashMap<String, usize>,
    rejected: BTreeSet<String>,
}

/// Emulates `gsutil`, `unzip`, `zip`, `codesign`, and `xcrun altool`.
///
/// Remote storage is a directory; `fake://remote/<key>` maps to `<storage>/<key>`.
struct FakeRunner {
    storage: PathBuf,
    invocations: RefCell<Vec<Invocation>>,
    failing: RefCell<BTreeSet<String>>,
    failing_uploads: Cell<bool>,
    notary: RefCell<NotaryState>,
}

fn output(exit_code: i32, text: &str) -> CommandOutput {
    CommandOutput {
        lines: text.lines().map(|l| l.to_string()).collect(),
        exit_code: Some(exit_code),
    }
}

impl FakeRunner {
    fn resolve(&self, location: &str, cwd: Option<&Path>) -> PathBuf {
        if let Some(key) = location.strip_prefix(REMOTE_PREFIX) {
            self.storage.join(key.trim_start_matches('/'))
        } else {
            match cwd {
                Some(cwd) => cwd.join(location),
                None => PathBuf::from(location),
            }
        }
    }

    fn gsutil(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let cwd = invocation.cwd.as_deref();
        let source = self.resolve(&invocation.args[1], cwd);
        let dest = self.resolve(&invocation.args[2], cwd);

        if !source.is_file() {
            return Ok(output(
                1,
                &format!("CommandException: No URLs matched: {}", invocation.args[1]),
            ));
        }

        if self.failing_uploads.get() && invocation.args[2].starts_with(REMOTE_PREFIX) {
            return Ok(output(1, "AccessDeniedException: 403 Forbidden"));
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&source, &dest)?;

        Ok(output(0, &format!("Copying {}...", invocation.args[1])))
    }

    fn unzip(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let archive = PathBuf::from(&invocation.args[1]);
        let dest = PathBuf::from(&invocation.args[3]);

        let fh = match std::fs::File::open(&archive) {
            Ok(fh) => fh,
            Err(_) => return Ok(output(9, "cannot find or open archive")),
        };
        let mut zip = match zip::ZipArchive::new(fh) {
            Ok(zip) => zip,
            Err(_) => return Ok(output(9, "End-of-central-directory signature not found.")),
        };
        zip.extract(&dest)?;

        Ok(output(0, &format!("Archive:  {}", archive.display())))
    }

    /// `zip -r <archive> .` updating an existing archive.
    ///
    /// Existing members keep their position. Files found on disk replace the
    /// content of existing members or are appended in sorted order. Unless
    /// `-D` is given, directories are recorded as `dir/` entries too.
    fn zip(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let dir_entries = !invocation.args.iter().any(|a| a == "-D");
        let positional = invocation
            .args
            .iter()
            .filter(|a| !a.starts_with('-'))
            .collect::<Vec<_>>();
        let archive = PathBuf::from(positional[0]);
        let root = invocation
            .cwd
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));

        let mut on_disk = BTreeSet::new();
        collect_entries(&root, &root, dir_entries, &mut on_disk)?;

        let existing = if archive.is_file() {
            read_zip(&archive)?
        } else {
            vec![]
        };

        let mut members = vec![];
        for (name, data) in existing {
            if on_disk.remove(&name) && !name.ends_with('/') {
                members.push((name.clone(), std::fs::read(root.join(&name))?));
            } else {
                members.push((name, data));
            }
        }
        for name in on_disk {
            let data = if name.ends_with('/') {
                vec![]
            } else {
                std::fs::read(root.join(&name))?
            };
            members.push((name, data));
        }

        let temp = archive.with_extension("zip.tmp");
        write_zip(
            &temp,
            &members
                .iter()
                .map(|(name, data)| (name.as_str(), data.as_slice()))
                .collect::<Vec<_>>(),
        )?;
        std::fs::rename(&temp, &archive)?;

        Ok(output(0, "updating: (stored 0%)"))
    }

    fn codesign(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let path = PathBuf::from(&invocation.args[3]);

        let mut data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(_) => {
                return Ok(output(
                    1,
                    &format!("{}: No such file or directory", path.display()),
                ))
            }
        };

        if !data.ends_with(SIGNATURE_MARKER) {
            data.extend_from_slice(SIGNATURE_MARKER);
            std::fs::write(&path, data)?;
        }

        Ok(output(0, &format!("{}: replacing existing signature", path.display())))
    }

    fn xcrun(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let mut state = self.notary.borrow_mut();

        match invocation.args.get(1).map(|s| s.as_str()) {
            Some("--notarize-app") => {
                state.submissions += 1;
                let text = match state.submit_outputs.pop_front() {
                    Some(text) => text,
                    None => format!(
                        "No errors uploading.\nRequestUUID = 00000000-0000-0000-0000-{:012}",
                        state.submissions
                    ),
                };
                Ok(output(0, &text))
            }
            Some("--notarization-info") => {
                let request_id = invocation.args[2].clone();
                let count = {
                    let count = state.checks.entry(request_id.clone()).or_default();
                    *count += 1;
                    *count
                };

                let text = if state.rejected.contains(&request_id) {
                    "        Status: invalid\n    LogFileURL: https://example.com/log.json"
                } else if count
                    < state
                        .checks_until_success
                        .get(&request_id)
                        .copied()
                        .unwrap_or(1)
                {
                    "        Status: in progress\n    LogFileURL: (null)"
                } else {
                    "        Status: success\n    LogFileURL: https://example.com/log.json"
                };

                Ok(output(
                    0,
                    &format!("   RequestUUID: {}\n{}", request_id, text),
                ))
            }
            _ => Ok(output(1, "unsupported altool invocation")),
        }
    }
}

fn collect_entries(
    root: &Path,
    dir: &Path,
    dir_entries: bool,
    entries: &mut BTreeSet<String>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let name = path
            .strip_prefix(root)?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/");

        if path.is_dir() {
            if dir_entries {
                entries.insert(format!("{}/", name));
            }
            collect_entries(root, &path, dir_entries, entries)?;
        } else {
            entries.insert(name);
        }
    }

    Ok(())
}

impl CommandRunner for FakeRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput, ArchiveNotaryError> {
        self.invocations.borrow_mut().push(invocation.clone());

        if self.failing.borrow().contains(&invocation.program) {
            return Ok(output(1, "simulated failure"));
        }

        let res = match invocation.program.as_str() {
            "gsutil" => self.gsutil(invocation),
            "unzip" => self.unzip(invocation),
            "zip" => self.zip(invocation),
            "codesign" => self.codesign(invocation),
            "xcrun" => self.xcrun(invocation),
            _ => Ok(output(127, "command not found")),
        };

        res.map_err(|e| {
            ArchiveNotaryError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("fake {} failed: {}", invocation.program, e),
            ))
        })
    }
}

/// A temporary directory with fake tools and fake remote storage.
pub struct FakeTools {
    _temp_dir: tempfile::TempDir,
    scratch: PathBuf,
    entitlements_path: PathBuf,
    runner: FakeRunner,
}

impl FakeTools {
    pub fn new() -> Result<Self> {
        let temp_dir = tempfile::Builder::new()
            .prefix("archive-notary-test")
            .tempdir()?;

        let scratch = temp_dir.path().join("scratch");
        let storage = temp_dir.path().join("remote");
        std::fs::create_dir_all(&scratch)?;
        std::fs::create_dir_all(&storage)?;

        let entitlements_path = temp_dir.path().join("Entitlements.plist");

        Ok(Self {
            scratch,
            entitlements_path,
            runner: FakeRunner {
                storage,
                invocations: RefCell::new(vec![]),
                failing: RefCell::new(BTreeSet::new()),
                failing_uploads: Cell::new(false),
                notary: RefCell::new(NotaryState::default()),
            },
            _temp_dir: temp_dir,
        })
    }

    /// A directory for local files.
    pub fn scratch(&self) -> &Path {
        &self.scratch
    }

    pub fn entitlements_path(&self) -> &Path {
        &self.entitlements_path
    }

    pub fn remote_base(&self) -> String {
        REMOTE_PREFIX.to_string()
    }

    pub fn remote_uri(&self, key: &str) -> String {
        format!("{}/{}", REMOTE_PREFIX, key)
    }

    /// Local path backing a remote object.
    pub fn remote_path(&self, key: &str) -> PathBuf {
        self.runner.storage.join(key)
    }

    pub fn add_remote_file(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.remote_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, data)?;

        Ok(())
    }

    pub fn add_remote_zip(&self, key: &str, members: &[(&str, &[u8])]) -> Result<()> {
        self.add_remote_file(key, &zip_bytes(members)?)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            signing_identity: TEST_SIGNING_IDENTITY.to_string(),
            username: "release@example.com".to_string(),
            password_env: PASSWORD_ENV_VARIABLE.to_string(),
            primary_bundle_id: DEFAULT_PRIMARY_BUNDLE_ID.to_string(),
        }
    }

    pub fn toolchain(&self) -> Toolchain<'_> {
        Toolchain::new(
            &self.runner,
            ToolPrograms::default(),
            TEST_SIGNING_IDENTITY,
            &self.entitlements_path,
        )
    }

    pub fn notary_client<'a>(
        &'a self,
        clock: &'a dyn Clock,
        policy: SubmitPolicy,
    ) -> NotaryClient<'a> {
        NotaryClient::new(
            &self.runner,
            clock,
            ToolPrograms::default().xcrun,
            self.credentials(),
            policy,
        )
    }

    /// Make every invocation of a program exit with status 1.
    pub fn fail_program(&self, program: &str) {
        self.runner.failing.borrow_mut().insert(program.to_string());
    }

    /// Make copies from local files to remote storage fail.
    pub fn fail_uploads(&self) {
        self.runner.failing_uploads.set(true);
    }

    /// Queue output for the next `altool --notarize-app` invocation.
    pub fn push_submit_output(&self, text: &str) {
        self.runner
            .notary
            .borrow_mut()
            .submit_outputs
            .push_back(text.to_string());
    }

    /// Report a request as in progress until its `n`th status check.
    pub fn set_checks_until_success(&self, request_id: &str, n: usize) {
        self.runner
            .notary
            .borrow_mut()
            .checks_until_success
            .insert(request_id.to_string(), n);
    }

    pub fn reject_request(&self, request_id: &str) {
        self.runner
            .notary
            .borrow_mut()
            .rejected
            .insert(request_id.to_string());
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.runner.invocations.borrow().clone()
    }

    pub fn invocations_of(&self, program: &str) -> Vec<Invocation> {
        self.invocations()
            .into_iter()
            .filter(|i| i.program == program)
            .collect()
    }
}
