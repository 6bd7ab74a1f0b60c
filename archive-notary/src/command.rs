// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Invocation of external programs.

Every external tool this crate drives (storage transfer, zip, codesign, the
notary CLI) goes through [CommandRunner]. The runner merges stdout and stderr
into a single sequence of lines and reports the exit code. It never turns a
nonzero exit into an error: deciding whether a failure is fatal or skippable
is the caller's job.

Ordering between lines originating from stdout and stderr is best effort.
*/

use {
    crate::ArchiveNotaryError,
    log::{debug, info},
    std::{
        fmt::{Display, Formatter},
        io::{BufRead, BufReader},
        path::{Path, PathBuf},
    },
};

/// Describes a single invocation of an external program.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Invocation {
    /// Program to run. Resolved against `PATH` if not a path.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Working directory for the child process.
    pub cwd: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl ToString, args: impl IntoIterator<Item = impl ToString>) -> Self {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(|x| x.to_string()).collect(),
            cwd: None,
        }
    }

    /// Run the program from a specific directory.
    pub fn current_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.cwd = Some(path.as_ref().to_path_buf());
        self
    }
}

impl Display for Invocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }

        Ok(())
    }
}

/// The result of running a program to completion.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Combined stdout and stderr, one entry per line, without line terminators.
    pub lines: Vec<String>,

    /// Exit code of the process. `None` if it was terminated by a signal.
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// All output lines joined with newlines.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Something that can run external programs.
pub trait CommandRunner {
    /// Run a program to completion and capture its combined output.
    ///
    /// Returns `Err` only if the process could not be spawned or its output could
    /// not be read.
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput, ArchiveNotaryError>;
}

/// A [CommandRunner] that spawns real processes.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput, ArchiveNotaryError> {
        info!("invoking {}", invocation);

        let mut expression = duct::cmd(invocation.program.as_str(), &invocation.args)
            .stderr_to_stdout()
            .unchecked();
        if let Some(cwd) = &invocation.cwd {
            expression = expression.dir(cwd);
        }

        let reader = expression.reader()?;

        let mut lines = vec![];
        {
            let mut reader = BufReader::new(&reader);
            let mut buffer = vec![];

            loop {
                buffer.clear();
                if reader.read_until(b'\n', &mut buffer)? == 0 {
                    break;
                }

                let line = String::from_utf8_lossy(&buffer)
                    .trim_end_matches(&['\r', '\n'][..])
                    .to_string();
                debug!("{} output> {}", invocation.program, line);
                lines.push(line);
            }
        }

        let output = reader.try_wait()?.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "unable to wait on command")
        })?;

        Ok(CommandOutput {
            lines,
            exit_code: output.status.code(),
        })
    }
}
