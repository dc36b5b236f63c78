//! Native tool execution for stage engines.
//!
//! A [`ToolCommand`] spawns an external program. It streams the
//! program's stdout to the log line by line (stderr goes to `debug`),
//! and turns a nonzero exit into [`ToolError::Failed`]. With a timeout
//! set, the child is killed when the deadline passes, so a hung tool
//! cannot stall a phase barrier forever.

use std::ffi::{OsStr, OsString};
use std::io::{self, BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Interval between exit checks while a timeout is armed.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Why a native tool run failed.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The program could not be started (not installed, not executable).
    #[error("failed to start {program}: {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The program ran and exited unsuccessfully.
    #[error("{program} failed ({status})")]
    Failed {
        /// Program name.
        program: String,
        /// Exit status reported by the OS.
        status: ExitStatus,
    },

    /// The program exceeded its deadline and was killed.
    #[error("{program} timed out after {timeout:?} and was killed")]
    TimedOut {
        /// Program name.
        program: String,
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// Waiting on or killing the child failed.
    #[error("I/O error while running {program}: {source}")]
    Io {
        /// Program name.
        program: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
}

/// Builder for one external tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    program: String,
    args: Vec<OsString>,
    timeout: Option<Duration>,
}

impl ToolCommand {
    /// A command running `program` (looked up on `PATH`).
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Kill the child if it runs longer than `timeout`.
    #[must_use]
    pub const fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The program name.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// The argument list.
    #[must_use]
    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Run the tool to completion.
    ///
    /// On timeout the child is killed and `run` returns at once, without
    /// waiting for any process the child left behind.
    ///
    /// # Errors
    ///
    /// See [`ToolError`].
    pub fn run(&self) -> Result<(), ToolError> {
        tracing::debug!(
            program = %self.program,
            args = ?self.args,
            "running tool"
        );

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .map(|out| forward_lines(self.program.clone(), out, false));
        let stderr = child
            .stderr
            .take()
            .map(|err| forward_lines(self.program.clone(), err, true));

        let status = self.wait(&mut child);

        // After a kill, a grandchild may still hold the pipes open, so
        // the readers are left to drain on their own.
        if let Err(ToolError::TimedOut { .. }) = &status {
            tracing::debug!(program = %self.program, "detaching output readers");
            return status.map(|_| ());
        }
        for reader in [stdout, stderr].into_iter().flatten() {
            if reader.join().is_err() {
                tracing::warn!(program = %self.program, "output reader thread panicked");
            }
        }

        let status = status?;
        if status.success() {
            Ok(())
        } else {
            Err(ToolError::Failed {
                program: self.program.clone(),
                status,
            })
        }
    }

    fn wait(&self, child: &mut Child) -> Result<ExitStatus, ToolError> {
        let io_err = |source| ToolError::Io {
            program: self.program.clone(),
            source,
        };

        let Some(timeout) = self.timeout else {
            return child.wait().map_err(io_err);
        };

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait().map_err(io_err)? {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                tracing::error!(program = %self.program, ?timeout, "tool timed out, killing");
                child.kill().map_err(io_err)?;
                child.wait().map_err(io_err)?;
                return Err(ToolError::TimedOut {
                    program: self.program.clone(),
                    timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Log each line of `stream` until EOF on a background thread.
fn forward_lines<R: Read + Send + 'static>(
    program: String,
    stream: R,
    is_stderr: bool,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if is_stderr {
                tracing::debug!(tool = %program, "{line}");
            } else {
                tracing::info!(tool = %program, "{line}");
            }
        }
    })
}
