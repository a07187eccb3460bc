//! External process supervision.
//!
//! Spawns yt-dlp with piped stdout/stderr, exposes the two pipes as one
//! merged line stream, and owns termination: a graceful stop request, a
//! bounded wait, then a forced kill.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

#[cfg(windows)]
#[allow(unused_imports)]
use std::os::windows::process::CommandExt;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::config::EngineConfig;
use crate::control::ControlSignal;
use crate::error::EngineError;

/// Windows flag to prevent console window from appearing when spawning processes.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Exit code shells use for "command not found".
pub const EXIT_NOT_FOUND: i32 = 127;
/// cmd.exe's "is not recognized as an internal or external command".
pub const EXIT_NOT_FOUND_WINDOWS: i32 = 9009;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

/// How a finished process exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    NotFound,
    /// Non-zero exit, or killed by a signal (`None`).
    Failure(Option<i32>),
}

pub fn classify_exit(code: Option<i32>) -> ExitClass {
    match code {
        Some(0) => ExitClass::Success,
        Some(EXIT_NOT_FOUND) | Some(EXIT_NOT_FOUND_WINDOWS) => ExitClass::NotFound,
        other => ExitClass::Failure(other),
    }
}

impl From<&ExitStatus> for ExitClass {
    fn from(status: &ExitStatus) -> Self {
        classify_exit(status.code())
    }
}

/// Spawns the configured tool. Holds no state beyond its configuration.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    program: PathBuf,
    global_args: Vec<String>,
}

impl ProcessSupervisor {
    pub fn new(program: impl Into<PathBuf>, global_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            global_args,
        }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self::new(cfg.yt_dlp_path.clone(), cfg.global_args.clone())
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Explicit paths must exist. Bare program names are left to PATH
    /// lookup at spawn time.
    pub fn check_available(&self) -> Result<(), EngineError> {
        let explicit = self.program.is_absolute() || self.program.components().count() > 1;
        if explicit && !self.program.exists() {
            return Err(EngineError::ToolMissing(self.program.clone()));
        }
        Ok(())
    }

    pub fn spawn(&self, args: &[String]) -> Result<ProcessHandle, EngineError> {
        self.check_available()?;

        log::info!(
            "Spawning {} {:?} {:?}",
            self.program.display(),
            self.global_args,
            args
        );

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.global_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Hide console window on Windows
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => EngineError::ToolMissing(self.program.clone()),
            _ => EngineError::Spawn(e),
        })?;

        let pid = child.id();
        let stdout = child.stdout.take().map(LineReader::new);
        let stderr = child.stderr.take().map(LineReader::new);

        Ok(ProcessHandle {
            child,
            pid,
            stdout,
            stderr,
        })
    }

    /// Run to completion, collecting stdout and the tail of stderr.
    ///
    /// Cancellation terminates the process (graceful, then forced after
    /// `grace`); exceeding `timeout` kills it outright.
    pub async fn run_collect(
        &self,
        args: &[String],
        timeout: Duration,
        grace: Duration,
        control: &mut ControlSignal,
    ) -> Result<CollectedOutput, EngineError> {
        if control.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let mut handle = self.spawn(args)?;
        let mut stdout = String::new();
        let mut stderr_tail = OutputTail::new(STDERR_TAIL_LINES);

        enum Outcome {
            Drained,
            Cancelled,
            TimedOut,
        }

        let outcome = {
            let read = async {
                while let Some(line) = handle.next_line().await {
                    match line.stream {
                        Stream::Stdout => {
                            stdout.push_str(&line.text);
                            stdout.push('\n');
                        }
                        Stream::Stderr => {
                            log::debug!("yt-dlp stderr: {}", line.text);
                            stderr_tail.push(line.text);
                        }
                    }
                }
            };
            tokio::select! {
                _ = read => Outcome::Drained,
                _ = control.cancelled() => Outcome::Cancelled,
                _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
            }
        };

        match outcome {
            Outcome::Drained => {}
            Outcome::Cancelled => {
                handle.terminate(grace).await;
                return Err(EngineError::Cancelled);
            }
            Outcome::TimedOut => {
                log::warn!("yt-dlp timed out after {:?}; killing", timeout);
                handle.kill().await;
                return Err(EngineError::Timeout(timeout));
            }
        }

        let status = handle.wait().await?;
        Ok(CollectedOutput {
            stdout,
            stderr_tail: stderr_tail.into_vec(),
            exit: ExitClass::from(&status),
        })
    }
}

const STDERR_TAIL_LINES: usize = 20;

/// Result of [`ProcessSupervisor::run_collect`].
#[derive(Debug, Clone)]
pub struct CollectedOutput {
    pub stdout: String,
    pub stderr_tail: Vec<String>,
    pub exit: ExitClass,
}

impl CollectedOutput {
    /// stdout on success, otherwise the matching exit error.
    pub fn into_stdout(self) -> Result<String, EngineError> {
        match self.exit {
            ExitClass::Success => Ok(self.stdout),
            ExitClass::NotFound => Err(EngineError::ToolNotFound),
            ExitClass::Failure(code) => {
                let message = last_error_line(&self.stderr_tail)
                    .map(str::to_string)
                    .unwrap_or_else(|| match code {
                        Some(c) => format!("yt-dlp exited with status {c}"),
                        None => "yt-dlp was terminated".to_string(),
                    });
                Err(EngineError::ToolFailed {
                    exit_code: code,
                    message,
                    code: crate::error::classify_error_lines(&self.stderr_tail),
                })
            }
        }
    }
}

/// Most recent `ERROR:` line, which is what yt-dlp uses for its own diagnosis.
pub fn last_error_line(lines: &[String]) -> Option<&str> {
    lines
        .iter()
        .rev()
        .map(|l| l.trim())
        .find(|l| l.starts_with("ERROR:"))
}

/// Bounded buffer of the most recent lines, kept for error reporting.
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: VecDeque<String>,
    cap: usize,
}

impl OutputTail {
    pub fn new(cap: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.cap == 0 {
            return;
        }
        if self.lines.len() == self.cap {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn into_vec(self) -> Vec<String> {
        self.lines.into()
    }

    pub fn as_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

/// Line reader with a persistent buffer so a read interrupted by `select!`
/// resumes where it left off. Invalid UTF-8 is replaced, not rejected.
struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::with_capacity(256),
        }
    }

    async fn next_line(&mut self) -> io::Result<Option<String>> {
        let n = self.reader.read_until(b'\n', &mut self.buf).await?;
        if n == 0 && self.buf.is_empty() {
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&self.buf)
            .trim_end_matches(|c| c == '\n' || c == '\r')
            .to_string();
        self.buf.clear();
        Ok(Some(text))
    }
}

/// A live yt-dlp process. Dropping it kills the process.
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    stdout: Option<LineReader<ChildStdout>>,
    stderr: Option<LineReader<ChildStderr>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle").field("pid", &self.pid).finish()
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Next line from either pipe, in arrival order. `None` once both pipes
    /// are closed. A read error closes the affected pipe.
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        loop {
            let (stream, res) = match (self.stdout.as_mut(), self.stderr.as_mut()) {
                (None, None) => return None,
                (Some(out), None) => (Stream::Stdout, out.next_line().await),
                (None, Some(err)) => (Stream::Stderr, err.next_line().await),
                (Some(out), Some(err)) => tokio::select! {
                    r = out.next_line() => (Stream::Stdout, r),
                    r = err.next_line() => (Stream::Stderr, r),
                },
            };

            match res {
                Ok(Some(text)) => return Some(OutputLine { stream, text }),
                Ok(None) => self.close(stream),
                Err(e) => {
                    log::error!("Error reading yt-dlp {:?}: {}", stream, e);
                    self.close(stream);
                }
            }
        }
    }

    fn close(&mut self, stream: Stream) {
        match stream {
            Stream::Stdout => self.stdout = None,
            Stream::Stderr => self.stderr = None,
        }
    }

    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Ask the process to stop, wait up to `grace`, then force-kill.
    /// Returns the exit status when one could be collected.
    pub async fn terminate(&mut self, grace: Duration) -> Option<ExitStatus> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return Some(status);
        }

        let requested = match self.pid {
            Some(pid) => request_graceful_stop(pid).await,
            None => false,
        };

        if requested {
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(Ok(status)) => return Some(status),
                Ok(Err(e)) => log::warn!("Waiting for yt-dlp to stop failed: {}", e),
                Err(_) => log::warn!("yt-dlp didn't stop within {:?}, forcing kill", grace),
            }
        } else {
            log::debug!("Graceful stop unavailable, forcing kill");
        }

        self.kill().await
    }

    /// Force-kill and reap.
    pub async fn kill(&mut self) -> Option<ExitStatus> {
        #[cfg(windows)]
        if let Some(pid) = self.pid {
            let mut cmd = Command::new("taskkill");
            cmd.args(["/F", "/T", "/PID", &pid.to_string()])
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            cmd.creation_flags(CREATE_NO_WINDOW);
            let _ = cmd.status().await;
        }

        if let Err(e) = self.child.kill().await {
            log::debug!("kill: {}", e);
        }
        self.child.wait().await.ok()
    }
}

async fn request_graceful_stop(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let mut cmd = Command::new("kill");
        cmd.args(["-TERM", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd.status().await.map(|s| s.success()).unwrap_or(false)
    }

    #[cfg(windows)]
    {
        // Non-forced taskkill asks the process tree to close.
        let mut cmd = Command::new("taskkill");
        cmd.args(["/PID", &pid.to_string(), "/T"])
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd.creation_flags(CREATE_NO_WINDOW);
        return cmd.status().await.map(|s| s.success()).unwrap_or(false);
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = pid;
        false
    }
}
