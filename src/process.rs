use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::LauncherConfig;
use crate::dispatch::ProcessCreationDispatcher;
use crate::error::{LaunchError, Result};
use crate::handle::{NativeHandle, RawHandle};
use crate::native::{NativeApi, StdHandles, StdStream, WaitStatus, WAIT_TIMEOUT};
use crate::pipe::{drain, Pipe, PipeReader, PipeWriter, Stdio};
use crate::record::ProcessRecord;
use crate::request::CreationRequest;

/// Exit code used when the launcher has to kill a child itself.
const TERMINATED_EXIT_CODE: u32 = 1;

/// Wiring of the child's three standard streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StdioConfig {
    pub stdin: Stdio,
    pub stdout: Stdio,
    pub stderr: Stdio,
}

impl StdioConfig {
    /// All three streams inherited from the current process.
    pub fn inherit() -> Self {
        Self::default()
    }

    /// stdin from `NUL`, stdout and stderr piped back to the caller.
    pub fn captured() -> Self {
        Self {
            stdin: Stdio::Null,
            stdout: Stdio::Piped,
            stderr: Stdio::Piped,
        }
    }

    pub fn stdin(mut self, stdio: Stdio) -> Self {
        self.stdin = stdio;
        self
    }

    pub fn stdout(mut self, stdio: Stdio) -> Self {
        self.stdout = stdio;
        self
    }

    pub fn stderr(mut self, stdio: Stdio) -> Self {
        self.stderr = stdio;
        self
    }

    fn is_redirected(&self) -> bool {
        [self.stdin, self.stdout, self.stderr]
            .iter()
            .any(|stdio| *stdio != Stdio::Inherit)
    }
}

/// Creates processes with their standard streams wired up.
#[derive(Debug, Clone)]
pub struct Launcher {
    dispatcher: ProcessCreationDispatcher,
}

impl Launcher {
    pub fn new(api: Arc<dyn NativeApi>) -> Self {
        Self::with_config(api, LauncherConfig::default())
    }

    pub fn with_config(api: Arc<dyn NativeApi>, config: LauncherConfig) -> Self {
        Self {
            dispatcher: ProcessCreationDispatcher::with_config(api, config),
        }
    }

    pub fn dispatcher(&self) -> &ProcessCreationDispatcher {
        &self.dispatcher
    }

    /// Creates the process described by `request`.
    ///
    /// If the request asks for suspended creation, the returned process must
    /// be [`start`](LaunchedProcess::start)ed before it runs.
    pub fn spawn(&self, request: &CreationRequest, stdio: StdioConfig) -> Result<LaunchedProcess> {
        let api = self.dispatcher.api().clone();

        // Handles the child inherits. Dropped (closed in this process) as
        // soon as the creation attempt is over.
        let mut child_ends = Vec::new();
        let (stdin, parent_stdin) = input_end(&api, stdio.stdin, &mut child_ends)?;
        let (stdout, parent_stdout) = output_end(&api, stdio.stdout, StdStream::Output, &mut child_ends)?;
        let (stderr, parent_stderr) = output_end(&api, stdio.stderr, StdStream::Error, &mut child_ends)?;

        let mut request = request.clone();
        if stdio.is_redirected() {
            request.startup.std_handles = Some(StdHandles {
                input: stdin,
                output: stdout,
                error: stderr,
            });
            request.inherit_handles = true;
        }

        let created = self.dispatcher.create(&request);
        drop(child_ends);
        let record = created?;

        let mut process = LaunchedProcess {
            record,
            api,
            max_resume_attempts: self.dispatcher.config().max_resume_attempts,
            stdin: parent_stdin,
            stdout: parent_stdout,
            stderr: parent_stderr,
            started: !request.is_suspended(),
            exit_code: None,
        };
        if process.started {
            process.release_thread();
        }
        Ok(process)
    }
}

fn input_end(
    api: &Arc<dyn NativeApi>,
    stdio: Stdio,
    child_ends: &mut Vec<NativeHandle>,
) -> Result<(RawHandle, Option<PipeWriter>)> {
    match stdio {
        Stdio::Inherit => Ok((api.std_handle(StdStream::Input), None)),
        Stdio::Null => {
            let null = Pipe::null(api, false)?;
            let raw = null.as_raw()?;
            child_ends.push(null);
            Ok((raw, None))
        }
        Stdio::Piped => {
            let (reader, writer) = Pipe::create(api)?;
            reader.make_inheritable()?;
            let raw = reader.as_raw()?;
            child_ends.push(reader.into_handle());
            Ok((raw, Some(writer)))
        }
    }
}

fn output_end(
    api: &Arc<dyn NativeApi>,
    stdio: Stdio,
    stream: StdStream,
    child_ends: &mut Vec<NativeHandle>,
) -> Result<(RawHandle, Option<PipeReader>)> {
    match stdio {
        Stdio::Inherit => Ok((api.std_handle(stream), None)),
        Stdio::Null => {
            let null = Pipe::null(api, true)?;
            let raw = null.as_raw()?;
            child_ends.push(null);
            Ok((raw, None))
        }
        Stdio::Piped => {
            let (reader, writer) = Pipe::create(api)?;
            writer.make_inheritable()?;
            let raw = writer.as_raw()?;
            child_ends.push(writer.into_handle());
            Ok((raw, Some(reader)))
        }
    }
}

/// A created child process together with the parent ends of its pipes.
///
/// Dropping a `LaunchedProcess` whose exit has not been observed terminates
/// the child, so a suspended process is never left behind.
#[derive(Debug)]
pub struct LaunchedProcess {
    record: ProcessRecord,
    api: Arc<dyn NativeApi>,
    max_resume_attempts: u32,
    stdin: Option<PipeWriter>,
    stdout: Option<PipeReader>,
    stderr: Option<PipeReader>,
    started: bool,
    exit_code: Option<u32>,
}

impl LaunchedProcess {
    pub fn pid(&self) -> u32 {
        self.record.process_id()
    }

    pub fn thread_id(&self) -> u32 {
        self.record.thread_id()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn record(&self) -> &ProcessRecord {
        &self.record
    }

    /// Resumes the primary thread of a suspended process.
    ///
    /// `ResumeThread` is repeated while the previous suspend count it reports
    /// is above one. If resuming fails or the count does not drop within the
    /// configured number of attempts, the process is terminated and
    /// [`LaunchError::ResumeFailure`] is returned.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(LaunchError::AlreadyStarted);
        }
        let thread = self.record.thread().as_raw()?;

        if let Err(error) = self.resume(thread) {
            warn!(pid = self.pid(), %error, "terminating process that could not be resumed");
            if let Err(error) = self.terminate() {
                warn!(pid = self.pid(), %error, "failed to terminate process");
            }
            return Err(error);
        }

        self.started = true;
        self.release_thread();
        debug!(pid = self.pid(), "process started");
        Ok(())
    }

    fn resume(&self, thread: RawHandle) -> Result<()> {
        let resume = || {
            self.api
                .resume_thread(thread)
                .map_err(|code| LaunchError::ResumeFailure { code: Some(code) })
        };

        let mut previous = resume()?;
        let mut calls = 1;
        let mut remaining = previous.saturating_sub(1);
        while previous > 1 {
            if remaining == 0 || calls >= self.max_resume_attempts {
                debug!(pid = self.pid(), previous, calls, "suspend count did not converge");
                return Err(LaunchError::ResumeFailure { code: None });
            }
            previous = resume()?;
            calls += 1;
            remaining -= 1;
        }
        debug!(pid = self.pid(), calls, "thread resumed");
        Ok(())
    }

    fn release_thread(&mut self) {
        if let Err(error) = self.record.thread_mut().close() {
            warn!(pid = self.pid(), %error, "failed to release thread handle");
        }
    }

    /// Takes the parent end of the stdin pipe. `None` when stdin was not
    /// piped or was already taken. The stdout and stderr variants behave the same.
    pub fn take_stdin(&mut self) -> Option<PipeWriter> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<PipeReader> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<PipeReader> {
        self.stderr.take()
    }

    /// Reads stdout until the child closes it.
    pub fn read_stdout(&mut self) -> Result<String> {
        self.stdout
            .as_mut()
            .ok_or(LaunchError::HandleAlreadyClosed)?
            .read_to_string_lossy()
    }

    /// Reads stderr until the child closes it.
    pub fn read_stderr(&mut self) -> Result<String> {
        self.stderr
            .as_mut()
            .ok_or(LaunchError::HandleAlreadyClosed)?
            .read_to_string_lossy()
    }

    /// Reads stdout and stderr to completion concurrently. Streams that are
    /// not piped (or were taken) read as empty.
    pub fn read_output(&mut self) -> Result<(String, String)> {
        drain(self.stdout.take(), self.stderr.take())
    }

    /// Blocks until the child exits and returns its exit code.
    pub fn wait(&mut self) -> Result<u32> {
        match self.wait_for(None)? {
            Some(code) => Ok(code),
            None => Err(LaunchError::Native {
                call: "WaitForSingleObject",
                code: WAIT_TIMEOUT,
            }),
        }
    }

    /// Waits at most `timeout`; `None` means the child is still running.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<u32>> {
        self.wait_for(Some(timeout))
    }

    /// Polls for the exit code without blocking.
    pub fn try_wait(&mut self) -> Result<Option<u32>> {
        self.wait_for(Some(Duration::ZERO))
    }

    fn wait_for(&mut self, timeout: Option<Duration>) -> Result<Option<u32>> {
        if let Some(code) = self.exit_code {
            return Ok(Some(code));
        }
        if !self.started {
            return Err(LaunchError::NotStarted);
        }
        self.reap(timeout)
    }

    fn reap(&mut self, timeout: Option<Duration>) -> Result<Option<u32>> {
        let process = self.record.process().as_raw()?;
        let status = self
            .api
            .wait_for_single_object(process, timeout)
            .map_err(|code| LaunchError::Native { call: "WaitForSingleObject", code })?;
        if status == WaitStatus::TimedOut {
            return Ok(None);
        }

        let code = self
            .api
            .exit_code_process(process)
            .map_err(|code| LaunchError::Native { call: "GetExitCodeProcess", code })?;
        debug!(pid = self.pid(), exit_code = code, "process exited");
        self.exit_code = Some(code);
        Ok(Some(code))
    }

    /// Forcibly ends the child and releases its handles. Terminating a
    /// process that already exited is a no-op apart from the release.
    pub fn terminate(&mut self) -> Result<()> {
        self.kill().map(|_| ())
    }

    /// Like [`terminate`](Self::terminate), reporting whether the child was
    /// actually killed (`false` when it had already exited).
    pub(crate) fn kill(&mut self) -> Result<bool> {
        let killed = self.end_process();
        self.release_thread();
        let closed = self.record.process_mut().close();
        let killed = killed?;
        closed?;
        Ok(killed)
    }

    fn end_process(&mut self) -> Result<bool> {
        if self.exit_code.is_some() || !self.record.process().is_open() {
            return Ok(false);
        }
        if self.reap(Some(Duration::ZERO))?.is_some() {
            return Ok(false);
        }

        let process = self.record.process().as_raw()?;
        if let Err(code) = self.api.terminate_process(process, TERMINATED_EXIT_CODE) {
            // The child may have exited between the poll and the kill.
            if self.reap(Some(Duration::ZERO))?.is_some() {
                return Ok(false);
            }
            return Err(LaunchError::Native { call: "TerminateProcess", code });
        }
        debug!(pid = self.pid(), "process terminated");
        if self.reap(None)?.is_none() {
            self.exit_code = Some(TERMINATED_EXIT_CODE);
        }
        Ok(true)
    }
}

impl Drop for LaunchedProcess {
    fn drop(&mut self) {
        self.release_thread();
        if self.exit_code.is_none() && self.record.process().is_open() {
            if let Err(error) = self.terminate() {
                warn!(pid = self.pid(), %error, "failed to terminate abandoned process");
            }
        }
    }
}
