use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cmdline::join_args;
use crate::config::LauncherConfig;
use crate::error::{LaunchError, Result};
use crate::native::NativeApi;
use crate::pipe::drain;
use crate::process::{LaunchedProcess, Launcher, StdioConfig};
use crate::request::{Account, CreationRequest, Credential};
use crate::runas::{ExecutionContext, Runas};

/// Everything a finished command left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: u32,
    pub pid: u32,
}

impl CommandOutput {
    /// Exit code zero and nothing written to stderr.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.stderr.trim().is_empty()
    }

    fn check(self) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(LaunchError::CommandFailed {
                exit_code: self.exit_code,
                stderr: self.stderr,
                stdout: self.stdout,
            })
        }
    }
}

/// Runs interpreter commands, either as a configured account or as the
/// current one.
///
/// Every command line is `<interpreter> <command>`; the interpreter comes
/// from [`LauncherConfig::interpreter`].
#[derive(Debug, Clone)]
pub struct CommandRunner {
    api: Arc<dyn NativeApi>,
    config: LauncherConfig,
    credential: Option<Credential>,
    context: Option<ExecutionContext>,
}

impl CommandRunner {
    pub fn new(api: Arc<dyn NativeApi>, config: LauncherConfig) -> Self {
        Self {
            api,
            config,
            credential: None,
            context: None,
        }
    }

    /// Runs every command as `account`.
    pub fn with_account(mut self, account: Account, password: &str) -> Self {
        self.credential = Some(account.with_password(password));
        self
    }

    /// Uses `context` instead of asking the OS who we are.
    pub fn context(mut self, context: ExecutionContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Runs `command` and returns whatever it produced, failing only if it
    /// could not be launched.
    pub fn run_raw(&self, command: &str) -> Result<CommandOutput> {
        self.execute(&[self.config.interpreter.as_str(), command])
    }

    /// Runs `command`, requiring a zero exit code, an empty stderr and some
    /// output. Returns the trimmed stdout.
    pub fn run_checked(&self, command: &str) -> Result<String> {
        let output = self.run_raw(command)?.check()?;
        let stdout = output.stdout.trim();
        if stdout.is_empty() {
            return Err(LaunchError::EmptyOutput(command.to_string()));
        }
        Ok(stdout.to_string())
    }

    /// Runs a script file and returns its trimmed stdout.
    pub fn run_script<S: AsRef<str>>(&self, script: &str, args: &[S]) -> Result<String> {
        self.run_script_pid(script, args).map(|(stdout, _)| stdout)
    }

    /// Like [`run_script`](Self::run_script), also returning the pid the
    /// script ran under.
    pub fn run_script_pid<S: AsRef<str>>(&self, script: &str, args: &[S]) -> Result<(String, u32)> {
        let mut argv = vec![self.config.interpreter.as_str(), "-File", script];
        argv.extend(args.iter().map(|arg| arg.as_ref()));
        let output = self.execute(&argv)?.check()?;
        Ok((output.stdout.trim().to_string(), output.pid))
    }

    pub fn did_command_exit_successfully(&self, command: &str) -> bool {
        match self.run_raw(command) {
            Ok(output) => output.exit_code == 0,
            Err(error) => {
                warn!(command, %error, "command could not be run");
                false
            }
        }
    }

    /// Runs `command`, terminating it if it has not exited after `timeout`.
    pub fn run_with_timeout(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        let mut process = self.spawn(&[self.config.interpreter.as_str(), command])?;
        let stdout = process.take_stdout();
        let stderr = process.take_stderr();

        thread::scope(|scope| {
            let reader = scope.spawn(move || drain(stdout, stderr));
            let mut exited = process.wait_timeout(timeout);
            if !matches!(exited, Ok(Some(_))) {
                // Killing the child closes its pipes, which lets the reader finish.
                match process.kill() {
                    Ok(true) => {}
                    Ok(false) => exited = process.try_wait(),
                    Err(error) => warn!(pid = process.pid(), %error, "failed to terminate command"),
                }
            }
            let output = reader
                .join()
                .unwrap_or_else(|payload| std::panic::resume_unwind(payload));

            match exited? {
                Some(exit_code) => {
                    let (stdout, stderr) = output?;
                    Ok(CommandOutput {
                        stdout,
                        stderr,
                        exit_code,
                        pid: process.pid(),
                    })
                }
                None => {
                    info!(command, ?timeout, "command timed out");
                    Err(LaunchError::Timeout(timeout))
                }
            }
        })
    }

    fn execute(&self, argv: &[&str]) -> Result<CommandOutput> {
        let mut process = self.spawn(argv)?;
        let (stdout, stderr) = drain(process.take_stdout(), process.take_stderr())?;
        let exit_code = process.wait()?;
        debug!(pid = process.pid(), exit_code, "command finished");
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
            pid: process.pid(),
        })
    }

    fn spawn(&self, argv: &[&str]) -> Result<LaunchedProcess> {
        let command_line = join_args(argv);
        match &self.credential {
            Some(credential) => {
                let mut runas = Runas::with_credential(self.api.clone(), credential.clone())
                    .config(self.config.clone());
                if let Some(context) = &self.context {
                    runas = runas.context(context.clone());
                }
                runas.spawn(&command_line)
            }
            None => {
                info!(command_line, "running command as the current account");
                Launcher::with_config(self.api.clone(), self.config.clone())
                    .spawn(&CreationRequest::new(command_line), StdioConfig::captured())
            }
        }
    }
}
