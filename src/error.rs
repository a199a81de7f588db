use std::time::Duration;

use thiserror::Error;

/// Convenient alias used throughout the crate.
pub type Result<T, E = LaunchError> = std::result::Result<T, E>;

/// Every failure the launcher can surface.
///
/// Variants that originate from a failed OS call carry the native error
/// code (`GetLastError`) so callers can match on it.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// Acquiring a token from credentials failed (bad password, access denied, ...).
    #[error("logon failed with native error {code}")]
    LogonFailure { code: u32 },

    /// One of the four process creation primitives failed.
    #[error("process creation failed with native error {code}")]
    CreateProcessFailure { code: u32 },

    /// The primary thread could not be resumed. `None` means the suspend
    /// count never dropped to one within the configured attempts.
    #[error("failed to resume the primary thread{}", describe_code(.code))]
    ResumeFailure { code: Option<u32> },

    #[error("processes can only be started once")]
    AlreadyStarted,

    #[error("process has not been started")]
    NotStarted,

    #[error("handle has already been closed or detached")]
    HandleAlreadyClosed,

    #[error("invalid creation mode: {0}")]
    InvalidCreationMode(String),

    #[error("invalid environment: {0}")]
    InvalidEnvironment(String),

    #[error("CloseHandle failed with native error {code}")]
    CloseFailure { code: u32 },

    /// Any other native primitive (pipes, waits, termination, ...).
    #[error("{call} failed with native error {code}")]
    Native { call: &'static str, code: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A command ran but reported failure through its exit code or stderr.
    #[error("command exited with code {exit_code}: {}", failure_text(.stderr, .stdout))]
    CommandFailed {
        exit_code: u32,
        stderr: String,
        stdout: String,
    },

    #[error("command produced no output: {0}")]
    EmptyOutput(String),

    #[error("command did not finish within {0:?}")]
    Timeout(Duration),
}

impl LaunchError {
    /// The native OS error code behind this error, if there is one.
    pub fn native_code(&self) -> Option<u32> {
        match self {
            LaunchError::LogonFailure { code }
            | LaunchError::CreateProcessFailure { code }
            | LaunchError::CloseFailure { code }
            | LaunchError::Native { code, .. } => Some(*code),
            LaunchError::ResumeFailure { code } => *code,
            LaunchError::Io(err) => err.raw_os_error().map(|code| code as u32),
            _ => None,
        }
    }

    /// Errors caused by calling the API in the wrong order or with bad input.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            LaunchError::AlreadyStarted
                | LaunchError::NotStarted
                | LaunchError::HandleAlreadyClosed
                | LaunchError::InvalidCreationMode(_)
                | LaunchError::InvalidEnvironment(_)
        )
    }
}

fn describe_code(code: &Option<u32>) -> String {
    match code {
        Some(code) => format!(" (native error {code})"),
        None => " (suspend count did not converge)".to_string(),
    }
}

fn failure_text<'a>(stderr: &'a str, stdout: &'a str) -> &'a str {
    if stderr.trim().is_empty() {
        stdout.trim()
    } else {
        stderr.trim()
    }
}
