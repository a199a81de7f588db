use crate::native::{LOGON32_LOGON_INTERACTIVE, LOGON32_PROVIDER_DEFAULT};

/// Upper bound on `ResumeThread` calls made by a single `start()`.
pub const DEFAULT_MAX_RESUME_ATTEMPTS: u32 = 64;

pub const DEFAULT_INTERPRETER: &str = "powershell.exe";

/// Tunables shared by the dispatcher, the launcher and the command runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherConfig {
    /// `dwLogonType` for `LogonUserW`.
    pub logon_type: u32,
    /// `dwLogonProvider` for `LogonUserW`.
    pub logon_provider: u32,
    pub max_resume_attempts: u32,
    /// Program that command strings are handed to.
    pub interpreter: String,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            logon_type: LOGON32_LOGON_INTERACTIVE,
            logon_provider: LOGON32_PROVIDER_DEFAULT,
            max_resume_attempts: DEFAULT_MAX_RESUME_ATTEMPTS,
            interpreter: DEFAULT_INTERPRETER.to_string(),
        }
    }
}

impl LauncherConfig {
    pub fn with_logon_type(mut self, logon_type: u32) -> Self {
        self.logon_type = logon_type;
        self
    }

    pub fn with_logon_provider(mut self, provider: u32) -> Self {
        self.logon_provider = provider;
        self
    }

    /// Values below one are raised to one; `start()` always resumes once.
    pub fn with_max_resume_attempts(mut self, attempts: u32) -> Self {
        self.max_resume_attempts = attempts.max(1);
        self
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }
}
