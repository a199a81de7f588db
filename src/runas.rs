use std::collections::BTreeMap;
use std::ops::BitOr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::config::LauncherConfig;
use crate::error::{LaunchError, Result};
use crate::flags::CreationFlags;
use crate::native::{
    NativeApi, LOGON32_LOGON_NEW_CREDENTIALS, LOGON32_PROVIDER_WINNT50, LOGON_NETCREDENTIALS_ONLY,
    LOGON_WITH_PROFILE,
};
use crate::pipe::drain;
use crate::process::{LaunchedProcess, Launcher, StdioConfig};
use crate::request::{current_environment, CreationMode, CreationRequest, Credential};

/// Represents bitwise options for running processes with specific settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Options(pub u32);

#[allow(non_upper_case_globals)]
impl Options {
    /// Pass the caller's environment to the child (`/env`).
    pub const Env: Options = Options(0b0000_0001);

    /// Do not load the user profile (`/noprofile`).
    pub const NoProfile: Options = Options(0b0000_0010);

    /// Load the user profile (`/profile`).
    pub const Profile: Options = Options(0b0000_0100);

    /// Use the credentials for remote access only (`/netonly`).
    pub const NetOnly: Options = Options(0b0000_1000);

    /// Checks if the current [`Options`] instance contains the specified option.
    ///
    /// # Parameters
    ///
    /// * `other` - Another `Options` instance to check against.
    ///
    /// # Returns
    ///
    /// * `true` if every bit of `other` is set in `self`, `false` otherwise.
    ///
    /// # Example
    ///
    /// ```rust
    /// use runas_launcher::Options;
    ///
    /// let opts = Options::Env | Options::NetOnly;
    /// assert!(opts.contains(Options::Env));
    /// assert!(!opts.contains(Options::Profile));
    /// ```
    pub fn contains(self, other: Options) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl BitOr for Options {
    type Output = Self;

    /// Combines two [`Options`] instances using a bitwise OR operation.
    ///
    /// # Parameters
    ///
    /// * `rhs` - The right-hand side `Options` instance.
    ///
    /// # Returns
    ///
    /// * A new [`Options`] instance carrying the options of both sides.
    ///
    /// # Example
    ///
    /// ```rust
    /// use runas_launcher::Options;
    ///
    /// let combined = Options::Env | Options::NoProfile;
    /// assert!(combined.contains(Options::Env));
    /// assert!(combined.contains(Options::NoProfile));
    /// ```
    fn bitor(self, rhs: Self) -> Self::Output {
        Options(self.0 | rhs.0)
    }
}

/// Identity of the process doing the launching.
///
/// Processes running as a system or service account are refused
/// `CreateProcessWithLogonW` and have to mint a token instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    account_name: String,
}

impl ExecutionContext {
    pub fn new(account_name: impl Into<String>) -> Self {
        Self {
            account_name: account_name.into(),
        }
    }

    /// Queries the account the current process runs as.
    pub fn current(api: &dyn NativeApi) -> Result<Self> {
        let account_name = api
            .current_account_name()
            .map_err(|code| LaunchError::Native { call: "GetUserNameW", code })?;
        Ok(Self::new(account_name))
    }

    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    /// Case-insensitive match on `SYSTEM` or `SERVICE` anywhere in the name.
    pub fn is_system_or_service(&self) -> bool {
        let name = self.account_name.to_uppercase();
        name.contains("SYSTEM") || name.contains("SERVICE")
    }

    /// The creation mode a process in this context should use to launch as
    /// `credential`.
    pub fn select_mode(&self, credential: Credential, logon_flags: u32) -> CreationMode {
        if self.is_system_or_service() {
            CreationMode::LogonThenImpersonate { credential }
        } else {
            CreationMode::LogonWithCredentials {
                credential,
                logon_flags,
            }
        }
    }
}

/// Runs commands as another account and captures their output.
///
/// The child is created suspended with stdin on `NUL` and both output
/// streams piped. It is resumed once its pipes are in place and both streams
/// are drained before [`run`](Self::run) returns.
#[derive(Debug, Clone)]
pub struct Runas {
    /// Native calls are routed through this.
    api: Arc<dyn NativeApi>,

    /// Logon type, provider and resume bound.
    config: LauncherConfig,

    /// The account the command runs as.
    credential: Credential,

    /// Flags for logon operations (such as `/netonly` or `/profile`).
    logon_flags: u32,

    /// Explicit environment for the child; `None` inherits.
    environment: Option<BTreeMap<String, String>>,

    /// Working directory of the child.
    current_dir: Option<PathBuf>,

    /// Wrap the command in `%ComSpec% /c`.
    use_shell: bool,

    /// Who we are; queried from the OS when unset.
    context: Option<ExecutionContext>,
}

impl Runas {
    /// Creates a new [`Runas`] for the given account.
    ///
    /// # Parameters
    ///
    /// * `api` - The native backend, usually `Win32Api::shared()`.
    /// * `username` - The username of the target account.
    /// * `password` - The password for the account.
    /// * `domain` - The domain of the account; `None` means `"."`, the local machine.
    ///
    /// # Returns
    ///
    /// * A [`Runas`] with no logon flags, an inherited environment and the
    ///   default [`LauncherConfig`].
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let runas = Runas::new(Win32Api::shared(), "deploy", "s3cret", Some("CORP"));
    /// ```
    pub fn new(api: Arc<dyn NativeApi>, username: &str, password: &str, domain: Option<&str>) -> Self {
        Self::with_credential(api, Credential::new(username, password, domain))
    }

    /// Creates a new [`Runas`] from an existing [`Credential`].
    pub fn with_credential(api: Arc<dyn NativeApi>, credential: Credential) -> Self {
        Self {
            api,
            config: LauncherConfig::default(),
            credential,
            logon_flags: 0,
            environment: None,
            current_dir: None,
            use_shell: false,
            context: None,
        }
    }

    /// Replaces the [`LauncherConfig`]. Apply this before
    /// [`options`](Self::options), which may adjust the logon type.
    pub fn config(mut self, config: LauncherConfig) -> Self {
        self.config = config;
        self
    }

    /// Applies the `runas` switches carried by `flags`.
    ///
    /// # Parameters
    ///
    /// * `flags` - Any combination of [`Options`].
    ///
    /// # Returns
    ///
    /// * The updated [`Runas`].
    /// * [`LaunchError::InvalidCreationMode`] if `/profile` is combined with
    ///   `/noprofile` or `/netonly`.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let runas = Runas::new(Win32Api::shared(), "deploy", "s3cret", None)
    ///     .options(Options::Env | Options::NetOnly)?;
    /// ```
    pub fn options(mut self, flags: Options) -> Result<Self> {
        if flags.contains(Options::Profile) && flags.contains(Options::NoProfile) {
            return Err(LaunchError::InvalidCreationMode(
                "`/profile` is not compatible with `/noprofile`".to_string(),
            ));
        }

        if flags.contains(Options::Profile) && flags.contains(Options::NetOnly) {
            return Err(LaunchError::InvalidCreationMode(
                "`/profile` is not compatible with `/netonly`".to_string(),
            ));
        }

        if flags.contains(Options::Profile) {
            self.logon_flags = LOGON_WITH_PROFILE;
        } else if flags.contains(Options::NoProfile) {
            self.logon_flags &= !LOGON_WITH_PROFILE;
        }

        if flags.contains(Options::NetOnly) {
            self.logon_flags |= LOGON_NETCREDENTIALS_ONLY;
            self.config.logon_type = LOGON32_LOGON_NEW_CREDENTIALS;
            self.config.logon_provider = LOGON32_PROVIDER_WINNT50;
        }

        if flags.contains(Options::Env) {
            self.environment = Some(current_environment());
        }

        Ok(self)
    }

    /// Sets the exact environment of the child.
    pub fn environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Sets the working directory of the child.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Runs the command through `%ComSpec% /c` with a hidden window.
    pub fn use_shell(mut self, use_shell: bool) -> Self {
        self.use_shell = use_shell;
        self
    }

    /// Uses `context` instead of asking the OS who we are.
    pub fn context(mut self, context: ExecutionContext) -> Self {
        self.context = Some(context);
        self
    }

    fn request(&self, command: &str, context: &ExecutionContext) -> CreationRequest {
        let mut request = CreationRequest::new(command)
            .flags(CreationFlags::SUSPENDED | CreationFlags::DETACHED)
            .mode(context.select_mode(self.credential.clone(), self.logon_flags))
            .use_shell(self.use_shell);
        request.environment = self.environment.clone();
        request.current_directory = self.current_dir.clone();
        request
    }

    /// Launches `command` as the configured account and reads its output.
    ///
    /// # Parameters
    ///
    /// * `command` - The command line to execute.
    ///
    /// # Returns
    ///
    /// * A [`CapturedProcess`] once both output streams are closed. Use
    ///   [`CapturedProcess::wait`] for the exit code.
    /// * An error if the logon, the creation or the resume fails.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let mut process = Runas::new(Win32Api::shared(), "deploy", "s3cret", None)
    ///     .run("cmd.exe /c whoami")?;
    /// println!("{}", process.stdout());
    /// ```
    pub fn run(&self, command: &str) -> Result<CapturedProcess> {
        let mut process = self.spawn(command)?;
        let (stdout, stderr) = drain(process.take_stdout(), process.take_stderr())?;
        Ok(CapturedProcess {
            process,
            stdout,
            stderr,
        })
    }

    /// Launches and resumes `command` without reading its output.
    ///
    /// The returned process still owns its stdout and stderr pipes; take
    /// them or call [`LaunchedProcess::read_output`].
    pub fn spawn(&self, command: &str) -> Result<LaunchedProcess> {
        let context = match &self.context {
            Some(context) => context.clone(),
            None => ExecutionContext::current(self.api.as_ref())?,
        };
        let request = self.request(command, &context);
        debug!(
            username = self.credential.username(),
            domain = self.credential.domain(),
            caller = context.account_name(),
            mode = %request.mode,
            "running command as another account"
        );

        let launcher = Launcher::with_config(self.api.clone(), self.config.clone());
        let mut process = launcher.spawn(&request, StdioConfig::captured())?;
        process.start()?;
        Ok(process)
    }
}

/// A process started by [`Runas::run`] whose output has been fully read.
#[derive(Debug)]
pub struct CapturedProcess {
    process: LaunchedProcess,
    stdout: String,
    stderr: String,
}

impl CapturedProcess {
    /// Process id of the child.
    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// Blocks until the child exits and returns its exit code.
    pub fn wait(&mut self) -> Result<u32> {
        self.process.wait()
    }

    pub fn process_mut(&mut self) -> &mut LaunchedProcess {
        &mut self.process
    }
}
