use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, ValueEnum};
use runas_launcher::{
    Account, CreationFlags, CreationMode, CreationRequest, LauncherConfig, Launcher, NativeApi,
    Options, Runas, StdioConfig,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// How the child process is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Create the process as the current account
    Direct,
    /// CreateProcessWithLogonW with the given credentials
    Logon,
    /// LogonUserW followed by CreateProcessAsUserW
    Impersonate,
}

/// Run a command as another Windows account and relay its output.
#[derive(Parser, Debug)]
#[command(
    name = "runas-launcher",
    version,
    about = "Run a command as another Windows account",
    group(
        ArgGroup::new("profile_mode")
            .args(["profile", "no_profile", "netonly"])
            .multiple(false)
    )
)]
struct Args {
    /// Username to run the command as, optionally `DOMAIN\user`
    #[arg(short)]
    username: String,

    /// Password for the user
    #[arg(short, env = "RUNAS_PASSWORD", hide_env_values = true)]
    password: String,

    /// Domain of the user (overrides a `DOMAIN\` prefix)
    #[arg(short = 'd', long)]
    domain: Option<String>,

    /// Command line to execute as the specified user
    #[arg(short, long)]
    command: String,

    /// Creation mode; picked from the current account when omitted
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Run the command through `%ComSpec% /c` with a hidden window
    #[arg(long)]
    shell: bool,

    /// Use the environment of the current user
    #[arg(short)]
    env: bool,

    /// Load user profile
    #[arg(long)]
    profile: bool,

    /// Do not load user profile
    #[arg(long = "noprofile")]
    no_profile: bool,

    /// Use credentials for remote access only
    #[arg(long)]
    netonly: bool,

    /// Create the process with a new console window
    #[arg(long = "new-console", requires = "mode")]
    new_console: bool,

    /// Create the process with a new process group
    #[arg(long = "new-process-group", requires = "mode")]
    new_process_group: bool,

    /// Create the process without a console window
    #[arg(long = "no-window", requires = "mode")]
    no_window: bool,

    /// Detach the process from the current console
    #[arg(long, requires = "mode")]
    detached: bool,

    /// Upper bound on ResumeThread calls when starting the process
    #[arg(long, default_value_t = runas_launcher::DEFAULT_MAX_RESUME_ATTEMPTS)]
    max_resume_attempts: u32,

    /// Log lifecycle events to stderr (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn options(&self) -> Options {
        let mut options = Options(0);
        if self.env {
            options = options | Options::Env;
        }
        if self.profile {
            options = options | Options::Profile;
        }
        if self.no_profile {
            options = options | Options::NoProfile;
        }
        if self.netonly {
            options = options | Options::NetOnly;
        }
        options
    }

    fn creation_flags(&self) -> CreationFlags {
        let mut flags = CreationFlags::SUSPENDED;
        if self.new_console {
            flags |= CreationFlags::NEW_CONSOLE;
        }
        if self.new_process_group {
            flags |= CreationFlags::NEW_PROCESS_GROUP;
        }
        if self.no_window {
            flags |= CreationFlags::NO_WINDOW;
        }
        if self.detached {
            flags |= CreationFlags::DETACHED;
        }
        flags
    }

    fn account(&self) -> Account {
        let mut account = Account::parse(&self.username);
        if let Some(domain) = &self.domain {
            account.domain = domain.clone();
        }
        account
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(windows)]
fn native_api() -> Result<Arc<dyn NativeApi>> {
    Ok(runas_launcher::Win32Api::shared())
}

#[cfg(not(windows))]
fn native_api() -> Result<Arc<dyn NativeApi>> {
    anyhow::bail!("runas-launcher only runs on Windows")
}

/// Runs through the credential-aware helper, which picks the creation mode.
fn run_auto(api: Arc<dyn NativeApi>, args: &Args, config: LauncherConfig) -> Result<(String, String, u32)> {
    let account = args.account();
    let credential = account.with_password(&args.password);
    let mut captured = Runas::with_credential(api, credential)
        .config(config)
        .options(args.options())?
        .use_shell(args.shell)
        .run(&args.command)
        .with_context(|| format!("failed to run `{}` as {}\\{}", args.command, account.domain, account.username))?;
    let code = captured.wait()?;
    Ok((captured.stdout().to_string(), captured.stderr().to_string(), code))
}

/// Runs with an explicit creation mode and creation flags.
fn run_explicit(
    api: Arc<dyn NativeApi>,
    args: &Args,
    mode: Mode,
    config: LauncherConfig,
) -> Result<(String, String, u32)> {
    let credential = args.account().with_password(&args.password);
    let mode = match mode {
        Mode::Direct => CreationMode::Direct,
        Mode::Logon => CreationMode::logon(credential),
        Mode::Impersonate => CreationMode::LogonThenImpersonate { credential },
    };

    let mut request = CreationRequest::new(args.command.as_str())
        .flags(args.creation_flags())
        .mode(mode)
        .use_shell(args.shell);
    if args.env {
        request = request.environment(runas_launcher::current_environment());
    }

    let launcher = Launcher::with_config(api, config);
    let mut process = launcher
        .spawn(&request, StdioConfig::captured())
        .with_context(|| format!("failed to create `{}`", args.command))?;
    debug!(pid = process.pid(), "created suspended process");
    process.start()?;

    let (stdout, stderr) = process.read_output()?;
    let code = process.wait()?;
    Ok((stdout, stderr, code))
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let api = native_api()?;
    let config = LauncherConfig::default().with_max_resume_attempts(args.max_resume_attempts);

    let (stdout, stderr, code) = match args.mode {
        None => run_auto(api, &args, config)?,
        Some(mode) => run_explicit(api, &args, mode, config)?,
    };

    print!("{stdout}");
    eprint!("{stderr}");
    std::io::stdout().flush()?;
    std::process::exit(code as i32)
}
