use core::fmt;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;

use crate::error::{LaunchError, Result};
use crate::flags::CreationFlags;
use crate::handle::{NativeHandle, RawHandle};
use crate::native::{SecurityAttributes, StartupInfo, SW_HIDE};

/// Plaintext credentials for a logon.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    username: String,
    domain: String,
    password: String,
}

impl Credential {
    /// `domain` defaults to `"."`, the local machine.
    pub fn new(username: &str, password: &str, domain: Option<&str>) -> Self {
        Self {
            username: username.to_string(),
            domain: domain.unwrap_or(".").to_string(),
            password: password.to_string(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("domain", &self.domain)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// An account name, optionally qualified as `DOMAIN\user`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub domain: String,
    pub username: String,
}

impl Account {
    /// Splits `DOMAIN\user`. An unqualified name belongs to the local machine (`"."`).
    pub fn parse(name: &str) -> Self {
        match name.split_once('\\') {
            Some((domain, username)) => Self {
                domain: domain.to_string(),
                username: username.to_string(),
            },
            None => Self {
                domain: ".".to_string(),
                username: name.to_string(),
            },
        }
    }

    pub fn with_password(&self, password: &str) -> Credential {
        Credential::new(&self.username, password, Some(&self.domain))
    }
}

/// How the process is created, with exactly the data each path needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreationMode {
    /// `CreateProcessW` as the current account.
    Direct,
    /// `CreateProcessWithLogonW`. Refused by the OS for service and system callers.
    LogonWithCredentials {
        credential: Credential,
        logon_flags: u32,
    },
    /// `CreateProcessWithTokenW` with a token the caller owns and keeps owning.
    ExistingToken { token: RawHandle, logon_flags: u32 },
    /// `LogonUserW` followed by `CreateProcessAsUserW`.
    LogonThenImpersonate { credential: Credential },
}

impl CreationMode {
    pub fn logon(credential: Credential) -> Self {
        CreationMode::LogonWithCredentials {
            credential,
            logon_flags: 0,
        }
    }

    /// Borrows `token` for the creation call; it is not closed by the launcher.
    pub fn existing_token(token: &NativeHandle, logon_flags: u32) -> Result<Self> {
        Ok(CreationMode::ExistingToken {
            token: token.as_raw()?,
            logon_flags,
        })
    }

    pub fn kind(&self) -> ModeKind {
        match self {
            CreationMode::Direct => ModeKind::Direct,
            CreationMode::LogonWithCredentials { .. } => ModeKind::LogonWithCredentials,
            CreationMode::ExistingToken { .. } => ModeKind::ExistingToken,
            CreationMode::LogonThenImpersonate { .. } => ModeKind::LogonThenImpersonate,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            CreationMode::Direct => Ok(()),
            CreationMode::LogonWithCredentials { credential, .. }
            | CreationMode::LogonThenImpersonate { credential } => {
                if credential.username().is_empty() {
                    Err(LaunchError::InvalidCreationMode(format!(
                        "{} requires a username",
                        self.kind()
                    )))
                } else {
                    Ok(())
                }
            }
            CreationMode::ExistingToken { token, .. } => {
                if crate::handle::is_invalid(*token) {
                    Err(LaunchError::InvalidCreationMode(
                        "ExistingToken requires a valid token handle".to_string(),
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }
}

impl fmt::Display for CreationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind(), f)
    }
}

/// The creation path without its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModeKind {
    Direct,
    LogonWithCredentials,
    ExistingToken,
    LogonThenImpersonate,
}

impl ModeKind {
    /// The logon and token primitives always give the child a new console.
    pub fn implies_new_console(self) -> bool {
        !matches!(self, ModeKind::Direct)
    }
}

impl fmt::Display for ModeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModeKind::Direct => "Direct",
            ModeKind::LogonWithCredentials => "LogonWithCredentials",
            ModeKind::ExistingToken => "ExistingToken",
            ModeKind::LogonThenImpersonate => "LogonThenImpersonate",
        };
        f.write_str(name)
    }
}

/// Everything a creation call needs.
#[derive(Debug, Clone)]
pub struct CreationRequest {
    pub application_name: Option<String>,
    pub command_line: String,
    pub process_attributes: Option<SecurityAttributes>,
    pub thread_attributes: Option<SecurityAttributes>,
    pub inherit_handles: bool,
    pub creation_flags: CreationFlags,
    /// Replaces the child's environment when set. Ordered by key.
    pub environment: Option<BTreeMap<String, String>>,
    pub current_directory: Option<PathBuf>,
    /// Run the command line through `%ComSpec% /c` with a hidden window.
    pub use_shell: bool,
    pub startup: StartupInfo,
    pub mode: CreationMode,
}

impl CreationRequest {
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            application_name: None,
            command_line: command_line.into(),
            process_attributes: None,
            thread_attributes: None,
            inherit_handles: false,
            creation_flags: CreationFlags::NONE,
            environment: None,
            current_directory: None,
            use_shell: false,
            startup: StartupInfo::default(),
            mode: CreationMode::Direct,
        }
    }

    pub fn mode(mut self, mode: CreationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn flags(mut self, flags: CreationFlags) -> Self {
        self.creation_flags |= flags;
        self
    }

    pub fn suspended(self) -> Self {
        self.flags(CreationFlags::SUSPENDED)
    }

    pub fn is_suspended(&self) -> bool {
        self.creation_flags.contains(CreationFlags::SUSPENDED)
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    pub fn inherit_handles(mut self, inherit: bool) -> Self {
        self.inherit_handles = inherit;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_directory = Some(dir.into());
        self
    }

    pub fn use_shell(mut self, use_shell: bool) -> Self {
        self.use_shell = use_shell;
        self
    }

    /// The command line as it will reach the OS.
    pub(crate) fn resolved_command_line(&self) -> String {
        if self.use_shell {
            let comspec = std::env::var("ComSpec").ok();
            let system_root = std::env::var("SystemRoot").ok();
            shell_command_line(&self.command_line, comspec.as_deref(), system_root.as_deref())
        } else {
            self.command_line.clone()
        }
    }

    /// The startup info as it will reach the OS.
    pub(crate) fn resolved_startup(&self) -> StartupInfo {
        let mut startup = self.startup.clone();
        if self.use_shell {
            startup.show_window = Some(SW_HIDE);
        }
        startup
    }
}

/// Wraps `command` as `"<comspec>" /c "<command>"`.
pub fn shell_command_line(command: &str, comspec: Option<&str>, system_root: Option<&str>) -> String {
    let comspec = match comspec {
        Some(comspec) => comspec.to_string(),
        None => format!("{}\\System32\\cmd.exe", system_root.unwrap_or("C:\\Windows")),
    };
    format!("\"{comspec}\" /c \"{command}\"")
}

/// Encodes an environment as a UTF-16 block: `k=v\0...k=v\0\0`.
///
/// Entries are emitted in key order. An empty environment is `\0\0`.
pub fn environment_block(environment: &BTreeMap<String, String>) -> Result<Vec<u16>> {
    let mut block = Vec::new();
    for (key, value) in environment {
        if key.is_empty() || key.chars().skip(1).any(|c| c == '=') || key.contains('\0') {
            return Err(LaunchError::InvalidEnvironment(format!("bad variable name {key:?}")));
        }
        if value.contains('\0') {
            return Err(LaunchError::InvalidEnvironment(format!(
                "value of {key:?} contains NUL"
            )));
        }
        block.extend(key.encode_utf16());
        block.push('=' as u16);
        block.extend(value.encode_utf16());
        block.push(0);
    }
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);
    Ok(block)
}

/// Snapshot of the current process environment.
///
/// Windows allows variables that are not valid Unicode; those are converted
/// lossily instead of aborting the snapshot.
pub fn current_environment() -> BTreeMap<String, String> {
    collect_environment(std::env::vars_os())
}

fn collect_environment(vars: impl IntoIterator<Item = (OsString, OsString)>) -> BTreeMap<String, String> {
    vars.into_iter()
        .map(|(key, value)| {
            (
                key.to_string_lossy().into_owned(),
                value.to_string_lossy().into_owned(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn not_unicode(prefix: &str) -> OsString {
        use std::os::unix::ffi::OsStringExt;
        let mut bytes = prefix.as_bytes().to_vec();
        bytes.push(0xff);
        OsString::from_vec(bytes)
    }

    #[cfg(windows)]
    fn not_unicode(prefix: &str) -> OsString {
        use std::os::windows::ffi::OsStringExt;
        let mut wide: Vec<u16> = prefix.encode_utf16().collect();
        wide.push(0xD800);
        OsString::from_wide(&wide)
    }

    #[test]
    fn environment_snapshot_tolerates_non_unicode_values() {
        let environment = collect_environment([
            (OsString::from("GOOD"), OsString::from("1")),
            (OsString::from("BAD"), not_unicode("a")),
        ]);

        assert_eq!(environment["GOOD"], "1");
        assert_eq!(environment["BAD"], "a\u{FFFD}");
        assert!(environment_block(&environment).is_ok());
    }

    fn decode(block: &[u16]) -> String {
        String::from_utf16_lossy(block)
    }

    #[test]
    fn account_parsing() {
        assert_eq!(
            Account::parse("CORP\\svc_deploy"),
            Account {
                domain: "CORP".into(),
                username: "svc_deploy".into()
            }
        );
        assert_eq!(Account::parse("alice").domain, ".");
    }

    #[test]
    fn credential_debug_hides_password() {
        let credential = Credential::new("alice", "hunter2", None);
        let debug = format!("{credential:?}");
        assert!(!debug.contains("hunter2"));
        assert_eq!(credential.domain(), ".");
    }

    #[test]
    fn environment_block_is_sorted_and_double_terminated() {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), "C:\\bin".to_string());
        env.insert("A".to_string(), "1".to_string());

        let block = environment_block(&env).unwrap();
        assert_eq!(decode(&block), "A=1\0PATH=C:\\bin\0\0");
    }

    #[test]
    fn empty_environment_block() {
        let block = environment_block(&BTreeMap::new()).unwrap();
        assert_eq!(block, vec![0, 0]);
    }

    #[test]
    fn hidden_drive_variables_are_allowed() {
        let mut env = BTreeMap::new();
        env.insert("=C:".to_string(), "C:\\work".to_string());
        assert!(environment_block(&env).is_ok());
    }

    #[test]
    fn bad_environment_names_are_rejected() {
        let mut env = BTreeMap::new();
        env.insert("A=B".to_string(), "1".to_string());
        assert!(matches!(
            environment_block(&env),
            Err(LaunchError::InvalidEnvironment(_))
        ));
    }

    #[test]
    fn shell_wrapping() {
        assert_eq!(
            shell_command_line("dir", Some("C:\\Windows\\system32\\cmd.exe"), None),
            "\"C:\\Windows\\system32\\cmd.exe\" /c \"dir\""
        );
        assert_eq!(
            shell_command_line("dir", None, Some("D:\\Win")),
            "\"D:\\Win\\System32\\cmd.exe\" /c \"dir\""
        );
    }

    #[test]
    fn shell_requests_hide_the_window() {
        let request = CreationRequest::new("dir").use_shell(true);
        assert_eq!(request.resolved_startup().show_window, Some(SW_HIDE));
        assert!(request.resolved_command_line().ends_with("/c \"dir\""));
    }

    #[test]
    fn empty_username_is_an_invalid_mode() {
        let mode = CreationMode::logon(Credential::new("", "pw", None));
        assert!(matches!(mode.validate(), Err(LaunchError::InvalidCreationMode(_))));
        let mode = CreationMode::ExistingToken {
            token: 0,
            logon_flags: 0,
        };
        assert!(matches!(mode.validate(), Err(LaunchError::InvalidCreationMode(_))));
    }
}
