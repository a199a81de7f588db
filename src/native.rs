//! The boundary between the launcher and the operating system.
//!
//! Every OS primitive the launcher needs is a method on [`NativeApi`]. The
//! Windows implementation lives in `win32.rs`; everything above this trait is
//! plain Rust and can be exercised against a fake.

use core::fmt;
use std::path::Path;
use std::time::Duration;

use crate::handle::RawHandle;
use crate::request::Credential;

/// Native calls report failure as the raw OS error code (`GetLastError`).
pub type NativeResult<T> = Result<T, u32>;

pub const LOGON32_LOGON_INTERACTIVE: u32 = 2;
pub const LOGON32_LOGON_NEW_CREDENTIALS: u32 = 9;
pub const LOGON32_PROVIDER_DEFAULT: u32 = 0;
pub const LOGON32_PROVIDER_WINNT50: u32 = 3;

pub const LOGON_WITH_PROFILE: u32 = 0x0000_0001;
pub const LOGON_NETCREDENTIALS_ONLY: u32 = 0x0000_0002;

/// Exit code reported by a process that is still running.
pub const STILL_ACTIVE: u32 = 259;

pub const WAIT_TIMEOUT: u32 = 258;

pub const SW_HIDE: u16 = 0;

pub const ERROR_ACCESS_DENIED: u32 = 5;
pub const ERROR_INVALID_HANDLE: u32 = 6;
pub const ERROR_BROKEN_PIPE: u32 = 109;
pub const ERROR_LOGON_FAILURE: u32 = 1326;

/// Opaque security attributes handed through to the creation primitives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityAttributes {
    pub inherit_handle: bool,
    /// Address of a `SECURITY_DESCRIPTOR`, or zero for the default.
    pub security_descriptor: usize,
}

/// The three standard handles given to a child when stdio is redirected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StdHandles {
    pub input: RawHandle,
    pub output: RawHandle,
    pub error: RawHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Input,
    Output,
    Error,
}

/// The subset of `STARTUPINFOW` the launcher controls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupInfo {
    /// When set, `STARTF_USESTDHANDLES` is applied with these handles.
    pub std_handles: Option<StdHandles>,
    /// When set, `STARTF_USESHOWWINDOW` is applied with this show command.
    pub show_window: Option<u16>,
    pub desktop: Option<String>,
}

/// Arguments shared by all four creation primitives.
#[derive(Debug, Clone, Copy)]
pub struct CreateCall<'a> {
    pub application_name: Option<&'a str>,
    pub command_line: &'a str,
    pub process_attributes: Option<&'a SecurityAttributes>,
    pub thread_attributes: Option<&'a SecurityAttributes>,
    pub inherit_handles: bool,
    pub creation_flags: u32,
    /// A complete UTF-16 environment block, double-NUL terminated.
    pub environment: Option<&'a [u16]>,
    pub current_directory: Option<&'a Path>,
    pub startup: &'a StartupInfo,
}

/// What a successful creation primitive hands back (`PROCESS_INFORMATION`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInformation {
    pub process: RawHandle,
    pub thread: RawHandle,
    pub process_id: u32,
    pub thread_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Signaled,
    TimedOut,
}

/// The OS primitives used by the launcher.
///
/// Implementations must be stateless with respect to any single launch:
/// concurrent launches share one instance behind an `Arc`.
pub trait NativeApi: Send + Sync + fmt::Debug {
    fn close_handle(&self, handle: RawHandle) -> NativeResult<()>;

    /// `CreateProcessW`
    fn create_process(&self, call: &CreateCall<'_>) -> NativeResult<ProcessInformation>;

    /// `CreateProcessWithLogonW`
    fn create_process_with_logon(
        &self,
        credential: &Credential,
        logon_flags: u32,
        call: &CreateCall<'_>,
    ) -> NativeResult<ProcessInformation>;

    /// `CreateProcessWithTokenW`
    fn create_process_with_token(
        &self,
        token: RawHandle,
        logon_flags: u32,
        call: &CreateCall<'_>,
    ) -> NativeResult<ProcessInformation>;

    /// `CreateProcessAsUserW`
    fn create_process_as_user(
        &self,
        token: RawHandle,
        call: &CreateCall<'_>,
    ) -> NativeResult<ProcessInformation>;

    /// `LogonUserW`. The token is written to `token` as the OS does, which
    /// may leave a value behind even when the call fails.
    fn logon_user(
        &self,
        credential: &Credential,
        logon_type: u32,
        provider: u32,
        token: &mut RawHandle,
    ) -> NativeResult<()>;

    /// `ResumeThread`, returning the previous suspend count.
    fn resume_thread(&self, thread: RawHandle) -> NativeResult<u32>;

    /// `WaitForSingleObject`; `None` waits forever.
    fn wait_for_single_object(
        &self,
        handle: RawHandle,
        timeout: Option<Duration>,
    ) -> NativeResult<WaitStatus>;

    fn exit_code_process(&self, process: RawHandle) -> NativeResult<u32>;

    fn terminate_process(&self, process: RawHandle, exit_code: u32) -> NativeResult<()>;

    /// Creates an anonymous pipe whose ends are both non-inheritable,
    /// returned as `(read, write)`.
    fn create_pipe(&self) -> NativeResult<(RawHandle, RawHandle)>;

    fn set_inheritable(&self, handle: RawHandle, inheritable: bool) -> NativeResult<()>;

    /// Opens the `NUL` device as an inheritable handle.
    fn open_null_device(&self, writable: bool) -> NativeResult<RawHandle>;

    /// Reads into `buf`; end of stream (including a closed writer) is `Ok(0)`.
    fn read_file(&self, handle: RawHandle, buf: &mut [u8]) -> NativeResult<usize>;

    fn write_file(&self, handle: RawHandle, buf: &[u8]) -> NativeResult<usize>;

    /// The handle this process currently uses for `stream`. Not owned.
    fn std_handle(&self, stream: StdStream) -> RawHandle;

    /// Name of the account the current process runs as (`GetUserNameW`).
    fn current_account_name(&self) -> NativeResult<String>;
}
