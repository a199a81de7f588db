#![doc = include_str!("../README.md")]

mod cmdline;
mod command;
mod config;
mod dispatch;
mod error;
mod flags;
mod handle;
mod native;
mod pipe;
mod process;
mod record;
mod request;
mod runas;

#[cfg(test)]
mod testing;

#[cfg(windows)]
mod win32;

pub use cmdline::{join_args, quote_arg};
pub use command::{CommandOutput, CommandRunner};
pub use config::{LauncherConfig, DEFAULT_INTERPRETER, DEFAULT_MAX_RESUME_ATTEMPTS};
pub use dispatch::ProcessCreationDispatcher;
pub use error::{LaunchError, Result};
pub use flags::{effective_flags, CreationFlags, EffectiveFlags};
pub use handle::{is_invalid, HandleKind, HandleState, NativeHandle, RawHandle, INVALID_HANDLE_VALUE};
pub use native::*;
pub use pipe::{Pipe, PipeReader, PipeWriter, Stdio};
pub use process::{LaunchedProcess, Launcher, StdioConfig};
pub use record::ProcessRecord;
pub use request::{
    current_environment, environment_block, shell_command_line, Account, CreationMode,
    CreationRequest, Credential, ModeKind,
};
pub use runas::{CapturedProcess, ExecutionContext, Options, Runas};

#[cfg(windows)]
pub use win32::Win32Api;
