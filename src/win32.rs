//! [`NativeApi`] on top of `windows-sys`.

use core::ffi::c_void;
use core::mem::zeroed;
use core::ptr::{null, null_mut};
use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use windows_sys::core::{PCWSTR, PWSTR};
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, SetHandleInformation, BOOL, ERROR_BROKEN_PIPE,
    ERROR_INSUFFICIENT_BUFFER, FALSE, HANDLE, HANDLE_FLAG_INHERIT, INVALID_HANDLE_VALUE,
    WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::Security::{LogonUserW, SECURITY_ATTRIBUTES};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadFile, WriteFile, FILE_ATTRIBUTE_NORMAL, FILE_GENERIC_READ,
    FILE_GENERIC_WRITE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Console::{
    GetStdHandle, STD_ERROR_HANDLE, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE,
};
use windows_sys::Win32::System::Pipes::CreatePipe;
use windows_sys::Win32::System::Threading::{
    CreateProcessAsUserW, CreateProcessW, CreateProcessWithLogonW, CreateProcessWithTokenW,
    GetExitCodeProcess, ResumeThread, TerminateProcess, WaitForSingleObject, INFINITE,
    PROCESS_INFORMATION, STARTF_USESHOWWINDOW, STARTF_USESTDHANDLES, STARTUPINFOW,
};
use windows_sys::Win32::System::WindowsProgramming::GetUserNameW;

use crate::handle::RawHandle;
use crate::native::{
    CreateCall, NativeApi, NativeResult, ProcessInformation, SecurityAttributes, StdStream,
    WaitStatus,
};
use crate::request::Credential;

/// Maximum user name length (`UNLEN`) plus the terminator.
const USER_NAME_CAPACITY: usize = 257;

/// The real Windows primitives.
#[derive(Debug, Default, Clone, Copy)]
pub struct Win32Api;

impl Win32Api {
    pub fn shared() -> Arc<dyn NativeApi> {
        Arc::new(Win32Api)
    }
}

trait WideString {
    /// Converts to a null-terminated UTF-16 wide string, suitable for Windows APIs.
    fn to_pwstr(&self) -> Vec<u16>;
}

impl WideString for str {
    fn to_pwstr(&self) -> Vec<u16> {
        OsStr::new(self).encode_wide().chain(std::iter::once(0)).collect()
    }
}

impl WideString for Path {
    fn to_pwstr(&self) -> Vec<u16> {
        self.as_os_str().encode_wide().chain(std::iter::once(0)).collect()
    }
}

fn handle(raw: RawHandle) -> HANDLE {
    raw as HANDLE
}

fn raw(handle: HANDLE) -> RawHandle {
    handle as RawHandle
}

fn check(result: BOOL) -> NativeResult<()> {
    if result == FALSE {
        Err(unsafe { GetLastError() })
    } else {
        Ok(())
    }
}

fn security_attributes(attributes: Option<&SecurityAttributes>) -> Option<SECURITY_ATTRIBUTES> {
    attributes.map(|attributes| SECURITY_ATTRIBUTES {
        nLength: size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: attributes.security_descriptor as *mut c_void,
        bInheritHandle: attributes.inherit_handle.into(),
    })
}

fn optional_ptr<T>(value: &Option<T>) -> *const T {
    value.as_ref().map_or(null(), |value| value as *const T)
}

fn optional_pcwstr(value: &Option<Vec<u16>>) -> PCWSTR {
    value.as_ref().map_or(null(), |value| value.as_ptr())
}

/// Owned UTF-16 buffers and structures for one creation call. The pointers
/// inside `startup` refer to `desktop`, so both live as long as this value.
struct Prepared {
    application: Option<Vec<u16>>,
    command_line: Vec<u16>,
    directory: Option<Vec<u16>>,
    process_attributes: Option<SECURITY_ATTRIBUTES>,
    thread_attributes: Option<SECURITY_ATTRIBUTES>,
    #[allow(dead_code)]
    desktop: Option<Vec<u16>>,
    startup: STARTUPINFOW,
    environment: *const c_void,
}

impl Prepared {
    fn new(call: &CreateCall<'_>) -> Self {
        let mut desktop = call.startup.desktop.as_deref().map(str::to_pwstr);
        let mut startup = STARTUPINFOW {
            cb: size_of::<STARTUPINFOW>() as u32,
            ..unsafe { zeroed() }
        };
        if let Some(desktop) = desktop.as_mut() {
            startup.lpDesktop = desktop.as_mut_ptr();
        }
        if let Some(handles) = call.startup.std_handles {
            startup.dwFlags |= STARTF_USESTDHANDLES;
            startup.hStdInput = handle(handles.input);
            startup.hStdOutput = handle(handles.output);
            startup.hStdError = handle(handles.error);
        }
        if let Some(show) = call.startup.show_window {
            startup.dwFlags |= STARTF_USESHOWWINDOW;
            startup.wShowWindow = show;
        }

        Self {
            application: call.application_name.map(str::to_pwstr),
            command_line: call.command_line.to_pwstr(),
            directory: call.current_directory.map(Path::to_pwstr),
            process_attributes: security_attributes(call.process_attributes),
            thread_attributes: security_attributes(call.thread_attributes),
            desktop,
            startup,
            environment: call
                .environment
                .map_or(null(), |block| block.as_ptr().cast::<c_void>()),
        }
    }

    fn command_line(&mut self) -> PWSTR {
        self.command_line.as_mut_ptr()
    }
}

fn information(pi: PROCESS_INFORMATION) -> ProcessInformation {
    ProcessInformation {
        process: raw(pi.hProcess),
        thread: raw(pi.hThread),
        process_id: pi.dwProcessId,
        thread_id: pi.dwThreadId,
    }
}

impl NativeApi for Win32Api {
    fn close_handle(&self, handle_value: RawHandle) -> NativeResult<()> {
        check(unsafe { CloseHandle(handle(handle_value)) })
    }

    fn create_process(&self, call: &CreateCall<'_>) -> NativeResult<ProcessInformation> {
        let mut prepared = Prepared::new(call);
        let mut pi = unsafe { zeroed::<PROCESS_INFORMATION>() };
        check(unsafe {
            CreateProcessW(
                optional_pcwstr(&prepared.application),
                prepared.command_line(),
                optional_ptr(&prepared.process_attributes),
                optional_ptr(&prepared.thread_attributes),
                call.inherit_handles.into(),
                call.creation_flags,
                prepared.environment,
                optional_pcwstr(&prepared.directory),
                &prepared.startup,
                &mut pi,
            )
        })?;
        Ok(information(pi))
    }

    fn create_process_with_logon(
        &self,
        credential: &Credential,
        logon_flags: u32,
        call: &CreateCall<'_>,
    ) -> NativeResult<ProcessInformation> {
        let username = credential.username().to_pwstr();
        let domain = credential.domain().to_pwstr();
        let password = credential.password().to_pwstr();
        let mut prepared = Prepared::new(call);
        let mut pi = unsafe { zeroed::<PROCESS_INFORMATION>() };
        check(unsafe {
            CreateProcessWithLogonW(
                username.as_ptr(),
                domain.as_ptr(),
                password.as_ptr(),
                logon_flags,
                optional_pcwstr(&prepared.application),
                prepared.command_line(),
                call.creation_flags,
                prepared.environment,
                optional_pcwstr(&prepared.directory),
                &prepared.startup,
                &mut pi,
            )
        })?;
        Ok(information(pi))
    }

    fn create_process_with_token(
        &self,
        token: RawHandle,
        logon_flags: u32,
        call: &CreateCall<'_>,
    ) -> NativeResult<ProcessInformation> {
        let mut prepared = Prepared::new(call);
        let mut pi = unsafe { zeroed::<PROCESS_INFORMATION>() };
        check(unsafe {
            CreateProcessWithTokenW(
                handle(token),
                logon_flags,
                optional_pcwstr(&prepared.application),
                prepared.command_line(),
                call.creation_flags,
                prepared.environment,
                optional_pcwstr(&prepared.directory),
                &prepared.startup,
                &mut pi,
            )
        })?;
        Ok(information(pi))
    }

    fn create_process_as_user(
        &self,
        token: RawHandle,
        call: &CreateCall<'_>,
    ) -> NativeResult<ProcessInformation> {
        let mut prepared = Prepared::new(call);
        let mut pi = unsafe { zeroed::<PROCESS_INFORMATION>() };
        check(unsafe {
            CreateProcessAsUserW(
                handle(token),
                optional_pcwstr(&prepared.application),
                prepared.command_line(),
                optional_ptr(&prepared.process_attributes),
                optional_ptr(&prepared.thread_attributes),
                call.inherit_handles.into(),
                call.creation_flags,
                prepared.environment,
                optional_pcwstr(&prepared.directory),
                &prepared.startup,
                &mut pi,
            )
        })?;
        Ok(information(pi))
    }

    fn logon_user(
        &self,
        credential: &Credential,
        logon_type: u32,
        provider: u32,
        token: &mut RawHandle,
    ) -> NativeResult<()> {
        let username = credential.username().to_pwstr();
        let domain = credential.domain().to_pwstr();
        let password = credential.password().to_pwstr();
        let mut h_token: HANDLE = null_mut();
        let result = unsafe {
            LogonUserW(
                username.as_ptr(),
                domain.as_ptr(),
                password.as_ptr(),
                logon_type,
                provider,
                &mut h_token,
            )
        };
        *token = raw(h_token);
        check(result)
    }

    fn resume_thread(&self, thread: RawHandle) -> NativeResult<u32> {
        match unsafe { ResumeThread(handle(thread)) } {
            u32::MAX => Err(unsafe { GetLastError() }),
            previous => Ok(previous),
        }
    }

    fn wait_for_single_object(
        &self,
        handle_value: RawHandle,
        timeout: Option<Duration>,
    ) -> NativeResult<WaitStatus> {
        let millis = timeout.map_or(INFINITE, |timeout| {
            u32::try_from(timeout.as_millis()).unwrap_or(INFINITE - 1)
        });
        match unsafe { WaitForSingleObject(handle(handle_value), millis) } {
            WAIT_OBJECT_0 => Ok(WaitStatus::Signaled),
            WAIT_TIMEOUT => Ok(WaitStatus::TimedOut),
            _ => Err(unsafe { GetLastError() }),
        }
    }

    fn exit_code_process(&self, process: RawHandle) -> NativeResult<u32> {
        let mut code = 0;
        check(unsafe { GetExitCodeProcess(handle(process), &mut code) })?;
        Ok(code)
    }

    fn terminate_process(&self, process: RawHandle, exit_code: u32) -> NativeResult<()> {
        check(unsafe { TerminateProcess(handle(process), exit_code) })
    }

    fn create_pipe(&self) -> NativeResult<(RawHandle, RawHandle)> {
        let mut h_read: HANDLE = null_mut();
        let mut h_write: HANDLE = null_mut();
        check(unsafe { CreatePipe(&mut h_read, &mut h_write, null(), 0) })?;
        Ok((raw(h_read), raw(h_write)))
    }

    fn set_inheritable(&self, handle_value: RawHandle, inheritable: bool) -> NativeResult<()> {
        let flags = if inheritable { HANDLE_FLAG_INHERIT } else { 0 };
        check(unsafe { SetHandleInformation(handle(handle_value), HANDLE_FLAG_INHERIT, flags) })
    }

    fn open_null_device(&self, writable: bool) -> NativeResult<RawHandle> {
        let name = "NUL".to_pwstr();
        let access = if writable { FILE_GENERIC_WRITE } else { FILE_GENERIC_READ };
        let sa = SECURITY_ATTRIBUTES {
            nLength: size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: null_mut(),
            bInheritHandle: 1,
        };
        let h_file = unsafe {
            CreateFileW(
                name.as_ptr(),
                access,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                &sa,
                OPEN_EXISTING,
                FILE_ATTRIBUTE_NORMAL,
                null_mut(),
            )
        };
        if h_file == INVALID_HANDLE_VALUE {
            return Err(unsafe { GetLastError() });
        }
        Ok(raw(h_file))
    }

    fn read_file(&self, handle_value: RawHandle, buf: &mut [u8]) -> NativeResult<usize> {
        let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);
        let mut bytes_read = 0;
        let ok = unsafe {
            ReadFile(
                handle(handle_value),
                buf.as_mut_ptr(),
                len,
                &mut bytes_read,
                null_mut(),
            )
        };
        match check(ok) {
            Ok(()) => Ok(bytes_read as usize),
            // The writer closed its end.
            Err(ERROR_BROKEN_PIPE) => Ok(0),
            Err(code) => Err(code),
        }
    }

    fn write_file(&self, handle_value: RawHandle, buf: &[u8]) -> NativeResult<usize> {
        let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);
        let mut written = 0;
        check(unsafe {
            WriteFile(
                handle(handle_value),
                buf.as_ptr(),
                len,
                &mut written,
                null_mut(),
            )
        })?;
        Ok(written as usize)
    }

    fn std_handle(&self, stream: StdStream) -> RawHandle {
        let which = match stream {
            StdStream::Input => STD_INPUT_HANDLE,
            StdStream::Output => STD_OUTPUT_HANDLE,
            StdStream::Error => STD_ERROR_HANDLE,
        };
        raw(unsafe { GetStdHandle(which) })
    }

    fn current_account_name(&self) -> NativeResult<String> {
        let mut buffer = vec![0u16; USER_NAME_CAPACITY];
        let mut len = buffer.len() as u32;
        if unsafe { GetUserNameW(buffer.as_mut_ptr(), &mut len) } == FALSE {
            let code = unsafe { GetLastError() };
            if code != ERROR_INSUFFICIENT_BUFFER {
                return Err(code);
            }
            buffer.resize(len as usize, 0);
            check(unsafe { GetUserNameW(buffer.as_mut_ptr(), &mut len) })?;
        }

        // `len` counts the terminating null.
        buffer.truncate((len as usize).saturating_sub(1));
        Ok(String::from_utf16_lossy(&buffer))
    }
}
