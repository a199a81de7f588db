//! An in-memory [`NativeApi`] for unit tests.
//!
//! Handles are plain integers tracked in a set so tests can assert that
//! nothing leaks and nothing is released twice. Creation calls are captured
//! with the exact flags they received; child output, exit codes and resume
//! counts are scripted.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::handle::RawHandle;
use crate::native::*;
use crate::request::Credential;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Primitive {
    CreateProcess,
    WithLogon,
    WithToken,
    AsUser,
}

#[derive(Debug, Clone)]
pub(crate) struct CapturedCall {
    pub primitive: Primitive,
    pub application_name: Option<String>,
    pub command_line: String,
    pub creation_flags: u32,
    pub inherit_handles: bool,
    pub environment: Option<Vec<u16>>,
    pub token: Option<RawHandle>,
    pub logon_flags: Option<u32>,
    pub username: Option<String>,
    pub domain: Option<String>,
    pub startup: StartupInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LogonCall {
    pub username: String,
    pub domain: String,
    pub logon_type: u32,
    pub provider: u32,
}

const STD_INPUT: RawHandle = 0x10;
const STD_OUTPUT: RawHandle = 0x14;
const STD_ERROR: RawHandle = 0x18;

#[derive(Debug)]
struct State {
    next_handle: RawHandle,
    next_pid: u32,
    open: BTreeSet<RawHandle>,
    closes: Vec<RawHandle>,
    double_closes: Vec<RawHandle>,
    inheritable: BTreeSet<RawHandle>,
    creations: Vec<CapturedCall>,
    logons: Vec<LogonCall>,
    create_error: Option<u32>,
    logon_error: Option<(u32, bool)>,
    resume_script: VecDeque<NativeResult<u32>>,
    resume_calls: usize,
    terminations: Vec<(RawHandle, u32)>,
    running: bool,
    exit_before_kill: bool,
    exit_code: u32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    pipes: HashMap<RawHandle, RawHandle>,
    buffers: HashMap<RawHandle, VecDeque<u8>>,
    written: HashMap<RawHandle, Vec<u8>>,
    account_name: String,
}

#[derive(Debug)]
pub(crate) struct FakeApi {
    state: Mutex<State>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                next_handle: 0x100,
                next_pid: 1000,
                open: BTreeSet::new(),
                closes: Vec::new(),
                double_closes: Vec::new(),
                inheritable: BTreeSet::new(),
                creations: Vec::new(),
                logons: Vec::new(),
                create_error: None,
                logon_error: None,
                resume_script: VecDeque::new(),
                resume_calls: 0,
                terminations: Vec::new(),
                running: false,
                exit_before_kill: false,
                exit_code: 0,
                stdout: Vec::new(),
                stderr: Vec::new(),
                pipes: HashMap::new(),
                buffers: HashMap::new(),
                written: HashMap::new(),
                account_name: "alice".to_string(),
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn allocate_handle(&self) -> RawHandle {
        allocate(&mut self.state())
    }

    pub fn script_stdout(&self, output: &str) {
        self.state().stdout = output.as_bytes().to_vec();
    }

    pub fn script_stderr(&self, output: &str) {
        self.state().stderr = output.as_bytes().to_vec();
    }

    pub fn script_exit_code(&self, code: u32) {
        self.state().exit_code = code;
    }

    /// The child keeps running until it is terminated.
    pub fn keep_running(&self) {
        self.state().running = true;
    }

    /// The child looks alive until `TerminateProcess` is called, then turns
    /// out to have exited already and the call is refused.
    pub fn exit_before_kill(&self) {
        let mut state = self.state();
        state.running = true;
        state.exit_before_kill = true;
    }

    pub fn fail_creation(&self, code: u32) {
        self.state().create_error = Some(code);
    }

    /// Makes `LogonUserW` fail, optionally leaving a token value behind.
    pub fn fail_logon(&self, code: u32, leaves_token: bool) {
        self.state().logon_error = Some((code, leaves_token));
    }

    pub fn script_resumes(&self, results: impl IntoIterator<Item = NativeResult<u32>>) {
        self.state().resume_script = results.into_iter().collect();
    }

    pub fn set_account_name(&self, name: &str) {
        self.state().account_name = name.to_string();
    }

    pub fn open_handle_count(&self) -> usize {
        self.state().open.len()
    }

    pub fn close_count(&self, raw: RawHandle) -> usize {
        self.state().closes.iter().filter(|&&h| h == raw).count()
    }

    pub fn closed_handles(&self) -> Vec<RawHandle> {
        self.state().closes.clone()
    }

    pub fn double_closes(&self) -> Vec<RawHandle> {
        self.state().double_closes.clone()
    }

    pub fn is_inheritable(&self, raw: RawHandle) -> bool {
        self.state().inheritable.contains(&raw)
    }

    pub fn creations(&self) -> Vec<CapturedCall> {
        self.state().creations.clone()
    }

    pub fn last_creation(&self) -> CapturedCall {
        self.state()
            .creations
            .last()
            .cloned()
            .expect("no creation call was made")
    }

    pub fn logons(&self) -> Vec<LogonCall> {
        self.state().logons.clone()
    }

    pub fn resume_calls(&self) -> usize {
        self.state().resume_calls
    }

    pub fn terminations(&self) -> Vec<(RawHandle, u32)> {
        self.state().terminations.clone()
    }

    pub fn written_to(&self, raw: RawHandle) -> Vec<u8> {
        self.state().written.get(&raw).cloned().unwrap_or_default()
    }

    fn create(
        &self,
        primitive: Primitive,
        token: Option<RawHandle>,
        logon_flags: Option<u32>,
        credential: Option<&Credential>,
        call: &CreateCall<'_>,
    ) -> NativeResult<ProcessInformation> {
        let mut state = self.state();
        state.creations.push(CapturedCall {
            primitive,
            application_name: call.application_name.map(str::to_string),
            command_line: call.command_line.to_string(),
            creation_flags: call.creation_flags,
            inherit_handles: call.inherit_handles,
            environment: call.environment.map(<[u16]>::to_vec),
            token,
            logon_flags,
            username: credential.map(|c| c.username().to_string()),
            domain: credential.map(|c| c.domain().to_string()),
            startup: call.startup.clone(),
        });
        if let Some(code) = state.create_error {
            return Err(code);
        }

        if let Some(handles) = call.startup.std_handles {
            let stdout = state.stdout.clone();
            let stderr = state.stderr.clone();
            for (writer, bytes) in [(handles.output, stdout), (handles.error, stderr)] {
                if let Some(reader) = state.pipes.get(&writer).copied() {
                    state.buffers.entry(reader).or_default().extend(bytes);
                }
            }
        }

        let process = allocate(&mut state);
        let thread = allocate(&mut state);
        state.next_pid += 4;
        let process_id = state.next_pid;
        Ok(ProcessInformation {
            process,
            thread,
            process_id,
            thread_id: process_id + 1,
        })
    }
}

fn allocate(state: &mut State) -> RawHandle {
    let raw = state.next_handle;
    state.next_handle += 4;
    state.open.insert(raw);
    raw
}

impl NativeApi for FakeApi {
    fn close_handle(&self, handle: RawHandle) -> NativeResult<()> {
        let mut state = self.state();
        if state.open.remove(&handle) {
            state.closes.push(handle);
            Ok(())
        } else {
            state.double_closes.push(handle);
            Err(ERROR_INVALID_HANDLE)
        }
    }

    fn create_process(&self, call: &CreateCall<'_>) -> NativeResult<ProcessInformation> {
        self.create(Primitive::CreateProcess, None, None, None, call)
    }

    fn create_process_with_logon(
        &self,
        credential: &Credential,
        logon_flags: u32,
        call: &CreateCall<'_>,
    ) -> NativeResult<ProcessInformation> {
        self.create(Primitive::WithLogon, None, Some(logon_flags), Some(credential), call)
    }

    fn create_process_with_token(
        &self,
        token: RawHandle,
        logon_flags: u32,
        call: &CreateCall<'_>,
    ) -> NativeResult<ProcessInformation> {
        self.create(Primitive::WithToken, Some(token), Some(logon_flags), None, call)
    }

    fn create_process_as_user(
        &self,
        token: RawHandle,
        call: &CreateCall<'_>,
    ) -> NativeResult<ProcessInformation> {
        self.create(Primitive::AsUser, Some(token), None, None, call)
    }

    fn logon_user(
        &self,
        credential: &Credential,
        logon_type: u32,
        provider: u32,
        token: &mut RawHandle,
    ) -> NativeResult<()> {
        let mut state = self.state();
        state.logons.push(LogonCall {
            username: credential.username().to_string(),
            domain: credential.domain().to_string(),
            logon_type,
            provider,
        });
        let logon_error = state.logon_error;
        match logon_error {
            Some((code, leaves_token)) => {
                if leaves_token {
                    *token = allocate(&mut state);
                }
                Err(code)
            }
            None => {
                *token = allocate(&mut state);
                Ok(())
            }
        }
    }

    fn resume_thread(&self, thread: RawHandle) -> NativeResult<u32> {
        let mut state = self.state();
        if !state.open.contains(&thread) {
            return Err(ERROR_INVALID_HANDLE);
        }
        state.resume_calls += 1;
        state.resume_script.pop_front().unwrap_or(Ok(0))
    }

    fn wait_for_single_object(
        &self,
        handle: RawHandle,
        _timeout: Option<Duration>,
    ) -> NativeResult<WaitStatus> {
        let state = self.state();
        if !state.open.contains(&handle) {
            return Err(ERROR_INVALID_HANDLE);
        }
        if state.running {
            Ok(WaitStatus::TimedOut)
        } else {
            Ok(WaitStatus::Signaled)
        }
    }

    fn exit_code_process(&self, process: RawHandle) -> NativeResult<u32> {
        let state = self.state();
        if !state.open.contains(&process) {
            return Err(ERROR_INVALID_HANDLE);
        }
        if state.running {
            Ok(STILL_ACTIVE)
        } else {
            Ok(state.exit_code)
        }
    }

    fn terminate_process(&self, process: RawHandle, exit_code: u32) -> NativeResult<()> {
        let mut state = self.state();
        if !state.open.contains(&process) {
            return Err(ERROR_INVALID_HANDLE);
        }
        if state.exit_before_kill {
            state.exit_before_kill = false;
            state.running = false;
            return Err(ERROR_ACCESS_DENIED);
        }
        // Windows refuses to terminate a process that has already exited.
        if !state.running {
            return Err(ERROR_ACCESS_DENIED);
        }
        state.terminations.push((process, exit_code));
        state.running = false;
        state.exit_code = exit_code;
        Ok(())
    }

    fn create_pipe(&self) -> NativeResult<(RawHandle, RawHandle)> {
        let mut state = self.state();
        let read = allocate(&mut state);
        let write = allocate(&mut state);
        state.pipes.insert(write, read);
        state.buffers.insert(read, VecDeque::new());
        Ok((read, write))
    }

    fn set_inheritable(&self, handle: RawHandle, inheritable: bool) -> NativeResult<()> {
        let mut state = self.state();
        if !state.open.contains(&handle) {
            return Err(ERROR_INVALID_HANDLE);
        }
        if inheritable {
            state.inheritable.insert(handle);
        } else {
            state.inheritable.remove(&handle);
        }
        Ok(())
    }

    fn open_null_device(&self, _writable: bool) -> NativeResult<RawHandle> {
        let mut state = self.state();
        let raw = allocate(&mut state);
        state.inheritable.insert(raw);
        Ok(raw)
    }

    fn read_file(&self, handle: RawHandle, buf: &mut [u8]) -> NativeResult<usize> {
        let mut state = self.state();
        if !state.open.contains(&handle) {
            return Err(ERROR_INVALID_HANDLE);
        }
        let Some(buffer) = state.buffers.get_mut(&handle) else {
            return Ok(0);
        };
        let n = buf.len().min(buffer.len());
        for (slot, byte) in buf.iter_mut().zip(buffer.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_file(&self, handle: RawHandle, buf: &[u8]) -> NativeResult<usize> {
        let mut state = self.state();
        if !state.open.contains(&handle) {
            return Err(ERROR_INVALID_HANDLE);
        }
        state.written.entry(handle).or_default().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn std_handle(&self, stream: StdStream) -> RawHandle {
        match stream {
            StdStream::Input => STD_INPUT,
            StdStream::Output => STD_OUTPUT,
            StdStream::Error => STD_ERROR,
        }
    }

    fn current_account_name(&self) -> NativeResult<String> {
        Ok(self.state().account_name.clone())
    }
}
