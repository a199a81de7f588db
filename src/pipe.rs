use std::io;
use std::sync::Arc;
use std::thread;

use crate::error::{LaunchError, Result};
use crate::handle::{HandleKind, NativeHandle, RawHandle};
use crate::native::NativeApi;

/// How one standard stream of the child is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stdio {
    /// Use the corresponding handle of the current process.
    #[default]
    Inherit,
    /// Connect the stream to the `NUL` device.
    Null,
    /// Create an anonymous pipe; the parent keeps the other end.
    Piped,
}

/// Read end of an anonymous pipe.
#[derive(Debug)]
pub struct PipeReader {
    handle: NativeHandle,
    api: Arc<dyn NativeApi>,
}

/// Write end of an anonymous pipe.
#[derive(Debug)]
pub struct PipeWriter {
    handle: NativeHandle,
    api: Arc<dyn NativeApi>,
}

/// Represents a simple wrapper around anonymous pipes on Windows.
pub struct Pipe;

impl Pipe {
    /// Creates an anonymous pipe and returns both ends. Neither end is
    /// inheritable; call [`PipeReader::make_inheritable`] or
    /// [`PipeWriter::make_inheritable`] on the end meant for the child.
    pub fn create(api: &Arc<dyn NativeApi>) -> Result<(PipeReader, PipeWriter)> {
        let (read, write) = api
            .create_pipe()
            .map_err(|code| LaunchError::Native { call: "CreatePipe", code })?;
        Ok((
            PipeReader {
                handle: NativeHandle::owned(api.clone(), read, HandleKind::PipeRead),
                api: api.clone(),
            },
            PipeWriter {
                handle: NativeHandle::owned(api.clone(), write, HandleKind::PipeWrite),
                api: api.clone(),
            },
        ))
    }

    /// Opens the `NUL` device as an inheritable handle.
    pub fn null(api: &Arc<dyn NativeApi>, writable: bool) -> Result<NativeHandle> {
        let raw = api
            .open_null_device(writable)
            .map_err(|code| LaunchError::Native { call: "CreateFileW(NUL)", code })?;
        Ok(NativeHandle::owned(api.clone(), raw, HandleKind::File))
    }
}

fn make_inheritable(api: &Arc<dyn NativeApi>, handle: &NativeHandle) -> Result<()> {
    api.set_inheritable(handle.as_raw()?, true)
        .map_err(|code| LaunchError::Native { call: "SetHandleInformation", code })
}

impl PipeReader {
    pub fn make_inheritable(&self) -> Result<()> {
        make_inheritable(&self.api, &self.handle)
    }

    pub fn as_raw(&self) -> Result<RawHandle> {
        self.handle.as_raw()
    }

    pub fn into_handle(self) -> NativeHandle {
        self.handle
    }

    /// Reads until there's nothing left to read and decodes the bytes lossily.
    pub fn read_to_string_lossy(&mut self) -> Result<String> {
        let mut bytes = Vec::new();
        io::Read::read_to_end(self, &mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl io::Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let raw = self.handle.as_raw().map_err(io::Error::other)?;
        self.api
            .read_file(raw, buf)
            .map_err(|code| io::Error::from_raw_os_error(code as i32))
    }
}

impl PipeWriter {
    pub fn make_inheritable(&self) -> Result<()> {
        make_inheritable(&self.api, &self.handle)
    }

    pub fn as_raw(&self) -> Result<RawHandle> {
        self.handle.as_raw()
    }

    pub fn into_handle(self) -> NativeHandle {
        self.handle
    }
}

impl io::Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let raw = self.handle.as_raw().map_err(io::Error::other)?;
        self.api
            .write_file(raw, buf)
            .map_err(|code| io::Error::from_raw_os_error(code as i32))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reads both streams to completion. stderr is read on its own thread so a
/// child blocked writing one pipe cannot stall the other.
pub(crate) fn drain(stdout: Option<PipeReader>, stderr: Option<PipeReader>) -> Result<(String, String)> {
    thread::scope(|scope| {
        let stderr = scope.spawn(move || match stderr {
            Some(mut reader) => reader.read_to_string_lossy(),
            None => Ok(String::new()),
        });
        let stdout = match stdout {
            Some(mut reader) => reader.read_to_string_lossy(),
            None => Ok(String::new()),
        };
        let stderr = stderr
            .join()
            .unwrap_or_else(|payload| std::panic::resume_unwind(payload));
        Ok((stdout?, stderr?))
    })
}
